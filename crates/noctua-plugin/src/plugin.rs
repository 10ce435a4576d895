//! The plugin object: descriptor, lifecycle and capability adapters.
//!
//! A [`Plugin`] is created from a dynamic library (or a pre-built vtable),
//! carries the immutable [`PluginDescriptor`] extracted at load time, and
//! owns everything scoped to the plugin: the library handle, the state
//! handle returned by `init`, and every table descriptor exchanged across
//! the boundary. Destroying the plugin releases all of them.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::path::Path;
use std::sync::Arc;

use bitflags::bitflags;
use parking_lot::Mutex;
use semver::Version;

use crate::abi::{
    EventParseInput, FieldExtractInput, InitInput, PluginApi, RawEvent, RawEventInput, RawOwner,
    RawPluginState, RawRc, RawTable, RawTableInfo, Rc, CAP_EXTRACTION_BIT, CAP_PARSING_BIT,
    CAP_SOURCING_BIT, RC_FAILURE, SCHEMA_JSON, SCHEMA_NONE,
};
use crate::error::{PluginError, Result};
use crate::event::{
    EventCodeSet, EventInput, SourceCompatCache, NO_SOURCE_IDX, PLUGIN_EVENT_CODE,
    SYSCALL_EVENT_SOURCE,
};
use crate::fields::{FieldArg, FieldCatalog, FieldDescriptor, FieldFlags, FieldType};
use crate::loader::{LibraryRegistry, PluginLibrary};
use crate::schema;
use crate::state::bridge::{self, PluginTable, TableHandle};
use crate::state::registry::TableRegistry;
use crate::state::{StateType, Table};
use crate::version;

bitflags! {
    /// Capabilities a plugin may declare
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Capabilities: u32 {
        const SOURCING = CAP_SOURCING_BIT;
        const EXTRACTION = CAP_EXTRACTION_BIT;
        const PARSING = CAP_PARSING_BIT;
    }
}

/// Immutable plugin metadata extracted at load time
#[derive(Debug, Clone)]
pub struct PluginDescriptor {
    pub name: String,
    pub description: String,
    pub contact: String,
    pub version: Version,
    pub required_api_version: Version,
    pub capabilities: Capabilities,
}

struct SourcingCaps {
    id: u32,
    event_source: String,
}

struct ExtractionCaps {
    fields: FieldCatalog,
    sources: HashSet<String>,
    codes: EventCodeSet,
}

struct ParsingCaps {
    sources: HashSet<String>,
    codes: EventCodeSet,
}

struct Lifecycle {
    inited: bool,
    state: *mut RawPluginState,
}

#[derive(Default)]
struct TableInfoCache {
    names: Vec<CString>,
    infos: Vec<RawTableInfo>,
}

/// One value produced by field extraction, already normalized into the
/// filter engine's byte representation (see the type mapping contract).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedValue {
    bytes: Vec<u8>,
}

impl ExtractedValue {
    fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_u64(&self) -> Option<u64> {
        self.bytes.as_slice().try_into().map(u64::from_le_bytes).ok()
    }

    pub fn as_u32(&self) -> Option<u32> {
        self.bytes.as_slice().try_into().map(u32::from_le_bytes).ok()
    }

    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.bytes).ok()
    }
}

/// One field to extract from an event, plus the values the plugin produced
#[derive(Debug, Clone)]
pub struct ExtractRequest {
    pub field_id: usize,
    pub arg: FieldArg,
    pub values: Vec<ExtractedValue>,
}

impl ExtractRequest {
    pub fn new(field_id: usize, arg: FieldArg) -> Self {
        Self {
            field_id,
            arg,
            values: Vec::new(),
        }
    }
}

/// Copy a string off the ABI; null becomes the empty string
pub(crate) unsafe fn str_from_ptr(ptr: *const c_char) -> String {
    if ptr.is_null() {
        String::new()
    } else {
        CStr::from_ptr(ptr).to_string_lossy().into_owned()
    }
}

/// A loaded plugin.
///
/// Shared through `Arc`: capability adapters and filter checks keep the
/// plugin alive for as long as they exist. The object is not `Sync`; all
/// plugin calls are expected from one dispatcher thread at a time, while
/// the process-wide registries carry their own locks.
pub struct Plugin {
    descriptor: PluginDescriptor,
    library: PluginLibrary,
    table_registry: Arc<TableRegistry>,

    lifecycle: Mutex<Lifecycle>,
    // error text exposed to plugins through the owner last-error callback
    owner_error: Mutex<Option<CString>>,

    sourcing: Option<SourcingCaps>,
    extraction: Option<ExtractionCaps>,
    parsing: Option<ParsingCaps>,

    // table descriptors scoped to this plugin, dropped at destroy
    accessed_tables: Mutex<HashMap<String, Box<TableHandle>>>,
    owned_tables: Mutex<Vec<Arc<PluginTable>>>,
    table_info_cache: Mutex<TableInfoCache>,
}

impl Plugin {
    /// Create a plugin from the dynamic library at `path`
    pub fn create(
        path: impl AsRef<Path>,
        libraries: Arc<LibraryRegistry>,
        tables: Arc<TableRegistry>,
    ) -> Result<Arc<Plugin>> {
        let library = PluginLibrary::load(path, libraries)?;
        Self::from_library(library, tables)
    }

    /// Create a plugin from a pre-built in-process vtable
    pub fn create_from_api(api: PluginApi, tables: Arc<TableRegistry>) -> Result<Arc<Plugin>> {
        let library = PluginLibrary::from_api(api)?;
        Self::from_library(library, tables)
    }

    /// Whether sources in `set` accept events of the named source; an empty
    /// set accepts every source.
    pub fn is_source_compatible(set: &HashSet<String>, source: &str) -> bool {
        set.is_empty() || set.contains(source)
    }

    fn from_library(library: PluginLibrary, tables: Arc<TableRegistry>) -> Result<Arc<Plugin>> {
        let api = library.api;

        // check the required API version before touching anything else
        let required_api_version = {
            let raw = unsafe { (api.get_required_api_version.expect("required symbol"))() };
            let s = unsafe { str_from_ptr(raw) };
            version::parse_version("required API version", &s)?
        };
        version::check_required_version(&required_api_version)?;

        let name = unsafe { str_from_ptr((api.get_name.expect("required symbol"))()) };
        if name.is_empty() {
            return Err(PluginError::load("plugin did not provide a name"));
        }
        let description =
            unsafe { str_from_ptr((api.get_description.expect("required symbol"))()) };
        let contact = unsafe { str_from_ptr((api.get_contact.expect("required symbol"))()) };
        let version = {
            let s = unsafe { str_from_ptr((api.get_version.expect("required symbol"))()) };
            version::parse_version("version", &s)
                .map_err(|e| PluginError::load(format!("plugin '{name}': {e}")))?
        };

        let caps_bits = unsafe { (api.get_capabilities.expect("required symbol"))() };
        let capabilities = Capabilities::from_bits_truncate(caps_bits);
        if capabilities.is_empty() {
            return Err(PluginError::load(format!(
                "plugin '{name}' does not declare any capability"
            )));
        }

        let descriptor = PluginDescriptor {
            name,
            description,
            contact,
            version,
            required_api_version,
            capabilities,
        };

        let sourcing = if capabilities.contains(Capabilities::SOURCING) {
            Some(Self::resolve_sourcing(&descriptor, &api)?)
        } else {
            None
        };
        let extraction = if capabilities.contains(Capabilities::EXTRACTION) {
            Some(Self::resolve_extraction(&descriptor, &api, sourcing.as_ref())?)
        } else {
            None
        };
        let parsing = if capabilities.contains(Capabilities::PARSING) {
            Some(Self::resolve_parsing(&descriptor, &api, sourcing.as_ref())?)
        } else {
            None
        };

        tracing::info!(
            plugin = %descriptor.name,
            version = %descriptor.version,
            capabilities = ?descriptor.capabilities,
            "plugin loaded"
        );

        Ok(Arc::new(Plugin {
            descriptor,
            library,
            table_registry: tables,
            lifecycle: Mutex::new(Lifecycle {
                inited: false,
                state: std::ptr::null_mut(),
            }),
            owner_error: Mutex::new(None),
            sourcing,
            extraction,
            parsing,
            accessed_tables: Mutex::new(HashMap::new()),
            owned_tables: Mutex::new(Vec::new()),
            table_info_cache: Mutex::new(TableInfoCache::default()),
        }))
    }

    fn require_symbol<T>(descriptor: &PluginDescriptor, sym: &Option<T>, name: &str) -> Result<()> {
        if sym.is_none() {
            return Err(PluginError::load(format!(
                "plugin '{}': symbol {name} is required by a declared capability but not exported",
                descriptor.name
            )));
        }
        Ok(())
    }

    fn resolve_sourcing(descriptor: &PluginDescriptor, api: &PluginApi) -> Result<SourcingCaps> {
        Self::require_symbol(descriptor, &api.get_id, PluginApi::SYM_GET_ID)?;
        Self::require_symbol(
            descriptor,
            &api.get_event_source,
            PluginApi::SYM_GET_EVENT_SOURCE,
        )?;
        Self::require_symbol(descriptor, &api.open, PluginApi::SYM_OPEN)?;
        Self::require_symbol(descriptor, &api.close, PluginApi::SYM_CLOSE)?;
        Self::require_symbol(descriptor, &api.next_batch, PluginApi::SYM_NEXT_BATCH)?;

        let id = unsafe { (api.get_id.expect("just checked"))() };
        // id 0 means a generic source with no name of its own
        let event_source = if id != 0 {
            unsafe { str_from_ptr((api.get_event_source.expect("just checked"))()) }
        } else {
            String::new()
        };
        Ok(SourcingCaps { id, event_source })
    }

    fn resolve_extraction(
        descriptor: &PluginDescriptor,
        api: &PluginApi,
        sourcing: Option<&SourcingCaps>,
    ) -> Result<ExtractionCaps> {
        Self::require_symbol(descriptor, &api.get_fields, PluginApi::SYM_GET_FIELDS)?;
        Self::require_symbol(descriptor, &api.extract_fields, PluginApi::SYM_EXTRACT_FIELDS)?;

        let raw = unsafe { (api.get_fields.expect("just checked"))() };
        if raw.is_null() {
            return Err(PluginError::descriptor(format!(
                "plugin '{}': get_fields returned a null string",
                descriptor.name
            )));
        }
        let json = unsafe { str_from_ptr(raw) };
        let fields = FieldCatalog::parse(&descriptor.name, &json)?;

        let (sources, codes) = Self::resolve_sources_codes(
            descriptor,
            PluginApi::SYM_GET_EXTRACT_EVENT_SOURCES,
            &api.get_extract_event_sources,
            &api.get_extract_event_types,
            sourcing,
        )?;
        Ok(ExtractionCaps {
            fields,
            sources,
            codes,
        })
    }

    fn resolve_parsing(
        descriptor: &PluginDescriptor,
        api: &PluginApi,
        sourcing: Option<&SourcingCaps>,
    ) -> Result<ParsingCaps> {
        Self::require_symbol(descriptor, &api.parse_event, PluginApi::SYM_PARSE_EVENT)?;
        let (sources, codes) = Self::resolve_sources_codes(
            descriptor,
            PluginApi::SYM_GET_PARSE_EVENT_SOURCES,
            &api.get_parse_event_sources,
            &api.get_parse_event_types,
            sourcing,
        )?;
        Ok(ParsingCaps { sources, codes })
    }

    // shared between the extraction and parsing capabilities
    fn resolve_sources_codes(
        descriptor: &PluginDescriptor,
        sources_symbol: &str,
        get_sources: &Option<unsafe extern "C" fn() -> *const c_char>,
        get_codes: &Option<unsafe extern "C" fn(*mut u32) -> *const u16>,
        sourcing: Option<&SourcingCaps>,
    ) -> Result<(HashSet<String>, EventCodeSet)> {
        let mut sources = HashSet::new();
        if let Some(get_sources) = get_sources {
            let json = unsafe { str_from_ptr(get_sources()) };
            if !json.is_empty() {
                let declared: Vec<String> = serde_json::from_str(&json).map_err(|_| {
                    PluginError::descriptor(format!(
                        "plugin '{}': {sources_symbol} did not return a JSON array of strings",
                        descriptor.name
                    ))
                })?;
                sources.extend(declared.into_iter().filter(|s| !s.is_empty()));
            }
        }
        // a sourcing plugin with a named source always handles its own events
        if let Some(sourcing) = sourcing {
            if !sourcing.event_source.is_empty() {
                sources.insert(sourcing.event_source.clone());
            }
        }

        let mut codes = BTreeSet::new();
        if let Some(get_codes) = get_codes {
            let mut ntypes: u32 = 0;
            let types = unsafe { get_codes(&mut ntypes) };
            if !types.is_null() {
                for i in 0..ntypes as usize {
                    codes.insert(unsafe { *types.add(i) });
                }
            }
        }
        let codes = if codes.is_empty() {
            if Self::is_source_compatible(&sources, SYSCALL_EVENT_SOURCE) {
                EventCodeSet::All
            } else {
                EventCodeSet::from_codes([PLUGIN_EVENT_CODE])
            }
        } else {
            EventCodeSet::Codes(codes)
        };
        Ok((sources, codes))
    }

    // ------------------------------------------------------------------
    // descriptor access

    pub fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn capabilities(&self) -> Capabilities {
        self.descriptor.capabilities
    }

    /// Numeric source id; 0 for generic sourcing plugins
    pub fn id(&self) -> Result<u32> {
        Ok(self.sourcing_caps()?.id)
    }

    /// Name of the plugin's own event source; empty for generic plugins
    pub fn event_source(&self) -> Result<&str> {
        Ok(&self.sourcing_caps()?.event_source)
    }

    /// The field catalog exported by an extraction-capable plugin
    pub fn fields(&self) -> Result<&FieldCatalog> {
        Ok(&self.extraction_caps()?.fields)
    }

    pub fn extract_event_sources(&self) -> Result<&HashSet<String>> {
        Ok(&self.extraction_caps()?.sources)
    }

    pub fn extract_event_codes(&self) -> Result<&EventCodeSet> {
        Ok(&self.extraction_caps()?.codes)
    }

    pub fn parse_event_sources(&self) -> Result<&HashSet<String>> {
        Ok(&self.parsing_caps()?.sources)
    }

    pub fn parse_event_codes(&self) -> Result<&EventCodeSet> {
        Ok(&self.parsing_caps()?.codes)
    }

    fn sourcing_caps(&self) -> Result<&SourcingCaps> {
        self.sourcing.as_ref().ok_or_else(|| {
            PluginError::compatibility(format!(
                "plugin '{}' does not declare the sourcing capability",
                self.name()
            ))
        })
    }

    fn extraction_caps(&self) -> Result<&ExtractionCaps> {
        self.extraction.as_ref().ok_or_else(|| {
            PluginError::compatibility(format!(
                "plugin '{}' does not declare the extraction capability",
                self.name()
            ))
        })
    }

    fn parsing_caps(&self) -> Result<&ParsingCaps> {
        self.parsing.as_ref().ok_or_else(|| {
            PluginError::compatibility(format!(
                "plugin '{}' does not declare the parsing capability",
                self.name()
            ))
        })
    }

    // ------------------------------------------------------------------
    // lifecycle

    /// The JSON init schema, when the plugin publishes one
    pub fn init_schema(&self) -> Result<Option<String>> {
        let Some(get_schema) = self.library.api.get_init_schema else {
            return Ok(None);
        };
        let mut schema_type: u32 = SCHEMA_NONE;
        let schema = unsafe { str_from_ptr(get_schema(&mut schema_type)) };
        if schema.is_empty() || schema_type == SCHEMA_NONE {
            return Ok(None);
        }
        if schema_type != SCHEMA_JSON {
            return Err(PluginError::schema(format!(
                "plugin '{}': get_init_schema returned an unknown schema type {schema_type}",
                self.name()
            )));
        }
        Ok(Some(schema))
    }

    /// Initialize the plugin with the given configuration string.
    ///
    /// Must be called once before any capability operation; a failed
    /// attempt also consumes the single permitted call. The config is
    /// validated against the plugin's init schema when one is published.
    /// On plugin failure the state handle, if any, is kept only long enough
    /// to read the plugin's error and is then released.
    pub fn init(&self, config: &str) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.inited {
            return Err(PluginError::state(format!(
                "plugin '{}' has been initialized twice",
                self.name()
            )));
        }

        let config = match self.init_schema()? {
            Some(schema) => schema::validate_init_config(self.name(), &schema, config)?,
            None => config.to_string(),
        };
        let config = CString::new(config).map_err(|_| {
            PluginError::init(format!(
                "plugin '{}': init config contains a NUL byte",
                self.name()
            ))
        })?;

        let tables = bridge::tables_input();
        let wants_tables = self
            .descriptor
            .capabilities
            .intersects(Capabilities::EXTRACTION | Capabilities::PARSING);
        let input = InitInput {
            owner: self as *const Plugin as *mut RawOwner,
            get_owner_last_error: Some(bridge::owner_last_error),
            tables: if wants_tables {
                &tables as *const crate::abi::TablesInput
            } else {
                std::ptr::null()
            },
            config: config.as_ptr(),
        };

        let init = self.library.api.init.expect("checked at load");
        let mut rc: RawRc = RC_FAILURE;
        let state = unsafe { init(&input, &mut rc) };
        // once the plugin's init ran, the attempt is spent regardless of rc
        lifecycle.inited = true;
        if Rc::from(rc) != Rc::Success {
            // plugins may return a state even on failure, exactly so an
            // error can be retrieved from it
            let message = if state.is_null() {
                "no error reported".to_string()
            } else {
                let message = unsafe { self.error_from_state(state) };
                let destroy = self.library.api.destroy.expect("checked at load");
                unsafe { destroy(state) };
                message
            };
            // the plugin may have acquired or published tables before
            // failing; those descriptors die with the failed attempt
            self.release_tables();
            tracing::warn!(plugin = %self.name(), error = %message, "plugin init failed");
            return Err(PluginError::init(format!(
                "plugin '{}' could not be initialized: {message}",
                self.name()
            )));
        }

        lifecycle.state = state;
        tracing::info!(plugin = %self.name(), "plugin initialized");
        Ok(())
    }

    /// Destroy the plugin state and release every table descriptor scoped
    /// to it. Idempotent.
    pub fn destroy(&self) {
        {
            let mut lifecycle = self.lifecycle.lock();
            if !lifecycle.inited && lifecycle.state.is_null() {
                return;
            }
            lifecycle.inited = false;
            if !lifecycle.state.is_null() {
                let destroy = self.library.api.destroy.expect("checked at load");
                unsafe { destroy(lifecycle.state) };
                lifecycle.state = std::ptr::null_mut();
            }
        }
        self.release_tables();
        tracing::info!(plugin = %self.name(), "plugin destroyed");
    }

    // descriptors into host tables die with the plugin; tables the plugin
    // published become unreachable
    fn release_tables(&self) {
        self.accessed_tables.lock().clear();
        for table in self.owned_tables.lock().drain(..) {
            table.invalidate();
            self.table_registry.remove_table(table.name());
        }
    }

    /// The plugin's own last-error text
    pub fn get_last_error(&self) -> Result<String> {
        let lifecycle = self.lifecycle.lock();
        if !lifecycle.inited {
            return Err(self.not_inited());
        }
        if lifecycle.state.is_null() {
            return Ok("plugin state not available".to_string());
        }
        Ok(unsafe { self.error_from_state(lifecycle.state) })
    }

    unsafe fn error_from_state(&self, state: *mut RawPluginState) -> String {
        let get_last_error = self.library.api.get_last_error.expect("checked at load");
        str_from_ptr(get_last_error(state))
    }

    fn not_inited(&self) -> PluginError {
        PluginError::state(format!(
            "plugin '{}': capability used before init",
            self.name()
        ))
    }

    pub(crate) fn checked_state(&self) -> Result<*mut RawPluginState> {
        let lifecycle = self.lifecycle.lock();
        if !lifecycle.inited {
            return Err(self.not_inited());
        }
        Ok(lifecycle.state)
    }

    pub(crate) fn api(&self) -> &PluginApi {
        &self.library.api
    }

    pub(crate) fn raw_event_input<'a>(
        event: &'a EventInput,
        source_name: &'a Option<CString>,
    ) -> RawEventInput {
        RawEventInput {
            evt: event.data().as_ptr() as *const RawEvent,
            evtnum: event.num,
            source_idx: event.source_idx.unwrap_or(NO_SOURCE_IDX),
            source_name: source_name
                .as_ref()
                .map_or(std::ptr::null(), |s| s.as_ptr()),
        }
    }

    pub(crate) fn source_name_cstring(event: &EventInput) -> Option<CString> {
        event
            .source_name
            .as_ref()
            .and_then(|s| CString::new(s.as_str()).ok())
    }

    // ------------------------------------------------------------------
    // field extraction

    /// Drive the plugin's extractor for the given requests.
    ///
    /// Returns `false` when the plugin reports failure; per-event source or
    /// code incompatibility is the caller's concern (see
    /// [`crate::filtercheck::FieldCheck`]).
    pub fn extract_fields(
        &self,
        event: &EventInput,
        requests: &mut [ExtractRequest],
    ) -> Result<bool> {
        let state = self.checked_state()?;
        let caps = self.extraction_caps()?;

        let mut names = Vec::with_capacity(requests.len());
        let mut keys: Vec<Option<CString>> = Vec::with_capacity(requests.len());
        for request in requests.iter() {
            let field = caps.fields.get(request.field_id).ok_or_else(|| {
                PluginError::argument(format!(
                    "plugin '{}': unknown field id {}",
                    self.name(),
                    request.field_id
                ))
            })?;
            names.push(CString::new(field.name.as_str()).unwrap_or_default());
            keys.push(match &request.arg {
                FieldArg::Key(key) | FieldArg::Both(_, key) => {
                    Some(CString::new(key.as_str()).map_err(|_| {
                        PluginError::argument(format!(
                            "plugin '{}': field argument contains a NUL byte",
                            self.name()
                        ))
                    })?)
                }
                _ => None,
            });
        }

        let mut raw_fields: Vec<crate::abi::RawExtractField> = requests
            .iter()
            .enumerate()
            .map(|(i, request)| {
                let field = caps.fields.get(request.field_id).expect("validated above");
                crate::abi::RawExtractField {
                    res: crate::abi::ExtractResult {
                        u64: std::ptr::null(),
                    },
                    res_len: 0,
                    field_id: request.field_id as u32,
                    field: names[i].as_ptr(),
                    arg_key: keys[i].as_ref().map_or(std::ptr::null(), |k| k.as_ptr()),
                    arg_index: match request.arg {
                        FieldArg::Index(index) | FieldArg::Both(index, _) => index,
                        _ => 0,
                    },
                    arg_present: u32::from(request.arg != FieldArg::None),
                    ftype: field.field_type.raw(),
                    flist: u32::from(field.has_flag(FieldFlags::IS_LIST)),
                }
            })
            .collect();

        let source_name = Self::source_name_cstring(event);
        let raw_event = Self::raw_event_input(event, &source_name);
        let input = FieldExtractInput {
            owner: self as *const Plugin as *mut RawOwner,
            get_owner_last_error: Some(bridge::owner_last_error),
            num_fields: raw_fields.len() as u32,
            fields: raw_fields.as_mut_ptr(),
            table_reader: bridge::reader_vtable(),
        };

        let extract = self
            .library
            .api
            .extract_fields
            .expect("checked at capability resolution");
        let rc = unsafe { extract(state, &raw_event, &input) };
        if Rc::from(rc) != Rc::Success {
            return Ok(false);
        }

        for (request, raw) in requests.iter_mut().zip(raw_fields.iter()) {
            let field = caps.fields.get(request.field_id).expect("validated above");
            request.values = unsafe { translate_results(self.name(), field, raw)? };
        }
        Ok(true)
    }

    // ------------------------------------------------------------------
    // event parsing

    /// Drive the plugin's event parser, giving it read and write access to
    /// the shared state tables. Returns the plugin's verdict; source/code
    /// compatibility filtering is the caller's concern (see [`EventParser`]).
    pub fn parse_event(&self, event: &EventInput) -> Result<bool> {
        let state = self.checked_state()?;
        self.parsing_caps()?;

        let source_name = Self::source_name_cstring(event);
        let raw_event = Self::raw_event_input(event, &source_name);
        let input = EventParseInput {
            owner: self as *const Plugin as *mut RawOwner,
            get_owner_last_error: Some(bridge::owner_last_error),
            table_reader: bridge::reader_vtable(),
            table_writer: bridge::writer_vtable(),
        };
        let parse = self
            .library
            .api
            .parse_event
            .expect("checked at capability resolution");
        let rc = unsafe { parse(state, &raw_event, &input) };
        Ok(Rc::from(rc) == Rc::Success)
    }

    // ------------------------------------------------------------------
    // table bookkeeping for the bridge

    pub(crate) fn set_owner_error(&self, msg: impl Into<String>) {
        let msg = msg.into();
        tracing::debug!(plugin = %self.name(), error = %msg, "table operation error");
        *self.owner_error.lock() = CString::new(msg).ok();
    }

    pub(crate) fn owner_error_ptr(&self) -> *const c_char {
        self.owner_error
            .lock()
            .as_ref()
            .map_or(std::ptr::null(), |s| s.as_ptr())
    }

    /// Refresh and expose the table listing for the tables-input vtable
    pub(crate) fn table_listing(&self, ntables: &mut u32) -> *const RawTableInfo {
        let listing = self.table_registry.list_tables();
        let mut cache = self.table_info_cache.lock();
        cache.names.clear();
        cache.infos.clear();
        for info in &listing {
            let name = CString::new(info.name.as_str()).unwrap_or_default();
            cache.infos.push(RawTableInfo {
                name: name.as_ptr(),
                key_type: info.key_type.raw(),
            });
            cache.names.push(name);
        }
        *ntables = cache.infos.len() as u32;
        cache.infos.as_ptr()
    }

    /// Resolve a registry table into a handle this plugin can use; at most
    /// one live descriptor per table name.
    pub(crate) fn access_table(&self, name: &str, key_type: StateType) -> Result<*mut RawTable> {
        let mut accessed = self.accessed_tables.lock();
        if let Some(handle) = accessed.get(name) {
            if handle.table().key_type() != key_type {
                return Err(PluginError::compatibility(format!(
                    "table '{name}' has key type {}, not {}",
                    handle.table().key_type().name(),
                    key_type.name()
                )));
            }
            return Ok(handle.as_raw());
        }
        let table = self.table_registry.get_table(name, key_type)?;
        let handle = TableHandle::new(table, self as *const Plugin);
        let raw = handle.as_raw();
        accessed.insert(name.to_string(), handle);
        Ok(raw)
    }

    /// Register a table published by this plugin; it stays owned by the
    /// plugin and is retired at destroy.
    pub(crate) fn publish_table(&self, table: PluginTable) -> Result<()> {
        let table = Arc::new(table);
        self.table_registry
            .add_table(Arc::clone(&table) as Arc<dyn Table>)?;
        tracing::info!(plugin = %self.name(), table = %table.name(), "plugin published table");
        self.owned_tables.lock().push(table);
        Ok(())
    }
}

impl Drop for Plugin {
    fn drop(&mut self) {
        self.destroy();
    }
}

unsafe fn translate_results(
    plugin_name: &str,
    field: &FieldDescriptor,
    raw: &crate::abi::RawExtractField,
) -> Result<Vec<ExtractedValue>> {
    let count = raw.res_len as usize;
    if count == 0 {
        return Ok(Vec::new());
    }
    let mut values = Vec::with_capacity(count);
    match field.field_type {
        FieldType::Uint64 | FieldType::RelTime | FieldType::AbsTime => {
            let ptr = raw.res.u64;
            check_result_ptr(plugin_name, field, ptr.is_null())?;
            for i in 0..count {
                let v = ptr.add(i).read_unaligned();
                values.push(ExtractedValue::new(v.to_le_bytes().to_vec()));
            }
        }
        FieldType::Bool | FieldType::Ipv4Addr => {
            let ptr = raw.res.u32;
            check_result_ptr(plugin_name, field, ptr.is_null())?;
            for i in 0..count {
                let v = ptr.add(i).read_unaligned();
                values.push(ExtractedValue::new(v.to_le_bytes().to_vec()));
            }
        }
        FieldType::String => {
            let ptr = raw.res.str;
            check_result_ptr(plugin_name, field, ptr.is_null())?;
            for i in 0..count {
                let s = ptr.add(i).read_unaligned();
                check_result_ptr(plugin_name, field, s.is_null())?;
                values.push(ExtractedValue::new(CStr::from_ptr(s).to_bytes().to_vec()));
            }
        }
        FieldType::Ipv4Net | FieldType::Ipv6Addr | FieldType::Ipv6Net | FieldType::IpNet => {
            let ptr = raw.res.buf;
            check_result_ptr(plugin_name, field, ptr.is_null())?;
            for i in 0..count {
                let buf = ptr.add(i).read_unaligned();
                check_result_ptr(plugin_name, field, buf.ptr.is_null())?;
                let bytes = std::slice::from_raw_parts(buf.ptr, buf.len as usize).to_vec();
                values.push(ExtractedValue::new(bytes));
            }
        }
    }
    Ok(values)
}

fn check_result_ptr(plugin_name: &str, field: &FieldDescriptor, is_null: bool) -> Result<()> {
    if is_null {
        return Err(PluginError::runtime(format!(
            "plugin '{plugin_name}': extraction of field '{}' reported values but returned a null buffer",
            field.name
        )));
    }
    Ok(())
}

/// Parsing adapter: filters events by the plugin's parse sources and codes
/// before handing them to [`Plugin::parse_event`].
pub struct EventParser {
    plugin: Arc<Plugin>,
    compat: SourceCompatCache,
}

impl EventParser {
    /// Fails unless the plugin declares the parsing capability
    pub fn new(plugin: Arc<Plugin>) -> Result<Self> {
        plugin.parsing_caps()?;
        Ok(Self {
            plugin,
            compat: SourceCompatCache::new(),
        })
    }

    pub fn plugin(&self) -> &Arc<Plugin> {
        &self.plugin
    }

    /// Parse one event. Returns `Ok(false)` without calling the plugin when
    /// the event's source or type code is not compatible; this is the
    /// silent-rejection hot path, not an error.
    pub fn parse(&self, event: &EventInput) -> Result<bool> {
        let caps = self.plugin.parsing_caps()?;
        if !caps.codes.contains(event.code) {
            return Ok(false);
        }
        if !self.compat.check(&caps.sources, event) {
            return Ok(false);
        }
        self.plugin.parse_event(event)
    }
}
