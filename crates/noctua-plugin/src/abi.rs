//! Plugin ABI (Application Binary Interface) definitions.
//!
//! The C-callable surface shared between the host and loaded plugins:
//! exported symbol names, result codes, `#[repr(C)]` structs and the
//! function-pointer vtables. This module holds declarations only; the safe
//! wrappers live in [`crate::loader`], [`crate::plugin`] and
//! [`crate::state::bridge`], and nothing outside those modules touches a raw
//! pointer.

use std::os::raw::{c_char, c_void};

/// Plugin API version published by this host.
///
/// A plugin is accepted when its required version has the same major number
/// and is not newer than this one.
pub const PLUGIN_API_VERSION_MAJOR: u64 = 3;
pub const PLUGIN_API_VERSION_MINOR: u64 = 0;
pub const PLUGIN_API_VERSION_PATCH: u64 = 0;

/// Result codes returned by plugin entry points.
///
/// Kept as a plain `i32` in every extern signature: a misbehaving plugin may
/// return any value, and transmuting an unknown discriminant into an enum
/// would be undefined behavior. Convert with [`Rc::from`] after the call.
pub type RawRc = i32;

pub const RC_SUCCESS: RawRc = 0;
pub const RC_FAILURE: RawRc = 1;
pub const RC_TIMEOUT: RawRc = -1;
pub const RC_EOF: RawRc = 6;
pub const RC_NOT_SUPPORTED: RawRc = 9;

/// Host-side view of a plugin result code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rc {
    Success,
    Failure,
    Timeout,
    Eof,
    NotSupported,
}

impl From<RawRc> for Rc {
    fn from(v: RawRc) -> Self {
        match v {
            RC_SUCCESS => Rc::Success,
            RC_TIMEOUT => Rc::Timeout,
            RC_EOF => Rc::Eof,
            RC_NOT_SUPPORTED => Rc::NotSupported,
            _ => Rc::Failure,
        }
    }
}

/// Init-schema type tags returned by `plugin_get_init_schema`
pub const SCHEMA_NONE: u32 = 0;
pub const SCHEMA_JSON: u32 = 1;

/// Capability bits returned by `plugin_get_capabilities`
pub const CAP_SOURCING_BIT: u32 = 1 << 0;
pub const CAP_EXTRACTION_BIT: u32 = 1 << 1;
pub const CAP_PARSING_BIT: u32 = 1 << 2;

/// Raw state-type tags used on the table ABI (see [`crate::state::StateType`])
pub const ST_BOOL: u32 = 1;
pub const ST_INT8: u32 = 2;
pub const ST_INT16: u32 = 3;
pub const ST_INT32: u32 = 4;
pub const ST_INT64: u32 = 5;
pub const ST_UINT8: u32 = 6;
pub const ST_UINT16: u32 = 7;
pub const ST_UINT32: u32 = 8;
pub const ST_UINT64: u32 = 9;
pub const ST_STRING: u32 = 10;

/// Opaque plugin state, produced by `plugin_init` and owned by the plugin
pub type RawPluginState = c_void;
/// Opaque open-source instance, produced by `plugin_open`
pub type RawInstanceState = c_void;
/// Opaque owner cookie: a pointer back into the host's plugin object
pub type RawOwner = c_void;
/// Opaque table handle exchanged across the table vtables
pub type RawTable = c_void;
/// Opaque table-field accessor
pub type RawTableField = c_void;
/// Opaque table-entry (row) handle
pub type RawTableEntry = c_void;
/// Opaque iteration cookie threaded through [`TableIterFn`]
pub type RawIterState = c_void;

/// Callback with which plugins read the host's last table-operation error
pub type LastErrorFn = unsafe extern "C" fn(owner: *mut RawOwner) -> *const c_char;

/// Per-entry visitor used by `iterate_entries`; returns 0 to stop
pub type TableIterFn =
    unsafe extern "C" fn(ctx: *mut RawIterState, entry: *mut RawTableEntry) -> u32;

/// Fixed event header; the encoded event is this header followed by
/// `len - size_of::<RawEvent>()` payload bytes.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawEvent {
    pub ts: u64,
    pub tid: u64,
    /// Total encoded length, header included
    pub len: u32,
    /// Event type code
    pub code: u16,
    pub nparams: u32,
}

/// Event envelope handed to extraction, parsing and string rendering
#[repr(C)]
pub struct RawEventInput {
    pub evt: *const RawEvent,
    pub evtnum: u64,
    pub source_idx: u32,
    pub source_name: *const c_char,
}

/// A scalar value crossing the table ABI; which member is live is dictated
/// by the accompanying state type.
#[repr(C)]
#[derive(Clone, Copy)]
pub union StateData {
    pub b: u32,
    pub s8: i8,
    pub s16: i16,
    pub s32: i32,
    pub s64: i64,
    pub u8: u8,
    pub u16: u16,
    pub u32: u32,
    pub u64: u64,
    pub str: *const c_char,
}

/// Length-prefixed opaque byte buffer used by network-typed field results
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ByteBuffer {
    pub ptr: *const u8,
    pub len: u32,
}

/// Result arrays filled by `plugin_extract_fields`; which member is live is
/// dictated by the field's declared type.
#[repr(C)]
#[derive(Clone, Copy)]
pub union ExtractResult {
    pub str: *const *const c_char,
    pub u64: *const u64,
    pub u32: *const u32,
    pub buf: *const ByteBuffer,
}

/// One extraction request/response slot. The `res`/`res_len` pair is filled
/// by the plugin and must stay untouched by the host until translated; the
/// remaining members echo the host's request.
#[repr(C)]
pub struct RawExtractField {
    pub res: ExtractResult,
    pub res_len: u64,
    pub field_id: u32,
    pub field: *const c_char,
    pub arg_key: *const c_char,
    pub arg_index: u64,
    pub arg_present: u32,
    pub ftype: u32,
    pub flist: u32,
}

/// Table listing entry returned by the top-level `list_tables`
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawTableInfo {
    pub name: *const c_char,
    pub key_type: u32,
}

/// Field listing entry returned by the fields vtable
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawTableFieldInfo {
    pub name: *const c_char,
    pub field_type: u32,
}

/// Field discovery vtable: list the columns of a table, look one up, or
/// define a new one.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TableFieldsVtable {
    pub list_fields:
        Option<unsafe extern "C" fn(t: *mut RawTable, nfields: *mut u32) -> *const RawTableFieldInfo>,
    pub get_field: Option<
        unsafe extern "C" fn(t: *mut RawTable, name: *const c_char, field_type: u32) -> *mut RawTableField,
    >,
    pub add_field: Option<
        unsafe extern "C" fn(t: *mut RawTable, name: *const c_char, field_type: u32) -> *mut RawTableField,
    >,
}

/// Row lookup, field read and iteration vtable
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TableReaderVtable {
    pub get_name: Option<unsafe extern "C" fn(t: *mut RawTable) -> *const c_char>,
    pub get_size: Option<unsafe extern "C" fn(t: *mut RawTable) -> u64>,
    pub get_entry:
        Option<unsafe extern "C" fn(t: *mut RawTable, key: *const StateData) -> *mut RawTableEntry>,
    pub read_entry_field: Option<
        unsafe extern "C" fn(
            t: *mut RawTable,
            e: *mut RawTableEntry,
            f: *mut RawTableField,
            out: *mut StateData,
        ) -> RawRc,
    >,
    pub iterate_entries:
        Option<unsafe extern "C" fn(t: *mut RawTable, it: TableIterFn, ctx: *mut RawIterState) -> u32>,
}

/// Row creation, field write and erase vtable
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TableWriterVtable {
    pub clear: Option<unsafe extern "C" fn(t: *mut RawTable) -> RawRc>,
    pub erase_entry:
        Option<unsafe extern "C" fn(t: *mut RawTable, key: *const StateData) -> RawRc>,
    pub add_entry:
        Option<unsafe extern "C" fn(t: *mut RawTable, key: *const StateData) -> *mut RawTableEntry>,
    pub write_entry_field: Option<
        unsafe extern "C" fn(
            t: *mut RawTable,
            e: *mut RawTableEntry,
            f: *mut RawTableField,
            v: *const StateData,
        ) -> RawRc,
    >,
}

/// A table published by a plugin through `add_table`: its identity plus the
/// vtables the host must go through to touch the plugin's memory.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct RawTableInput {
    pub name: *const c_char,
    pub key_type: u32,
    pub table: *mut RawTable,
    pub fields: TableFieldsVtable,
    pub reader: TableReaderVtable,
    pub writer: TableWriterVtable,
}

/// Top-level table access handed to `plugin_init` when the plugin declares
/// extraction or parsing.
#[repr(C)]
pub struct TablesInput {
    pub list_tables:
        Option<unsafe extern "C" fn(o: *mut RawOwner, ntables: *mut u32) -> *const RawTableInfo>,
    pub get_table: Option<
        unsafe extern "C" fn(o: *mut RawOwner, name: *const c_char, key_type: u32) -> *mut RawTable,
    >,
    pub add_table:
        Option<unsafe extern "C" fn(o: *mut RawOwner, input: *const RawTableInput) -> RawRc>,
    pub fields: TableFieldsVtable,
}

/// Input to `plugin_init`
#[repr(C)]
pub struct InitInput {
    pub owner: *mut RawOwner,
    pub get_owner_last_error: Option<LastErrorFn>,
    /// Null unless the plugin declares extraction or parsing
    pub tables: *const TablesInput,
    pub config: *const c_char,
}

/// Input to `plugin_extract_fields`
#[repr(C)]
pub struct FieldExtractInput {
    pub owner: *mut RawOwner,
    pub get_owner_last_error: Option<LastErrorFn>,
    pub num_fields: u32,
    pub fields: *mut RawExtractField,
    pub table_reader: TableReaderVtable,
}

/// Input to `plugin_parse_event`
#[repr(C)]
pub struct EventParseInput {
    pub owner: *mut RawOwner,
    pub get_owner_last_error: Option<LastErrorFn>,
    pub table_reader: TableReaderVtable,
    pub table_writer: TableWriterVtable,
}

/// The full plugin vtable: one field per exported symbol.
///
/// [`crate::loader`] fills this from a dynamic library (or accepts one
/// pre-built in-process for tests). `None` means the symbol is not
/// exported; whether that is acceptable depends on the declared
/// capabilities and is checked at load time.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct PluginApi {
    pub get_required_api_version: Option<unsafe extern "C" fn() -> *const c_char>,
    pub get_version: Option<unsafe extern "C" fn() -> *const c_char>,
    pub get_name: Option<unsafe extern "C" fn() -> *const c_char>,
    pub get_description: Option<unsafe extern "C" fn() -> *const c_char>,
    pub get_contact: Option<unsafe extern "C" fn() -> *const c_char>,
    pub get_capabilities: Option<unsafe extern "C" fn() -> u32>,
    pub get_last_error: Option<unsafe extern "C" fn(s: *mut RawPluginState) -> *const c_char>,
    pub init:
        Option<unsafe extern "C" fn(input: *const InitInput, rc: *mut RawRc) -> *mut RawPluginState>,
    pub destroy: Option<unsafe extern "C" fn(s: *mut RawPluginState)>,
    pub get_init_schema: Option<unsafe extern "C" fn(schema_type: *mut u32) -> *const c_char>,

    // Event sourcing
    pub get_id: Option<unsafe extern "C" fn() -> u32>,
    pub get_event_source: Option<unsafe extern "C" fn() -> *const c_char>,
    pub open: Option<
        unsafe extern "C" fn(
            s: *mut RawPluginState,
            params: *const c_char,
            rc: *mut RawRc,
        ) -> *mut RawInstanceState,
    >,
    pub close: Option<unsafe extern "C" fn(s: *mut RawPluginState, i: *mut RawInstanceState)>,
    pub next_batch: Option<
        unsafe extern "C" fn(
            s: *mut RawPluginState,
            i: *mut RawInstanceState,
            nevts: *mut u32,
            evts: *mut *mut *const RawEvent,
        ) -> RawRc,
    >,
    pub get_progress: Option<
        unsafe extern "C" fn(
            s: *mut RawPluginState,
            i: *mut RawInstanceState,
            progress_pct: *mut u32,
        ) -> *const c_char,
    >,
    pub event_to_string: Option<
        unsafe extern "C" fn(s: *mut RawPluginState, evt: *const RawEventInput) -> *const c_char,
    >,
    pub list_open_params:
        Option<unsafe extern "C" fn(s: *mut RawPluginState, rc: *mut RawRc) -> *const c_char>,

    // Field extraction
    pub get_fields: Option<unsafe extern "C" fn() -> *const c_char>,
    pub extract_fields: Option<
        unsafe extern "C" fn(
            s: *mut RawPluginState,
            evt: *const RawEventInput,
            input: *const FieldExtractInput,
        ) -> RawRc,
    >,
    pub get_extract_event_sources: Option<unsafe extern "C" fn() -> *const c_char>,
    pub get_extract_event_types: Option<unsafe extern "C" fn(numtypes: *mut u32) -> *const u16>,

    // Event parsing
    pub parse_event: Option<
        unsafe extern "C" fn(
            s: *mut RawPluginState,
            evt: *const RawEventInput,
            input: *const EventParseInput,
        ) -> RawRc,
    >,
    pub get_parse_event_sources: Option<unsafe extern "C" fn() -> *const c_char>,
    pub get_parse_event_types: Option<unsafe extern "C" fn(numtypes: *mut u32) -> *const u16>,
}

impl PluginApi {
    // Symbols every plugin must export
    pub const SYM_GET_REQUIRED_API_VERSION: &'static str = "plugin_get_required_api_version";
    pub const SYM_GET_VERSION: &'static str = "plugin_get_version";
    pub const SYM_GET_NAME: &'static str = "plugin_get_name";
    pub const SYM_GET_DESCRIPTION: &'static str = "plugin_get_description";
    pub const SYM_GET_CONTACT: &'static str = "plugin_get_contact";
    pub const SYM_GET_CAPABILITIES: &'static str = "plugin_get_capabilities";
    pub const SYM_GET_LAST_ERROR: &'static str = "plugin_get_last_error";
    pub const SYM_INIT: &'static str = "plugin_init";
    pub const SYM_DESTROY: &'static str = "plugin_destroy";

    // Optional across capabilities
    pub const SYM_GET_INIT_SCHEMA: &'static str = "plugin_get_init_schema";

    // Sourcing
    pub const SYM_GET_ID: &'static str = "plugin_get_id";
    pub const SYM_GET_EVENT_SOURCE: &'static str = "plugin_get_event_source";
    pub const SYM_OPEN: &'static str = "plugin_open";
    pub const SYM_CLOSE: &'static str = "plugin_close";
    pub const SYM_NEXT_BATCH: &'static str = "plugin_next_batch";
    pub const SYM_GET_PROGRESS: &'static str = "plugin_get_progress";
    pub const SYM_EVENT_TO_STRING: &'static str = "plugin_event_to_string";
    pub const SYM_LIST_OPEN_PARAMS: &'static str = "plugin_list_open_params";

    // Extraction
    pub const SYM_GET_FIELDS: &'static str = "plugin_get_fields";
    pub const SYM_EXTRACT_FIELDS: &'static str = "plugin_extract_fields";
    pub const SYM_GET_EXTRACT_EVENT_SOURCES: &'static str = "plugin_get_extract_event_sources";
    pub const SYM_GET_EXTRACT_EVENT_TYPES: &'static str = "plugin_get_extract_event_types";

    // Parsing
    pub const SYM_PARSE_EVENT: &'static str = "plugin_parse_event";
    pub const SYM_GET_PARSE_EVENT_SOURCES: &'static str = "plugin_get_parse_event_sources";
    pub const SYM_GET_PARSE_EVENT_TYPES: &'static str = "plugin_get_parse_event_types";
}
