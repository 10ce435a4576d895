//! Dynamic library loading and symbol binding.
//!
//! A [`PluginLibrary`] owns the OS library handle and the bound
//! [`PluginApi`] vtable. For tests (and embedders that link plugins
//! statically) a pre-built vtable can be supplied instead of a path.
//!
//! The set of libraries currently open in the process is tracked by an
//! explicit [`LibraryRegistry`] owned by the subsystem root. Loading the
//! same path twice is permitted and yields independent plugins.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use libloading::Library;
use parking_lot::Mutex;

use crate::abi::PluginApi;
use crate::error::{PluginError, Result};

/// Tracks which plugin libraries are currently open in the process.
///
/// Purely advisory: [`LibraryRegistry::is_loaded`] lets embedders detect
/// double-loads, which are allowed but which plugins must tolerate.
#[derive(Default, Debug)]
pub struct LibraryRegistry {
    open: Mutex<HashMap<PathBuf, usize>>,
}

impl LibraryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a library at this path is currently open
    pub fn is_loaded(&self, path: impl AsRef<Path>) -> bool {
        let path = canonical(path.as_ref());
        self.open.lock().contains_key(&path)
    }

    fn register(&self, path: PathBuf) {
        *self.open.lock().entry(path).or_insert(0) += 1;
    }

    fn unregister(&self, path: &Path) {
        let mut open = self.open.lock();
        if let Some(count) = open.get_mut(path) {
            *count -= 1;
            if *count == 0 {
                open.remove(path);
            }
        }
    }
}

fn canonical(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

/// An open plugin library and its bound entry points
#[derive(Debug)]
pub struct PluginLibrary {
    pub(crate) api: PluginApi,
    path: Option<PathBuf>,
    registry: Option<Arc<LibraryRegistry>>,
    // must stay alive as long as `api`'s function pointers are callable
    _library: Option<Library>,
}

impl PluginLibrary {
    /// Open the dynamic library at `path` and bind its symbols.
    ///
    /// Fails with a [`PluginError::Load`] naming the first missing required
    /// symbol. Capability-conditional symbols are bound when present and
    /// checked against the declared capabilities later, at plugin creation.
    pub fn load(path: impl AsRef<Path>, registry: Arc<LibraryRegistry>) -> Result<Self> {
        let path = path.as_ref();
        let library = unsafe { Library::new(path) }.map_err(|e| {
            PluginError::load(format!(
                "could not open plugin library '{}': {e}",
                path.display()
            ))
        })?;
        let api = unsafe { bind_symbols(&library) }?;
        let path = canonical(path);
        registry.register(path.clone());
        tracing::debug!(path = %path.display(), "loaded plugin library");
        Ok(Self {
            api,
            path: Some(path),
            registry: Some(registry),
            _library: Some(library),
        })
    }

    /// Use a pre-built in-process vtable instead of a dynamic library
    pub fn from_api(api: PluginApi) -> Result<Self> {
        check_required(&api)?;
        Ok(Self {
            api,
            path: None,
            registry: None,
            _library: None,
        })
    }

    /// Path of the backing library; `None` for in-process vtables
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

impl Drop for PluginLibrary {
    fn drop(&mut self) {
        if let (Some(registry), Some(path)) = (&self.registry, &self.path) {
            registry.unregister(path);
            tracing::debug!(path = %path.display(), "unloaded plugin library");
        }
    }
}

/// Bind one required symbol; the target type is inferred from the vtable
/// field being assigned.
unsafe fn sym<T: Copy>(library: &Library, name: &str) -> Result<T> {
    let symbol = library.get::<T>(name.as_bytes()).map_err(|e| {
        PluginError::load(format!("required symbol {name} not found: {e}"))
    })?;
    Ok(*symbol)
}

unsafe fn opt_sym<T: Copy>(library: &Library, name: &str) -> Option<T> {
    library.get::<T>(name.as_bytes()).ok().map(|s| *s)
}

unsafe fn bind_symbols(library: &Library) -> Result<PluginApi> {
    let mut api = PluginApi::default();

    api.get_required_api_version =
        Some(sym(library, PluginApi::SYM_GET_REQUIRED_API_VERSION)?);
    api.get_version = Some(sym(library, PluginApi::SYM_GET_VERSION)?);
    api.get_name = Some(sym(library, PluginApi::SYM_GET_NAME)?);
    api.get_description = Some(sym(library, PluginApi::SYM_GET_DESCRIPTION)?);
    api.get_contact = Some(sym(library, PluginApi::SYM_GET_CONTACT)?);
    api.get_capabilities = Some(sym(library, PluginApi::SYM_GET_CAPABILITIES)?);
    api.get_last_error = Some(sym(library, PluginApi::SYM_GET_LAST_ERROR)?);
    api.init = Some(sym(library, PluginApi::SYM_INIT)?);
    api.destroy = Some(sym(library, PluginApi::SYM_DESTROY)?);

    api.get_init_schema = opt_sym(library, PluginApi::SYM_GET_INIT_SCHEMA);

    api.get_id = opt_sym(library, PluginApi::SYM_GET_ID);
    api.get_event_source = opt_sym(library, PluginApi::SYM_GET_EVENT_SOURCE);
    api.open = opt_sym(library, PluginApi::SYM_OPEN);
    api.close = opt_sym(library, PluginApi::SYM_CLOSE);
    api.next_batch = opt_sym(library, PluginApi::SYM_NEXT_BATCH);
    api.get_progress = opt_sym(library, PluginApi::SYM_GET_PROGRESS);
    api.event_to_string = opt_sym(library, PluginApi::SYM_EVENT_TO_STRING);
    api.list_open_params = opt_sym(library, PluginApi::SYM_LIST_OPEN_PARAMS);

    api.get_fields = opt_sym(library, PluginApi::SYM_GET_FIELDS);
    api.extract_fields = opt_sym(library, PluginApi::SYM_EXTRACT_FIELDS);
    api.get_extract_event_sources = opt_sym(library, PluginApi::SYM_GET_EXTRACT_EVENT_SOURCES);
    api.get_extract_event_types = opt_sym(library, PluginApi::SYM_GET_EXTRACT_EVENT_TYPES);

    api.parse_event = opt_sym(library, PluginApi::SYM_PARSE_EVENT);
    api.get_parse_event_sources = opt_sym(library, PluginApi::SYM_GET_PARSE_EVENT_SOURCES);
    api.get_parse_event_types = opt_sym(library, PluginApi::SYM_GET_PARSE_EVENT_TYPES);

    Ok(api)
}

fn check_required(api: &PluginApi) -> Result<()> {
    let missing = [
        (
            api.get_required_api_version.is_none(),
            PluginApi::SYM_GET_REQUIRED_API_VERSION,
        ),
        (api.get_version.is_none(), PluginApi::SYM_GET_VERSION),
        (api.get_name.is_none(), PluginApi::SYM_GET_NAME),
        (api.get_description.is_none(), PluginApi::SYM_GET_DESCRIPTION),
        (api.get_contact.is_none(), PluginApi::SYM_GET_CONTACT),
        (api.get_capabilities.is_none(), PluginApi::SYM_GET_CAPABILITIES),
        (api.get_last_error.is_none(), PluginApi::SYM_GET_LAST_ERROR),
        (api.init.is_none(), PluginApi::SYM_INIT),
        (api.destroy.is_none(), PluginApi::SYM_DESTROY),
    ]
    .into_iter()
    .find(|(missing, _)| *missing);

    if let Some((_, name)) = missing {
        return Err(PluginError::load(format!(
            "required symbol {name} not exported"
        )));
    }
    Ok(())
}
