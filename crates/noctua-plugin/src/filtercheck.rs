//! Field-check adapter: evaluates one plugin field against events on
//! behalf of the filter engine.
//!
//! The engine hands this adapter a textual field reference such as
//! `plugin.foo[42]` or `plugin.bar[my-key]`; the adapter resolves the
//! field, validates the bracketed argument against the field's flags, and
//! drives the plugin's extractor per event, normalizing results into the
//! engine's value representation.

use std::sync::Arc;

use crate::error::{PluginError, Result};
use crate::event::{EventInput, SourceCompatCache};
use crate::fields::{FieldArg, FieldDescriptor, FieldFlags};
use crate::plugin::{ExtractRequest, ExtractedValue, Plugin};

/// A per-expression-node binding of one plugin field
pub struct FieldCheck {
    plugin: Arc<Plugin>,
    field_id: usize,
    arg: FieldArg,
    compat: SourceCompatCache,
}

impl FieldCheck {
    /// Fails unless the plugin declares the extraction capability
    pub fn new(plugin: Arc<Plugin>) -> Result<Self> {
        plugin.fields()?;
        Ok(Self {
            plugin,
            field_id: 0,
            arg: FieldArg::None,
            compat: SourceCompatCache::new(),
        })
    }

    pub fn plugin(&self) -> &Arc<Plugin> {
        &self.plugin
    }

    /// The currently selected field
    pub fn field(&self) -> Result<&FieldDescriptor> {
        let fields = self.plugin.fields()?;
        fields.get(self.field_id).ok_or_else(|| {
            PluginError::argument(format!(
                "plugin '{}': unknown field id {}",
                self.plugin.name(),
                self.field_id
            ))
        })
    }

    pub fn arg(&self) -> &FieldArg {
        &self.arg
    }

    /// Parse a field reference token, terminated by end-of-string or a
    /// space. Selects the field and binds its argument; returns the number
    /// of consumed bytes.
    pub fn parse_field(&mut self, token: &str) -> Result<usize> {
        let token = &token[..token.find(' ').unwrap_or(token.len())];
        let fields = self.plugin.fields()?;

        let (base, bracket) = match token.find('[') {
            Some(pos) => (&token[..pos], Some(&token[pos + 1..])),
            None => (token, None),
        };
        let (field_id, field) = fields.find(base).ok_or_else(|| {
            PluginError::argument(format!(
                "plugin '{}' does not export field '{base}'",
                self.plugin.name()
            ))
        })?;
        let flags = field.flags;

        let (arg, consumed) = match bracket {
            None => {
                if flags.contains(FieldFlags::ARG_REQUIRED) {
                    return Err(PluginError::argument(format!(
                        "field '{}' requires an argument but none provided",
                        field.name
                    )));
                }
                (FieldArg::None, base.len())
            }
            Some(rest) => {
                let close = rest.find(']').ok_or_else(|| {
                    PluginError::argument(format!(
                        "field '{}' has a badly-formatted argument",
                        field.name
                    ))
                })?;
                let argstr = &rest[..close];
                // consumed: base + '[' + arg + ']'
                let consumed = base.len() + close + 2;
                if !flags.intersects(FieldFlags::ARG_ALLOWED | FieldFlags::ARG_REQUIRED) {
                    return Err(PluginError::argument(format!(
                        "field '{}' does not allow nor require an argument but one is provided: {argstr}",
                        field.name
                    )));
                }
                // an index-flagged field always enforces the index grammar;
                // a key flag additionally captures the verbatim string
                let arg = match (
                    flags.contains(FieldFlags::ARG_INDEX),
                    flags.contains(FieldFlags::ARG_KEY),
                ) {
                    (true, true) => {
                        let index = parse_arg_index(&field.name, argstr)?;
                        FieldArg::Both(index, argstr.to_string())
                    }
                    (true, false) => FieldArg::Index(parse_arg_index(&field.name, argstr)?),
                    (false, _) => FieldArg::Key(argstr.to_string()),
                };
                (arg, consumed)
            }
        };

        self.field_id = field_id;
        self.arg = arg;
        Ok(consumed)
    }

    /// Extract this field from one event.
    ///
    /// Returns `Ok(None)` without calling the plugin when the event's
    /// source or type code is not compatible, and when the plugin produces
    /// no value; both are silent rejections on the filter hot path.
    pub fn extract(&self, event: &EventInput) -> Result<Option<Vec<ExtractedValue>>> {
        // reject events from an unknown source outright
        if event.source_idx.is_none() {
            return Ok(None);
        }
        if !self.plugin.extract_event_codes()?.contains(event.code) {
            return Ok(None);
        }
        if !self
            .compat
            .check(self.plugin.extract_event_sources()?, event)
        {
            return Ok(None);
        }

        let mut requests = [ExtractRequest::new(self.field_id, self.arg.clone())];
        if !self.plugin.extract_fields(event, &mut requests)? {
            return Ok(None);
        }
        let [request] = requests;
        if request.values.is_empty() {
            return Ok(None);
        }
        Ok(Some(request.values))
    }
}

/// Index arguments are unsigned decimals with no leading zero
fn parse_arg_index(field_name: &str, argstr: &str) -> Result<u64> {
    if argstr.is_empty() || argstr.bytes().any(|b| !b.is_ascii_digit()) {
        return Err(PluginError::argument(format!(
            "field '{field_name}' has an invalid index argument not composed only by digits: {argstr}"
        )));
    }
    if argstr.len() > 1 && argstr.starts_with('0') {
        return Err(PluginError::argument(format!(
            "field '{field_name}' has an invalid index argument that starts with 0: {argstr}"
        )));
    }
    argstr.parse::<u64>().map_err(|_| {
        PluginError::argument(format!(
            "field '{field_name}' has an invalid index argument not representable on 64 bits: {argstr}"
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::{
        InitInput, PluginApi, RawPluginState, RawRc, CAP_EXTRACTION_BIT, RC_FAILURE, RC_SUCCESS,
    };
    use crate::state::registry::TableRegistry;
    use std::os::raw::c_char;

    unsafe extern "C" fn api_version() -> *const c_char {
        c"3.0.0".as_ptr()
    }

    unsafe extern "C" fn plugin_version() -> *const c_char {
        c"1.4.0".as_ptr()
    }

    unsafe extern "C" fn name() -> *const c_char {
        c"demo".as_ptr()
    }

    unsafe extern "C" fn description() -> *const c_char {
        c"test extraction plugin".as_ptr()
    }

    unsafe extern "C" fn contact() -> *const c_char {
        c"test@example.com".as_ptr()
    }

    unsafe extern "C" fn capabilities() -> u32 {
        CAP_EXTRACTION_BIT
    }

    unsafe extern "C" fn last_error(_s: *mut RawPluginState) -> *const c_char {
        std::ptr::null()
    }

    unsafe extern "C" fn init(_input: *const InitInput, rc: *mut RawRc) -> *mut RawPluginState {
        *rc = RC_SUCCESS;
        std::ptr::null_mut()
    }

    unsafe extern "C" fn destroy(_s: *mut RawPluginState) {}

    unsafe extern "C" fn get_fields() -> *const c_char {
        cr#"[
            {"name": "demo.idx", "type": "uint64", "desc": "by index",
             "arg": {"isRequired": true, "isIndex": true}},
            {"name": "demo.key", "type": "string", "desc": "by key",
             "arg": {"isKey": true}},
            {"name": "demo.both", "type": "string", "desc": "by either",
             "arg": {"isRequired": true, "isIndex": true, "isKey": true}},
            {"name": "demo.plain", "type": "uint64", "desc": "no argument"}
        ]"#
        .as_ptr()
    }

    unsafe extern "C" fn extract_fields(
        _s: *mut RawPluginState,
        _evt: *const crate::abi::RawEventInput,
        _input: *const crate::abi::FieldExtractInput,
    ) -> RawRc {
        RC_FAILURE
    }

    fn demo_plugin() -> Arc<Plugin> {
        let api = PluginApi {
            get_required_api_version: Some(api_version),
            get_version: Some(plugin_version),
            get_name: Some(name),
            get_description: Some(description),
            get_contact: Some(contact),
            get_capabilities: Some(capabilities),
            get_last_error: Some(last_error),
            init: Some(init),
            destroy: Some(destroy),
            get_fields: Some(get_fields),
            extract_fields: Some(extract_fields),
            ..Default::default()
        };
        Plugin::create_from_api(api, Arc::new(TableRegistry::new())).unwrap()
    }

    #[test]
    fn test_requires_extraction_capability() {
        let plugin = demo_plugin();
        assert!(FieldCheck::new(plugin).is_ok());
    }

    #[test]
    fn test_index_argument_round_trip() {
        let mut check = FieldCheck::new(demo_plugin()).unwrap();
        for n in [0u64, 1, 42, u64::MAX] {
            let token = format!("demo.idx[{n}]");
            let consumed = check.parse_field(&token).unwrap();
            assert_eq!(consumed, token.len());
            assert_eq!(*check.arg(), FieldArg::Index(n));
        }
    }

    #[test]
    fn test_key_argument_is_verbatim() {
        let mut check = FieldCheck::new(demo_plugin()).unwrap();
        for key in ["my-key", "42", "01", "nested[bracket"] {
            let token = format!("demo.key[{key}]");
            check.parse_field(&token).unwrap();
            assert_eq!(*check.arg(), FieldArg::Key(key.to_string()));
        }
    }

    #[test]
    fn test_index_rejects_leading_zero() {
        let mut check = FieldCheck::new(demo_plugin()).unwrap();
        let err = check.parse_field("demo.idx[01]").unwrap_err();
        assert!(err.to_string().contains("starts with 0"));

        let consumed = check.parse_field("demo.idx[0]").unwrap();
        assert_eq!(consumed, "demo.idx[0]".len());
        assert_eq!(*check.arg(), FieldArg::Index(0));
    }

    #[test]
    fn test_index_rejects_non_digits_and_overflow() {
        let mut check = FieldCheck::new(demo_plugin()).unwrap();
        let err = check.parse_field("demo.idx[1a]").unwrap_err();
        assert!(err.to_string().contains("digits"));

        let err = check.parse_field("demo.idx[]").unwrap_err();
        assert!(err.to_string().contains("digits"));

        // one past u64::MAX
        let err = check.parse_field("demo.idx[18446744073709551616]").unwrap_err();
        assert!(err.to_string().contains("64 bits"));
    }

    #[test]
    fn test_required_argument_missing() {
        let mut check = FieldCheck::new(demo_plugin()).unwrap();
        let err = check.parse_field("demo.idx").unwrap_err();
        assert!(err.to_string().contains("requires an argument"));
        assert!(matches!(err, PluginError::Argument(_)));
    }

    #[test]
    fn test_argument_on_plain_field_is_rejected() {
        let mut check = FieldCheck::new(demo_plugin()).unwrap();
        let err = check.parse_field("demo.plain[3]").unwrap_err();
        assert!(err.to_string().contains("does not allow"));

        let consumed = check.parse_field("demo.plain").unwrap();
        assert_eq!(consumed, "demo.plain".len());
        assert_eq!(*check.arg(), FieldArg::None);
    }

    #[test]
    fn test_unterminated_argument() {
        let mut check = FieldCheck::new(demo_plugin()).unwrap();
        let err = check.parse_field("demo.idx[7").unwrap_err();
        assert!(err.to_string().contains("badly-formatted"));
    }

    #[test]
    fn test_token_is_terminated_by_space() {
        let mut check = FieldCheck::new(demo_plugin()).unwrap();
        let consumed = check.parse_field("demo.key[k] = value").unwrap();
        assert_eq!(consumed, "demo.key[k]".len());
        assert_eq!(*check.arg(), FieldArg::Key("k".to_string()));
    }

    #[test]
    fn test_both_forms_populate_index_and_key() {
        let mut check = FieldCheck::new(demo_plugin()).unwrap();

        check.parse_field("demo.both[10]").unwrap();
        assert_eq!(*check.arg(), FieldArg::Both(10, "10".to_string()));

        // the index grammar is enforced even though a key is also captured
        let err = check.parse_field("demo.both[01]").unwrap_err();
        assert!(matches!(err, PluginError::Argument(_)));
        assert!(err.to_string().contains("starts with 0"));

        let err = check.parse_field("demo.both[abc]").unwrap_err();
        assert!(matches!(err, PluginError::Argument(_)));
        assert!(err.to_string().contains("digits"));
    }

    #[test]
    fn test_unknown_field() {
        let mut check = FieldCheck::new(demo_plugin()).unwrap();
        assert!(check.parse_field("demo.missing").is_err());
    }

    #[test]
    fn test_extract_rejects_unknown_source_idx() {
        let plugin = demo_plugin();
        plugin.init("").unwrap();
        let mut check = FieldCheck::new(Arc::clone(&plugin)).unwrap();
        check.parse_field("demo.plain").unwrap();

        let event = crate::event::EventInput::new(
            1,
            crate::event::PLUGIN_EVENT_CODE,
            None,
            None,
            crate::event::encode_event(0, 0, crate::event::PLUGIN_EVENT_CODE, 1, b""),
        );
        assert_eq!(check.extract(&event).unwrap(), None);
    }
}
