//! Event sourcing adapter.
//!
//! Wraps the sourcing capability of an initialized plugin: opening a
//! capture session, pulling event batches, progress reporting and event
//! rendering.

use std::ffi::CString;
use std::sync::Arc;

use serde::Deserialize;

use crate::abi::{RawInstanceState, RawRc, Rc, RC_FAILURE, RC_SUCCESS};
use crate::error::{PluginError, Result};
use crate::event::{EventInput, SourcedEvent};
use crate::plugin::{str_from_ptr, Plugin};

/// One suggested open parameter advertised by a sourcing plugin
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct OpenParam {
    pub value: String,
    pub desc: String,
    pub separator: String,
}

/// Outcome of a [`SourceInstance::next_batch`] call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStatus {
    /// More events may follow
    Ok,
    /// No events were ready; try again
    Timeout,
    /// The source is exhausted
    Eof,
}

impl Plugin {
    /// Open a capture session on a sourcing-capable, initialized plugin
    pub fn open_source(self: &Arc<Self>, params: Option<&str>) -> Result<SourceInstance> {
        let state = self.checked_state()?;
        let plugin_id = self.id()?;

        let params = params
            .map(CString::new)
            .transpose()
            .map_err(|_| {
                PluginError::argument(format!(
                    "plugin '{}': open params contain a NUL byte",
                    self.name()
                ))
            })?;
        let open = self.api().open.expect("checked at capability resolution");
        let mut rc: RawRc = RC_FAILURE;
        let handle = unsafe {
            open(
                state,
                params.as_ref().map_or(std::ptr::null(), |p| p.as_ptr()),
                &mut rc,
            )
        };
        if Rc::from(rc) != Rc::Success || handle.is_null() {
            return Err(PluginError::runtime(format!(
                "plugin '{}' could not open the event source: {}",
                self.name(),
                self.get_last_error().unwrap_or_default()
            )));
        }
        Ok(SourceInstance {
            plugin: Arc::clone(self),
            handle,
            plugin_id,
        })
    }

    /// Render an event as human-readable text.
    ///
    /// Uses the plugin's own renderer when available and falls back to a
    /// payload preview otherwise.
    pub fn event_to_string(&self, event: &EventInput) -> Result<String> {
        let state = self.checked_state()?;
        self.id()?;

        let mut out = String::new();
        if let Some(event_to_string) = self.api().event_to_string {
            if !state.is_null() {
                let source_name = Self::source_name_cstring(event);
                let raw_event = Self::raw_event_input(event, &source_name);
                out = unsafe { str_from_ptr(event_to_string(state, &raw_event)) };
            }
        }
        if out.is_empty() {
            out = fallback_event_string(event.payload());
        }
        Ok(out)
    }

    /// Suggested open parameters, parsed from the plugin's JSON listing
    pub fn list_open_params(&self) -> Result<Vec<OpenParam>> {
        let state = self.checked_state()?;
        self.id()?;

        let Some(list_open_params) = self.api().list_open_params else {
            return Ok(Vec::new());
        };
        let mut rc: RawRc = RC_SUCCESS;
        let json = unsafe { str_from_ptr(list_open_params(state, &mut rc)) };
        if Rc::from(rc) != Rc::Success {
            return Err(PluginError::runtime(format!(
                "plugin '{}': list_open_params failed: {}",
                self.name(),
                self.get_last_error().unwrap_or_default()
            )));
        }
        if json.is_empty() {
            return Ok(Vec::new());
        }
        let params: Vec<OpenParam> = serde_json::from_str(&json).map_err(|_| {
            PluginError::runtime(format!(
                "plugin '{}': list_open_params returned a non-array JSON",
                self.name()
            ))
        })?;
        for param in &params {
            if param.value.is_empty() {
                return Err(PluginError::runtime(format!(
                    "plugin '{}': list_open_params has an entry with no value",
                    self.name()
                )));
            }
        }
        Ok(params)
    }
}

/// An open capture session on a sourcing plugin.
///
/// Closed on drop; keeps the plugin alive while open.
pub struct SourceInstance {
    plugin: Arc<Plugin>,
    handle: *mut RawInstanceState,
    plugin_id: u32,
}

impl SourceInstance {
    pub fn plugin(&self) -> &Arc<Plugin> {
        &self.plugin
    }

    /// Pull the next batch of events, copying them out of the plugin's
    /// buffers. The buffers are owned by the plugin and reused on the next
    /// call, so the copy happens before returning.
    pub fn next_batch(&mut self) -> Result<(Vec<SourcedEvent>, BatchStatus)> {
        let state = self.plugin.checked_state()?;
        let next_batch = self
            .plugin
            .api()
            .next_batch
            .expect("checked at capability resolution");

        let mut nevts: u32 = 0;
        let mut evts: *mut *const crate::abi::RawEvent = std::ptr::null_mut();
        let rc = unsafe { next_batch(state, self.handle, &mut nevts, &mut evts) };
        let status = match Rc::from(rc) {
            Rc::Success => BatchStatus::Ok,
            Rc::Timeout => BatchStatus::Timeout,
            Rc::Eof => BatchStatus::Eof,
            _ => {
                return Err(PluginError::runtime(format!(
                    "plugin '{}': next_batch failed: {}",
                    self.plugin.name(),
                    self.plugin.get_last_error().unwrap_or_default()
                )));
            }
        };

        let mut events = Vec::with_capacity(nevts as usize);
        if !evts.is_null() {
            for i in 0..nevts as usize {
                let evt = unsafe { *evts.add(i) };
                if evt.is_null() {
                    continue;
                }
                let header = unsafe { std::ptr::read_unaligned(evt) };
                let len = (header.len as usize).max(crate::event::EVENT_HEADER_SIZE);
                let bytes =
                    unsafe { std::slice::from_raw_parts(evt as *const u8, len) }.to_vec();
                events.push(SourcedEvent::new(self.plugin_id, bytes));
            }
        }
        Ok((events, status))
    }

    /// Progress of the capture as reported by the plugin; empty text and 0
    /// when the plugin does not report progress.
    pub fn get_progress(&self) -> Result<(String, u32)> {
        let state = self.plugin.checked_state()?;
        let Some(get_progress) = self.plugin.api().get_progress else {
            return Ok((String::new(), 0));
        };
        let mut pct: u32 = 0;
        let text = unsafe { str_from_ptr(get_progress(state, self.handle, &mut pct)) };
        Ok((text, pct))
    }

    /// Close the session. Also happens on drop.
    pub fn close(&mut self) {
        if self.handle.is_null() {
            return;
        }
        // if the plugin was destroyed first there is nothing left to close
        if let Ok(state) = self.plugin.checked_state() {
            if let Some(close) = self.plugin.api().close {
                unsafe { close(state, self.handle) };
            }
        }
        self.handle = std::ptr::null_mut();
    }
}

impl Drop for SourceInstance {
    fn drop(&mut self) {
        self.close();
    }
}

/// Render a payload preview when the plugin has no renderer of its own:
/// up to 50 printable bytes, `<binary>` otherwise.
fn fallback_event_string(payload: &[u8]) -> String {
    let mut out = format!("datalen={} data=", payload.len());
    let take = payload.len().min(50);
    if payload[..take].iter().any(|b| !b.is_ascii_graphic() && *b != b' ') {
        out.push_str("<binary>");
        return out;
    }
    out.push_str(std::str::from_utf8(&payload[..take]).unwrap_or("<binary>"));
    if payload.len() > 50 {
        out.push_str("...");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fallback_rendering_printable() {
        assert_eq!(fallback_event_string(b"hello"), "datalen=5 data=hello");
    }

    #[test]
    fn test_fallback_rendering_binary() {
        assert_eq!(
            fallback_event_string(&[0x68, 0x00, 0x69]),
            "datalen=3 data=<binary>"
        );
    }

    #[test]
    fn test_fallback_rendering_truncates() {
        let payload = vec![b'a'; 60];
        let out = fallback_event_string(&payload);
        assert_eq!(out, format!("datalen=60 data={}...", "a".repeat(50)));
    }

    #[test]
    fn test_open_param_parsing_defaults() {
        let params: Vec<OpenParam> =
            serde_json::from_str(r#"[{"value": "file:///tmp/a", "desc": "a file"}]"#).unwrap();
        assert_eq!(params[0].value, "file:///tmp/a");
        assert_eq!(params[0].separator, "");
    }
}
