//! Host-side event inputs handed to the capability adapters.
//!
//! The capture pipeline that produces events is outside this crate; an
//! [`EventInput`] carries just what the plugin ABI needs: event number, type
//! code, the originating source (index + name, when known) and the encoded
//! event bytes.

use std::collections::{BTreeSet, HashSet};

use parking_lot::Mutex;

use crate::abi::RawEvent;

/// Name of the engine's built-in event source
pub const SYSCALL_EVENT_SOURCE: &str = "syscall";

/// Type code of events produced by sourcing plugins with a numeric id
pub const PLUGIN_EVENT_CODE: u16 = 322;

/// Type code reserved for events of sourcing plugins without an id
pub const GENERIC_PLUGIN_EVENT_CODE: u16 = 323;

/// Raw source-index sentinel meaning "unknown source"
pub const NO_SOURCE_IDX: u32 = u32::MAX;

/// Size of the fixed event header prefixing every encoded event
pub const EVENT_HEADER_SIZE: usize = std::mem::size_of::<RawEvent>();

/// Encode an event as the ABI expects it: fixed header, then payload.
pub fn encode_event(ts: u64, tid: u64, code: u16, nparams: u32, payload: &[u8]) -> Vec<u8> {
    let len = (EVENT_HEADER_SIZE + payload.len()) as u32;
    let mut out = Vec::with_capacity(EVENT_HEADER_SIZE + payload.len());
    out.extend_from_slice(&ts.to_le_bytes());
    out.extend_from_slice(&tid.to_le_bytes());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&code.to_le_bytes());
    out.extend_from_slice(&[0u8; 2]);
    out.extend_from_slice(&nparams.to_le_bytes());
    out.extend_from_slice(&[0u8; 4]);
    out.extend_from_slice(payload);
    debug_assert_eq!(out.len(), EVENT_HEADER_SIZE + payload.len());
    out
}

/// The set of event type codes a capability applies to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventCodeSet {
    /// Compatible with every event code
    All,
    /// Compatible with exactly these codes
    Codes(BTreeSet<u16>),
}

impl EventCodeSet {
    pub fn contains(&self, code: u16) -> bool {
        match self {
            EventCodeSet::All => true,
            EventCodeSet::Codes(codes) => codes.contains(&code),
        }
    }

    pub fn from_codes(codes: impl IntoIterator<Item = u16>) -> Self {
        EventCodeSet::Codes(codes.into_iter().collect())
    }
}

/// One event flowing through the pipeline, as seen by this subsystem
#[derive(Debug, Clone)]
pub struct EventInput {
    /// Monotonic event number assigned by the pipeline
    pub num: u64,
    /// Event type code
    pub code: u16,
    /// Index of the event's source in the pipeline's source list, when known
    pub source_idx: Option<u32>,
    /// Resolved name of the event's source, when known
    pub source_name: Option<String>,
    data: Vec<u8>,
}

impl EventInput {
    /// Wrap an already-encoded event
    pub fn new(
        num: u64,
        code: u16,
        source_idx: Option<u32>,
        source_name: Option<String>,
        data: Vec<u8>,
    ) -> Self {
        Self {
            num,
            code,
            source_idx,
            source_name,
            data,
        }
    }

    /// Build a plugin event carrying the given payload
    pub fn plugin_event(
        num: u64,
        source_idx: u32,
        source_name: impl Into<String>,
        payload: &[u8],
    ) -> Self {
        Self::new(
            num,
            PLUGIN_EVENT_CODE,
            Some(source_idx),
            Some(source_name.into()),
            encode_event(0, 0, PLUGIN_EVENT_CODE, 1, payload),
        )
    }

    /// The full encoded event, header included
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// The payload bytes after the fixed header; empty for malformed input
    pub fn payload(&self) -> &[u8] {
        self.data.get(EVENT_HEADER_SIZE..).unwrap_or(&[])
    }
}

/// Per-adapter memo of which event sources a plugin accepts, indexed by
/// source index. Grown lazily the first time each index is seen.
pub(crate) struct SourceCompatCache {
    bitmap: Mutex<Vec<Option<bool>>>,
}

impl SourceCompatCache {
    pub(crate) fn new() -> Self {
        Self {
            bitmap: Mutex::new(Vec::new()),
        }
    }

    /// Whether the event's source is accepted by `sources` (empty set means
    /// every source is). Events without a source index are rejected.
    pub(crate) fn check(&self, sources: &HashSet<String>, event: &EventInput) -> bool {
        let Some(idx) = event.source_idx else {
            return false;
        };
        let idx = idx as usize;
        let mut bitmap = self.bitmap.lock();
        if idx >= bitmap.len() {
            bitmap.resize(idx + 1, None);
        }
        if let Some(known) = bitmap[idx] {
            return known;
        }
        // without a resolved name the verdict cannot be computed; reject
        // but leave the slot unset
        let Some(name) = &event.source_name else {
            return false;
        };
        let compatible = sources.is_empty() || sources.contains(name);
        bitmap[idx] = Some(compatible);
        compatible
    }
}

/// One event pulled out of a sourcing plugin's batch. The plugin's buffers
/// are only valid until its next call, so the bytes are copied out.
#[derive(Debug, Clone)]
pub struct SourcedEvent {
    /// Numeric id of the producing plugin; 0 for generic plugin events
    pub plugin_id: u32,
    data: Vec<u8>,
}

impl SourcedEvent {
    pub(crate) fn new(plugin_id: u32, data: Vec<u8>) -> Self {
        Self { plugin_id, data }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Promote into a pipeline event once the pipeline has assigned an
    /// event number and resolved the source.
    pub fn into_event_input(
        self,
        num: u64,
        source_idx: u32,
        source_name: impl Into<String>,
    ) -> EventInput {
        let code = if self.plugin_id == 0 {
            GENERIC_PLUGIN_EVENT_CODE
        } else {
            PLUGIN_EVENT_CODE
        };
        EventInput::new(num, code, Some(source_idx), Some(source_name.into()), self.data)
    }
}
