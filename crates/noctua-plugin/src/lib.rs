//! noctua-plugin - Plugin host for the noctua event engine
//!
//! Loads external dynamic libraries that extend the engine with event
//! sourcing, field extraction, event parsing and shared state tables, and
//! exposes those capabilities to the surrounding pipeline behind uniform,
//! strongly-typed contracts.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         Plugin Host                              │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐  ┌──────────────┐  ┌───────────────────────┐   │
//! │  │ Loader       │  │ Plugin       │  │ Table Registry        │   │
//! │  │ (.so + ABI)  │  │ (lifecycle)  │  │ (shared state tables) │   │
//! │  └──────────────┘  └──────────────┘  └───────────────────────┘   │
//! │         │                 │                      │               │
//! │         ▼                 ▼                      ▼               │
//! │  ┌────────────────────────────────────────────────────────────┐  │
//! │  │                  Capability Adapters                       │  │
//! │  │  • SourceInstance (open/next_batch/progress)               │  │
//! │  │  • FieldCheck     (filter fields, name[arg] references)    │  │
//! │  │  • EventParser    (state mutation via the table bridge)    │  │
//! │  └────────────────────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use noctua_plugin::{LibraryRegistry, Plugin, TableRegistry, FieldCheck};
//!
//! let libraries = Arc::new(LibraryRegistry::new());
//! let tables = Arc::new(TableRegistry::new());
//!
//! let plugin = Plugin::create("/usr/lib/noctua/libdemo.so", libraries, tables)?;
//! plugin.init(r#"{"endpoint": "unix:///run/demo.sock"}"#)?;
//!
//! let mut check = FieldCheck::new(Arc::clone(&plugin))?;
//! check.parse_field("demo.count")?;
//! for event in pipeline {
//!     if let Some(values) = check.extract(&event)? {
//!         // feed values to the filter engine
//!     }
//! }
//! ```
//!
//! # Concurrency
//!
//! Plugin calls run synchronously on the caller's thread and are expected
//! from one dispatcher thread at a time. The process-wide registries (open
//! libraries, state tables) carry their own locks and may be shared freely.

pub mod abi;
pub mod error;
pub mod event;
pub mod fields;
pub mod filtercheck;
pub mod loader;
pub mod plugin;
pub mod schema;
pub mod source;
pub mod state;
pub mod version;

pub use error::{PluginError, Result};
pub use event::{
    EventCodeSet, EventInput, SourcedEvent, GENERIC_PLUGIN_EVENT_CODE, PLUGIN_EVENT_CODE,
    SYSCALL_EVENT_SOURCE,
};
pub use fields::{FieldArg, FieldCatalog, FieldDescriptor, FieldFlags, FieldType};
pub use filtercheck::FieldCheck;
pub use loader::{LibraryRegistry, PluginLibrary};
pub use plugin::{
    Capabilities, EventParser, ExtractRequest, ExtractedValue, Plugin, PluginDescriptor,
};
pub use source::{BatchStatus, OpenParam, SourceInstance};
pub use state::registry::TableRegistry;
pub use state::{InMemoryTable, StateType, StateValue, Table, TableFieldInfo, TableInfo};
