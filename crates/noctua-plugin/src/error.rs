//! Error types for the plugin host.
//!
//! Every failure surfaced by this crate is a [`PluginError`]; messages carry
//! the plugin name whenever one is known. Per-event incompatibilities in the
//! extraction/parsing hot path are *not* errors: those surface as `Ok(None)`
//! or `Ok(false)` from the respective adapters.

use thiserror::Error;

/// Result type alias for plugin host operations
pub type Result<T> = std::result::Result<T, PluginError>;

/// Error type for all plugin host operations
#[derive(Debug, Error)]
pub enum PluginError {
    /// Library open failed, a required symbol is missing, or the plugin's
    /// required API version is outside the host's supported range
    #[error("load error: {0}")]
    Load(String),

    /// The init configuration does not satisfy the plugin's JSON Schema
    #[error("schema error: {0}")]
    Schema(String),

    /// The plugin's `init` entry point returned failure
    #[error("init error: {0}")]
    Init(String),

    /// An operation was attempted in the wrong lifecycle state
    #[error("state error: {0}")]
    State(String),

    /// Malformed field declaration JSON or a field invariant violation
    #[error("field descriptor error: {0}")]
    Descriptor(String),

    /// Capability not declared, or a table key-type mismatch
    #[error("compatibility error: {0}")]
    Compatibility(String),

    /// Malformed, missing or disallowed field argument
    #[error("argument error: {0}")]
    Argument(String),

    /// A plugin call returned non-success; carries the plugin's own
    /// `get_last_error` text when available
    #[error("plugin runtime error: {0}")]
    Runtime(String),
}

impl PluginError {
    /// Create a load error
    pub fn load(msg: impl Into<String>) -> Self {
        Self::Load(msg.into())
    }

    /// Create a schema validation error
    pub fn schema(msg: impl Into<String>) -> Self {
        Self::Schema(msg.into())
    }

    /// Create an init error
    pub fn init(msg: impl Into<String>) -> Self {
        Self::Init(msg.into())
    }

    /// Create a lifecycle state error
    pub fn state(msg: impl Into<String>) -> Self {
        Self::State(msg.into())
    }

    /// Create a field descriptor error
    pub fn descriptor(msg: impl Into<String>) -> Self {
        Self::Descriptor(msg.into())
    }

    /// Create a compatibility error
    pub fn compatibility(msg: impl Into<String>) -> Self {
        Self::Compatibility(msg.into())
    }

    /// Create a field argument error
    pub fn argument(msg: impl Into<String>) -> Self {
        Self::Argument(msg.into())
    }

    /// Create a plugin runtime error
    pub fn runtime(msg: impl Into<String>) -> Self {
        Self::Runtime(msg.into())
    }

    /// Whether this error is fatal for the plugin as a whole (the caller
    /// should skip the plugin rather than retry the operation)
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Load(_) | Self::Descriptor(_) | Self::Schema(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PluginError::load("plugin 'demo': missing symbol plugin_init");
        assert_eq!(
            err.to_string(),
            "load error: plugin 'demo': missing symbol plugin_init"
        );
    }

    #[test]
    fn test_fatal_classification() {
        assert!(PluginError::load("x").is_fatal());
        assert!(PluginError::descriptor("x").is_fatal());
        assert!(PluginError::schema("x").is_fatal());
        assert!(!PluginError::runtime("x").is_fatal());
        assert!(!PluginError::argument("x").is_fatal());
    }
}
