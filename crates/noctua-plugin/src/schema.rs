//! Init-config validation against a plugin-supplied JSON Schema.

use jsonschema::JSONSchema;

use crate::error::{PluginError, Result};

/// Validate an init configuration against the schema returned by
/// `plugin_get_init_schema`.
///
/// An empty config is treated as `{}`. Returns the effective config string
/// to pass to the plugin; on failure, reports the first validation error
/// with its instance path.
pub fn validate_init_config(plugin_name: &str, schema: &str, config: &str) -> Result<String> {
    let schema_json: serde_json::Value = serde_json::from_str(schema).map_err(|e| {
        PluginError::schema(format!(
            "plugin '{plugin_name}': get_init_schema did not return valid JSON: {e}"
        ))
    })?;
    if !schema_json.is_object() {
        return Err(PluginError::schema(format!(
            "plugin '{plugin_name}': get_init_schema did not return a JSON object"
        )));
    }

    let effective = if config.is_empty() { "{}" } else { config };
    let config_json: serde_json::Value = serde_json::from_str(effective).map_err(|e| {
        PluginError::schema(format!(
            "plugin '{plugin_name}': init config is not valid JSON: {e}"
        ))
    })?;

    let compiled = JSONSchema::compile(&schema_json).map_err(|e| {
        PluginError::schema(format!(
            "plugin '{plugin_name}': get_init_schema returned an invalid schema: {e}"
        ))
    })?;

    if let Err(mut errors) = compiled.validate(&config_json) {
        // report only the top-most error
        if let Some(first) = errors.next() {
            let path = first.instance_path.to_string();
            let location = if path.is_empty() { "<root>" } else { path.as_str() };
            return Err(PluginError::schema(format!(
                "plugin '{plugin_name}' init config: in {location}, {first}"
            )));
        }
        return Err(PluginError::schema(format!(
            "plugin '{plugin_name}' init config: failed validating against the provided schema"
        )));
    }

    Ok(effective.to_string())
}
