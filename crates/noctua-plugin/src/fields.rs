//! Field declarations exported by extraction-capable plugins.
//!
//! Plugins publish their filter fields as a JSON array; this module parses
//! that into a typed, flagged [`FieldCatalog`] consumable by the filter
//! engine, and can re-emit the catalog in canonical form.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::error::{PluginError, Result};

/// Value type of an extracted field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    String,
    Uint64,
    Bool,
    RelTime,
    AbsTime,
    Ipv4Addr,
    Ipv4Net,
    Ipv6Addr,
    Ipv6Net,
    IpNet,
}

impl FieldType {
    /// Parse the type name used in field declaration JSON
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "string" => FieldType::String,
            "uint64" => FieldType::Uint64,
            "bool" => FieldType::Bool,
            "reltime" => FieldType::RelTime,
            "abstime" => FieldType::AbsTime,
            "ipv4addr" => FieldType::Ipv4Addr,
            "ipv4net" => FieldType::Ipv4Net,
            "ipv6addr" => FieldType::Ipv6Addr,
            "ipv6net" => FieldType::Ipv6Net,
            "ipnet" => FieldType::IpNet,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Uint64 => "uint64",
            FieldType::Bool => "bool",
            FieldType::RelTime => "reltime",
            FieldType::AbsTime => "abstime",
            FieldType::Ipv4Addr => "ipv4addr",
            FieldType::Ipv4Net => "ipv4net",
            FieldType::Ipv6Addr => "ipv6addr",
            FieldType::Ipv6Net => "ipv6net",
            FieldType::IpNet => "ipnet",
        }
    }

    /// Tag used for this type on the extraction ABI
    pub fn raw(self) -> u32 {
        match self {
            FieldType::String => 1,
            FieldType::Uint64 => 2,
            FieldType::Bool => 3,
            FieldType::RelTime => 4,
            FieldType::AbsTime => 5,
            FieldType::Ipv4Addr => 6,
            FieldType::Ipv4Net => 7,
            FieldType::Ipv6Addr => 8,
            FieldType::Ipv6Net => 9,
            FieldType::IpNet => 10,
        }
    }
}

/// Parsed bracket argument of a field reference
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum FieldArg {
    /// No argument supplied
    #[default]
    None,
    /// Numeric index argument, e.g. `plugin.foo[3]`
    Index(u64),
    /// Verbatim key argument, e.g. `plugin.bar[my-key]`
    Key(String),
    /// A field declaring both index and key receives the parsed index and
    /// the verbatim string side by side
    Both(u64, String),
}

bitflags! {
    /// Behavior flags attached to a field declaration
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FieldFlags: u32 {
        /// The field extracts a list of values
        const IS_LIST = 1 << 0;
        /// A bracketed argument may be supplied
        const ARG_ALLOWED = 1 << 1;
        /// A bracketed argument must be supplied
        const ARG_REQUIRED = 1 << 2;
        /// The argument is a numeric index
        const ARG_INDEX = 1 << 3;
        /// The argument is a free-form key
        const ARG_KEY = 1 << 4;
        /// Usable in table output only, hidden from filters listings
        const TABLE_ONLY = 1 << 5;
        /// Informational field
        const INFO = 1 << 6;
        /// Part of a conversation aggregate
        const CONVERSATION = 1 << 7;
    }
}

/// One parsed field declaration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescriptor {
    pub name: String,
    pub display: String,
    pub description: String,
    pub field_type: FieldType,
    pub flags: FieldFlags,
}

impl FieldDescriptor {
    pub fn has_flag(&self, flag: FieldFlags) -> bool {
        self.flags.contains(flag)
    }

    fn to_decl(&self) -> FieldDecl {
        let arg = if self
            .flags
            .intersects(FieldFlags::ARG_REQUIRED | FieldFlags::ARG_INDEX | FieldFlags::ARG_KEY)
        {
            Some(ArgDecl {
                is_required: self.has_flag(FieldFlags::ARG_REQUIRED),
                is_index: self.has_flag(FieldFlags::ARG_INDEX),
                is_key: self.has_flag(FieldFlags::ARG_KEY),
            })
        } else {
            None
        };

        let mut properties = Vec::new();
        if self.has_flag(FieldFlags::TABLE_ONLY) {
            properties.push("hidden".to_string());
        }
        if self.has_flag(FieldFlags::INFO) {
            properties.push("info".to_string());
        }
        if self.has_flag(FieldFlags::CONVERSATION) {
            properties.push("conversation".to_string());
        }

        FieldDecl {
            name: self.name.clone(),
            field_type: self.field_type.as_str().to_string(),
            desc: self.description.clone(),
            display: if self.display.is_empty() {
                None
            } else {
                Some(self.display.clone())
            },
            is_list: self.has_flag(FieldFlags::IS_LIST),
            arg,
            properties,
        }
    }
}

/// Wire form of one field declaration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct FieldDecl {
    name: String,
    #[serde(rename = "type")]
    field_type: String,
    desc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    display: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    is_list: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    arg: Option<ArgDecl>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    properties: Vec<String>,
}

/// Wire form of a field's `arg` object
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct ArgDecl {
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    is_required: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    is_index: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    is_key: bool,
}

/// The typed catalog of every field a plugin exports
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldCatalog {
    fields: Vec<FieldDescriptor>,
}

impl FieldCatalog {
    /// Parse the field declaration JSON returned by `plugin_get_fields`.
    ///
    /// Violations are fatal and name both the plugin and the offending
    /// field.
    pub fn parse(plugin_name: &str, json: &str) -> Result<Self> {
        let root: serde_json::Value = serde_json::from_str(json).map_err(|e| {
            PluginError::descriptor(format!(
                "plugin '{plugin_name}': get_fields returned invalid JSON: {e}"
            ))
        })?;
        let entries = root.as_array().ok_or_else(|| {
            PluginError::descriptor(format!(
                "plugin '{plugin_name}': get_fields did not return a JSON array"
            ))
        })?;

        let mut fields = Vec::with_capacity(entries.len());
        for entry in entries {
            let fname = entry
                .get("name")
                .and_then(|v| v.as_str())
                .unwrap_or("<unnamed>")
                .to_string();
            let decl: FieldDecl = serde_json::from_value(entry.clone()).map_err(|e| {
                PluginError::descriptor(format!(
                    "plugin '{plugin_name}': field '{fname}': invalid declaration: {e}"
                ))
            })?;
            fields.push(Self::build_field(plugin_name, decl)?);
        }
        Ok(Self { fields })
    }

    fn build_field(plugin_name: &str, decl: FieldDecl) -> Result<FieldDescriptor> {
        if decl.name.is_empty() {
            return Err(PluginError::descriptor(format!(
                "plugin '{plugin_name}': field JSON entry has no name"
            )));
        }
        if decl.field_type.is_empty() {
            return Err(PluginError::descriptor(format!(
                "plugin '{plugin_name}': field '{}' has no type",
                decl.name
            )));
        }
        if decl.desc.is_empty() {
            return Err(PluginError::descriptor(format!(
                "plugin '{plugin_name}': field '{}' has no desc",
                decl.name
            )));
        }
        let field_type = FieldType::parse(&decl.field_type).ok_or_else(|| {
            PluginError::descriptor(format!(
                "plugin '{plugin_name}': field '{}' has invalid field type '{}'",
                decl.name, decl.field_type
            ))
        })?;

        let mut flags = FieldFlags::empty();
        if decl.is_list {
            flags |= FieldFlags::IS_LIST;
        }
        if let Some(arg) = &decl.arg {
            if arg.is_required {
                flags |= FieldFlags::ARG_REQUIRED;
            }
            // index or key implies that an argument is allowed
            if arg.is_index {
                flags |= FieldFlags::ARG_INDEX | FieldFlags::ARG_ALLOWED;
            }
            if arg.is_key {
                flags |= FieldFlags::ARG_KEY | FieldFlags::ARG_ALLOWED;
            }
        }
        if flags.contains(FieldFlags::ARG_REQUIRED)
            && !flags.intersects(FieldFlags::ARG_INDEX | FieldFlags::ARG_KEY)
        {
            return Err(PluginError::descriptor(format!(
                "plugin '{plugin_name}': field '{}' arg has isRequired true, but none of isKey nor isIndex is true",
                decl.name
            )));
        }

        for prop in &decl.properties {
            // unrecognized property values are ignored
            match prop.as_str() {
                "hidden" => flags |= FieldFlags::TABLE_ONLY,
                "info" => flags |= FieldFlags::INFO,
                "conversation" => flags |= FieldFlags::CONVERSATION,
                _ => {}
            }
        }

        Ok(FieldDescriptor {
            name: decl.name,
            display: decl.display.unwrap_or_default(),
            description: decl.desc,
            field_type,
            flags,
        })
    }

    /// Field at the given id (its position in the declaration array)
    pub fn get(&self, id: usize) -> Option<&FieldDescriptor> {
        self.fields.get(id)
    }

    /// Locate a field by its exact name
    pub fn find(&self, name: &str) -> Option<(usize, &FieldDescriptor)> {
        self.fields
            .iter()
            .enumerate()
            .find(|(_, f)| f.name == name)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FieldDescriptor> {
        self.fields.iter()
    }

    /// Re-emit the catalog in canonical JSON form. Parsing the result yields
    /// an equal catalog.
    pub fn to_json(&self) -> String {
        let decls: Vec<FieldDecl> = self.fields.iter().map(|f| f.to_decl()).collect();
        serde_json::to_string(&decls).expect("field declarations always serialize")
    }
}
