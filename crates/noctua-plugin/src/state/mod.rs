//! Shared state tables exchanged between the host and plugins.
//!
//! A table is a named, keyed, in-memory relation with typed columns. Tables
//! published by the host (or by one plugin) are visible to every other
//! plugin through the registry; host-native and plugin-provided tables are
//! interchangeable behind the [`Table`] trait.

pub(crate) mod bridge;
pub mod registry;

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::abi;
use crate::error::{PluginError, Result};

/// Identifier of a table column; stable for the lifetime of the table
pub type FieldId = usize;

/// Identifier of a table row; meaning is private to each table
/// implementation and never zero
pub type EntryId = usize;

/// The scalar types a table key or column may take
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateType {
    Bool,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    String,
}

impl StateType {
    /// Tag used for this type on the table ABI
    pub fn raw(self) -> u32 {
        match self {
            StateType::Bool => abi::ST_BOOL,
            StateType::I8 => abi::ST_INT8,
            StateType::I16 => abi::ST_INT16,
            StateType::I32 => abi::ST_INT32,
            StateType::I64 => abi::ST_INT64,
            StateType::U8 => abi::ST_UINT8,
            StateType::U16 => abi::ST_UINT16,
            StateType::U32 => abi::ST_UINT32,
            StateType::U64 => abi::ST_UINT64,
            StateType::String => abi::ST_STRING,
        }
    }

    pub fn from_raw(v: u32) -> Option<Self> {
        Some(match v {
            abi::ST_BOOL => StateType::Bool,
            abi::ST_INT8 => StateType::I8,
            abi::ST_INT16 => StateType::I16,
            abi::ST_INT32 => StateType::I32,
            abi::ST_INT64 => StateType::I64,
            abi::ST_UINT8 => StateType::U8,
            abi::ST_UINT16 => StateType::U16,
            abi::ST_UINT32 => StateType::U32,
            abi::ST_UINT64 => StateType::U64,
            abi::ST_STRING => StateType::String,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            StateType::Bool => "bool",
            StateType::I8 => "int8",
            StateType::I16 => "int16",
            StateType::I32 => "int32",
            StateType::I64 => "int64",
            StateType::U8 => "uint8",
            StateType::U16 => "uint16",
            StateType::U32 => "uint32",
            StateType::U64 => "uint64",
            StateType::String => "string",
        }
    }
}

/// A dynamically-typed scalar value stored in a table
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StateValue {
    Bool(bool),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    String(String),
}

impl StateValue {
    pub fn state_type(&self) -> StateType {
        match self {
            StateValue::Bool(_) => StateType::Bool,
            StateValue::I8(_) => StateType::I8,
            StateValue::I16(_) => StateType::I16,
            StateValue::I32(_) => StateType::I32,
            StateValue::I64(_) => StateType::I64,
            StateValue::U8(_) => StateType::U8,
            StateValue::U16(_) => StateType::U16,
            StateValue::U32(_) => StateType::U32,
            StateValue::U64(_) => StateType::U64,
            StateValue::String(_) => StateType::String,
        }
    }

    /// The zero value of the given type
    pub fn default_of(ty: StateType) -> Self {
        match ty {
            StateType::Bool => StateValue::Bool(false),
            StateType::I8 => StateValue::I8(0),
            StateType::I16 => StateValue::I16(0),
            StateType::I32 => StateValue::I32(0),
            StateType::I64 => StateValue::I64(0),
            StateType::U8 => StateValue::U8(0),
            StateType::U16 => StateValue::U16(0),
            StateType::U32 => StateValue::U32(0),
            StateType::U64 => StateValue::U64(0),
            StateType::String => StateValue::String(String::new()),
        }
    }
}

/// Identity of one table column
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableFieldInfo {
    pub name: String,
    pub field_type: StateType,
}

/// Identity of one registered table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableInfo {
    pub name: String,
    pub key_type: StateType,
}

/// A keyed, typed, in-memory relation shared across the plugin boundary.
///
/// Implementations use interior mutability: every operation takes `&self`
/// so tables can be shared through `Arc` by the registry, the bridge and
/// host code alike.
pub trait Table: std::fmt::Debug {
    fn name(&self) -> &str;
    fn key_type(&self) -> StateType;

    fn list_fields(&self) -> Vec<TableFieldInfo>;
    fn get_field(&self, name: &str, field_type: StateType) -> Result<FieldId>;
    fn add_field(&self, name: &str, field_type: StateType) -> Result<FieldId>;
    /// Declared type of a field previously resolved through this table
    fn field_type(&self, field: FieldId) -> Result<StateType>;

    fn entry_count(&self) -> usize;
    fn get_entry(&self, key: &StateValue) -> Result<Option<EntryId>>;
    /// Create a row for the key, or return the existing one
    fn add_entry(&self, key: &StateValue) -> Result<EntryId>;
    fn erase_entry(&self, key: &StateValue) -> Result<()>;
    fn clear(&self) -> Result<()>;

    fn read_field(&self, entry: EntryId, field: FieldId) -> Result<StateValue>;
    fn write_field(&self, entry: EntryId, field: FieldId, value: &StateValue) -> Result<()>;

    /// Visit every row until the callback returns `false`. Returns whether
    /// the iteration ran to completion.
    fn iterate(&self, visit: &mut dyn FnMut(EntryId) -> bool) -> Result<bool>;
}

#[derive(Debug)]
struct Row {
    key: StateValue,
    values: Vec<StateValue>,
}

#[derive(Default, Debug)]
struct TableData {
    columns: Vec<TableFieldInfo>,
    index: HashMap<StateValue, usize>,
    rows: Vec<Option<Row>>,
    free: Vec<usize>,
}

/// Host-native [`Table`] backed by a hash index over slab-allocated rows
#[derive(Debug)]
pub struct InMemoryTable {
    name: String,
    key_type: StateType,
    data: RwLock<TableData>,
}

impl InMemoryTable {
    pub fn new(name: impl Into<String>, key_type: StateType) -> Self {
        Self {
            name: name.into(),
            key_type,
            data: RwLock::new(TableData::default()),
        }
    }

    /// Declare a column up front; equivalent to [`Table::add_field`]
    pub fn with_field(self, name: impl Into<String>, field_type: StateType) -> Self {
        self.data.write().columns.push(TableFieldInfo {
            name: name.into(),
            field_type,
        });
        self
    }

    fn check_key(&self, key: &StateValue) -> Result<()> {
        if key.state_type() != self.key_type {
            return Err(PluginError::compatibility(format!(
                "table '{}': key has type {}, expected {}",
                self.name,
                key.state_type().name(),
                self.key_type.name()
            )));
        }
        Ok(())
    }

    fn slot(&self, entry: EntryId) -> Result<usize> {
        entry.checked_sub(1).ok_or_else(|| {
            PluginError::state(format!("table '{}': invalid entry handle", self.name))
        })
    }
}

impl Table for InMemoryTable {
    fn name(&self) -> &str {
        &self.name
    }

    fn key_type(&self) -> StateType {
        self.key_type
    }

    fn list_fields(&self) -> Vec<TableFieldInfo> {
        self.data.read().columns.clone()
    }

    fn get_field(&self, name: &str, field_type: StateType) -> Result<FieldId> {
        let data = self.data.read();
        let (id, column) = data
            .columns
            .iter()
            .enumerate()
            .find(|(_, c)| c.name == name)
            .ok_or_else(|| {
                PluginError::compatibility(format!(
                    "table '{}' has no field '{}'",
                    self.name, name
                ))
            })?;
        if column.field_type != field_type {
            return Err(PluginError::compatibility(format!(
                "table '{}': field '{}' has type {}, not {}",
                self.name,
                name,
                column.field_type.name(),
                field_type.name()
            )));
        }
        Ok(id)
    }

    fn add_field(&self, name: &str, field_type: StateType) -> Result<FieldId> {
        let mut data = self.data.write();
        if let Some((id, column)) = data
            .columns
            .iter()
            .enumerate()
            .find(|(_, c)| c.name == name)
        {
            if column.field_type != field_type {
                return Err(PluginError::compatibility(format!(
                    "table '{}': field '{}' already defined with type {}",
                    self.name,
                    name,
                    column.field_type.name()
                )));
            }
            return Ok(id);
        }
        data.columns.push(TableFieldInfo {
            name: name.to_string(),
            field_type,
        });
        let id = data.columns.len() - 1;
        // backfill existing rows with the zero value
        let default = StateValue::default_of(field_type);
        for row in data.rows.iter_mut().flatten() {
            row.values.push(default.clone());
        }
        Ok(id)
    }

    fn field_type(&self, field: FieldId) -> Result<StateType> {
        self.data
            .read()
            .columns
            .get(field)
            .map(|c| c.field_type)
            .ok_or_else(|| {
                PluginError::state(format!("table '{}': invalid field handle", self.name))
            })
    }

    fn entry_count(&self) -> usize {
        self.data.read().index.len()
    }

    fn get_entry(&self, key: &StateValue) -> Result<Option<EntryId>> {
        self.check_key(key)?;
        Ok(self.data.read().index.get(key).map(|slot| slot + 1))
    }

    fn add_entry(&self, key: &StateValue) -> Result<EntryId> {
        self.check_key(key)?;
        let mut data = self.data.write();
        if let Some(slot) = data.index.get(key) {
            return Ok(slot + 1);
        }
        let values: Vec<StateValue> = data
            .columns
            .iter()
            .map(|c| StateValue::default_of(c.field_type))
            .collect();
        let row = Row {
            key: key.clone(),
            values,
        };
        let slot = match data.free.pop() {
            Some(slot) => {
                data.rows[slot] = Some(row);
                slot
            }
            None => {
                data.rows.push(Some(row));
                data.rows.len() - 1
            }
        };
        data.index.insert(key.clone(), slot);
        Ok(slot + 1)
    }

    fn erase_entry(&self, key: &StateValue) -> Result<()> {
        self.check_key(key)?;
        let mut data = self.data.write();
        let slot = data.index.remove(key).ok_or_else(|| {
            PluginError::state(format!(
                "table '{}': no entry for the given key",
                self.name
            ))
        })?;
        data.rows[slot] = None;
        data.free.push(slot);
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let mut data = self.data.write();
        data.index.clear();
        data.rows.clear();
        data.free.clear();
        Ok(())
    }

    fn read_field(&self, entry: EntryId, field: FieldId) -> Result<StateValue> {
        let slot = self.slot(entry)?;
        let data = self.data.read();
        let row = data.rows.get(slot).and_then(|r| r.as_ref()).ok_or_else(|| {
            PluginError::state(format!("table '{}': stale entry handle", self.name))
        })?;
        row.values.get(field).cloned().ok_or_else(|| {
            PluginError::state(format!("table '{}': invalid field handle", self.name))
        })
    }

    fn write_field(&self, entry: EntryId, field: FieldId, value: &StateValue) -> Result<()> {
        let slot = self.slot(entry)?;
        let mut data = self.data.write();
        let expected = data
            .columns
            .get(field)
            .ok_or_else(|| {
                PluginError::state(format!("table '{}': invalid field handle", self.name))
            })?
            .field_type;
        if value.state_type() != expected {
            return Err(PluginError::compatibility(format!(
                "table '{}': cannot write {} into field of type {}",
                self.name,
                value.state_type().name(),
                expected.name()
            )));
        }
        let row = data.rows.get_mut(slot).and_then(|r| r.as_mut()).ok_or_else(|| {
            PluginError::state(format!("table '{}': stale entry handle", self.name))
        })?;
        row.values[field] = value.clone();
        Ok(())
    }

    fn iterate(&self, visit: &mut dyn FnMut(EntryId) -> bool) -> Result<bool> {
        // snapshot the live handles so the callback may read or write rows
        let entries: Vec<EntryId> = {
            let data = self.data.read();
            data.rows
                .iter()
                .enumerate()
                .filter(|(_, r)| r.is_some())
                .map(|(slot, _)| slot + 1)
                .collect()
        };
        for entry in entries {
            if !visit(entry) {
                return Ok(false);
            }
        }
        Ok(true)
    }
}
