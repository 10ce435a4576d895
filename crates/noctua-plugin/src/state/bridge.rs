//! FFI boundary for state tables.
//!
//! Everything that dereferences a raw pointer on behalf of the table ABI
//! lives here, in both directions:
//!
//! - host → plugin: any [`Table`] can be exposed to a plugin through the C
//!   vtables ([`fields_vtable`], [`reader_vtable`], [`writer_vtable`],
//!   [`tables_input`]) behind an opaque [`TableHandle`];
//! - plugin → host: a table published via `add_table` is wrapped into
//!   [`PluginTable`], a [`Table`] implementation backed by the plugin's own
//!   vtable, indistinguishable from a native table for every consumer.
//!
//! Handles given out here are scoped to the owning plugin: they are
//! released when the plugin is destroyed and must not be used afterwards.

use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::abi::{
    RawIterState, RawRc, RawTable, RawTableEntry, RawTableField, RawTableFieldInfo, RawTableInfo,
    RawTableInput, RawOwner, StateData, TableFieldsVtable, TableIterFn, TableReaderVtable,
    TableWriterVtable, RC_FAILURE, RC_SUCCESS,
};
use crate::error::{PluginError, Result};
use crate::plugin::Plugin;
use crate::state::{EntryId, FieldId, StateType, StateValue, Table, TableFieldInfo};

// ---------------------------------------------------------------------------
// scalar marshalling

/// Decode a value of the given type from ABI state data.
///
/// # Safety
/// `data` must carry the union member matching `ty`; for strings the
/// pointer must be a valid NUL-terminated buffer.
pub(crate) unsafe fn value_from_raw(ty: StateType, data: &StateData) -> Result<StateValue> {
    Ok(match ty {
        StateType::Bool => StateValue::Bool(data.b != 0),
        StateType::I8 => StateValue::I8(data.s8),
        StateType::I16 => StateValue::I16(data.s16),
        StateType::I32 => StateValue::I32(data.s32),
        StateType::I64 => StateValue::I64(data.s64),
        StateType::U8 => StateValue::U8(data.u8),
        StateType::U16 => StateValue::U16(data.u16),
        StateType::U32 => StateValue::U32(data.u32),
        StateType::U64 => StateValue::U64(data.u64),
        StateType::String => {
            if data.str.is_null() {
                return Err(PluginError::state("null string in table data"));
            }
            StateValue::String(CStr::from_ptr(data.str).to_string_lossy().into_owned())
        }
    })
}

/// Encode a value into ABI state data. String storage is written into
/// `str_buf`, which must outlive the returned data.
pub(crate) fn value_to_raw(value: &StateValue, str_buf: &mut CString) -> StateData {
    match value {
        StateValue::Bool(v) => StateData { b: u32::from(*v) },
        StateValue::I8(v) => StateData { s8: *v },
        StateValue::I16(v) => StateData { s16: *v },
        StateValue::I32(v) => StateData { s32: *v },
        StateValue::I64(v) => StateData { s64: *v },
        StateValue::U8(v) => StateData { u8: *v },
        StateValue::U16(v) => StateData { u16: *v },
        StateValue::U32(v) => StateData { u32: *v },
        StateValue::U64(v) => StateData { u64: *v },
        StateValue::String(v) => {
            *str_buf = CString::new(v.as_str()).unwrap_or_default();
            StateData {
                str: str_buf.as_ptr(),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// host tables exposed to plugins

// Entry and field ids are offset by one on the wire so that a null pointer
// never aliases a valid handle.
fn encode_id(id: usize) -> *mut RawTableEntry {
    (id + 1) as *mut RawTableEntry
}

fn decode_id(ptr: *mut RawTableEntry) -> Option<usize> {
    (ptr as usize).checked_sub(1)
}

struct FieldListCache {
    names: Vec<CString>,
    infos: Vec<RawTableFieldInfo>,
}

/// Opaque handle behind every `*mut RawTable` the host gives to a plugin.
///
/// Owned by the consuming plugin (one per accessed table name) and dropped
/// at plugin destruction.
pub(crate) struct TableHandle {
    table: Arc<dyn Table>,
    owner: *const Plugin,
    name: CString,
    fields: Mutex<FieldListCache>,
    // the last string value handed out by read_entry_field; the pointer
    // stays valid until the next read on this handle
    str_out: Mutex<CString>,
}

impl TableHandle {
    pub(crate) fn new(table: Arc<dyn Table>, owner: *const Plugin) -> Box<TableHandle> {
        let name = CString::new(table.name()).unwrap_or_default();
        Box::new(TableHandle {
            table,
            owner,
            name,
            fields: Mutex::new(FieldListCache {
                names: Vec::new(),
                infos: Vec::new(),
            }),
            str_out: Mutex::new(CString::default()),
        })
    }

    pub(crate) fn as_raw(&self) -> *mut RawTable {
        self as *const TableHandle as *mut RawTable
    }

    pub(crate) fn table(&self) -> &Arc<dyn Table> {
        &self.table
    }

    fn report(&self, err: PluginError) {
        if self.owner.is_null() {
            tracing::warn!(table = %self.table.name(), error = %err, "table operation failed");
        } else {
            // handles never outlive the plugin that owns them
            unsafe { (*self.owner).set_owner_error(err.to_string()) };
        }
    }
}

unsafe fn handle<'a>(t: *mut RawTable) -> &'a TableHandle {
    &*(t as *const TableHandle)
}

unsafe extern "C" fn host_get_name(t: *mut RawTable) -> *const c_char {
    handle(t).name.as_ptr()
}

unsafe extern "C" fn host_get_size(t: *mut RawTable) -> u64 {
    handle(t).table.entry_count() as u64
}

unsafe extern "C" fn host_list_fields(
    t: *mut RawTable,
    nfields: *mut u32,
) -> *const RawTableFieldInfo {
    let h = handle(t);
    let listing = h.table.list_fields();
    let mut cache = h.fields.lock();
    cache.names.clear();
    cache.infos.clear();
    for info in &listing {
        let name = CString::new(info.name.as_str()).unwrap_or_default();
        cache.infos.push(RawTableFieldInfo {
            name: name.as_ptr(),
            field_type: info.field_type.raw(),
        });
        cache.names.push(name);
    }
    *nfields = cache.infos.len() as u32;
    cache.infos.as_ptr()
}

unsafe extern "C" fn host_get_field(
    t: *mut RawTable,
    name: *const c_char,
    field_type: u32,
) -> *mut RawTableField {
    let h = handle(t);
    let (name, ty) = match (CStr::from_ptr(name).to_str(), StateType::from_raw(field_type)) {
        (Ok(name), Some(ty)) => (name, ty),
        _ => {
            h.report(PluginError::state("invalid field name or type"));
            return std::ptr::null_mut();
        }
    };
    match h.table.get_field(name, ty) {
        Ok(id) => encode_id(id),
        Err(err) => {
            h.report(err);
            std::ptr::null_mut()
        }
    }
}

unsafe extern "C" fn host_add_field(
    t: *mut RawTable,
    name: *const c_char,
    field_type: u32,
) -> *mut RawTableField {
    let h = handle(t);
    let (name, ty) = match (CStr::from_ptr(name).to_str(), StateType::from_raw(field_type)) {
        (Ok(name), Some(ty)) => (name, ty),
        _ => {
            h.report(PluginError::state("invalid field name or type"));
            return std::ptr::null_mut();
        }
    };
    match h.table.add_field(name, ty) {
        Ok(id) => encode_id(id),
        Err(err) => {
            h.report(err);
            std::ptr::null_mut()
        }
    }
}

unsafe extern "C" fn host_get_entry(t: *mut RawTable, key: *const StateData) -> *mut RawTableEntry {
    let h = handle(t);
    let key = match value_from_raw(h.table.key_type(), &*key) {
        Ok(key) => key,
        Err(err) => {
            h.report(err);
            return std::ptr::null_mut();
        }
    };
    match h.table.get_entry(&key) {
        Ok(Some(entry)) => encode_id(entry),
        // an absent row is not an error
        Ok(None) => std::ptr::null_mut(),
        Err(err) => {
            h.report(err);
            std::ptr::null_mut()
        }
    }
}

unsafe extern "C" fn host_read_entry_field(
    t: *mut RawTable,
    e: *mut RawTableEntry,
    f: *mut RawTableField,
    out: *mut StateData,
) -> RawRc {
    let h = handle(t);
    let (entry, field) = match (decode_id(e), decode_id(f)) {
        (Some(entry), Some(field)) => (entry, field),
        _ => {
            h.report(PluginError::state("null entry or field handle"));
            return RC_FAILURE;
        }
    };
    match h.table.read_field(entry, field) {
        Ok(value) => {
            let mut str_out = h.str_out.lock();
            *out = value_to_raw(&value, &mut str_out);
            RC_SUCCESS
        }
        Err(err) => {
            h.report(err);
            RC_FAILURE
        }
    }
}

unsafe extern "C" fn host_iterate_entries(
    t: *mut RawTable,
    it: TableIterFn,
    ctx: *mut RawIterState,
) -> u32 {
    let h = handle(t);
    match h
        .table
        .iterate(&mut |entry| it(ctx, encode_id(entry)) != 0)
    {
        Ok(completed) => u32::from(completed),
        Err(err) => {
            h.report(err);
            0
        }
    }
}

unsafe extern "C" fn host_clear(t: *mut RawTable) -> RawRc {
    let h = handle(t);
    match h.table.clear() {
        Ok(()) => RC_SUCCESS,
        Err(err) => {
            h.report(err);
            RC_FAILURE
        }
    }
}

unsafe extern "C" fn host_erase_entry(t: *mut RawTable, key: *const StateData) -> RawRc {
    let h = handle(t);
    let key = match value_from_raw(h.table.key_type(), &*key) {
        Ok(key) => key,
        Err(err) => {
            h.report(err);
            return RC_FAILURE;
        }
    };
    match h.table.erase_entry(&key) {
        Ok(()) => RC_SUCCESS,
        Err(err) => {
            h.report(err);
            RC_FAILURE
        }
    }
}

unsafe extern "C" fn host_add_entry(t: *mut RawTable, key: *const StateData) -> *mut RawTableEntry {
    let h = handle(t);
    let key = match value_from_raw(h.table.key_type(), &*key) {
        Ok(key) => key,
        Err(err) => {
            h.report(err);
            return std::ptr::null_mut();
        }
    };
    match h.table.add_entry(&key) {
        Ok(entry) => encode_id(entry),
        Err(err) => {
            h.report(err);
            std::ptr::null_mut()
        }
    }
}

unsafe extern "C" fn host_write_entry_field(
    t: *mut RawTable,
    e: *mut RawTableEntry,
    f: *mut RawTableField,
    v: *const StateData,
) -> RawRc {
    let h = handle(t);
    let (entry, field) = match (decode_id(e), decode_id(f)) {
        (Some(entry), Some(field)) => (entry, field),
        _ => {
            h.report(PluginError::state("null entry or field handle"));
            return RC_FAILURE;
        }
    };
    // the declared column type tells us which union member is live
    let ty = match h.table.field_type(field) {
        Ok(ty) => ty,
        Err(err) => {
            h.report(err);
            return RC_FAILURE;
        }
    };
    let value = match value_from_raw(ty, &*v) {
        Ok(value) => value,
        Err(err) => {
            h.report(err);
            return RC_FAILURE;
        }
    };
    match h.table.write_field(entry, field, &value) {
        Ok(()) => RC_SUCCESS,
        Err(err) => {
            h.report(err);
            RC_FAILURE
        }
    }
}

/// Field-discovery vtable over host-exposed table handles
pub(crate) fn fields_vtable() -> TableFieldsVtable {
    TableFieldsVtable {
        list_fields: Some(host_list_fields),
        get_field: Some(host_get_field),
        add_field: Some(host_add_field),
    }
}

/// Reader vtable over host-exposed table handles
pub(crate) fn reader_vtable() -> TableReaderVtable {
    TableReaderVtable {
        get_name: Some(host_get_name),
        get_size: Some(host_get_size),
        get_entry: Some(host_get_entry),
        read_entry_field: Some(host_read_entry_field),
        iterate_entries: Some(host_iterate_entries),
    }
}

/// Writer vtable over host-exposed table handles
pub(crate) fn writer_vtable() -> TableWriterVtable {
    TableWriterVtable {
        clear: Some(host_clear),
        erase_entry: Some(host_erase_entry),
        add_entry: Some(host_add_entry),
        write_entry_field: Some(host_write_entry_field),
    }
}

// ---------------------------------------------------------------------------
// top-level table access handed to plugin_init

unsafe extern "C" fn owner_list_tables(o: *mut RawOwner, ntables: *mut u32) -> *const RawTableInfo {
    let plugin = &*(o as *const Plugin);
    plugin.table_listing(&mut *ntables)
}

unsafe extern "C" fn owner_get_table(
    o: *mut RawOwner,
    name: *const c_char,
    key_type: u32,
) -> *mut RawTable {
    let plugin = &*(o as *const Plugin);
    let (name, ty) = match (CStr::from_ptr(name).to_str(), StateType::from_raw(key_type)) {
        (Ok(name), Some(ty)) => (name, ty),
        _ => {
            plugin.set_owner_error("get_table: invalid table name or key type");
            return std::ptr::null_mut();
        }
    };
    match plugin.access_table(name, ty) {
        Ok(raw) => raw,
        Err(err) => {
            plugin.set_owner_error(err.to_string());
            std::ptr::null_mut()
        }
    }
}

unsafe extern "C" fn owner_add_table(o: *mut RawOwner, input: *const RawTableInput) -> RawRc {
    let plugin = &*(o as *const Plugin);
    if input.is_null() {
        plugin.set_owner_error("add_table: null table input");
        return RC_FAILURE;
    }
    let table = match PluginTable::from_input(&*input) {
        Ok(table) => table,
        Err(err) => {
            plugin.set_owner_error(err.to_string());
            return RC_FAILURE;
        }
    };
    match plugin.publish_table(table) {
        Ok(()) => RC_SUCCESS,
        Err(err) => {
            plugin.set_owner_error(err.to_string());
            RC_FAILURE
        }
    }
}

/// Last-error callback given to plugins alongside every owner pointer
pub(crate) unsafe extern "C" fn owner_last_error(o: *mut RawOwner) -> *const c_char {
    let plugin = &*(o as *const Plugin);
    plugin.owner_error_ptr()
}

/// The top-level tables input handed to `plugin_init`
pub(crate) fn tables_input() -> crate::abi::TablesInput {
    crate::abi::TablesInput {
        list_tables: Some(owner_list_tables),
        get_table: Some(owner_get_table),
        add_table: Some(owner_add_table),
        fields: fields_vtable(),
    }
}

// ---------------------------------------------------------------------------
// plugin tables consumed by the host

/// A [`Table`] backed by a plugin's own vtable, captured from `add_table`.
///
/// The storage lives in the plugin; once the publishing plugin is
/// destroyed the wrapper is invalidated and every operation fails.
#[derive(Debug)]
pub(crate) struct PluginTable {
    name: String,
    key_type: StateType,
    raw: *mut RawTable,
    fields: TableFieldsVtable,
    reader: TableReaderVtable,
    writer: TableWriterVtable,
    alive: AtomicBool,
    // field handles resolved so far, with their declared types; needed to
    // decode reads
    field_types: Mutex<Vec<(FieldId, StateType)>>,
}

impl PluginTable {
    /// Validate and capture a plugin-published table input.
    ///
    /// # Safety
    /// `input` pointers must be valid; the vtable members must stay callable
    /// until the wrapper is invalidated.
    pub(crate) unsafe fn from_input(input: &RawTableInput) -> Result<PluginTable> {
        if input.name.is_null() {
            return Err(PluginError::state("add_table: table has no name"));
        }
        let name = CStr::from_ptr(input.name).to_string_lossy().into_owned();
        if name.is_empty() {
            return Err(PluginError::state("add_table: table has an empty name"));
        }
        let key_type = StateType::from_raw(input.key_type).ok_or_else(|| {
            PluginError::state(format!("add_table: table '{name}' has an unknown key type"))
        })?;
        let complete = input.fields.list_fields.is_some()
            && input.fields.get_field.is_some()
            && input.fields.add_field.is_some()
            && input.reader.get_size.is_some()
            && input.reader.get_entry.is_some()
            && input.reader.read_entry_field.is_some()
            && input.reader.iterate_entries.is_some()
            && input.writer.clear.is_some()
            && input.writer.erase_entry.is_some()
            && input.writer.add_entry.is_some()
            && input.writer.write_entry_field.is_some();
        if !complete {
            return Err(PluginError::state(format!(
                "add_table: table '{name}' is missing vtable entries"
            )));
        }
        Ok(PluginTable {
            name,
            key_type,
            raw: input.table,
            fields: input.fields,
            reader: input.reader,
            writer: input.writer,
            alive: AtomicBool::new(true),
            field_types: Mutex::new(Vec::new()),
        })
    }

    /// Cut off access after the publishing plugin is destroyed
    pub(crate) fn invalidate(&self) {
        self.alive.store(false, Ordering::Release);
    }

    fn check_alive(&self) -> Result<()> {
        if self.alive.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(PluginError::state(format!(
                "table '{}' is gone: its publishing plugin was destroyed",
                self.name
            )))
        }
    }

    fn field_type_of(&self, field: FieldId) -> Result<StateType> {
        self.field_types
            .lock()
            .iter()
            .find(|(id, _)| *id == field)
            .map(|(_, ty)| *ty)
            .ok_or_else(|| {
                PluginError::state(format!(
                    "table '{}': field handle was not resolved through this table",
                    self.name
                ))
            })
    }

    fn remember_field(&self, field: FieldId, ty: StateType) {
        let mut types = self.field_types.lock();
        if !types.iter().any(|(id, _)| *id == field) {
            types.push((field, ty));
        }
    }
}

impl Table for PluginTable {
    fn name(&self) -> &str {
        &self.name
    }

    fn key_type(&self) -> StateType {
        self.key_type
    }

    fn list_fields(&self) -> Vec<TableFieldInfo> {
        if self.check_alive().is_err() {
            return Vec::new();
        }
        let mut nfields: u32 = 0;
        // vtable completeness was checked at capture time
        let list = self.fields.list_fields.expect("checked at capture");
        let infos = unsafe { list(self.raw, &mut nfields) };
        if infos.is_null() {
            return Vec::new();
        }
        let mut out = Vec::with_capacity(nfields as usize);
        for i in 0..nfields as usize {
            let info = unsafe { &*infos.add(i) };
            let Some(field_type) = StateType::from_raw(info.field_type) else {
                continue;
            };
            if info.name.is_null() {
                continue;
            }
            let name = unsafe { CStr::from_ptr(info.name) }
                .to_string_lossy()
                .into_owned();
            out.push(TableFieldInfo { name, field_type });
        }
        out
    }

    fn get_field(&self, name: &str, field_type: StateType) -> Result<FieldId> {
        self.check_alive()?;
        let cname = CString::new(name)
            .map_err(|_| PluginError::state(format!("invalid field name '{name}'")))?;
        let get = self.fields.get_field.expect("checked at capture");
        let ptr = unsafe { get(self.raw, cname.as_ptr(), field_type.raw()) };
        if ptr.is_null() {
            return Err(PluginError::compatibility(format!(
                "table '{}' has no field '{}' of type {}",
                self.name,
                name,
                field_type.name()
            )));
        }
        let id = ptr as FieldId;
        self.remember_field(id, field_type);
        Ok(id)
    }

    fn add_field(&self, name: &str, field_type: StateType) -> Result<FieldId> {
        self.check_alive()?;
        let cname = CString::new(name)
            .map_err(|_| PluginError::state(format!("invalid field name '{name}'")))?;
        let add = self.fields.add_field.expect("checked at capture");
        let ptr = unsafe { add(self.raw, cname.as_ptr(), field_type.raw()) };
        if ptr.is_null() {
            return Err(PluginError::state(format!(
                "table '{}': could not add field '{}'",
                self.name, name
            )));
        }
        let id = ptr as FieldId;
        self.remember_field(id, field_type);
        Ok(id)
    }

    fn field_type(&self, field: FieldId) -> Result<StateType> {
        self.field_type_of(field)
    }

    fn entry_count(&self) -> usize {
        if self.check_alive().is_err() {
            return 0;
        }
        let get_size = self.reader.get_size.expect("checked at capture");
        unsafe { get_size(self.raw) as usize }
    }

    fn get_entry(&self, key: &StateValue) -> Result<Option<EntryId>> {
        self.check_alive()?;
        let mut str_buf = CString::default();
        let data = value_to_raw(key, &mut str_buf);
        let get_entry = self.reader.get_entry.expect("checked at capture");
        let ptr = unsafe { get_entry(self.raw, &data) };
        Ok((!ptr.is_null()).then_some(ptr as EntryId))
    }

    fn add_entry(&self, key: &StateValue) -> Result<EntryId> {
        self.check_alive()?;
        let mut str_buf = CString::default();
        let data = value_to_raw(key, &mut str_buf);
        let add_entry = self.writer.add_entry.expect("checked at capture");
        let ptr = unsafe { add_entry(self.raw, &data) };
        if ptr.is_null() {
            return Err(PluginError::runtime(format!(
                "table '{}': add_entry failed",
                self.name
            )));
        }
        Ok(ptr as EntryId)
    }

    fn erase_entry(&self, key: &StateValue) -> Result<()> {
        self.check_alive()?;
        let mut str_buf = CString::default();
        let data = value_to_raw(key, &mut str_buf);
        let erase = self.writer.erase_entry.expect("checked at capture");
        if unsafe { erase(self.raw, &data) } != RC_SUCCESS {
            return Err(PluginError::runtime(format!(
                "table '{}': erase_entry failed",
                self.name
            )));
        }
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.check_alive()?;
        let clear = self.writer.clear.expect("checked at capture");
        if unsafe { clear(self.raw) } != RC_SUCCESS {
            return Err(PluginError::runtime(format!(
                "table '{}': clear failed",
                self.name
            )));
        }
        Ok(())
    }

    fn read_field(&self, entry: EntryId, field: FieldId) -> Result<StateValue> {
        self.check_alive()?;
        let ty = self.field_type_of(field)?;
        let mut out = StateData { u64: 0 };
        let read = self.reader.read_entry_field.expect("checked at capture");
        let rc = unsafe {
            read(
                self.raw,
                entry as *mut RawTableEntry,
                field as *mut RawTableField,
                &mut out,
            )
        };
        if rc != RC_SUCCESS {
            return Err(PluginError::runtime(format!(
                "table '{}': read_entry_field failed",
                self.name
            )));
        }
        unsafe { value_from_raw(ty, &out) }
    }

    fn write_field(&self, entry: EntryId, field: FieldId, value: &StateValue) -> Result<()> {
        self.check_alive()?;
        let ty = self.field_type_of(field)?;
        if value.state_type() != ty {
            return Err(PluginError::compatibility(format!(
                "table '{}': cannot write {} into field of type {}",
                self.name,
                value.state_type().name(),
                ty.name()
            )));
        }
        let mut str_buf = CString::default();
        let data = value_to_raw(value, &mut str_buf);
        let write = self.writer.write_entry_field.expect("checked at capture");
        let rc = unsafe {
            write(
                self.raw,
                entry as *mut RawTableEntry,
                field as *mut RawTableField,
                &data,
            )
        };
        if rc != RC_SUCCESS {
            return Err(PluginError::runtime(format!(
                "table '{}': write_entry_field failed",
                self.name
            )));
        }
        Ok(())
    }

    fn iterate(&self, visit: &mut dyn FnMut(EntryId) -> bool) -> Result<bool> {
        self.check_alive()?;
        unsafe extern "C" fn trampoline(
            ctx: *mut RawIterState,
            entry: *mut RawTableEntry,
        ) -> u32 {
            let visit = &mut *(ctx as *mut &mut dyn FnMut(EntryId) -> bool);
            u32::from(visit(entry as EntryId))
        }
        let mut cb: &mut dyn FnMut(EntryId) -> bool = visit;
        let ctx = &mut cb as *mut &mut dyn FnMut(EntryId) -> bool as *mut RawIterState;
        let iterate = self.reader.iterate_entries.expect("checked at capture");
        Ok(unsafe { iterate(self.raw, trampoline, ctx) } != 0)
    }
}
