//! End-to-end tests driving fake in-process plugins through the host.
//!
//! The plugins here are real `PluginApi` vtables backed by extern "C"
//! functions, exercising the same code paths a dynamic library would:
//! load, schema-validated init, sourcing, extraction, parsing with table
//! writes, table publication and cross-plugin table access.

use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use noctua_plugin::abi::{
    EventParseInput, FieldExtractInput, InitInput, PluginApi, RawEvent, RawEventInput,
    RawInstanceState, RawIterState, RawPluginState, RawRc, RawTable, RawTableEntry,
    RawTableField, RawTableFieldInfo, RawTableInput, StateData, TableFieldsVtable,
    TableReaderVtable, TableWriterVtable, CAP_EXTRACTION_BIT, CAP_PARSING_BIT, CAP_SOURCING_BIT,
    RC_EOF, RC_FAILURE, RC_SUCCESS, SCHEMA_JSON, ST_STRING, ST_UINT64,
};
use noctua_plugin::event::encode_event;
use noctua_plugin::{
    BatchStatus, Capabilities, EventInput, EventParser, FieldCheck, Plugin, PluginError,
    StateType, StateValue, TableRegistry,
};

// ---------------------------------------------------------------------------
// a fake table published by the sniff plugin ("conn_stats": u64 -> count u64)

struct FakeTable {
    fields: [RawTableFieldInfo; 1],
    entries: Mutex<Vec<(u64, u64)>>,
}

impl FakeTable {
    fn new() -> Box<FakeTable> {
        Box::new(FakeTable {
            fields: [RawTableFieldInfo {
                name: c"count".as_ptr(),
                field_type: ST_UINT64,
            }],
            entries: Mutex::new(Vec::new()),
        })
    }
}

unsafe fn fake_table<'a>(t: *mut RawTable) -> &'a FakeTable {
    &*(t as *const FakeTable)
}

const COUNT_FIELD: *mut RawTableField = 1 as *mut RawTableField;

unsafe extern "C" fn ft_list_fields(
    t: *mut RawTable,
    nfields: *mut u32,
) -> *const RawTableFieldInfo {
    *nfields = 1;
    fake_table(t).fields.as_ptr()
}

unsafe extern "C" fn ft_get_field(
    _t: *mut RawTable,
    name: *const c_char,
    field_type: u32,
) -> *mut RawTableField {
    if CStr::from_ptr(name).to_str() == Ok("count") && field_type == ST_UINT64 {
        COUNT_FIELD
    } else {
        std::ptr::null_mut()
    }
}

unsafe extern "C" fn ft_get_size(t: *mut RawTable) -> u64 {
    fake_table(t).entries.lock().unwrap().len() as u64
}

unsafe extern "C" fn ft_get_entry(t: *mut RawTable, key: *const StateData) -> *mut RawTableEntry {
    let key = (*key).u64;
    let entries = fake_table(t).entries.lock().unwrap();
    match entries.iter().position(|(k, _)| *k == key) {
        Some(idx) => (idx + 1) as *mut RawTableEntry,
        None => std::ptr::null_mut(),
    }
}

unsafe extern "C" fn ft_read_entry_field(
    t: *mut RawTable,
    e: *mut RawTableEntry,
    f: *mut RawTableField,
    out: *mut StateData,
) -> RawRc {
    if f != COUNT_FIELD {
        return RC_FAILURE;
    }
    let entries = fake_table(t).entries.lock().unwrap();
    match entries.get((e as usize).wrapping_sub(1)) {
        Some((_, count)) => {
            (*out).u64 = *count;
            RC_SUCCESS
        }
        None => RC_FAILURE,
    }
}

unsafe extern "C" fn ft_iterate_entries(
    t: *mut RawTable,
    it: noctua_plugin::abi::TableIterFn,
    ctx: *mut RawIterState,
) -> u32 {
    let count = fake_table(t).entries.lock().unwrap().len();
    for idx in 0..count {
        if it(ctx, (idx + 1) as *mut RawTableEntry) == 0 {
            return 0;
        }
    }
    1
}

unsafe extern "C" fn ft_clear(t: *mut RawTable) -> RawRc {
    fake_table(t).entries.lock().unwrap().clear();
    RC_SUCCESS
}

unsafe extern "C" fn ft_erase_entry(t: *mut RawTable, key: *const StateData) -> RawRc {
    let key = (*key).u64;
    let mut entries = fake_table(t).entries.lock().unwrap();
    match entries.iter().position(|(k, _)| *k == key) {
        Some(idx) => {
            entries.remove(idx);
            RC_SUCCESS
        }
        None => RC_FAILURE,
    }
}

unsafe extern "C" fn ft_add_entry(t: *mut RawTable, key: *const StateData) -> *mut RawTableEntry {
    let key = (*key).u64;
    let mut entries = fake_table(t).entries.lock().unwrap();
    let idx = match entries.iter().position(|(k, _)| *k == key) {
        Some(idx) => idx,
        None => {
            entries.push((key, 0));
            entries.len() - 1
        }
    };
    (idx + 1) as *mut RawTableEntry
}

unsafe extern "C" fn ft_write_entry_field(
    t: *mut RawTable,
    e: *mut RawTableEntry,
    f: *mut RawTableField,
    v: *const StateData,
) -> RawRc {
    if f != COUNT_FIELD {
        return RC_FAILURE;
    }
    let mut entries = fake_table(t).entries.lock().unwrap();
    match entries.get_mut((e as usize).wrapping_sub(1)) {
        Some((_, count)) => {
            *count = (*v).u64;
            RC_SUCCESS
        }
        None => RC_FAILURE,
    }
}

fn fake_table_input(table: *mut RawTable) -> RawTableInput {
    RawTableInput {
        name: c"conn_stats".as_ptr(),
        key_type: ST_UINT64,
        table,
        fields: TableFieldsVtable {
            list_fields: Some(ft_list_fields),
            get_field: Some(ft_get_field),
            add_field: Some(ft_get_field),
        },
        reader: TableReaderVtable {
            get_name: None,
            get_size: Some(ft_get_size),
            get_entry: Some(ft_get_entry),
            read_entry_field: Some(ft_read_entry_field),
            iterate_entries: Some(ft_iterate_entries),
        },
        writer: TableWriterVtable {
            clear: Some(ft_clear),
            erase_entry: Some(ft_erase_entry),
            add_entry: Some(ft_add_entry),
            write_entry_field: Some(ft_write_entry_field),
        },
    }
}

// ---------------------------------------------------------------------------
// the "sniff" plugin: sourcing + extraction + parsing

struct SniffState {
    // buffers backing extraction results until the next call
    u64_buf: Vec<u64>,
    u32_buf: Vec<u32>,
    str_buf: Vec<CString>,
    str_ptrs: Vec<*const c_char>,
    render_buf: CString,
    // host "proc" table access acquired at init, when available
    proc_table: *mut RawTable,
    comm_field: *mut RawTableField,
    // the table this plugin publishes
    conn_table: *mut FakeTable,
}

unsafe fn sniff_state<'a>(s: *mut RawPluginState) -> &'a mut SniffState {
    &mut *(s as *mut SniffState)
}

unsafe extern "C" fn sniff_api_version() -> *const c_char {
    c"3.0.0".as_ptr()
}

unsafe extern "C" fn sniff_version() -> *const c_char {
    c"0.9.1".as_ptr()
}

unsafe extern "C" fn sniff_name() -> *const c_char {
    c"sniff".as_ptr()
}

unsafe extern "C" fn sniff_description() -> *const c_char {
    c"synthetic network sniffer".as_ptr()
}

unsafe extern "C" fn sniff_contact() -> *const c_char {
    c"sniff@example.com".as_ptr()
}

unsafe extern "C" fn sniff_capabilities() -> u32 {
    CAP_SOURCING_BIT | CAP_EXTRACTION_BIT | CAP_PARSING_BIT
}

unsafe extern "C" fn sniff_last_error(_s: *mut RawPluginState) -> *const c_char {
    std::ptr::null()
}

unsafe extern "C" fn sniff_init(input: *const InitInput, rc: *mut RawRc) -> *mut RawPluginState {
    let input = &*input;
    let tables = &*input.tables;

    let mut state = Box::new(SniffState {
        u64_buf: Vec::new(),
        u32_buf: Vec::new(),
        str_buf: Vec::new(),
        str_ptrs: Vec::new(),
        render_buf: CString::default(),
        proc_table: std::ptr::null_mut(),
        comm_field: std::ptr::null_mut(),
        conn_table: std::ptr::null_mut(),
    });

    // the host "proc" table is optional; parsing degrades without it
    let proc_table = tables.get_table.unwrap()(input.owner, c"proc".as_ptr(), ST_UINT64);
    if !proc_table.is_null() {
        state.proc_table = proc_table;
        state.comm_field =
            tables.fields.get_field.unwrap()(proc_table, c"comm".as_ptr(), ST_STRING);
    }

    // publish conn_stats
    let conn = Box::into_raw(FakeTable::new());
    let conn_input = fake_table_input(conn as *mut RawTable);
    if tables.add_table.unwrap()(input.owner, &conn_input) != RC_SUCCESS {
        drop(Box::from_raw(conn));
        *rc = RC_FAILURE;
        return std::ptr::null_mut();
    }
    state.conn_table = conn;

    *rc = RC_SUCCESS;
    Box::into_raw(state) as *mut RawPluginState
}

unsafe extern "C" fn sniff_destroy(s: *mut RawPluginState) {
    if s.is_null() {
        return;
    }
    let state = Box::from_raw(s as *mut SniffState);
    if !state.conn_table.is_null() {
        drop(Box::from_raw(state.conn_table));
    }
}

unsafe extern "C" fn sniff_get_id() -> u32 {
    9
}

unsafe extern "C" fn sniff_get_event_source() -> *const c_char {
    c"sniff".as_ptr()
}

struct SniffInstance {
    batches: u32,
    bufs: Vec<Vec<u8>>,
    ptrs: Vec<*const RawEvent>,
}

unsafe extern "C" fn sniff_open(
    _s: *mut RawPluginState,
    _params: *const c_char,
    rc: *mut RawRc,
) -> *mut RawInstanceState {
    *rc = RC_SUCCESS;
    Box::into_raw(Box::new(SniffInstance {
        batches: 0,
        bufs: Vec::new(),
        ptrs: Vec::new(),
    })) as *mut RawInstanceState
}

unsafe extern "C" fn sniff_close(_s: *mut RawPluginState, i: *mut RawInstanceState) {
    drop(Box::from_raw(i as *mut SniffInstance));
}

unsafe extern "C" fn sniff_next_batch(
    _s: *mut RawPluginState,
    i: *mut RawInstanceState,
    nevts: *mut u32,
    evts: *mut *mut *const RawEvent,
) -> RawRc {
    let instance = &mut *(i as *mut SniffInstance);
    if instance.batches >= 1 {
        *nevts = 0;
        return RC_EOF;
    }
    instance.batches += 1;
    instance.bufs = vec![
        encode_event(100, 1, noctua_plugin::PLUGIN_EVENT_CODE, 1, b"evt-0"),
        encode_event(200, 1, noctua_plugin::PLUGIN_EVENT_CODE, 1, b"evt-1"),
    ];
    instance.ptrs = instance
        .bufs
        .iter()
        .map(|b| b.as_ptr() as *const RawEvent)
        .collect();
    *nevts = instance.ptrs.len() as u32;
    *evts = instance.ptrs.as_mut_ptr();
    RC_SUCCESS
}

unsafe extern "C" fn sniff_get_progress(
    _s: *mut RawPluginState,
    _i: *mut RawInstanceState,
    progress_pct: *mut u32,
) -> *const c_char {
    *progress_pct = 50;
    c"halfway".as_ptr()
}

unsafe extern "C" fn sniff_event_to_string(
    s: *mut RawPluginState,
    evt: *const RawEventInput,
) -> *const c_char {
    let state = sniff_state(s);
    let header = std::ptr::read_unaligned((*evt).evt);
    let payload_len = header.len as usize - std::mem::size_of::<RawEvent>();
    let payload = std::slice::from_raw_parts(
        ((*evt).evt as *const u8).add(std::mem::size_of::<RawEvent>()),
        payload_len,
    );
    let rendered = format!("sample={}", String::from_utf8_lossy(payload));
    state.render_buf = CString::new(rendered).unwrap();
    state.render_buf.as_ptr()
}

unsafe extern "C" fn sniff_list_open_params(
    _s: *mut RawPluginState,
    rc: *mut RawRc,
) -> *const c_char {
    *rc = RC_SUCCESS;
    cr#"[{"value": "iface://eth0", "desc": "live capture"},
         {"value": "file://dump.pcap", "desc": "offline replay", "separator": ";"}]"#
        .as_ptr()
}

unsafe extern "C" fn sniff_get_fields() -> *const c_char {
    cr#"[
        {"name": "sniff.count", "type": "uint64", "desc": "sample values", "isList": true},
        {"name": "sniff.tag", "type": "string", "desc": "tag by key", "arg": {"isKey": true}},
        {"name": "sniff.peer", "type": "ipv4addr", "desc": "peer address"}
    ]"#
    .as_ptr()
}

unsafe extern "C" fn sniff_extract_fields(
    s: *mut RawPluginState,
    _evt: *const RawEventInput,
    input: *const FieldExtractInput,
) -> RawRc {
    let state = sniff_state(s);
    let input = &*input;
    let fields = std::slice::from_raw_parts_mut(input.fields, input.num_fields as usize);
    for field in fields {
        match field.field_id {
            0 => {
                state.u64_buf = vec![7, 8];
                field.res.u64 = state.u64_buf.as_ptr();
                field.res_len = 2;
            }
            1 => {
                let tag = if field.arg_present != 0 && !field.arg_key.is_null() {
                    format!("tag-{}", CStr::from_ptr(field.arg_key).to_string_lossy())
                } else {
                    "tag-none".to_string()
                };
                state.str_buf = vec![CString::new(tag).unwrap()];
                state.str_ptrs = state.str_buf.iter().map(|s| s.as_ptr()).collect();
                field.res.str = state.str_ptrs.as_ptr();
                field.res_len = 1;
            }
            2 => {
                state.u32_buf = vec![0x0100_007f];
                field.res.u32 = state.u32_buf.as_ptr();
                field.res_len = 1;
            }
            _ => return RC_FAILURE,
        }
    }
    RC_SUCCESS
}

unsafe extern "C" fn sniff_parse_event(
    s: *mut RawPluginState,
    _evt: *const RawEventInput,
    input: *const EventParseInput,
) -> RawRc {
    let state = sniff_state(s);
    if state.proc_table.is_null() || state.comm_field.is_null() {
        return RC_SUCCESS;
    }
    let input = &*input;
    let key = StateData { u64: 42 };
    let entry = input.table_writer.add_entry.unwrap()(state.proc_table, &key);
    if entry.is_null() {
        return RC_FAILURE;
    }
    let comm = StateData {
        str: c"curl".as_ptr(),
    };
    input.table_writer.write_entry_field.unwrap()(state.proc_table, entry, state.comm_field, &comm)
}

fn sniff_api() -> PluginApi {
    PluginApi {
        get_required_api_version: Some(sniff_api_version),
        get_version: Some(sniff_version),
        get_name: Some(sniff_name),
        get_description: Some(sniff_description),
        get_contact: Some(sniff_contact),
        get_capabilities: Some(sniff_capabilities),
        get_last_error: Some(sniff_last_error),
        init: Some(sniff_init),
        destroy: Some(sniff_destroy),
        get_id: Some(sniff_get_id),
        get_event_source: Some(sniff_get_event_source),
        open: Some(sniff_open),
        close: Some(sniff_close),
        next_batch: Some(sniff_next_batch),
        get_progress: Some(sniff_get_progress),
        event_to_string: Some(sniff_event_to_string),
        list_open_params: Some(sniff_list_open_params),
        get_fields: Some(sniff_get_fields),
        extract_fields: Some(sniff_extract_fields),
        parse_event: Some(sniff_parse_event),
        ..Default::default()
    }
}

// ---------------------------------------------------------------------------
// the "tally" plugin: parsing only, consumes sniff's published table

struct TallyState {
    conn_table: *mut RawTable,
    count_field: *mut RawTableField,
}

unsafe extern "C" fn tally_name() -> *const c_char {
    c"tally".as_ptr()
}

unsafe extern "C" fn tally_capabilities() -> u32 {
    CAP_PARSING_BIT
}

unsafe extern "C" fn tally_parse_sources() -> *const c_char {
    cr#"["sniff"]"#.as_ptr()
}

unsafe extern "C" fn tally_init(input: *const InitInput, rc: *mut RawRc) -> *mut RawPluginState {
    let input = &*input;
    let tables = &*input.tables;
    let conn_table = tables.get_table.unwrap()(input.owner, c"conn_stats".as_ptr(), ST_UINT64);
    if conn_table.is_null() {
        *rc = RC_FAILURE;
        return std::ptr::null_mut();
    }
    let count_field =
        tables.fields.get_field.unwrap()(conn_table, c"count".as_ptr(), ST_UINT64);
    if count_field.is_null() {
        *rc = RC_FAILURE;
        return std::ptr::null_mut();
    }
    *rc = RC_SUCCESS;
    Box::into_raw(Box::new(TallyState {
        conn_table,
        count_field,
    })) as *mut RawPluginState
}

unsafe extern "C" fn tally_destroy(s: *mut RawPluginState) {
    if !s.is_null() {
        drop(Box::from_raw(s as *mut TallyState));
    }
}

unsafe extern "C" fn tally_parse_event(
    s: *mut RawPluginState,
    _evt: *const RawEventInput,
    input: *const EventParseInput,
) -> RawRc {
    let state = &*(s as *mut TallyState);
    let input = &*input;
    let key = StateData { u64: 7 };
    let entry = input.table_writer.add_entry.unwrap()(state.conn_table, &key);
    if entry.is_null() {
        return RC_FAILURE;
    }
    let value = StateData { u64: 5 };
    input.table_writer.write_entry_field.unwrap()(
        state.conn_table,
        entry,
        state.count_field,
        &value,
    )
}

fn tally_api() -> PluginApi {
    PluginApi {
        get_required_api_version: Some(sniff_api_version),
        get_version: Some(sniff_version),
        get_name: Some(tally_name),
        get_description: Some(sniff_description),
        get_contact: Some(sniff_contact),
        get_capabilities: Some(tally_capabilities),
        get_last_error: Some(sniff_last_error),
        init: Some(tally_init),
        destroy: Some(tally_destroy),
        parse_event: Some(tally_parse_event),
        get_parse_event_sources: Some(tally_parse_sources),
        ..Default::default()
    }
}

// ---------------------------------------------------------------------------
// the "cfg" plugin: publishes an init schema

unsafe extern "C" fn cfg_name() -> *const c_char {
    c"cfg".as_ptr()
}

unsafe extern "C" fn cfg_init_schema(schema_type: *mut u32) -> *const c_char {
    *schema_type = SCHEMA_JSON;
    cr#"{"type": "object", "required": ["k"]}"#.as_ptr()
}

unsafe extern "C" fn cfg_init(_input: *const InitInput, rc: *mut RawRc) -> *mut RawPluginState {
    *rc = RC_SUCCESS;
    std::ptr::null_mut()
}

unsafe extern "C" fn cfg_parse_event(
    _s: *mut RawPluginState,
    _evt: *const RawEventInput,
    _input: *const EventParseInput,
) -> RawRc {
    RC_SUCCESS
}

unsafe extern "C" fn cfg_destroy(_s: *mut RawPluginState) {}

fn cfg_api() -> PluginApi {
    PluginApi {
        get_required_api_version: Some(sniff_api_version),
        get_version: Some(sniff_version),
        get_name: Some(cfg_name),
        get_description: Some(sniff_description),
        get_contact: Some(sniff_contact),
        get_capabilities: Some(tally_capabilities),
        get_last_error: Some(sniff_last_error),
        init: Some(cfg_init),
        destroy: Some(cfg_destroy),
        get_init_schema: Some(cfg_init_schema),
        parse_event: Some(cfg_parse_event),
        ..Default::default()
    }
}

// ---------------------------------------------------------------------------
// the "grumpy" plugin: init fails but still returns a state carrying an error

static GRUMPY_DESTROYED: AtomicBool = AtomicBool::new(false);

unsafe extern "C" fn grumpy_name() -> *const c_char {
    c"grumpy".as_ptr()
}

unsafe extern "C" fn grumpy_init(_input: *const InitInput, rc: *mut RawRc) -> *mut RawPluginState {
    *rc = RC_FAILURE;
    // a state returned on failure exists only to carry the error message
    Box::into_raw(Box::new(0u8)) as *mut RawPluginState
}

unsafe extern "C" fn grumpy_last_error(_s: *mut RawPluginState) -> *const c_char {
    c"bad config: missing socket".as_ptr()
}

unsafe extern "C" fn grumpy_destroy(s: *mut RawPluginState) {
    if !s.is_null() {
        GRUMPY_DESTROYED.store(true, Ordering::SeqCst);
        drop(Box::from_raw(s as *mut u8));
    }
}

fn grumpy_api() -> PluginApi {
    PluginApi {
        get_required_api_version: Some(sniff_api_version),
        get_version: Some(sniff_version),
        get_name: Some(grumpy_name),
        get_description: Some(sniff_description),
        get_contact: Some(sniff_contact),
        get_capabilities: Some(tally_capabilities),
        get_last_error: Some(grumpy_last_error),
        init: Some(grumpy_init),
        destroy: Some(grumpy_destroy),
        parse_event: Some(cfg_parse_event),
        ..Default::default()
    }
}

// ---------------------------------------------------------------------------
// helpers

fn registry_with_proc() -> Arc<TableRegistry> {
    let registry = Arc::new(TableRegistry::new());
    registry
        .add_table(Arc::new(
            noctua_plugin::InMemoryTable::new("proc", StateType::U64)
                .with_field("comm", StateType::String),
        ))
        .unwrap();
    registry
}

fn sniff_event(num: u64) -> EventInput {
    EventInput::plugin_event(num, 0, "sniff", format!("evt-{num}").as_bytes())
}

// ---------------------------------------------------------------------------
// tests

#[test]
fn load_yields_a_complete_descriptor() {
    let plugin = Plugin::create_from_api(sniff_api(), registry_with_proc()).unwrap();
    let descriptor = plugin.descriptor();
    assert_eq!(descriptor.name, "sniff");
    assert_eq!(descriptor.version.to_string(), "0.9.1");
    assert_eq!(descriptor.required_api_version.to_string(), "3.0.0");
    assert_eq!(
        descriptor.capabilities,
        Capabilities::SOURCING | Capabilities::EXTRACTION | Capabilities::PARSING
    );
    assert_eq!(plugin.id().unwrap(), 9);
    assert_eq!(plugin.event_source().unwrap(), "sniff");
    assert_eq!(plugin.fields().unwrap().len(), 3);
    // the plugin's own source is implicitly part of both compatibility sets
    assert!(plugin.extract_event_sources().unwrap().contains("sniff"));
    assert!(plugin.parse_event_sources().unwrap().contains("sniff"));
}

#[test]
fn capability_use_before_init_is_a_state_error() {
    let plugin = Plugin::create_from_api(sniff_api(), registry_with_proc()).unwrap();
    let err = plugin.get_last_error().unwrap_err();
    assert!(matches!(err, PluginError::State(_)));
    assert!(err.to_string().contains("before init"));

    let mut check = FieldCheck::new(Arc::clone(&plugin)).unwrap();
    check.parse_field("sniff.count").unwrap();
    let err = check.extract(&sniff_event(1)).unwrap_err();
    assert!(matches!(err, PluginError::State(_)));
}

#[test]
fn init_twice_is_rejected() {
    let plugin = Plugin::create_from_api(sniff_api(), registry_with_proc()).unwrap();
    plugin.init("{}").unwrap();
    let err = plugin.init("{}").unwrap_err();
    assert!(matches!(err, PluginError::State(_)));
    assert!(err.to_string().contains("initialized twice"));
    // destroy is idempotent
    plugin.destroy();
    plugin.destroy();
}

#[test]
fn init_schema_failure_names_the_missing_property() {
    let plugin = Plugin::create_from_api(cfg_api(), Arc::new(TableRegistry::new())).unwrap();
    let err = plugin.init("{}").unwrap_err();
    assert!(matches!(err, PluginError::Schema(_)));
    assert!(err.to_string().contains("k"));
    assert!(err.to_string().contains("cfg"));

    // schema validation failed before the plugin's init ever ran, so a
    // corrected config may still initialize
    plugin.init(r#"{"k": 1}"#).unwrap();
}

#[test]
fn failed_init_surfaces_the_plugin_error_and_releases_the_state() {
    let plugin = Plugin::create_from_api(grumpy_api(), Arc::new(TableRegistry::new())).unwrap();
    let err = plugin.init("{}").unwrap_err();
    assert!(matches!(err, PluginError::Init(_)));
    assert!(err.to_string().contains("bad config: missing socket"));
    assert!(GRUMPY_DESTROYED.load(Ordering::SeqCst));

    // a failed attempt consumes the single permitted init; no retry
    let err = plugin.init("{}").unwrap_err();
    assert!(matches!(err, PluginError::State(_)));
    assert!(err.to_string().contains("initialized twice"));
}

#[test]
fn sourcing_produces_batches_until_eof() {
    let plugin = Plugin::create_from_api(sniff_api(), registry_with_proc()).unwrap();
    plugin.init("{}").unwrap();

    let params = plugin.list_open_params().unwrap();
    assert_eq!(params.len(), 2);
    assert_eq!(params[0].value, "iface://eth0");
    assert_eq!(params[1].separator, ";");

    let mut instance = plugin.open_source(Some("iface://eth0")).unwrap();
    let (events, status) = instance.next_batch().unwrap();
    assert_eq!(status, BatchStatus::Ok);
    assert_eq!(events.len(), 2);
    assert!(events.iter().all(|e| e.plugin_id == 9));

    let (progress, pct) = instance.get_progress().unwrap();
    assert_eq!((progress.as_str(), pct), ("halfway", 50));

    let (events, status) = instance.next_batch().unwrap();
    assert_eq!(status, BatchStatus::Eof);
    assert!(events.is_empty());
}

#[test]
fn sourced_events_render_through_the_plugin() {
    let plugin = Plugin::create_from_api(sniff_api(), registry_with_proc()).unwrap();
    plugin.init("{}").unwrap();

    let mut instance = plugin.open_source(None).unwrap();
    let (events, _) = instance.next_batch().unwrap();
    let event = events[0].clone().into_event_input(1, 0, "sniff");
    assert_eq!(plugin.event_to_string(&event).unwrap(), "sample=evt-0");
}

#[test]
fn extraction_maps_u64_lists_to_little_endian_values() {
    let plugin = Plugin::create_from_api(sniff_api(), registry_with_proc()).unwrap();
    plugin.init("{}").unwrap();

    let mut check = FieldCheck::new(Arc::clone(&plugin)).unwrap();
    check.parse_field("sniff.count").unwrap();
    let values = check.extract(&sniff_event(1)).unwrap().unwrap();
    assert_eq!(values.len(), 2);
    assert_eq!(values[0].bytes(), 7u64.to_le_bytes().as_slice());
    assert_eq!(values[1].bytes(), 8u64.to_le_bytes().as_slice());
    assert_eq!(values[0].as_u64(), Some(7));
    assert_eq!(values[1].as_u64(), Some(8));
}

#[test]
fn extraction_echoes_the_key_argument() {
    let plugin = Plugin::create_from_api(sniff_api(), registry_with_proc()).unwrap();
    plugin.init("{}").unwrap();

    let mut check = FieldCheck::new(Arc::clone(&plugin)).unwrap();
    check.parse_field("sniff.tag[alpha]").unwrap();
    let values = check.extract(&sniff_event(1)).unwrap().unwrap();
    assert_eq!(values[0].as_str(), Some("tag-alpha"));
}

#[test]
fn extraction_maps_ipv4_to_fixed_width_u32() {
    let plugin = Plugin::create_from_api(sniff_api(), registry_with_proc()).unwrap();
    plugin.init("{}").unwrap();

    let mut check = FieldCheck::new(Arc::clone(&plugin)).unwrap();
    check.parse_field("sniff.peer").unwrap();
    let values = check.extract(&sniff_event(1)).unwrap().unwrap();
    assert_eq!(values[0].bytes(), 0x0100_007fu32.to_le_bytes().as_slice());
}

#[test]
fn extraction_silently_rejects_incompatible_events() {
    let plugin = Plugin::create_from_api(sniff_api(), registry_with_proc()).unwrap();
    plugin.init("{}").unwrap();

    let mut check = FieldCheck::new(Arc::clone(&plugin)).unwrap();
    check.parse_field("sniff.count").unwrap();

    // wrong source name
    let event = EventInput::plugin_event(1, 1, "syscall", b"x");
    assert!(check.extract(&event).unwrap().is_none());

    // wrong type code
    let event = EventInput::new(
        2,
        noctua_plugin::GENERIC_PLUGIN_EVENT_CODE,
        Some(0),
        Some("sniff".to_string()),
        encode_event(0, 0, noctua_plugin::GENERIC_PLUGIN_EVENT_CODE, 1, b"x"),
    );
    assert!(check.extract(&event).unwrap().is_none());

    // compatible again: the memoized bitmap must not poison other sources
    assert!(check.extract(&sniff_event(3)).unwrap().is_some());
}

#[test]
fn parsing_mutates_the_host_table_through_the_bridge() {
    let registry = registry_with_proc();
    let plugin = Plugin::create_from_api(sniff_api(), Arc::clone(&registry)).unwrap();
    plugin.init("{}").unwrap();

    let parser = EventParser::new(Arc::clone(&plugin)).unwrap();
    assert!(parser.parse(&sniff_event(1)).unwrap());

    let proc_table = registry.get_table("proc", StateType::U64).unwrap();
    let entry = proc_table
        .get_entry(&StateValue::U64(42))
        .unwrap()
        .expect("row created by the plugin");
    let comm = proc_table.get_field("comm", StateType::String).unwrap();
    assert_eq!(
        proc_table.read_field(entry, comm).unwrap(),
        StateValue::String("curl".into())
    );

    // incompatible events are silently skipped
    let foreign = EventInput::plugin_event(2, 1, "other", b"x");
    assert!(!parser.parse(&foreign).unwrap());
}

#[test]
fn published_tables_are_visible_with_their_key_type() {
    let registry = registry_with_proc();
    let plugin = Plugin::create_from_api(sniff_api(), Arc::clone(&registry)).unwrap();
    plugin.init("{}").unwrap();

    // key-type mismatch is a compatibility error
    let err = registry.get_table("conn_stats", StateType::String).unwrap_err();
    assert!(matches!(err, PluginError::Compatibility(_)));

    let table = registry.get_table("conn_stats", StateType::U64).unwrap();
    let fields = table.list_fields();
    assert_eq!(fields.len(), 1);
    assert_eq!(fields[0].name, "count");
    assert_eq!(fields[0].field_type, StateType::U64);
}

#[test]
fn a_second_plugin_writes_into_the_published_table() {
    let registry = registry_with_proc();
    let sniff = Plugin::create_from_api(sniff_api(), Arc::clone(&registry)).unwrap();
    sniff.init("{}").unwrap();

    let tally = Plugin::create_from_api(tally_api(), Arc::clone(&registry)).unwrap();
    tally.init("{}").unwrap();

    let parser = EventParser::new(Arc::clone(&tally)).unwrap();
    assert!(parser.parse(&sniff_event(1)).unwrap());

    // the write crossed both vtable layers into sniff's own storage
    let table = registry.get_table("conn_stats", StateType::U64).unwrap();
    let count = table.get_field("count", StateType::U64).unwrap();
    let entry = table.get_entry(&StateValue::U64(7)).unwrap().unwrap();
    assert_eq!(table.read_field(entry, count).unwrap(), StateValue::U64(5));
}

#[test]
fn destroying_the_publisher_retires_its_tables() {
    let registry = registry_with_proc();
    let sniff = Plugin::create_from_api(sniff_api(), Arc::clone(&registry)).unwrap();
    sniff.init("{}").unwrap();

    let table = registry.get_table("conn_stats", StateType::U64).unwrap();
    sniff.destroy();

    // gone from the registry, and outstanding handles refuse access
    assert!(registry.get_table("conn_stats", StateType::U64).is_err());
    assert!(table.get_entry(&StateValue::U64(7)).is_err());
}
