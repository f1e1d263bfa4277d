//! Raw FFI declarations for the SQLCipher engine.
//!
//! The symbols are provided by the static library that `libsqlite3-sys`
//! (feature `bundled-sqlcipher-vendored-openssl`) compiles and links. Only
//! the narrow surface this crate actually calls is declared here.
//!
//! All handle types use `*mut c_void` so that no C struct type leaks into
//! the rest of the code. This module and the trampoline callbacks in
//! `functions`, `authorizer` and `tokenizer` are the only places with
//! `unsafe` FFI plumbing; everything else goes through the safe wrappers.

#![allow(non_camel_case_types, non_snake_case, dead_code)]

use std::os::raw::{c_char, c_int, c_uchar, c_void};

// ── Result codes ────────────────────────────────────────────────────────

pub const SQLITE_OK: c_int = 0;
pub const SQLITE_ERROR: c_int = 1;
pub const SQLITE_ABORT: c_int = 4;
pub const SQLITE_BUSY: c_int = 5;
pub const SQLITE_LOCKED: c_int = 6;
pub const SQLITE_NOMEM: c_int = 7;
pub const SQLITE_INTERRUPT: c_int = 9;
pub const SQLITE_CONSTRAINT: c_int = 19;
pub const SQLITE_MISUSE: c_int = 21;
pub const SQLITE_AUTH: c_int = 23;
pub const SQLITE_NOTADB: c_int = 26;
pub const SQLITE_ROW: c_int = 100;
pub const SQLITE_DONE: c_int = 101;

// ── Column storage classes ──────────────────────────────────────────────

pub const SQLITE_INTEGER: c_int = 1;
pub const SQLITE_FLOAT: c_int = 2;
pub const SQLITE_TEXT: c_int = 3;
pub const SQLITE_BLOB: c_int = 4;
pub const SQLITE_NULL: c_int = 5;

// ── Open flags ──────────────────────────────────────────────────────────

pub const SQLITE_OPEN_READONLY: c_int = 0x0000_0001;
pub const SQLITE_OPEN_READWRITE: c_int = 0x0000_0002;
pub const SQLITE_OPEN_CREATE: c_int = 0x0000_0004;
pub const SQLITE_OPEN_URI: c_int = 0x0000_0040;
pub const SQLITE_OPEN_MEMORY: c_int = 0x0000_0080;
pub const SQLITE_OPEN_NOMUTEX: c_int = 0x0000_8000;
pub const SQLITE_OPEN_FULLMUTEX: c_int = 0x0001_0000;

// ── Prepare flags ───────────────────────────────────────────────────────

pub const SQLITE_PREPARE_PERSISTENT: u32 = 0x01;

// Destructor sentinel (engine copies the data before returning)
pub const SQLITE_TRANSIENT: isize = -1;

// ── Text encodings / function flags ─────────────────────────────────────

pub const SQLITE_UTF8: c_int = 1;
pub const SQLITE_DETERMINISTIC: c_int = 0x0000_0800;
pub const SQLITE_DIRECTONLY: c_int = 0x0008_0000;
pub const SQLITE_INNOCUOUS: c_int = 0x0020_0000;

// ── Authorizer action codes ─────────────────────────────────────────────

pub const SQLITE_CREATE_INDEX: c_int = 1;
pub const SQLITE_CREATE_TABLE: c_int = 2;
pub const SQLITE_CREATE_TEMP_INDEX: c_int = 3;
pub const SQLITE_CREATE_TEMP_TABLE: c_int = 4;
pub const SQLITE_CREATE_TEMP_TRIGGER: c_int = 5;
pub const SQLITE_CREATE_TEMP_VIEW: c_int = 6;
pub const SQLITE_CREATE_TRIGGER: c_int = 7;
pub const SQLITE_CREATE_VIEW: c_int = 8;
pub const SQLITE_DELETE: c_int = 9;
pub const SQLITE_DROP_INDEX: c_int = 10;
pub const SQLITE_DROP_TABLE: c_int = 11;
pub const SQLITE_DROP_TEMP_INDEX: c_int = 12;
pub const SQLITE_DROP_TEMP_TABLE: c_int = 13;
pub const SQLITE_DROP_TEMP_TRIGGER: c_int = 14;
pub const SQLITE_DROP_TEMP_VIEW: c_int = 15;
pub const SQLITE_DROP_TRIGGER: c_int = 16;
pub const SQLITE_DROP_VIEW: c_int = 17;
pub const SQLITE_INSERT: c_int = 18;
pub const SQLITE_PRAGMA: c_int = 19;
pub const SQLITE_READ: c_int = 20;
pub const SQLITE_SELECT: c_int = 21;
pub const SQLITE_TRANSACTION: c_int = 22;
pub const SQLITE_UPDATE: c_int = 23;
pub const SQLITE_ATTACH: c_int = 24;
pub const SQLITE_DETACH: c_int = 25;
pub const SQLITE_ALTER_TABLE: c_int = 26;
pub const SQLITE_REINDEX: c_int = 27;
pub const SQLITE_ANALYZE: c_int = 28;
pub const SQLITE_CREATE_VTABLE: c_int = 29;
pub const SQLITE_DROP_VTABLE: c_int = 30;
pub const SQLITE_FUNCTION: c_int = 31;
pub const SQLITE_SAVEPOINT: c_int = 32;
pub const SQLITE_RECURSIVE: c_int = 33;

// Authorizer responses (allow is SQLITE_OK)
pub const SQLITE_DENY: c_int = 1;
pub const SQLITE_IGNORE: c_int = 2;

// ── Runtime limit categories ────────────────────────────────────────────

pub const SQLITE_LIMIT_LENGTH: c_int = 0;
pub const SQLITE_LIMIT_SQL_LENGTH: c_int = 1;
pub const SQLITE_LIMIT_COLUMN: c_int = 2;
pub const SQLITE_LIMIT_EXPR_DEPTH: c_int = 3;
pub const SQLITE_LIMIT_COMPOUND_SELECT: c_int = 4;
pub const SQLITE_LIMIT_VDBE_OP: c_int = 5;
pub const SQLITE_LIMIT_FUNCTION_ARG: c_int = 6;
pub const SQLITE_LIMIT_ATTACHED: c_int = 7;
pub const SQLITE_LIMIT_LIKE_PATTERN_LENGTH: c_int = 8;
pub const SQLITE_LIMIT_VARIABLE_NUMBER: c_int = 9;
pub const SQLITE_LIMIT_TRIGGER_DEPTH: c_int = 10;
pub const SQLITE_LIMIT_WORKER_THREADS: c_int = 11;

// ── Per-database config toggles ─────────────────────────────────────────

pub const SQLITE_DBCONFIG_ENABLE_FKEY: c_int = 1002;
pub const SQLITE_DBCONFIG_ENABLE_TRIGGER: c_int = 1003;
pub const SQLITE_DBCONFIG_ENABLE_FTS3_TOKENIZER: c_int = 1004;
pub const SQLITE_DBCONFIG_ENABLE_LOAD_EXTENSION: c_int = 1005;
pub const SQLITE_DBCONFIG_DEFENSIVE: c_int = 1010;
pub const SQLITE_DBCONFIG_ENABLE_VIEW: c_int = 1015;

// ── Global config verbs ─────────────────────────────────────────────────

pub const SQLITE_CONFIG_SINGLETHREAD: c_int = 1;
pub const SQLITE_CONFIG_MULTITHREAD: c_int = 2;
pub const SQLITE_CONFIG_SERIALIZED: c_int = 3;

// ── FTS5 extension structs ──────────────────────────────────────────────

/// Token emitted by a tokenizer occupies the same position as the previous
/// token.
pub const FTS5_TOKEN_COLOCATED: c_int = 0x0001;

// Reasons the engine invokes xTokenize
pub const FTS5_TOKENIZE_QUERY: c_int = 0x0001;
pub const FTS5_TOKENIZE_PREFIX: c_int = 0x0002;
pub const FTS5_TOKENIZE_DOCUMENT: c_int = 0x0004;
pub const FTS5_TOKENIZE_AUX: c_int = 0x0008;

/// Callback through which a tokenizer pushes tokens back to the engine.
pub type fts5_token_callback = unsafe extern "C" fn(
    ctx: *mut c_void,
    flags: c_int,
    token: *const c_char,
    n_token: c_int,
    start: c_int,
    end: c_int,
) -> c_int;

/// C-side tokenizer vtable handed to `fts5_api::xCreateTokenizer`.
#[repr(C)]
pub struct fts5_tokenizer {
    pub xCreate: unsafe extern "C" fn(
        user_data: *mut c_void,
        az_arg: *mut *const c_char,
        n_arg: c_int,
        pp_out: *mut *mut c_void,
    ) -> c_int,
    pub xDelete: unsafe extern "C" fn(tokenizer: *mut c_void),
    pub xTokenize: unsafe extern "C" fn(
        tokenizer: *mut c_void,
        ctx: *mut c_void,
        flags: c_int,
        text: *const c_char,
        n_text: c_int,
        x_token: fts5_token_callback,
    ) -> c_int,
}

/// The FTS5 extension API, obtained via `SELECT fts5(?)`.
///
/// Only the members up to `xCreateTokenizer` are declared; the struct is
/// never constructed on the Rust side, only read through a pointer the
/// engine hands out.
#[repr(C)]
pub struct fts5_api {
    pub iVersion: c_int,
    pub xCreateTokenizer: unsafe extern "C" fn(
        api: *mut fts5_api,
        name: *const c_char,
        user_data: *mut c_void,
        tokenizer: *mut fts5_tokenizer,
        destroy: Option<unsafe extern "C" fn(*mut c_void)>,
    ) -> c_int,
}

// ── Callback type aliases ───────────────────────────────────────────────

pub type destructor_fn = Option<unsafe extern "C" fn(*mut c_void)>;

pub type scalar_fn =
    Option<unsafe extern "C" fn(ctx: *mut c_void, argc: c_int, argv: *mut *mut c_void)>;

pub type final_fn = Option<unsafe extern "C" fn(ctx: *mut c_void)>;

pub type collation_fn = Option<
    unsafe extern "C" fn(
        user_data: *mut c_void,
        n_lhs: c_int,
        lhs: *const c_void,
        n_rhs: c_int,
        rhs: *const c_void,
    ) -> c_int,
>;

pub type authorizer_fn = Option<
    unsafe extern "C" fn(
        user_data: *mut c_void,
        action: c_int,
        arg1: *const c_char,
        arg2: *const c_char,
        database: *const c_char,
        trigger: *const c_char,
    ) -> c_int,
>;

pub type progress_fn = Option<unsafe extern "C" fn(user_data: *mut c_void) -> c_int>;

// ── Engine entry points ─────────────────────────────────────────────────

extern "C" {
    // Connection lifecycle
    pub fn sqlite3_open_v2(
        filename: *const c_char,
        pp_db: *mut *mut c_void,
        flags: c_int,
        z_vfs: *const c_char,
    ) -> c_int;

    pub fn sqlite3_close_v2(db: *mut c_void) -> c_int;

    // Script execution
    pub fn sqlite3_exec(
        db: *mut c_void,
        sql: *const c_char,
        callback: *const c_void,
        arg: *mut c_void,
        errmsg: *mut *mut c_char,
    ) -> c_int;

    pub fn sqlite3_free(ptr: *mut c_void);

    // Prepared statements
    pub fn sqlite3_prepare_v3(
        db: *mut c_void,
        z_sql: *const c_char,
        n_byte: c_int,
        prep_flags: u32,
        pp_stmt: *mut *mut c_void,
        pz_tail: *mut *const c_char,
    ) -> c_int;

    pub fn sqlite3_step(stmt: *mut c_void) -> c_int;
    pub fn sqlite3_reset(stmt: *mut c_void) -> c_int;
    pub fn sqlite3_clear_bindings(stmt: *mut c_void) -> c_int;
    pub fn sqlite3_finalize(stmt: *mut c_void) -> c_int;
    pub fn sqlite3_stmt_readonly(stmt: *mut c_void) -> c_int;
    pub fn sqlite3_sql(stmt: *mut c_void) -> *const c_char;

    // Parameter binding
    pub fn sqlite3_bind_int64(stmt: *mut c_void, index: c_int, value: i64) -> c_int;
    pub fn sqlite3_bind_double(stmt: *mut c_void, index: c_int, value: f64) -> c_int;

    pub fn sqlite3_bind_text(
        stmt: *mut c_void,
        index: c_int,
        value: *const c_char,
        n: c_int,
        destructor: isize,
    ) -> c_int;

    pub fn sqlite3_bind_blob(
        stmt: *mut c_void,
        index: c_int,
        value: *const c_void,
        n: c_int,
        destructor: isize,
    ) -> c_int;

    pub fn sqlite3_bind_null(stmt: *mut c_void, index: c_int) -> c_int;

    pub fn sqlite3_bind_pointer(
        stmt: *mut c_void,
        index: c_int,
        ptr: *mut c_void,
        type_name: *const c_char,
        destructor: destructor_fn,
    ) -> c_int;

    pub fn sqlite3_bind_parameter_count(stmt: *mut c_void) -> c_int;
    pub fn sqlite3_bind_parameter_index(stmt: *mut c_void, name: *const c_char) -> c_int;

    // Column reading
    pub fn sqlite3_column_count(stmt: *mut c_void) -> c_int;
    pub fn sqlite3_column_name(stmt: *mut c_void, i_col: c_int) -> *const c_char;
    pub fn sqlite3_column_type(stmt: *mut c_void, i_col: c_int) -> c_int;
    pub fn sqlite3_column_int64(stmt: *mut c_void, i_col: c_int) -> i64;
    pub fn sqlite3_column_double(stmt: *mut c_void, i_col: c_int) -> f64;
    pub fn sqlite3_column_text(stmt: *mut c_void, i_col: c_int) -> *const c_uchar;
    pub fn sqlite3_column_blob(stmt: *mut c_void, i_col: c_int) -> *const c_void;
    pub fn sqlite3_column_bytes(stmt: *mut c_void, i_col: c_int) -> c_int;

    // Error reporting
    pub fn sqlite3_errmsg(db: *mut c_void) -> *const c_char;

    // Change counters
    pub fn sqlite3_changes(db: *mut c_void) -> c_int;
    pub fn sqlite3_total_changes(db: *mut c_void) -> c_int;
    pub fn sqlite3_last_insert_rowid(db: *mut c_void) -> i64;

    // Tuning
    pub fn sqlite3_busy_timeout(db: *mut c_void, ms: c_int) -> c_int;
    pub fn sqlite3_limit(db: *mut c_void, id: c_int, new_val: c_int) -> c_int;
    pub fn sqlite3_db_config(db: *mut c_void, op: c_int, ...) -> c_int;
    pub fn sqlite3_config(op: c_int, ...) -> c_int;
    pub fn sqlite3_soft_heap_limit64(n: i64) -> i64;
    pub fn sqlite3_db_release_memory(db: *mut c_void) -> c_int;

    pub fn sqlite3_progress_handler(
        db: *mut c_void,
        n_ops: c_int,
        handler: progress_fn,
        user_data: *mut c_void,
    );

    // Custom functions
    pub fn sqlite3_create_function_v2(
        db: *mut c_void,
        name: *const c_char,
        n_arg: c_int,
        e_text_rep: c_int,
        user_data: *mut c_void,
        x_func: scalar_fn,
        x_step: scalar_fn,
        x_final: final_fn,
        x_destroy: destructor_fn,
    ) -> c_int;

    pub fn sqlite3_create_window_function(
        db: *mut c_void,
        name: *const c_char,
        n_arg: c_int,
        e_text_rep: c_int,
        user_data: *mut c_void,
        x_step: scalar_fn,
        x_final: final_fn,
        x_value: final_fn,
        x_inverse: scalar_fn,
        x_destroy: destructor_fn,
    ) -> c_int;

    pub fn sqlite3_aggregate_context(ctx: *mut c_void, n_bytes: c_int) -> *mut c_void;
    pub fn sqlite3_user_data(ctx: *mut c_void) -> *mut c_void;

    // Function argument values
    pub fn sqlite3_value_type(value: *mut c_void) -> c_int;
    pub fn sqlite3_value_int64(value: *mut c_void) -> i64;
    pub fn sqlite3_value_double(value: *mut c_void) -> f64;
    pub fn sqlite3_value_text(value: *mut c_void) -> *const c_uchar;
    pub fn sqlite3_value_blob(value: *mut c_void) -> *const c_void;
    pub fn sqlite3_value_bytes(value: *mut c_void) -> c_int;

    // Function results
    pub fn sqlite3_result_int64(ctx: *mut c_void, value: i64);
    pub fn sqlite3_result_double(ctx: *mut c_void, value: f64);
    pub fn sqlite3_result_text(
        ctx: *mut c_void,
        value: *const c_char,
        n: c_int,
        destructor: isize,
    );
    pub fn sqlite3_result_blob(
        ctx: *mut c_void,
        value: *const c_void,
        n: c_int,
        destructor: isize,
    );
    pub fn sqlite3_result_null(ctx: *mut c_void);
    pub fn sqlite3_result_error(ctx: *mut c_void, msg: *const c_char, n: c_int);
    pub fn sqlite3_result_error_code(ctx: *mut c_void, code: c_int);

    // Collations
    pub fn sqlite3_create_collation_v2(
        db: *mut c_void,
        name: *const c_char,
        e_text_rep: c_int,
        user_data: *mut c_void,
        x_compare: collation_fn,
        x_destroy: destructor_fn,
    ) -> c_int;

    // Authorizer
    pub fn sqlite3_set_authorizer(
        db: *mut c_void,
        x_auth: authorizer_fn,
        user_data: *mut c_void,
    ) -> c_int;
}
