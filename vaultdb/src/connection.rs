//! Safe wrapper around one native database handle.
//!
//! A [`Connection`] exclusively owns its handle. Construction applies an
//! ordered list of [`SetupAction`]s and fails atomically: the first action
//! that fails closes the handle and the caller never sees a partially
//! configured connection.
//!
//! Threading contract: a connection is affine to one thread at a time. The
//! type is `Send` but not `Sync`; cross-thread sharing is handled
//! structurally by the [`ConnectionManager`](crate::ConnectionManager)
//! rather than by internal locking.

use std::cell::RefCell;
use std::ffi::CString;
use std::os::raw::{c_char, c_int, c_void};
use std::path::Path;
use std::time::Duration;

use log::{debug, warn};
use zeroize::{Zeroize, Zeroizing};

use crate::error::{Error, Result};
use crate::ffi;
use crate::statement::{self, OwnedRow, Statement, StepResult};
use crate::value::Value;

// ── Open flags ──────────────────────────────────────────────────────────

/// Flag set controlling how a database file is opened.
///
/// An explicit type over the engine's bitmask; combine flags with `|`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenFlags(c_int);

impl OpenFlags {
    /// Open the database read-only.
    pub const READ_ONLY: Self = Self(ffi::SQLITE_OPEN_READONLY);
    /// Open the database for reading and writing.
    pub const READ_WRITE: Self = Self(ffi::SQLITE_OPEN_READWRITE);
    /// Create the database file if it does not exist.
    pub const CREATE: Self = Self(ffi::SQLITE_OPEN_CREATE);
    /// Interpret the path as a URI.
    pub const URI: Self = Self(ffi::SQLITE_OPEN_URI);
    /// Open an in-memory database.
    pub const MEMORY: Self = Self(ffi::SQLITE_OPEN_MEMORY);
    /// Force the serialized threading mode for this handle.
    pub const FULL_MUTEX: Self = Self(ffi::SQLITE_OPEN_FULLMUTEX);
    /// Disable the handle's own mutexes.
    pub const NO_MUTEX: Self = Self(ffi::SQLITE_OPEN_NOMUTEX);

    /// Returns `true` if all flags in `other` are set in `self`.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub(crate) const fn bits(self) -> c_int {
        self.0
    }
}

impl Default for OpenFlags {
    fn default() -> Self {
        Self::READ_WRITE | Self::CREATE
    }
}

impl std::ops::BitOr for OpenFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

// ── Setup actions ───────────────────────────────────────────────────────

/// Per-connection configuration toggle applied through the engine's
/// db-config interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbOption {
    /// Enforce foreign key constraints.
    ForeignKeys,
    /// Allow trigger execution.
    Triggers,
    /// Allow view queries.
    Views,
    /// Permit the legacy two-argument FTS3 tokenizer interface.
    Fts3Tokenizer,
    /// Permit loading run-time extensions.
    LoadExtension,
    /// Refuse to corrupt the database even via writable schema.
    Defensive,
}

impl DbOption {
    const fn code(self) -> c_int {
        match self {
            Self::ForeignKeys => ffi::SQLITE_DBCONFIG_ENABLE_FKEY,
            Self::Triggers => ffi::SQLITE_DBCONFIG_ENABLE_TRIGGER,
            Self::Views => ffi::SQLITE_DBCONFIG_ENABLE_VIEW,
            Self::Fts3Tokenizer => ffi::SQLITE_DBCONFIG_ENABLE_FTS3_TOKENIZER,
            Self::LoadExtension => ffi::SQLITE_DBCONFIG_ENABLE_LOAD_EXTENSION,
            Self::Defensive => ffi::SQLITE_DBCONFIG_DEFENSIVE,
        }
    }
}

/// Per-connection runtime limit category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Limit {
    /// Maximum size of any string, blob or table row, in bytes.
    Length,
    /// Maximum length of an SQL statement, in bytes.
    SqlLength,
    /// Maximum number of columns.
    Column,
    /// Maximum expression tree depth.
    ExprDepth,
    /// Maximum number of terms in a compound SELECT.
    CompoundSelect,
    /// Maximum number of virtual machine instructions per statement.
    VdbeOp,
    /// Maximum number of arguments to a function.
    FunctionArg,
    /// Maximum number of attached databases.
    Attached,
    /// Maximum length of a LIKE or GLOB pattern.
    LikePatternLength,
    /// Maximum index of any host parameter.
    VariableNumber,
    /// Maximum trigger recursion depth.
    TriggerDepth,
    /// Maximum number of auxiliary worker threads.
    WorkerThreads,
}

impl Limit {
    const fn code(self) -> c_int {
        match self {
            Self::Length => ffi::SQLITE_LIMIT_LENGTH,
            Self::SqlLength => ffi::SQLITE_LIMIT_SQL_LENGTH,
            Self::Column => ffi::SQLITE_LIMIT_COLUMN,
            Self::ExprDepth => ffi::SQLITE_LIMIT_EXPR_DEPTH,
            Self::CompoundSelect => ffi::SQLITE_LIMIT_COMPOUND_SELECT,
            Self::VdbeOp => ffi::SQLITE_LIMIT_VDBE_OP,
            Self::FunctionArg => ffi::SQLITE_LIMIT_FUNCTION_ARG,
            Self::Attached => ffi::SQLITE_LIMIT_ATTACHED,
            Self::LikePatternLength => ffi::SQLITE_LIMIT_LIKE_PATTERN_LENGTH,
            Self::VariableNumber => ffi::SQLITE_LIMIT_VARIABLE_NUMBER,
            Self::TriggerDepth => ffi::SQLITE_LIMIT_TRIGGER_DEPTH,
            Self::WorkerThreads => ffi::SQLITE_LIMIT_WORKER_THREADS,
        }
    }
}

/// One step of the ordered open-time setup list.
#[derive(Debug, Clone)]
pub enum SetupAction {
    /// Execute a setup statement (typically a pragma).
    Statement(String),
    /// Flip a per-connection config toggle.
    Toggle(DbOption, bool),
    /// Assign a runtime limit.
    Limit(Limit, i32),
}

// ── Transaction behaviour ───────────────────────────────────────────────

/// Locking behaviour of an explicit transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionBehavior {
    /// `BEGIN DEFERRED` (the default).
    Deferred,
    /// `BEGIN IMMEDIATE`, acquires a RESERVED lock up front.
    Immediate,
    /// `BEGIN EXCLUSIVE`, blocks other writers for the duration.
    Exclusive,
}

impl TransactionBehavior {
    const fn sql(self) -> &'static str {
        match self {
            Self::Deferred => "BEGIN DEFERRED",
            Self::Immediate => "BEGIN IMMEDIATE",
            Self::Exclusive => "BEGIN EXCLUSIVE",
        }
    }
}

/// Callback invoked every N virtual-machine steps; returning `true`
/// interrupts the running statement.
pub type ProgressCallback = Box<dyn FnMut() -> bool + Send>;

// ── Connection ──────────────────────────────────────────────────────────

/// An open database connection.
pub struct Connection {
    /// Raw `sqlite3*` handle. Owned exclusively; closed exactly once in
    /// drop.
    db: *mut c_void,
    /// The registered progress handler, kept alive for the engine.
    progress: RefCell<Option<Box<ProgressCallback>>>,
    /// The registered authorizer, kept alive for the engine.
    pub(crate) authorizer: RefCell<Option<Box<crate::authorizer::AuthorizerCallback>>>,
}

// Safety: a connection may move between threads (the handle is opened in
// serialized mode) but is never used from two threads at once; the manager
// enforces single-thread affinity structurally.
unsafe impl Send for Connection {}

impl Connection {
    // ── Construction ────────────────────────────────────────────────────

    /// Opens a database at `path`, applying `setup` strictly in order.
    ///
    /// The first failing action closes the handle and surfaces
    /// [`Error::Open`]; a half-configured connection is never returned.
    /// After setup the connection is verified with a read of the schema
    /// table.
    pub fn open(path: &Path, flags: OpenFlags, setup: &[SetupAction]) -> Result<Self> {
        let conn = Self::open_raw(path, flags)?;
        conn.apply_setup(setup)
            .and_then(|()| conn.verify())
            .map_err(|err| Error::Open(err.to_string()))?;
        Ok(conn)
    }

    /// Opens a private in-memory database with default setup.
    pub fn open_in_memory() -> Result<Self> {
        Self::open(
            Path::new(":memory:"),
            OpenFlags::default() | OpenFlags::MEMORY,
            &[],
        )
    }

    /// Opens the handle without running setup or verification.
    ///
    /// The encryption layer uses this directly so it can issue the keying
    /// pragma before any other action.
    pub(crate) fn open_raw(path: &Path, flags: OpenFlags) -> Result<Self> {
        let path_str = path
            .to_str()
            .ok_or_else(|| Error::Open("database path is not valid UTF-8".to_string()))?;
        let c_path = CString::new(path_str)
            .map_err(|_| Error::Open("database path contains a nul byte".to_string()))?;

        let mut db: *mut c_void = std::ptr::null_mut();
        // FULLMUTEX keeps the handle safe to move across threads.
        let bits = (flags | OpenFlags::FULL_MUTEX).bits();
        // Safety: `c_path` outlives the call and `db` is a valid
        // out-pointer.
        let rc = unsafe { ffi::sqlite3_open_v2(c_path.as_ptr(), &mut db, bits, std::ptr::null()) };
        if rc != ffi::SQLITE_OK {
            let message = if db.is_null() {
                "out of memory".to_string()
            } else {
                let msg = statement::error_message(db);
                // Safety: a failed open still returns a handle that must be
                // closed.
                unsafe {
                    ffi::sqlite3_close_v2(db);
                }
                msg
            };
            return Err(Error::Open(message));
        }
        debug!("opened database at {path_str}");
        Ok(Self {
            db,
            progress: RefCell::new(None),
            authorizer: RefCell::new(None),
        })
    }

    /// Applies setup actions strictly in order, stopping at the first
    /// failure.
    pub(crate) fn apply_setup(&self, setup: &[SetupAction]) -> Result<()> {
        for action in setup {
            match action {
                SetupAction::Statement(sql) => self.execute_batch(sql)?,
                SetupAction::Toggle(option, on) => self.set_db_option(*option, *on)?,
                SetupAction::Limit(limit, value) => {
                    self.limit(*limit, *value);
                }
            }
        }
        Ok(())
    }

    /// Verifies the connection is readable (and, for keyed databases, that
    /// the key matches) by counting the schema table.
    pub(crate) fn verify(&self) -> Result<()> {
        self.query_row("SELECT count(*) FROM sqlite_master", &[])
            .map(|_| ())
    }

    /// The raw handle, for registration calls in the extension modules.
    pub(crate) fn handle(&self) -> *mut c_void {
        self.db
    }

    // ── Script execution ────────────────────────────────────────────────

    /// Runs one or more semicolon-delimited statements, invoking `on_row`
    /// for every result row.
    ///
    /// The callback returning `false` aborts iteration with
    /// [`Error::Aborted`].
    pub fn execute<F>(&self, sql: &str, mut on_row: F) -> Result<()>
    where
        F: FnMut(&OwnedRow) -> bool,
    {
        let mut rest = sql;
        while !rest.trim().is_empty() {
            let prepared = statement::prepare_raw(self.db, rest, false)?;
            let tail = prepared.tail;
            if let Some(mut stmt) = prepared.statement {
                loop {
                    match stmt.step()? {
                        StepResult::Row => {
                            let row = OwnedRow::read(&stmt);
                            if !on_row(&row) {
                                return Err(Error::Aborted);
                            }
                        }
                        StepResult::Done => break,
                    }
                }
            }
            if tail == 0 {
                break;
            }
            rest = &rest[tail..];
        }
        Ok(())
    }

    /// Runs a batch of statements, discarding any result rows.
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        let c_sql =
            CString::new(sql).map_err(|_| Error::Prepare("sql contains a nul byte".to_string()))?;
        self.exec_cstring(&c_sql)
    }

    /// Runs a batch of statements from key-bearing SQL, wiping the
    /// marshalled buffer afterwards.
    pub fn execute_batch_zeroized(&self, sql: Zeroizing<String>) -> Result<()> {
        let c_sql = CString::new(sql.as_str())
            .map_err(|_| Error::Prepare("sql contains a nul byte".to_string()))?;
        let result = self.exec_cstring(&c_sql);
        let mut bytes = c_sql.into_bytes();
        bytes.zeroize();
        result
    }

    fn exec_cstring(&self, c_sql: &CString) -> Result<()> {
        let mut errmsg: *mut c_char = std::ptr::null_mut();
        // Safety: pointers are valid for the duration of the call; the
        // engine allocates `errmsg`, which is copied and freed below.
        let rc = unsafe {
            ffi::sqlite3_exec(
                self.db,
                c_sql.as_ptr(),
                std::ptr::null(),
                std::ptr::null_mut(),
                &mut errmsg,
            )
        };
        if rc == ffi::SQLITE_OK {
            return Ok(());
        }
        let message = if errmsg.is_null() {
            statement::error_message(self.db)
        } else {
            // Safety: `errmsg` is a valid C string allocated by the engine.
            unsafe {
                let msg = std::ffi::CStr::from_ptr(errmsg)
                    .to_string_lossy()
                    .into_owned();
                ffi::sqlite3_free(errmsg.cast());
                msg
            }
        };
        Err(Error::from_code(rc, message))
    }

    /// Runs a single statement with positional parameters and returns the
    /// number of rows changed.
    pub fn execute_params(&self, sql: &str, params: &[Value]) -> Result<usize> {
        let mut stmt = self.prepare(sql)?;
        stmt.bind_values(params)?;
        while stmt.step()? == StepResult::Row {}
        Ok(self.changes())
    }

    // ── Queries ─────────────────────────────────────────────────────────

    /// Runs a query and materializes every result row.
    pub fn query_rows(&self, sql: &str, params: &[Value]) -> Result<Vec<OwnedRow>> {
        let mut stmt = self.prepare(sql)?;
        stmt.bind_values(params)?;
        let mut rows = Vec::new();
        while stmt.step()? == StepResult::Row {
            rows.push(OwnedRow::read(&stmt));
        }
        Ok(rows)
    }

    /// Runs a query expected to produce exactly one row.
    pub fn query_row(&self, sql: &str, params: &[Value]) -> Result<OwnedRow> {
        self.query_row_optional(sql, params)?
            .ok_or_else(|| Error::Other {
                code: ffi::SQLITE_DONE,
                message: "query returned no rows".to_string(),
            })
    }

    /// Runs a query returning at most one row.
    pub fn query_row_optional(&self, sql: &str, params: &[Value]) -> Result<Option<OwnedRow>> {
        let mut stmt = self.prepare(sql)?;
        stmt.bind_values(params)?;
        match stmt.step()? {
            StepResult::Row => Ok(Some(OwnedRow::read(&stmt))),
            StepResult::Done => Ok(None),
        }
    }

    // ── Prepared statements ─────────────────────────────────────────────

    /// Prepares the first statement of `sql`.
    pub fn prepare(&self, sql: &str) -> Result<Statement> {
        statement::prepare_raw(self.db, sql, false)?
            .statement
            .ok_or_else(|| Error::Prepare("empty statement".to_string()))
    }

    /// Prepares the first statement of `sql` in the engine's long-lived
    /// mode, for statements that will be reused many times.
    pub fn prepare_persistent(&self, sql: &str) -> Result<Statement> {
        statement::prepare_raw(self.db, sql, true)?
            .statement
            .ok_or_else(|| Error::Prepare("empty statement".to_string()))
    }

    /// Prepares the first statement of a multi-statement script, returning
    /// the statement (or `None` for blank input) and the byte offset of the
    /// unconsumed tail.
    pub fn prepare_with_tail(&self, sql: &str) -> Result<(Option<Statement>, usize)> {
        let prepared = statement::prepare_raw(self.db, sql, false)?;
        Ok((prepared.statement, prepared.tail))
    }

    // ── Transactions & savepoints ───────────────────────────────────────

    /// Runs `body` inside a transaction with the given locking behaviour.
    ///
    /// Commits when `body` returns `Ok`; rolls back on `Err`. The rollback
    /// is best-effort so the body's error, not the rollback's, reaches the
    /// caller.
    pub fn in_transaction<T, F>(&self, behavior: TransactionBehavior, body: F) -> Result<T>
    where
        F: FnOnce(&Self) -> Result<T>,
    {
        self.execute_batch(behavior.sql())?;
        match body(self) {
            Ok(value) => {
                self.execute_batch("COMMIT")?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = self.execute_batch("ROLLBACK") {
                    warn!("rollback after failed transaction also failed: {rollback_err}");
                }
                Err(err)
            }
        }
    }

    /// Begins a guard-style transaction (deferred locking) that rolls back
    /// on drop unless committed.
    pub fn transaction(&self) -> Result<Transaction<'_>> {
        Transaction::begin(self, TransactionBehavior::Deferred)
    }

    /// Begins a guard-style transaction with explicit locking behaviour.
    pub fn transaction_with(&self, behavior: TransactionBehavior) -> Result<Transaction<'_>> {
        Transaction::begin(self, behavior)
    }

    /// Runs `body` inside a named savepoint; releases on `Ok`, rolls back
    /// to the savepoint on `Err`.
    pub fn in_savepoint<T, F>(&self, name: &str, body: F) -> Result<T>
    where
        F: FnOnce(&Self) -> Result<T>,
    {
        let quoted = quote_identifier(name);
        self.execute_batch(&format!("SAVEPOINT {quoted}"))?;
        match body(self) {
            Ok(value) => {
                self.execute_batch(&format!("RELEASE {quoted}"))?;
                Ok(value)
            }
            Err(err) => {
                let unwind = format!("ROLLBACK TO {quoted}; RELEASE {quoted}");
                if let Err(rollback_err) = self.execute_batch(&unwind) {
                    warn!("savepoint rollback also failed: {rollback_err}");
                }
                Err(err)
            }
        }
    }

    // ── Tuning ──────────────────────────────────────────────────────────

    /// Sets the busy-wait ceiling; lock-contended operations fail with
    /// [`Error::Busy`] once it elapses.
    pub fn busy_timeout(&self, timeout: Duration) -> Result<()> {
        let ms = c_int::try_from(timeout.as_millis())
            .map_err(|_| Error::Parameter("busy timeout out of range".to_string()))?;
        // Safety: `self.db` is live.
        let rc = unsafe { ffi::sqlite3_busy_timeout(self.db, ms) };
        if rc == ffi::SQLITE_OK {
            Ok(())
        } else {
            Err(Error::from_code(rc, statement::error_message(self.db)))
        }
    }

    /// Assigns a runtime limit, returning its previous value.
    pub fn limit(&self, limit: Limit, value: i32) -> i32 {
        // Safety: `self.db` is live; unknown values are clamped by the
        // engine.
        unsafe { ffi::sqlite3_limit(self.db, limit.code(), value) }
    }

    /// Flips a per-connection config toggle.
    pub fn set_db_option(&self, option: DbOption, on: bool) -> Result<()> {
        // Safety: the int-toggle form of db-config takes an int plus an
        // optional out-pointer.
        let rc = unsafe {
            ffi::sqlite3_db_config(
                self.db,
                option.code(),
                c_int::from(on),
                std::ptr::null_mut::<c_int>(),
            )
        };
        if rc == ffi::SQLITE_OK {
            Ok(())
        } else {
            Err(Error::from_code(rc, statement::error_message(self.db)))
        }
    }

    /// Installs a progress handler invoked every `steps` virtual-machine
    /// instructions. The callback returning `true` interrupts the running
    /// statement, which then fails with [`Error::Aborted`].
    pub fn progress_handler<F>(&self, steps: u32, callback: F)
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let boxed: Box<ProgressCallback> = Box::new(Box::new(callback));
        let user_data: *mut ProgressCallback = std::ptr::from_ref(&*boxed).cast_mut();
        // Safety: the box is stored in `self.progress` and outlives the
        // registration; it is replaced or cleared only through the same
        // slot.
        unsafe {
            ffi::sqlite3_progress_handler(
                self.db,
                c_int::try_from(steps).unwrap_or(c_int::MAX),
                Some(progress_trampoline),
                user_data.cast(),
            );
        }
        *self.progress.borrow_mut() = Some(boxed);
    }

    /// Removes any installed progress handler.
    pub fn clear_progress_handler(&self) {
        // Safety: a null handler unregisters.
        unsafe {
            ffi::sqlite3_progress_handler(self.db, 0, None, std::ptr::null_mut());
        }
        *self.progress.borrow_mut() = None;
    }

    /// Frees as much memory held by this connection as practical, e.g.
    /// under memory pressure.
    pub fn release_memory(&self) -> Result<()> {
        // Safety: `self.db` is live.
        let rc = unsafe { ffi::sqlite3_db_release_memory(self.db) };
        if rc == ffi::SQLITE_OK {
            Ok(())
        } else {
            Err(Error::from_code(rc, statement::error_message(self.db)))
        }
    }

    // ── Metadata ────────────────────────────────────────────────────────

    /// Rowid of the most recent successful INSERT on this connection.
    pub fn last_insert_rowid(&self) -> i64 {
        // Safety: `self.db` is live.
        unsafe { ffi::sqlite3_last_insert_rowid(self.db) }
    }

    /// Rows changed by the most recent statement.
    pub fn changes(&self) -> usize {
        // Safety: `self.db` is live.
        let n = unsafe { ffi::sqlite3_changes(self.db) };
        usize::try_from(n).unwrap_or(0)
    }

    /// Total rows changed since the connection opened.
    pub fn total_changes(&self) -> usize {
        // Safety: `self.db` is live.
        let n = unsafe { ffi::sqlite3_total_changes(self.db) };
        usize::try_from(n).unwrap_or(0)
    }

    /// Returns `true` if a table (or view) with the given name exists.
    pub fn has_table(&self, name: &str) -> Result<bool> {
        let row = self.query_row(
            "SELECT count(*) FROM sqlite_master WHERE type IN ('table', 'view') AND name = ?1",
            &[Value::Text(name.to_string())],
        )?;
        Ok(row.value(0).and_then(Value::as_integer).unwrap_or(0) > 0)
    }

    /// Reads the schema-version ledger.
    pub fn user_version(&self) -> Result<u32> {
        let row = self.query_row("PRAGMA user_version", &[])?;
        let version = row.value(0).and_then(Value::as_integer).unwrap_or(0);
        // The ledger is an unsigned schema counter; the engine stores it in
        // a 32-bit slot.
        Ok(u32::try_from(version).unwrap_or(0))
    }

    /// Writes the schema-version ledger.
    pub fn set_user_version(&self, version: u32) -> Result<()> {
        self.execute_batch(&format!("PRAGMA user_version = {version}"))
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if !self.db.is_null() {
            debug!("closing database connection");
            // Safety: the handle is owned by this wrapper and closed
            // exactly once; close_v2 defers until outstanding statements
            // are finalized.
            unsafe {
                ffi::sqlite3_close_v2(self.db);
            }
            self.db = std::ptr::null_mut();
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}

/// Trampoline for the progress handler.
///
/// # Safety
///
/// `user_data` is the pointer registered in
/// [`Connection::progress_handler`]; it stays valid until unregistered.
unsafe extern "C" fn progress_trampoline(user_data: *mut c_void) -> c_int {
    let callback = &mut *user_data.cast::<ProgressCallback>();
    c_int::from(callback())
}

/// Doubles embedded quotes so `name` is safe inside a quoted identifier.
fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

// ── Guard-style transaction ─────────────────────────────────────────────

/// An open transaction that rolls back on drop unless committed.
pub struct Transaction<'conn> {
    conn: &'conn Connection,
    committed: bool,
}

impl<'conn> Transaction<'conn> {
    fn begin(conn: &'conn Connection, behavior: TransactionBehavior) -> Result<Self> {
        conn.execute_batch(behavior.sql())?;
        Ok(Self {
            conn,
            committed: false,
        })
    }

    /// Commits the transaction.
    pub fn commit(mut self) -> Result<()> {
        self.conn.execute_batch("COMMIT")?;
        self.committed = true;
        Ok(())
    }

    /// See [`Connection::execute_batch`].
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        self.conn.execute_batch(sql)
    }

    /// See [`Connection::execute_params`].
    pub fn execute_params(&self, sql: &str, params: &[Value]) -> Result<usize> {
        self.conn.execute_params(sql, params)
    }

    /// See [`Connection::query_rows`].
    pub fn query_rows(&self, sql: &str, params: &[Value]) -> Result<Vec<OwnedRow>> {
        self.conn.query_rows(sql, params)
    }

    /// See [`Connection::query_row_optional`].
    pub fn query_row_optional(&self, sql: &str, params: &[Value]) -> Result<Option<OwnedRow>> {
        self.conn.query_row_optional(sql, params)
    }

    /// See [`Connection::prepare`].
    pub fn prepare(&self, sql: &str) -> Result<Statement> {
        self.conn.prepare(sql)
    }

    /// See [`Connection::last_insert_rowid`].
    pub fn last_insert_rowid(&self) -> i64 {
        self.conn.last_insert_rowid()
    }

    /// See [`Connection::changes`].
    pub fn changes(&self) -> usize {
        self.conn.changes()
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.committed {
            // Best-effort rollback.
            if let Err(err) = self.conn.execute_batch("ROLLBACK") {
                warn!("rollback on transaction drop failed: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params;

    #[test]
    fn open_applies_setup_in_order() {
        let conn = Connection::open(
            Path::new(":memory:"),
            OpenFlags::default() | OpenFlags::MEMORY,
            &[
                SetupAction::Statement("PRAGMA cache_size = 100".to_string()),
                SetupAction::Toggle(DbOption::ForeignKeys, true),
                SetupAction::Limit(Limit::SqlLength, 1_000_000),
            ],
        )
        .expect("open with setup");
        let fk = conn
            .query_row("PRAGMA foreign_keys", &[])
            .expect("read pragma");
        assert_eq!(fk.value(0), Some(&Value::Integer(1)));
    }

    #[test]
    fn open_fails_atomically_on_bad_setup() {
        let result = Connection::open(
            Path::new(":memory:"),
            OpenFlags::default() | OpenFlags::MEMORY,
            &[SetupAction::Statement("NOT VALID SQL".to_string())],
        );
        assert!(matches!(result, Err(Error::Open(_))));
    }

    #[test]
    fn execute_runs_multiple_statements() {
        let conn = Connection::open_in_memory().expect("open");
        conn.execute(
            "CREATE TABLE t (id INTEGER); INSERT INTO t VALUES (1); INSERT INTO t VALUES (2);",
            |_| true,
        )
        .expect("script");
        let rows = conn.query_rows("SELECT id FROM t ORDER BY id", &[]).expect("query");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].value(0), Some(&Value::Integer(2)));
    }

    #[test]
    fn execute_callback_stop_aborts() {
        let conn = Connection::open_in_memory().expect("open");
        conn.execute_batch("CREATE TABLE t (id INTEGER); INSERT INTO t VALUES (1), (2), (3);")
            .expect("seed");
        let mut seen = 0;
        let result = conn.execute("SELECT id FROM t", |_| {
            seen += 1;
            false
        });
        assert!(matches!(result, Err(Error::Aborted)));
        assert_eq!(seen, 1);
    }

    #[test]
    fn in_transaction_rolls_back_on_error() {
        let conn = Connection::open_in_memory().expect("open");
        conn.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY)").expect("create");
        let result: Result<()> = conn.in_transaction(TransactionBehavior::Immediate, |c| {
            c.execute_params("INSERT INTO t (id) VALUES (?1)", params![7i64])?;
            Err(Error::Aborted)
        });
        assert!(result.is_err());
        let rows = conn.query_rows("SELECT id FROM t", &[]).expect("query");
        assert!(rows.is_empty());
    }

    #[test]
    fn savepoint_rolls_back_on_error() {
        let conn = Connection::open_in_memory().expect("open");
        conn.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY)").expect("create");
        conn.execute_params("INSERT INTO t (id) VALUES (1)", &[]).expect("seed");
        let result: Result<()> = conn.in_savepoint("sp_test", |c| {
            c.execute_params("INSERT INTO t (id) VALUES (2)", &[])?;
            Err(Error::Aborted)
        });
        assert!(result.is_err());
        let rows = conn.query_rows("SELECT id FROM t", &[]).expect("query");
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn named_parameters_bind() {
        let conn = Connection::open_in_memory().expect("open");
        conn.execute_batch("CREATE TABLE t (id INTEGER, label TEXT)").expect("create");
        let mut stmt = conn
            .prepare("INSERT INTO t (id, label) VALUES (:id, :label)")
            .expect("prepare");
        stmt.bind_name(":id", &Value::Integer(3)).expect("bind id");
        stmt.bind_name(":label", &Value::Text("three".into())).expect("bind label");
        assert_eq!(stmt.step().expect("step"), StepResult::Done);
        let row = conn
            .query_row("SELECT label FROM t WHERE id = 3", &[])
            .expect("query");
        assert_eq!(row.get("label"), Some(&Value::Text("three".into())));
    }

    #[test]
    fn has_table_and_ledger() {
        let conn = Connection::open_in_memory().expect("open");
        assert!(!conn.has_table("t").expect("probe"));
        conn.execute_batch("CREATE TABLE t (id INTEGER)").expect("create");
        assert!(conn.has_table("t").expect("probe"));
        assert_eq!(conn.user_version().expect("read"), 0);
        conn.set_user_version(9).expect("write");
        assert_eq!(conn.user_version().expect("read"), 9);
    }

    #[test]
    fn progress_handler_interrupts() {
        let conn = Connection::open_in_memory().expect("open");
        conn.execute_batch("CREATE TABLE t (id INTEGER)").expect("create");
        conn.progress_handler(1, || true);
        let result = conn.query_rows(
            "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c LIMIT 100000) \
             SELECT count(*) FROM c",
            &[],
        );
        assert!(matches!(result, Err(Error::Aborted)));
        conn.clear_progress_handler();
        let row = conn.query_row("SELECT 1", &[]).expect("query after clear");
        assert_eq!(row.value(0), Some(&Value::Integer(1)));
    }
}
