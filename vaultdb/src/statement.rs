//! Safe wrapper around a prepared statement, plus row views.

use std::cell::OnceCell;
use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int, c_void};

use crate::error::{Error, Result};
use crate::ffi;
use crate::value::Value;

/// Result of a single `sqlite3_step` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepResult {
    /// A result row is available.
    Row,
    /// The statement has finished executing.
    Done,
}

/// A prepared statement.
///
/// Statements are created via [`Connection::prepare`](crate::Connection::prepare)
/// and finalized when dropped. Column metadata (names, count) is computed
/// once on first access; bind and step state is mutable and must be cleared
/// with [`reset`](Self::reset) and [`clear_bindings`](Self::clear_bindings)
/// before the statement is reused for a different invocation.
pub struct Statement {
    /// Raw `sqlite3_stmt*` handle. Null only after finalization in drop.
    stmt: *mut c_void,
    /// Raw `sqlite3*` handle, kept for error messages.
    db: *mut c_void,
    /// Column names, resolved lazily.
    columns: OnceCell<Vec<String>>,
}

// Safety: the wrapper enforces single-owner semantics and the raw pointers
// are never shared between threads; a `Statement` may move to another
// thread only together with its owning connection.
unsafe impl Send for Statement {}

/// Outcome of preparing one statement out of a possibly multi-statement
/// script.
pub(crate) struct Prepared {
    /// The compiled statement, or `None` when the input was only whitespace
    /// or comments.
    pub statement: Option<Statement>,
    /// Byte offset of the unconsumed tail within the input SQL.
    pub tail: usize,
}

/// Compiles the first statement of `sql` against `db`.
///
/// `persistent` requests the engine's long-lived statement mode, used for
/// cached statements.
pub(crate) fn prepare_raw(db: *mut c_void, sql: &str, persistent: bool) -> Result<Prepared> {
    let c_sql =
        CString::new(sql).map_err(|_| Error::Prepare("sql contains a nul byte".to_string()))?;
    let flags = if persistent {
        ffi::SQLITE_PREPARE_PERSISTENT
    } else {
        0
    };
    let mut stmt: *mut c_void = std::ptr::null_mut();
    let mut tail: *const c_char = std::ptr::null();
    // Safety: `c_sql` outlives the call; out-pointers are valid locals.
    let rc = unsafe {
        ffi::sqlite3_prepare_v3(db, c_sql.as_ptr(), -1, flags, &mut stmt, &mut tail)
    };
    if rc != ffi::SQLITE_OK {
        return Err(prepare_error(db, rc));
    }
    let offset = if tail.is_null() {
        sql.len()
    } else {
        // Safety: the engine guarantees `tail` points into the input
        // buffer.
        let diff = unsafe { tail.offset_from(c_sql.as_ptr()) };
        usize::try_from(diff).unwrap_or(sql.len()).min(sql.len())
    };
    let statement = if stmt.is_null() {
        None
    } else {
        // Safety: `stmt` was just produced by the engine for `db`.
        Some(unsafe { Statement::from_raw(stmt, db) })
    };
    Ok(Prepared {
        statement,
        tail: offset,
    })
}

fn prepare_error(db: *mut c_void, code: c_int) -> Error {
    let message = error_message(db);
    match code {
        ffi::SQLITE_BUSY => Error::Busy,
        ffi::SQLITE_LOCKED => Error::Locked(message),
        _ => Error::Prepare(message),
    }
}

/// Reads the engine's current error message for `db`.
pub(crate) fn error_message(db: *mut c_void) -> String {
    // Safety: `sqlite3_errmsg` returns a valid C string owned by the
    // connection, copied out before any further engine call.
    unsafe {
        let ptr = ffi::sqlite3_errmsg(db);
        if ptr.is_null() {
            "unknown error".to_string()
        } else {
            CStr::from_ptr(ptr).to_string_lossy().into_owned()
        }
    }
}

impl Statement {
    /// Wraps a raw statement/connection handle pair.
    ///
    /// # Safety
    ///
    /// `stmt` must be a valid, non-null `sqlite3_stmt*` owned by `db`.
    pub(crate) unsafe fn from_raw(stmt: *mut c_void, db: *mut c_void) -> Self {
        debug_assert!(!stmt.is_null());
        Self {
            stmt,
            db,
            columns: OnceCell::new(),
        }
    }

    // ── Binding ─────────────────────────────────────────────────────────

    /// Binds one value at a 1-based parameter position.
    pub fn bind(&mut self, index: usize, value: &Value) -> Result<()> {
        let idx = c_int::try_from(index)
            .map_err(|_| Error::Parameter(format!("parameter index {index} out of range")))?;
        let rc = match value {
            // Safety (all arms): `self.stmt` is live; TRANSIENT makes the
            // engine copy text/blob payloads before returning.
            Value::Integer(v) => unsafe { ffi::sqlite3_bind_int64(self.stmt, idx, *v) },
            Value::Float(v) => unsafe { ffi::sqlite3_bind_double(self.stmt, idx, *v) },
            Value::Text(v) => unsafe {
                ffi::sqlite3_bind_text(
                    self.stmt,
                    idx,
                    v.as_ptr().cast(),
                    c_int::try_from(v.len()).map_err(|_| Error::Misuse)?,
                    ffi::SQLITE_TRANSIENT,
                )
            },
            Value::Blob(v) => unsafe {
                ffi::sqlite3_bind_blob(
                    self.stmt,
                    idx,
                    v.as_ptr().cast(),
                    c_int::try_from(v.len()).map_err(|_| Error::Misuse)?,
                    ffi::SQLITE_TRANSIENT,
                )
            },
            Value::Null => unsafe { ffi::sqlite3_bind_null(self.stmt, idx) },
        };
        if rc != ffi::SQLITE_OK {
            return Err(self.last_error(rc));
        }
        Ok(())
    }

    /// Binds one value to a named parameter (e.g. `:id` or `$id`).
    pub fn bind_name(&mut self, name: &str, value: &Value) -> Result<()> {
        let c_name = CString::new(name)
            .map_err(|_| Error::Parameter("parameter name contains a nul byte".to_string()))?;
        // Safety: `self.stmt` is live and `c_name` outlives the call.
        let idx = unsafe { ffi::sqlite3_bind_parameter_index(self.stmt, c_name.as_ptr()) };
        if idx == 0 {
            return Err(Error::Parameter(format!("unknown parameter name: {name}")));
        }
        #[allow(clippy::cast_sign_loss)]
        self.bind(idx as usize, value)
    }

    /// Binds a slice of values to consecutive 1-based positions.
    pub fn bind_values(&mut self, values: &[Value]) -> Result<()> {
        for (i, value) in values.iter().enumerate() {
            self.bind(i + 1, value)?;
        }
        Ok(())
    }

    /// Number of parameter slots the statement declares.
    pub fn parameter_count(&self) -> usize {
        // Safety: `self.stmt` is live.
        let n = unsafe { ffi::sqlite3_bind_parameter_count(self.stmt) };
        usize::try_from(n).unwrap_or(0)
    }

    // ── Stepping ────────────────────────────────────────────────────────

    /// Executes a single step.
    pub fn step(&mut self) -> Result<StepResult> {
        // Safety: `self.stmt` is live.
        let rc = unsafe { ffi::sqlite3_step(self.stmt) };
        match rc {
            ffi::SQLITE_ROW => Ok(StepResult::Row),
            ffi::SQLITE_DONE => Ok(StepResult::Done),
            _ => Err(self.last_error(rc)),
        }
    }

    /// Resets the statement so it can be stepped again.
    pub fn reset(&mut self) -> Result<()> {
        // Safety: `self.stmt` is live.
        let rc = unsafe { ffi::sqlite3_reset(self.stmt) };
        if rc == ffi::SQLITE_OK {
            Ok(())
        } else {
            Err(self.last_error(rc))
        }
    }

    /// Clears all parameter bindings back to NULL.
    pub fn clear_bindings(&mut self) -> Result<()> {
        // Safety: `self.stmt` is live.
        let rc = unsafe { ffi::sqlite3_clear_bindings(self.stmt) };
        if rc == ffi::SQLITE_OK {
            Ok(())
        } else {
            Err(self.last_error(rc))
        }
    }

    // ── Metadata ────────────────────────────────────────────────────────

    /// Number of columns in the result set.
    pub fn column_count(&self) -> usize {
        // Safety: `self.stmt` is live.
        let n = unsafe { ffi::sqlite3_column_count(self.stmt) };
        usize::try_from(n).unwrap_or(0)
    }

    /// All column names, resolved once and cached.
    pub fn column_names(&self) -> &[String] {
        self.columns.get_or_init(|| {
            (0..self.column_count())
                .map(|i| {
                    // Safety: `i` is within the column count.
                    unsafe {
                        let ptr = ffi::sqlite3_column_name(self.stmt, to_cint(i));
                        if ptr.is_null() {
                            String::new()
                        } else {
                            CStr::from_ptr(ptr).to_string_lossy().into_owned()
                        }
                    }
                })
                .collect()
        })
    }

    /// Name of column `index`.
    pub fn column_name(&self, index: usize) -> Option<&str> {
        self.column_names().get(index).map(String::as_str)
    }

    /// Position of the column called `name`.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.column_names().iter().position(|n| n == name)
    }

    /// The original SQL text of the statement.
    pub fn sql(&self) -> String {
        // Safety: `sqlite3_sql` returns the statement's own UTF-8 copy.
        unsafe {
            let ptr = ffi::sqlite3_sql(self.stmt);
            if ptr.is_null() {
                String::new()
            } else {
                CStr::from_ptr(ptr).to_string_lossy().into_owned()
            }
        }
    }

    /// Whether the statement makes no direct changes to the database.
    pub fn readonly(&self) -> bool {
        // Safety: `self.stmt` is live.
        unsafe { ffi::sqlite3_stmt_readonly(self.stmt) != 0 }
    }

    // ── Column decoding ─────────────────────────────────────────────────

    /// Decodes column `index` of the current row into a [`Value`].
    ///
    /// # Panics
    ///
    /// Panics if the engine reports a storage class outside the five
    /// documented ones; that is an internal-consistency fault, not a
    /// recoverable error.
    pub fn value(&self, index: usize) -> Value {
        let idx = to_cint(index);
        // Safety (all arms): `self.stmt` is live and positioned on a row;
        // text/blob pointers are copied out before the next engine call.
        let type_tag = unsafe { ffi::sqlite3_column_type(self.stmt, idx) };
        match type_tag {
            ffi::SQLITE_INTEGER => {
                Value::Integer(unsafe { ffi::sqlite3_column_int64(self.stmt, idx) })
            }
            ffi::SQLITE_FLOAT => Value::Float(unsafe { ffi::sqlite3_column_double(self.stmt, idx) }),
            ffi::SQLITE_TEXT => unsafe {
                let ptr = ffi::sqlite3_column_text(self.stmt, idx);
                let len = ffi::sqlite3_column_bytes(self.stmt, idx);
                if ptr.is_null() || len <= 0 {
                    Value::Text(String::new())
                } else {
                    let bytes = std::slice::from_raw_parts(ptr, as_usize(len));
                    Value::Text(String::from_utf8_lossy(bytes).into_owned())
                }
            },
            ffi::SQLITE_BLOB => unsafe {
                let ptr = ffi::sqlite3_column_blob(self.stmt, idx);
                let len = ffi::sqlite3_column_bytes(self.stmt, idx);
                if ptr.is_null() || len <= 0 {
                    Value::Blob(Vec::new())
                } else {
                    Value::Blob(
                        std::slice::from_raw_parts(ptr.cast::<u8>(), as_usize(len)).to_vec(),
                    )
                }
            },
            ffi::SQLITE_NULL => Value::Null,
            other => panic!("unknown column storage class: {other}"),
        }
    }

    /// A lazy view over the current row.
    ///
    /// The view borrows the statement, so the borrow checker prevents
    /// stepping or resetting while it is alive.
    pub fn row(&self) -> Row<'_> {
        Row { stmt: self }
    }

    // ── Helpers ─────────────────────────────────────────────────────────

    pub(crate) fn last_error(&self, code: c_int) -> Error {
        Error::from_code(code, error_message(self.db))
    }

    /// The raw statement handle, used for identity checks in cache tests.
    pub(crate) fn raw_handle(&self) -> *mut c_void {
        self.stmt
    }
}

impl Drop for Statement {
    fn drop(&mut self) {
        if !self.stmt.is_null() {
            // Safety: the handle is owned by this wrapper and finalized
            // exactly once.
            unsafe {
                ffi::sqlite3_finalize(self.stmt);
            }
            self.stmt = std::ptr::null_mut();
        }
    }
}

impl std::fmt::Debug for Statement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Statement")
            .field("sql", &self.sql())
            .finish_non_exhaustive()
    }
}

fn to_cint(index: usize) -> c_int {
    c_int::try_from(index).unwrap_or(c_int::MAX)
}

#[allow(clippy::cast_sign_loss)]
fn as_usize(len: c_int) -> usize {
    len as usize
}

/// A lazy view of a statement's current result row.
///
/// Valid only until the statement steps or resets again; the lifetime tie
/// makes violating that a compile error rather than a runtime check.
#[derive(Debug)]
pub struct Row<'stmt> {
    stmt: &'stmt Statement,
}

impl Row<'_> {
    /// Number of columns in the row.
    pub fn column_count(&self) -> usize {
        self.stmt.column_count()
    }

    /// Decodes column `index`.
    pub fn value(&self, index: usize) -> Value {
        self.stmt.value(index)
    }

    /// Decodes the column called `name`, if present.
    pub fn get(&self, name: &str) -> Option<Value> {
        self.stmt.column_index(name).map(|i| self.stmt.value(i))
    }

    /// Copies every column out into an [`OwnedRow`] that outlives the
    /// statement.
    pub fn materialize(&self) -> OwnedRow {
        OwnedRow::read(self.stmt)
    }
}

/// A materialized result row; all column values are copied out at
/// construction and remain valid indefinitely.
#[derive(Debug, Clone, PartialEq)]
pub struct OwnedRow {
    columns: Vec<String>,
    values: Vec<Value>,
}

impl OwnedRow {
    pub(crate) fn read(stmt: &Statement) -> Self {
        let columns = stmt.column_names().to_vec();
        let values = (0..stmt.column_count()).map(|i| stmt.value(i)).collect();
        Self { columns, values }
    }

    /// Number of columns in the row.
    pub fn column_count(&self) -> usize {
        self.values.len()
    }

    /// The value at position `index`.
    pub fn value(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// The value of the column called `name`.
    pub fn get(&self, name: &str) -> Option<&Value> {
        let idx = self.columns.iter().position(|c| c == name)?;
        self.values.get(idx)
    }

    /// The column names.
    pub fn column_names(&self) -> &[String] {
        &self.columns
    }

    /// Consumes the row, returning its values.
    pub fn into_values(self) -> Vec<Value> {
        self.values
    }
}
