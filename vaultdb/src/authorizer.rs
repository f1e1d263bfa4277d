//! Compile-time operation authorization.
//!
//! The engine consults the registered callback once per planned operation
//! while a statement is being prepared. A denied operation makes
//! preparation fail before any data is touched.

use std::ffi::CStr;
use std::os::raw::{c_char, c_int, c_void};

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::ffi;
use crate::statement;

/// One planned operation, decoded from the native action code and its name
/// payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum AuthorizerAction {
    CreateIndex { index: String, table: String },
    CreateTable { table: String },
    CreateTempIndex { index: String, table: String },
    CreateTempTable { table: String },
    CreateTempTrigger { trigger: String, table: String },
    CreateTempView { view: String },
    CreateTrigger { trigger: String, table: String },
    CreateView { view: String },
    Delete { table: String },
    DropIndex { index: String, table: String },
    DropTable { table: String },
    DropTempIndex { index: String, table: String },
    DropTempTable { table: String },
    DropTempTrigger { trigger: String, table: String },
    DropTempView { view: String },
    DropTrigger { trigger: String, table: String },
    DropView { view: String },
    Insert { table: String },
    Pragma { name: String, value: Option<String> },
    Read { table: String, column: String },
    Select,
    Transaction { operation: String },
    Update { table: String, column: String },
    Attach { filename: String },
    Detach { database: String },
    AlterTable { database: String, table: String },
    Reindex { index: String },
    Analyze { table: String },
    CreateVtable { table: String, module: String },
    DropVtable { table: String, module: String },
    Function { name: String },
    Savepoint { operation: String, name: String },
    Recursive,
    /// An action code outside the documented taxonomy, passed through so
    /// callbacks can decide on it anyway.
    Other { code: i32 },
}

impl AuthorizerAction {
    /// Decodes a native action code plus its two name payloads.
    ///
    /// # Safety
    ///
    /// `arg1` and `arg2` must each be null or point to a valid C string for
    /// the duration of the call.
    unsafe fn decode(code: c_int, arg1: *const c_char, arg2: *const c_char) -> Self {
        let first = || copy_text(arg1);
        let second = || copy_text(arg2);
        match code {
            ffi::SQLITE_CREATE_INDEX => Self::CreateIndex {
                index: first(),
                table: second(),
            },
            ffi::SQLITE_CREATE_TABLE => Self::CreateTable { table: first() },
            ffi::SQLITE_CREATE_TEMP_INDEX => Self::CreateTempIndex {
                index: first(),
                table: second(),
            },
            ffi::SQLITE_CREATE_TEMP_TABLE => Self::CreateTempTable { table: first() },
            ffi::SQLITE_CREATE_TEMP_TRIGGER => Self::CreateTempTrigger {
                trigger: first(),
                table: second(),
            },
            ffi::SQLITE_CREATE_TEMP_VIEW => Self::CreateTempView { view: first() },
            ffi::SQLITE_CREATE_TRIGGER => Self::CreateTrigger {
                trigger: first(),
                table: second(),
            },
            ffi::SQLITE_CREATE_VIEW => Self::CreateView { view: first() },
            ffi::SQLITE_DELETE => Self::Delete { table: first() },
            ffi::SQLITE_DROP_INDEX => Self::DropIndex {
                index: first(),
                table: second(),
            },
            ffi::SQLITE_DROP_TABLE => Self::DropTable { table: first() },
            ffi::SQLITE_DROP_TEMP_INDEX => Self::DropTempIndex {
                index: first(),
                table: second(),
            },
            ffi::SQLITE_DROP_TEMP_TABLE => Self::DropTempTable { table: first() },
            ffi::SQLITE_DROP_TEMP_TRIGGER => Self::DropTempTrigger {
                trigger: first(),
                table: second(),
            },
            ffi::SQLITE_DROP_TEMP_VIEW => Self::DropTempView { view: first() },
            ffi::SQLITE_DROP_TRIGGER => Self::DropTrigger {
                trigger: first(),
                table: second(),
            },
            ffi::SQLITE_DROP_VIEW => Self::DropView { view: first() },
            ffi::SQLITE_INSERT => Self::Insert { table: first() },
            ffi::SQLITE_PRAGMA => Self::Pragma {
                name: first(),
                value: optional_text(arg2),
            },
            ffi::SQLITE_READ => Self::Read {
                table: first(),
                column: second(),
            },
            ffi::SQLITE_SELECT => Self::Select,
            ffi::SQLITE_TRANSACTION => Self::Transaction { operation: first() },
            ffi::SQLITE_UPDATE => Self::Update {
                table: first(),
                column: second(),
            },
            ffi::SQLITE_ATTACH => Self::Attach { filename: first() },
            ffi::SQLITE_DETACH => Self::Detach { database: first() },
            ffi::SQLITE_ALTER_TABLE => Self::AlterTable {
                database: first(),
                table: second(),
            },
            ffi::SQLITE_REINDEX => Self::Reindex { index: first() },
            ffi::SQLITE_ANALYZE => Self::Analyze { table: first() },
            ffi::SQLITE_CREATE_VTABLE => Self::CreateVtable {
                table: first(),
                module: second(),
            },
            ffi::SQLITE_DROP_VTABLE => Self::DropVtable {
                table: first(),
                module: second(),
            },
            ffi::SQLITE_FUNCTION => Self::Function { name: second() },
            ffi::SQLITE_SAVEPOINT => Self::Savepoint {
                operation: first(),
                name: second(),
            },
            ffi::SQLITE_RECURSIVE => Self::Recursive,
            other => Self::Other { code: other },
        }
    }
}

/// The callback's decision for one planned operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorizerVerdict {
    /// Let the operation proceed.
    Allow,
    /// Let the statement compile, but make the operation a no-op (reads
    /// produce NULL).
    Ignore,
    /// Fail statement preparation with an authorization error.
    Deny,
}

impl AuthorizerVerdict {
    const fn response(self) -> c_int {
        match self {
            Self::Allow => ffi::SQLITE_OK,
            Self::Ignore => ffi::SQLITE_IGNORE,
            Self::Deny => ffi::SQLITE_DENY,
        }
    }
}

/// Boxed authorizer callback, stored on the connection while registered.
pub type AuthorizerCallback = Box<dyn FnMut(&AuthorizerAction) -> AuthorizerVerdict + Send>;

impl Connection {
    /// Registers `callback` to be consulted once per planned operation
    /// during statement preparation. Replaces any previous authorizer.
    pub fn set_authorizer<F>(&self, callback: F) -> Result<()>
    where
        F: FnMut(&AuthorizerAction) -> AuthorizerVerdict + Send + 'static,
    {
        let boxed: Box<AuthorizerCallback> = Box::new(Box::new(callback));
        let user_data: *mut AuthorizerCallback = std::ptr::from_ref(&*boxed).cast_mut();
        // Safety: the box is stored in `self.authorizer` below and stays
        // alive until replaced or cleared through the same slot.
        let rc = unsafe {
            ffi::sqlite3_set_authorizer(self.handle(), Some(authorizer_trampoline), user_data.cast())
        };
        if rc != ffi::SQLITE_OK {
            return Err(Error::from_code(rc, statement::error_message(self.handle())));
        }
        *self.authorizer.borrow_mut() = Some(boxed);
        Ok(())
    }

    /// Removes any registered authorizer.
    pub fn clear_authorizer(&self) -> Result<()> {
        // Safety: a null callback unregisters.
        let rc = unsafe {
            ffi::sqlite3_set_authorizer(self.handle(), None, std::ptr::null_mut())
        };
        if rc != ffi::SQLITE_OK {
            return Err(Error::from_code(rc, statement::error_message(self.handle())));
        }
        *self.authorizer.borrow_mut() = None;
        Ok(())
    }
}

/// Trampoline for the authorizer.
///
/// # Safety
///
/// `user_data` is the pointer registered in [`Connection::set_authorizer`];
/// it stays valid until unregistered.
unsafe extern "C" fn authorizer_trampoline(
    user_data: *mut c_void,
    action: c_int,
    arg1: *const c_char,
    arg2: *const c_char,
    _database: *const c_char,
    _trigger: *const c_char,
) -> c_int {
    let callback = &mut *user_data.cast::<AuthorizerCallback>();
    let decoded = AuthorizerAction::decode(action, arg1, arg2);
    callback(&decoded).response()
}

/// Copies a required name payload; the engine occasionally passes null even
/// for documented payloads, which decodes as an empty string.
unsafe fn copy_text(ptr: *const c_char) -> String {
    optional_text(ptr).unwrap_or_default()
}

unsafe fn optional_text(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        None
    } else {
        Some(CStr::from_ptr(ptr).to_string_lossy().into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;
    use std::ffi::CString;

    #[test]
    fn decodes_common_actions() {
        let table = CString::new("people").expect("cstring");
        let column = CString::new("age").expect("cstring");
        let read = unsafe {
            AuthorizerAction::decode(ffi::SQLITE_READ, table.as_ptr(), column.as_ptr())
        };
        assert_eq!(
            read,
            AuthorizerAction::Read {
                table: "people".to_string(),
                column: "age".to_string(),
            }
        );
        let pragma = unsafe {
            AuthorizerAction::decode(ffi::SQLITE_PRAGMA, table.as_ptr(), std::ptr::null())
        };
        assert_eq!(
            pragma,
            AuthorizerAction::Pragma {
                name: "people".to_string(),
                value: None,
            }
        );
        let unknown = unsafe { AuthorizerAction::decode(99, std::ptr::null(), std::ptr::null()) };
        assert_eq!(unknown, AuthorizerAction::Other { code: 99 });
    }

    #[test]
    fn deny_fails_preparation_and_leaves_data() {
        let conn = Connection::open_in_memory().expect("open");
        conn.execute_batch("CREATE TABLE t (id INTEGER); INSERT INTO t VALUES (1), (2);")
            .expect("seed");
        conn.set_authorizer(|action| match action {
            AuthorizerAction::Delete { .. } => AuthorizerVerdict::Deny,
            _ => AuthorizerVerdict::Allow,
        })
        .expect("register");

        let result = conn.execute_batch("DELETE FROM t");
        assert!(result.is_err());
        conn.clear_authorizer().expect("clear");
        let row = conn.query_row("SELECT count(*) FROM t", &[]).expect("count");
        assert_eq!(row.value(0), Some(&Value::Integer(2)));
    }

    #[test]
    fn ignore_makes_reads_null() {
        let conn = Connection::open_in_memory().expect("open");
        conn.execute_batch("CREATE TABLE t (id INTEGER, secret TEXT)")
            .expect("create");
        conn.execute_params(
            "INSERT INTO t VALUES (1, 'hidden')",
            &[],
        )
        .expect("seed");
        conn.set_authorizer(|action| match action {
            AuthorizerAction::Read { column, .. } if column == "secret" => {
                AuthorizerVerdict::Ignore
            }
            _ => AuthorizerVerdict::Allow,
        })
        .expect("register");
        let row = conn
            .query_row("SELECT id, secret FROM t", &[])
            .expect("query");
        assert_eq!(row.value(0), Some(&Value::Integer(1)));
        assert_eq!(row.value(1), Some(&Value::Null));
    }
}
