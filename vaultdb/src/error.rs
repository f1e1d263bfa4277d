//! Error taxonomy for the access layer.
//!
//! Every native result code is checked at its call site and converted into
//! [`Error`] immediately. The one deliberate exception is the best-effort
//! `ROLLBACK` issued after a failed transaction body, whose own failure is
//! discarded so the original error reaches the caller.

use std::fmt;

/// Which migrator hook was missing when the migration state machine needed
/// it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    /// The initial schema-construction hook (version 0 to 1).
    Setup,
    /// An incremental upgrade hook.
    Upgrade,
    /// An incremental downgrade hook.
    Downgrade,
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Setup => write!(f, "setup"),
            Self::Upgrade => write!(f, "upgrade"),
            Self::Downgrade => write!(f, "downgrade"),
        }
    }
}

/// Errors surfaced by connections, statements, the manager and the
/// encryption layer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Connection construction failed; no handle is left open.
    #[error("failed to open database: {0}")]
    Open(String),

    /// Statement compilation failed.
    #[error("failed to prepare statement: {0}")]
    Prepare(String),

    /// Syntax or constraint violation reported by the engine.
    #[error("sql error: {0}")]
    Sql(String),

    /// Lock contention persisted past the busy-timeout ceiling.
    #[error("database is busy")]
    Busy,

    /// A table or shared-cache lock conflict.
    #[error("database is locked: {0}")]
    Locked(String),

    /// The engine reported API misuse.
    #[error("api misuse")]
    Misuse,

    /// A row callback or progress handler requested early termination.
    #[error("operation aborted")]
    Aborted,

    /// A migrator hook required by the version transition is not
    /// implemented.
    #[error("migration {0} step not implemented")]
    MigrationStepMissing(StepKind),

    /// Invalid argument, e.g. a target schema version of zero or an unknown
    /// parameter name.
    #[error("invalid parameter: {0}")]
    Parameter(String),

    /// Any other engine result code, preserved verbatim.
    #[error("sqlite error {code}: {message}")]
    Other {
        /// The native result code.
        code: i32,
        /// The engine's error message at the time of failure.
        message: String,
    },
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Maps a native result code (plus the connection's current error
    /// message) to the closed taxonomy. Used at step and execute call
    /// sites; open and prepare sites wrap their failures in
    /// [`Error::Open`] / [`Error::Prepare`] instead.
    pub(crate) fn from_code(code: i32, message: String) -> Self {
        match code {
            crate::ffi::SQLITE_ERROR | crate::ffi::SQLITE_CONSTRAINT | crate::ffi::SQLITE_AUTH => {
                Self::Sql(message)
            }
            crate::ffi::SQLITE_BUSY => Self::Busy,
            crate::ffi::SQLITE_LOCKED => Self::Locked(message),
            crate::ffi::SQLITE_MISUSE => Self::Misuse,
            crate::ffi::SQLITE_ABORT | crate::ffi::SQLITE_INTERRUPT => Self::Aborted,
            _ => Self::Other { code, message },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_common_codes() {
        assert!(matches!(
            Error::from_code(crate::ffi::SQLITE_BUSY, String::new()),
            Error::Busy
        ));
        assert!(matches!(
            Error::from_code(crate::ffi::SQLITE_CONSTRAINT, "constraint".into()),
            Error::Sql(_)
        ));
        assert!(matches!(
            Error::from_code(crate::ffi::SQLITE_LOCKED, "locked".into()),
            Error::Locked(_)
        ));
        assert!(matches!(
            Error::from_code(crate::ffi::SQLITE_ABORT, String::new()),
            Error::Aborted
        ));
        assert!(matches!(
            Error::from_code(crate::ffi::SQLITE_NOTADB, "not a db".into()),
            Error::Other { code: 26, .. }
        ));
    }

    #[test]
    fn display_includes_context() {
        let err = Error::MigrationStepMissing(StepKind::Upgrade);
        assert_eq!(err.to_string(), "migration upgrade step not implemented");
    }
}
