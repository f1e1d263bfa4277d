//! Thread-safe access layer over `SQLCipher`.
//!
//! The raw symbols are linked through `libsqlite3-sys` with its bundled
//! `SQLCipher` amalgamation, so every database this crate opens can be
//! encrypted. On top of the C API it layers:
//!
//! * typed value marshalling ([`Value`]) with strict and coercing accessors,
//! * prepared statements with multi-statement scripts ([`Statement`]),
//! * a per-connection statement cache with random eviction
//!   ([`StatementCache`]),
//! * a per-thread connection manager with generation-based invalidation and
//!   a versioned migration state machine ([`ConnectionManager`]),
//! * custom scalar, aggregate and window functions, collations, full-text
//!   tokenizers and a statement authorizer, and
//! * the encryption layer itself ([`cipher`]) with the historical cipher
//!   profiles needed to open old database files.
//!
//! Consumer code uses only the safe types defined here and never touches
//! raw FFI directly. The `ffi` module is the **only** file that contains C
//! types, and `unsafe` blocks appear solely where the C boundary is
//! crossed.

// The raw sqlite3/SQLCipher symbols are declared in `ffi` and provided by the
// static library that `libsqlite3-sys` compiles. This crate calls those symbols
// through its own `extern` block rather than through the `libsqlite3_sys` Rust
// API, so the dependency is otherwise unreferenced; this `use` keeps it in the
// link graph so its native-link directives apply.
use libsqlite3_sys as _;

mod ffi;

mod authorizer;
mod cache;
mod connection;
pub mod error;
mod functions;
mod manager;
mod statement;
mod tokenizer;
pub mod value;

pub mod cipher;

pub use authorizer::{AuthorizerAction, AuthorizerCallback, AuthorizerVerdict};
pub use cache::{CachedStatement, StatementCache, DEFAULT_CACHE_CAPACITY};
pub use connection::{
    Connection, DbOption, Limit, OpenFlags, ProgressCallback, SetupAction, Transaction,
    TransactionBehavior,
};
pub use error::{Error, Result, StepKind};
pub use functions::{Aggregate, FunctionFlags, WindowAggregate};
pub use manager::{
    global_config, CleanupHook, ConnectionManager, GlobalOption, ManagedConnection, Migrator,
};
pub use statement::{OwnedRow, Row, Statement, StepResult};
pub use tokenizer::{Fts5Tokenizer, TokenSink, TokenizeReason, TokenizerFactory};
pub use value::Value;

#[cfg(test)]
mod tests;
