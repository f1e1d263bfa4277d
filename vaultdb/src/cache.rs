//! Bounded per-connection cache of prepared statements.
//!
//! Statements are keyed by their exact SQL text. When the cache is full a
//! uniformly-random entry is evicted; the policy is deliberately not LRU,
//! so eviction order carries no information about access patterns.
//! Pragma statements bypass the cache unconditionally because their effect
//! depends on connection session state that may have changed since last
//! use.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::os::raw::c_void;

use log::debug;

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::statement::{self, Statement};

/// Default number of cached statements per connection.
pub const DEFAULT_CACHE_CAPACITY: usize = 64;

/// A bounded statement cache bound to one connection handle.
pub struct StatementCache {
    /// Raw `sqlite3*` handle of the owning connection.
    db: *mut c_void,
    capacity: usize,
    entries: HashMap<String, Statement>,
}

// Safety: the cache moves between threads only together with its owning
// connection; the manager never shares either across threads.
unsafe impl Send for StatementCache {}

impl StatementCache {
    /// Creates a cache for `conn` holding at most `capacity` statements.
    pub fn new(conn: &Connection, capacity: usize) -> Self {
        Self::from_handle(conn.handle(), capacity)
    }

    pub(crate) fn from_handle(db: *mut c_void, capacity: usize) -> Self {
        Self {
            db,
            capacity,
            entries: HashMap::with_capacity(capacity),
        }
    }

    /// Returns a statement for `sql`.
    ///
    /// On a hit the stored statement is reset and its bindings cleared
    /// before it is handed out. On a miss the statement is compiled in the
    /// engine's long-lived mode and stored when the guard drops. Pragmas
    /// are compiled fresh every call and never stored.
    pub fn get(&mut self, sql: &str) -> Result<CachedStatement<'_>> {
        let cachable = !is_pragma(sql);
        if cachable {
            if let Some(mut stmt) = self.entries.remove(sql) {
                stmt.reset()?;
                stmt.clear_bindings()?;
                return Ok(CachedStatement {
                    cache: self,
                    statement: Some(stmt),
                    key: Some(sql.to_string()),
                });
            }
        }
        let stmt = self.prepare(sql, cachable)?;
        let key = cachable.then(|| sql.to_string());
        Ok(CachedStatement {
            cache: self,
            statement: Some(stmt),
            key,
        })
    }

    /// Number of statements currently stored.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if no statements are stored.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The capacity bound.
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Finalizes every cached statement.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn prepare(&self, sql: &str, persistent: bool) -> Result<Statement> {
        statement::prepare_raw(self.db, sql, persistent)?
            .statement
            .ok_or_else(|| Error::Prepare("empty statement".to_string()))
    }

    fn store(&mut self, key: String, mut stmt: Statement) {
        if self.capacity == 0 {
            return;
        }
        // Release any locks the statement still holds before it goes
        // dormant; errors here belong to the completed invocation.
        let _ = stmt.reset();
        if !self.entries.contains_key(&key) && self.entries.len() >= self.capacity {
            self.evict_random();
        }
        self.entries.insert(key, stmt);
    }

    fn evict_random(&mut self) {
        let index = uniform_index(self.entries.len());
        if let Some(key) = self.entries.keys().nth(index).cloned() {
            debug!("evicting cached statement: {key}");
            self.entries.remove(&key);
        }
    }
}

impl std::fmt::Debug for StatementCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatementCache")
            .field("len", &self.entries.len())
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

/// A statement checked out of a [`StatementCache`].
///
/// Dereferences to [`Statement`]; returns to the cache on drop unless the
/// SQL was uncachable (pragmas), in which case the statement is finalized.
pub struct CachedStatement<'cache> {
    cache: &'cache mut StatementCache,
    statement: Option<Statement>,
    key: Option<String>,
}

impl CachedStatement<'_> {
    /// Drops the statement without returning it to the cache.
    pub fn discard(mut self) {
        self.key = None;
    }
}

impl Deref for CachedStatement<'_> {
    type Target = Statement;

    fn deref(&self) -> &Statement {
        // The option is only vacated in drop.
        self.statement.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl DerefMut for CachedStatement<'_> {
    fn deref_mut(&mut self) -> &mut Statement {
        self.statement.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl Drop for CachedStatement<'_> {
    fn drop(&mut self) {
        if let (Some(key), Some(stmt)) = (self.key.take(), self.statement.take()) {
            self.cache.store(key, stmt);
        }
    }
}

impl std::fmt::Debug for CachedStatement<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedStatement")
            .field("statement", &self.statement)
            .finish_non_exhaustive()
    }
}

/// Uniform sample from `0..bound` via rejection sampling, so the result is
/// never modulo-biased.
fn uniform_index(bound: usize) -> usize {
    debug_assert!(bound > 0);
    let bound = u64::try_from(bound).unwrap_or(u64::MAX);
    let limit = u64::MAX - u64::MAX % bound;
    loop {
        let mut buf = [0_u8; 8];
        if getrandom::fill(&mut buf).is_err() {
            // Entropy exhaustion leaves eviction deterministic rather than
            // failing the statement lookup.
            return 0;
        }
        let sample = u64::from_ne_bytes(buf);
        if sample < limit {
            #[allow(clippy::cast_possible_truncation)]
            return (sample % bound) as usize;
        }
    }
}

/// Returns `true` if the first token of `sql`, after comments and
/// whitespace, is the pragma keyword.
fn is_pragma(sql: &str) -> bool {
    let rest = skip_leading_trivia(sql);
    let token_len = rest
        .find(|c: char| !c.is_ascii_alphabetic())
        .unwrap_or(rest.len());
    rest[..token_len].eq_ignore_ascii_case("pragma")
}

fn skip_leading_trivia(mut sql: &str) -> &str {
    loop {
        sql = sql.trim_start();
        if let Some(rest) = sql.strip_prefix("--") {
            match rest.find('\n') {
                Some(i) => sql = &rest[i + 1..],
                None => return "",
            }
        } else if let Some(rest) = sql.strip_prefix("/*") {
            match rest.find("*/") {
                Some(i) => sql = &rest[i + 2..],
                None => return "",
            }
        } else {
            return sql;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn test_pair() -> (Connection, StatementCache) {
        let conn = Connection::open_in_memory().expect("open");
        conn.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY, label TEXT)")
            .expect("create");
        let cache = StatementCache::from_handle(conn.handle(), 4);
        (conn, cache)
    }

    #[test]
    fn hit_returns_same_statement_reset() {
        let (_conn, mut cache) = test_pair();
        let first_handle;
        {
            let mut stmt = cache.get("SELECT id FROM t WHERE id = ?1").expect("miss");
            first_handle = stmt.raw_handle();
            stmt.bind(1, &Value::Integer(1)).expect("bind");
            let _ = stmt.step().expect("step");
        }
        assert_eq!(cache.len(), 1);
        let stmt = cache.get("SELECT id FROM t WHERE id = ?1").expect("hit");
        assert_eq!(stmt.raw_handle(), first_handle);
    }

    #[test]
    fn never_returns_wrong_sql() {
        let (_conn, mut cache) = test_pair();
        drop(cache.get("SELECT id FROM t").expect("first"));
        let stmt = cache.get("SELECT label FROM t").expect("second");
        assert_eq!(stmt.sql(), "SELECT label FROM t");
    }

    #[test]
    fn pragma_bypasses_cache() {
        let (_conn, mut cache) = test_pair();
        let first = {
            let stmt = cache.get("PRAGMA user_version").expect("first");
            stmt.raw_handle()
        };
        assert!(cache.is_empty());
        let second = {
            let stmt = cache.get("PRAGMA user_version").expect("second");
            stmt.raw_handle()
        };
        assert!(cache.is_empty());
        assert_ne!(first, second);
    }

    #[test]
    fn eviction_keeps_capacity_bound() {
        let (_conn, mut cache) = test_pair();
        for i in 0..10 {
            drop(cache.get(&format!("SELECT {i}")).expect("prepare"));
        }
        assert_eq!(cache.len(), cache.capacity());
    }

    #[test]
    fn discard_skips_reinsertion() {
        let (_conn, mut cache) = test_pair();
        cache.get("SELECT id FROM t").expect("prepare").discard();
        assert!(cache.is_empty());
    }

    #[test]
    fn pragma_detection_skips_trivia() {
        assert!(is_pragma("PRAGMA user_version"));
        assert!(is_pragma("  pragma foreign_keys = ON"));
        assert!(is_pragma("-- comment\nPRAGMA cache_size"));
        assert!(is_pragma("/* block */ PRAGMA cache_size"));
        assert!(is_pragma("/* a */ -- b\n  Pragma synchronous"));
        assert!(!is_pragma("SELECT 'PRAGMA'"));
        assert!(!is_pragma("-- PRAGMA in a comment\nSELECT 1"));
        assert!(!is_pragma("/* unterminated PRAGMA"));
        assert!(!is_pragma("pragmatic_column FROM t"));
    }

    #[test]
    fn uniform_index_stays_in_bounds() {
        for bound in [1_usize, 2, 3, 7, 64] {
            for _ in 0..32 {
                assert!(uniform_index(bound) < bound);
            }
        }
    }
}
