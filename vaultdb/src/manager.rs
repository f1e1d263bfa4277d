//! Per-thread connection management, versioned migration and process-wide
//! engine configuration.
//!
//! The manager hands every thread its own connection (the engine serializes
//! nothing across handles, so sharing one would force coarse locking on the
//! caller). Connections are built lazily by a user-supplied factory and
//! carry a statement cache. A monotonically increasing generation counter
//! invalidates the whole map at once: [`ConnectionManager::reload`] bumps
//! the counter and each thread rebuilds its entry the next time it asks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, ThreadId};

use log::debug;

use crate::cache::{StatementCache, DEFAULT_CACHE_CAPACITY};
use crate::connection::{Connection, TransactionBehavior};
use crate::error::{Error, Result, StepKind};
use crate::ffi;
use crate::statement::{OwnedRow, StepResult};
use crate::value::Value;

/// Runs when a managed connection is torn down, after its handle closes.
pub type CleanupHook = Box<dyn FnOnce() + Send>;

/// A connection produced by a manager factory, optionally paired with a
/// teardown hook (e.g. to delete a temporary key file the factory wrote).
pub struct ManagedConnection {
    connection: Connection,
    cleanup: Option<CleanupHook>,
}

impl ManagedConnection {
    /// Wraps a connection with no teardown hook.
    #[must_use]
    pub fn new(connection: Connection) -> Self {
        Self {
            connection,
            cleanup: None,
        }
    }

    /// Attaches a hook that runs after the connection has been closed.
    #[must_use]
    pub fn with_cleanup<F>(mut self, hook: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.cleanup = Some(Box::new(hook));
        self
    }
}

impl std::fmt::Debug for ManagedConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedConnection")
            .field("connection", &self.connection)
            .field("has_cleanup", &self.cleanup.is_some())
            .finish()
    }
}

type ConnectionFactory = dyn Fn() -> Result<ManagedConnection> + Send + Sync;

struct Slot {
    // Declared before `conn` so cached statements are finalized before the
    // handle closes.
    cache: StatementCache,
    conn: Connection,
    cleanup: Option<CleanupHook>,
}

struct Entry {
    generation: u64,
    slot: Arc<Mutex<Slot>>,
}

struct ManagerState {
    generation: u64,
    entries: HashMap<ThreadId, Entry>,
}

/// Hands each thread its own lazily built connection and statement cache.
pub struct ConnectionManager {
    factory: Box<ConnectionFactory>,
    cache_capacity: usize,
    state: Mutex<ManagerState>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("ConnectionManager")
            .field("cache_capacity", &self.cache_capacity)
            .field("generation", &state.generation)
            .field("threads", &state.entries.len())
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Creates a manager whose per-thread connections come from `factory`.
    ///
    /// The factory runs on the thread that first touches the manager after
    /// construction or a [`reload`](Self::reload), never under the manager's
    /// internal lock.
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn() -> Result<ManagedConnection> + Send + Sync + 'static,
    {
        Self {
            factory: Box::new(factory),
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            state: Mutex::new(ManagerState {
                generation: 0,
                entries: HashMap::new(),
            }),
        }
    }

    /// Overrides the per-thread statement cache capacity.
    #[must_use]
    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    /// Invalidates every per-thread connection. Each thread tears its entry
    /// down and rebuilds it through the factory the next time it uses the
    /// manager; idle threads pay nothing until then.
    pub fn reload(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.generation = state.generation.wrapping_add(1);
        debug!("connection reload requested (generation {})", state.generation);
    }

    /// Runs `body` against the calling thread's connection, building it
    /// first if the thread has none or its entry predates a reload.
    pub fn with_connection<T, F>(&self, body: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        self.with_slot(|slot| body(&slot.conn))
    }

    /// Runs a statement through the thread's statement cache and returns
    /// the number of rows changed.
    pub fn execute_params(&self, sql: &str, params: &[Value]) -> Result<usize> {
        self.with_slot(|slot| {
            let mut stmt = slot.cache.get(sql)?;
            stmt.bind_values(params)?;
            while stmt.step()? == StepResult::Row {}
            Ok(slot.conn.changes())
        })
    }

    /// Runs a query through the thread's statement cache and materializes
    /// every result row.
    pub fn query_rows(&self, sql: &str, params: &[Value]) -> Result<Vec<OwnedRow>> {
        self.with_slot(|slot| {
            let mut stmt = slot.cache.get(sql)?;
            stmt.bind_values(params)?;
            let mut rows = Vec::new();
            while stmt.step()? == StepResult::Row {
                rows.push(stmt.row().materialize());
            }
            Ok(rows)
        })
    }

    /// Runs a cached query expected to produce exactly one row.
    pub fn query_row(&self, sql: &str, params: &[Value]) -> Result<OwnedRow> {
        self.query_row_optional(sql, params)?
            .ok_or_else(|| Error::Other {
                code: ffi::SQLITE_DONE,
                message: "query returned no rows".to_string(),
            })
    }

    /// Runs a cached query returning at most one row.
    pub fn query_row_optional(&self, sql: &str, params: &[Value]) -> Result<Option<OwnedRow>> {
        self.with_slot(|slot| {
            let mut stmt = slot.cache.get(sql)?;
            stmt.bind_values(params)?;
            match stmt.step()? {
                StepResult::Row => Ok(Some(stmt.row().materialize())),
                StepResult::Done => Ok(None),
            }
        })
    }

    /// Runs a multi-statement script on the thread's connection, bypassing
    /// the statement cache.
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        self.with_connection(|conn| conn.execute_batch(sql))
    }

    /// Drops the thread's cached statements and asks the engine to shed as
    /// much memory as practical.
    pub fn release_memory(&self) -> Result<()> {
        self.with_slot(|slot| {
            slot.cache.clear();
            slot.conn.release_memory()
        })
    }

    /// Invalidates every per-thread connection, then runs `work` on a
    /// dedicated connection that no other caller can observe. Used for
    /// operations that must not race cached statements on other handles,
    /// e.g. re-encrypting the database file.
    pub fn with_unique_background_connection<T, F>(&self, work: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        self.reload();
        let managed = (self.factory)()?;
        let result = work(&managed.connection);
        let ManagedConnection {
            connection,
            cleanup,
        } = managed;
        drop(connection);
        if let Some(hook) = cleanup {
            hook();
        }
        result
    }

    /// Moves the schema to `to_version` inside one exclusive transaction.
    ///
    /// Reads the schema version ledger, runs the migrator hooks for each
    /// intermediate version, writes the new ledger value and commits. A
    /// failing hook rolls the whole transition back, ledger included.
    /// Returns `true` if a transition ran, `false` if the schema was
    /// already at `to_version`.
    ///
    /// # Errors
    ///
    /// `to_version` of zero is rejected with [`Error::Parameter`]; a hook
    /// the transition needs but the migrator does not implement surfaces as
    /// [`Error::MigrationStepMissing`].
    pub fn migrate<M: Migrator>(&self, migrator: &M, to_version: u32) -> Result<bool> {
        if to_version == 0 {
            return Err(Error::Parameter(
                "target schema version must be at least 1".to_string(),
            ));
        }
        let (from, migrated) = self.with_connection(|conn| {
            conn.in_transaction(TransactionBehavior::Exclusive, |conn| {
                let from = conn.user_version()?;
                if from == to_version {
                    return Ok((from, false));
                }
                let mut current = from;
                if current == 0 {
                    debug!("building initial schema");
                    migrator.setup(conn)?;
                    current = 1;
                }
                while current < to_version {
                    debug!("upgrading schema from version {current}");
                    migrator.upgrade(conn, current)?;
                    current += 1;
                }
                while current > to_version {
                    debug!("downgrading schema from version {current}");
                    migrator.downgrade(conn, current)?;
                    current -= 1;
                }
                conn.set_user_version(to_version)?;
                Ok((from, true))
            })
        })?;
        if migrated {
            self.with_connection(|conn| migrator.did_migrate(conn, from, to_version))?;
        }
        Ok(migrated)
    }

    fn with_slot<T, F>(&self, body: F) -> Result<T>
    where
        F: FnOnce(&mut Slot) -> Result<T>,
    {
        let slot = self.thread_slot()?;
        let mut guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
        body(&mut guard)
    }

    fn thread_slot(&self) -> Result<Arc<Mutex<Slot>>> {
        let id = thread::current().id();
        let (stale, generation) = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(entry) = state.entries.get(&id) {
                if entry.generation == state.generation {
                    return Ok(Arc::clone(&entry.slot));
                }
            }
            (state.entries.remove(&id), state.generation)
        };
        if let Some(entry) = stale {
            debug!("releasing out-of-date connection for {id:?}");
            release_slot(entry.slot);
        }
        // The factory and the teardown above run outside the map lock so a
        // slow open on one thread never stalls the others.
        let managed = (self.factory)()?;
        let cache = StatementCache::new(&managed.connection, self.cache_capacity);
        let slot = Arc::new(Mutex::new(Slot {
            cache,
            conn: managed.connection,
            cleanup: managed.cleanup,
        }));
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.entries.insert(
            id,
            Entry {
                generation,
                slot: Arc::clone(&slot),
            },
        );
        Ok(slot)
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        let state = self
            .state
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        for (_, entry) in state.entries.drain() {
            release_slot(entry.slot);
        }
    }
}

fn release_slot(slot: Arc<Mutex<Slot>>) {
    // Entries are only reachable from their owning thread and the manager,
    // so by the time one is released no other reference remains.
    let Ok(mutex) = Arc::try_unwrap(slot) else {
        return;
    };
    let Ok(slot) = mutex.into_inner() else {
        return;
    };
    let Slot {
        cache,
        conn,
        cleanup,
    } = slot;
    drop(cache);
    drop(conn);
    if let Some(hook) = cleanup {
        hook();
    }
}

// ── Migration ───────────────────────────────────────────────────────────

/// Schema transition hooks consumed by [`ConnectionManager::migrate`].
///
/// Each hook moves the schema by exactly one version; the state machine
/// chains them. Unimplemented hooks fail the transition with
/// [`Error::MigrationStepMissing`] so a caller cannot silently skip a
/// version it has no code for.
pub trait Migrator {
    /// Builds the initial schema, leaving it at version 1.
    fn setup(&self, conn: &Connection) -> Result<()> {
        let _ = conn;
        Err(Error::MigrationStepMissing(StepKind::Setup))
    }

    /// Moves the schema from `from` to `from + 1`.
    fn upgrade(&self, conn: &Connection, from: u32) -> Result<()> {
        let _ = (conn, from);
        Err(Error::MigrationStepMissing(StepKind::Upgrade))
    }

    /// Moves the schema from `from` to `from - 1`.
    fn downgrade(&self, conn: &Connection, from: u32) -> Result<()> {
        let _ = (conn, from);
        Err(Error::MigrationStepMissing(StepKind::Downgrade))
    }

    /// Runs after a transition has committed, outside the transaction.
    fn did_migrate(&self, conn: &Connection, from: u32, to: u32) -> Result<()> {
        let _ = (conn, from, to);
        Ok(())
    }
}

// ── Process-wide configuration ──────────────────────────────────────────

/// Process-wide engine settings, applied through [`global_config`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlobalOption {
    /// No internal locking; the process promises single-threaded use.
    SingleThread,
    /// Internal locking for shared caches only; each handle stays bound to
    /// one thread at a time.
    MultiThread,
    /// Full internal locking; handles may move freely between threads.
    Serialized,
    /// Advisory heap ceiling in bytes; zero disables the limit.
    SoftHeapLimit(i64),
}

static CONFIG_LOCK: Mutex<()> = Mutex::new(());

/// Applies a process-wide engine setting.
///
/// Threading modes must be set before any connection exists; the engine
/// rejects them afterwards with [`Error::Misuse`]. Calls are serialized
/// against each other, not against concurrent connection construction.
pub fn global_config(option: GlobalOption) -> Result<()> {
    let _guard = CONFIG_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
    let rc = match option {
        // Safety: the configuration verbs take no further arguments.
        GlobalOption::SingleThread => unsafe { ffi::sqlite3_config(ffi::SQLITE_CONFIG_SINGLETHREAD) },
        GlobalOption::MultiThread => unsafe { ffi::sqlite3_config(ffi::SQLITE_CONFIG_MULTITHREAD) },
        GlobalOption::Serialized => unsafe { ffi::sqlite3_config(ffi::SQLITE_CONFIG_SERIALIZED) },
        GlobalOption::SoftHeapLimit(bytes) => {
            // Safety: no pointers involved; returns the previous limit.
            unsafe { ffi::sqlite3_soft_heap_limit64(bytes) };
            ffi::SQLITE_OK
        }
    };
    if rc == ffi::SQLITE_OK {
        Ok(())
    } else {
        Err(Error::from_code(
            rc,
            "global configuration rejected".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_manager(opens: Arc<AtomicUsize>) -> ConnectionManager {
        ConnectionManager::new(move || {
            opens.fetch_add(1, Ordering::SeqCst);
            Connection::open_in_memory().map(ManagedConnection::new)
        })
    }

    #[test]
    fn one_connection_per_thread() {
        let opens = Arc::new(AtomicUsize::new(0));
        let manager = Arc::new(counting_manager(Arc::clone(&opens)));
        manager
            .query_row("SELECT 1", &[])
            .expect("first use");
        manager
            .query_row("SELECT 2", &[])
            .expect("reuse");
        assert_eq!(opens.load(Ordering::SeqCst), 1);

        let remote = Arc::clone(&manager);
        thread::spawn(move || {
            remote.query_row("SELECT 3", &[]).expect("remote use");
        })
        .join()
        .expect("join");
        assert_eq!(opens.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn reload_rebuilds_lazily_and_runs_cleanup() {
        let opens = Arc::new(AtomicUsize::new(0));
        let cleanups = Arc::new(AtomicUsize::new(0));
        let manager = {
            let opens = Arc::clone(&opens);
            let cleanups = Arc::clone(&cleanups);
            ConnectionManager::new(move || {
                opens.fetch_add(1, Ordering::SeqCst);
                let cleanups = Arc::clone(&cleanups);
                Connection::open_in_memory().map(|conn| {
                    ManagedConnection::new(conn).with_cleanup(move || {
                        cleanups.fetch_add(1, Ordering::SeqCst);
                    })
                })
            })
        };
        manager.query_row("SELECT 1", &[]).expect("first use");
        manager.reload();
        assert_eq!(opens.load(Ordering::SeqCst), 1, "reload must be lazy");
        assert_eq!(cleanups.load(Ordering::SeqCst), 0);
        manager.query_row("SELECT 1", &[]).expect("after reload");
        assert_eq!(opens.load(Ordering::SeqCst), 2);
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
        drop(manager);
        assert_eq!(cleanups.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn background_connection_is_fresh_and_invalidates() {
        let opens = Arc::new(AtomicUsize::new(0));
        let manager = counting_manager(Arc::clone(&opens));
        manager
            .execute_batch("CREATE TABLE marker (id INTEGER)")
            .expect("seed");
        manager
            .with_unique_background_connection(|conn| {
                assert!(!conn.has_table("marker")?, "must not share the handle");
                Ok(())
            })
            .expect("background work");
        // The per-thread entry was invalidated, so the next use reopens.
        let before = opens.load(Ordering::SeqCst);
        manager.query_row("SELECT 1", &[]).expect("after background");
        assert_eq!(opens.load(Ordering::SeqCst), before + 1);
    }

    struct LedgerMigrator {
        fail_upgrade_from: Option<u32>,
    }

    impl LedgerMigrator {
        const fn new() -> Self {
            Self {
                fail_upgrade_from: None,
            }
        }

        fn log(conn: &Connection, step: &str) -> Result<()> {
            conn.execute_params(
                "INSERT INTO journal (step) VALUES (?1)",
                &[Value::from(step)],
            )?;
            Ok(())
        }
    }

    impl Migrator for LedgerMigrator {
        fn setup(&self, conn: &Connection) -> Result<()> {
            conn.execute_batch(
                "CREATE TABLE journal (id INTEGER PRIMARY KEY, step TEXT NOT NULL)",
            )?;
            Self::log(conn, "setup")
        }

        fn upgrade(&self, conn: &Connection, from: u32) -> Result<()> {
            if self.fail_upgrade_from == Some(from) {
                return Err(Error::Sql("upgrade rejected".to_string()));
            }
            conn.execute_batch(&format!("CREATE TABLE v{} (id INTEGER)", from + 1))?;
            Self::log(conn, &format!("upgrade {from}"))
        }

        fn downgrade(&self, conn: &Connection, from: u32) -> Result<()> {
            conn.execute_batch(&format!("DROP TABLE v{from}"))?;
            Self::log(conn, &format!("downgrade {from}"))
        }
    }

    fn journal_steps(manager: &ConnectionManager) -> Vec<String> {
        manager
            .query_rows("SELECT step FROM journal ORDER BY id", &[])
            .expect("journal")
            .into_iter()
            .filter_map(|row| match row.value(0) {
                Some(Value::Text(step)) => Some(step.clone()),
                _ => None,
            })
            .collect()
    }

    fn version(manager: &ConnectionManager) -> u32 {
        manager
            .with_connection(Connection::user_version)
            .expect("version")
    }

    #[test]
    fn direct_migration_equals_stepwise() {
        let direct = ConnectionManager::new(|| {
            Connection::open_in_memory().map(ManagedConnection::new)
        });
        let stepwise = ConnectionManager::new(|| {
            Connection::open_in_memory().map(ManagedConnection::new)
        });
        let migrator = LedgerMigrator::new();

        assert!(direct.migrate(&migrator, 5).expect("direct"));
        for target in 1..=5 {
            stepwise.migrate(&migrator, target).expect("step");
        }

        assert_eq!(version(&direct), 5);
        assert_eq!(version(&stepwise), 5);
        assert_eq!(journal_steps(&direct), journal_steps(&stepwise));
        assert_eq!(
            journal_steps(&direct),
            vec!["setup", "upgrade 1", "upgrade 2", "upgrade 3", "upgrade 4"]
        );
    }

    #[test]
    fn failed_step_rolls_back_ledger_and_schema() {
        let manager = ConnectionManager::new(|| {
            Connection::open_in_memory().map(ManagedConnection::new)
        });
        let migrator = LedgerMigrator::new();
        manager.migrate(&migrator, 3).expect("reach version 3");

        let failing = LedgerMigrator {
            fail_upgrade_from: Some(3),
        };
        assert!(matches!(manager.migrate(&failing, 6), Err(Error::Sql(_))));
        assert_eq!(version(&manager), 3, "ledger must be untouched");
        let has_v4 = manager
            .with_connection(|conn| conn.has_table("v4"))
            .expect("check");
        assert!(!has_v4, "partial schema must be rolled back");
        assert_eq!(
            journal_steps(&manager),
            vec!["setup", "upgrade 1", "upgrade 2"]
        );
    }

    #[test]
    fn downgrade_walks_back_one_version_at_a_time() {
        let manager = ConnectionManager::new(|| {
            Connection::open_in_memory().map(ManagedConnection::new)
        });
        let migrator = LedgerMigrator::new();
        manager.migrate(&migrator, 4).expect("up");
        assert!(manager.migrate(&migrator, 2).expect("down"));
        assert_eq!(version(&manager), 2);
        assert_eq!(
            journal_steps(&manager),
            vec![
                "setup",
                "upgrade 1",
                "upgrade 2",
                "upgrade 3",
                "downgrade 4",
                "downgrade 3"
            ]
        );
    }

    #[test]
    fn migration_edge_cases() {
        let manager = ConnectionManager::new(|| {
            Connection::open_in_memory().map(ManagedConnection::new)
        });
        let migrator = LedgerMigrator::new();
        assert!(matches!(
            manager.migrate(&migrator, 0),
            Err(Error::Parameter(_))
        ));
        assert!(manager.migrate(&migrator, 2).expect("up"));
        assert!(!manager.migrate(&migrator, 2).expect("noop"), "same version");

        struct UpgradeOnly;
        impl Migrator for UpgradeOnly {}
        assert!(matches!(
            manager.migrate(&UpgradeOnly, 1),
            Err(Error::MigrationStepMissing(StepKind::Downgrade))
        ));
    }

    #[test]
    fn did_migrate_runs_after_commit() {
        struct Observer {
            seen: AtomicUsize,
        }
        impl Migrator for Observer {
            fn setup(&self, conn: &Connection) -> Result<()> {
                conn.execute_batch("CREATE TABLE t (id INTEGER)")
            }
            fn upgrade(&self, conn: &Connection, from: u32) -> Result<()> {
                let _ = (conn, from);
                Ok(())
            }
            fn did_migrate(&self, conn: &Connection, from: u32, to: u32) -> Result<()> {
                assert_eq!((from, to), (0, 2));
                // Runs outside the transaction, so the committed ledger is
                // already visible.
                assert_eq!(conn.user_version()?, 2);
                self.seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }
        let manager = ConnectionManager::new(|| {
            Connection::open_in_memory().map(ManagedConnection::new)
        });
        let observer = Observer {
            seen: AtomicUsize::new(0),
        };
        manager.migrate(&observer, 2).expect("migrate");
        assert_eq!(observer.seen.load(Ordering::SeqCst), 1);
        manager.migrate(&observer, 2).expect("noop");
        assert_eq!(observer.seen.load(Ordering::SeqCst), 1, "no-op skips the hook");
    }

    #[test]
    fn soft_heap_limit_is_accepted() {
        global_config(GlobalOption::SoftHeapLimit(8 * 1024 * 1024)).expect("set");
        global_config(GlobalOption::SoftHeapLimit(0)).expect("clear");
    }
}
