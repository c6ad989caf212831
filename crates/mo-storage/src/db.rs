//! Database connection management.
//!
//! Keeps one SQLite connection per calling thread in a pool owned by the
//! `Database` value. The first connection opened runs schema initialization
//! before anything else can use the file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, ThreadId};
use std::time::Duration;

use rusqlite::functions::{Context, FunctionFlags};
use rusqlite::types::{Value, ValueRef};
use rusqlite::{Connection, TransactionBehavior};
use tracing::{debug, info};

use mo_core::config::{DatabaseDirSource, MoConfig, StorageConfig};
use mo_core::error::{MoError, Result};

use crate::migrations::{self, Migrator};

/// Fixed name of the database file inside the storage directory.
pub const DB_FILE: &str = "database.sqlite";

/// SQL name of the Unicode-aware lower-case function registered on every
/// connection. SQLite's built-in `LOWER` only folds ASCII.
pub const UNICODE_LOWER: &str = "mo_lower";

/// A pooled connection. Only the owning thread locks it, except for the
/// single shared connection of an in-memory database.
pub type SharedConnection = Arc<Mutex<Connection>>;

enum Backing {
    File(PathBuf),
    Memory(SharedConnection),
}

struct Pool {
    connections: HashMap<ThreadId, SharedConnection>,
    schema_ready: bool,
}

/// Handle to the record database.
///
/// Share it as `Arc<Database>`; each thread that touches it gets its own
/// connection, opened on first use and kept until the thread releases it.
pub struct Database {
    backing: Backing,
    busy_timeout: Duration,
    journal_mode: &'static str,
    pool: Mutex<Pool>,
}

impl Database {
    /// Open (or create) a database at the given path with default options.
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with(path, &StorageConfig::default())
    }

    /// Open (or create) a database at the given path.
    ///
    /// The calling thread's connection is opened immediately, so a missing
    /// directory, an unreadable file or a broken migration chain is reported
    /// here rather than on the first query.
    pub fn open_with(path: &Path, options: &StorageConfig) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| unavailable(path, e))?;
            }
        }

        let db = Self {
            backing: Backing::File(path.to_path_buf()),
            busy_timeout: Duration::from_secs(options.busy_timeout_secs),
            journal_mode: parse_journal_mode(&options.journal_mode)?,
            pool: Mutex::new(Pool {
                connections: HashMap::new(),
                schema_ready: false,
            }),
        };

        db.connection_for_current_thread()?;
        info!("Database opened at {}", path.display());
        Ok(db)
    }

    /// Open the database at the location the configuration resolves to.
    pub fn from_config(config: &MoConfig) -> Result<Self> {
        let path = resolve_database_path(config);
        Self::open_with(&path, &config.storage)
    }

    /// Open an in-memory database (for testing).
    ///
    /// All threads share one connection guarded by its mutex.
    pub fn in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory().map_err(|e| MoError::StorageUnavailable {
            path: ":memory:".to_string(),
            reason: e.to_string(),
        })?;

        let busy_timeout = Duration::from_secs(StorageConfig::default().busy_timeout_secs);
        configure(&conn, busy_timeout, None).map_err(|e| MoError::StorageUnavailable {
            path: ":memory:".to_string(),
            reason: e.to_string(),
        })?;
        Migrator::current().initialize(&mut conn, None)?;

        Ok(Self {
            backing: Backing::Memory(Arc::new(Mutex::new(conn))),
            busy_timeout,
            journal_mode: "MEMORY",
            pool: Mutex::new(Pool {
                connections: HashMap::new(),
                schema_ready: true,
            }),
        })
    }

    /// Path of the database file, `None` for in-memory databases.
    pub fn path(&self) -> Option<&Path> {
        match &self.backing {
            Backing::File(path) => Some(path),
            Backing::Memory(_) => None,
        }
    }

    /// The calling thread's connection, opened on first use.
    pub fn connection_for_current_thread(&self) -> Result<SharedConnection> {
        let path = match &self.backing {
            Backing::Memory(conn) => return Ok(Arc::clone(conn)),
            Backing::File(path) => path,
        };

        let key = thread::current().id();
        let mut pool = self.lock_pool()?;
        if let Some(conn) = pool.connections.get(&key) {
            return Ok(Arc::clone(conn));
        }

        let mut conn = Connection::open(path).map_err(|e| unavailable(path, e))?;
        configure(&conn, self.busy_timeout, Some(self.journal_mode))
            .map_err(|e| unavailable(path, e))?;

        // Holding the pool lock keeps other threads out until the schema is current.
        if !pool.schema_ready {
            Migrator::current().initialize(&mut conn, Some(path))?;
            pool.schema_ready = true;
        }

        let shared = Arc::new(Mutex::new(conn));
        pool.connections.insert(key, Arc::clone(&shared));
        debug!(thread = ?key, open = pool.connections.len(), "Opened database connection");
        Ok(shared)
    }

    /// Execute a closure with the calling thread's connection.
    ///
    /// Statements run in autocommit mode. Use [`Database::transaction`] for
    /// anything that writes more than one statement.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let shared = self.connection_for_current_thread()?;
        let conn = shared
            .lock()
            .map_err(|e| MoError::Storage(format!("Connection lock poisoned: {}", e)))?;
        f(&conn)
    }

    /// Execute a closure inside a transaction on the calling thread's
    /// connection. Commits when the closure returns `Ok`, rolls back
    /// otherwise.
    ///
    /// The write lock is taken up front (`BEGIN IMMEDIATE`), so a closure
    /// that reads before it writes waits on the busy timeout instead of
    /// failing when another connection committed in between.
    ///
    /// The module-level functions in [`crate::records`] and [`crate::tags`]
    /// take a `&Connection`, so several of them can share one transaction.
    pub fn transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let shared = self.connection_for_current_thread()?;
        let mut conn = shared
            .lock()
            .map_err(|e| MoError::Storage(format!("Connection lock poisoned: {}", e)))?;

        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| MoError::Storage(format!("Failed to begin transaction: {}", e)))?;
        let value = f(&tx)?;
        tx.commit()
            .map_err(|e| MoError::Storage(format!("Failed to commit transaction: {}", e)))?;
        Ok(value)
    }

    /// Schema version recorded in the database.
    pub fn schema_version(&self) -> Result<u32> {
        self.with_conn(|conn| Ok(migrations::read_version(conn)?.unwrap_or(0)))
    }

    /// Number of live pooled connections.
    pub fn connection_count(&self) -> Result<usize> {
        match &self.backing {
            Backing::Memory(_) => Ok(1),
            Backing::File(_) => Ok(self.lock_pool()?.connections.len()),
        }
    }

    /// Drop the calling thread's connection from the pool.
    ///
    /// Returns `false` if the thread had none. The next call on this thread
    /// opens a fresh connection.
    pub fn release_current_thread(&self) -> Result<bool> {
        if let Backing::Memory(_) = self.backing {
            return Ok(false);
        }
        let key = thread::current().id();
        let released = self.lock_pool()?.connections.remove(&key).is_some();
        if released {
            debug!(thread = ?key, "Released database connection");
        }
        Ok(released)
    }

    fn lock_pool(&self) -> Result<MutexGuard<'_, Pool>> {
        self.pool
            .lock()
            .map_err(|e| MoError::Storage(format!("Connection pool lock poisoned: {}", e)))
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.path())
            .field("journal_mode", &self.journal_mode)
            .finish()
    }
}

/// Full path of the database file: the configured directory, or the
/// application directory when none is configured.
pub fn resolve_database_path(source: &dyn DatabaseDirSource) -> PathBuf {
    source
        .database_dir()
        .unwrap_or_else(default_app_dir)
        .join(DB_FILE)
}

fn default_app_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
}

fn configure(
    conn: &Connection,
    busy_timeout: Duration,
    journal_mode: Option<&str>,
) -> std::result::Result<(), rusqlite::Error> {
    conn.busy_timeout(busy_timeout)?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.create_scalar_function(
        UNICODE_LOWER,
        1,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        unicode_lower,
    )?;
    if let Some(mode) = journal_mode {
        let applied: String =
            conn.query_row(&format!("PRAGMA journal_mode = {}", mode), [], |row| row.get(0))?;
        debug!(requested = mode, applied = %applied, "Journal mode set");
    }
    Ok(())
}

fn unicode_lower(ctx: &Context<'_>) -> rusqlite::Result<Value> {
    Ok(match ctx.get_raw(0) {
        ValueRef::Text(text) => Value::Text(String::from_utf8_lossy(text).to_lowercase()),
        other => Value::from(other),
    })
}

fn parse_journal_mode(mode: &str) -> Result<&'static str> {
    match mode.trim().to_lowercase().as_str() {
        "delete" => Ok("DELETE"),
        "truncate" => Ok("TRUNCATE"),
        "persist" => Ok("PERSIST"),
        "memory" => Ok("MEMORY"),
        "wal" => Ok("WAL"),
        other => Err(MoError::Config(format!("Unsupported journal mode: {}", other))),
    }
}

fn unavailable(path: &Path, err: impl std::fmt::Display) -> MoError {
    MoError::StorageUnavailable {
        path: path.display().to_string(),
        reason: err.to_string(),
    }
}
