//! Async single-writer handle around an embedded SQLite connection.
//!
//! All I/O funnels through one read-write connection guarded by a mutex and
//! executed on the blocking pool, so exactly one SQL operation runs at a
//! time. `with_transaction` additionally serializes whole transaction
//! bodies behind an async write lock and emits [`TxEvent`] notifications.
//!
//! The handle opens lazily: the first operation (or an explicit `open`)
//! creates the connection, firing the `on_will_open` hook exactly once per
//! physical open. `close` drops the connection; the next operation reopens
//! (for in-memory databases that means a fresh database).

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use rusqlite::types::Value;
use rusqlite::{Connection, OpenFlags};
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

use tephra_core::{DbConfig, Result, TephraError, TxEvent};

use crate::fragment::SqlFragment;
use crate::statement::Prepared;

type OpenHook = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

const TX_EVENT_CAPACITY: usize = 64;

/// Outcome of a mutating statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunResult {
    /// Rowid of the last inserted row on this connection.
    pub last_insert_id: i64,
    /// Rows changed by the statement.
    pub changes: usize,
}

/// An owned row: column names plus SQLite values.
#[derive(Debug, Clone)]
pub struct Row {
    columns: Arc<[String]>,
    values: Vec<Value>,
}

impl Row {
    fn read(columns: &Arc<[String]>, row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        let mut values = Vec::with_capacity(columns.len());
        for idx in 0..columns.len() {
            values.push(row.get::<_, Value>(idx)?);
        }
        Ok(Self {
            columns: columns.clone(),
            values,
        })
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        let idx = self.columns.iter().position(|c| c == column)?;
        self.values.get(idx)
    }

    pub fn get_i64(&self, column: &str) -> Option<i64> {
        match self.get(column)? {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn get_f64(&self, column: &str) -> Option<f64> {
        match self.get(column)? {
            Value::Real(f) => Some(*f),
            Value::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn get_str(&self, column: &str) -> Option<&str> {
        match self.get(column)? {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Parse a TEXT column as JSON.
    pub fn get_json(&self, column: &str) -> Option<serde_json::Value> {
        serde_json::from_str(self.get_str(column)?).ok()
    }
}

struct DbInner {
    config: DbConfig,
    name: String,
    conn: Mutex<Option<Connection>>,
    /// Serializes whole `with_transaction` bodies.
    txn_lock: AsyncMutex<()>,
    /// Serializes physical opens (and the `on_will_open` hook).
    open_lock: AsyncMutex<()>,
    tx_events: broadcast::Sender<TxEvent>,
    on_will_open: Mutex<Option<OpenHook>>,
    vacuum: Mutex<Option<JoinHandle<()>>>,
    generation: AtomicU64,
}

/// Cloneable async handle to a single SQLite connection.
#[derive(Clone)]
pub struct SqliteDb {
    inner: Arc<DbInner>,
}

impl std::fmt::Debug for SqliteDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteDb")
            .field("db", &self.inner.name)
            .field("open", &self.inner.conn.lock().is_some())
            .finish()
    }
}

impl SqliteDb {
    pub fn new(config: DbConfig) -> Self {
        let (tx_events, _) = broadcast::channel(TX_EVENT_CAPACITY);
        let name = config.identity();
        Self {
            inner: Arc::new(DbInner {
                config,
                name,
                conn: Mutex::new(None),
                txn_lock: AsyncMutex::new(()),
                open_lock: AsyncMutex::new(()),
                tx_events,
                on_will_open: Mutex::new(None),
                vacuum: Mutex::new(None),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// In-memory database with default configuration.
    pub fn memory() -> Self {
        Self::new(DbConfig::memory())
    }

    /// File-backed database with default configuration.
    pub fn file(path: impl Into<std::path::PathBuf>) -> Self {
        Self::new(DbConfig::file(path))
    }

    /// Database identity: the file path, or `:memory:`.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &DbConfig {
        &self.inner.config
    }

    /// Number of physical opens so far. Bumps on each (re)open.
    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    /// Install the hook fired before each physical open.
    pub fn on_will_open<F, Fut>(&self, hook: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        *self.inner.on_will_open.lock() = Some(Arc::new(move || Box::pin(hook())));
    }

    /// Subscribe to transaction notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<TxEvent> {
        self.inner.tx_events.subscribe()
    }

    fn emit(&self, event: TxEvent) {
        // Nobody listening is fine.
        let _ = self.inner.tx_events.send(event);
    }

    /// Open the connection now instead of on first use.
    pub async fn open(&self) -> Result<()> {
        self.ensure_open().await
    }

    /// True while the periodic incremental-vacuum task is scheduled.
    pub fn vacuum_task_active(&self) -> bool {
        self.inner.vacuum.lock().is_some()
    }

    async fn ensure_open(&self) -> Result<()> {
        if self.inner.conn.lock().is_some() {
            return Ok(());
        }
        let _open = self.inner.open_lock.lock().await;
        if self.inner.conn.lock().is_some() {
            return Ok(());
        }

        let hook = self.inner.on_will_open.lock().clone();
        if let Some(hook) = hook {
            hook().await?;
        }

        let inner = self.inner.clone();
        let conn = tokio::task::spawn_blocking(move || open_connection(&inner.config))
            .await
            .map_err(|e| TephraError::Internal(format!("open task failed: {e}")))?
            .map_err(|e| TephraError::Connection {
                db: self.inner.name.clone(),
                message: e.to_string(),
            })?;

        *self.inner.conn.lock() = Some(conn);
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(db = %self.inner.name, "opened sqlite connection");

        if self.inner.config.auto_vacuum && !self.inner.config.read_only {
            self.spawn_vacuum_task();
        }
        Ok(())
    }

    fn spawn_vacuum_task(&self) {
        let mut slot = self.inner.vacuum.lock();
        if slot.is_some() {
            return;
        }
        let db = self.clone();
        let interval = self.inner.config.vacuum_interval();
        let pages = self.inner.config.vacuum_pages;
        *slot = Some(tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tick.tick().await;
            loop {
                tick.tick().await;
                if let Err(e) = db.exec(format!("PRAGMA incremental_vacuum({pages})")).await {
                    tracing::warn!(db = %db.name(), error = %e, "incremental vacuum failed");
                }
            }
        }));
    }

    /// Close the connection, finalizing prepared statements and cancelling
    /// the vacuum task. The next operation reopens.
    pub async fn close(&self) -> Result<()> {
        if let Some(task) = self.inner.vacuum.lock().take() {
            task.abort();
        }
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            inner.conn.lock().take();
        })
        .await
        .map_err(|e| TephraError::Internal(format!("close task failed: {e}")))?;
        tracing::debug!(db = %self.inner.name, "closed sqlite connection");
        Ok(())
    }

    /// Run `f` against the connection on the blocking pool. SQL failures
    /// are decorated with the database identity and the offending SQL.
    async fn with_conn<T, F>(&self, sql: String, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        self.ensure_open().await?;
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = inner.conn.lock();
            let conn = guard.as_ref().ok_or_else(|| TephraError::Connection {
                db: inner.name.clone(),
                message: "connection closed".to_string(),
            })?;
            f(conn).map_err(|e| TephraError::Sql {
                db: inner.name.clone(),
                sql,
                message: e.to_string(),
            })
        })
        .await
        .map_err(|e| TephraError::Internal(format!("db task failed: {e}")))?
    }

    /// Execute a multi-statement script. Takes no bind values.
    pub async fn exec(&self, fragment: impl Into<SqlFragment>) -> Result<()> {
        let fragment = fragment.into();
        if !fragment.binds().is_empty() {
            return Err(TephraError::InvalidState(
                "exec takes a script without bind values; use run".to_string(),
            ));
        }
        let (sql, _) = fragment.into_parts();
        let script = sql.clone();
        self.with_conn(sql, move |conn| conn.execute_batch(&script))
            .await
    }

    /// Execute a single statement, returning `{last_insert_id, changes}`.
    pub async fn run(&self, fragment: impl Into<SqlFragment>) -> Result<RunResult> {
        let (sql, binds) = fragment.into().into_parts();
        let stmt_sql = sql.clone();
        self.with_conn(sql, move |conn| {
            let mut stmt = conn.prepare_cached(&stmt_sql)?;
            let changes = stmt.execute(rusqlite::params_from_iter(binds))?;
            Ok(RunResult {
                last_insert_id: conn.last_insert_rowid(),
                changes,
            })
        })
        .await
    }

    /// Fetch the first row, if any.
    pub async fn get(&self, fragment: impl Into<SqlFragment>) -> Result<Option<Row>> {
        let (sql, binds) = fragment.into().into_parts();
        let stmt_sql = sql.clone();
        self.with_conn(sql, move |conn| {
            let mut stmt = conn.prepare_cached(&stmt_sql)?;
            let columns: Arc<[String]> =
                stmt.column_names().iter().map(|c| c.to_string()).collect();
            let mut rows = stmt.query(rusqlite::params_from_iter(binds))?;
            match rows.next()? {
                Some(row) => Ok(Some(Row::read(&columns, row)?)),
                None => Ok(None),
            }
        })
        .await
    }

    /// Fetch all rows.
    pub async fn all(&self, fragment: impl Into<SqlFragment>) -> Result<Vec<Row>> {
        let (sql, binds) = fragment.into().into_parts();
        let stmt_sql = sql.clone();
        self.with_conn(sql, move |conn| {
            let mut stmt = conn.prepare_cached(&stmt_sql)?;
            let columns: Arc<[String]> =
                stmt.column_names().iter().map(|c| c.to_string()).collect();
            let mut rows = stmt.query(rusqlite::params_from_iter(binds))?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(Row::read(&columns, row)?);
            }
            Ok(out)
        })
        .await
    }

    /// Stream rows to `on_row`, resolving with the row count.
    pub async fn each<F>(&self, fragment: impl Into<SqlFragment>, mut on_row: F) -> Result<usize>
    where
        F: FnMut(Row) + Send + 'static,
    {
        let (sql, binds) = fragment.into().into_parts();
        let stmt_sql = sql.clone();
        self.with_conn(sql, move |conn| {
            let mut stmt = conn.prepare_cached(&stmt_sql)?;
            let columns: Arc<[String]> =
                stmt.column_names().iter().map(|c| c.to_string()).collect();
            let mut rows = stmt.query(rusqlite::params_from_iter(binds))?;
            let mut count = 0;
            while let Some(row) = rows.next()? {
                on_row(Row::read(&columns, row)?);
                count += 1;
            }
            Ok(count)
        })
        .await
    }

    /// A reusable parameterized statement, compiled lazily through the
    /// connection's statement cache (so it survives close/reopen).
    pub fn prepare(&self, sql: impl Into<String>) -> Prepared {
        Prepared::new(self.clone(), sql.into())
    }

    /// Run `body` inside `BEGIN IMMEDIATE .. COMMIT/ROLLBACK`.
    ///
    /// Bodies are serialized process-wide per handle: a second call waits
    /// for the first to commit or roll back. Emits `Begin` before the body,
    /// `End` on commit or `Rollback` on failure (mutually exclusive), and
    /// `Finally` exactly once, last.
    pub async fn with_transaction<F, Fut, T>(&self, body: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.ensure_open().await?;
        let _txn = self.inner.txn_lock.lock().await;

        self.emit(TxEvent::Begin);
        if let Err(e) = self.exec("BEGIN IMMEDIATE").await {
            self.emit(TxEvent::Finally);
            return Err(e);
        }

        let outcome = body().await;
        let outcome = match outcome {
            Ok(value) => match self.exec("COMMIT").await {
                Ok(()) => {
                    self.emit(TxEvent::End);
                    Ok(value)
                }
                Err(e) => {
                    let _ = self.exec("ROLLBACK").await;
                    self.emit(TxEvent::Rollback);
                    Err(e)
                }
            },
            Err(e) => {
                let _ = self.exec("ROLLBACK").await;
                self.emit(TxEvent::Rollback);
                Err(e)
            }
        };
        self.emit(TxEvent::Finally);
        outcome
    }

    /// `PRAGMA data_version`: per-connection counter that moves only when
    /// another connection commits to the same database.
    pub async fn data_version(&self) -> Result<i64> {
        let sql = "PRAGMA data_version".to_string();
        let stmt_sql = sql.clone();
        self.with_conn(sql, move |conn| {
            conn.query_row(&stmt_sql, [], |row| row.get(0))
        })
        .await
    }

    /// `PRAGMA user_version` getter, for consumer use.
    pub async fn user_version(&self) -> Result<i64> {
        let sql = "PRAGMA user_version".to_string();
        let stmt_sql = sql.clone();
        self.with_conn(sql, move |conn| {
            conn.query_row(&stmt_sql, [], |row| row.get(0))
        })
        .await
    }

    /// `PRAGMA user_version` setter.
    pub async fn set_user_version(&self, version: i64) -> Result<()> {
        self.exec(format!("PRAGMA user_version = {version}")).await
    }
}

fn open_connection(config: &DbConfig) -> rusqlite::Result<Connection> {
    let conn = match &config.path {
        Some(path) => {
            let flags = if config.read_only {
                OpenFlags::SQLITE_OPEN_READ_ONLY
            } else {
                OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE
            };
            Connection::open_with_flags(path, flags)?
        }
        None => Connection::open_in_memory()?,
    };

    if config.wal && config.path.is_some() {
        conn.pragma_update(None, "journal_mode", "WAL")?;
    }
    conn.pragma_update(None, "foreign_keys", "ON")?;
    if config.auto_vacuum && !config.read_only {
        conn.pragma_update(None, "auto_vacuum", "FULL")?;
    }
    Ok(conn)
}
