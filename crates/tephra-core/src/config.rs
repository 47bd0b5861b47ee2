use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for a [`SqliteDb`](https://docs.rs/tephra-sqlite) handle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbConfig {
    /// Path to the database file. `None` opens an in-memory database,
    /// which is discarded on close.
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Open read-only. Implies no vacuum task.
    #[serde(default)]
    pub read_only: bool,

    /// Enable WAL journal mode.
    /// Default: true
    #[serde(default = "default_wal")]
    pub wal: bool,

    /// Set `PRAGMA auto_vacuum = FULL` at open and run periodic
    /// incremental vacuums.
    #[serde(default)]
    pub auto_vacuum: bool,

    /// Interval between incremental vacuum runs, in milliseconds.
    /// Default: 30000
    #[serde(default = "default_vacuum_interval_ms")]
    pub vacuum_interval_ms: u64,

    /// Pages reclaimed per incremental vacuum run.
    /// Default: 1024
    #[serde(default = "default_vacuum_pages")]
    pub vacuum_pages: u32,
}

fn default_wal() -> bool {
    true
}

fn default_vacuum_interval_ms() -> u64 {
    30_000
}

fn default_vacuum_pages() -> u32 {
    1024
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: None,
            read_only: false,
            wal: default_wal(),
            auto_vacuum: false,
            vacuum_interval_ms: default_vacuum_interval_ms(),
            vacuum_pages: default_vacuum_pages(),
        }
    }
}

impl DbConfig {
    /// File-backed database at `path`.
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::default()
        }
    }

    /// In-memory database.
    pub fn memory() -> Self {
        Self::default()
    }

    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn with_wal(mut self, wal: bool) -> Self {
        self.wal = wal;
        self
    }

    pub fn with_auto_vacuum(mut self, auto_vacuum: bool) -> Self {
        self.auto_vacuum = auto_vacuum;
        self
    }

    pub fn with_vacuum_interval(mut self, interval: Duration) -> Self {
        self.vacuum_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Database identity used in error messages and logs.
    pub fn identity(&self) -> String {
        match &self.path {
            Some(path) => path.display().to_string(),
            None => ":memory:".to_string(),
        }
    }

    pub fn vacuum_interval(&self) -> Duration {
        Duration::from_millis(self.vacuum_interval_ms)
    }
}

/// Configuration for the event-sourced database core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EsdbConfig {
    /// Interval between cross-process probes while a blocking
    /// `get_next` waits for events, in milliseconds.
    /// Default: 100
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Back-off after a failed apply before the event is retried,
    /// in milliseconds.
    /// Default: 1000
    #[serde(default = "default_apply_retry_ms")]
    pub apply_retry_ms: u64,
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_apply_retry_ms() -> u64 {
    1_000
}

impl Default for EsdbConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            apply_retry_ms: default_apply_retry_ms(),
        }
    }
}

impl EsdbConfig {
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn apply_retry(&self) -> Duration {
        Duration::from_millis(self.apply_retry_ms)
    }
}
