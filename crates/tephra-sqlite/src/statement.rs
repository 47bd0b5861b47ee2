//! Reusable parameterized statements.

use std::sync::atomic::{AtomicBool, Ordering};

use rusqlite::types::Value;

use tephra_core::{Result, TephraError};

use crate::db::{Row, RunResult, SqliteDb};

/// A prepared statement: source SQL bound to a [`SqliteDb`] handle.
///
/// Compilation goes through the connection's statement cache, so the
/// compiled handle is invalidated with the connection on close and
/// recompiled lazily on next use after a reopen. The statement resets
/// after every operation; repeated [`Prepared::get`] calls return the
/// first row each time, not successive rows.
#[derive(Debug)]
pub struct Prepared {
    db: SqliteDb,
    sql: String,
    finalized: AtomicBool,
}

impl Prepared {
    pub(crate) fn new(db: SqliteDb, sql: String) -> Self {
        Self {
            db,
            sql,
            finalized: AtomicBool::new(false),
        }
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    fn check(&self) -> Result<()> {
        if self.finalized.load(Ordering::SeqCst) {
            return Err(TephraError::Finalized(self.sql.clone()));
        }
        Ok(())
    }

    /// Fetch the first row, if any.
    pub async fn get(&self, binds: Vec<Value>) -> Result<Option<Row>> {
        self.check()?;
        self.db.get((self.sql.clone(), binds)).await
    }

    /// Fetch all rows.
    pub async fn all(&self, binds: Vec<Value>) -> Result<Vec<Row>> {
        self.check()?;
        self.db.all((self.sql.clone(), binds)).await
    }

    /// Execute, returning `{last_insert_id, changes}`.
    pub async fn run(&self, binds: Vec<Value>) -> Result<RunResult> {
        self.check()?;
        self.db.run((self.sql.clone(), binds)).await
    }

    /// Stream rows to `on_row`, resolving with the row count.
    pub async fn each<F>(&self, binds: Vec<Value>, on_row: F) -> Result<usize>
    where
        F: FnMut(Row) + Send + 'static,
    {
        self.check()?;
        self.db.each((self.sql.clone(), binds), on_row).await
    }

    /// Release the statement. Idempotent; later operations error.
    pub fn finalize(&self) {
        self.finalized.store(true, Ordering::SeqCst);
    }
}
