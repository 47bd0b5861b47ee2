//! Keyed schema migrations.
//!
//! Migrations are registered in order under a unique name and applied once
//! each, inside a transaction, with the name recorded in a bookkeeping
//! table. Reruns skip recorded names, so independent components (models,
//! the event queue) can contribute migrations to one shared database.
//! No down-migrations.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use rusqlite::types::Value;

use tephra_core::{Result, TephraError};

use crate::db::SqliteDb;

type MigrationFn = Arc<dyn Fn(SqliteDb) -> BoxFuture<'static, Result<()>> + Send + Sync>;

const BOOKKEEPING: &str = "CREATE TABLE IF NOT EXISTS tephra_migrations (
    name TEXT PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
)";

/// Ordered collection of named, once-only migrations.
#[derive(Default)]
pub struct Migrator {
    steps: Vec<(String, MigrationFn)>,
}

impl Migrator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a migration. Names must be unique; duplicates error at
    /// registration time.
    pub fn add<F, Fut>(&mut self, name: impl Into<String>, step: F) -> Result<()>
    where
        F: Fn(SqliteDb) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let name = name.into();
        if self.steps.iter().any(|(n, _)| n == &name) {
            return Err(TephraError::Config(format!(
                "migration '{name}' registered twice"
            )));
        }
        self.steps
            .push((name, Arc::new(move |db| Box::pin(step(db)))));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Apply all pending migrations to `db`, in registration order.
    pub async fn run(&self, db: &SqliteDb) -> Result<()> {
        db.exec(BOOKKEEPING).await?;

        let applied: HashSet<String> = db
            .all("SELECT name FROM tephra_migrations")
            .await?
            .iter()
            .filter_map(|row| row.get_str("name").map(|s| s.to_string()))
            .collect();

        for (name, step) in &self.steps {
            if applied.contains(name) {
                continue;
            }
            tracing::info!(db = %db.name(), migration = %name, "applying migration");
            let step = step.clone();
            let name = name.clone();
            let db_for_body = db.clone();
            db.with_transaction(move || async move {
                step(db_for_body.clone()).await?;
                db_for_body
                    .run((
                        "INSERT INTO tephra_migrations (name) VALUES (?)",
                        vec![Value::Text(name)],
                    ))
                    .await?;
                Ok(())
            })
            .await?;
        }
        Ok(())
    }
}
