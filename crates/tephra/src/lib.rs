//! Tephra: an event-sourced database on SQLite
//!
//! Tephra ingests an ordered stream of events, runs them serially through
//! user-supplied preprocessors, reducers, and derivers, and atomically
//! applies the resulting changes to derived-state tables. The authoritative
//! state is determined entirely by the events handled so far; tables are
//! projections.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use serde_json::json;
//! use tephra::prelude::*;
//!
//! struct Counter;
//!
//! #[async_trait]
//! impl Model for Counter {
//!     fn name(&self) -> &str {
//!         "counter"
//!     }
//!     fn hooks(&self) -> HookSet {
//!         HookSet::reducer()
//!     }
//!     async fn setup(&self, db: &SqliteDb) -> Result<()> {
//!         db.exec("CREATE TABLE IF NOT EXISTS counter (id INTEGER PRIMARY KEY, n INT)").await
//!     }
//!     async fn reduce(&self, cx: HookCx<'_>) -> Result<Reduction> {
//!         Ok(Reduction::Change(json!({"ins": [{"id": cx.event.v, "n": 1}]})))
//!     }
//!     async fn apply_changes(&self, db: &SqliteDb, change: &serde_json::Value) -> Result<()> {
//!         // write the change description to the counter table
//!         # let _ = (db, change);
//!         Ok(())
//!     }
//! }
//!
//! # #[tokio::main] async fn main() -> Result<()> {
//! let esdb = EventDb::open(SqliteDb::memory(), vec![Arc::new(Counter)]).await?;
//! let handled = esdb.dispatch("inc", json!({}), None).await?;
//! assert_eq!(esdb.version().await?, handled.v);
//! # Ok(())
//! # }
//! ```

pub mod esdb;
pub mod metadata;
pub mod model;
pub mod prelude;
pub mod queue;
pub mod reduce;

// Re-export the layers this crate builds on.
pub use tephra_core::{
    DbConfig, EsdbConfig, EsdbEvent, Event, EventVersion, ModelMap, Result, ResultExt,
    TephraError, TxEvent,
};
pub use tephra_sqlite::{quote_id, val_to_sql, Migrator, Prepared, Row, SqlFragment, SqliteDb};

pub use esdb::EventDb;
pub use model::{DeriveCx, HookCx, HookSet, Model, Reduction, Store, METADATA};
pub use queue::EventQueue;
pub use reduce::ReducerOutcome;
