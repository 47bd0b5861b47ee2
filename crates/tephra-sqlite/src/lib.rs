//! Tephra SQLite layer: async connection wrapper and SQL tooling
//!
//! This crate provides the pieces the event pipeline builds on:
//! - [`SqlFragment`]: templated SQL with typed interpolation modes
//! - [`SqliteDb`]: lazy-opening async handle with serialized I/O,
//!   transaction notifications, and a `data_version` probe
//! - [`Prepared`]: reusable statements that survive reopen
//! - [`Migrator`]: keyed, once-only schema migrations

pub mod db;
pub mod fragment;
pub mod migrate;
pub mod statement;

pub use db::{Row, RunResult, SqliteDb};
pub use fragment::{quote_id, val_to_sql, SqlFragment};
pub use migrate::Migrator;
pub use statement::Prepared;

pub use rusqlite::types::Value;
