//! Tephra core: shared types for the tephra event-sourced database
//!
//! This crate defines what the rest of the workspace agrees on:
//! - The [`Event`] record and its version ordering
//! - The [`TephraError`] error type and [`Result`] alias
//! - Configuration for the SQLite handle and the event pipeline

pub mod config;
pub mod error;
pub mod types;

pub use config::{DbConfig, EsdbConfig};
pub use error::{Result, ResultExt, TephraError};
pub use types::{EsdbEvent, Event, EventVersion, ModelMap, TxEvent};
