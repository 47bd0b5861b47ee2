//! Convenience re-exports for the common surface.

pub use tephra_core::{
    DbConfig, EsdbConfig, EsdbEvent, Event, EventVersion, Result, TephraError, TxEvent,
};
pub use tephra_sqlite::{SqlFragment, SqliteDb};

pub use crate::esdb::EventDb;
pub use crate::model::{DeriveCx, HookCx, HookSet, Model, Reduction, Store};
pub use crate::queue::EventQueue;
