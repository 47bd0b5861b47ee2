//! Model registration and hook contracts.
//!
//! A model binds a name to a derived-state table plus optional hooks:
//! a preprocessor (may rewrite an event before reducers see it), a reducer
//! (pure event → change description), and a deriver (side effects after
//! changes are applied). `apply_changes` writes a reducer's change
//! description to the model's table.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use tephra_core::{Event, ModelMap, Result, TephraError};
use tephra_sqlite::SqliteDb;

/// The reserved model name owning the applied-version cursor.
pub const METADATA: &str = "metadata";

/// Which hooks a model provides.
///
/// Trait objects cannot reveal which default methods were overridden, so
/// registration partitions models by this declaration instead.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HookSet {
    pub preprocessor: bool,
    pub reducer: bool,
    pub deriver: bool,
}

impl HookSet {
    pub const NONE: HookSet = HookSet {
        preprocessor: false,
        reducer: false,
        deriver: false,
    };

    pub fn reducer() -> Self {
        HookSet {
            reducer: true,
            ..Self::NONE
        }
    }

    pub fn with_preprocessor(mut self) -> Self {
        self.preprocessor = true;
        self
    }

    pub fn with_reducer(mut self) -> Self {
        self.reducer = true;
        self
    }

    pub fn with_deriver(mut self) -> Self {
        self.deriver = true;
        self
    }
}

/// Context for preprocessor and reducer hooks.
///
/// Models hold no back-pointers; everything they need arrives here.
pub struct HookCx<'a> {
    pub db: &'a SqliteDb,
    pub store: &'a Store,
    pub event: &'a Event,
}

/// Context for deriver hooks, after the event's changes are applied.
pub struct DeriveCx<'a> {
    pub db: &'a SqliteDb,
    pub store: &'a Store,
    pub event: &'a Event,
    /// The applied reducer outputs, keyed by model name.
    pub result: &'a ModelMap,
}

/// A reducer's verdict for one event.
#[derive(Debug, Clone, PartialEq)]
pub enum Reduction {
    /// Apply this change description.
    Change(Value),
    /// The event is invalid for this model; recorded under the model's
    /// name in `event.error`.
    Error(Value),
    /// No change; the entry is dropped from the result.
    Skip,
}

#[async_trait]
pub trait Model: Send + Sync {
    /// Registration name; also the key in `event.result` / `event.error`.
    fn name(&self) -> &str;

    /// Declares which hooks this model provides.
    fn hooks(&self) -> HookSet {
        HookSet::NONE
    }

    /// Schema migration, run once per database through the migrator.
    async fn setup(&self, db: &SqliteDb) -> Result<()> {
        let _ = db;
        Ok(())
    }

    /// Rewrite the event before reducers run. Must keep `event.v` and a
    /// non-empty type; `None` leaves the event untouched. An `Err`
    /// short-circuits preprocessing and is recorded under this model's
    /// name.
    async fn preprocess(&self, cx: HookCx<'_>) -> Result<Option<Event>> {
        let _ = cx;
        Ok(None)
    }

    /// Produce a change description for the event. Runs inside the
    /// reduction transaction; read, don't write.
    async fn reduce(&self, cx: HookCx<'_>) -> Result<Reduction> {
        let _ = cx;
        Ok(Reduction::Skip)
    }

    /// Write a change description to this model's table. Runs inside the
    /// apply transaction.
    async fn apply_changes(&self, db: &SqliteDb, change: &Value) -> Result<()> {
        let _ = (db, change);
        Ok(())
    }

    /// Side effects after the event's changes are committed. Runs outside
    /// the apply transaction and may write tables directly.
    async fn derive(&self, cx: DeriveCx<'_>) -> Result<()> {
        let _ = cx;
        Ok(())
    }
}

/// Name → model registry, in registration order.
pub struct Store {
    models: Vec<Arc<dyn Model>>,
    by_name: HashMap<String, usize>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("models", &self.by_name.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Store {
    pub fn new(models: Vec<Arc<dyn Model>>) -> Result<Self> {
        let mut by_name = HashMap::with_capacity(models.len());
        for (idx, model) in models.iter().enumerate() {
            let name = model.name().to_string();
            if name.is_empty() {
                return Err(TephraError::Model("model name may not be empty".into()));
            }
            if by_name.insert(name, idx).is_some() {
                return Err(TephraError::Model(format!(
                    "model '{}' registered twice",
                    model.name()
                )));
            }
        }
        Ok(Self { models, by_name })
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Model>> {
        self.by_name.get(name).map(|idx| &self.models[*idx])
    }

    /// Models in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Model>> {
        self.models.iter()
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Plain(&'static str);

    #[async_trait]
    impl Model for Plain {
        fn name(&self) -> &str {
            self.0
        }
    }

    #[test]
    fn test_store_rejects_duplicates() {
        let err = Store::new(vec![Arc::new(Plain("a")), Arc::new(Plain("a"))]).unwrap_err();
        assert!(err.to_string().contains("registered twice"));
    }

    #[test]
    fn test_store_lookup_preserves_order() {
        let store = Store::new(vec![Arc::new(Plain("a")), Arc::new(Plain("b"))]).unwrap();
        assert!(store.get("a").is_some());
        assert!(store.get("missing").is_none());
        let names: Vec<_> = store.iter().map(|m| m.name().to_string()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_hookset_builders() {
        let hooks = HookSet::reducer().with_deriver();
        assert!(hooks.reducer && hooks.deriver && !hooks.preprocessor);
    }
}
