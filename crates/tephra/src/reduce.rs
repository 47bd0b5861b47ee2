//! Reducer composition.

use std::collections::BTreeMap;

use serde_json::{json, Value};

use tephra_core::Event;
use tephra_sqlite::SqliteDb;

use crate::model::{HookCx, Reduction, Store};

/// One reducer's contribution to a handled event.
#[derive(Debug, Clone, PartialEq)]
pub enum ReducerOutcome {
    Change(Value),
    Error(Value),
    Skip,
}

/// Run every named reducer against `event`, in registration order.
///
/// All reducers run; an error from one never short-circuits the others.
/// A hook that returns `Err` is recorded as an [`ReducerOutcome::Error`]
/// carrying `{"message": ...}`.
pub async fn combine(
    db: &SqliteDb,
    store: &Store,
    names: &[String],
    event: &Event,
) -> BTreeMap<String, ReducerOutcome> {
    let mut outcomes = BTreeMap::new();
    for name in names {
        let Some(model) = store.get(name) else {
            continue;
        };
        let cx = HookCx { db, store, event };
        let outcome = match model.reduce(cx).await {
            Ok(Reduction::Change(change)) => ReducerOutcome::Change(change),
            Ok(Reduction::Error(error)) => ReducerOutcome::Error(error),
            Ok(Reduction::Skip) => ReducerOutcome::Skip,
            Err(e) => {
                tracing::debug!(model = %name, v = event.v, error = %e, "reducer rejected");
                ReducerOutcome::Error(json!({ "message": e.to_string() }))
            }
        };
        outcomes.insert(name.clone(), outcome);
    }
    outcomes
}
