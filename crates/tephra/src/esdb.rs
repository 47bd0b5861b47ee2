//! The event-sourced database core.
//!
//! Events flow: `dispatch` → queue → poll loop → `reduce_event` (inside a
//! transaction) → `apply_event` (queue ack + changes + metadata in one
//! transaction, derivers after) → `handle_result` (notifications and
//! waiters). Events are applied serially in strict `v` order, at most
//! once, and the applied version only moves forward.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::{json, Value as Json};
use tokio::sync::{broadcast, oneshot, Notify};
use tokio::task::JoinHandle;

use tephra_core::{EsdbConfig, EsdbEvent, Event, EventVersion, ModelMap, Result, TephraError};
use tephra_sqlite::{Migrator, SqliteDb};

use crate::metadata::{self, MetadataModel};
use crate::model::{DeriveCx, HookCx, Model, Store, METADATA};
use crate::queue::EventQueue;
use crate::reduce::{self, ReducerOutcome};

/// Error key for preprocessor misuse (changed `v`, cleared type).
const PREPROCESS_ERROR: &str = "_preprocess";
/// Error key for unexpected reducer crashes.
const DISPATCH_ERROR: &str = "_redux";

const ESDB_EVENT_CAPACITY: usize = 64;

/// Ok = handled cleanly, Err = handled with `event.error` set.
type WaitOutcome = std::result::Result<Event, Event>;

type SharedVersion = Shared<BoxFuture<'static, std::result::Result<u64, String>>>;

#[derive(Default)]
struct Waiters {
    map: HashMap<EventVersion, Vec<oneshot::Sender<WaitOutcome>>>,
    max_waiting_for: EventVersion,
}

#[derive(Default)]
struct PollState {
    /// Continuous mode: pursue events from other processes too.
    continuous: bool,
    /// Cooperative stop requested.
    stop: bool,
    /// Highest version a waiter asked us to pursue.
    min_version: EventVersion,
    running: bool,
    task: Option<JoinHandle<()>>,
}

struct EsdbInner {
    db: SqliteDb,
    queue: EventQueue,
    store: Store,
    preproc_names: Vec<String>,
    reducer_names: Vec<String>,
    deriver_names: Vec<String>,
    config: EsdbConfig,
    events_tx: broadcast::Sender<EsdbEvent>,
    waiters: Mutex<Waiters>,
    poll: Mutex<PollState>,
    stop_notify: Notify,
    version_inflight: Mutex<Option<SharedVersion>>,
}

/// Event-sourced database: a queue of events reduced into derived tables.
#[derive(Clone)]
pub struct EventDb {
    inner: Arc<EsdbInner>,
}

impl EventDb {
    /// Open with a queue sharing `db` and default configuration.
    pub async fn open(db: SqliteDb, models: Vec<Arc<dyn Model>>) -> Result<Self> {
        Self::open_with(db, None, models, EsdbConfig::default()).await
    }

    /// Open with an explicit queue and configuration.
    ///
    /// Rejects a user model named `metadata`, installs the built-in
    /// metadata model, runs queue and model migrations, then primes the
    /// pipeline with a probe for pending events.
    pub async fn open_with(
        db: SqliteDb,
        queue: Option<EventQueue>,
        models: Vec<Arc<dyn Model>>,
        config: EsdbConfig,
    ) -> Result<Self> {
        for model in &models {
            if model.name() == METADATA {
                return Err(TephraError::Model(format!(
                    "'{METADATA}' is a reserved model name"
                )));
            }
        }

        let queue = queue
            .unwrap_or_else(|| EventQueue::with_poll_interval(db.clone(), config.poll_interval()));

        let mut all_models = models;
        all_models.push(Arc::new(MetadataModel));
        let store = Store::new(all_models)?;

        let mut migrator = Migrator::new();
        queue.register_migrations(&mut migrator)?;
        for model in store.iter() {
            let model = model.clone();
            migrator.add(format!("model-{}", model.name()), move |db| {
                let model = model.clone();
                async move { model.setup(&db).await }
            })?;
        }
        migrator.run(&db).await?;

        let mut preproc_names = Vec::new();
        let mut reducer_names = Vec::new();
        let mut deriver_names = Vec::new();
        for model in store.iter() {
            let hooks = model.hooks();
            let name = model.name().to_string();
            if hooks.preprocessor {
                preproc_names.push(name.clone());
            }
            if hooks.reducer {
                reducer_names.push(name.clone());
            }
            if hooks.deriver {
                deriver_names.push(name);
            }
        }

        let (events_tx, _) = broadcast::channel(ESDB_EVENT_CAPACITY);
        let esdb = EventDb {
            inner: Arc::new(EsdbInner {
                db,
                queue,
                store,
                preproc_names,
                reducer_names,
                deriver_names,
                config,
                events_tx,
                waiters: Mutex::new(Waiters::default()),
                poll: Mutex::new(PollState::default()),
                stop_notify: Notify::new(),
                version_inflight: Mutex::new(None),
            }),
        };

        esdb.check_for_events();
        Ok(esdb)
    }

    pub fn db(&self) -> &SqliteDb {
        &self.inner.db
    }

    pub fn queue(&self) -> &EventQueue {
        &self.inner.queue
    }

    pub fn store(&self) -> &Store {
        &self.inner.store
    }

    /// Subscribe to `Result`/`Error`/`Handled` notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<EsdbEvent> {
        self.inner.events_tx.subscribe()
    }

    /// Applied version: the highest `v` whose apply phase completed.
    /// Concurrent reads coalesce onto one in-flight query.
    pub async fn version(&self) -> Result<EventVersion> {
        self.inner.version().await
    }

    /// Append a new event and wait for it to be handled.
    ///
    /// Rejects with [`TephraError::EventFailed`] when the handled event
    /// carries errors.
    pub async fn dispatch(
        &self,
        event_type: &str,
        data: Json,
        ts: Option<i64>,
    ) -> Result<Event> {
        let queued = self.inner.queue.add(event_type, data, ts).await?;
        match self.handled_version(queued.v).await? {
            Some(event) => Ok(event),
            None => Err(TephraError::Internal(format!(
                "event {} vanished from the queue",
                queued.v
            ))),
        }
    }

    /// Wait until event `v` has been handled and return it.
    ///
    /// `v = 0` resolves immediately with `None`. Errored events reject
    /// with [`TephraError::EventFailed`] carrying the event.
    pub async fn handled_version(&self, v: EventVersion) -> Result<Option<Event>> {
        if v == 0 {
            return Ok(None);
        }

        let applied = self.inner.version().await?;
        if v <= applied {
            return match self.inner.queue.get(v).await? {
                Some(event) if event.has_error() => {
                    Err(TephraError::EventFailed(Box::new(event)))
                }
                other => Ok(other),
            };
        }

        let rx = {
            let mut waiters = self.inner.waiters.lock();
            if v > waiters.max_waiting_for {
                waiters.max_waiting_for = v;
            }
            let (tx, rx) = oneshot::channel();
            waiters.map.entry(v).or_default().push(tx);
            rx
        };
        self.start_polling(Some(v));

        // The event may have been applied between the version read and the
        // waiter registration; settle directly from the queue in that case.
        if v <= self.inner.version().await? {
            if let Some(event) = self.inner.queue.get(v).await? {
                self.inner.settle_waiter(&event);
            }
        }

        match rx.await {
            Ok(Ok(event)) => Ok(Some(event)),
            Ok(Err(event)) => Err(TephraError::EventFailed(Box::new(event))),
            Err(_) => Err(TephraError::Stopped(format!(
                "waiter for event {v} was dropped"
            ))),
        }
    }

    /// Handle everything currently in the queue.
    pub async fn wait_for_queue(&self) -> Result<Option<Event>> {
        let latest = self.inner.queue.latest_version().await?;
        self.handled_version(latest).await
    }

    /// One probe of the queue for already-pending events.
    pub fn check_for_events(&self) {
        self.arm_poll_loop();
    }

    /// Arm the poll loop. `Some(v)` pursues the queue until `v` is
    /// handled; `None` switches to continuous polling so events from
    /// other processes are handled too. A running loop is left alone.
    pub fn start_polling(&self, want: Option<EventVersion>) {
        {
            let mut poll = self.inner.poll.lock();
            match want {
                Some(v) if v > 0 => {
                    if v > poll.min_version {
                        poll.min_version = v;
                    }
                }
                _ => poll.continuous = true,
            }
        }
        self.arm_poll_loop();
    }

    /// Cooperatively stop the poll loop and wait for it to exit.
    ///
    /// A reduce/apply in flight runs to completion first; the stop is
    /// best-effort with respect to work already past the queue wait.
    pub async fn stop_polling(&self) {
        let task = {
            let mut poll = self.inner.poll.lock();
            poll.continuous = false;
            poll.stop = true;
            poll.task.take()
        };
        self.inner.stop_notify.notify_waiters();
        if let Some(task) = task {
            let _ = task.await;
        }
        let mut poll = self.inner.poll.lock();
        poll.stop = false;
        poll.running = false;
    }

    /// Stop polling and close the underlying database handle.
    pub async fn close(&self) -> Result<()> {
        self.stop_polling().await;
        self.inner.db.close().await
    }

    fn arm_poll_loop(&self) {
        let mut poll = self.inner.poll.lock();
        if poll.running {
            return;
        }
        poll.running = true;
        poll.stop = false;
        let inner = self.inner.clone();
        poll.task = Some(tokio::spawn(run_poll_task(inner)));
    }
}

impl std::fmt::Debug for EventDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDb")
            .field("db", &self.inner.db.name())
            .field("models", &self.inner.store.len())
            .finish()
    }
}

/// Drives poll passes until there is nothing left to pursue.
///
/// While a waiter's version is still ahead of the queue, passes are paced
/// by the poll interval instead of spinning on an empty probe.
async fn run_poll_task(inner: Arc<EsdbInner>) {
    loop {
        let outcome = inner.poll_pass().await;
        let delay = {
            let mut poll = inner.poll.lock();
            if poll.stop {
                poll.running = false;
                return;
            }
            match outcome {
                Ok(last) => {
                    if poll.min_version > last || poll.continuous {
                        inner.config.poll_interval()
                    } else {
                        poll.running = false;
                        return;
                    }
                }
                Err(ref e) => {
                    tracing::error!(error = %e, "event poll pass failed; backing off");
                    inner.config.apply_retry()
                }
            }
        };
        tokio::time::sleep(delay).await;
    }
}

impl EsdbInner {
    async fn version(&self) -> Result<EventVersion> {
        let fut = {
            let mut slot = self.version_inflight.lock();
            match slot.as_ref() {
                Some(fut) => fut.clone(),
                None => {
                    let db = self.db.clone();
                    let fut: SharedVersion = async move {
                        metadata::read_version(&db).await.map_err(|e| e.to_string())
                    }
                    .boxed()
                    .shared();
                    *slot = Some(fut.clone());
                    fut
                }
            }
        };
        let out = fut.await;
        *self.version_inflight.lock() = None;
        out.map_err(TephraError::Internal)
    }

    /// One run of the event loop: pull, reduce, apply, notify, repeat.
    ///
    /// Never propagates reduction failures — they are folded into the
    /// event so the pipeline always makes progress. Returns the last
    /// version seen when the queue has nothing left (or a stop arrived).
    async fn poll_pass(&self) -> Result<EventVersion> {
        let mut last_v;
        loop {
            let applied = self.version().await?;
            last_v = applied;

            // Register the stop wakeup before reading the flag, so a stop
            // arriving in between is not lost while get_next blocks.
            let stop_wait = self.stop_notify.notified();
            tokio::pin!(stop_wait);
            stop_wait.as_mut().enable();

            let (once, stopped) = {
                let poll = self.poll.lock();
                (!poll.continuous, poll.stop)
            };
            if stopped {
                return Ok(last_v);
            }

            let next = tokio::select! {
                next = self.queue.get_next(applied, once) => next?,
                _ = &mut stop_wait => return Ok(last_v),
            };
            let Some(event) = next else {
                return Ok(last_v);
            };
            last_v = event.v;
            tracing::debug!(v = event.v, event_type = %event.event_type, "handling event");

            let reduced = match self.reduce_event(&event).await {
                Ok(reduced) => reduced,
                Err(err) => {
                    tracing::error!(v = event.v, error = %err, "event reduction crashed");
                    dispatch_error_event(event, &err)
                }
            };

            match self.apply_event(reduced).await {
                Ok(applied_event) => self.handle_result(applied_event).await,
                Err(err) => {
                    // The event is still un-acked; the next iteration
                    // pulls it again.
                    tracing::error!(v = last_v, error = %err, "failed to apply event; retrying");
                    tokio::time::sleep(self.config.apply_retry()).await;
                }
            }

            if self.poll.lock().stop {
                return Ok(last_v);
            }
        }
    }

    /// Run preprocessors and reducers for one event, inside a transaction.
    async fn reduce_event(&self, event: &Event) -> Result<Event> {
        self.db
            .with_transaction(|| self.reduce_event_locked(event.clone()))
            .await
    }

    async fn reduce_event_locked(&self, mut event: Event) -> Result<Event> {
        for name in &self.preproc_names {
            let Some(model) = self.store.get(name) else {
                continue;
            };
            let cx = HookCx {
                db: &self.db,
                store: &self.store,
                event: &event,
            };
            // Bind before matching so the hook future's borrow of `event`
            // ends before the arms mutate it.
            let outcome = model.preprocess(cx).await;
            match outcome {
                Ok(None) => {}
                Ok(Some(rewritten)) => {
                    if rewritten.v != event.v {
                        event.add_error(
                            PREPROCESS_ERROR,
                            json!(format!("{name}: preprocessor changed the event version")),
                        );
                        break;
                    }
                    if rewritten.event_type.is_empty() {
                        event.add_error(
                            PREPROCESS_ERROR,
                            json!(format!("{name}: preprocessor cleared the event type")),
                        );
                        break;
                    }
                    event = rewritten;
                }
                Err(e) => {
                    event.add_error(name.clone(), json!({ "message": e.to_string() }));
                    break;
                }
            }
        }

        if event.has_error() {
            // Only the metadata reducer runs, so the version still advances.
            self.attach_metadata_outcome(&mut event).await;
            return Ok(event);
        }

        let outcomes =
            reduce::combine(&self.db, &self.store, &self.reducer_names, &event).await;

        let mut result = ModelMap::new();
        let mut errors = ModelMap::new();
        for (name, outcome) in outcomes {
            match outcome {
                ReducerOutcome::Change(change) => {
                    result.insert(name, change);
                }
                ReducerOutcome::Error(error) => {
                    errors.insert(name, error);
                }
                ReducerOutcome::Skip => {}
            }
        }

        if errors.is_empty() {
            event.result = Some(result);
        } else {
            // Discard the other reducers' changes; metadata still advances.
            let metadata_change = result.remove(METADATA);
            let mut kept = ModelMap::new();
            if let Some(change) = metadata_change {
                kept.insert(METADATA.to_string(), change);
            }
            event.result = Some(kept);
            for (name, error) in errors {
                event.add_error(name, error);
            }
        }
        Ok(event)
    }

    async fn attach_metadata_outcome(&self, event: &mut Event) {
        let Some(model) = self.store.get(METADATA) else {
            return;
        };
        let cx = HookCx {
            db: &self.db,
            store: &self.store,
            event,
        };
        let outcome = model.reduce(cx).await;
        match outcome {
            Ok(crate::model::Reduction::Change(change)) => {
                event.result = Some(ModelMap::new());
                event.add_result(METADATA, change);
            }
            Ok(crate::model::Reduction::Error(error)) => event.add_error(METADATA, error),
            Ok(crate::model::Reduction::Skip) => {}
            Err(e) => event.add_error(METADATA, json!({ "message": e.to_string() })),
        }
    }

    /// Durably apply one reduced event.
    ///
    /// The queue ack (`queue.set`), every model's `apply_changes`, and the
    /// metadata advance share one transaction, so a crash never leaves the
    /// queue ahead of the tables. Derivers run after the commit.
    async fn apply_event(&self, mut event: Event) -> Result<Event> {
        let metadata_change = event
            .result
            .as_mut()
            .and_then(|result| result.remove(METADATA));

        self.db
            .with_transaction(|| self.apply_event_locked(&event, metadata_change.as_ref()))
            .await?;

        if !self.deriver_names.is_empty() {
            let result = event.result.clone().unwrap_or_default();
            let derivations = self.deriver_names.iter().filter_map(|name| {
                let model = self.store.get(name)?;
                let cx = DeriveCx {
                    db: &self.db,
                    store: &self.store,
                    event: &event,
                    result: &result,
                };
                Some(async move { (model.name().to_string(), model.derive(cx).await) })
            });
            for (name, outcome) in futures::future::join_all(derivations).await {
                if let Err(e) = outcome {
                    // The event is already acked; derived side effects are
                    // best-effort.
                    tracing::error!(v = event.v, model = %name, error = %e, "deriver failed");
                }
            }
        }

        Ok(event)
    }

    async fn apply_event_locked(
        &self,
        event: &Event,
        metadata_change: Option<&Json>,
    ) -> Result<()> {
        self.queue.set(event).await?;

        if let Some(result) = &event.result {
            for (name, change) in result {
                let model = self.store.get(name).ok_or_else(|| {
                    TephraError::Model(format!("result names unknown model '{name}'"))
                })?;
                model.apply_changes(&self.db, change).await?;
            }
        }

        if let Some(change) = metadata_change {
            let model = self
                .store
                .get(METADATA)
                .ok_or_else(|| TephraError::Internal("metadata model missing".into()))?;
            model.apply_changes(&self.db, change).await?;
        }
        Ok(())
    }

    /// Emit notifications and settle waiters for a handled event.
    async fn handle_result(&self, event: Event) {
        if event.has_error() {
            // No listener registered drops the emission silently; the
            // waiter still rejects below.
            let _ = self.events_tx.send(EsdbEvent::Error(event.clone()));
            tracing::debug!(v = event.v, "event handled with errors");
        } else {
            let _ = self.events_tx.send(EsdbEvent::Result(event.clone()));
        }
        let _ = self.events_tx.send(EsdbEvent::Handled(event.clone()));

        self.settle_waiter(&event);

        // Race recovery: settle anything registered at or below the
        // high-water mark from the queue's durable rows.
        let leftovers: Vec<EventVersion> = {
            let waiters = self.waiters.lock();
            if event.v >= waiters.max_waiting_for {
                waiters
                    .map
                    .keys()
                    .copied()
                    .filter(|waiting| *waiting <= event.v)
                    .collect()
            } else {
                Vec::new()
            }
        };
        for v in leftovers {
            match self.queue.get(v).await {
                Ok(Some(stale)) => self.settle_waiter(&stale),
                Ok(None) => {
                    tracing::warn!(v, "waiter registered for a version missing from the queue");
                }
                Err(e) => {
                    tracing::error!(v, error = %e, "failed to settle leftover waiter");
                }
            }
        }
    }

    fn settle_waiter(&self, event: &Event) {
        let senders = self.waiters.lock().map.remove(&event.v);
        let Some(senders) = senders else {
            return;
        };
        let outcome = if event.has_error() {
            Err(event.clone())
        } else {
            Ok(event.clone())
        };
        for sender in senders {
            let _ = sender.send(outcome.clone());
        }
    }
}

/// Fold an unexpected reduction crash into the event so the pipeline can
/// still apply it: the error lands under `_redux` and metadata advances
/// directly.
fn dispatch_error_event(mut event: Event, err: &TephraError) -> Event {
    event.add_error(DISPATCH_ERROR, json!({ "message": err.to_string() }));
    event.result = Some(ModelMap::new());
    event.add_result(METADATA, json!({ "id": "version", "v": event.v }));
    event
}
