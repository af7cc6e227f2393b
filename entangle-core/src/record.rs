//! # Query lifecycle record
//!
//! One [QueryRecord] exists per distinct variables binding of an operation. It owns the
//! query cache, the subscribers, the single in-flight fetch, the poll task and the idle timer.
//!
//! Fetches run as spawned tasks. Callers join the task through a shared future, so any
//! number of concurrent readers cause exactly one transport call. Aborting the task cancels
//! the transport future and frees the slot immediately.
//!
//! State lives behind a synchronous mutex that is never held across an await point;
//! subscriber callbacks are always invoked after the lock is released.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use tokio::runtime::Handle;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, warn};

use crate::bus::{BusSubscription, CacheSubscriber, ChangeSet};
use crate::context::EnvRef;
use crate::data::Data;
use crate::document::Document;
use crate::error::Error;
use crate::pipeline::ResponsePipeline;
use crate::query_cache::QueryCache;
use crate::strategy::FetchStrategy;

pub type Subscriber = Arc<dyn Fn(Option<&Data>) + Send + Sync>;

pub type Registry = scc::HashMap<String, Arc<QueryRecord>>;

type SharedFetch = Shared<BoxFuture<'static, Result<Data, Error>>>;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordStatus {
    Uninitialized,
    Fetching,
    Fresh,
    Stale,
    Destroyed,
}

/// Idle eviction and polling durations of an operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timing {
    pub clear_after: Option<Duration>,
    pub poll_after: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchMode {
    Merge,
    Recreate,
}

struct PendingFetch {
    id: u64,
    result: SharedFetch,
    abort: AbortHandle,
    recreate: Arc<AtomicBool>,
}

#[derive(Default)]
struct RecordState {
    cache: Option<QueryCache>,
    subscribers: BTreeMap<u64, Subscriber>,
    pending: Option<PendingFetch>,
    poll: Option<JoinHandle<()>>,
    idle: Option<JoinHandle<()>>,
    bus: Option<BusSubscription>,
    destroyed: bool,
}

pub struct QueryRecord {
    key: String,
    document: Arc<Document>,
    operation_text: Arc<str>,
    variables: Data,
    envref: EnvRef,
    registry: Weak<Registry>,
    timing: Arc<Mutex<Timing>>,
    next_id: AtomicU64,
    state: Mutex<RecordState>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl QueryRecord {
    pub(crate) fn new(
        key: String,
        document: Arc<Document>,
        operation_text: Arc<str>,
        variables: Data,
        envref: EnvRef,
        registry: Weak<Registry>,
        timing: Arc<Mutex<Timing>>,
    ) -> Arc<Self> {
        Arc::new(QueryRecord {
            key,
            document,
            operation_text,
            variables,
            envref,
            registry,
            timing,
            next_id: AtomicU64::new(1),
            state: Mutex::new(RecordState::default()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, RecordState> {
        lock(&self.state)
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn timing(&self) -> Timing {
        *lock(&self.timing)
    }

    fn name(&self) -> &str {
        self.document.name()
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn variables(&self) -> &Data {
        &self.variables
    }

    pub fn status(&self) -> RecordStatus {
        let state = self.lock();
        if state.destroyed {
            RecordStatus::Destroyed
        } else if state.pending.is_some() {
            RecordStatus::Fetching
        } else {
            match &state.cache {
                None => RecordStatus::Uninitialized,
                Some(cache) if cache.is_stale() => RecordStatus::Stale,
                Some(_) => RecordStatus::Fresh,
            }
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.lock().destroyed
    }

    /// Current view, if the record holds a snapshot.
    pub fn view(&self) -> Option<Data> {
        self.lock().cache.as_ref().map(|c| c.view().clone())
    }

    /// Current document-shaped snapshot.
    pub fn snapshot(&self) -> Option<Data> {
        self.lock().cache.as_ref().map(|c| c.snapshot().clone())
    }

    /// Time the snapshot last changed; `None` before the first response.
    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.lock().cache.as_ref().map(QueryCache::updated_at)
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    pub fn has_pending_fetch(&self) -> bool {
        self.lock().pending.is_some()
    }

    pub fn invalidate(&self) {
        if let Some(cache) = self.lock().cache.as_mut() {
            cache.mark_stale();
        }
    }

    /// Reads according to a fetch strategy.
    pub async fn execute(
        self: &Arc<Self>,
        strategy: FetchStrategy,
        context: Data,
    ) -> Result<Data, Error> {
        let cached = {
            let state = self.lock();
            if state.destroyed {
                return Err(Error::destroyed(self.name()));
            }
            state
                .cache
                .as_ref()
                .map(|cache| (cache.view().clone(), cache.is_stale()))
        };
        match strategy {
            FetchStrategy::CacheOrThrow => cached
                .map(|(view, _)| view)
                .ok_or_else(|| Error::cache_miss(self.name(), &self.variables)),
            FetchStrategy::CacheOrFallbackNetwork => match cached {
                Some((view, false)) => Ok(view),
                _ => self.fetch(FetchMode::Merge, context)?.await,
            },
            FetchStrategy::CacheAndNetwork => match cached {
                Some((view, _)) => {
                    let pending = self.fetch(FetchMode::Merge, context)?;
                    let name = self.name().to_owned();
                    tokio::spawn(async move {
                        if let Err(e) = pending.await {
                            warn!(operation = name.as_str(), error = %e, "Background refresh failed");
                        }
                    });
                    Ok(view)
                }
                None => self.fetch(FetchMode::Merge, context)?.await,
            },
            FetchStrategy::Network => self.fetch(FetchMode::Merge, context)?.await,
            FetchStrategy::NetworkRecreateCache => {
                self.fetch(FetchMode::Recreate, context)?.await
            }
            FetchStrategy::NetworkSkipCaching => self.fetch_uncached(context).await,
        }
    }

    /// Starts a fetch or joins the one in flight.
    fn fetch(self: &Arc<Self>, mode: FetchMode, context: Data) -> Result<SharedFetch, Error> {
        let mut state = self.lock();
        if state.destroyed {
            return Err(Error::destroyed(self.name()));
        }
        if let Some(pending) = &state.pending {
            if mode == FetchMode::Recreate {
                pending.recreate.store(true, Ordering::SeqCst);
            }
            return Ok(pending.result.clone());
        }
        let id = self.next_id();
        let recreate = Arc::new(AtomicBool::new(mode == FetchMode::Recreate));
        let task = tokio::spawn(self.clone().run_fetch(id, recreate.clone(), context));
        let abort = task.abort_handle();
        let name = self.name().to_owned();
        let result = async move {
            match task.await {
                Ok(result) => result,
                Err(e) if e.is_cancelled() => Err(Error::cancelled(&name)),
                Err(e) => Err(Error::unexpected_error(format!(
                    "Fetch task of '{}' failed: {}",
                    name, e
                ))),
            }
        }
        .boxed()
        .shared();
        if let Some(idle) = state.idle.take() {
            idle.abort();
        }
        state.pending = Some(PendingFetch {
            id,
            result: result.clone(),
            abort,
            recreate,
        });
        Ok(result)
    }

    async fn run_fetch(
        self: Arc<Self>,
        id: u64,
        recreate: Arc<AtomicBool>,
        context: Data,
    ) -> Result<Data, Error> {
        debug!(
            operation = self.name(),
            variables = %self.variables,
            "Fetch started"
        );
        let outcome = async {
            let response = self
                .envref
                .get()
                .transport()
                .send(&self.operation_text, &self.variables)
                .await
                .map_err(|e| {
                    Error::from(e)
                        .with_operation(self.name())
                        .with_variables(&self.variables)
                })?;
            let data = response.into_result(self.name(), &self.variables)?;
            self.ingest(&data, recreate.load(Ordering::SeqCst), context)
                .await
        }
        .await;
        {
            let mut state = self.lock();
            if state.pending.as_ref().is_some_and(|p| p.id == id) {
                state.pending = None;
            }
        }
        self.schedule_idle();
        match &outcome {
            Ok(_) => debug!(operation = self.name(), "Fetch finished"),
            Err(e) => debug!(operation = self.name(), error = %e, "Fetch failed"),
        }
        outcome
    }

    /// Runs a response through the pipeline, commits it and updates this record's cache.
    pub(crate) async fn ingest(
        self: &Arc<Self>,
        data: &Data,
        recreate: bool,
        context: Data,
    ) -> Result<Data, Error> {
        let pipeline =
            ResponsePipeline::new(self.document.clone(), self.variables.clone(), context);
        let processed = pipeline.process(data).await?;
        let mut changed = false;
        self.envref
            .get()
            .commit(&processed.records, || {
                let mut state = self.lock();
                if state.destroyed {
                    return;
                }
                if recreate || state.cache.is_none() {
                    state.cache = Some(QueryCache::new(
                        self.document.clone(),
                        self.variables.clone(),
                        processed.data.clone(),
                    ));
                    changed = true;
                } else if let Some(cache) = state.cache.as_mut() {
                    changed = cache.merge_response(&processed.data);
                }
                self.join_bus(&mut state);
            })
            .await?;

        let (view, subscribers) = {
            let state = self.lock();
            match state.cache.as_ref() {
                Some(cache) if !state.destroyed => (
                    cache.view().clone(),
                    if changed {
                        state.subscribers.values().cloned().collect()
                    } else {
                        Vec::new()
                    },
                ),
                _ => (self.document.present(&processed.data), Vec::new()),
            }
        };
        for subscriber in subscribers {
            subscriber(Some(&view));
        }
        Ok(view)
    }

    /// Fetches and processes a response without touching the store or any cache.
    async fn fetch_uncached(&self, context: Data) -> Result<Data, Error> {
        let response = self
            .envref
            .get()
            .transport()
            .send(&self.operation_text, &self.variables)
            .await
            .map_err(|e| {
                Error::from(e)
                    .with_operation(self.name())
                    .with_variables(&self.variables)
            })?;
        let data = response.into_result(self.name(), &self.variables)?;
        let pipeline =
            ResponsePipeline::new(self.document.clone(), self.variables.clone(), context);
        let processed = pipeline.process(&data).await?;
        Ok(self.document.present(&processed.data))
    }

    fn join_bus(self: &Arc<Self>, state: &mut RecordState) {
        if state.bus.is_none() && !state.destroyed {
            let handler: Weak<dyn CacheSubscriber> = Arc::downgrade(self) as Weak<dyn CacheSubscriber>;
            state.bus = Some(self.envref.get().bus().subscribe(handler));
        }
    }

    /// Aborts the fetch in flight; waiting callers receive a cancellation error.
    /// Returns false if nothing was pending.
    pub fn abort(self: &Arc<Self>) -> bool {
        let pending = self.lock().pending.take();
        let Some(pending) = pending else {
            return false;
        };
        pending.abort.abort();
        debug!(operation = self.name(), "Pending fetch aborted");
        self.schedule_idle();
        true
    }

    pub fn subscribe(self: &Arc<Self>, subscriber: Subscriber) -> Result<Subscription, Error> {
        let id = self.next_id();
        let mut state = self.lock();
        if state.destroyed {
            return Err(Error::destroyed(self.name()));
        }
        state.subscribers.insert(id, subscriber);
        if let Some(idle) = state.idle.take() {
            idle.abort();
        }
        self.join_bus(&mut state);
        Ok(Subscription {
            id,
            record: Arc::downgrade(self),
        })
    }

    fn unsubscribe(self: &Arc<Self>, id: u64) {
        let removed = self.lock().subscribers.remove(&id).is_some();
        if removed {
            self.schedule_idle();
        }
    }

    /// (Re)starts the idle timer if the record is idle and eviction is configured.
    pub(crate) fn schedule_idle(self: &Arc<Self>) {
        let clear_after = self.timing().clear_after;
        let mut state = self.lock();
        if let Some(idle) = state.idle.take() {
            idle.abort();
        }
        let Some(clear_after) = clear_after else {
            return;
        };
        if state.destroyed || !state.subscribers.is_empty() || state.pending.is_some() {
            return;
        }
        let Ok(runtime) = Handle::try_current() else {
            return;
        };
        let record = Arc::downgrade(self);
        state.idle = Some(runtime.spawn(async move {
            tokio::time::sleep(clear_after).await;
            if let Some(record) = record.upgrade() {
                record.evict_if_idle().await;
            }
        }));
    }

    async fn evict_if_idle(self: &Arc<Self>) {
        {
            let mut state = self.lock();
            // the timer must not abort itself while destroying
            state.idle.take();
            if state.destroyed || !state.subscribers.is_empty() || state.pending.is_some() {
                return;
            }
        }
        debug!(operation = self.name(), variables = %self.variables, "Evicting idle query");
        self.destroy().await;
    }

    /// (Re)starts or stops the poll task according to the operation timing.
    pub(crate) fn update_polling(self: &Arc<Self>, context: Data) {
        let poll_after = self.timing().poll_after;
        let mut state = self.lock();
        if let Some(poll) = state.poll.take() {
            poll.abort();
        }
        let (Some(period), false) = (poll_after, state.destroyed) else {
            return;
        };
        let Ok(runtime) = Handle::try_current() else {
            return;
        };
        let record = Arc::downgrade(self);
        state.poll = Some(runtime.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(strong) = record.upgrade() else {
                    break;
                };
                let pending = match strong.fetch(FetchMode::Merge, context.clone()) {
                    Ok(pending) => pending,
                    Err(_) => break,
                };
                let name = strong.name().to_owned();
                drop(strong);
                if let Err(e) = pending.await {
                    warn!(operation = name.as_str(), error = %e, "Poll fetch failed");
                }
            }
        }));
    }

    /// Destroys the record: stops its tasks, leaves the bus, tells subscribers with `None`
    /// and removes it from its operation.
    pub async fn destroy(self: &Arc<Self>) {
        let (subscribers, pending, poll, idle, bus) = {
            let mut state = self.lock();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
            state.cache = None;
            (
                std::mem::take(&mut state.subscribers),
                state.pending.take(),
                state.poll.take(),
                state.idle.take(),
                state.bus.take(),
            )
        };
        if let Some(pending) = pending {
            pending.abort.abort();
        }
        if let Some(poll) = poll {
            poll.abort();
        }
        if let Some(idle) = idle {
            idle.abort();
        }
        drop(bus);
        for subscriber in subscribers.into_values() {
            subscriber(None);
        }
        if let Some(registry) = self.registry.upgrade() {
            registry
                .remove_if_async(&self.key, |record| Arc::ptr_eq(record, self))
                .await;
        }
        debug!(operation = self.name(), variables = %self.variables, "Query record destroyed");
    }
}

impl CacheSubscriber for QueryRecord {
    fn update_cache(&self, changes: &ChangeSet<'_>) -> Result<bool, Error> {
        let (view, subscribers) = {
            let mut state = self.lock();
            if state.destroyed {
                return Ok(false);
            }
            let Some(cache) = state.cache.as_mut() else {
                return Ok(false);
            };
            if !cache.update(changes)? {
                return Ok(false);
            }
            let view = cache.view().clone();
            (view, state.subscribers.values().cloned().collect::<Vec<_>>())
        };
        for subscriber in subscribers {
            subscriber(Some(&view));
        }
        Ok(true)
    }
}

/// Live subscription to a query record; dropping it unsubscribes.
#[must_use = "dropping the subscription unsubscribes immediately"]
pub struct Subscription {
    id: u64,
    record: Weak<QueryRecord>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(record) = self.record.upgrade() {
            record.unsubscribe(self.id);
        }
    }
}
