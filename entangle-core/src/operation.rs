//! # Operations
//!
//! An [Operation] is a document bound to a client environment. It keeps one
//! [QueryRecord] per distinct variables binding, keyed by the variables fingerprint, and
//! holds the timing (idle eviction and polling) shared by all of them.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::context::EnvRef;
use crate::data::Data;
use crate::document::Document;
use crate::error::Error;
use crate::record::{QueryRecord, RecordStatus, Registry, Subscription, Timing};
use crate::config::ExecuteOptions;
use crate::transport::StreamHandle;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct Operation {
    document: Arc<Document>,
    operation_text: Arc<str>,
    envref: EnvRef,
    records: Arc<Registry>,
    timing: Arc<Mutex<Timing>>,
}

impl Operation {
    pub fn new(document: Arc<Document>, envref: EnvRef) -> Self {
        let operation_text: Arc<str> = envref.get().stringifier().stringify(&document).into();
        let config = envref.get().config();
        let timing = Timing {
            clear_after: config.clear_after(),
            poll_after: config.poll_after(),
        };
        Operation {
            document,
            operation_text,
            envref,
            records: Arc::new(Registry::new()),
            timing: Arc::new(Mutex::new(timing)),
        }
    }

    pub fn document(&self) -> &Arc<Document> {
        &self.document
    }

    /// Protocol text sent to the transport.
    pub fn operation_text(&self) -> &str {
        &self.operation_text
    }

    pub fn timing(&self) -> Timing {
        *lock(&self.timing)
    }

    /// Number of live query records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.len() == 0
    }

    /// Returns the record of a variables binding, creating it if needed.
    pub async fn record(&self, variables: &Data) -> Arc<QueryRecord> {
        let key = variables.fingerprint();
        loop {
            let (record, created) = {
                let mut created = false;
                let entry = self
                    .records
                    .entry_async(key.clone())
                    .await
                    .or_insert_with(|| {
                        created = true;
                        QueryRecord::new(
                            key.clone(),
                            self.document.clone(),
                            self.operation_text.clone(),
                            variables.clone(),
                            self.envref.get_ref(),
                            Arc::downgrade(&self.records),
                            self.timing.clone(),
                        )
                    });
                (entry.get().clone(), created)
            };
            if record.is_destroyed() {
                self.records
                    .remove_if_async(&key, |r| Arc::ptr_eq(r, &record))
                    .await;
                continue;
            }
            if created {
                debug!(
                    operation = self.document.name(),
                    variables = %variables,
                    "Query record created"
                );
                record.update_polling(self.envref.get().context().clone());
                record.schedule_idle();
            }
            return record;
        }
    }

    /// Existing record of a variables binding.
    pub async fn find(&self, variables: &Data) -> Option<Arc<QueryRecord>> {
        self.records
            .read_async(&variables.fingerprint(), |_, record| record.clone())
            .await
    }

    pub async fn records(&self) -> Vec<Arc<QueryRecord>> {
        let mut records = Vec::new();
        self.records
            .retain_async(|_, record| {
                records.push(record.clone());
                true
            })
            .await;
        records
    }

    pub async fn record_status(&self, variables: &Data) -> RecordStatus {
        match self.find(variables).await {
            Some(record) => record.status(),
            None => RecordStatus::Uninitialized,
        }
    }

    /// Reads the query for a variables binding.
    pub async fn execute(&self, variables: &Data, options: ExecuteOptions) -> Result<Data, Error> {
        let env = self.envref.get();
        let strategy = options.strategy.unwrap_or(env.config().default_strategy);
        let context = options.context.unwrap_or_else(|| env.context().clone());
        let record = self.record(variables).await;
        record.execute(strategy, context).await
    }

    /// Subscribes to a variables binding and reads it.
    ///
    /// The subscriber is registered before the read starts, so it sees the result of the
    /// read itself. If the read fails, the subscription is dropped.
    pub async fn execute_subscribed<F>(
        &self,
        variables: &Data,
        subscriber: F,
        options: ExecuteOptions,
    ) -> Result<(Data, Subscription), Error>
    where
        F: Fn(Option<&Data>) + Send + Sync + 'static,
    {
        let record = self.record(variables).await;
        let subscription = record.subscribe(Arc::new(subscriber))?;
        let data = self.execute(variables, options).await?;
        Ok((data, subscription))
    }

    /// Processes a locally supplied response as if it came from the transport.
    pub async fn simulate_network_response(&self, variables: &Data, data: &Data) -> Result<Data, Error> {
        let record = self.record(variables).await;
        record
            .ingest(data, false, self.envref.get().context().clone())
            .await
    }

    /// Aborts the pending fetch of a variables binding.
    pub async fn abort(&self, variables: &Data) -> bool {
        match self.find(variables).await {
            Some(record) => record.abort(),
            None => false,
        }
    }

    /// Sets the idle eviction delay; `None` keeps idle records forever.
    pub async fn clear_after(&self, duration: Option<Duration>) {
        lock(&self.timing).clear_after = duration;
        for record in self.records().await {
            record.schedule_idle();
        }
    }

    /// Sets the poll interval; `None` stops polling.
    pub async fn poll_after(&self, duration: Option<Duration>) {
        lock(&self.timing).poll_after = duration;
        let context = self.envref.get().context().clone();
        for record in self.records().await {
            record.update_polling(context.clone());
        }
    }

    /// Marks every record stale; the next cache-or-fallback-network read refetches.
    pub async fn invalidate_all(&self) {
        for record in self.records().await {
            record.invalidate();
        }
    }

    /// Destroys every record of the operation.
    pub async fn clear(&self) {
        for record in self.records().await {
            record.destroy().await;
        }
    }

    /// Opens a transport stream for a variables binding. Each payload is processed and
    /// committed like a fetched response; the subscriber sees the resulting views.
    pub async fn listen<F>(&self, variables: &Data, subscriber: F) -> Result<StreamSubscription, Error>
    where
        F: Fn(Option<&Data>) + Send + Sync + 'static,
    {
        let record = self.record(variables).await;
        let subscription = record.subscribe(Arc::new(subscriber))?;
        let (sink, mut source) = tokio::sync::mpsc::unbounded_channel();
        let stream = self
            .envref
            .get()
            .transport()
            .subscribe(&self.operation_text, variables, sink)
            .map_err(|e| {
                Error::from(e)
                    .with_operation(self.document.name())
                    .with_variables(variables)
            })?;
        let weak = Arc::downgrade(&record);
        let name = self.document.name().to_owned();
        let bound = variables.clone();
        let context = self.envref.get().context().clone();
        let task = tokio::spawn(async move {
            while let Some(response) = source.recv().await {
                let Some(record) = weak.upgrade() else {
                    break;
                };
                let result = match response.into_result(&name, &bound) {
                    Ok(data) => record.ingest(&data, false, context.clone()).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = result {
                    warn!(operation = name.as_str(), error = %e, "Stream payload rejected");
                }
            }
            debug!(operation = name.as_str(), "Stream ended");
        });
        Ok(StreamSubscription {
            _stream: stream,
            task,
            _subscription: subscription,
        })
    }
}

/// Open stream of an operation; dropping it closes the stream and unsubscribes.
#[must_use = "dropping the stream subscription closes the stream"]
pub struct StreamSubscription {
    _stream: StreamHandle,
    task: JoinHandle<()>,
    _subscription: Subscription,
}

impl StreamSubscription {
    pub fn close(self) {}
}

impl Drop for StreamSubscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}
