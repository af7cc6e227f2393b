use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use tracing::debug;

use crate::config::ClientConfig;
use crate::context::{EnvRef, Environment};
use crate::data::Data;
use crate::document::Document;
use crate::entity_store::ChangedEntity;
use crate::error::Error;
use crate::operation::Operation;
use crate::pipeline::ResponsePipeline;
use crate::transport::Transport;

/// Entry point of the engine. A client owns one entity store and one notification bus;
/// every operation created from it shares them.
pub struct Client {
    envref: EnvRef,
    operations: scc::HashMap<u64, Weak<Operation>>,
    next_id: AtomicU64,
}

impl Client {
    pub fn new(env: Environment) -> Self {
        Client {
            envref: env.to_ref(),
            operations: scc::HashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn with_transport(transport: Arc<dyn Transport>) -> Self {
        Self::new(Environment::new(transport))
    }

    pub fn with_config(transport: Arc<dyn Transport>, config: ClientConfig) -> Self {
        Self::new(Environment::new(transport).with_config(config))
    }

    pub fn envref(&self) -> EnvRef {
        self.envref.get_ref()
    }

    pub fn config(&self) -> &ClientConfig {
        self.envref.get().config()
    }

    /// Binds a document to this client.
    pub async fn operation(&self, document: Arc<Document>) -> Arc<Operation> {
        let operation = Arc::new(Operation::new(document, self.envref.get_ref()));
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.operations
            .entry_async(id)
            .await
            .or_insert(Arc::downgrade(&operation));
        operation
    }

    /// Live operations; entries of dropped operations are pruned.
    async fn operations(&self) -> Vec<Arc<Operation>> {
        let mut live = Vec::new();
        self.operations
            .retain_async(|_, operation| match operation.upgrade() {
                Some(operation) => {
                    live.push(operation);
                    true
                }
                None => false,
            })
            .await;
        live
    }

    /// Marks every query of every operation stale.
    pub async fn invalidate_all_caches(&self) {
        for operation in self.operations().await {
            operation.invalidate_all().await;
        }
    }

    /// Destroys every query record. The entity store is kept.
    pub async fn clear_queries(&self) {
        let operations = self.operations().await;
        debug!(operations = operations.len(), "Clearing all queries");
        for operation in operations {
            operation.clear().await;
        }
    }

    /// Writes document-shaped data straight into the entity store, notifying every
    /// subscribed query. Nothing is fetched.
    pub async fn write_records(
        &self,
        document: Arc<Document>,
        variables: &Data,
        data: &Data,
    ) -> Result<Vec<ChangedEntity>, Error> {
        let pipeline = ResponsePipeline::new(
            document,
            variables.clone(),
            self.envref.get().context().clone(),
        );
        let processed = pipeline.process(data).await?;
        self.envref.get().commit(&processed.records, || {}).await
    }

    /// Stored fields of an entity.
    pub async fn entity(&self, id: &str) -> Option<Data> {
        self.envref.get().store().read().await.get(id).cloned()
    }

    pub async fn entity_count(&self) -> usize {
        self.envref.get().store().read().await.len()
    }
}
