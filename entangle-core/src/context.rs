use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

use crate::bus::{ChangeSet, NotificationBus};
use crate::config::ClientConfig;
use crate::data::Data;
use crate::entity_store::{ChangedEntity, EntityStore};
use crate::error::Error;
use crate::pipeline::NormalizedRecord;
use crate::transport::{DocumentStringifier, Stringifier, Transport};

/// Everything shared by the operations of one client: the entity store, the notification
/// bus and the external collaborators.
pub struct Environment {
    store: RwLock<EntityStore>,
    bus: Arc<NotificationBus>,
    transport: Arc<dyn Transport>,
    stringifier: Arc<dyn Stringifier>,
    config: ClientConfig,
    context: Data,
}

impl Environment {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Environment {
            store: RwLock::new(EntityStore::new()),
            bus: NotificationBus::new(),
            transport,
            stringifier: Arc::new(DocumentStringifier),
            config: ClientConfig::default(),
            context: Data::Null,
        }
    }

    pub fn with_config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_stringifier(mut self, stringifier: Arc<dyn Stringifier>) -> Self {
        self.stringifier = stringifier;
        self
    }

    /// Ambient context handed to derive fetchers.
    pub fn with_context(mut self, context: Data) -> Self {
        self.context = context;
        self
    }

    pub fn to_ref(self) -> EnvRef {
        EnvRef(Arc::new(self))
    }

    pub fn store(&self) -> &RwLock<EntityStore> {
        &self.store
    }

    pub fn bus(&self) -> &Arc<NotificationBus> {
        &self.bus
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn stringifier(&self) -> &Arc<dyn Stringifier> {
        &self.stringifier
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn context(&self) -> &Data {
        &self.context
    }

    /// Merges records into the store and publishes the changes on the bus.
    ///
    /// `before_publish` runs after a successful merge and before any cache is notified.
    /// If the merge fails nothing is committed and nothing is published.
    pub async fn commit<F: FnOnce()>(
        &self,
        records: &[NormalizedRecord],
        before_publish: F,
    ) -> Result<Vec<ChangedEntity>, Error> {
        let mut store = self.store.write().await;
        let changes = store.update(records)?;
        before_publish();
        let store = store.downgrade();
        if !changes.is_empty() {
            let updated = self.bus.notify(&ChangeSet::new(&changes, &*store));
            debug!(changes = changes.len(), updated, "Changes committed");
        }
        Ok(changes)
    }
}

#[derive(Clone)]
pub struct EnvRef(pub Arc<Environment>);

impl EnvRef {
    pub fn get(&self) -> &Environment {
        &self.0
    }

    pub fn get_ref(&self) -> Self {
        EnvRef(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{Document, NodeSpec};
    use crate::pipeline::{normalize, transform};
    use crate::transport::MockTransport;
    use serde_json::json;

    #[tokio::test]
    async fn test_commit_without_subscribers() {
        let envref = Environment::new(Arc::new(MockTransport::new())).to_ref();
        let doc = Arc::new(Document::query(
            "User",
            NodeSpec::root().object("user", NodeSpec::entity("User").scalar("name")),
        ));
        let data = transform(&doc, doc.root(), &Data::from(json!({"user": {"id": "u1", "name": "A"}}))).unwrap();
        let records = normalize(&doc, &data).unwrap();
        let mut called = false;
        let changes = envref.get().commit(&records, || called = true).await.unwrap();
        assert!(called);
        assert_eq!(changes.len(), 1);
        assert!(envref.get().store().read().await.contains("u1"));
    }
}
