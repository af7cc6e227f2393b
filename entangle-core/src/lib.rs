//!
//! # Entangle Core
//!
//! Entangle core is a client-side normalized cache for GraphQL-like query results.
//! Responses are normalized into a global entity store and every active query observes
//! the entities it depends on, so an update delivered by any query, mutation or stream
//! reaches every view that shows the changed entities.
//!
//! ## Glossary
//!
//! **[Document](crate::document::Document)** - a query, mutation or subscription together with
//! its descriptor tree. Each [node](crate::document::Node) of the tree says how the value at that
//! position is shaped (entity, embedded object, union, interface, list, scalar) and how it is
//! merged and derived.
//!
//! **Entity** - an object with a globally unique `id`. Entities live once in the
//! [entity store](crate::entity_store::EntityStore); query results reference them.
//!
//! **Stub** - an object carrying only `id`, used as a reference to a stored entity.
//!
//! **[Response pipeline](crate::pipeline::ResponsePipeline)** - turns a raw protocol response
//! into document-shaped data and [normalized records](crate::pipeline::NormalizedRecord):
//! transform (typename checks, coercion, virtual scalars), derive (references and custom
//! derivations, possibly asynchronous) and normalize (entity extraction and merge metadata).
//!
//! **Merge policy** - flags on an entity-set node telling how a fresh id list is combined with
//! the stored one: replace, add, remove or delete.
//!
//! **[Notification bus](crate::bus::NotificationBus)** - broadcasts each committed change set to
//! every subscribed query cache.
//!
//! **[Query cache](crate::query_cache::QueryCache)** - a document-shaped snapshot of one query,
//! updated copy-on-write so that unchanged subtrees keep their identity.
//!
//! **View** - the snapshot as handed to the user, after the document's mapper is applied.
//!
//! **[Fetch strategy](crate::strategy::FetchStrategy)** - decides between serving the cache and
//! going to the network.
//!
//! **[Query record](crate::record::QueryRecord)** - lifecycle of one variables binding of an
//! operation: its cache, subscribers, the single in-flight fetch, polling and idle eviction.
//!
//! **[Operation](crate::operation::Operation)** - a document bound to a [client](crate::client::Client),
//! holding a query record per variables binding.
//!
//! **[Environment](crate::context::Environment)** - the services shared by all operations of a
//! client: entity store, bus, transport, stringifier and configuration.
extern crate serde;
#[macro_use]
extern crate serde_derive;

pub mod bus;
pub mod client;
pub mod config;
pub mod context;
pub mod data;
pub mod document;
pub mod entity_store;
pub mod error;
pub mod merge;
pub mod operation;
pub mod pipeline;
pub mod query_cache;
pub mod record;
pub mod strategy;
pub mod transport;
