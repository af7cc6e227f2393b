//! # Document descriptor
//!
//! A [Document] describes the shape of one operation: which fields are selected, what kind of
//! value each object field holds and how fresh data for it is merged into cached data.
//! Documents are produced once (by a builder or code generator) and are read-only afterwards.
//!
//! Nodes live in an arena indexed by [NodeId]; the parent of every node is kept in a separate
//! index, so there are no ownership cycles between a node and its parent.
//! Documents are assembled from a [NodeSpec] tree, which is flattened into the arena by
//! [Document::new]. Entity-like nodes always select `id` and `__typename`.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::data::{Data, ID, TYPENAME};
use crate::error::Error;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(&self) -> usize {
        self.0
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum NodeKind {
    Entity,
    EntitySet,
    Union,
    UnionSet,
    Interface,
    InterfaceSet,
    Embed,
    EmbedList,
    Wrapper,
    Viewer,
    Root,
}

impl NodeKind {
    /// Values of this kind are lists.
    pub fn is_list(&self) -> bool {
        matches!(
            self,
            NodeKind::EntitySet | NodeKind::UnionSet | NodeKind::InterfaceSet | NodeKind::EmbedList
        )
    }

    /// Values (or list elements) of this kind are normalized entities carrying an `id`.
    pub fn is_entity(&self) -> bool {
        matches!(
            self,
            NodeKind::Entity
                | NodeKind::EntitySet
                | NodeKind::Union
                | NodeKind::UnionSet
                | NodeKind::Interface
                | NodeKind::InterfaceSet
        )
    }

    pub fn is_entity_set(&self) -> bool {
        self.is_entity() && self.is_list()
    }

    pub fn is_single_entity(&self) -> bool {
        self.is_entity() && !self.is_list()
    }

    pub fn is_union(&self) -> bool {
        matches!(self, NodeKind::Union | NodeKind::UnionSet)
    }

    pub fn is_interface(&self) -> bool {
        matches!(self, NodeKind::Interface | NodeKind::InterfaceSet)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeFlags {
    /// Fresh set replaces the cached one (empty fresh set clears it).
    pub replace_elements: bool,
    /// Ids of the fresh set are removed from the cached set.
    pub remove_elements: bool,
    /// Like `remove_elements`, and every element is deleted from the store.
    pub delete_all: bool,
    /// The entity is deleted; references to it are nulled.
    pub delete: bool,
}

impl MergeFlags {
    pub fn removes(&self) -> bool {
        self.remove_elements || self.delete_all
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum OperationKind {
    Query,
    Mutation,
    Subscription,
}

pub type Coercion = Arc<dyn Fn(&Data) -> Result<Data, Error> + Send + Sync>;

/// Predicate deciding whether a changed entity is speculatively inserted into a field.
/// Arguments: the entity, the variables of the query, the current query view.
pub type EntityFilter = Arc<dyn Fn(&Data, &Data, &Data) -> bool + Send + Sync>;

pub type ResponseMapper = Arc<dyn Fn(&Data) -> Data + Send + Sync>;

#[derive(Debug, Clone)]
pub struct DeriveRequest {
    pub field: String,
    /// Reference or foreign key value the field is derived from.
    pub key: Option<Data>,
    pub variables: Data,
    pub context: Data,
}

#[async_trait]
pub trait DeriveFetcher: Send + Sync {
    async fn fetch(&self, request: DeriveRequest) -> Result<Data, Error>;
}

#[derive(Clone)]
pub enum Derive {
    /// The field holds a reference that is replaced by the fetched sub-graph.
    FromReference(Arc<dyn DeriveFetcher>),
    /// A sibling foreign key field is passed to the fetcher and then removed.
    FromForeignKey {
        key: String,
        fetcher: Arc<dyn DeriveFetcher>,
    },
    /// The field is populated from variables and context alone.
    From(Arc<dyn DeriveFetcher>),
}

impl fmt::Debug for Derive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Derive::FromReference(_) => write!(f, "FromReference"),
            Derive::FromForeignKey { key, .. } => write!(f, "FromForeignKey({})", key),
            Derive::From(_) => write!(f, "From"),
        }
    }
}

#[derive(Clone)]
pub struct Scalar {
    pub name: String,
    pub coerce: Option<Coercion>,
}

impl fmt::Debug for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.coerce.is_some() {
            write!(f, "{}*", self.name)
        } else {
            write!(f, "{}", self.name)
        }
    }
}

#[derive(Clone)]
pub struct Node {
    pub name: String,
    pub kind: NodeKind,
    pub typename: Option<String>,
    pub scalars: Vec<Scalar>,
    pub virtual_scalars: Vec<(String, Data)>,
    /// Server field name renamed to the client field name.
    pub references: Vec<(String, String)>,
    pub objects: Vec<(String, NodeId)>,
    /// Overlays keyed by typename.
    pub fragments: Vec<(String, NodeId)>,
    pub flags: MergeFlags,
    pub entity_filters: Vec<(String, EntityFilter)>,
    pub derive: Option<Derive>,
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("typename", &self.typename)
            .field("scalars", &self.scalars)
            .field("objects", &self.objects)
            .field("fragments", &self.fragments)
            .field("flags", &self.flags)
            .field(
                "entity_filters",
                &self.entity_filters.iter().map(|(t, _)| t).collect::<Vec<_>>(),
            )
            .field("derive", &self.derive)
            .finish()
    }
}

/// A field selected by a node, resolved for a runtime typename.
#[derive(Debug, Clone, Copy)]
pub enum Field<'a> {
    Scalar(&'a Scalar),
    Virtual(&'a str, &'a Data),
    Object(&'a str, NodeId),
}

impl<'a> Field<'a> {
    pub fn name(&self) -> &'a str {
        match self {
            Field::Scalar(s) => s.name.as_str(),
            Field::Virtual(name, _) => name,
            Field::Object(name, _) => name,
        }
    }
}

/// Tree form of a node used to assemble a [Document].
#[derive(Clone)]
pub struct NodeSpec {
    kind: NodeKind,
    typename: Option<String>,
    scalars: Vec<Scalar>,
    virtual_scalars: Vec<(String, Data)>,
    references: Vec<(String, String)>,
    objects: Vec<(String, NodeSpec)>,
    fragments: Vec<(String, NodeSpec)>,
    flags: MergeFlags,
    entity_filters: Vec<(String, EntityFilter)>,
    derive: Option<Derive>,
}

impl NodeSpec {
    pub fn new(kind: NodeKind) -> Self {
        NodeSpec {
            kind,
            typename: None,
            scalars: Vec::new(),
            virtual_scalars: Vec::new(),
            references: Vec::new(),
            objects: Vec::new(),
            fragments: Vec::new(),
            flags: MergeFlags::default(),
            entity_filters: Vec::new(),
            derive: None,
        }
    }

    pub fn root() -> Self {
        Self::new(NodeKind::Root)
    }
    pub fn entity(typename: &str) -> Self {
        Self::new(NodeKind::Entity).with_typename(typename)
    }
    pub fn entity_set(typename: &str) -> Self {
        Self::new(NodeKind::EntitySet).with_typename(typename)
    }
    pub fn union() -> Self {
        Self::new(NodeKind::Union)
    }
    pub fn union_set() -> Self {
        Self::new(NodeKind::UnionSet)
    }
    pub fn interface(typename: &str) -> Self {
        Self::new(NodeKind::Interface).with_typename(typename)
    }
    pub fn interface_set(typename: &str) -> Self {
        Self::new(NodeKind::InterfaceSet).with_typename(typename)
    }
    pub fn embed() -> Self {
        Self::new(NodeKind::Embed)
    }
    pub fn embed_list() -> Self {
        Self::new(NodeKind::EmbedList)
    }
    pub fn wrapper() -> Self {
        Self::new(NodeKind::Wrapper)
    }
    pub fn viewer() -> Self {
        Self::new(NodeKind::Viewer)
    }

    pub fn with_typename(mut self, typename: &str) -> Self {
        self.typename = Some(typename.to_owned());
        self
    }

    pub fn scalar(mut self, name: &str) -> Self {
        self.scalars.push(Scalar {
            name: name.to_owned(),
            coerce: None,
        });
        self
    }

    pub fn scalars(self, names: &[&str]) -> Self {
        names.iter().fold(self, |spec, name| spec.scalar(name))
    }

    pub fn coerced<F>(mut self, name: &str, coerce: F) -> Self
    where
        F: Fn(&Data) -> Result<Data, Error> + Send + Sync + 'static,
    {
        self.scalars.push(Scalar {
            name: name.to_owned(),
            coerce: Some(Arc::new(coerce)),
        });
        self
    }

    pub fn virtual_scalar(mut self, name: &str, default: Data) -> Self {
        self.virtual_scalars.push((name.to_owned(), default));
        self
    }

    pub fn reference(mut self, server_name: &str, client_name: &str) -> Self {
        self.references
            .push((server_name.to_owned(), client_name.to_owned()));
        self
    }

    pub fn object(mut self, name: &str, spec: NodeSpec) -> Self {
        self.objects.push((name.to_owned(), spec));
        self
    }

    pub fn fragment(mut self, typename: &str, spec: NodeSpec) -> Self {
        self.fragments.push((typename.to_owned(), spec));
        self
    }

    pub fn replace_elements(mut self) -> Self {
        self.flags.replace_elements = true;
        self
    }
    pub fn remove_elements(mut self) -> Self {
        self.flags.remove_elements = true;
        self
    }
    pub fn delete_all(mut self) -> Self {
        self.flags.delete_all = true;
        self
    }
    pub fn delete(mut self) -> Self {
        self.flags.delete = true;
        self
    }

    pub fn add_entity_filter<F>(mut self, typename: &str, filter: F) -> Self
    where
        F: Fn(&Data, &Data, &Data) -> bool + Send + Sync + 'static,
    {
        self.entity_filters
            .push((typename.to_owned(), Arc::new(filter)));
        self
    }

    pub fn derive_from(mut self, fetcher: Arc<dyn DeriveFetcher>) -> Self {
        self.derive = Some(Derive::From(fetcher));
        self
    }

    pub fn derive_from_reference(mut self, fetcher: Arc<dyn DeriveFetcher>) -> Self {
        self.derive = Some(Derive::FromReference(fetcher));
        self
    }

    pub fn derive_from_foreign_key(mut self, key: &str, fetcher: Arc<dyn DeriveFetcher>) -> Self {
        self.derive = Some(Derive::FromForeignKey {
            key: key.to_owned(),
            fetcher,
        });
        self
    }
}

pub struct Document {
    name: String,
    operation_kind: OperationKind,
    nodes: Vec<Node>,
    parents: Vec<Option<NodeId>>,
    root: NodeId,
    mapper: Option<ResponseMapper>,
}

impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Document")
            .field("name", &self.name)
            .field("operation_kind", &self.operation_kind)
            .field("nodes", &self.nodes)
            .finish()
    }
}

impl Document {
    pub fn new(name: &str, operation_kind: OperationKind, root: NodeSpec) -> Self {
        let mut document = Document {
            name: name.to_owned(),
            operation_kind,
            nodes: Vec::new(),
            parents: Vec::new(),
            root: NodeId(0),
            mapper: None,
        };
        document.root = document.add_node(name, root, None);
        document
    }

    pub fn query(name: &str, root: NodeSpec) -> Self {
        Self::new(name, OperationKind::Query, root)
    }

    pub fn mutation(name: &str, root: NodeSpec) -> Self {
        Self::new(name, OperationKind::Mutation, root)
    }

    pub fn subscription(name: &str, root: NodeSpec) -> Self {
        Self::new(name, OperationKind::Subscription, root)
    }

    /// Remaps the snapshot into the view handed out to callers.
    pub fn with_mapper<F>(mut self, mapper: F) -> Self
    where
        F: Fn(&Data) -> Data + Send + Sync + 'static,
    {
        self.mapper = Some(Arc::new(mapper));
        self
    }

    fn add_node(&mut self, name: &str, spec: NodeSpec, parent: Option<NodeId>) -> NodeId {
        let id = NodeId(self.nodes.len());
        let mut scalars = Vec::new();
        if spec.kind.is_entity() {
            for implicit in [ID, TYPENAME] {
                if !spec.scalars.iter().any(|s| s.name == implicit) {
                    scalars.push(Scalar {
                        name: implicit.to_owned(),
                        coerce: None,
                    });
                }
            }
        }
        scalars.extend(spec.scalars);
        for (_, client) in spec.references.iter() {
            if !scalars.iter().any(|s| &s.name == client) {
                scalars.push(Scalar {
                    name: client.clone(),
                    coerce: None,
                });
            }
        }
        self.nodes.push(Node {
            name: name.to_owned(),
            kind: spec.kind,
            typename: spec.typename,
            scalars,
            virtual_scalars: spec.virtual_scalars,
            references: spec.references,
            objects: Vec::new(),
            fragments: Vec::new(),
            flags: spec.flags,
            entity_filters: spec.entity_filters,
            derive: spec.derive,
        });
        self.parents.push(parent);

        let objects = spec
            .objects
            .into_iter()
            .map(|(field, child)| {
                let child_id = self.add_node(&field, child, Some(id));
                (field, child_id)
            })
            .collect();
        let fragments = spec
            .fragments
            .into_iter()
            .map(|(typename, mut overlay)| {
                // an overlay stands in for its owner and selects no implicit fields of its own
                overlay.kind = NodeKind::Embed;
                let overlay_id = self.add_node(&typename, overlay, Some(id));
                (typename, overlay_id)
            })
            .collect();
        self.nodes[id.0].objects = objects;
        self.nodes[id.0].fragments = fragments;
        id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn operation_kind(&self) -> OperationKind {
        self.operation_kind
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.parents.get(id.0).copied().flatten()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Dotted path of field names from the root, for error messages.
    pub fn path(&self, id: NodeId) -> String {
        let mut names = vec![self.node(id).name.clone()];
        let mut current = id;
        while let Some(parent) = self.parent(current) {
            if parent == self.root {
                break;
            }
            names.push(self.node(parent).name.clone());
            current = parent;
        }
        names.reverse();
        names.join(".")
    }

    pub fn fragment(&self, node: NodeId, typename: &str) -> Option<NodeId> {
        self.node(node)
            .fragments
            .iter()
            .find(|(t, _)| t == typename)
            .map(|(_, id)| *id)
    }

    /// Fields selected by a node for the given runtime typename, in document order:
    /// base scalars, virtual scalars and objects followed by the matching overlay.
    pub fn fields<'d>(&'d self, node: NodeId, typename: Option<&str>) -> Vec<Field<'d>> {
        let mut fields = Vec::new();
        let mut push_node = |n: &'d Node| {
            for scalar in n.scalars.iter() {
                fields.push(Field::Scalar(scalar));
            }
            for (name, default) in n.virtual_scalars.iter() {
                fields.push(Field::Virtual(name.as_str(), default));
            }
            for (name, child) in n.objects.iter() {
                fields.push(Field::Object(name.as_str(), *child));
            }
        };
        push_node(self.node(node));
        if let Some(overlay) = typename.and_then(|t| self.fragment(node, t)) {
            push_node(self.node(overlay));
        }
        fields
    }

    pub fn field(&self, node: NodeId, typename: Option<&str>, name: &str) -> Option<Field<'_>> {
        self.fields(node, typename)
            .into_iter()
            .rev()
            .find(|f| f.name() == name)
    }

    /// Typenames any node of the document watches for speculative insertion.
    pub fn watched_typenames(&self) -> BTreeSet<String> {
        self.nodes
            .iter()
            .flat_map(|n| n.entity_filters.iter().map(|(t, _)| t.clone()))
            .collect()
    }

    pub fn filter_for(&self, node: NodeId, typename: &str) -> Option<&EntityFilter> {
        self.node(node)
            .entity_filters
            .iter()
            .find(|(t, _)| t == typename)
            .map(|(_, f)| f)
    }

    /// View handed out to callers for a cache snapshot.
    pub fn present(&self, snapshot: &Data) -> Data {
        match &self.mapper {
            Some(mapper) => mapper(snapshot),
            None => snapshot.clone(),
        }
    }
}
