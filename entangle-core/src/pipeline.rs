//! # Response pipeline
//!
//! Turns a raw response into entity records ready for the store. Per response the stages
//! run in a fixed order: [transform], [derive_references], [derive_custom], [normalize].
//! An error in any stage aborts the whole run and nothing is committed.

use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::debug;

use crate::data::{Data, Fields, ID, TYPENAME};
use crate::document::{Derive, DeriveFetcher, DeriveRequest, Document, Field, MergeFlags, Node, NodeId};
use crate::error::Error;

/// Non-persisted handle from a record back to the descriptor node it was found at.
#[derive(Clone)]
pub struct MergeMeta {
    pub document: Arc<Document>,
    pub node: NodeId,
}

impl MergeMeta {
    pub fn node(&self) -> &Node {
        self.document.node(self.node)
    }

    pub fn flags(&self) -> MergeFlags {
        self.node().flags
    }
}

impl fmt::Debug for MergeMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.document.name(), self.document.path(self.node))
    }
}

/// Flattened form of one id-bearing response object.
/// Nested entities are `{id}` stubs, nested sets are lists of stubs.
#[derive(Serialize, Debug, Clone)]
pub struct NormalizedRecord {
    pub id: String,
    pub typename: String,
    pub fields: Fields,
    #[serde(skip)]
    pub meta: MergeMeta,
}

impl NormalizedRecord {
    pub fn is_deletion(&self) -> bool {
        let flags = self.meta.flags();
        flags.delete || flags.delete_all
    }

    /// Record as a plain entity value, without merge metadata.
    pub fn to_entity(&self) -> Data {
        Data::from_fields(self.fields.clone())
    }
}

fn resolve_typename(document: &Document, node: NodeId, data: &Data) -> Option<String> {
    data.typename()
        .map(str::to_owned)
        .or_else(|| document.node(node).typename.clone())
}

/// Applies scalar coercions, reference renames and virtual defaults, selecting inline
/// fragment overlays by runtime typename. Fields unknown to the descriptor pass through.
pub fn transform(document: &Document, node: NodeId, data: &Data) -> Result<Data, Error> {
    if data.is_null() {
        return Ok(Data::Null);
    }
    if document.node(node).kind.is_list() {
        let items = data.as_list().ok_or_else(|| {
            Error::unexpected_shape(&document.path(node), "a list", data.type_name())
        })?;
        return items
            .iter()
            .map(|item| transform_object(document, node, item))
            .collect::<Result<Vec<_>, _>>()
            .map(Data::list);
    }
    transform_object(document, node, data)
}

fn transform_object(document: &Document, node: NodeId, data: &Data) -> Result<Data, Error> {
    if data.is_null() {
        return Ok(Data::Null);
    }
    let path = document.path(node);
    let input = data
        .as_object()
        .ok_or_else(|| Error::unexpected_shape(&path, "an object", data.type_name()))?;
    let descriptor = document.node(node);
    let typename = resolve_typename(document, node, data);

    if descriptor.kind.is_union() {
        let t = typename
            .as_deref()
            .ok_or_else(|| Error::missing_field(TYPENAME, &path))?;
        if document.fragment(node, t).is_none() {
            return Err(Error::missing_fragment(&path, t));
        }
    }
    if descriptor.kind.is_entity() && data.entity_id().is_none() {
        return Err(Error::missing_field(ID, &path));
    }

    let overlay = typename.as_deref().and_then(|t| document.fragment(node, t));
    let references: Vec<&(String, String)> = std::iter::once(node)
        .chain(overlay)
        .flat_map(|n| document.node(n).references.iter())
        .collect();

    let mut fields = input.clone();
    for (server, client) in references.iter() {
        if let Some(value) = fields.remove(server) {
            fields.insert(client.clone(), value);
        }
    }
    if descriptor.kind.is_entity() {
        if let Some(t) = typename.as_deref() {
            fields
                .entry(TYPENAME.to_owned())
                .or_insert_with(|| Data::Text(t.to_owned()));
        }
    }

    for field in document.fields(node, typename.as_deref()) {
        match field {
            Field::Scalar(scalar) => {
                let Some(value) = fields.get_mut(&scalar.name) else {
                    // id and __typename are checked above, references may be unset
                    let optional = scalar.name == ID
                        || scalar.name == TYPENAME
                        || references.iter().any(|(_, client)| *client == scalar.name);
                    if optional {
                        continue;
                    }
                    return Err(Error::missing_field(&scalar.name, &path));
                };
                if let Some(coerce) = &scalar.coerce {
                    if !value.is_null() {
                        let coerced = coerce(&*value).map_err(|e| {
                            Error::descriptor_mismatch(format!(
                                "Scalar '{}' on '{}' could not be coerced: {}",
                                scalar.name, path, e
                            ))
                        })?;
                        *value = coerced;
                    }
                }
            }
            Field::Virtual(name, default) => {
                fields
                    .entry(name.to_owned())
                    .or_insert_with(|| default.clone());
            }
            Field::Object(name, child) => {
                let derive = &document.node(child).derive;
                match fields.get(name) {
                    // the reference is kept as is until it is derived
                    Some(_) if matches!(derive, Some(Derive::FromReference(_))) => {}
                    Some(value) => {
                        let transformed = transform(document, child, value)?;
                        fields.insert(name.to_owned(), transformed);
                    }
                    None if derive.is_none() => {
                        return Err(Error::missing_field(name, &path));
                    }
                    None => {}
                }
            }
        }
    }
    Ok(Data::from_fields(fields))
}

/// Variables and ambient context handed to derive fetchers.
#[derive(Debug, Clone, Default)]
pub struct DeriveScope {
    pub variables: Data,
    pub context: Data,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DerivePass {
    References,
    Custom,
}

/// Resolves fields derived from a reference or a foreign key.
pub fn derive_references<'a>(
    document: &'a Document,
    node: NodeId,
    data: Data,
    scope: &'a DeriveScope,
) -> BoxFuture<'a, Result<Data, Error>> {
    derive(document, node, data, scope, DerivePass::References)
}

/// Resolves fields populated wholesale from variables and context.
pub fn derive_custom<'a>(
    document: &'a Document,
    node: NodeId,
    data: Data,
    scope: &'a DeriveScope,
) -> BoxFuture<'a, Result<Data, Error>> {
    derive(document, node, data, scope, DerivePass::Custom)
}

fn derive<'a>(
    document: &'a Document,
    node: NodeId,
    data: Data,
    scope: &'a DeriveScope,
    pass: DerivePass,
) -> BoxFuture<'a, Result<Data, Error>> {
    async move {
        if !document.node(node).kind.is_list() {
            return derive_object(document, node, data, scope, pass).await;
        }
        let items = match data.as_list() {
            Some(items) => items.clone(),
            None => return Ok(data),
        };
        let mut derived = Vec::with_capacity(items.len());
        for item in items {
            derived.push(derive_object(document, node, item, scope, pass).await?);
        }
        Ok(Data::list(derived))
    }
    .boxed()
}

fn derive_object<'a>(
    document: &'a Document,
    node: NodeId,
    data: Data,
    scope: &'a DeriveScope,
    pass: DerivePass,
) -> BoxFuture<'a, Result<Data, Error>> {
    async move {
        let mut fields = match data.as_object() {
            Some(fields) => fields.clone(),
            None => return Ok(data),
        };
        let typename = resolve_typename(document, node, &data);
        for field in document.fields(node, typename.as_deref()) {
            let Field::Object(name, child) = field else {
                continue;
            };
            match (pass, document.node(child).derive.clone()) {
                (DerivePass::References, Some(Derive::FromReference(fetcher))) => {
                    // a bare id, or an object carrying one
                    let key = fields.get(name).filter(|v| !v.is_null()).map(|reference| {
                        reference
                            .entity_id()
                            .map(Data::Text)
                            .unwrap_or_else(|| reference.clone())
                    });
                    if let Some(key) = key {
                        let fetched =
                            fetch_derived(document, child, name.to_owned(), Some(key), fetcher, scope)
                                .await?;
                        fields.insert(name.to_owned(), fetched);
                    }
                }
                (DerivePass::References, Some(Derive::FromForeignKey { key, fetcher })) => {
                    if let Some(foreign_key) = fields.remove(&key) {
                        let fetched = if foreign_key.is_null() {
                            Data::Null
                        } else {
                            fetch_derived(
                                document,
                                child,
                                name.to_owned(),
                                Some(foreign_key),
                                fetcher,
                                scope,
                            )
                            .await?
                        };
                        fields.insert(name.to_owned(), fetched);
                    }
                }
                (DerivePass::Custom, Some(Derive::From(fetcher))) => {
                    let fetched =
                        fetch_derived(document, child, name.to_owned(), None, fetcher, scope).await?;
                    fields.insert(name.to_owned(), fetched);
                }
                // derived in the other pass, together with its own sub-graph
                (_, Some(_)) => {}
                (_, None) => {
                    if let Some(value) = fields.get(name).cloned() {
                        let derived = derive(document, child, value, scope, pass).await?;
                        fields.insert(name.to_owned(), derived);
                    }
                }
            }
        }
        Ok(Data::from_fields(fields))
    }
    .boxed()
}

fn fetch_derived<'a>(
    document: &'a Document,
    node: NodeId,
    field: String,
    key: Option<Data>,
    fetcher: Arc<dyn DeriveFetcher>,
    scope: &'a DeriveScope,
) -> BoxFuture<'a, Result<Data, Error>> {
    async move {
        let request = DeriveRequest {
            field: field.clone(),
            key,
            variables: scope.variables.clone(),
            context: scope.context.clone(),
        };
        let fetched = fetcher
            .fetch(request)
            .await
            .map_err(|e| Error::derive_failed(&field, e))?;
        let fetched = transform(document, node, &fetched)?;
        let fetched = derive(document, node, fetched, scope, DerivePass::References).await?;
        derive(document, node, fetched, scope, DerivePass::Custom).await
    }
    .boxed()
}

/// Collects every id-bearing object in document order (pre-order).
pub fn normalize(document: &Arc<Document>, data: &Data) -> Result<Vec<NormalizedRecord>, Error> {
    let mut slots = Vec::new();
    flatten(document, document.root(), data, &mut slots)?;
    Ok(slots.into_iter().flatten().collect())
}

fn flatten(
    document: &Arc<Document>,
    node: NodeId,
    value: &Data,
    out: &mut Vec<Option<NormalizedRecord>>,
) -> Result<Data, Error> {
    if value.is_null() {
        return Ok(Data::Null);
    }
    if document.node(node).kind.is_list() {
        let items = value.as_list().ok_or_else(|| {
            Error::unexpected_shape(&document.path(node), "a list", value.type_name())
        })?;
        return items
            .iter()
            .map(|item| flatten_object(document, node, item, out))
            .collect::<Result<Vec<_>, _>>()
            .map(Data::list);
    }
    flatten_object(document, node, value, out)
}

fn flatten_object(
    document: &Arc<Document>,
    node: NodeId,
    value: &Data,
    out: &mut Vec<Option<NormalizedRecord>>,
) -> Result<Data, Error> {
    if value.is_null() {
        return Ok(Data::Null);
    }
    let path = document.path(node);
    if value.as_object().is_none() {
        return Err(Error::unexpected_shape(&path, "an object", value.type_name()));
    }
    let is_entity = document.node(node).kind.is_entity();
    let typename = resolve_typename(document, node, value);
    // reserve the slot so a parent precedes its children
    let slot = if is_entity {
        out.push(None);
        Some(out.len() - 1)
    } else {
        None
    };

    let mut fields = Fields::new();
    for field in document.fields(node, typename.as_deref()) {
        match field {
            Field::Scalar(scalar) => {
                if let Some(v) = value.get(&scalar.name) {
                    fields.insert(scalar.name.clone(), v.clone());
                }
            }
            Field::Virtual(_, _) => {}
            Field::Object(name, child) => {
                if let Some(v) = value.get(name) {
                    fields.insert(name.to_owned(), flatten(document, child, v, out)?);
                }
            }
        }
    }

    let Some(slot) = slot else {
        return Ok(Data::from_fields(fields));
    };
    let id = value
        .entity_id()
        .ok_or_else(|| Error::missing_field(ID, &path))?;
    let typename = typename.ok_or_else(|| Error::missing_field(TYPENAME, &path))?;
    fields.insert(ID.to_owned(), Data::Text(id.clone()));
    fields.insert(TYPENAME.to_owned(), Data::Text(typename.clone()));
    out[slot] = Some(NormalizedRecord {
        id: id.clone(),
        typename,
        fields,
        meta: MergeMeta {
            document: document.clone(),
            node,
        },
    });
    Ok(Data::stub(&id))
}

#[derive(Debug, Clone)]
pub struct Processed {
    /// Transformed and derived response tree, document shaped.
    pub data: Data,
    pub records: Vec<NormalizedRecord>,
}

pub struct ResponsePipeline {
    document: Arc<Document>,
    scope: DeriveScope,
}

impl ResponsePipeline {
    pub fn new(document: Arc<Document>, variables: Data, context: Data) -> Self {
        ResponsePipeline {
            document,
            scope: DeriveScope { variables, context },
        }
    }

    pub async fn process(&self, raw: &Data) -> Result<Processed, Error> {
        let root = self.document.root();
        let data = transform(&self.document, root, raw)?;
        let data = derive_references(&self.document, root, data, &self.scope).await?;
        let data = derive_custom(&self.document, root, data, &self.scope).await?;
        let records = normalize(&self.document, &data)?;
        debug!(
            operation = self.document.name(),
            records = records.len(),
            "Response processed"
        );
        Ok(Processed { data, records })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::NodeSpec;
    use crate::error::ErrorType;
    use async_trait::async_trait;
    use serde_json::json;

    fn data(value: serde_json::Value) -> Data {
        Data::from(value)
    }

    struct AuthorFetcher;

    #[async_trait]
    impl DeriveFetcher for AuthorFetcher {
        async fn fetch(&self, request: DeriveRequest) -> Result<Data, Error> {
            let id = request
                .key
                .and_then(|k| k.as_str().map(str::to_owned))
                .unwrap_or_default();
            let name = format!("Author {}", id);
            Ok(data(json!({"id": id, "name": name})))
        }
    }

    struct LocaleFetcher;

    #[async_trait]
    impl DeriveFetcher for LocaleFetcher {
        async fn fetch(&self, request: DeriveRequest) -> Result<Data, Error> {
            Ok(Data::object([("lang", request.context.get("lang").cloned().unwrap_or_default())]))
        }
    }

    fn posts_document() -> Arc<Document> {
        Arc::new(Document::query(
            "Posts",
            NodeSpec::root().object(
                "posts",
                NodeSpec::entity_set("Post")
                    .coerced("views", |v| Ok(Data::Int(v.as_str().and_then(|s| s.parse().ok()).unwrap_or(0))))
                    .virtual_scalar("selected", Data::Bool(false))
                    .object(
                        "author",
                        NodeSpec::entity("User")
                            .scalar("name")
                            .derive_from_foreign_key("authorId", Arc::new(AuthorFetcher)),
                    )
                    .object("settings", NodeSpec::embed().derive_from(Arc::new(LocaleFetcher))),
            ),
        ))
    }

    #[test]
    fn test_transform_coerces_and_materializes_virtuals() {
        let doc = posts_document();
        let raw = data(json!({"posts": [{"id": "p1", "views": "12", "extra": 1}]}));
        let out = transform(&doc, doc.root(), &raw).unwrap();
        let post = &out.get("posts").unwrap().as_list().unwrap()[0];
        assert_eq!(post.get("views"), Some(&Data::Int(12)));
        assert_eq!(post.get("selected"), Some(&Data::Bool(false)));
        assert_eq!(post.get("extra"), Some(&Data::Int(1)));
        assert_eq!(post.typename(), Some("Post"));
    }

    #[test]
    fn test_union_requires_fragment() {
        let doc = Document::query(
            "Search",
            NodeSpec::root().object(
                "result",
                NodeSpec::union().fragment("User", NodeSpec::entity("User").scalar("name")),
            ),
        );
        let ok = data(json!({"result": {"id": "u1", "__typename": "User", "name": "A"}}));
        assert!(transform(&doc, doc.root(), &ok).is_ok());
        let bad = data(json!({"result": {"id": "c1", "__typename": "Comment"}}));
        let e = transform(&doc, doc.root(), &bad).unwrap_err();
        assert_eq!(e.error_type, ErrorType::DescriptorMismatch);
        assert!(e.message.contains("Comment"));
    }

    #[test]
    fn test_interface_skips_unknown_typename() {
        let doc = Document::query(
            "Nodes",
            NodeSpec::root().object(
                "node",
                NodeSpec::interface("Node").fragment("User", NodeSpec::embed().scalar("name")),
            ),
        );
        let raw = data(json!({"node": {"id": "x", "__typename": "Robot", "serial": 7}}));
        let out = transform(&doc, doc.root(), &raw).unwrap();
        assert_eq!(out.get("node").unwrap().get("serial"), Some(&Data::Int(7)));
    }

    #[test]
    fn test_entity_without_id_is_rejected() {
        let doc = posts_document();
        let raw = data(json!({"posts": [{"views": "1"}]}));
        let e = transform(&doc, doc.root(), &raw).unwrap_err();
        assert!(e.message.contains("'id'"));
    }

    #[test]
    fn test_reference_rename() {
        let doc = Document::query(
            "Post",
            NodeSpec::root().object("post", NodeSpec::entity("Post").reference("author_id", "authorId")),
        );
        let raw = data(json!({"post": {"id": "p1", "author_id": "u1"}}));
        let out = transform(&doc, doc.root(), &raw).unwrap();
        let post = out.get("post").unwrap();
        assert_eq!(post.get("authorId").and_then(Data::as_str), Some("u1"));
        assert!(post.get("author_id").is_none());
        let doc = Arc::new(doc);
        let records = normalize(&doc, &out).unwrap();
        assert_eq!(records[0].fields.get("authorId").and_then(Data::as_str), Some("u1"));
    }

    #[test]
    fn test_missing_selected_field_is_rejected() {
        let doc = Document::query(
            "User",
            NodeSpec::root().object(
                "user",
                NodeSpec::entity("User")
                    .scalar("name")
                    .object("address", NodeSpec::embed().scalar("city")),
            ),
        );
        let e = transform(&doc, doc.root(), &data(json!({"user": {"id": "u1"}}))).unwrap_err();
        assert_eq!(e.error_type, ErrorType::DescriptorMismatch);
        assert!(e.message.contains("'name'"));

        let raw = data(json!({"user": {"id": "u1", "name": "A"}}));
        let e = transform(&doc, doc.root(), &raw).unwrap_err();
        assert!(e.message.contains("'address'"));

        let raw = data(json!({"user": {"id": "u1", "name": "A", "address": {}}}));
        let e = transform(&doc, doc.root(), &raw).unwrap_err();
        assert!(e.message.contains("'city' on 'user.address'"));

        let raw = data(json!({"user": {"id": "u1", "name": null, "address": null}}));
        assert!(transform(&doc, doc.root(), &raw).is_ok());
    }

    #[test]
    fn test_fragment_fields_are_required_for_their_typename() {
        let doc = Document::query(
            "Search",
            NodeSpec::root().object(
                "results",
                NodeSpec::union_set()
                    .fragment("User", NodeSpec::embed().scalar("name"))
                    .fragment("Post", NodeSpec::embed().scalar("title")),
            ),
        );
        let ok = data(json!({"results": [
            {"id": "u1", "__typename": "User", "name": "A"},
            {"id": "p1", "__typename": "Post", "title": "T"}
        ]}));
        assert!(transform(&doc, doc.root(), &ok).is_ok());
        let bad = data(json!({"results": [{"id": "p1", "__typename": "Post", "name": "A"}]}));
        let e = transform(&doc, doc.root(), &bad).unwrap_err();
        assert!(e.message.contains("'title'"));
    }

    #[tokio::test]
    async fn test_derive_from_reference() {
        let doc = Arc::new(Document::query(
            "Post",
            NodeSpec::root().object(
                "post",
                NodeSpec::entity("Post").scalar("title").object(
                    "author",
                    NodeSpec::entity("User")
                        .scalar("name")
                        .derive_from_reference(Arc::new(AuthorFetcher)),
                ),
            ),
        ));
        let pipeline = ResponsePipeline::new(doc.clone(), Data::Null, Data::Null);

        let raw = data(json!({"post": {"id": "p1", "title": "Hi", "author": "u1"}}));
        let processed = pipeline.process(&raw).await.unwrap();
        let author = processed.data.get("post").unwrap().get("author").unwrap();
        assert_eq!(author.get("name").and_then(Data::as_str), Some("Author u1"));
        assert_eq!(author.typename(), Some("User"));
        let ids: Vec<&str> = processed.records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["p1", "u1"]);
        assert_eq!(processed.records[0].fields.get("author"), Some(&Data::stub("u1")));

        let raw = data(json!({"post": {"id": "p1", "title": "Hi", "author": {"id": "u2"}}}));
        let processed = pipeline.process(&raw).await.unwrap();
        let author = processed.data.get("post").unwrap().get("author").unwrap();
        assert_eq!(author.get("name").and_then(Data::as_str), Some("Author u2"));

        let raw = data(json!({"post": {"id": "p1", "title": "Hi", "author": null}}));
        let processed = pipeline.process(&raw).await.unwrap();
        assert!(processed.data.get("post").unwrap().get("author").unwrap().is_null());
        assert_eq!(processed.records.len(), 1);
    }

    #[test]
    fn test_normalize_document_order_and_stubs() {
        let doc = Arc::new(Document::query(
            "User",
            NodeSpec::root().object(
                "user",
                NodeSpec::entity("User")
                    .scalar("name")
                    .object("best", NodeSpec::entity("User").scalar("name"))
                    .object("friends", NodeSpec::entity_set("User").scalar("name")),
            ),
        ));
        let raw = data(json!({"user": {
            "id": "u1", "name": "A",
            "best": {"id": "u2", "name": "B"},
            "friends": [{"id": 3, "name": "C"}, {"id": "u4", "name": "D"}]
        }}));
        let records = normalize(&doc, &transform(&doc, doc.root(), &raw).unwrap()).unwrap();
        let ids: Vec<&str> = records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["u1", "u2", "3", "u4"]);
        let user = &records[0];
        assert_eq!(user.fields.get("best"), Some(&Data::stub("u2")));
        assert_eq!(
            user.fields.get("friends"),
            Some(&Data::list([Data::stub("3"), Data::stub("u4")]))
        );
        assert_eq!(user.typename, "User");
        assert!(!user.is_deletion());
    }

    #[tokio::test]
    async fn test_process_runs_derivations() {
        let doc = posts_document();
        let pipeline = ResponsePipeline::new(
            doc.clone(),
            Data::Null,
            data(json!({"lang": "en"})),
        );
        let raw = data(json!({"posts": [{"id": "p1", "views": "3", "authorId": "u9"}]}));
        let processed = pipeline.process(&raw).await.unwrap();
        let post = &processed.data.get("posts").unwrap().as_list().unwrap()[0];
        assert!(post.get("authorId").is_none());
        assert_eq!(
            post.get("author").unwrap().get("name").and_then(Data::as_str),
            Some("Author u9")
        );
        assert_eq!(post.get("settings").unwrap().get("lang").and_then(Data::as_str), Some("en"));
        let ids: Vec<&str> = processed.records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["p1", "u9"]);
    }
}
