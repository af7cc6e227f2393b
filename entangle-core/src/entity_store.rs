//! # Global entity store
//!
//! One canonical representation per entity id. Normalized records are merged field by field
//! according to the field kind found through the record's merge metadata; every entity that
//! actually changed is reported back so the notification bus can fan the changes out.
//!
//! An update is staged completely before anything is committed: if any record fails to merge,
//! the store is left untouched.

use std::collections::HashMap;
use std::sync::Arc;

use crate::data::{Data, Fields};
use crate::error::Error;
use crate::merge::{field_kind, merge_id_list, same_elements, to_ref, FieldKind};
use crate::pipeline::NormalizedRecord;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
}

#[derive(Debug, Clone)]
pub struct ChangedEntity {
    pub id: String,
    pub typename: String,
    pub kind: ChangeKind,
    /// Stored entity after the change; for deletions the deleting record's payload.
    pub entity: Data,
    /// Fields that changed, in stored (normalized) form.
    pub updates: Fields,
    /// Record the change originates from.
    pub record: Arc<NormalizedRecord>,
}

impl ChangedEntity {
    pub fn is_deletion(&self) -> bool {
        self.kind == ChangeKind::Deleted
    }
}

/// Read access to stored entities by id.
pub trait EntityLookup: Send + Sync {
    fn lookup(&self, id: &str) -> Option<Data>;
}

#[derive(Debug, Default)]
pub struct EntityStore {
    entities: HashMap<String, Data>,
}

impl EntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<&Data> {
        self.entities.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entities.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Stored ids, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entities.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn clear(&mut self) {
        self.entities.clear();
    }

    /// Merges records in order and returns the changed entities, one per id.
    pub fn update(&mut self, records: &[NormalizedRecord]) -> Result<Vec<ChangedEntity>, Error> {
        let mut staged: HashMap<String, Option<Data>> = HashMap::new();
        let mut changes: Vec<ChangedEntity> = Vec::new();
        let mut positions: HashMap<String, usize> = HashMap::new();

        for record in records.iter() {
            let current = match staged.get(&record.id) {
                Some(staged) => staged.clone(),
                None => self.entities.get(&record.id).cloned(),
            };
            let change = if record.is_deletion() {
                staged.insert(record.id.clone(), None);
                Some((ChangeKind::Deleted, record.to_entity(), record.fields.clone()))
            } else {
                match current {
                    None => {
                        let entity = record.to_entity();
                        staged.insert(record.id.clone(), Some(entity.clone()));
                        Some((ChangeKind::Created, entity, record.fields.clone()))
                    }
                    Some(existing) => {
                        let (entity, updates) = merge_entity(&existing, record)?;
                        if updates.is_empty() {
                            None
                        } else {
                            staged.insert(record.id.clone(), Some(entity.clone()));
                            Some((ChangeKind::Updated, entity, updates))
                        }
                    }
                }
            };

            let Some((kind, entity, updates)) = change else {
                continue;
            };
            let record = Arc::new(record.clone());
            match positions.get(&record.id) {
                Some(&position) => {
                    let previous = &mut changes[position];
                    previous.kind = match (previous.kind, kind) {
                        (ChangeKind::Created, ChangeKind::Updated) => ChangeKind::Created,
                        (ChangeKind::Deleted, ChangeKind::Created) => ChangeKind::Created,
                        (_, kind) => kind,
                    };
                    previous.entity = entity;
                    if kind == ChangeKind::Deleted {
                        previous.updates = updates;
                    } else {
                        previous.updates.extend(updates);
                    }
                    previous.record = record;
                }
                None => {
                    positions.insert(record.id.clone(), changes.len());
                    changes.push(ChangedEntity {
                        id: record.id.clone(),
                        typename: record.typename.clone(),
                        kind,
                        entity,
                        updates,
                        record,
                    });
                }
            }
        }

        for (id, entity) in staged.into_iter() {
            match entity {
                Some(entity) => {
                    self.entities.insert(id, entity);
                }
                None => {
                    self.entities.remove(&id);
                }
            }
        }
        Ok(changes)
    }
}

impl EntityLookup for EntityStore {
    fn lookup(&self, id: &str) -> Option<Data> {
        self.entities.get(id).cloned()
    }
}

/// Merges one record into an existing entity; returns the new entity and the changed fields.
/// An empty update set means the merge was a no-op and the existing entity is returned.
fn merge_entity(existing: &Data, record: &NormalizedRecord) -> Result<(Data, Fields), Error> {
    let document = &record.meta.document;
    let node = record.meta.node;
    let mut updates = Fields::new();

    for (name, fresh) in record.fields.iter() {
        let kind = field_kind(document, node, Some(&record.typename), name)
            .ok_or_else(|| Error::merge_invariant(name, &record.typename))?;
        let current = existing.get(name);
        let next = match kind {
            FieldKind::Value | FieldKind::Embedded(_) => {
                (current != Some(fresh)).then(|| fresh.clone())
            }
            FieldKind::Ref(child) => {
                let target = if document.node(child).flags.delete {
                    Data::Null
                } else {
                    to_ref(fresh)
                };
                match current {
                    Some(current) if current.entity_id() == target.entity_id() => None,
                    _ => Some(target),
                }
            }
            FieldKind::Set(child) => match (current.and_then(Data::as_list), fresh.as_list()) {
                (_, None) => (!current.map_or(false, Data::is_null)).then_some(Data::Null),
                (existing_items, Some(fresh_items)) => {
                    let existing_items: &[Data] = existing_items.map(Vec::as_slice).unwrap_or(&[]);
                    let flags = document.node(child).flags;
                    let merged = merge_id_list(existing_items, fresh_items, flags);
                    if current.is_some_and(|c| c.as_list().is_some())
                        && same_elements(&merged, existing_items)
                    {
                        None
                    } else {
                        Some(Data::list(merged))
                    }
                }
            },
        };
        if let Some(value) = next {
            updates.insert(name.clone(), value);
        }
    }

    if updates.is_empty() {
        return Ok((existing.clone(), updates));
    }
    let mut fields = existing.as_object().cloned().unwrap_or_default();
    fields.extend(updates.iter().map(|(k, v)| (k.clone(), v.clone())));
    Ok((Data::from_fields(fields), updates))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{Document, NodeSpec};
    use crate::error::ErrorType;
    use crate::pipeline::normalize;
    use serde_json::json;

    /// Records of a partial response; the store does not require every selected field.
    fn records(document: &Arc<Document>, value: serde_json::Value) -> Vec<NormalizedRecord> {
        normalize(document, &Data::from(value)).unwrap()
    }

    fn user_doc(friends: NodeSpec) -> Arc<Document> {
        Arc::new(Document::query(
            "User",
            NodeSpec::root().object(
                "user",
                NodeSpec::entity("User")
                    .scalar("name")
                    .object("best", NodeSpec::entity("User").scalar("name"))
                    .object("friends", friends),
            ),
        ))
    }

    fn friend_ids(store: &EntityStore) -> Vec<String> {
        store
            .get("u1")
            .and_then(|u| u.get("friends"))
            .and_then(Data::as_list)
            .map(|l| l.iter().filter_map(Data::entity_id).collect())
            .unwrap_or_default()
    }

    #[test]
    fn test_create_and_update() {
        let doc = user_doc(NodeSpec::entity_set("User"));
        let mut store = EntityStore::new();
        let changes = store
            .update(&records(&doc, json!({"user": {"id": "u1", "name": "John"}})))
            .unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].kind, ChangeKind::Created);
        assert_eq!(store.get("u1").unwrap().typename(), Some("User"));

        let changes = store
            .update(&records(&doc, json!({"user": {"id": "u1", "name": "James"}})))
            .unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].kind, ChangeKind::Updated);
        assert_eq!(changes[0].updates.len(), 1);
        assert_eq!(store.get("u1").unwrap().get("name"), Some(&Data::from("James")));
    }

    #[test]
    fn test_noop_merge_keeps_identity() {
        let doc = user_doc(NodeSpec::entity_set("User"));
        let mut store = EntityStore::new();
        let value = json!({"user": {"id": "u1", "name": "John", "friends": [{"id": "u2"}]}});
        store.update(&records(&doc, value.clone())).unwrap();
        let before = store.get("u1").unwrap().clone();
        let changes = store.update(&records(&doc, value)).unwrap();
        assert!(changes.is_empty());
        assert!(store.get("u1").unwrap().ptr_eq(&before));
    }

    #[test]
    fn test_set_policies() {
        let initial = json!({"user": {"id": "u1", "friends": [{"id": "A"}, {"id": "B"}]}});
        let fresh = json!({"user": {"id": "u1", "friends": [{"id": "B"}]}});

        let doc = user_doc(NodeSpec::entity_set("User"));
        let mut store = EntityStore::new();
        store.update(&records(&doc, initial.clone())).unwrap();
        store.update(&records(&doc, fresh.clone())).unwrap();
        assert_eq!(friend_ids(&store), vec!["A", "B"]);

        let doc = user_doc(NodeSpec::entity_set("User").remove_elements());
        let mut store = EntityStore::new();
        store.update(&records(&doc, initial.clone())).unwrap();
        store.update(&records(&doc, fresh.clone())).unwrap();
        assert_eq!(friend_ids(&store), vec!["A"]);

        let doc = user_doc(NodeSpec::entity_set("User").replace_elements());
        let mut store = EntityStore::new();
        store.update(&records(&doc, initial.clone())).unwrap();
        store.update(&records(&doc, fresh)).unwrap();
        assert_eq!(friend_ids(&store), vec!["B"]);
        store
            .update(&records(&doc, json!({"user": {"id": "u1", "friends": []}})))
            .unwrap();
        assert!(friend_ids(&store).is_empty());
    }

    #[test]
    fn test_reference_replacement_and_delete_flag() {
        let doc = user_doc(NodeSpec::entity_set("User"));
        let mut store = EntityStore::new();
        store
            .update(&records(&doc, json!({"user": {"id": "u1", "best": {"id": "u2", "name": "B"}}})))
            .unwrap();
        assert_eq!(store.get("u1").unwrap().get("best"), Some(&Data::stub("u2")));

        let delete = Arc::new(Document::mutation(
            "DeleteBest",
            NodeSpec::root().object(
                "user",
                NodeSpec::entity("User").object("best", NodeSpec::entity("User").delete()),
            ),
        ));
        let changes = store
            .update(&records(&delete, json!({"user": {"id": "u1", "best": {"id": "u2"}}})))
            .unwrap();
        assert_eq!(changes.len(), 2);
        assert_eq!(store.get("u1").unwrap().get("best"), Some(&Data::Null));
        assert!(!store.contains("u2"));
        assert_eq!(changes[1].kind, ChangeKind::Deleted);
    }

    #[test]
    fn test_delete_all_removes_and_deletes_elements() {
        let doc = user_doc(NodeSpec::entity_set("User"));
        let mut store = EntityStore::new();
        store
            .update(&records(
                &doc,
                json!({"user": {"id": "u1", "friends": [{"id": "A"}, {"id": "B"}]}}),
            ))
            .unwrap();
        assert!(store.contains("A") && store.contains("B"));

        let doc = user_doc(NodeSpec::entity_set("User").delete_all());
        let batch = records(&doc, json!({"user": {"id": "u1", "friends": [{"id": "A"}]}}));
        assert!(!batch[0].is_deletion());
        assert!(batch[1].is_deletion());
        let changes = store.update(&batch).unwrap();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].kind, ChangeKind::Updated);
        assert_eq!(changes[1].kind, ChangeKind::Deleted);
        assert_eq!(changes[1].id, "A");
        assert_eq!(friend_ids(&store), vec!["B"]);
        assert!(!store.contains("A"));
        assert!(store.contains("B"));
    }

    #[test]
    fn test_union_and_interface_sets_merge_through_fragments() {
        let doc = Arc::new(Document::query(
            "Feed",
            NodeSpec::root().object(
                "user",
                NodeSpec::entity("User")
                    .object(
                        "feed",
                        NodeSpec::union_set()
                            .fragment("Post", NodeSpec::embed().scalar("title"))
                            .fragment("Photo", NodeSpec::embed().scalar("url")),
                    )
                    .object(
                        "nodes",
                        NodeSpec::interface_set("Node").fragment("User", NodeSpec::embed().scalar("name")),
                    ),
            ),
        ));
        let mut store = EntityStore::new();
        store
            .update(&records(
                &doc,
                json!({"user": {
                    "id": "u1",
                    "feed": [{"id": "p1", "__typename": "Post", "title": "One"}],
                    "nodes": [{"id": "u2", "__typename": "User", "name": "Ann"}]
                }}),
            ))
            .unwrap();

        let changes = store
            .update(&records(
                &doc,
                json!({"user": {
                    "id": "u1",
                    "feed": [
                        {"id": "p1", "__typename": "Post", "title": "One!"},
                        {"id": "ph1", "__typename": "Photo", "url": "a.png"}
                    ],
                    "nodes": [{"id": "u2", "__typename": "User", "name": "Anna"}]
                }}),
            ))
            .unwrap();
        let kinds: Vec<(&str, ChangeKind)> = changes.iter().map(|c| (c.id.as_str(), c.kind)).collect();
        assert_eq!(
            kinds,
            vec![
                ("u1", ChangeKind::Updated),
                ("p1", ChangeKind::Updated),
                ("ph1", ChangeKind::Created),
                ("u2", ChangeKind::Updated),
            ]
        );
        let feed: Vec<String> = store
            .get("u1")
            .and_then(|u| u.get("feed"))
            .and_then(Data::as_list)
            .map(|l| l.iter().filter_map(Data::entity_id).collect())
            .unwrap_or_default();
        assert_eq!(feed, vec!["p1", "ph1"]);
        assert_eq!(store.get("p1").unwrap().get("title"), Some(&Data::from("One!")));
        assert_eq!(store.get("ph1").unwrap().typename(), Some("Photo"));
        assert_eq!(store.get("u2").unwrap().get("name"), Some(&Data::from("Anna")));
    }

    #[test]
    fn test_created_entity_is_reported_with_stored_fields() {
        let create = Arc::new(Document::mutation(
            "CreateTodo",
            NodeSpec::root().object("createTodo", NodeSpec::entity("Todo").scalars(&["title", "done"])),
        ));
        let mut store = EntityStore::new();
        let changes = store
            .update(&records(
                &create,
                json!({"createTodo": {"id": "t1", "title": "A", "done": false}}),
            ))
            .unwrap();
        assert_eq!(changes.len(), 1);
        let change = &changes[0];
        assert_eq!(change.kind, ChangeKind::Created);
        assert_eq!(change.typename, "Todo");
        assert_eq!(change.entity.get("done"), Some(&Data::Bool(false)));
        assert!(change.entity.ptr_eq(store.get("t1").unwrap()));
    }

    #[test]
    fn test_deletion_of_unseen_id_is_reported() {
        let delete = Arc::new(Document::mutation(
            "DeleteUser",
            NodeSpec::root().object("deleteUser", NodeSpec::entity("User").delete()),
        ));
        let mut store = EntityStore::new();
        let changes = store
            .update(&records(&delete, json!({"deleteUser": {"id": "zz"}})))
            .unwrap();
        assert_eq!(changes.len(), 1);
        assert!(changes[0].is_deletion());
        assert!(store.is_empty());
    }

    #[test]
    fn test_merge_invariant_commits_nothing() {
        let doc = user_doc(NodeSpec::entity_set("User"));
        let mut store = EntityStore::new();
        store
            .update(&records(&doc, json!({"user": {"id": "u1", "name": "John"}})))
            .unwrap();
        let mut batch = records(&doc, json!({"user": {"id": "u1", "name": "James", "best": {"id": "u3"}}}));
        batch[0].fields.insert("unknown".to_owned(), Data::Int(1));
        let e = store.update(&batch).unwrap_err();
        assert_eq!(e.error_type, ErrorType::MergeInvariant);
        assert_eq!(store.get("u1").unwrap().get("name"), Some(&Data::from("John")));
        assert!(!store.contains("u3"));
    }

    #[test]
    fn test_changes_are_coalesced_per_id() {
        let doc = Arc::new(Document::query(
            "Users",
            NodeSpec::root()
                .object("a", NodeSpec::entity("User").scalar("name"))
                .object("b", NodeSpec::entity("User").scalar("age")),
        ));
        let mut store = EntityStore::new();
        let changes = store
            .update(&records(
                &doc,
                json!({"a": {"id": "u1", "name": "A"}, "b": {"id": "u1", "age": 3}}),
            ))
            .unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].kind, ChangeKind::Created);
        assert_eq!(store.get("u1").unwrap().get("age"), Some(&Data::Int(3)));
        assert_eq!(store.ids(), vec!["u1"]);
    }
}
