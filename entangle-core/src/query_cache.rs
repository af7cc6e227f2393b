//! # Query cache
//!
//! Denormalized, document-shaped view of one (operation, variables) pair.
//!
//! The cache is updated in two ways:
//! * [QueryCache::update] applies a batch of changed entities coming from the notification bus,
//! * [QueryCache::merge_response] folds a fresh response of the query itself into the snapshot.
//!
//! Both are copy-on-write: only the path from the root to a changed node is reallocated,
//! every untouched subtree keeps its identity (see [Data::ptr_eq]).

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::bus::ChangeSet;
use crate::data::{Data, Fields, ID};
use crate::document::{Document, Field, NodeId};
use crate::entity_store::ChangedEntity;
use crate::error::Error;
use crate::merge::{field_kind, merge_id_list, same_elements, FieldKind};

pub struct QueryCache {
    document: Arc<Document>,
    variables: Data,
    snapshot: Data,
    view: Data,
    ids: HashSet<String>,
    watched: BTreeSet<String>,
    stale: bool,
    updated_at: DateTime<Utc>,
}

impl QueryCache {
    /// Creates a cache from a processed (transformed and derived) response.
    pub fn new(document: Arc<Document>, variables: Data, data: Data) -> Self {
        let watched = document.watched_typenames();
        let mut cache = QueryCache {
            view: Data::Null,
            ids: HashSet::new(),
            watched,
            stale: false,
            updated_at: Utc::now(),
            document,
            variables,
            snapshot: data,
        };
        cache.refresh();
        cache
    }

    fn refresh(&mut self) {
        let mut ids = HashSet::new();
        collect_ids(&self.document, self.document.root(), &self.snapshot, &mut ids);
        self.ids = ids;
        self.view = self.document.present(&self.snapshot);
        self.updated_at = Utc::now();
    }

    pub fn document(&self) -> &Arc<Document> {
        &self.document
    }

    pub fn variables(&self) -> &Data {
        &self.variables
    }

    /// Document-shaped snapshot.
    pub fn snapshot(&self) -> &Data {
        &self.snapshot
    }

    /// Snapshot as presented to callers (after the document's response mapper).
    pub fn view(&self) -> &Data {
        &self.view
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn ids(&self) -> &HashSet<String> {
        &self.ids
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub fn mark_stale(&mut self) {
        self.stale = true;
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    fn relevant<'c>(&self, changes: &ChangeSet<'c>) -> Vec<&'c ChangedEntity> {
        changes
            .iter()
            .filter(|c| self.ids.contains(&c.id) || self.watched.contains(&c.typename))
            .collect()
    }

    /// Applies a change batch; returns true if the snapshot changed.
    pub fn update(&mut self, changes: &ChangeSet<'_>) -> Result<bool, Error> {
        let relevant = self.relevant(changes);
        if relevant.is_empty() {
            return Ok(false);
        }
        let walker = Walker {
            document: &self.document,
            variables: &self.variables,
            snapshot: &self.snapshot,
            changes: relevant,
            set: changes,
        };
        let root = self.document.root();
        let Some(snapshot) = walker.walk(root, &self.snapshot)? else {
            return Ok(false);
        };
        self.snapshot = snapshot;
        self.refresh();
        Ok(true)
    }

    /// Folds a fresh response of this query into the snapshot.
    /// Entity sets follow their merge flags; everything else takes the fresh value.
    /// Returns true if the snapshot changed. Clears the stale flag.
    pub fn merge_response(&mut self, fresh: &Data) -> bool {
        self.stale = false;
        let merged = merge_tree(&self.document, self.document.root(), &self.snapshot, fresh);
        if merged.ptr_eq(&self.snapshot) {
            return false;
        }
        self.snapshot = merged;
        self.refresh();
        true
    }
}

fn collect_ids(document: &Document, node: NodeId, value: &Data, ids: &mut HashSet<String>) {
    if let Some(items) = value.as_list() {
        for item in items.iter() {
            collect_object_ids(document, node, item, ids);
        }
    } else {
        collect_object_ids(document, node, value, ids);
    }
}

fn collect_object_ids(document: &Document, node: NodeId, value: &Data, ids: &mut HashSet<String>) {
    if value.as_object().is_none() {
        return;
    }
    if document.node(node).kind.is_entity() {
        if let Some(id) = value.entity_id() {
            ids.insert(id);
        }
    }
    let typename = value
        .typename()
        .or(document.node(node).typename.as_deref());
    for field in document.fields(node, typename) {
        if let Field::Object(name, child) = field {
            if let Some(v) = value.get(name) {
                collect_ids(document, child, v, ids);
            }
        }
    }
}

fn merge_tree(document: &Document, node: NodeId, old: &Data, fresh: &Data) -> Data {
    if old == fresh {
        return old.clone();
    }
    let descriptor = document.node(node);
    if !descriptor.kind.is_list() {
        return merge_object(document, node, old, fresh);
    }
    let (Some(old_items), Some(fresh_items)) = (old.as_list(), fresh.as_list()) else {
        return fresh.clone();
    };
    let items: Vec<Data> = if descriptor.kind.is_entity() {
        let by_id: HashMap<String, &Data> = fresh_items
            .iter()
            .filter_map(|item| item.entity_id().map(|id| (id, item)))
            .collect();
        merge_id_list(old_items, fresh_items, descriptor.flags)
            .iter()
            .map(|item| match item.entity_id().and_then(|id| by_id.get(&id).copied()) {
                Some(fresh_item) => merge_object(document, node, item, fresh_item),
                None => item.clone(),
            })
            .collect()
    } else {
        fresh_items
            .iter()
            .enumerate()
            .map(|(i, item)| match old_items.get(i) {
                Some(old_item) => merge_object(document, node, old_item, item),
                None => item.clone(),
            })
            .collect()
    };
    if same_elements(&items, old_items) {
        old.clone()
    } else {
        Data::list(items)
    }
}

fn merge_object(document: &Document, node: NodeId, old: &Data, fresh: &Data) -> Data {
    if old == fresh {
        return old.clone();
    }
    let (Some(old_fields), Some(fresh_fields)) = (old.as_object(), fresh.as_object()) else {
        return fresh.clone();
    };
    if document.node(node).kind.is_entity() && old.entity_id() != fresh.entity_id() {
        return fresh.clone();
    }
    let typename = fresh
        .typename()
        .or(document.node(node).typename.as_deref());
    let mut fields = old_fields.clone();
    for (name, value) in fresh_fields.iter() {
        let merged = match (document.field(node, typename, name), old_fields.get(name)) {
            (Some(Field::Object(_, child)), Some(old_value)) => {
                merge_tree(document, child, old_value, value)
            }
            (_, Some(old_value)) if old_value == value => old_value.clone(),
            _ => value.clone(),
        };
        fields.insert(name.clone(), merged);
    }
    let unchanged = fields.len() == old_fields.len()
        && fields
            .iter()
            .all(|(k, v)| old_fields.get(k).is_some_and(|o| o.ptr_eq(v)));
    if unchanged {
        old.clone()
    } else {
        Data::from_fields(fields)
    }
}

/// One copy-on-write pass of a change batch over a snapshot.
struct Walker<'a> {
    document: &'a Document,
    variables: &'a Data,
    snapshot: &'a Data,
    changes: Vec<&'a ChangedEntity>,
    set: &'a ChangeSet<'a>,
}

impl<'a> Walker<'a> {
    fn walk(&self, node: NodeId, value: &Data) -> Result<Option<Data>, Error> {
        if self.document.node(node).kind.is_list() {
            let Some(items) = value.as_list() else {
                return Ok(None);
            };
            let mut changed = false;
            let mut out = Vec::with_capacity(items.len());
            for item in items.iter() {
                match self.walk_object(node, item)? {
                    Some(next) => {
                        changed = true;
                        out.push(next);
                    }
                    None => out.push(item.clone()),
                }
            }
            return Ok(changed.then(|| Data::list(out)));
        }
        self.walk_object(node, value)
    }

    fn walk_object(&self, node: NodeId, value: &Data) -> Result<Option<Data>, Error> {
        let Some(fields) = value.as_object() else {
            return Ok(None);
        };
        let typename = value
            .typename()
            .or(self.document.node(node).typename.as_deref());
        let mut patched: Option<Fields> = None;

        if self.document.node(node).kind.is_entity() {
            if let Some(id) = value.entity_id() {
                for change in self.changes.iter().filter(|c| c.id == id && !c.is_deletion()) {
                    self.apply_change(node, typename, fields, change, &mut patched)?;
                }
            }
        }

        for field in self.document.fields(node, typename) {
            let Field::Object(name, child) = field else {
                continue;
            };
            let current = patched
                .as_ref()
                .and_then(|p| p.get(name))
                .or_else(|| fields.get(name))
                .cloned();
            let Some(current) = current else {
                continue;
            };
            if let Some(next) = self.walk_field(child, &current)? {
                patched
                    .get_or_insert_with(|| fields.clone())
                    .insert(name.to_owned(), next);
            }
        }
        Ok(patched.map(Data::from_fields))
    }

    fn walk_field(&self, child: NodeId, current: &Data) -> Result<Option<Data>, Error> {
        let kind = self.document.node(child).kind;
        if kind.is_entity_set() {
            let Some(items) = current.as_list() else {
                return Ok(None);
            };
            let mut changed = false;
            let mut out = Vec::with_capacity(items.len());
            for item in items.iter() {
                if item.entity_id().is_some_and(|id| self.set.is_deleted(&id)) {
                    changed = true;
                    continue;
                }
                match self.walk_object(child, item)? {
                    Some(next) => {
                        changed = true;
                        out.push(next);
                    }
                    None => out.push(item.clone()),
                }
            }
            for candidate in self.candidates(child) {
                let id = candidate.entity_id();
                if out.iter().any(|item| item.entity_id() == id) {
                    continue;
                }
                out.push(candidate);
                changed = true;
            }
            return Ok(changed.then(|| Data::list(out)));
        }

        if kind.is_single_entity() {
            let current_id = current.entity_id();
            if current_id.as_deref().is_some_and(|id| self.set.is_deleted(id)) {
                return Ok(Some(Data::Null));
            }
            let mut next = self.walk_object(child, current)?;
            for candidate in self.candidates(child) {
                if candidate.entity_id() != current_id {
                    next = Some(candidate);
                }
            }
            return Ok(next);
        }

        self.walk(child, current)
    }

    /// Changed entities accepted by the add-entity filters of a node, materialized for it.
    fn candidates(&self, node: NodeId) -> Vec<Data> {
        self.changes
            .iter()
            .filter(|c| !c.is_deletion())
            .filter_map(|change| {
                let filter = self.document.filter_for(node, &change.typename)?;
                let candidate = self.materialize_element(node, &Data::stub(&change.id));
                filter(&candidate, self.variables, self.snapshot).then_some(candidate)
            })
            .collect()
    }

    fn apply_change(
        &self,
        node: NodeId,
        typename: Option<&str>,
        fields: &Fields,
        change: &ChangedEntity,
        patched: &mut Option<Fields>,
    ) -> Result<(), Error> {
        let record = &change.record;
        let source = &record.meta.document;
        for (name, fresh) in record.fields.iter() {
            if name == ID {
                continue;
            }
            let Some(view_field) = self.document.field(node, typename, name) else {
                continue;
            };
            let current = patched
                .as_ref()
                .and_then(|p| p.get(name))
                .or_else(|| fields.get(name));
            let next = match view_field {
                Field::Scalar(_) | Field::Virtual(_, _) => {
                    (current != Some(fresh)).then(|| fresh.clone())
                }
                Field::Object(_, child) => {
                    let source_kind =
                        field_kind(source, record.meta.node, Some(&record.typename), name)
                            .ok_or_else(|| Error::merge_invariant(name, &record.typename))?;
                    match source_kind {
                        FieldKind::Ref(source_child) => {
                            if source.node(source_child).flags.delete || fresh.is_null() {
                                current
                                    .map_or(true, |c| !c.is_null())
                                    .then_some(Data::Null)
                            } else if current.and_then(Data::entity_id) == fresh.entity_id() {
                                None
                            } else {
                                Some(self.materialize(child, fresh))
                            }
                        }
                        FieldKind::Set(source_child) => {
                            let existing: &[Data] = current
                                .and_then(Data::as_list)
                                .map(Vec::as_slice)
                                .unwrap_or(&[]);
                            match fresh.as_list() {
                                None => current
                                    .map_or(true, |c| !c.is_null())
                                    .then_some(Data::Null),
                                Some(fresh_items) => {
                                    let flags = source.node(source_child).flags;
                                    let merged: Vec<Data> =
                                        merge_id_list(existing, fresh_items, flags)
                                            .into_iter()
                                            .map(|item| {
                                                if existing.iter().any(|e| e.ptr_eq(&item)) {
                                                    item
                                                } else {
                                                    self.materialize_element(child, &item)
                                                }
                                            })
                                            .collect();
                                    let unchanged = current.is_some_and(|c| c.as_list().is_some())
                                        && same_elements(&merged, existing);
                                    (!unchanged).then(|| Data::list(merged))
                                }
                            }
                        }
                        FieldKind::Value | FieldKind::Embedded(_) => {
                            let materialized = self.materialize(child, fresh);
                            (current != Some(&materialized)).then_some(materialized)
                        }
                    }
                }
            };
            if let Some(value) = next {
                patched
                    .get_or_insert_with(|| fields.clone())
                    .insert(name.clone(), value);
            }
        }
        Ok(())
    }

    /// Turns a stored (normalized) value into view form for a node, following references.
    fn materialize(&self, node: NodeId, value: &Data) -> Data {
        if value.is_null() {
            return Data::Null;
        }
        if self.document.node(node).kind.is_list() {
            return match value.as_list() {
                Some(items) => Data::list(items.iter().map(|item| self.materialize_element(node, item))),
                None => value.clone(),
            };
        }
        self.materialize_element(node, value)
    }

    fn materialize_element(&self, node: NodeId, value: &Data) -> Data {
        if self.document.node(node).kind.is_entity() {
            if let Some(entity) = value.entity_id().and_then(|id| self.set.lookup(&id)) {
                return self.materialize_fields(node, &entity);
            }
        }
        self.materialize_fields(node, value)
    }

    fn materialize_fields(&self, node: NodeId, value: &Data) -> Data {
        let Some(stored) = value.as_object() else {
            return value.clone();
        };
        let typename = value
            .typename()
            .or(self.document.node(node).typename.as_deref());
        let mut fields = Fields::new();
        for field in self.document.fields(node, typename) {
            match field {
                Field::Scalar(scalar) => {
                    if let Some(v) = stored.get(&scalar.name) {
                        fields.insert(scalar.name.clone(), v.clone());
                    }
                }
                Field::Virtual(name, default) => {
                    let v = stored.get(name).unwrap_or(default);
                    fields.insert(name.to_owned(), v.clone());
                }
                Field::Object(name, child) => {
                    if let Some(v) = stored.get(name) {
                        fields.insert(name.to_owned(), self.materialize(child, v));
                    }
                }
            }
        }
        Data::from_fields(fields)
    }
}
