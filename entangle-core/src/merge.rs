//! Merge policy shared by the entity store and the query caches.

use std::collections::HashSet;

use crate::data::Data;
use crate::document::{Document, Field, MergeFlags, NodeId};

/// How a field of an entity is merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Scalars, virtual scalars and embedded values; replaced when unequal.
    Value,
    /// Single entity, union or interface reference.
    Ref(NodeId),
    /// Entity, union or interface set.
    Set(NodeId),
    /// Embedded object or list that may hold references.
    Embedded(NodeId),
}

pub fn field_kind(
    document: &Document,
    node: NodeId,
    typename: Option<&str>,
    name: &str,
) -> Option<FieldKind> {
    match document.field(node, typename, name)? {
        Field::Scalar(_) | Field::Virtual(_, _) => Some(FieldKind::Value),
        Field::Object(_, child) => {
            let kind = document.node(child).kind;
            Some(if kind.is_entity_set() {
                FieldKind::Set(child)
            } else if kind.is_single_entity() {
                FieldKind::Ref(child)
            } else {
                FieldKind::Embedded(child)
            })
        }
    }
}

fn ids_of(items: &[Data]) -> HashSet<String> {
    items.iter().filter_map(Data::entity_id).collect()
}

/// Merges the elements of a fresh entity list into an existing one.
///
/// Elements are matched by entity id. With `replace_elements` the fresh list wins (an empty
/// fresh list clears), with `remove_elements`/`delete_all` the fresh ids are dropped from the
/// existing list, otherwise unseen fresh elements are appended. Matching existing elements
/// are kept as they are.
pub fn merge_id_list(existing: &[Data], fresh: &[Data], flags: MergeFlags) -> Vec<Data> {
    if flags.removes() {
        let remove = ids_of(fresh);
        return existing
            .iter()
            .filter(|item| item.entity_id().map_or(true, |id| !remove.contains(&id)))
            .cloned()
            .collect();
    }
    if flags.replace_elements {
        let mut seen = HashSet::new();
        return fresh
            .iter()
            .filter_map(|item| {
                let id = item.entity_id()?;
                if !seen.insert(id.clone()) {
                    return None;
                }
                Some(
                    existing
                        .iter()
                        .find(|e| e.entity_id().as_deref() == Some(id.as_str()))
                        .unwrap_or(item)
                        .clone(),
                )
            })
            .collect();
    }
    let mut seen = ids_of(existing);
    let mut merged = existing.to_vec();
    for item in fresh.iter() {
        if let Some(id) = item.entity_id() {
            if seen.insert(id) {
                merged.push(item.clone());
            }
        }
    }
    merged
}

/// True if both lists hold the same elements by identity.
pub fn same_elements(a: &[Data], b: &[Data]) -> bool {
    a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.ptr_eq(y))
}

/// Reference value stored for a single entity field.
pub fn to_ref(value: &Data) -> Data {
    match value.entity_id() {
        Some(id) => Data::stub(&id),
        None => Data::Null,
    }
}
