//! # Data
//!
//! [Data] is the value tree flowing through the engine: network responses, normalized entity
//! records, store entities and query cache snapshots are all represented by it.
//! Lists and objects are reference counted, so cloning a tree is cheap and an unchanged subtree
//! can be shared between an old and a new snapshot. [Data::ptr_eq] tells whether two trees
//! share the same allocation, which is how structural sharing is observed.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

pub type Fields = BTreeMap<String, Data>;

pub const ID: &str = "id";
pub const TYPENAME: &str = "__typename";

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(untagged)]
pub enum Data {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Arc<Vec<Data>>),
    Object(Arc<Fields>),
}

impl Default for Data {
    fn default() -> Self {
        Data::Null
    }
}

impl PartialEq for Data {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Data::Null, Data::Null) => true,
            (Data::Bool(a), Data::Bool(b)) => a == b,
            (Data::Int(a), Data::Int(b)) => a == b,
            (Data::Float(a), Data::Float(b)) => a == b,
            (Data::Text(a), Data::Text(b)) => a == b,
            (Data::List(a), Data::List(b)) => Arc::ptr_eq(a, b) || a == b,
            (Data::Object(a), Data::Object(b)) => Arc::ptr_eq(a, b) || a == b,
            _ => false,
        }
    }
}

impl Data {
    pub fn object<K: Into<String>, I: IntoIterator<Item = (K, Data)>>(fields: I) -> Self {
        Data::Object(Arc::new(
            fields.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        ))
    }

    pub fn from_fields(fields: Fields) -> Self {
        Data::Object(Arc::new(fields))
    }

    pub fn list<I: IntoIterator<Item = Data>>(items: I) -> Self {
        Data::List(Arc::new(items.into_iter().collect()))
    }

    /// Reference stub `{id}` used for entity positions in normalized records.
    pub fn stub(id: &str) -> Self {
        Data::object([(ID, Data::Text(id.to_owned()))])
    }

    pub fn empty_object() -> Self {
        Data::Object(Arc::new(BTreeMap::new()))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Data::Null)
    }

    pub fn as_object(&self) -> Option<&Fields> {
        match self {
            Data::Object(fields) => Some(fields.as_ref()),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&Vec<Data>> {
        match self {
            Data::List(items) => Some(items.as_ref()),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Data::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Data::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Data::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Field of an object; `None` for missing fields and non-objects.
    pub fn get(&self, key: &str) -> Option<&Data> {
        self.as_object().and_then(|fields| fields.get(key))
    }

    /// Entity id of an object. Integer ids are turned into their decimal text.
    pub fn entity_id(&self) -> Option<String> {
        match self.get(ID)? {
            Data::Text(id) => Some(id.clone()),
            Data::Int(id) => Some(id.to_string()),
            _ => None,
        }
    }

    pub fn typename(&self) -> Option<&str> {
        self.get(TYPENAME).and_then(Data::as_str)
    }

    /// True if both values share the same allocation.
    /// Scalars carry no identity and compare by value.
    pub fn ptr_eq(&self, other: &Data) -> bool {
        match (self, other) {
            (Data::List(a), Data::List(b)) => Arc::ptr_eq(a, b),
            (Data::Object(a), Data::Object(b)) => Arc::ptr_eq(a, b),
            (Data::List(_), _) | (Data::Object(_), _) => false,
            (a, b) => a == b,
        }
    }

    /// Copy of an object with one field replaced. Other fields are shared.
    pub fn with_field(&self, key: &str, value: Data) -> Data {
        let mut fields = self.as_object().cloned().unwrap_or_default();
        fields.insert(key.to_owned(), value);
        Data::Object(Arc::new(fields))
    }

    /// Copy of an object without a field.
    pub fn without_field(&self, key: &str) -> Data {
        match self {
            Data::Object(fields) if fields.contains_key(key) => {
                let mut fields = fields.as_ref().clone();
                fields.remove(key);
                Data::Object(Arc::new(fields))
            }
            _ => self.clone(),
        }
    }

    /// Deterministic JSON text; object keys are sorted.
    pub fn canonical_string(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "null".to_owned())
    }

    /// Short stable fingerprint of the canonical text.
    /// Used to key query records by their variables.
    pub fn fingerprint(&self) -> String {
        blake3::hash(self.canonical_string().as_bytes())
            .to_hex()
            .to_string()
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Data::Null => serde_json::Value::Null,
            Data::Bool(b) => serde_json::Value::Bool(*b),
            Data::Int(n) => serde_json::Value::from(*n),
            Data::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Data::Text(s) => serde_json::Value::String(s.clone()),
            Data::List(items) => {
                serde_json::Value::Array(items.iter().map(Data::to_json).collect())
            }
            Data::Object(fields) => serde_json::Value::Object(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Data::Null => "null",
            Data::Bool(_) => "bool",
            Data::Int(_) => "int",
            Data::Float(_) => "float",
            Data::Text(_) => "text",
            Data::List(_) => "list",
            Data::Object(_) => "object",
        }
    }
}

impl fmt::Display for Data {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.canonical_string())
    }
}

impl From<serde_json::Value> for Data {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Data::Null,
            serde_json::Value::Bool(b) => Data::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Data::Int(i)
                } else {
                    Data::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => Data::Text(s),
            serde_json::Value::Array(a) => Data::list(a.into_iter().map(Data::from)),
            serde_json::Value::Object(o) => {
                Data::Object(Arc::new(o.into_iter().map(|(k, v)| (k, Data::from(v))).collect()))
            }
        }
    }
}

impl From<&str> for Data {
    fn from(value: &str) -> Self {
        Data::Text(value.to_owned())
    }
}

impl From<String> for Data {
    fn from(value: String) -> Self {
        Data::Text(value)
    }
}

impl From<i64> for Data {
    fn from(value: i64) -> Self {
        Data::Int(value)
    }
}

impl From<f64> for Data {
    fn from(value: f64) -> Self {
        Data::Float(value)
    }
}

impl From<bool> for Data {
    fn from(value: bool) -> Self {
        Data::Bool(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_conversion() {
        let value = json!({"user": {"id": "u1", "age": 42, "tags": ["a", "b"], "score": 1.5}});
        let data = Data::from(value.clone());
        assert_eq!(data.to_json(), value);
        assert_eq!(data.get("user").unwrap().entity_id().as_deref(), Some("u1"));
    }

    #[test]
    fn test_canonical_string_is_sorted() {
        let a = Data::from(json!({"b": 1, "a": 2}));
        assert_eq!(a.canonical_string(), r#"{"a":2,"b":1}"#);
        let b = Data::from(json!({"a": 2, "b": 1}));
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_identity_and_equality() {
        let shared = Data::from(json!({"id": "u1"}));
        let a = Data::object([("x", shared.clone()), ("y", Data::from(1))]);
        let b = a.with_field("y", Data::from(2));
        assert!(a.get("x").unwrap().ptr_eq(b.get("x").unwrap()));
        assert!(!a.ptr_eq(&b));
        assert_ne!(a, b);
        let c = Data::from(json!({"x": {"id": "u1"}, "y": 1}));
        assert_eq!(a, c);
        assert!(!a.ptr_eq(&c));
    }

    #[test]
    fn test_deserialize_untagged() {
        let data: Data = serde_json::from_str(r#"{"n": 3, "f": 0.5, "t": null}"#).unwrap();
        assert_eq!(data.get("n"), Some(&Data::Int(3)));
        assert_eq!(data.get("f"), Some(&Data::Float(0.5)));
        assert_eq!(data.get("t"), Some(&Data::Null));
    }
}
