use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::broadcast;

pub type Document = Map<String, Value>;
pub type StoreResult<T> = Result<T, StoreError>;

pub const USERS: &str = "users";
pub const EXAMS: &str = "exams";
pub const ROOMS: &str = "rooms";
pub const SUBMISSIONS: &str = "submissions";

/// Marker key the store replaces with its own write time.
pub const SERVER_TIMESTAMP_KEY: &str = "__serverTimestamp";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("document {collection}/{id} does not exist")]
    NotFound { collection: String, id: String },
    #[error("document store unavailable: {0}")]
    Unavailable(String),
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("io failure: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub struct DocumentSnapshot {
    pub id: String,
    pub data: Document,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetMode {
    Overwrite,
    Merge,
}

/// Equality filter on a dotted field path such as `student.id`.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldFilter {
    pub field: String,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub collection: String,
    pub filters: Vec<FieldFilter>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn collection(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            filters: Vec::new(),
            limit: None,
        }
    }

    pub fn where_eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push(FieldFilter {
            field: field.into(),
            value: value.into(),
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// True when every filter matches; a missing field never matches.
    pub fn matches(&self, data: &Document) -> bool {
        self.filters
            .iter()
            .all(|f| field_value(data, &f.field) == Some(&f.value))
    }
}

#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub collection: String,
    pub id: String,
    /// `None` once the document has been deleted.
    pub data: Option<Document>,
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, collection: &str, id: &str) -> StoreResult<Option<DocumentSnapshot>>;

    async fn set(&self, collection: &str, id: &str, data: Document, mode: SetMode) -> StoreResult<()>;

    /// Inserts under a freshly generated id and returns it.
    async fn add(&self, collection: &str, data: Document) -> StoreResult<String>;

    /// Partial update; fails with `StoreError::NotFound` when the document is absent.
    async fn update(&self, collection: &str, id: &str, fields: Document) -> StoreResult<()>;

    async fn delete(&self, collection: &str, id: &str) -> StoreResult<()>;

    async fn query(&self, query: &Query) -> StoreResult<Vec<DocumentSnapshot>>;

    fn changes(&self, collection: &str) -> broadcast::Receiver<ChangeEvent>;
}

pub fn server_timestamp() -> Value {
    let mut marker = Map::new();
    marker.insert(SERVER_TIMESTAMP_KEY.to_string(), Value::Bool(true));
    Value::Object(marker)
}

pub fn is_server_timestamp(value: &Value) -> bool {
    match value {
        Value::Object(map) => map.len() == 1 && map.get(SERVER_TIMESTAMP_KEY) == Some(&Value::Bool(true)),
        _ => false,
    }
}

/// Replaces every server-timestamp sentinel inside `value` with `stamp`.
pub fn resolve_server_timestamps(value: &mut Value, stamp: &str) {
    if is_server_timestamp(value) {
        *value = Value::String(stamp.to_string());
        return;
    }
    match value {
        Value::Object(map) => map.values_mut().for_each(|v| resolve_server_timestamps(v, stamp)),
        Value::Array(items) => items.iter_mut().for_each(|v| resolve_server_timestamps(v, stamp)),
        _ => {}
    }
}

/// Writes `value` at a dotted path, creating intermediate maps.
pub fn set_field(target: &mut Document, path: &str, value: Value) {
    match path.split_once('.') {
        None => {
            target.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let entry = target
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Document::new()));
            if !entry.is_object() {
                *entry = Value::Object(Document::new());
            }
            if let Value::Object(nested) = entry {
                set_field(nested, rest, value);
            }
        }
    }
}

pub fn field_value<'a>(data: &'a Document, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = data.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

pub fn to_document<T: Serialize>(value: &T) -> StoreResult<Document> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => Err(StoreError::Serialization(serde::ser::Error::custom(format!(
            "expected a JSON object, got {other}"
        )))),
    }
}

pub fn from_document<T: DeserializeOwned>(data: &Document) -> Result<T, serde_json::Error> {
    serde_json::from_value(Value::Object(data.clone()))
}
