use crate::store::{
    field_value, resolve_server_timestamps, set_field, ChangeEvent, Document, DocumentSnapshot, DocumentStore, Query,
    SetMode, StoreError, StoreResult,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use dashmap::DashMap;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::fs;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, warn};

type Collections = HashMap<String, BTreeMap<String, Document>>;

const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// Document store kept in process memory, optionally mirrored to a JSON file.
#[derive(Clone)]
pub struct InMemoryStore {
    inner: Arc<Inner>,
}

struct Inner {
    collections: RwLock<Collections>,
    broadcasters: DashMap<String, broadcast::Sender<ChangeEvent>>,
    last_write_time: Mutex<DateTime<Utc>>,
    snapshot_path: Option<PathBuf>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_collections(HashMap::new(), None)
    }

    /// Loads a previous snapshot when the file exists and is readable.
    pub fn open(snapshot_path: impl AsRef<Path>) -> Self {
        let path = snapshot_path.as_ref().to_path_buf();
        let collections = match fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<Collections>(&raw) {
                Ok(c) => c,
                Err(err) => {
                    warn!("failed to read local snapshot {}: {}", path.display(), err);
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };
        Self::with_collections(collections, Some(path))
    }

    fn with_collections(collections: Collections, snapshot_path: Option<PathBuf>) -> Self {
        Self {
            inner: Arc::new(Inner {
                collections: RwLock::new(collections),
                broadcasters: DashMap::new(),
                last_write_time: Mutex::new(DateTime::<Utc>::MIN_UTC),
                snapshot_path,
            }),
        }
    }

    fn sender(&self, collection: &str) -> broadcast::Sender<ChangeEvent> {
        self.inner
            .broadcasters
            .entry(collection.to_string())
            .or_insert_with(|| broadcast::channel(CHANGE_CHANNEL_CAPACITY).0)
            .clone()
    }

    fn notify(&self, collection: &str, id: &str, data: Option<Document>) {
        // No receivers is fine: nobody is watching this collection.
        let _ = self.sender(collection).send(ChangeEvent {
            collection: collection.to_string(),
            id: id.to_string(),
            data,
        });
    }

    /// Strictly increasing write time, even when the wall clock stalls.
    fn next_write_time(&self) -> DateTime<Utc> {
        let mut last = match self.inner.last_write_time.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let now = Utc::now();
        let stamp = if now > *last { now } else { *last + Duration::microseconds(1) };
        *last = stamp;
        stamp
    }

    fn write_stamp(&self) -> String {
        self.next_write_time().to_rfc3339_opts(SecondsFormat::Micros, true)
    }

    async fn persist(&self) {
        let Some(path) = self.inner.snapshot_path.as_ref() else {
            return;
        };
        let serialized = {
            let collections = self.inner.collections.read().await;
            serde_json::to_vec_pretty(&*collections)
        };
        let result = async {
            let bytes = serialized?;
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(path, bytes).await?;
            Ok::<_, StoreError>(())
        }
        .await;
        if let Err(err) = result {
            warn!("failed to persist local snapshot {}: {}", path.display(), err);
        }
    }
}

fn merge_into(target: &mut Document, incoming: Document) {
    for (key, value) in incoming {
        match (target.get_mut(&key), value) {
            (Some(Value::Object(existing)), Value::Object(nested)) => merge_into(existing, nested),
            (_, value) => {
                target.insert(key, value);
            }
        }
    }
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    async fn get(&self, collection: &str, id: &str) -> StoreResult<Option<DocumentSnapshot>> {
        let collections = self.inner.collections.read().await;
        Ok(collections
            .get(collection)
            .and_then(|docs| docs.get(id))
            .map(|data| DocumentSnapshot {
                id: id.to_string(),
                data: data.clone(),
            }))
    }

    async fn set(&self, collection: &str, id: &str, mut data: Document, mode: SetMode) -> StoreResult<()> {
        {
            let mut collections = self.inner.collections.write().await;
            // Stamped and announced under the lock so stamps follow commit order.
            let stamp = self.write_stamp();
            data.values_mut().for_each(|v| resolve_server_timestamps(v, &stamp));
            let docs = collections.entry(collection.to_string()).or_default();
            match (mode, docs.get_mut(id)) {
                (SetMode::Merge, Some(existing)) => merge_into(existing, data),
                _ => {
                    docs.insert(id.to_string(), data);
                }
            }
            self.notify(collection, id, docs.get(id).cloned());
        }
        self.persist().await;
        Ok(())
    }

    async fn add(&self, collection: &str, data: Document) -> StoreResult<String> {
        let id = uuid::Uuid::new_v4().simple().to_string();
        self.set(collection, &id, data, SetMode::Overwrite).await?;
        debug!("added {}/{}", collection, id);
        Ok(id)
    }

    async fn update(&self, collection: &str, id: &str, fields: Document) -> StoreResult<()> {
        {
            let mut collections = self.inner.collections.write().await;
            let existing = collections
                .get_mut(collection)
                .and_then(|docs| docs.get_mut(id))
                .ok_or_else(|| StoreError::NotFound {
                    collection: collection.to_string(),
                    id: id.to_string(),
                })?;
            let stamp = self.write_stamp();
            for (path, mut value) in fields {
                resolve_server_timestamps(&mut value, &stamp);
                set_field(existing, &path, value);
            }
            let written = existing.clone();
            self.notify(collection, id, Some(written));
        }
        self.persist().await;
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> StoreResult<()> {
        let removed = {
            let mut collections = self.inner.collections.write().await;
            let removed = collections
                .get_mut(collection)
                .and_then(|docs| docs.remove(id))
                .is_some();
            if removed {
                self.notify(collection, id, None);
            }
            removed
        };
        if removed {
            self.persist().await;
        }
        Ok(())
    }

    async fn query(&self, query: &Query) -> StoreResult<Vec<DocumentSnapshot>> {
        let collections = self.inner.collections.read().await;
        let Some(docs) = collections.get(&query.collection) else {
            return Ok(Vec::new());
        };
        let matching = docs
            .iter()
            .filter(|(_, data)| query.matches(data))
            .map(|(id, data)| DocumentSnapshot {
                id: id.clone(),
                data: data.clone(),
            });
        Ok(match query.limit {
            Some(limit) => matching.take(limit).collect(),
            None => matching.collect(),
        })
    }

    fn changes(&self, collection: &str) -> broadcast::Receiver<ChangeEvent> {
        self.sender(collection).subscribe()
    }
}

impl InMemoryStore {
    /// Number of documents currently held in a collection.
    pub async fn len(&self, collection: &str) -> usize {
        let collections = self.inner.collections.read().await;
        collections.get(collection).map(|d| d.len()).unwrap_or(0)
    }

    pub async fn is_empty(&self, collection: &str) -> bool {
        self.len(collection).await == 0
    }

    /// Reads a single field, mostly useful for diagnostics.
    pub async fn field(&self, collection: &str, id: &str, path: &str) -> Option<Value> {
        let collections = self.inner.collections.read().await;
        let data = collections.get(collection)?.get(id)?;
        field_value(data, path).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::server_timestamp;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn add_get_update_delete() {
        let store = InMemoryStore::new();
        let id = store
            .add("rooms", doc(json!({"code": "ABCDEF", "totalStudents": 0})))
            .await
            .unwrap();
        store
            .update("rooms", &id, doc(json!({"totalStudents": 1, "settings.mode": "x"})))
            .await
            .unwrap();
        let snap = store.get("rooms", &id).await.unwrap().unwrap();
        assert_eq!(snap.data["totalStudents"], json!(1));
        assert_eq!(snap.data["settings"]["mode"], json!("x"));

        store.delete("rooms", &id).await.unwrap();
        assert!(store.get("rooms", &id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn update_of_missing_document_fails() {
        let store = InMemoryStore::new();
        let err = store
            .update("rooms", "nope", doc(json!({"status": "active"})))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn merge_keeps_untouched_fields() {
        let store = InMemoryStore::new();
        store
            .set("users", "u1", doc(json!({"name": "A", "role": "teacher"})), SetMode::Overwrite)
            .await
            .unwrap();
        store
            .set("users", "u1", doc(json!({"isApproved": true})), SetMode::Merge)
            .await
            .unwrap();
        let snap = store.get("users", "u1").await.unwrap().unwrap();
        assert_eq!(snap.data["name"], json!("A"));
        assert_eq!(snap.data["isApproved"], json!(true));
    }

    #[tokio::test]
    async fn server_timestamps_are_strictly_increasing() {
        let store = InMemoryStore::new();
        let mut stamps = Vec::new();
        for _ in 0..5 {
            let id = store.add("t", doc(json!({"at": server_timestamp()}))).await.unwrap();
            let raw = store.field("t", &id, "at").await.unwrap();
            let parsed: DateTime<Utc> = raw.as_str().unwrap().parse().unwrap();
            stamps.push(parsed);
        }
        assert!(stamps.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writes_are_announced_in_stamp_order() {
        let store = InMemoryStore::new();
        let mut rx = store.changes("t");
        let writers: Vec<_> = (0..50)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .set("t", &format!("d{i}"), doc(json!({"at": server_timestamp()})), SetMode::Overwrite)
                        .await
                        .unwrap();
                })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap();
        }

        let mut stamps = Vec::new();
        for _ in 0..50 {
            let event = rx.recv().await.unwrap();
            let data = event.data.unwrap();
            let parsed: DateTime<Utc> = data["at"].as_str().unwrap().parse().unwrap();
            stamps.push(parsed);
        }
        assert!(stamps.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn change_feed_reports_writes_and_deletes() {
        let store = InMemoryStore::new();
        let mut rx = store.changes("rooms");
        store
            .set("rooms", "r1", doc(json!({"status": "waiting"})), SetMode::Overwrite)
            .await
            .unwrap();
        store.delete("rooms", "r1").await.unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.id, "r1");
        assert!(first.data.is_some());
        let second = rx.recv().await.unwrap();
        assert!(second.data.is_none());
    }

    #[tokio::test]
    async fn snapshot_survives_reopen() {
        let dir = std::env::temp_dir().join(format!("exam-rooms-{}", uuid::Uuid::new_v4()));
        let path = dir.join("state.json");
        let store = InMemoryStore::open(&path);
        store
            .set("exams", "e1", doc(json!({"title": "Unit 1"})), SetMode::Overwrite)
            .await
            .unwrap();

        let reopened = InMemoryStore::open(&path);
        let snap = reopened.get("exams", "e1").await.unwrap().unwrap();
        assert_eq!(snap.data["title"], json!("Unit 1"));
        let _ = std::fs::remove_dir_all(dir);
    }
}
