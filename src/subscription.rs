use crate::store::{DocumentSnapshot, DocumentStore, Query};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Handle to a live feed. Cancelling (or dropping) it stops callback delivery.
pub struct Subscription {
    cancelled: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn cancel(self) {
        // Drop does the work.
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.task.abort();
    }
}

fn deliver<T>(cancelled: &AtomicBool, callback: &(dyn Fn(T) + Send + Sync), value: T) -> bool {
    if cancelled.load(Ordering::SeqCst) {
        return false;
    }
    callback(value);
    true
}

/// Calls `on_change` with the current document, then again after every write
/// or delete of it. Deleted or missing documents are reported as `None`.
pub fn watch_document<F>(store: Arc<dyn DocumentStore>, collection: &str, id: &str, on_change: F) -> Subscription
where
    F: Fn(Option<DocumentSnapshot>) + Send + Sync + 'static,
{
    let cancelled = Arc::new(AtomicBool::new(false));
    let flag = cancelled.clone();
    let collection = collection.to_string();
    let id = id.to_string();
    // Subscribe before the initial read so no write can slip in between.
    let mut changes = store.changes(&collection);

    let task = tokio::spawn(async move {
        match store.get(&collection, &id).await {
            Ok(initial) => {
                if !deliver(&flag, &on_change, initial) {
                    return;
                }
            }
            Err(err) => warn!("initial read of {}/{} failed: {}", collection, id, err),
        }

        loop {
            let snapshot = match changes.recv().await {
                Ok(event) if event.id == id => event.data.map(|data| DocumentSnapshot { id: id.clone(), data }),
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    warn!("document feed {}/{} lagged by {} events, re-reading", collection, id, skipped);
                    match store.get(&collection, &id).await {
                        Ok(current) => current,
                        Err(err) => {
                            warn!("re-read of {}/{} failed: {}", collection, id, err);
                            continue;
                        }
                    }
                }
                Err(RecvError::Closed) => break,
            };
            if !deliver(&flag, &on_change, snapshot) {
                break;
            }
        }
        debug!("document feed {}/{} finished", collection, id);
    });

    Subscription { cancelled, task }
}

/// Calls `on_update` with the full query result, then again whenever a
/// document entering, leaving or inside the result set changes.
pub fn watch_query<F>(store: Arc<dyn DocumentStore>, query: Query, on_update: F) -> Subscription
where
    F: Fn(Vec<DocumentSnapshot>) + Send + Sync + 'static,
{
    let cancelled = Arc::new(AtomicBool::new(false));
    let flag = cancelled.clone();
    let mut changes = store.changes(&query.collection);

    let task = tokio::spawn(async move {
        let mut members: HashSet<String> = HashSet::new();
        let mut refresh = true;

        loop {
            if refresh {
                match store.query(&query).await {
                    Ok(results) => {
                        members = results.iter().map(|s| s.id.clone()).collect();
                        if !deliver(&flag, &on_update, results) {
                            break;
                        }
                    }
                    Err(err) => warn!("query feed on {} failed: {}", query.collection, err),
                }
            }

            refresh = match changes.recv().await {
                Ok(event) => {
                    members.contains(&event.id) || event.data.as_ref().is_some_and(|data| query.matches(data))
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("query feed on {} lagged by {} events, re-querying", query.collection, skipped);
                    true
                }
                Err(RecvError::Closed) => break,
            };
        }
        debug!("query feed on {} finished", query.collection);
    });

    Subscription { cancelled, task }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::InMemoryStore;
    use crate::store::{Document, SetMode};
    use serde_json::{json, Value};
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn document_watch_reports_updates_then_deletion() {
        let store = InMemoryStore::new();
        store
            .set("rooms", "r1", doc(json!({"status": "waiting"})), SetMode::Overwrite)
            .await
            .unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let shared: Arc<dyn DocumentStore> = Arc::new(store.clone());
        let _sub = watch_document(shared, "rooms", "r1", move |snap| {
            let _ = tx.send(snap.map(|s| s.data["status"].clone()));
        });

        assert_eq!(rx.recv().await.unwrap(), Some(json!("waiting")));
        store
            .update("rooms", "r1", doc(json!({"status": "active"})))
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap(), Some(json!("active")));
        store.delete("rooms", "r1").await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn query_watch_ignores_unrelated_documents() {
        let store = InMemoryStore::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let shared: Arc<dyn DocumentStore> = Arc::new(store.clone());
        let _sub = watch_query(
            shared,
            Query::collection("submissions").where_eq("roomId", "r1"),
            move |docs| {
                let _ = tx.send(docs.len());
            },
        );
        assert_eq!(rx.recv().await.unwrap(), 0);

        store
            .add("submissions", doc(json!({"roomId": "other"})))
            .await
            .unwrap();
        store.add("submissions", doc(json!({"roomId": "r1"}))).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn cancelled_subscription_stops_delivering() {
        let store = InMemoryStore::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let shared: Arc<dyn DocumentStore> = Arc::new(store.clone());
        let sub = watch_query(shared, Query::collection("submissions"), move |docs| {
            let _ = tx.send(docs.len());
        });
        assert_eq!(rx.recv().await.unwrap(), 0);
        sub.cancel();

        store.add("submissions", doc(json!({"roomId": "r1"}))).await.unwrap();
        // The sender lives inside the aborted task, so the channel closes.
        let next = timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(next, None);
    }
}
