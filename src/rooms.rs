use crate::codes::{normalize_code, CodeAllocator};
use crate::error::{ServiceError, ServiceResult};
use crate::models::{NewRoom, Room, RoomStatus};
use crate::store::{
    from_document, server_timestamp, to_document, Document, DocumentStore, Query, StoreError, ROOMS, SUBMISSIONS,
};
use crate::subscription::{watch_document, Subscription};
use futures::future::join_all;
use serde_json::Value;
use std::cmp::Reverse;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub(crate) fn parse_room(id: &str, data: &Document) -> ServiceResult<Room> {
    let mut room: Room = from_document(data).map_err(|e| ServiceError::Malformed {
        entity: "room",
        id: id.to_string(),
        reason: e.to_string(),
    })?;
    room.id = id.to_string();
    Ok(room)
}

/// Counter fields on a room that submissions bump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomCounter {
    TotalStudents,
    SubmittedCount,
}

impl RoomCounter {
    fn field(self) -> &'static str {
        match self {
            RoomCounter::TotalStudents => "totalStudents",
            RoomCounter::SubmittedCount => "submittedCount",
        }
    }
}

/// Read-then-write increment. Concurrent calls for the same room can lose
/// updates; the counters are display values only. A missing room is skipped.
pub(crate) async fn bump_room_counter(store: &dyn DocumentStore, room_id: &str, counter: RoomCounter) -> ServiceResult<()> {
    let Some(snapshot) = store.get(ROOMS, room_id).await? else {
        warn!(room_id, counter = counter.field(), "room missing, counter not updated");
        return Ok(());
    };
    let current = snapshot
        .data
        .get(counter.field())
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let mut fields = Document::new();
    fields.insert(counter.field().into(), Value::from(current + 1));
    fields.insert("updatedAt".into(), server_timestamp());
    match store.update(ROOMS, room_id, fields).await {
        // Deleted between the read and the write.
        Err(StoreError::NotFound { .. }) => Ok(()),
        other => Ok(other?),
    }
}

#[derive(Clone)]
pub struct RoomService {
    store: Arc<dyn DocumentStore>,
    codes: CodeAllocator,
}

impl RoomService {
    pub fn new(store: Arc<dyn DocumentStore>, codes: CodeAllocator) -> Self {
        Self { store, codes }
    }

    pub async fn create_room(&self, new_room: NewRoom) -> ServiceResult<Room> {
        let code = self.codes.allocate_unique_code(self.store.as_ref()).await?;
        let room = new_room.into_room(code);

        let mut data = to_document(&room)?;
        data.insert("createdAt".into(), server_timestamp());
        data.insert("updatedAt".into(), server_timestamp());
        let id = self.store.add(ROOMS, data).await?;
        info!(room_id = %id, code = %room.code, exam_id = %room.exam_id, "room created");

        match self.get_room(&id).await? {
            Some(room) => Ok(room),
            None => Err(ServiceError::not_found("room", id)),
        }
    }

    pub async fn get_room(&self, room_id: &str) -> ServiceResult<Option<Room>> {
        match self.store.get(ROOMS, room_id).await? {
            Some(snapshot) => parse_room(&snapshot.id, &snapshot.data).map(Some),
            None => Ok(None),
        }
    }

    /// Case-insensitive; the first match wins if codes ever collided.
    pub async fn get_room_by_code(&self, code: &str) -> ServiceResult<Option<Room>> {
        let code = normalize_code(code);
        debug!(code = %code, "room lookup by code");
        let found = self
            .store
            .query(&Query::collection(ROOMS).where_eq("code", code).limit(1))
            .await?;
        found
            .first()
            .map(|s| parse_room(&s.id, &s.data))
            .transpose()
    }

    pub async fn get_rooms_by_teacher(&self, teacher_id: &str) -> ServiceResult<Vec<Room>> {
        let docs = self
            .store
            .query(&Query::collection(ROOMS).where_eq("teacherId", teacher_id))
            .await?;
        let mut rooms = docs
            .iter()
            .map(|s| parse_room(&s.id, &s.data))
            .collect::<ServiceResult<Vec<_>>>()?;
        rooms.sort_by_key(|r| Reverse(r.created_at));
        Ok(rooms)
    }

    /// Sets the status and stamps `startTime` on active, `endTime` on closed.
    /// Transition order is not enforced here.
    pub async fn update_status(&self, room_id: &str, status: RoomStatus) -> ServiceResult<()> {
        let mut fields = Document::new();
        fields.insert("status".into(), serde_json::to_value(status).map_err(StoreError::from)?);
        fields.insert("updatedAt".into(), server_timestamp());
        match status {
            RoomStatus::Active => {
                fields.insert("startTime".into(), server_timestamp());
            }
            RoomStatus::Closed => {
                fields.insert("endTime".into(), server_timestamp());
            }
            RoomStatus::Waiting => {}
        }
        self.store.update(ROOMS, room_id, fields).await.map_err(|e| match e {
            StoreError::NotFound { id, .. } => ServiceError::not_found("room", id),
            other => other.into(),
        })?;
        info!(room_id, status = ?status, "room status changed");
        Ok(())
    }

    /// Deletes every submission of the room, then the room. Not atomic: when a
    /// submission delete fails the room is kept and the error says how many
    /// submissions were already removed.
    pub async fn delete_room(&self, room_id: &str) -> ServiceResult<()> {
        let submissions = self
            .store
            .query(&Query::collection(SUBMISSIONS).where_eq("roomId", room_id))
            .await?;
        let outcomes = join_all(submissions.iter().map(|s| self.store.delete(SUBMISSIONS, &s.id))).await;
        let failed = outcomes.iter().filter(|r| r.is_err()).count();
        if failed > 0 {
            for err in outcomes.iter().filter_map(|r| r.as_ref().err()) {
                warn!(room_id, "submission delete failed: {}", err);
            }
            return Err(ServiceError::PartialCascade {
                room_id: room_id.to_string(),
                deleted: outcomes.len() - failed,
                failed,
            });
        }

        self.store.delete(ROOMS, room_id).await?;
        info!(room_id, submissions = outcomes.len(), "room deleted");
        Ok(())
    }

    /// Live view of one room; `None` once it is deleted.
    pub fn subscribe<F>(&self, room_id: &str, on_change: F) -> Subscription
    where
        F: Fn(Option<Room>) + Send + Sync + 'static,
    {
        watch_document(self.store.clone(), ROOMS, room_id, move |snapshot| {
            match snapshot.map(|s| parse_room(&s.id, &s.data)).transpose() {
                Ok(room) => on_change(room),
                Err(err) => warn!("skipping room update: {}", err),
            }
        })
    }
}
