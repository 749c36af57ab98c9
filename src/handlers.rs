use crate::error::{AppError, ServiceError};
use crate::identity::Principal;
use crate::models::{AnswerMap, Exam, NewExam, NewRoom, NewSubmission, Role, Room, RoomStatus, Submission, User};
use crate::state::AppState;
use crate::store::Document;
use crate::subscription::Subscription;
use crate::ws_protocol::{WsEnvelope, RANKING_UPDATE, ROOM_UPDATE};
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use axum::Json;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

fn request_id_from_headers(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|h| h.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

fn service_err(req_id: &str) -> impl FnOnce(ServiceError) -> AppError + '_ {
    move |err| AppError::from_service(err, req_id)
}

fn not_found(entity: &str, req_id: &str) -> AppError {
    AppError::new(StatusCode::NOT_FOUND, "NOT_FOUND", format!("{entity} not found"), req_id)
}

fn require_session(state: &AppState, req_id: &str) -> Result<Principal, AppError> {
    state
        .identity
        .current_principal()
        .ok_or_else(|| AppError::from_service(ServiceError::NotSignedIn, req_id))
}

async fn require_admin(state: &AppState, req_id: &str) -> Result<Principal, AppError> {
    let principal = require_session(state, req_id)?;
    if !state.identity.is_admin(&principal.id).await.map_err(service_err(req_id))? {
        return Err(AppError::new(StatusCode::FORBIDDEN, "FORBIDDEN", "admin role required", req_id));
    }
    Ok(principal)
}

/// Entity with its store id, which the models keep out of their stored form.
#[derive(Debug, Serialize)]
pub struct Identified<T> {
    pub id: String,
    #[serde(flatten)]
    pub entity: T,
}

trait HasId {
    fn id(&self) -> &str;
}

impl HasId for User {
    fn id(&self) -> &str {
        &self.id
    }
}

impl HasId for Exam {
    fn id(&self) -> &str {
        &self.id
    }
}

impl HasId for Room {
    fn id(&self) -> &str {
        &self.id
    }
}

impl HasId for Submission {
    fn id(&self) -> &str {
        &self.id
    }
}

fn identified<T: HasId>(entity: T) -> Identified<T> {
    Identified {
        id: entity.id().to_string(),
        entity,
    }
}

#[derive(Debug, Serialize)]
pub struct ListResponse<T> {
    pub items: Vec<Identified<T>>,
    pub total: usize,
}

fn list<T: HasId>(entities: Vec<T>) -> ListResponse<T> {
    let items: Vec<_> = entities.into_iter().map(identified).collect();
    ListResponse {
        total: items.len(),
        items,
    }
}

#[derive(Debug, Serialize)]
pub struct IdResponse {
    pub id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeacherFilter {
    pub teacher_id: Option<String>,
}

impl TeacherFilter {
    /// Explicit `teacherId`, else the signed-in user.
    fn resolve(self, state: &AppState, req_id: &str) -> Result<String, AppError> {
        match self.teacher_id.filter(|t| !t.trim().is_empty()) {
            Some(id) => Ok(id),
            None => require_session(state, req_id).map(|p| p.id),
        }
    }
}

// ---- auth ----

pub async fn sign_in_teacher(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(profile): Json<Principal>,
) -> Result<Json<Identified<User>>, AppError> {
    let req_id = request_id_from_headers(&headers);
    let user = state
        .identity
        .sign_in_teacher(profile)
        .await
        .map_err(service_err(&req_id))?;
    Ok(Json(identified(user)))
}

pub async fn sign_in_student(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(profile): Json<Principal>,
) -> Result<Json<Identified<User>>, AppError> {
    let req_id = request_id_from_headers(&headers);
    let user = state
        .identity
        .sign_in_student(profile)
        .await
        .map_err(service_err(&req_id))?;
    Ok(Json(identified(user)))
}

pub async fn sign_in_guest(State(state): State<AppState>, headers: HeaderMap) -> Result<Json<Principal>, AppError> {
    let req_id = request_id_from_headers(&headers);
    let principal = state
        .identity
        .ensure_guest_signed_in()
        .await
        .map_err(service_err(&req_id))?;
    Ok(Json(principal))
}

pub async fn logout(State(state): State<AppState>, headers: HeaderMap) -> Result<StatusCode, AppError> {
    let req_id = request_id_from_headers(&headers);
    state.identity.sign_out().await.map_err(service_err(&req_id))?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn me(State(state): State<AppState>, headers: HeaderMap) -> Result<Json<Identified<User>>, AppError> {
    let req_id = request_id_from_headers(&headers);
    let user = state
        .identity
        .current_user()
        .await
        .map_err(service_err(&req_id))?
        .ok_or_else(|| AppError::from_service(ServiceError::NotSignedIn, &req_id))?;
    Ok(Json(identified(user)))
}

// ---- users ----

pub async fn list_users(State(state): State<AppState>, headers: HeaderMap) -> Result<Json<ListResponse<User>>, AppError> {
    let req_id = request_id_from_headers(&headers);
    require_admin(&state, &req_id).await?;
    let users = state.identity.list_users().await.map_err(service_err(&req_id))?;
    Ok(Json(list(users)))
}

pub async fn list_pending_users(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ListResponse<User>>, AppError> {
    let req_id = request_id_from_headers(&headers);
    require_admin(&state, &req_id).await?;
    let users = state.identity.list_pending_users().await.map_err(service_err(&req_id))?;
    Ok(Json(list(users)))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminCheck {
    pub is_admin: bool,
}

pub async fn is_admin(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
) -> Result<Json<AdminCheck>, AppError> {
    let req_id = request_id_from_headers(&headers);
    let is_admin = state.identity.is_admin(&user_id).await.map_err(service_err(&req_id))?;
    Ok(Json(AdminCheck { is_admin }))
}

pub async fn approve_user(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
) -> Result<StatusCode, AppError> {
    let req_id = request_id_from_headers(&headers);
    require_admin(&state, &req_id).await?;
    state.identity.approve(&user_id).await.map_err(service_err(&req_id))?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct RolePayload {
    pub role: Role,
}

pub async fn set_user_role(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
    Json(payload): Json<RolePayload>,
) -> Result<StatusCode, AppError> {
    let req_id = request_id_from_headers(&headers);
    require_admin(&state, &req_id).await?;
    state
        .identity
        .set_role(&user_id, payload.role)
        .await
        .map_err(service_err(&req_id))?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn reject_user(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
) -> Result<StatusCode, AppError> {
    let req_id = request_id_from_headers(&headers);
    require_admin(&state, &req_id).await?;
    state.identity.reject(&user_id).await.map_err(service_err(&req_id))?;
    Ok(StatusCode::NO_CONTENT)
}

// ---- exams ----

pub async fn create_exam(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(mut payload): Json<NewExam>,
) -> Result<(StatusCode, Json<IdResponse>), AppError> {
    let req_id = request_id_from_headers(&headers);
    let principal = require_session(&state, &req_id)?;
    if payload.created_by.trim().is_empty() {
        payload.created_by = principal.id;
    }
    let id = state.exams.create_exam(payload).await.map_err(service_err(&req_id))?;
    Ok((StatusCode::CREATED, Json(IdResponse { id })))
}

pub async fn list_exams(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(filter): Query<TeacherFilter>,
) -> Result<Json<ListResponse<Exam>>, AppError> {
    let req_id = request_id_from_headers(&headers);
    let teacher_id = filter.resolve(&state, &req_id)?;
    let exams = state
        .exams
        .get_exams_by_teacher(&teacher_id)
        .await
        .map_err(service_err(&req_id))?;
    Ok(Json(list(exams)))
}

pub async fn get_exam(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(exam_id): Path<String>,
) -> Result<Json<Identified<Exam>>, AppError> {
    let req_id = request_id_from_headers(&headers);
    let exam = state
        .exams
        .get_exam(&exam_id)
        .await
        .map_err(service_err(&req_id))?
        .ok_or_else(|| not_found("exam", &req_id))?;
    Ok(Json(identified(exam)))
}

pub async fn delete_exam(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(exam_id): Path<String>,
) -> Result<StatusCode, AppError> {
    let req_id = request_id_from_headers(&headers);
    require_session(&state, &req_id)?;
    state.exams.delete_exam(&exam_id).await.map_err(service_err(&req_id))?;
    Ok(StatusCode::NO_CONTENT)
}

// ---- rooms ----

pub async fn create_room(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<NewRoom>,
) -> Result<(StatusCode, Json<Identified<Room>>), AppError> {
    let req_id = request_id_from_headers(&headers);
    require_session(&state, &req_id)?;
    let room = state.rooms.create_room(payload).await.map_err(service_err(&req_id))?;
    Ok((StatusCode::CREATED, Json(identified(room))))
}

pub async fn list_rooms(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(filter): Query<TeacherFilter>,
) -> Result<Json<ListResponse<Room>>, AppError> {
    let req_id = request_id_from_headers(&headers);
    let teacher_id = filter.resolve(&state, &req_id)?;
    let rooms = state
        .rooms
        .get_rooms_by_teacher(&teacher_id)
        .await
        .map_err(service_err(&req_id))?;
    Ok(Json(list(rooms)))
}

pub async fn get_room_by_code(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(code): Path<String>,
) -> Result<Json<Identified<Room>>, AppError> {
    let req_id = request_id_from_headers(&headers);
    let room = state
        .rooms
        .get_room_by_code(&code)
        .await
        .map_err(service_err(&req_id))?
        .ok_or_else(|| not_found("room", &req_id))?;
    Ok(Json(identified(room)))
}

pub async fn get_room(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(room_id): Path<String>,
) -> Result<Json<Identified<Room>>, AppError> {
    let req_id = request_id_from_headers(&headers);
    let room = state
        .rooms
        .get_room(&room_id)
        .await
        .map_err(service_err(&req_id))?
        .ok_or_else(|| not_found("room", &req_id))?;
    Ok(Json(identified(room)))
}

pub async fn delete_room(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(room_id): Path<String>,
) -> Result<StatusCode, AppError> {
    let req_id = request_id_from_headers(&headers);
    require_session(&state, &req_id)?;
    state.rooms.delete_room(&room_id).await.map_err(service_err(&req_id))?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct StatusPayload {
    pub status: RoomStatus,
}

pub async fn update_room_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(room_id): Path<String>,
    Json(payload): Json<StatusPayload>,
) -> Result<StatusCode, AppError> {
    let req_id = request_id_from_headers(&headers);
    require_session(&state, &req_id)?;
    state
        .rooms
        .update_status(&room_id, payload.status)
        .await
        .map_err(service_err(&req_id))?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn room_submissions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(room_id): Path<String>,
) -> Result<Json<ListResponse<Submission>>, AppError> {
    let req_id = request_id_from_headers(&headers);
    let submissions = state
        .submissions
        .get_submissions_by_room(&room_id)
        .await
        .map_err(service_err(&req_id))?;
    Ok(Json(list(submissions)))
}

pub async fn student_submission(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((room_id, student_id)): Path<(String, String)>,
) -> Result<Json<Identified<Submission>>, AppError> {
    let req_id = request_id_from_headers(&headers);
    let submission = state
        .submissions
        .get_student_submission(&room_id, &student_id)
        .await
        .map_err(service_err(&req_id))?
        .ok_or_else(|| not_found("submission", &req_id))?;
    Ok(Json(identified(submission)))
}

// ---- submissions ----

pub async fn start_submission(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<NewSubmission>,
) -> Result<(StatusCode, Json<IdResponse>), AppError> {
    let req_id = request_id_from_headers(&headers);
    let id = state
        .submissions
        .start_submission(payload)
        .await
        .map_err(service_err(&req_id))?;
    Ok((StatusCode::CREATED, Json(IdResponse { id })))
}

pub async fn get_submission(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(submission_id): Path<String>,
) -> Result<Json<Identified<Submission>>, AppError> {
    let req_id = request_id_from_headers(&headers);
    let submission = state
        .submissions
        .get_submission(&submission_id)
        .await
        .map_err(service_err(&req_id))?
        .ok_or_else(|| not_found("submission", &req_id))?;
    Ok(Json(identified(submission)))
}

pub async fn update_submission(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(submission_id): Path<String>,
    Json(patch): Json<Document>,
) -> Result<StatusCode, AppError> {
    let req_id = request_id_from_headers(&headers);
    require_session(&state, &req_id)?;
    state
        .submissions
        .update_submission(&submission_id, patch)
        .await
        .map_err(service_err(&req_id))?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct SubmitPayload {
    #[serde(default)]
    pub answers: AnswerMap,
}

pub async fn submit_submission(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(submission_id): Path<String>,
    Json(payload): Json<SubmitPayload>,
) -> Result<Json<Identified<Submission>>, AppError> {
    let req_id = request_id_from_headers(&headers);
    let current = state
        .submissions
        .get_submission(&submission_id)
        .await
        .map_err(service_err(&req_id))?
        .ok_or_else(|| not_found("submission", &req_id))?;
    let exam = state
        .exams
        .get_exam(&current.exam_id)
        .await
        .map_err(service_err(&req_id))?
        .ok_or_else(|| not_found("exam", &req_id))?;
    let scored = state
        .submissions
        .finalize_submission(&submission_id, payload.answers, &exam)
        .await
        .map_err(service_err(&req_id))?;
    Ok(Json(identified(scored)))
}

// ---- live feeds ----

pub async fn room_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(room_id): Path<String>,
) -> Response {
    ws.on_upgrade(move |socket| async move {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = state.rooms.subscribe(&room_id, move |room| {
            let payload = match room.map(identified).map(serde_json::to_value).transpose() {
                Ok(payload) => payload.unwrap_or(Value::Null),
                Err(err) => {
                    warn!("room update not serializable: {}", err);
                    return;
                }
            };
            let _ = tx.send(WsEnvelope::push(ROOM_UPDATE, payload));
        });
        ws_session(socket, rx, subscription).await;
        debug!(room_id = %room_id, "room feed closed");
    })
}

pub async fn ranking_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(room_id): Path<String>,
) -> Response {
    ws.on_upgrade(move |socket| async move {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = state.ranking.subscribe(&room_id, move |ranked| {
            let items: Vec<_> = ranked.into_iter().map(identified).collect();
            match serde_json::to_value(items) {
                Ok(payload) => {
                    let _ = tx.send(WsEnvelope::push(RANKING_UPDATE, payload));
                }
                Err(err) => warn!("ranking update not serializable: {}", err),
            }
        });
        ws_session(socket, rx, subscription).await;
        debug!(room_id = %room_id, "ranking feed closed");
    })
}

/// Forwards feed events to the socket until the client goes away, then
/// cancels the feed.
async fn ws_session(stream: WebSocket, mut events: mpsc::UnboundedReceiver<WsEnvelope>, subscription: Subscription) {
    let (mut sender_ws, mut receiver_ws) = stream.split();

    let send_task = tokio::spawn(async move {
        while let Some(msg) = events.recv().await {
            if let Ok(text) = serde_json::to_string(&msg) {
                if sender_ws.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
        }
    });

    // Feeds are push-only; client frames other than close are ignored.
    while let Some(Ok(message)) = receiver_ws.next().await {
        if let Message::Close(_) = message {
            break;
        }
    }

    subscription.cancel();
    send_task.abort();
}
