use crate::handlers;
use crate::state::AppState;
use axum::http::{HeaderValue, Method};
use axum::routing::{delete, get, post, put};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

fn cors_layer(origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!("ignoring invalid CORS origin {}", origin);
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_credentials(true)
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::PATCH, Method::DELETE])
        .allow_headers([
            axum::http::header::CONTENT_TYPE,
            axum::http::header::ACCEPT,
            axum::http::HeaderName::from_static("x-request-id"),
        ])
}

pub fn build_router(state: AppState) -> Router {
    let cors = cors_layer(&state.config.cors_origins);

    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/api/v1/auth/teacher", post(handlers::sign_in_teacher))
        .route("/api/v1/auth/student", post(handlers::sign_in_student))
        .route("/api/v1/auth/guest", post(handlers::sign_in_guest))
        .route("/api/v1/auth/logout", post(handlers::logout))
        .route("/api/v1/auth/me", get(handlers::me))
        .route("/api/v1/users", get(handlers::list_users))
        .route("/api/v1/users/pending", get(handlers::list_pending_users))
        .route("/api/v1/users/:id", delete(handlers::reject_user))
        .route("/api/v1/users/:id/admin", get(handlers::is_admin))
        .route("/api/v1/users/:id/approve", post(handlers::approve_user))
        .route("/api/v1/users/:id/role", put(handlers::set_user_role))
        .route("/api/v1/exams", post(handlers::create_exam).get(handlers::list_exams))
        .route("/api/v1/exams/:id", get(handlers::get_exam).delete(handlers::delete_exam))
        .route("/api/v1/rooms", post(handlers::create_room).get(handlers::list_rooms))
        .route("/api/v1/rooms/code/:code", get(handlers::get_room_by_code))
        .route("/api/v1/rooms/:id", get(handlers::get_room).delete(handlers::delete_room))
        .route("/api/v1/rooms/:id/status", put(handlers::update_room_status))
        .route("/api/v1/rooms/:id/submissions", get(handlers::room_submissions))
        .route(
            "/api/v1/rooms/:id/students/:student_id/submission",
            get(handlers::student_submission),
        )
        .route("/api/v1/submissions", post(handlers::start_submission))
        .route(
            "/api/v1/submissions/:id",
            get(handlers::get_submission).patch(handlers::update_submission),
        )
        .route("/api/v1/submissions/:id/submit", post(handlers::submit_submission))
        .route("/ws/rooms/:id", get(handlers::room_ws_handler))
        .route("/ws/rooms/:id/ranking", get(handlers::ranking_ws_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}
