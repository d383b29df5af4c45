//! Read-only session diagnostics.
//!
//! GET /api/v1/sessions
//! GET /api/v1/sessions/{id}

use crate::{error::{AppError, AppResult}, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

/// List every live session (active or closing).
///
/// The listing is a point-in-time view assembled shard by shard; good enough for
/// diagnostics, not a consistent snapshot.
pub async fn list_sessions(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let sessions = state.coordinator.registry().list();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "count": sessions.len(),
        "sessions": sessions
    })))
}

/// Existence and member count of one session.
///
/// Unknown ids are not an error here: the answer is simply `exists: false`.
pub async fn get_session(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    let session_id = path.into_inner();
    if session_id.trim().is_empty() {
        return Err(AppError::ValidationError("Session id must not be empty".to_string()));
    }

    let session = state.coordinator.registry().get(&session_id);
    let (exists, member_count, status) = match &session {
        Some(session) => (session.is_active(), session.member_count(), session.state().as_str()),
        None => (false, 0, "removed"),
    };

    Ok(HttpResponse::Ok().json(json!({
        "sessionId": session_id,
        "exists": exists,
        "memberCount": member_count,
        "status": status,
        "createdAt": session.as_ref().map(|s| s.created_at())
    })))
}
