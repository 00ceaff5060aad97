use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use tracing::info;

use crate::error::Error;
use crate::gateway_util::{AppState, AppStateData};
use crate::session_memory::SessionMemorySnapshot;

/// A handler for `GET /sessions/{user_id}/snapshot`
pub async fn snapshot_handler(
    State(AppStateData { session_memory, .. }): AppState,
    Path(user_id): Path<String>,
) -> Result<Json<SessionMemorySnapshot>, Error> {
    Ok(Json(session_memory.get_snapshot(&user_id).await?))
}

/// A handler for `DELETE /sessions/{user_id}/cache`, called on logout
pub async fn invalidate_user_handler(
    State(AppStateData { session_memory, .. }): AppState,
    Path(user_id): Path<String>,
) -> StatusCode {
    session_memory.invalidate(Some(&user_id)).await;
    StatusCode::NO_CONTENT
}

/// A handler for `DELETE /admin/sessions/cache`
pub async fn clear_cache_handler(
    State(AppStateData { session_memory, .. }): AppState,
) -> StatusCode {
    session_memory.invalidate(None).await;
    info!("Cleared session memory cache");
    StatusCode::NO_CONTENT
}
