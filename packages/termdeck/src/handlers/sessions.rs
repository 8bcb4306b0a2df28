use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use termdeck_protocol::api::{CreateSessionRequest, RenameSessionRequest, SessionSummary};

use crate::AppState;
use crate::auth::AuthUser;
use crate::error::SessionError;

pub async fn list_sessions(
    State(state): State<AppState>,
    user: AuthUser,
) -> Json<Vec<SessionSummary>> {
    Json(state.registry.list_for_user(&user.owner_id).await)
}

pub async fn create_session(
    State(state): State<AppState>,
    user: AuthUser,
    Json(req): Json<CreateSessionRequest>,
) -> Result<Json<SessionSummary>, SessionError> {
    let summary = state
        .registry
        .create(
            &user.owner_id,
            std::path::Path::new(&req.working_dir),
            req.display_name.as_deref(),
        )
        .await?;
    Ok(Json(summary))
}

pub async fn get_session(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<SessionSummary>, SessionError> {
    Ok(Json(state.registry.get(&id, &user.owner_id).await?))
}

pub async fn rename_session(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
    Json(req): Json<RenameSessionRequest>,
) -> Result<StatusCode, SessionError> {
    state
        .registry
        .rename(&id, &user.owner_id, &req.display_name)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn delete_session(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<StatusCode, SessionError> {
    state.registry.destroy(&id, Some(&user.owner_id)).await?;
    Ok(StatusCode::NO_CONTENT)
}
