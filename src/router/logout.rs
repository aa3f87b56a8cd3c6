//! Close a session by blacklisting its refresh token.

use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::{Extension, Json};
use serde::{Deserialize, Serialize};

use crate::error::{Result, ServerError};
use crate::user::User;
use crate::AppState;

#[derive(Debug, Serialize, Deserialize)]
pub struct Body {
    refresh: Option<String>,
}

/// Handler to log out.
///
/// Any failure, including an unreadable body, is a bare `400 Bad Request`.
pub async fn handler(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    body: std::result::Result<Json<Body>, JsonRejection>,
) -> Result<StatusCode> {
    let refresh = body
        .ok()
        .and_then(|Json(body)| body.refresh)
        .ok_or(ServerError::BadRequest)?;

    state.accounts.logout(&user, &refresh).await?;

    Ok(StatusCode::NO_CONTENT)
}
