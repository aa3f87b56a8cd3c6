//! Open a session.

use axum::Json;
use axum::extract::State;

use crate::AppState;
use crate::error::Result;
use crate::router::Valid;
use crate::router::token::{Credentials, Pair};

/// Handler to log a verified user in.
pub async fn handler(
    State(state): State<AppState>,
    Valid(body): Valid<Credentials>,
) -> Result<Json<Pair>> {
    let pair = state
        .accounts
        .login(
            body.email.as_deref().unwrap_or_default(),
            body.password.as_deref().unwrap_or_default(),
        )
        .await?;

    Ok(Json(Pair {
        access: pair.access,
        refresh: pair.refresh.token,
    }))
}
