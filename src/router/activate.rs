//! Email verification through activation links.

use axum::Json;
use axum::extract::{Path, State};
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::error::Result;

#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub detail: String,
}

/// Handler to activate an account.
pub async fn handler(
    State(state): State<AppState>,
    Path((uid, token)): Path<(String, String)>,
) -> Result<Json<Response>> {
    state.accounts.activate(&uid, &token).await?;

    Ok(Json(Response {
        detail: "Account activated successfully".to_owned(),
    }))
}
