//! Get and update the profile of the current user.

use axum::extract::State;
use axum::{Extension, Json};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::error::Result;
use crate::router::Valid;
use crate::user::User;
use crate::AppState;

/// Public part of a [`User`].
#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub email: String,
    pub name: String,
}

impl From<User> for Profile {
    fn from(user: User) -> Self {
        Self {
            email: user.email,
            name: user.name,
        }
    }
}

/// Full update. `email` is read-only and ignored.
#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct PutBody {
    #[validate(
        required(message = "This field is required."),
        custom(function = "crate::router::not_blank"),
        length(max = 255, message = "Ensure this field has no more than 255 characters.")
    )]
    pub name: Option<String>,
}

/// Partial update. `email` is read-only and ignored.
#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct PatchBody {
    #[validate(
        custom(function = "crate::router::not_blank"),
        length(max = 255, message = "Ensure this field has no more than 255 characters.")
    )]
    pub name: Option<String>,
}

pub async fn get(Extension(user): Extension<User>) -> Json<Profile> {
    Json(user.into())
}

pub async fn put(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Valid(body): Valid<PutBody>,
) -> Result<Json<Profile>> {
    let user = state.accounts.update_profile(user, body.name.as_deref()).await?;
    Ok(Json(user.into()))
}

pub async fn patch(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Valid(body): Valid<PatchBody>,
) -> Result<Json<Profile>> {
    let user = state.accounts.update_profile(user, body.name.as_deref()).await?;
    Ok(Json(user.into()))
}
