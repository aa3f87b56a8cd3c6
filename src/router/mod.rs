//! HTTP API.

pub mod activate;
pub mod login;
pub mod logout;
pub mod password;
pub mod profile;
pub mod register;
pub mod status;
pub mod token;

use axum::extract::{FromRequest, Request, State};
use axum::http::header;
use axum::response::Response;
use axum::routing::{get, post, put};
use axum::{Json, Router, middleware};
use serde::de::DeserializeOwned;
use validator::{Validate, ValidationError};

use crate::user::User;
use crate::{AppState, ServerError};

const BEARER: &str = "Bearer ";

/// JSON body checked with [`Validate`] before reaching handler.
#[derive(Debug, Clone, Copy, Default)]
pub struct Valid<T>(pub T);

impl<T, S> FromRequest<S> for Valid<T>
where
    T: DeserializeOwned + Validate,
    S: Send + Sync,
{
    type Rejection = ServerError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state).await?;
        value.validate()?;
        Ok(Valid(value))
    }
}

/// Reject blank strings, as an empty field is not a provided field.
pub(crate) fn not_blank(value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::new("blank")
            .with_message("This field may not be blank.".into()));
    }

    Ok(())
}

/// Custom middleware for authentification.
///
/// Resolve `Authorization: Bearer <access>` into a [`User`] extension.
async fn auth(
    State(state): State<AppState>,
    mut req: Request,
    next: middleware::Next,
) -> Result<Response, ServerError> {
    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|header| header.to_str().ok())
        .and_then(|header| header.strip_prefix(BEARER))
        .ok_or(ServerError::Unauthorized)?;

    let user = state.accounts.authenticate(token.trim()).await?;

    req.extensions_mut().insert::<User>(user);
    Ok(next.run(req).await)
}

/// Routes mounted under `/api`.
pub fn router(state: AppState) -> Router<AppState> {
    let protected = Router::new()
        // `POST /api/logout/` goes to `logout`.
        .route("/logout/", post(logout::handler))
        // `PUT /api/change-password/` goes to `password`.
        .route("/change-password/", put(password::handler))
        // `GET|PUT|PATCH /api/profile/` goes to `profile`.
        .route(
            "/profile/",
            get(profile::get).put(profile::put).patch(profile::patch),
        )
        .route_layer(middleware::from_fn_with_state(state, auth));

    Router::new()
        .route("/register/", post(register::handler))
        .route("/login/", post(login::handler))
        .route("/activate/{uid}/{token}/", get(activate::handler))
        .route("/token/", post(token::obtain))
        .route("/token/refresh/", post(token::refresh))
        .merge(protected)
}
