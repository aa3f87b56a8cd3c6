//! Create a new account.

use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationErrors};

use crate::AppState;
use crate::account::PasswordPolicy;
use crate::error::Result;
use crate::user::User;

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct Body {
    #[validate(
        required(message = "This field is required."),
        email(message = "Enter a valid email address.")
    )]
    pub email: Option<String>,
    #[validate(
        required(message = "This field is required."),
        custom(function = "crate::router::not_blank"),
        length(max = 255, message = "Ensure this field has no more than 255 characters.")
    )]
    pub name: Option<String>,
    #[validate(required(message = "This field is required."))]
    pub password: Option<String>,
}

impl Body {
    /// Run field rules and the password policy in a single pass, so every
    /// invalid field is reported at once.
    fn validate_with(&self, policy: &PasswordPolicy) -> std::result::Result<(), ValidationErrors> {
        let mut errors = self.validate().err().unwrap_or_default();

        if let Some(password) = self.password.as_deref() {
            let user_inputs: Vec<&str> = [self.email.as_deref(), self.name.as_deref()]
                .into_iter()
                .flatten()
                .collect();

            if let Some(issue) = policy.issue(password, &user_inputs) {
                errors.add("password", issue);
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub user: User,
    pub access: String,
    pub refresh: String,
}

/// Handler to create user.
pub async fn handler(
    State(state): State<AppState>,
    body: std::result::Result<Json<Body>, JsonRejection>,
) -> Result<(StatusCode, Json<Response>)> {
    let Json(body) = body?;
    body.validate_with(state.accounts.policy())?;

    let registered = state
        .accounts
        .register(
            body.email.as_deref().unwrap_or_default(),
            body.name.as_deref().unwrap_or_default(),
            body.password.as_deref().unwrap_or_default(),
        )
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(Response {
            user: registered.user,
            access: registered.tokens.access,
            refresh: registered.tokens.refresh.token,
        }),
    ))
}
