//! Change the password of the current user.

use axum::extract::State;
use axum::{Extension, Json};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::error::Result;
use crate::router::Valid;
use crate::router::activate::Response;
use crate::user::User;
use crate::AppState;

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct Body {
    #[validate(required(message = "This field is required."))]
    pub old_password: Option<String>,
    #[validate(required(message = "This field is required."))]
    pub new_password: Option<String>,
}

/// Handler to update password.
pub async fn handler(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Valid(body): Valid<Body>,
) -> Result<Json<Response>> {
    state
        .accounts
        .change_password(
            &user,
            body.old_password.as_deref().unwrap_or_default(),
            body.new_password.as_deref().unwrap_or_default(),
        )
        .await?;

    Ok(Json(Response {
        detail: "Password updated successfully.".to_owned(),
    }))
}

#[cfg(test)]
mod tests {
    use axum::http::{Method, StatusCode};
    use serde_json::json;

    use crate::{app, json_body, make_request, register, test_state};

    #[tokio::test]
    async fn test_change_password_handler() {
        let (state, _) = test_state();
        let app = app(state);
        let registered = register(&app, "a@x.com").await;
        let access = registered["access"].as_str().unwrap();

        let response = make_request(
            app.clone(),
            Method::PUT,
            "/api/change-password/",
            Some(access),
            json!({ "old_password": "WrongPass1", "new_password": "NewStrong1" })
                .to_string(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            json_body(response).await,
            json!({ "old_password": ["Wrong password."] })
        );

        let response = make_request(
            app.clone(),
            Method::PUT,
            "/api/change-password/",
            Some(access),
            "{}".into(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            json_body(response).await,
            json!({
                "old_password": ["This field is required."],
                "new_password": ["This field is required."],
            })
        );

        let response = make_request(
            app.clone(),
            Method::PUT,
            "/api/change-password/",
            Some(access),
            json!({ "old_password": "StrongPass1", "new_password": "NewStrong1" })
                .to_string(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            json_body(response).await,
            json!({ "detail": "Password updated successfully." })
        );

        // Old password no longer works, new one does.
        let response = make_request(
            app.clone(),
            Method::POST,
            "/api/token/",
            None,
            json!({ "email": "a@x.com", "password": "StrongPass1" }).to_string(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = make_request(
            app,
            Method::POST,
            "/api/token/",
            None,
            json!({ "email": "a@x.com", "password": "NewStrong1" }).to_string(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
    }
}
