//! Session tokens exchange.

use axum::Json;
use axum::extract::State;
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::AppState;
use crate::error::Result;
use crate::router::Valid;

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct Credentials {
    #[validate(required(message = "This field is required."))]
    pub email: Option<String>,
    #[validate(required(message = "This field is required."))]
    pub password: Option<String>,
}

/// Access and refresh tokens.
#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct Pair {
    pub access: String,
    pub refresh: String,
}

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct RefreshBody {
    #[validate(required(message = "This field is required."))]
    pub refresh: Option<String>,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct Access {
    pub access: String,
}

/// Exchange credentials for a token pair.
///
/// Unlike `/api/login/`, accounts with an unverified email are accepted.
pub async fn obtain(
    State(state): State<AppState>,
    Valid(body): Valid<Credentials>,
) -> Result<Json<Pair>> {
    let pair = state
        .accounts
        .obtain_pair(
            body.email.as_deref().unwrap_or_default(),
            body.password.as_deref().unwrap_or_default(),
        )
        .await?;

    Ok(Json(Pair {
        access: pair.access,
        refresh: pair.refresh.token,
    }))
}

/// Get a new access token with a refresh token.
pub async fn refresh(
    State(state): State<AppState>,
    Valid(body): Valid<RefreshBody>,
) -> Result<Json<Access>> {
    let access = state
        .accounts
        .refresh(body.refresh.as_deref().unwrap_or_default())
        .await?;

    Ok(Json(Access { access }))
}

#[cfg(test)]
mod tests {
    use axum::http::{Method, StatusCode};
    use serde_json::json;

    use crate::token::TokenType;
    use crate::{app, json_body, make_request, register, test_state};

    #[tokio::test]
    async fn test_obtain_pair_unverified() {
        let (state, _) = test_state();
        let app = app(state.clone());
        register(&app, "a@x.com").await;

        let response = make_request(
            app.clone(),
            Method::POST,
            "/api/token/",
            None,
            json!({ "email": "a@x.com", "password": "StrongPass1" }).to_string(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = json_body(response).await;
        let tokens = state.accounts.tokens();
        assert!(
            tokens
                .decode(body["access"].as_str().unwrap(), TokenType::Access)
                .is_ok()
        );
        assert!(
            tokens
                .decode(body["refresh"].as_str().unwrap(), TokenType::Refresh)
                .is_ok()
        );

        let response = make_request(
            app,
            Method::POST,
            "/api/token/",
            None,
            json!({ "email": "a@x.com", "password": "WrongPass1" }).to_string(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            json_body(response).await,
            json!({ "detail": "No active account found with the given credentials." })
        );
    }

    #[tokio::test]
    async fn test_refresh() {
        let (state, _) = test_state();
        let app = app(state.clone());
        let registered = register(&app, "a@x.com").await;

        let response = make_request(
            app.clone(),
            Method::POST,
            "/api/token/refresh/",
            None,
            json!({ "refresh": registered["refresh"] }).to_string(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = json_body(response).await;
        let claims = state
            .accounts
            .tokens()
            .decode(body["access"].as_str().unwrap(), TokenType::Access)
            .unwrap();
        assert_eq!(claims.user_id(), registered["user"]["id"].as_i64());
        assert!(body.get("refresh").is_none());

        // Access tokens are not refresh tokens.
        let response = make_request(
            app.clone(),
            Method::POST,
            "/api/token/refresh/",
            None,
            json!({ "refresh": registered["access"] }).to_string(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            json_body(response).await,
            json!({ "detail": "Token is invalid or expired" })
        );

        let response =
            make_request(app, Method::POST, "/api/token/refresh/", None, "{}".into())
                .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            json_body(response).await,
            json!({ "refresh": ["This field is required."] })
        );
    }
}
