//! Account lifecycle API: registration, email verification, sessions and
//! profile management.

#![forbid(unsafe_code)]

pub mod account;
pub mod activation;
pub mod blacklist;
pub mod config;
pub mod crypto;
pub mod database;
pub mod error;
pub mod mail;
mod router;
pub mod telemetry;
pub mod token;
pub mod user;

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::http::{Method, StatusCode, header};
use axum::routing::get;
use axum::{Router, middleware as AxumMiddleware};
use error::ServerError;
use metrics_exporter_prometheus::PrometheusHandle;
use tower::ServiceBuilder;
use tower_http::LatencyUnit;
use tower_http::cors::{Any, CorsLayer};
use tower_http::sensitive_headers::SetSensitiveHeadersLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::{
    DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer,
};

use crate::account::AccountService;
use crate::blacklist::{MemoryTokenBlacklist, PgTokenBlacklist, TokenBlacklist};
use crate::mail::{Dispatch, LogTransport, MailManager, SmtpTransport, Transport};
use crate::user::{MemoryUserRepository, PgUserRepository, UserRepository};

const SECRET_KEY_VAR: &str = "SECRET_KEY";

/// State sharing between routes.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<config::Configuration>,
    pub accounts: Arc<AccountService>,
    pub metrics: Option<PrometheusHandle>,
}

/// Create router.
pub fn app(state: AppState) -> Router {
    let middleware = ServiceBuilder::new()
        // Add high level tracing/logging to all requests.
        .layer(
            TraceLayer::new_for_http()
                .on_body_chunk(|chunk: &Bytes, latency: Duration, _span: &tracing::Span| {
                    tracing::trace!(size_bytes = chunk.len(), latency = ?latency, "sending body chunk")
                })
                .make_span_with(DefaultMakeSpan::new().include_headers(true).level(tracing::Level::INFO))
                .on_request(DefaultOnRequest::new())
                .on_response(DefaultOnResponse::new().include_headers(true).latency_unit(LatencyUnit::Micros)),
        )
        // Set a timeout.
        .layer(TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, Duration::from_secs(10)))
        // Remove senstive headers from trace.
        .layer(SetSensitiveHeadersLayer::new([header::AUTHORIZATION, header::COOKIE]))
        // Add CORS preflight support.
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET, Method::POST, Method::PUT, Method::PATCH, Method::OPTIONS])
                .allow_headers(Any)
                .vary([header::AUTHORIZATION]),
        );

    Router::new()
        // `GET /status.json` goes to `status`.
        .route("/status.json", get(router::status::status))
        // `GET /metrics` goes to Prometheus exporter.
        .route("/metrics", get(telemetry::metrics))
        .nest("/api", router::router(state.clone()))
        .with_state(state)
        .route_layer(AxumMiddleware::from_fn(telemetry::track))
        .layer(middleware)
}

/// Initialize the application state.
///
/// Falls back on in-memory stores without `postgres` entry and on logged
/// emails without `mail` entry.
pub async fn initialize_state(
    config: Arc<config::Configuration>,
) -> Result<AppState, Box<dyn std::error::Error>> {
    let secret = std::env::var(SECRET_KEY_VAR)
        .map_err(|_| format!("missing `{SECRET_KEY_VAR}` environment variable"))?;

    let (users, blacklist): (Arc<dyn UserRepository>, Arc<dyn TokenBlacklist>) =
        match &config.postgres {
            Some(postgres) => {
                let db = database::Database::new(postgres).await?;
                // execute migrations scripts on start.
                db.migrate().await?;

                (
                    Arc::new(PgUserRepository::new(db.postgres.clone())),
                    Arc::new(PgTokenBlacklist::new(db.postgres)),
                )
            },
            None => {
                tracing::warn!(
                    "missing `postgres` entry on `config.yaml` file, data is kept in memory"
                );
                (
                    Arc::new(MemoryUserRepository::new()),
                    Arc::new(MemoryTokenBlacklist::new()),
                )
            },
        };

    let transport: Arc<dyn Transport> = match &config.mail {
        Some(mail) => Arc::new(SmtpTransport::new(mail)?),
        None => {
            tracing::warn!("missing `mail` entry on `config.yaml` file, emails are logged");
            Arc::new(LogTransport)
        },
    };
    let mail = MailManager::start(
        Arc::clone(&users),
        transport,
        Dispatch::from(config.mail.as_ref()),
    );

    let crypto = crypto::Crypto::new(config.argon2.clone(), secret)?;
    let accounts = AccountService::new(&config, users, blacklist, crypto, mail)?;

    Ok(AppState {
        config,
        accounts: Arc::new(accounts),
        metrics: None,
    })
}

/// In-memory state with a recording mail transport.
#[cfg(test)]
pub(crate) fn test_state() -> (AppState, Arc<mail::RecordingTransport>) {
    let mut config = config::Configuration::default();
    config.url = "https://accounts.test/".into();
    let config = Arc::new(config);
    let users: Arc<dyn UserRepository> = Arc::new(MemoryUserRepository::new());
    let transport = Arc::new(mail::RecordingTransport::default());
    let mail = MailManager::start(
        Arc::clone(&users),
        transport.clone(),
        Dispatch {
            retry_delay: Duration::ZERO,
            ..Default::default()
        },
    );
    let crypto =
        crypto::Crypto::new(Some(crypto::light_argon2()), "test-secret").unwrap();
    let accounts = AccountService::new(
        &config,
        users,
        Arc::new(MemoryTokenBlacklist::new()),
        crypto,
        mail,
    )
    .unwrap();

    (
        AppState {
            config,
            accounts: Arc::new(accounts),
            metrics: None,
        },
        transport,
    )
}

/// MUST NEVER be used in production.
#[cfg(test)]
pub async fn make_request(
    app: Router,
    method: Method,
    path: &str,
    token: Option<&str>,
    body: String,
) -> axum::http::Response<axum::body::Body> {
    use axum::extract::Request;
    use tower::util::ServiceExt;

    let mut request = Request::builder()
        .method(method)
        .uri(path)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = token {
        request = request.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }

    app.oneshot(request.body(axum::body::Body::from(body)).unwrap())
        .await
        .unwrap()
}

#[cfg(test)]
pub(crate) async fn json_body(
    response: axum::http::Response<axum::body::Body>,
) -> serde_json::Value {
    use http_body_util::BodyExt;

    let body = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&body).unwrap()
}

/// Register `email` with name `A` and password `StrongPass1`.
#[cfg(test)]
pub(crate) async fn register(app: &Router, email: &str) -> serde_json::Value {
    let response = make_request(
        app.clone(),
        Method::POST,
        "/api/register/",
        None,
        serde_json::json!({ "email": email, "name": "A", "password": "StrongPass1" })
            .to_string(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    json_body(response).await
}

/// Path of the activation link mailed to `to`.
#[cfg(test)]
pub(crate) async fn activation_path(
    transport: &mail::RecordingTransport,
    to: &str,
) -> String {
    const PREFIX: &str = "/api/activate/";

    for _ in 0..200 {
        let email = transport.sent().into_iter().find(|email| email.to == to);
        if let Some(email) = email {
            let start = email.body.find(PREFIX).unwrap();
            return email.body[start..]
                .split_whitespace()
                .next()
                .unwrap()
                .to_owned();
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    panic!("no activation email sent to {to}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_end_to_end() {
        let (state, transport) = test_state();
        let app = app(state);

        let registered = register(&app, "a@x.com").await;
        let access = registered["access"].as_str().unwrap();

        let response = make_request(
            app.clone(),
            Method::GET,
            "/api/profile/",
            Some(access),
            String::new(),
        )
        .await;
        assert_eq!(
            json_body(response).await,
            serde_json::json!({ "email": "a@x.com", "name": "A" })
        );

        let response = make_request(
            app.clone(),
            Method::PUT,
            "/api/profile/",
            Some(access),
            serde_json::json!({ "name": "B" }).to_string(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        let path = activation_path(&transport, "a@x.com").await;
        let response =
            make_request(app.clone(), Method::GET, &path, None, String::new()).await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = make_request(
            app.clone(),
            Method::POST,
            "/api/login/",
            None,
            serde_json::json!({ "email": "a@x.com", "password": "StrongPass1" })
                .to_string(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let session = json_body(response).await;

        let response = make_request(
            app.clone(),
            Method::GET,
            "/api/profile/",
            Some(session["access"].as_str().unwrap()),
            String::new(),
        )
        .await;
        assert_eq!(
            json_body(response).await,
            serde_json::json!({ "email": "a@x.com", "name": "B" })
        );
    }

    #[tokio::test]
    async fn test_unknown_route() {
        let (state, _) = test_state();

        let response =
            make_request(app(state), Method::GET, "/api/unknown/", None, String::new())
                .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
