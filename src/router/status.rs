//! Public instance status for front-end identification.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use serde::Serialize;

use crate::config::Configuration;

/// Structured status.
#[derive(Serialize)]
pub struct Status {
    name: String,
    url: String,
    version: String,
}

/// Public server status.
pub async fn status(State(config): State<Arc<Configuration>>) -> Json<Status> {
    Json(Status {
        name: config.name.clone(),
        url: config.url.clone(),
        version: config.version().to_owned(),
    })
}

#[cfg(test)]
mod tests {
    use axum::http::{Method, StatusCode};

    use crate::{app, json_body, make_request, test_state};

    #[tokio::test]
    async fn test_status() {
        let (state, _) = test_state();
        let app = app(state.clone());

        let response =
            make_request(app, Method::GET, "/status.json", None, String::new()).await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = json_body(response).await;
        assert_eq!(body["name"], state.config.name);
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    }
}
