//! HTTP API over the control surface.

use std::io;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use super::ControlSurface;
use crate::error::ControlError;
use crate::options::{RawOptions, RawValue};

/// One problem with a request.
#[derive(Debug, Serialize)]
pub struct FieldError {
    pub location: &'static str,
    pub name: String,
    pub description: String,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub errors: Vec<FieldError>,
}

impl ApiError {
    /// A 400 about the body field `name`.
    pub fn bad_request(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            errors: vec![FieldError {
                location: "body",
                name: name.into(),
                description: description.into(),
            }],
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({ "status": "error", "errors": self.errors });
        (self.status, Json(body)).into_response()
    }
}

impl From<ControlError> for ApiError {
    fn from(err: ControlError) -> Self {
        match &err {
            ControlError::UnknownBehavior(_) => ApiError::bad_request("name", err.to_string()),
            ControlError::InvalidOption(e) => ApiError::bad_request(e.option(), err.to_string()),
        }
    }
}

/// Create the control router.
pub fn router(surface: Arc<ControlSurface>) -> Router {
    Router::new()
        .route("/behaviors", get(list_behaviors))
        .route(
            "/behavior",
            get(get_behavior).post(set_behavior).put(set_behavior),
        )
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .with_state(surface)
}

/// Serve the control API until `shutdown` is cancelled.
pub async fn serve(
    listener: TcpListener,
    surface: Arc<ControlSurface>,
    shutdown: CancellationToken,
) -> io::Result<()> {
    info!(addr = %listener.local_addr()?, "Control server started");
    axum::serve(listener, router(surface))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

async fn list_behaviors(State(surface): State<Arc<ControlSurface>>) -> Json<Value> {
    Json(json!({ "behaviors": surface.behavior_names() }))
}

async fn get_behavior(State(surface): State<Arc<ControlSurface>>) -> Json<Value> {
    Json(json!({ "behavior": surface.active_behavior_name() }))
}

async fn set_behavior(
    State(surface): State<Arc<ControlSurface>>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let (name, options) = parse_request(&body)?;
    surface.set_active_behavior(&name, &options)?;
    Ok(Json(json!({ "status": "ok" })))
}

/// Split `{"name": ..., <option>: <value>, ...}` into the name and options.
fn parse_request(body: &[u8]) -> Result<(String, RawOptions), ApiError> {
    let Ok(Value::Object(mut fields)) = serde_json::from_slice::<Value>(body) else {
        return Err(ApiError::bad_request("name", "expected a JSON object"));
    };
    let name = match fields.remove("name") {
        Some(Value::String(name)) => name,
        Some(_) => return Err(ApiError::bad_request("name", "name must be a string")),
        None => return Err(ApiError::bad_request("name", "name is required")),
    };
    let options = fields
        .iter()
        .map(|(key, value)| (key.clone(), RawValue::from(value)))
        .collect();
    Ok((name, options))
}

async fn healthz() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "mayhem",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::behavior::BehaviorRegistry;
    use axum::body::Body;
    use axum::http::{header::CONTENT_TYPE, Method, Request};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rstest::rstest;
    use tower::ServiceExt;

    fn app() -> Router {
        let registry = BehaviorRegistry::builtin(&mut StdRng::seed_from_u64(0));
        router(Arc::new(
            ControlSurface::new(Arc::new(registry), "dummy").unwrap(),
        ))
    }

    async fn call(app: &Router, method: Method, uri: &str, body: &str) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_list_behaviors_sorted() {
        let (status, body) = call(&app(), Method::GET, "/behaviors", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body["behaviors"],
            json!(["abort", "blackout", "delay", "dummy", "error", "hang", "transient"])
        );
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let app = app();
        let (status, body) =
            call(&app, Method::PUT, "/behavior", r#"{"name":"blackout"}"#).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "status": "ok" }));

        let (_, body) = call(&app, Method::GET, "/behavior", "").await;
        assert_eq!(body["behavior"], "blackout");
    }

    #[tokio::test]
    async fn test_post_with_options() {
        let app = app();
        let (status, _) = call(
            &app,
            Method::POST,
            "/behavior",
            r#"{"name":"delay","sleep":0.5,"before":false}"#,
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (_, body) = call(&app, Method::GET, "/behavior", "").await;
        assert_eq!(body["behavior"], "delay");
    }

    #[rstest]
    #[case(r#"{"name":"nonexistent"}"#, "name")]
    #[case(r#"{"sleep":1}"#, "name")]
    #[case(r#"{"name":7}"#, "name")]
    #[case(r#"[1, 2]"#, "name")]
    #[case("not json", "name")]
    #[case(r#"{"name":"delay","sleep":"long"}"#, "sleep")]
    #[case(r#"{"name":"delay","volume":11}"#, "volume")]
    #[tokio::test]
    async fn test_bad_requests(#[case] body: &str, #[case] field: &str) {
        let app = app();
        let (status, response) = call(&app, Method::PUT, "/behavior", body).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(response["status"], "error");
        assert_eq!(response["errors"][0]["location"], "body");
        assert_eq!(response["errors"][0]["name"], field);

        let (_, current) = call(&app, Method::GET, "/behavior", "").await;
        assert_eq!(current["behavior"], "dummy");
    }

    #[tokio::test]
    async fn test_healthz() {
        let (status, body) = call(&app(), Method::GET, "/healthz", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["service"], "mayhem");
    }
}
