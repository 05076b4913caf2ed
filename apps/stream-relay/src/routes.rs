use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State, WebSocketUpgrade},
    http::{header, StatusCode},
    middleware::{self, from_fn_with_state},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    auth, metrics,
    publisher::PublishError,
    rate_gate,
    results::serve_results,
    session::SessionError,
    state::AppState,
};

/// Key attached to every message written through the send route.
pub const MESSAGE_KEY: &[u8] = b"key";

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(&'static str),
    #[error("Unauthorized: Invalid API key")]
    Unauthorized,
    #[error("Too Many Requests")]
    RateLimited,
    #[error("Failed to initialize Kafka producer")]
    ResourceUnavailable(#[source] SessionError),
    #[error("Failed to send data to Kafka: {0}")]
    DeliveryFailed(#[source] PublishError),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ApiError::ResourceUnavailable(_) | ApiError::DeliveryFailed(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn category(&self) -> &'static str {
        match self {
            ApiError::Validation(_) => "validation_error",
            ApiError::Unauthorized => "unauthorized",
            ApiError::RateLimited => "rate_limited",
            ApiError::ResourceUnavailable(_) => "resource_unavailable",
            ApiError::DeliveryFailed(_) => "delivery_failed",
        }
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::EmptyStreamId => ApiError::Validation(INVALID_STREAM_ID),
            other => ApiError::ResourceUnavailable(other),
        }
    }
}

impl From<PublishError> for ApiError {
    fn from(err: PublishError) -> Self {
        ApiError::DeliveryFailed(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.category(),
            "message": self.to_string(),
        }));
        (self.status(), body).into_response()
    }
}

const INVALID_STREAM_ID: &str = "Invalid stream ID";
const INVALID_PAYLOAD: &str = "Invalid request payload";
const MISSING_DATA: &str = "Missing 'data' field in request body";

#[derive(Debug, Serialize, Deserialize)]
pub struct StartStreamResponse {
    pub message: String,
    pub stream_id: String,
}

#[derive(Debug, Deserialize)]
struct SendDataRequest {
    data: Option<String>,
}

pub fn router(state: Arc<AppState>) -> Router {
    // Added last runs first: auth, then the rate gate.
    let stream_routes = Router::new()
        .route("/stream/start", post(start_stream))
        .route("/stream/:stream_id/send", post(send_data))
        .route("/stream/:stream_id/results", get(stream_results))
        .route("/stream/:stream_id", delete(close_stream))
        .route_layer(from_fn_with_state(state.clone(), rate_gate::enforce))
        .route_layer(from_fn_with_state(state.clone(), auth::require_api_key));

    Router::new()
        .route("/healthz", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .merge(stream_routes)
        .layer(middleware::from_fn(metrics::track_requests))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let body = state.render_metrics();
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body)
}

async fn start_stream(
    State(state): State<Arc<AppState>>,
) -> Result<Json<StartStreamResponse>, ApiError> {
    let stream_id = Uuid::new_v4().to_string();
    state.sessions.get_or_create_publisher(&stream_id).await?;
    info!(stream_id = %stream_id, "stream started");
    Ok(Json(StartStreamResponse {
        message: "New stream started".to_string(),
        stream_id,
    }))
}

async fn send_data(
    State(state): State<Arc<AppState>>,
    Path(stream_id): Path<String>,
    body: Bytes,
) -> Result<String, ApiError> {
    let stream_id = valid_stream_id(stream_id)?;
    let request: SendDataRequest = serde_json::from_slice(&body).map_err(|err| {
        warn!(stream_id = %stream_id, error = %err, "rejected malformed send payload");
        ApiError::Validation(INVALID_PAYLOAD)
    })?;
    let data = request.data.ok_or(ApiError::Validation(MISSING_DATA))?;

    let publisher = state.sessions.get_or_create_publisher(&stream_id).await?;
    publisher.send(MESSAGE_KEY, data.as_bytes()).await?;
    Ok(format!("Data sent and processed for stream {stream_id}"))
}

async fn stream_results(
    State(state): State<Arc<AppState>>,
    Path(stream_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let stream_id = valid_stream_id(stream_id)?;
    Ok(ws
        .on_upgrade(move |socket| serve_results(socket, state, stream_id))
        .into_response())
}

async fn close_stream(
    State(state): State<Arc<AppState>>,
    Path(stream_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let stream_id = valid_stream_id(stream_id)?;
    let disconnected = state.push_targets.disconnect(&stream_id);
    let closed = state.sessions.close_session(&stream_id).await;
    info!(stream_id = %stream_id, disconnected, closed, "stream closed on request");
    Ok(StatusCode::NO_CONTENT)
}

fn valid_stream_id(stream_id: String) -> Result<String, ApiError> {
    if stream_id.trim().is_empty() {
        return Err(ApiError::Validation(INVALID_STREAM_ID));
    }
    Ok(stream_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::RelayConfig, publisher::RetryPolicy};
    use axum::{body::Body, http::Request};
    use metrics_exporter_prometheus::PrometheusBuilder;
    use std::time::Duration;
    use stream_bus::LocalBroker;
    use tower::ServiceExt;

    const KEY: &str = "secret";

    fn config() -> RelayConfig {
        RelayConfig {
            api_key: Some(KEY.to_string()),
            retry: RetryPolicy {
                max_attempts: 3,
                delay: Duration::ZERO,
            },
            ..RelayConfig::default()
        }
    }

    fn app(config: &RelayConfig, broker: &LocalBroker) -> (Router, Arc<AppState>) {
        let handle = PrometheusBuilder::new().build_recorder().handle();
        let state = AppState::new(config, Arc::new(broker.clone()), handle);
        (router(state.clone()), state)
    }

    fn request(method: &str, uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("x-api-key", KEY)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    async fn error_body(response: Response) -> serde_json::Value {
        serde_json::from_str(&body_text(response).await).unwrap()
    }

    #[tokio::test]
    async fn health_and_metrics_need_no_key() {
        let broker = LocalBroker::new();
        let (app, _) = app(&config(), &broker);

        let health = app
            .clone()
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(health.status(), StatusCode::OK);
        assert_eq!(body_text(health).await, r#"{"status":"ok"}"#);

        let metrics = app
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(metrics.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn stream_routes_require_the_configured_key() {
        let broker = LocalBroker::new();
        let (app, _) = app(&config(), &broker);

        let missing = app
            .clone()
            .oneshot(
                Request::post("/stream/start")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(error_body(missing).await["error"], "unauthorized");

        let wrong = app
            .oneshot(
                Request::post("/stream/start")
                    .header("x-api-key", "nope")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(broker.stats().producers_created, 0);
    }

    #[tokio::test]
    async fn unconfigured_key_rejects_every_stream_request() {
        let broker = LocalBroker::new();
        let config = RelayConfig {
            api_key: None,
            ..config()
        };
        let (app, _) = app(&config, &broker);
        let response = app.oneshot(request("POST", "/stream/start", "")).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn start_provisions_a_publisher() {
        let broker = LocalBroker::new();
        let (app, state) = app(&config(), &broker);

        let response = app.oneshot(request("POST", "/stream/start", "")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: StartStreamResponse = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(body.message, "New stream started");
        assert!(Uuid::parse_str(&body.stream_id).is_ok());
        assert!(state.sessions.contains(&body.stream_id));
        assert_eq!(broker.stats().producers_created, 1);
    }

    #[tokio::test]
    async fn start_reports_unavailable_bus() {
        let broker = LocalBroker::new();
        broker.set_unavailable(true);
        let (app, _) = app(&config(), &broker);

        let response = app.oneshot(request("POST", "/stream/start", "")).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = error_body(response).await;
        assert_eq!(body["error"], "resource_unavailable");
        assert_eq!(body["message"], "Failed to initialize Kafka producer");
    }

    #[tokio::test]
    async fn send_writes_data_under_fixed_key() {
        let broker = LocalBroker::new();
        let (app, _) = app(&config(), &broker);

        let response = app
            .oneshot(request("POST", "/stream/abc/send", r#"{"data":"hello"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response.headers()[header::CONTENT_TYPE].to_str().unwrap().to_string();
        assert!(content_type.starts_with("text/plain"));
        assert_eq!(body_text(response).await, "Data sent and processed for stream abc");

        let messages = broker.messages("abc");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].key.as_deref(), Some(MESSAGE_KEY));
        assert_eq!(&messages[0].payload[..], b"hello");
    }

    #[tokio::test]
    async fn invalid_send_requests_are_rejected_without_side_effects() {
        let broker = LocalBroker::new();
        let (app, state) = app(&config(), &broker);

        let cases = [
            ("/stream/abc/send", "{}", MISSING_DATA),
            ("/stream/abc/send", "{not json", INVALID_PAYLOAD),
            ("/stream/abc/send", r#"{"data": 7}"#, INVALID_PAYLOAD),
            ("/stream/%20/send", r#"{"data":"x"}"#, INVALID_STREAM_ID),
            ("/stream//send", r#"{"data":"x"}"#, INVALID_STREAM_ID),
        ];
        for (uri, body, message) in cases {
            let response = app.clone().oneshot(request("POST", uri, body)).await.unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{uri} {body}");
            let json = error_body(response).await;
            assert_eq!(json["error"], "validation_error");
            assert_eq!(json["message"], message);
        }
        assert!(state.sessions.is_empty());
        assert_eq!(broker.stats().producers_created, 0);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_delivery_failure() {
        let broker = LocalBroker::new();
        let (app, _) = app(&config(), &broker);
        broker.fail_next_sends(3);

        let response = app
            .oneshot(request("POST", "/stream/abc/send", r#"{"data":"hello"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = error_body(response).await;
        assert_eq!(body["error"], "delivery_failed");
        let message = body["message"].as_str().unwrap();
        assert!(message.starts_with("Failed to send data to Kafka: "), "{message}");
        assert!(message.contains("injected send failure"), "{message}");
        assert!(!message.contains("attempt"), "{message}");
    }

    #[tokio::test]
    async fn rate_gate_runs_after_auth() {
        let broker = LocalBroker::new();
        let config = RelayConfig {
            rate_burst: 1,
            rate_per_sec: 0.001,
            ..config()
        };
        let (app, _) = app(&config, &broker);

        let unauthorized = app
            .clone()
            .oneshot(Request::post("/stream/start").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(unauthorized.status(), StatusCode::UNAUTHORIZED);

        let admitted = app.clone().oneshot(request("POST", "/stream/start", "")).await.unwrap();
        assert_eq!(admitted.status(), StatusCode::OK);

        let limited = app.oneshot(request("POST", "/stream/start", "")).await.unwrap();
        assert_eq!(limited.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(error_body(limited).await["error"], "rate_limited");
        assert_eq!(broker.stats().producers_created, 1);
    }

    #[tokio::test]
    async fn delete_closes_the_session() {
        let broker = LocalBroker::new();
        let (app, state) = app(&config(), &broker);
        app.clone()
            .oneshot(request("POST", "/stream/abc/send", r#"{"data":"x"}"#))
            .await
            .unwrap();

        let response = app
            .clone()
            .oneshot(request("DELETE", "/stream/abc", ""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(!state.sessions.contains("abc"));
        assert_eq!(broker.stats().producers_closed, 1);

        let again = app.oneshot(request("DELETE", "/stream/abc", "")).await.unwrap();
        assert_eq!(again.status(), StatusCode::NO_CONTENT);
    }
}
