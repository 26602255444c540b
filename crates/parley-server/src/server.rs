use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::HeaderValue;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use parley_core::{ChatService, TokenValidator, UserId};
use parley_telemetry::{MetricSample, MetricsRecorder};

use crate::auth::AuthenticatedUser;
use crate::gateway::ws_handler;
use crate::hub::Hub;
use crate::pump::PumpConfig;

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Outbound queue capacity per session. A session whose queue fills is
    /// disconnected.
    pub send_queue_capacity: usize,
    pub write_timeout: Duration,
    pub liveness_timeout: Duration,
    pub max_frame_bytes: usize,
    /// Allowed CORS origin. `None` allows any.
    pub cors_origin: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
            send_queue_capacity: 256,
            write_timeout: Duration::from_secs(10),
            liveness_timeout: Duration::from_secs(60),
            max_frame_bytes: 64 * 1024,
            cors_origin: None,
        }
    }
}

impl ServerConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        self.liveness_timeout * 9 / 10
    }

    pub fn pump_config(&self) -> PumpConfig {
        PumpConfig {
            write_timeout: self.write_timeout,
            liveness_timeout: self.liveness_timeout,
            heartbeat_interval: self.heartbeat_interval(),
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub hub: Hub,
    pub validator: Arc<dyn TokenValidator>,
    pub chat: Arc<dyn ChatService>,
    pub config: Arc<ServerConfig>,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    let cors = cors_layer(state.config.cors_origin.as_deref());
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/presence", get(list_presence_handler))
        .route("/presence/{user_id}", get(presence_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

fn cors_layer(origin: Option<&str>) -> CorsLayer {
    let Some(origin) = origin else {
        return CorsLayer::permissive();
    };
    match origin.parse::<HeaderValue>() {
        Ok(value) => CorsLayer::new()
            .allow_origin(value)
            .allow_methods(Any)
            .allow_headers(Any),
        Err(e) => {
            warn!(origin, error = %e, "invalid CORS origin, allowing any");
            CorsLayer::permissive()
        }
    }
}

/// Create and start the server. Returns a handle to shut it down.
pub async fn start(
    config: ServerConfig,
    validator: Arc<dyn TokenValidator>,
    chat: Arc<dyn ChatService>,
    metrics: Arc<MetricsRecorder>,
) -> Result<ServerHandle, std::io::Error> {
    let shutdown = CancellationToken::new();
    let (hub, hub_task) = Hub::spawn(metrics, shutdown.clone());

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    let state = AppState {
        hub: hub.clone(),
        validator,
        chat,
        config: Arc::new(config),
    };
    let router = build_router(state);

    info!(addr = %local_addr, "parley server started");

    let server_shutdown = shutdown.clone();
    let server_task = tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
            .await;
        if let Err(e) = result {
            warn!(error = %e, "server exited with error");
        }
    });

    Ok(ServerHandle {
        addr: local_addr,
        port: local_addr.port(),
        hub,
        shutdown,
        server_task,
        hub_task,
    })
}

/// Handle returned by `start()`. Keeps background tasks alive.
pub struct ServerHandle {
    pub addr: SocketAddr,
    pub port: u16,
    hub: Hub,
    shutdown: CancellationToken,
    server_task: JoinHandle<()>,
    hub_task: JoinHandle<()>,
}

impl ServerHandle {
    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    /// Stop accepting connections, close every session and wait for the
    /// background tasks to finish.
    pub async fn shutdown(self) {
        info!("shutting down");
        self.shutdown.cancel();
        let _ = self.hub_task.await;
        let _ = self.server_task.await;
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    online: usize,
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy",
        online: state.hub.online_count(),
    })
}

#[derive(Debug, Serialize)]
struct PresenceList {
    online: Vec<UserId>,
}

async fn list_presence_handler(_caller: AuthenticatedUser, State(state): State<AppState>) -> Json<PresenceList> {
    Json(PresenceList {
        online: state.hub.list_online(),
    })
}

#[derive(Debug, Serialize)]
struct PresenceStatus {
    user_id: UserId,
    online: bool,
}

async fn presence_handler(
    _caller: AuthenticatedUser,
    State(state): State<AppState>,
    Path(user_id): Path<UserId>,
) -> Json<PresenceStatus> {
    let online = state.hub.is_online(&user_id);
    Json(PresenceStatus { user_id, online })
}

async fn metrics_handler(_caller: AuthenticatedUser, State(state): State<AppState>) -> Json<Vec<MetricSample>> {
    Json(state.hub.metrics().snapshot())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parley_core::{AuthError, ChatError, ConversationId, SentMessage};

    use crate::session::Session;

    /// Accepts tokens of the form `user:<id>`.
    struct PrefixValidator;

    impl TokenValidator for PrefixValidator {
        fn validate_token(&self, token: &str) -> Result<UserId, AuthError> {
            token
                .strip_prefix("user:")
                .map(UserId::from)
                .ok_or_else(|| AuthError::InvalidToken("bad prefix".into()))
        }
    }

    struct NullChat;

    #[async_trait]
    impl ChatService for NullChat {
        async fn send_message(
            &self,
            _conversation_id: &ConversationId,
            _sender_id: &UserId,
            body: &str,
        ) -> Result<SentMessage, ChatError> {
            Ok(SentMessage { body: body.to_string(), created_at: 1 })
        }
    }

    async fn start_test_server() -> ServerHandle {
        start_with_cors(None).await
    }

    async fn start_with_cors(cors_origin: Option<&str>) -> ServerHandle {
        let config = ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
            cors_origin: cors_origin.map(str::to_string),
            ..Default::default()
        };
        start(config, Arc::new(PrefixValidator), Arc::new(NullChat), Arc::new(MetricsRecorder::new()))
            .await
            .unwrap()
    }

    async fn preflight_allow_origin(handle: &ServerHandle) -> Option<String> {
        let resp = reqwest::Client::new()
            .request(reqwest::Method::OPTIONS, format!("http://127.0.0.1:{}/health", handle.port))
            .header("Origin", "https://chat.example.com")
            .header("Access-Control-Request-Method", "GET")
            .send()
            .await
            .unwrap();
        assert!(resp.status().is_success());
        resp.headers()
            .get("access-control-allow-origin")
            .map(|v| v.to_str().unwrap().to_string())
    }

    #[test]
    fn default_config_values() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.send_queue_capacity, 256);
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(54));
        assert_eq!(config.pump_config().write_timeout, Duration::from_secs(10));
        assert_eq!(config.max_frame_bytes, 65536);
    }

    #[tokio::test]
    async fn configured_cors_origin_is_echoed_in_preflight() {
        let handle = start_with_cors(Some("https://chat.example.com")).await;
        assert_eq!(
            preflight_allow_origin(&handle).await.as_deref(),
            Some("https://chat.example.com")
        );
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn invalid_cors_origin_falls_back_to_any() {
        let handle = start_with_cors(Some("bad\norigin")).await;
        assert_eq!(preflight_allow_origin(&handle).await.as_deref(), Some("*"));
        handle.shutdown().await;

        let handle = start_with_cors(None).await;
        assert_eq!(preflight_allow_origin(&handle).await.as_deref(), Some("*"));
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn server_starts_and_serves_health() {
        let handle = start_test_server().await;
        assert!(handle.port > 0);

        let url = format!("http://127.0.0.1:{}/health", handle.port);
        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(resp.status(), 200);

        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["online"], 0);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn presence_requires_credentials() {
        let handle = start_test_server().await;
        let client = reqwest::Client::new();
        let url = format!("http://127.0.0.1:{}/presence", handle.port);

        let resp = client.get(&url).send().await.unwrap();
        assert_eq!(resp.status(), 401);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["error"], "missing credentials");

        let resp = client.get(&url).bearer_auth("nope").send().await.unwrap();
        assert_eq!(resp.status(), 401);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn presence_reflects_hub() {
        let handle = start_test_server().await;
        let (session, _outbound) = Session::new("alice".into(), 8);
        handle.hub().register(session).unwrap();
        // Registration is applied by the hub loop.
        for _ in 0..100 {
            if handle.hub().is_online(&"alice".into()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let client = reqwest::Client::new();
        let base = format!("http://127.0.0.1:{}", handle.port);

        let list: serde_json::Value = client
            .get(format!("{base}/presence?token=user:bob"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(list["online"], serde_json::json!(["alice"]));

        let one: serde_json::Value = client
            .get(format!("{base}/presence/alice"))
            .bearer_auth("user:bob")
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(one["user_id"], "alice");
        assert_eq!(one["online"], true);

        let other: serde_json::Value = client
            .get(format!("{base}/presence/carol"))
            .bearer_auth("user:bob")
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(other["online"], false);

        let metrics: serde_json::Value = client
            .get(format!("{base}/metrics"))
            .bearer_auth("user:bob")
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let names: Vec<&str> = metrics
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|m| m["name"].as_str())
            .collect();
        assert!(names.contains(&"hub.sessions.registered"));

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_stops_hub() {
        let handle = start_test_server().await;
        let hub = handle.hub().clone();
        handle.shutdown().await;
        assert!(hub.is_closed());
    }
}
