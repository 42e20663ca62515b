use std::{
    net::SocketAddr,
    sync::{Arc, PoisonError, RwLock},
};

use anyhow::Context;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{
    client::{ConnectionPhase, Mode, TelemetryClient},
    config::Config,
    domain::{CommandFrame, TelemetryReport},
    registry::{ReportStream, Subscription},
};

const SOCKET_REPORT_BUFFER: usize = 64;

type LatestReport = Arc<RwLock<Option<TelemetryReport>>>;

#[derive(Clone)]
struct AppState {
    client: TelemetryClient,
    latest: LatestReport,
}

impl AppState {
    /// Returns the state plus the subscription that keeps `latest` current;
    /// the subscription must outlive the server.
    fn new(client: TelemetryClient) -> (Self, Subscription) {
        let latest: LatestReport = Arc::new(RwLock::new(None));
        let sink = latest.clone();
        let subscription = client.subscribe(move |report| {
            *sink.write().unwrap_or_else(PoisonError::into_inner) = Some(report.clone());
        });
        (Self { client, latest }, subscription)
    }

    fn latest(&self) -> Option<TelemetryReport> {
        self.latest
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Subscribes a dashboard feed and returns it with the catch-up report.
    /// Subscribing before the snapshot is taken means a report can show up
    /// twice but never fall between the two.
    fn open_feed(&self) -> (Option<TelemetryReport>, ReportStream) {
        let reports = self.client.subscribe_channel(SOCKET_REPORT_BUFFER);
        (self.latest(), reports)
    }
}

pub async fn run_server(config: Config) -> anyhow::Result<()> {
    let client = TelemetryClient::new(config.client.clone());
    let (state, latest_subscription) = AppState::new(client.clone());

    tracing::info!(
        endpoint = %config.client.endpoint,
        max_reconnect_attempts = config.client.max_reconnect_attempts,
        "starting telemetry client"
    );
    client.connect();

    let app = router(state);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .with_context(|| {
            format!(
                "invalid host/port combination: {}:{}",
                config.host, config.port
            )
        })?;

    tracing::info!(%addr, "relay listening (ws endpoint at /ws)");

    let result = axum::Server::bind(&addr)
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error");

    client.disconnect();
    latest_subscription.unsubscribe();
    result
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .route("/ws", get(ws_handler))
        .route("/healthz", get(healthz))
        .route("/api/status", get(get_status))
        .route("/api/latest", get(get_latest))
        .route("/api/command", post(post_command))
        .with_state(state)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, peer, state))
}

async fn healthz() -> impl IntoResponse {
    StatusCode::OK
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    phase: ConnectionPhase,
    mode: Mode,
    reconnect_attempts: u32,
    subscribers: usize,
    dropped_reports: u64,
}

async fn get_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(StatusResponse {
        phase: state.client.phase(),
        mode: state.client.mode(),
        reconnect_attempts: state.client.reconnect_attempts(),
        subscribers: state.client.subscriber_count(),
        dropped_reports: state.client.dropped_reports(),
    })
}

#[derive(Serialize)]
struct ApiResponse {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    delivered: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

async fn get_latest(State(state): State<AppState>) -> axum::response::Response {
    match state.latest() {
        Some(report) => Json(report).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(ApiResponse {
                ok: false,
                delivered: None,
                error: Some("no report received yet".to_string()),
            }),
        )
            .into_response(),
    }
}

async fn post_command(
    State(state): State<AppState>,
    Json(req): Json<CommandFrame>,
) -> impl IntoResponse {
    let command = req.command.trim();
    if command.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(ApiResponse {
                ok: false,
                delivered: None,
                error: Some("command must not be empty".to_string()),
            }),
        );
    }

    // commands are fire-and-forget; report whether a live link was up
    let delivered = state.client.phase() == ConnectionPhase::Connected;
    state.client.send_command(command);

    (
        StatusCode::ACCEPTED,
        Json(ApiResponse {
            ok: true,
            delivered: Some(delivered),
            error: None,
        }),
    )
}

async fn handle_socket(socket: WebSocket, peer: SocketAddr, state: AppState) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Message>(256);
    let client_id = Uuid::new_v4();

    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_tx.send(msg).await.is_err() {
                break;
            }
        }
    });

    let (catch_up, mut reports) = state.open_feed();
    // send the latest report first so the dashboard has something to draw
    if let Some(report) = catch_up {
        send_report(&tx, &report).await;
    }

    let pump_tx = tx.clone();
    let pump = tokio::spawn(async move {
        while let Some(report) = reports.recv().await {
            if !send_report(&pump_tx, &report).await {
                break;
            }
        }
    });

    tracing::info!(%peer, %client_id, "dashboard connected");

    while let Some(msg) = ws_rx.next().await {
        match msg {
            Ok(Message::Text(text)) => handle_text(&text, &state.client, &tx).await,
            Ok(Message::Binary(_)) => {
                send_error(
                    &tx,
                    ErrorType::WebsocketMessageError,
                    "binary frames are not supported",
                )
                .await;
            }
            Ok(Message::Ping(payload)) => {
                let _ = tx.send(Message::Pong(payload)).await;
            }
            Ok(Message::Close(_)) => break,
            Ok(Message::Pong(_)) => {}
            Err(err) => {
                tracing::warn!(%peer, ?err, "websocket receive error");
                break;
            }
        }
    }

    pump.abort();
    writer.abort();
    tracing::info!(%peer, %client_id, "dashboard disconnected");
}

async fn send_report(tx: &mpsc::Sender<Message>, report: &TelemetryReport) -> bool {
    match serde_json::to_string(report) {
        Ok(json) => tx.send(Message::Text(json)).await.is_ok(),
        Err(err) => {
            tracing::error!(?err, "failed to serialize report");
            true
        }
    }
}

async fn handle_text(text: &str, client: &TelemetryClient, tx: &mpsc::Sender<Message>) {
    let frame: CommandFrame = match serde_json::from_str(text) {
        Ok(val) => val,
        Err(err) => {
            tracing::warn!(%text, ?err, "failed to parse dashboard frame");
            send_error(
                tx,
                ErrorType::JsonParseError,
                format!("failed to parse JSON: {err}"),
            )
            .await;
            return;
        }
    };

    let command = frame.command.trim();
    if command.is_empty() {
        send_error(tx, ErrorType::InvalidCommand, "command must not be empty").await;
        return;
    }

    tracing::info!(command, "dashboard requested device command");
    client.send_command(command);
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OutgoingMessage {
    Error { error: ErrorBody },
}

#[derive(Debug, Clone, Serialize)]
struct ErrorBody {
    r#type: ErrorType,
    reason: String,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
enum ErrorType {
    WebsocketMessageError,
    JsonParseError,
    InvalidCommand,
}

async fn send_error(tx: &mpsc::Sender<Message>, r#type: ErrorType, reason: impl Into<String>) {
    let payload = OutgoingMessage::Error {
        error: ErrorBody {
            r#type,
            reason: reason.into(),
        },
    };

    match serde_json::to_string(&payload) {
        Ok(json) => {
            let _ = tx.send(Message::Text(json)).await;
        }
        Err(err) => {
            tracing::error!(?err, ?payload, "failed to serialize error payload");
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!(?err, "failed to install ctrl+c handler; ignoring");
            futures::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                tracing::warn!(?err, "failed to install SIGTERM handler; ignoring");
                futures::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        client::ClientConfig,
        link::testing::ScriptedConnector,
    };
    use axum::{body::Body, http::Request};
    use hyper::body::to_bytes;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tokio::time::timeout;
    use tower::ServiceExt;

    const FRAME: &str = r#"{"busId":7,"lat":16.4325,"lng":103.366,"status":"ถึงปลายทาง","passengers":0,"speed":0,"batteryLevel":64}"#;

    fn test_state(connector: ScriptedConnector) -> (AppState, Subscription) {
        let client = TelemetryClient::with_connector(ClientConfig::default(), Arc::new(connector));
        AppState::new(client)
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let body = to_bytes(response.into_body()).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    fn post_json(uri: &str, payload: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(payload.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn dashboard_feed_has_no_gap_after_catch_up() {
        let (state, _sub) = test_state(ScriptedConnector::failing());
        assert!(state.client.on_message(FRAME));

        let (catch_up, mut reports) = state.open_feed();
        assert_eq!(catch_up.map(|r| r.vehicle_id()), Some(7));
        assert!(reports.try_recv().is_none());

        assert!(state.client.on_message(&FRAME.replace("\"busId\":7", "\"busId\":8")));
        let next = reports.try_recv().expect("report published after subscribing");
        assert_eq!(next.vehicle_id(), 8);
        assert_eq!(state.latest().map(|r| r.vehicle_id()), Some(8));
    }

    #[tokio::test]
    async fn handle_text_sends_json_parse_error() {
        let (state, _sub) = test_state(ScriptedConnector::failing());
        let (tx, mut rx) = mpsc::channel(4);

        handle_text("not-json", &state.client, &tx).await;

        let msg = rx.recv().await.expect("expected error message");
        let Message::Text(text) = msg else {
            panic!("expected text frame");
        };
        let v: Value = serde_json::from_str(&text).expect("valid json in error payload");
        assert_eq!(v["type"], "error");
        assert_eq!(v["error"]["type"], "json_parse_error");
    }

    #[tokio::test]
    async fn handle_text_rejects_empty_command() {
        let (state, _sub) = test_state(ScriptedConnector::failing());
        let (tx, mut rx) = mpsc::channel(4);

        handle_text(r#"{"command":"  "}"#, &state.client, &tx).await;

        let Some(Message::Text(text)) = rx.recv().await else {
            panic!("expected text frame");
        };
        let v: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(v["error"]["type"], "invalid_command");
    }

    #[tokio::test]
    async fn handle_text_forwards_command_to_device() {
        let (connector, mut devices) = ScriptedConnector::accepting();
        let (state, _sub) = test_state(connector);
        let (tx, mut rx) = mpsc::channel(4);

        state.client.connect();
        let mut device = timeout(Duration::from_secs(5), devices.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            device.commands.recv().await.as_deref(),
            Some(r#"{"command":"get_data"}"#)
        );

        handle_text(r#"{"command":"emergency"}"#, &state.client, &tx).await;

        assert_eq!(
            device.commands.recv().await.as_deref(),
            Some(r#"{"command":"emergency"}"#)
        );
        assert!(rx.try_recv().is_err());

        state.client.disconnect();
    }

    #[tokio::test]
    async fn status_reports_phase_and_mode() {
        let (state, _sub) = test_state(ScriptedConnector::failing());
        let app = router(state);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let v = body_json(response).await;
        assert_eq!(v["phase"], "disconnected");
        assert_eq!(v["mode"], "live");
        assert_eq!(v["reconnectAttempts"], 0);
        assert_eq!(v["subscribers"], 1);
        assert_eq!(v["droppedReports"], 0);
    }

    #[tokio::test]
    async fn status_counts_reports_a_lagging_feed_missed() {
        let (state, _sub) = test_state(ScriptedConnector::failing());
        let client = state.client.clone();
        let _lagging = client.subscribe_channel(1);
        assert!(client.on_message(FRAME));
        assert!(client.on_message(FRAME));
        assert!(client.on_message(FRAME));

        let response = router(state)
            .oneshot(
                Request::builder()
                    .uri("/api/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        let v = body_json(response).await;
        assert_eq!(v["droppedReports"], 2);
        assert_eq!(v["subscribers"], 2);
    }

    #[tokio::test]
    async fn latest_is_404_until_a_report_arrives() {
        let (state, _sub) = test_state(ScriptedConnector::failing());
        let client = state.client.clone();
        let app = router(state);

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/latest")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        assert!(client.on_message(FRAME));

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/latest")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let v = body_json(response).await;
        assert_eq!(v["busId"], 7);
        assert_eq!(v["status"], "ถึงปลายทาง");
        assert_eq!(v["batteryLevel"], 64);
    }

    #[tokio::test]
    async fn post_command_rejects_empty_command() {
        let (state, _sub) = test_state(ScriptedConnector::failing());
        let app = router(state);

        let response = app
            .oneshot(post_json("/api/command", json!({ "command": "" })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let v = body_json(response).await;
        assert_eq!(v["ok"], false);
    }

    #[tokio::test]
    async fn post_command_while_offline_is_accepted_but_not_delivered() {
        let (state, _sub) = test_state(ScriptedConnector::failing());
        let app = router(state);

        let response = app
            .oneshot(post_json("/api/command", json!({ "command": "emergency" })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let v = body_json(response).await;
        assert_eq!(v["ok"], true);
        assert_eq!(v["delivered"], false);
    }

    #[tokio::test]
    async fn post_command_reaches_connected_device() {
        let (connector, mut devices) = ScriptedConnector::accepting();
        let (state, _sub) = test_state(connector);
        let client = state.client.clone();
        let app = router(state);

        client.connect();
        let mut device = timeout(Duration::from_secs(5), devices.recv())
            .await
            .unwrap()
            .unwrap();
        let mut phase = client.watch_phase();
        timeout(
            Duration::from_secs(5),
            phase.wait_for(|p| *p == ConnectionPhase::Connected),
        )
        .await
        .unwrap()
        .unwrap();

        let response = app
            .oneshot(post_json("/api/command", json!({ "command": "reset" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(body_json(response).await["delivered"], true);

        assert_eq!(
            device.commands.recv().await.as_deref(),
            Some(r#"{"command":"get_data"}"#)
        );
        assert_eq!(
            device.commands.recv().await.as_deref(),
            Some(r#"{"command":"reset"}"#)
        );

        client.disconnect();
    }
}
