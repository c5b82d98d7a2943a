//! WebSocket server wiring.
//!
//! # Purpose
//! Builds the hub from configuration and serves `GET /ws`. The caller's user
//! id comes from the `x-user-id` header set by the authenticating proxy in
//! front of this service. Each upgraded socket runs one read loop; when that
//! loop ends the connection's subscriptions are torn down.
//!
//! Upgraded sockets outlive the HTTP server, so they are tracked in
//! [`Sockets`]. [`Sockets::shutdown`] ends every read loop and waits until
//! each connection has released its broker subscriptions and replay consumers.
use crate::config::{AuthzSource, BrokerKind, WebSocketConfig};
use crate::hub::{Connection, Hub, OutboundSink};
use crate::observability;
use anyhow::Context;
use async_trait::async_trait;
use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::stream::SplitSink;
use futures::{SinkExt, Stream, StreamExt};
use std::sync::Arc;
use tether_authz::{Authorizer, PolicyAuthorizer, RemoteAuthorizer};
use tether_broker::nats::NatsBus;
use tether_broker::{Bus, MemoryBus};
use tether_wire::subject;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower_http::trace::TraceLayer;
use tracing_opentelemetry::OpenTelemetrySpanExt;

pub const USER_HEADER: &str = "x-user-id";

pub async fn connect_bus(config: &WebSocketConfig) -> anyhow::Result<Arc<dyn Bus>> {
    match config.broker {
        BrokerKind::Memory => {
            tracing::info!("using in-process broker");
            Ok(Arc::new(memory_bus(config)?))
        }
        BrokerKind::Nats => {
            let bus = NatsBus::connect(&config.nats_url)
                .await
                .with_context(|| format!("connect to nats at {}", config.nats_url))?;
            Ok(Arc::new(bus))
        }
    }
}

/// In-process broker with the logs stream replay subscriptions read from.
pub fn memory_bus(config: &WebSocketConfig) -> anyhow::Result<MemoryBus> {
    let bus = MemoryBus::new();
    bus.add_stream(
        &config.logs_stream,
        &[subject::all_under(subject::LOGS).as_str()],
    )
    .context("add logs stream")?;
    Ok(bus)
}

pub fn build_authorizer(source: &AuthzSource) -> anyhow::Result<Arc<dyn Authorizer>> {
    match source {
        AuthzSource::Remote(url) => {
            let authorizer = RemoteAuthorizer::new(url).context("build iam client")?;
            tracing::info!(iam = %url, "using remote authorizer");
            Ok(Arc::new(authorizer))
        }
        AuthzSource::Policy(path) => {
            let authorizer = PolicyAuthorizer::load(path)
                .with_context(|| format!("load policy {}", path.display()))?;
            tracing::info!(policy = %path.display(), "using static policy authorizer");
            Ok(Arc::new(authorizer))
        }
    }
}

/// Upgraded sockets still being served.
#[derive(Clone, Default)]
pub struct Sockets {
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl Sockets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self) -> usize {
        self.tracker.len()
    }

    /// Stop every read loop and wait for each connection to close.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tracker.close();
        tracing::info!(open = self.tracker.len(), "closing websocket connections");
        self.tracker.wait().await;
    }
}

#[derive(Clone)]
struct SocketState {
    hub: Arc<Hub>,
    sockets: Sockets,
}

pub fn build_router(hub: Arc<Hub>, sockets: Sockets) -> Router {
    let trace_layer =
        TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
            let parent = observability::trace_context_from_headers(request.headers());
            let span = tracing::info_span!(
                "http.request",
                method = %request.method(),
                uri = %request.uri(),
                version = ?request.version()
            );
            span.set_parent(parent);
            span
        });

    Router::new()
        .route("/ws", axum::routing::get(upgrade))
        .layer(trace_layer)
        .with_state(SocketState { hub, sockets })
}

async fn upgrade(
    State(SocketState { hub, sockets }): State<SocketState>,
    headers: HeaderMap,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    let user_id = headers
        .get(USER_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string);
    let Some(user_id) = user_id else {
        return (StatusCode::UNAUTHORIZED, "missing x-user-id").into_response();
    };
    let Some(ws) = ws else {
        return (StatusCode::UPGRADE_REQUIRED, "websocket upgrade required").into_response();
    };
    ws.on_upgrade(move |socket| {
        let (sink, stream) = socket.split();
        let connection = hub.connect(user_id, Box::new(SocketSink(sink)));
        sockets
            .tracker
            .track_future(serve_connection(connection, stream, sockets.shutdown.clone()))
    })
}

struct SocketSink(SplitSink<WebSocket, Message>);

#[async_trait]
impl OutboundSink for SocketSink {
    async fn send_text(&mut self, text: String) -> anyhow::Result<()> {
        self.0
            .send(Message::Text(text))
            .await
            .context("send websocket frame")
    }
}

/// Read loop for one client. Ends when the transport ends the stream or
/// `shutdown` fires; either way the connection is closed before returning.
pub async fn serve_connection<S>(connection: Connection, mut stream: S, shutdown: CancellationToken)
where
    S: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    loop {
        let message = tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                tracing::debug!(connection = %connection.id(), "closing websocket for shutdown");
                break;
            }
            message = stream.next() => message,
        };
        let Some(message) = message else {
            break;
        };
        match message {
            Ok(Message::Text(text)) => connection.handle_text(&text).await,
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(err) => {
                tracing::debug!(connection = %connection.id(), error = %err, "websocket read failed");
                break;
            }
        }
    }
    connection.close().await;
}
