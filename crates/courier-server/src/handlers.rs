//! HTTP and WebSocket handlers for the Courier server.
//!
//! Authentication happens upstream: every request carries the caller's
//! identity in `x-user-id` and, optionally, `x-user-role`.

use anyhow::{Context, Result};
use axum::{
    async_trait,
    extract::{ws::WebSocketUpgrade, ConnectInfo, FromRequestParts, Path, Query, State},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use courier_core::{
    Actor, Backplane, ChatService, Hub, MemoryRecallCache, MemoryStore, NotificationService,
    Role, SendRequest, ServiceError, Session, SessionHandler, Topic,
};
use courier_protocol::WireFormat;
use courier_transport::{BackplaneTransport, MemoryBus, MemoryQueue, TcpMesh, WebSocketConnection};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::{Config, TransportKind};
use crate::metrics;

/// Header carrying the authenticated user id.
pub const USER_ID_HEADER: &str = "x-user-id";
/// Header carrying the authenticated user's role.
pub const USER_ROLE_HEADER: &str = "x-user-role";

/// Shared server state.
pub struct AppState {
    pub hub: Arc<Hub>,
    pub backplane: Arc<Backplane>,
    pub chat: Arc<ChatService>,
    pub notifications: Arc<NotificationService>,
    pub config: Config,
}

impl AppState {
    /// Build the delivery core and start its background tasks: the backplane
    /// consumers and the recall cache purge.
    ///
    /// The tasks stop when `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns an error if a backplane transport cannot be started.
    pub async fn start(
        config: Config,
        cancel: CancellationToken,
    ) -> Result<(Arc<Self>, Vec<JoinHandle<()>>)> {
        let hub = Arc::new(Hub::with_capacity(config.session.outbound_capacity));

        let mut backplane = Backplane::new(config.backplane_config());
        for kind in &config.backplane.transports {
            let transport: Arc<dyn BackplaneTransport> = match kind {
                TransportKind::Bus => Arc::new(MemoryBus::new()),
                TransportKind::Queue => Arc::new(MemoryQueue::new()),
                TransportKind::Mesh => Arc::new(
                    TcpMesh::start(config.mesh_config(), cancel.clone())
                        .await
                        .context("Failed to start mesh backplane")?,
                ),
            };
            backplane = backplane.with_transport(transport);
        }
        let backplane = Arc::new(backplane);
        let mut tasks = backplane
            .start(Arc::clone(&hub), cancel.clone())
            .await
            .context("Failed to start backplane consumers")?;

        let recall = Arc::new(MemoryRecallCache::new());
        let chat_config = config.chat_config();
        if chat_config.recall_enabled {
            tasks.push(Arc::clone(&recall).spawn_purge(chat_config.recall_ttl, cancel));
        }

        let store = Arc::new(MemoryStore::new());
        let chat = ChatService::new(
            store.clone(),
            Arc::clone(&hub),
            Arc::clone(&backplane),
            chat_config,
        )
        .with_recall(recall);
        let notifications = NotificationService::new(
            store,
            Arc::clone(&hub),
            Arc::clone(&backplane),
            config.notification_config(),
        );

        info!(
            source = backplane.source(),
            transports = ?backplane.transport_names(),
            "Delivery core ready"
        );

        let state = Arc::new(Self {
            hub,
            backplane,
            chat: Arc::new(chat),
            notifications: Arc::new(notifications),
            config,
        });
        Ok((state, tasks))
    }
}

/// Build the HTTP router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route(
            "/rooms/:room/messages",
            get(room_history_handler).post(room_send_handler),
        )
        .route(
            "/notifications",
            get(notification_history_handler).post(notification_publish_handler),
        )
        .route("/notifications/unread", get(unread_count_handler))
        .route("/notifications/:id/read", post(mark_read_handler))
        .route("/ws/rooms/:room", get(room_ws_handler))
        .route("/ws/notifications", get(notification_ws_handler))
        .with_state(state)
}

/// Run the HTTP/WebSocket server until `shutdown` fires.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config, shutdown: CancellationToken) -> Result<()> {
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            tracing::error!("Failed to start metrics server: {:#}", e);
        }
    }

    let addr = config.bind_addr()?;
    let (state, tasks) = AppState::start(config, shutdown.clone()).await?;
    let app = router(state);

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!("Courier server listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown.clone().cancelled_owned())
    .await?;

    shutdown.cancel();
    for task in tasks {
        let _ = task.await;
    }
    info!("Courier server stopped");
    Ok(())
}

/// An error response.
pub struct ApiError(ServiceError);

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        courier_core::metrics::record_error(self.0.label());
        let body = Json(serde_json::json!({
            "error": self.0.to_string(),
            "code": self.0.code(),
        }));
        (status, body).into_response()
    }
}

/// The caller identity set by the upstream authenticator.
pub struct Identity(pub Actor);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for Identity {
    type Rejection = (StatusCode, &'static str);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::trim)
        };

        let id = header(USER_ID_HEADER)
            .filter(|id| !id.is_empty())
            .ok_or((StatusCode::UNAUTHORIZED, "missing x-user-id"))?;
        let role = match header(USER_ROLE_HEADER) {
            Some(role) => role
                .parse::<Role>()
                .map_err(|_| (StatusCode::BAD_REQUEST, "invalid x-user-role"))?,
            None => Role::User,
        };
        Ok(Identity(Actor::new(id, role)))
    }
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.hub.stats();
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "hub": {
            "topics": stats.topic_count,
            "subscribers": stats.subscriber_count,
            "dropped": stats.dropped_total,
        },
        "backplane": state.backplane.transport_names(),
    }))
}

#[derive(Debug, Deserialize)]
struct HistoryParams {
    before: Option<DateTime<Utc>>,
    limit: Option<u32>,
}

async fn room_history_handler(
    State(state): State<Arc<AppState>>,
    Identity(_): Identity,
    Path(room): Path<String>,
    Query(params): Query<HistoryParams>,
) -> Result<impl IntoResponse, ApiError> {
    let messages = state
        .chat
        .history(&room, params.before, params.limit)
        .await?;
    Ok(Json(messages))
}

async fn room_send_handler(
    State(state): State<Arc<AppState>>,
    Identity(actor): Identity,
    Path(room): Path<String>,
    Json(request): Json<SendRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let message = state.chat.send(&actor, &room, request).await?;
    Ok((StatusCode::CREATED, Json(message)))
}

async fn notification_history_handler(
    State(state): State<Arc<AppState>>,
    Identity(actor): Identity,
    Query(params): Query<HistoryParams>,
) -> Result<impl IntoResponse, ApiError> {
    let notifications = state
        .notifications
        .history(&actor.id, params.before, params.limit)
        .await?;
    Ok(Json(notifications))
}

#[derive(Debug, Deserialize)]
struct PublishRequest {
    user_id: String,
    #[serde(rename = "type")]
    kind: String,
    content: String,
}

async fn notification_publish_handler(
    State(state): State<Arc<AppState>>,
    Identity(actor): Identity,
    Json(request): Json<PublishRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let notification = state
        .notifications
        .publish(&actor, &request.user_id, &request.kind, &request.content)
        .await?;
    Ok((StatusCode::CREATED, Json(notification)))
}

async fn unread_count_handler(
    State(state): State<Arc<AppState>>,
    Identity(actor): Identity,
) -> Result<impl IntoResponse, ApiError> {
    let count = state.notifications.unread_count(&actor.id).await?;
    Ok(Json(serde_json::json!({ "unread": count })))
}

async fn mark_read_handler(
    State(state): State<Arc<AppState>>,
    Identity(actor): Identity,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let notification = state.notifications.mark_read(id, &actor.id).await?;
    Ok(Json(notification))
}

#[derive(Debug, Default, Deserialize)]
struct UpgradeParams {
    format: Option<WireFormat>,
}

/// Chat room WebSocket upgrade handler.
async fn room_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Identity(actor): Identity,
    Path(room): Path<String>,
    Query(params): Query<UpgradeParams>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
) -> Result<Response, ApiError> {
    courier_core::hub::validate_topic_id(&room).map_err(|message| ServiceError::Validation {
        field: "room_id",
        message: message.to_string(),
    })?;
    let handler: Arc<dyn SessionHandler> = state.chat.clone();
    Ok(upgrade(
        ws,
        state,
        actor,
        Topic::room(room),
        handler,
        params.format,
        connect_info.map(|ConnectInfo(addr)| addr),
    ))
}

/// Notification feed WebSocket upgrade handler.
async fn notification_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Identity(actor): Identity,
    Query(params): Query<UpgradeParams>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
) -> Response {
    let handler: Arc<dyn SessionHandler> = state.notifications.clone();
    let topic = Topic::user(actor.id.clone());
    upgrade(
        ws,
        state,
        actor,
        topic,
        handler,
        params.format,
        connect_info.map(|ConnectInfo(addr)| addr),
    )
}

fn upgrade(
    ws: WebSocketUpgrade,
    state: Arc<AppState>,
    actor: Actor,
    topic: Topic,
    handler: Arc<dyn SessionHandler>,
    format: Option<WireFormat>,
    remote: Option<SocketAddr>,
) -> Response {
    let format = format.unwrap_or(state.config.session.wire_format);
    let max_message_size = state.config.session.max_message_size;

    ws.max_message_size(max_message_size)
        .on_upgrade(move |socket| async move {
            let mut connection =
                WebSocketConnection::new(socket, format).with_max_message_size(max_message_size);
            if let Some(addr) = remote {
                connection = connection.with_remote_addr(addr);
            }
            debug!(topic = %topic, actor = %actor, ?format, "WebSocket upgraded");

            let session = Session::start(
                Box::new(connection),
                actor,
                topic,
                Arc::clone(&state.hub),
                handler,
                &state.config.session_config(),
            );
            session.join().await;
        })
}
