use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    extract::{Path, Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{error, info, warn};

use delivery::{DeliveryContext, SendMessageRequest};
use presence::PresenceRegistry;
use relay::{LocalRegistry, Relay, RelayHandoff};
use shared::{
    domain::{ChatId, InstanceId, MessageId, MessageKind, UserId},
    error::{ApiError, ErrorCode},
    protocol::{user_channel, Envelope, MessagePayload},
};
use storage::{OfflineQueue, Storage};

mod config;

use config::{load_settings, prepare_database_url};

const MAX_BODY_BYTES: usize = 64 * 1024;

#[derive(Clone)]
struct AppState {
    ctx: DeliveryContext,
    offline_retention: Duration,
}

#[derive(Debug, Deserialize)]
struct SendMessageBody {
    chat_id: i64,
    sender_id: i64,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    kind: Option<String>,
    #[serde(default)]
    file_url: Option<String>,
    #[serde(default)]
    client_msg_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UserQuery {
    user_id: i64,
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    user_id: i64,
    limit: Option<u32>,
    before: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    user_id: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct BulkReadResponse {
    newly_read: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct UnreadResponse {
    unread: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct PresenceResponse {
    online: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    instance_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_seen: Option<DateTime<Utc>>,
}

type ApiResult<T> = Result<T, (StatusCode, Json<ApiError>)>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;

    let instance_id = InstanceId::new(settings.instance_id.clone());
    let presence = PresenceRegistry::new(
        storage.pool().clone(),
        Duration::from_secs(settings.presence_ttl_seconds.max(1)),
    );
    let offline = OfflineQueue::new(storage.pool().clone(), settings.offline_max_per_user);
    let relay = Relay::new(
        instance_id.clone(),
        presence.clone(),
        Arc::new(LocalRegistry::new()),
    );

    let advertise_url = settings
        .advertise_url
        .clone()
        .unwrap_or_else(|| format!("http://{}", settings.server_bind));
    presence.register_instance(&instance_id, &advertise_url).await?;

    let state = Arc::new(AppState {
        ctx: DeliveryContext {
            storage,
            offline,
            presence,
            relay,
        },
        offline_retention: Duration::from_secs(settings.offline_retention_hours * 3600),
    });
    spawn_heartbeat(state.clone(), advertise_url);

    let app = build_router(state);
    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, instance = %instance_id, "connect server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

/// Keeps this instance's presence entries and directory registration
/// alive, and sweeps what other instances let expire.
fn spawn_heartbeat(state: Arc<AppState>, advertise_url: String) {
    tokio::spawn(async move {
        let ttl = state.ctx.presence.ttl();
        let period = Duration::from_millis(((ttl.as_millis() / 2).max(250)) as u64);
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            let instance = state.ctx.relay.instance_id();
            if let Err(error) = state.ctx.presence.refresh_owned(instance).await {
                warn!(%error, "presence refresh failed");
            }
            if let Err(error) = state
                .ctx
                .presence
                .register_instance(instance, &advertise_url)
                .await
            {
                warn!(%error, "instance directory refresh failed");
            }
            if let Err(error) = state.ctx.presence.reap_expired().await {
                warn!(%error, "presence reap failed");
            }
            if let Err(error) = state
                .ctx
                .offline
                .purge_older_than(state.offline_retention)
                .await
            {
                warn!(%error, "offline retention purge failed");
            }
        }
    });
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/messages", post(http_send_message))
        .route("/api/messages/:message_id/read", put(http_mark_read))
        .route("/api/chats/:chat_id/messages", get(http_list_messages))
        .route("/api/chats/:chat_id/read", put(http_mark_chat_read))
        .route("/api/chats/:chat_id/unread", get(http_unread_count))
        .route("/api/presence/:user_id", get(http_presence))
        .route("/internal/relay", post(internal_relay))
        .route("/ws", get(ws_handler))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .with_state(state)
}

async fn healthz(State(state): State<Arc<AppState>>) -> ApiResult<&'static str> {
    state
        .ctx
        .storage
        .health_check()
        .await
        .map_err(|e| reject(ApiError::new(ErrorCode::Internal, e.to_string())))?;
    Ok("ok")
}

async fn http_send_message(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SendMessageBody>,
) -> ApiResult<Json<MessagePayload>> {
    let kind = match body.kind.as_deref() {
        Some(raw) => MessageKind::parse(raw).ok_or_else(|| {
            reject(ApiError::new(
                ErrorCode::Validation,
                format!("unknown message kind '{raw}'"),
            ))
        })?,
        None => MessageKind::default(),
    };
    let request = SendMessageRequest {
        chat_id: ChatId(body.chat_id),
        sender_id: UserId(body.sender_id),
        content: body.content.unwrap_or_default(),
        kind,
        file_url: body.file_url,
        client_msg_id: body.client_msg_id,
    };
    let payload = delivery::send_message(&state.ctx, request)
        .await
        .map_err(reject)?;
    Ok(Json(payload))
}

async fn http_list_messages(
    State(state): State<Arc<AppState>>,
    Path(chat_id): Path<i64>,
    Query(q): Query<HistoryQuery>,
) -> ApiResult<Json<Vec<MessagePayload>>> {
    let limit = q.limit.unwrap_or(50).clamp(1, 100);
    let messages = delivery::list_messages(
        &state.ctx,
        ChatId(chat_id),
        UserId(q.user_id),
        limit,
        q.before,
    )
    .await
    .map_err(reject)?;
    Ok(Json(messages))
}

async fn http_mark_read(
    State(state): State<Arc<AppState>>,
    Path(message_id): Path<i64>,
    Query(q): Query<UserQuery>,
) -> ApiResult<StatusCode> {
    delivery::mark_read(&state.ctx, MessageId(message_id), UserId(q.user_id))
        .await
        .map_err(reject)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn http_mark_chat_read(
    State(state): State<Arc<AppState>>,
    Path(chat_id): Path<i64>,
    Query(q): Query<UserQuery>,
) -> ApiResult<Json<BulkReadResponse>> {
    let newly_read = delivery::mark_chat_read(&state.ctx, ChatId(chat_id), UserId(q.user_id))
        .await
        .map_err(reject)?;
    Ok(Json(BulkReadResponse { newly_read }))
}

async fn http_unread_count(
    State(state): State<Arc<AppState>>,
    Path(chat_id): Path<i64>,
    Query(q): Query<UserQuery>,
) -> ApiResult<Json<UnreadResponse>> {
    let unread = delivery::unread_count(&state.ctx, ChatId(chat_id), UserId(q.user_id))
        .await
        .map_err(reject)?;
    Ok(Json(UnreadResponse { unread }))
}

async fn http_presence(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<i64>,
) -> ApiResult<Json<PresenceResponse>> {
    let snapshot = state
        .ctx
        .presence
        .snapshot(UserId(user_id))
        .await
        .map_err(|e| reject(ApiError::new(ErrorCode::Internal, e.to_string())))?;
    Ok(Json(match snapshot {
        Some(snapshot) => PresenceResponse {
            online: true,
            instance_id: Some(snapshot.instance_id.0),
            last_seen: Some(snapshot.last_seen),
        },
        None => PresenceResponse {
            online: false,
            instance_id: None,
            last_seen: None,
        },
    }))
}

/// Instance-to-instance handoff. A 2xx means a live local connection
/// accepted the envelope; anything else tells the publisher to fall back.
async fn internal_relay(
    State(state): State<Arc<AppState>>,
    Json(handoff): Json<RelayHandoff>,
) -> StatusCode {
    if state.ctx.relay.local().dispatch(handoff.user_id, handoff.envelope) {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::GONE
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(q): Query<WsQuery>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws_connection(state, socket, UserId(q.user_id)))
}

async fn ws_connection(
    state: Arc<AppState>,
    socket: axum::extract::ws::WebSocket,
    user_id: UserId,
) {
    use axum::extract::ws::Message;
    use futures::{SinkExt, StreamExt};

    let (mut sender, mut receiver) = socket.split();
    let channel = user_channel(user_id);
    let (mut envelopes, token) = match delivery::connect_user(&state.ctx, user_id).await {
        Ok(connected) => connected,
        Err(api_error) => {
            warn!(%channel, error = %api_error.message, "ws connect rejected");
            return;
        }
    };
    info!(%channel, "delivery channel attached");

    let send_task = tokio::spawn(async move {
        while let Some(envelope) = envelopes.recv().await {
            let text = match serde_json::to_string(&envelope) {
                Ok(text) => text,
                Err(_) => continue,
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(message)) = receiver.next().await {
        if let Message::Text(text) = message {
            // Typing indicators are the only inbound envelopes; the
            // connection's identity wins over whatever the client wrote.
            if let Ok(Envelope::Typing { chat_id, typing, .. }) =
                serde_json::from_str::<Envelope>(&text)
            {
                if let Err(api_error) =
                    delivery::notify_typing(&state.ctx, chat_id, user_id, typing).await
                {
                    warn!(user_id = user_id.0, error = %api_error.message, "typing relay rejected");
                }
            }
        }
    }

    send_task.abort();
    if let Err(api_error) = delivery::disconnect_user(&state.ctx, user_id, token).await {
        warn!(%channel, error = %api_error.message, "disconnect cleanup failed");
    }
    info!(%channel, "delivery channel detached");
}

fn reject(error: ApiError) -> (StatusCode, Json<ApiError>) {
    let status = match error.code {
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Forbidden => StatusCode::FORBIDDEN,
        ErrorCode::Capacity => StatusCode::SERVICE_UNAVAILABLE,
        ErrorCode::Delivery => StatusCode::BAD_GATEWAY,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(error))
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
