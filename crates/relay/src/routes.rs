//! HTTP surface: the websocket login, logout, history and health.

use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::AppState;
use crate::connection::{FrameSink, FrameStream};
use crate::error::{RelayError, Result};
use crate::models::Envelope;
use crate::store::MessageFilter;

/// Build the relay router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_login))
        .route("/ws/logout", post(ws_logout))
        .route("/messages", get(list_messages))
        .route("/health", get(health))
        .with_state(state)
        .layer(tower_http::cors::CorsLayer::permissive())
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

/// Split an upgraded socket into the frame stream/sink pair a connection
/// works with. Control frames never reach the reader.
pub fn split_socket(socket: WebSocket) -> (FrameStream, FrameSink) {
    let (tx, rx) = socket.split();

    let frames = rx
        .filter_map(|message| async move {
            match message {
                Ok(Message::Text(text)) => Some(Ok(text.as_str().to_owned())),
                Ok(Message::Binary(data)) => Some(
                    String::from_utf8(data.to_vec())
                        .map_err(|e| RelayError::Protocol(format!("binary frame is not UTF-8: {e}"))),
                ),
                Ok(Message::Close(_)) => Some(Err(RelayError::ConnectionClosed)),
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => None,
                Err(e) => Some(Err(RelayError::Socket(e.to_string()))),
            }
        })
        .boxed();

    let sink = tx
        .sink_map_err(|e| RelayError::Socket(e.to_string()))
        .with(|frame: String| async move { Ok::<_, RelayError>(Message::Text(frame.into())) });

    (frames, Box::pin(sink))
}

#[derive(Debug, Deserialize)]
pub struct LoginQuery {
    pub client_id: Option<String>,
}

/// GET /ws?client_id=
///
/// Upgrades to a websocket and registers the client.
pub async fn ws_login(
    State(state): State<AppState>,
    Query(query): Query<LoginQuery>,
    ws: std::result::Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let Some(client_id) = query.client_id.filter(|id| !id.trim().is_empty()) else {
        return RelayError::BadRequest("client_id is required".into()).into_response();
    };
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    info!("GET /ws?client_id={}", client_id);
    let lifecycle = state.lifecycle.clone();
    ws.on_upgrade(move |socket| async move {
        let (frames, sink) = split_socket(socket);
        if let Err(e) = lifecycle.login(&client_id, frames, sink).await {
            warn!("Login of {} refused: {}", client_id, e);
        }
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogoutRequest {
    pub owner_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogoutResponse {
    pub owner_id: String,
    pub logged_out: bool,
}

/// POST /ws/logout
pub async fn ws_logout(
    State(state): State<AppState>,
    Json(request): Json<LogoutRequest>,
) -> Json<LogoutResponse> {
    info!("POST /ws/logout {}", request.owner_id);
    let logged_out = state.lifecycle.logout(&request.owner_id).await;
    Json(LogoutResponse {
        owner_id: request.owner_id,
        logged_out,
    })
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub user_one: Option<String>,
    pub user_two: Option<String>,
    pub group_id: Option<String>,
    pub limit: Option<usize>,
}

/// GET /messages?user_one=&user_two= or /messages?group_id=
///
/// Stored envelopes of one conversation, oldest first.
pub async fn list_messages(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<Envelope>>> {
    let filter = match (query.group_id, query.user_one, query.user_two) {
        (Some(group_id), _, _) => MessageFilter::to_recipient(group_id),
        (None, Some(one), Some(two)) => MessageFilter::conversation(one, two),
        _ => {
            return Err(RelayError::BadRequest(
                "either group_id or user_one and user_two are required".into(),
            ))
        }
    };
    let filter = match query.limit {
        Some(limit) => filter.with_limit(limit),
        None => filter,
    };

    let messages = state.store.find_messages(&filter).await?;
    Ok(Json(messages))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Health {
    pub status: String,
    pub node_id: String,
    pub transport: String,
    pub connections: usize,
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> Json<Health> {
    let lifecycle = &state.lifecycle;
    Json(Health {
        status: if lifecycle.is_shutting_down() {
            "stopping".into()
        } else {
            "ok".into()
        },
        node_id: lifecycle.node_id().to_string(),
        transport: lifecycle.transport().name().to_string(),
        connections: lifecycle.registry().len(),
    })
}
