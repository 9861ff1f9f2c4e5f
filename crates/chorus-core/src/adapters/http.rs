//! HTTP surface: health check and the signaling upgrade.
//!
//! `GET /` answers the liveness probe; `GET /{room_id}` upgrades to the
//! signaling WebSocket, with the path segment naming the room. No
//! authentication; any origin is accepted.

use std::sync::Arc;

use axum::extract::ws::WebSocket;
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tracing::info;

use crate::adapters::media::PeerFactory;
use crate::adapters::sfu::participant::Participant;
use crate::adapters::sfu::registry::RoomRegistry;
use crate::adapters::sfu::signaling;
use crate::adapters::ws::WsTransport;
use crate::config::SfuConfig;
use crate::domain::identity::RoomId;

pub struct AppState {
    pub registry: Arc<RoomRegistry>,
    pub media: Arc<PeerFactory>,
    pub config: Arc<SfuConfig>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/:room_id", get(upgrade))
        .with_state(state)
}

async fn health() -> &'static str {
    "pong"
}

async fn upgrade(
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<String>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let room_id = RoomId(room_id.replace('/', ""));
    ws.max_message_size(signaling::MAX_FRAME_LEN)
        .on_upgrade(move |socket| attach(state, room_id, socket))
}

/// Assemble a participant for one upgraded socket and start its loops.
async fn attach(state: Arc<AppState>, room_id: RoomId, socket: WebSocket) {
    let room = state.registry.get_or_create(&room_id);
    let id = state.registry.next_participant_id();
    let transport = Arc::new(WsTransport::new(socket));
    let (participant, outbox) = Participant::new(
        id,
        Arc::clone(&room),
        transport,
        Arc::clone(&state.media),
        Arc::clone(&state.config),
    );
    info!(
        room = %room_id,
        participant = %id,
        members = room.count(),
        "signaling connected"
    );
    room.join(Arc::clone(&participant)).await;
    signaling::spawn(participant, outbox);
}


