//! Port traits (interfaces) that the session machinery depends on.
//!
//! Adapters implement these traits; the SFU core never references axum
//! directly, and tests substitute an in-memory transport.

use async_trait::async_trait;
use bytes::Bytes;

use crate::domain::identity::Ssrc;

/// One inbound unit from the signaling transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A complete text message.
    Text(String),
    /// Transport-level liveness reply from the client.
    Pong,
}

/// Abstracts one persistent full-duplex text-message connection (WebSocket is
/// the reference implementation).
///
/// `recv` and the send methods may be called from different tasks; an
/// implementation serializes internally. Binary frames are a protocol
/// violation and surface as an error.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Receive the next frame. `Ok(None)` on normal close.
    async fn recv(&self) -> anyhow::Result<Option<Frame>>;

    /// Write one text message.
    async fn send_text(&self, payload: Bytes) -> anyhow::Result<()>;

    /// Write a transport-level liveness ping.
    async fn send_ping(&self) -> anyhow::Result<()>;

    /// Write a close frame.
    async fn send_close(&self) -> anyhow::Result<()>;
}

/// Write surface for receiver-side control packets addressed to one of a
/// publisher's streams.
///
/// The peer connection is the production implementation; the forwarding
/// fabric only ever needs this one operation from it, and tests substitute a
/// recording sink.
#[async_trait]
pub trait FeedbackSink: Send + Sync {
    /// Emit one receiver-feedback packet for `media_ssrc` upstream.
    async fn send_feedback(&self, media_ssrc: Ssrc) -> anyhow::Result<()>;
}
