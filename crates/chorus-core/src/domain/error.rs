//! Error kinds for the signaling and renegotiation paths.
//!
//! Messages double as the `desc` field of the error events clients receive.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SignalError {
    /// The inbound offer's codec table carries no Opus entry.
    #[error("remote peer does not support opus codec")]
    UnsupportedCodec,

    /// An answer arrived before any offer ever constructed a peer connection.
    #[error("participant has no peer connection")]
    NoPeerConnection,

    /// Recognized frame, but not a shape this server handles.
    #[error("not implemented")]
    NotImplemented,

    /// The raw frame was not valid JSON (or an event failed to serialize).
    #[error("malformed event: {0}")]
    Malformed(#[source] serde_json::Error),

    /// Negotiation finished but the peer connection has no local description.
    #[error("no local description after negotiation")]
    NoLocalDescription,

    /// The peer connection stayed mid-negotiation past the deferral bound.
    #[error("peer connection never returned to a stable signaling state")]
    NeverStable,

    /// Any media-plane failure during offer/answer creation or application.
    #[error("negotiation failed: {0}")]
    Negotiation(#[from] webrtc::Error),
}


