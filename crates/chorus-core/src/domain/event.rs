//! Signaling message schema (the client ↔ server wire protocol).
//!
//! One JSON object per text frame. The session descriptions inside are the
//! media-plane library's canonical form and pass through the SFU opaquely.

use serde::{Deserialize, Serialize};
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use super::error::SignalError;

/// A signaling event, tagged by its `type` field.
///
/// Payload fields are optional on the wire; dispatch treats a recognized tag
/// with a missing payload the same as an unrecognized tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Event {
    Offer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        offer: Option<RTCSessionDescription>,
    },
    Answer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        answer: Option<RTCSessionDescription>,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        desc: Option<String>,
    },
    /// Anything with an unrecognized `type` tag.
    #[serde(other)]
    Unknown,
}

impl Event {
    pub fn offer(offer: RTCSessionDescription) -> Self {
        Self::Offer { offer: Some(offer) }
    }

    pub fn answer(answer: RTCSessionDescription) -> Self {
        Self::Answer {
            answer: Some(answer),
        }
    }

    pub fn error(desc: impl Into<String>) -> Self {
        Self::Error {
            desc: Some(desc.into()),
        }
    }

    /// Decode one normalized frame.
    ///
    /// Invalid JSON is a malformed event; valid JSON that does not fit any
    /// known shape decodes to [`Event::Unknown`] so dispatch can answer
    /// "not implemented" instead of dropping the connection.
    pub fn decode(raw: &str) -> Result<Self, SignalError> {
        let value: serde_json::Value =
            serde_json::from_str(raw).map_err(SignalError::Malformed)?;
        Ok(serde_json::from_value(value).unwrap_or(Event::Unknown))
    }

    pub fn encode(&self) -> Result<Vec<u8>, SignalError> {
        serde_json::to_vec(self).map_err(SignalError::Malformed)
    }
}

/// Flatten newlines and trim an inbound frame.
///
/// The writer side coalesces queued frames with `\n`, so a payload must never
/// carry one.
pub fn normalize_frame(frame: &str) -> String {
    frame.replace(['\r', '\n'], " ").trim().to_string()
}
