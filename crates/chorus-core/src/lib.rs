//! chorus-core — shared library for the chorus SFU: WebSocket-signaled,
//! WebRTC-forwarded Opus group calls.
//!
//! # Architecture
//!
//! - **domain**: identifiers, the signaling wire schema, error kinds (no I/O).
//! - **application**: port traits the session machinery depends on.
//! - **adapters**: WebSocket transport (axum), media-plane construction
//!   (webrtc), the HTTP surface, and the SFU itself: rooms, participants,
//!   signaling loops, per-track forwarding.

pub mod adapters;
pub mod application;
pub mod config;
pub mod domain;


