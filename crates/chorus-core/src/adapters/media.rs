//! Media-plane construction and codec discovery.
//!
//! Wraps the `webrtc` crate: peer-connection assembly with the default codec
//! set and interceptor registry, outbound Opus track creation, and the SDP
//! scan that decides whether a remote offer can carry Opus at all.

use std::sync::Arc;

use async_trait::async_trait;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_remote::TrackRemote;

use crate::application::ports::FeedbackSink;
use crate::config::SfuConfig;
use crate::domain::identity::Ssrc;

/// Builds peer connections and outbound tracks from one shared configuration.
///
/// Constructed once at startup and passed by handle; nothing here is a
/// process global.
pub struct PeerFactory {
    ice_servers: Vec<RTCIceServer>,
}

impl PeerFactory {
    pub fn new(config: &SfuConfig) -> Self {
        let ice_servers = vec![RTCIceServer {
            urls: config.ice_servers.clone(),
            ..Default::default()
        }];
        Self { ice_servers }
    }

    /// New peer connection with the default codec set and interceptors.
    pub async fn new_peer_connection(&self) -> Result<Arc<RTCPeerConnection>, webrtc::Error> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };

        Ok(Arc::new(api.new_peer_connection(config).await?))
    }

    /// Fresh Opus send track under a caller-chosen stream identifier.
    pub fn new_audio_track(&self, ssrc: Ssrc) -> Arc<TrackLocalStaticRTP> {
        Arc::new(TrackLocalStaticRTP::new(
            opus_capability(),
            format!("audio-{ssrc:08x}"),
            "chorus".to_string(),
        ))
    }

    /// Outbound mirror of an inbound remote track, reusing its codec
    /// parameters and stream identifier.
    pub fn new_forward_track(&self, remote: &TrackRemote) -> Arc<TrackLocalStaticRTP> {
        Arc::new(TrackLocalStaticRTP::new(
            remote.codec().capability,
            format!("audio-{:08x}", remote.ssrc()),
            "chorus".to_string(),
        ))
    }
}

/// The peer connection is the production feedback sink. PLI doubles as the
/// periodic upstream probe; genuine receiver reports come from the default
/// interceptor registry.
#[async_trait]
impl FeedbackSink for RTCPeerConnection {
    async fn send_feedback(&self, media_ssrc: Ssrc) -> anyhow::Result<()> {
        let pli = PictureLossIndication {
            sender_ssrc: 0,
            media_ssrc,
        };
        self.write_rtcp(&[Box::new(pli)]).await?;
        Ok(())
    }
}

fn opus_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: MIME_TYPE_OPUS.to_string(),
        clock_rate: 48000,
        channels: 2,
        ..Default::default()
    }
}

/// Locate the payload type the remote assigned to Opus, if any.
///
/// Scans `a=rtpmap:<pt> <codec>/<rate>[/<channels>]` lines; the codec name is
/// matched case-insensitively, as offers in the wild spell it both ways.
pub fn opus_payload_type(sdp: &str) -> Option<u8> {
    for line in sdp.lines() {
        let Some(rest) = line.trim().strip_prefix("a=rtpmap:") else {
            continue;
        };
        let mut parts = rest.splitn(2, ' ');
        let (Some(pt), Some(codec)) = (parts.next(), parts.next()) else {
            continue;
        };
        let codec = codec.as_bytes();
        if codec.len() > 4 && codec[..4].eq_ignore_ascii_case(b"opus") && codec[4] == b'/' {
            return pt.parse().ok();
        }
    }
    None
}
