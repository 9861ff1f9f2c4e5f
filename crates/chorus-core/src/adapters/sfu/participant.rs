//! Participant session state and the offer/answer protocol.
//!
//! A participant owns its signaling transport handle, a bounded outbox
//! drained by the writer task, and a lazily constructed media-plane peer
//! connection. Inbound offers are answered here (client-initiated
//! renegotiation); server-initiated renegotiation advertises other
//! participants' tracks and retires them again on departure.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, Mutex as AsyncMutex, OnceCell};
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;

use crate::adapters::media::{opus_payload_type, PeerFactory};
use crate::application::ports::SignalingTransport;
use crate::config::SfuConfig;
use crate::domain::error::SignalError;
use crate::domain::event::Event;
use crate::domain::identity::{ParticipantId, Ssrc};

use super::forward;
use super::room::Room;

/// Outbound frames buffered toward the writer task.
pub(crate) const OUTBOX_CAPACITY: usize = 256;

/// Poll period and bound for deferring a server-initiated offer while the
/// peer connection is mid-negotiation.
const STABLE_POLL: Duration = Duration::from_millis(100);
const STABLE_WAIT: Duration = Duration::from_secs(10);

pub struct Participant {
    id: ParticipantId,
    room: Arc<Room>,
    transport: Arc<dyn SignalingTransport>,
    /// Sole producer surface toward the writer task; `None` once closed.
    outbox: Mutex<Option<mpsc::Sender<Bytes>>>,
    /// Constructed on the first offer (either direction).
    peer: OnceCell<Arc<RTCPeerConnection>>,
    /// Remote SSRC → the shared outbound track mirroring it. Entries are
    /// created in the inbound-track callback and live as long as we do.
    published: Mutex<HashMap<Ssrc, Arc<TrackLocalStaticRTP>>>,
    /// (owner, ssrc) → our sender for that track; dedupes advertisement and
    /// feeds departure retirement.
    senders: Mutex<HashMap<(ParticipantId, Ssrc), Arc<RTCRtpSender>>>,
    /// Serializes server-initiated renegotiations on this peer connection.
    renegotiation: AsyncMutex<()>,
    media: Arc<PeerFactory>,
    config: Arc<SfuConfig>,
}

impl Participant {
    /// Returns the participant and the receiving half of its outbox, which
    /// the caller hands to the writer task.
    pub fn new(
        id: ParticipantId,
        room: Arc<Room>,
        transport: Arc<dyn SignalingTransport>,
        media: Arc<PeerFactory>,
        config: Arc<SfuConfig>,
    ) -> (Arc<Self>, mpsc::Receiver<Bytes>) {
        let (outbox_tx, outbox_rx) = mpsc::channel(OUTBOX_CAPACITY);
        let participant = Arc::new(Self {
            id,
            room,
            transport,
            outbox: Mutex::new(Some(outbox_tx)),
            peer: OnceCell::new(),
            published: Mutex::new(HashMap::new()),
            senders: Mutex::new(HashMap::new()),
            renegotiation: AsyncMutex::new(()),
            media,
            config,
        });
        (participant, outbox_rx)
    }

    pub fn id(&self) -> ParticipantId {
        self.id
    }

    pub fn room(&self) -> &Arc<Room> {
        &self.room
    }

    pub(crate) fn transport(&self) -> Arc<dyn SignalingTransport> {
        Arc::clone(&self.transport)
    }

    pub fn peer(&self) -> Option<Arc<RTCPeerConnection>> {
        self.peer.get().cloned()
    }

    pub(crate) fn media(&self) -> &PeerFactory {
        self.media.as_ref()
    }

    // -----------------------------------------------------------------------
    // Outbox
    // -----------------------------------------------------------------------

    /// Queue one event for the writer task. Blocks while the outbox is full;
    /// after closure the frame is discarded silently.
    pub async fn send_json(&self, event: &Event) -> Result<(), SignalError> {
        let frame = Bytes::from(event.encode()?);
        let sender = self.outbox.lock().unwrap().clone();
        if let Some(sender) = sender {
            if sender.send(frame).await.is_err() {
                debug!(participant = %self.id, "dropping frame for departed participant");
            }
        }
        Ok(())
    }

    /// Report a handler error to the client.
    pub async fn send_error(&self, error: &SignalError) {
        if let Err(e) = self.send_json(&Event::error(error.to_string())).await {
            debug!(participant = %self.id, error = %e, "failed to queue error event");
        }
    }

    /// Non-blocking enqueue used by room broadcast. False when full or closed.
    pub(crate) fn try_queue(&self, frame: Bytes) -> bool {
        let sender = self.outbox.lock().unwrap().clone();
        match sender {
            Some(sender) => sender.try_send(frame).is_ok(),
            None => false,
        }
    }

    /// Close the outbox. Idempotent; called by the room coordinator on a
    /// processed leave. The writer task drains and exits once every clone of
    /// the sender is gone.
    pub(crate) fn close_outbox(&self) {
        self.outbox.lock().unwrap().take();
    }

    // -----------------------------------------------------------------------
    // Event dispatch
    // -----------------------------------------------------------------------

    /// Handle one normalized inbound frame. Runs on its own task so that
    /// media-plane negotiation never stalls the reader.
    pub async fn handle_event(self: &Arc<Self>, raw: &str) -> Result<(), SignalError> {
        match Event::decode(raw)? {
            Event::Offer { offer: Some(offer) } => self.handle_offer(offer).await,
            Event::Answer {
                answer: Some(answer),
            } => self.handle_answer(answer).await,
            other => {
                debug!(participant = %self.id, event = ?other, "unhandled event shape");
                Err(SignalError::NotImplemented)
            }
        }
    }

    /// Client-initiated renegotiation: the participant is publishing.
    async fn handle_offer(
        self: &Arc<Self>,
        offer: RTCSessionDescription,
    ) -> Result<(), SignalError> {
        // Without Opus in the remote codec table nothing we forward could be
        // decoded; fail before touching the peer connection.
        opus_payload_type(&offer.sdp).ok_or(SignalError::UnsupportedCodec)?;

        let pc = self.peer_connection().await?;

        // A fresh send track under a random stream identifier guarantees the
        // answer carries an audio section; forwarding tracks mirroring real
        // inbound streams are created by the on-track callback instead.
        let placeholder = self.media.new_audio_track(rand::random::<Ssrc>());
        pc.add_track(placeholder as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        pc.set_remote_description(offer).await?;
        let answer = pc.create_answer(None).await?;
        let mut gathered = pc.gathering_complete_promise().await;
        pc.set_local_description(answer).await?;
        let _ = timeout(self.config.gather_timeout(), gathered.recv()).await;

        let answer = pc
            .local_description()
            .await
            .ok_or(SignalError::NoLocalDescription)?;
        self.send_json(&Event::answer(answer)).await?;
        info!(participant = %self.id, "answered publish offer");

        // Late-join catch-up: everything the rest of the room already
        // publishes goes out as one renegotiation per publisher.
        for other in self.room.members_excluding(self.id) {
            let tracks = other.published();
            if tracks.is_empty() {
                continue;
            }
            if let Err(e) = self.advertise(other.id(), &tracks).await {
                warn!(
                    participant = %self.id,
                    publisher = %other.id(),
                    error = %e,
                    "failed to advertise existing tracks"
                );
            }
        }
        Ok(())
    }

    /// The closing half of a server-initiated renegotiation.
    async fn handle_answer(&self, answer: RTCSessionDescription) -> Result<(), SignalError> {
        let pc = self.peer.get().ok_or(SignalError::NoPeerConnection)?;
        pc.set_remote_description(answer).await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Server-initiated renegotiation
    // -----------------------------------------------------------------------

    /// Advertise `tracks` published by `owner` to this participant: attach
    /// whichever are not attached yet, then push one offer.
    ///
    /// Holding the renegotiation lock across the stable-state gate keeps
    /// concurrent advertisements from interleaving mutations on the same
    /// peer connection.
    pub(crate) async fn advertise(
        self: &Arc<Self>,
        owner: ParticipantId,
        tracks: &[(Ssrc, Arc<TrackLocalStaticRTP>)],
    ) -> Result<(), SignalError> {
        let pc = self.peer_connection().await?;
        let _guard = self.renegotiation.lock().await;
        wait_until_stable(&pc).await?;

        let mut added = false;
        for (ssrc, track) in tracks {
            let key = (owner, *ssrc);
            if self.senders.lock().unwrap().contains_key(&key) {
                continue;
            }
            let sender = pc
                .add_track(Arc::clone(track) as Arc<dyn TrackLocal + Send + Sync>)
                .await?;
            self.senders.lock().unwrap().insert(key, sender);
            added = true;
        }
        if !added {
            return Ok(());
        }

        self.push_offer(&pc).await?;
        info!(
            participant = %self.id,
            publisher = %owner,
            tracks = tracks.len(),
            "advertised tracks"
        );
        Ok(())
    }

    /// Drop every track `departed` published toward this participant and
    /// renegotiate the slimmer session.
    pub(crate) async fn retire_tracks_from(
        self: &Arc<Self>,
        departed: ParticipantId,
    ) -> Result<(), SignalError> {
        let Some(pc) = self.peer() else {
            return Ok(());
        };
        let removed: Vec<Arc<RTCRtpSender>> = {
            let mut senders = self.senders.lock().unwrap();
            let keys: Vec<_> = senders
                .keys()
                .filter(|(owner, _)| *owner == departed)
                .copied()
                .collect();
            keys.into_iter().filter_map(|k| senders.remove(&k)).collect()
        };
        if removed.is_empty() {
            return Ok(());
        }

        let _guard = self.renegotiation.lock().await;
        wait_until_stable(&pc).await?;
        for sender in &removed {
            pc.remove_track(sender).await?;
        }
        self.push_offer(&pc).await?;
        info!(
            participant = %self.id,
            departed = %departed,
            tracks = removed.len(),
            "retired departed tracks"
        );
        Ok(())
    }

    async fn push_offer(&self, pc: &Arc<RTCPeerConnection>) -> Result<(), SignalError> {
        let offer = pc.create_offer(None).await?;
        let mut gathered = pc.gathering_complete_promise().await;
        pc.set_local_description(offer).await?;
        let _ = timeout(self.config.gather_timeout(), gathered.recv()).await;

        let offer = pc
            .local_description()
            .await
            .ok_or(SignalError::NoLocalDescription)?;
        self.send_json(&Event::offer(offer)).await
    }

    // -----------------------------------------------------------------------
    // Published-track bookkeeping
    // -----------------------------------------------------------------------

    pub(crate) fn register_published(&self, ssrc: Ssrc, track: Arc<TrackLocalStaticRTP>) {
        self.published.lock().unwrap().insert(ssrc, track);
    }

    /// Snapshot of the tracks this participant publishes to the room.
    pub fn published(&self) -> Vec<(Ssrc, Arc<TrackLocalStaticRTP>)> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .map(|(ssrc, track)| (*ssrc, Arc::clone(track)))
            .collect()
    }

    // -----------------------------------------------------------------------
    // Peer connection lifecycle
    // -----------------------------------------------------------------------

    /// The peer connection, constructed (with its callbacks) on first use.
    async fn peer_connection(self: &Arc<Self>) -> Result<Arc<RTCPeerConnection>, SignalError> {
        self.peer
            .get_or_try_init(|| self.init_peer())
            .await
            .map(Arc::clone)
    }

    async fn init_peer(self: &Arc<Self>) -> Result<Arc<RTCPeerConnection>, SignalError> {
        let pc = self.media.new_peer_connection().await?;

        // Observability only: membership is driven by the signaling reader,
        // not by ICE transitions.
        let weak = Arc::downgrade(self);
        pc.on_ice_connection_state_change(Box::new(move |state| {
            let weak = weak.clone();
            Box::pin(async move {
                let Some(participant) = weak.upgrade() else {
                    return;
                };
                match state {
                    RTCIceConnectionState::Connected => info!(
                        participant = %participant.id(),
                        members = participant.room().count(),
                        "media connected"
                    ),
                    RTCIceConnectionState::Disconnected
                    | RTCIceConnectionState::Failed
                    | RTCIceConnectionState::Closed => info!(
                        participant = %participant.id(),
                        members = participant.room().count(),
                        "media disconnected"
                    ),
                    other => {
                        debug!(participant = %participant.id(), state = %other, "ice state")
                    }
                }
            })
        }));

        let weak = Arc::downgrade(self);
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(participant) = weak.upgrade() {
                    forward::run(participant, track).await;
                }
            })
        }));

        Ok(pc)
    }

    /// Teardown driven by reader exit: leave the room and close the media
    /// plane; the closed outbox then drains the writer.
    pub async fn disconnect(self: &Arc<Self>) {
        self.room.leave(Arc::clone(self)).await;
        if let Some(pc) = self.peer.get() {
            if let Err(e) = pc.close().await {
                debug!(participant = %self.id, error = %e, "peer connection close failed");
            }
        }
    }
}

/// Defer until the connection is out of any in-flight negotiation.
async fn wait_until_stable(pc: &RTCPeerConnection) -> Result<(), SignalError> {
    wait_for_stable(|| pc.signaling_state() == RTCSignalingState::Stable).await
}

/// Poll `is_stable` until it holds or the deferral bound elapses.
async fn wait_for_stable(is_stable: impl Fn() -> bool) -> Result<(), SignalError> {
    let deadline = Instant::now() + STABLE_WAIT;
    while !is_stable() {
        if Instant::now() >= deadline {
            return Err(SignalError::NeverStable);
        }
        sleep(STABLE_POLL).await;
    }
    Ok(())
}
