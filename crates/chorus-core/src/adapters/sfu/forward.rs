//! Per-track forwarding fabric.
//!
//! Runs as the body of the peer connection's remote-track callback: one loop
//! copies RTP from the publisher's inbound track onto a shared outbound
//! track, while a companion ticker nudges the publisher with receiver
//! feedback. Fan-out is the media library's: the same outbound track is
//! attached to every other participant's peer connection, so one write
//! reaches all of them.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use webrtc::track::track_local::TrackLocalWriter;
use webrtc::track::track_remote::TrackRemote;

use crate::application::ports::FeedbackSink;
use crate::domain::identity::Ssrc;

use super::participant::Participant;

/// Cadence of the upstream receiver-feedback probe.
pub const FEEDBACK_INTERVAL: Duration = Duration::from_secs(3);

/// Forward one inbound remote track until it closes.
pub(crate) fn run(
    participant: Arc<Participant>,
    remote: Arc<TrackRemote>,
) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    Box::pin(run_inner(participant, remote))
}

async fn run_inner(participant: Arc<Participant>, remote: Arc<TrackRemote>) {
    let ssrc = remote.ssrc();
    info!(
        participant = %participant.id(),
        ssrc,
        codec = %remote.codec().capability.mime_type,
        "inbound track started"
    );

    let Some(pc) = participant.peer() else {
        // The callback only fires on a live connection.
        return;
    };

    // Feedback ticker lives exactly as long as this forwarding loop.
    let cancel = CancellationToken::new();
    tokio::spawn(feedback_loop(
        pc as Arc<dyn FeedbackSink>,
        ssrc,
        cancel.clone(),
    ));
    let _stop_feedback = cancel.drop_guard();

    // One shared outbound track per source, keyed by the remote stream id.
    let local = participant.media().new_forward_track(&remote);
    participant.register_published(ssrc, Arc::clone(&local));

    // Advertise to everyone already in the room (snapshot; later joiners are
    // caught up from their own offer handling).
    let owner = participant.id();
    for other in participant.room().members_excluding(owner) {
        let track = Arc::clone(&local);
        tokio::spawn(async move {
            if let Err(e) = other.advertise(owner, &[(ssrc, track)]).await {
                warn!(
                    participant = %other.id(),
                    publisher = %owner,
                    error = %e,
                    "failed to advertise new track"
                );
                other.send_error(&e).await;
            }
        });
    }

    loop {
        let packet = match remote.read_rtp().await {
            Ok((packet, _attributes)) => packet,
            Err(e) => {
                debug!(participant = %participant.id(), ssrc, error = %e, "inbound track closed");
                break;
            }
        };
        if let Err(e) = local.write_rtp(&packet).await {
            if write_is_fatal(&e) {
                warn!(participant = %participant.id(), ssrc, error = %e, "outbound track write failed");
                break;
            }
        }
    }
    info!(participant = %participant.id(), ssrc, "forwarding stopped");
}

/// Whether an outbound write failure ends the forwarding loop. A receiver
/// dropping mid-write is routine; anything else is fatal.
fn write_is_fatal(error: &webrtc::Error) -> bool {
    !matches!(error, webrtc::Error::ErrClosedPipe)
}

/// Emit one receiver-feedback packet toward the publisher every interval.
/// Write errors are logged and the ticker keeps going; cancellation ends it.
async fn feedback_loop(sink: Arc<dyn FeedbackSink>, media_ssrc: Ssrc, cancel: CancellationToken) {
    let mut ticker = interval_at(Instant::now() + FEEDBACK_INTERVAL, FEEDBACK_INTERVAL);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = sink.send_feedback(media_ssrc).await {
                    debug!(media_ssrc, error = %e, "receiver feedback write failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<Ssrc>>,
        fail: bool,
    }

    #[async_trait::async_trait]
    impl FeedbackSink for RecordingSink {
        async fn send_feedback(&self, media_ssrc: Ssrc) -> anyhow::Result<()> {
            self.sent.lock().unwrap().push(media_ssrc);
            if self.fail {
                anyhow::bail!("control transport down");
            }
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn feedback_fires_on_the_cadence() {
        let sink = Arc::new(RecordingSink::default());
        let cancel = CancellationToken::new();
        tokio::spawn(feedback_loop(
            Arc::clone(&sink) as Arc<dyn FeedbackSink>,
            0xABCD,
            cancel.clone(),
        ));

        tokio::time::sleep(FEEDBACK_INTERVAL * 3 + Duration::from_millis(500)).await;
        assert_eq!(*sink.sent.lock().unwrap(), vec![0xABCD, 0xABCD, 0xABCD]);
    }

    #[tokio::test(start_paused = true)]
    async fn feedback_errors_do_not_stop_the_ticker() {
        let sink = Arc::new(RecordingSink {
            sent: Mutex::new(Vec::new()),
            fail: true,
        });
        let cancel = CancellationToken::new();
        tokio::spawn(feedback_loop(
            Arc::clone(&sink) as Arc<dyn FeedbackSink>,
            7,
            cancel.clone(),
        ));

        tokio::time::sleep(FEEDBACK_INTERVAL * 2 + Duration::from_millis(500)).await;
        assert_eq!(sink.sent.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_the_feedback_ticker() {
        let sink = Arc::new(RecordingSink::default());
        let cancel = CancellationToken::new();
        tokio::spawn(feedback_loop(
            Arc::clone(&sink) as Arc<dyn FeedbackSink>,
            7,
            cancel.clone(),
        ));

        tokio::time::sleep(FEEDBACK_INTERVAL + Duration::from_millis(500)).await;
        cancel.cancel();
        tokio::time::sleep(FEEDBACK_INTERVAL * 3).await;
        assert_eq!(sink.sent.lock().unwrap().len(), 1);
    }

    #[test]
    fn closed_downstream_pipe_is_tolerated() {
        assert!(!write_is_fatal(&webrtc::Error::ErrClosedPipe));
    }

    #[test]
    fn other_write_failures_end_the_loop() {
        assert!(write_is_fatal(&webrtc::Error::new(
            "srtp context torn down".to_string()
        )));
    }
}


