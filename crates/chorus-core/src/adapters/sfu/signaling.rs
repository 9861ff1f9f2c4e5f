//! Per-participant signaling loops.
//!
//! The reader parses client events off the transport and dispatches each on
//! a fresh task; the writer is the transport's sole writing task, multiplexing
//! the outbox with a liveness ping ticker.

use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, Instant};
use tracing::{debug, warn};

use crate::application::ports::Frame;
#[cfg(test)]
use crate::application::ports::SignalingTransport;

use super::participant::Participant;

/// Time allowed to write one message to the transport.
pub const WRITE_WAIT: Duration = Duration::from_secs(10);

/// Inbound silence tolerated before the connection is considered dead.
pub const PONG_WAIT: Duration = Duration::from_secs(60);

/// Ping cadence. Must be shorter than [`PONG_WAIT`].
pub const PING_PERIOD: Duration = Duration::from_secs(54);

/// Maximum inbound frame size in bytes.
pub const MAX_FRAME_LEN: usize = 51200;

/// Start the writer and reader tasks for one participant.
pub fn spawn(participant: Arc<Participant>, outbox: mpsc::Receiver<Bytes>) {
    tokio::spawn(write_loop(Arc::clone(&participant), outbox));
    tokio::spawn(read_loop(participant));
}

/// Pump frames from the transport into per-event handler tasks. Any exit
/// (error, deadline, oversize frame, client close) tears the participant
/// down.
async fn read_loop(participant: Arc<Participant>) {
    let transport = participant.transport();
    loop {
        let frame = match timeout(PONG_WAIT, transport.recv()).await {
            Err(_) => {
                debug!(participant = %participant.id(), "read deadline expired");
                break;
            }
            Ok(Err(e)) => {
                debug!(participant = %participant.id(), error = %e, "signaling read failed");
                break;
            }
            Ok(Ok(None)) => break,
            Ok(Ok(Some(frame))) => frame,
        };

        let raw = match frame {
            Frame::Pong => continue,
            Frame::Text(raw) => raw,
        };
        if raw.len() > MAX_FRAME_LEN {
            warn!(
                participant = %participant.id(),
                len = raw.len(),
                "inbound frame exceeds size cap"
            );
            break;
        }

        let raw = crate::domain::event::normalize_frame(&raw);
        let handler = Arc::clone(&participant);
        tokio::spawn(async move {
            if let Err(e) = handler.handle_event(&raw).await {
                debug!(participant = %handler.id(), error = %e, "event handler failed");
                handler.send_error(&e).await;
            }
        });
    }
    participant.disconnect().await;
}

/// Drain the outbox onto the transport. Queued frames are coalesced into one
/// newline-separated message per write; outbox closure sends a close frame
/// and ends the task.
async fn write_loop(participant: Arc<Participant>, mut outbox: mpsc::Receiver<Bytes>) {
    let transport = participant.transport();
    let mut ping = interval_at(Instant::now() + PING_PERIOD, PING_PERIOD);
    loop {
        tokio::select! {
            frame = outbox.recv() => {
                let Some(frame) = frame else {
                    // Outbox closed by the room coordinator.
                    break;
                };
                let mut payload = BytesMut::from(&frame[..]);
                while let Ok(next) = outbox.try_recv() {
                    payload.put_u8(b'\n');
                    payload.extend_from_slice(&next);
                }
                match timeout(WRITE_WAIT, transport.send_text(payload.freeze())).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        debug!(participant = %participant.id(), error = %e, "signaling write failed");
                        return;
                    }
                    Err(_) => {
                        debug!(participant = %participant.id(), "write deadline expired");
                        return;
                    }
                }
            }
            _ = ping.tick() => {
                match timeout(WRITE_WAIT, transport.send_ping()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        debug!(participant = %participant.id(), error = %e, "ping write failed");
                        return;
                    }
                    Err(_) => {
                        debug!(participant = %participant.id(), "ping deadline expired");
                        return;
                    }
                }
            }
        }
    }
    let _ = transport.send_close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::media::PeerFactory;
    use crate::adapters::sfu::room::Room;
    use crate::application::ports::mock::{MockTransport, Sent};
    use crate::config::SfuConfig;
    use crate::domain::event::Event;
    use crate::domain::identity::{ParticipantId, RoomId};
    use tokio::sync::mpsc::UnboundedSender;

    fn fixture(
        room_name: &str,
    ) -> (
        Arc<Participant>,
        mpsc::Receiver<Bytes>,
        Arc<MockTransport>,
        UnboundedSender<anyhow::Result<Frame>>,
        Arc<Room>,
    ) {
        let room = Room::spawn(RoomId::from(room_name));
        let (transport, handle) = MockTransport::new();
        let (participant, outbox) = Participant::new(
            ParticipantId(1),
            Arc::clone(&room),
            Arc::clone(&transport) as Arc<dyn SignalingTransport>,
            Arc::new(PeerFactory::new(&SfuConfig::default())),
            Arc::new(SfuConfig::default()),
        );
        (participant, outbox, transport, handle, room)
    }

    async fn wait_for<F: Fn() -> bool>(what: &str, predicate: F) {
        for _ in 0..400 {
            if predicate() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for {what}");
    }

    #[tokio::test]
    async fn writer_coalesces_queued_frames_with_newlines() {
        let (participant, outbox, transport, _handle, _room) = fixture("coalesce");

        // Queue before the writer starts so the batch is deterministic.
        for desc in ["one", "two", "three"] {
            participant.send_json(&Event::error(desc)).await.unwrap();
        }
        tokio::spawn(write_loop(Arc::clone(&participant), outbox));

        wait_for("coalesced write", || !transport.sent_texts().is_empty()).await;
        let texts = transport.sent_texts();
        assert_eq!(texts.len(), 1);
        let frames: Vec<&str> = texts[0].split('\n').collect();
        assert_eq!(frames.len(), 3);
        for (frame, desc) in frames.iter().zip(["one", "two", "three"]) {
            match Event::decode(frame).unwrap() {
                Event::Error { desc: Some(d) } => assert_eq!(d, desc),
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn concurrent_producers_never_interleave_frames() {
        let (participant, outbox, transport, _handle, _room) = fixture("single-writer");
        tokio::spawn(write_loop(Arc::clone(&participant), outbox));

        let mut tasks = Vec::new();
        for i in 0..32 {
            let p = Arc::clone(&participant);
            tasks.push(tokio::spawn(async move {
                p.send_json(&Event::error(format!("frame-{i}"))).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        wait_for("all frames written", || {
            transport
                .sent_texts()
                .iter()
                .flat_map(|t| t.split('\n'))
                .count()
                == 32
        })
        .await;
        // Every frame decodes cleanly: no partial or interleaved writes.
        for text in transport.sent_texts() {
            for frame in text.split('\n') {
                assert!(matches!(
                    Event::decode(frame).unwrap(),
                    Event::Error { desc: Some(_) }
                ));
            }
        }
    }

    #[tokio::test]
    async fn writer_sends_close_frame_when_outbox_closes() {
        let (participant, outbox, transport, _handle, _room) = fixture("close-frame");
        let writer = tokio::spawn(write_loop(Arc::clone(&participant), outbox));
        participant.close_outbox();
        writer.await.unwrap();
        assert_eq!(transport.sent(), vec![Sent::Close]);
    }

    #[tokio::test(start_paused = true)]
    async fn writer_pings_on_the_liveness_cadence() {
        let (participant, outbox, transport, _handle, _room) = fixture("ping-cadence");
        tokio::spawn(write_loop(Arc::clone(&participant), outbox));

        tokio::time::sleep(PING_PERIOD * 3 + Duration::from_secs(1)).await;
        let pings = transport
            .sent()
            .into_iter()
            .filter(|s| *s == Sent::Ping)
            .count();
        assert_eq!(pings, 3);
    }

    #[tokio::test]
    async fn reader_replies_not_implemented_for_unknown_events() {
        let (participant, mut outbox, _transport, handle, _room) = fixture("unknown-event");
        tokio::spawn(read_loop(Arc::clone(&participant)));

        handle
            .send(Ok(Frame::Text(r#"{"type":"subscribe"}"#.to_string())))
            .unwrap();
        let frame = outbox.recv().await.unwrap();
        match Event::decode(std::str::from_utf8(&frame).unwrap()).unwrap() {
            Event::Error { desc: Some(desc) } => assert_eq!(desc, "not implemented"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn reader_reports_malformed_frames_and_keeps_reading() {
        let (participant, mut outbox, _transport, handle, room) = fixture("malformed");
        room.join(Arc::clone(&participant)).await;
        wait_for("join", || room.count() == 1).await;
        tokio::spawn(read_loop(Arc::clone(&participant)));

        handle.send(Ok(Frame::Text("{not json".to_string()))).unwrap();
        let frame = outbox.recv().await.unwrap();
        match Event::decode(std::str::from_utf8(&frame).unwrap()).unwrap() {
            Event::Error { desc: Some(desc) } => {
                assert!(desc.starts_with("malformed event:"), "desc: {desc}")
            }
            other => panic!("unexpected event: {other:?}"),
        }
        // The reader survived the malformed frame.
        assert_eq!(room.count(), 1);
    }

    #[tokio::test]
    async fn reader_close_removes_participant_from_room() {
        let (participant, mut outbox, _transport, handle, room) = fixture("reader-close");
        room.join(Arc::clone(&participant)).await;
        wait_for("join", || room.count() == 1).await;

        tokio::spawn(read_loop(Arc::clone(&participant)));
        drop(handle); // client closes
        wait_for("leave", || room.count() == 0).await;
        // The coordinator closed the outbox exactly once; the writer side
        // observes end-of-stream.
        assert!(outbox.recv().await.is_none());
    }

    #[tokio::test]
    async fn oversize_frames_are_fatal_to_the_reader() {
        let (participant, _outbox, _transport, handle, room) = fixture("oversize");
        room.join(Arc::clone(&participant)).await;
        wait_for("join", || room.count() == 1).await;

        tokio::spawn(read_loop(Arc::clone(&participant)));
        handle
            .send(Ok(Frame::Text("x".repeat(MAX_FRAME_LEN + 1))))
            .unwrap();
        wait_for("leave", || room.count() == 0).await;
    }

    #[tokio::test(start_paused = true)]
    async fn read_deadline_disconnects_quiet_clients() {
        let (participant, _outbox, _transport, handle, room) = fixture("deadline");
        room.join(Arc::clone(&participant)).await;
        tokio::task::yield_now().await;
        assert_eq!(room.count(), 1);

        tokio::spawn(read_loop(Arc::clone(&participant)));
        // No traffic at all: the sliding deadline fires after PONG_WAIT.
        tokio::time::sleep(PONG_WAIT + Duration::from_secs(1)).await;
        assert_eq!(room.count(), 0);
        drop(handle);
    }

    #[tokio::test(start_paused = true)]
    async fn pong_frames_reset_the_read_deadline() {
        let (participant, _outbox, _transport, handle, room) = fixture("pong-reset");
        room.join(Arc::clone(&participant)).await;
        tokio::task::yield_now().await;
        assert_eq!(room.count(), 1);

        tokio::spawn(read_loop(Arc::clone(&participant)));
        for _ in 0..3 {
            tokio::time::sleep(PONG_WAIT - Duration::from_secs(5)).await;
            handle.send(Ok(Frame::Pong)).unwrap();
        }
        // Well past the original deadline, but never 60 s quiet in a row.
        assert_eq!(room.count(), 1);
        drop(handle);
    }
}


