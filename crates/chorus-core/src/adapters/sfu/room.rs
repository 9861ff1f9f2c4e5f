//! Per-room membership coordinator.
//!
//! All membership mutation flows through one task multiplexing join, leave,
//! and broadcast channels; enumeration hands out snapshot copies, so callers
//! iterate without holding any lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::domain::identity::{ParticipantId, RoomId};

use super::participant::Participant;

pub struct Room {
    pub id: RoomId,
    /// Mutated only by the coordinator; everyone else gets snapshots.
    members: Mutex<HashMap<ParticipantId, Arc<Participant>>>,
    join_tx: mpsc::Sender<Arc<Participant>>,
    leave_tx: mpsc::Sender<Arc<Participant>>,
    broadcast_tx: mpsc::Sender<Bytes>,
}

impl Room {
    /// Create the room and start its coordinator task.
    pub fn spawn(id: RoomId) -> Arc<Self> {
        let (join_tx, join_rx) = mpsc::channel(1);
        let (leave_tx, leave_rx) = mpsc::channel(1);
        let (broadcast_tx, broadcast_rx) = mpsc::channel(1);
        let room = Arc::new(Self {
            id,
            members: Mutex::new(HashMap::new()),
            join_tx,
            leave_tx,
            broadcast_tx,
        });
        tokio::spawn(coordinate(
            Arc::downgrade(&room),
            join_rx,
            leave_rx,
            broadcast_rx,
        ));
        room
    }

    /// Hand a participant to the coordinator for membership.
    pub async fn join(&self, participant: Arc<Participant>) {
        let _ = self.join_tx.send(participant).await;
    }

    /// Ask the coordinator to remove a participant. Safe for unknowns.
    pub async fn leave(&self, participant: Arc<Participant>) {
        let _ = self.leave_tx.send(participant).await;
    }

    /// Queue a frame for every member's outbox.
    pub async fn broadcast(&self, frame: Bytes) {
        let _ = self.broadcast_tx.send(frame).await;
    }

    /// Snapshot of the current members. May be slightly stale.
    pub fn members(&self) -> Vec<Arc<Participant>> {
        self.members.lock().unwrap().values().cloned().collect()
    }

    /// Snapshot of every member except `id`.
    pub fn members_excluding(&self, id: ParticipantId) -> Vec<Arc<Participant>> {
        self.members
            .lock()
            .unwrap()
            .values()
            .filter(|p| p.id() != id)
            .cloned()
            .collect()
    }

    pub fn count(&self) -> usize {
        self.members.lock().unwrap().len()
    }
}

/// The coordinator loop. Holds only a weak room reference so a room dropped
/// from the registry can actually die; channel closure ends the task.
async fn coordinate(
    room: Weak<Room>,
    mut join_rx: mpsc::Receiver<Arc<Participant>>,
    mut leave_rx: mpsc::Receiver<Arc<Participant>>,
    mut broadcast_rx: mpsc::Receiver<Bytes>,
) {
    loop {
        tokio::select! {
            joined = join_rx.recv() => {
                let (Some(participant), Some(room)) = (joined, room.upgrade()) else {
                    break;
                };
                room.members
                    .lock()
                    .unwrap()
                    .insert(participant.id(), Arc::clone(&participant));
                info!(
                    room = %room.id,
                    participant = %participant.id(),
                    members = room.count(),
                    "participant joined"
                );
            }
            left = leave_rx.recv() => {
                let (Some(participant), Some(room)) = (left, room.upgrade()) else {
                    break;
                };
                let removed = room.members.lock().unwrap().remove(&participant.id());
                let Some(participant) = removed else {
                    debug!(room = %room.id, participant = %participant.id(), "leave for non-member");
                    continue;
                };
                participant.close_outbox();
                info!(
                    room = %room.id,
                    participant = %participant.id(),
                    members = room.count(),
                    "participant left"
                );
                // Remaining members drop the departed participant's tracks.
                let departed = participant.id();
                for member in room.members() {
                    tokio::spawn(async move {
                        if let Err(e) = member.retire_tracks_from(departed).await {
                            debug!(
                                participant = %member.id(),
                                error = %e,
                                "failed to retire departed tracks"
                            );
                        }
                    });
                }
            }
            frame = broadcast_rx.recv() => {
                let (Some(frame), Some(room)) = (frame, room.upgrade()) else {
                    break;
                };
                for member in room.members() {
                    if !member.try_queue(frame.clone()) {
                        debug!(
                            room = %room.id,
                            participant = %member.id(),
                            "dropping broadcast frame for slow consumer"
                        );
                    }
                }
            }
        }
    }
    debug!("room coordinator stopped");
}
