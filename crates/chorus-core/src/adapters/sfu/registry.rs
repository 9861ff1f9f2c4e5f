//! Process-wide room registry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::info;

use crate::domain::identity::{ParticipantId, RoomId};

use super::room::Room;

/// Maps room ids to live rooms, creating them on demand.
///
/// Every lookup runs under one mutex; the coordinator task a creation starts
/// runs independently of it.
pub struct RoomRegistry {
    rooms: Mutex<HashMap<RoomId, Arc<Room>>>,
    next_participant_id: AtomicU64,
}

impl RoomRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            rooms: Mutex::new(HashMap::new()),
            next_participant_id: AtomicU64::new(1),
        })
    }

    /// Returns the existing room or creates one and starts its coordinator.
    // TODO: evict empty rooms; entries currently live for the process lifetime.
    pub fn get_or_create(&self, id: &RoomId) -> Arc<Room> {
        let mut rooms = self.rooms.lock().unwrap();
        if let Some(room) = rooms.get(id) {
            return Arc::clone(room);
        }
        let room = Room::spawn(id.clone());
        rooms.insert(id.clone(), Arc::clone(&room));
        info!(room = %id, "created room");
        room
    }

    pub fn get(&self, id: &RoomId) -> Option<Arc<Room>> {
        self.rooms.lock().unwrap().get(id).map(Arc::clone)
    }

    /// Removes the entry if present; idempotent.
    pub fn remove(&self, id: &RoomId) {
        self.rooms.lock().unwrap().remove(id);
    }

    /// Allocate a process-unique participant id.
    pub fn next_participant_id(&self) -> ParticipantId {
        ParticipantId(self.next_participant_id.fetch_add(1, Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_or_create_returns_the_same_room() {
        let registry = RoomRegistry::new();
        let id = RoomId::from("alpha");
        let a = registry.get_or_create(&id);
        let b = registry.get_or_create(&id);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn get_misses_unknown_rooms() {
        let registry = RoomRegistry::new();
        assert!(registry.get(&RoomId::from("nowhere")).is_none());

        let id = RoomId::from("beta");
        let created = registry.get_or_create(&id);
        let fetched = registry.get(&id).unwrap();
        assert!(Arc::ptr_eq(&created, &fetched));
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let registry = RoomRegistry::new();
        let id = RoomId::from("gamma");
        registry.get_or_create(&id);
        registry.remove(&id);
        registry.remove(&id);
        assert!(registry.get(&id).is_none());
    }

    #[tokio::test]
    async fn participant_ids_are_unique() {
        let registry = RoomRegistry::new();
        let a = registry.next_participant_id();
        let b = registry.next_participant_id();
        assert_ne!(a, b);
    }
}


