use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Room id -> user ids currently participating.
///
/// Rooms exist only while they have participants.
#[derive(Default, Clone)]
pub struct RoomMembership {
    inner: Arc<RwLock<HashMap<String, HashSet<String>>>>,
}

impl RoomMembership {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(&self, room_id: &str, user_id: &str) {
        self.inner
            .write()
            .entry(room_id.to_string())
            .or_default()
            .insert(user_id.to_string());
    }

    pub fn leave(&self, room_id: &str, user_id: &str) {
        let mut guard = self.inner.write();
        if let Some(participants) = guard.get_mut(room_id) {
            participants.remove(user_id);
            if participants.is_empty() {
                guard.remove(room_id);
            }
        }
    }

    pub fn participants_of(&self, room_id: &str) -> HashSet<String> {
        self.inner.read().get(room_id).cloned().unwrap_or_default()
    }

    pub fn rooms_of(&self, user_id: &str) -> Vec<String> {
        self.inner
            .read()
            .iter()
            .filter(|(_, participants)| participants.contains(user_id))
            .map(|(room_id, _)| room_id.clone())
            .collect()
    }

    pub fn room_count(&self) -> usize {
        self.inner.read().len()
    }
}
