//! Room presence: who is currently in the collaboration room.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::types::{Participant, ParticipantId};

const EVENT_CAPACITY: usize = 256;

/// Presence change notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceEvent {
    Joined(Participant),
    Left(ParticipantId),
}

/// Read side of the presence system.
///
/// The voice session calls `participants()` once on connect; later changes
/// arrive as [`PresenceEvent`]s.
pub trait Presence: Send + Sync {
    fn participants(&self) -> Vec<Participant>;
}

/// In-memory room roster that broadcasts join/leave events
#[derive(Clone)]
pub struct RoomRoster {
    members: Arc<DashMap<ParticipantId, Participant>>,
    events: broadcast::Sender<PresenceEvent>,
}

impl Default for RoomRoster {
    fn default() -> Self {
        Self::new()
    }
}

impl RoomRoster {
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            members: Arc::new(DashMap::new()),
            events,
        }
    }

    /// Add a participant. Returns false if the id was already present.
    pub fn join(&self, participant: Participant) -> bool {
        let id = participant.id.clone();
        if self.members.contains_key(&id) {
            debug!(participant = %id, "Participant already in room");
            return false;
        }
        self.members.insert(id.clone(), participant.clone());
        info!(participant = %id, members = self.members.len(), "Participant joined room");
        let _ = self.events.send(PresenceEvent::Joined(participant));
        true
    }

    pub fn leave(&self, id: &ParticipantId) -> Option<Participant> {
        let (_, removed) = self.members.remove(id)?;
        info!(participant = %id, members = self.members.len(), "Participant left room");
        let _ = self.events.send(PresenceEvent::Left(id.clone()));
        Some(removed)
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PresenceEvent> {
        self.events.subscribe()
    }

    #[must_use]
    pub fn contains(&self, id: &ParticipantId) -> bool {
        self.members.contains_key(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

impl Presence for RoomRoster {
    /// Sorted by id so callers see a stable order
    fn participants(&self) -> Vec<Participant> {
        let mut list: Vec<Participant> = self
            .members
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_join_and_leave_events() {
        let roster = RoomRoster::new();
        let mut events = roster.subscribe();

        assert!(roster.join(Participant::new("bob")));
        assert!(!roster.join(Participant::new("bob")));
        assert_eq!(roster.len(), 1);

        assert_eq!(
            events.recv().await.unwrap(),
            PresenceEvent::Joined(Participant::new("bob"))
        );

        assert!(roster.leave(&"bob".into()).is_some());
        assert!(roster.leave(&"bob".into()).is_none());
        assert_eq!(
            events.recv().await.unwrap(),
            PresenceEvent::Left("bob".into())
        );
        assert!(roster.is_empty());
    }

    #[test]
    fn test_participants_sorted() {
        let roster = RoomRoster::new();
        roster.join(Participant::new("carol"));
        roster.join(Participant::new("alice"));
        roster.join(Participant::new("bob"));

        let ids: Vec<String> = roster
            .participants()
            .into_iter()
            .map(|p| p.id.to_string())
            .collect();
        assert_eq!(ids, vec!["alice", "bob", "carol"]);
        assert!(roster.contains(&"alice".into()));
    }
}
