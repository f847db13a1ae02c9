//! Common types used throughout the voice subsystem

use nanoid::nanoid;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Generate a 12-character nanoid for session, stream and track ids
#[must_use]
pub fn generate_id() -> String {
    nanoid!(12)
}

/// Unique identifier for a member of a collaboration room
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ParticipantId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ParticipantId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A room member as reported by the presence system.
///
/// Display metadata is owned by the presence collaborator; it is carried
/// here only so log lines and UIs can show a name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: ParticipantId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

impl Participant {
    pub fn new(id: impl Into<ParticipantId>) -> Self {
        Self {
            id: id.into(),
            display_name: None,
        }
    }

    #[must_use]
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_participant_id_display() {
        let id = ParticipantId::from("alice");
        assert_eq!(id.to_string(), "alice");
        assert_eq!(id.as_str(), "alice");
    }

    #[test]
    fn test_generate_id_unique() {
        let a = generate_id();
        let b = generate_id();
        assert_eq!(a.len(), 12);
        assert_ne!(a, b);
    }

    #[test]
    fn test_participant_serialization() {
        let participant = Participant::new("bob").with_display_name("Bob");
        let json = serde_json::to_value(&participant).unwrap();
        assert_eq!(json["id"], "bob");
        assert_eq!(json["display_name"], "Bob");

        let bare: Participant = serde_json::from_str(r#"{"id":"carol"}"#).unwrap();
        assert_eq!(bare.id, ParticipantId::from("carol"));
        assert!(bare.display_name.is_none());
    }
}
