//! Domain events published by the user-management service.
//!
//! Events travel on two subjects, [`SUBJECT_USER_CREATED`] and
//! [`SUBJECT_USER_UPDATED`]. Each message is a [`DataEnvelope`] wrapping a
//! JSON-encoded [`UserEvent`]. `UserEvent` is a tagged union, so a predicate
//! matches on the variant rather than downcasting a dynamic payload.

pub mod envelope;

pub use envelope::{DataEnvelope, DecodeError};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Subject carrying user creation events.
pub const SUBJECT_USER_CREATED: &str = "User.Created";

/// Subject carrying user update events.
pub const SUBJECT_USER_UPDATED: &str = "User.Updated";

/// Discriminant of a [`UserEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    CreateStudent,
    UpdateStudent,
    CreateParent,
    UpdateParent,
}

impl EventKind {
    /// The subject events of this kind are published on.
    pub fn subject(self) -> &'static str {
        match self {
            EventKind::CreateStudent | EventKind::CreateParent => SUBJECT_USER_CREATED,
            EventKind::UpdateStudent | EventKind::UpdateParent => SUBJECT_USER_UPDATED,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventKind::CreateStudent => "create_student",
            EventKind::UpdateStudent => "update_student",
            EventKind::CreateParent => "create_parent",
            EventKind::UpdateParent => "update_parent",
        };
        f.write_str(name)
    }
}

/// Payload of student create/update events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudentEvent {
    pub student_id: String,
    pub student_name: String,
    #[serde(default)]
    pub student_first_name: String,
    #[serde(default)]
    pub student_last_name: String,
    #[serde(default)]
    pub location_ids: Vec<String>,
    #[serde(default)]
    pub tag_ids: Vec<String>,
}

/// Payload of parent create/update events. A parent event always names the
/// student it is linked to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentEvent {
    pub student_id: String,
    pub student_name: String,
    pub parent_id: String,
    #[serde(default)]
    pub parent_name: String,
}

/// User domain event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum UserEvent {
    CreateStudent(StudentEvent),
    UpdateStudent(StudentEvent),
    CreateParent(ParentEvent),
    UpdateParent(ParentEvent),
}

impl UserEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            UserEvent::CreateStudent(_) => EventKind::CreateStudent,
            UserEvent::UpdateStudent(_) => EventKind::UpdateStudent,
            UserEvent::CreateParent(_) => EventKind::CreateParent,
            UserEvent::UpdateParent(_) => EventKind::UpdateParent,
        }
    }

    /// Name of the student the event concerns.
    pub fn student_name(&self) -> &str {
        match self {
            UserEvent::CreateStudent(e) | UserEvent::UpdateStudent(e) => &e.student_name,
            UserEvent::CreateParent(e) | UserEvent::UpdateParent(e) => &e.student_name,
        }
    }

    /// Id of the student the event concerns.
    pub fn student_id(&self) -> &str {
        match self {
            UserEvent::CreateStudent(e) | UserEvent::UpdateStudent(e) => &e.student_id,
            UserEvent::CreateParent(e) | UserEvent::UpdateParent(e) => &e.student_id,
        }
    }

    /// Location ids carried by student events; empty for parent events.
    pub fn location_ids(&self) -> &[String] {
        match self {
            UserEvent::CreateStudent(e) | UserEvent::UpdateStudent(e) => &e.location_ids,
            _ => &[],
        }
    }

    pub fn subject(&self) -> &'static str {
        self.kind().subject()
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}

/// Decode a raw bus payload into its envelope and event.
pub fn decode_message(data: &[u8]) -> Result<(DataEnvelope, UserEvent), DecodeError> {
    let envelope = DataEnvelope::decode(data)?;
    let payload = envelope.payload()?;
    let event = UserEvent::decode(&payload).map_err(DecodeError::Event)?;
    Ok((envelope, event))
}

/// Encode an event inside an envelope, ready to publish.
pub fn encode_message(
    event: &UserEvent,
    resource_path: &str,
    user_id: &str,
) -> Result<Vec<u8>, serde_json::Error> {
    let payload = event.encode()?;
    DataEnvelope::new(&payload, resource_path, user_id).encode()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn student_event(name: &str) -> UserEvent {
        UserEvent::CreateStudent(StudentEvent {
            student_id: "student-1".to_string(),
            student_name: name.to_string(),
            student_first_name: String::new(),
            student_last_name: String::new(),
            location_ids: vec!["loc-1".to_string()],
            tag_ids: vec![],
        })
    }

    #[test]
    fn test_event_wire_format_is_tagged() {
        let encoded = student_event("user-42").encode().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(value["kind"], "create_student");
        assert_eq!(value["data"]["student_name"], "user-42");
    }

    #[test]
    fn test_decode_message_unwraps_envelope() {
        let data = encode_message(&student_event("user-42"), "org-1", "admin-1").unwrap();
        let (envelope, event) = decode_message(&data).unwrap();

        assert_eq!(envelope.resource_path, "org-1");
        assert_eq!(envelope.user_id, "admin-1");
        assert_eq!(event.student_name(), "user-42");
        assert_eq!(event.subject(), SUBJECT_USER_CREATED);
    }

    #[test]
    fn test_decode_message_rejects_unknown_kind() {
        let payload = br#"{"kind":"delete_student","data":{}}"#;
        let data = DataEnvelope::new(payload, "org-1", "").encode().unwrap();
        assert!(matches!(decode_message(&data), Err(DecodeError::Event(_))));
    }

    #[test]
    fn test_parent_event_subjects() {
        assert_eq!(EventKind::CreateParent.subject(), SUBJECT_USER_CREATED);
        assert_eq!(EventKind::UpdateParent.subject(), SUBJECT_USER_UPDATED);
        assert_eq!(EventKind::UpdateStudent.subject(), SUBJECT_USER_UPDATED);
    }
}
