//! The saga event: the unit of communication between steps.

use common::{EventOutcome, EventType, SagaId};
use serde::{Deserialize, Serialize};

/// User recorded on events the engine creates by itself.
pub const SYSTEM_USER: &str = "saga-engine";

/// An immutable saga message.
///
/// Serialized as
/// `{"sagaId", "eventType", "eventOutcome", "eventPayload", "createUser", "updateUser"}`
/// where `eventPayload` is an opaque JSON string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    saga_id: SagaId,
    event_type: EventType,
    event_outcome: EventOutcome,
    event_payload: String,
    create_user: String,
    update_user: String,
}

impl Event {
    /// Creates an event with a raw payload string, attributed to the engine.
    pub fn new(
        saga_id: SagaId,
        event_type: EventType,
        event_outcome: EventOutcome,
        event_payload: impl Into<String>,
    ) -> Self {
        Self {
            saga_id,
            event_type,
            event_outcome,
            event_payload: event_payload.into(),
            create_user: SYSTEM_USER.to_string(),
            update_user: SYSTEM_USER.to_string(),
        }
    }

    /// Creates an event whose payload is `payload` serialized as JSON.
    pub fn with_payload<T: Serialize>(
        saga_id: SagaId,
        event_type: EventType,
        event_outcome: EventOutcome,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(
            saga_id,
            event_type,
            event_outcome,
            serde_json::to_string(payload)?,
        ))
    }

    /// The `INITIATED` / `INITIATE_SUCCESS` event that starts a saga.
    pub fn initiated(saga_id: SagaId, payload: impl Into<String>) -> Self {
        Self::new(
            saga_id,
            EventType::INITIATED,
            EventOutcome::INITIATE_SUCCESS,
            payload,
        )
    }

    /// Sets both audit users.
    pub fn created_by(mut self, user: impl Into<String>) -> Self {
        let user = user.into();
        self.update_user = user.clone();
        self.create_user = user;
        self
    }

    /// Sets the update user, keeping the creator.
    pub fn updated_by(mut self, user: impl Into<String>) -> Self {
        self.update_user = user.into();
        self
    }

    /// Builds the follow-up event for the same saga, keeping the audit users.
    pub fn next(
        &self,
        event_type: EventType,
        event_outcome: EventOutcome,
        event_payload: impl Into<String>,
    ) -> Self {
        Self {
            saga_id: self.saga_id,
            event_type,
            event_outcome,
            event_payload: event_payload.into(),
            create_user: self.create_user.clone(),
            update_user: self.update_user.clone(),
        }
    }

    pub fn saga_id(&self) -> SagaId {
        self.saga_id
    }

    pub fn event_type(&self) -> &EventType {
        &self.event_type
    }

    pub fn event_outcome(&self) -> &EventOutcome {
        &self.event_outcome
    }

    pub fn event_payload(&self) -> &str {
        &self.event_payload
    }

    pub fn create_user(&self) -> &str {
        &self.create_user
    }

    pub fn update_user(&self) -> &str {
        &self.update_user
    }

    /// Deserializes the payload into the workflow's payload type.
    pub fn payload<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(&self.event_payload)
    }

    /// Encodes the event in its wire format.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decodes an event from its wire format.
    pub fn decode(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ({}, {})",
            self.saga_id, self.event_type, self.event_outcome
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_format_uses_camel_case_keys() {
        let saga_id = SagaId::new();
        let event = Event::initiated(saga_id, r#"{"session_id":"S1"}"#).created_by("alice");

        let json: serde_json::Value = serde_json::from_str(&event.encode().unwrap()).unwrap();
        assert_eq!(json["sagaId"], saga_id.to_string());
        assert_eq!(json["eventType"], "INITIATED");
        assert_eq!(json["eventOutcome"], "INITIATE_SUCCESS");
        assert_eq!(json["eventPayload"], r#"{"session_id":"S1"}"#);
        assert_eq!(json["createUser"], "alice");
        assert_eq!(json["updateUser"], "alice");
    }

    #[test]
    fn test_decode_rejects_malformed_names() {
        let raw = format!(
            r#"{{"sagaId":"{}","eventType":"not valid","eventOutcome":"OK","eventPayload":"{{}}","createUser":"a","updateUser":"a"}}"#,
            SagaId::new()
        );
        assert!(Event::decode(&raw).is_err());
    }

    #[test]
    fn test_next_keeps_saga_and_users() {
        let event = Event::initiated(SagaId::new(), "{}")
            .created_by("alice")
            .updated_by("worker");
        let next = event.next(
            EventType::from_static("GENERATE_FILE"),
            EventOutcome::from_static("FILE_GENERATED"),
            r#"{"file":"a.csv"}"#,
        );

        assert_eq!(next.saga_id(), event.saga_id());
        assert_eq!(next.create_user(), "alice");
        assert_eq!(next.update_user(), "worker");
        assert_eq!(next.event_type().as_str(), "GENERATE_FILE");
    }

    #[test]
    fn test_typed_payload() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Payload {
            session_id: String,
        }

        let payload = Payload {
            session_id: "S1".into(),
        };
        let event = Event::with_payload(
            SagaId::new(),
            EventType::INITIATED,
            EventOutcome::INITIATE_SUCCESS,
            &payload,
        )
        .unwrap();

        assert_eq!(event.payload::<Payload>().unwrap(), payload);
    }
}
