//! Message envelope: the unit exchanged between nodes and between the
//! orchestrator and its local components.
//!
//! On the wire an envelope is a flat JSON object:
//!
//! ```json
//! {"id": "...", "from_node_id": "...", "to_node_id": "...",
//!  "message_type": "Ping", "component_type": "...",
//!  "payload": {"sent_at": "..."}, "priority": 0, "requires_response": true}
//! ```
//!
//! In memory the `message_type`/`payload` pair is a typed [`MessageKind`].
//! Conversion goes through [`RawEnvelope`]: known message types must carry a
//! payload matching their schema, unknown types become [`MessageKind::Custom`].

use crate::peer::{Capabilities, NodeInfo};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Opaque key/value payload.
pub type Payload = Map<String, Value>;

/// Well-known `message_type` discriminators.
pub mod message_types {
    pub const HANDSHAKE: &str = "Handshake";
    pub const PING: &str = "Ping";
    pub const PONG: &str = "Pong";
    pub const COMPONENT_STATUS: &str = "ComponentStatus";
    pub const DATA_SYNC: &str = "DataSync";
    pub const SHUTDOWN: &str = "Shutdown";

    /// Types with a fixed schema. A `Custom` may not use these names.
    pub const RESERVED: [&str; 6] = [
        HANDSHAKE,
        PING,
        PONG,
        COMPONENT_STATUS,
        DATA_SYNC,
        SHUTDOWN,
    ];

    pub fn is_reserved(message_type: &str) -> bool {
        RESERVED.contains(&message_type)
    }
}

/// Errors raised when a raw envelope does not fit its message schema.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("envelope id is empty")]
    MissingId,
    #[error("envelope message_type is empty")]
    MissingMessageType,
    #[error("custom message_type '{0}' is reserved")]
    ReservedMessageType(String),
    #[error("invalid payload for message type '{message_type}': {source}")]
    InvalidPayload {
        message_type: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Identity exchange sent right after a connection is established.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakePayload {
    pub node_id: String,
    pub mesh_port: u16,
    #[serde(default)]
    pub capabilities: Capabilities,
}

/// Liveness check, answered with a [`PongPayload`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingPayload {
    pub sent_at: DateTime<Utc>,
}

/// Reply to a [`PingPayload`], carrying the ping's message id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PongPayload {
    pub reply_to: String,
    pub timestamp: DateTime<Utc>,
}

/// Sent best-effort by a node that is going away.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShutdownPayload {
    #[serde(default)]
    pub reason: String,
}

/// Typed message body, discriminated by `message_type` on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageKind {
    Handshake(HandshakePayload),
    Ping(PingPayload),
    Pong(PongPayload),
    /// Component status update or query, fanned out to every local component.
    ComponentStatus(Payload),
    /// Data synchronisation, fanned out to every local component.
    DataSync(Payload),
    Shutdown(ShutdownPayload),
    /// Any other message type, routed by `component_type`.
    ///
    /// Must not be empty or use a well-known type name; such envelopes fail
    /// [`Envelope::validate`] and are refused before they reach the wire.
    Custom {
        message_type: String,
        payload: Payload,
    },
}

impl MessageKind {
    /// The wire discriminator for this kind.
    pub fn message_type(&self) -> &str {
        match self {
            Self::Handshake(_) => message_types::HANDSHAKE,
            Self::Ping(_) => message_types::PING,
            Self::Pong(_) => message_types::PONG,
            Self::ComponentStatus(_) => message_types::COMPONENT_STATUS,
            Self::DataSync(_) => message_types::DATA_SYNC,
            Self::Shutdown(_) => message_types::SHUTDOWN,
            Self::Custom { message_type, .. } => message_type.as_str(),
        }
    }

    /// Split into the wire discriminator and an untyped payload map.
    pub fn into_parts(self) -> (String, Payload) {
        let message_type = self.message_type().to_string();
        let payload = match self {
            Self::Handshake(p) => to_payload(&p),
            Self::Ping(p) => to_payload(&p),
            Self::Pong(p) => to_payload(&p),
            Self::Shutdown(p) => to_payload(&p),
            Self::ComponentStatus(p) | Self::DataSync(p) => p,
            Self::Custom { payload, .. } => payload,
        };
        (message_type, payload)
    }

    /// Rebuild a typed kind from the wire discriminator and payload map.
    pub fn from_parts(message_type: String, payload: Payload) -> Result<Self, EnvelopeError> {
        fn typed<T: serde::de::DeserializeOwned>(
            message_type: &str,
            payload: Payload,
        ) -> Result<T, EnvelopeError> {
            serde_json::from_value(Value::Object(payload)).map_err(|source| {
                EnvelopeError::InvalidPayload {
                    message_type: message_type.to_string(),
                    source,
                }
            })
        }

        let kind = match message_type.as_str() {
            "" => return Err(EnvelopeError::MissingMessageType),
            message_types::HANDSHAKE => Self::Handshake(typed(&message_type, payload)?),
            message_types::PING => Self::Ping(typed(&message_type, payload)?),
            message_types::PONG => Self::Pong(typed(&message_type, payload)?),
            message_types::SHUTDOWN => Self::Shutdown(typed(&message_type, payload)?),
            message_types::COMPONENT_STATUS => Self::ComponentStatus(payload),
            message_types::DATA_SYNC => Self::DataSync(payload),
            _ => Self::Custom {
                message_type,
                payload,
            },
        };
        Ok(kind)
    }
}

fn to_payload<T: Serialize>(value: &T) -> Payload {
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => map,
        _ => Payload::new(),
    }
}

/// A routed message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawEnvelope", into = "RawEnvelope")]
pub struct Envelope {
    /// Unique message id.
    pub id: String,
    /// Originating node. Stamped by the transport when absent.
    pub from_node_id: Option<String>,
    /// Destination node. `None` broadcasts to every connected peer.
    pub to_node_id: Option<String>,
    /// Typed body.
    pub kind: MessageKind,
    /// Destination component type for local routing.
    pub component_type: Option<String>,
    /// Informational only; dispatch is strictly FIFO.
    pub priority: i32,
    /// Whether the sender expects a reply.
    pub requires_response: bool,
}

/// The flat wire shape of an [`Envelope`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawEnvelope {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_node_id: Option<String>,
    pub message_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component_type: Option<String>,
    #[serde(default)]
    pub payload: Payload,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub requires_response: bool,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.is_empty())
}

impl TryFrom<RawEnvelope> for Envelope {
    type Error = EnvelopeError;

    fn try_from(raw: RawEnvelope) -> Result<Self, Self::Error> {
        if raw.id.is_empty() {
            return Err(EnvelopeError::MissingId);
        }
        Ok(Self {
            id: raw.id,
            from_node_id: non_empty(raw.from_node_id),
            to_node_id: non_empty(raw.to_node_id),
            kind: MessageKind::from_parts(raw.message_type, raw.payload)?,
            component_type: non_empty(raw.component_type),
            priority: raw.priority,
            requires_response: raw.requires_response,
        })
    }
}

impl From<Envelope> for RawEnvelope {
    fn from(envelope: Envelope) -> Self {
        let (message_type, payload) = envelope.kind.into_parts();
        Self {
            id: envelope.id,
            from_node_id: envelope.from_node_id,
            to_node_id: envelope.to_node_id,
            message_type,
            component_type: envelope.component_type,
            payload,
            priority: envelope.priority,
            requires_response: envelope.requires_response,
        }
    }
}

impl Envelope {
    /// New broadcast envelope with a fresh id.
    pub fn new(kind: MessageKind) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            from_node_id: None,
            to_node_id: None,
            kind,
            component_type: None,
            priority: 0,
            requires_response: false,
        }
    }

    /// Handshake advertising the local node.
    pub fn handshake(node: &NodeInfo) -> Self {
        Self::new(MessageKind::Handshake(HandshakePayload {
            node_id: node.node_id.clone(),
            mesh_port: node.mesh_port,
            capabilities: node.capabilities.clone(),
        }))
        .from_node(&node.node_id)
    }

    /// Ping addressed to a peer, requesting a pong.
    pub fn ping(to_node_id: &str) -> Self {
        Self::new(MessageKind::Ping(PingPayload {
            sent_at: Utc::now(),
        }))
        .to(to_node_id)
        .expecting_response()
    }

    /// Pong answering `ping`, addressed back to its sender.
    pub fn pong(ping: &Envelope) -> Self {
        let mut pong = Self::new(MessageKind::Pong(PongPayload {
            reply_to: ping.id.clone(),
            timestamp: Utc::now(),
        }));
        pong.to_node_id = ping.from_node_id.clone();
        pong
    }

    pub fn shutdown(reason: impl Into<String>) -> Self {
        Self::new(MessageKind::Shutdown(ShutdownPayload {
            reason: reason.into(),
        }))
    }

    pub fn component_status(payload: Payload) -> Self {
        Self::new(MessageKind::ComponentStatus(payload))
    }

    pub fn data_sync(payload: Payload) -> Self {
        Self::new(MessageKind::DataSync(payload))
    }

    /// Application message routed by component type.
    pub fn custom(message_type: impl Into<String>, payload: Payload) -> Self {
        Self::new(MessageKind::Custom {
            message_type: message_type.into(),
            payload,
        })
    }

    /// Address to a node. An empty id keeps the envelope a broadcast.
    pub fn to(mut self, node_id: impl Into<String>) -> Self {
        self.to_node_id = non_empty(Some(node_id.into()));
        self
    }

    pub fn from_node(mut self, node_id: impl Into<String>) -> Self {
        self.from_node_id = non_empty(Some(node_id.into()));
        self
    }

    pub fn for_component(mut self, component_type: impl Into<String>) -> Self {
        self.component_type = non_empty(Some(component_type.into()));
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn expecting_response(mut self) -> Self {
        self.requires_response = true;
        self
    }

    pub fn message_type(&self) -> &str {
        self.kind.message_type()
    }

    /// Check that the envelope survives a trip over the wire unchanged.
    pub fn validate(&self) -> Result<(), EnvelopeError> {
        if self.id.is_empty() {
            return Err(EnvelopeError::MissingId);
        }
        if let MessageKind::Custom { message_type, .. } = &self.kind {
            if message_type.is_empty() {
                return Err(EnvelopeError::MissingMessageType);
            }
            if message_types::is_reserved(message_type) {
                return Err(EnvelopeError::ReservedMessageType(message_type.clone()));
            }
        }
        Ok(())
    }

    /// True when there is no destination node.
    pub fn is_broadcast(&self) -> bool {
        self.to_node_id.is_none()
    }
}
