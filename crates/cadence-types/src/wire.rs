//! Inbound control messages and outbound results exchanged with the transport layer

use crate::models::{RelationshipSnapshot, UsageSnapshot};
use serde::{Deserialize, Serialize};

/// Fragment sent by a client
///
/// `{"message": "hey", "conversation_id": "c-1", "timezone": "Europe/Paris", "final": false}`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    /// Client asks for an immediate flush of everything buffered so far
    #[serde(default, rename = "final")]
    pub is_final: bool,
    /// Duration of a voice fragment, billed per second on audio conversations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_seconds: Option<u32>,
}

impl InboundMessage {
    pub fn text(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }
}

/// Result of one turn as delivered to the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OutboundMessage {
    Reply {
        reply: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<UsageSnapshot>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        relationship: Option<RelationshipSnapshot>,
        /// Charge could not be recorded; the turn is queued for reconciliation
        #[serde(default, skip_serializing_if = "is_false")]
        billing_pending: bool,
    },
    Error {
        error: String,
        code: String,
    },
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl OutboundMessage {
    pub fn error(code: impl Into<String>, error: impl Into<String>) -> Self {
        OutboundMessage::Error {
            error: error.into(),
            code: code.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, OutboundMessage::Error { .. })
    }

    pub fn reply_text(&self) -> Option<&str> {
        match self {
            OutboundMessage::Reply { reply, .. } => Some(reply),
            OutboundMessage::Error { .. } => None,
        }
    }
}
