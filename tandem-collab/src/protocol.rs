//! JSON wire protocol shared by presence and workflow sessions.
//!
//! Wire format: one JSON object per frame, discriminated by `type`:
//! ```text
//! → {"type":"SUB","userId":"u1","tenantId":"acme","entity":"Order","id":"123"}
//! ← {"type":"PRESENCE","users":["u1","u2"],"stale":false,"busyBy":null,"version":5}
//! → {"type":"LOCK","field":"totalAmount"}
//! ← {"type":"LOCK_ACK","field":"totalAmount","success":true}
//! → {"type":"JOIN","entity":"Onboarding","userId":"u1","username":"Ann"}
//! ← {"type":"USER_JOINED","userId":"u1","username":"Ann","users":[…]}
//! ```
//!
//! Decoding never panics and never tears down the connection. Failures fall
//! into three buckets (see [`ProtocolError`]): malformed JSON, a known `type`
//! missing required fields, and an unknown `type`. Callers log and drop all
//! three.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::identity::{CollabIdentity, SessionIdentity};

/// Every `type` value this codec understands.
pub const KNOWN_KINDS: &[&str] = &[
    "SUB",
    "UNSUB",
    "JOIN",
    "LEAVE",
    "HB",
    "LOCK",
    "UNLOCK",
    "NODE_UPDATE",
    "EDGE_UPDATE",
    "NODE_DELETE",
    "EDGE_DELETE",
    "CURSOR",
    "HB_ACK",
    "UNSUB_ACK",
    "LOCK_ACK",
    "UNLOCK_ACK",
    "PRESENCE",
    "USER_JOINED",
    "USER_LEFT",
    "NODE_UPDATED",
    "EDGE_UPDATED",
    "NODE_DELETED",
    "EDGE_DELETED",
    "CURSOR_MOVED",
    "ERROR",
];

/// Roster entry carried by `USER_JOINED` / `USER_LEFT`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Collaborator {
    pub user_id: String,
    pub username: String,
}

impl Collaborator {
    pub fn new(user_id: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            username: username.into(),
        }
    }
}

/// Body of a `PRESENCE` push. The server sends the whole picture every time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresencePayload {
    pub users: Vec<String>,
    pub stale: bool,
    #[serde(default)]
    pub busy_by: Option<String>,
    #[serde(default)]
    pub version: Option<u64>,
    /// Field → holder. Absent when the server does not report locks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locks: Option<BTreeMap<String, String>>,
}

impl PresencePayload {
    /// Payload with only a viewer list, nothing stale, no version.
    pub fn viewers<I, S>(users: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            users: users.into_iter().map(Into::into).collect(),
            stale: false,
            busy_by: None,
            version: None,
            locks: None,
        }
    }
}

fn granted() -> bool {
    true
}

/// Top-level protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Frame {
    // ── client → server ──────────────────────────────────────────
    #[serde(rename_all = "camelCase")]
    Sub {
        user_id: String,
        tenant_id: String,
        entity: String,
        id: String,
    },
    Unsub,
    #[serde(rename_all = "camelCase")]
    Join {
        entity: String,
        user_id: String,
        username: String,
    },
    Leave {
        entity: String,
    },
    Hb,
    Lock {
        field: String,
    },
    Unlock {
        field: String,
    },
    NodeUpdate {
        entity: String,
        node: Value,
    },
    EdgeUpdate {
        entity: String,
        edge: Value,
    },
    #[serde(rename_all = "camelCase")]
    NodeDelete {
        entity: String,
        node_id: String,
    },
    #[serde(rename_all = "camelCase")]
    EdgeDelete {
        entity: String,
        edge_id: String,
    },
    Cursor {
        entity: String,
        x: f64,
        y: f64,
    },

    // ── server → client ──────────────────────────────────────────
    HbAck,
    UnsubAck,
    LockAck {
        field: String,
        success: bool,
        /// Current holder, sent by servers that explain denials.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        holder: Option<String>,
    },
    UnlockAck {
        field: String,
        #[serde(default = "granted")]
        success: bool,
    },
    Presence(PresencePayload),
    #[serde(rename_all = "camelCase")]
    UserJoined {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        entity: Option<String>,
        user_id: String,
        username: String,
        users: Vec<Collaborator>,
    },
    #[serde(rename_all = "camelCase")]
    UserLeft {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        entity: Option<String>,
        user_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        username: Option<String>,
        users: Vec<Collaborator>,
    },
    #[serde(rename_all = "camelCase")]
    NodeUpdated {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        entity: Option<String>,
        node: Value,
        user_id: String,
    },
    #[serde(rename_all = "camelCase")]
    EdgeUpdated {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        entity: Option<String>,
        edge: Value,
        user_id: String,
    },
    #[serde(rename_all = "camelCase")]
    NodeDeleted {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        entity: Option<String>,
        node_id: String,
        user_id: String,
    },
    #[serde(rename_all = "camelCase")]
    EdgeDeleted {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        entity: Option<String>,
        edge_id: String,
        user_id: String,
    },
    #[serde(rename_all = "camelCase")]
    CursorMoved {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        entity: Option<String>,
        user_id: String,
        username: String,
        x: f64,
        y: f64,
    },
    Error {
        /// Presence servers put the text here…
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        /// …workflow servers put it here.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

impl Frame {
    /// Create the subscribe frame for a presence session.
    pub fn subscribe(identity: &SessionIdentity) -> Self {
        Self::Sub {
            user_id: identity.user_id.clone(),
            tenant_id: identity.tenant_id.clone(),
            entity: identity.entity_type.clone(),
            id: identity.entity_id.clone(),
        }
    }

    /// Create the join frame for a workflow session.
    pub fn join(identity: &CollabIdentity) -> Self {
        Self::Join {
            entity: identity.entity.clone(),
            user_id: identity.user_id.clone(),
            username: identity.username.clone(),
        }
    }

    /// Create the leave frame for a workflow session.
    pub fn leave(identity: &CollabIdentity) -> Self {
        Self::Leave {
            entity: identity.entity.clone(),
        }
    }

    pub fn lock(field: impl Into<String>) -> Self {
        Self::Lock {
            field: field.into(),
        }
    }

    pub fn unlock(field: impl Into<String>) -> Self {
        Self::Unlock {
            field: field.into(),
        }
    }

    /// Wire name of this frame's `type`.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Sub { .. } => "SUB",
            Self::Unsub => "UNSUB",
            Self::Join { .. } => "JOIN",
            Self::Leave { .. } => "LEAVE",
            Self::Hb => "HB",
            Self::Lock { .. } => "LOCK",
            Self::Unlock { .. } => "UNLOCK",
            Self::NodeUpdate { .. } => "NODE_UPDATE",
            Self::EdgeUpdate { .. } => "EDGE_UPDATE",
            Self::NodeDelete { .. } => "NODE_DELETE",
            Self::EdgeDelete { .. } => "EDGE_DELETE",
            Self::Cursor { .. } => "CURSOR",
            Self::HbAck => "HB_ACK",
            Self::UnsubAck => "UNSUB_ACK",
            Self::LockAck { .. } => "LOCK_ACK",
            Self::UnlockAck { .. } => "UNLOCK_ACK",
            Self::Presence(_) => "PRESENCE",
            Self::UserJoined { .. } => "USER_JOINED",
            Self::UserLeft { .. } => "USER_LEFT",
            Self::NodeUpdated { .. } => "NODE_UPDATED",
            Self::EdgeUpdated { .. } => "EDGE_UPDATED",
            Self::NodeDeleted { .. } => "NODE_DELETED",
            Self::EdgeDeleted { .. } => "EDGE_DELETED",
            Self::CursorMoved { .. } => "CURSOR_MOVED",
            Self::Error { .. } => "ERROR",
        }
    }

    /// Text of an `ERROR` frame, whichever field the server used.
    pub fn error_text(&self) -> Option<&str> {
        match self {
            Self::Error { error, message } => Some(
                error
                    .as_deref()
                    .or(message.as_deref())
                    .unwrap_or("Unknown error"),
            ),
            _ => None,
        }
    }

    /// Serialize to a JSON text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Parse a JSON text frame.
    ///
    /// The `type` is checked before the body, so a frame from a newer
    /// server ([`ProtocolError::UnknownType`]) can be told apart from a
    /// broken one ([`ProtocolError::InvalidFields`]).
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingType)?
            .to_owned();

        if !KNOWN_KINDS.contains(&kind.as_str()) {
            return Err(ProtocolError::UnknownType(kind));
        }

        serde_json::from_value(value).map_err(|e| ProtocolError::InvalidFields {
            kind,
            reason: e.to_string(),
        })
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Malformed frame: {0}")]
    Malformed(String),
    #[error("Frame has no type field")]
    MissingType,
    #[error("Unknown frame type: {0}")]
    UnknownType(String),
    #[error("Invalid {kind} frame: {reason}")]
    InvalidFields { kind: String, reason: String },
}
