//! Workflow graph co-editing: who is in the room, where their cursors
//! are, and the node/edge edits they broadcast.
//!
//! ## Architecture
//!
//! ```text
//! USER_JOINED / USER_LEFT ──► Roster          (replaced from `users`)
//! CURSOR_MOVED            ──► remote cursors  (keyed by user)
//! NODE_* / EDGE_*         ──► CollabEvent ──► broadcast subscribers
//! ```
//!
//! Graph payloads are opaque JSON. This side relays them and tags each
//! with its author; merging them into a graph is the caller's job.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::broadcast;

use crate::identity::CollabIdentity;
use crate::projection::CollabView;
use crate::protocol::{Collaborator, Frame};
use crate::session::{SessionError, SessionLogic, SubscriptionState};
use crate::transport::{CloseReason, ConnectionState, FrameSink};

// ───────────────────────────────────────────────────────────────────
// Roster and cursors
// ───────────────────────────────────────────────────────────────────

/// Users in a workflow room, keyed by user id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Roster {
    members: BTreeMap<String, String>,
}

impl Roster {
    pub fn from_users(users: &[Collaborator]) -> Self {
        Self {
            members: users
                .iter()
                .map(|u| (u.user_id.clone(), u.username.clone()))
                .collect(),
        }
    }

    pub fn contains(&self, user_id: &str) -> bool {
        self.members.contains_key(user_id)
    }

    pub fn username(&self, user_id: &str) -> Option<&str> {
        self.members.get(user_id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// `(user_id, username)` pairs in user id order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.members
            .iter()
            .map(|(id, name)| (id.as_str(), name.as_str()))
    }

    pub fn to_collaborators(&self) -> Vec<Collaborator> {
        self.iter()
            .map(|(id, name)| Collaborator::new(id, name))
            .collect()
    }
}

/// Last known cursor of a remote user, in canvas coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct CursorPosition {
    pub user_id: String,
    pub username: String,
    pub x: f64,
    pub y: f64,
}

/// Something that happened in the workflow room.
///
/// `own` is set when the server echoed the local user's edit back.
#[derive(Debug, Clone, PartialEq)]
pub enum CollabEvent {
    UserJoined { user_id: String, username: String },
    UserLeft { user_id: String },
    NodeUpdated { node: Value, author: String, own: bool },
    EdgeUpdated { edge: Value, author: String, own: bool },
    NodeDeleted { node_id: String, author: String, own: bool },
    EdgeDeleted { edge_id: String, author: String, own: bool },
    CursorMoved(CursorPosition),
    Error(String),
}

// ───────────────────────────────────────────────────────────────────
// Session logic
// ───────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub(crate) enum CollabCommand {
    NodeUpdate(Value),
    EdgeUpdate(Value),
    NodeDelete(String),
    EdgeDelete(String),
    Cursor { x: f64, y: f64 },
}

pub(crate) struct CollabState {
    label: Arc<str>,
    identity: CollabIdentity,
    max_attempts: u32,
    subscription: SubscriptionState,
    roster: Roster,
    cursors: BTreeMap<String, CursorPosition>,
    events: broadcast::Sender<CollabEvent>,
    error: Option<SessionError>,
    reconnect_attempt: u32,
}

impl CollabState {
    pub(crate) fn new(
        label: Arc<str>,
        identity: CollabIdentity,
        max_attempts: u32,
        events: broadcast::Sender<CollabEvent>,
    ) -> Self {
        Self {
            label,
            identity,
            max_attempts,
            subscription: SubscriptionState::Unsubscribed,
            roster: Roster::default(),
            cursors: BTreeMap::new(),
            events,
            error: None,
            reconnect_attempt: 0,
        }
    }

    fn emit(&self, event: CollabEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Frames may carry the workflow they belong to; anything else is ignored.
    fn is_ours(&self, entity: Option<&str>) -> bool {
        entity.map_or(true, |entity| entity == self.identity.entity)
    }

    fn replace_roster(&mut self, users: &[Collaborator]) {
        self.roster = Roster::from_users(users);
        if self.subscription == SubscriptionState::Subscribing
            && self.roster.contains(&self.identity.user_id)
        {
            self.subscription = SubscriptionState::Subscribed;
        }
    }

    fn outbound(&self, command: CollabCommand) -> Frame {
        let entity = self.identity.entity.clone();
        match command {
            CollabCommand::NodeUpdate(node) => Frame::NodeUpdate { entity, node },
            CollabCommand::EdgeUpdate(edge) => Frame::EdgeUpdate { entity, edge },
            CollabCommand::NodeDelete(node_id) => Frame::NodeDelete { entity, node_id },
            CollabCommand::EdgeDelete(edge_id) => Frame::EdgeDelete { entity, edge_id },
            CollabCommand::Cursor { x, y } => Frame::Cursor { entity, x, y },
        }
    }
}

impl SessionLogic for CollabState {
    type Command = CollabCommand;
    type View = CollabView;

    fn on_connection(&mut self, state: ConnectionState) {
        match state {
            ConnectionState::Connecting => {}
            ConnectionState::Open => {
                self.reconnect_attempt = 0;
                self.subscription = SubscriptionState::Subscribing;
                self.error = None;
            }
            ConnectionState::Reconnecting { attempt, .. } => {
                self.reconnect_attempt = attempt;
                self.subscription = SubscriptionState::Unsubscribed;
                self.cursors.clear();
            }
            ConnectionState::Closed(reason) => {
                self.subscription = SubscriptionState::Unsubscribed;
                self.cursors.clear();
                self.roster = Roster::default();
                if reason == CloseReason::MaxRetries {
                    let error = SessionError::ReconnectExhausted {
                        attempts: self.max_attempts,
                    };
                    self.reconnect_attempt = self.max_attempts;
                    self.emit(CollabEvent::Error(error.to_string()));
                    self.error = Some(error);
                } else {
                    self.reconnect_attempt = 0;
                }
            }
        }
    }

    fn on_frame(&mut self, frame: Frame, _sink: &mut dyn FrameSink) {
        let local = self.identity.user_id.clone();
        match frame {
            Frame::UserJoined {
                entity,
                user_id,
                username,
                users,
            } if self.is_ours(entity.as_deref()) => {
                log::info!("[{}] {username} ({user_id}) joined", self.label);
                self.replace_roster(&users);
                self.emit(CollabEvent::UserJoined { user_id, username });
            }
            Frame::UserLeft {
                entity,
                user_id,
                users,
                ..
            } if self.is_ours(entity.as_deref()) => {
                log::info!("[{}] {user_id} left", self.label);
                self.replace_roster(&users);
                self.cursors.remove(&user_id);
                self.emit(CollabEvent::UserLeft { user_id });
            }
            Frame::NodeUpdated {
                entity,
                node,
                user_id,
            } if self.is_ours(entity.as_deref()) => self.emit(CollabEvent::NodeUpdated {
                node,
                own: user_id == local,
                author: user_id,
            }),
            Frame::EdgeUpdated {
                entity,
                edge,
                user_id,
            } if self.is_ours(entity.as_deref()) => self.emit(CollabEvent::EdgeUpdated {
                edge,
                own: user_id == local,
                author: user_id,
            }),
            Frame::NodeDeleted {
                entity,
                node_id,
                user_id,
            } if self.is_ours(entity.as_deref()) => self.emit(CollabEvent::NodeDeleted {
                node_id,
                own: user_id == local,
                author: user_id,
            }),
            Frame::EdgeDeleted {
                entity,
                edge_id,
                user_id,
            } if self.is_ours(entity.as_deref()) => self.emit(CollabEvent::EdgeDeleted {
                edge_id,
                own: user_id == local,
                author: user_id,
            }),
            Frame::CursorMoved {
                entity,
                user_id,
                username,
                x,
                y,
            } if self.is_ours(entity.as_deref()) => {
                // Own cursor echoes are not tracked.
                if user_id != local {
                    let cursor = CursorPosition {
                        user_id: user_id.clone(),
                        username,
                        x,
                        y,
                    };
                    self.cursors.insert(user_id, cursor.clone());
                    self.emit(CollabEvent::CursorMoved(cursor));
                }
            }
            Frame::Error { .. } => {
                let text = frame.error_text().unwrap_or_default().to_owned();
                log::warn!("[{}] server error: {text}", self.label);
                self.emit(CollabEvent::Error(text.clone()));
                self.error = Some(SessionError::Server(text));
            }
            Frame::HbAck => {}
            other => {
                log::debug!("[{}] ignoring {} on a workflow session", self.label, other.kind());
            }
        }
    }

    fn on_command(&mut self, command: CollabCommand, sink: &mut dyn FrameSink) {
        let frame = self.outbound(command);
        sink.send(&frame);
    }

    fn view(&self, connection: ConnectionState) -> CollabView {
        CollabView {
            identity: self.identity.clone(),
            roster: self.roster.clone(),
            cursors: self.cursors.clone(),
            connection,
            subscription: self.subscription,
            reconnect_attempt: self.reconnect_attempt,
            error: self.error.clone(),
        }
    }
}
