//! Entity presence: who is viewing an entity, whether it is stale, and
//! which fields are locked.
//!
//! ## Architecture
//!
//! ```text
//! PRESENCE ─────► PresenceSnapshot   (replaced wholesale, never merged)
//!          └────► LockArbiter        (authoritative lock map, if sent)
//!
//! acquire_lock() ──LOCK──► server ──LOCK_ACK──► LockArbiter
//!       ▲                                           │
//!       └────────────── oneshot reply ◄─────────────┘
//!
//! connection lost ──► locks dropped, waiters fail with ConnectionLost
//! closed          ──► snapshot discarded
//! ```
//!
//! Locks are advisory. The server is the only arbiter; this side only
//! tracks what it was told and tells callers whether to edit.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::SystemTime;

use tokio::sync::oneshot;

use crate::identity::SessionIdentity;
use crate::locks::{AckOutcome, LockArbiter, LockError};
use crate::projection::PresenceView;
use crate::protocol::{Frame, PresencePayload};
use crate::session::{SessionError, SessionLogic, SubscriptionState};
use crate::transport::{CloseReason, ConnectionState, FrameSink};

// ───────────────────────────────────────────────────────────────────
// Snapshot
// ───────────────────────────────────────────────────────────────────

/// Latest server view of an entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceSnapshot {
    /// Users currently viewing, the local user included.
    pub viewers: BTreeSet<String>,
    /// Someone else has a pending write; the local copy is read-only.
    pub stale: bool,
    pub busy_by: Option<String>,
    pub version: Option<u64>,
    /// When this snapshot was received.
    pub last_updated: SystemTime,
}

impl PresenceSnapshot {
    /// Build from a server push. Nothing from earlier pushes survives.
    pub fn from_payload(payload: &PresencePayload, received_at: SystemTime) -> Self {
        Self {
            viewers: payload.users.iter().cloned().collect(),
            stale: payload.stale,
            busy_by: payload.busy_by.clone(),
            version: payload.version,
            last_updated: received_at,
        }
    }

    pub fn is_read_only(&self) -> bool {
        self.stale
    }

    /// Viewers other than `user_id`.
    pub fn others<'a>(&'a self, user_id: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.viewers
            .iter()
            .map(String::as_str)
            .filter(move |viewer| *viewer != user_id)
    }
}

// ───────────────────────────────────────────────────────────────────
// Session logic
// ───────────────────────────────────────────────────────────────────

type LockReply = oneshot::Sender<Result<(), LockError>>;

#[derive(Debug)]
pub(crate) enum PresenceCommand {
    AcquireLock {
        field: String,
        ticket: u64,
        reply: LockReply,
    },
    /// The caller behind `ticket` stopped waiting.
    LockTimedOut { field: String, ticket: u64 },
    ReleaseLock { field: String },
}

pub(crate) struct PresenceState {
    label: Arc<str>,
    identity: SessionIdentity,
    max_attempts: u32,
    connected: bool,
    subscription: SubscriptionState,
    snapshot: Option<PresenceSnapshot>,
    /// Highest version seen since the session last closed.
    max_version: Option<u64>,
    arbiter: LockArbiter,
    waiters: HashMap<u64, LockReply>,
    error: Option<SessionError>,
    /// Bumped on every error, so repeats of the same one still notify.
    error_seq: u64,
    reconnect_attempt: u32,
}

impl PresenceState {
    pub(crate) fn new(label: Arc<str>, identity: SessionIdentity, max_attempts: u32) -> Self {
        let arbiter = LockArbiter::new(identity.user_id.clone());
        Self {
            label,
            identity,
            max_attempts,
            connected: false,
            subscription: SubscriptionState::Unsubscribed,
            snapshot: None,
            max_version: None,
            arbiter,
            waiters: HashMap::new(),
            error: None,
            error_seq: 0,
            reconnect_attempt: 0,
        }
    }

    fn on_presence(&mut self, payload: PresencePayload) {
        if let (Some(seen), Some(next)) = (self.max_version, payload.version) {
            if next < seen {
                log::warn!("[{}] dropping PRESENCE v{next}, already saw v{seen}", self.label);
                return;
            }
        }
        if payload.version.is_some() {
            self.max_version = self.max_version.max(payload.version);
        }

        if payload.stale && payload.busy_by.is_none() {
            log::warn!("[{}] PRESENCE marked stale without busyBy", self.label);
        }
        if !payload.users.contains(&self.identity.user_id) {
            log::debug!(
                "[{}] PRESENCE does not list {} yet",
                self.label,
                self.identity.user_id
            );
        }

        self.snapshot = Some(PresenceSnapshot::from_payload(&payload, SystemTime::now()));
        if let Some(locks) = &payload.locks {
            self.arbiter.replace_confirmed(locks);
        }
        self.subscription = SubscriptionState::Subscribed;
    }

    fn on_lock_ack(
        &mut self,
        field: String,
        success: bool,
        holder: Option<String>,
        sink: &mut dyn FrameSink,
    ) {
        match self.arbiter.on_ack(&field, success, holder.clone()) {
            AckOutcome::Granted(ticket) => {
                log::info!("[{}] lock on {field} granted", self.label);
                let delivered = self
                    .waiters
                    .remove(&ticket)
                    .is_some_and(|reply| reply.send(Ok(())).is_ok());
                if !delivered {
                    log::info!("[{}] nobody waiting for {field}, releasing", self.label);
                    self.arbiter.release(&field);
                    sink.send(&Frame::unlock(&field));
                }
            }
            AckOutcome::Denied(ticket) => {
                log::info!(
                    "[{}] lock on {field} denied (holder: {})",
                    self.label,
                    holder.as_deref().unwrap_or("unknown")
                );
                self.resolve(ticket, Err(LockError::Denied { holder }));
            }
            AckOutcome::Orphaned => {
                log::info!("[{}] grant on {field} with nobody waiting, releasing", self.label);
                sink.send(&Frame::unlock(&field));
            }
            AckOutcome::Superseded => {
                log::debug!("[{}] ignoring outdated LOCK_ACK for {field}", self.label);
            }
            AckOutcome::Stray => {
                log::debug!("[{}] unsolicited LOCK_ACK for {field}", self.label);
            }
        }
    }

    fn on_unlock_ack(&mut self, field: &str, success: bool) {
        if success {
            log::debug!("[{}] lock on {field} released", self.label);
        } else {
            log::warn!("[{}] server refused to release {field}", self.label);
        }
    }

    fn acquire(&mut self, field: String, ticket: u64, reply: LockReply, sink: &mut dyn FrameSink) {
        if !self.connected {
            let _ = reply.send(Err(LockError::NotConnected));
            return;
        }
        if self.arbiter.holds(&field) {
            let _ = reply.send(Ok(()));
            return;
        }

        if let Some(previous) = self.arbiter.request(&field, ticket) {
            self.resolve(previous, Err(LockError::Superseded));
        }
        self.waiters.insert(ticket, reply);
        sink.send(&Frame::lock(&field));
    }

    fn release(&mut self, field: String, sink: &mut dyn FrameSink) {
        if let Some(ticket) = self.arbiter.release(&field) {
            self.resolve(ticket, Err(LockError::Released));
        }
        if self.connected {
            sink.send(&Frame::unlock(field));
        }
    }

    fn resolve(&mut self, ticket: u64, outcome: Result<(), LockError>) {
        if let Some(reply) = self.waiters.remove(&ticket) {
            let _ = reply.send(outcome);
        }
    }

    fn fail(&mut self, error: SessionError) {
        self.error = Some(error);
        self.error_seq += 1;
    }

    /// Locks never outlive the connection that took them.
    fn drop_locks(&mut self) {
        let dropped = self.arbiter.drop_all();
        if !dropped.is_empty() {
            log::info!(
                "[{}] connection lost with {} lock request(s) in flight",
                self.label,
                dropped.len()
            );
        }
        for (_, reply) in self.waiters.drain() {
            let _ = reply.send(Err(LockError::ConnectionLost));
        }
    }
}

impl SessionLogic for PresenceState {
    type Command = PresenceCommand;
    type View = PresenceView;

    fn on_connection(&mut self, state: ConnectionState) {
        match state {
            ConnectionState::Connecting => {}
            ConnectionState::Open => {
                self.connected = true;
                self.reconnect_attempt = 0;
                self.subscription = SubscriptionState::Subscribing;
                self.error = None;
            }
            ConnectionState::Reconnecting { attempt, .. } => {
                self.connected = false;
                self.reconnect_attempt = attempt;
                self.subscription = SubscriptionState::Unsubscribed;
                self.drop_locks();
            }
            ConnectionState::Closed(reason) => {
                self.connected = false;
                self.subscription = SubscriptionState::Unsubscribed;
                self.snapshot = None;
                self.max_version = None;
                self.drop_locks();
                if reason == CloseReason::MaxRetries {
                    self.reconnect_attempt = self.max_attempts;
                    self.fail(SessionError::ReconnectExhausted {
                        attempts: self.max_attempts,
                    });
                } else {
                    self.reconnect_attempt = 0;
                }
            }
        }
    }

    fn on_frame(&mut self, frame: Frame, sink: &mut dyn FrameSink) {
        match frame {
            Frame::Presence(payload) => self.on_presence(payload),
            Frame::LockAck {
                field,
                success,
                holder,
            } => self.on_lock_ack(field, success, holder, sink),
            Frame::UnlockAck { field, success } => self.on_unlock_ack(&field, success),
            Frame::Error { .. } => {
                let text = frame.error_text().unwrap_or_default().to_owned();
                log::warn!("[{}] server error: {text}", self.label);
                self.fail(SessionError::Server(text));
            }
            Frame::HbAck | Frame::UnsubAck => {}
            other => {
                log::debug!("[{}] ignoring {} on a presence session", self.label, other.kind());
            }
        }
    }

    fn on_command(&mut self, command: PresenceCommand, sink: &mut dyn FrameSink) {
        match command {
            PresenceCommand::AcquireLock {
                field,
                ticket,
                reply,
            } => self.acquire(field, ticket, reply, sink),
            PresenceCommand::LockTimedOut { field, ticket } => {
                self.waiters.remove(&ticket);
                if self.arbiter.expire(&field, ticket) {
                    log::warn!("[{}] lock request for {field} timed out", self.label);
                }
            }
            PresenceCommand::ReleaseLock { field } => self.release(field, sink),
        }
    }

    fn view(&self, connection: ConnectionState) -> PresenceView {
        PresenceView {
            identity: self.identity.clone(),
            presence: self.snapshot.clone(),
            locks: self.arbiter.held().clone(),
            pending_locks: self.arbiter.pending_fields(),
            connection,
            subscription: self.subscription,
            reconnect_attempt: self.reconnect_attempt,
            error: self.error.clone(),
            error_seq: self.error_seq,
        }
    }
}
