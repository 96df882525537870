//! Observable handles over running sessions.
//!
//! A handle binds one identity to one session task and exposes:
//!
//! - a **snapshot** of the current view ([`PresenceView`] / [`CollabView`]),
//!   always a pure function of the session state;
//! - a **subscription** (`tokio::sync::watch`) that wakes only when the
//!   view actually changed;
//! - **actions** (`acquire_lock`, `send_node_update`, …) forwarded to the
//!   session task in call order.
//!
//! Dropping a handle unbinds it: the session disconnects on purpose and
//! never reconnects. Changing identity means binding a new handle.
//!
//! ```text
//! let handle = PresenceHandle::bind(identity, &config);
//! let mut view = handle.subscribe();
//! view.wait_for(|v| v.presence.is_some()).await?;
//! handle.acquire_lock("totalAmount").await?;
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::collab::{CollabCommand, CollabEvent, CollabState, CursorPosition, Roster};
use crate::config::ClientConfig;
use crate::identity::{CollabIdentity, SessionIdentity};
use crate::locks::{FieldLock, FieldLockState, LockError};
use crate::presence::{PresenceCommand, PresenceSnapshot, PresenceState};
use crate::protocol::Frame;
use crate::session::{self, Control, SessionError, SubscriptionState};
use crate::transport::ws::WsConnector;
use crate::transport::{CloseReason, ConnectionState, Connector, Transport};

// ───────────────────────────────────────────────────────────────────
// Views
// ───────────────────────────────────────────────────────────────────

/// What a presence observer sees.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceView {
    pub identity: SessionIdentity,
    /// `None` until the first `PRESENCE` after connecting, and after close.
    pub presence: Option<PresenceSnapshot>,
    /// Confirmed locks, field → holder.
    pub locks: BTreeMap<String, FieldLock>,
    /// Fields the local user is still waiting on.
    pub pending_locks: BTreeSet<String>,
    pub connection: ConnectionState,
    pub subscription: SubscriptionState,
    /// Current retry number while reconnecting; the budget once exhausted.
    pub reconnect_attempt: u32,
    /// Latest error, kept until the next successful open.
    pub error: Option<SessionError>,
    /// Counts errors over the session's life. Changes on every occurrence,
    /// even when `error` repeats the previous one.
    pub error_seq: u64,
}

impl PresenceView {
    pub fn is_connected(&self) -> bool {
        self.connection.is_open()
    }

    pub fn is_reconnecting(&self) -> bool {
        self.connection.is_reconnecting()
    }

    /// Bound but no snapshot yet.
    pub fn is_loading(&self) -> bool {
        self.presence.is_none() && !has_given_up(self.connection)
    }

    pub fn is_read_only(&self) -> bool {
        self.presence
            .as_ref()
            .is_some_and(PresenceSnapshot::is_read_only)
    }

    /// Viewers other than the local user.
    pub fn other_viewers(&self) -> Vec<&str> {
        self.presence
            .as_ref()
            .map(|p| p.others(&self.identity.user_id).collect())
            .unwrap_or_default()
    }

    /// A field is editable unless someone else holds it.
    pub fn can_edit(&self, field: &str) -> bool {
        self.locks
            .get(field)
            .map_or(true, |lock| lock.holder == self.identity.user_id)
    }

    pub fn lock_state(&self, field: &str) -> FieldLockState {
        match self.locks.get(field) {
            Some(lock) if lock.holder == self.identity.user_id => FieldLockState::Mine,
            Some(lock) => FieldLockState::HeldBy(lock.holder.clone()),
            None if self.pending_locks.contains(field) => FieldLockState::Pending,
            None => FieldLockState::Free,
        }
    }
}

/// What a workflow observer sees.
#[derive(Debug, Clone, PartialEq)]
pub struct CollabView {
    pub identity: CollabIdentity,
    pub roster: Roster,
    /// Remote cursors by user id. Never contains the local user.
    pub cursors: BTreeMap<String, CursorPosition>,
    pub connection: ConnectionState,
    pub subscription: SubscriptionState,
    pub reconnect_attempt: u32,
    pub error: Option<SessionError>,
}

impl CollabView {
    pub fn is_connected(&self) -> bool {
        self.connection.is_open()
    }

    pub fn is_reconnecting(&self) -> bool {
        self.connection.is_reconnecting()
    }

    pub fn is_loading(&self) -> bool {
        self.subscription != SubscriptionState::Subscribed && !has_given_up(self.connection)
    }

    /// Everyone in the room except the local user.
    pub fn other_users(&self) -> Vec<&str> {
        self.roster
            .iter()
            .filter(|(id, _)| *id != self.identity.user_id)
            .map(|(_, name)| name)
            .collect()
    }
}

/// Closed for good: on purpose or after the retry budget ran out.
fn has_given_up(connection: ConnectionState) -> bool {
    matches!(
        connection,
        ConnectionState::Closed(CloseReason::Intentional | CloseReason::MaxRetries)
    )
}

// ───────────────────────────────────────────────────────────────────
// Presence handle
// ───────────────────────────────────────────────────────────────────

/// A bound presence session.
pub struct PresenceHandle {
    session_id: Uuid,
    identity: SessionIdentity,
    commands: mpsc::UnboundedSender<Control<PresenceCommand>>,
    view: watch::Receiver<PresenceView>,
    task: Option<JoinHandle<()>>,
    tickets: AtomicU64,
    lock_timeout: std::time::Duration,
}

impl PresenceHandle {
    /// Bind over WebSocket and start connecting.
    ///
    /// Must be called from within a tokio runtime.
    pub fn bind(identity: SessionIdentity, config: &ClientConfig) -> Self {
        let connector = Arc::new(WsConnector::new(config.connect_timeout));
        Self::bind_with(identity, config, connector)
    }

    /// Bind over any connector and start connecting.
    pub fn bind_with(
        identity: SessionIdentity,
        config: &ClientConfig,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let session_id = Uuid::new_v4();
        let label: Arc<str> = Arc::from(format!("presence:{}", &session_id.to_string()[..8]));
        log::info!("[{label}] binding {identity}");

        let transport = Transport::new(
            &*label,
            config.presence_url(),
            connector,
            config,
            Frame::subscribe(&identity),
            Frame::Unsub,
        );
        let logic = PresenceState::new(
            Arc::clone(&label),
            identity.clone(),
            config.reconnect.max_attempts,
        );
        let parts = session::spawn(transport, logic, label);
        let _ = parts.commands.send(Control::Connect);

        Self {
            session_id,
            identity,
            commands: parts.commands,
            view: parts.view,
            task: Some(parts.task),
            tickets: AtomicU64::new(1),
            lock_timeout: config.lock_timeout,
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn identity(&self) -> &SessionIdentity {
        &self.identity
    }

    /// Current view.
    pub fn snapshot(&self) -> PresenceView {
        self.view.borrow().clone()
    }

    /// Receiver that wakes on every view change.
    pub fn subscribe(&self) -> watch::Receiver<PresenceView> {
        self.view.clone()
    }

    /// Reconnect after a manual disconnect or exhausted retries.
    pub fn connect(&self) {
        let _ = self.commands.send(Control::Connect);
    }

    /// Disconnect without reconnecting.
    pub fn disconnect(&self) {
        let _ = self.commands.send(Control::Disconnect);
    }

    pub fn can_edit(&self, field: &str) -> bool {
        self.view.borrow().can_edit(field)
    }

    /// Ask the server for an advisory lock on `field`.
    ///
    /// Resolves on the matching `LOCK_ACK`, or fails after the configured
    /// lock timeout. A grant that arrives after the timeout is released
    /// again without surfacing.
    pub async fn acquire_lock(&self, field: &str) -> Result<(), LockError> {
        let ticket = self.tickets.fetch_add(1, Ordering::Relaxed);
        let (reply, outcome) = oneshot::channel();
        self.commands
            .send(Control::Command(PresenceCommand::AcquireLock {
                field: field.to_owned(),
                ticket,
                reply,
            }))
            .map_err(|_| LockError::SessionClosed)?;

        match tokio::time::timeout(self.lock_timeout, outcome).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(LockError::SessionClosed),
            Err(_) => {
                log::warn!("No LOCK_ACK for {field} within {:?}", self.lock_timeout);
                let _ = self
                    .commands
                    .send(Control::Command(PresenceCommand::LockTimedOut {
                        field: field.to_owned(),
                        ticket,
                    }));
                Err(LockError::TimedOut)
            }
        }
    }

    /// Release `field`. Fire-and-forget.
    pub fn release_lock(&self, field: &str) {
        let _ = self
            .commands
            .send(Control::Command(PresenceCommand::ReleaseLock {
                field: field.to_owned(),
            }));
    }

    /// Unbind and wait for the session to shut down.
    pub async fn unbind(mut self) {
        let _ = self.commands.send(Control::Unbind);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                log::error!("Presence session task failed: {e}");
            }
        }
    }
}

impl Drop for PresenceHandle {
    fn drop(&mut self) {
        if self.task.is_some() {
            let _ = self.commands.send(Control::Unbind);
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Workflow handle
// ───────────────────────────────────────────────────────────────────

/// A bound workflow co-editing session.
pub struct CollabHandle {
    session_id: Uuid,
    identity: CollabIdentity,
    commands: mpsc::UnboundedSender<Control<CollabCommand>>,
    view: watch::Receiver<CollabView>,
    events: broadcast::Sender<CollabEvent>,
    task: Option<JoinHandle<()>>,
}

impl CollabHandle {
    /// Bind over WebSocket and start connecting.
    ///
    /// Must be called from within a tokio runtime.
    pub fn bind(identity: CollabIdentity, config: &ClientConfig) -> Self {
        let connector = Arc::new(WsConnector::new(config.connect_timeout));
        Self::bind_with(identity, config, connector)
    }

    pub fn bind_with(
        identity: CollabIdentity,
        config: &ClientConfig,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let session_id = Uuid::new_v4();
        let label: Arc<str> = Arc::from(format!("workflow:{}", &session_id.to_string()[..8]));
        log::info!("[{label}] binding {identity}");

        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let transport = Transport::new(
            &*label,
            config.workflow_url(),
            connector,
            config,
            Frame::join(&identity),
            Frame::leave(&identity),
        );
        let logic = CollabState::new(
            Arc::clone(&label),
            identity.clone(),
            config.reconnect.max_attempts,
            events.clone(),
        );
        let parts = session::spawn(transport, logic, label);
        let _ = parts.commands.send(Control::Connect);

        Self {
            session_id,
            identity,
            commands: parts.commands,
            view: parts.view,
            events,
            task: Some(parts.task),
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn identity(&self) -> &CollabIdentity {
        &self.identity
    }

    pub fn snapshot(&self) -> CollabView {
        self.view.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<CollabView> {
        self.view.clone()
    }

    /// Graph edits, joins, leaves and cursor moves from now on.
    pub fn events(&self) -> broadcast::Receiver<CollabEvent> {
        self.events.subscribe()
    }

    pub fn connect(&self) {
        let _ = self.commands.send(Control::Connect);
    }

    pub fn disconnect(&self) {
        let _ = self.commands.send(Control::Disconnect);
    }

    pub fn send_node_update(&self, node: Value) {
        self.command(CollabCommand::NodeUpdate(node));
    }

    pub fn send_edge_update(&self, edge: Value) {
        self.command(CollabCommand::EdgeUpdate(edge));
    }

    pub fn send_node_delete(&self, node_id: impl Into<String>) {
        self.command(CollabCommand::NodeDelete(node_id.into()));
    }

    pub fn send_edge_delete(&self, edge_id: impl Into<String>) {
        self.command(CollabCommand::EdgeDelete(edge_id.into()));
    }

    pub fn send_cursor(&self, x: f64, y: f64) {
        self.command(CollabCommand::Cursor { x, y });
    }

    pub async fn unbind(mut self) {
        let _ = self.commands.send(Control::Unbind);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                log::error!("Workflow session task failed: {e}");
            }
        }
    }

    fn command(&self, command: CollabCommand) {
        if self.commands.send(Control::Command(command)).is_err() {
            log::warn!("Workflow session for {} already closed", self.identity);
        }
    }
}

impl Drop for CollabHandle {
    fn drop(&mut self) {
        if self.task.is_some() {
            let _ = self.commands.send(Control::Unbind);
        }
    }
}
