//! Session driver: one task per binding.
//!
//! ```text
//!   handle ──Control──►┌──────────────────────────┐
//!                      │  driver task              │
//!                      │   ├─ Transport (socket)   │──► server
//!                      │   └─ SessionLogic (state) │◄── server
//!   handle ◄──watch────└──────────────────────────┘
//! ```
//!
//! The task owns both the transport and the session state, so every
//! mutation happens on one task, in arrival order. After each step the
//! current view is published; observers only wake when it actually changed.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::protocol::{Frame, ProtocolError};
use crate::transport::{ConnectionState, FrameSink, Transport, TransportEvent};

/// Subscription lifecycle on top of an open connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubscriptionState {
    #[default]
    Unsubscribed,
    /// Subscribe/join sent, waiting for the first server push.
    Subscribing,
    Subscribed,
}

/// Errors surfaced to observers through the view.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// Sent by the server in an `ERROR` frame.
    #[error("Server error: {0}")]
    Server(String),
    #[error("Failed to reconnect after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },
}

impl SessionError {
    /// Terminal errors need a manual `connect()` to recover.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::ReconnectExhausted { .. })
    }
}

/// Messages from a handle to its driver task.
#[derive(Debug)]
pub(crate) enum Control<C> {
    Connect,
    Disconnect,
    Command(C),
    /// Tear down: disconnect, publish the final view, exit.
    Unbind,
}

/// Session state machine fed by the driver.
pub(crate) trait SessionLogic: Send + 'static {
    type Command: Send + 'static;
    type View: Clone + PartialEq + Send + Sync + 'static;

    fn on_connection(&mut self, state: ConnectionState);
    fn on_frame(&mut self, frame: Frame, sink: &mut dyn FrameSink);
    fn on_command(&mut self, command: Self::Command, sink: &mut dyn FrameSink);
    fn view(&self, connection: ConnectionState) -> Self::View;
}

/// The pieces a handle keeps after spawning a session.
pub(crate) struct SessionParts<L: SessionLogic> {
    pub commands: mpsc::UnboundedSender<Control<L::Command>>,
    pub view: watch::Receiver<L::View>,
    pub task: JoinHandle<()>,
}

/// Spawn the driver task. Must be called inside a tokio runtime.
pub(crate) fn spawn<L: SessionLogic>(
    transport: Transport,
    logic: L,
    label: Arc<str>,
) -> SessionParts<L> {
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (view_tx, view_rx) = watch::channel(logic.view(transport.state()));

    let driver = Driver {
        label,
        transport,
        logic,
        commands: commands_rx,
        view: view_tx,
    };
    let task = tokio::spawn(driver.run());

    SessionParts {
        commands: commands_tx,
        view: view_rx,
        task,
    }
}

struct Driver<L: SessionLogic> {
    label: Arc<str>,
    transport: Transport,
    logic: L,
    commands: mpsc::UnboundedReceiver<Control<L::Command>>,
    view: watch::Sender<L::View>,
}

impl<L: SessionLogic> Driver<L> {
    async fn run(mut self) {
        log::debug!("[{}] session started for {}", self.label, self.transport.url());

        loop {
            tokio::select! {
                control = self.commands.recv() => match control {
                    Some(Control::Connect) => self.transport.connect(),
                    Some(Control::Disconnect) => self.transport.disconnect(),
                    Some(Control::Command(command)) => {
                        self.logic.on_command(command, &mut self.transport)
                    }
                    Some(Control::Unbind) | None => break,
                },
                event = self.transport.next_event() => self.dispatch(event),
            }
            self.publish();
        }

        self.transport.disconnect();
        while let Some(event) = self.transport.take_queued() {
            self.dispatch(event);
        }
        self.publish();
        log::debug!("[{}] session unbound", self.label);
    }

    fn dispatch(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::State(state) => self.logic.on_connection(state),
            TransportEvent::Frame(text) => match Frame::decode(&text) {
                Ok(frame) => self.logic.on_frame(frame, &mut self.transport),
                Err(ProtocolError::UnknownType(kind)) => {
                    log::warn!("[{}] ignoring unknown frame type {kind:?}", self.label)
                }
                Err(e) => log::warn!("[{}] dropping frame: {e}", self.label),
            },
            TransportEvent::Error(e) => log::debug!("[{}] transport error: {e}", self.label),
        }
    }

    fn publish(&self) {
        let next = self.logic.view(self.transport.state());
        self.view.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}
