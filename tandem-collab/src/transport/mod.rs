//! Connection transport: one duplex channel per session identity.
//!
//! ```text
//!                 connect()
//!   Closed ─────────────────► Connecting ───opened──► Open
//!     ▲                           │                    │
//!     │ disconnect()              │ refused            │ closed (unintended)
//!     │                           ▼                    ▼
//!     │                     Reconnecting(attempt, delay) ◄──┘
//!     │                           │ timer fires
//!     │                           └──────► Connecting …
//!     │
//!     └─── Closed(MaxRetries) once the retry budget is spent
//! ```
//!
//! The transport is a plain state machine. [`Transport::connect`],
//! [`Transport::disconnect`] and [`Transport::send_frame`] never block; everything
//! that happens on the wire or on a timer surfaces through
//! [`Transport::next_event`], in order. Errors never drive transitions on
//! their own: only a close decides whether to reconnect.
//!
//! Real sockets come from [`ws::WsConnector`]; tests inject
//! [`memory::MemoryConnector`].

pub mod memory;
pub mod ws;

use std::collections::VecDeque;
use std::fmt;
use std::future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::time::{self, Instant, Interval, MissedTickBehavior, Sleep};

use crate::config::ClientConfig;
use crate::protocol::Frame;

// ───────────────────────────────────────────────────────────────────
// States and policy
// ───────────────────────────────────────────────────────────────────

/// Why a transport is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// `connect()` has not been called yet.
    NotStarted,
    /// `disconnect()` or unbind.
    Intentional,
    /// Reconnect attempts exhausted. Only a new `connect()` retries.
    MaxRetries,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotStarted => write!(f, "not-started"),
            Self::Intentional => write!(f, "intentional"),
            Self::MaxRetries => write!(f, "max-retries"),
        }
    }
}

/// Connection lifecycle, owned exclusively by [`Transport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    /// Waiting `delay` before retry number `attempt` (1-based).
    Reconnecting { attempt: u32, delay: Duration },
    Closed(CloseReason),
}

impl ConnectionState {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }

    pub fn is_reconnecting(&self) -> bool {
        matches!(self, Self::Reconnecting { .. })
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting => write!(f, "connecting"),
            Self::Open => write!(f, "open"),
            Self::Reconnecting { attempt, delay } => {
                write!(f, "reconnecting (attempt {attempt}, in {}ms)", delay.as_millis())
            }
            Self::Closed(reason) => write!(f, "closed ({reason})"),
        }
    }
}

/// Exponential backoff: `min(base · 2^attempt, max)`, at most `max_attempts` retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(30_000),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the retry that follows `attempt` failed retries,
    /// or `None` once the budget is spent.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        Some(self.base_delay.saturating_mul(factor).min(self.max_delay))
    }
}

// ───────────────────────────────────────────────────────────────────
// Links and connectors
// ───────────────────────────────────────────────────────────────────

/// Transport errors. Always non-fatal; a close follows if the link is gone.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connect(String),
    #[error("Socket error: {0}")]
    Socket(String),
    #[error("Connection attempt timed out after {0:?}")]
    Timeout(Duration),
}

/// Something arriving on an open link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Text(String),
    Error(String),
}

/// An open duplex channel. Dropping it closes the connection.
///
/// The link is closed once `inbound` yields `None`.
pub struct Link {
    outbound: mpsc::UnboundedSender<String>,
    inbound: mpsc::UnboundedReceiver<LinkEvent>,
}

impl Link {
    pub fn new(
        outbound: mpsc::UnboundedSender<String>,
        inbound: mpsc::UnboundedReceiver<LinkEvent>,
    ) -> Self {
        Self { outbound, inbound }
    }
}

/// Opens links. One call per connection attempt.
pub trait Connector: Send + Sync + 'static {
    fn open(&self, url: &str) -> BoxFuture<'static, Result<Link, TransportError>>;
}

/// Anything session logic can hand outbound frames to.
pub trait FrameSink {
    fn send(&mut self, frame: &Frame);
}

/// Collects frames instead of sending them.
impl FrameSink for Vec<Frame> {
    fn send(&mut self, frame: &Frame) {
        self.push(frame.clone());
    }
}

/// Output of [`Transport::next_event`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    State(ConnectionState),
    /// A raw inbound text frame, not yet decoded.
    Frame(String),
    Error(TransportError),
}

// ───────────────────────────────────────────────────────────────────
// Transport
// ───────────────────────────────────────────────────────────────────

/// The connection state machine for one session identity.
pub struct Transport {
    label: String,
    url: String,
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    heartbeat_every: Duration,
    /// Sent first on every open.
    greeting: Frame,
    /// Sent best-effort on disconnect.
    farewell: Frame,

    state: ConnectionState,
    link: Option<Link>,
    dialing: Option<BoxFuture<'static, Result<Link, TransportError>>>,
    retry_timer: Option<Pin<Box<Sleep>>>,
    heartbeat: Option<Interval>,
    /// Failed retries since the last successful open.
    attempt: u32,
    intentionally_closed: bool,
    events: VecDeque<TransportEvent>,
}

impl Transport {
    pub fn new(
        label: impl Into<String>,
        url: impl Into<String>,
        connector: Arc<dyn Connector>,
        config: &ClientConfig,
        greeting: Frame,
        farewell: Frame,
    ) -> Self {
        Self {
            label: label.into(),
            url: url.into(),
            connector,
            policy: config.reconnect,
            heartbeat_every: config.heartbeat_interval,
            greeting,
            farewell,
            state: ConnectionState::Closed(CloseReason::NotStarted),
            link: None,
            dialing: None,
            retry_timer: None,
            heartbeat: None,
            attempt: 0,
            intentionally_closed: false,
            events: VecDeque::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Start connecting. Idempotent while connecting or open.
    pub fn connect(&mut self) {
        match self.state {
            ConnectionState::Open => {
                log::warn!("[{}] connect() while already connected, ignoring", self.label);
            }
            ConnectionState::Connecting => {
                log::debug!("[{}] connect() while a dial is in flight, ignoring", self.label);
            }
            ConnectionState::Reconnecting { .. } => {
                // Skip the rest of the backoff, keep the attempt count.
                self.intentionally_closed = false;
                self.retry_timer = None;
                self.dial();
            }
            ConnectionState::Closed(_) => {
                self.intentionally_closed = false;
                self.attempt = 0;
                self.dial();
            }
        }
    }

    /// Close on purpose: no reconnect, best-effort farewell frame.
    pub fn disconnect(&mut self) {
        self.intentionally_closed = true;
        self.retry_timer = None;
        self.dialing = None;
        self.heartbeat = None;

        if let Some(link) = self.link.take() {
            if self.state.is_open() {
                write_frame(&self.label, &link, &self.farewell);
            }
        }

        if !matches!(self.state, ConnectionState::Closed(_)) {
            log::info!("[{}] disconnected", self.label);
            self.transition(ConnectionState::Closed(CloseReason::Intentional));
        }
    }

    /// Fire-and-forget. Dropped with a warning unless open.
    pub fn send_frame(&mut self, frame: &Frame) {
        match (&self.state, &self.link) {
            (ConnectionState::Open, Some(link)) => write_frame(&self.label, link, frame),
            _ => log::warn!(
                "[{}] not connected ({}), dropping {} frame",
                self.label,
                self.state,
                frame.kind()
            ),
        }
    }

    /// Pop an already-queued event without waiting on the wire.
    pub fn take_queued(&mut self) -> Option<TransportEvent> {
        self.events.pop_front()
    }

    /// Wait for the next state change, inbound frame, or error.
    ///
    /// Cancel-safe: in-flight dials and timers live on `self`, so dropping
    /// this future loses nothing.
    pub async fn next_event(&mut self) -> TransportEvent {
        loop {
            if let Some(event) = self.events.pop_front() {
                return event;
            }

            tokio::select! {
                result = poll_dial(&mut self.dialing) => {
                    self.dialing = None;
                    match result {
                        Ok(link) => self.on_open(link),
                        Err(e) => {
                            log::warn!("[{}] {e}", self.label);
                            self.events.push_back(TransportEvent::Error(e));
                            self.on_close();
                        }
                    }
                }
                () = wait_retry(&mut self.retry_timer) => {
                    self.retry_timer = None;
                    self.attempt += 1;
                    self.dial();
                }
                () = wait_heartbeat(&mut self.heartbeat) => {
                    log::trace!("[{}] heartbeat", self.label);
                    self.send_frame(&Frame::Hb);
                }
                inbound = recv_link(&mut self.link) => match inbound {
                    Some(LinkEvent::Text(text)) => return TransportEvent::Frame(text),
                    Some(LinkEvent::Error(reason)) => {
                        log::warn!("[{}] socket error: {reason}", self.label);
                        return TransportEvent::Error(TransportError::Socket(reason));
                    }
                    None => {
                        log::info!("[{}] connection closed by peer", self.label);
                        self.link = None;
                        self.on_close();
                    }
                },
            }
        }
    }

    fn dial(&mut self) {
        log::debug!("[{}] dialing {}", self.label, self.url);
        self.dialing = Some(self.connector.open(&self.url));
        self.transition(ConnectionState::Connecting);
    }

    fn on_open(&mut self, link: Link) {
        log::info!("[{}] connected to {}", self.label, self.url);
        self.attempt = 0;
        // Nothing may precede the subscribe/join frame.
        write_frame(&self.label, &link, &self.greeting);
        self.link = Some(link);
        self.heartbeat = Some(heartbeat_interval(self.heartbeat_every));
        self.transition(ConnectionState::Open);
    }

    fn on_close(&mut self) {
        self.heartbeat = None;
        self.link = None;
        if self.intentionally_closed {
            return;
        }

        match self.policy.delay_for(self.attempt) {
            Some(delay) => {
                let attempt = self.attempt + 1;
                log::info!(
                    "[{}] reconnecting in {}ms (attempt {attempt}/{})",
                    self.label,
                    delay.as_millis(),
                    self.policy.max_attempts
                );
                self.retry_timer = Some(Box::pin(time::sleep(delay)));
                self.transition(ConnectionState::Reconnecting { attempt, delay });
            }
            None => {
                log::error!(
                    "[{}] giving up after {} reconnect attempts",
                    self.label,
                    self.policy.max_attempts
                );
                self.transition(ConnectionState::Closed(CloseReason::MaxRetries));
            }
        }
    }

    fn transition(&mut self, next: ConnectionState) {
        if self.state != next {
            log::debug!("[{}] {} → {}", self.label, self.state, next);
            self.state = next;
            self.events.push_back(TransportEvent::State(next));
        }
    }
}

impl FrameSink for Transport {
    fn send(&mut self, frame: &Frame) {
        self.send_frame(frame);
    }
}

fn write_frame(label: &str, link: &Link, frame: &Frame) {
    match frame.encode() {
        Ok(text) => {
            if link.outbound.send(text).is_err() {
                log::warn!("[{label}] link already closed, dropping {} frame", frame.kind());
            }
        }
        Err(e) => log::warn!("[{label}] could not encode {} frame: {e}", frame.kind()),
    }
}

fn heartbeat_interval(every: Duration) -> Interval {
    let mut interval = time::interval_at(Instant::now() + every, every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn poll_dial(
    dialing: &mut Option<BoxFuture<'static, Result<Link, TransportError>>>,
) -> Result<Link, TransportError> {
    match dialing {
        Some(dial) => dial.await,
        None => future::pending().await,
    }
}

async fn wait_retry(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => future::pending().await,
    }
}

async fn wait_heartbeat(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => future::pending().await,
    }
}

async fn recv_link(link: &mut Option<Link>) -> Option<LinkEvent> {
    match link {
        Some(link) => link.inbound.recv().await,
        None => future::pending().await,
    }
}
