//! In-process connector for tests and demos.
//!
//! [`MemoryConnector`] hands out links whose far end is a [`MemoryPeer`]
//! accepted from the paired [`MemoryListener`]. The listener can refuse
//! dials and records when each dial happened, on the tokio clock, so
//! backoff schedules can be checked under a paused runtime.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use futures_util::future::{self, BoxFuture, FutureExt};
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::{Connector, Link, LinkEvent, TransportError};
use crate::protocol::Frame;

#[derive(Default)]
struct Admission {
    refuse_next: AtomicUsize,
    refuse_all: AtomicBool,
}

impl Admission {
    fn refuse(&self) -> bool {
        self.refuse_all.load(Ordering::SeqCst)
            || self
                .refuse_next
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
    }
}

#[derive(Clone)]
pub struct MemoryConnector {
    admission: Arc<Admission>,
    accepted: mpsc::UnboundedSender<MemoryPeer>,
    dialed: mpsc::UnboundedSender<Instant>,
}

pub struct MemoryListener {
    admission: Arc<Admission>,
    accepted: mpsc::UnboundedReceiver<MemoryPeer>,
    dialed: mpsc::UnboundedReceiver<Instant>,
}

impl MemoryConnector {
    pub fn pair() -> (Self, MemoryListener) {
        let admission = Arc::new(Admission::default());
        let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
        let (dialed_tx, dialed_rx) = mpsc::unbounded_channel();
        (
            Self {
                admission: Arc::clone(&admission),
                accepted: accepted_tx,
                dialed: dialed_tx,
            },
            MemoryListener {
                admission,
                accepted: accepted_rx,
                dialed: dialed_rx,
            },
        )
    }
}

impl Connector for MemoryConnector {
    fn open(&self, url: &str) -> BoxFuture<'static, Result<Link, TransportError>> {
        let _ = self.dialed.send(Instant::now());

        let result = if self.admission.refuse() {
            Err(TransportError::Connect(format!("{url}: connection refused")))
        } else {
            let (client_tx, from_client) = mpsc::unbounded_channel();
            let (to_client, client_rx) = mpsc::unbounded_channel();
            let peer = MemoryPeer {
                from_client,
                to_client,
            };
            match self.accepted.send(peer) {
                Ok(()) => Ok(Link::new(client_tx, client_rx)),
                Err(_) => Err(TransportError::Connect(format!("{url}: no listener"))),
            }
        };

        future::ready(result).boxed()
    }
}

impl MemoryListener {
    /// Next connection that was let through.
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.accepted.recv().await
    }

    /// Refuse the next `n` dials.
    pub fn refuse_next(&self, n: usize) {
        self.admission.refuse_next.store(n, Ordering::SeqCst);
    }

    pub fn refuse_all(&self, refuse: bool) {
        self.admission.refuse_all.store(refuse, Ordering::SeqCst);
    }

    /// Drain the instants of every dial since the last call.
    pub fn dials(&mut self) -> Vec<Instant> {
        let mut dials = Vec::new();
        while let Ok(at) = self.dialed.try_recv() {
            dials.push(at);
        }
        dials
    }
}

/// Server side of one in-memory link. Dropping it closes the link.
pub struct MemoryPeer {
    from_client: mpsc::UnboundedReceiver<String>,
    to_client: mpsc::UnboundedSender<LinkEvent>,
}

impl MemoryPeer {
    /// Next frame from the client, `None` once the client hung up.
    pub async fn recv(&mut self) -> Option<Frame> {
        let text = self.from_client.recv().await?;
        Frame::decode(&text).ok()
    }

    pub fn try_recv(&mut self) -> Option<Frame> {
        let text = self.from_client.try_recv().ok()?;
        Frame::decode(&text).ok()
    }

    pub fn send(&self, frame: &Frame) -> bool {
        match frame.encode() {
            Ok(text) => self.send_text(text),
            Err(_) => false,
        }
    }

    /// Push raw text, for frames the codec would never produce.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.to_client.send(LinkEvent::Text(text.into())).is_ok()
    }

    /// Report a socket error without closing.
    pub fn fail(&self, reason: impl Into<String>) -> bool {
        self.to_client.send(LinkEvent::Error(reason.into())).is_ok()
    }

    pub fn close(self) {
        drop(self);
    }
}
