//! Field-lock bookkeeping for one presence session.
//!
//! ```text
//!            request            LOCK_ACK ok
//!   Free ───────────► Pending ─────────────► Mine ──release──► Free
//!    ▲                  │  LOCK_ACK denied
//!    └──────────────────┘  (holder recorded as HeldBy)
//! ```
//!
//! The server never echoes a request id, so acks are matched per field by
//! counting requests in flight. A newer request for the same field
//! supersedes the older one: only the ack that answers the newest request
//! decides. A pending entry lives only as long as its waiter; once the
//! waiter times out or releases, the count is forgotten with it, since the
//! server may never answer (it replies to some rejected `LOCK`s with a
//! bare `ERROR`). Any grant that then turns up is reported as orphaned so
//! the session can hand the lock straight back.
//!
//! Everything here is synchronous and clock-free apart from the
//! `acquired_at` stamp; timeouts are the caller's business.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::SystemTime;

/// A confirmed lock on one field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldLock {
    pub holder: String,
    pub acquired_at: SystemTime,
}

/// What the local user sees for a single field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldLockState {
    Free,
    /// Requested, waiting for the server.
    Pending,
    /// Held by the local user.
    Mine,
    HeldBy(String),
}

/// Why an `acquire_lock` call failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LockError {
    #[error("Field is locked by {}", .holder.as_deref().unwrap_or("another user"))]
    Denied { holder: Option<String> },
    #[error("No lock acknowledgement before the timeout")]
    TimedOut,
    #[error("Superseded by a newer request for the same field")]
    Superseded,
    #[error("Request withdrawn by a release")]
    Released,
    #[error("Connection lost before the lock was confirmed")]
    ConnectionLost,
    #[error("Not connected")]
    NotConnected,
    #[error("Session closed")]
    SessionClosed,
}

/// Result of feeding a `LOCK_ACK` to the arbiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckOutcome {
    /// A denial nobody asked for, or a repeat grant for a lock already held.
    Stray,
    /// Answers a request that a newer one replaced.
    Superseded,
    Granted(u64),
    /// Denied; carries the waiting ticket.
    Denied(u64),
    /// Granted with nobody waiting. The lock must be released.
    Orphaned,
}

#[derive(Debug)]
struct PendingLock {
    /// Ticket of the newest waiter.
    ticket: u64,
    in_flight: u32,
}

/// Field-lock map plus the requests still waiting on the server.
#[derive(Debug)]
pub struct LockArbiter {
    local_user: String,
    held: BTreeMap<String, FieldLock>,
    pending: HashMap<String, PendingLock>,
}

impl LockArbiter {
    pub fn new(local_user: impl Into<String>) -> Self {
        Self {
            local_user: local_user.into(),
            held: BTreeMap::new(),
            pending: HashMap::new(),
        }
    }

    /// Record a `LOCK` about to be sent. Returns the ticket it supersedes.
    pub fn request(&mut self, field: &str, ticket: u64) -> Option<u64> {
        match self.pending.get_mut(field) {
            Some(entry) => {
                entry.in_flight += 1;
                Some(std::mem::replace(&mut entry.ticket, ticket))
            }
            None => {
                self.pending.insert(
                    field.to_owned(),
                    PendingLock {
                        ticket,
                        in_flight: 1,
                    },
                );
                None
            }
        }
    }

    /// Apply a `LOCK_ACK`.
    pub fn on_ack(&mut self, field: &str, success: bool, holder: Option<String>) -> AckOutcome {
        if !self.pending.contains_key(field) {
            return if success && !self.holds(field) {
                AckOutcome::Orphaned
            } else {
                AckOutcome::Stray
            };
        }
        let Some(entry) = self.pending.get_mut(field) else {
            return AckOutcome::Stray;
        };
        entry.in_flight = entry.in_flight.saturating_sub(1);
        if entry.in_flight > 0 {
            return AckOutcome::Superseded;
        }
        let ticket = entry.ticket;
        self.pending.remove(field);

        if success {
            let lock = self.stamp(field, self.local_user.clone());
            self.held.insert(field.to_owned(), lock);
            return AckOutcome::Granted(ticket);
        }

        match holder {
            Some(holder) if holder != self.local_user => {
                self.held.insert(field.to_owned(), self.stamp(field, holder));
            }
            _ => {
                if self.holds(field) {
                    self.held.remove(field);
                }
            }
        }
        AckOutcome::Denied(ticket)
    }

    /// The waiter behind `ticket` gave up. Returns whether it was still current.
    ///
    /// Forgets the field's requests in flight too: an answer may never come.
    pub fn expire(&mut self, field: &str, ticket: u64) -> bool {
        let current = self
            .pending
            .get(field)
            .is_some_and(|entry| entry.ticket == ticket);
        if current {
            self.pending.remove(field);
        }
        current
    }

    /// Forget the local claim on `field`. Returns the withdrawn waiter, if any.
    pub fn release(&mut self, field: &str) -> Option<u64> {
        if self.holds(field) {
            self.held.remove(field);
        }
        self.pending.remove(field).map(|entry| entry.ticket)
    }

    /// Replace confirmed locks with the server's authoritative map.
    /// Requests still in flight are kept.
    pub fn replace_confirmed(&mut self, locks: &BTreeMap<String, String>) {
        let previous = std::mem::take(&mut self.held);
        self.held = locks
            .iter()
            .map(|(field, holder)| {
                let acquired_at = previous
                    .get(field)
                    .filter(|lock| &lock.holder == holder)
                    .map_or_else(SystemTime::now, |lock| lock.acquired_at);
                (
                    field.clone(),
                    FieldLock {
                        holder: holder.clone(),
                        acquired_at,
                    },
                )
            })
            .collect();
    }

    /// Forget everything. Returns the tickets still waiting.
    pub fn drop_all(&mut self) -> Vec<u64> {
        self.held.clear();
        self.pending
            .drain()
            .map(|(_, entry)| entry.ticket)
            .collect()
    }

    /// Whether the local user holds `field`.
    pub fn holds(&self, field: &str) -> bool {
        self.held
            .get(field)
            .is_some_and(|lock| lock.holder == self.local_user)
    }

    /// A field is editable when nobody else holds it.
    pub fn can_edit(&self, field: &str) -> bool {
        self.held
            .get(field)
            .map_or(true, |lock| lock.holder == self.local_user)
    }

    pub fn state(&self, field: &str) -> FieldLockState {
        match self.held.get(field) {
            Some(lock) if lock.holder == self.local_user => FieldLockState::Mine,
            Some(lock) => FieldLockState::HeldBy(lock.holder.clone()),
            None if self.is_pending(field) => FieldLockState::Pending,
            None => FieldLockState::Free,
        }
    }

    pub fn holder(&self, field: &str) -> Option<&str> {
        self.held.get(field).map(|lock| lock.holder.as_str())
    }

    pub fn held(&self) -> &BTreeMap<String, FieldLock> {
        &self.held
    }

    /// Fields with a waiter still expecting an answer.
    pub fn pending_fields(&self) -> BTreeSet<String> {
        self.pending.keys().cloned().collect()
    }

    fn is_pending(&self, field: &str) -> bool {
        self.pending.contains_key(field)
    }

    fn stamp(&self, field: &str, holder: String) -> FieldLock {
        let acquired_at = self
            .held
            .get(field)
            .filter(|lock| lock.holder == holder)
            .map_or_else(SystemTime::now, |lock| lock.acquired_at);
        FieldLock {
            holder,
            acquired_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grant_marks_mine() {
        let mut arbiter = LockArbiter::new("alice");
        assert_eq!(arbiter.request("total", 1), None);
        assert_eq!(arbiter.state("total"), FieldLockState::Pending);

        assert_eq!(arbiter.on_ack("total", true, None), AckOutcome::Granted(1));
        assert_eq!(arbiter.state("total"), FieldLockState::Mine);
        assert!(arbiter.can_edit("total"));
        assert!(arbiter.pending_fields().is_empty());
    }

    #[test]
    fn test_denial_reverts_pending() {
        let mut arbiter = LockArbiter::new("alice");
        arbiter.request("total", 1);

        assert_eq!(
            arbiter.on_ack("total", false, Some("bob".into())),
            AckOutcome::Denied(1)
        );
        assert_eq!(arbiter.state("total"), FieldLockState::HeldBy("bob".into()));
        assert!(!arbiter.can_edit("total"));
    }

    #[test]
    fn test_denial_without_holder_is_free() {
        let mut arbiter = LockArbiter::new("alice");
        arbiter.request("total", 1);
        assert_eq!(
            arbiter.on_ack("total", false, None),
            AckOutcome::Denied(1)
        );
        assert_eq!(arbiter.state("total"), FieldLockState::Free);
    }

    #[test]
    fn test_newest_request_decides() {
        let mut arbiter = LockArbiter::new("alice");
        arbiter.request("total", 1);
        assert_eq!(arbiter.request("total", 2), Some(1));

        // The first ack answers the superseded request.
        assert_eq!(arbiter.on_ack("total", true, None), AckOutcome::Superseded);
        assert_eq!(arbiter.state("total"), FieldLockState::Pending);

        assert_eq!(arbiter.on_ack("total", true, None), AckOutcome::Granted(2));
        assert_eq!(arbiter.state("total"), FieldLockState::Mine);
    }

    #[test]
    fn test_late_grant_is_orphaned() {
        let mut arbiter = LockArbiter::new("alice");
        arbiter.request("total", 7);
        assert!(arbiter.expire("total", 7));
        assert_eq!(arbiter.state("total"), FieldLockState::Free);

        assert_eq!(arbiter.on_ack("total", true, None), AckOutcome::Orphaned);
        assert_eq!(arbiter.state("total"), FieldLockState::Free);
    }

    #[test]
    fn test_expire_ignores_old_ticket() {
        let mut arbiter = LockArbiter::new("alice");
        arbiter.request("total", 1);
        arbiter.request("total", 2);
        assert!(!arbiter.expire("total", 1));
        assert_eq!(arbiter.pending_fields().len(), 1);
    }

    #[test]
    fn test_release_withdraws_request() {
        let mut arbiter = LockArbiter::new("alice");
        arbiter.request("total", 3);
        assert_eq!(arbiter.release("total"), Some(3));
        assert!(arbiter.pending_fields().is_empty());

        // The UNLOCK already went out, so the grant is handed back again.
        assert_eq!(arbiter.on_ack("total", true, None), AckOutcome::Orphaned);
        assert_eq!(arbiter.state("total"), FieldLockState::Free);
    }

    #[test]
    fn test_release_held_lock() {
        let mut arbiter = LockArbiter::new("alice");
        arbiter.request("total", 1);
        arbiter.on_ack("total", true, None);
        assert_eq!(arbiter.release("total"), None);
        assert_eq!(arbiter.state("total"), FieldLockState::Free);
    }

    #[test]
    fn test_unsolicited_acks() {
        let mut arbiter = LockArbiter::new("alice");
        assert_eq!(arbiter.on_ack("total", false, None), AckOutcome::Stray);
        assert_eq!(arbiter.on_ack("total", true, None), AckOutcome::Orphaned);
        assert!(arbiter.held().is_empty());

        // A repeat grant for a lock already held is not handed back.
        arbiter.request("total", 1);
        arbiter.on_ack("total", true, None);
        assert_eq!(arbiter.on_ack("total", true, None), AckOutcome::Stray);
        assert_eq!(arbiter.state("total"), FieldLockState::Mine);
    }

    #[test]
    fn test_unanswered_request_forgotten_on_expire() {
        let mut arbiter = LockArbiter::new("alice");
        arbiter.request("total", 1);
        // No LOCK_ACK ever comes for ticket 1.
        assert!(arbiter.expire("total", 1));

        assert_eq!(arbiter.request("total", 2), None);
        assert_eq!(arbiter.on_ack("total", true, None), AckOutcome::Granted(2));
        assert_eq!(arbiter.state("total"), FieldLockState::Mine);
    }

    #[test]
    fn test_replace_confirmed_keeps_pending() {
        let mut arbiter = LockArbiter::new("alice");
        arbiter.request("notes", 1);

        let locks: BTreeMap<String, String> =
            [("total".to_string(), "bob".to_string())].into_iter().collect();
        arbiter.replace_confirmed(&locks);

        assert_eq!(arbiter.state("total"), FieldLockState::HeldBy("bob".into()));
        assert_eq!(arbiter.state("notes"), FieldLockState::Pending);

        arbiter.replace_confirmed(&BTreeMap::new());
        assert_eq!(arbiter.state("total"), FieldLockState::Free);
    }

    #[test]
    fn test_replace_confirmed_keeps_timestamp() {
        let mut arbiter = LockArbiter::new("alice");
        let locks: BTreeMap<String, String> =
            [("total".to_string(), "bob".to_string())].into_iter().collect();
        arbiter.replace_confirmed(&locks);
        let first = arbiter.held()["total"].acquired_at;
        arbiter.replace_confirmed(&locks);
        assert_eq!(arbiter.held()["total"].acquired_at, first);
    }

    #[test]
    fn test_drop_all_returns_waiters() {
        let mut arbiter = LockArbiter::new("alice");
        arbiter.request("total", 1);
        arbiter.request("notes", 2);
        arbiter.expire("notes", 2);
        arbiter.request("amount", 3);
        arbiter.on_ack("amount", true, None);

        let mut waiting = arbiter.drop_all();
        waiting.sort_unstable();
        assert_eq!(waiting, vec![1]);
        assert!(arbiter.held().is_empty());
        assert_eq!(arbiter.state("total"), FieldLockState::Free);
    }

    #[test]
    fn test_lock_error_display() {
        let denied = LockError::Denied {
            holder: Some("bob".into()),
        };
        assert_eq!(denied.to_string(), "Field is locked by bob");
        assert_eq!(
            LockError::Denied { holder: None }.to_string(),
            "Field is locked by another user"
        );
    }
}
