//! Integration tests for presence and field locks.
//!
//! These tests start a real server and bind real sessions over
//! WebSockets, verifying the full presence pipeline.

mod support;

use support::{config_for, free_port, Hub};
use tandem_collab::{
    ConnectionState, FieldLockState, LockError, PresenceHandle, PresenceView, SessionError,
    SessionIdentity, SubscriptionState,
};
use tokio::time::{timeout, Duration};

fn order(user: &str) -> SessionIdentity {
    SessionIdentity::new("Order", "123", "acme", user)
}

/// Wait until the view satisfies `pred`, or fail after 5 s.
async fn wait_until(
    handle: &PresenceHandle,
    what: &str,
    pred: impl FnMut(&PresenceView) -> bool,
) -> PresenceView {
    let mut rx = handle.subscribe();
    let view = match timeout(Duration::from_secs(5), rx.wait_for(pred)).await {
        Ok(Ok(view)) => view.clone(),
        Ok(Err(_)) => panic!("session ended while waiting for {what}"),
        Err(_) => panic!("timed out waiting for {what}; last view: {:?}", handle.snapshot()),
    };
    view
}

#[tokio::test]
async fn test_sessions_see_each_other() {
    let hub = Hub::start().await;
    let alice = PresenceHandle::bind(order("alice"), &hub.config());
    wait_until(&alice, "alice subscribed", |v| v.subscription == SubscriptionState::Subscribed).await;

    let bob = PresenceHandle::bind(order("bob"), &hub.config());
    let view = wait_until(&alice, "bob visible", |v| v.other_viewers() == vec!["bob"]).await;
    assert!(view.is_connected());
    assert!(!view.is_loading());
    assert!(!view.is_read_only());

    let view = wait_until(&bob, "alice visible", |v| v.other_viewers() == vec!["alice"]).await;
    assert_eq!(view.presence.unwrap().viewers.len(), 2);
}

#[tokio::test]
async fn test_lock_visible_to_other_session() {
    let hub = Hub::start().await;
    let alice = PresenceHandle::bind(order("alice"), &hub.config());
    let bob = PresenceHandle::bind(order("bob"), &hub.config());
    wait_until(&alice, "alice connected", |v| v.presence.is_some()).await;
    wait_until(&bob, "bob connected", |v| v.presence.is_some()).await;

    alice.acquire_lock("total").await.unwrap();
    assert_eq!(alice.snapshot().lock_state("total"), FieldLockState::Mine);
    assert!(alice.can_edit("total"));

    let view = wait_until(&bob, "lock seen", |v| {
        v.lock_state("total") == FieldLockState::HeldBy("alice".into())
    })
    .await;
    assert!(!view.can_edit("total"));
    assert!(view.can_edit("notes"));

    assert_eq!(
        bob.acquire_lock("total").await,
        Err(LockError::Denied {
            holder: Some("alice".into())
        })
    );

    alice.release_lock("total");
    wait_until(&bob, "lock released", |v| v.lock_state("total") == FieldLockState::Free).await;
    bob.acquire_lock("total").await.unwrap();
    assert_eq!(
        hub.holder("acme", "Order", "123", "total").await.as_deref(),
        Some("bob")
    );
}

#[tokio::test]
async fn test_stale_marks_read_only() {
    let hub = Hub::start().await;
    let alice = PresenceHandle::bind(order("alice"), &hub.config());
    wait_until(&alice, "alice connected", |v| v.presence.is_some()).await;

    hub.set_stale("acme", "Order", "123", Some("carol")).await;
    let view = wait_until(&alice, "stale", |v| v.is_read_only()).await;
    assert_eq!(view.presence.unwrap().busy_by.as_deref(), Some("carol"));
}

#[tokio::test]
async fn test_reconnect_after_server_drop() {
    let hub = Hub::start().await;
    let alice = PresenceHandle::bind(order("alice"), &hub.config());
    wait_until(&alice, "alice connected", |v| v.presence.is_some()).await;
    alice.acquire_lock("total").await.unwrap();

    let mut rx = alice.subscribe();
    hub.drop_connections();

    let reconnecting = timeout(Duration::from_secs(5), rx.wait_for(|v| v.is_reconnecting()))
        .await
        .unwrap()
        .unwrap()
        .clone();
    assert!(reconnecting.locks.is_empty());
    assert_eq!(reconnecting.reconnect_attempt, 1);
    assert!(reconnecting.presence.is_some());

    let view = wait_until(&alice, "resubscribed", |v| {
        v.is_connected() && v.subscription == SubscriptionState::Subscribed
    })
    .await;
    assert_eq!(view.reconnect_attempt, 0);
    assert_eq!(view.lock_state("total"), FieldLockState::Free);
    assert_eq!(hub.holder("acme", "Order", "123", "total").await, None);
}

#[tokio::test]
async fn test_unbind_leaves_room() {
    let hub = Hub::start().await;
    let alice = PresenceHandle::bind(order("alice"), &hub.config());
    let bob = PresenceHandle::bind(order("bob"), &hub.config());
    wait_until(&alice, "bob visible", |v| v.other_viewers() == vec!["bob"]).await;

    bob.unbind().await;
    wait_until(&alice, "bob gone", |v| {
        v.presence.as_ref().is_some_and(|p| p.viewers.len() == 1)
    })
    .await;
}

#[tokio::test]
async fn test_manual_disconnect_and_reconnect() {
    let hub = Hub::start().await;
    let alice = PresenceHandle::bind(order("alice"), &hub.config());
    wait_until(&alice, "alice connected", |v| v.presence.is_some()).await;

    alice.disconnect();
    let view = wait_until(&alice, "closed", |v| !v.is_connected()).await;
    assert!(view.presence.is_none());
    assert!(!view.is_loading());
    assert_eq!(alice.acquire_lock("total").await, Err(LockError::NotConnected));

    alice.connect();
    wait_until(&alice, "reconnected", |v| v.presence.is_some()).await;
}

#[tokio::test]
async fn test_unreachable_server_exhausts_retries() {
    let port = free_port().await;
    let alice = PresenceHandle::bind(order("alice"), &config_for(port));

    let view = wait_until(&alice, "gave up", |v| v.error.is_some()).await;
    assert_eq!(
        view.connection,
        ConnectionState::Closed(tandem_collab::CloseReason::MaxRetries)
    );
    assert_eq!(view.error, Some(SessionError::ReconnectExhausted { attempts: 5 }));
    assert_eq!(view.reconnect_attempt, 5);
}
