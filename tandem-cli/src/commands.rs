//! Command implementations.

use log::{info, warn};
use tandem_collab::{
    ClientConfig, CloseReason, CollabEvent, CollabHandle, CollabIdentity, CollabView,
    ConnectionState, FieldLockState, PresenceHandle, PresenceView, SessionIdentity,
};
use tokio::sync::{broadcast, watch};

type Result<T> = std::result::Result<T, Box<dyn std::error::Error>>;

/// Watch presence on one entity until Ctrl-C, optionally holding a field lock.
pub async fn presence(
    config: &ClientConfig,
    entity: &str,
    id: &str,
    tenant: &str,
    user: &str,
    lock: Option<&str>,
) -> Result<()> {
    let identity = SessionIdentity::new(entity, id, tenant, user);
    println!("Watching {identity} via {}", config.presence_url());

    let handle = PresenceHandle::bind(identity, config);
    let mut rx = handle.subscribe();

    let outcome = watch_presence(&handle, &mut rx, lock).await;

    if let Some(field) = lock {
        if handle.snapshot().lock_state(field) == FieldLockState::Mine {
            handle.release_lock(field);
            println!("Released lock on '{field}'");
        }
    }
    handle.unbind().await;
    outcome
}

async fn watch_presence(
    handle: &PresenceHandle,
    rx: &mut watch::Receiver<PresenceView>,
    lock: Option<&str>,
) -> Result<()> {
    let mut pending_lock = lock;
    let mut errors_seen = {
        let view = rx.borrow_and_update();
        print_presence(&view);
        view.error_seq
    };

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, leaving");
                return Ok(());
            }
            changed = rx.changed() => {
                if changed.is_err() {
                    return Err("presence session ended".into());
                }
                let view = rx.borrow_and_update().clone();
                print_presence(&view);
                if view.error_seq != errors_seen {
                    errors_seen = view.error_seq;
                    if let Some(error) = &view.error {
                        eprintln!("error: {error}");
                    }
                }

                if gave_up(&view.connection) {
                    return Err(view
                        .error
                        .map(|e| e.to_string())
                        .unwrap_or_else(|| "connection closed".into())
                        .into());
                }

                if view.presence.is_some() {
                    if let Some(field) = pending_lock.take() {
                        tokio::select! {
                            _ = tokio::signal::ctrl_c() => return Ok(()),
                            result = handle.acquire_lock(field) => match result {
                                Ok(()) => println!("Holding lock on '{field}'"),
                                Err(e) => warn!("Could not lock '{field}': {e}"),
                            },
                        }
                    }
                }
            }
        }
    }
}

fn print_presence(view: &PresenceView) {
    match &view.presence {
        Some(snapshot) => {
            let others = view.other_viewers();
            let viewers = if others.is_empty() {
                "nobody else".to_string()
            } else {
                others.join(", ")
            };
            let mut line = format!("[{}] also viewing: {viewers}", view.connection);
            if let Some(version) = snapshot.version {
                line.push_str(&format!(" (v{version})"));
            }
            if view.is_read_only() {
                let by = snapshot.busy_by.as_deref().unwrap_or("another user");
                line.push_str(&format!(" READ-ONLY, edited by {by}"));
            }
            println!("{line}");
            for (field, lock) in &view.locks {
                println!("    lock {field} -> {}", lock.holder);
            }
        }
        None => println!("[{}] waiting for presence", view.connection),
    }
}

/// Join a workflow room and print roster changes and graph edits until Ctrl-C.
pub async fn workflow(config: &ClientConfig, entity: &str, user: &str, name: &str) -> Result<()> {
    let identity = CollabIdentity::new(entity, user, name);
    println!("Joining workflow '{entity}' as {name} via {}", config.workflow_url());

    let handle = CollabHandle::bind(identity, config);
    let mut rx = handle.subscribe();
    let mut events = handle.events();

    let outcome = watch_workflow(&mut rx, &mut events).await;
    handle.unbind().await;
    outcome
}

async fn watch_workflow(
    rx: &mut watch::Receiver<CollabView>,
    events: &mut broadcast::Receiver<CollabEvent>,
) -> Result<()> {
    let mut last_state = rx.borrow_and_update().connection;
    println!("[{last_state}]");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, leaving");
                return Ok(());
            }
            changed = rx.changed() => {
                if changed.is_err() {
                    return Err("workflow session ended".into());
                }
                let view = rx.borrow_and_update().clone();
                if view.connection != last_state {
                    last_state = view.connection;
                    println!("[{last_state}] {} in room", view.roster.len());
                }
                if gave_up(&view.connection) {
                    return Err(view
                        .error
                        .map(|e| e.to_string())
                        .unwrap_or_else(|| "connection closed".into())
                        .into());
                }
            }
            event = events.recv() => match event {
                Ok(event) => print_event(&event)?,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Skipped {n} events");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err("workflow session ended".into());
                }
            },
        }
    }
}

fn print_event(event: &CollabEvent) -> Result<()> {
    match event {
        CollabEvent::UserJoined { user_id, username } => {
            println!("+ {username} ({user_id}) joined");
        }
        CollabEvent::UserLeft { user_id } => println!("- {user_id} left"),
        CollabEvent::NodeUpdated { node, author, own } if !own => {
            println!("node updated by {author}: {}", serde_json::to_string(node)?);
        }
        CollabEvent::EdgeUpdated { edge, author, own } if !own => {
            println!("edge updated by {author}: {}", serde_json::to_string(edge)?);
        }
        CollabEvent::NodeDeleted { node_id, author, own } if !own => {
            println!("node {node_id} deleted by {author}");
        }
        CollabEvent::EdgeDeleted { edge_id, author, own } if !own => {
            println!("edge {edge_id} deleted by {author}");
        }
        CollabEvent::CursorMoved(cursor) => {
            println!("{} cursor at ({:.1}, {:.1})", cursor.username, cursor.x, cursor.y);
        }
        CollabEvent::Error(message) => eprintln!("server error: {message}"),
        _ => {}
    }
    Ok(())
}

fn gave_up(state: &ConnectionState) -> bool {
    matches!(state, ConnectionState::Closed(CloseReason::MaxRetries))
}
