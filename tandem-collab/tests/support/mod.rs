//! A small collaboration server for integration tests.
//!
//! Speaks the same JSON protocol as the real backend over real WebSockets:
//! presence rooms with field locks on `/ws/presence`, workflow rooms on
//! `/ws/workflow` (the path is not checked; the first frame decides).
#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tandem_collab::{ClientConfig, Collaborator, Frame, PresencePayload, ReconnectPolicy};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex};
use tokio_tungstenite::tungstenite::Message;

/// Find a free port for testing.
pub async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Client config pointing at `port`, with fast reconnects.
pub fn config_for(port: u16) -> ClientConfig {
    ClientConfig {
        server_url: format!("ws://127.0.0.1:{port}"),
        reconnect: ReconnectPolicy {
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(400),
            max_attempts: 5,
        },
        lock_timeout: Duration::from_secs(2),
        ..ClientConfig::default()
    }
}

/// Message fanned out to a room. `skip` is the connection that caused it.
#[derive(Clone)]
struct Envelope {
    skip: Option<u64>,
    text: String,
}

struct PresenceRoom {
    viewers: HashMap<u64, String>,
    /// field → (holder, connection that took it)
    locks: BTreeMap<String, (String, u64)>,
    stale: bool,
    busy_by: Option<String>,
    version: u64,
    tx: broadcast::Sender<Envelope>,
}

impl PresenceRoom {
    fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self {
            viewers: HashMap::new(),
            locks: BTreeMap::new(),
            stale: false,
            busy_by: None,
            version: 0,
            tx,
        }
    }

    fn publish(&mut self) {
        self.version += 1;
        let users: BTreeSet<&String> = self.viewers.values().collect();
        let payload = PresencePayload {
            users: users.into_iter().cloned().collect(),
            stale: self.stale,
            busy_by: self.busy_by.clone(),
            version: Some(self.version),
            locks: Some(
                self.locks
                    .iter()
                    .map(|(field, (holder, _))| (field.clone(), holder.clone()))
                    .collect(),
            ),
        };
        self.fan_out(None, &Frame::Presence(payload));
    }

    fn fan_out(&self, skip: Option<u64>, frame: &Frame) {
        let text = frame.encode().unwrap();
        let _ = self.tx.send(Envelope { skip, text });
    }
}

struct WorkflowRoom {
    members: BTreeMap<u64, Collaborator>,
    tx: broadcast::Sender<Envelope>,
}

impl WorkflowRoom {
    fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self {
            members: BTreeMap::new(),
            tx,
        }
    }

    fn users(&self) -> Vec<Collaborator> {
        self.members.values().cloned().collect()
    }

    fn fan_out(&self, skip: Option<u64>, frame: &Frame) {
        let text = frame.encode().unwrap();
        let _ = self.tx.send(Envelope { skip, text });
    }
}

#[derive(Default)]
struct HubState {
    next_conn: u64,
    presence: HashMap<String, PresenceRoom>,
    workflows: HashMap<String, WorkflowRoom>,
}

/// What a connection has joined.
enum Membership {
    Presence { room: String, user: String },
    Workflow { entity: String, user: Collaborator },
}

/// Running test server.
pub struct Hub {
    pub port: u16,
    state: Arc<Mutex<HubState>>,
    kill: broadcast::Sender<()>,
}

impl Hub {
    /// Start a hub on a free port.
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let state = Arc::new(Mutex::new(HubState::default()));
        let (kill, _) = broadcast::channel(4);

        let accept_state = state.clone();
        let accept_kill = kill.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let state = accept_state.clone();
                let kill = accept_kill.subscribe();
                tokio::spawn(handle_connection(stream, state, kill));
            }
        });

        Self { port, state, kill }
    }

    pub fn config(&self) -> ClientConfig {
        config_for(self.port)
    }

    /// Drop every open socket without a closing handshake.
    pub fn drop_connections(&self) {
        let _ = self.kill.send(());
    }

    /// Mark an entity stale, as when another user has a pending write.
    pub async fn set_stale(&self, tenant: &str, entity: &str, id: &str, busy_by: Option<&str>) {
        let mut state = self.state.lock().await;
        let room = state
            .presence
            .entry(room_key(tenant, entity, id))
            .or_insert_with(PresenceRoom::new);
        room.stale = true;
        room.busy_by = busy_by.map(str::to_owned);
        room.publish();
    }

    /// Current lock holder of a field, as the server sees it.
    pub async fn holder(&self, tenant: &str, entity: &str, id: &str, field: &str) -> Option<String> {
        let state = self.state.lock().await;
        state
            .presence
            .get(&room_key(tenant, entity, id))
            .and_then(|room| room.locks.get(field))
            .map(|(holder, _)| holder.clone())
    }
}

fn room_key(tenant: &str, entity: &str, id: &str) -> String {
    format!("{tenant}/{entity}/{id}")
}

async fn recv_room(rx: &mut Option<broadcast::Receiver<Envelope>>) -> Option<Envelope> {
    match rx {
        Some(rx) => loop {
            match rx.recv().await {
                Ok(envelope) => return Some(envelope),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        },
        None => std::future::pending().await,
    }
}

async fn handle_connection(
    stream: TcpStream,
    state: Arc<Mutex<HubState>>,
    mut kill: broadcast::Receiver<()>,
) {
    let Ok(ws_stream) = tokio_tungstenite::accept_async(stream).await else {
        return;
    };
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let conn = {
        let mut s = state.lock().await;
        s.next_conn += 1;
        s.next_conn
    };
    let mut membership: Option<Membership> = None;
    let mut room_rx: Option<broadcast::Receiver<Envelope>> = None;

    loop {
        tokio::select! {
            msg = ws_receiver.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let Ok(frame) = Frame::decode(text.as_str()) else {
                        continue;
                    };
                    let replies =
                        handle_frame(&state, conn, frame, &mut membership, &mut room_rx).await;
                    for reply in replies {
                        let text = reply.encode().unwrap();
                        if ws_sender.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                _ => {}
            },
            envelope = recv_room(&mut room_rx) => match envelope {
                Some(envelope) if envelope.skip == Some(conn) => {}
                Some(envelope) => {
                    if ws_sender.send(Message::Text(envelope.text.into())).await.is_err() {
                        break;
                    }
                }
                None => room_rx = None,
            },
            _ = kill.recv() => {
                // Abrupt: no closing handshake.
                drop(ws_sender);
                drop(ws_receiver);
                leave(&state, conn, membership.take()).await;
                return;
            }
        }
    }

    leave(&state, conn, membership.take()).await;
}

async fn handle_frame(
    state: &Arc<Mutex<HubState>>,
    conn: u64,
    frame: Frame,
    membership: &mut Option<Membership>,
    room_rx: &mut Option<broadcast::Receiver<Envelope>>,
) -> Vec<Frame> {
    let mut s = state.lock().await;
    match frame {
        Frame::Sub {
            user_id,
            tenant_id,
            entity,
            id,
        } => {
            let key = room_key(&tenant_id, &entity, &id);
            let room = s.presence.entry(key.clone()).or_insert_with(PresenceRoom::new);
            room.viewers.insert(conn, user_id.clone());
            *room_rx = Some(room.tx.subscribe());
            room.publish();
            *membership = Some(Membership::Presence {
                room: key,
                user: user_id,
            });
            Vec::new()
        }
        Frame::Hb => vec![Frame::HbAck],
        Frame::Lock { field } => {
            let Some(Membership::Presence { room, user }) = membership.as_ref() else {
                return vec![error("Not subscribed")];
            };
            let Some(room) = s.presence.get_mut(room) else {
                return vec![error("Room gone")];
            };
            match room.locks.get(&field) {
                Some((holder, _)) if holder != user => vec![Frame::LockAck {
                    field,
                    success: false,
                    holder: Some(holder.clone()),
                }],
                _ => {
                    room.locks.insert(field.clone(), (user.clone(), conn));
                    room.publish();
                    vec![Frame::LockAck {
                        field,
                        success: true,
                        holder: None,
                    }]
                }
            }
        }
        Frame::Unlock { field } => {
            if let Some(Membership::Presence { room, user }) = membership.as_ref() {
                if let Some(room) = s.presence.get_mut(room) {
                    if room.locks.get(&field).is_some_and(|(holder, _)| holder == user) {
                        room.locks.remove(&field);
                        room.publish();
                    }
                }
            }
            vec![Frame::UnlockAck {
                field,
                success: true,
            }]
        }
        Frame::Unsub => {
            drop(s);
            leave(state, conn, membership.take()).await;
            *room_rx = None;
            vec![Frame::UnsubAck]
        }
        Frame::Join {
            entity,
            user_id,
            username,
        } => {
            let room = s
                .workflows
                .entry(entity.clone())
                .or_insert_with(WorkflowRoom::new);
            let user = Collaborator::new(user_id.clone(), username.clone());
            room.members.insert(conn, user.clone());
            *room_rx = Some(room.tx.subscribe());
            room.fan_out(
                None,
                &Frame::UserJoined {
                    entity: Some(entity.clone()),
                    user_id,
                    username,
                    users: room.users(),
                },
            );
            *membership = Some(Membership::Workflow { entity, user });
            Vec::new()
        }
        Frame::Leave { .. } => {
            drop(s);
            leave(state, conn, membership.take()).await;
            *room_rx = None;
            Vec::new()
        }
        Frame::NodeUpdate { .. }
        | Frame::EdgeUpdate { .. }
        | Frame::NodeDelete { .. }
        | Frame::EdgeDelete { .. }
        | Frame::Cursor { .. } => {
            let Some(Membership::Workflow { entity, user }) = membership.as_ref() else {
                return vec![error("Not joined")];
            };
            let Some(room) = s.workflows.get(entity) else {
                return vec![error("Room gone")];
            };
            room.fan_out(Some(conn), &relay(frame, entity, user));
            Vec::new()
        }
        other => vec![error(&format!("Unexpected {}", other.kind()))],
    }
}

/// Server → client form of a graph edit.
fn relay(frame: Frame, entity: &str, user: &Collaborator) -> Frame {
    let entity = Some(entity.to_owned());
    let user_id = user.user_id.clone();
    match frame {
        Frame::NodeUpdate { node, .. } => Frame::NodeUpdated {
            entity,
            node,
            user_id,
        },
        Frame::EdgeUpdate { edge, .. } => Frame::EdgeUpdated {
            entity,
            edge,
            user_id,
        },
        Frame::NodeDelete { node_id, .. } => Frame::NodeDeleted {
            entity,
            node_id,
            user_id,
        },
        Frame::EdgeDelete { edge_id, .. } => Frame::EdgeDeleted {
            entity,
            edge_id,
            user_id,
        },
        Frame::Cursor { x, y, .. } => Frame::CursorMoved {
            entity,
            user_id,
            username: user.username.clone(),
            x,
            y,
        },
        other => other,
    }
}

fn error(message: &str) -> Frame {
    Frame::Error {
        error: Some(message.to_owned()),
        message: None,
    }
}

/// Remove a connection from whatever it joined, releasing its locks.
async fn leave(state: &Arc<Mutex<HubState>>, conn: u64, membership: Option<Membership>) {
    let mut s = state.lock().await;
    match membership {
        Some(Membership::Presence { room, .. }) => {
            if let Some(room) = s.presence.get_mut(&room) {
                room.viewers.remove(&conn);
                room.locks.retain(|_, (_, owner)| *owner != conn);
                room.publish();
            }
        }
        Some(Membership::Workflow { entity, user }) => {
            if let Some(room) = s.workflows.get_mut(&entity) {
                room.members.remove(&conn);
                room.fan_out(
                    Some(conn),
                    &Frame::UserLeft {
                        entity: Some(entity.clone()),
                        user_id: user.user_id,
                        username: Some(user.username),
                        users: room.users(),
                    },
                );
            }
        }
        None => {}
    }
}
