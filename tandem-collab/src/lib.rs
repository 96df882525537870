//! # tandem-collab: Presence, field locks and workflow co-editing
//!
//! Client side of the collaboration server: who is looking at an entity,
//! who holds which field, and live relaying of workflow graph edits.
//!
//! ## Architecture
//!
//! ```text
//!  PresenceHandle / CollabHandle        (projection: snapshot + watch)
//!          │ Control             ▲ view
//!          ▼                     │
//!  ┌───────────────────────────────────┐
//!  │ session driver task               │
//!  │  PresenceState ── LockArbiter     │
//!  │  CollabState   ── Roster, cursors │
//!  └──────────────┬────────────────────┘
//!                 │ Frame (JSON)
//!  ┌──────────────▼────────────────────┐
//!  │ Transport (reconnect, heartbeat)  │
//!  │   WsConnector | MemoryConnector   │
//!  └──────────────┬────────────────────┘
//!                 ▼
//!          collaboration server
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON wire frames and their codec
//! - [`transport`]: connection state machine with backoff and heartbeat
//! - [`locks`]: advisory field-lock bookkeeping
//! - [`presence`]: entity presence session
//! - [`collab`]: workflow co-editing session
//! - [`projection`]: handles exposing sessions as observable views
//! - [`config`]: client configuration
//!
//! ## Defaults
//!
//! | Setting | Value |
//! |---------|-------|
//! | Heartbeat | 30 s |
//! | Reconnect backoff | 1 s doubling, 30 s cap |
//! | Reconnect attempts | 5 |
//! | Lock acknowledgement timeout | 5 s |

pub mod collab;
pub mod config;
pub mod identity;
pub mod locks;
pub mod presence;
pub mod projection;
pub mod protocol;
pub mod session;
pub mod transport;

// Re-exports for convenience
pub use collab::{CollabEvent, CursorPosition, Roster};
pub use config::ClientConfig;
pub use identity::{CollabIdentity, SessionIdentity};
pub use locks::{FieldLock, FieldLockState, LockArbiter, LockError};
pub use presence::PresenceSnapshot;
pub use projection::{CollabHandle, CollabView, PresenceHandle, PresenceView};
pub use protocol::{Collaborator, Frame, PresencePayload, ProtocolError};
pub use session::{SessionError, SubscriptionState};
pub use transport::{
    CloseReason, ConnectionState, Connector, ReconnectPolicy, TransportError,
};
