//! Client configuration.
//!
//! Every knob has a default matching the deployed collaboration server;
//! [`ClientConfig::from_env`] overrides them from `TANDEM_*` variables.

use std::str::FromStr;
use std::time::Duration;

use crate::transport::ReconnectPolicy;

/// Client configuration shared by presence and workflow sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Base WebSocket URL, e.g. `ws://localhost:8080`.
    pub server_url: String,
    pub presence_path: String,
    pub workflow_path: String,
    pub heartbeat_interval: Duration,
    pub reconnect: ReconnectPolicy,
    /// Upper bound on a single WebSocket handshake.
    pub connect_timeout: Duration,
    /// How long `acquire_lock` waits for a `LOCK_ACK`.
    pub lock_timeout: Duration,
    /// Buffered graph events per subscriber before the slowest one lags.
    pub event_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://localhost:8080".into(),
            presence_path: "/ws/presence".into(),
            workflow_path: "/ws/workflow".into(),
            heartbeat_interval: Duration::from_secs(30),
            reconnect: ReconnectPolicy::default(),
            connect_timeout: Duration::from_secs(10),
            lock_timeout: Duration::from_secs(5),
            event_capacity: 256,
        }
    }
}

impl ClientConfig {
    /// Defaults overridden by `TANDEM_*` environment variables.
    ///
    /// | Variable                    | Field                       |
    /// |-----------------------------|-----------------------------|
    /// | `TANDEM_SERVER_URL`         | `server_url`                |
    /// | `TANDEM_PRESENCE_PATH`      | `presence_path`             |
    /// | `TANDEM_WORKFLOW_PATH`      | `workflow_path`             |
    /// | `TANDEM_HEARTBEAT_SECS`     | `heartbeat_interval`        |
    /// | `TANDEM_RECONNECT_BASE_MS`  | `reconnect.base_delay`      |
    /// | `TANDEM_RECONNECT_MAX_MS`   | `reconnect.max_delay`       |
    /// | `TANDEM_RECONNECT_ATTEMPTS` | `reconnect.max_attempts`    |
    /// | `TANDEM_CONNECT_TIMEOUT_MS` | `connect_timeout`           |
    /// | `TANDEM_LOCK_TIMEOUT_MS`    | `lock_timeout`              |
    /// | `TANDEM_EVENT_CAPACITY`     | `event_capacity`            |
    ///
    /// Unparseable values are logged and ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an arbitrary source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let secs = |key: &str, default: Duration| {
            Duration::from_secs(parse_or(&lookup, key, default.as_secs()))
        };
        let millis = |key: &str, default: Duration| {
            Duration::from_millis(parse_or(&lookup, key, default.as_millis() as u64))
        };

        let config = Self {
            server_url: lookup("TANDEM_SERVER_URL").unwrap_or(defaults.server_url),
            presence_path: lookup("TANDEM_PRESENCE_PATH").unwrap_or(defaults.presence_path),
            workflow_path: lookup("TANDEM_WORKFLOW_PATH").unwrap_or(defaults.workflow_path),
            heartbeat_interval: secs("TANDEM_HEARTBEAT_SECS", defaults.heartbeat_interval),
            reconnect: ReconnectPolicy {
                base_delay: millis("TANDEM_RECONNECT_BASE_MS", defaults.reconnect.base_delay),
                max_delay: millis("TANDEM_RECONNECT_MAX_MS", defaults.reconnect.max_delay),
                max_attempts: parse_or(
                    &lookup,
                    "TANDEM_RECONNECT_ATTEMPTS",
                    defaults.reconnect.max_attempts,
                ),
            },
            connect_timeout: millis("TANDEM_CONNECT_TIMEOUT_MS", defaults.connect_timeout),
            lock_timeout: millis("TANDEM_LOCK_TIMEOUT_MS", defaults.lock_timeout),
            event_capacity: parse_or(&lookup, "TANDEM_EVENT_CAPACITY", defaults.event_capacity)
                .max(1),
        };
        log::debug!("Client config: {config:?}");
        config
    }

    /// Full URL of the presence endpoint.
    pub fn presence_url(&self) -> String {
        join_url(&self.server_url, &self.presence_path)
    }

    /// Full URL of the workflow collaboration endpoint.
    pub fn workflow_url(&self) -> String {
        join_url(&self.server_url, &self.workflow_path)
    }
}

fn parse_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    match lookup(key) {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            log::warn!("Ignoring {key}={raw:?}: not a valid value");
            default
        }),
    }
}

fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    if path.is_empty() {
        base.to_owned()
    } else if path.starts_with('/') {
        format!("{base}{path}")
    } else {
        format!("{base}/{path}")
    }
}
