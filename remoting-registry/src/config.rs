//! Registry configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Coordination-store session settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// `host:port` of a coordination store server, or `memory` for a
    /// store private to this process.
    pub connect_string: String,

    /// Root node under which every service path lives.
    pub namespace: String,

    pub session_timeout_ms: u64,
    pub connect_timeout_ms: u64,

    /// Pause between connection attempts while starting.
    pub retry_interval_ms: u64,

    /// Close the session on Ctrl-C so peers observe it promptly. Off by
    /// default: the listener replaces the process's own Ctrl-C handling.
    pub close_on_shutdown_signal: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            connect_string: "memory".to_string(),
            namespace: "remoting".to_string(),
            session_timeout_ms: 10_000,
            connect_timeout_ms: 5_000,
            retry_interval_ms: 1_000,
            close_on_shutdown_signal: false,
        }
    }
}

pub const IN_PROCESS: &str = "memory";

impl RegistryConfig {
    pub fn is_in_process(&self) -> bool {
        self.connect_string == IN_PROCESS
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}
