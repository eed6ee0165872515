use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServerMonitoringMode {
    /// Stream unless running inside a FaaS platform.
    #[default]
    Auto,
    Stream,
    Poll,
}

impl Display for ServerMonitoringMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerMonitoringMode::Auto => write!(f, "auto"),
            ServerMonitoringMode::Stream => write!(f, "stream"),
            ServerMonitoringMode::Poll => write!(f, "poll"),
        }
    }
}

impl FromStr for ServerMonitoringMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(ServerMonitoringMode::Auto),
            "stream" => Ok(ServerMonitoringMode::Stream),
            "poll" => Ok(ServerMonitoringMode::Poll),
            _ => Err(Error::new_invalid_argument_error(&format!(
                "unknown server monitoring mode {}",
                s
            ))),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct ServerMonitorSettings {
    pub connect_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub min_heartbeat_interval: Duration,
    pub server_monitoring_mode: ServerMonitoringMode,
}

impl ServerMonitorSettings {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn heartbeat_interval(mut self, heartbeat_interval: Duration) -> Self {
        self.heartbeat_interval = heartbeat_interval;
        self
    }

    pub fn min_heartbeat_interval(mut self, min_heartbeat_interval: Duration) -> Self {
        self.min_heartbeat_interval = min_heartbeat_interval;
        self
    }

    pub fn server_monitoring_mode(mut self, mode: ServerMonitoringMode) -> Self {
        self.server_monitoring_mode = mode;
        self
    }
}

impl Default for ServerMonitorSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(10),
            min_heartbeat_interval: Duration::from_millis(500),
            server_monitoring_mode: ServerMonitoringMode::Auto,
        }
    }
}
