use std::time::Duration;

#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct ConnectionPoolSettings {
    pub max_connections: usize,
    pub wait_queue_timeout: Duration,
    /// Load balanced pools are never paused and track generations per service.
    pub load_balanced: bool,
}

impl ConnectionPoolSettings {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn wait_queue_timeout(mut self, wait_queue_timeout: Duration) -> Self {
        self.wait_queue_timeout = wait_queue_timeout;
        self
    }

    pub fn load_balanced(mut self, load_balanced: bool) -> Self {
        self.load_balanced = load_balanced;
        self
    }
}

impl Default for ConnectionPoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 100,
            wait_queue_timeout: Duration::from_secs(120),
            load_balanced: false,
        }
    }
}
