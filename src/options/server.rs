use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ServerApiVersion {
    V1,
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub struct ServerApi {
    pub version: ServerApiVersion,
    pub strict: Option<bool>,
    pub deprecation_errors: Option<bool>,
}

impl ServerApi {
    pub fn new(version: ServerApiVersion) -> Self {
        Self {
            version,
            strict: None,
            deprecation_errors: None,
        }
    }

    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = Some(strict);
        self
    }

    pub fn deprecation_errors(mut self, deprecation_errors: bool) -> Self {
        self.deprecation_errors = Some(deprecation_errors);
        self
    }
}

#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct ServerSettings {
    pub heartbeat_interval: Duration,
    pub min_heartbeat_interval: Duration,
    pub direct_connection: bool,
    pub load_balanced: bool,
    pub server_api: Option<ServerApi>,
}

impl ServerSettings {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn heartbeat_interval(mut self, heartbeat_interval: Duration) -> Self {
        self.heartbeat_interval = heartbeat_interval;
        self
    }

    pub fn min_heartbeat_interval(mut self, min_heartbeat_interval: Duration) -> Self {
        self.min_heartbeat_interval = min_heartbeat_interval;
        self
    }

    pub fn direct_connection(mut self, direct_connection: bool) -> Self {
        self.direct_connection = direct_connection;
        self
    }

    pub fn load_balanced(mut self, load_balanced: bool) -> Self {
        self.load_balanced = load_balanced;
        self
    }

    pub fn server_api(mut self, server_api: impl Into<Option<ServerApi>>) -> Self {
        self.server_api = server_api.into();
        self
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(10),
            min_heartbeat_interval: Duration::from_millis(500),
            direct_connection: false,
            load_balanced: false,
            server_api: None,
        }
    }
}
