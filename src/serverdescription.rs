use std::collections::BTreeMap;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::address::{EndPoint, ServerId};
use crate::error::Error;
use crate::topologyversion::TopologyVersion;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ServerType {
    #[default]
    Unknown,
    Standalone,
    ReplicaSetPrimary,
    ReplicaSetSecondary,
    ReplicaSetArbiter,
    ReplicaSetOther,
    ReplicaSetGhost,
    ShardRouter,
    LoadBalanced,
}

impl ServerType {
    pub fn is_replica_set_member(&self) -> bool {
        matches!(
            self,
            ServerType::ReplicaSetPrimary
                | ServerType::ReplicaSetSecondary
                | ServerType::ReplicaSetArbiter
                | ServerType::ReplicaSetOther
                | ServerType::ReplicaSetGhost
        )
    }

    pub fn is_writable(&self) -> bool {
        matches!(
            self,
            ServerType::Standalone
                | ServerType::ReplicaSetPrimary
                | ServerType::ShardRouter
                | ServerType::LoadBalanced
        )
    }
}

impl Display for ServerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ServerType::Unknown => "Unknown",
            ServerType::Standalone => "Standalone",
            ServerType::ReplicaSetPrimary => "ReplicaSetPrimary",
            ServerType::ReplicaSetSecondary => "ReplicaSetSecondary",
            ServerType::ReplicaSetArbiter => "ReplicaSetArbiter",
            ServerType::ReplicaSetOther => "ReplicaSetOther",
            ServerType::ReplicaSetGhost => "ReplicaSetGhost",
            ServerType::ShardRouter => "ShardRouter",
            ServerType::LoadBalanced => "LoadBalanced",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ServerState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

pub type TagSet = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReplicaSetConfig {
    pub members: Vec<EndPoint>,
    pub name: Option<String>,
    pub primary: Option<EndPoint>,
    pub version: Option<i32>,
}

/// Opaque election identifier reported by a replica set primary.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ElectionId(pub String);

/// An immutable snapshot of what is known about one node.
///
/// Descriptions are never mutated once published. Every change is expressed by
/// taking a copy and applying `with_*` transforms to it.
#[derive(Debug, Clone)]
pub struct ServerDescription {
    pub server_id: ServerId,
    pub end_point: EndPoint,
    pub server_type: ServerType,
    pub state: ServerState,
    pub heartbeat_exception: Option<Error>,
    pub topology_version: Option<TopologyVersion>,
    pub average_round_trip_time: Duration,
    pub canonical_end_point: Option<EndPoint>,
    pub election_id: Option<ElectionId>,
    pub hello_ok: bool,
    pub last_write_timestamp: Option<DateTime<Utc>>,
    pub logical_session_timeout: Option<Duration>,
    pub max_batch_count: i32,
    pub max_document_size: i32,
    pub max_message_size: i32,
    pub min_wire_version: i32,
    pub max_wire_version: i32,
    pub replica_set_config: Option<ReplicaSetConfig>,
    pub tags: TagSet,
    pub heartbeat_interval: Duration,
    pub last_heartbeat_timestamp: Option<DateTime<Utc>>,
    pub last_update_timestamp: DateTime<Utc>,
    pub reason_changed: String,
}

impl ServerDescription {
    pub fn new(server_id: ServerId, end_point: EndPoint) -> Self {
        Self {
            server_id,
            end_point,
            server_type: ServerType::Unknown,
            state: ServerState::Disconnected,
            heartbeat_exception: None,
            topology_version: None,
            average_round_trip_time: Duration::ZERO,
            canonical_end_point: None,
            election_id: None,
            hello_ok: false,
            last_write_timestamp: None,
            logical_session_timeout: None,
            max_batch_count: 1000,
            max_document_size: 4 * 1024 * 1024,
            max_message_size: 48_000_000,
            min_wire_version: 0,
            max_wire_version: 0,
            replica_set_config: None,
            tags: TagSet::new(),
            heartbeat_interval: Duration::ZERO,
            last_heartbeat_timestamp: None,
            last_update_timestamp: Utc::now(),
            reason_changed: "NotSpecified".to_string(),
        }
    }

    pub fn is_data_bearing(&self) -> bool {
        matches!(
            self.server_type,
            ServerType::Standalone
                | ServerType::ReplicaSetPrimary
                | ServerType::ReplicaSetSecondary
                | ServerType::ShardRouter
                | ServerType::LoadBalanced
        )
    }

    /// Compares the fields that matter for topology decisions, ignoring
    /// bookkeeping such as timestamps, round trip times and reasons.
    pub fn sdam_equals(&self, other: &ServerDescription) -> bool {
        self.end_point == other.end_point
            && self.server_type == other.server_type
            && self.min_wire_version == other.min_wire_version
            && self.max_wire_version == other.max_wire_version
            && self.canonical_end_point == other.canonical_end_point
            && self.election_id == other.election_id
            && self.logical_session_timeout == other.logical_session_timeout
            && self.replica_set_config == other.replica_set_config
            && self.tags == other.tags
            && self.topology_version == other.topology_version
            && self.heartbeat_exception.as_ref().map(|e| e.to_string())
                == other.heartbeat_exception.as_ref().map(|e| e.to_string())
    }

    /// Returns a description that carries the given error and nothing learned
    /// from the node itself.
    pub fn with_heartbeat_exception(&self, error: Error) -> Self {
        let mut description = ServerDescription::new(self.server_id.clone(), self.end_point.clone());
        description.heartbeat_interval = self.heartbeat_interval;
        description.last_heartbeat_timestamp = self.last_heartbeat_timestamp;
        description.topology_version = self.topology_version.clone();
        description.heartbeat_exception = Some(error);
        description.reason_changed = "HeartbeatFailed".to_string();
        description
    }

    pub fn with_type(mut self, server_type: ServerType) -> Self {
        self.server_type = server_type;
        self
    }

    pub fn with_state(mut self, state: ServerState) -> Self {
        self.state = state;
        self
    }

    pub fn with_error(mut self, error: Option<Error>) -> Self {
        self.heartbeat_exception = error;
        self
    }

    pub fn with_topology_version(mut self, topology_version: Option<TopologyVersion>) -> Self {
        self.topology_version = topology_version;
        self
    }

    pub fn with_average_round_trip_time(mut self, rtt: Duration) -> Self {
        self.average_round_trip_time = rtt;
        self
    }

    pub fn with_canonical_end_point(mut self, end_point: Option<EndPoint>) -> Self {
        self.canonical_end_point = end_point;
        self
    }

    pub fn with_election_id(mut self, election_id: Option<ElectionId>) -> Self {
        self.election_id = election_id;
        self
    }

    pub fn with_hello_ok(mut self, hello_ok: bool) -> Self {
        self.hello_ok = hello_ok;
        self
    }

    pub fn with_last_write_timestamp(mut self, timestamp: Option<DateTime<Utc>>) -> Self {
        self.last_write_timestamp = timestamp;
        self
    }

    pub fn with_logical_session_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.logical_session_timeout = timeout;
        self
    }

    pub fn with_size_limits(
        mut self,
        max_batch_count: i32,
        max_document_size: i32,
        max_message_size: i32,
    ) -> Self {
        self.max_batch_count = max_batch_count;
        self.max_document_size = max_document_size;
        self.max_message_size = max_message_size;
        self
    }

    pub fn with_wire_version_range(mut self, min: i32, max: i32) -> Self {
        self.min_wire_version = min;
        self.max_wire_version = max;
        self
    }

    pub fn with_replica_set_config(mut self, config: Option<ReplicaSetConfig>) -> Self {
        self.replica_set_config = config;
        self
    }

    pub fn with_tags(mut self, tags: TagSet) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_last_heartbeat_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.last_heartbeat_timestamp = Some(timestamp);
        self
    }

    pub fn with_last_update_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.last_update_timestamp = timestamp;
        self
    }

    pub fn with_reason_changed(mut self, reason: impl Into<String>) -> Self {
        self.reason_changed = reason.into();
        self
    }
}

#[derive(Debug, Clone)]
pub struct ServerDescriptionChangedEvent {
    pub old_description: Arc<ServerDescription>,
    pub new_description: Arc<ServerDescription>,
}

impl Display for ServerDescription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{{ serverId: {}, type: {}, state: {:?}, reason: {}",
            self.server_id, self.server_type, self.state, self.reason_changed
        )?;
        if let Some(tv) = &self.topology_version {
            write!(f, ", topologyVersion: {}", tv)?;
        }
        if let Some(e) = &self.heartbeat_exception {
            write!(f, ", heartbeatException: {}", e)?;
        }
        write!(f, " }}")
    }
}
