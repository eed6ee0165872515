use std::fmt::Display;
use std::sync::Arc;

use crate::address::{ClusterId, EndPoint};
use crate::serverdescription::{ServerDescription, ServerType};

/// The kind of deployment a cluster is talking to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[non_exhaustive]
pub enum ClusterType {
    #[default]
    Unknown,
    Standalone,
    ReplicaSet,
    Sharded,
    LoadBalanced,
}

impl ClusterType {
    pub fn for_server_type(server_type: ServerType) -> Self {
        match server_type {
            ServerType::Unknown => ClusterType::Unknown,
            ServerType::Standalone => ClusterType::Standalone,
            ServerType::ShardRouter => ClusterType::Sharded,
            ServerType::LoadBalanced => ClusterType::LoadBalanced,
            ServerType::ReplicaSetPrimary
            | ServerType::ReplicaSetSecondary
            | ServerType::ReplicaSetArbiter
            | ServerType::ReplicaSetOther
            | ServerType::ReplicaSetGhost => ClusterType::ReplicaSet,
        }
    }
}

impl Display for ClusterType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ClusterType::Unknown => "Unknown",
            ClusterType::Standalone => "Standalone",
            ClusterType::ReplicaSet => "ReplicaSet",
            ClusterType::Sharded => "Sharded",
            ClusterType::LoadBalanced => "LoadBalanced",
        };
        write!(f, "{}", name)
    }
}

/// A snapshot of the servers a cluster knows about.
#[derive(Debug, Clone)]
pub struct ClusterDescription {
    pub cluster_id: ClusterId,
    pub cluster_type: ClusterType,
    pub direct_connection: bool,
    pub servers: Vec<Arc<ServerDescription>>,
}

impl ClusterDescription {
    pub fn new(cluster_id: ClusterId, cluster_type: ClusterType, direct_connection: bool) -> Self {
        Self {
            cluster_id,
            cluster_type,
            direct_connection,
            servers: vec![],
        }
    }

    pub fn server(&self, end_point: &EndPoint) -> Option<&Arc<ServerDescription>> {
        self.servers.iter().find(|s| &s.end_point == end_point)
    }

    /// Adds `description`, replacing any description of the same end point.
    pub fn with_server_description(mut self, description: Arc<ServerDescription>) -> Self {
        match self
            .servers
            .iter_mut()
            .find(|s| s.end_point == description.end_point)
        {
            Some(existing) => *existing = description,
            None => self.servers.push(description),
        }
        self
    }

    pub fn without_server(mut self, end_point: &EndPoint) -> Self {
        self.servers.retain(|s| &s.end_point != end_point);
        self
    }

    pub fn with_type(mut self, cluster_type: ClusterType) -> Self {
        self.cluster_type = cluster_type;
        self
    }
}
