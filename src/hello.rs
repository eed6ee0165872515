use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::address::{EndPoint, ServiceId};
use crate::connection::{Command, Connection, ResponseHandling, Reply};
use crate::error::{Error, Result};
use crate::operationcontext::OperationContext;
use crate::options::ServerApi;
use crate::serverdescription::{ElectionId, ReplicaSetConfig, ServerType, TagSet};
use crate::topologyversion::TopologyVersion;

pub const HELLO_COMMAND_NAME: &str = "hello";
pub const LEGACY_HELLO_COMMAND_NAME: &str = "isMaster";

/// The decoded fields of a hello (or legacy isMaster) reply.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HelloResult {
    pub is_writable_primary: bool,
    pub secondary: bool,
    pub arbiter_only: bool,
    pub hidden: bool,
    pub is_replica_set: bool,
    pub msg: Option<String>,
    pub set_name: Option<String>,
    pub set_version: Option<i32>,
    pub hosts: Vec<EndPoint>,
    pub passives: Vec<EndPoint>,
    pub arbiters: Vec<EndPoint>,
    pub primary: Option<EndPoint>,
    pub me: Option<EndPoint>,
    pub election_id: Option<ElectionId>,
    pub hello_ok: bool,
    pub last_write_timestamp: Option<DateTime<Utc>>,
    pub logical_session_timeout: Option<Duration>,
    pub max_batch_count: Option<i32>,
    pub max_document_size: Option<i32>,
    pub max_message_size: Option<i32>,
    pub min_wire_version: i32,
    pub max_wire_version: i32,
    pub tags: TagSet,
    pub topology_version: Option<TopologyVersion>,
    pub service_id: Option<ServiceId>,
    pub connection_id: Option<i64>,
}

impl HelloResult {
    pub fn server_type(&self) -> ServerType {
        if self.service_id.is_some() {
            return ServerType::LoadBalanced;
        }

        if self.is_replica_set {
            return ServerType::ReplicaSetGhost;
        }

        if self.set_name.is_some() {
            if self.is_writable_primary {
                return ServerType::ReplicaSetPrimary;
            }
            if self.hidden {
                return ServerType::ReplicaSetOther;
            }
            if self.secondary {
                return ServerType::ReplicaSetSecondary;
            }
            if self.arbiter_only {
                return ServerType::ReplicaSetArbiter;
            }
            return ServerType::ReplicaSetOther;
        }

        if self.msg.as_deref() == Some("isdbgrid") {
            return ServerType::ShardRouter;
        }

        ServerType::Standalone
    }

    pub fn replica_set_config(&self) -> Option<ReplicaSetConfig> {
        if !self.server_type().is_replica_set_member() {
            return None;
        }

        let members = self
            .hosts
            .iter()
            .chain(self.passives.iter())
            .chain(self.arbiters.iter())
            .cloned()
            .collect();

        Some(ReplicaSetConfig {
            members,
            name: self.set_name.clone(),
            primary: self.primary.clone(),
            version: self.set_version,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HelloCommand {
    pub use_legacy_name: bool,
    pub hello_ok: bool,
    pub topology_version: Option<TopologyVersion>,
    pub max_await_time: Option<Duration>,
    pub load_balanced: bool,
    pub server_api: Option<ServerApi>,
}

impl HelloCommand {
    pub fn command_name(&self) -> &'static str {
        if self.use_legacy_name {
            LEGACY_HELLO_COMMAND_NAME
        } else {
            HELLO_COMMAND_NAME
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.topology_version.is_some() && self.max_await_time.is_some()
    }
}

/// Builds a heartbeat command. Passing a topology version together with a
/// max await time asks the server to hold the reply until its state changes.
pub fn create_hello_command(
    server_api: Option<&ServerApi>,
    hello_ok: bool,
    topology_version: Option<TopologyVersion>,
    max_await_time: Option<Duration>,
    load_balanced: bool,
) -> HelloCommand {
    let use_legacy_name = !(hello_ok || server_api.is_some() || load_balanced);
    let (topology_version, max_await_time) = match (topology_version, max_await_time) {
        (Some(tv), Some(await_time)) => (Some(tv), Some(await_time)),
        _ => (None, None),
    };

    HelloCommand {
        use_legacy_name,
        hello_ok: true,
        topology_version,
        max_await_time,
        load_balanced,
        server_api: server_api.cloned(),
    }
}

#[derive(Debug, Clone)]
pub struct HelloProtocol {
    pub command: HelloCommand,
    pub response_handling: ResponseHandling,
    more_to_come: bool,
}

impl HelloProtocol {
    pub fn more_to_come(&self) -> bool {
        self.more_to_come
    }
}

pub fn create_hello_protocol(
    command: HelloCommand,
    response_handling: ResponseHandling,
) -> HelloProtocol {
    HelloProtocol {
        command,
        response_handling,
        more_to_come: false,
    }
}

/// Runs one exchange of `protocol` on `connection`. While the server keeps
/// streaming, the next reply is read without sending a new request.
pub async fn get_hello_result(
    connection: &dyn Connection,
    protocol: &mut HelloProtocol,
    ctx: &OperationContext,
) -> Result<HelloResult> {
    let response = if protocol.more_to_come {
        ctx.run(connection.receive_more(ctx)).await
    } else {
        ctx.run(connection.send_command(
            Command::Hello(protocol.command.clone()),
            protocol.response_handling,
            ctx,
        ))
        .await
    };

    let response = match response {
        Ok(r) => r,
        Err(e) => {
            protocol.more_to_come = false;
            return Err(e);
        }
    };

    protocol.more_to_come =
        response.more_to_come && protocol.response_handling == ResponseHandling::ExhaustAllowed;

    match response.reply {
        Reply::Hello(result) => Ok(result),
        Reply::Raw(_) => {
            protocol.more_to_come = false;
            Err(Error::new_protocol_error(
                "expected a hello reply but received an undecoded document",
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::ServerApiVersion;
    use crate::topologyversion::ProcessId;

    #[test]
    fn server_type_derivation() {
        let mut r = HelloResult::default();
        assert_eq!(ServerType::Standalone, r.server_type());

        r.msg = Some("isdbgrid".to_string());
        assert_eq!(ServerType::ShardRouter, r.server_type());

        let mut r = HelloResult {
            set_name: Some("rs0".to_string()),
            ..Default::default()
        };
        assert_eq!(ServerType::ReplicaSetOther, r.server_type());
        r.secondary = true;
        assert_eq!(ServerType::ReplicaSetSecondary, r.server_type());
        r.hidden = true;
        assert_eq!(ServerType::ReplicaSetOther, r.server_type());
        r.is_writable_primary = true;
        assert_eq!(ServerType::ReplicaSetPrimary, r.server_type());

        let r = HelloResult {
            is_replica_set: true,
            ..Default::default()
        };
        assert_eq!(ServerType::ReplicaSetGhost, r.server_type());

        let r = HelloResult {
            service_id: Some(ServiceId::new("svc")),
            ..Default::default()
        };
        assert_eq!(ServerType::LoadBalanced, r.server_type());
    }

    #[test]
    fn replica_set_config_includes_all_members() {
        let r = HelloResult {
            set_name: Some("rs0".to_string()),
            is_writable_primary: true,
            hosts: vec![EndPoint::host("a", 1)],
            passives: vec![EndPoint::host("b", 1)],
            arbiters: vec![EndPoint::host("c", 1)],
            ..Default::default()
        };
        let config = r.replica_set_config().unwrap();
        assert_eq!(3, config.members.len());
        assert_eq!(Some("rs0".to_string()), config.name);

        assert!(HelloResult::default().replica_set_config().is_none());
    }

    #[test]
    fn legacy_name_only_without_hello_ok_api_or_load_balancing() {
        let cmd = create_hello_command(None, false, None, None, false);
        assert_eq!(LEGACY_HELLO_COMMAND_NAME, cmd.command_name());

        let cmd = create_hello_command(None, true, None, None, false);
        assert_eq!(HELLO_COMMAND_NAME, cmd.command_name());

        let api = ServerApi::new(ServerApiVersion::V1);
        let cmd = create_hello_command(Some(&api), false, None, None, false);
        assert_eq!(HELLO_COMMAND_NAME, cmd.command_name());

        let cmd = create_hello_command(None, false, None, None, true);
        assert_eq!(HELLO_COMMAND_NAME, cmd.command_name());
    }

    #[test]
    fn streaming_needs_both_version_and_await_time() {
        let tv = TopologyVersion::new(ProcessId::new("p"), 1);
        let cmd = create_hello_command(None, true, Some(tv.clone()), None, false);
        assert!(!cmd.is_streaming());
        assert!(cmd.topology_version.is_none());

        let cmd = create_hello_command(None, true, Some(tv), Some(Duration::from_secs(10)), false);
        assert!(cmd.is_streaming());
    }
}
