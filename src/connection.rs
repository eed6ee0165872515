use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::address::{EndPoint, ServerId, ServiceId};
use crate::error::Result;
use crate::hello::{HelloCommand, HelloResult};
use crate::operationcontext::OperationContext;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    pub server_id: ServerId,
    pub local_value: u64,
    pub server_value: Option<i64>,
}

impl ConnectionId {
    pub fn new(server_id: ServerId, local_value: u64) -> Self {
        Self {
            server_id,
            local_value,
            server_value: None,
        }
    }

    pub fn with_server_value(mut self, server_value: i64) -> Self {
        self.server_value = Some(server_value);
        self
    }
}

impl Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} to {}",
            self.local_value, self.server_id.end_point
        )?;
        if let Some(server_value) = self.server_value {
            write!(f, " (server {})", server_value)?;
        }
        Ok(())
    }
}

/// What a connection learned from its handshake.
#[derive(Debug, Clone)]
pub struct ConnectionDescription {
    pub connection_id: ConnectionId,
    pub hello_result: HelloResult,
}

impl ConnectionDescription {
    pub fn new(connection_id: ConnectionId, hello_result: HelloResult) -> Self {
        Self {
            connection_id,
            hello_result,
        }
    }

    pub fn service_id(&self) -> Option<&ServiceId> {
        self.hello_result.service_id.as_ref()
    }

    pub fn max_wire_version(&self) -> i32 {
        self.hello_result.max_wire_version
    }
}

/// Identity of a checked out connection, captured at checkout.
///
/// Error handling always compares against the captured generation rather
/// than whatever the pool currently holds.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub connection_id: ConnectionId,
    pub generation: u64,
    pub service_id: Option<ServiceId>,
    pub max_wire_version: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseHandling {
    Return,
    ExhaustAllowed,
}

#[derive(Debug, Clone)]
pub struct GenericCommand {
    pub database: String,
    pub name: String,
    pub body: Bytes,
}

#[derive(Debug, Clone)]
pub enum Command {
    Hello(HelloCommand),
    Generic(GenericCommand),
}

impl Command {
    pub fn name(&self) -> &str {
        match self {
            Command::Hello(hello) => hello.command_name(),
            Command::Generic(generic) => &generic.name,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Reply {
    Hello(HelloResult),
    Raw(Bytes),
}

#[derive(Debug, Clone)]
pub struct CommandResponse {
    /// Set when the server will push another reply without a new request.
    pub more_to_come: bool,
    pub reply: Reply,
}

impl CommandResponse {
    pub fn new(reply: Reply) -> Self {
        Self {
            more_to_come: false,
            reply,
        }
    }

    pub fn more_to_come(mut self, more_to_come: bool) -> Self {
        self.more_to_come = more_to_come;
        self
    }
}

/// A single physical connection to a node. Opening performs the handshake and
/// authentication.
#[async_trait]
pub trait Connection: Send + Sync {
    fn connection_id(&self) -> ConnectionId;

    /// Available once `open` has completed the handshake.
    fn description(&self) -> Option<ConnectionDescription>;

    async fn open(&self, ctx: &OperationContext) -> Result<()>;

    async fn send_command(
        &self,
        command: Command,
        response_handling: ResponseHandling,
        ctx: &OperationContext,
    ) -> Result<CommandResponse>;

    /// Reads the next reply of a `more_to_come` exchange.
    async fn receive_more(&self, ctx: &OperationContext) -> Result<CommandResponse>;

    fn set_read_timeout(&self, timeout: Duration);

    fn is_expired(&self) -> bool {
        false
    }

    async fn close(&self);
}

pub trait ConnectionFactory: Send + Sync {
    /// Builds an unopened connection.
    fn create_connection(&self, server_id: &ServerId, end_point: &EndPoint) -> Arc<dyn Connection>;
}
