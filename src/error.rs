use std::fmt::Display;
use std::io;
use std::sync::Arc;

use crate::address::{EndPoint, ServiceId};
use crate::topologyversion::TopologyVersion;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug, Clone)]
#[error("{kind}")]
#[non_exhaustive]
pub struct Error {
    pub kind: Arc<ErrorKind>,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind) -> Self {
        Self {
            kind: Arc::new(kind),
        }
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn new_connection_error(msg: impl Into<String>, network: bool, timeout: bool) -> Self {
        Self::new(ErrorKind::Connection {
            msg: msg.into(),
            network,
            timeout,
            generation: None,
            service_id: None,
        })
    }

    pub fn new_io_error(source: &io::Error) -> Self {
        Self::new(ErrorKind::Io {
            kind: source.kind(),
            msg: source.to_string(),
        })
    }

    pub fn new_authentication_error(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Authentication {
            msg: msg.into(),
            generation: None,
            service_id: None,
        })
    }

    pub fn new_command_error(error: CommandError) -> Self {
        Self::new(ErrorKind::Command(error))
    }

    pub fn new_timeout_error(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout { msg: msg.into() })
    }

    pub fn new_cancelled_error(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled { msg: msg.into() })
    }

    pub fn new_aggregate_error(errors: Vec<Error>) -> Self {
        Self::new(ErrorKind::Aggregate { errors })
    }

    pub fn new_protocol_error(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Protocol { msg: msg.into() })
    }

    pub fn new_internal_error(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal { msg: msg.into() })
    }

    pub(crate) fn new_invalid_argument_error(msg: &str) -> Self {
        Self::new(ErrorKind::InvalidArgument {
            msg: msg.to_string(),
        })
    }

    pub(crate) fn new_illegal_state_error(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::IllegalState { msg: msg.into() })
    }

    pub(crate) fn new_disposed_error(what: impl Into<String>) -> Self {
        Self::new(ErrorKind::Disposed { what: what.into() })
    }

    pub(crate) fn new_pool_paused_error(endpoint: &EndPoint) -> Self {
        Self::new(ErrorKind::PoolPaused {
            endpoint: endpoint.clone(),
        })
    }

    /// Returns a copy of this error tagged with the generation and service id of
    /// the connection it originated from. Values already present are kept.
    pub fn with_connection_context(
        &self,
        generation: u64,
        service_id: Option<ServiceId>,
    ) -> Self {
        match self.kind.as_ref() {
            ErrorKind::Connection {
                msg,
                network,
                timeout,
                generation: existing_generation,
                service_id: existing_service_id,
            } => Self::new(ErrorKind::Connection {
                msg: msg.clone(),
                network: *network,
                timeout: *timeout,
                generation: existing_generation.or(Some(generation)),
                service_id: existing_service_id.clone().or(service_id),
            }),
            ErrorKind::Authentication {
                msg,
                generation: existing_generation,
                service_id: existing_service_id,
            } => Self::new(ErrorKind::Authentication {
                msg: msg.clone(),
                generation: existing_generation.or(Some(generation)),
                service_id: existing_service_id.clone().or(service_id),
            }),
            _ => self.clone(),
        }
    }

    /// Unwraps an aggregate holding exactly one error.
    pub fn effective(&self) -> &Error {
        match self.kind.as_ref() {
            ErrorKind::Aggregate { errors } if errors.len() == 1 => errors[0].effective(),
            _ => self,
        }
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Cancelled { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Timeout { .. })
    }

    pub fn is_authentication_error(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Authentication { .. })
    }

    pub fn is_command_error(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Command(_))
    }

    /// True for connection-level failures: connection, authentication and raw
    /// IO errors.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self.kind.as_ref(),
            ErrorKind::Connection { .. } | ErrorKind::Authentication { .. } | ErrorKind::Io { .. }
        )
    }

    pub fn is_network_error(&self) -> bool {
        match self.kind.as_ref() {
            ErrorKind::Connection { network, .. } => *network,
            ErrorKind::Io { .. } => true,
            _ => false,
        }
    }

    pub fn contains_timeout(&self) -> bool {
        match self.kind.as_ref() {
            ErrorKind::Connection { timeout, .. } => *timeout,
            ErrorKind::Io { kind, .. } => {
                matches!(kind, io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock)
            }
            _ => false,
        }
    }

    pub fn generation(&self) -> Option<u64> {
        match self.kind.as_ref() {
            ErrorKind::Connection { generation, .. } => *generation,
            ErrorKind::Authentication { generation, .. } => *generation,
            _ => None,
        }
    }

    pub fn service_id(&self) -> Option<&ServiceId> {
        match self.kind.as_ref() {
            ErrorKind::Connection { service_id, .. } => service_id.as_ref(),
            ErrorKind::Authentication { service_id, .. } => service_id.as_ref(),
            _ => None,
        }
    }

    pub fn command_error(&self) -> Option<&CommandError> {
        match self.kind.as_ref() {
            ErrorKind::Command(e) => Some(e),
            _ => None,
        }
    }

    pub fn topology_version(&self) -> Option<&TopologyVersion> {
        self.command_error()
            .and_then(|e| e.topology_version.as_ref())
    }

    pub fn is_not_primary(&self) -> bool {
        self.command_error()
            .map(|e| e.is_not_primary() || e.write_concern_is(WriteConcernError::is_not_primary))
            .unwrap_or(false)
    }

    pub fn is_node_recovering(&self) -> bool {
        self.command_error()
            .map(|e| {
                e.is_node_recovering() || e.write_concern_is(WriteConcernError::is_node_recovering)
            })
            .unwrap_or(false)
    }

    pub fn is_state_change(&self) -> bool {
        self.is_not_primary() || self.is_node_recovering()
    }

    pub fn is_shutdown(&self) -> bool {
        self.command_error()
            .map(|e| {
                is_shutdown_code(e.code)
                    || e.write_concern_error
                        .as_ref()
                        .map(|w| is_shutdown_code(w.code))
                        .unwrap_or(false)
            })
            .unwrap_or(false)
    }
}

#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum ErrorKind {
    #[error("Connection error {msg} (network: {network}, timeout: {timeout})")]
    #[non_exhaustive]
    Connection {
        msg: String,
        network: bool,
        timeout: bool,
        generation: Option<u64>,
        service_id: Option<ServiceId>,
    },
    #[error("IO error {kind:?}: {msg}")]
    #[non_exhaustive]
    Io { kind: io::ErrorKind, msg: String },
    #[error("Authentication failed {msg}")]
    #[non_exhaustive]
    Authentication {
        msg: String,
        generation: Option<u64>,
        service_id: Option<ServiceId>,
    },
    #[error("{0}")]
    Command(CommandError),
    #[error("Timeout {msg}")]
    #[non_exhaustive]
    Timeout { msg: String },
    #[error("Operation cancelled {msg}")]
    #[non_exhaustive]
    Cancelled { msg: String },
    #[error("Connection pool for {endpoint} is paused")]
    #[non_exhaustive]
    PoolPaused { endpoint: EndPoint },
    #[error("{what} has been disposed")]
    #[non_exhaustive]
    Disposed { what: String },
    #[error("Illegal State {msg}")]
    #[non_exhaustive]
    IllegalState { msg: String },
    #[error("Invalid argument {msg}")]
    #[non_exhaustive]
    InvalidArgument { msg: String },
    #[error("Multiple errors occurred: {}", display_all(.errors))]
    #[non_exhaustive]
    Aggregate { errors: Vec<Error> },
    #[error("Protocol error {msg}")]
    #[non_exhaustive]
    Protocol { msg: String },
    #[error("Internal error {msg}")]
    #[non_exhaustive]
    Internal { msg: String },
}

fn display_all(errors: &[Error]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<io::Error> for Error {
    fn from(value: io::Error) -> Self {
        Self::new_io_error(&value)
    }
}

pub mod server_error_code {
    pub const LEGACY_NOT_PRIMARY: i32 = 10058;
    pub const NOT_WRITABLE_PRIMARY: i32 = 10107;
    pub const NOT_PRIMARY_NO_SECONDARY_OK: i32 = 13435;

    pub const INTERRUPTED_AT_SHUTDOWN: i32 = 11600;
    pub const INTERRUPTED_DUE_TO_REPL_STATE_CHANGE: i32 = 11602;
    pub const NOT_PRIMARY_OR_SECONDARY: i32 = 13436;
    pub const PRIMARY_STEPPED_DOWN: i32 = 189;
    pub const SHUTDOWN_IN_PROGRESS: i32 = 91;
}

use server_error_code::*;

const NOT_PRIMARY_CODES: [i32; 3] = [
    LEGACY_NOT_PRIMARY,
    NOT_WRITABLE_PRIMARY,
    NOT_PRIMARY_NO_SECONDARY_OK,
];

const RECOVERING_CODES: [i32; 5] = [
    INTERRUPTED_AT_SHUTDOWN,
    INTERRUPTED_DUE_TO_REPL_STATE_CHANGE,
    NOT_PRIMARY_OR_SECONDARY,
    PRIMARY_STEPPED_DOWN,
    SHUTDOWN_IN_PROGRESS,
];

fn is_shutdown_code(code: i32) -> bool {
    code == INTERRUPTED_AT_SHUTDOWN || code == SHUTDOWN_IN_PROGRESS
}

fn is_recovering(code: i32, message: &str) -> bool {
    if RECOVERING_CODES.contains(&code) {
        return true;
    }
    if code != 0 {
        return false;
    }
    let message = message.to_ascii_lowercase();
    message.contains("node is recovering") || message.contains("not master or secondary")
}

fn is_not_primary(code: i32, message: &str) -> bool {
    if NOT_PRIMARY_CODES.contains(&code) {
        return true;
    }
    if code != 0 || is_recovering(code, message) {
        return false;
    }
    let message = message.to_ascii_lowercase();
    message.contains("not master") || message.contains("not writable primary")
}

/// A failure reported by the server in a command reply.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandError {
    pub code: i32,
    pub code_name: Option<String>,
    pub message: String,
    pub topology_version: Option<TopologyVersion>,
    pub write_concern_error: Option<WriteConcernError>,
}

impl CommandError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            code_name: None,
            message: message.into(),
            topology_version: None,
            write_concern_error: None,
        }
    }

    pub fn code_name(mut self, code_name: impl Into<String>) -> Self {
        self.code_name = Some(code_name.into());
        self
    }

    pub fn topology_version(mut self, topology_version: TopologyVersion) -> Self {
        self.topology_version = Some(topology_version);
        self
    }

    pub fn write_concern_error(mut self, write_concern_error: WriteConcernError) -> Self {
        self.write_concern_error = Some(write_concern_error);
        self
    }

    pub fn is_not_primary(&self) -> bool {
        is_not_primary(self.code, &self.message)
    }

    pub fn is_node_recovering(&self) -> bool {
        is_recovering(self.code, &self.message)
    }

    fn write_concern_is(&self, f: impl Fn(&WriteConcernError) -> bool) -> bool {
        self.write_concern_error.as_ref().map(f).unwrap_or(false)
    }
}

impl Display for CommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Command failed with error {}", self.code)?;
        if let Some(name) = &self.code_name {
            write!(f, " ({})", name)?;
        }
        write!(f, ": {}", self.message)?;
        if let Some(wce) = &self.write_concern_error {
            write!(f, ", write concern error {}: {}", wce.code, wce.message)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WriteConcernError {
    pub code: i32,
    pub message: String,
}

impl WriteConcernError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    fn is_not_primary(&self) -> bool {
        is_not_primary(self.code, &self.message)
    }

    fn is_node_recovering(&self) -> bool {
        is_recovering(self.code, &self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topologyversion::ProcessId;

    #[test]
    fn classifies_state_change_codes() {
        let not_primary = Error::new_command_error(CommandError::new(NOT_WRITABLE_PRIMARY, "x"));
        assert!(not_primary.is_not_primary());
        assert!(not_primary.is_state_change());
        assert!(!not_primary.is_shutdown());

        let shutdown = Error::new_command_error(CommandError::new(SHUTDOWN_IN_PROGRESS, "x"));
        assert!(shutdown.is_node_recovering());
        assert!(shutdown.is_shutdown());

        let other = Error::new_command_error(CommandError::new(11000, "duplicate key"));
        assert!(!other.is_state_change());
    }

    #[test]
    fn classifies_state_change_messages_without_code() {
        let recovering = Error::new_command_error(CommandError::new(0, "Node is recovering"));
        assert!(recovering.is_node_recovering());
        assert!(!recovering.is_not_primary());

        let not_master = Error::new_command_error(CommandError::new(0, "not master"));
        assert!(not_master.is_not_primary());

        let coded = Error::new_command_error(CommandError::new(2, "not master"));
        assert!(!coded.is_state_change());
    }

    #[test]
    fn write_concern_error_counts_as_state_change() {
        let err = Error::new_command_error(
            CommandError::new(0, "write failed")
                .write_concern_error(WriteConcernError::new(INTERRUPTED_AT_SHUTDOWN, "shutdown")),
        );
        assert!(err.is_node_recovering());
        assert!(err.is_shutdown());
    }

    #[test]
    fn exposes_topology_version() {
        let tv = TopologyVersion::new(ProcessId::new("p"), 3);
        let err = Error::new_command_error(
            CommandError::new(NOT_WRITABLE_PRIMARY, "x").topology_version(tv.clone()),
        );
        assert_eq!(Some(&tv), err.topology_version());
    }

    #[test]
    fn effective_unwraps_single_aggregate() {
        let inner = Error::new_connection_error("reset", true, false);
        let agg = Error::new_aggregate_error(vec![Error::new_aggregate_error(vec![inner])]);
        assert!(agg.effective().is_network_error());

        let multi = Error::new_aggregate_error(vec![
            Error::new_timeout_error("a"),
            Error::new_timeout_error("b"),
        ]);
        assert!(matches!(
            multi.effective().kind(),
            ErrorKind::Aggregate { .. }
        ));
    }

    #[test]
    fn connection_context_keeps_existing_values() {
        let err = Error::new_connection_error("reset", true, false)
            .with_connection_context(3, Some(ServiceId::new("a")));
        assert_eq!(Some(3), err.generation());
        assert_eq!(Some(&ServiceId::new("a")), err.service_id());

        let err = err.with_connection_context(7, Some(ServiceId::new("b")));
        assert_eq!(Some(3), err.generation());
        assert_eq!(Some(&ServiceId::new("a")), err.service_id());
    }

    #[test]
    fn io_timeouts_contain_timeout() {
        let err: Error = io::Error::new(io::ErrorKind::TimedOut, "slow").into();
        assert!(err.is_network_error());
        assert!(err.contains_timeout());

        let err: Error = io::Error::new(io::ErrorKind::UnexpectedEof, "eof").into();
        assert!(err.is_network_error());
        assert!(!err.contains_timeout());
    }
}
