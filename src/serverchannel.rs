use std::sync::Arc;

use crate::connection::{Command, CommandResponse, ConnectionDescription, ConnectionInfo, ResponseHandling};
use crate::connectionpool::PooledConnection;
use crate::error::Result;
use crate::operationcontext::OperationContext;
use crate::server::Server;

/// The session a command runs in, if any.
pub trait Session: Send + Sync {
    /// Flags the session so it is discarded rather than reused.
    fn mark_dirty(&self);
}

/// A checked out connection bound to the server it came from.
///
/// Errors from commands are reported to the server before being returned, so
/// the server can invalidate its description or clear its pool. Dropping the
/// channel returns the connection to the pool.
pub struct ServerChannel {
    server: Server,
    connection: Arc<PooledConnection>,
    counts_as_operation: bool,
}

impl ServerChannel {
    pub(crate) fn new(server: Server, connection: PooledConnection) -> Self {
        Self {
            server,
            connection: Arc::new(connection),
            counts_as_operation: true,
        }
    }

    pub fn server(&self) -> &Server {
        &self.server
    }

    pub fn connection_info(&self) -> ConnectionInfo {
        self.connection.info()
    }

    pub fn connection_description(&self) -> Option<ConnectionDescription> {
        self.connection.description()
    }

    pub async fn command(
        &self,
        command: Command,
        response_handling: ResponseHandling,
        session: Option<&dyn Session>,
        ctx: &OperationContext,
    ) -> Result<CommandResponse> {
        match self
            .connection
            .send_command(command, response_handling, ctx)
            .await
        {
            Ok(response) => Ok(response),
            Err(e) => {
                if e.is_connection_error() {
                    if let Some(session) = session {
                        session.mark_dirty();
                    }
                }
                self.server
                    .handle_channel_exception(&self.connection.info(), &e);
                Err(e)
            }
        }
    }

    /// Another handle on the same connection. The connection goes back to the
    /// pool once every handle is dropped.
    pub fn fork(&self) -> ServerChannel {
        Self {
            server: self.server.clone(),
            connection: self.connection.clone(),
            counts_as_operation: false,
        }
    }
}

impl Drop for ServerChannel {
    fn drop(&mut self) {
        if self.counts_as_operation {
            self.server.release_operation();
        }
    }
}
