use std::sync::Arc;

use crate::address::{EndPoint, ServerId};
use crate::error::Result;
use crate::operationcontext::OperationContext;
use crate::server::Server;
use crate::serverchannel::ServerChannel;
use crate::serverdescription::ServerDescription;

/// A server paired with the description it had when it was selected.
///
/// Operations should make decisions against this snapshot, not against
/// whatever the server currently reports.
#[derive(Clone)]
pub struct SelectedServer {
    server: Server,
    description_when_selected: Arc<ServerDescription>,
}

impl SelectedServer {
    pub fn new(server: Server, description_when_selected: Arc<ServerDescription>) -> Self {
        Self {
            server,
            description_when_selected,
        }
    }

    pub fn server(&self) -> &Server {
        &self.server
    }

    pub fn server_id(&self) -> &ServerId {
        self.server.server_id()
    }

    pub fn end_point(&self) -> &EndPoint {
        self.server.end_point()
    }

    pub fn description_when_selected(&self) -> &Arc<ServerDescription> {
        &self.description_when_selected
    }

    pub fn current_description(&self) -> Arc<ServerDescription> {
        self.server.description()
    }

    pub async fn get_connection(&self, ctx: &OperationContext) -> Result<ServerChannel> {
        self.server.get_connection(ctx).await
    }
}
