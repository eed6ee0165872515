use std::sync::Arc;

use log::debug;

use crate::address::{ClusterId, EndPoint, ServerId};
use crate::clusterdescription::ClusterType;
use crate::connection::ConnectionFactory;
use crate::connectionpool::ConnectionPoolFactory;
use crate::environment::{EnvironmentVariableProvider, ProcessEnvironment};
use crate::events::EventSubscriber;
use crate::options::{ServerApi, ServerMonitorSettings, ServerSettings};
use crate::server::Server;
use crate::servermonitor::{ServerMonitor, ServerMonitorOptions};

pub trait ServerMonitorFactory: Send + Sync {
    fn create(&self, server_id: &ServerId, end_point: &EndPoint) -> ServerMonitor;
}

pub struct DefaultServerMonitorFactory {
    settings: ServerMonitorSettings,
    connection_factory: Arc<dyn ConnectionFactory>,
    server_api: Option<ServerApi>,
    event_subscriber: Option<Arc<dyn EventSubscriber>>,
    environment: Arc<dyn EnvironmentVariableProvider>,
}

impl DefaultServerMonitorFactory {
    pub fn new(
        settings: ServerMonitorSettings,
        connection_factory: Arc<dyn ConnectionFactory>,
    ) -> Self {
        Self {
            settings,
            connection_factory,
            server_api: None,
            event_subscriber: None,
            environment: Arc::new(ProcessEnvironment),
        }
    }

    pub fn server_api(mut self, server_api: impl Into<Option<ServerApi>>) -> Self {
        self.server_api = server_api.into();
        self
    }

    pub fn event_subscriber(mut self, event_subscriber: Arc<dyn EventSubscriber>) -> Self {
        self.event_subscriber = Some(event_subscriber);
        self
    }

    pub fn environment(mut self, environment: Arc<dyn EnvironmentVariableProvider>) -> Self {
        self.environment = environment;
        self
    }
}

impl ServerMonitorFactory for DefaultServerMonitorFactory {
    fn create(&self, server_id: &ServerId, end_point: &EndPoint) -> ServerMonitor {
        ServerMonitor::new(ServerMonitorOptions {
            server_id: server_id.clone(),
            end_point: end_point.clone(),
            connection_factory: self.connection_factory.clone(),
            settings: self.settings.clone(),
            server_api: self.server_api.clone(),
            event_subscriber: self.event_subscriber.clone(),
            environment: self.environment.clone(),
        })
    }
}

/// Builds the right kind of [`Server`] for a cluster.
pub struct ServerFactory {
    settings: ServerSettings,
    connection_pool_factory: Arc<dyn ConnectionPoolFactory>,
    server_monitor_factory: Arc<dyn ServerMonitorFactory>,
    event_subscriber: Option<Arc<dyn EventSubscriber>>,
}

impl ServerFactory {
    pub fn new(
        settings: ServerSettings,
        connection_pool_factory: Arc<dyn ConnectionPoolFactory>,
        server_monitor_factory: Arc<dyn ServerMonitorFactory>,
        event_subscriber: Option<Arc<dyn EventSubscriber>>,
    ) -> Self {
        Self {
            settings,
            connection_pool_factory,
            server_monitor_factory,
            event_subscriber,
        }
    }

    pub fn create_server(
        &self,
        cluster_type: ClusterType,
        cluster_id: &ClusterId,
        end_point: &EndPoint,
    ) -> Server {
        let server_id = ServerId::new(cluster_id.clone(), end_point.clone());
        debug!("Creating {} server {}", cluster_type, server_id);

        if cluster_type == ClusterType::LoadBalanced {
            return Server::new_load_balanced(
                server_id,
                end_point.clone(),
                self.settings.clone(),
                self.connection_pool_factory.as_ref(),
                self.event_subscriber.clone(),
            );
        }

        let monitor = self.server_monitor_factory.create(&server_id, end_point);
        Server::new(
            server_id,
            end_point.clone(),
            self.settings.clone(),
            self.connection_pool_factory.as_ref(),
            monitor,
            self.event_subscriber.clone(),
        )
    }
}
