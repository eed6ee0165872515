use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use arc_swap::ArcSwap;
use chrono::Utc;
use log::{debug, info, warn};
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::address::{EndPoint, ServerId};
use crate::connection::ConnectionInfo;
use crate::connectionpool::{ConnectionExceptionHandler, ConnectionPool, ConnectionPoolFactory};
use crate::error::{Error, Result};
use crate::events::{EventLogger, EventSubscriber, SdamEvent};
use crate::operationcontext::OperationContext;
use crate::options::ServerSettings;
use crate::serverchannel::ServerChannel;
use crate::serverdescription::{
    ServerDescription, ServerDescriptionChangedEvent, ServerState, ServerType,
};
use crate::servermonitor::{MonitorGuard, ServerMonitor};
use crate::topologyversion::TopologyVersion;

const STATE_INITIAL: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_DISPOSED: u8 = 2;

const DESCRIPTION_CHANNEL_CAPACITY: usize = 64;

/// Wire version from which a not-primary error leaves the pool intact.
const KEEP_POOL_ON_NOT_PRIMARY_WIRE_VERSION: i32 = 8;

/// The three points where the two server flavours differ in how they react
/// to errors.
pub(crate) trait ServerPolicyHooks {
    fn handle_before_handshake_error(&self, server: &ServerInner, error: &Error);

    fn handle_after_handshake_error(
        &self,
        server: &ServerInner,
        connection: &ConnectionInfo,
        error: &Error,
    );

    fn invalidate(
        &self,
        server: &ServerInner,
        reason: &str,
        clear_connection_pool: bool,
        topology_version: Option<TopologyVersion>,
        error: Option<Error>,
    );
}

pub(crate) enum ServerPolicy {
    Default(DefaultServerPolicy),
    LoadBalanced(LoadBalancedServerPolicy),
}

impl ServerPolicyHooks for ServerPolicy {
    fn handle_before_handshake_error(&self, server: &ServerInner, error: &Error) {
        match self {
            ServerPolicy::Default(p) => p.handle_before_handshake_error(server, error),
            ServerPolicy::LoadBalanced(p) => p.handle_before_handshake_error(server, error),
        }
    }

    fn handle_after_handshake_error(
        &self,
        server: &ServerInner,
        connection: &ConnectionInfo,
        error: &Error,
    ) {
        match self {
            ServerPolicy::Default(p) => p.handle_after_handshake_error(server, connection, error),
            ServerPolicy::LoadBalanced(p) => {
                p.handle_after_handshake_error(server, connection, error)
            }
        }
    }

    fn invalidate(
        &self,
        server: &ServerInner,
        reason: &str,
        clear_connection_pool: bool,
        topology_version: Option<TopologyVersion>,
        error: Option<Error>,
    ) {
        match self {
            ServerPolicy::Default(p) => {
                p.invalidate(server, reason, clear_connection_pool, topology_version, error)
            }
            ServerPolicy::LoadBalanced(p) => {
                p.invalidate(server, reason, clear_connection_pool, topology_version, error)
            }
        }
    }
}

/// Error handling for standalone, replica set and sharded deployments, driven
/// by a [`ServerMonitor`].
pub(crate) struct DefaultServerPolicy {
    monitor: ServerMonitor,
}

impl DefaultServerPolicy {
    fn request_heartbeat(&self) {
        if let Err(e) = self.monitor.request_heartbeat() {
            debug!(
                "Could not request a heartbeat for {}: {}",
                self.monitor.server_id(),
                e
            );
        }
    }

    fn invalidate_locked(
        &self,
        server: &ServerInner,
        _guard: &mut MonitorGuard<'_>,
        reason: &str,
        clear_connection_pool: bool,
        topology_version: Option<TopologyVersion>,
        error: Option<Error>,
    ) {
        let description = server
            .base_description
            .clone()
            .with_reason_changed(format!("InvalidatedBecause:{}", reason))
            .with_topology_version(topology_version)
            .with_error(error)
            .with_last_update_timestamp(Utc::now());
        server.set_description(Arc::new(description), clear_connection_pool);

        // Also requested after network errors, where an immediate recheck is
        // likely to fail too.
        self.request_heartbeat();
    }

    fn should_invalidate(
        &self,
        server: &ServerInner,
        connection: &ConnectionInfo,
        error: &Error,
    ) -> bool {
        if error.contains_timeout() {
            return false;
        }
        if error.is_connection_error() {
            return true;
        }
        if error.is_state_change() {
            return !self.is_stale_state_change_error(server, connection, error);
        }
        false
    }

    fn is_stale_state_change_error(
        &self,
        server: &ServerInner,
        connection: &ConnectionInfo,
        error: &Error,
    ) -> bool {
        let current_generation = server
            .connection_pool
            .generation_for(connection.service_id.as_ref());
        if current_generation > connection.generation {
            return true;
        }

        let current = server.current_description.load();
        TopologyVersion::is_fresher_than_or_equal_to(
            current.topology_version.as_ref(),
            error.topology_version(),
        )
    }
}

impl ServerPolicyHooks for DefaultServerPolicy {
    fn handle_before_handshake_error(&self, server: &ServerInner, error: &Error) {
        if !error.is_connection_error() {
            return;
        }

        let mut guard = self.monitor.lock();
        if let Some(generation) = error.generation() {
            if generation != server.connection_pool.generation_for(error.service_id()) {
                debug!(
                    "Ignoring handshake error from a stale connection to {}: {}",
                    server.server_id, error
                );
                return;
            }
        }

        if error.is_authentication_error() {
            self.invalidate_locked(
                server,
                &mut guard,
                "AuthenticationFailedOnHandshake",
                true,
                None,
                Some(error.clone()),
            );
            return;
        }

        if error.contains_timeout() {
            return;
        }

        if error.is_network_error() {
            guard.cancel_current_check();
        }
        self.invalidate_locked(
            server,
            &mut guard,
            &format!("ChannelExceptionDuringHandshake:{}", error),
            true,
            None,
            Some(error.clone()),
        );
    }

    fn handle_after_handshake_error(
        &self,
        server: &ServerInner,
        connection: &ConnectionInfo,
        error: &Error,
    ) {
        let mut guard = self.monitor.lock();

        let current_generation = server
            .connection_pool
            .generation_for(connection.service_id.as_ref());
        if connection.generation != current_generation {
            debug!(
                "Ignoring error from stale connection {}: {}",
                connection.connection_id, error
            );
            return;
        }

        if error.is_network_error() && !error.contains_timeout() {
            guard.cancel_current_check();
        }

        if self.should_invalidate(server, connection, error) {
            let clear = should_clear_pool_for_channel_error(error, connection.max_wire_version);
            self.invalidate_locked(
                server,
                &mut guard,
                &format!("ChannelException:{}", error),
                clear,
                error.topology_version().cloned(),
                Some(error.clone()),
            );
        } else {
            self.request_heartbeat();
        }
    }

    fn invalidate(
        &self,
        server: &ServerInner,
        reason: &str,
        clear_connection_pool: bool,
        topology_version: Option<TopologyVersion>,
        error: Option<Error>,
    ) {
        let mut guard = self.monitor.lock();
        self.invalidate_locked(
            server,
            &mut guard,
            reason,
            clear_connection_pool,
            topology_version,
            error,
        );
    }
}

/// A load balancer fronts many backends, so errors only ever clear the
/// connections of the service that failed.
pub(crate) struct LoadBalancedServerPolicy;

impl ServerPolicyHooks for LoadBalancedServerPolicy {
    fn handle_before_handshake_error(&self, server: &ServerInner, error: &Error) {
        let service_id = match error.service_id() {
            Some(id) => id,
            None => {
                warn!(
                    "Handshake error for {} carries no service id, pool left untouched: {}",
                    server.server_id, error
                );
                return;
            }
        };

        if let Some(generation) = error.generation() {
            if generation != server.connection_pool.generation_for(Some(service_id)) {
                return;
            }
        }

        server.connection_pool.clear_service(service_id);
    }

    fn handle_after_handshake_error(
        &self,
        server: &ServerInner,
        connection: &ConnectionInfo,
        error: &Error,
    ) {
        let current_generation = server
            .connection_pool
            .generation_for(connection.service_id.as_ref());
        if connection.generation != current_generation {
            return;
        }

        if !should_clear_pool_for_channel_error(error, connection.max_wire_version) {
            return;
        }

        match &connection.service_id {
            Some(service_id) => server.connection_pool.clear_service(service_id),
            None => warn!(
                "Connection {} to a load balancer has no service id",
                connection.connection_id
            ),
        }
    }

    fn invalidate(
        &self,
        _server: &ServerInner,
        _reason: &str,
        _clear_connection_pool: bool,
        _topology_version: Option<TopologyVersion>,
        _error: Option<Error>,
    ) {
    }
}

fn should_clear_pool_for_channel_error(error: &Error, max_wire_version: i32) -> bool {
    if error.is_network_error() && !error.contains_timeout() {
        return true;
    }
    if error.is_state_change() {
        return error.is_shutdown() || max_wire_version < KEEP_POOL_ON_NOT_PRIMARY_WIRE_VERSION;
    }
    false
}

/// One node of a deployment: its connection pool, its current description and
/// the policy deciding how errors change either of them.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

pub(crate) struct ServerInner {
    server_id: ServerId,
    end_point: EndPoint,
    settings: ServerSettings,
    connection_pool: Arc<dyn ConnectionPool>,
    policy: ServerPolicy,

    base_description: ServerDescription,
    current_description: ArcSwap<ServerDescription>,
    description_changed: broadcast::Sender<ServerDescriptionChangedEvent>,

    state: AtomicU8,
    outstanding_operations: AtomicUsize,
    event_logger: EventLogger,
}

impl Server {
    /// Builds a server whose description is maintained by `monitor`.
    pub fn new(
        server_id: ServerId,
        end_point: EndPoint,
        settings: ServerSettings,
        connection_pool_factory: &dyn ConnectionPoolFactory,
        monitor: ServerMonitor,
        event_subscriber: Option<Arc<dyn EventSubscriber>>,
    ) -> Self {
        Self::build(
            server_id,
            end_point,
            settings,
            connection_pool_factory,
            event_subscriber,
            |weak| {
                monitor.on_description_changed(Arc::new(
                    move |guard: &mut MonitorGuard<'_>, event: &ServerDescriptionChangedEvent| {
                        if let Some(inner) = weak.upgrade() {
                            inner.on_monitor_description_changed(guard, event);
                        }
                    },
                ));
                ServerPolicy::Default(DefaultServerPolicy { monitor })
            },
        )
    }

    /// Builds a server sitting behind a load balancer. It has no monitor.
    pub fn new_load_balanced(
        server_id: ServerId,
        end_point: EndPoint,
        settings: ServerSettings,
        connection_pool_factory: &dyn ConnectionPoolFactory,
        event_subscriber: Option<Arc<dyn EventSubscriber>>,
    ) -> Self {
        Self::build(
            server_id,
            end_point,
            settings,
            connection_pool_factory,
            event_subscriber,
            |_| ServerPolicy::LoadBalanced(LoadBalancedServerPolicy),
        )
    }

    fn build(
        server_id: ServerId,
        end_point: EndPoint,
        settings: ServerSettings,
        connection_pool_factory: &dyn ConnectionPoolFactory,
        event_subscriber: Option<Arc<dyn EventSubscriber>>,
        policy: impl FnOnce(Weak<ServerInner>) -> ServerPolicy,
    ) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<ServerInner>| {
            let exception_handler: Weak<dyn ConnectionExceptionHandler> = weak.clone();
            let connection_pool = connection_pool_factory.create_connection_pool(
                &server_id,
                &end_point,
                exception_handler,
            );

            let base_description = ServerDescription::new(server_id.clone(), end_point.clone())
                .with_reason_changed("ServerInitialDescription")
                .with_heartbeat_interval(settings.heartbeat_interval);
            let (description_changed, _) = broadcast::channel(DESCRIPTION_CHANNEL_CAPACITY);

            ServerInner {
                server_id,
                end_point,
                settings,
                connection_pool,
                policy: policy(weak.clone()),
                current_description: ArcSwap::from_pointee(base_description.clone()),
                base_description,
                description_changed,
                state: AtomicU8::new(STATE_INITIAL),
                outstanding_operations: AtomicUsize::new(0),
                event_logger: EventLogger::new(event_subscriber),
            }
        });

        Self { inner }
    }

    pub fn server_id(&self) -> &ServerId {
        &self.inner.server_id
    }

    pub fn end_point(&self) -> &EndPoint {
        &self.inner.end_point
    }

    pub fn settings(&self) -> &ServerSettings {
        &self.inner.settings
    }

    pub fn connection_pool(&self) -> &Arc<dyn ConnectionPool> {
        &self.inner.connection_pool
    }

    pub fn description(&self) -> Arc<ServerDescription> {
        self.inner.current_description.load_full()
    }

    pub fn is_load_balanced(&self) -> bool {
        matches!(self.inner.policy, ServerPolicy::LoadBalanced(_))
    }

    pub fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    /// Receives every description the server publishes, including ones equal
    /// to their predecessor.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerDescriptionChangedEvent> {
        self.inner.description_changed.subscribe()
    }

    pub fn outstanding_operations(&self) -> usize {
        self.inner.outstanding_operations.load(Ordering::SeqCst)
    }

    pub fn initialize(&self) {
        if self
            .inner
            .state
            .compare_exchange(STATE_INITIAL, STATE_OPEN, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let start = Instant::now();
        self.inner
            .event_logger
            .log_and_publish(SdamEvent::ServerOpening {
                server_id: self.inner.server_id.clone(),
            });

        self.inner.connection_pool.initialize();
        match &self.inner.policy {
            ServerPolicy::Default(p) => p.monitor.initialize(),
            ServerPolicy::LoadBalanced(_) => {
                let description = self
                    .inner
                    .base_description
                    .clone()
                    .with_type(ServerType::LoadBalanced)
                    .with_state(ServerState::Connected)
                    .with_reason_changed("Initialized")
                    .with_last_update_timestamp(Utc::now());
                self.inner.set_description(Arc::new(description), false);
            }
        }

        info!("Server {} opened", self.inner.server_id);
        self.inner
            .event_logger
            .log_and_publish(SdamEvent::ServerOpened {
                server_id: self.inner.server_id.clone(),
                duration: start.elapsed(),
            });
    }

    pub async fn close(&self) {
        if self.inner.state.swap(STATE_DISPOSED, Ordering::SeqCst) == STATE_DISPOSED {
            return;
        }

        let start = Instant::now();
        self.inner
            .event_logger
            .log_and_publish(SdamEvent::ServerClosing {
                server_id: self.inner.server_id.clone(),
            });

        if let ServerPolicy::Default(p) = &self.inner.policy {
            p.monitor.close().await;
        }
        self.inner.connection_pool.close().await;

        info!("Server {} closed", self.inner.server_id);
        self.inner
            .event_logger
            .log_and_publish(SdamEvent::ServerClosed {
                server_id: self.inner.server_id.clone(),
                duration: start.elapsed(),
            });
    }

    /// Checks a connection out of the pool. The returned channel hands it back
    /// when dropped.
    pub async fn get_connection(&self, ctx: &OperationContext) -> Result<ServerChannel> {
        self.inner.ensure_open()?;

        self.inner
            .outstanding_operations
            .fetch_add(1, Ordering::SeqCst);
        match self.inner.connection_pool.acquire_connection(ctx).await {
            Ok(connection) => Ok(ServerChannel::new(self.clone(), connection)),
            Err(e) => {
                self.release_operation();
                Err(e)
            }
        }
    }

    pub(crate) fn release_operation(&self) {
        self.inner
            .outstanding_operations
            .fetch_sub(1, Ordering::SeqCst);
    }

    /// Replaces the description with an Unknown one and clears the pool.
    pub fn invalidate(&self, reason: &str, response_topology_version: Option<TopologyVersion>) {
        if !self.inner.is_open() {
            return;
        }
        self.inner
            .policy
            .invalidate(&self.inner, reason, true, response_topology_version, None);
    }

    pub fn request_heartbeat(&self) {
        if let ServerPolicy::Default(p) = &self.inner.policy {
            p.request_heartbeat();
        }
    }

    /// Reacts to an error raised while running a command on a checked out
    /// connection. The error itself is left for the caller to report.
    pub fn handle_channel_exception(&self, connection: &ConnectionInfo, error: &Error) {
        if !self.inner.is_open() || error.is_cancellation() {
            return;
        }

        let error = error.effective();
        if error.is_cancellation() {
            return;
        }

        self.inner
            .policy
            .handle_after_handshake_error(&self.inner, connection, error);
    }
}

impl ServerInner {
    fn is_open(&self) -> bool {
        self.state.load(Ordering::SeqCst) == STATE_OPEN
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state.load(Ordering::SeqCst) {
            STATE_OPEN => Ok(()),
            STATE_DISPOSED => Err(Error::new_disposed_error("Server")),
            _ => Err(Error::new_illegal_state_error("server must be initialized")),
        }
    }

    fn on_monitor_description_changed(
        &self,
        _guard: &mut MonitorGuard<'_>,
        event: &ServerDescriptionChangedEvent,
    ) {
        let current = self.current_description.load();
        let new_description = &event.new_description;
        let heartbeat_error = new_description.heartbeat_exception.as_ref();

        // A command error still came with a reply, so its topology version is
        // checked like any other.
        let unconditional = heartbeat_error
            .map(|e| !e.is_command_error())
            .unwrap_or(false);
        if unconditional
            || TopologyVersion::is_staler_than_or_equal_to(
                current.topology_version.as_ref(),
                new_description.topology_version.as_ref(),
            )
        {
            self.set_description(new_description.clone(), heartbeat_error.is_some());
        } else {
            debug!(
                "Server {} ignored a description with an older topology version",
                self.server_id
            );
        }
    }

    fn set_description(&self, new_description: Arc<ServerDescription>, clear_connection_pool: bool) {
        if clear_connection_pool {
            let close_in_use = new_description
                .heartbeat_exception
                .as_ref()
                .map(|e| e.contains_timeout())
                .unwrap_or(false);
            self.connection_pool.clear(close_in_use);
        } else if new_description.is_data_bearing()
            || (new_description.server_type != ServerType::Unknown
                && self.settings.direct_connection)
        {
            self.connection_pool.set_ready();
        }

        let old_description = self.current_description.swap(new_description.clone());
        if !old_description.sdam_equals(&new_description) {
            self.event_logger
                .log_and_publish(SdamEvent::ServerDescriptionChanged {
                    old_description: old_description.clone(),
                    new_description: new_description.clone(),
                });
        }

        let _ = self.description_changed.send(ServerDescriptionChangedEvent {
            old_description,
            new_description,
        });
    }
}

impl ConnectionExceptionHandler for ServerInner {
    fn handle_exception_on_open(&self, error: &Error) {
        if !self.is_open() || error.is_cancellation() {
            return;
        }
        self.policy.handle_before_handshake_error(self, error.effective());
    }
}
