use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

use crate::address::{EndPoint, ServerId, ServiceId};
use crate::connection::{
    Command, CommandResponse, Connection, ConnectionDescription, ConnectionFactory, ConnectionId,
    ConnectionInfo, ResponseHandling,
};
use crate::error::{Error, Result};
use crate::events::{EventLogger, EventSubscriber, SdamEvent};
use crate::operationcontext::OperationContext;
use crate::options::ConnectionPoolSettings;

/// Notified when opening a pooled connection fails, before the error is
/// returned to the caller.
pub trait ConnectionExceptionHandler: Send + Sync {
    fn handle_exception_on_open(&self, error: &Error);
}

/// Receives connections handed back by a [`PooledConnection`] on drop.
pub trait ConnectionCheckIn: Send + Sync {
    fn check_in(&self, connection: Arc<dyn Connection>, generation: u64, service_id: Option<ServiceId>);
}

#[async_trait]
pub trait ConnectionPool: Send + Sync {
    fn server_id(&self) -> &ServerId;

    /// The pool wide generation.
    fn generation(&self) -> u64 {
        self.generation_for(None)
    }

    fn generation_for(&self, service_id: Option<&ServiceId>) -> u64;

    async fn acquire_connection(&self, ctx: &OperationContext) -> Result<PooledConnection>;

    fn clear(&self, close_in_use_connections: bool);

    fn clear_service(&self, service_id: &ServiceId);

    fn set_ready(&self);

    fn initialize(&self);

    async fn close(&self);
}

pub trait ConnectionPoolFactory: Send + Sync {
    fn create_connection_pool(
        &self,
        server_id: &ServerId,
        end_point: &EndPoint,
        exception_handler: Weak<dyn ConnectionExceptionHandler>,
    ) -> Arc<dyn ConnectionPool>;
}

/// A checked out connection. Dropping it hands the connection back to its pool.
pub struct PooledConnection {
    connection: Arc<dyn Connection>,
    generation: u64,
    service_id: Option<ServiceId>,
    pool: Option<Weak<dyn ConnectionCheckIn>>,
    _permit: Option<OwnedSemaphorePermit>,
}

impl PooledConnection {
    pub fn new(
        connection: Arc<dyn Connection>,
        generation: u64,
        pool: Option<Weak<dyn ConnectionCheckIn>>,
    ) -> Self {
        let service_id = connection
            .description()
            .and_then(|d| d.service_id().cloned());
        Self {
            connection,
            generation,
            service_id,
            pool,
            _permit: None,
        }
    }

    fn with_permit(mut self, permit: OwnedSemaphorePermit) -> Self {
        self._permit = Some(permit);
        self
    }

    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.connection
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection.connection_id()
    }

    pub fn description(&self) -> Option<ConnectionDescription> {
        self.connection.description()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn service_id(&self) -> Option<&ServiceId> {
        self.service_id.as_ref()
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            connection_id: self.connection_id(),
            generation: self.generation,
            service_id: self.service_id.clone(),
            max_wire_version: self
                .description()
                .map(|d| d.max_wire_version())
                .unwrap_or_default(),
        }
    }

    pub async fn send_command(
        &self,
        command: Command,
        response_handling: ResponseHandling,
        ctx: &OperationContext,
    ) -> Result<CommandResponse> {
        ctx.run(self.connection.send_command(command, response_handling, ctx))
            .await
            .map_err(|e| e.with_connection_context(self.generation, self.service_id.clone()))
    }

    pub async fn receive_more(&self, ctx: &OperationContext) -> Result<CommandResponse> {
        ctx.run(self.connection.receive_more(ctx))
            .await
            .map_err(|e| e.with_connection_context(self.generation, self.service_id.clone()))
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take().and_then(|p| p.upgrade()) {
            pool.check_in(
                self.connection.clone(),
                self.generation,
                self.service_id.take(),
            );
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PoolLifecycle {
    Uninitialized,
    Paused,
    Ready,
    Closed,
}

struct IdleConnection {
    connection: Arc<dyn Connection>,
    generation: u64,
    service_id: Option<ServiceId>,
}

struct InUseConnection {
    connection: Arc<dyn Connection>,
}

struct PoolState {
    lifecycle: PoolLifecycle,
    generation: u64,
    service_generations: HashMap<ServiceId, u64>,
    available: VecDeque<IdleConnection>,
    in_use: HashMap<u64, InUseConnection>,
}

impl PoolState {
    fn generation_for(&self, service_id: Option<&ServiceId>) -> u64 {
        match service_id {
            Some(id) => self.service_generations.get(id).copied().unwrap_or(0),
            None => self.generation,
        }
    }

    fn is_stale(&self, generation: u64, service_id: Option<&ServiceId>) -> bool {
        generation < self.generation_for(service_id)
    }
}

pub struct ExclusiveConnectionPool {
    inner: Arc<ExclusiveConnectionPoolInner>,
}

struct ExclusiveConnectionPoolInner {
    server_id: ServerId,
    end_point: EndPoint,
    settings: ConnectionPoolSettings,
    connection_factory: Arc<dyn ConnectionFactory>,
    exception_handler: Option<Weak<dyn ConnectionExceptionHandler>>,
    event_logger: EventLogger,
    permits: Arc<Semaphore>,
    state: Mutex<PoolState>,
    created_connections: AtomicU64,
}

impl ExclusiveConnectionPool {
    pub fn new(
        server_id: ServerId,
        end_point: EndPoint,
        settings: ConnectionPoolSettings,
        connection_factory: Arc<dyn ConnectionFactory>,
        exception_handler: Option<Weak<dyn ConnectionExceptionHandler>>,
        event_subscriber: Option<Arc<dyn EventSubscriber>>,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(settings.max_connections));
        Self {
            inner: Arc::new(ExclusiveConnectionPoolInner {
                server_id,
                end_point,
                settings,
                connection_factory,
                exception_handler,
                event_logger: EventLogger::new(event_subscriber),
                permits,
                state: Mutex::new(PoolState {
                    lifecycle: PoolLifecycle::Uninitialized,
                    generation: 0,
                    service_generations: HashMap::new(),
                    available: VecDeque::new(),
                    in_use: HashMap::new(),
                }),
                created_connections: AtomicU64::new(0),
            }),
        }
    }

    pub fn available_count(&self) -> usize {
        self.inner.state.lock().unwrap().available.len()
    }

    pub fn in_use_count(&self) -> usize {
        self.inner.state.lock().unwrap().in_use.len()
    }

    pub fn created_count(&self) -> u64 {
        self.inner.created_connections.load(Ordering::SeqCst)
    }

    pub fn is_ready(&self) -> bool {
        self.inner.state.lock().unwrap().lifecycle == PoolLifecycle::Ready
    }

    fn check_out_failed(&self, error: Error) -> Error {
        self.inner
            .event_logger
            .log_and_publish(SdamEvent::ConnectionCheckOutFailed {
                server_id: self.inner.server_id.clone(),
                reason: error.to_string(),
            });
        error
    }

    fn ensure_ready(&self) -> Result<()> {
        let lifecycle = self.inner.state.lock().unwrap().lifecycle;
        match lifecycle {
            PoolLifecycle::Ready => Ok(()),
            PoolLifecycle::Paused => Err(Error::new_pool_paused_error(&self.inner.end_point)),
            PoolLifecycle::Uninitialized => Err(Error::new_illegal_state_error(
                "connection pool must be initialized",
            )),
            PoolLifecycle::Closed => Err(Error::new_disposed_error("ExclusiveConnectionPool")),
        }
    }

    fn take_available(&self) -> Option<(Arc<dyn Connection>, u64)> {
        let mut discarded = vec![];
        let found = {
            let mut state = self.inner.state.lock().unwrap();
            let mut found = None;
            while let Some(idle) = state.available.pop_front() {
                if state.is_stale(idle.generation, idle.service_id.as_ref())
                    || idle.connection.is_expired()
                {
                    discarded.push(idle.connection);
                    continue;
                }

                let id = idle.connection.connection_id().local_value;
                state.in_use.insert(
                    id,
                    InUseConnection {
                        connection: idle.connection.clone(),
                    },
                );
                found = Some((idle.connection, idle.generation));
                break;
            }
            found
        };

        for connection in discarded {
            self.inner.connection_closed(connection, "stale");
        }

        found
    }

    async fn open_connection(&self, ctx: &OperationContext) -> Result<(Arc<dyn Connection>, u64)> {
        let connection = self
            .inner
            .connection_factory
            .create_connection(&self.inner.server_id, &self.inner.end_point);
        self.inner.created_connections.fetch_add(1, Ordering::SeqCst);
        self.inner
            .event_logger
            .log_and_publish(SdamEvent::ConnectionCreated {
                connection_id: connection.connection_id(),
            });

        let creation_generation = self.generation();

        if let Err(e) = ctx.run(connection.open(ctx)).await {
            let service_id = connection
                .description()
                .and_then(|d| d.service_id().cloned());
            let generation = match &service_id {
                Some(id) => self.generation_for(Some(id)),
                None => creation_generation,
            };
            let e = e.with_connection_context(generation, service_id);

            connection.close().await;
            self.inner
                .event_logger
                .log_and_publish(SdamEvent::ConnectionClosed {
                    connection_id: connection.connection_id(),
                    reason: "error".to_string(),
                });

            if let Some(handler) = self.inner.exception_handler.as_ref().and_then(|h| h.upgrade()) {
                handler.handle_exception_on_open(&e);
            }
            return Err(e);
        }

        let service_id = connection
            .description()
            .and_then(|d| d.service_id().cloned());

        let mut state = self.inner.state.lock().unwrap();
        let generation = match &service_id {
            Some(id) => state.generation_for(Some(id)),
            None => creation_generation,
        };
        state.in_use.insert(
            connection.connection_id().local_value,
            InUseConnection {
                connection: connection.clone(),
            },
        );

        Ok((connection, generation))
    }
}

#[async_trait]
impl ConnectionPool for ExclusiveConnectionPool {
    fn server_id(&self) -> &ServerId {
        &self.inner.server_id
    }

    fn generation_for(&self, service_id: Option<&ServiceId>) -> u64 {
        self.inner.state.lock().unwrap().generation_for(service_id)
    }

    async fn acquire_connection(&self, ctx: &OperationContext) -> Result<PooledConnection> {
        let start = Instant::now();

        if let Err(e) = self.ensure_ready() {
            return Err(self.check_out_failed(e));
        }

        let wait_ctx = ctx.with_timeout(self.inner.settings.wait_queue_timeout);
        let permits = self.inner.permits.clone();
        let permit = wait_ctx
            .run(async move {
                permits
                    .acquire_owned()
                    .await
                    .map_err(|_| Error::new_disposed_error("ExclusiveConnectionPool"))
            })
            .await;
        let permit = match permit {
            Ok(p) => p,
            Err(e) if e.is_timeout() => {
                return Err(self.check_out_failed(Error::new_timeout_error(format!(
                    "timed out waiting for a connection to {}",
                    self.inner.end_point
                ))))
            }
            Err(e) => return Err(self.check_out_failed(e)),
        };

        if let Err(e) = self.ensure_ready() {
            return Err(self.check_out_failed(e));
        }

        let (connection, generation) = match self.take_available() {
            Some(c) => c,
            None => match self.open_connection(ctx).await {
                Ok(c) => c,
                Err(e) => return Err(self.check_out_failed(e)),
            },
        };

        self.inner
            .event_logger
            .log_and_publish(SdamEvent::ConnectionCheckedOut {
                connection_id: connection.connection_id(),
                duration: start.elapsed(),
            });

        let weak = Arc::downgrade(&self.inner);
        let pool: Weak<dyn ConnectionCheckIn> = weak;
        Ok(PooledConnection::new(connection, generation, Some(pool)).with_permit(permit))
    }

    fn clear(&self, close_in_use_connections: bool) {
        let (idle, in_use) = {
            let mut state = self.inner.state.lock().unwrap();
            if state.lifecycle == PoolLifecycle::Closed {
                return;
            }

            state.generation += 1;
            for generation in state.service_generations.values_mut() {
                *generation += 1;
            }
            if !self.inner.settings.load_balanced && state.lifecycle == PoolLifecycle::Ready {
                state.lifecycle = PoolLifecycle::Paused;
            }

            let idle: Vec<_> = state.available.drain(..).map(|c| c.connection).collect();
            let in_use: Vec<_> = if close_in_use_connections {
                state.in_use.values().map(|c| c.connection.clone()).collect()
            } else {
                vec![]
            };
            (idle, in_use)
        };

        info!(
            "Connection pool for {} cleared, close in use: {}",
            self.inner.server_id, close_in_use_connections
        );
        self.inner
            .event_logger
            .log_and_publish(SdamEvent::ConnectionPoolCleared {
                server_id: self.inner.server_id.clone(),
                service_id: None,
                close_in_use_connections,
            });

        for connection in idle {
            self.inner.connection_closed(connection, "stale");
        }
        for connection in in_use {
            self.inner.connection_closed(connection, "stale");
        }
    }

    fn clear_service(&self, service_id: &ServiceId) {
        let idle = {
            let mut state = self.inner.state.lock().unwrap();
            if state.lifecycle == PoolLifecycle::Closed {
                return;
            }

            *state
                .service_generations
                .entry(service_id.clone())
                .or_insert(0) += 1;

            let (stale, keep): (Vec<_>, Vec<_>) = state
                .available
                .drain(..)
                .partition(|c| c.service_id.as_ref() == Some(service_id));
            state.available = keep.into();
            stale
        };

        info!(
            "Connection pool for {} cleared for service {}",
            self.inner.server_id, service_id
        );
        self.inner
            .event_logger
            .log_and_publish(SdamEvent::ConnectionPoolCleared {
                server_id: self.inner.server_id.clone(),
                service_id: Some(service_id.clone()),
                close_in_use_connections: false,
            });

        for idle in idle {
            self.inner.connection_closed(idle.connection, "stale");
        }
    }

    fn set_ready(&self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            match state.lifecycle {
                PoolLifecycle::Paused => state.lifecycle = PoolLifecycle::Ready,
                PoolLifecycle::Ready => return,
                PoolLifecycle::Uninitialized | PoolLifecycle::Closed => {
                    warn!(
                        "Connection pool for {} cannot be marked ready from {:?}",
                        self.inner.server_id, state.lifecycle
                    );
                    return;
                }
            }
        }

        self.inner
            .event_logger
            .log_and_publish(SdamEvent::ConnectionPoolReady {
                server_id: self.inner.server_id.clone(),
            });
    }

    fn initialize(&self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.lifecycle != PoolLifecycle::Uninitialized {
                return;
            }
            state.lifecycle = PoolLifecycle::Paused;
        }

        debug!("Connection pool for {} initialized", self.inner.server_id);
        self.inner
            .event_logger
            .log_and_publish(SdamEvent::ConnectionPoolOpened {
                server_id: self.inner.server_id.clone(),
            });
    }

    async fn close(&self) {
        let connections = {
            let mut state = self.inner.state.lock().unwrap();
            if state.lifecycle == PoolLifecycle::Closed {
                return;
            }
            state.lifecycle = PoolLifecycle::Closed;

            let mut connections: Vec<_> = state.available.drain(..).map(|c| c.connection).collect();
            connections.extend(state.in_use.drain().map(|(_, c)| c.connection));
            connections
        };

        self.inner.permits.close();

        for connection in connections {
            let connection_id = connection.connection_id();
            connection.close().await;
            self.inner
                .event_logger
                .log_and_publish(SdamEvent::ConnectionClosed {
                    connection_id,
                    reason: "pool closed".to_string(),
                });
        }

        debug!("Connection pool for {} closed", self.inner.server_id);
        self.inner
            .event_logger
            .log_and_publish(SdamEvent::ConnectionPoolClosed {
                server_id: self.inner.server_id.clone(),
            });
    }
}

impl Drop for ExclusiveConnectionPool {
    fn drop(&mut self) {
        self.inner.permits.close();
    }
}

impl ExclusiveConnectionPoolInner {
    fn connection_closed(&self, connection: Arc<dyn Connection>, reason: &str) {
        self.event_logger.log_and_publish(SdamEvent::ConnectionClosed {
            connection_id: connection.connection_id(),
            reason: reason.to_string(),
        });
        close_in_background(connection);
    }
}

impl ConnectionCheckIn for ExclusiveConnectionPoolInner {
    fn check_in(&self, connection: Arc<dyn Connection>, generation: u64, service_id: Option<ServiceId>) {
        let connection_id = connection.connection_id();
        let discard = {
            let mut state = self.state.lock().unwrap();
            let tracked = state.in_use.remove(&connection_id.local_value).is_some();

            let discard = !tracked
                || state.lifecycle == PoolLifecycle::Closed
                || state.is_stale(generation, service_id.as_ref())
                || connection.is_expired();
            if !discard {
                state.available.push_front(IdleConnection {
                    connection: connection.clone(),
                    generation,
                    service_id,
                });
            }
            discard
        };

        self.event_logger
            .log_and_publish(SdamEvent::ConnectionCheckedIn {
                connection_id,
            });

        if discard {
            self.connection_closed(connection, "stale");
        }
    }
}

fn close_in_background(connection: Arc<dyn Connection>) {
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn(async move {
            connection.close().await;
        });
    }
}

pub struct ExclusiveConnectionPoolFactory {
    settings: ConnectionPoolSettings,
    connection_factory: Arc<dyn ConnectionFactory>,
    event_subscriber: Option<Arc<dyn EventSubscriber>>,
}

impl ExclusiveConnectionPoolFactory {
    pub fn new(
        settings: ConnectionPoolSettings,
        connection_factory: Arc<dyn ConnectionFactory>,
        event_subscriber: Option<Arc<dyn EventSubscriber>>,
    ) -> Self {
        Self {
            settings,
            connection_factory,
            event_subscriber,
        }
    }
}

impl ConnectionPoolFactory for ExclusiveConnectionPoolFactory {
    fn create_connection_pool(
        &self,
        server_id: &ServerId,
        end_point: &EndPoint,
        exception_handler: Weak<dyn ConnectionExceptionHandler>,
    ) -> Arc<dyn ConnectionPool> {
        Arc::new(ExclusiveConnectionPool::new(
            server_id.clone(),
            end_point.clone(),
            self.settings.clone(),
            self.connection_factory.clone(),
            Some(exception_handler),
            self.event_subscriber.clone(),
        ))
    }
}
