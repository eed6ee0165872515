use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use arc_swap::{ArcSwap, ArcSwapOption};
use chrono::Utc;
use futures::FutureExt;
use log::{debug, error, info};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::address::{EndPoint, ServerId};
use crate::connection::{Connection, ConnectionFactory, ResponseHandling};
use crate::environment::{is_running_in_faas, EnvironmentVariableProvider};
use crate::error::{Error, Result};
use crate::events::{DeferredEvents, EventLogger, EventSubscriber, SdamEvent};
use crate::heartbeatdelay::{HeartbeatDelay, Metronome};
use crate::hello::{
    create_hello_command, create_hello_protocol, get_hello_result, HelloProtocol, HelloResult,
};
use crate::operationcontext::OperationContext;
use crate::options::{ServerApi, ServerMonitorSettings, ServerMonitoringMode};
use crate::roundtriptimemonitor::{RoundTripTimeMonitor, RoundTripTimeMonitorOptions};
use crate::serverdescription::{
    ServerDescription, ServerDescriptionChangedEvent, ServerState, ServerType,
};
use crate::topologyversion::TopologyVersion;

/// Called with the monitor lock held every time the monitor publishes a
/// description.
pub type DescriptionChangedHandler =
    Arc<dyn Fn(&mut MonitorGuard<'_>, &ServerDescriptionChangedEvent) + Send + Sync>;

const STATE_INITIAL: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_DISPOSED: u8 = 2;

pub struct ServerMonitorOptions {
    pub server_id: ServerId,
    pub end_point: EndPoint,
    pub connection_factory: Arc<dyn ConnectionFactory>,
    pub settings: ServerMonitorSettings,
    pub server_api: Option<ServerApi>,
    pub event_subscriber: Option<Arc<dyn EventSubscriber>>,
    pub environment: Arc<dyn EnvironmentVariableProvider>,
}

/// Probes one node in the background and publishes what it learns as
/// [`ServerDescription`]s.
///
/// The monitor runs on its own task. Closing the monitor stops the task for
/// good, while [`ServerMonitor::cancel_current_check`] only aborts the
/// heartbeat that is in flight.
pub struct ServerMonitor {
    inner: Arc<ServerMonitorInner>,
}

struct ServerMonitorInner {
    server_id: ServerId,
    end_point: EndPoint,
    connection_factory: Arc<dyn ConnectionFactory>,
    settings: ServerMonitorSettings,
    server_api: Option<ServerApi>,
    streaming_enabled: bool,

    base_description: ServerDescription,
    current_description: ArcSwap<ServerDescription>,

    state: AtomicU8,
    monitor_token: CancellationToken,
    locked: Mutex<MonitorState>,
    heartbeat_delay: ArcSwapOption<HeartbeatDelay>,

    rtt_monitor: RoundTripTimeMonitor,
    event_logger: EventLogger,
}

struct MonitorState {
    connection: Option<Arc<dyn Connection>>,
    heartbeat_token: CancellationToken,
    description_changed: Option<DescriptionChangedHandler>,
}

/// Proof that the monitor lock is held.
///
/// Description publication and pool state changes triggered by it happen
/// while one of these is alive. Events raised meanwhile reach subscribers
/// only after the lock is released.
pub struct MonitorGuard<'a> {
    inner: &'a ServerMonitorInner,
    state: MutexGuard<'a, MonitorState>,
    // Dropped after `state`.
    _deferred_events: DeferredEvents,
}

impl MonitorGuard<'_> {
    pub fn description(&self) -> Arc<ServerDescription> {
        self.inner.current_description.load_full()
    }

    pub fn cancel_current_check(&mut self) {
        if self.inner.is_disposed() || self.state.heartbeat_token.is_cancelled() {
            return;
        }

        self.state.heartbeat_token.cancel();
        if self.inner.is_disposed() {
            return;
        }
        self.state.heartbeat_token = self.inner.monitor_token.child_token();

        debug!(
            "Server monitor for {} cancelled the current check",
            self.inner.server_id
        );
        if let Some(connection) = self.state.connection.take() {
            close_in_background(connection);
        }
    }

    fn set_description(&mut self, description: ServerDescription) {
        let new_description = Arc::new(description);
        let old_description = self
            .inner
            .current_description
            .swap(new_description.clone());

        let handler = match self.state.description_changed.clone() {
            Some(h) => h,
            None => return,
        };

        let event = ServerDescriptionChangedEvent {
            old_description,
            new_description,
        };
        if let Err(e) = catch_unwind(AssertUnwindSafe(|| handler(self, &event))) {
            error!(
                "Description changed handler for {} panicked: {}",
                self.inner.server_id,
                panic_message(e.as_ref())
            );
        }
    }
}

impl ServerMonitor {
    pub fn new(opts: ServerMonitorOptions) -> Self {
        let streaming_enabled = match opts.settings.server_monitoring_mode {
            ServerMonitoringMode::Stream => true,
            ServerMonitoringMode::Poll => false,
            ServerMonitoringMode::Auto => !is_running_in_faas(opts.environment.as_ref()),
        };

        let base_description = ServerDescription::new(opts.server_id.clone(), opts.end_point.clone())
            .with_reason_changed("InitialDescription")
            .with_heartbeat_interval(opts.settings.heartbeat_interval);

        let rtt_monitor = RoundTripTimeMonitor::new(RoundTripTimeMonitorOptions {
            server_id: opts.server_id.clone(),
            end_point: opts.end_point.clone(),
            heartbeat_interval: opts.settings.heartbeat_interval,
            connection_factory: opts.connection_factory.clone(),
            server_api: opts.server_api.clone(),
            load_balanced: false,
        });

        let monitor_token = CancellationToken::new();
        let heartbeat_token = monitor_token.child_token();

        Self {
            inner: Arc::new(ServerMonitorInner {
                server_id: opts.server_id,
                end_point: opts.end_point,
                connection_factory: opts.connection_factory,
                settings: opts.settings,
                server_api: opts.server_api,
                streaming_enabled,
                current_description: ArcSwap::from_pointee(base_description.clone()),
                base_description,
                state: AtomicU8::new(STATE_INITIAL),
                monitor_token,
                locked: Mutex::new(MonitorState {
                    connection: None,
                    heartbeat_token,
                    description_changed: None,
                }),
                heartbeat_delay: ArcSwapOption::empty(),
                rtt_monitor,
                event_logger: EventLogger::new(opts.event_subscriber),
            }),
        }
    }

    pub fn server_id(&self) -> &ServerId {
        &self.inner.server_id
    }

    pub fn is_streaming_enabled(&self) -> bool {
        self.inner.streaming_enabled
    }

    pub fn description(&self) -> Arc<ServerDescription> {
        self.inner.current_description.load_full()
    }

    pub fn lock(&self) -> MonitorGuard<'_> {
        self.inner.lock()
    }

    pub fn on_description_changed(&self, handler: DescriptionChangedHandler) {
        self.inner.lock_state().description_changed = Some(handler);
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

        debug!("Server monitor for {} initializing", self.inner.server_id);
        let inner = self.inner.clone();
        tokio::spawn(async move {
            inner.monitor_server().await;
        });
    }

    pub fn request_heartbeat(&self) -> Result<()> {
        match self.inner.state.load(Ordering::SeqCst) {
            STATE_OPEN => {}
            STATE_DISPOSED => return Err(Error::new_disposed_error("ServerMonitor")),
            _ => {
                return Err(Error::new_illegal_state_error(
                    "server monitor must be initialized",
                ))
            }
        }

        if let Some(delay) = self.inner.heartbeat_delay.load_full() {
            delay.request_heartbeat();
        }
        Ok(())
    }

    pub fn cancel_current_check(&self) {
        if self.inner.is_disposed() {
            return;
        }
        self.inner.lock().cancel_current_check();
    }

    pub async fn close(&self) {
        if self.inner.state.swap(STATE_DISPOSED, Ordering::SeqCst) == STATE_DISPOSED {
            return;
        }

        debug!("Server monitor for {} closing", self.inner.server_id);
        self.inner.monitor_token.cancel();
        self.inner.rtt_monitor.close();

        let connection = {
            let mut state = self.inner.lock_state();
            state.heartbeat_token.cancel();
            state.description_changed = None;
            state.connection.take()
        };
        if let Some(connection) = connection {
            connection.close().await;
        }
        debug!("Server monitor for {} closed", self.inner.server_id);
    }
}

impl Drop for ServerMonitor {
    fn drop(&mut self) {
        self.inner.monitor_token.cancel();
    }
}

impl ServerMonitorInner {
    fn is_disposed(&self) -> bool {
        self.state.load(Ordering::SeqCst) == STATE_DISPOSED
    }

    // A panic inside the loop must not take the monitor down, so poisoning is ignored.
    fn lock_state(&self) -> MutexGuard<'_, MonitorState> {
        self.locked.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock(&self) -> MonitorGuard<'_> {
        let deferred_events = DeferredEvents::begin();
        MonitorGuard {
            inner: self,
            state: self.lock_state(),
            _deferred_events: deferred_events,
        }
    }

    async fn monitor_server(&self) {
        let mut metronome = Metronome::new(self.settings.heartbeat_interval);

        while !self.monitor_token.is_cancelled() {
            let heartbeat_token = self.lock_state().heartbeat_token.clone();

            let outcome = AssertUnwindSafe(self.heartbeat(&heartbeat_token))
                .catch_unwind()
                .await;
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) if heartbeat_token.is_cancelled() => {
                    debug!("Server monitor for {} heartbeat cancelled: {}", self.server_id, e);
                }
                Ok(Err(e)) => self.publish_unexpected_error(e),
                Err(panic) => self.publish_unexpected_error(Error::new_internal_error(
                    panic_message(panic.as_ref()),
                )),
            }

            if self.monitor_token.is_cancelled() {
                break;
            }

            let delay = Arc::new(HeartbeatDelay::new(
                metronome.next_tick_delay(),
                self.settings.min_heartbeat_interval,
            ));
            self.heartbeat_delay.store(Some(delay.clone()));
            delay.wait(&self.monitor_token).await;
        }

        debug!("Server monitor for {} stopped", self.server_id);
    }

    fn publish_unexpected_error(&self, e: Error) {
        error!(
            "Unexpected error in server monitor for {}: {}",
            self.server_id, e
        );
        self.event_logger.log_and_publish(SdamEvent::SdamInformation {
            message: format!("Unexpected error in server monitor for {}: {}", self.server_id, e),
        });

        let description = self.base_description.with_heartbeat_exception(e);
        self.lock().set_description(description);
    }

    async fn heartbeat(&self, heartbeat_token: &CancellationToken) -> Result<()> {
        let mut protocol: Option<HelloProtocol> = None;
        let mut process_another = true;

        while process_another && !heartbeat_token.is_cancelled() {
            let previous_description = self.current_description.load_full();
            let ctx = OperationContext::new(None, heartbeat_token.clone());
            let connection = self.lock_state().connection.clone();

            let outcome = match connection {
                None => match self.initialize_connection(&ctx).await {
                    Ok(connection) => {
                        let disposed = {
                            let mut state = self.lock_state();
                            if self.is_disposed() {
                                true
                            } else {
                                state.connection = Some(connection.clone());
                                false
                            }
                        };
                        if disposed {
                            connection.close().await;
                            return Err(Error::new_cancelled_error(
                                "the server monitor has been closed",
                            ));
                        }
                        connection.description().map(|d| d.hello_result).ok_or_else(|| {
                            Error::new_protocol_error("connection opened without a handshake")
                        })
                    }
                    Err(e) => Err(e),
                },
                Some(connection) => {
                    let mut hello_protocol = match protocol.take() {
                        Some(p) if p.more_to_come() => p,
                        _ => self.initialize_hello_protocol(
                            connection.as_ref(),
                            &previous_description,
                        ),
                    };
                    let res = self
                        .hello(connection.as_ref(), &mut hello_protocol, &ctx)
                        .await;
                    protocol = Some(hello_protocol);
                    res
                }
            };

            let mut hello_result = None;
            let mut heartbeat_error = None;
            match outcome {
                Ok(r) => hello_result = Some(r),
                Err(e) if e.is_cancellation() && heartbeat_token.is_cancelled() => return Ok(()),
                Err(e) => {
                    protocol = None;
                    let connection = {
                        let mut state = self.lock_state();
                        self.rtt_monitor.reset();
                        state.connection.take()
                    };
                    if let Some(connection) = connection {
                        connection.close().await;
                    }
                    heartbeat_error = Some(e);
                }
            }

            if heartbeat_token.is_cancelled() {
                return Ok(());
            }

            let new_description = self.build_description(hello_result.as_ref(), heartbeat_error.as_ref());
            {
                let mut guard = self.lock();
                if heartbeat_token.is_cancelled() {
                    return Ok(());
                }
                guard.set_description(new_description.clone());
            }

            let server_supports_streaming = new_description.server_type != ServerType::Unknown
                && hello_result
                    .as_ref()
                    .map(|r| r.topology_version.is_some())
                    .unwrap_or(false);
            let connection_is_streaming =
                protocol.as_ref().map(|p| p.more_to_come()).unwrap_or(false);
            let transitioned_with_network_error = heartbeat_error
                .as_ref()
                .map(|e| e.is_network_error())
                .unwrap_or(false)
                && previous_description.server_type != ServerType::Unknown;

            if self.streaming_enabled && server_supports_streaming && !self.rtt_monitor.is_started()
            {
                self.rtt_monitor.start();
            }

            process_another = (self.streaming_enabled
                && (server_supports_streaming || connection_is_streaming))
                || transitioned_with_network_error;
        }

        Ok(())
    }

    fn build_description(
        &self,
        hello_result: Option<&HelloResult>,
        heartbeat_error: Option<&Error>,
    ) -> ServerDescription {
        let now = Utc::now();
        let description = match hello_result {
            Some(r) => {
                let base = &self.base_description;
                self.base_description
                    .clone()
                    .with_type(r.server_type())
                    .with_state(ServerState::Connected)
                    .with_average_round_trip_time(self.rtt_monitor.average().unwrap_or_default())
                    .with_canonical_end_point(r.me.clone())
                    .with_election_id(r.election_id.clone())
                    .with_hello_ok(r.hello_ok)
                    .with_last_write_timestamp(r.last_write_timestamp)
                    .with_logical_session_timeout(r.logical_session_timeout)
                    .with_size_limits(
                        r.max_batch_count.unwrap_or(base.max_batch_count),
                        r.max_document_size.unwrap_or(base.max_document_size),
                        r.max_message_size.unwrap_or(base.max_message_size),
                    )
                    .with_replica_set_config(r.replica_set_config())
                    .with_tags(r.tags.clone())
                    .with_topology_version(r.topology_version.clone())
                    .with_wire_version_range(r.min_wire_version, r.max_wire_version)
            }
            None => self.base_description.clone(),
        }
        .with_last_update_timestamp(now);

        let description = match heartbeat_error {
            Some(e) => description
                .with_error(Some(e.clone()))
                .with_topology_version(e.topology_version().cloned()),
            None => description,
        };

        description
            .with_reason_changed("Heartbeat")
            .with_last_heartbeat_timestamp(now)
    }

    async fn initialize_connection(&self, ctx: &OperationContext) -> Result<Arc<dyn Connection>> {
        let connection = self
            .connection_factory
            .create_connection(&self.server_id, &self.end_point);
        let connection_id = connection.connection_id();
        self.event_logger
            .log_and_publish(SdamEvent::ServerHeartbeatStarted {
                connection_id: connection_id.clone(),
                awaited: false,
            });

        let start = Instant::now();
        match ctx.run(connection.open(ctx)).await {
            Ok(()) => {
                let elapsed = start.elapsed();
                self.event_logger
                    .log_and_publish(SdamEvent::ServerHeartbeatSucceeded {
                        connection_id,
                        duration: elapsed,
                        awaited: false,
                    });
                self.rtt_monitor.add_sample(elapsed);
                info!("Server monitor for {} connected", self.server_id);
                Ok(connection)
            }
            Err(e) => {
                connection.close().await;
                self.event_logger
                    .log_and_publish(SdamEvent::ServerHeartbeatFailed {
                        connection_id,
                        duration: start.elapsed(),
                        error: e.clone(),
                        awaited: false,
                    });
                Err(e)
            }
        }
    }

    fn initialize_hello_protocol(
        &self,
        connection: &dyn Connection,
        previous_description: &ServerDescription,
    ) -> HelloProtocol {
        let handshake = connection.description().map(|d| d.hello_result);
        let streaming = self.is_using_streaming_protocol(handshake.as_ref());
        if streaming {
            connection.set_read_timeout(self.settings.connect_timeout + self.settings.heartbeat_interval);
        }

        build_hello_protocol(
            streaming,
            self.server_api.as_ref(),
            previous_description.hello_ok,
            previous_description
                .topology_version
                .clone()
                .or_else(|| handshake.and_then(|h| h.topology_version)),
            &self.settings,
        )
    }

    fn is_using_streaming_protocol(&self, handshake: Option<&HelloResult>) -> bool {
        self.streaming_enabled
            && handshake
                .map(|h| h.topology_version.is_some())
                .unwrap_or(false)
    }

    async fn hello(
        &self,
        connection: &dyn Connection,
        protocol: &mut HelloProtocol,
        ctx: &OperationContext,
    ) -> Result<HelloResult> {
        ctx.check()?;

        let connection_id = connection.connection_id();
        let awaited = self.is_using_streaming_protocol(
            connection.description().map(|d| d.hello_result).as_ref(),
        );
        self.event_logger
            .log_and_publish(SdamEvent::ServerHeartbeatStarted {
                connection_id: connection_id.clone(),
                awaited,
            });

        let start = Instant::now();
        match get_hello_result(connection, protocol, ctx).await {
            Ok(result) => {
                let elapsed = start.elapsed();
                if !awaited {
                    self.rtt_monitor.add_sample(elapsed);
                }
                self.event_logger
                    .log_and_publish(SdamEvent::ServerHeartbeatSucceeded {
                        connection_id,
                        duration: elapsed,
                        awaited,
                    });
                Ok(result)
            }
            Err(e) => {
                self.event_logger
                    .log_and_publish(SdamEvent::ServerHeartbeatFailed {
                        connection_id,
                        duration: start.elapsed(),
                        error: e.clone(),
                        awaited,
                    });
                Err(e)
            }
        }
    }
}

/// Streaming heartbeats carry the last known topology version and a max await
/// time, and allow the server to keep replying without new requests.
fn build_hello_protocol(
    streaming: bool,
    server_api: Option<&ServerApi>,
    hello_ok: bool,
    topology_version: Option<TopologyVersion>,
    settings: &ServerMonitorSettings,
) -> HelloProtocol {
    if streaming {
        let command = create_hello_command(
            server_api,
            hello_ok,
            topology_version,
            Some(settings.heartbeat_interval),
            false,
        );
        create_hello_protocol(command, ResponseHandling::ExhaustAllowed)
    } else {
        let command = create_hello_command(server_api, hello_ok, None, None, false);
        create_hello_protocol(command, ResponseHandling::Return)
    }
}

fn close_in_background(connection: Arc<dyn Connection>) {
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn(async move {
            connection.close().await;
        });
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
