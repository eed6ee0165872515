use std::cell::{Cell, RefCell};
use std::fmt::Display;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};

use crate::address::{ServerId, ServiceId};
use crate::connection::ConnectionId;
use crate::error::Error;
use crate::serverdescription::ServerDescription;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum SdamEvent {
    ServerOpening {
        server_id: ServerId,
    },
    ServerOpened {
        server_id: ServerId,
        duration: Duration,
    },
    ServerClosing {
        server_id: ServerId,
    },
    ServerClosed {
        server_id: ServerId,
        duration: Duration,
    },
    ServerDescriptionChanged {
        old_description: Arc<ServerDescription>,
        new_description: Arc<ServerDescription>,
    },
    ServerHeartbeatStarted {
        connection_id: ConnectionId,
        awaited: bool,
    },
    ServerHeartbeatSucceeded {
        connection_id: ConnectionId,
        duration: Duration,
        awaited: bool,
    },
    ServerHeartbeatFailed {
        connection_id: ConnectionId,
        duration: Duration,
        error: Error,
        awaited: bool,
    },
    SdamInformation {
        message: String,
    },
    ConnectionPoolOpened {
        server_id: ServerId,
    },
    ConnectionPoolReady {
        server_id: ServerId,
    },
    ConnectionPoolCleared {
        server_id: ServerId,
        service_id: Option<ServiceId>,
        close_in_use_connections: bool,
    },
    ConnectionPoolClosed {
        server_id: ServerId,
    },
    ConnectionCreated {
        connection_id: ConnectionId,
    },
    ConnectionClosed {
        connection_id: ConnectionId,
        reason: String,
    },
    ConnectionCheckedOut {
        connection_id: ConnectionId,
        duration: Duration,
    },
    ConnectionCheckedIn {
        connection_id: ConnectionId,
    },
    ConnectionCheckOutFailed {
        server_id: ServerId,
        reason: String,
    },
}

impl SdamEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SdamEvent::ServerOpening { .. } => "ServerOpening",
            SdamEvent::ServerOpened { .. } => "ServerOpened",
            SdamEvent::ServerClosing { .. } => "ServerClosing",
            SdamEvent::ServerClosed { .. } => "ServerClosed",
            SdamEvent::ServerDescriptionChanged { .. } => "ServerDescriptionChanged",
            SdamEvent::ServerHeartbeatStarted { .. } => "ServerHeartbeatStarted",
            SdamEvent::ServerHeartbeatSucceeded { .. } => "ServerHeartbeatSucceeded",
            SdamEvent::ServerHeartbeatFailed { .. } => "ServerHeartbeatFailed",
            SdamEvent::SdamInformation { .. } => "SdamInformation",
            SdamEvent::ConnectionPoolOpened { .. } => "ConnectionPoolOpened",
            SdamEvent::ConnectionPoolReady { .. } => "ConnectionPoolReady",
            SdamEvent::ConnectionPoolCleared { .. } => "ConnectionPoolCleared",
            SdamEvent::ConnectionPoolClosed { .. } => "ConnectionPoolClosed",
            SdamEvent::ConnectionCreated { .. } => "ConnectionCreated",
            SdamEvent::ConnectionClosed { .. } => "ConnectionClosed",
            SdamEvent::ConnectionCheckedOut { .. } => "ConnectionCheckedOut",
            SdamEvent::ConnectionCheckedIn { .. } => "ConnectionCheckedIn",
            SdamEvent::ConnectionCheckOutFailed { .. } => "ConnectionCheckOutFailed",
        }
    }
}

impl Display for SdamEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SdamEvent::ServerOpening { server_id }
            | SdamEvent::ServerClosing { server_id }
            | SdamEvent::ConnectionPoolOpened { server_id }
            | SdamEvent::ConnectionPoolReady { server_id }
            | SdamEvent::ConnectionPoolClosed { server_id } => {
                write!(f, "{} {}", self.name(), server_id)
            }
            SdamEvent::ServerOpened {
                server_id,
                duration,
            }
            | SdamEvent::ServerClosed {
                server_id,
                duration,
            } => write!(f, "{} {} in {:?}", self.name(), server_id, duration),
            SdamEvent::ServerDescriptionChanged {
                old_description,
                new_description,
            } => write!(
                f,
                "{} from {} to {}",
                self.name(),
                old_description,
                new_description
            ),
            SdamEvent::ServerHeartbeatStarted {
                connection_id,
                awaited,
            } => write!(f, "{} {} awaited: {}", self.name(), connection_id, awaited),
            SdamEvent::ServerHeartbeatSucceeded {
                connection_id,
                duration,
                awaited,
            } => write!(
                f,
                "{} {} in {:?} awaited: {}",
                self.name(),
                connection_id,
                duration,
                awaited
            ),
            SdamEvent::ServerHeartbeatFailed {
                connection_id,
                duration,
                error,
                awaited,
            } => write!(
                f,
                "{} {} in {:?} awaited: {}: {}",
                self.name(),
                connection_id,
                duration,
                awaited,
                error
            ),
            SdamEvent::SdamInformation { message } => write!(f, "{}", message),
            SdamEvent::ConnectionPoolCleared {
                server_id,
                service_id,
                close_in_use_connections,
            } => write!(
                f,
                "{} {} service: {:?} close in use: {}",
                self.name(),
                server_id,
                service_id,
                close_in_use_connections
            ),
            SdamEvent::ConnectionCreated { connection_id }
            | SdamEvent::ConnectionCheckedIn { connection_id } => {
                write!(f, "{} {}", self.name(), connection_id)
            }
            SdamEvent::ConnectionClosed {
                connection_id,
                reason,
            } => write!(f, "{} {}: {}", self.name(), connection_id, reason),
            SdamEvent::ConnectionCheckedOut {
                connection_id,
                duration,
            } => write!(f, "{} {} in {:?}", self.name(), connection_id, duration),
            SdamEvent::ConnectionCheckOutFailed { server_id, reason } => {
                write!(f, "{} {}: {}", self.name(), server_id, reason)
            }
        }
    }
}

/// Receives every event emitted by servers, monitors and pools.
///
/// Failures returned from `handle` are logged and otherwise ignored; they never
/// influence monitoring or pooling.
pub trait EventSubscriber: Send + Sync {
    fn handle(&self, event: &SdamEvent) -> Result<(), BoxError>;
}

#[derive(Clone, Default)]
pub(crate) struct EventLogger {
    subscriber: Option<Arc<dyn EventSubscriber>>,
}

impl EventLogger {
    pub fn new(subscriber: Option<Arc<dyn EventSubscriber>>) -> Self {
        Self { subscriber }
    }

    pub fn log_and_publish(&self, event: SdamEvent) {
        debug!("{}", event);

        if let Some(subscriber) = &self.subscriber {
            if DEFER_DEPTH.with(|depth| depth.get()) > 0 {
                DEFERRED.with(|deferred| {
                    deferred.borrow_mut().push((subscriber.clone(), event));
                });
                return;
            }
            publish(subscriber.as_ref(), &event);
        }
    }
}

fn publish(subscriber: &dyn EventSubscriber, event: &SdamEvent) {
    if let Err(e) = subscriber.handle(event) {
        warn!("Event subscriber failed to handle {}: {}", event.name(), e);
    }
}

thread_local! {
    static DEFER_DEPTH: Cell<usize> = const { Cell::new(0) };
    static DEFERRED: RefCell<Vec<(Arc<dyn EventSubscriber>, SdamEvent)>> =
        const { RefCell::new(Vec::new()) };
}

/// Holds back subscriber calls made on this thread until the outermost scope
/// is dropped, so subscribers never run inside a critical section.
///
/// Events are logged immediately and delivered in the order they were raised.
pub(crate) struct DeferredEvents {
    _not_send: PhantomData<*const ()>,
}

impl DeferredEvents {
    pub fn begin() -> Self {
        DEFER_DEPTH.with(|depth| depth.set(depth.get() + 1));
        Self {
            _not_send: PhantomData,
        }
    }
}

impl Drop for DeferredEvents {
    fn drop(&mut self) {
        let remaining = DEFER_DEPTH.with(|depth| {
            let remaining = depth.get().saturating_sub(1);
            depth.set(remaining);
            remaining
        });
        if remaining > 0 {
            return;
        }

        // Subscribers may raise events of their own, which queue up behind
        // the ones being delivered.
        loop {
            let pending = DEFERRED.with(|deferred| std::mem::take(&mut *deferred.borrow_mut()));
            if pending.is_empty() {
                break;
            }
            for (subscriber, event) in pending {
                publish(subscriber.as_ref(), &event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{ClusterId, EndPoint};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Failing {
        calls: AtomicUsize,
    }

    impl EventSubscriber for Failing {
        fn handle(&self, _event: &SdamEvent) -> Result<(), BoxError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err("subscriber exploded".into())
        }
    }

    #[test]
    fn subscriber_failures_are_swallowed() {
        let subscriber = Arc::new(Failing {
            calls: AtomicUsize::new(0),
        });
        let logger = EventLogger::new(Some(subscriber.clone()));

        let server_id = ServerId::new(ClusterId::from_value("c"), EndPoint::host("a", 1));
        logger.log_and_publish(SdamEvent::ServerOpening {
            server_id: server_id.clone(),
        });
        logger.log_and_publish(SdamEvent::ServerClosing { server_id });

        assert_eq!(2, subscriber.calls.load(Ordering::SeqCst));
    }

    #[test]
    fn deferred_events_are_delivered_when_the_outer_scope_ends() {
        let subscriber = Arc::new(Failing {
            calls: AtomicUsize::new(0),
        });
        let logger = EventLogger::new(Some(subscriber.clone()));
        let server_id = ServerId::new(ClusterId::from_value("c"), EndPoint::host("a", 1));

        {
            let _outer = DeferredEvents::begin();
            logger.log_and_publish(SdamEvent::ServerOpening {
                server_id: server_id.clone(),
            });
            {
                let _inner = DeferredEvents::begin();
                logger.log_and_publish(SdamEvent::ServerClosing {
                    server_id: server_id.clone(),
                });
            }
            assert_eq!(0, subscriber.calls.load(Ordering::SeqCst));
        }
        assert_eq!(2, subscriber.calls.load(Ordering::SeqCst));

        logger.log_and_publish(SdamEvent::ServerClosing { server_id });
        assert_eq!(3, subscriber.calls.load(Ordering::SeqCst));
    }
}
