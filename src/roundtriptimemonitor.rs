use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use log::debug;
use tokio::select;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

use crate::address::{EndPoint, ServerId};
use crate::connection::{Connection, ConnectionFactory, ResponseHandling};
use crate::error::Result;
use crate::hello::{create_hello_command, create_hello_protocol, get_hello_result};
use crate::operationcontext::OperationContext;
use crate::options::ServerApi;

const DEFAULT_ALPHA: f64 = 0.2;

#[derive(Debug, Clone)]
pub struct ExponentiallyWeightedMovingAverage {
    alpha: f64,
    average_nanos: Option<f64>,
}

impl ExponentiallyWeightedMovingAverage {
    pub fn new(alpha: f64) -> Self {
        Self {
            alpha,
            average_nanos: None,
        }
    }

    pub fn average(&self) -> Option<Duration> {
        self.average_nanos
            .map(|nanos| Duration::from_nanos(nanos.round() as u64))
    }

    pub fn add_sample(&mut self, sample: Duration) -> Duration {
        let sample = sample.as_nanos() as f64;
        let next = match self.average_nanos {
            None => sample,
            Some(previous) => self.alpha * sample + (1.0 - self.alpha) * previous,
        };
        self.average_nanos = Some(next);
        Duration::from_nanos(next.round() as u64)
    }

    pub fn reset(&mut self) {
        self.average_nanos = None;
    }
}

impl Default for ExponentiallyWeightedMovingAverage {
    fn default() -> Self {
        Self::new(DEFAULT_ALPHA)
    }
}

pub(crate) struct RoundTripTimeMonitorOptions {
    pub server_id: ServerId,
    pub end_point: EndPoint,
    pub heartbeat_interval: Duration,
    pub connection_factory: Arc<dyn ConnectionFactory>,
    pub server_api: Option<ServerApi>,
    pub load_balanced: bool,
}

/// Samples round trip times over its own connection so that a streaming
/// monitoring connection does not skew the average.
pub(crate) struct RoundTripTimeMonitor {
    inner: Arc<RoundTripTimeMonitorInner>,
}

struct RoundTripTimeMonitorInner {
    opts: RoundTripTimeMonitorOptions,
    average: Mutex<ExponentiallyWeightedMovingAverage>,
    started: AtomicBool,
    shutdown_token: CancellationToken,
}

impl RoundTripTimeMonitor {
    pub fn new(opts: RoundTripTimeMonitorOptions) -> Self {
        Self {
            inner: Arc::new(RoundTripTimeMonitorInner {
                opts,
                average: Mutex::new(ExponentiallyWeightedMovingAverage::default()),
                started: AtomicBool::new(false),
                shutdown_token: CancellationToken::new(),
            }),
        }
    }

    pub fn average(&self) -> Option<Duration> {
        self.inner.lock_average().average()
    }

    pub fn add_sample(&self, sample: Duration) {
        self.inner.lock_average().add_sample(sample);
    }

    pub fn reset(&self) {
        self.inner.lock_average().reset();
    }

    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst)
    }

    pub fn start(&self) {
        if self.inner.shutdown_token.is_cancelled() {
            return;
        }
        if self
            .inner
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        debug!("Round trip time monitor for {} starting", self.inner.opts.server_id);
        let inner = self.inner.clone();
        tokio::spawn(async move {
            inner.monitor().await;
        });
    }

    pub fn close(&self) {
        self.inner.shutdown_token.cancel();
    }
}

impl Drop for RoundTripTimeMonitor {
    fn drop(&mut self) {
        self.inner.shutdown_token.cancel();
    }
}

impl RoundTripTimeMonitorInner {
    // A panic while sampling leaves the average usable, so poisoning is ignored.
    fn lock_average(&self) -> MutexGuard<'_, ExponentiallyWeightedMovingAverage> {
        self.average.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn monitor(&self) {
        let mut connection: Option<Arc<dyn Connection>> = None;

        loop {
            let ctx = OperationContext::new(None, self.shutdown_token.clone());

            let res = match connection.clone() {
                Some(c) => self.sample(c.as_ref(), &ctx).await,
                None => self.open_connection(&ctx).await.map(|c| {
                    connection = Some(c);
                }),
            };

            if self.shutdown_token.is_cancelled() {
                break;
            }

            if let Err(e) = res {
                debug!(
                    "Round trip time monitor for {} failed: {}",
                    self.opts.server_id, e
                );
                if let Some(c) = connection.take() {
                    c.close().await;
                }
            }

            select! {
                _ = self.shutdown_token.cancelled() => break,
                _ = sleep(self.opts.heartbeat_interval) => {}
            }
        }

        if let Some(c) = connection.take() {
            c.close().await;
        }
        debug!("Round trip time monitor for {} stopped", self.opts.server_id);
    }

    async fn open_connection(&self, ctx: &OperationContext) -> Result<Arc<dyn Connection>> {
        let connection = self
            .opts
            .connection_factory
            .create_connection(&self.opts.server_id, &self.opts.end_point);

        let start = Instant::now();
        if let Err(e) = ctx.run(connection.open(ctx)).await {
            connection.close().await;
            return Err(e);
        }
        self.lock_average().add_sample(start.elapsed());

        Ok(connection)
    }

    async fn sample(&self, connection: &dyn Connection, ctx: &OperationContext) -> Result<()> {
        let hello_ok = connection
            .description()
            .map(|d| d.hello_result.hello_ok)
            .unwrap_or(false);
        let command = create_hello_command(
            self.opts.server_api.as_ref(),
            hello_ok,
            None,
            None,
            self.opts.load_balanced,
        );
        let mut protocol = create_hello_protocol(command, ResponseHandling::Return);

        let start = Instant::now();
        get_hello_result(connection, &mut protocol, ctx).await?;
        let elapsed = start.elapsed();

        self.lock_average().add_sample(elapsed);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::ClusterId;

    #[test]
    fn ewma_sequence() {
        let mut ewma = ExponentiallyWeightedMovingAverage::new(0.2);
        assert_eq!(None, ewma.average());

        assert_eq!(Duration::from_millis(10), ewma.add_sample(Duration::from_millis(10)));
        assert_eq!(Duration::from_millis(12), ewma.add_sample(Duration::from_millis(20)));
        assert_eq!(
            Duration::from_micros(15_600),
            ewma.add_sample(Duration::from_millis(30))
        );
        assert_eq!(Some(Duration::from_micros(15_600)), ewma.average());
    }

    #[test]
    fn ewma_reset_forgets_samples() {
        let mut ewma = ExponentiallyWeightedMovingAverage::default();
        ewma.add_sample(Duration::from_millis(100));
        ewma.reset();
        assert_eq!(None, ewma.average());

        assert_eq!(Duration::from_millis(7), ewma.add_sample(Duration::from_millis(7)));
    }

    struct NoConnections;

    impl ConnectionFactory for NoConnections {
        fn create_connection(&self, _server_id: &ServerId, _end_point: &EndPoint) -> Arc<dyn Connection> {
            unreachable!("the monitor is never started")
        }
    }

    #[test]
    fn average_survives_a_poisoned_lock() {
        let end_point = EndPoint::host("localhost", 27017);
        let monitor = RoundTripTimeMonitor::new(RoundTripTimeMonitorOptions {
            server_id: ServerId::new(ClusterId::from_value("c"), end_point.clone()),
            end_point,
            heartbeat_interval: Duration::from_secs(10),
            connection_factory: Arc::new(NoConnections),
            server_api: None,
            load_balanced: false,
        });
        monitor.add_sample(Duration::from_millis(10));

        let inner = monitor.inner.clone();
        let poisoned = std::thread::spawn(move || {
            let _average = inner.average.lock().unwrap();
            panic!("poisoning the average");
        })
        .join();
        assert!(poisoned.is_err());
        assert!(monitor.inner.average.is_poisoned());

        assert_eq!(Some(Duration::from_millis(10)), monitor.average());
        monitor.add_sample(Duration::from_millis(20));
        assert_eq!(Some(Duration::from_millis(12)), monitor.average());
        monitor.reset();
        assert_eq!(None, monitor.average());
    }
}
