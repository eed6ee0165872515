use std::future::Future;
use std::time::Duration;

use tokio::select;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Bounds a unit of work by an optional deadline and a cancellation signal.
#[derive(Debug, Clone)]
pub struct OperationContext {
    deadline: Option<Instant>,
    cancellation_token: CancellationToken,
}

impl OperationContext {
    pub fn new(timeout: Option<Duration>, cancellation_token: CancellationToken) -> Self {
        Self {
            deadline: timeout.map(|t| Instant::now() + t),
            cancellation_token,
        }
    }

    pub fn with_deadline(deadline: Option<Instant>, cancellation_token: CancellationToken) -> Self {
        Self {
            deadline,
            cancellation_token,
        }
    }

    /// A context with no deadline that is never cancelled.
    pub fn infinite() -> Self {
        Self::new(None, CancellationToken::new())
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation_token
    }

    pub fn remaining_timeout(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn is_timed_out(&self) -> bool {
        self.deadline.map(|d| Instant::now() >= d).unwrap_or(false)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }

    /// Returns a context whose deadline is the earlier of this one and `timeout`
    /// from now, sharing the same cancellation signal.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(d) if d < candidate => d,
            _ => candidate,
        };
        Self {
            deadline: Some(deadline),
            cancellation_token: self.cancellation_token.clone(),
        }
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(Error::new_cancelled_error("the operation was cancelled"));
        }
        if self.is_timed_out() {
            return Err(Error::new_timeout_error("the operation timed out"));
        }
        Ok(())
    }

    /// Drives `fut` to completion unless the context is cancelled or its
    /// deadline passes first.
    pub async fn run<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.check()?;

        let deadline = async {
            match self.deadline {
                Some(d) => sleep_until(d).await,
                None => std::future::pending::<()>().await,
            }
        };

        select! {
            biased;
            _ = self.cancellation_token.cancelled() => {
                Err(Error::new_cancelled_error("the operation was cancelled"))
            }
            _ = deadline => Err(Error::new_timeout_error("the operation timed out")),
            res = fut => res,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_returns_future_output() {
        let ctx = OperationContext::infinite();
        let res = ctx.run(async { Ok(5) }).await.unwrap();
        assert_eq!(5, res);
    }

    #[tokio::test]
    async fn run_times_out() {
        let ctx = OperationContext::new(Some(Duration::from_millis(20)), CancellationToken::new());
        let res: Result<()> = ctx
            .run(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(res.unwrap_err().is_timeout());
    }

    #[tokio::test]
    async fn run_observes_cancellation() {
        let token = CancellationToken::new();
        let ctx = OperationContext::new(None, token.clone());

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        });

        let res: Result<()> = ctx.run(std::future::pending()).await;
        assert!(res.unwrap_err().is_cancellation());
        canceller.await.unwrap();
    }

    #[test]
    fn with_timeout_never_extends_the_deadline() {
        let ctx = OperationContext::new(Some(Duration::from_millis(10)), CancellationToken::new());
        let narrowed = ctx.with_timeout(Duration::from_secs(60));
        assert_eq!(ctx.deadline(), narrowed.deadline());
    }
}
