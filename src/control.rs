//! Run-wide deadline and cancellation.

use crate::{Result, VerifyError};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Shared by every network step of a run: one deadline for the whole run
/// and one cancellation token.
#[derive(Debug, Clone, Default)]
pub struct RunControl {
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl RunControl {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            deadline: timeout.map(|t| Instant::now() + t),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Drive `fut` until it completes, the deadline passes, or the run is
    /// cancelled. `step` names the operation in the timeout error.
    pub async fn run<T, F>(&self, step: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let guarded = async {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Err(VerifyError::Cancelled),
                result = fut => result,
            }
        };

        match self.deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, guarded)
                .await
                .map_err(|_| VerifyError::Timeout(step.to_string()))?,
            None => guarded.await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_completes_within_deadline() {
        let control = RunControl::new(Some(Duration::from_secs(5)));
        let value = control.run("adding", async { Ok(1 + 1) }).await.unwrap();
        assert_eq!(value, 2);
    }

    #[tokio::test]
    async fn test_deadline_elapses() {
        let control = RunControl::new(Some(Duration::from_millis(10)));
        let result: Result<()> = control
            .run("fetching trust root", async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(VerifyError::Timeout(step)) if step == "fetching trust root"));
    }

    #[tokio::test]
    async fn test_cancellation_wins() {
        let control = RunControl::new(None);
        control.cancellation_token().cancel();
        let result: Result<()> = control
            .run("lookup", async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(VerifyError::Cancelled)));
    }
}
