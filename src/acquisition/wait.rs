//! Bounded condition waits, caller aborts and wall-clock budgets.
//
// Device polling ("settled?", "at speed?", "arrived?") is expressed as a
// bounded wait: check immediately, then every poll interval until the condition
// yields a value or the timeout elapses. Aborts and budget overruns are only
// observed between checks, never in the middle of a device call.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};

use crate::error::{AcqResult, AcquisitionError, AcquisitionStage};

/// Defines how long and how often to check a condition.
#[derive(Clone, Copy, Debug)]
pub struct WaitPolicy {
    /// Give up after this long.
    pub timeout: Duration,
    /// Delay between checks.
    pub poll_interval: Duration,
}

impl WaitPolicy {
    /// Create a policy.
    pub fn new(timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            timeout,
            poll_interval,
        }
    }
}

/// Caller-side handle to abort an in-flight acquisition.
///
/// Cloning shares the underlying flag.
#[derive(Clone, Debug, Default)]
pub struct AbortHandle {
    flag: Arc<AtomicBool>,
}

impl AbortHandle {
    /// Create a handle that has not been triggered.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request an abort; observed at the next suspension point.
    pub fn abort(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// True once `abort` has been called.
    pub fn is_aborted(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Abort flag plus optional wall-clock deadline, checked at every
/// suspension point of an acquisition.
#[derive(Clone, Debug)]
pub struct Checkpoint {
    abort: AbortHandle,
    deadline: Option<(Instant, Duration)>,
}

impl Checkpoint {
    /// Start the budget clock now.
    pub fn new(abort: AbortHandle, budget: Option<Duration>) -> Self {
        Self {
            abort,
            deadline: budget.map(|budget| (Instant::now() + budget, budget)),
        }
    }

    /// Checkpoint that never fires.
    pub fn unbounded() -> Self {
        Self::new(AbortHandle::new(), None)
    }

    /// Fail with `Aborted` or `BudgetExceeded`, attributed to `stage`, if
    /// either has fired.
    pub fn check(&self, stage: AcquisitionStage) -> AcqResult<()> {
        if self.abort.is_aborted() {
            return Err(AcquisitionError::Aborted { stage });
        }
        if let Some((deadline, budget)) = self.deadline {
            if Instant::now() >= deadline {
                return Err(AcquisitionError::BudgetExceeded { budget, stage });
            }
        }
        Ok(())
    }
}

/// Evaluate `condition` until it yields `Some`, the policy's timeout elapses (`Ok(None)`),
/// or the condition or checkpoint fails. Checkpoint failures are attributed to
/// `stage`.
pub async fn poll_until<T, F, Fut>(
    policy: WaitPolicy,
    checkpoint: &Checkpoint,
    stage: AcquisitionStage,
    mut condition: F,
) -> AcqResult<Option<T>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = AcqResult<Option<T>>>,
{
    let deadline = Instant::now() + policy.timeout;
    loop {
        checkpoint.check(stage)?;
        if let Some(value) = condition().await? {
            return Ok(Some(value));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        sleep(policy.poll_interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    const STAGE: AcquisitionStage = AcquisitionStage::Motion;

    fn fast_policy(timeout_ms: u64) -> WaitPolicy {
        WaitPolicy::new(Duration::from_millis(timeout_ms), Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_poll_succeeds_on_later_attempt() {
        let attempts = AtomicU32::new(0);
        let result = poll_until(fast_policy(500), &Checkpoint::unbounded(), STAGE, || {
            let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            async move { Ok(if n >= 3 { Some(n) } else { None }) }
        })
        .await;
        assert_eq!(result.unwrap(), Some(3));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_poll_checks_immediately() {
        let attempts = AtomicU32::new(0);
        let result = poll_until(fast_policy(0), &Checkpoint::unbounded(), STAGE, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Ok(Some(())) }
        })
        .await;
        assert!(result.unwrap().is_some());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_poll_times_out() {
        let result: AcqResult<Option<()>> =
            poll_until(fast_policy(10), &Checkpoint::unbounded(), STAGE, || async {
                Ok(None)
            })
            .await;
        assert_eq!(result.unwrap(), None);
    }

    #[tokio::test]
    async fn test_poll_propagates_condition_error() {
        let result: AcqResult<Option<()>> =
            poll_until(fast_policy(100), &Checkpoint::unbounded(), STAGE, || async {
                Err(AcquisitionError::NotSettled)
            })
            .await;
        assert_eq!(result.unwrap_err(), AcquisitionError::NotSettled);
    }

    #[tokio::test]
    async fn test_abort_observed_between_checks() {
        let abort = AbortHandle::new();
        let checkpoint = Checkpoint::new(abort.clone(), None);
        let result: AcqResult<Option<()>> = poll_until(fast_policy(1000), &checkpoint, STAGE, || {
            abort.abort();
            async { Ok(None) }
        })
        .await;
        assert_eq!(
            result.unwrap_err(),
            AcquisitionError::Aborted {
                stage: AcquisitionStage::Motion
            }
        );
    }

    #[tokio::test]
    async fn test_budget_exceeded() {
        let checkpoint = Checkpoint::new(AbortHandle::new(), Some(Duration::from_millis(5)));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(matches!(
            checkpoint.check(AcquisitionStage::Illumination),
            Err(AcquisitionError::BudgetExceeded {
                stage: AcquisitionStage::Illumination,
                ..
            })
        ));
    }
}
