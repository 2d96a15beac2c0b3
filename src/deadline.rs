use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::{Instant, Sleep};

/// A one-shot timer bounding the runtime of a process.
///
/// Awaiting the guard completes with the configured timeout once it expired. Dropping the guard
/// stops the timer for good, so a guard which lost the race against process exit can never fire
/// later on.
#[derive(Debug)]
pub struct DeadlineGuard {
    timeout: Duration,
    sleep: Pin<Box<Sleep>>,
}

impl DeadlineGuard {
    /// Starts the timer.
    pub fn start(timeout: Duration) -> Self {
        Self {
            timeout,
            sleep: Box::pin(tokio::time::sleep(timeout)),
        }
    }

    /// Starts a timer only if a timeout was requested.
    pub fn start_optional(timeout: Option<Duration>) -> Option<Self> {
        timeout.map(Self::start)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn deadline(&self) -> Instant {
        self.sleep.deadline()
    }

    pub fn is_expired(&self) -> bool {
        self.sleep.is_elapsed()
    }
}

impl Future for DeadlineGuard {
    type Output = Duration;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let timeout = self.timeout;
        self.sleep.as_mut().poll(cx).map(|()| timeout)
    }
}

/// Completes when the guard expires. Never completes without a guard.
pub(crate) async fn expired(guard: Option<&mut DeadlineGuard>) -> Duration {
    match guard {
        Some(guard) => guard.await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assertr::prelude::*;

    #[tokio::test(start_paused = true)]
    async fn expires_after_the_timeout() {
        let guard = DeadlineGuard::start(Duration::from_millis(100));
        let started = Instant::now();

        let timeout = guard.await;

        assert_that(timeout).is_equal_to(Duration::from_millis(100));
        assert_that(started.elapsed() >= Duration::from_millis(100)).is_true();
    }

    #[tokio::test(start_paused = true)]
    async fn is_not_expired_before_the_timeout() {
        let mut guard = DeadlineGuard::start(Duration::from_secs(1));
        tokio::time::advance(Duration::from_millis(500)).await;

        assert_that(guard.is_expired()).is_false();
        let raced = tokio::time::timeout(Duration::from_millis(10), &mut guard).await;
        assert_that(raced.is_err()).is_true();

        tokio::time::advance(Duration::from_millis(500)).await;
        assert_that((&mut guard).await).is_equal_to(Duration::from_secs(1));
        assert_that(guard.is_expired()).is_true();
    }

    #[tokio::test(start_paused = true)]
    async fn absent_guard_never_expires() {
        let raced = tokio::time::timeout(Duration::from_secs(3600), expired(None)).await;
        assert_that(raced.is_err()).is_true();
    }

    #[tokio::test(start_paused = true)]
    async fn no_guard_is_started_without_a_timeout() {
        assert_that(DeadlineGuard::start_optional(None).is_none()).is_true();

        let guard = DeadlineGuard::start_optional(Some(Duration::from_secs(2))).unwrap();
        assert_that(guard.timeout()).is_equal_to(Duration::from_secs(2));
        assert_that(guard.deadline() > Instant::now()).is_true();
    }
}
