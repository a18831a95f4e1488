//! Bounded, cancellable polling.
//!
//! Every suspension is at most one poll interval long and races the
//! cancellation token, so a Ctrl-C is noticed within one interval.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::domain::WaitError;

/// Poll cadence and overall budget for [`until`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitSpec {
    pub poll_interval: Duration,
    pub timeout: Duration,
}

impl WaitSpec {
    #[must_use]
    pub fn new(poll_interval: Duration, timeout: Duration) -> Self {
        Self {
            poll_interval,
            timeout,
        }
    }
}

/// Sleep for `duration` or until cancelled, whichever comes first.
///
/// Being cancelled is not an error here; callers that care check the token.
pub async fn sleep(duration: Duration, cancel: &CancellationToken) {
    tokio::select! {
        () = tokio::time::sleep(duration) => {}
        () = cancel.cancelled() => {}
    }
}

/// Poll `predicate` until it returns `true`.
///
/// The predicate is evaluated immediately and then once per interval.
///
/// # Errors
///
/// - [`WaitError::Predicate`] as soon as the predicate fails (no retry).
/// - [`WaitError::Timeout`] once `spec.timeout` has elapsed.
/// - [`WaitError::Cancelled`] when the token fires.
pub async fn until<F, Fut>(
    spec: WaitSpec,
    cancel: &CancellationToken,
    mut predicate: F,
) -> Result<(), WaitError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<bool>>,
{
    let started = Instant::now();
    let deadline = started + spec.timeout;

    loop {
        if cancel.is_cancelled() {
            return Err(WaitError::Cancelled);
        }
        if predicate().await.map_err(WaitError::Predicate)? {
            return Ok(());
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(WaitError::Timeout(spec.timeout));
        }

        let nap = spec.poll_interval.min(deadline - now);
        tokio::select! {
            () = tokio::time::sleep(nap) => {}
            () = cancel.cancelled() => return Err(WaitError::Cancelled),
        }
    }
}
