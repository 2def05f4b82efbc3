//! Bounded retry with a fixed back-off schedule.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// An operation abandoned because its token was cancelled
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0} cancelled")]
pub struct Cancelled(pub String);

/// Run `operation`, retrying after each entry of `delays` while
/// `is_retryable` holds. At most `delays.len() + 1` attempts are made.
pub async fn with_retry<T, E, F, Fut, R>(
    name: &str,
    delays: &[Duration],
    is_retryable: R,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
    E: Display,
{
    let mut attempt = 0usize;
    loop {
        let e = match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };
        let Some(delay) = next_delay(name, delays, &mut attempt, &is_retryable, &e) else {
            return Err(e);
        };
        tokio::time::sleep(delay).await;
    }
}

/// [`with_retry`] bounded by `cancel`: both the attempts and the back-off
/// sleeps stop as soon as the token fires.
///
/// Cancellation during an attempt returns [`Cancelled`]; during a back-off
/// the last error is returned.
pub async fn with_retry_cancellable<T, E, F, Fut, R>(
    name: &str,
    delays: &[Duration],
    cancel: &CancellationToken,
    is_retryable: R,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
    E: Display + From<Cancelled>,
{
    let mut attempt = 0usize;
    loop {
        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(Cancelled(name.to_string()).into()),
            result = operation() => result,
        };
        let e = match result {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };
        let Some(delay) = next_delay(name, delays, &mut attempt, &is_retryable, &e) else {
            return Err(e);
        };
        tokio::select! {
            _ = cancel.cancelled() => return Err(e),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

fn next_delay<E: Display>(
    name: &str,
    delays: &[Duration],
    attempt: &mut usize,
    is_retryable: impl Fn(&E) -> bool,
    e: &E,
) -> Option<Duration> {
    let delay = delays.get(*attempt).copied()?;
    if !is_retryable(e) {
        return None;
    }
    *attempt += 1;
    tracing::warn!(
        "{} failed (attempt {} of {}): {}; retrying in {:?}",
        name,
        attempt,
        delays.len() + 1,
        e,
        delay
    );
    Some(delay)
}

/// `attempts - 1` doubling delays starting at `base`
pub fn exponential_delays(base: Duration, attempts: u32) -> Vec<Duration> {
    (0..attempts.saturating_sub(1))
        .map(|i| base.saturating_mul(1u32 << i.min(16)))
        .collect()
}
