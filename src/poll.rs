use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::debug;

/// Outcome of one tick of an unbounded poll.
#[derive(Debug)]
pub enum Probe<E> {
    /// The awaited condition holds, stop polling.
    Done,
    /// Not there yet, try again after the interval.
    Retry(E),
    /// Non-retryable failure, stop polling and surface the error.
    Fatal(E),
}

/// Call `getter` immediately and then every `interval` until it succeeds or
/// `timeout` has elapsed. On timeout the error of the final attempt is
/// returned as is.
pub async fn poll_with_getter<T, E, F, Fut>(
    interval: Duration,
    timeout: Duration,
    mut getter: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let started = Instant::now();
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match getter().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if started.elapsed() + interval > timeout {
                    debug!(attempt, error = %err, "poll deadline reached");
                    return Err(err);
                }
                debug!(attempt, error = %err, "condition not met, retrying");
                sleep(interval).await;
            }
        }
    }
}

/// Call `getter` immediately and then every `interval` until it reports
/// [`Probe::Done`] or [`Probe::Fatal`].
///
/// Retryable errors are logged and otherwise ignored; there is no deadline.
pub async fn poll_infinite_with_getter<E, F, Fut>(interval: Duration, mut getter: F) -> Result<(), E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Probe<E>>,
    E: Display,
{
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match getter().await {
            Probe::Done => return Ok(()),
            Probe::Fatal(err) => return Err(err),
            Probe::Retry(err) => {
                debug!(attempt, error = %err, "condition not met, retrying");
                sleep(interval).await;
            }
        }
    }
}
