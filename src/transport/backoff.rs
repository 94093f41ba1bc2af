//! Exponential backoff for connection attempts.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::{info, warn};

use crate::error::TransportError;

/// Attempt bound and initial delay; the delay doubles after each failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    attempts: u32,
    initial: Duration,
}

impl Backoff {
    /// At least one attempt is always made.
    pub fn new(attempts: u32, initial: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            initial,
        }
    }

    /// Total attempts.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Delays between attempts: one fewer than the number of attempts.
    pub fn delays(&self) -> impl Iterator<Item = Duration> {
        let initial = self.initial;
        (0..self.attempts - 1).map(move |i| initial.saturating_mul(2u32.saturating_pow(i)))
    }
}

/// Call `dial` until it succeeds or the attempts run out.
///
/// Sleeps between attempts but not after the last one.
pub async fn connect_with_backoff<T, E, F, Fut>(backoff: &Backoff, mut dial: F) -> Result<T, TransportError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut delays = backoff.delays();
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        match dial().await {
            Ok(conn) => {
                if attempt > 1 {
                    info!(attempt, "Connected after retrying");
                }
                return Ok(conn);
            }
            Err(err) => match delays.next() {
                Some(delay) => {
                    warn!(
                        attempt,
                        error = %err,
                        retry_in_ms = delay.as_millis() as u64,
                        "Connection attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {
                    warn!(attempts = attempt, error = %err, "Giving up on connection");
                    return Err(TransportError::ConnectFailed {
                        attempts: attempt,
                        last_error: err.to_string(),
                    });
                }
            },
        }
    }
}
