//! Pause policy between result poll rounds.

use crate::config::PollConfig;
use std::time::Duration;
use tokio::time::{sleep, Instant};

/// The deadline passed before the awaited results arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeadlineExpired;

/// Paces one polling loop.
///
/// The first retry happens immediately. Later retries sleep for a pause that
/// starts at `initial_backoff` and grows by `multiplier` up to `max_backoff`,
/// never sleeping past the deadline.
#[derive(Debug)]
pub struct Poller {
    next: Option<Duration>,
    initial: Duration,
    max: Duration,
    multiplier: f64,
    deadline: Option<Instant>,
    rounds: u64,
}

impl Poller {
    pub fn new(config: &PollConfig) -> Self {
        Self {
            next: None,
            initial: config.initial_backoff,
            max: config.max_backoff,
            multiplier: config.multiplier,
            deadline: config.deadline.map(|d| Instant::now() + d),
            rounds: 0,
        }
    }

    /// Number of completed pauses.
    pub fn rounds(&self) -> u64 {
        self.rounds
    }

    /// Wait before the next poll round.
    pub async fn pause(&mut self) -> Result<(), DeadlineExpired> {
        let remaining = match self.deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return Err(DeadlineExpired);
                }
                Some(deadline - now)
            }
            None => None,
        };

        match self.next {
            None => {
                tokio::task::yield_now().await;
                self.next = Some(self.initial);
            }
            Some(backoff) => {
                let backoff = remaining.map_or(backoff, |r| backoff.min(r));
                sleep(backoff).await;
                self.next = Some(self.max.min(backoff.mul_f64(self.multiplier)));
            }
        }
        self.rounds += 1;
        Ok(())
    }
}
