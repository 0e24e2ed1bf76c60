// mqttprom - MQTT to Prometheus bridge
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Retry of transient failures
//!
//! State records are small files written from the ingest thread. A failed
//! write is retried a few times in place before the error is surfaced for
//! the message that triggered it.

use std::fmt::Display;
use std::time::Duration;

/// How often and how long to wait before re-running a failed operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryStrategy {
    /// Run once
    #[default]
    None,
    /// Up to `max_retries` extra runs, `delay` apart
    Fixed {
        max_retries: u32,
        delay: Duration,
    },
}

impl RetryStrategy {
    /// Create a fixed retry strategy
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self::Fixed { max_retries, delay }
    }

    /// Delay before retry number `attempt` (0-indexed), `None` once exhausted
    pub fn delay_for_attempt(&self, attempt: u32) -> Option<Duration> {
        match self {
            Self::None => None,
            Self::Fixed { max_retries, delay } if attempt < *max_retries => Some(*delay),
            Self::Fixed { .. } => None,
        }
    }

    /// Maximum number of retries after the first run
    pub fn max_retries(&self) -> u32 {
        match self {
            Self::None => 0,
            Self::Fixed { max_retries, .. } => *max_retries,
        }
    }
}

/// Run `operation` until it succeeds or the strategy is exhausted
///
/// Returns the last error when every attempt fails.
pub fn with_retry<T, E, F>(strategy: &RetryStrategy, mut operation: F) -> Result<T, E>
where
    E: Display,
    F: FnMut() -> Result<T, E>,
{
    let mut attempt = 0;
    loop {
        match operation() {
            Ok(value) => return Ok(value),
            Err(e) => match strategy.delay_for_attempt(attempt) {
                Some(delay) => {
                    tracing::debug!(attempt = attempt + 1, error = %e, "Retrying");
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                None => return Err(e),
            },
        }
    }
}
