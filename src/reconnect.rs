//! Relay-link supervision: exponential backoff and automatic reconnect.
//!
//! The relay connection is expendable — peers keep syncing directly when
//! it drops — so the supervisor just keeps retrying in the background
//! until the session shuts down.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::signaling::SignalingClient;

/// Backoff policy for relay reconnection attempts.
#[derive(Debug, Clone, Copy)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    pub base: Duration,
    /// Ceiling for the doubled delay.
    pub max: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(15),
        }
    }
}

/// Exponential backoff state: `min(max, base * 2^attempt)`.
#[derive(Debug)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Delay to wait before the next attempt, then advance.
    pub fn next_delay(&mut self) -> Duration {
        let factor = 1u32.checked_shl(self.attempt).unwrap_or(u32::MAX);
        let delay = self
            .config
            .base
            .saturating_mul(factor)
            .min(self.config.max);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Call after a successful connection so the next failure starts
    /// from the base delay again.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Background task that keeps one relay connection alive.
///
/// Each iteration runs a full connect-until-disconnect cycle on the
/// [`SignalingClient`]; a cycle that ends (cleanly or not) is followed
/// by a backoff delay and a fresh attempt. A cycle that connected
/// resets the backoff.
pub struct ReconnectSupervisor {
    active: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl ReconnectSupervisor {
    pub fn spawn(client: Arc<SignalingClient>, config: BackoffConfig) -> Self {
        let active = Arc::new(AtomicBool::new(true));
        let flag = active.clone();
        let handle = tokio::spawn(async move {
            let mut backoff = Backoff::new(config);
            while flag.load(Ordering::SeqCst) {
                match client.run_once().await {
                    Ok(()) => {
                        // Connected and later lost the link; retry fresh.
                        backoff.reset();
                    }
                    Err(e) => {
                        log::warn!("relay connection failed: {}", e);
                    }
                }
                if !flag.load(Ordering::SeqCst) {
                    break;
                }
                let delay = backoff.next_delay();
                log::debug!("retrying relay connection in {:?}", delay);
                tokio::time::sleep(delay).await;
            }
        });
        Self { active, handle }
    }

    /// Stop retrying permanently and abort any in-flight attempt.
    pub fn shutdown(&self) {
        self.active.store(false, Ordering::SeqCst);
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_to_cap() {
        let mut backoff = Backoff::new(BackoffConfig::default());
        let delays: Vec<u64> = (0..6).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 15, 15]);
    }

    #[test]
    fn test_backoff_reset() {
        let mut backoff = Backoff::new(BackoffConfig::default());
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_backoff_never_decreases_before_reset() {
        let mut backoff = Backoff::new(BackoffConfig {
            base: Duration::from_millis(250),
            max: Duration::from_secs(60),
        });
        let mut last = Duration::ZERO;
        for _ in 0..40 {
            let next = backoff.next_delay();
            assert!(next >= last);
            last = next;
        }
        assert_eq!(last, Duration::from_secs(60));
    }
}
