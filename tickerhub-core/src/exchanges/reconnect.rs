//! Reconnect backoff for live streams

use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::StreamConfig;

#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// 1.0 keeps a fixed delay
    pub multiplier: f64,
    /// 0 = unlimited
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self::from(&StreamConfig::default())
    }
}

impl From<&StreamConfig> for ReconnectConfig {
    fn from(stream: &StreamConfig) -> Self {
        Self {
            initial_delay: stream.reconnect_delay,
            max_delay: stream.max_reconnect_delay.max(stream.reconnect_delay),
            multiplier: stream.backoff_multiplier,
            max_attempts: stream.max_reconnect_attempts,
        }
    }
}

/// Outcome of waiting before the next connection attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Retry,
    Exhausted,
    Cancelled,
}

#[derive(Debug)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    current_delay: Duration,
    attempt_count: u32,
}

impl ReconnectPolicy {
    pub fn new(config: ReconnectConfig) -> Self {
        let current_delay = config.initial_delay;
        Self {
            config,
            current_delay,
            attempt_count: 0,
        }
    }

    /// Next delay, or `None` once the attempt cap is reached
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.config.max_attempts > 0 && self.attempt_count >= self.config.max_attempts {
            return None;
        }
        self.attempt_count += 1;

        let delay = self.current_delay;
        let scaled = self.current_delay.as_secs_f64() * self.config.multiplier.max(1.0);
        self.current_delay = if scaled.is_finite() {
            Duration::from_secs_f64(scaled).min(self.config.max_delay)
        } else {
            self.config.max_delay
        };

        Some(delay)
    }

    pub fn reset(&mut self) {
        self.current_delay = self.config.initial_delay;
        self.attempt_count = 0;
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    /// Sleep for the next delay unless cancelled first
    pub async fn wait(&mut self, cancel: &CancellationToken) -> Backoff {
        let Some(delay) = self.next_delay() else {
            return Backoff::Exhausted;
        };

        tokio::select! {
            _ = cancel.cancelled() => Backoff::Cancelled,
            _ = tokio::time::sleep(delay) => Backoff::Retry,
        }
    }
}
