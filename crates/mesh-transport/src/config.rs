//! Transport configuration

use mesh_codec::Framing;
use mpc_mesh_core::{Error, Result};
use std::time::Duration;

/// Default capacity of each inbound queue
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// Default pause between dial attempts
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(5);

/// Default upper bound on a single frame (1 MiB)
pub const DEFAULT_MAX_FRAME_LEN: usize = 1024 * 1024;

/// Transport tuning knobs
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Messages buffered per inbound queue before new ones are dropped
    pub queue_capacity: usize,
    /// Fixed backoff between dial attempts
    pub retry_backoff: Duration,
    /// Longest accepted frame, excluding the newline
    pub max_frame_len: usize,
    /// Wire framing shared by every party of the deployment
    pub framing: Framing,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            framing: Framing::default(),
        }
    }
}

impl TransportConfig {
    /// Set inbound queue capacity
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Set dial retry backoff
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Set maximum frame length
    pub fn with_max_frame_len(mut self, len: usize) -> Self {
        self.max_frame_len = len;
        self
    }

    /// Set wire framing
    pub fn with_framing(mut self, framing: Framing) -> Self {
        self.framing = framing;
        self
    }

    /// Reject settings the transport cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(Error::InvalidConfig("queue capacity must be positive".into()));
        }
        if self.max_frame_len == 0 {
            return Err(Error::InvalidConfig("max frame length must be positive".into()));
        }
        if self.retry_backoff.is_zero() {
            return Err(Error::InvalidConfig("retry backoff must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TransportConfig::default();
        assert_eq!(config.queue_capacity, 1000);
        assert_eq!(config.retry_backoff, Duration::from_secs(5));
        assert_eq!(config.framing, Framing::Record);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate() {
        assert!(TransportConfig::default()
            .with_queue_capacity(0)
            .validate()
            .is_err());
        assert!(TransportConfig::default()
            .with_retry_backoff(Duration::ZERO)
            .validate()
            .is_err());
        assert!(TransportConfig::default()
            .with_max_frame_len(0)
            .validate()
            .is_err());
    }
}
