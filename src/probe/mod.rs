//! Latency probe strategies.
//!
//! A run picks one [`Probe`] implementation through [`pick`]; the prober only
//! ever sees the trait object, so tests can substitute their own strategy.
mod http;
mod icmp;
mod tcp;

pub use http::{location_tag, HttpProbe};
pub use icmp::{parse_rtt, ping_command, IcmpProbe};
pub use tcp::TcpProbe;

use crate::address::AddressKey;
use crate::input::{ProbeMode, ScanConfig};
use async_trait::async_trait;
use std::num::NonZeroU8;
use std::sync::Arc;
use std::time::Duration;

/// Result of a single probe attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeOutcome {
    pub success: bool,
    /// Time to reach the target. Zero for failed attempts.
    pub elapsed: Duration,
    /// Edge location that answered, only reported by the http probe.
    pub location: Option<String>,
}

impl ProbeOutcome {
    pub const fn reached(elapsed: Duration) -> Self {
        Self {
            success: true,
            elapsed,
            location: None,
        }
    }

    pub const fn failed() -> Self {
        Self {
            success: false,
            elapsed: Duration::ZERO,
            location: None,
        }
    }

    #[must_use]
    pub fn with_location(mut self, location: Option<String>) -> Self {
        self.location = location;
        self
    }
}

/// A way of measuring the latency of one target.
///
/// Implementations must give up on their own within a bounded time; failures
/// are reported as [`ProbeOutcome::failed`], never as errors.
#[async_trait]
pub trait Probe: Send + Sync {
    async fn probe(&self, target: &AddressKey) -> ProbeOutcome;

    /// Number of attempts made per target given the configured count.
    fn attempts(&self, configured: NonZeroU8) -> NonZeroU8 {
        configured
    }
}

/// Builds the probe selected by `config.mode`.
pub fn pick(config: &ScanConfig) -> Arc<dyn Probe> {
    match config.mode {
        ProbeMode::Tcp => Arc::new(TcpProbe::new(config.connect_timeout)),
        ProbeMode::Icmp => Arc::new(IcmpProbe::default()),
        ProbeMode::Http => Arc::new(HttpProbe::new(config.http.clone())),
    }
}
