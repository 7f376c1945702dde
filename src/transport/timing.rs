//! RTT estimation and timestamp echo.
//!
//! Implements the RFC 6298 estimator. Samples come from the packet header's
//! timestamp echo. Everything takes `now` explicitly so connections can be
//! driven by a simulated clock.

use std::time::{Duration, Instant};

/// RTT timing constants.
pub mod constants {
    use std::time::Duration;

    pub use crate::core::{INITIAL_RTO, MAX_RTO, MIN_RTO};

    /// Alpha for SRTT smoothing (0.125 = 1/8).
    pub const SRTT_ALPHA: f64 = 0.125;

    /// Beta for RTTVAR smoothing (0.25 = 1/4).
    pub const RTTVAR_BETA: f64 = 0.25;

    /// K multiplier for RTO calculation (4.0 per RFC 6298).
    pub const RTO_K: f64 = 4.0;

    /// Clock granularity used in the RTO formula.
    pub const GRANULARITY: Duration = Duration::from_millis(10);
}

/// RTT estimator implementing RFC 6298.
#[derive(Debug, Clone)]
pub struct RttEstimator {
    /// Smoothed RTT in milliseconds.
    srtt: f64,
    /// RTT variance in milliseconds.
    rttvar: f64,
    /// Current retransmission timeout.
    rto: Duration,
    /// Whether we've received the first RTT sample.
    initialized: bool,
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl RttEstimator {
    /// Create a new RTT estimator with initial values.
    pub fn new() -> Self {
        Self {
            srtt: 0.0,
            rttvar: 0.0,
            rto: constants::INITIAL_RTO,
            initialized: false,
        }
    }

    /// Update RTT estimate with a new sample.
    ///
    /// - First measurement: SRTT = sample, RTTVAR = sample / 2
    /// - Subsequent: RTTVAR = 0.75 * RTTVAR + 0.25 * |SRTT - sample|,
    ///   SRTT = 0.875 * SRTT + 0.125 * sample
    pub fn update(&mut self, sample: Duration) {
        let sample_ms = sample.as_secs_f64() * 1000.0;

        if !self.initialized {
            self.srtt = sample_ms;
            self.rttvar = sample_ms / 2.0;
            self.initialized = true;
        } else {
            self.rttvar = (1.0 - constants::RTTVAR_BETA) * self.rttvar
                + constants::RTTVAR_BETA * (self.srtt - sample_ms).abs();
            self.srtt =
                (1.0 - constants::SRTT_ALPHA) * self.srtt + constants::SRTT_ALPHA * sample_ms;
        }

        self.rto = self.computed_rto();
    }

    /// Get the current smoothed RTT.
    pub fn srtt(&self) -> Duration {
        Duration::from_secs_f64(self.srtt / 1000.0)
    }

    /// Get the current smoothed RTT in milliseconds.
    pub fn srtt_ms(&self) -> f64 {
        self.srtt
    }

    /// Get the current retransmission timeout.
    pub fn rto(&self) -> Duration {
        self.rto
    }

    /// Check if the estimator has been initialized with at least one sample.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    // RTO = SRTT + max(G, K * RTTVAR), clamped to [MIN_RTO, MAX_RTO]
    fn computed_rto(&self) -> Duration {
        let granularity_ms = constants::GRANULARITY.as_secs_f64() * 1000.0;
        let rto_ms = self.srtt + f64::max(granularity_ms, constants::RTO_K * self.rttvar);
        let rto_ms = rto_ms.clamp(
            constants::MIN_RTO.as_millis() as f64,
            constants::MAX_RTO.as_millis() as f64,
        );
        Duration::from_millis(rto_ms as u64)
    }
}

/// Timestamp tracker for RTT measurement via timestamp echo.
///
/// Every packet carries our timestamp and echoes the peer's latest one. When
/// the peer echoes the timestamp we are waiting on, the elapsed time is an
/// RTT sample.
#[derive(Debug, Clone)]
pub struct TimestampTracker {
    /// Connection start (all timestamps are relative to this).
    start: Instant,
    /// Most recent timestamp received from the peer (for echoing).
    last_peer_timestamp: u32,
    /// Our timestamp waiting to be echoed and when it was sent.
    pending: Option<(u32, Instant)>,
}

impl TimestampTracker {
    /// Create a tracker whose clock starts at `start`.
    pub fn with_start(start: Instant) -> Self {
        Self {
            start,
            last_peer_timestamp: 0,
            pending: None,
        }
    }

    /// Timestamp for a packet sent at `now` (ms since start).
    pub fn timestamp(&self, now: Instant) -> u32 {
        now.saturating_duration_since(self.start).as_millis() as u32
    }

    /// The timestamp echo value (peer's last timestamp).
    pub fn timestamp_echo(&self) -> u32 {
        self.last_peer_timestamp
    }

    /// Record that a packet with `timestamp` left at `now`.
    ///
    /// Only one timestamp is tracked at a time; later sends don't replace it.
    pub fn on_send(&mut self, timestamp: u32, now: Instant) {
        if self.pending.is_none() {
            self.pending = Some((timestamp, now));
        }
    }

    /// Process a received packet's timestamps.
    ///
    /// Returns an RTT sample if the echo matches our pending timestamp. An
    /// echo of a later packet means the pending one was lost; it is dropped
    /// so a fresh timestamp can be tracked.
    pub fn on_receive(&mut self, peer_timestamp: u32, echo: u32, now: Instant) -> Option<Duration> {
        self.last_peer_timestamp = peer_timestamp;

        match self.pending {
            Some((pending, sent_at)) if pending == echo => {
                self.pending = None;
                Some(now.saturating_duration_since(sent_at))
            }
            Some((pending, _)) if (echo.wrapping_sub(pending) as i32) > 0 => {
                self.pending = None;
                None
            }
            _ => None,
        }
    }

    /// Forget the pending timestamp (e.g. after a retransmission).
    pub fn clear_pending(&mut self) {
        self.pending = None;
    }
}
