//! Send-side pacing: retransmission backoff, heartbeat/liveness tracking,
//! congestion control, the per-socket rate limiter and fabricated packet drop.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::timing::constants::MAX_RTO;
use crate::core::constants::{
    DEFAULT_MTU, MAX_CONGESTION_WINDOW, MAX_RATE_DECREASES, MIN_CONGESTION_WINDOW,
    MIN_SENDING_RATE, SENDING_RATE_DECREASE,
};

/// Retransmission backoff multiplier.
pub const RETRANSMIT_BACKOFF: u32 = 2;

/// Retransmission controller.
///
/// Holds the timeout after which unacknowledged data is resent, doubling it
/// for every retransmission round and resetting it when acks make progress.
#[derive(Debug, Clone)]
pub struct RetransmitController {
    /// Number of retransmission rounds since the last ack progress.
    retransmit_count: u32,
    /// Last retransmission round.
    last_retransmit: Option<Instant>,
    /// Current timeout (after backoff).
    current_timeout: Duration,
    /// Base RTO from RTT estimator.
    base_rto: Duration,
}

impl RetransmitController {
    /// Create a new retransmit controller.
    pub fn new(initial_rto: Duration) -> Self {
        Self {
            retransmit_count: 0,
            last_retransmit: None,
            current_timeout: initial_rto,
            base_rto: initial_rto,
        }
    }

    /// Update the base RTO from RTT estimator.
    pub fn set_rto(&mut self, rto: Duration) {
        self.base_rto = rto;
        // Only update current_timeout if we're not in backoff
        if self.retransmit_count == 0 {
            self.current_timeout = rto;
        }
    }

    /// Timeout after which unacknowledged data is due again.
    pub fn timeout(&self) -> Duration {
        self.current_timeout
    }

    /// Record a retransmission round at `now`. Returns false when `now`
    /// belongs to the round already recorded.
    ///
    /// Several datagrams retransmitted at the same instant count as one round.
    pub fn on_retransmit(&mut self, now: Instant) -> bool {
        if self.last_retransmit == Some(now) {
            return false;
        }
        self.retransmit_count += 1;
        self.last_retransmit = Some(now);
        let new_timeout = self.current_timeout * RETRANSMIT_BACKOFF;
        self.current_timeout = new_timeout.min(MAX_RTO);
        true
    }

    /// Reset after ack progress.
    pub fn on_ack(&mut self) {
        self.retransmit_count = 0;
        self.last_retransmit = None;
        self.current_timeout = self.base_rto;
    }

    /// Retransmission rounds since the last ack progress.
    pub fn retransmit_count(&self) -> u32 {
        self.retransmit_count
    }
}

/// Heartbeat and liveness bookkeeping for one connection.
#[derive(Debug, Clone)]
pub struct Liveness {
    last_sent: Instant,
    last_received: Instant,
    heartbeat_interval: Duration,
    lost_after: Duration,
    timeout: Duration,
}

impl Liveness {
    /// Start tracking at `now`.
    pub fn new(now: Instant, heartbeat_interval: Duration, lost_after: Duration, timeout: Duration) -> Self {
        Self {
            last_sent: now,
            last_received: now,
            heartbeat_interval,
            lost_after,
            timeout,
        }
    }

    /// A datagram left at `now`.
    pub fn on_sent(&mut self, now: Instant) {
        self.last_sent = now;
    }

    /// A valid datagram arrived at `now`.
    pub fn on_received(&mut self, now: Instant) {
        self.last_received = now;
    }

    /// Last time a valid datagram arrived.
    pub fn last_received(&self) -> Instant {
        self.last_received
    }

    /// When the next heartbeat is due if nothing else is sent.
    pub fn heartbeat_deadline(&self) -> Instant {
        self.last_sent + self.heartbeat_interval
    }

    /// When the connection counts as lost if nothing arrives.
    pub fn lost_deadline(&self) -> Instant {
        self.last_received + self.lost_after
    }

    /// When the connection times out if nothing arrives.
    pub fn timeout_deadline(&self) -> Instant {
        self.last_received + self.timeout
    }

    /// Check if we should send a heartbeat.
    pub fn needs_heartbeat(&self, now: Instant) -> bool {
        now >= self.heartbeat_deadline()
    }

    /// Check if the peer has been silent for the liveness window.
    pub fn is_lost(&self, now: Instant) -> bool {
        now >= self.lost_deadline()
    }

    /// Check if the connection should be considered dead.
    pub fn is_timed_out(&self, now: Instant) -> bool {
        now >= self.timeout_deadline()
    }
}

/// Delivery-rate samples taken from acknowledgements, in bytes per second.
#[derive(Debug, Clone, Default)]
struct DeliveryRate {
    samples: VecDeque<f64>,
    last_ack: Option<Instant>,
}

impl DeliveryRate {
    const SAMPLES: usize = 16;
    /// Gaps longer than this are idle time, not a measure of the path.
    const MAX_GAP: Duration = Duration::from_secs(1);

    fn on_ack(&mut self, bytes: usize, now: Instant) {
        if let Some(last) = self.last_ack {
            let gap = now.saturating_duration_since(last);
            if !gap.is_zero() && gap <= Self::MAX_GAP {
                if self.samples.len() == Self::SAMPLES {
                    self.samples.pop_front();
                }
                self.samples.push_back(bytes as f64 / gap.as_secs_f64());
            }
        }
        self.last_ack = Some(now);
    }

    /// Median sample: the rate the peer is currently taking data at.
    fn median(&self) -> Option<f64> {
        let mut sorted: Vec<f64> = self.samples.iter().copied().collect();
        sorted.sort_by(f64::total_cmp);
        sorted.get(sorted.len() / 2).copied()
    }

    /// Largest sample: the best the path has shown it can carry.
    fn peak(&self) -> Option<f64> {
        self.samples.iter().copied().reduce(f64::max)
    }
}

/// Loss-driven congestion control for one connection.
///
/// Starts in slow start, where only the congestion window limits new data and
/// the window grows with everything sent. The first loss ends slow start and
/// switches to a sending rate seeded from the measured delivery rate. From
/// then on every acknowledgement raises the rate, and retransmissions lower
/// it:
///
/// - a loss of a packet sent after the last decrease opens a new loss period
///   and divides the rate by [`SENDING_RATE_DECREASE`]
/// - within a period the rate drops again at randomised intervals, at most
///   [`MAX_RATE_DECREASES`] more times
/// - a repeated retransmission timeout halves the rate
///
/// Retransmissions are never held back, but they spend the rate budget.
#[derive(Debug, Clone)]
pub struct CongestionController {
    window: usize,
    /// `None` during slow start.
    rate: Option<f64>,
    slow_start_sent: usize,
    avg_packet_size: f64,
    delivery: DeliveryRate,
    tick: Duration,

    avg_loss_count: f64,
    loss_count: u32,
    dec_count: u32,
    dec_random: u32,
    last_dec_packet: Option<u64>,
    packets_sent: u64,

    budget: f64,
    last_refill: Instant,
    rng: StdRng,
}

impl CongestionController {
    /// Start in slow start at `now`. `tick` is the connection's batching
    /// interval and bounds how much rate budget can build up.
    pub fn new(tick: Duration, now: Instant) -> Self {
        Self::with_rng(tick, now, StdRng::from_entropy())
    }

    /// Deterministic controller for tests and simulations.
    pub fn with_seed(tick: Duration, now: Instant, seed: u64) -> Self {
        Self::with_rng(tick, now, StdRng::seed_from_u64(seed))
    }

    fn with_rng(tick: Duration, now: Instant, rng: StdRng) -> Self {
        Self {
            window: MIN_CONGESTION_WINDOW,
            rate: None,
            slow_start_sent: 0,
            avg_packet_size: DEFAULT_MTU as f64,
            delivery: DeliveryRate::default(),
            tick,
            avg_loss_count: 1.0,
            loss_count: 1,
            dec_count: 1,
            dec_random: 2,
            last_dec_packet: None,
            packets_sent: 0,
            budget: 0.0,
            last_refill: now,
            rng,
        }
    }

    /// Congestion window in bytes.
    pub fn window(&self) -> usize {
        self.window
    }

    /// Sending rate in bytes per second, `None` during slow start.
    pub fn sending_rate(&self) -> Option<f64> {
        self.rate
    }

    /// Still in slow start.
    pub fn in_slow_start(&self) -> bool {
        self.rate.is_none()
    }

    /// Number of the last data packet recorded by [`on_sent`](Self::on_sent).
    pub fn packets_sent(&self) -> u64 {
        self.packets_sent
    }

    /// Whether `size` new bytes may go out with `in_flight` bytes unacknowledged.
    ///
    /// With nothing in flight the window never blocks, so a connection always
    /// makes progress.
    pub fn can_send(&mut self, in_flight: usize, size: usize, now: Instant) -> bool {
        if in_flight > 0 && in_flight + size > self.window {
            return false;
        }
        self.rate_ready(now)
    }

    /// Whether the sending rate allows another packet at `now`.
    pub fn rate_ready(&mut self, now: Instant) -> bool {
        let Some(rate) = self.rate else {
            return true;
        };
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        let cap = f64::max(rate * self.tick.as_secs_f64(), DEFAULT_MTU as f64);
        self.budget = f64::min(cap, self.budget + rate * elapsed);
        self.last_refill = now;
        self.budget > 0.0
    }

    /// When the rate budget turns positive again, if it is spent.
    pub fn next_send_time(&self) -> Option<Instant> {
        let rate = self.rate?;
        if self.budget > 0.0 {
            return None;
        }
        let wait = (1.0 - self.budget) / rate;
        Some(self.last_refill + Duration::from_secs_f64(wait))
    }

    /// Record a packet carrying `size` bytes of data. Returns its packet number.
    pub fn on_sent(&mut self, size: usize) -> u64 {
        self.packets_sent += 1;
        self.avg_packet_size = 0.875 * self.avg_packet_size + 0.125 * size as f64;
        match self.rate {
            None => self.slow_start_sent += size,
            Some(_) => self.budget -= size as f64,
        }
        self.packets_sent
    }

    /// Acknowledgements freed `acked` bytes at `now`.
    pub fn on_ack(&mut self, acked: usize, rtt: Duration, now: Instant) {
        self.delivery.on_ack(acked, now);
        let Some(rate) = self.rate else {
            self.window = self.slow_start_sent.max(MIN_CONGESTION_WINDOW);
            if self.window >= MAX_CONGESTION_WINDOW {
                self.window = MAX_CONGESTION_WINDOW;
                self.end_slow_start(now);
            }
            return;
        };

        let mut inc = 1.0;
        if let Some(capacity) = self.delivery.peak().filter(|&c| c > rate) {
            let gap_bits = (capacity - rate) * 8.0;
            inc = f64::max(10f64.powf(gap_bits.log10().ceil()) * 0.000_001_5, 1.0);
        }
        // `inc` packets per second per acknowledgement.
        self.rate = Some(rate + inc * self.avg_packet_size);

        if let Some(delivery) = self.delivery.median() {
            let window = delivery * (rtt + self.tick).as_secs_f64() + 10.0 * 1024.0;
            self.window = (window as usize).clamp(MIN_CONGESTION_WINDOW, MAX_CONGESTION_WINDOW);
        }
    }

    /// A retransmission found packet `packet` lost.
    pub fn on_loss(&mut self, packet: u64, now: Instant) {
        if self.rate.is_none() {
            if self.delivery.median().is_some() {
                self.end_slow_start(now);
            }
            return;
        }
        if self.last_dec_packet.is_none_or(|last| packet > last) {
            self.decrease();
            self.avg_loss_count = 0.875 * self.avg_loss_count + 0.125 * self.loss_count as f64;
            self.loss_count = 1;
            let spread = self.avg_loss_count.floor() as u32 + 1;
            self.dec_random = self.rng.gen_range(1..=spread);
            self.dec_count = 1;
            self.last_dec_packet = Some(self.packets_sent);
        } else {
            if self.dec_count <= MAX_RATE_DECREASES
                && self.loss_count == self.dec_count * self.dec_random
            {
                self.decrease();
                self.dec_count += 1;
                self.last_dec_packet = Some(self.packets_sent);
            }
            self.loss_count += 1;
        }
    }

    /// Retransmission timed out again without any acknowledgement.
    pub fn on_timeout(&mut self) {
        if let Some(rate) = self.rate {
            self.rate = Some(f64::max(rate / 2.0, MIN_SENDING_RATE));
        }
    }

    fn end_slow_start(&mut self, now: Instant) {
        let rate = self.delivery.median().unwrap_or(MIN_SENDING_RATE);
        self.rate = Some(rate.max(MIN_SENDING_RATE));
        self.budget = self.avg_packet_size;
        self.last_refill = now;
    }

    fn decrease(&mut self) {
        if let Some(rate) = self.rate {
            self.rate = Some(f64::max(rate / SENDING_RATE_DECREASE, MIN_SENDING_RATE));
        }
    }
}

/// Token bucket capping outbound datagrams per second for a whole socket.
///
/// The bucket holds at most a tenth of a second's worth of tokens (and at
/// least one), so within any window of `t` seconds no more than
/// `rate * t + burst` datagrams leave.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    rate: u32,
    burst: f64,
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    /// Create a limiter of `rate` datagrams per second. Zero means unlimited.
    pub fn new(rate: u32, now: Instant) -> Self {
        let burst = f64::max(1.0, (rate as f64 / 10.0).floor());
        Self {
            rate,
            burst,
            tokens: burst,
            last_refill: now,
        }
    }

    /// Whether the limiter is disabled.
    pub fn is_unlimited(&self) -> bool {
        self.rate == 0
    }

    /// Refill and report whether a datagram may be sent at `now`.
    pub fn ready(&mut self, now: Instant) -> bool {
        if self.is_unlimited() {
            return true;
        }
        self.refill(now);
        self.tokens >= 1.0
    }

    /// Spend one token. Call only after [`ready`](Self::ready) returned true.
    pub fn consume(&mut self) {
        if !self.is_unlimited() {
            self.tokens = f64::max(0.0, self.tokens - 1.0);
        }
    }

    /// When the next token becomes available, if the bucket is empty.
    pub fn next_ready(&self) -> Option<Instant> {
        if self.is_unlimited() || self.tokens >= 1.0 {
            return None;
        }
        let missing = 1.0 - self.tokens;
        Some(self.last_refill + Duration::from_secs_f64(missing / self.rate as f64))
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.tokens = f64::min(self.burst, self.tokens + elapsed.as_secs_f64() * self.rate as f64);
        self.last_refill = now;
    }
}

/// Fabricated packet loss applied to outbound datagrams.
#[derive(Debug, Clone)]
pub struct PacketDropper {
    rate: f64,
    rng: StdRng,
}

impl PacketDropper {
    /// Drop each datagram with probability `rate`, seeded from the OS.
    pub fn new(rate: f64) -> Self {
        Self {
            rate,
            rng: StdRng::from_entropy(),
        }
    }

    /// Deterministic dropper for tests and simulations.
    pub fn with_seed(rate: f64, seed: u64) -> Self {
        Self {
            rate,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Decide the fate of the next datagram.
    pub fn should_drop(&mut self) -> bool {
        if self.rate <= 0.0 {
            false
        } else if self.rate >= 1.0 {
            true
        } else {
            self.rng.gen_bool(self.rate)
        }
    }
}
