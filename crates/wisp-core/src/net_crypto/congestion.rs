//! AIMD congestion control with an RTT-derived retransmission timer.
//!
//! The window counts packets, not bytes: every lossless packet occupies
//! one send buffer slot until acknowledged. The window grows by
//! `additive_increase` packets per round trip and shrinks by
//! `decrease_factor` at most once per round trip when loss is seen.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::error::ConfigError;
use std::time::{Duration, Instant};

/// Maximum number of RTT samples kept for the minimum filter
const RTT_WINDOW_SIZE: usize = 16;

/// Congestion control constants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CongestionConfig {
    /// Window at connection start (packets)
    pub initial_window: f64,
    /// Window never shrinks below this
    pub min_window: f64,
    /// Window never grows beyond this
    pub max_window: f64,
    /// Packets added per round trip without loss
    pub additive_increase: f64,
    /// Multiplier applied on loss
    pub decrease_factor: f64,
    /// RTT assumed before the first sample (milliseconds)
    pub initial_rtt_ms: u64,
    /// Retransmission timeout floor (milliseconds)
    pub rto_min_ms: u64,
    /// Retransmission timeout ceiling (milliseconds)
    pub rto_max_ms: u64,
    /// Timeout multiplier per consecutive retransmission
    pub backoff_factor: f64,
}

impl Default for CongestionConfig {
    fn default() -> Self {
        Self {
            initial_window: 16.0,
            min_window: 4.0,
            max_window: 1024.0,
            additive_increase: 1.0,
            decrease_factor: 0.5,
            initial_rtt_ms: 500,
            rto_min_ms: 200,
            rto_max_ms: 8_000,
            backoff_factor: 2.0,
        }
    }
}

impl CongestionConfig {
    /// Check the constants are usable.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if !(self.min_window >= 1.0) {
            return invalid("congestion.min_window must be at least 1");
        }
        if self.min_window > self.max_window {
            return invalid("congestion.min_window exceeds max_window");
        }
        if !(self.min_window..=self.max_window).contains(&self.initial_window) {
            return invalid("congestion.initial_window outside [min_window, max_window]");
        }
        if !(self.additive_increase > 0.0) {
            return invalid("congestion.additive_increase must be positive");
        }
        if !(self.decrease_factor > 0.0 && self.decrease_factor < 1.0) {
            return invalid("congestion.decrease_factor must be in (0, 1)");
        }
        if !(self.backoff_factor >= 1.0) {
            return invalid("congestion.backoff_factor must be at least 1");
        }
        if self.rto_min_ms == 0 || self.rto_min_ms > self.rto_max_ms {
            return invalid("congestion.rto_min_ms must be in (0, rto_max_ms]");
        }
        Ok(())
    }

    fn rto_min(&self) -> Duration {
        Duration::from_millis(self.rto_min_ms)
    }

    fn rto_max(&self) -> Duration {
        Duration::from_millis(self.rto_max_ms)
    }
}

/// Per-connection congestion state
#[derive(Debug, Clone)]
pub struct Congestion {
    config: CongestionConfig,
    /// Congestion window (packets)
    cwnd: f64,
    /// Smoothed RTT, `None` before the first sample
    srtt: Option<Duration>,
    /// RTT variance
    rttvar: Duration,
    /// Recent samples for the minimum filter
    rtt_samples: VecDeque<Duration>,
    /// Consecutive retransmission timeouts
    backoff: u32,
    /// Last window decrease, for once-per-RTT shrinking
    last_decrease: Option<Instant>,
    /// Packets sent and not yet acknowledged or declared lost
    in_flight: usize,
}

impl Congestion {
    /// Fresh state from `config`
    #[must_use]
    pub fn new(config: CongestionConfig) -> Self {
        Self {
            cwnd: config.initial_window,
            srtt: None,
            rttvar: Duration::ZERO,
            rtt_samples: VecDeque::with_capacity(RTT_WINDOW_SIZE),
            backoff: 0,
            last_decrease: None,
            in_flight: 0,
            config,
        }
    }

    /// Update `RTT` estimate with new sample (RFC 6298 smoothing)
    pub fn update_rtt(&mut self, sample: Duration) {
        self.rtt_samples.push_back(sample);
        if self.rtt_samples.len() > RTT_WINDOW_SIZE {
            self.rtt_samples.pop_front();
        }

        match self.srtt {
            None => {
                self.srtt = Some(sample);
                self.rttvar = sample / 2;
            }
            Some(srtt) => {
                let delta = srtt.abs_diff(sample);
                self.rttvar = (self.rttvar * 3 + delta) / 4;
                self.srtt = Some((srtt * 7 + sample) / 8);
            }
        }
    }

    /// Smoothed round-trip time
    #[must_use]
    pub fn rtt(&self) -> Duration {
        self.srtt
            .unwrap_or(Duration::from_millis(self.config.initial_rtt_ms))
    }

    /// Smallest recent RTT sample
    #[must_use]
    pub fn min_rtt(&self) -> Option<Duration> {
        self.rtt_samples.iter().min().copied()
    }

    /// Retransmission timeout including backoff
    #[must_use]
    pub fn rto(&self) -> Duration {
        let base = match self.srtt {
            Some(srtt) => srtt + (self.rttvar * 4).max(Duration::from_millis(1)),
            None => Duration::from_millis(self.config.initial_rtt_ms) * 2,
        };
        let factor = self.config.backoff_factor.powi(self.backoff.min(16) as i32);
        base.mul_f64(factor)
            .clamp(self.config.rto_min(), self.config.rto_max())
    }

    /// Congestion window in packets
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn window(&self) -> usize {
        self.cwnd.floor() as usize
    }

    /// Packets counted as in flight
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Whether another packet fits in the window
    #[must_use]
    pub fn can_send(&self) -> bool {
        self.in_flight < self.window()
    }

    /// Consecutive timeouts without progress
    #[must_use]
    pub fn backoff(&self) -> u32 {
        self.backoff
    }

    /// Called when a new packet is sent
    pub fn on_packet_sent(&mut self) {
        self.in_flight += 1;
    }

    /// Called when a packet is acknowledged. `rtt` is `None` for packets
    /// that were retransmitted, whose samples are ambiguous.
    #[allow(clippy::cast_precision_loss)]
    pub fn on_packet_acked(&mut self, rtt: Option<Duration>) {
        self.in_flight = self.in_flight.saturating_sub(1);
        if let Some(sample) = rtt {
            self.update_rtt(sample);
        }
        self.backoff = 0;
        self.cwnd = (self.cwnd + self.config.additive_increase / self.cwnd)
            .min(self.config.max_window);
    }

    /// Called when loss is detected. Shrinks the window once per RTT.
    pub fn on_packet_lost(&mut self, now: Instant) {
        let recent = self
            .last_decrease
            .is_some_and(|at| now.saturating_duration_since(at) < self.rtt());
        if recent {
            return;
        }
        self.last_decrease = Some(now);
        self.cwnd = (self.cwnd * self.config.decrease_factor).max(self.config.min_window);
        tracing::trace!("congestion window reduced to {:.1}", self.cwnd);
    }

    /// Called when the retransmission timer fires
    pub fn on_timeout(&mut self, now: Instant) {
        self.on_packet_lost(now);
        self.backoff = self.backoff.saturating_add(1);
    }
}
