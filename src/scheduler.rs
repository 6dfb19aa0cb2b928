//! Periodic feedback timing and the bitrate-adaptive send interval.

use crate::config::ProxyConfig;

/// Estimated wire cost of one feedback report:
/// IPv4 (20 B) + UDP (8 B) + SRTP (10 B) + average report body (30 B).
const TWCC_REPORT_SIZE_BYTES: f64 = 20.0 + 8.0 + 10.0 + 30.0;

/// Returned by [`FeedbackScheduler::time_until_next_process`] while periodic
/// feedback is disabled: wait a day until the next process call.
pub const PROCESS_INTERVAL_WHEN_DISABLED_MS: i64 = 24 * 60 * 60 * 1000;

/// Decides when periodic feedback is due and adapts the send interval so
/// reports consume a configured fraction of the observed bitrate.
pub struct FeedbackScheduler {
    min_interval_ms: i64,
    max_interval_ms: i64,
    bandwidth_fraction: f64,
    send_interval_ms: i64,
    last_process_time_ms: i64,
    send_periodic_feedback: bool,
}

impl FeedbackScheduler {
    pub fn new(config: &ProxyConfig) -> Self {
        Self {
            min_interval_ms: config.min_interval_ms,
            max_interval_ms: config.max_interval_ms,
            bandwidth_fraction: config.bandwidth_fraction,
            send_interval_ms: config.default_interval_ms,
            last_process_time_ms: -1,
            send_periodic_feedback: true,
        }
    }

    pub fn send_periodic_feedback(&self) -> bool {
        self.send_periodic_feedback
    }

    pub fn set_send_periodic_feedback(&mut self, enabled: bool) {
        self.send_periodic_feedback = enabled;
    }

    pub fn send_interval_ms(&self) -> i64 {
        self.send_interval_ms
    }

    /// Milliseconds until the next process call is due.
    pub fn time_until_next_process(&self, now_ms: i64) -> i64 {
        if !self.send_periodic_feedback {
            return PROCESS_INTERVAL_WHEN_DISABLED_MS;
        }
        if self.last_process_time_ms != -1 {
            let elapsed = now_ms - self.last_process_time_ms;
            if elapsed < self.send_interval_ms {
                return self.send_interval_ms - elapsed;
            }
        }
        0
    }

    pub fn on_process(&mut self, now_ms: i64) {
        self.last_process_time_ms = now_ms;
    }

    /// Recompute the send interval so feedback occupies
    /// `bandwidth_fraction` of `bitrate_bps`, clamped to the rate band the
    /// configured interval bounds allow.
    pub fn on_bitrate_changed(&mut self, bitrate_bps: i64) {
        let report_bits_per_interval = TWCC_REPORT_SIZE_BYTES * 8.0 * 1000.0;
        let min_rate = report_bits_per_interval / self.max_interval_ms as f64;
        let max_rate = report_bits_per_interval / self.min_interval_ms as f64;

        let rate = (self.bandwidth_fraction * bitrate_bps as f64).clamp(min_rate, max_rate);
        self.send_interval_ms = (0.5 + report_bits_per_interval / rate) as i64;
    }
}
