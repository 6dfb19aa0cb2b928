//! Construction-time configuration snapshot for the feedback engine.

/// Configuration captured when the proxy is built. Never re-read at runtime.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Feedback send interval before any bitrate has been observed.
    pub default_interval_ms: i64,
    /// Lower bound for the adaptive feedback interval.
    pub min_interval_ms: i64,
    /// Upper bound for the adaptive feedback interval.
    pub max_interval_ms: i64,
    /// Fraction of the observed bitrate feedback reports may occupy.
    pub bandwidth_fraction: f64,
    /// Minimum age before a superseded window entry may be culled.
    pub back_window_ms: i64,
    /// Minimum spacing between bandwidth-estimate sendback messages.
    pub bwe_feedback_duration_ms: i64,
    /// Minimum spacing between telemetry store flushes.
    pub redis_update_duration_ms: i64,
    /// Telemetry store endpoint.
    pub redis_ip: String,
    pub redis_port: u16,
    /// Telemetry session identifier.
    pub redis_sid: String,
    /// Model path handed to the bandwidth predictor at bootstrap.
    pub onnx_model_path: String,
    /// SSRC stamped on outgoing feedback packets.
    pub sender_ssrc: u32,
    /// Retry bound for a failing telemetry flush.
    pub telemetry_retries: u32,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            default_interval_ms: 100,
            min_interval_ms: 50,
            max_interval_ms: 250,
            bandwidth_fraction: 0.05,
            back_window_ms: 500,
            bwe_feedback_duration_ms: 200,
            redis_update_duration_ms: 20,
            redis_ip: "127.0.0.1".to_string(),
            redis_port: 6379,
            redis_sid: String::new(),
            onnx_model_path: String::new(),
            sender_ssrc: rand::random(),
            telemetry_retries: 3,
        }
    }
}

impl ProxyConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_interval_ms(mut self, ms: i64) -> Self {
        self.default_interval_ms = ms;
        self
    }

    pub fn with_interval_bounds_ms(mut self, min_ms: i64, max_ms: i64) -> Self {
        self.min_interval_ms = min_ms;
        self.max_interval_ms = max_ms;
        self
    }

    pub fn with_bandwidth_fraction(mut self, fraction: f64) -> Self {
        self.bandwidth_fraction = fraction;
        self
    }

    pub fn with_back_window_ms(mut self, ms: i64) -> Self {
        self.back_window_ms = ms;
        self
    }

    pub fn with_bwe_feedback_duration_ms(mut self, ms: i64) -> Self {
        self.bwe_feedback_duration_ms = ms;
        self
    }

    pub fn with_redis_update_duration_ms(mut self, ms: i64) -> Self {
        self.redis_update_duration_ms = ms;
        self
    }

    pub fn with_redis_endpoint(mut self, ip: &str, port: u16) -> Self {
        self.redis_ip = ip.to_string();
        self.redis_port = port;
        self
    }

    pub fn with_redis_sid(mut self, sid: &str) -> Self {
        self.redis_sid = sid.to_string();
        self
    }

    pub fn with_onnx_model_path(mut self, path: &str) -> Self {
        self.onnx_model_path = path.to_string();
        self
    }

    pub fn with_sender_ssrc(mut self, ssrc: u32) -> Self {
        self.sender_ssrc = ssrc;
        self
    }

    pub fn with_telemetry_retries(mut self, retries: u32) -> Self {
        self.telemetry_retries = retries;
        self
    }
}
