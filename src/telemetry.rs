//! Per-packet statistics export to an external telemetry store.

use log::error;

/// Placeholder pacing rate for rows collected while no bandwidth estimate was
/// sent back with the packet.
pub const PACING_RATE_EMPTY: f64 = -1.0;
/// Placeholder padding rate, see [`PACING_RATE_EMPTY`].
pub const PADDING_RATE_EMPTY: f64 = -1.0;

/// How collected rows are keyed in the store session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum SessionKind {
    Struct,
}

/// Result of a telemetry store operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Ok,
    ConnectError,
    SessionError,
    TypeError,
    Other,
}

/// One telemetry row, written for every received media packet.
#[derive(Debug, Clone, PartialEq)]
pub struct StatsRecord {
    pub pacing_rate: f64,
    pub padding_rate: f64,
    pub payload_type: u8,
    pub sequence_number: u16,
    pub send_time_ms: u32,
    pub ssrc: u32,
    pub padding_length: usize,
    pub header_length: usize,
    pub arrival_time_ms: i64,
    pub payload_size: usize,
    pub loss_count: i64,
}

/// External statistics store.
///
/// `collect` buffers rows locally; `save` pushes the buffer to the remote
/// service. Implementations must not call back into the proxy: they are
/// invoked while the proxy lock is held.
pub trait TelemetryStore: Send {
    fn connect(&mut self, ip: &str, port: u16) -> SaveOutcome;
    fn set_config(&mut self, session_id: &str, kind: SessionKind) -> SaveOutcome;
    fn collect(&mut self, record: &StatsRecord);
    fn save(&mut self) -> SaveOutcome;
    fn close(&mut self);
}

/// Drives a [`TelemetryStore`] with the configured endpoint and session,
/// recovering from transient failures with a bounded number of retries.
pub(crate) struct TelemetryPipeline {
    store: Box<dyn TelemetryStore>,
    ip: String,
    port: u16,
    session_id: String,
    kind: SessionKind,
    max_retries: u32,
}

impl TelemetryPipeline {
    pub(crate) fn new(
        mut store: Box<dyn TelemetryStore>,
        ip: String,
        port: u16,
        session_id: String,
        max_retries: u32,
    ) -> Self {
        let kind = SessionKind::Struct;
        if store.connect(&ip, port) != SaveOutcome::Ok {
            error!("telemetry store connect to {ip}:{port} failed");
        }
        if store.set_config(&session_id, kind) != SaveOutcome::Ok {
            error!("telemetry store session config failed");
        }
        Self {
            store,
            ip,
            port,
            session_id,
            kind,
            max_retries,
        }
    }

    pub(crate) fn collect(&mut self, record: &StatsRecord) {
        self.store.collect(record);
    }

    /// Push buffered rows to the store. On failure, reconnect or reconfigure
    /// depending on the outcome and try again, up to the retry bound.
    pub(crate) fn flush(&mut self) {
        let mut retries_left = self.max_retries;
        loop {
            let outcome = self.store.save();
            if outcome == SaveOutcome::Ok {
                return;
            }
            if retries_left == 0 {
                error!("can not save packet stats to telemetry store");
                return;
            }
            retries_left -= 1;
            match outcome {
                SaveOutcome::ConnectError => {
                    self.store.connect(&self.ip, self.port);
                }
                SaveOutcome::SessionError | SaveOutcome::TypeError => {
                    self.store.set_config(&self.session_id, self.kind);
                }
                _ => {}
            }
        }
    }

    pub(crate) fn close(&mut self) {
        self.store.close();
    }
}
