//! Top-level feedback engine: observes arriving media packets and ships
//! transport feedback, bandwidth-estimate messages and telemetry.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use log::{error, info, warn};

use crate::arrival_map::ArrivalTimeMap;
use crate::bwe::{
    ApplicationPacket, BWE_MESSAGE_NAME, BWE_MESSAGE_SUB_TYPE, BandwidthPredictor, BweMessage,
    PacketRecord,
};
use crate::config::ProxyConfig;
use crate::feedback::build_feedback_packet;
use crate::marshal::Marshal;
use crate::scheduler::FeedbackScheduler;
use crate::sequence::{AbsSendTimeTracker, SequenceUnwrapper};
use crate::telemetry::{
    PACING_RATE_EMPTY, PADDING_RATE_EMPTY, StatsRecord, TelemetryPipeline, TelemetryStore,
};
use crate::transport_feedback::TransportFeedback;

/// The largest accepted arrival timestamp. Lower than the numerical limit
/// since arrival times are converted to microseconds.
const MAX_TIME_MS: i64 = i64::MAX / 1000;

/// Source of wall-clock time, monotonic per session.
pub trait Clock: Send + Sync {
    fn time_in_ms(&self) -> i64;
}

/// [`Clock`] counting milliseconds since its construction.
pub struct SystemClock {
    start: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn time_in_ms(&self) -> i64 {
        self.start.elapsed().as_millis() as i64
    }
}

/// Ships fully-built feedback to the sender.
///
/// Both operations are invoked while the proxy lock is held; implementations
/// must not call back into the proxy.
pub trait FeedbackSender: Send + Sync {
    fn send_transport_feedback(&self, packet: &TransportFeedback);
    fn send_application_packet(&self, packet: &ApplicationPacket);
}

/// Explicit feedback request attached to a received packet, asking for an
/// immediate report over the most recent `sequence_count` sequence numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedbackRequest {
    pub include_timestamps: bool,
    pub sequence_count: u16,
}

/// What the engine reads from a received media packet's header.
#[derive(Debug, Clone, Default)]
pub struct RtpHeaderInfo {
    pub ssrc: u32,
    pub payload_type: u8,
    /// Media-level RTP sequence number.
    pub sequence_number: u16,
    pub padding_length: usize,
    pub header_length: usize,
    /// Transport-wide sequence number extension, when present.
    pub transport_sequence: Option<u16>,
    /// 24-bit absolute send time extension, when present.
    pub abs_send_time: Option<u32>,
    pub feedback_request: Option<FeedbackRequest>,
}

struct Inner {
    config: ProxyConfig,
    scheduler: FeedbackScheduler,
    unwrapper: SequenceUnwrapper,
    abs_send_time: AbsSendTimeTracker,
    arrival_times: ArrivalTimeMap,
    /// First sequence number the next periodic feedback will include.
    periodic_window_start_seq: Option<i64>,
    media_ssrc: u32,
    feedback_packet_count: u8,
    predictor: Option<Box<dyn BandwidthPredictor>>,
    telemetry: TelemetryPipeline,
    last_bwe_sendback_ms: i64,
    last_telemetry_save_ms: i64,
    missing_extension_warned: bool,
}

/// Receiver-side transport feedback engine.
///
/// Tracks arrival times of packets carrying a transport-wide sequence number,
/// periodically packs them into transport feedback for the sender's
/// congestion controller, ferries the bandwidth predictor's estimate back at
/// a throttled cadence, and exports per-packet statistics to a telemetry
/// store.
///
/// All state lives behind one mutex; entry points may be called from any
/// thread.
pub struct EstimatorProxy {
    clock: Arc<dyn Clock>,
    feedback_sender: Arc<dyn FeedbackSender>,
    inner: Mutex<Inner>,
}

impl EstimatorProxy {
    /// Build the engine around its collaborators. A missing predictor is
    /// tolerated: estimate sendback stays off and everything else runs.
    pub fn new(
        clock: Arc<dyn Clock>,
        feedback_sender: Arc<dyn FeedbackSender>,
        predictor: Option<Box<dyn BandwidthPredictor>>,
        telemetry_store: Box<dyn TelemetryStore>,
        config: ProxyConfig,
    ) -> Self {
        if predictor.is_none() {
            error!("bandwidth predictor unavailable, estimate sendback disabled");
        }
        info!(
            "maximum interval between transport feedback RTCP messages (ms): {}",
            config.max_interval_ms
        );
        let telemetry = TelemetryPipeline::new(
            telemetry_store,
            config.redis_ip.clone(),
            config.redis_port,
            config.redis_sid.clone(),
            config.telemetry_retries,
        );
        let now = clock.time_in_ms();
        let scheduler = FeedbackScheduler::new(&config);
        Self {
            clock,
            feedback_sender,
            inner: Mutex::new(Inner {
                config,
                scheduler,
                unwrapper: SequenceUnwrapper::new(),
                abs_send_time: AbsSendTimeTracker::new(),
                arrival_times: ArrivalTimeMap::new(),
                periodic_window_start_seq: None,
                media_ssrc: 0,
                feedback_packet_count: 0,
                predictor,
                telemetry,
                last_bwe_sendback_ms: now,
                last_telemetry_save_ms: now,
                missing_extension_warned: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Handle one received media packet.
    pub fn incoming_packet(&self, arrival_time_ms: i64, payload_size: usize, header: &RtpHeaderInfo) {
        let mut inner = self.lock();
        let Some(transport_sequence) = header.transport_sequence else {
            if !inner.missing_extension_warned {
                warn!("incoming packet is missing the transport sequence number extension");
                inner.missing_extension_warned = true;
            }
            return;
        };
        inner.media_ssrc = header.ssrc;
        self.on_packet_arrival(
            &mut inner,
            transport_sequence,
            arrival_time_ms,
            header.feedback_request,
        );

        let send_time_ms = match header.abs_send_time {
            Some(abs_send_time) => inner.abs_send_time.to_millis(abs_send_time),
            None => 0,
        };
        let record = PacketRecord {
            payload_type: header.payload_type,
            sequence_number: header.sequence_number,
            send_time_ms,
            ssrc: header.ssrc,
            padding_length: header.padding_length,
            header_length: header.header_length,
            arrival_time_ms,
            payload_size,
            loss_count: -1,
            rtt_ms: -1,
        };
        if let Some(predictor) = inner.predictor.as_mut() {
            predictor.on_received(&record);
        }

        let now = self.clock.time_in_ms();
        let estimate = self.maybe_send_bwe_estimate(&mut inner, now);

        let (pacing_rate, padding_rate) = match estimate {
            Some(estimate) => (estimate as f64, estimate as f64),
            None => (PACING_RATE_EMPTY, PADDING_RATE_EMPTY),
        };
        inner.telemetry.collect(&StatsRecord {
            pacing_rate,
            padding_rate,
            payload_type: header.payload_type,
            sequence_number: header.sequence_number,
            send_time_ms,
            ssrc: header.ssrc,
            padding_length: header.padding_length,
            header_length: header.header_length,
            arrival_time_ms,
            payload_size,
            loss_count: 0,
        });
        if now - inner.last_telemetry_save_ms > inner.config.redis_update_duration_ms {
            inner.last_telemetry_save_ms = now;
            inner.telemetry.flush();
        }
    }

    /// Milliseconds until [`process`](Self::process) should next run.
    pub fn time_until_next_process(&self) -> i64 {
        let inner = self.lock();
        inner.scheduler.time_until_next_process(self.clock.time_in_ms())
    }

    /// Emit all pending periodic feedback.
    pub fn process(&self) {
        let mut inner = self.lock();
        if !inner.scheduler.send_periodic_feedback() {
            return;
        }
        let now = self.clock.time_in_ms();
        inner.scheduler.on_process(now);
        self.send_periodic_feedbacks(&mut inner);
    }

    /// Adapt the feedback interval to the observed bitrate.
    pub fn on_bitrate_changed(&self, bitrate_bps: i64) {
        self.lock().scheduler.on_bitrate_changed(bitrate_bps);
    }

    pub fn set_send_periodic_feedback(&self, enabled: bool) {
        self.lock().scheduler.set_send_periodic_feedback(enabled);
    }

    /// The proxy only ferries the predictor's estimates to the sender; it
    /// never holds an estimate of its own.
    pub fn latest_estimate(&self) -> Option<u32> {
        None
    }

    fn on_packet_arrival(
        &self,
        inner: &mut Inner,
        sequence_number: u16,
        arrival_time_ms: i64,
        feedback_request: Option<FeedbackRequest>,
    ) {
        if !(0..=MAX_TIME_MS).contains(&arrival_time_ms) {
            warn!("arrival time out of bounds: {arrival_time_ms}");
            return;
        }

        let seq = inner.unwrapper.unwrap(sequence_number);

        if inner.scheduler.send_periodic_feedback() {
            if let Some(window_start) = inner.periodic_window_start_seq
                && !inner.arrival_times.has_at_or_after(window_start)
            {
                // The previous window has been fully reported. Cull entries
                // preceding the new packet that have aged out of the back
                // window; young retransmits stay eligible for re-report.
                inner
                    .arrival_times
                    .remove_old_packets(seq, arrival_time_ms - inner.config.back_window_ms);
            }
            if inner.periodic_window_start_seq.is_none_or(|start| seq < start) {
                inner.periodic_window_start_seq = Some(seq);
            }
        }

        // Only the first arrival of a sequence number is interesting.
        if inner.arrival_times.has_received(seq) {
            return;
        }
        inner.arrival_times.add_packet(seq, arrival_time_ms);

        // Limit the range of sequence numbers feedback can refer to.
        if inner.arrival_times.trim_span() && inner.scheduler.send_periodic_feedback() {
            inner.periodic_window_start_seq = inner.arrival_times.min_sequence_number();
        }

        if let Some(request) = feedback_request {
            self.send_feedback_on_request(inner, seq, request);
        }
    }

    fn send_periodic_feedbacks(&self, inner: &mut Inner) {
        // periodic_window_start_seq is the first sequence number to include
        // in the next feedback packet. Older entries may still be in the map
        // in case a reordered packet needs to be reported again.
        let Some(mut window_start) = inner.periodic_window_start_seq else {
            return;
        };
        while inner.arrival_times.has_at_or_after(window_start) {
            let mut packet = TransportFeedback::new(inner.config.sender_ssrc, true);
            let count = inner.feedback_packet_count;
            inner.feedback_packet_count = inner.feedback_packet_count.wrapping_add(1);
            window_start = build_feedback_packet(
                count,
                inner.media_ssrc,
                window_start,
                inner.arrival_times.iter_from(window_start),
                &mut packet,
            );
            inner.periodic_window_start_seq = Some(window_start);
            self.feedback_sender.send_transport_feedback(&packet);
            // Entries are not erased after sending; they age out through the
            // arrival-path culling.
        }
    }

    fn send_feedback_on_request(
        &self,
        inner: &mut Inner,
        sequence_number: i64,
        request: FeedbackRequest,
    ) {
        if request.sequence_count == 0 {
            return;
        }
        let first_sequence_number = sequence_number - request.sequence_count as i64 + 1;
        let mut packet =
            TransportFeedback::new(inner.config.sender_ssrc, request.include_timestamps);
        let count = inner.feedback_packet_count;
        inner.feedback_packet_count = inner.feedback_packet_count.wrapping_add(1);
        build_feedback_packet(
            count,
            inner.media_ssrc,
            first_sequence_number,
            inner
                .arrival_times
                .iter_range(first_sequence_number..=sequence_number),
            &mut packet,
        );
        // On-request feedback trims everything before its window.
        inner.arrival_times.erase_before(first_sequence_number);
        self.feedback_sender.send_transport_feedback(&packet);
    }

    fn maybe_send_bwe_estimate(&self, inner: &mut Inner, now_ms: i64) -> Option<f32> {
        if now_ms - inner.last_bwe_sendback_ms <= inner.config.bwe_feedback_duration_ms {
            return None;
        }
        let estimate = inner.predictor.as_ref()?.get_bwe_estimate();
        inner.last_bwe_sendback_ms = now_ms;

        let bwe = BweMessage {
            pacing_rate: estimate,
            padding_rate: estimate,
            target_rate: estimate,
            timestamp_ms: now_ms,
        };
        if let Ok(data) = bwe.marshal() {
            let packet = ApplicationPacket {
                sub_type: BWE_MESSAGE_SUB_TYPE,
                ssrc: inner.config.sender_ssrc,
                name: BWE_MESSAGE_NAME,
                data,
            };
            self.feedback_sender.send_application_packet(&packet);
        }
        Some(estimate)
    }
}

impl Drop for EstimatorProxy {
    fn drop(&mut self) {
        self.inner
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .telemetry
            .close();
    }
}
