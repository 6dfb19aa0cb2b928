//! Receiver-side transport feedback engine for a realtime media transport
//! stack.
//!
//! The engine observes arriving media packets carrying a transport-wide
//! sequence number extension, keeps a bounded sliding record of per-packet
//! arrival times, and periodically (or on explicit request) packs those
//! arrivals into transport feedback reports for the sender's congestion
//! controller, following
//! <https://datatracker.ietf.org/doc/html/draft-holmer-rmcat-transport-wide-cc-extensions-01>.
//!
//! Two auxiliary streams ride along: a pluggable bandwidth predictor is
//! consulted per packet and its latest estimate shipped back at a throttled
//! cadence, and per-packet statistics are exported to an external telemetry
//! store with bounded-retry recovery.
//!
//! The clock, feedback sender, predictor and telemetry store are capability
//! traits; see [`EstimatorProxy`] for the composition.

#![warn(rust_2018_idioms)]

pub mod arrival_map;
pub mod bwe;
pub mod config;
pub mod error;
mod feedback;
pub mod marshal;
pub mod proxy;
pub mod scheduler;
pub mod sequence;
pub mod telemetry;
pub mod transport_feedback;

pub use bwe::{ApplicationPacket, BandwidthPredictor, BweMessage, PacketRecord};
pub use config::ProxyConfig;
pub use proxy::{Clock, EstimatorProxy, FeedbackRequest, FeedbackSender, RtpHeaderInfo, SystemClock};
pub use telemetry::{SaveOutcome, SessionKind, StatsRecord, TelemetryStore};
pub use transport_feedback::TransportFeedback;
