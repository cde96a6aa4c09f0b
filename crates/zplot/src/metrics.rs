use axum::{response::IntoResponse, routing::get, Router};
use prometheus::{
    Encoder, Gauge, Histogram, IntCounter, IntCounterVec, IntGauge, Registry, TextEncoder,
};

/// Every counted condition of the pipeline.
///
/// Wrapped in an `Arc` and shared by the ingestion, rendering and control
/// contexts. Counters here are the "recoverable" half of error handling:
/// dropped data is counted and logged, never propagated.
pub struct Metrics {
    pub registry: Registry,
    /// Datagrams read from the socket, before any filtering.
    pub datagrams_received_total: IntCounter,
    /// Datagrams discarded because the sender is not allow-listed.
    pub datagrams_unknown_source_total: IntCounter,
    /// Datagrams dropped because the raw-packet queue was full.
    pub raw_packets_dropped_total: IntCounter,
    pub packets_accepted_total: IntCounter,
    pub packets_rejected_total: IntCounterVec,
    pub photons_decoded_total: IntCounter,
    /// Photons dropped because the transport queue was full.
    pub transport_dropped_total: IntCounter,
    pub photons_plotted_total: IntCounter,
    pub photons_out_of_bounds_total: IntCounter,
    pub render_ticks_total: IntCounter,
    pub render_duration_seconds: Histogram,
    pub screen_clears_total: IntCounter,
    pub screenshots_total: IntCounter,
    pub screenshot_failures_total: IntCounter,
    pub display_gain: Gauge,
    pub encoder_value: IntGauge,
    pub transport_queue_depth: IntGauge,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new_custom(Some("zplot".into()), None)
            .expect("Failed to create custom metrics registry");

        macro_rules! reg {
            ($metric:expr) => {{
                let collector = $metric;
                registry
                    .register(Box::new(collector.clone()))
                    .expect("Failed to register metric");
                collector
            }};
        }

        Self {
            datagrams_received_total: reg!(IntCounter::new(
                "datagrams_received_total",
                "Datagrams read from the UDP socket"
            )
            .unwrap()),
            datagrams_unknown_source_total: reg!(IntCounter::new(
                "datagrams_unknown_source_total",
                "Datagrams discarded because the sender is not allow-listed"
            )
            .unwrap()),
            raw_packets_dropped_total: reg!(IntCounter::new(
                "raw_packets_dropped_total",
                "Datagrams dropped because the raw packet queue was full"
            )
            .unwrap()),
            packets_accepted_total: reg!(IntCounter::new(
                "packets_accepted_total",
                "Photon packets accepted by the decoder"
            )
            .unwrap()),
            packets_rejected_total: reg!(IntCounterVec::new(
                prometheus::Opts::new(
                    "packets_rejected_total",
                    "Photon packets rejected by the decoder"
                ),
                &["reason"]
            )
            .unwrap()),
            photons_decoded_total: reg!(IntCounter::new(
                "photons_decoded_total",
                "Photon events decoded from accepted packets"
            )
            .unwrap()),
            transport_dropped_total: reg!(IntCounter::new(
                "transport_dropped_total",
                "Photon events dropped because the transport queue was full"
            )
            .unwrap()),
            photons_plotted_total: reg!(IntCounter::new(
                "photons_plotted_total",
                "Photon events accumulated into the image"
            )
            .unwrap()),
            photons_out_of_bounds_total: reg!(IntCounter::new(
                "photons_out_of_bounds_total",
                "Photon events whose screen coordinates fell outside the device"
            )
            .unwrap()),
            render_ticks_total: reg!(IntCounter::new(
                "render_ticks_total",
                "Completed framebuffer blits"
            )
            .unwrap()),
            render_duration_seconds: reg!(Histogram::with_opts(
                prometheus::HistogramOpts::new(
                    "render_duration_seconds",
                    "Time spent rendering and blitting one frame"
                )
                .buckets(prometheus::exponential_buckets(0.0005, 2.0, 12).unwrap())
            )
            .unwrap()),
            screen_clears_total: reg!(IntCounter::new(
                "screen_clears_total",
                "Clear actions applied"
            )
            .unwrap()),
            screenshots_total: reg!(IntCounter::new(
                "screenshots_total",
                "Screenshots written to disk"
            )
            .unwrap()),
            screenshot_failures_total: reg!(IntCounter::new(
                "screenshot_failures_total",
                "Screenshots that could not be written"
            )
            .unwrap()),
            display_gain: reg!(Gauge::new("display_gain", "Current display gain").unwrap()),
            encoder_value: reg!(IntGauge::new(
                "encoder_value",
                "Current rotary encoder value"
            )
            .unwrap()),
            transport_queue_depth: reg!(IntGauge::new(
                "transport_queue_depth",
                "Photon events waiting in the transport queue at the last render tick"
            )
            .unwrap()),
            registry,
        }
    }

    pub fn router(&self) -> Router {
        let reg = self.registry.clone();
        Router::new().route(
            "/metrics",
            get(move || {
                let reg = reg.clone();
                async move {
                    let mf = reg.gather();
                    let mut buf = Vec::new();
                    if let Err(e) = TextEncoder::new().encode(&mf, &mut buf) {
                        tracing::warn!(error = %e, "Failed to encode metrics");
                    }
                    String::from_utf8_lossy(&buf).into_owned().into_response()
                }
            }),
        )
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
