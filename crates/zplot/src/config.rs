use crate::controls::{ControlsConfig, EncoderConfig};
use crate::framebuffer::RenderConfig;
use crate::gain::GainSchedule;
use crate::ingest::{IngestConfig, SenderAllowList, SenderSpec};
use crate::logging::LogFormat;
use clap::{Parser, ValueEnum};
use photon_wire::SequencePolicy;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// `zplot` - live photon-count display for the zero-order detector.
///
/// Receives photon packets from the TDC over UDP, accumulates them into an
/// image and draws it directly into a Linux framebuffer. A rotary encoder
/// adjusts gain; two buttons clear the screen and capture screenshots.
#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct Config {
    /// Log filter used when `RUST_LOG` is not set (e.g. `debug`, `zplot=trace`).
    #[arg(long, env = "ZPLOT_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[arg(long, env = "ZPLOT_LOG_FORMAT", value_enum, default_value_t = LogFormat::Json)]
    pub log_format: LogFormat,

    /// Local UDP endpoint the TDC sends to.
    #[arg(long, env = "ZPLOT_LISTEN_ADDR", default_value = "0.0.0.0:60000")]
    pub listen_addr: SocketAddr,

    /// Allow-listed sender, as `IP` or `name=IP`. Repeat for several senders.
    ///
    /// Datagrams from any other address are discarded.
    #[arg(
        long = "sender",
        env = "ZPLOT_SENDERS",
        value_delimiter = ',',
        default_values = [
            "tdc_0=192.168.1.10",
            "test_0=172.16.0.10",
            "test_1=192.168.1.123",
            "test_2=172.16.0.171",
            "test_3=172.16.1.112",
        ]
    )]
    pub senders: Vec<SenderSpec>,

    /// How packet sequence counters are compared with the last accepted one.
    #[arg(long, env = "ZPLOT_SEQUENCE_POLICY", value_enum, default_value_t = SequenceMode::NonDecreasing)]
    pub sequence_policy: SequenceMode,

    /// Capacity of the queue between the socket and the packet decoder.
    #[arg(long, env = "ZPLOT_RAW_QUEUE_CAPACITY", default_value_t = 1000)]
    pub raw_queue_capacity: usize,

    /// Capacity of the photon queue between ingestion and rendering.
    #[arg(long, env = "ZPLOT_QUEUE_CAPACITY", default_value_t = 65536)]
    pub queue_capacity: usize,

    /// Framebuffer device to draw into.
    #[arg(long, env = "ZPLOT_FB_DEVICE", default_value = "/dev/fb0")]
    pub fb_device: PathBuf,

    /// Screen update period in milliseconds.
    #[arg(long, env = "ZPLOT_UPDATE_MS", default_value_t = 1000)]
    pub update_ms: u64,

    /// Display gain applied to accumulated photon intensity at encoder value 0.
    #[arg(long, env = "ZPLOT_GAIN", default_value_t = 1.0)]
    pub gain: f32,

    /// Encoder detents needed to double (or halve) the gain.
    #[arg(long, env = "ZPLOT_GAIN_DETENTS_PER_DOUBLING", default_value_t = 4.0)]
    pub gain_detents_per_doubling: f32,

    #[arg(long, env = "ZPLOT_ENCODER_MIN", default_value_t = -32, allow_negative_numbers = true)]
    pub encoder_min: i64,

    #[arg(long, env = "ZPLOT_ENCODER_MAX", default_value_t = 32, allow_negative_numbers = true)]
    pub encoder_max: i64,

    /// Bit depth of the detector's x/y coordinates.
    #[arg(long, env = "ZPLOT_SOURCE_BITS", default_value_t = 14, value_parser = clap::value_parser!(u8).range(1..=16))]
    pub source_bits: u8,

    /// Directory screenshots are written to.
    #[arg(long, env = "ZPLOT_SCREENSHOT_DIR", default_value = "imgs")]
    pub screenshot_dir: PathBuf,

    /// Capture a screenshot before every clear.
    #[arg(long, env = "ZPLOT_SCREENSHOT_ON_CLEAR")]
    pub screenshot_on_clear: bool,

    /// GPIO character device the encoder and buttons are wired to.
    #[arg(long, env = "ZPLOT_GPIO_CHIP", default_value = "/dev/gpiochip0")]
    pub gpio_chip: PathBuf,

    #[arg(long, env = "ZPLOT_GPIO_CLEAR", default_value_t = 21)]
    pub gpio_clear: u32,

    #[arg(long, env = "ZPLOT_GPIO_SCREENSHOT", default_value_t = 20)]
    pub gpio_screenshot: u32,

    #[arg(long, env = "ZPLOT_GPIO_ENCODER_A", default_value_t = 26)]
    pub gpio_encoder_a: u32,

    #[arg(long, env = "ZPLOT_GPIO_ENCODER_B", default_value_t = 19)]
    pub gpio_encoder_b: u32,

    #[arg(long, env = "ZPLOT_GPIO_ENCODER_SWITCH", default_value_t = 13)]
    pub gpio_encoder_switch: u32,

    /// Minimum time a button must stay pressed to count, in milliseconds.
    #[arg(long, env = "ZPLOT_BUTTON_FILTER_MS", default_value_t = 10)]
    pub button_filter_ms: u64,

    /// Optional listen address for the Prometheus metrics endpoint.
    #[arg(long, env = "ZPLOT_METRICS_LISTEN_ADDR")]
    pub metrics_listen_addr: Option<SocketAddr>,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceMode {
    /// Accept a sequence equal to the last one (duplicates are replayed).
    NonDecreasing,
    /// Require a strictly greater sequence.
    StrictlyIncreasing,
}

impl From<SequenceMode> for SequencePolicy {
    fn from(mode: SequenceMode) -> Self {
        match mode {
            SequenceMode::NonDecreasing => SequencePolicy::NonDecreasing,
            SequenceMode::StrictlyIncreasing => SequencePolicy::StrictlyIncreasing,
        }
    }
}

impl Config {
    pub fn ingest(&self) -> IngestConfig {
        IngestConfig {
            listen_addr: self.listen_addr,
            senders: SenderAllowList::new(self.senders.iter().cloned()),
            raw_queue_capacity: self.raw_queue_capacity,
            sequence_policy: self.sequence_policy.into(),
        }
    }

    pub fn render(&self) -> RenderConfig {
        RenderConfig {
            period: Duration::from_millis(self.update_ms.max(1)),
            source_bits: self.source_bits,
            screenshot_dir: self.screenshot_dir.clone(),
            screenshot_on_clear: self.screenshot_on_clear,
        }
    }

    pub fn gain_schedule(&self) -> GainSchedule {
        GainSchedule::new(self.gain, self.gain_detents_per_doubling)
    }

    pub fn controls(&self) -> ControlsConfig {
        ControlsConfig {
            chip: self.gpio_chip.clone(),
            clear_line: self.gpio_clear,
            screenshot_line: self.gpio_screenshot,
            encoder_a_line: self.gpio_encoder_a,
            encoder_b_line: self.gpio_encoder_b,
            encoder_switch_line: self.gpio_encoder_switch,
            button_filter: Duration::from_millis(self.button_filter_ms),
            encoder: EncoderConfig {
                start: 0,
                min: Some(self.encoder_min),
                max: Some(self.encoder_max),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_deployment() {
        let cfg = Config::try_parse_from(["zplot"]).unwrap();
        assert_eq!(cfg.listen_addr.port(), 60000);
        assert_eq!(cfg.update_ms, 1000);
        assert_eq!(cfg.senders.len(), 5);
        assert_eq!(cfg.sequence_policy, SequenceMode::NonDecreasing);

        let ingest = cfg.ingest();
        assert_eq!(ingest.senders.name_of("192.168.1.10".parse().unwrap()), Some("tdc_0"));
        assert_eq!(ingest.sequence_policy, SequencePolicy::NonDecreasing);
    }

    #[test]
    fn senders_and_policy_from_flags() {
        let cfg = Config::try_parse_from([
            "zplot",
            "--sender",
            "10.0.0.5",
            "--sender",
            "lab=10.0.0.6",
            "--sequence-policy",
            "strictly-increasing",
            "--encoder-min",
            "-4",
        ])
        .unwrap();

        let ingest = cfg.ingest();
        assert!(ingest.senders.contains("10.0.0.5".parse().unwrap()));
        assert_eq!(ingest.senders.name_of("10.0.0.6".parse().unwrap()), Some("lab"));
        assert!(!ingest.senders.contains("192.168.1.10".parse().unwrap()));
        assert_eq!(ingest.sequence_policy, SequencePolicy::StrictlyIncreasing);
        assert_eq!(cfg.controls().encoder.min, Some(-4));
    }

    #[test]
    fn rejects_out_of_range_source_bits() {
        assert!(Config::try_parse_from(["zplot", "--source-bits", "17"]).is_err());
    }
}
