//! Detector emulator: streams synthetic photon packets at a `zplot` receiver.
//!
//! Most photons land in a bright spot at the centre of the detector, the rest
//! are uniform background. Optional faults exercise the receiver's
//! duplicate and alignment checks.

use clap::Parser;
use photon_wire::{encode_packet, PhotonEvent};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tokio::time::{interval, Duration, Instant, MissedTickBehavior};
use tracing_subscriber::{fmt, EnvFilter};

const STATS_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
struct Config {
    /// Receiver address.
    #[arg(long, env = "PHOTON_SIM_TARGET", default_value = "127.0.0.1:60000")]
    target: SocketAddr,

    /// Local address to send from; must be on the receiver's allow-list.
    #[arg(long, env = "PHOTON_SIM_BIND", default_value = "0.0.0.0:0")]
    bind: SocketAddr,

    /// Packets per second.
    #[arg(long, env = "PHOTON_SIM_RATE_HZ", default_value_t = 100.0)]
    rate_hz: f64,

    #[arg(long, env = "PHOTON_SIM_PHOTONS_PER_PACKET", default_value_t = 64)]
    photons_per_packet: u16,

    /// Bit depth of the generated x/y coordinates.
    #[arg(long, env = "PHOTON_SIM_SOURCE_BITS", default_value_t = 14, value_parser = clap::value_parser!(u8).range(1..=16))]
    source_bits: u8,

    /// Fraction of photons in the central spot; the rest is background.
    #[arg(long, env = "PHOTON_SIM_SPOT_FRACTION", default_value_t = 0.8)]
    spot_fraction: f64,

    /// Resend every Nth packet with the same sequence (0 = never).
    #[arg(long, env = "PHOTON_SIM_DUPLICATE_EVERY", default_value_t = 0)]
    duplicate_every: u64,

    /// Corrupt the alignment guard of every Nth packet (0 = never).
    #[arg(long, env = "PHOTON_SIM_MISALIGN_EVERY", default_value_t = 0)]
    misalign_every: u64,

    /// Send an empty heartbeat packet every Nth packet (0 = never).
    #[arg(long, env = "PHOTON_SIM_HEARTBEAT_EVERY", default_value_t = 0)]
    heartbeat_every: u64,

    /// Seed for reproducible streams.
    #[arg(long, env = "PHOTON_SIM_SEED")]
    seed: Option<u64>,
}

#[derive(Debug, Default)]
struct Stats {
    packets: u64,
    photons: u64,
    duplicates: u64,
    misaligned: u64,
    heartbeats: u64,
    send_errors: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .json()
        .init();

    let cfg = Config::parse();
    anyhow::ensure!(cfg.rate_hz > 0.0, "--rate-hz must be positive");
    tracing::info!(config = ?cfg, "Starting photon simulator");

    let socket = UdpSocket::bind(cfg.bind).await?;
    let mut rng = match cfg.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    let mut ticker = interval(Duration::from_secs_f64(1.0 / cfg.rate_hz));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut stats = Stats::default();
    let mut last_report = Instant::now();
    let mut sequence: u16 = 0;
    let mut n: u64 = 0;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {}
        }
        n += 1;

        let heartbeat = every(n, cfg.heartbeat_every);
        let events = if heartbeat {
            Vec::new()
        } else {
            (0..cfg.photons_per_packet)
                .map(|_| photon(&mut rng, &cfg))
                .collect()
        };

        let mut packet = encode_packet(sequence, &events);
        if every(n, cfg.misalign_every) {
            packet[4] = 0xA5;
            stats.misaligned += 1;
        }

        let copies = if every(n, cfg.duplicate_every) { 2 } else { 1 };
        for _ in 0..copies {
            if let Err(e) = socket.send_to(&packet, cfg.target).await {
                stats.send_errors += 1;
                tracing::warn!(error = %e, "Send failed");
            }
        }

        stats.packets += 1;
        stats.photons += events.len() as u64;
        stats.duplicates += copies - 1;
        stats.heartbeats += heartbeat as u64;
        sequence = sequence.wrapping_add(1);

        if last_report.elapsed() >= STATS_INTERVAL {
            tracing::info!(
                packets = stats.packets,
                photons = stats.photons,
                duplicates = stats.duplicates,
                misaligned = stats.misaligned,
                heartbeats = stats.heartbeats,
                send_errors = stats.send_errors,
                sequence,
                "Simulator stats"
            );
            last_report = Instant::now();
        }
    }

    tracing::info!(stats = ?stats, "Photon simulator stopped");
    Ok(())
}

fn every(n: u64, period: u64) -> bool {
    period != 0 && n % period == 0
}

fn photon(rng: &mut impl Rng, cfg: &Config) -> PhotonEvent {
    let max = ((1u32 << cfg.source_bits) - 1) as f64;
    let (x, y) = if rng.gen_bool(cfg.spot_fraction.clamp(0.0, 1.0)) {
        // Sum of uniforms: a cheap bell around the centre, 1/16 of the range wide.
        let spread = max / 16.0;
        let mut axis = || {
            let s: f64 = (0..4).map(|_| rng.gen_range(-0.5..0.5)).sum();
            (max / 2.0 + s * spread).clamp(0.0, max)
        };
        (axis(), axis())
    } else {
        (rng.gen_range(0.0..=max), rng.gen_range(0.0..=max))
    };
    PhotonEvent::new(x.round() as u16, y.round() as u16, rng.gen_range(1..=255))
}
