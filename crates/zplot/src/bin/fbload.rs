//! Writes pre-formatted raw images straight into the framebuffer.
//!
//! `fbload image.fb` shows one image; `fbload --splash dir/` plays every
//! `.fb` file in the directory forward and back.

use anyhow::Context;
use clap::Parser;
use std::path::{Path, PathBuf};
use std::time::Duration;
use zplot::framebuffer::{stills, FramebufferDevice};
use zplot::logging::{self, LogFormat};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Raw image, or a directory of frames with `--splash`.
    path: PathBuf,

    /// Play every `.fb` file in PATH as an animation.
    #[arg(long)]
    splash: bool,

    /// Time each splash frame stays on screen, in milliseconds.
    #[arg(long, default_value_t = 1000)]
    interval_ms: u64,

    #[arg(long, env = "ZPLOT_FB_DEVICE", default_value = "/dev/fb0")]
    device: PathBuf,

    #[arg(long, env = "ZPLOT_LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[arg(long, env = "ZPLOT_LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logging::init(&args.log_level, args.log_format);

    let mut fb = FramebufferDevice::open(&args.device)
        .with_context(|| format!("failed to open framebuffer {}", args.device.display()))?;
    fb.clear();

    if args.splash {
        play_splash(&mut fb, &args.path, Duration::from_millis(args.interval_ms))
    } else {
        load(&mut fb, &args.path)
    }
}

fn load(fb: &mut FramebufferDevice, path: &Path) -> anyhow::Result<()> {
    let blob = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    fb.write_raw(&blob)
        .with_context(|| format!("{} does not fit the framebuffer", path.display()))?;
    tracing::info!(path = %path.display(), bytes = blob.len(), "Image loaded");
    Ok(())
}

fn play_splash(fb: &mut FramebufferDevice, dir: &Path, interval: Duration) -> anyhow::Result<()> {
    let files = stills::splash_frames(dir)
        .with_context(|| format!("failed to list splash frames in {}", dir.display()))?;

    let mut frames = Vec::with_capacity(files.len());
    for file in &files {
        match std::fs::read(file) {
            Ok(blob) => frames.push(blob),
            Err(e) => tracing::warn!(path = %file.display(), error = %e, "Skipping unreadable frame"),
        }
    }
    if frames.is_empty() {
        anyhow::bail!("no splash frames found in {}", dir.display());
    }

    tracing::info!(frames = frames.len(), "Playing splash");
    for blob in stills::bounce(&frames) {
        if let Err(e) = fb.write_raw(&blob) {
            tracing::warn!(error = %e, "Skipping frame that does not fit the framebuffer");
            continue;
        }
        std::thread::sleep(interval);
    }
    Ok(())
}
