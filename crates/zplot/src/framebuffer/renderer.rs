use super::canvas::{Canvas, Plot};
use super::device::FramebufferDevice;
use super::screenshot;
use crate::gain::GainController;
use crate::metrics::Metrics;
use crate::queue::TransportQueue;
use crate::shutdown::Shutdown;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tracing::Instrument;

/// Events folded into the canvas per lock acquisition.
const ACCUMULATE_BATCH: usize = 1024;

const CONTROLS_WARNING_INTERVAL: Duration = Duration::from_secs(60);

/// Requests raised by the control context, applied at the next render tick.
///
/// Repeated requests between two ticks collapse into one.
#[derive(Debug, Default)]
pub struct PendingActions {
    clear: AtomicBool,
    screenshot: AtomicBool,
}

impl PendingActions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_clear(&self) {
        self.clear.store(true, Ordering::Release);
    }

    pub fn request_screenshot(&self) {
        self.screenshot.store(true, Ordering::Release);
    }

    pub fn take_clear(&self) -> bool {
        self.clear.swap(false, Ordering::AcqRel)
    }

    pub fn take_screenshot(&self) -> bool {
        self.screenshot.swap(false, Ordering::AcqRel)
    }
}

#[derive(Debug, Clone)]
pub struct RenderConfig {
    pub period: Duration,
    pub source_bits: u8,
    pub screenshot_dir: PathBuf,
    pub screenshot_on_clear: bool,
}

/// What one render tick did.
#[derive(Debug, Default)]
pub struct TickReport {
    pub cleared: bool,
    pub screenshot: Option<PathBuf>,
    pub gain: Option<f32>,
}

/// Owns the framebuffer and drives both rendering duties.
///
/// The accumulate duty drains the transport queue into the shared
/// [`Canvas`]; the render duty wakes every `period`, applies pending
/// actions and blits the whole frame. Only the render duty touches the
/// device.
pub struct Renderer {
    device: FramebufferDevice,
    canvas: Arc<Mutex<Canvas>>,
    frame: Vec<u8>,
    config: RenderConfig,
    actions: Arc<PendingActions>,
    gain: Option<GainController>,
    controls_available: bool,
    metrics: Arc<Metrics>,
}

impl Renderer {
    pub fn new(
        device: FramebufferDevice,
        config: RenderConfig,
        initial_gain: f32,
        metrics: Arc<Metrics>,
    ) -> Self {
        let geometry = device.geometry();
        let canvas = Canvas::new(geometry, config.source_bits, initial_gain);
        metrics.display_gain.set(canvas.gain() as f64);

        Self {
            device,
            frame: vec![0; geometry.frame_len()],
            canvas: Arc::new(Mutex::new(canvas)),
            config,
            actions: Arc::new(PendingActions::new()),
            gain: None,
            controls_available: true,
            metrics,
        }
    }

    /// Takes the gain from the encoder from now on.
    pub fn with_gain_controller(mut self, controller: GainController) -> Self {
        let gain = controller.current();
        self.canvas.lock().set_gain(gain);
        self.metrics.display_gain.set(gain as f64);
        self.gain = Some(controller);
        self
    }

    /// Marks the GPIO controls as missing; the render loop then reminds the
    /// operator periodically.
    pub fn set_controls_available(&mut self, available: bool) {
        self.controls_available = available;
    }

    pub fn canvas(&self) -> Arc<Mutex<Canvas>> {
        self.canvas.clone()
    }

    pub fn actions(&self) -> Arc<PendingActions> {
        self.actions.clone()
    }

    pub fn device(&self) -> &FramebufferDevice {
        &self.device
    }

    /// One render period: gain, screenshot, clear, blit, in that order.
    ///
    /// The screenshot captures what is on screen before the clear.
    pub fn tick(&mut self) -> TickReport {
        let started = Instant::now();
        let mut report = TickReport::default();

        if let Some((value, gain)) = self.gain.as_mut().and_then(GainController::poll) {
            self.canvas.lock().set_gain(gain);
            self.metrics.display_gain.set(gain as f64);
            self.metrics.encoder_value.set(value);
            tracing::info!(encoder = value, gain, "Display gain changed");
            report.gain = Some(gain);
        }

        let clear = self.actions.take_clear();
        let wants_screenshot =
            self.actions.take_screenshot() || (clear && self.config.screenshot_on_clear);
        if wants_screenshot {
            report.screenshot = self.capture();
        }

        let (photons_total, photons_current) = {
            let mut canvas = self.canvas.lock();
            if clear {
                canvas.clear();
            }
            canvas.render_into(&mut self.frame);
            (canvas.photons_total(), canvas.photons_current())
        };

        if clear {
            self.metrics.screen_clears_total.inc();
            tracing::info!(photons_total, "Screen cleared");
            report.cleared = true;
        }

        if let Err(e) = self.device.blit(&self.frame) {
            tracing::error!(error = %e, device = %self.device.path().display(), "Blit failed");
        }

        self.metrics.render_ticks_total.inc();
        self.metrics
            .render_duration_seconds
            .observe(started.elapsed().as_secs_f64());
        tracing::debug!(
            photons_total,
            photons_current,
            elapsed_us = started.elapsed().as_micros() as u64,
            "Frame rendered"
        );

        report
    }

    fn capture(&self) -> Option<PathBuf> {
        match screenshot::write_screenshot(
            &self.config.screenshot_dir,
            self.device.contents(),
            &chrono::Local::now(),
        ) {
            Ok(path) => {
                self.metrics.screenshots_total.inc();
                tracing::info!(path = %path.display(), "Screenshot saved");
                Some(path)
            }
            Err(e) => {
                self.metrics.screenshot_failures_total.inc();
                tracing::error!(
                    error = %e,
                    dir = %self.config.screenshot_dir.display(),
                    "Failed to save screenshot"
                );
                None
            }
        }
    }

    /// Runs both duties until shutdown.
    pub async fn run(mut self, queue: Arc<TransportQueue>, shutdown: Shutdown) {
        let accumulate = tokio::spawn(
            accumulate(
                self.canvas.clone(),
                queue.clone(),
                self.metrics.clone(),
                shutdown.clone(),
            )
            .instrument(tracing::info_span!("accumulate")),
        );

        let mut interval = tokio::time::interval(self.config.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut warned_at = Instant::now();

        tracing::info!(
            period_ms = self.config.period.as_millis() as u64,
            width = self.device.geometry().width,
            height = self.device.geometry().height,
            "Renderer started"
        );

        loop {
            tokio::select! {
                _ = shutdown.triggered() => break,
                _ = interval.tick() => {
                    self.metrics.transport_queue_depth.set(queue.len() as i64);
                    self.tick();

                    if !self.controls_available && warned_at.elapsed() >= CONTROLS_WARNING_INTERVAL {
                        tracing::warn!("Running without GPIO controls; gain, clear and screenshot are unavailable");
                        warned_at = Instant::now();
                    }
                }
            }
        }

        if let Err(e) = accumulate.await {
            tracing::error!(error = %e, "Accumulate task failed");
        }
        tracing::info!("Renderer stopped");
    }
}

/// Drains the transport queue into the canvas until shutdown or until the
/// queue is closed and empty.
async fn accumulate(
    canvas: Arc<Mutex<Canvas>>,
    queue: Arc<TransportQueue>,
    metrics: Arc<Metrics>,
    shutdown: Shutdown,
) {
    loop {
        let first = tokio::select! {
            _ = shutdown.triggered() => break,
            event = queue.pop() => match event {
                Some(event) => event,
                None => break,
            },
        };

        let mut plotted = 0u64;
        let mut out_of_bounds = 0u64;
        {
            let mut canvas = canvas.lock();
            let mut next = Some(first);
            let mut taken = 0;
            while let Some(event) = next {
                match canvas.accumulate(event) {
                    Plot::Plotted { .. } => plotted += 1,
                    Plot::OutOfBounds => out_of_bounds += 1,
                }
                taken += 1;
                next = if taken < ACCUMULATE_BATCH {
                    queue.try_pop()
                } else {
                    None
                };
            }
        }

        metrics.photons_plotted_total.inc_by(plotted);
        if out_of_bounds > 0 {
            metrics.photons_out_of_bounds_total.inc_by(out_of_bounds);
            tracing::trace!(out_of_bounds, "Photons mapped off screen");
        }
    }
    tracing::debug!("Accumulate duty finished");
}
