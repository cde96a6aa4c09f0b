//! Process wiring: opens the device and socket, starts every context and
//! tears them down in order on shutdown.

use crate::config::Config;
use crate::controls::{ControlState, Controls};
use crate::framebuffer::{FramebufferDevice, Renderer};
use crate::gain::GainController;
use crate::ingest::{IngestConfig, IngestError, UdpIngestService};
use crate::metrics::Metrics;
use crate::queue::TransportQueue;
use crate::shutdown::{self, Shutdown};
use anyhow::Context;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::Instrument;

pub async fn run(config: Config) -> anyhow::Result<()> {
    tracing::info!(config = ?config, "Loaded configuration");

    let metrics = Arc::new(Metrics::new());
    let shutdown = Shutdown::new();

    let metrics_handle = match config.metrics_listen_addr {
        Some(addr) => {
            let listener = tokio::net::TcpListener::bind(addr)
                .await
                .with_context(|| format!("failed to bind metrics endpoint on {addr}"))?;
            let router = metrics.router();
            let stop = shutdown.clone();
            tracing::info!(%addr, "Metrics server started");
            Some(tokio::spawn(async move {
                axum::serve(listener, router.into_make_service())
                    .with_graceful_shutdown(async move { stop.triggered().await })
                    .await
            }))
        }
        None => None,
    };

    let device = FramebufferDevice::open(&config.fb_device)
        .with_context(|| format!("failed to open framebuffer {}", config.fb_device.display()))?;
    let geometry = device.geometry();
    tracing::info!(
        device = %config.fb_device.display(),
        width = geometry.width,
        height = geometry.height,
        layout = ?geometry.layout,
        "Framebuffer mapped"
    );

    let queue = Arc::new(TransportQueue::new(config.queue_capacity.max(1)));
    let ingest = spawn_ingest(config.ingest(), queue.clone(), metrics.clone(), shutdown.clone())?;

    let schedule = config.gain_schedule();
    let controls_config = config.controls();
    let renderer = Renderer::new(device, config.render(), schedule.base(), metrics.clone());
    let state = ControlState::new(&controls_config, renderer.actions());
    let mut renderer = renderer.with_gain_controller(GainController::new(schedule, state.subscribe()));

    let controls = match Controls::spawn(&controls_config, state, shutdown.clone()) {
        Ok(controls) => Some(controls),
        Err(e) => {
            tracing::warn!(
                error = %e,
                chip = %controls_config.chip.display(),
                "GPIO controls unavailable; gain, clear and screenshot are disabled"
            );
            renderer.set_controls_available(false);
            None
        }
    };

    let render = tokio::spawn(
        renderer
            .run(queue.clone(), shutdown.clone())
            .instrument(tracing::info_span!("render")),
    );

    tracing::info!("All services started. Awaiting shutdown signal...");

    tokio::select! {
        res = shutdown::os_signal() => match res {
            Ok(()) => tracing::info!("Shutdown signal received"),
            Err(e) => tracing::error!(error = %e, "Failed to listen for shutdown signals"),
        },
        _ = shutdown.triggered() => tracing::warn!("Shutdown requested internally"),
    }
    shutdown.trigger();

    // Ingestion closes the queue itself; closing again covers an early exit.
    join_thread("ingestion", ingest).await;
    queue.close();

    if let Err(e) = render.await {
        tracing::error!(error = %e, "Render task failed");
    }

    if let Some(controls) = controls {
        if let Err(e) = tokio::task::spawn_blocking(move || controls.join()).await {
            tracing::error!(error = %e, "Failed to join GPIO thread");
        }
    }

    if let Some(handle) = metrics_handle {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!(error = %e, "Metrics server failed"),
            Err(e) => tracing::error!(error = %e, "Metrics server task failed"),
        }
    }

    tracing::info!(
        photons_plotted = metrics.photons_plotted_total.get(),
        packets_accepted = metrics.packets_accepted_total.get(),
        "zplot shut down gracefully"
    );
    Ok(())
}

/// Binds the socket here so a bind failure is fatal at startup, then runs
/// the ingestion service on its own thread and current-thread runtime.
pub fn spawn_ingest(
    config: IngestConfig,
    queue: Arc<TransportQueue>,
    metrics: Arc<Metrics>,
    shutdown: Shutdown,
) -> anyhow::Result<JoinHandle<()>> {
    let socket = std::net::UdpSocket::bind(config.listen_addr).map_err(|source| {
        IngestError::Bind {
            addr: config.listen_addr,
            source,
        }
    })?;

    let handle = std::thread::Builder::new()
        .name("zplot-ingest".into())
        .spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to build ingestion runtime");
                    queue.close();
                    shutdown.trigger();
                    return;
                }
            };

            rt.block_on(async move {
                let stop = shutdown.clone();
                match UdpIngestService::from_std(socket, config, queue.clone(), metrics, shutdown) {
                    Ok(service) => service.run().instrument(tracing::info_span!("udp_ingest")).await,
                    Err(e) => {
                        tracing::error!(error = %e, "Ingestion service failed to start");
                        queue.close();
                        stop.trigger();
                    }
                }
            });
        })
        .context("failed to start ingestion thread")?;

    Ok(handle)
}

async fn join_thread(name: &'static str, handle: JoinHandle<()>) {
    match tokio::task::spawn_blocking(move || handle.join()).await {
        Ok(Ok(())) => tracing::debug!(thread = name, "Thread finished"),
        Ok(Err(_)) => tracing::error!(thread = name, "Thread panicked"),
        Err(e) => tracing::error!(thread = name, error = %e, "Failed to join thread"),
    }
}
