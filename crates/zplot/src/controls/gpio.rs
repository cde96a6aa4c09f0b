use super::{ControlLine, ControlState, ControlsConfig, ControlsError, Level, LineEdge};
use crate::shutdown::Shutdown;
use futures::stream::{self, StreamExt};
use gpio_cdev::{AsyncLineEventHandle, Chip, EventRequestFlags, EventType, LineEventHandle, LineRequestFlags};
use std::thread::JoinHandle;
use std::time::Instant;
use tracing::Instrument;

const CONSUMER: &str = "zplot";

/// Requests every control line and starts the GPIO thread.
///
/// Line requests happen on the caller's thread so a missing chip or a busy
/// line is reported before anything is spawned.
pub(super) fn spawn(
    config: &ControlsConfig,
    mut state: ControlState,
    shutdown: Shutdown,
) -> Result<JoinHandle<()>, ControlsError> {
    let gpio_err = |source: gpio_cdev::Error| ControlsError::Gpio {
        chip: config.chip.clone(),
        source,
    };

    let mut chip = Chip::new(&config.chip).map_err(gpio_err)?;
    let mut handles = Vec::with_capacity(5);
    for (line, offset) in config.lines() {
        let handle = chip
            .get_line(offset)
            .and_then(|l| {
                l.events(
                    LineRequestFlags::INPUT,
                    EventRequestFlags::BOTH_EDGES,
                    CONSUMER,
                )
            })
            .map_err(gpio_err)?;
        let level = Level::from_value(handle.get_value().map_err(gpio_err)?);
        state.set_level(line, level);
        tracing::debug!(?line, offset, ?level, "GPIO line requested");
        handles.push((line, handle));
    }

    std::thread::Builder::new()
        .name("zplot-gpio".into())
        .spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to build GPIO runtime");
                    return;
                }
            };
            rt.block_on(
                watch_lines(handles, state, shutdown).instrument(tracing::info_span!("controls")),
            );
        })
        .map_err(ControlsError::Thread)
}

async fn watch_lines(
    handles: Vec<(ControlLine, LineEventHandle)>,
    mut state: ControlState,
    shutdown: Shutdown,
) {
    let epoch = Instant::now();

    let mut streams = Vec::with_capacity(handles.len());
    for (line, handle) in handles {
        match AsyncLineEventHandle::new(handle) {
            Ok(events) => streams.push(events.map(move |ev| (line, ev)).boxed_local()),
            Err(e) => tracing::warn!(?line, error = %e, "Cannot watch GPIO line"),
        }
    }
    let mut events = stream::select_all(streams);

    tracing::info!("GPIO controls started");

    loop {
        let deadline = state.next_deadline();
        let settle = async {
            match deadline {
                Some(d) => tokio::time::sleep_until((epoch + d).into()).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = shutdown.triggered() => break,
            _ = settle => {
                state.poll(epoch.elapsed());
            }
            next = events.next() => match next {
                Some((line, Ok(event))) => {
                    let level = match event.event_type() {
                        EventType::RisingEdge => Level::High,
                        EventType::FallingEdge => Level::Low,
                    };
                    state.on_edge(LineEdge {
                        line,
                        level,
                        at: epoch.elapsed(),
                    });
                }
                Some((line, Err(e))) => {
                    tracing::warn!(?line, error = %e, "GPIO event read failed");
                }
                None => {
                    tracing::warn!("No GPIO lines left to watch");
                    break;
                }
            },
        }
    }

    // Dropping the streams releases the line requests.
    drop(events);
    tracing::info!("GPIO controls stopped");
}
