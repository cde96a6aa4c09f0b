//! Operator controls: a rotary encoder for gain plus clear and screenshot
//! push-buttons.
//!
//! [`ControlState`] is hardware independent and only sees timestamped line
//! edges. The `gpio` backend feeds it from the Linux GPIO character device
//! on a dedicated thread.

pub mod button;
#[cfg(feature = "gpio")]
mod gpio;
pub mod quadrature;

pub use button::{DebouncedButton, Press};
pub use quadrature::{Direction, EncoderConfig, Phase, QuadratureDecoder};

use crate::framebuffer::PendingActions;
use crate::shutdown::Shutdown;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Low,
    High,
}

impl Level {
    pub fn from_value(value: u8) -> Self {
        if value == 0 {
            Level::Low
        } else {
            Level::High
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlLine {
    EncoderA,
    EncoderB,
    EncoderSwitch,
    Clear,
    Screenshot,
}

/// A raw level change on one input line. `at` is relative to an epoch
/// fixed by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineEdge {
    pub line: ControlLine,
    pub level: Level,
    pub at: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEvent {
    Step { direction: Direction, value: i64 },
    EncoderReset { value: i64 },
    ClearRequested,
    ScreenshotRequested,
}

#[derive(Debug, Clone)]
pub struct ControlsConfig {
    pub chip: PathBuf,
    pub clear_line: u32,
    pub screenshot_line: u32,
    pub encoder_a_line: u32,
    pub encoder_b_line: u32,
    pub encoder_switch_line: u32,
    pub button_filter: Duration,
    pub encoder: EncoderConfig,
}

impl ControlsConfig {
    /// Line offsets on the chip, by role.
    pub fn lines(&self) -> [(ControlLine, u32); 5] {
        [
            (ControlLine::EncoderA, self.encoder_a_line),
            (ControlLine::EncoderB, self.encoder_b_line),
            (ControlLine::EncoderSwitch, self.encoder_switch_line),
            (ControlLine::Clear, self.clear_line),
            (ControlLine::Screenshot, self.screenshot_line),
        ]
    }
}

/// Decoders for every control line.
///
/// Lives on the GPIO thread. Encoder values leave through a `watch` channel
/// and button presses through [`PendingActions`], so the render side never
/// touches this state directly.
pub struct ControlState {
    encoder: QuadratureDecoder,
    a: Level,
    b: Level,
    encoder_switch: DebouncedButton,
    clear: DebouncedButton,
    screenshot: DebouncedButton,
    button_filter: Duration,
    actions: Arc<PendingActions>,
    value_tx: watch::Sender<i64>,
}

impl ControlState {
    /// All lines start idle (high) until [`set_level`](Self::set_level) says otherwise.
    pub fn new(config: &ControlsConfig, actions: Arc<PendingActions>) -> Self {
        let encoder = QuadratureDecoder::new(config.encoder);
        let (value_tx, _) = watch::channel(encoder.value());
        let button = || DebouncedButton::new(config.button_filter, Level::High);
        Self {
            encoder,
            a: Level::High,
            b: Level::High,
            encoder_switch: button(),
            clear: button(),
            screenshot: button(),
            button_filter: config.button_filter,
            actions,
            value_tx,
        }
    }

    /// Receives every change of the encoder value.
    pub fn subscribe(&self) -> watch::Receiver<i64> {
        self.value_tx.subscribe()
    }

    pub fn encoder_value(&self) -> i64 {
        self.encoder.value()
    }

    /// Records a line's level as read at startup, without producing events.
    pub fn set_level(&mut self, line: ControlLine, level: Level) {
        let filter = self.button_filter;
        match line {
            ControlLine::EncoderA => self.a = level,
            ControlLine::EncoderB => self.b = level,
            ControlLine::EncoderSwitch => self.encoder_switch = DebouncedButton::new(filter, level),
            ControlLine::Clear => self.clear = DebouncedButton::new(filter, level),
            ControlLine::Screenshot => self.screenshot = DebouncedButton::new(filter, level),
        }
    }

    pub fn on_edge(&mut self, edge: LineEdge) -> Option<ControlEvent> {
        let button = match edge.line {
            ControlLine::EncoderA | ControlLine::EncoderB => {
                if edge.line == ControlLine::EncoderA {
                    self.a = edge.level;
                } else {
                    self.b = edge.level;
                }
                let phase = Phase::from_levels(self.a == Level::High, self.b == Level::High);
                let direction = self.encoder.on_phase(phase)?;
                let value = self.encoder.value();
                self.publish(value);
                tracing::debug!(?direction, value, "Encoder step");
                return Some(ControlEvent::Step { direction, value });
            }
            ControlLine::EncoderSwitch => &mut self.encoder_switch,
            ControlLine::Clear => &mut self.clear,
            ControlLine::Screenshot => &mut self.screenshot,
        };
        button
            .on_edge(edge.level, edge.at)
            .map(|_| self.pressed(edge.line))
    }

    /// Settles button changes whose filter window has elapsed by `now`.
    pub fn poll(&mut self, now: Duration) -> Vec<ControlEvent> {
        let mut events = Vec::new();
        for line in [ControlLine::EncoderSwitch, ControlLine::Clear, ControlLine::Screenshot] {
            let press = match line {
                ControlLine::EncoderSwitch => self.encoder_switch.poll(now),
                ControlLine::Clear => self.clear.poll(now),
                _ => self.screenshot.poll(now),
            };
            if press.is_some() {
                events.push(self.pressed(line));
            }
        }
        events
    }

    /// Earliest time [`poll`](Self::poll) has something to settle.
    pub fn next_deadline(&self) -> Option<Duration> {
        [&self.encoder_switch, &self.clear, &self.screenshot]
            .into_iter()
            .filter_map(DebouncedButton::deadline)
            .min()
    }

    fn pressed(&mut self, line: ControlLine) -> ControlEvent {
        match line {
            ControlLine::Clear => {
                self.actions.request_clear();
                tracing::info!("Clear requested");
                ControlEvent::ClearRequested
            }
            ControlLine::Screenshot => {
                self.actions.request_screenshot();
                tracing::info!("Screenshot requested");
                ControlEvent::ScreenshotRequested
            }
            _ => {
                self.encoder.reset();
                let value = self.encoder.value();
                self.publish(value);
                tracing::info!(value, "Encoder reset");
                ControlEvent::EncoderReset { value }
            }
        }
    }

    fn publish(&self, value: i64) {
        self.value_tx.send_if_modified(|current| {
            let changed = *current != value;
            *current = value;
            changed
        });
    }
}

#[derive(Debug, Error)]
pub enum ControlsError {
    #[error("built without GPIO support")]
    Disabled,
    #[cfg(feature = "gpio")]
    #[error("{chip}: {source}")]
    Gpio {
        chip: PathBuf,
        #[source]
        source: gpio_cdev::Error,
    },
    #[error("failed to start the controls thread: {0}")]
    Thread(#[source] std::io::Error),
}

/// Handle on the running GPIO thread.
pub struct Controls {
    thread: JoinHandle<()>,
}

impl Controls {
    /// Opens the configured lines and starts feeding `state` until shutdown.
    pub fn spawn(
        config: &ControlsConfig,
        state: ControlState,
        shutdown: Shutdown,
    ) -> Result<Self, ControlsError> {
        #[cfg(feature = "gpio")]
        {
            gpio::spawn(config, state, shutdown).map(|thread| Self { thread })
        }
        #[cfg(not(feature = "gpio"))]
        {
            let _ = (config, state, shutdown);
            Err(ControlsError::Disabled)
        }
    }

    /// Waits for the thread; its line handles are released by then.
    pub fn join(self) {
        if self.thread.join().is_err() {
            tracing::error!("GPIO thread panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ControlsConfig {
        ControlsConfig {
            chip: "/dev/gpiochip0".into(),
            clear_line: 21,
            screenshot_line: 20,
            encoder_a_line: 26,
            encoder_b_line: 19,
            encoder_switch_line: 13,
            button_filter: Duration::from_millis(10),
            encoder: EncoderConfig {
                start: 0,
                min: Some(-2),
                max: Some(2),
            },
        }
    }

    fn edge(line: ControlLine, level: Level, ms: u64) -> LineEdge {
        LineEdge {
            line,
            level,
            at: Duration::from_millis(ms),
        }
    }

    fn turn_right(state: &mut ControlState) -> Option<ControlEvent> {
        // 11 -> 10 -> 00 -> 01 -> 11
        state.on_edge(edge(ControlLine::EncoderB, Level::Low, 0));
        state.on_edge(edge(ControlLine::EncoderA, Level::Low, 0));
        state.on_edge(edge(ControlLine::EncoderB, Level::High, 0));
        state.on_edge(edge(ControlLine::EncoderA, Level::High, 0))
    }

    #[test]
    fn encoder_steps_are_published() {
        let mut state = ControlState::new(&config(), Arc::new(PendingActions::new()));
        let mut rx = state.subscribe();

        assert_eq!(
            turn_right(&mut state),
            Some(ControlEvent::Step {
                direction: Direction::Right,
                value: 1
            })
        );
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), 1);

        // Clamped steps do not wake subscribers.
        turn_right(&mut state);
        rx.borrow_and_update();
        turn_right(&mut state);
        assert_eq!(state.encoder_value(), 2);
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn encoder_switch_resets_value() {
        let mut state = ControlState::new(&config(), Arc::new(PendingActions::new()));
        let rx = state.subscribe();
        turn_right(&mut state);

        state.on_edge(edge(ControlLine::EncoderSwitch, Level::Low, 100));
        let events = state.poll(Duration::from_millis(110));
        assert_eq!(events, vec![ControlEvent::EncoderReset { value: 0 }]);
        assert_eq!(*rx.borrow(), 0);
    }

    #[test]
    fn buttons_raise_pending_actions_once() {
        let actions = Arc::new(PendingActions::new());
        let mut state = ControlState::new(&config(), actions.clone());

        state.on_edge(edge(ControlLine::Clear, Level::Low, 0));
        state.on_edge(edge(ControlLine::Clear, Level::High, 2));
        state.on_edge(edge(ControlLine::Clear, Level::Low, 4));
        state.on_edge(edge(ControlLine::Screenshot, Level::Low, 5));
        assert_eq!(state.next_deadline(), Some(Duration::from_millis(14)));

        let events = state.poll(Duration::from_millis(20));
        assert_eq!(
            events,
            vec![ControlEvent::ClearRequested, ControlEvent::ScreenshotRequested]
        );
        assert!(actions.take_clear());
        assert!(actions.take_screenshot());
        assert!(state.poll(Duration::from_millis(100)).is_empty());
        assert_eq!(state.next_deadline(), None);
    }

    #[test]
    fn lines_map_roles_to_offsets() {
        let lines = config().lines();
        assert!(lines.contains(&(ControlLine::Clear, 21)));
        assert!(lines.contains(&(ControlLine::EncoderA, 26)));
    }
}
