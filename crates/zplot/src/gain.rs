//! Encoder value to display gain.

use tokio::sync::watch;

/// Exponential gain schedule: `base * 2^(value / detents_per_doubling)`.
///
/// Every `detents_per_doubling` clicks clockwise double the gain, the same
/// number counter-clockwise halve it. Value 0 is the configured base gain.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GainSchedule {
    base: f32,
    detents_per_doubling: f32,
}

impl GainSchedule {
    pub fn new(base: f32, detents_per_doubling: f32) -> Self {
        let detents_per_doubling = if detents_per_doubling.is_finite() && detents_per_doubling > 0.0 {
            detents_per_doubling
        } else {
            1.0
        };
        Self {
            base,
            detents_per_doubling,
        }
    }

    pub fn base(&self) -> f32 {
        self.base
    }

    pub fn gain_for(&self, value: i64) -> f32 {
        self.base * (value as f32 / self.detents_per_doubling).exp2()
    }
}

/// Reads the latest encoder value published by the control context.
///
/// Polled once per render tick; intermediate values between ticks are
/// skipped since only the latest gain is ever drawn.
pub struct GainController {
    schedule: GainSchedule,
    value: watch::Receiver<i64>,
}

impl GainController {
    pub fn new(schedule: GainSchedule, value: watch::Receiver<i64>) -> Self {
        Self { schedule, value }
    }

    pub fn schedule(&self) -> GainSchedule {
        self.schedule
    }

    /// Gain for the current encoder value.
    pub fn current(&self) -> f32 {
        self.schedule.gain_for(*self.value.borrow())
    }

    /// `Some((value, gain))` if the encoder moved since the last poll.
    pub fn poll(&mut self) -> Option<(i64, f32)> {
        // A closed sender means the controls are gone; keep the last gain.
        if !self.value.has_changed().unwrap_or(false) {
            return None;
        }
        let value = *self.value.borrow_and_update();
        Some((value, self.schedule.gain_for(value)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_doubles_every_n_detents() {
        let s = GainSchedule::new(1.5, 4.0);
        assert_eq!(s.gain_for(0), 1.5);
        assert_eq!(s.gain_for(4), 3.0);
        assert_eq!(s.gain_for(-8), 0.375);
        assert!((s.gain_for(2) - 1.5 * 2f32.sqrt()).abs() < 1e-5);
    }

    #[test]
    fn degenerate_detents_fall_back_to_one() {
        let s = GainSchedule::new(1.0, 0.0);
        assert_eq!(s.gain_for(3), 8.0);
    }

    #[test]
    fn poll_reports_only_changes() {
        let (tx, rx) = watch::channel(0i64);
        let mut ctl = GainController::new(GainSchedule::new(1.0, 4.0), rx);

        assert_eq!(ctl.poll(), None);
        assert_eq!(ctl.current(), 1.0);

        tx.send_replace(1);
        tx.send_replace(4);
        assert_eq!(ctl.poll(), Some((4, 2.0)));
        assert_eq!(ctl.poll(), None);

        drop(tx);
        assert_eq!(ctl.poll(), None);
        assert_eq!(ctl.current(), 2.0);
    }
}
