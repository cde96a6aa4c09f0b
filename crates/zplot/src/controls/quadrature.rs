//! Rotary encoder state machine.
//!
//! Both encoder lines idle high. The phase is the two levels packed as
//! `A << 1 | B`, so rest is `0b11`. The direction is guessed from the first
//! phase left after rest and only committed when the encoder returns to
//! rest, which makes half-turns and contact bounce harmless.

/// Two-bit encoder phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Phase(u8);

impl Phase {
    pub const REST: Phase = Phase(0b11);

    pub const fn from_bits(bits: u8) -> Self {
        Phase(bits & 0b11)
    }

    /// `a` and `b` are the line levels, `true` for high.
    pub const fn from_levels(a: bool, b: bool) -> Self {
        Phase(((a as u8) << 1) | b as u8)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Counter-clockwise.
    Left,
    /// Clockwise.
    Right,
}

/// Initial value and optional bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EncoderConfig {
    pub start: i64,
    pub min: Option<i64>,
    pub max: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct QuadratureDecoder {
    config: EncoderConfig,
    value: i64,
    phase: Phase,
    direction: Option<Direction>,
}

impl QuadratureDecoder {
    pub fn new(config: EncoderConfig) -> Self {
        let mut decoder = Self {
            config,
            value: config.start,
            phase: Phase::REST,
            direction: None,
        };
        decoder.value = decoder.clamp(config.start);
        decoder
    }

    pub fn value(&self) -> i64 {
        self.value
    }

    /// Last tentative or committed direction.
    pub fn direction(&self) -> Option<Direction> {
        self.direction
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Back to the initial value and rest phase.
    pub fn reset(&mut self) {
        self.value = self.clamp(self.config.start);
        self.phase = Phase::REST;
        self.direction = None;
    }

    /// Feeds the phase read after an edge on either line. Returns the
    /// direction of a committed step, if this transition completed one.
    pub fn on_phase(&mut self, next: Phase) -> Option<Direction> {
        use Direction::{Left, Right};

        let mut step = None;
        match (self.phase.bits(), next.bits()) {
            (0b11, 0b10) => self.direction = Some(Right),
            (0b11, 0b01) => self.direction = Some(Left),

            (0b10, 0b11) if self.direction == Some(Left) => step = Some(Left),
            (0b10, 0b00) => self.direction = Some(Right),

            (0b01, 0b11) if self.direction == Some(Right) => step = Some(Right),
            (0b01, 0b00) => self.direction = Some(Left),

            (0b00, 0b11) => step = self.direction,
            (0b00, 0b10) => self.direction = Some(Left),
            (0b00, 0b01) => self.direction = Some(Right),

            _ => {}
        }
        self.phase = next;

        match step {
            Some(Right) => self.value = self.clamp(self.value.saturating_add(1)),
            Some(Left) => self.value = self.clamp(self.value.saturating_sub(1)),
            None => {}
        }
        step
    }

    fn clamp(&self, value: i64) -> i64 {
        let value = self.config.max.map_or(value, |max| value.min(max));
        self.config.min.map_or(value, |min| value.max(min))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(decoder: &mut QuadratureDecoder, phases: &[u8]) {
        for &p in phases {
            decoder.on_phase(Phase::from_bits(p));
        }
    }

    const CW: [u8; 3] = [0b10, 0b00, 0b11];
    const CCW: [u8; 3] = [0b01, 0b00, 0b11];

    #[test]
    fn phase_packs_a_high() {
        assert_eq!(Phase::from_levels(true, true), Phase::REST);
        assert_eq!(Phase::from_levels(true, false).bits(), 0b10);
        assert_eq!(Phase::from_levels(false, true).bits(), 0b01);
    }

    #[test]
    fn clockwise_cycle_increments_once() {
        let mut d = QuadratureDecoder::new(EncoderConfig::default());
        d.on_phase(Phase::from_bits(0b10));
        d.on_phase(Phase::from_bits(0b00));
        assert_eq!(d.value(), 0);
        assert_eq!(d.on_phase(Phase::REST), Some(Direction::Right));
        assert_eq!(d.value(), 1);
    }

    #[test]
    fn counter_clockwise_cycle_decrements_once() {
        let mut d = QuadratureDecoder::new(EncoderConfig::default());
        feed(&mut d, &CCW);
        assert_eq!(d.value(), -1);
        assert_eq!(d.direction(), Some(Direction::Left));
    }

    #[test]
    fn full_four_phase_cycles_count_once_each() {
        let mut d = QuadratureDecoder::new(EncoderConfig::default());
        for _ in 0..3 {
            feed(&mut d, &[0b10, 0b00, 0b01, 0b11]);
        }
        assert_eq!(d.value(), 3);
        for _ in 0..5 {
            feed(&mut d, &[0b01, 0b00, 0b10, 0b11]);
        }
        assert_eq!(d.value(), -2);
    }

    #[test]
    fn half_turn_and_back_does_not_count() {
        let mut d = QuadratureDecoder::new(EncoderConfig::default());
        feed(&mut d, &[0b10, 0b11, 0b01, 0b11]);
        assert_eq!(d.value(), 0);
    }

    #[test]
    fn value_is_clamped_to_bounds() {
        let mut d = QuadratureDecoder::new(EncoderConfig {
            start: 0,
            min: Some(-2),
            max: Some(2),
        });
        for _ in 0..5 {
            feed(&mut d, &CW);
        }
        assert_eq!(d.value(), 2);
        for _ in 0..9 {
            feed(&mut d, &CCW);
        }
        assert_eq!(d.value(), -2);
    }

    #[test]
    fn unbounded_without_limits() {
        let mut d = QuadratureDecoder::new(EncoderConfig {
            start: 100,
            ..Default::default()
        });
        for _ in 0..50 {
            feed(&mut d, &CW);
        }
        assert_eq!(d.value(), 150);
    }

    #[test]
    fn reset_restores_start_and_rest_phase() {
        let mut d = QuadratureDecoder::new(EncoderConfig {
            start: 5,
            min: None,
            max: None,
        });
        feed(&mut d, &CW);
        d.on_phase(Phase::from_bits(0b10));
        d.reset();

        assert_eq!(d.value(), 5);
        assert_eq!(d.phase(), Phase::REST);
        assert_eq!(d.direction(), None);
    }
}
