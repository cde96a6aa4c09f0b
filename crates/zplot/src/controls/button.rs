use super::Level;
use std::time::Duration;

/// A press that survived the debounce filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Press {
    /// When the line first went low.
    pub at: Duration,
}

/// Active-low push-button with a minimum stable-duration filter.
///
/// A level change only counts once the line has held it for `filter`; any
/// bounce back inside the window cancels it. Each debounced high-to-low
/// transition yields exactly one [`Press`]. Timestamps are offsets from an
/// arbitrary epoch chosen by the caller.
#[derive(Debug, Clone)]
pub struct DebouncedButton {
    filter: Duration,
    stable: Level,
    pending: Option<(Level, Duration)>,
}

impl DebouncedButton {
    pub fn new(filter: Duration, initial: Level) -> Self {
        Self {
            filter,
            stable: initial,
            pending: None,
        }
    }

    pub fn level(&self) -> Level {
        self.stable
    }

    /// Handles a raw edge. A pending change that has already matured by
    /// `at` is settled first, so its press is returned here.
    pub fn on_edge(&mut self, level: Level, at: Duration) -> Option<Press> {
        let press = self.poll(at);
        self.pending = if level == self.stable {
            None
        } else {
            match self.pending {
                // Keep the first edge of a run so the window is not extended.
                Some((pending, since)) if pending == level => Some((pending, since)),
                _ => Some((level, at)),
            }
        };
        press
    }

    /// Settles a pending change whose window has elapsed by `now`.
    pub fn poll(&mut self, now: Duration) -> Option<Press> {
        let (level, since) = self.pending?;
        if now.saturating_sub(since) < self.filter {
            return None;
        }
        self.pending = None;
        self.stable = level;
        (level == Level::Low).then_some(Press { at: since })
    }

    /// When the pending change, if any, will settle.
    pub fn deadline(&self) -> Option<Duration> {
        self.pending.map(|(_, since)| since + self.filter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FILTER: Duration = Duration::from_millis(10);

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn clean_press_after_filter() {
        let mut b = DebouncedButton::new(FILTER, Level::High);
        assert_eq!(b.on_edge(Level::Low, ms(100)), None);
        assert_eq!(b.deadline(), Some(ms(110)));
        assert_eq!(b.poll(ms(105)), None);
        assert_eq!(b.poll(ms(110)), Some(Press { at: ms(100) }));
        assert_eq!(b.level(), Level::Low);
        assert_eq!(b.poll(ms(200)), None);
    }

    #[test]
    fn bounce_on_press_yields_one_event() {
        let mut b = DebouncedButton::new(FILTER, Level::High);
        let mut presses = 0;
        for (i, level) in [Level::Low, Level::High, Level::Low, Level::High, Level::Low]
            .into_iter()
            .enumerate()
        {
            presses += b.on_edge(level, ms(i as u64)).into_iter().count();
        }
        presses += b.poll(ms(20)).into_iter().count();
        presses += b.poll(ms(30)).into_iter().count();
        assert_eq!(presses, 1);
    }

    #[test]
    fn glitch_shorter_than_filter_is_ignored() {
        let mut b = DebouncedButton::new(FILTER, Level::High);
        b.on_edge(Level::Low, ms(0));
        b.on_edge(Level::High, ms(3));
        assert_eq!(b.deadline(), None);
        assert_eq!(b.poll(ms(50)), None);
        assert_eq!(b.level(), Level::High);
    }

    #[test]
    fn release_bounce_does_not_press_again() {
        let mut b = DebouncedButton::new(FILTER, Level::High);
        b.on_edge(Level::Low, ms(0));
        assert!(b.poll(ms(10)).is_some());

        // release with chatter
        b.on_edge(Level::High, ms(500));
        b.on_edge(Level::Low, ms(501));
        b.on_edge(Level::High, ms(502));
        assert_eq!(b.poll(ms(520)), None);
        assert_eq!(b.level(), Level::High);
    }

    #[test]
    fn matured_change_is_settled_by_the_next_edge() {
        let mut b = DebouncedButton::new(FILTER, Level::High);
        b.on_edge(Level::Low, ms(0));
        // No poll in between; the release edge settles the press.
        assert_eq!(b.on_edge(Level::High, ms(40)), Some(Press { at: ms(0) }));
        assert_eq!(b.poll(ms(60)), None);
        assert_eq!(b.level(), Level::High);
    }
}
