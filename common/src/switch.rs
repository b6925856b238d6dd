pub const RELAY_PULSE_MS: u64 = 500;
pub const BUTTON_DEBOUNCE_MS: u64 = 3_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pulse {
    pub duration_ms: u64,
}

// The relay latches, so a pulse goes out only when the state changes.
#[derive(Debug, Default)]
pub struct SwitchState {
    on: bool,
}

impl SwitchState {
    pub fn new(on: bool) -> Self {
        Self { on }
    }

    pub fn is_on(&self) -> bool {
        self.on
    }

    pub fn apply(&mut self, desired: bool) -> Option<Pulse> {
        if self.on == desired {
            return None;
        }
        self.on = desired;
        Some(Pulse {
            duration_ms: RELAY_PULSE_MS,
        })
    }

    pub fn toggle(&mut self) -> Pulse {
        self.on = !self.on;
        Pulse {
            duration_ms: RELAY_PULSE_MS,
        }
    }
}

// The caller supplies the monotonic millisecond clock.
#[derive(Debug)]
pub struct Debouncer {
    window_ms: u64,
    last_ms: Option<u64>,
}

impl Debouncer {
    pub fn new(window_ms: u64) -> Self {
        Self {
            window_ms,
            last_ms: None,
        }
    }

    pub fn accept(&mut self, now_ms: u64) -> bool {
        match self.last_ms {
            Some(last) if now_ms.saturating_sub(last) < self.window_ms => false,
            _ => {
                self.last_ms = Some(now_ms);
                true
            }
        }
    }
}

impl Default for Debouncer {
    fn default() -> Self {
        Self::new(BUTTON_DEBOUNCE_MS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reasserting_the_same_state_does_not_pulse() {
        let mut switch = SwitchState::default();
        assert_eq!(switch.apply(false), None);
        assert!(switch.apply(true).is_some());
        assert_eq!(switch.apply(true), None);
        assert!(switch.is_on());
    }

    #[test]
    fn toggle_always_pulses() {
        let mut switch = SwitchState::default();
        assert_eq!(switch.toggle().duration_ms, RELAY_PULSE_MS);
        assert!(switch.is_on());
        switch.toggle();
        assert!(!switch.is_on());
    }

    #[test]
    fn first_press_is_accepted() {
        let mut debouncer = Debouncer::default();
        assert!(debouncer.accept(0));
    }

    #[test]
    fn presses_inside_the_window_are_dropped() {
        let mut debouncer = Debouncer::default();
        assert!(debouncer.accept(10_000));
        assert!(!debouncer.accept(10_001));
        assert!(!debouncer.accept(12_999));
        assert!(debouncer.accept(13_000));
    }

    #[test]
    fn window_restarts_from_the_last_accepted_press() {
        let mut debouncer = Debouncer::new(100);
        assert!(debouncer.accept(0));
        assert!(!debouncer.accept(99));
        assert!(debouncer.accept(100));
        // Rejected presses do not move the window.
        assert!(!debouncer.accept(150));
        assert!(debouncer.accept(200));
    }
}
