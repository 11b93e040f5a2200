use parking_lot::Mutex;

/// Inactivity countdown shared by a session's output path and its ticker.
///
/// Both operations take the same lock, and expiry is latched: once `tick`
/// reports the zero crossing, later ticks and resets are no-ops.
#[derive(Debug)]
pub struct Countdown {
    state: Mutex<State>,
}

#[derive(Debug)]
struct State {
    initial: u64,
    remaining: u64,
    expired: bool,
}

impl Countdown {
    pub fn new(ticks: u64) -> Self {
        Self {
            state: Mutex::new(State {
                initial: ticks,
                remaining: ticks,
                expired: false,
            }),
        }
    }

    /// Restores the configured value. Returns false if the countdown already expired.
    pub fn reset(&self) -> bool {
        let mut state = self.state.lock();
        if state.expired {
            return false;
        }
        state.remaining = state.initial;
        true
    }

    /// Decrements by one tick. Returns true exactly once, on the tick that reaches zero.
    pub fn tick(&self) -> bool {
        let mut state = self.state.lock();
        if state.expired {
            return false;
        }
        state.remaining = state.remaining.saturating_sub(1);
        if state.remaining == 0 {
            state.expired = true;
            return true;
        }
        false
    }

    pub fn remaining(&self) -> u64 {
        self.state.lock().remaining
    }

    pub fn is_expired(&self) -> bool {
        self.state.lock().expired
    }
}
