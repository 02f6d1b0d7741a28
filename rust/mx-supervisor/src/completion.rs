//! One-shot wakeups with timeout and abort.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::MxError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Pending,
    Done,
    Aborted,
}

/// A wait that one party posts and another resolves.
///
/// Once completed (or aborted) it stays that way until [`reinit`](Self::reinit).
pub struct Completion {
    state: Mutex<State>,
    cond: Condvar,
}

impl Default for Completion {
    fn default() -> Self {
        Self::new()
    }
}

impl Completion {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::Pending),
            cond: Condvar::new(),
        }
    }

    /// Arm for a new wait.
    pub fn reinit(&self) {
        *self.state.lock() = State::Pending;
    }

    pub fn complete(&self) {
        let mut state = self.state.lock();
        if *state == State::Pending {
            *state = State::Done;
        }
        self.cond.notify_all();
    }

    /// Wake every waiter with [`MxError::Aborted`].
    pub fn abort(&self) {
        let mut state = self.state.lock();
        if *state == State::Pending {
            *state = State::Aborted;
        }
        self.cond.notify_all();
    }

    pub fn is_done(&self) -> bool {
        *self.state.lock() == State::Done
    }

    /// Block until completed, aborted, or `timeout` expires. `None` waits forever.
    pub fn wait(&self, timeout: Option<Duration>, what: &'static str) -> Result<(), MxError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();
        loop {
            match *state {
                State::Done => return Ok(()),
                State::Aborted => return Err(MxError::Aborted),
                State::Pending => {}
            }
            match deadline {
                Some(deadline) => {
                    if self.cond.wait_until(&mut state, deadline).timed_out()
                        && *state == State::Pending
                    {
                        return Err(MxError::Timeout(what));
                    }
                }
                None => self.cond.wait(&mut state),
            }
        }
    }
}

/// Resolve a configured timeout. Zero means "forever" in debug builds;
/// release builds fall back to `default`.
pub fn effective_timeout(configured: Duration, default: Duration) -> Option<Duration> {
    if !configured.is_zero() {
        Some(configured)
    } else if cfg!(debug_assertions) {
        None
    } else {
        Some(default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn complete_wakes_waiter() {
        let c = Arc::new(Completion::new());
        let c2 = c.clone();
        let t = thread::spawn(move || c2.wait(Some(Duration::from_secs(5)), "test"));
        thread::sleep(Duration::from_millis(20));
        c.complete();
        assert!(t.join().unwrap().is_ok());
        assert!(c.is_done());
    }

    #[test]
    fn times_out_and_stays_pending() {
        let c = Completion::new();
        let err = c.wait(Some(Duration::from_millis(10)), "nothing").unwrap_err();
        assert!(matches!(err, MxError::Timeout("nothing")));
        c.complete();
        assert!(c.wait(Some(Duration::from_millis(10)), "nothing").is_ok());
    }

    #[test]
    fn abort_is_sticky_until_reinit() {
        let c = Completion::new();
        c.abort();
        assert!(matches!(c.wait(None, "x"), Err(MxError::Aborted)));
        c.complete();
        assert!(matches!(c.wait(None, "x"), Err(MxError::Aborted)));
        c.reinit();
        c.complete();
        assert!(c.wait(None, "x").is_ok());
    }

    #[test]
    fn zero_timeout_resolution() {
        let default = Duration::from_secs(1);
        assert_eq!(
            effective_timeout(Duration::from_millis(5), default),
            Some(Duration::from_millis(5))
        );
        let zero = effective_timeout(Duration::ZERO, default);
        if cfg!(debug_assertions) {
            assert_eq!(zero, None);
        } else {
            assert_eq!(zero, Some(default));
        }
    }
}
