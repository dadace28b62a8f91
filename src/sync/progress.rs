//! Progress capability handed to the lock spin loop

/// Drives outstanding network work while a caller waits.
///
/// Invoked once per spin iteration by the accumulate lock. Implementations
/// must tolerate being called re-entrantly from inside an engine verb.
pub trait Progress {
    fn advance(&self);
}

impl<F: Fn()> Progress for F {
    fn advance(&self) {
        self()
    }
}

/// Progress that only yields the calling thread
#[derive(Debug, Clone, Copy, Default)]
pub struct YieldProgress;

impl Progress for YieldProgress {
    fn advance(&self) {
        std::thread::yield_now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_closure_progress() {
        let calls = Cell::new(0);
        let progress = || calls.set(calls.get() + 1);
        progress.advance();
        progress.advance();
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn test_yield_progress() {
        let p: &dyn Progress = &YieldProgress;
        p.advance();
    }
}
