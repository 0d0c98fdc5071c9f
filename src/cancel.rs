use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use anyhow::Result;

use crate::errors::CancelledError;

/// Cancellation shared by every step and request of a run: an explicit flag
/// that callers can raise, plus an optional deadline.
#[derive(Clone, Debug)]
pub struct Cancellation {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl Default for Cancellation {
    fn default() -> Self {
        Self::new()
    }
}

impl Cancellation {
    pub fn new() -> Self {
        Self::from_flag(Arc::new(AtomicBool::new(false)))
    }

    /// Observe an existing flag, e.g. one raised by a signal handler.
    pub fn from_flag(flag: Arc<AtomicBool>) -> Self {
        Self {
            flag,
            deadline: None,
        }
    }

    /// Same flag, with a deadline `timeout` from now. An earlier deadline
    /// already in place is kept.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(existing) if existing < candidate => existing,
            _ => candidate,
        };
        Self {
            flag: self.flag.clone(),
            deadline: Some(deadline),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
            || self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }

    pub fn ensure_not_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(CancelledError.into())
        } else {
            Ok(())
        }
    }

    /// Time left before the deadline; `None` when there is no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raising_the_flag_cancels_every_clone() {
        let cancellation = Cancellation::new();
        let clone = cancellation.clone();
        assert!(clone.ensure_not_cancelled().is_ok());
        cancellation.cancel();
        let err = clone.ensure_not_cancelled().unwrap_err();
        assert!(err.is::<CancelledError>());
    }

    #[test]
    fn deadlines_expire() {
        let cancellation = Cancellation::new().with_timeout(Duration::from_millis(0));
        assert!(cancellation.is_cancelled());
        assert_eq!(cancellation.remaining(), Some(Duration::ZERO));
    }

    #[test]
    fn earlier_deadline_wins() {
        let short = Cancellation::new().with_timeout(Duration::from_millis(10));
        let extended = short.with_timeout(Duration::from_secs(60));
        assert!(extended.remaining().unwrap() <= Duration::from_millis(10));
    }
}
