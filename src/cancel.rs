use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::error::StoreError;

/// A cancellation token with an optional deadline.
///
/// Every store call receives one. Clones share the cancellation flag, so a
/// caller can keep a clone and cancel a rewrite running on another thread.
#[derive(Debug, Clone, Default)]
pub struct Cancel {
    flag: Option<Arc<AtomicBool>>,
    deadline: Option<Instant>,
}

impl Cancel {
    /// A token that never fires.
    pub fn never() -> Self {
        Self::default()
    }

    /// A token that fires when [`cancel`](Self::cancel) is called.
    pub fn new() -> Self {
        Self { flag: Some(Arc::new(AtomicBool::new(false))), deadline: None }
    }

    /// A token that fires after `timeout` has elapsed.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::new().deadline(Instant::now() + timeout)
    }

    /// Set a deadline, keeping the earlier one if there already is one.
    pub fn deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(self.deadline.map_or(deadline, |d| d.min(deadline)));
        self
    }

    /// Fire the token for all of its clones.
    ///
    /// Has no effect on a token created with [`never`](Self::never).
    pub fn cancel(&self) {
        if let Some(flag) = &self.flag {
            flag.store(true, Ordering::SeqCst);
        }
    }

    /// Whether the token was cancelled or its deadline passed.
    pub fn is_cancelled(&self) -> bool {
        self.flag.as_ref().is_some_and(|flag| flag.load(Ordering::SeqCst))
            || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Fail a store operation if the token fired.
    pub fn check(&self, op: &'static str) -> Result<(), StoreError> {
        if self.is_cancelled() { Err(StoreError::Timeout { op }) } else { Ok(()) }
    }

    /// The time left until the deadline, if there is one.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline.map(|d| d.saturating_duration_since(Instant::now()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_is_shared() {
        let token = Cancel::new();
        let clone = token.clone();
        assert!(clone.check("get").is_ok());
        token.cancel();
        assert!(clone.is_cancelled());
        assert!(matches!(clone.check("get"), Err(StoreError::Timeout { op: "get" })));
    }

    #[test]
    fn test_deadline() {
        let token = Cancel::with_timeout(Duration::ZERO);
        assert!(token.is_cancelled());
        assert_eq!(token.remaining(), Some(Duration::ZERO));

        let never = Cancel::never();
        never.cancel();
        assert!(!never.is_cancelled());
        assert_eq!(never.remaining(), None);
    }
}
