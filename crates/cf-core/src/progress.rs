//! Best-effort progress reporting.

/// Sender for reporting intermediate progress from long-running operations.
///
/// Wraps a callback that receives a human-readable status line. Reports are
/// advisory: callers must never rely on them for state transitions.
pub struct ProgressSender {
    callback: Box<dyn Fn(&str) + Send + Sync>,
}

impl ProgressSender {
    /// Create a new sender from the given callback.
    pub fn new(callback: impl Fn(&str) + Send + Sync + 'static) -> Self {
        Self {
            callback: Box::new(callback),
        }
    }

    /// Create a no-op sender that discards all progress reports.
    pub fn noop() -> Self {
        Self {
            callback: Box::new(|_| {}),
        }
    }

    /// Report progress.
    pub fn send(&self, status: &str) {
        (self.callback)(status);
    }
}

impl std::fmt::Debug for ProgressSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressSender").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn callback_receives_reports() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let sender = ProgressSender::new(move |s| seen_clone.lock().unwrap().push(s.to_string()));
        sender.send("IN_QUEUE");
        sender.send("IN_PROGRESS");
        assert_eq!(*seen.lock().unwrap(), vec!["IN_QUEUE", "IN_PROGRESS"]);
    }

    #[test]
    fn noop_does_not_panic() {
        ProgressSender::noop().send("anything");
    }
}
