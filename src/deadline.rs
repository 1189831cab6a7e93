//! Deadline-bounded execution.
//!
//! The original aidentd arms a `SIGALRM` and unwinds a blocked syscall with
//! `siglongjmp`. Signal-driven stack unwinding has no safe counterpart in
//! Rust, and the spec's own design notes (§9) invite a reimplementation to
//! use readiness-driven non-blocking I/O instead, which is what this module
//! and its callers in `netlink.rs`/`conntrack.rs`/`forward.rs` do: every
//! blocking site is a `popol::Sources::poll` bounded by the time remaining
//! until the deadline, so a slow peer or tool simply surfaces
//! `io::ErrorKind::TimedOut` instead of needing to be asynchronously
//! aborted. Because nothing is ever force-unwound mid-syscall, the
//! resources registered at each such site are ordinary owned values that
//! close on `Drop` — no process-global socket/pipe slot is needed.

use std::time::{Duration, Instant};

/// A single process-wide deadline, armed once at the start of a query.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Option<Instant>,
}

impl Deadline {
    /// `seconds == 0` disables the deadline entirely.
    pub fn new(seconds: u64) -> Self {
        Self {
            at: (seconds != 0).then(|| Instant::now() + Duration::from_secs(seconds)),
        }
    }

    /// Time left before the deadline, or `None` if there is no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.at.map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// Whether the deadline has already passed.
    pub fn has_expired(&self) -> bool {
        matches!(self.remaining(), Some(d) if d.is_zero())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_seconds_disables_the_deadline() {
        let deadline = Deadline::new(0);
        assert!(deadline.remaining().is_none());
        assert!(!deadline.has_expired());
    }

    #[test]
    fn nonzero_deadline_counts_down() {
        let deadline = Deadline::new(1);
        let remaining = deadline.remaining().unwrap();
        assert!(remaining <= Duration::from_secs(1));
    }
}
