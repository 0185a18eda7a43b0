//! Cooperative shutdown tokens
//!
//! A [`Shutdown`] is a cheap, cloneable cancellation flag. Child tokens
//! observe their parent but can be triggered on their own, so stopping one
//! connection manager does not stop its siblings while a process-wide
//! signal still reaches all of them.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use signal_hook::consts::{SIGINT, SIGTERM};

/// Granularity of interruptible sleeps
pub const POLL_TICK: Duration = Duration::from_millis(500);

/// Cancellation token shared between a controller and its workers
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    flag: Arc<AtomicBool>,
    parent: Option<Arc<Shutdown>>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token that fires when either it or `self` is triggered
    pub fn child(&self) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            parent: Some(Arc::new(self.clone())),
        }
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
            || self.parent.as_ref().is_some_and(|p| p.is_triggered())
    }

    /// Set this token on SIGINT or SIGTERM
    pub fn register_signals(&self) -> io::Result<()> {
        for signal in [SIGINT, SIGTERM] {
            signal_hook::flag::register(signal, Arc::clone(&self.flag))?;
        }
        Ok(())
    }

    /// Sleep for `duration` in [`POLL_TICK`] steps.
    ///
    /// Returns true as soon as shutdown is observed.
    pub fn sleep(&self, duration: Duration) -> bool {
        self.sleep_with_tick(duration, POLL_TICK)
    }

    pub fn sleep_with_tick(&self, duration: Duration, tick: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_triggered() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            thread::sleep(tick.min(deadline - now));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_observes_parent() {
        let parent = Shutdown::new();
        let child = parent.child();
        assert!(!child.is_triggered());

        parent.trigger();
        assert!(child.is_triggered());
    }

    #[test]
    fn test_child_does_not_affect_parent_or_sibling() {
        let parent = Shutdown::new();
        let a = parent.child();
        let b = parent.child();

        a.trigger();
        assert!(a.is_triggered());
        assert!(!b.is_triggered());
        assert!(!parent.is_triggered());
    }

    #[test]
    fn test_clone_shares_flag() {
        let token = Shutdown::new();
        let clone = token.clone();
        clone.trigger();
        assert!(token.is_triggered());
    }

    #[test]
    fn test_sleep_runs_full_duration_without_trigger() {
        let token = Shutdown::new();
        let start = Instant::now();
        assert!(!token.sleep_with_tick(Duration::from_millis(50), Duration::from_millis(10)));
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_sleep_interrupted_by_trigger() {
        let token = Shutdown::new();
        let remote = token.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            remote.trigger();
        });

        let start = Instant::now();
        assert!(token.sleep_with_tick(Duration::from_secs(30), Duration::from_millis(10)));
        assert!(start.elapsed() < Duration::from_secs(5));
        handle.join().unwrap();
    }
}
