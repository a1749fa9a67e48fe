use std::time::{Duration, Instant};

use tracing::warn;

const HANDLER_WARN_AFTER: Duration = Duration::from_secs(10);

/// Records entry into a top-level event handler and logs a warning when
/// the handler held the loop too long. No preemption, just visibility.
pub struct HandlerGuard {
    name: &'static str,
    entered: Instant,
}

impl HandlerGuard {
    pub fn enter(name: &'static str) -> Self {
        Self {
            name,
            entered: Instant::now(),
        }
    }
}

impl Drop for HandlerGuard {
    fn drop(&mut self) {
        let elapsed = self.entered.elapsed();
        if elapsed >= HANDLER_WARN_AFTER {
            warn!(
                "handler {} blocked the event loop for {:.1}s",
                self.name,
                elapsed.as_secs_f64()
            );
        }
    }
}
