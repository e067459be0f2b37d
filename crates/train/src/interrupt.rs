//! Cooperative interrupt handling between iterations.
//!
//! The binary flips a shared flag on Ctrl-C; loops poll it between steps and
//! then offer a grace period before writing a final checkpoint.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

const POLL: Duration = Duration::from_millis(100);

/// Wait `seconds`, returning `false` if `flag` is raised again meanwhile.
///
/// The flag is cleared on entry so that only a fresh interrupt aborts.
pub fn countdown(seconds: f64, flag: &AtomicBool) -> bool {
    flag.store(false, Ordering::SeqCst);
    if !(seconds > 0.0) {
        return true;
    }
    tracing::info!(seconds, "saving checkpoint after countdown, interrupt again to abandon");
    let deadline = Instant::now() + Duration::from_secs_f64(seconds);
    while Instant::now() < deadline {
        if flag.load(Ordering::SeqCst) {
            tracing::warn!("checkpoint save abandoned");
            return false;
        }
        std::thread::sleep(POLL.min(deadline.saturating_duration_since(Instant::now())));
    }
    !flag.load(Ordering::SeqCst)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn zero_countdown_clears_flag_and_proceeds() {
        let flag = AtomicBool::new(true);
        assert!(countdown(0.0, &flag));
        assert!(!flag.load(Ordering::SeqCst));
    }

    #[test]
    fn second_interrupt_abandons() {
        let flag = Arc::new(AtomicBool::new(true));
        let setter = {
            let flag = Arc::clone(&flag);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(150));
                flag.store(true, Ordering::SeqCst);
            })
        };
        assert!(!countdown(5.0, &flag));
        setter.join().unwrap();
    }
}
