use crate::config::RestartSettings;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Exponent cap; 2^20 times any sane minimum delay is already past every cap
const MAX_BACKOFF_EXPONENT: u32 = 20;

/// Outcome of asking the policy what to do after a fault
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// Start again after `delay`
    Restart { delay: Duration },
    /// The ceiling was reached inside the window
    GiveUp { restarts_in_window: usize },
}

/// Exponential backoff: `min * 2^k`, capped at `max`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub min: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self { min, max }
    }

    /// Delay for the k-th consecutive restart (k starts at 0)
    pub fn delay(&self, k: u32) -> Duration {
        let factor = 2u32.saturating_pow(k.min(MAX_BACKOFF_EXPONENT));
        self.min.saturating_mul(factor).min(self.max)
    }
}

/// Restart history of one instance.
///
/// All methods take `now` explicitly so the policy stays a pure function of its inputs.
#[derive(Debug, Clone, Default)]
pub struct RestartTracker {
    /// Restart timestamps inside the rolling window, oldest first
    recent: VecDeque<Instant>,
    /// Consecutive restarts since the last stable run
    consecutive: u32,
}

impl RestartTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decide what happens after a fault.
    ///
    /// # Arguments
    /// * `settings` - backoff and ceiling configuration
    /// * `uptime` - how long the failed process ran; `None` when it never started
    /// * `now` - current time
    ///
    /// # Returns
    /// `Restart` with the delay to wait, or `GiveUp` once `max_restarts` restarts
    /// already happened inside the window. A restart is recorded only when granted.
    pub fn decide(
        &mut self,
        settings: &RestartSettings,
        uptime: Option<Duration>,
        now: Instant,
    ) -> RestartDecision {
        if uptime.is_some_and(|up| up >= settings.stable_after) {
            self.consecutive = 0;
        }

        self.prune(settings.window, now);
        if self.recent.len() >= settings.max_restarts {
            return RestartDecision::GiveUp {
                restarts_in_window: self.recent.len(),
            };
        }

        let delay = Backoff::new(settings.min_delay, settings.max_delay).delay(self.consecutive);
        self.recent.push_back(now);
        self.consecutive = self.consecutive.saturating_add(1);

        RestartDecision::Restart { delay }
    }

    /// Number of restarts recorded within `window` of `now`
    pub fn count_recent(&self, window: Duration, now: Instant) -> usize {
        self.recent
            .iter()
            .filter(|&&t| now.saturating_duration_since(t) < window)
            .count()
    }

    /// Forget history after an explicit operator restart
    pub fn reset(&mut self) {
        self.recent.clear();
        self.consecutive = 0;
    }

    fn prune(&mut self, window: Duration, now: Instant) {
        while let Some(&oldest) = self.recent.front() {
            if now.saturating_duration_since(oldest) >= window {
                self.recent.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(max_restarts: usize) -> RestartSettings {
        RestartSettings {
            min_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            stable_after: Duration::from_secs(60),
            max_restarts,
            window: Duration::from_secs(60),
        }
    }

    fn delay_of(decision: RestartDecision) -> Duration {
        match decision {
            RestartDecision::Restart { delay } => delay,
            other => panic!("expected restart, got {:?}", other),
        }
    }

    #[test]
    fn test_backoff_doubles_until_cap() {
        let backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));
        assert_eq!(backoff.delay(0), Duration::from_secs(1));
        assert_eq!(backoff.delay(1), Duration::from_secs(2));
        assert_eq!(backoff.delay(5), Duration::from_secs(32));
        assert_eq!(backoff.delay(6), Duration::from_secs(60));
        assert_eq!(backoff.delay(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn test_delays_non_decreasing_until_cap() {
        let settings = settings(100);
        let mut tracker = RestartTracker::new();
        let start = Instant::now();

        let mut previous = Duration::ZERO;
        for i in 0..12 {
            let now = start + Duration::from_millis(i * 10);
            let delay = delay_of(tracker.decide(&settings, Some(Duration::ZERO), now));
            assert!(delay >= previous);
            assert!(delay <= settings.max_delay);
            previous = delay;
        }
        assert_eq!(previous, settings.max_delay);
    }

    #[test]
    fn test_stable_run_resets_backoff() {
        let settings = settings(100);
        let mut tracker = RestartTracker::new();
        let now = Instant::now();

        for _ in 0..4 {
            tracker.decide(&settings, Some(Duration::from_secs(1)), now);
        }
        let delay = delay_of(tracker.decide(&settings, Some(Duration::from_secs(1)), now));
        assert_eq!(delay, Duration::from_secs(16));

        let delay = delay_of(tracker.decide(&settings, Some(Duration::from_secs(60)), now));
        assert_eq!(delay, settings.min_delay);
    }

    #[test]
    fn test_launch_failure_does_not_reset_backoff() {
        let settings = settings(100);
        let mut tracker = RestartTracker::new();
        let now = Instant::now();

        tracker.decide(&settings, None, now);
        let delay = delay_of(tracker.decide(&settings, None, now));
        assert_eq!(delay, Duration::from_secs(2));
    }

    #[test]
    fn test_ceiling_gives_up_inside_window() {
        let settings = settings(3);
        let mut tracker = RestartTracker::new();
        let start = Instant::now();

        for i in 0..3 {
            let now = start + Duration::from_secs(i);
            assert!(matches!(
                tracker.decide(&settings, Some(Duration::ZERO), now),
                RestartDecision::Restart { .. }
            ));
        }

        let decision = tracker.decide(&settings, Some(Duration::ZERO), start + Duration::from_secs(3));
        assert_eq!(decision, RestartDecision::GiveUp { restarts_in_window: 3 });
    }

    #[test]
    fn test_window_rolls_forward() {
        let settings = settings(2);
        let mut tracker = RestartTracker::new();
        let start = Instant::now();

        tracker.decide(&settings, None, start);
        tracker.decide(&settings, None, start + Duration::from_secs(30));
        assert_eq!(tracker.count_recent(settings.window, start + Duration::from_secs(31)), 2);

        // The first restart has left the window
        let later = start + Duration::from_secs(61);
        assert!(matches!(
            tracker.decide(&settings, None, later),
            RestartDecision::Restart { .. }
        ));
        assert_eq!(tracker.count_recent(settings.window, later), 2);
    }

    #[test]
    fn test_reset_clears_history() {
        let settings = settings(1);
        let mut tracker = RestartTracker::new();
        let now = Instant::now();

        tracker.decide(&settings, None, now);
        assert!(matches!(
            tracker.decide(&settings, None, now),
            RestartDecision::GiveUp { .. }
        ));

        tracker.reset();
        assert_eq!(
            tracker.decide(&settings, None, now),
            RestartDecision::Restart {
                delay: settings.min_delay
            }
        );
    }
}
