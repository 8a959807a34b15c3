//! Deadline bookkeeping for a run: a fixed absolute deadline and an
//! inactivity deadline that moves forward every time a line arrives.
//!
//! All methods take explicit instants so the runner decides what "now" is.

use crate::outcome::TimeoutKind;
use crate::policy::TimeoutPolicy;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct TimeoutArbiter {
    started_at: Instant,
    policy: TimeoutPolicy,
    absolute_deadline: Option<Instant>,
    inactivity_deadline: Option<Instant>,
}

impl TimeoutArbiter {
    /// Both deadlines are measured from `started_at`; the inactivity
    /// window runs even if no line is ever produced.
    pub fn new(policy: TimeoutPolicy, started_at: Instant) -> Self {
        Self {
            started_at,
            policy,
            absolute_deadline: policy.timeout().map(|t| started_at + t),
            inactivity_deadline: policy.log_timeout().map(|l| started_at + l),
        }
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// A line arrived on either stream at `at`.
    pub fn record_activity(&mut self, at: Instant) {
        if let Some(window) = self.policy.log_timeout() {
            let deadline = at + window;
            // Events from the two streams can be delivered out of order.
            if self.inactivity_deadline.map_or(true, |current| deadline > current) {
                self.inactivity_deadline = Some(deadline);
            }
        }
    }

    /// The earliest configured deadline, or `None` if neither is set.
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.absolute_deadline, self.inactivity_deadline) {
            (Some(a), Some(i)) => Some(a.min(i)),
            (a, i) => a.or(i),
        }
    }

    /// Time left until the next deadline, saturating at zero.
    pub fn next_wakeup(&self, now: Instant) -> Option<Duration> {
        self.next_deadline()
            .map(|deadline| deadline.saturating_duration_since(now))
    }

    /// Which deadline has passed at `now`. Absolute wins when both have.
    pub fn classify(&self, now: Instant) -> Option<TimeoutKind> {
        if self.absolute_deadline.is_some_and(|d| now >= d) {
            Some(TimeoutKind::Absolute)
        } else if self.inactivity_deadline.is_some_and(|d| now >= d) {
            Some(TimeoutKind::Inactivity)
        } else {
            None
        }
    }

    /// The configured duration behind `kind`.
    pub fn configured(&self, kind: TimeoutKind) -> Duration {
        let configured = match kind {
            TimeoutKind::Absolute => self.policy.timeout(),
            TimeoutKind::Inactivity => self.policy.log_timeout(),
        };
        configured.unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: f64) -> Duration {
        Duration::from_secs_f64(s)
    }

    #[test]
    fn test_no_deadlines_never_fires() {
        let start = Instant::now();
        let arbiter = TimeoutArbiter::new(TimeoutPolicy::default(), start);
        assert_eq!(arbiter.next_deadline(), None);
        assert_eq!(arbiter.next_wakeup(start), None);
        assert_eq!(arbiter.classify(start + secs(3600.0)), None);
    }

    #[test]
    fn test_inactivity_measured_from_start_without_lines() {
        let start = Instant::now();
        let policy = TimeoutPolicy::default().with_log_timeout(secs(3.0));
        let arbiter = TimeoutArbiter::new(policy, start);
        assert_eq!(arbiter.classify(start + secs(2.9)), None);
        assert_eq!(
            arbiter.classify(start + secs(3.0)),
            Some(TimeoutKind::Inactivity)
        );
    }

    #[test]
    fn test_activity_pushes_inactivity_deadline() {
        let start = Instant::now();
        let policy = TimeoutPolicy::default().with_log_timeout(secs(2.0));
        let mut arbiter = TimeoutArbiter::new(policy, start);

        arbiter.record_activity(start + secs(1.5));
        assert_eq!(arbiter.next_deadline(), Some(start + secs(3.5)));
        assert_eq!(arbiter.classify(start + secs(3.0)), None);
        assert_eq!(
            arbiter.classify(start + secs(3.5)),
            Some(TimeoutKind::Inactivity)
        );
    }

    #[test]
    fn test_stale_activity_does_not_move_deadline_back() {
        let start = Instant::now();
        let policy = TimeoutPolicy::default().with_log_timeout(secs(2.0));
        let mut arbiter = TimeoutArbiter::new(policy, start);

        arbiter.record_activity(start + secs(3.0));
        arbiter.record_activity(start + secs(1.0));
        assert_eq!(arbiter.next_deadline(), Some(start + secs(5.0)));
    }

    #[test]
    fn test_activity_never_extends_absolute() {
        let start = Instant::now();
        let policy = TimeoutPolicy::new(Some(secs(4.0)), Some(secs(2.0)));
        let mut arbiter = TimeoutArbiter::new(policy, start);

        // A line every second keeps the inactivity deadline ahead of the absolute one.
        for i in 1..=4 {
            arbiter.record_activity(start + secs(i as f64));
        }
        assert_eq!(arbiter.next_deadline(), Some(start + secs(4.0)));
        assert_eq!(arbiter.classify(start + secs(4.0)), Some(TimeoutKind::Absolute));
    }

    #[test]
    fn test_absolute_wins_tie() {
        let start = Instant::now();
        let policy = TimeoutPolicy::new(Some(secs(2.0)), Some(secs(2.0)));
        let arbiter = TimeoutArbiter::new(policy, start);
        assert_eq!(arbiter.classify(start + secs(2.0)), Some(TimeoutKind::Absolute));
        assert_eq!(arbiter.classify(start + secs(10.0)), Some(TimeoutKind::Absolute));
    }

    #[test]
    fn test_inactivity_first_when_earlier() {
        let start = Instant::now();
        let policy = TimeoutPolicy::new(Some(secs(10.0)), Some(secs(2.0)));
        let mut arbiter = TimeoutArbiter::new(policy, start);
        arbiter.record_activity(start + secs(3.0));
        assert_eq!(arbiter.next_wakeup(start + secs(4.0)), Some(secs(1.0)));
        assert_eq!(
            arbiter.classify(start + secs(5.0)),
            Some(TimeoutKind::Inactivity)
        );
    }

    #[test]
    fn test_next_wakeup_saturates() {
        let start = Instant::now();
        let policy = TimeoutPolicy::default().with_timeout(secs(1.0));
        let arbiter = TimeoutArbiter::new(policy, start);
        assert_eq!(arbiter.next_wakeup(start + secs(5.0)), Some(Duration::ZERO));
    }

    #[test]
    fn test_configured_reports_kind_duration() {
        let policy = TimeoutPolicy::new(Some(secs(4.0)), Some(secs(2.0)));
        let arbiter = TimeoutArbiter::new(policy, Instant::now());
        assert_eq!(arbiter.configured(TimeoutKind::Absolute), secs(4.0));
        assert_eq!(arbiter.configured(TimeoutKind::Inactivity), secs(2.0));
    }
}
