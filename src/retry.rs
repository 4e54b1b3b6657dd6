use std::time::{Duration, Instant};

use crate::config::{fixed, RetryConfig};
use crate::error::FailureKind;
use crate::task::{Task, TaskState};

/// Outcome of recording a failure against a task, per spec §4.5. Made an
/// explicit return value — never re-derived later from `state !=
/// Pending` — resolving the Open Question in spec §9 on "task failed
/// permanently".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Recoverable: task returns to `pending`, will be retried once ready.
    RetryPending,
    /// Recoverable, and this failure also crossed a backoff boundary.
    Backoff,
    /// `retry_count` reached the fixed ceiling; the task is permanently
    /// failed and its queue must abort.
    PermanentFailure,
}

pub struct RetryPolicy {
    pub max_retry_before_backoff: u32,
    pub backoff_duration: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_retry_before_backoff: config.max_retry_before_backoff,
            backoff_duration: Duration::from_secs(config.backoff_duration),
        }
    }

    /// Records a recoverable command failure against `task`:
    /// - devices are released by the caller before this is called (§4.5);
    /// - `last_error` is set, `retry_count` increments;
    /// - if `retry_count % max_retry_before_backoff == 0`, `backoff_until`
    ///   is pushed forward (never backward — backoff is monotone, §8);
    /// - if `retry_count >= 100`, the task becomes permanently failed.
    pub fn record_failure(&self, task: &mut Task, error: FailureKind, now: Instant) -> Transition {
        task.state = TaskState::Pending;
        task.last_error = Some(error);
        task.retry_count += 1;

        if task.retry_count >= fixed::MAX_RETRY_CEILING {
            task.state = TaskState::Failed;
            return Transition::PermanentFailure;
        }

        if self.max_retry_before_backoff > 0
            && task.retry_count % self.max_retry_before_backoff == 0
        {
            let deadline = now + self.backoff_duration;
            task.backoff_until = Some(match task.backoff_until {
                Some(existing) if existing > deadline => existing,
                _ => deadline,
            });
            Transition::Backoff
        } else {
            Transition::RetryPending
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{TaskDescription, TaskId};

    fn task() -> Task {
        Task {
            id: TaskId { queue: 0, index: 0 },
            description: TaskDescription {
                commands: vec!["false".into()],
                device_count: 1,
                mem_gib: 1.0,
            },
            state: TaskState::Running { devices: vec![0] },
            retry_count: 0,
            backoff_until: None,
            last_error: None,
        }
    }

    #[test]
    fn s4_retry_cadence_hits_backoff_every_n_failures() {
        let policy = RetryPolicy {
            max_retry_before_backoff: 3,
            backoff_duration: Duration::from_secs(5),
        };
        let mut t = task();
        let now = Instant::now();
        let transitions: Vec<_> = (0..6)
            .map(|_| policy.record_failure(&mut t, FailureKind::ExitCode(1), now))
            .collect();
        assert_eq!(
            transitions,
            vec![
                Transition::RetryPending,
                Transition::RetryPending,
                Transition::Backoff,
                Transition::RetryPending,
                Transition::RetryPending,
                Transition::Backoff,
            ]
        );
        assert_eq!(t.retry_count, 6);
    }

    #[test]
    fn retry_ceiling_yields_permanent_failure() {
        let policy = RetryPolicy {
            max_retry_before_backoff: 1000,
            backoff_duration: Duration::from_secs(5),
        };
        let mut t = task();
        t.retry_count = fixed::MAX_RETRY_CEILING - 1;
        let transition = policy.record_failure(&mut t, FailureKind::Timeout, Instant::now());
        assert_eq!(transition, Transition::PermanentFailure);
        assert_eq!(t.state, TaskState::Failed);
    }

    #[test]
    fn backoff_until_never_decreases() {
        let policy = RetryPolicy {
            max_retry_before_backoff: 1,
            backoff_duration: Duration::from_secs(10),
        };
        let mut t = task();
        let now = Instant::now();
        policy.record_failure(&mut t, FailureKind::ExitCode(1), now);
        let first_deadline = t.backoff_until.unwrap();
        // A later failure recorded with an earlier "now" (clock jitter)
        // must not move the deadline backward.
        policy.record_failure(&mut t, FailureKind::ExitCode(1), now);
        assert!(t.backoff_until.unwrap() >= first_deadline);
    }

    #[test]
    fn devices_are_cleared_on_failure() {
        let policy = RetryPolicy {
            max_retry_before_backoff: 3,
            backoff_duration: Duration::from_secs(5),
        };
        let mut t = task();
        assert!(matches!(t.state, TaskState::Running { .. }));
        policy.record_failure(&mut t, FailureKind::ExitCode(1), Instant::now());
        assert_eq!(t.state, TaskState::Pending);
    }
}
