//! Per-run resource limits.
//!
//! Both checks are pure functions of the stats passed in, so calling them
//! repeatedly with the same stats always gives the same answer.

use std::time::Duration;

use serde::Serialize;

use crate::policy::{PolicyEngine, ValidationResult, Violation, ViolationKind};

/// Size of the cumulative change set a write would produce.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DiffStats {
    pub files_changed: usize,
    pub lines_added: usize,
    pub lines_removed: usize,
}

impl DiffStats {
    pub fn changed_lines(&self) -> usize {
        self.lines_added + self.lines_removed
    }
}

/// Progress of the current run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RuntimeStats {
    pub elapsed: Duration,
    pub steps_executed: u32,
    pub files_touched: usize,
}

impl PolicyEngine {
    pub fn enforce_diff_limits(&self, stats: &DiffStats) -> ValidationResult {
        self.check_diff_limits(stats).into()
    }

    pub fn check_diff_limits(&self, stats: &DiffStats) -> Result<(), Violation> {
        let limits = &self.policy().limits;
        if stats.files_changed > limits.max_files_per_run {
            return Err(Violation::new(
                ViolationKind::LimitExceeded,
                format!(
                    "Diff would touch {} files (max {} per run)",
                    stats.files_changed, limits.max_files_per_run
                ),
            ));
        }
        if stats.changed_lines() > limits.max_diff_lines_per_run {
            return Err(Violation::new(
                ViolationKind::LimitExceeded,
                format!(
                    "Diff would change {} lines (max {} per run)",
                    stats.changed_lines(),
                    limits.max_diff_lines_per_run
                ),
            ));
        }
        Ok(())
    }

    pub fn enforce_runtime_limits(&self, stats: &RuntimeStats) -> ValidationResult {
        self.check_runtime_limits(stats).into()
    }

    pub fn check_runtime_limits(&self, stats: &RuntimeStats) -> Result<(), Violation> {
        let limits = &self.policy().limits;
        let max_runtime = Duration::from_secs(limits.max_runtime_minutes.saturating_mul(60));
        if stats.elapsed > max_runtime {
            return Err(Violation::new(
                ViolationKind::LimitExceeded,
                format!(
                    "Runtime limit exceeded: {:.1} minutes (max {})",
                    stats.elapsed.as_secs_f64() / 60.0,
                    limits.max_runtime_minutes
                ),
            ));
        }
        if stats.steps_executed > limits.max_steps_per_run {
            return Err(Violation::new(
                ViolationKind::LimitExceeded,
                format!(
                    "Step limit exceeded: {} steps (max {})",
                    stats.steps_executed, limits.max_steps_per_run
                ),
            ));
        }
        if stats.files_touched > limits.max_files_per_run {
            return Err(Violation::new(
                ViolationKind::LimitExceeded,
                format!(
                    "File limit exceeded: {} files touched (max {})",
                    stats.files_touched, limits.max_files_per_run
                ),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandcastle_config::{Policy, PolicyLimits};

    fn engine() -> (tempfile::TempDir, PolicyEngine) {
        let dir = tempfile::tempdir().unwrap();
        let policy = Policy {
            limits: PolicyLimits {
                max_steps_per_run: 5,
                max_files_per_run: 2,
                max_diff_lines_per_run: 10,
                max_runtime_minutes: 1,
            },
            ..Policy::default()
        };
        let engine = PolicyEngine::new(dir.path(), policy).unwrap();
        (dir, engine)
    }

    #[test]
    fn diff_within_limits() {
        let (_dir, engine) = engine();
        let stats = DiffStats {
            files_changed: 2,
            lines_added: 6,
            lines_removed: 4,
        };
        assert!(engine.enforce_diff_limits(&stats).allowed);
    }

    #[test]
    fn too_many_files() {
        let (_dir, engine) = engine();
        let stats = DiffStats {
            files_changed: 3,
            ..DiffStats::default()
        };
        let result = engine.enforce_diff_limits(&stats);
        assert_eq!(result.kind, Some(ViolationKind::LimitExceeded));
        assert!(result.reason.unwrap().contains("3 files"));
    }

    #[test]
    fn too_many_lines_counts_added_and_removed() {
        let (_dir, engine) = engine();
        let stats = DiffStats {
            files_changed: 1,
            lines_added: 6,
            lines_removed: 5,
        };
        let result = engine.enforce_diff_limits(&stats);
        assert!(result.reason.unwrap().contains("11 lines"));
    }

    #[test]
    fn runtime_checks_each_limit() {
        let (_dir, engine) = engine();
        let ok = RuntimeStats {
            elapsed: Duration::from_secs(30),
            steps_executed: 5,
            files_touched: 2,
        };
        assert!(engine.enforce_runtime_limits(&ok).allowed);

        let slow = RuntimeStats {
            elapsed: Duration::from_secs(61),
            ..ok
        };
        assert!(
            engine
                .enforce_runtime_limits(&slow)
                .reason
                .unwrap()
                .contains("Runtime limit")
        );

        let busy = RuntimeStats {
            steps_executed: 6,
            ..ok
        };
        assert!(
            engine
                .enforce_runtime_limits(&busy)
                .reason
                .unwrap()
                .contains("Step limit")
        );

        let wide = RuntimeStats {
            files_touched: 3,
            ..ok
        };
        assert!(
            engine
                .enforce_runtime_limits(&wide)
                .reason
                .unwrap()
                .contains("File limit")
        );
    }

    #[test]
    fn limit_checks_are_idempotent() {
        let (_dir, engine) = engine();
        let stats = RuntimeStats {
            elapsed: Duration::from_secs(10),
            steps_executed: 9,
            files_touched: 0,
        };
        let first = engine.enforce_runtime_limits(&stats);
        let second = engine.enforce_runtime_limits(&stats);
        assert_eq!(first, second);

        let diff = DiffStats {
            files_changed: 1,
            lines_added: 3,
            lines_removed: 0,
        };
        assert_eq!(engine.enforce_diff_limits(&diff), engine.enforce_diff_limits(&diff));
    }
}
