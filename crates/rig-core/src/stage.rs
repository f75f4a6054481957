use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One segment of the traffic shape: concurrency moves linearly from
/// `start_concurrency` to `end_concurrency` over `duration_ms`.
///
/// Fields are signed so that a bad declaration can be represented and
/// rejected by [`Stage::validate`] instead of silently wrapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    pub duration_ms: i64,
    pub start_concurrency: i64,
    pub end_concurrency: i64,
}

impl Stage {
    pub fn new(duration_ms: i64, start_concurrency: i64, end_concurrency: i64) -> Self {
        Self {
            duration_ms,
            start_concurrency,
            end_concurrency,
        }
    }

    pub fn validate(&self, index: usize) -> Result<(), ConfigError> {
        if self.duration_ms < 0 {
            return Err(ConfigError::NegativeDuration {
                index,
                duration_ms: self.duration_ms,
            });
        }
        if self.start_concurrency < 0 || self.end_concurrency < 0 {
            return Err(ConfigError::NegativeConcurrency {
                index,
                start: self.start_concurrency,
                end: self.end_concurrency,
            });
        }
        Ok(())
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms.max(0) as u64)
    }

    /// Interpolated concurrency `elapsed` into this stage, rounded to the
    /// nearest user and clamped to `[0, max(start, end)]`. A zero-duration
    /// stage is a step straight to `end_concurrency`.
    pub fn concurrency_at(&self, elapsed: Duration) -> u64 {
        let start = self.start_concurrency as f64;
        let end = self.end_concurrency as f64;
        let ceiling = self.start_concurrency.max(self.end_concurrency).max(0) as f64;

        if self.duration_ms <= 0 {
            return end.clamp(0.0, ceiling) as u64;
        }

        let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
        let fraction = (elapsed_ms / self.duration_ms as f64).min(1.0);
        let value = (start + (end - start) * fraction).round();
        value.clamp(0.0, ceiling) as u64
    }
}

/// Validated stage sequence. Stages are applied strictly in order and each
/// covers the half-open interval `[offset, offset + duration)` of the run.
#[derive(Debug, Clone)]
pub struct StagePlan {
    stages: Vec<Stage>,
}

impl StagePlan {
    pub fn new(stages: Vec<Stage>) -> Result<Self, ConfigError> {
        if stages.is_empty() {
            return Err(ConfigError::NoStages);
        }
        for (index, stage) in stages.iter().enumerate() {
            stage.validate(index)?;
        }
        Ok(Self { stages })
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn total_duration(&self) -> Duration {
        self.stages.iter().map(Stage::duration).sum()
    }

    /// Highest concurrency any stage declares.
    pub fn max_concurrency(&self) -> u64 {
        self.stages
            .iter()
            .map(|s| s.start_concurrency.max(s.end_concurrency).max(0) as u64)
            .max()
            .unwrap_or(0)
    }

    /// Index of the stage active at `elapsed`, or `None` once the plan is over.
    pub fn stage_index_at(&self, elapsed: Duration) -> Option<usize> {
        self.locate(elapsed).map(|(index, _)| index)
    }

    /// Target concurrency at `elapsed` since the run started, or `None` once
    /// every stage has elapsed.
    pub fn target_concurrency(&self, elapsed: Duration) -> Option<u64> {
        self.locate(elapsed)
            .map(|(index, offset)| self.stages[index].concurrency_at(elapsed - offset))
    }

    fn locate(&self, elapsed: Duration) -> Option<(usize, Duration)> {
        let mut offset = Duration::ZERO;
        for (index, stage) in self.stages.iter().enumerate() {
            let end = offset + stage.duration();
            if elapsed < end {
                return Some((index, offset));
            }
            offset = end;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_stage_plan() -> StagePlan {
        StagePlan::new(vec![
            Stage::new(30_000, 0, 100),
            Stage::new(60_000, 100, 100),
            Stage::new(30_000, 100, 0),
        ])
        .unwrap()
    }

    #[test]
    fn test_total_duration() {
        let plan = three_stage_plan();
        assert_eq!(plan.total_duration(), Duration::from_secs(120));
        assert_eq!(plan.max_concurrency(), 100);
    }

    #[test]
    fn test_linear_interpolation() {
        let plan = three_stage_plan();
        assert_eq!(plan.target_concurrency(Duration::ZERO), Some(0));
        assert_eq!(plan.target_concurrency(Duration::from_secs(15)), Some(50));
        assert_eq!(plan.target_concurrency(Duration::from_secs(3)), Some(10));
        assert_eq!(plan.target_concurrency(Duration::from_secs(60)), Some(100));
        assert_eq!(plan.target_concurrency(Duration::from_secs(105)), Some(50));
        assert_eq!(plan.target_concurrency(Duration::from_secs(120)), None);
    }

    #[test]
    fn test_boundary_continuity() {
        let plan = three_stage_plan();
        let stages = plan.stages();
        let mut offset = Duration::ZERO;
        for (idx, stage) in stages.iter().enumerate() {
            assert_eq!(
                stage.concurrency_at(Duration::ZERO),
                stage.start_concurrency as u64
            );
            assert_eq!(
                stage.concurrency_at(stage.duration()),
                stage.end_concurrency as u64
            );
            assert_eq!(
                plan.target_concurrency(offset),
                Some(stage.start_concurrency as u64),
                "stage {idx} start"
            );
            offset += stage.duration();
        }
    }

    #[test]
    fn test_rounding_and_clamp() {
        let stage = Stage::new(3_000, 0, 10);
        // 10 * 1/3 = 3.33 -> 3, 10 * 2/3 = 6.67 -> 7
        assert_eq!(stage.concurrency_at(Duration::from_secs(1)), 3);
        assert_eq!(stage.concurrency_at(Duration::from_secs(2)), 7);
        // Past the end of the stage stays at the end value.
        assert_eq!(stage.concurrency_at(Duration::from_secs(30)), 10);

        let down = Stage::new(1_000, 8, 2);
        assert_eq!(down.concurrency_at(Duration::from_millis(500)), 5);
        assert_eq!(down.concurrency_at(Duration::from_secs(5)), 2);
    }

    #[test]
    fn test_zero_duration_is_step_change() {
        let plan = StagePlan::new(vec![
            Stage::new(1_000, 5, 5),
            Stage::new(0, 5, 50),
            Stage::new(1_000, 50, 50),
        ])
        .unwrap();

        assert_eq!(plan.target_concurrency(Duration::from_millis(999)), Some(5));
        assert_eq!(plan.target_concurrency(Duration::from_millis(1_000)), Some(50));
        assert_eq!(plan.stage_index_at(Duration::from_millis(1_000)), Some(2));
        assert_eq!(Stage::new(0, 5, 50).concurrency_at(Duration::ZERO), 50);
    }

    #[test]
    fn test_rejects_negative_values() {
        let err = StagePlan::new(vec![Stage::new(1_000, 0, 1), Stage::new(-1, 0, 1)]).unwrap_err();
        assert!(matches!(err, ConfigError::NegativeDuration { index: 1, .. }));

        let err = StagePlan::new(vec![Stage::new(1_000, -3, 1)]).unwrap_err();
        assert!(matches!(err, ConfigError::NegativeConcurrency { index: 0, .. }));

        assert!(matches!(
            StagePlan::new(Vec::new()).unwrap_err(),
            ConfigError::NoStages
        ));
    }
}
