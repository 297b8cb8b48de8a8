//! Ramp profiles for the step pulse train.
//!
//! A profile stores only the acceleration table. Deceleration is always the
//! exact reverse, so start and stop are symmetric by construction.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::events::AxisState;

/// One ramp level: `steps` pulses at `frequency_hz`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RampLevel {
    pub frequency_hz: f64,
    pub steps: u32,
}

impl RampLevel {
    pub fn new(frequency_hz: f64, steps: u32) -> Self {
        Self { frequency_hz, steps }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RampProfile {
    up: Vec<RampLevel>,
}

/// Hand-tuned sigmoid of the rig, (Hz, steps).
const DEFAULT_TABLE: [(f64, u32); 10] = [
    (7.0, 0),
    (20.0, 0),
    (57.0, 1),
    (154.0, 1),
    (354.0, 1),
    (622.0, 1),
    (832.0, 1),
    (937.0, 1),
    (978.0, 1),
    (993.0, 1),
];

impl RampProfile {
    pub fn from_table(levels: Vec<RampLevel>) -> Result<Self> {
        for (i, level) in levels.iter().enumerate() {
            if !level.frequency_hz.is_finite() || level.frequency_hz <= 0.0 {
                return Err(anyhow!(
                    "Ramp level {} has invalid frequency {} Hz",
                    i,
                    level.frequency_hz
                ));
            }
        }
        Ok(Self { up: levels })
    }

    /// Logistic acceleration curve between `min_hz` and `max_hz`.
    pub fn sigmoid(
        levels: usize,
        min_hz: f64,
        max_hz: f64,
        steps_per_level: u32,
        steepness: f64,
    ) -> Result<Self> {
        if levels == 0 {
            return Err(anyhow!("Sigmoid ramp needs at least one level"));
        }
        if !(min_hz >= 0.0 && max_hz > min_hz) {
            return Err(anyhow!(
                "Sigmoid ramp needs 0 <= min_hz < max_hz (got {} .. {})",
                min_hz,
                max_hz
            ));
        }
        let centre = (levels as f64 - 1.0) / 2.0;
        let table = (0..levels)
            .map(|i| {
                let x = steepness * (i as f64 - centre);
                let s = 1.0 / (1.0 + (-x).exp());
                RampLevel::new(min_hz + (max_hz - min_hz) * s, steps_per_level)
            })
            .collect();
        Self::from_table(table)
    }

    pub fn default_table() -> Self {
        Self {
            up: DEFAULT_TABLE
                .iter()
                .map(|&(f, s)| RampLevel::new(f, s))
                .collect(),
        }
    }

    /// A profile with no ramp: moves start and stop at full rate.
    pub fn none() -> Self {
        Self { up: Vec::new() }
    }

    pub fn ramp_up(&self) -> &[RampLevel] {
        &self.up
    }

    pub fn ramp_down(&self) -> Vec<RampLevel> {
        self.up.iter().rev().copied().collect()
    }

    pub fn ramp_steps(&self) -> u64 {
        self.up.iter().map(|l| l.steps as u64).sum()
    }

    pub fn peak_hz(&self) -> Option<f64> {
        self.up
            .iter()
            .filter(|l| l.steps > 0)
            .map(|l| l.frequency_hz)
            .fold(None, |acc: Option<f64>, f| Some(acc.map_or(f, |a| a.max(f))))
    }

    /// Plan a move of exactly `total_steps` pulses.
    ///
    /// Acceleration uses at most half of the steps, truncating the table for
    /// short moves. Deceleration mirrors whatever acceleration was used.
    pub fn plan_move(&self, total_steps: u64, steady_hz: f64) -> MovePlan {
        let half = total_steps / 2;
        let mut budget = half;
        let mut accel = Vec::new();
        for level in self.up.iter().filter(|l| l.steps > 0) {
            if budget == 0 {
                break;
            }
            let take = (level.steps as u64).min(budget);
            accel.push(RampLevel::new(level.frequency_hz, take as u32));
            budget -= take;
        }
        let accel_steps: u64 = accel.iter().map(|l| l.steps as u64).sum();
        let truncated = accel_steps < self.ramp_steps();
        let cruise_steps = total_steps - 2 * accel_steps;

        let cruise_hz = if truncated {
            accel
                .last()
                .map(|l| l.frequency_hz)
                .or_else(|| self.up.iter().find(|l| l.steps > 0).map(|l| l.frequency_hz))
                .unwrap_or(steady_hz)
        } else {
            steady_hz
        };

        let mut segments = Vec::with_capacity(accel.len() * 2 + 1);
        for level in &accel {
            segments.push(Segment { phase: AxisState::RampingUp, level: *level });
        }
        if cruise_steps > 0 {
            // RampLevel::steps is u32; split very long cruises.
            let mut remaining = cruise_steps;
            while remaining > 0 {
                let chunk = remaining.min(u32::MAX as u64);
                segments.push(Segment {
                    phase: AxisState::Steady,
                    level: RampLevel::new(cruise_hz, chunk as u32),
                });
                remaining -= chunk;
            }
        }
        for level in accel.iter().rev() {
            segments.push(Segment { phase: AxisState::RampingDown, level: *level });
        }
        MovePlan { segments }
    }
}

impl Default for RampProfile {
    fn default() -> Self {
        Self::default_table()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Segment {
    pub phase: AxisState,
    pub level: RampLevel,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct MovePlan {
    pub segments: Vec<Segment>,
}

impl MovePlan {
    pub fn total_steps(&self) -> u64 {
        self.segments.iter().map(|s| s.level.steps as u64).sum()
    }

    pub fn phase_levels(&self, phase: AxisState) -> Vec<RampLevel> {
        self.segments
            .iter()
            .filter(|s| s.phase == phase)
            .map(|s| s.level)
            .collect()
    }

    /// Frequencies of every pulse in order.
    pub fn pulse_frequencies(&self) -> Vec<f64> {
        self.segments
            .iter()
            .flat_map(|s| std::iter::repeat(s.level.frequency_hz).take(s.level.steps as usize))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ramp_down_is_exact_reverse() {
        let profiles = vec![
            RampProfile::default_table(),
            RampProfile::sigmoid(12, 5.0, 1500.0, 3, 0.8).unwrap(),
            RampProfile::none(),
        ];
        for profile in profiles {
            let mut down = profile.ramp_down();
            down.reverse();
            assert_eq!(down, profile.ramp_up());
        }
    }

    #[test]
    fn default_table_matches_rig() {
        let profile = RampProfile::default_table();
        assert_eq!(profile.ramp_up().len(), 10);
        assert_eq!(profile.ramp_steps(), 8);
        assert_eq!(profile.peak_hz(), Some(993.0));
    }

    #[test]
    fn sigmoid_is_monotonic_and_bounded() {
        let profile = RampProfile::sigmoid(10, 0.0, 1000.0, 1, 1.0).unwrap();
        let freqs: Vec<f64> = profile.ramp_up().iter().map(|l| l.frequency_hz).collect();
        for pair in freqs.windows(2) {
            assert!(pair[1] > pair[0]);
        }
        assert!(freqs[0] > 0.0 && freqs[0] < 20.0);
        assert!(freqs[9] < 1000.0 && freqs[9] > 980.0);
    }

    #[test]
    fn invalid_tables_are_rejected() {
        assert!(RampProfile::from_table(vec![RampLevel::new(0.0, 1)]).is_err());
        assert!(RampProfile::from_table(vec![RampLevel::new(f64::NAN, 1)]).is_err());
        assert!(RampProfile::sigmoid(0, 0.0, 10.0, 1, 1.0).is_err());
        assert!(RampProfile::sigmoid(5, 10.0, 10.0, 1, 1.0).is_err());
    }

    #[test]
    fn long_move_uses_full_ramp_and_cruises() {
        let plan = RampProfile::default_table().plan_move(20, 1000.0);
        assert_eq!(plan.total_steps(), 20);
        let up = plan.phase_levels(AxisState::RampingUp);
        let mut down = plan.phase_levels(AxisState::RampingDown);
        down.reverse();
        assert_eq!(up, down);
        let cruise = plan.phase_levels(AxisState::Steady);
        assert_eq!(cruise, vec![RampLevel::new(1000.0, 4)]);
    }

    #[test]
    fn short_move_truncates_ramp_symmetrically() {
        let plan = RampProfile::default_table().plan_move(5, 1000.0);
        assert_eq!(plan.total_steps(), 5);
        let freqs = plan.pulse_frequencies();
        assert_eq!(freqs, vec![57.0, 154.0, 154.0, 154.0, 57.0]);
    }

    #[test]
    fn single_and_zero_step_moves() {
        let profile = RampProfile::default_table();
        assert_eq!(profile.plan_move(0, 1000.0).total_steps(), 0);
        assert_eq!(profile.plan_move(1, 1000.0).pulse_frequencies(), vec![57.0]);
        assert_eq!(RampProfile::none().plan_move(3, 800.0).pulse_frequencies(), vec![800.0; 3]);
    }
}
