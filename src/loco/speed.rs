//! Mapping between signed speed percentages and DCC speed bytes

use crate::network::{StationError, StationResult};
use crate::protocol::{Direction, SpeedStep, ThrottleSteps};

/// A speed quantised to the decoder's step resolution
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpeedCommand {
    pub direction: Direction,
    pub step: SpeedStep,
    /// Signed percentage the step actually represents
    pub percentage: f32,
}

impl SpeedCommand {
    /// Quantise `percentage` (-100..=100) to the nearest running step
    ///
    /// Zero and negative zero drive forward. Magnitudes that round to step
    /// zero become a regular stop.
    pub fn from_percentage(steps: ThrottleSteps, percentage: f32) -> StationResult<Self> {
        if !percentage.is_finite() || !(-100.0..=100.0).contains(&percentage) {
            return Err(StationError::InvalidArgument(format!(
                "speed must be within -100..=100 percent, got {}",
                percentage
            )));
        }

        let direction = if percentage < 0.0 {
            Direction::Reverse
        } else {
            Direction::Forward
        };

        let max = steps.max_step();
        let n = (percentage.abs() / 100.0 * max as f32).round() as u8;
        let step = if n == 0 {
            SpeedStep::Stop
        } else {
            SpeedStep::Running(n.min(max))
        };

        Ok(Self {
            direction,
            step,
            percentage: signed(steps.percentage(step), direction),
        })
    }

    /// Stop or emergency stop keeping the given direction
    pub fn stopped(direction: Direction, step: SpeedStep) -> Self {
        Self {
            direction,
            step,
            percentage: 0.0,
        }
    }

    /// `RVVVVVVV` byte of the drive command
    pub fn speed_byte(&self, steps: ThrottleSteps) -> u8 {
        steps.encode_step(self.step) | self.direction.speed_bit()
    }
}

fn signed(magnitude: f32, direction: Direction) -> f32 {
    match direction {
        Direction::Forward => magnitude,
        Direction::Reverse => -magnitude,
    }
}
