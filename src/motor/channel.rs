// Channel records and speed normalization

use serde::Serialize;

use super::pins::Level;
use crate::config::{ChannelPins, SpeedLimits};

/// Magnitudes above this are applied as full speed
pub const FULL_SPEED_DETENT: f32 = 95.0;

/// Rotation direction of one channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Forward,
    Backward,
    #[default]
    Neutral,
}

impl Direction {
    /// (in1, in2) levels that select this direction
    pub fn pin_levels(self) -> (Level, Level) {
        match self {
            Direction::Forward => (Level::High, Level::Low),
            Direction::Backward => (Level::Low, Level::High),
            Direction::Neutral => (Level::Low, Level::Low),
        }
    }
}

/// One motor output as tracked by the driver
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MotorChannel {
    pub id: u8,
    #[serde(skip)]
    pub pins: Option<ChannelPins>,
    pub duty: f32,
    pub direction: Direction,
    pub available: bool,
}

impl MotorChannel {
    pub fn new(id: u8, pins: Option<ChannelPins>) -> Self {
        Self {
            id,
            pins,
            duty: 0.0,
            direction: Direction::Neutral,
            available: false,
        }
    }

    /// Back to neutral and unavailable
    pub(crate) fn reset(&mut self) {
        self.duty = 0.0;
        self.direction = Direction::Neutral;
        self.available = false;
    }
}

/// Map a signed speed request to the (direction, duty) pair applied to a channel.
///
/// The request is clamped to `[-max, max]`, magnitudes above the full-speed
/// detent snap to 100, and non-zero magnitudes under `min` become a stop.
pub fn normalize_speed(speed: f32, limits: SpeedLimits) -> (Direction, f32) {
    if speed.is_nan() {
        return (Direction::Neutral, 0.0);
    }

    let clamped = speed.clamp(-limits.max, limits.max);
    let mut magnitude = clamped.abs();
    if magnitude > FULL_SPEED_DETENT {
        magnitude = 100.0;
    }
    if magnitude < limits.min || magnitude == 0.0 {
        return (Direction::Neutral, 0.0);
    }

    let direction = if clamped > 0.0 {
        Direction::Forward
    } else {
        Direction::Backward
    };
    (direction, magnitude)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> SpeedLimits {
        SpeedLimits::default()
    }

    #[test]
    fn test_sign_selects_direction() {
        assert_eq!(normalize_speed(40.0, limits()), (Direction::Forward, 40.0));
        assert_eq!(normalize_speed(-40.0, limits()), (Direction::Backward, 40.0));
        assert_eq!(normalize_speed(0.0, limits()), (Direction::Neutral, 0.0));
        assert_eq!(normalize_speed(-0.0, limits()), (Direction::Neutral, 0.0));
    }

    #[test]
    fn test_full_speed_detent() {
        assert_eq!(normalize_speed(95.0, limits()), (Direction::Forward, 95.0));
        assert_eq!(normalize_speed(95.5, limits()), (Direction::Forward, 100.0));
        assert_eq!(normalize_speed(-96.0, limits()), (Direction::Backward, 100.0));
    }

    #[test]
    fn test_applied_magnitude_always_in_range() {
        for s in -150i32..=150 {
            let (direction, duty) = normalize_speed(s as f32, limits());
            assert!((0.0..=100.0).contains(&duty), "speed {} gave duty {}", s, duty);
            if s.abs() > 95 {
                assert_eq!(duty, 100.0, "speed {} should snap to full", s);
            } else {
                assert_eq!(duty, s.abs() as f32);
            }
            assert_eq!(direction == Direction::Neutral, s == 0);
        }
    }

    #[test]
    fn test_lower_max_disables_detent_and_min_is_dead_band() {
        let limits = SpeedLimits { min: 10.0, max: 80.0 };
        assert_eq!(normalize_speed(120.0, limits), (Direction::Forward, 80.0));
        assert_eq!(normalize_speed(5.0, limits), (Direction::Neutral, 0.0));
        assert_eq!(normalize_speed(-10.0, limits), (Direction::Backward, 10.0));
    }

    #[test]
    fn test_nan_is_a_stop() {
        assert_eq!(normalize_speed(f32::NAN, limits()), (Direction::Neutral, 0.0));
    }

    #[test]
    fn test_direction_pin_levels() {
        assert_eq!(Direction::Forward.pin_levels(), (Level::High, Level::Low));
        assert_eq!(Direction::Backward.pin_levels(), (Level::Low, Level::High));
        assert_eq!(Direction::Neutral.pin_levels(), (Level::Low, Level::Low));
    }
}
