// Distance sensing for obstacle monitoring
//
// A sensor never fails from the caller's point of view: read errors and
// timeouts come back as the sensor's max-distance value ("far").

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

pub mod rangefinder;

pub use rangefinder::{RangeFinderError, SerialRangeFinder};

pub trait DistanceSensor: Send + Sync {
    /// One blocking, bounded reading in centimetres
    fn read_distance(&self) -> f32;

    /// Sentinel returned when a reading fails
    fn max_distance(&self) -> f32;
}

struct Script {
    pending: VecDeque<f32>,
    last: Option<f32>,
}

/// Replays a fixed sequence of readings, then holds the last one
pub struct ScriptedSensor {
    script: Mutex<Script>,
    max_distance: f32,
    reads: AtomicU64,
}

impl ScriptedSensor {
    pub fn new(readings: impl IntoIterator<Item = f32>, max_distance: f32) -> Self {
        Self {
            script: Mutex::new(Script {
                pending: readings.into_iter().collect(),
                last: None,
            }),
            max_distance,
            reads: AtomicU64::new(0),
        }
    }

    /// A sensor that never sees anything
    pub fn clear(max_distance: f32) -> Self {
        Self::new([], max_distance)
    }

    /// Queue more readings behind the current script
    pub fn push(&self, reading: f32) {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pending
            .push_back(reading);
    }

    pub fn remaining(&self) -> usize {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pending
            .len()
    }

    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Acquire)
    }
}

impl DistanceSensor for ScriptedSensor {
    fn read_distance(&self) -> f32 {
        let mut script = self.script.lock().unwrap_or_else(PoisonError::into_inner);
        let reading = match script.pending.pop_front() {
            Some(r) => {
                script.last = Some(r);
                r
            }
            None => script.last.unwrap_or(self.max_distance),
        };
        self.reads.fetch_add(1, Ordering::AcqRel);
        reading
    }

    fn max_distance(&self) -> f32 {
        self.max_distance
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_replays_then_holds_last() {
        let sensor = ScriptedSensor::new([30.0, 10.0], 400.0);
        assert_eq!(sensor.read_distance(), 30.0);
        assert_eq!(sensor.read_distance(), 10.0);
        assert_eq!(sensor.read_distance(), 10.0);
        assert_eq!(sensor.reads(), 3);
        assert_eq!(sensor.remaining(), 0);
    }

    #[test]
    fn test_empty_script_reads_far() {
        let sensor = ScriptedSensor::clear(400.0);
        assert_eq!(sensor.read_distance(), 400.0);

        sensor.push(12.0);
        assert_eq!(sensor.remaining(), 1);
        assert_eq!(sensor.read_distance(), 12.0);
    }
}
