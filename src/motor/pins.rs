// GPIO/PWM backend abstraction
//
// The driver never touches pins directly; every claim, level write and duty
// change goes through a `PinBackend`. `SimulatedPins` is the in-memory backend
// used for simulation runs and tests.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use serde::Serialize;
use tracing::debug;

/// Digital output level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum Level {
    #[default]
    Low,
    High,
}

/// Error types for pin operations
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum HardwareError {
    #[error("Pin {pin} is already claimed")]
    PinBusy { pin: u8 },

    #[error("Pin {pin} is not claimed as an output")]
    NotClaimed { pin: u8 },

    #[error("PWM is not running on pin {pin}")]
    PwmInactive { pin: u8 },

    #[error("Pin {pin} rejected the operation: {reason}")]
    Rejected { pin: u8, reason: String },
}

pub type Result<T> = std::result::Result<T, HardwareError>;

/// Pin-level hardware facility shared by the driver and its bring-up worker
pub trait PinBackend: Send + Sync {
    /// Reserve a pin as a digital output
    fn claim_output(&self, pin: u8) -> Result<()>;

    /// Drive a claimed output pin
    fn write(&self, pin: u8, level: Level) -> Result<()>;

    /// Start PWM on a claimed pin at 0% duty
    fn start_pwm(&self, pin: u8, frequency_hz: f32) -> Result<()>;

    /// Change the duty cycle (0-100) of a running PWM output
    fn set_duty(&self, pin: u8, duty: f32) -> Result<()>;

    /// Stop PWM output on a pin
    fn stop_pwm(&self, pin: u8) -> Result<()>;

    /// Give the pin reservation back
    fn release(&self, pin: u8) -> Result<()>;
}

/// Observable state of one simulated pin
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PinRecord {
    pub claimed: bool,
    pub level: Level,
    pub pwm_frequency_hz: Option<f32>,
    pub duty: f32,
}

#[derive(Default)]
struct SimulatedInner {
    pins: HashMap<u8, PinRecord>,
    setup_delay: Duration,
    failing_setup: HashSet<u8>,
    failing_writes: HashSet<u8>,
    writes: u64,
}

/// In-memory pin backend.
///
/// Clones share the same pin table, so a test can keep a handle while the
/// driver owns another.
#[derive(Clone, Default)]
pub struct SimulatedPins {
    inner: Arc<Mutex<SimulatedInner>>,
}

impl SimulatedPins {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay applied to every `claim_output`, modelling a slow bus
    pub fn with_setup_delay(self, delay: Duration) -> Self {
        self.lock().setup_delay = delay;
        self
    }

    pub fn set_setup_delay(&self, delay: Duration) {
        self.lock().setup_delay = delay;
    }

    /// Make claims of `pin` fail
    pub fn fail_setup(&self, pin: u8) {
        self.lock().failing_setup.insert(pin);
    }

    /// Make level and duty writes on `pin` fail
    pub fn fail_writes(&self, pin: u8) {
        self.lock().failing_writes.insert(pin);
    }

    pub fn clear_failures(&self) {
        let mut inner = self.lock();
        inner.failing_setup.clear();
        inner.failing_writes.clear();
    }

    pub fn pin(&self, pin: u8) -> Option<PinRecord> {
        self.lock().pins.get(&pin).copied()
    }

    /// Number of level/duty writes attempted so far
    pub fn write_count(&self) -> u64 {
        self.lock().writes
    }

    pub fn claimed_pins(&self) -> Vec<u8> {
        let mut pins: Vec<u8> = self
            .lock()
            .pins
            .iter()
            .filter(|(_, r)| r.claimed)
            .map(|(&p, _)| p)
            .collect();
        pins.sort_unstable();
        pins
    }

    fn lock(&self) -> MutexGuard<'_, SimulatedInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn claimed_mut(inner: &mut SimulatedInner, pin: u8) -> Result<&mut PinRecord> {
        match inner.pins.get_mut(&pin) {
            Some(record) if record.claimed => Ok(record),
            _ => Err(HardwareError::NotClaimed { pin }),
        }
    }
}

impl PinBackend for SimulatedPins {
    fn claim_output(&self, pin: u8) -> Result<()> {
        let delay = self.lock().setup_delay;
        if !delay.is_zero() {
            thread::sleep(delay);
        }

        let mut inner = self.lock();
        if inner.failing_setup.contains(&pin) {
            return Err(HardwareError::Rejected {
                pin,
                reason: "setup failed".to_string(),
            });
        }
        let record = inner.pins.entry(pin).or_default();
        if record.claimed {
            return Err(HardwareError::PinBusy { pin });
        }
        *record = PinRecord {
            claimed: true,
            ..PinRecord::default()
        };
        debug!("Claimed pin {}", pin);
        Ok(())
    }

    fn write(&self, pin: u8, level: Level) -> Result<()> {
        let mut inner = self.lock();
        inner.writes += 1;
        if inner.failing_writes.contains(&pin) {
            return Err(HardwareError::Rejected {
                pin,
                reason: "write failed".to_string(),
            });
        }
        Self::claimed_mut(&mut inner, pin)?.level = level;
        Ok(())
    }

    fn start_pwm(&self, pin: u8, frequency_hz: f32) -> Result<()> {
        let mut inner = self.lock();
        let record = Self::claimed_mut(&mut inner, pin)?;
        record.pwm_frequency_hz = Some(frequency_hz);
        record.duty = 0.0;
        Ok(())
    }

    fn set_duty(&self, pin: u8, duty: f32) -> Result<()> {
        let mut inner = self.lock();
        inner.writes += 1;
        if inner.failing_writes.contains(&pin) {
            return Err(HardwareError::Rejected {
                pin,
                reason: "duty write failed".to_string(),
            });
        }
        let record = Self::claimed_mut(&mut inner, pin)?;
        if record.pwm_frequency_hz.is_none() {
            return Err(HardwareError::PwmInactive { pin });
        }
        record.duty = duty.clamp(0.0, 100.0);
        Ok(())
    }

    fn stop_pwm(&self, pin: u8) -> Result<()> {
        let mut inner = self.lock();
        let record = Self::claimed_mut(&mut inner, pin)?;
        record.pwm_frequency_hz = None;
        record.duty = 0.0;
        Ok(())
    }

    fn release(&self, pin: u8) -> Result<()> {
        let mut inner = self.lock();
        match inner.pins.get_mut(&pin) {
            Some(record) if record.claimed => {
                *record = PinRecord::default();
                debug!("Released pin {}", pin);
                Ok(())
            }
            _ => Err(HardwareError::NotClaimed { pin }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_is_exclusive_until_released() {
        let pins = SimulatedPins::new();
        pins.claim_output(5).unwrap();
        assert_eq!(pins.claim_output(5), Err(HardwareError::PinBusy { pin: 5 }));

        pins.release(5).unwrap();
        assert_eq!(pins.release(5), Err(HardwareError::NotClaimed { pin: 5 }));
        pins.claim_output(5).unwrap();
    }

    #[test]
    fn test_duty_requires_running_pwm() {
        let pins = SimulatedPins::new();
        pins.claim_output(12).unwrap();
        assert_eq!(pins.set_duty(12, 40.0), Err(HardwareError::PwmInactive { pin: 12 }));

        pins.start_pwm(12, 100.0).unwrap();
        pins.set_duty(12, 40.0).unwrap();
        assert_eq!(pins.pin(12).unwrap().duty, 40.0);

        pins.stop_pwm(12).unwrap();
        let record = pins.pin(12).unwrap();
        assert_eq!(record.duty, 0.0);
        assert_eq!(record.pwm_frequency_hz, None);
    }

    #[test]
    fn test_clones_share_state_and_count_writes() {
        let pins = SimulatedPins::new();
        let handle = pins.clone();
        pins.claim_output(16).unwrap();
        pins.write(16, Level::High).unwrap();

        assert_eq!(handle.pin(16).unwrap().level, Level::High);
        assert_eq!(handle.write_count(), 1);
        assert_eq!(handle.claimed_pins(), vec![16]);
    }

    #[test]
    fn test_injected_failures() {
        let pins = SimulatedPins::new();
        pins.fail_setup(3);
        assert!(matches!(pins.claim_output(3), Err(HardwareError::Rejected { pin: 3, .. })));

        pins.claim_output(4).unwrap();
        pins.fail_writes(4);
        assert!(pins.write(4, Level::High).is_err());
        assert_eq!(pins.pin(4).unwrap().level, Level::Low);

        pins.clear_failures();
        pins.write(4, Level::High).unwrap();
    }
}
