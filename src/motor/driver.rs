// Motor driver for the drive channels
//
// Owns the channel table and the driver state behind one exclusive lock.
// Every public method takes the lock exactly once and never calls another
// public method while holding it. Hardware bring-up runs on a worker thread
// bounded by the caller's timeout.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::channel::{Direction, MotorChannel, normalize_speed};
use super::pins::{HardwareError, Level, PinBackend};
use crate::config::{ChannelPins, ChannelSpec, SpeedLimits, ValidatedConfig};

/// Lifecycle of the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverState {
    #[default]
    Uninitialized,
    Initializing,
    Ready,
    Faulted,
}

/// Error types for motor driver operations
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DriverError {
    #[error("Channel {channel} configuration error: {reason}")]
    Configuration { channel: u8, reason: String },

    #[error("Initialization timed out after {0:?}")]
    InitializationTimeout(Duration),

    #[error("Hardware write failed on channel {channel}: {source}")]
    HardwareWrite {
        channel: u8,
        #[source]
        source: HardwareError,
    },

    #[error("Driver not ready (state: {0:?})")]
    NotReady(DriverState),

    #[error("Channel {0} is unavailable")]
    ChannelUnavailable(u8),

    #[error("Unknown channel {0}")]
    UnknownChannel(u8),

    #[error("No channels could be activated")]
    NoChannelsActivated,

    #[error("Bring-up worker exited without reporting")]
    WorkerLost,
}

/// What a bring-up worker achieved
#[derive(Debug, Default)]
struct BringUpReport {
    activated: Vec<u8>,
    failures: Vec<DriverError>,
    cancelled: bool,
}

/// Everything the worker thread needs, moved into it
struct BringUpJob {
    backend: Arc<dyn PinBackend>,
    specs: Vec<ChannelSpec>,
    pwm_frequency_hz: f32,
    cancel: Arc<AtomicBool>,
}

impl BringUpJob {
    fn run(self) -> BringUpReport {
        let backend = self.backend.as_ref();

        // Stale state from an earlier session or instance
        for pins in self.specs.iter().filter_map(|s| s.pins) {
            teardown_pins(backend, pins, true);
        }

        let mut report = BringUpReport::default();
        for spec in &self.specs {
            if self.cancel.load(Ordering::Acquire) {
                break;
            }

            let Some(pins) = spec.pins else {
                report.failures.push(DriverError::Configuration {
                    channel: spec.id,
                    reason: "no valid pin assignment".to_string(),
                });
                continue;
            };

            match activate_pins(backend, pins, self.pwm_frequency_hz) {
                Ok(()) => {
                    info!("Channel {} initialized on PWM pin {}", spec.id, pins.pwm);
                    report.activated.push(spec.id);
                }
                Err(e) => {
                    warn!("Channel {} bring-up failed: {}", spec.id, e);
                    teardown_pins(backend, pins, true);
                    report.failures.push(DriverError::HardwareWrite {
                        channel: spec.id,
                        source: e,
                    });
                }
            }
        }

        if self.cancel.load(Ordering::Acquire) {
            // Nobody will install this result; give the pins back
            report.cancelled = true;
            for id in report.activated.drain(..) {
                if let Some(pins) = self.specs.iter().find(|s| s.id == id).and_then(|s| s.pins) {
                    teardown_pins(backend, pins, true);
                }
            }
            info!("Cancelled bring-up released its pins");
        }

        report
    }
}

/// Direction pins LOW, PWM started at 0%
fn activate_pins(
    backend: &dyn PinBackend,
    pins: ChannelPins,
    frequency_hz: f32,
) -> Result<(), HardwareError> {
    backend.claim_output(pins.in1)?;
    backend.claim_output(pins.in2)?;
    backend.write(pins.in1, Level::Low)?;
    backend.write(pins.in2, Level::Low)?;
    backend.claim_output(pins.pwm)?;
    backend.start_pwm(pins.pwm, frequency_hz)?;
    backend.set_duty(pins.pwm, 0.0)
}

/// Best-effort neutralize, optionally releasing the reservations. Errors are
/// expected here (pins may never have been claimed) and are only logged.
fn teardown_pins(backend: &dyn PinBackend, pins: ChannelPins, release: bool) {
    let _ = backend.write(pins.in1, Level::Low);
    let _ = backend.write(pins.in2, Level::Low);
    let _ = backend.set_duty(pins.pwm, 0.0);
    let _ = backend.stop_pwm(pins.pwm);
    if release {
        for pin in pins.all() {
            if let Err(e) = backend.release(pin) {
                debug!("Release of pin {} skipped: {}", pin, e);
            }
        }
    }
}

/// Bring-up worker that outlived its caller's timeout
struct OrphanWorker {
    cancel: Arc<AtomicBool>,
    done: Receiver<BringUpReport>,
    handle: JoinHandle<()>,
}

/// Time left before `deadline`; `None` means no deadline
fn time_left(deadline: Option<Instant>) -> Duration {
    deadline.map_or(Duration::MAX, |d| d.saturating_duration_since(Instant::now()))
}

impl OrphanWorker {
    /// Wait for the worker to exit, handing it back if it is still running at `deadline`.
    /// A result that finished before seeing the cancel flag has its pins released here.
    fn wait_until(
        self,
        deadline: Option<Instant>,
        backend: &dyn PinBackend,
        specs: &[ChannelSpec],
    ) -> Result<(), Self> {
        match self.done.recv_timeout(time_left(deadline)) {
            Ok(report) => {
                if !report.cancelled {
                    debug!("Discarding late bring-up result {:?}", report.activated);
                    for id in &report.activated {
                        if let Some(pins) = specs.iter().find(|s| s.id == *id).and_then(|s| s.pins) {
                            teardown_pins(backend, pins, true);
                        }
                    }
                }
                let _ = self.handle.join();
                Ok(())
            }
            Err(RecvTimeoutError::Disconnected) => {
                let _ = self.handle.join();
                Ok(())
            }
            Err(RecvTimeoutError::Timeout) => Err(self),
        }
    }
}

struct DriverInner {
    state: DriverState,
    channels: Vec<MotorChannel>,
    // True while any configured pin may still be reserved with the backend
    pins_reserved: bool,
    last_fault: Option<DriverError>,
    orphan: Option<OrphanWorker>,
}

impl DriverInner {
    fn transition(&mut self, next: DriverState) {
        if self.state != next {
            info!("Motor driver {:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }

    fn fault(&mut self, err: DriverError) -> DriverState {
        error!("Motor initialization failed: {}", err);
        self.last_fault = Some(err);
        self.transition(DriverState::Faulted);
        DriverState::Faulted
    }

    fn install(&mut self, report: BringUpReport) -> DriverState {
        for channel in &mut self.channels {
            channel.available = report.activated.contains(&channel.id);
        }

        if report.activated.is_empty() {
            self.pins_reserved = false;
            return self.fault(DriverError::NoChannelsActivated);
        }

        self.pins_reserved = true;
        if !report.failures.is_empty() {
            warn!(
                "{} channel(s) unavailable after bring-up",
                report.failures.len()
            );
        }
        info!("Motors initialized: channels {:?} active", report.activated);
        self.transition(DriverState::Ready);
        DriverState::Ready
    }

    fn channel_mut(&mut self, id: u8) -> Option<&mut MotorChannel> {
        self.channels.iter_mut().find(|c| c.id == id)
    }
}

/// Thread-safe driver for all motor channels.
///
/// Share it as `Arc<MotorDriver>`; every method takes `&self`.
pub struct MotorDriver {
    backend: Arc<dyn PinBackend>,
    specs: Vec<ChannelSpec>,
    limits: SpeedLimits,
    pwm_frequency_hz: f32,
    inner: Mutex<DriverInner>,
}

impl MotorDriver {
    /// Create an uninitialized driver; no hardware is touched until `initialize`
    pub fn new(config: &ValidatedConfig, backend: Arc<dyn PinBackend>) -> Self {
        let channels = config
            .channels
            .iter()
            .map(|spec| MotorChannel::new(spec.id, spec.pins))
            .collect();

        Self {
            backend,
            specs: config.channels.clone(),
            limits: config.limits,
            pwm_frequency_hz: config.pwm_frequency_hz,
            inner: Mutex::new(DriverInner {
                state: DriverState::Uninitialized,
                channels,
                pins_reserved: false,
                last_fault: None,
                orphan: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, DriverInner> {
        // Critical sections leave the table consistent with hardware, so a
        // poisoned lock is still usable
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bring up every configured channel, blocking at most `timeout`.
    ///
    /// Returns `Ready` if at least one channel activated, `Faulted` otherwise.
    /// On timeout the worker is cancelled and releases whatever it claimed;
    /// the next call waits for it before touching hardware.
    pub fn initialize(&self, timeout: Duration) -> DriverState {
        let mut inner = self.lock();
        self.bring_up(&mut inner, timeout)
    }

    /// Initialize only if the driver is not already `Ready`
    pub fn ensure_ready(&self, timeout: Duration) -> bool {
        let mut inner = self.lock();
        if inner.state == DriverState::Ready {
            return true;
        }
        self.bring_up(&mut inner, timeout) == DriverState::Ready
    }

    fn bring_up(&self, inner: &mut DriverInner, timeout: Duration) -> DriverState {
        let deadline = Instant::now().checked_add(timeout);
        inner.transition(DriverState::Initializing);
        inner.last_fault = None;
        for channel in &mut inner.channels {
            channel.reset();
        }

        if let Some(orphan) = inner.orphan.take() {
            if let Err(orphan) = orphan.wait_until(deadline, self.backend.as_ref(), &self.specs) {
                warn!("Previous bring-up is still running");
                inner.orphan = Some(orphan);
                return inner.fault(DriverError::InitializationTimeout(timeout));
            }
        }

        info!(
            "Initializing {} motor channels at {} Hz PWM (timeout {:?})",
            self.specs.len(),
            self.pwm_frequency_hz,
            timeout
        );

        let cancel = Arc::new(AtomicBool::new(false));
        let job = BringUpJob {
            backend: Arc::clone(&self.backend),
            specs: self.specs.clone(),
            pwm_frequency_hz: self.pwm_frequency_hz,
            cancel: Arc::clone(&cancel),
        };
        let (tx, rx) = mpsc::channel();

        let spawned = thread::Builder::new()
            .name("motor-bring-up".into())
            .spawn(move || {
                let _ = tx.send(job.run());
            });
        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                error!("Failed to spawn bring-up worker: {}", e);
                return inner.fault(DriverError::WorkerLost);
            }
        };

        match rx.recv_timeout(time_left(deadline)) {
            Ok(report) => {
                let _ = handle.join();
                inner.install(report)
            }
            Err(RecvTimeoutError::Timeout) => {
                cancel.store(true, Ordering::Release);
                inner.orphan = Some(OrphanWorker {
                    cancel,
                    done: rx,
                    handle,
                });
                inner.fault(DriverError::InitializationTimeout(timeout))
            }
            Err(RecvTimeoutError::Disconnected) => {
                let _ = handle.join();
                inner.fault(DriverError::WorkerLost)
            }
        }
    }

    /// Set one channel's signed speed (-100..=100). Returns false without
    /// touching hardware if the driver is not ready or the channel is unavailable.
    pub fn set_speed(&self, channel: u8, speed: f32) -> bool {
        let mut inner = self.lock();
        match self.apply_speed(&mut inner, channel, speed) {
            Ok(()) => true,
            Err(e) => {
                warn!("set_speed({}, {}) failed: {}", channel, speed, e);
                false
            }
        }
    }

    /// Bring every available channel to neutral under a single lock acquisition
    pub fn stop_all(&self) -> bool {
        let mut inner = self.lock();
        if inner.state != DriverState::Ready {
            warn!("Cannot stop motors: driver is {:?}", inner.state);
            return false;
        }

        let ids: Vec<u8> = inner
            .channels
            .iter()
            .filter(|c| c.available)
            .map(|c| c.id)
            .collect();

        let mut ok = true;
        for id in ids {
            if let Err(e) = self.apply_speed(&mut inner, id, 0.0) {
                warn!("Failed to stop channel {}: {}", id, e);
                ok = false;
            }
        }
        info!("Stopped all motors");
        ok
    }

    /// Neutralize every channel and stop PWM; with `reset_hardware` also hand
    /// the pin reservations back. Always leaves the driver `Uninitialized`.
    pub fn cleanup(&self, reset_hardware: bool) -> bool {
        let mut inner = self.lock();
        if let Some(orphan) = &inner.orphan {
            orphan.cancel.store(true, Ordering::Release);
        }

        let release = reset_hardware && inner.pins_reserved;
        if inner.state == DriverState::Uninitialized && !release {
            debug!("Cleanup: nothing to do");
            return true;
        }

        let backend = self.backend.as_ref();
        let reserved = inner.pins_reserved;
        let mut ok = true;

        for channel in &mut inner.channels {
            let Some(pins) = channel.pins else {
                continue;
            };

            if reserved {
                let neutral = backend
                    .write(pins.in1, Level::Low)
                    .and_then(|_| backend.write(pins.in2, Level::Low))
                    .and_then(|_| backend.set_duty(pins.pwm, 0.0))
                    .and_then(|_| backend.stop_pwm(pins.pwm));
                match neutral {
                    Ok(()) => debug!("Channel {} PWM stopped", channel.id),
                    Err(e) if channel.available => {
                        warn!("Channel {} cleanup error: {}", channel.id, e);
                        ok = false;
                    }
                    Err(e) => debug!("Channel {} was not active: {}", channel.id, e),
                }
            }

            if release {
                for pin in pins.all() {
                    match backend.release(pin) {
                        Ok(()) | Err(HardwareError::NotClaimed { .. }) => {}
                        Err(e) => {
                            warn!("Failed to release pin {}: {}", pin, e);
                            ok = false;
                        }
                    }
                }
            }

            channel.reset();
        }

        if release {
            inner.pins_reserved = false;
            info!("Motor pins released");
        }
        inner.transition(DriverState::Uninitialized);
        ok
    }

    fn apply_speed(
        &self,
        inner: &mut DriverInner,
        id: u8,
        speed: f32,
    ) -> Result<(), DriverError> {
        if inner.state != DriverState::Ready {
            return Err(DriverError::NotReady(inner.state));
        }

        let limits = self.limits;
        let channel = inner
            .channel_mut(id)
            .ok_or(DriverError::UnknownChannel(id))?;
        let pins = match channel.pins {
            Some(pins) if channel.available => pins,
            _ => return Err(DriverError::ChannelUnavailable(id)),
        };

        let (direction, duty) = normalize_speed(speed, limits);
        debug!(
            "Channel {}: {:?} at {}% (requested {})",
            id, direction, duty, speed
        );

        match self.write_channel(pins, direction, duty) {
            Ok(()) => {
                channel.direction = direction;
                channel.duty = duty;
                Ok(())
            }
            Err(source) => {
                // Put the previous pair back before giving up on the channel
                if let Err(e) = self.write_channel(pins, channel.direction, channel.duty) {
                    debug!("Channel {} restore failed: {}", id, e);
                }
                channel.available = false;
                Err(DriverError::HardwareWrite {
                    channel: id,
                    source,
                })
            }
        }
    }

    fn write_channel(
        &self,
        pins: ChannelPins,
        direction: Direction,
        duty: f32,
    ) -> Result<(), HardwareError> {
        let (in1, in2) = direction.pin_levels();
        self.backend.write(pins.in1, in1)?;
        self.backend.write(pins.in2, in2)?;
        self.backend.set_duty(pins.pwm, duty)
    }

    pub fn state(&self) -> DriverState {
        self.lock().state
    }

    /// Why the most recent initialization failed, if it did
    pub fn last_fault(&self) -> Option<DriverError> {
        self.lock().last_fault.clone()
    }

    pub fn channel(&self, id: u8) -> Option<MotorChannel> {
        self.lock().channels.iter().find(|c| c.id == id).copied()
    }

    /// Copies of every channel record
    pub fn channels(&self) -> Vec<MotorChannel> {
        self.lock().channels.clone()
    }

    pub fn available_channels(&self) -> Vec<u8> {
        self.lock()
            .channels
            .iter()
            .filter(|c| c.available)
            .map(|c| c.id)
            .collect()
    }

    pub fn limits(&self) -> SpeedLimits {
        self.limits
    }
}

impl Drop for MotorDriver {
    fn drop(&mut self) {
        // Never leave motors running when the driver goes away
        if !self.cleanup(false) {
            warn!("Failed to neutralize motors on drop");
        }
    }
}
