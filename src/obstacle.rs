// Obstacle monitor: polls the distance sensor and forces an emergency stop
//
// The status lock guards only the latest reading. It is released before the
// motor driver is called, so the two subsystems never wait on each other's
// locks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::config::ObstacleConfig;
use crate::motor::MotorDriver;
use crate::sensor::DistanceSensor;

/// Severity of the nearest obstacle
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    #[default]
    Clear,
    Caution,
    Warning,
    Danger,
}

impl Severity {
    /// Worst matching level wins when thresholds overlap
    pub fn classify(distance_cm: f32, config: &ObstacleConfig) -> Self {
        if distance_cm <= config.danger_cm {
            Severity::Danger
        } else if distance_cm <= config.warning_cm {
            Severity::Warning
        } else if distance_cm <= config.caution_cm {
            Severity::Caution
        } else {
            Severity::Clear
        }
    }
}

/// Latest classified reading
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ObstacleReading {
    pub distance: Option<f32>,
    /// Milliseconds since the Unix epoch
    pub timestamp_ms: Option<u64>,
    pub severity: Severity,
    pub detected: bool,
    pub auto_stop_triggered: bool,
    /// When the path last went from clear to obstructed
    pub last_detection_ms: Option<u64>,
}

/// Result of recording one tick
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Observation {
    pub previous: Severity,
    pub current: Severity,
    /// This tick entered Danger with no auto-stop outstanding
    pub trigger_stop: bool,
}

impl Observation {
    pub fn level_changed(&self) -> bool {
        self.previous != self.current
    }
}

impl ObstacleReading {
    /// Fold one classified reading in, applying the auto-stop debounce
    pub fn record(&mut self, distance: f32, severity: Severity, now_ms: u64) -> Observation {
        let previous = self.severity;
        let detected = severity != Severity::Clear;
        if detected && !self.detected {
            self.last_detection_ms = Some(now_ms);
        }

        let danger = severity == Severity::Danger;
        let trigger_stop = danger && !self.auto_stop_triggered;
        self.auto_stop_triggered = danger;

        self.distance = Some(distance);
        self.timestamp_ms = Some(now_ms);
        self.severity = severity;
        self.detected = detected;

        Observation {
            previous,
            current: severity,
            trigger_stop,
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn lock_status(status: &Mutex<ObstacleReading>) -> MutexGuard<'_, ObstacleReading> {
    status.lock().unwrap_or_else(PoisonError::into_inner)
}

struct PollLoop {
    sensor: Arc<dyn DistanceSensor>,
    driver: Arc<MotorDriver>,
    status: Arc<Mutex<ObstacleReading>>,
    config: ObstacleConfig,
    running: Arc<AtomicBool>,
}

impl PollLoop {
    fn run(self) {
        info!(
            "Obstacle monitor started: danger<={}cm warning<={}cm caution<={}cm, every {:?}",
            self.config.danger_cm,
            self.config.warning_cm,
            self.config.caution_cm,
            self.config.poll_interval
        );

        while self.running.load(Ordering::Acquire) {
            let distance = self.sensor.read_distance();
            let severity = Severity::classify(distance, &self.config);
            let observation = lock_status(&self.status).record(distance, severity, now_ms());

            if observation.level_changed() {
                match severity {
                    Severity::Clear => info!("Path clear: {:.1}cm", distance),
                    level => info!("Obstacle at {:.1}cm - {:?}", distance, level),
                }
            }

            // Status lock is already released here
            if observation.trigger_stop {
                warn!("DANGER: obstacle at {:.1}cm - auto-stop triggered", distance);
                if !self.driver.stop_all() {
                    error!("Auto-stop could not stop all motors");
                }
            }

            self.sleep(self.config.poll_interval);
        }

        info!("Obstacle monitor stopped");
    }

    /// Sleep outside any lock; `stop()` unparks us early
    fn sleep(&self, interval: Duration) {
        let deadline = Instant::now().checked_add(interval);
        while self.running.load(Ordering::Acquire) {
            let remaining =
                deadline.map_or(Duration::MAX, |d| d.saturating_duration_since(Instant::now()));
            if remaining.is_zero() {
                break;
            }
            thread::park_timeout(remaining);
        }
    }
}

struct Worker {
    running: Arc<AtomicBool>,
    // Disconnects when the polling thread exits
    exited: Receiver<()>,
    handle: JoinHandle<()>,
}

/// Background obstacle monitor
pub struct ObstacleMonitor {
    driver: Arc<MotorDriver>,
    sensor: Arc<dyn DistanceSensor>,
    config: ObstacleConfig,
    status: Arc<Mutex<ObstacleReading>>,
    worker: Mutex<Option<Worker>>,
}

impl ObstacleMonitor {
    pub fn new(
        driver: Arc<MotorDriver>,
        sensor: Arc<dyn DistanceSensor>,
        config: ObstacleConfig,
    ) -> Self {
        Self {
            driver,
            sensor,
            config,
            status: Arc::new(Mutex::new(ObstacleReading::default())),
            worker: Mutex::new(None),
        }
    }

    fn worker(&self) -> MutexGuard<'_, Option<Worker>> {
        self.worker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawn the polling loop; succeeds immediately if it is already running.
    /// A polling thread that died is reaped and replaced.
    pub fn start(&self) -> bool {
        let mut worker = self.worker();
        if worker
            .as_ref()
            .is_some_and(|w| w.running.load(Ordering::Acquire) && !w.handle.is_finished())
        {
            return true;
        }
        if let Some(dead) = worker.take() {
            if dead.handle.join().is_err() {
                warn!("Obstacle monitor thread panicked; restarting");
            }
        }

        let running = Arc::new(AtomicBool::new(true));
        let (exit_tx, exited) = mpsc::channel::<()>();
        let poll = PollLoop {
            sensor: Arc::clone(&self.sensor),
            driver: Arc::clone(&self.driver),
            status: Arc::clone(&self.status),
            config: self.config,
            running: Arc::clone(&running),
        };

        let spawned = thread::Builder::new()
            .name("obstacle-monitor".into())
            .spawn(move || {
                let _exit = exit_tx;
                poll.run();
            });

        match spawned {
            Ok(handle) => {
                *worker = Some(Worker {
                    running,
                    exited,
                    handle,
                });
                true
            }
            Err(e) => {
                error!("Failed to start obstacle monitor: {}", e);
                false
            }
        }
    }

    /// Stop the polling loop and join it within the configured bound.
    /// Returns false if the thread did not exit in time; it is left to
    /// finish on its own.
    pub fn stop(&self) -> bool {
        let Some(worker) = self.worker().take() else {
            return true;
        };

        worker.running.store(false, Ordering::Release);
        worker.handle.thread().unpark();

        match worker.exited.recv_timeout(self.config.join_timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if worker.handle.join().is_err() {
                    error!("Obstacle monitor thread panicked");
                }
                true
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    "Obstacle monitor did not stop within {:?}",
                    self.config.join_timeout
                );
                false
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker()
            .as_ref()
            .is_some_and(|w| w.running.load(Ordering::Acquire) && !w.handle.is_finished())
    }

    /// Copy of the latest reading; never touches the motor driver
    pub fn status(&self) -> ObstacleReading {
        *lock_status(&self.status)
    }

    pub fn is_path_clear(&self) -> bool {
        !lock_status(&self.status).detected
    }
}

impl Drop for ObstacleMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}
