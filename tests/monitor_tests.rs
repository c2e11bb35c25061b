//! Obstacle monitor running against a scripted sensor and simulated pins

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use rover_drive::config::ValidatedConfig;
use rover_drive::motor::{Direction, DriverState, MotorDriver, SimulatedPins, SpeedController};
use rover_drive::obstacle::{ObstacleMonitor, Severity};
use rover_drive::sensor::ScriptedSensor;

const APPROACH: [f32; 8] = [200.0, 150.0, 60.0, 40.0, 20.0, 5.0, 30.0, 120.0];

fn fast_config() -> ValidatedConfig {
    let mut config = ValidatedConfig::default();
    config.obstacle.poll_interval = Duration::from_millis(5);
    config
}

fn wait_for(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn approach_sequence_stops_motors_exactly_once() {
    let config = fast_config();
    let pins = SimulatedPins::new();
    let driver = Arc::new(MotorDriver::new(&config, Arc::new(pins.clone())));
    let controller = SpeedController::new(Arc::clone(&driver), &config);
    assert!(controller.move_forward(50.0));

    let sensor = Arc::new(ScriptedSensor::new(APPROACH, 400.0));
    let monitor = ObstacleMonitor::new(Arc::clone(&driver), sensor.clone(), config.obstacle);

    let before = pins.write_count();
    assert!(monitor.start());
    // Two reads past the script so the held final reading has been recorded
    wait_for("script to drain", || sensor.reads() >= APPROACH.len() as u64 + 2);
    assert!(monitor.stop());

    // One stop_all: three writes on each of four channels
    assert_eq!(pins.write_count() - before, 12);

    let status = monitor.status();
    assert_eq!(status.severity, Severity::Clear);
    assert!(!status.auto_stop_triggered);
    assert!(!status.detected);
    assert!(status.last_detection_ms.is_some());
    assert!(monitor.is_path_clear());

    for channel in driver.channels() {
        assert_eq!(channel.direction, Direction::Neutral);
        assert_eq!(channel.duty, 0.0);
    }
}

#[test]
fn auto_stop_without_ready_driver_is_harmless() {
    let config = fast_config();
    let pins = SimulatedPins::new();
    let driver = Arc::new(MotorDriver::new(&config, Arc::new(pins.clone())));
    let sensor = Arc::new(ScriptedSensor::new([10.0], 400.0));
    let monitor = ObstacleMonitor::new(Arc::clone(&driver), sensor.clone(), config.obstacle);

    assert!(monitor.start());
    wait_for("danger reading", || sensor.reads() >= 3);
    assert!(monitor.stop());

    let status = monitor.status();
    assert_eq!(status.severity, Severity::Danger);
    assert!(status.auto_stop_triggered);
    assert_eq!(driver.state(), DriverState::Uninitialized);
    assert_eq!(pins.write_count(), 0);
}

#[test]
fn start_is_idempotent_and_stop_joins() {
    let config = fast_config();
    let driver = Arc::new(MotorDriver::new(&config, Arc::new(SimulatedPins::new())));
    let sensor = Arc::new(ScriptedSensor::clear(400.0));
    let monitor = ObstacleMonitor::new(driver, sensor.clone(), config.obstacle);

    assert!(!monitor.is_running());
    assert!(monitor.start());
    assert!(monitor.start());
    assert!(monitor.is_running());

    wait_for("first reading", || sensor.reads() >= 1);
    assert!(monitor.stop());
    assert!(!monitor.is_running());

    // Stopped monitor takes no more readings
    let reads = sensor.reads();
    thread::sleep(Duration::from_millis(30));
    assert_eq!(sensor.reads(), reads);

    // Stopping again and restarting both work
    assert!(monitor.stop());
    assert!(monitor.start());
    assert!(monitor.stop());
}

#[test]
fn status_reads_do_not_wait_for_the_driver_lock() {
    let config = fast_config();
    let pins = SimulatedPins::new().with_setup_delay(Duration::from_millis(100));
    let driver = Arc::new(MotorDriver::new(&config, Arc::new(pins.clone())));
    let monitor = ObstacleMonitor::new(
        Arc::clone(&driver),
        Arc::new(ScriptedSensor::new([70.0], 400.0)),
        config.obstacle,
    );
    assert!(monitor.start());
    wait_for("first reading", || monitor.status().distance.is_some());

    // Bring-up holds the driver lock for the whole slow setup
    let init = {
        let driver = Arc::clone(&driver);
        thread::spawn(move || driver.initialize(Duration::from_secs(10)))
    };
    wait_for("bring-up to start", || pins.write_count() > 0);

    let started = Instant::now();
    let status = monitor.status();
    assert!(started.elapsed() < Duration::from_millis(50));
    assert!(!init.is_finished());
    assert_eq!(status.severity, Severity::Caution);
    assert!(!monitor.is_path_clear());

    assert_eq!(init.join().unwrap(), DriverState::Ready);
    assert!(monitor.stop());
}
