// Motor driver, speed controller and obstacle monitor wired together
//
// This is the entry surface for control layers: each method is one of the
// calls a control surface makes into the core.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::config::ValidatedConfig;
use crate::messages::{ControlCommand, MotionRequest};
use crate::motor::{DriverState, MotorDriver, PinBackend, SpeedController};
use crate::obstacle::{ObstacleMonitor, ObstacleReading};
use crate::sensor::DistanceSensor;

pub struct Platform {
    driver: Arc<MotorDriver>,
    controller: SpeedController,
    monitor: ObstacleMonitor,
    init_timeout: Duration,
}

impl Platform {
    pub fn new(
        config: &ValidatedConfig,
        backend: Arc<dyn PinBackend>,
        sensor: Arc<dyn DistanceSensor>,
    ) -> Self {
        let driver = Arc::new(MotorDriver::new(config, backend));
        let controller = SpeedController::new(Arc::clone(&driver), config);
        let monitor = ObstacleMonitor::new(Arc::clone(&driver), sensor, config.obstacle);

        Self {
            driver,
            controller,
            monitor,
            init_timeout: config.init_timeout,
        }
    }

    pub fn driver(&self) -> &Arc<MotorDriver> {
        &self.driver
    }

    pub fn controller(&self) -> &SpeedController {
        &self.controller
    }

    pub fn monitor(&self) -> &ObstacleMonitor {
        &self.monitor
    }

    pub fn initialize(&self, timeout: Duration) -> DriverState {
        self.driver.initialize(timeout)
    }

    pub fn move_forward(&self, speed: f32) -> bool {
        self.controller.move_forward(speed)
    }

    pub fn move_backward(&self, speed: f32) -> bool {
        self.controller.move_backward(speed)
    }

    pub fn stop(&self) -> bool {
        self.controller.stop()
    }

    pub fn set_speed(&self, channel: u8, speed: f32) -> bool {
        self.driver.set_speed(channel, speed)
    }

    pub fn cleanup(&self, reset_hardware: bool) -> bool {
        self.driver.cleanup(reset_hardware)
    }

    pub fn obstacle_status(&self) -> ObstacleReading {
        self.monitor.status()
    }

    /// Dispatch one control-surface request; blocks for initialization
    pub fn handle(&self, request: MotionRequest) -> bool {
        match request {
            MotionRequest::Motion(command) => self.controller.execute(command),
            MotionRequest::Control(ControlCommand::SetSpeed { channel, speed }) => {
                self.set_speed(channel, speed)
            }
            MotionRequest::Control(ControlCommand::Initialize { timeout_ms }) => {
                let timeout = timeout_ms.map_or(self.init_timeout, Duration::from_millis);
                self.initialize(timeout) == DriverState::Ready
            }
            MotionRequest::Control(ControlCommand::Cleanup { reset_hardware }) => {
                self.cleanup(reset_hardware)
            }
        }
    }

    /// Stop motion without initializing on demand
    pub fn emergency_stop(&self) -> bool {
        self.driver.stop_all()
    }

    /// Stop the monitor, neutralize motors and release the pins
    pub fn shutdown(&self) -> bool {
        info!("Shutting down platform");
        let monitor_stopped = self.monitor.stop();
        let stopped = self.driver.state() != DriverState::Ready || self.driver.stop_all();
        let cleaned = self.driver.cleanup(true);
        monitor_stopped && stopped && cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motor::{MotionCommand, SimulatedPins};
    use crate::sensor::ScriptedSensor;

    fn platform() -> (Platform, SimulatedPins) {
        let pins = SimulatedPins::new();
        let platform = Platform::new(
            &ValidatedConfig::default(),
            Arc::new(pins.clone()),
            Arc::new(ScriptedSensor::clear(400.0)),
        );
        (platform, pins)
    }

    #[test]
    fn test_handle_dispatches_requests() {
        let (platform, _pins) = platform();

        let init = MotionRequest::Control(ControlCommand::Initialize { timeout_ms: Some(5000) });
        assert!(platform.handle(init));
        assert_eq!(platform.driver().state(), DriverState::Ready);

        let set = MotionRequest::Control(ControlCommand::SetSpeed { channel: 2, speed: -30.0 });
        assert!(platform.handle(set));
        assert_eq!(platform.driver().channel(2).unwrap().duty, 30.0);

        assert!(platform.handle(MotionRequest::Motion(MotionCommand::Stop)));
        assert_eq!(platform.driver().channel(2).unwrap().duty, 0.0);

        let cleanup = MotionRequest::Control(ControlCommand::Cleanup { reset_hardware: true });
        assert!(platform.handle(cleanup));
        assert_eq!(platform.driver().state(), DriverState::Uninitialized);
    }

    #[test]
    fn test_emergency_stop_does_not_initialize() {
        let (platform, pins) = platform();
        assert!(!platform.emergency_stop());
        assert_eq!(platform.driver().state(), DriverState::Uninitialized);
        assert_eq!(pins.write_count(), 0);
    }

    #[test]
    fn test_shutdown_releases_everything() {
        let (platform, pins) = platform();
        assert!(platform.monitor().start());
        assert!(platform.move_forward(40.0));

        assert!(platform.shutdown());
        assert!(!platform.monitor().is_running());
        assert_eq!(platform.driver().state(), DriverState::Uninitialized);
        assert!(pins.claimed_pins().is_empty());
    }
}
