// Logical motion commands on top of the motor driver
//
// Stateless apart from the static layout: every command resolves to one
// `MotorDriver::set_speed` per channel (or `stop_all`).

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::driver::MotorDriver;
use crate::config::{MotionLayout, ValidatedConfig};

fn full_speed() -> f32 {
    100.0
}

/// Straight-line motion commands. Turns are accepted but reduced to a stop.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum MotionCommand {
    Forward {
        #[serde(default = "full_speed")]
        speed: f32,
    },
    Backward {
        #[serde(default = "full_speed")]
        speed: f32,
    },
    Left {
        #[serde(default = "full_speed")]
        speed: f32,
    },
    Right {
        #[serde(default = "full_speed")]
        speed: f32,
    },
    Stop,
}

pub struct SpeedController {
    driver: Arc<MotorDriver>,
    layout: MotionLayout,
    channel_ids: Vec<u8>,
    init_timeout: Duration,
}

impl SpeedController {
    pub fn new(driver: Arc<MotorDriver>, config: &ValidatedConfig) -> Self {
        Self {
            driver,
            layout: config.layout.clone(),
            channel_ids: config.channel_ids().collect(),
            init_timeout: config.init_timeout,
        }
    }

    pub fn driver(&self) -> &Arc<MotorDriver> {
        &self.driver
    }

    /// Channels a straight-line command touches, in write order
    fn target_channels(&self) -> Vec<u8> {
        match &self.layout {
            MotionLayout::Paired { left, right } => left.iter().chain(right).copied().collect(),
            MotionLayout::Individual => self.channel_ids.clone(),
        }
    }

    /// Initialize on demand; motion against an uninitialized driver would
    /// otherwise fail silently
    fn ensure_ready(&self) -> bool {
        if self.driver.ensure_ready(self.init_timeout) {
            return true;
        }
        warn!("Motors could not be initialized");
        false
    }

    /// Apply one signed speed to every target channel. Every channel is
    /// written even after a failure; there is no rollback.
    fn drive(&self, signed_speed: f32) -> bool {
        let mut ok = true;
        for id in self.target_channels() {
            ok &= self.driver.set_speed(id, signed_speed);
        }
        ok
    }

    pub fn move_forward(&self, speed: f32) -> bool {
        info!("Moving forward at speed {}", speed);
        if !self.ensure_ready() {
            return false;
        }
        let ok = self.drive(speed);
        if !ok {
            warn!("Forward command only partially applied");
        }
        ok
    }

    /// A negative `speed` is normalized, not rejected
    pub fn move_backward(&self, speed: f32) -> bool {
        info!("Moving backward at speed {}", speed);
        if !self.ensure_ready() {
            return false;
        }
        let ok = self.drive(-speed.abs());
        if !ok {
            warn!("Backward command only partially applied");
        }
        ok
    }

    pub fn stop(&self) -> bool {
        if !self.ensure_ready() {
            return false;
        }
        self.driver.stop_all()
    }

    pub fn turn_left(&self, _speed: f32) -> bool {
        info!("Turning is disabled - stopping motors");
        self.stop()
    }

    pub fn turn_right(&self, _speed: f32) -> bool {
        info!("Turning is disabled - stopping motors");
        self.stop()
    }

    pub fn execute(&self, command: MotionCommand) -> bool {
        match command {
            MotionCommand::Forward { speed } => self.move_forward(speed),
            MotionCommand::Backward { speed } => self.move_backward(speed),
            MotionCommand::Left { speed } => self.turn_left(speed),
            MotionCommand::Right { speed } => self.turn_right(speed),
            MotionCommand::Stop => self.stop(),
        }
    }
}
