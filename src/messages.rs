// Define message types for the runtime

use serde::{Deserialize, Serialize};

use crate::motor::{DriverState, MotionCommand};
use crate::obstacle::ObstacleReading;

/// Driver-level commands from the control surface
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ControlCommand {
    SetSpeed {
        channel: u8,
        speed: f32,
    },
    Initialize {
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
    Cleanup {
        #[serde(default)]
        reset_hardware: bool,
    },
}

// Command from teleop/scripts -> runtime
// Both variants share the "action" tag, e.g. {"action":"forward","speed":60}
// or {"action":"set_speed","channel":2,"speed":-40}
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MotionRequest {
    Motion(MotionCommand),
    Control(ControlCommand),
}

/// Health status published by runtime
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeHealth {
    Ok,
    CmdStale,
}

// Status output from runtime -> dashboards
#[derive(Debug, Clone, Serialize)]
pub struct PlatformStatus {
    pub driver: DriverState,
    pub active_channels: Vec<u8>,
    pub obstacle: ObstacleReading,
    pub health: RuntimeHealth,
}
