// Motor actuation for the drive platform
//
// Provides:
// - Pin backend abstraction (GPIO direction pins + PWM) with a simulated backend
// - Thread-safe motor driver with bounded-timeout bring-up
// - Speed controller mapping motion commands onto channels

pub mod channel;
mod driver;
pub mod pins;
mod speed;

pub use channel::{Direction, MotorChannel, normalize_speed};
pub use driver::{DriverError, DriverState, MotorDriver};
pub use pins::{HardwareError, Level, PinBackend, SimulatedPins};
pub use speed::{MotionCommand, SpeedController};
