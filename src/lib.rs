pub mod config;
pub mod messages;
pub mod motor;
pub mod obstacle;
pub mod platform;
pub mod runtime;
pub mod sensor;
