// Defaults, topics, and the validated platform configuration
use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

// Runtime loop frequency
pub const LOOP_HZ: u64 = 10;

// Zenoh topics
pub const TOPIC_CMD_MOTION: &str = "rover/cmd/motion"; // commands
pub const TOPIC_STATUS: &str = "rover/state/status"; // driver + obstacle status

// Motor configuration
pub const CHANNEL_COUNT: usize = 4;
pub const PWM_FREQUENCY_HZ: f32 = 100.0;
pub const MIN_SPEED: f32 = 0.0;
pub const MAX_SPEED: f32 = 100.0;

/// Default pin triples for channels 1..=4
pub const DEFAULT_CHANNEL_PINS: [ChannelPins; CHANNEL_COUNT] = [
    ChannelPins { pwm: 12, in1: 16, in2: 18 },
    ChannelPins { pwm: 13, in1: 22, in2: 24 },
    ChannelPins { pwm: 19, in1: 21, in2: 23 },
    ChannelPins { pwm: 26, in1: 31, in2: 33 },
];

pub const DEFAULT_LEFT_CHANNELS: [u8; 2] = [1, 3];
pub const DEFAULT_RIGHT_CHANNELS: [u8; 2] = [2, 4];

// Bring-up bound used when motion commands initialize on demand
pub const INIT_TIMEOUT: Duration = Duration::from_secs(2);

// Obstacle thresholds (cm)
pub const DANGER_THRESHOLD_CM: f32 = 25.0;
pub const WARNING_THRESHOLD_CM: f32 = 50.0;
pub const CAUTION_THRESHOLD_CM: f32 = 100.0;
pub const POLL_INTERVAL: Duration = Duration::from_millis(200);
pub const MONITOR_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

// Distance sensor
pub const SENSOR_MAX_DISTANCE_CM: f32 = 400.0;

/// Errors raised while validating a `PlatformConfig`
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("Channel {channel} has no pin assignment")]
    MissingPins { channel: u8 },

    #[error("Channel {channel} reuses pin {pin}")]
    DuplicatePin { channel: u8, pin: u8 },

    #[error("Invalid speed bounds: min={min}, max={max} (need 0 <= min < max <= 100)")]
    SpeedBounds { min: f32, max: f32 },

    #[error("Invalid PWM frequency: {0} Hz")]
    PwmFrequency(f32),

    #[error("Invalid {name} threshold: {value}")]
    Threshold { name: &'static str, value: f32 },

    #[error("Poll interval must be non-zero")]
    PollInterval,

    #[error("Motion layout references unknown channel {0}")]
    UnknownLayoutChannel(u8),

    #[error("Paired layout must place every channel in exactly one group (channel {0})")]
    LayoutNotPartition(u8),

    #[error("No channels configured")]
    NoChannels,
}

/// Direction pin pair plus the PWM-capable pin of one channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelPins {
    pub pwm: u8,
    pub in1: u8,
    pub in2: u8,
}

impl ChannelPins {
    pub fn all(&self) -> [u8; 3] {
        [self.in1, self.in2, self.pwm]
    }
}

/// How logical motion commands fan out to channels
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MotionLayout {
    /// Left and right groups receive matching commands
    Paired { left: Vec<u8>, right: Vec<u8> },
    /// Every channel receives the same command
    Individual,
}

impl Default for MotionLayout {
    fn default() -> Self {
        MotionLayout::Paired {
            left: DEFAULT_LEFT_CHANNELS.to_vec(),
            right: DEFAULT_RIGHT_CHANNELS.to_vec(),
        }
    }
}

/// Obstacle severity thresholds and polling cadence, as loaded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObstacleSettings {
    pub danger_cm: f32,
    pub warning_cm: f32,
    pub caution_cm: f32,
    pub poll_interval_ms: u64,
    pub join_timeout_ms: u64,
}

impl Default for ObstacleSettings {
    fn default() -> Self {
        Self {
            danger_cm: DANGER_THRESHOLD_CM,
            warning_cm: WARNING_THRESHOLD_CM,
            caution_cm: CAUTION_THRESHOLD_CM,
            poll_interval_ms: POLL_INTERVAL.as_millis() as u64,
            join_timeout_ms: MONITOR_JOIN_TIMEOUT.as_millis() as u64,
        }
    }
}

/// Unvalidated platform configuration.
///
/// `channels[i]` holds the pins of channel `i + 1`; `None` marks a channel
/// whose assignment is missing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    pub channels: Vec<Option<ChannelPins>>,
    pub min_speed: f32,
    pub max_speed: f32,
    pub pwm_frequency_hz: f32,
    pub layout: MotionLayout,
    pub obstacle: ObstacleSettings,
    pub init_timeout_ms: u64,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            channels: DEFAULT_CHANNEL_PINS.iter().copied().map(Some).collect(),
            min_speed: MIN_SPEED,
            max_speed: MAX_SPEED,
            pwm_frequency_hz: PWM_FREQUENCY_HZ,
            layout: MotionLayout::default(),
            obstacle: ObstacleSettings::default(),
            init_timeout_ms: INIT_TIMEOUT.as_millis() as u64,
        }
    }
}

/// Magnitude bounds applied to every speed request
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpeedLimits {
    pub min: f32,
    pub max: f32,
}

impl Default for SpeedLimits {
    fn default() -> Self {
        Self {
            min: MIN_SPEED,
            max: MAX_SPEED,
        }
    }
}

/// A channel as the driver sees it: `pins` is `None` when configuration
/// rejected the channel, which keeps it permanently unavailable.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelSpec {
    pub id: u8,
    pub pins: Option<ChannelPins>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ObstacleConfig {
    pub danger_cm: f32,
    pub warning_cm: f32,
    pub caution_cm: f32,
    pub poll_interval: Duration,
    pub join_timeout: Duration,
}

impl Default for ObstacleConfig {
    fn default() -> Self {
        Self {
            danger_cm: DANGER_THRESHOLD_CM,
            warning_cm: WARNING_THRESHOLD_CM,
            caution_cm: CAUTION_THRESHOLD_CM,
            poll_interval: POLL_INTERVAL,
            join_timeout: MONITOR_JOIN_TIMEOUT,
        }
    }
}

/// Configuration that passed `PlatformConfig::validate`
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedConfig {
    pub channels: Vec<ChannelSpec>,
    pub limits: SpeedLimits,
    pub pwm_frequency_hz: f32,
    pub layout: MotionLayout,
    pub obstacle: ObstacleConfig,
    pub init_timeout: Duration,
    /// Per-channel problems that disabled a channel without rejecting the config
    pub channel_issues: Vec<ConfigError>,
}

impl ValidatedConfig {
    pub fn channel_ids(&self) -> impl Iterator<Item = u8> + '_ {
        self.channels.iter().map(|c| c.id)
    }
}

impl Default for ValidatedConfig {
    fn default() -> Self {
        Self {
            channels: DEFAULT_CHANNEL_PINS
                .iter()
                .enumerate()
                .map(|(i, &pins)| ChannelSpec {
                    id: i as u8 + 1,
                    pins: Some(pins),
                })
                .collect(),
            limits: SpeedLimits::default(),
            pwm_frequency_hz: PWM_FREQUENCY_HZ,
            layout: MotionLayout::default(),
            obstacle: ObstacleConfig::default(),
            init_timeout: INIT_TIMEOUT,
            channel_issues: Vec::new(),
        }
    }
}

impl PlatformConfig {
    /// Check every field, producing the strongly-typed config the core consumes.
    ///
    /// Structural problems (bounds, thresholds, layout) reject the whole config.
    /// A missing or colliding pin assignment only disables that channel.
    pub fn validate(&self) -> Result<ValidatedConfig, ConfigError> {
        if self.channels.is_empty() {
            return Err(ConfigError::NoChannels);
        }

        let (min, max) = (self.min_speed, self.max_speed);
        if !(min.is_finite() && max.is_finite() && 0.0 <= min && min < max && max <= 100.0) {
            return Err(ConfigError::SpeedBounds { min, max });
        }

        if !(self.pwm_frequency_hz.is_finite() && self.pwm_frequency_hz > 0.0) {
            return Err(ConfigError::PwmFrequency(self.pwm_frequency_hz));
        }

        let o = &self.obstacle;
        for (name, value) in [
            ("danger", o.danger_cm),
            ("warning", o.warning_cm),
            ("caution", o.caution_cm),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::Threshold { name, value });
            }
        }
        if o.poll_interval_ms == 0 {
            return Err(ConfigError::PollInterval);
        }

        let count = self.channels.len();
        let in_range = |id: u8| id >= 1 && (id as usize) <= count;
        if let MotionLayout::Paired { left, right } = &self.layout {
            if let Some(&bad) = left.iter().chain(right).find(|&&id| !in_range(id)) {
                return Err(ConfigError::UnknownLayoutChannel(bad));
            }
            // Left and right must split the channels with no repeats or gaps
            let mut seen = HashSet::new();
            if let Some(&dup) = left.iter().chain(right).find(|&&id| !seen.insert(id)) {
                return Err(ConfigError::LayoutNotPartition(dup));
            }
            if let Some(missing) = (1..=count as u8).find(|id| !seen.contains(id)) {
                return Err(ConfigError::LayoutNotPartition(missing));
            }
        }

        let mut channels = Vec::with_capacity(count);
        let mut channel_issues = Vec::new();
        let mut used_pins = HashSet::new();

        for (i, pins) in self.channels.iter().enumerate() {
            let id = i as u8 + 1;
            let pins = match pins {
                None => {
                    channel_issues.push(ConfigError::MissingPins { channel: id });
                    None
                }
                Some(p) => {
                    let pin_set = p.all();
                    let collision = pin_set
                        .iter()
                        .enumerate()
                        .find(|&(j, pin)| used_pins.contains(pin) || pin_set[..j].contains(pin));
                    match collision {
                        Some((_, &pin)) => {
                            channel_issues.push(ConfigError::DuplicatePin { channel: id, pin });
                            None
                        }
                        None => {
                            used_pins.extend(pin_set);
                            Some(*p)
                        }
                    }
                }
            };
            channels.push(ChannelSpec { id, pins });
        }

        for issue in &channel_issues {
            warn!("Configuration: {} - channel disabled", issue);
        }

        Ok(ValidatedConfig {
            channels,
            limits: SpeedLimits { min, max },
            pwm_frequency_hz: self.pwm_frequency_hz,
            layout: self.layout.clone(),
            obstacle: ObstacleConfig {
                danger_cm: o.danger_cm,
                warning_cm: o.warning_cm,
                caution_cm: o.caution_cm,
                poll_interval: Duration::from_millis(o.poll_interval_ms),
                join_timeout: Duration::from_millis(o.join_timeout_ms),
            },
            init_timeout: Duration::from_millis(self.init_timeout_ms),
            channel_issues,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validates() {
        let config = PlatformConfig::default().validate().unwrap();
        assert_eq!(config.channels.len(), CHANNEL_COUNT);
        assert!(config.channels.iter().all(|c| c.pins.is_some()));
        assert!(config.channel_issues.is_empty());
        assert_eq!(config.obstacle.poll_interval, POLL_INTERVAL);
        assert_eq!(config, ValidatedConfig::default());
    }

    #[test]
    fn test_missing_pins_disable_only_that_channel() {
        let mut raw = PlatformConfig::default();
        raw.channels[2] = None;
        let config = raw.validate().unwrap();

        assert_eq!(config.channels[2].pins, None);
        assert!(config.channels[0].pins.is_some());
        assert_eq!(
            config.channel_issues,
            vec![ConfigError::MissingPins { channel: 3 }]
        );
    }

    #[test]
    fn test_colliding_pins_disable_later_channel() {
        let mut raw = PlatformConfig::default();
        raw.channels[1] = Some(ChannelPins { pwm: 13, in1: 16, in2: 24 });
        let config = raw.validate().unwrap();

        assert!(config.channels[0].pins.is_some());
        assert_eq!(config.channels[1].pins, None);
        assert_eq!(
            config.channel_issues,
            vec![ConfigError::DuplicatePin { channel: 2, pin: 16 }]
        );
    }

    #[test]
    fn test_structural_errors_reject_config() {
        let mut raw = PlatformConfig::default();
        raw.max_speed = 120.0;
        assert!(matches!(raw.validate(), Err(ConfigError::SpeedBounds { .. })));

        let mut raw = PlatformConfig::default();
        raw.obstacle.poll_interval_ms = 0;
        assert_eq!(raw.validate(), Err(ConfigError::PollInterval));

        let mut raw = PlatformConfig::default();
        raw.layout = MotionLayout::Paired { left: vec![1], right: vec![7] };
        assert_eq!(raw.validate(), Err(ConfigError::UnknownLayoutChannel(7)));

        let mut raw = PlatformConfig::default();
        raw.obstacle.danger_cm = f32::NAN;
        assert!(matches!(raw.validate(), Err(ConfigError::Threshold { name: "danger", .. })));
    }

    #[test]
    fn test_paired_layout_must_partition_channels() {
        let mut raw = PlatformConfig::default();
        raw.layout = MotionLayout::Paired { left: vec![1, 1], right: vec![1] };
        assert_eq!(raw.validate(), Err(ConfigError::LayoutNotPartition(1)));

        raw.layout = MotionLayout::Paired { left: vec![1, 3], right: vec![3, 2, 4] };
        assert_eq!(raw.validate(), Err(ConfigError::LayoutNotPartition(3)));

        raw.layout = MotionLayout::Paired { left: vec![1], right: vec![2, 4] };
        assert_eq!(raw.validate(), Err(ConfigError::LayoutNotPartition(3)));

        raw.layout = MotionLayout::Paired { left: vec![4, 2], right: vec![3, 1] };
        assert!(raw.validate().is_ok());
    }

    #[test]
    fn test_config_from_json_uses_defaults_for_missing_fields() {
        let json = r#"{ "max_speed": 80.0, "layout": { "type": "individual" } }"#;
        let raw: PlatformConfig = serde_json::from_str(json).unwrap();
        let config = raw.validate().unwrap();

        assert_eq!(config.limits.max, 80.0);
        assert_eq!(config.layout, MotionLayout::Individual);
        assert_eq!(config.channels.len(), CHANNEL_COUNT);
        assert_eq!(config.obstacle.danger_cm, DANGER_THRESHOLD_CM);
    }
}
