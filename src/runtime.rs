// Control-surface loop with optional command watchdog
// Commands arrive over Zenoh and are dispatched to the platform on a blocking
// worker; status is published every tick.
// Note: the watchdog is off by default. When enabled, a silent control surface
// stops the platform once instead of letting it drive on.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::interval;
use tracing::{error, info, warn};

// local imports
use crate::config::{LOOP_HZ, TOPIC_CMD_MOTION, TOPIC_STATUS};
use crate::messages::{MotionRequest, PlatformStatus, RuntimeHealth};
use crate::platform::Platform;

pub struct Runtime {
    platform: Arc<Platform>,
    watchdog: Option<Duration>,
    cmd_received_at: Option<Instant>,
    watchdog_fired: bool,
    health: RuntimeHealth,
}

impl Runtime {
    pub fn new(platform: Arc<Platform>, watchdog: Option<Duration>) -> Self {
        Self {
            platform,
            watchdog,
            cmd_received_at: None,
            watchdog_fired: false,
            health: RuntimeHealth::CmdStale, // Start stale until first cmd
        }
    }

    /// Process incoming command
    async fn on_command(&mut self, request: MotionRequest) {
        info!("Received command: {:?}", &request);
        self.cmd_received_at = Some(Instant::now());
        self.watchdog_fired = false;

        // Initialization can block for its whole timeout
        let platform = Arc::clone(&self.platform);
        match tokio::task::spawn_blocking(move || platform.handle(request)).await {
            Ok(true) => {}
            Ok(false) => warn!("Command {:?} failed", request),
            Err(e) => error!("Command worker failed: {}", e),
        }
    }

    /// Update health; true exactly once per stale period when the platform
    /// should be stopped
    fn check_watchdog(&mut self) -> bool {
        let age = self.cmd_received_at.map(|at| at.elapsed());
        match (age, self.watchdog) {
            (None, _) => {
                self.health = RuntimeHealth::CmdStale;
                false
            }
            (Some(age), Some(timeout)) if age > timeout => {
                if self.health != RuntimeHealth::CmdStale {
                    warn!("Command stale ({:?} old), stopping platform", age);
                }
                self.health = RuntimeHealth::CmdStale;
                let fire = !self.watchdog_fired;
                self.watchdog_fired = true;
                fire
            }
            (Some(_), _) => {
                self.health = RuntimeHealth::Ok;
                false
            }
        }
    }

    fn status(&self) -> PlatformStatus {
        let driver = self.platform.driver();
        PlatformStatus {
            driver: driver.state(),
            active_channels: driver.available_channels(),
            obstacle: self.platform.obstacle_status(),
            health: self.health,
        }
    }
}

pub async fn run(
    platform: Arc<Platform>,
    watchdog: Option<Duration>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    info!("Opening Zenoh session...");
    let session = zenoh::open(zenoh::Config::default()).await?;

    info!("Setting up publishers and subscribers...");
    let subscriber = session.declare_subscriber(TOPIC_CMD_MOTION).await?;
    let pub_status = session.declare_publisher(TOPIC_STATUS).await?;

    let mut runtime = Runtime::new(Arc::clone(&platform), watchdog);
    let mut tick = interval(Duration::from_millis(1000 / LOOP_HZ));
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    match watchdog {
        Some(timeout) => info!(
            "Runtime started: {}Hz loop, {}ms watchdog timeout",
            LOOP_HZ,
            timeout.as_millis()
        ),
        None => info!("Runtime started: {}Hz loop, watchdog disabled", LOOP_HZ),
    }
    info!("Subscribed to: {}", TOPIC_CMD_MOTION);
    info!("Publishing to: {}", TOPIC_STATUS);

    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = &mut shutdown => {
                info!("Shutdown requested");
                break;
            }
        }

        // 1. Drain all pending commands (non-blocking), in arrival order
        while let Ok(Some(sample)) = subscriber.try_recv() {
            let payload = sample.payload().to_bytes();
            match serde_json::from_slice::<MotionRequest>(&payload) {
                Ok(request) => {
                    runtime.on_command(request).await;
                }
                Err(e) => {
                    warn!("Failed to parse command: {}", e);
                }
            }
        }

        // 2. Watchdog
        if runtime.check_watchdog() {
            let platform = Arc::clone(&platform);
            if !tokio::task::spawn_blocking(move || platform.emergency_stop()).await? {
                warn!("Watchdog stop failed");
            }
        }

        // 3. Publish status
        let status_json = serde_json::to_string(&runtime.status())?;
        pub_status.put(status_json).await?;
    }

    let done = tokio::task::spawn_blocking(move || platform.shutdown()).await?;
    if !done {
        warn!("Platform shutdown was incomplete");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ValidatedConfig;
    use crate::motor::SimulatedPins;
    use crate::sensor::ScriptedSensor;

    fn runtime(watchdog: Option<Duration>) -> Runtime {
        let platform = Platform::new(
            &ValidatedConfig::default(),
            Arc::new(SimulatedPins::new()),
            Arc::new(ScriptedSensor::clear(400.0)),
        );
        Runtime::new(Arc::new(platform), watchdog)
    }

    #[test]
    fn test_stale_until_first_command() {
        let mut rt = runtime(Some(Duration::from_millis(50)));
        assert!(!rt.check_watchdog());
        assert_eq!(rt.health, RuntimeHealth::CmdStale);
    }

    #[test]
    fn test_watchdog_fires_once_per_stale_period() {
        let mut rt = runtime(Some(Duration::from_millis(20)));
        rt.cmd_received_at = Some(Instant::now());
        assert!(!rt.check_watchdog());
        assert_eq!(rt.health, RuntimeHealth::Ok);

        std::thread::sleep(Duration::from_millis(40));
        assert!(rt.check_watchdog());
        assert!(!rt.check_watchdog());
        assert_eq!(rt.health, RuntimeHealth::CmdStale);
    }

    #[test]
    fn test_disabled_watchdog_never_fires() {
        let mut rt = runtime(None);
        rt.cmd_received_at = Some(Instant::now() - Duration::from_secs(60));
        assert!(!rt.check_watchdog());
        assert_eq!(rt.health, RuntimeHealth::Ok);
    }

    #[tokio::test]
    async fn test_on_command_dispatches_to_platform() {
        let mut rt = runtime(None);
        let request: MotionRequest =
            serde_json::from_str(r#"{"action":"forward","speed":55}"#).unwrap();
        rt.on_command(request).await;

        let status = rt.status();
        assert_eq!(status.active_channels, vec![1, 2, 3, 4]);
        assert!(rt.platform.driver().channels().iter().all(|c| c.duty == 55.0));
        assert!(!rt.check_watchdog());
        assert_eq!(rt.health, RuntimeHealth::Ok);
    }
}
