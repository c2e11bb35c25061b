use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use rover_drive::config::{PlatformConfig, SENSOR_MAX_DISTANCE_CM};
use rover_drive::motor::{DriverState, SimulatedPins};
use rover_drive::platform::Platform;
use rover_drive::sensor::{DistanceSensor, ScriptedSensor, SerialRangeFinder};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Parser, Debug)]
#[command(about = "Four-channel drive platform with obstacle auto-stop")]
struct Args {
    /// JSON platform configuration; built-in defaults when omitted
    #[arg(long)]
    config: Option<PathBuf>,

    /// Serial port of the ultrasonic range finder (e.g. /dev/ttyUSB0)
    #[arg(long)]
    sensor_port: Option<String>,

    /// Scripted distances in cm to replay instead of a real sensor
    #[arg(long, value_delimiter = ',')]
    simulate_distances: Vec<f32>,

    /// Stop the platform when no command arrives for this long (0 = off)
    #[arg(long, default_value_t = 0)]
    watchdog_ms: u64,

    /// Do not start the obstacle monitor
    #[arg(long)]
    no_monitor: bool,
}

fn load_config(path: Option<&PathBuf>) -> Result<PlatformConfig, BoxError> {
    let Some(path) = path else {
        return Ok(PlatformConfig::default());
    };
    info!("Loading configuration from {}", path.display());
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

fn open_sensor(args: &Args) -> Result<Arc<dyn DistanceSensor>, BoxError> {
    if let Some(port) = &args.sensor_port {
        info!("Opening range finder on {}", port);
        return Ok(Arc::new(SerialRangeFinder::open(port, SENSOR_MAX_DISTANCE_CM)?));
    }
    info!(
        "Using scripted distance sensor ({} readings)",
        args.simulate_distances.len()
    );
    Ok(Arc::new(ScriptedSensor::new(
        args.simulate_distances.iter().copied(),
        SENSOR_MAX_DISTANCE_CM,
    )))
}

async fn start(args: Args) -> Result<(), BoxError> {
    let config = load_config(args.config.as_ref())?.validate()?;
    let sensor = open_sensor(&args)?;

    // No GPIO backend is wired in yet; pins are simulated
    let backend = Arc::new(SimulatedPins::new());
    let platform = Arc::new(Platform::new(&config, backend, sensor));

    let init = Arc::clone(&platform);
    let timeout = config.init_timeout;
    match tokio::task::spawn_blocking(move || init.initialize(timeout)).await? {
        DriverState::Ready => info!("Motor driver ready"),
        state => warn!(
            "Motor driver is {:?} ({:?}); motion commands will retry",
            state,
            platform.driver().last_fault()
        ),
    }

    if !args.no_monitor && !platform.monitor().start() {
        warn!("Obstacle monitor not running");
    }

    let watchdog = (args.watchdog_ms > 0).then(|| Duration::from_millis(args.watchdog_ms));
    rover_drive::runtime::run(platform, watchdog).await
}

#[tokio::main]
async fn main() {
    // Setup logging (set RUST_LOG=info or debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init(); // installs the subscriber globally

    let args = Args::parse();
    if let Err(e) = start(args).await {
        eprintln!("Runtime error: {}", e);
        std::process::exit(1);
    }
}
