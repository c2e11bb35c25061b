// Keyboard teleop: W/S drive, A/D turn, Space stop, R/F speed, I init, Q quit
use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind},
    terminal::{disable_raw_mode, enable_raw_mode},
};
use std::time::{Duration, Instant};
use tracing::info;

use rover_drive::config::TOPIC_CMD_MOTION;
use rover_drive::messages::{ControlCommand, MotionRequest};
use rover_drive::motor::MotionCommand;

const SPEEDS: [f32; 3] = [30.0, 60.0, 100.0]; // percent duty
const INPUT_TIMEOUT_MS: u64 = 300; // Stop after this much time with no movement key
const REPEAT_MS: u64 = 100; // Re-send the held command at 10Hz

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    info!("Opening Zenoh session...");
    let session = zenoh::open(zenoh::Config::default()).await?;
    let publisher = session.declare_publisher(TOPIC_CMD_MOTION).await?;

    info!("Controls: W/S=drive, A/D=turn, Space=stop, R/F=speed, I=init, Q=quit");
    print_speed(0);

    enable_raw_mode()?;
    let result = run_teleop(&publisher).await;
    disable_raw_mode()?;

    result
}

async fn send(
    publisher: &zenoh::pubsub::Publisher<'_>,
    request: MotionRequest,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    publisher.put(serde_json::to_string(&request)?).await?;
    Ok(())
}

async fn run_teleop(
    publisher: &zenoh::pubsub::Publisher<'_>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut speed_idx: usize = 0;
    let mut held: Option<MotionCommand> = None;
    let mut last_movement_input = Instant::now();
    let mut last_sent = Instant::now();

    loop {
        if event::poll(Duration::from_millis(20))? {
            if let Event::Key(KeyEvent { code, kind, .. }) = event::read()? {
                let pressed = kind == KeyEventKind::Press || kind == KeyEventKind::Repeat;
                let speed = SPEEDS[speed_idx];

                let movement = match code {
                    KeyCode::Char('w') if pressed => Some(MotionCommand::Forward { speed }),
                    KeyCode::Char('s') if pressed => Some(MotionCommand::Backward { speed }),
                    KeyCode::Char('a') if pressed => Some(MotionCommand::Left { speed }),
                    KeyCode::Char('d') if pressed => Some(MotionCommand::Right { speed }),
                    _ => None,
                };

                match code {
                    _ if movement.is_some() => {
                        last_movement_input = Instant::now();
                        if held != movement {
                            held = movement;
                            last_sent = Instant::now();
                            if let Some(command) = held {
                                send(publisher, MotionRequest::Motion(command)).await?;
                            }
                        }
                    }
                    KeyCode::Char(' ') if pressed => {
                        held = None;
                        send(publisher, MotionRequest::Motion(MotionCommand::Stop)).await?;
                    }
                    KeyCode::Char('i') if pressed => {
                        let init = ControlCommand::Initialize { timeout_ms: None };
                        send(publisher, MotionRequest::Control(init)).await?;
                    }

                    // Speed control
                    KeyCode::Char('r') if pressed => {
                        speed_idx = (speed_idx + 1).min(2);
                        print_speed(speed_idx);
                    }
                    KeyCode::Char('f') if pressed => {
                        speed_idx = speed_idx.saturating_sub(1);
                        print_speed(speed_idx);
                    }

                    // Quit
                    KeyCode::Char('q') | KeyCode::Esc if pressed => break,

                    _ => {}
                }
            }
        }

        // Released keys stop the platform
        if held.is_some() && last_movement_input.elapsed() > Duration::from_millis(INPUT_TIMEOUT_MS) {
            held = None;
            send(publisher, MotionRequest::Motion(MotionCommand::Stop)).await?;
        }

        // Keep the runtime watchdog fed while a key is held
        if let Some(command) = held {
            if last_sent.elapsed() > Duration::from_millis(REPEAT_MS) {
                last_sent = Instant::now();
                send(publisher, MotionRequest::Motion(command)).await?;
            }
        }
    }

    send(publisher, MotionRequest::Motion(MotionCommand::Stop)).await?;
    Ok(())
}

fn print_speed(idx: usize) {
    let label = ["LOW", "MED", "HIGH"][idx];
    info!("Speed: {} ({}%)", label, SPEEDS[idx]);
}
