use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

use robot_task_runtime::config::{RobotConfig, TELEOP_DURATION};
use robot_task_runtime::devices::sim::{SimBackend, SimWorld};
use robot_task_runtime::error::Result;
use robot_task_runtime::input::{IdleController, KeyboardController};
use robot_task_runtime::routines::Routine;
use robot_task_runtime::runtime::Robot;

#[derive(Parser)]
#[command(version, about = "Robot task runtime on the simulated base")]
struct Cli {
    /// JSON config file; missing fields use built-in defaults
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Autonomous routine (win_point, ring_rush)
    #[arg(long, global = true, default_value = "win_point")]
    routine: String,

    /// Publish robot state over zenoh
    #[arg(long, global = true)]
    telemetry: bool,

    /// Teleop length in seconds (teleop runs until Esc when omitted)
    #[arg(long, global = true)]
    teleop_secs: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Init, then run the autonomous routine once
    Auton,
    /// Init, then drive from the keyboard
    Teleop,
    /// Competition init, autonomous, disabled, teleop
    Match,
}

async fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => RobotConfig::load(path)?,
        None => RobotConfig::default(),
    };
    let routine: Routine = cli.routine.parse()?;

    info!("Using simulated devices");
    let world = SimWorld::new(&config);
    let backend = SimBackend::new(world, &config.ports);

    let mut robot = Robot::new(config, routine);
    robot.on_init(&backend)?;
    if cli.telemetry {
        robot.enable_telemetry().await?;
    }

    let teleop_duration = cli.teleop_secs.map(Duration::from_secs);
    let result = match cli.command {
        Command::Auton => {
            robot.on_competition_init()?;
            robot.on_autonomous().await.map(|_| ())
        }
        Command::Teleop => {
            let mut keyboard = KeyboardController::new()?;
            robot
                .on_teleop(&mut keyboard, &mut IdleController, teleop_duration)
                .await
                .map(|_| ())
        }
        Command::Match => {
            let mut keyboard = KeyboardController::new()?;
            robot
                .run_match(
                    &mut keyboard,
                    &mut IdleController,
                    teleop_duration.unwrap_or(TELEOP_DURATION),
                )
                .await
        }
    };
    robot.shutdown().await;
    result
}

#[tokio::main]
async fn main() {
    // Setup logging (set RUST_LOG=info or debug)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(LevelFilter::INFO.into()))
        .init();

    if let Err(e) = run(Cli::parse()).await {
        eprintln!("Runtime error: {}", e);
        std::process::exit(1);
    }
}
