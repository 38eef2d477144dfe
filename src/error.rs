// Error types for the runtime
//
// Device failures are mostly tolerated by the tasks (they degrade to the last
// known value), so DeviceError usually ends up in a log line rather than being
// propagated. RobotError is what the lifecycle and sequencer surface.

use crate::messages::CommandKind;

/// Errors raised at the device boundary
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DeviceError {
    #[error("Device on port {port} is disconnected")]
    Disconnected { port: u8 },

    #[error("Port {port} is not a valid {kind} port")]
    InvalidPort { port: u8, kind: &'static str },

    #[error("Port {port} is assigned to more than one device")]
    PortInUse { port: u8 },
}

/// Errors raised by the runtime core
#[derive(Debug, thiserror::Error)]
pub enum RobotError {
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config: {0}")]
    Config(String),

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] serde_json::Error),

    #[error("Command {id} ({kind:?}) is still outstanding")]
    CommandOutstanding { id: u64, kind: CommandKind },

    #[error("No outstanding {expected:?} command to wait for")]
    NoMatchingCommand { expected: CommandKind },

    #[error("Task '{0}' is already running")]
    AlreadyRunning(&'static str),

    #[error("Task '{0}' is not running")]
    NotRunning(&'static str),

    #[error("Unknown routine '{0}'")]
    UnknownRoutine(String),

    #[error("Telemetry error: {0}")]
    Telemetry(String),
}

pub type Result<T> = std::result::Result<T, RobotError>;
