//! Task-coordination runtime for a competition robot.
//!
//! Periodic sensor, localization, follower and arm tasks share state through
//! single-writer `watch` channels. An autonomous [`sequencer::Sequencer`]
//! issues motion commands and waits on them with deadlines; the
//! [`teleop::TeleopLoop`] maps two controllers onto the drivetrain, arm and
//! pneumatics. [`runtime::Robot`] ties them to the competition lifecycle.

pub mod config;
pub mod devices;
pub mod error;
pub mod input;
pub mod messages;
pub mod pneumatics;
pub mod routines;
pub mod runtime;
pub mod sequencer;
pub mod tasks;
pub mod telemetry;
pub mod teleop;
