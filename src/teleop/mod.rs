// Operator control
//
// TeleopState::tick maps two controller readings to one TeleopOutput and
// has no I/O. TeleopLoop runs it on a fixed period and applies the output
// to the drivetrain, the arm task and the pneumatics.

pub mod drive;
pub mod edges;

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior, interval};
use tracing::{debug, info, warn};

use crate::devices::{BrakeMode, Drivetrain};
use crate::error::Result;
use crate::input::{Button, ControllerInput, ControllerState};
use crate::messages::{DriveCommand, Rumble};
use crate::pneumatics::Pneumatics;
use crate::tasks::arm::ArmClient;

pub use drive::DriveMode;
pub use edges::EdgeDetector;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmStep {
    Up,
    Down,
}

/// Everything one teleop tick asks for
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TeleopOutput {
    pub drive: DriveCommand,
    /// Set when this tick switched drive mode
    pub mode_changed: Option<DriveMode>,
    pub arm_step: Option<ArmStep>,
    pub toggle_clamp: bool,
    pub toggle_needle: bool,
    pub toggle_batch: bool,
}

#[derive(Debug, Clone, Default)]
pub struct TeleopState {
    mode: DriveMode,
    primary: EdgeDetector,
    secondary: EdgeDetector,
}

impl TeleopState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mode(&self) -> DriveMode {
        self.mode
    }

    pub fn tick(&mut self, primary: &ControllerState, secondary: &ControllerState) -> TeleopOutput {
        let p = self.primary.update(primary.buttons);
        let s = self.secondary.update(secondary.buttons);

        let mut out = TeleopOutput::default();
        if p.contains(Button::Y) {
            self.mode = self.mode.toggled();
            out.mode_changed = Some(self.mode);
        }
        out.drive = self.mode.mix(primary);

        // Either controller can step the arm; up wins over down
        if p.contains(Button::L1) || s.contains(Button::R1) {
            out.arm_step = Some(ArmStep::Up);
        } else if p.contains(Button::L2) || s.contains(Button::R2) {
            out.arm_step = Some(ArmStep::Down);
        }

        out.toggle_clamp = p.contains(Button::X);
        out.toggle_needle = p.contains(Button::R1);
        out.toggle_batch = p.contains(Button::R2);
        out
    }
}

/// The devices and clients the teleop loop writes to
pub struct TeleopLoop<'a> {
    pub drivetrain: &'a Drivetrain,
    pub arm: &'a ArmClient,
    pub pneumatics: &'a mut Pneumatics,
    pub feedback: &'a mut mpsc::Receiver<Rumble>,
}

impl TeleopLoop<'_> {
    fn apply(&mut self, out: &TeleopOutput) {
        if let Some(mode) = out.mode_changed {
            info!("Drive mode: {:?}", mode);
        }
        if let Err(e) = self.drivetrain.apply(out.drive) {
            debug!("Drive output failed: {}", e);
        }
        match out.arm_step {
            Some(ArmStep::Up) => self.arm.step_up(),
            Some(ArmStep::Down) => self.arm.step_down(),
            None => {}
        }
        if out.toggle_clamp {
            self.arm.toggle_clamp();
        }
        if out.toggle_needle {
            self.pneumatics.toggle_needle();
        }
        if out.toggle_batch {
            self.pneumatics.toggle_batch();
        }
    }

    /// Run until `duration` elapses or the primary controller ends. Returns
    /// the number of ticks run. The base is stopped on the way out.
    pub async fn run(
        &mut self,
        primary: &mut dyn ControllerInput,
        secondary: &mut dyn ControllerInput,
        period: Duration,
        duration: Option<Duration>,
    ) -> Result<u64> {
        if let Err(e) = self.drivetrain.set_brake_mode(BrakeMode::Brake) {
            warn!("Failed to set drive brake mode: {}", e);
        }
        // Feedback queued while no operator was driving is stale
        let mut stale = 0;
        while self.feedback.try_recv().is_ok() {
            stale += 1;
        }
        if stale > 0 {
            debug!("Discarded {} queued rumbles", stale);
        }
        let deadline = duration.map(|d| Instant::now() + d);
        let mut tick = interval(period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut state = TeleopState::new();
        let mut ticks = 0u64;
        info!("Teleop started, {}ms period", period.as_millis());

        let result = loop {
            tick.tick().await;
            if deadline.is_some_and(|d| Instant::now() >= d) {
                info!("Teleop period over");
                break Ok(ticks);
            }
            let p = match primary.state() {
                Ok(Some(p)) => p,
                Ok(None) => {
                    info!("Primary controller ended");
                    break Ok(ticks);
                }
                Err(e) => break Err(e),
            };
            let s = match secondary.state() {
                Ok(s) => s.unwrap_or_default(),
                Err(e) => {
                    debug!("Secondary controller read failed: {}", e);
                    ControllerState::default()
                }
            };

            let out = state.tick(&p, &s);
            self.apply(&out);
            while let Ok(rumble) = self.feedback.try_recv() {
                primary.rumble(rumble.pattern());
            }
            ticks += 1;
        };

        if let Err(e) = self.drivetrain.stop() {
            warn!("Failed to stop base: {}", e);
        }
        info!("Teleop ended after {} ticks", ticks);
        result
    }
}
