// Arm control task
//
// Runs for the whole process lifetime. With the clamp engaged the arm is
// leveled automatically toward the target level; otherwise step requests
// become short open-loop nudges. The task is the only writer of ArmState and
// of the clamp output; everyone else talks to it through ArmClient.

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::{TaskHandle, spawn_periodic};
use crate::config::ArmConfig;
use crate::devices::{DigitalOut, MotorGroup};
use crate::error::{Result, RobotError};
use crate::messages::{ArmState, Rumble, SensorSnapshot};

const TASK_NAME: &str = "arm";
const REQUEST_CAPACITY: usize = 16;
const FEEDBACK_CAPACITY: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmRequest {
    /// Absolute level; out-of-range values clamp to the nearest valid level
    SetLevel(usize),
    StepUp,
    StepDown,
    ToggleClamp,
}

/// Names for the default three-level table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmLevel {
    Stowed = 0,
    Carry = 1,
    Score = 2,
}

impl From<ArmLevel> for usize {
    fn from(level: ArmLevel) -> Self {
        level as usize
    }
}

/// Index of the level closest to a potentiometer reading
pub fn nearest_level(levels: &[f64], position: f64) -> usize {
    levels
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| (*a - position).abs().total_cmp(&(*b - position).abs()))
        .map_or(0, |(i, _)| i)
}

struct ArmController {
    config: ArmConfig,
    motors: MotorGroup,
    clamp: Box<dyn DigitalOut>,
    snapshot_rx: watch::Receiver<SensorSnapshot>,
    requests: mpsc::Receiver<ArmRequest>,
    state_tx: watch::Sender<ArmState>,
    feedback: mpsc::Sender<Rumble>,
    state: ArmState,
    /// Remaining manual nudge: (power, ticks left)
    nudge: Option<(f64, u32)>,
    engaged_ticks: u64,
    reminder_every: u64,
}

impl ArmController {
    fn top_level(&self) -> usize {
        self.config.levels.len().saturating_sub(1)
    }

    fn handle(&mut self, request: ArmRequest) {
        debug!("Arm request {:?}", request);
        match request {
            ArmRequest::SetLevel(level) => {
                let top = self.top_level();
                if level > top {
                    warn!("Arm level {} out of range, using {}", level, top);
                }
                self.state.target_level = level.min(top);
            }
            ArmRequest::StepUp => {
                self.state.target_level = (self.state.target_level + 1).min(self.top_level());
                if !self.state.clamp_engaged {
                    self.nudge = Some((self.config.nudge_power, self.config.nudge_ticks));
                }
            }
            ArmRequest::StepDown => {
                self.state.target_level = self.state.target_level.saturating_sub(1);
                if !self.state.clamp_engaged {
                    self.nudge = Some((-self.config.nudge_power, self.config.nudge_ticks));
                }
            }
            ArmRequest::ToggleClamp => self.set_clamp(!self.state.clamp_engaged),
        }
    }

    fn set_clamp(&mut self, engaged: bool) {
        if engaged == self.state.clamp_engaged {
            return;
        }
        if let Err(e) = self.clamp.set(engaged) {
            warn!("Clamp output failed: {}", e);
        }
        self.state.clamp_engaged = engaged;
        self.nudge = None;
        if engaged {
            // Hold wherever the arm is now instead of jumping to a stale target
            self.state.target_level = self.state.current_level;
            self.engaged_ticks = 0;
            self.rumble(Rumble::ModeEntry);
            info!(
                "Clamp engaged, leveling to {} (position {:.0})",
                self.state.target_level, self.state.position
            );
        } else {
            info!("Clamp released, manual arm control");
        }
    }

    fn rumble(&self, rumble: Rumble) {
        if self.feedback.try_send(rumble).is_err() {
            debug!("Dropped {:?} feedback, nobody listening", rumble);
        }
    }

    fn step(&mut self) {
        while let Ok(request) = self.requests.try_recv() {
            self.handle(request);
        }

        let position = self.snapshot_rx.borrow().arm_pot;
        self.state.position = position;
        self.state.current_level = nearest_level(&self.config.levels, position);

        let power = if self.state.clamp_engaged {
            self.engaged_ticks += 1;
            if self.engaged_ticks % self.reminder_every == 0 {
                self.rumble(Rumble::Reminder);
            }
            let target = self.config.levels[self.state.target_level];
            (self.config.kp * (target - position)).clamp(-1.0, 1.0)
        } else {
            match self.nudge.take() {
                Some((power, ticks)) if ticks > 0 => {
                    self.nudge = Some((power, ticks - 1));
                    power
                }
                _ => 0.0,
            }
        };

        if let Err(e) = self.motors.set_power(power) {
            debug!("Arm output failed: {}", e);
        }
        self.state_tx.send_replace(self.state);
    }
}

/// Lifecycle wrapper around the arm loop
pub struct ArmTask {
    controller: Option<ArmController>,
    handle: Option<TaskHandle>,
    period: Duration,
}

impl ArmTask {
    /// Build the arm task, the client used to command it, and the receiving
    /// end of its operator feedback
    pub fn new(
        config: ArmConfig,
        period: Duration,
        motors: MotorGroup,
        clamp: Box<dyn DigitalOut>,
        snapshot_rx: watch::Receiver<SensorSnapshot>,
    ) -> (Self, ArmClient, mpsc::Receiver<Rumble>) {
        let (request_tx, requests) = mpsc::channel(REQUEST_CAPACITY);
        let (feedback, feedback_rx) = mpsc::channel(FEEDBACK_CAPACITY);

        let position = snapshot_rx.borrow().arm_pot;
        let level = nearest_level(&config.levels, position);
        let state = ArmState {
            current_level: level,
            target_level: level,
            clamp_engaged: false,
            position,
        };
        let (state_tx, state_rx) = watch::channel(state);

        let period_ms = period.as_millis().max(1) as u64;
        let reminder_every = (config.rumble_interval_ms / period_ms).max(1);
        let start_engaged = config.start_engaged;

        let mut controller = ArmController {
            config,
            motors,
            clamp,
            snapshot_rx,
            requests,
            state_tx,
            feedback,
            state,
            nudge: None,
            engaged_ticks: 0,
            reminder_every,
        };
        if let Err(e) = controller.clamp.set(false) {
            warn!("Clamp output failed: {}", e);
        }
        if start_engaged {
            controller.set_clamp(true);
            controller.state_tx.send_replace(controller.state);
        }

        let client = ArmClient {
            tx: request_tx,
            state_rx,
        };
        (
            Self {
                controller: Some(controller),
                handle: None,
                period,
            },
            client,
            feedback_rx,
        )
    }

    /// Start the loop at the period the reminder cadence was built for
    pub fn start(&mut self) -> Result<()> {
        let mut controller = self
            .controller
            .take()
            .ok_or(RobotError::AlreadyRunning(TASK_NAME))?;
        self.handle = Some(spawn_periodic(TASK_NAME, self.period, move || controller.step()));
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| h.is_running())
    }

    pub async fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.stop().await;
        }
    }
}

/// Cloneable handle for sending requests to the arm task
#[derive(Clone)]
pub struct ArmClient {
    tx: mpsc::Sender<ArmRequest>,
    state_rx: watch::Receiver<ArmState>,
}

impl ArmClient {
    pub fn request(&self, request: ArmRequest) {
        if let Err(e) = self.tx.try_send(request) {
            warn!("Arm request {:?} dropped: {}", request, e);
        }
    }

    pub fn set_level(&self, level: impl Into<usize>) {
        self.request(ArmRequest::SetLevel(level.into()));
    }

    pub fn step_up(&self) {
        self.request(ArmRequest::StepUp);
    }

    pub fn step_down(&self) {
        self.request(ArmRequest::StepDown);
    }

    pub fn toggle_clamp(&self) {
        self.request(ArmRequest::ToggleClamp);
    }

    /// Latest published arm state
    pub fn state(&self) -> ArmState {
        *self.state_rx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ArmState> {
        self.state_rx.clone()
    }
}
