// Needle and batch pneumatic actuators
//
// Two-state outputs with no feedback. The published state is whatever was
// last commanded; a failed write is logged and the state still records the
// request so the next toggle flips from the operator's point of view.

use tokio::sync::watch;
use tracing::{info, warn};

use crate::devices::DigitalOut;
use crate::messages::ActuatorState;

pub struct Pneumatics {
    needle: Box<dyn DigitalOut>,
    batch: Box<dyn DigitalOut>,
    state: ActuatorState,
    tx: watch::Sender<ActuatorState>,
}

impl Pneumatics {
    /// Take ownership of the outputs and drive both to retracted
    pub fn new(mut needle: Box<dyn DigitalOut>, mut batch: Box<dyn DigitalOut>) -> Self {
        for (name, output) in [("needle", &mut needle), ("batch", &mut batch)] {
            if let Err(e) = output.set(false) {
                warn!("Failed to retract {}: {}", name, e);
            }
        }
        let (tx, _rx) = watch::channel(ActuatorState::default());
        Self {
            needle,
            batch,
            state: ActuatorState::default(),
            tx,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ActuatorState> {
        self.tx.subscribe()
    }

    pub fn state(&self) -> ActuatorState {
        self.state
    }

    pub fn set_needle(&mut self, engaged: bool) {
        if let Err(e) = self.needle.set(engaged) {
            warn!("Needle output failed: {}", e);
        }
        if self.state.needle_engaged != engaged {
            info!("Needle {}", if engaged { "extended" } else { "retracted" });
        }
        self.state.needle_engaged = engaged;
        self.tx.send_replace(self.state);
    }

    pub fn set_batch(&mut self, engaged: bool) {
        if let Err(e) = self.batch.set(engaged) {
            warn!("Batch output failed: {}", e);
        }
        if self.state.batch_engaged != engaged {
            info!("Batch {}", if engaged { "extended" } else { "retracted" });
        }
        self.state.batch_engaged = engaged;
        self.tx.send_replace(self.state);
    }

    pub fn toggle_needle(&mut self) {
        self.set_needle(!self.state.needle_engaged);
    }

    pub fn toggle_batch(&mut self) {
        self.set_batch(!self.state.batch_engaged);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RobotConfig;
    use crate::devices::DeviceRegistry;
    use crate::devices::sim::{PortKind, SimBackend, SimWorld};

    fn setup() -> (SimWorld, Pneumatics, RobotConfig) {
        let config = RobotConfig::default();
        let world = SimWorld::new(&config);
        let backend = SimBackend::new(world.clone(), &config.ports);
        let registry = DeviceRegistry::open(&backend, &config.ports).unwrap();
        let pneumatics = Pneumatics::new(registry.needle, registry.batch);
        (world, pneumatics, config)
    }

    #[tokio::test(start_paused = true)]
    async fn test_starts_retracted() {
        let (world, pneumatics, config) = setup();
        assert_eq!(world.digital(config.ports.needle), Some(false));
        assert_eq!(world.digital(config.ports.batch), Some(false));
        assert_eq!(pneumatics.state(), ActuatorState::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_is_idempotent() {
        let (world, mut pneumatics, config) = setup();
        pneumatics.set_batch(true);
        pneumatics.set_batch(true);
        assert!(pneumatics.state().batch_engaged);
        assert_eq!(world.digital(config.ports.batch), Some(true));
        assert!(!pneumatics.state().needle_engaged);
    }

    #[tokio::test(start_paused = true)]
    async fn test_toggle_flips_and_publishes() {
        let (world, mut pneumatics, config) = setup();
        let rx = pneumatics.subscribe();
        pneumatics.toggle_needle();
        assert!(rx.borrow().needle_engaged);
        assert_eq!(world.digital(config.ports.needle), Some(true));
        pneumatics.toggle_needle();
        assert!(!rx.borrow().needle_engaged);
        assert_eq!(world.digital(config.ports.needle), Some(false));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_write_still_tracks_request() {
        let (world, mut pneumatics, config) = setup();
        world.disconnect(PortKind::Adi, config.ports.batch);
        pneumatics.toggle_batch();
        assert!(pneumatics.state().batch_engaged);
        assert_eq!(world.digital(config.ports.batch), Some(false));
    }
}
