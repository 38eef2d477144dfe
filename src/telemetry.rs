// Zenoh state publisher
//
// Diagnostics only. Publishes the latest pose, arm state, actuator state and
// runtime health as JSON at a fixed rate. Nothing in the control path reads
// these topics.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{info, warn};
use zenoh::pubsub::Publisher;

use crate::config::{TOPIC_ACTUATORS, TOPIC_ARM, TOPIC_HEALTH, TOPIC_POSE};
use crate::error::{Result, RobotError};
use crate::messages::{ActuatorState, ArmState, Pose, RuntimeHealth, SensorSnapshot};

fn telemetry_err(e: impl std::fmt::Display) -> RobotError {
    RobotError::Telemetry(e.to_string())
}

/// Long-lived state channels to publish
#[derive(Clone)]
pub struct TelemetrySources {
    pub snapshot: watch::Receiver<SensorSnapshot>,
    pub arm: watch::Receiver<ArmState>,
    pub actuators: watch::Receiver<ActuatorState>,
}

/// One publish cycle: (topic, JSON payload) pairs
fn frame(
    sources: &TelemetrySources,
    pose: Option<&watch::Receiver<Pose>>,
) -> serde_json::Result<Vec<(&'static str, String)>> {
    let mut out = Vec::with_capacity(4);
    if let Some(pose) = pose {
        out.push((TOPIC_POSE, serde_json::to_string(&*pose.borrow())?));
    }
    out.push((TOPIC_ARM, serde_json::to_string(&*sources.arm.borrow())?));
    out.push((
        TOPIC_ACTUATORS,
        serde_json::to_string(&*sources.actuators.borrow())?,
    ));
    let health = RuntimeHealth::from(&*sources.snapshot.borrow());
    out.push((TOPIC_HEALTH, serde_json::to_string(&health)?));
    Ok(out)
}

struct Publishers {
    pose: Publisher<'static>,
    arm: Publisher<'static>,
    actuators: Publisher<'static>,
    health: Publisher<'static>,
}

impl Publishers {
    fn for_topic(&self, topic: &str) -> Option<&Publisher<'static>> {
        match topic {
            TOPIC_POSE => Some(&self.pose),
            TOPIC_ARM => Some(&self.arm),
            TOPIC_ACTUATORS => Some(&self.actuators),
            TOPIC_HEALTH => Some(&self.health),
            _ => None,
        }
    }
}

pub struct Telemetry {
    pose_source: watch::Sender<Option<watch::Receiver<Pose>>>,
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl Telemetry {
    /// Open a zenoh session, declare the publishers and start publishing
    pub async fn start(sources: TelemetrySources, rate_hz: u64) -> Result<Self> {
        info!("Opening Zenoh session...");
        let session = zenoh::open(zenoh::Config::default())
            .await
            .map_err(telemetry_err)?;

        info!("Setting up publishers...");
        let publishers = Publishers {
            pose: session
                .declare_publisher(TOPIC_POSE)
                .await
                .map_err(telemetry_err)?,
            arm: session
                .declare_publisher(TOPIC_ARM)
                .await
                .map_err(telemetry_err)?,
            actuators: session
                .declare_publisher(TOPIC_ACTUATORS)
                .await
                .map_err(telemetry_err)?,
            health: session
                .declare_publisher(TOPIC_HEALTH)
                .await
                .map_err(telemetry_err)?,
        };

        let (pose_source, pose_rx) = watch::channel(None);
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let period = Duration::from_millis(1000 / rate_hz.max(1));

        let join = tokio::spawn(async move {
            // Session must outlive its publishers
            let _session = session;
            let mut tick = interval(period);
            let mut failing = false;
            while !flag.load(Ordering::Acquire) {
                tick.tick().await;
                let pose = pose_rx.borrow().clone();
                let payloads = match frame(&sources, pose.as_ref()) {
                    Ok(p) => p,
                    Err(e) => {
                        warn!("Failed to encode telemetry: {}", e);
                        continue;
                    }
                };
                for (topic, payload) in payloads {
                    let Some(publisher) = publishers.for_topic(topic) else {
                        continue;
                    };
                    match publisher.put(payload).await {
                        Ok(()) => failing = false,
                        Err(e) if !failing => {
                            warn!("Telemetry publish on {} failed: {}", topic, e);
                            failing = true;
                        }
                        Err(_) => {}
                    }
                }
            }
        });

        info!(
            "Publishing to: {}, {}, {}, {} at {}Hz",
            TOPIC_POSE, TOPIC_ARM, TOPIC_ACTUATORS, TOPIC_HEALTH, rate_hz
        );
        Ok(Self {
            pose_source,
            stop,
            join: Some(join),
        })
    }

    /// Publish this pose until replaced or cleared
    pub fn track_pose(&self, rx: watch::Receiver<Pose>) {
        self.pose_source.send_replace(Some(rx));
    }

    pub fn clear_pose(&self) {
        self.pose_source.send_replace(None);
    }

    pub async fn stop(mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(join) = self.join.take() {
            if let Err(e) = join.await {
                warn!("Telemetry task ended abnormally: {}", e);
            }
        }
        info!("Telemetry stopped");
    }
}

impl Drop for Telemetry {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::StaleFlags;

    fn sources(stale: bool) -> TelemetrySources {
        let snapshot = SensorSnapshot {
            stale: StaleFlags {
                imu: stale,
                ..Default::default()
            },
            ..Default::default()
        };
        TelemetrySources {
            snapshot: watch::channel(snapshot).1,
            arm: watch::channel(ArmState {
                target_level: 2,
                ..Default::default()
            })
            .1,
            actuators: watch::channel(ActuatorState::default()).1,
        }
    }

    #[test]
    fn test_frame_without_pose() {
        let frame = frame(&sources(false), None).unwrap();
        let topics: Vec<_> = frame.iter().map(|(t, _)| *t).collect();
        assert_eq!(topics, vec![TOPIC_ARM, TOPIC_ACTUATORS, TOPIC_HEALTH]);
        assert_eq!(frame[2].1, "\"ok\"");

        let arm: ArmState = serde_json::from_str(&frame[0].1).unwrap();
        assert_eq!(arm.target_level, 2);
    }

    #[test]
    fn test_frame_with_pose_and_stale_sensor() {
        let pose = watch::channel(Pose::new(1.0, 2.0, -90.0)).1;
        let frame = frame(&sources(true), Some(&pose)).unwrap();
        assert_eq!(frame[0].0, TOPIC_POSE);
        let decoded: Pose = serde_json::from_str(&frame[0].1).unwrap();
        assert_eq!(decoded, Pose::new(1.0, 2.0, -90.0));
        assert_eq!(frame[3].1, "\"sensor_stale\"");
    }
}
