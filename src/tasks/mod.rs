// Periodic control tasks
//
// Every task is a tokio loop on a fixed interval. One iteration finishes
// before the next starts, and the loop checks a cooperative stop flag after
// each tick so a phase can end its tasks cleanly.

pub mod arm;
pub mod follower;
pub mod odometry;
pub mod sensors;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

/// Handle to a running periodic task
pub struct TaskHandle {
    name: &'static str,
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl TaskHandle {
    pub fn is_running(&self) -> bool {
        self.join.as_ref().is_some_and(|j| !j.is_finished())
    }

    /// Ask the task to stop and wait for its current iteration to finish
    pub async fn stop(mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(join) = self.join.take() {
            if let Err(e) = join.await {
                warn!("Task '{}' ended abnormally: {}", self.name, e);
            }
        }
        info!("Task '{}' stopped", self.name);
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        // A forgotten handle must not leave the loop running
        self.stop.store(true, Ordering::Release);
    }
}

/// Spawn `step` every `period` until the returned handle is stopped or dropped
pub fn spawn_periodic<F>(name: &'static str, period: Duration, mut step: F) -> TaskHandle
where
    F: FnMut() + Send + 'static,
{
    let stop = Arc::new(AtomicBool::new(false));
    let flag = stop.clone();
    let join = tokio::spawn(async move {
        let mut tick = interval(period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!("Task '{}' started, period {:?}", name, period);
        loop {
            tick.tick().await;
            if flag.load(Ordering::Acquire) {
                break;
            }
            step();
        }
    });
    info!("Spawned task '{}' ({}ms period)", name, period.as_millis());
    TaskHandle {
        name,
        stop,
        join: Some(join),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[tokio::test(start_paused = true)]
    async fn test_runs_once_per_period() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let handle = spawn_periodic("counter", Duration::from_millis(10), move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        // First tick fires immediately, then every 10ms
        tokio::time::sleep(Duration::from_millis(95)).await;
        assert_eq!(count.load(Ordering::SeqCst), 10);
        assert!(handle.is_running());
        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_ends_loop() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let handle = spawn_periodic("stoppable", Duration::from_millis(5), move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.stop().await;

        let after_stop = count.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), after_stop);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_handle_stops_task() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let handle = spawn_periodic("dropped", Duration::from_millis(5), move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_millis(12)).await;
        drop(handle);

        // At most one more tick can observe the flag before the loop exits
        tokio::time::sleep(Duration::from_millis(10)).await;
        let settled = count.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), settled);
    }
}
