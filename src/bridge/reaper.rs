//! Deferred tap teardown.
//!
//! Deleting a port spawns the external switch tool, whose startup cost
//! dominates per-call latency. The reaper wakes once a second, drains every
//! bridge's defunct list, and issues one batched delete per bridge. Errors
//! are logged and the next tick proceeds regardless.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::Bridges;

/// Handle to the running reaper. Dropping the handle does not stop it;
/// call [`ReaperHandle::shutdown`] for the final pass.
pub struct ReaperHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ReaperHandle {
    /// Stop the ticker after one final reap pass.
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        let _ = self.task.await;
    }
}

/// Spawn the reaper ticker over the given registry.
pub fn spawn_reaper(bridges: Arc<Bridges>) -> ReaperHandle {
    let (stop, mut stopped) = watch::channel(false);
    let task = tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    bridges.reap_all().await;
                }
                _ = stopped.changed() => {
                    // Shutdown pass: anything queued since the last tick.
                    bridges.reap_all().await;
                    return;
                }
            }
        }
    });
    ReaperHandle { stop, task }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::TapNameGenerator;
    use crate::process::MockTools;

    #[tokio::test]
    async fn ticker_reaps_queued_taps() {
        let tools = Arc::new(MockTools::new());
        let dir = tempfile::tempdir().unwrap();
        let sysfs = dir.path().join("net");
        std::fs::create_dir_all(&sysfs).unwrap();
        let bridges = Arc::new(Bridges::with_namegen(
            tools.clone(),
            dir.path(),
            TapNameGenerator::with_sysfs(sysfs),
        ));

        let bridge = bridges.get_or_create("mega_bridge").await.unwrap();
        for _ in 0..3 {
            bridge
                .create_tap(bridges.namegen(), None, 100, false)
                .await
                .unwrap();
        }
        for i in 0..3 {
            bridge
                .queue_tap_remove(&format!("mega_tap{}", i))
                .await
                .unwrap();
        }

        let reaper = spawn_reaper(bridges.clone());
        tokio::time::sleep(Duration::from_millis(1500)).await;
        reaper.shutdown().await;

        let batches: Vec<String> = tools
            .calls_for("ovs-vsctl")
            .iter()
            .map(|c| c.join(" "))
            .filter(|c| c.contains("del-port"))
            .collect();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].matches("del-port").count(), 3);
        assert_eq!(bridge.tap_count().await, 0);
    }
}
