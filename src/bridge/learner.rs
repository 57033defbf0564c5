//! IP/MAC learning for bridge-attached interfaces.
//!
//! The learner polls the host's neighbor table and broadcasts every
//! (MAC, IP) pair it has not seen before. VM network interfaces subscribe
//! and keep their own addresses current until the VM's kill channel fires.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tracing::trace;

use crate::process::ToolRunner;

/// A learned address pairing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetUpdate {
    pub mac: String,
    pub ip: IpAddr,
}

/// Handle to a running learner task.
pub struct Learner {
    tx: broadcast::Sender<NetUpdate>,
    stop: watch::Sender<bool>,
}

impl Learner {
    /// Spawn the polling task.
    pub fn start(tools: Arc<dyn ToolRunner>) -> Self {
        let (tx, _) = broadcast::channel(1024);
        let (stop, mut stopped) = watch::channel(false);

        let sender = tx.clone();
        tokio::spawn(async move {
            let mut seen: HashSet<(String, IpAddr)> = HashSet::new();
            let mut tick = tokio::time::interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = tick.tick() => {}
                    _ = stopped.changed() => return,
                }

                let argv = vec!["ip".to_string(), "neigh".to_string(), "show".to_string()];
                let output = match tools.run(&argv).await {
                    Ok(out) => out,
                    Err(_) => continue,
                };
                for update in parse_neighbors(&output.stdout) {
                    if seen.insert((update.mac.clone(), update.ip)) {
                        trace!(mac = %update.mac, ip = %update.ip, "learned address");
                        // No subscribers is fine; updates are best-effort.
                        let _ = sender.send(update);
                    }
                }
            }
        });

        Self { tx, stop }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NetUpdate> {
        self.tx.subscribe()
    }

    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }
}

/// Parse `ip neigh show` output: `<ip> dev <ifc> lladdr <mac> <state>`.
/// Lines without a link-layer address (FAILED entries) are skipped.
pub fn parse_neighbors(text: &str) -> Vec<NetUpdate> {
    let mut updates = Vec::new();
    for line in text.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let Some(ip) = fields.first().and_then(|f| f.parse::<IpAddr>().ok()) else {
            continue;
        };
        let Some(pos) = fields.iter().position(|f| *f == "lladdr") else {
            continue;
        };
        let Some(mac) = fields.get(pos + 1) else {
            continue;
        };
        updates.push(NetUpdate {
            mac: mac.to_lowercase(),
            ip,
        });
    }
    updates
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_v4_and_v6_neighbors() {
        let text = "\
10.0.0.2 dev mega_bridge lladdr 52:54:00:aa:bb:cc REACHABLE
fe80::5054:ff:feaa:bbcc dev mega_bridge lladdr 52:54:00:AA:BB:CC STALE
10.0.0.9 dev mega_bridge FAILED
";
        let updates = parse_neighbors(text);
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].mac, "52:54:00:aa:bb:cc");
        assert_eq!(updates[0].ip, "10.0.0.2".parse::<IpAddr>().unwrap());
        assert_eq!(updates[1].mac, "52:54:00:aa:bb:cc");
        assert!(updates[1].ip.is_ipv6());
    }

    #[test]
    fn ignores_garbage_lines() {
        assert!(parse_neighbors("not an entry\n\n").is_empty());
    }

    #[tokio::test]
    async fn learner_broadcasts_new_pairs_once() {
        use crate::process::{MockResult, MockTools};

        let tools = Arc::new(MockTools::new());
        // Same neighbor twice: only one update should come through.
        tools.push_result(MockResult::Ok(
            "10.0.0.2 dev mega_bridge lladdr 52:54:00:aa:bb:cc REACHABLE\n",
        ));
        tools.push_result(MockResult::Ok(
            "10.0.0.2 dev mega_bridge lladdr 52:54:00:aa:bb:cc REACHABLE\n",
        ));

        let learner = Learner::start(tools);
        let mut rx = learner.subscribe();
        let update = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(update.mac, "52:54:00:aa:bb:cc");

        // The duplicate is filtered; nothing else arrives promptly.
        let second = tokio::time::timeout(Duration::from_millis(1500), rx.recv()).await;
        assert!(second.is_err());
        learner.stop();
    }
}
