//! Bridge and tap management over an external OpenvSwitch daemon.
//!
//! A process-wide [`Bridges`] registry maps bridge names to [`Bridge`]
//! values. The registry lock serialises bridge creation and destruction;
//! each bridge's own lock serialises mutation of its attached taps. Always
//! take the registry lock before a bridge lock, never the reverse.

pub mod learner;
pub mod reaper;
pub mod tap;

use std::collections::HashMap;
use std::net::UdpSocket;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::process::ToolRunner;
use crate::qos::{self, QosParams};
use crate::{Error, Result};

pub use learner::{Learner, NetUpdate};
pub use reaper::spawn_reaper;
pub use tap::{Tap, TapNameGenerator, VLAN_DISCONNECTED, VLAN_TRUNK};

/// The bridge every unconfigured interface lands on.
pub const DEFAULT_BRIDGE: &str = "mega_bridge";

/// NetFlow export state. The bound socket pins the local UDP port for the
/// lifetime of the exporter.
#[derive(Debug)]
pub struct NetFlow {
    pub port: u16,
    pub active_timeout: u32,
    _socket: UdpSocket,
}

#[derive(Default)]
struct BridgeState {
    taps: HashMap<String, Tap>,
    trunks: Vec<String>,
    tunnels: Vec<String>,
    tunnel_counter: u64,
    netflow: Option<NetFlow>,
    defunct: Vec<String>,
    learner: Option<Learner>,
}

/// One OpenvSwitch bridge and everything attached to it.
pub struct Bridge {
    pub name: String,
    /// True iff the OS bridge existed before this process created its record.
    pub preexisted: bool,
    tools: Arc<dyn ToolRunner>,
    state: Mutex<BridgeState>,
}

impl Bridge {
    /// Add an existing interface to this bridge.
    ///
    /// An "already exists" answer from the switch removes and re-adds the
    /// port once, refreshing a stale attachment. The first tap added starts
    /// the bridge's IP/MAC learner.
    pub async fn add_tap(&self, tap: Tap) -> Result<()> {
        self.reap_defunct().await;

        let mut state = self.state.lock().await;
        if state.taps.contains_key(&tap.name) {
            return Err(Error::already_exists("tap", &tap.name));
        }

        match self.ovs_add_port(&tap.name, tap.vlan).await {
            Ok(()) => {}
            Err(e) if e.is_already_exists() => {
                debug!(bridge = %self.name, tap = %tap.name, "refreshing stale port");
                self.ovs_del_ports(&[tap.name.clone()]).await?;
                self.ovs_add_port(&tap.name, tap.vlan).await?;
            }
            Err(e) => return Err(e),
        }

        if state.learner.is_none() {
            state.learner = Some(Learner::start(self.tools.clone()));
        }
        state.taps.insert(tap.name.clone(), tap);
        Ok(())
    }

    /// Create a tap, bring it up, and attach it.
    ///
    /// With no `name` the generator allocates one; a caller-supplied name
    /// whose device already exists is accepted as-is (the caller owns its
    /// lifecycle). Failures after device creation tear down only the device
    /// this call created.
    pub async fn create_tap(
        &self,
        namegen: &TapNameGenerator,
        name: Option<String>,
        vlan: i32,
        host: bool,
    ) -> Result<String> {
        let caller_owned = name.is_some();
        let name = name.unwrap_or_else(|| namegen.next());

        let create = vec![
            "ip".to_string(),
            "tuntap".to_string(),
            "add".to_string(),
            "mode".to_string(),
            "tap".to_string(),
            "name".to_string(),
            name.clone(),
        ];
        let mut created = true;
        match self.tools.run(&create).await {
            Ok(_) => {}
            Err(e) if caller_owned && e.is_already_exists() => created = false,
            Err(e) => return Err(e),
        }

        if let Err(e) = self.link_up(&name, host).await {
            if created {
                let _ = self.link_del(&name).await;
            }
            return Err(e);
        }

        if let Err(e) = self.add_tap(Tap::new(&name, &self.name, vlan, host)).await {
            if created {
                let _ = self.link_del(&name).await;
            }
            return Err(e);
        }

        Ok(name)
    }

    /// Create a veth pair for a container: one end attached to the bridge,
    /// the peer named `veth<index>` inside `netns` with the requested MAC.
    pub async fn create_container_tap(
        &self,
        namegen: &TapNameGenerator,
        name: Option<String>,
        vlan: i32,
        netns: &str,
        mac: &str,
        index: u32,
    ) -> Result<String> {
        let name = name.unwrap_or_else(|| namegen.next());
        let peer = format!("veth{}", index);

        let create = vec![
            "ip".to_string(),
            "link".to_string(),
            "add".to_string(),
            name.clone(),
            "type".to_string(),
            "veth".to_string(),
            "peer".to_string(),
            "name".to_string(),
            peer.clone(),
            "netns".to_string(),
            netns.to_string(),
        ];
        self.tools.run(&create).await?;

        let in_ns = |rest: Vec<&str>| -> Vec<String> {
            let mut argv = vec![
                "ip".to_string(),
                "netns".to_string(),
                "exec".to_string(),
                netns.to_string(),
                "ip".to_string(),
            ];
            argv.extend(rest.into_iter().map(String::from));
            argv
        };

        let steps = [
            in_ns(vec!["link", "set", "dev", &peer, "address", mac]),
            in_ns(vec!["link", "set", &peer, "up"]),
        ];
        for step in steps {
            if let Err(e) = self.tools.run(&step).await {
                let _ = self.link_del(&name).await;
                return Err(e);
            }
        }

        if let Err(e) = self.link_up(&name, false).await {
            let _ = self.link_del(&name).await;
            return Err(e);
        }
        if let Err(e) = self.add_tap(Tap::new(&name, &self.name, vlan, false)).await {
            let _ = self.link_del(&name).await;
            return Err(e);
        }
        Ok(name)
    }

    /// Mark a tap defunct. The reaper batches the actual removal.
    pub async fn queue_tap_remove(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let mut tap = state
            .taps
            .remove(name)
            .ok_or_else(|| Error::not_found("tap", name))?;
        tap.defunct = true;
        state.defunct.push(tap.name);
        Ok(())
    }

    /// Synchronously remove a tap from the bridge and destroy its device.
    pub async fn destroy_tap(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state
            .taps
            .remove(name)
            .ok_or_else(|| Error::not_found("tap", name))?;
        drop(state);

        self.ovs_del_ports(&[name.to_string()]).await?;
        self.link_del(name).await
    }

    /// Drain this bridge's defunct list into one batched del-port call.
    ///
    /// The list is swapped out under the bridge lock and the external
    /// invocation runs with the lock released, so concurrent adds are not
    /// starved by a large batch.
    pub async fn reap_defunct(&self) {
        let batch = {
            let mut state = self.state.lock().await;
            std::mem::take(&mut state.defunct)
        };
        if batch.is_empty() {
            return;
        }
        debug!(bridge = %self.name, taps = batch.len(), "reaping defunct taps");
        if let Err(e) = self.ovs_del_ports(&batch).await {
            warn!(bridge = %self.name, error = %e, "tap reap failed");
        }
    }

    /// Attach a trunk port (carries all vlans).
    pub async fn trunk_add(&self, iface: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.trunks.iter().any(|t| t == iface) {
            return Err(Error::already_exists("trunk", iface));
        }
        self.ovs_add_port(iface, VLAN_TRUNK).await?;
        state.trunks.push(iface.to_string());
        Ok(())
    }

    pub async fn trunk_remove(&self, iface: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let pos = state
            .trunks
            .iter()
            .position(|t| t == iface)
            .ok_or_else(|| Error::not_found("trunk", iface))?;
        self.ovs_del_ports(&[iface.to_string()]).await?;
        state.trunks.remove(pos);
        Ok(())
    }

    /// Create a tunnel port to a remote bridge endpoint.
    pub async fn tunnel_add(&self, kind: TunnelKind, remote_ip: &str) -> Result<String> {
        let mut state = self.state.lock().await;
        let name = format!("mega_tun{}", state.tunnel_counter);
        state.tunnel_counter += 1;

        let argv = vec![
            "ovs-vsctl".to_string(),
            "add-port".to_string(),
            self.name.clone(),
            name.clone(),
            "--".to_string(),
            "set".to_string(),
            "interface".to_string(),
            name.clone(),
            format!("type={}", kind.as_str()),
            format!("options:remote_ip={}", remote_ip),
        ];
        self.tools.run(&argv).await?;
        state.tunnels.push(name.clone());
        Ok(name)
    }

    pub async fn tunnel_remove(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let pos = state
            .tunnels
            .iter()
            .position(|t| t == name)
            .ok_or_else(|| Error::not_found("tunnel", name))?;
        self.ovs_del_ports(&[name.to_string()]).await?;
        state.tunnels.remove(pos);
        Ok(())
    }

    /// Start exporting NetFlow records to a freshly-allocated local UDP port.
    pub async fn netflow_enable(&self, active_timeout: u32) -> Result<u16> {
        let mut state = self.state.lock().await;
        if state.netflow.is_some() {
            return Err(Error::already_exists("netflow exporter", &self.name));
        }
        let socket = UdpSocket::bind("127.0.0.1:0")?;
        let port = socket.local_addr()?.port();

        self.ovs_set_netflow(port, active_timeout).await?;
        state.netflow = Some(NetFlow {
            port,
            active_timeout,
            _socket: socket,
        });
        info!(bridge = %self.name, port, "netflow enabled");
        Ok(port)
    }

    pub async fn netflow_update_timeout(&self, active_timeout: u32) -> Result<()> {
        let mut state = self.state.lock().await;
        let nf = state
            .netflow
            .as_mut()
            .ok_or_else(|| Error::not_found("netflow exporter", &self.name))?;
        let port = nf.port;
        nf.active_timeout = active_timeout;
        drop(state);
        self.ovs_set_netflow(port, active_timeout).await
    }

    pub async fn netflow_disable(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.netflow.take().is_none() {
            return Err(Error::not_found("netflow exporter", &self.name));
        }
        let argv = vec![
            "ovs-vsctl".to_string(),
            "clear".to_string(),
            "Bridge".to_string(),
            self.name.clone(),
            "netflow".to_string(),
        ];
        self.tools.run(&argv).await.map(|_| ())
    }

    /// Install or update shaping on one of this bridge's taps.
    pub async fn set_qos(&self, tap: &str, params: QosParams) -> Result<()> {
        let mut state = self.state.lock().await;
        let entry = state
            .taps
            .get_mut(tap)
            .ok_or_else(|| Error::not_found("tap", tap))?;
        let prev = entry.qos.clone();

        match qos::apply(self.tools.as_ref(), tap, prev.as_ref(), &params).await {
            Ok(()) => {
                entry.qos = Some(params);
                Ok(())
            }
            Err(e) => {
                entry.qos = None;
                Err(e)
            }
        }
    }

    /// Remove shaping from one tap.
    pub async fn clear_qos(&self, tap: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let entry = state
            .taps
            .get_mut(tap)
            .ok_or_else(|| Error::not_found("tap", tap))?;
        if entry.qos.take().is_some() {
            qos::clear(self.tools.as_ref(), tap).await?;
        }
        Ok(())
    }

    /// (tap name, params) for every shaped tap on this bridge.
    pub async fn qos_entries(&self) -> Vec<(String, QosParams)> {
        let state = self.state.lock().await;
        state
            .taps
            .values()
            .filter_map(|t| t.qos.clone().map(|q| (t.name.clone(), q)))
            .collect()
    }

    /// Subscribe to IP/MAC learner updates. `None` until the first tap is
    /// added.
    pub async fn updates(&self) -> Option<tokio::sync::broadcast::Receiver<NetUpdate>> {
        let state = self.state.lock().await;
        state.learner.as_ref().map(|l| l.subscribe())
    }

    /// Active (non-sentinel) vlans on this bridge, sorted.
    pub async fn vlans(&self) -> Vec<i32> {
        let state = self.state.lock().await;
        let mut vlans: Vec<i32> = state
            .taps
            .values()
            .map(|t| t.vlan)
            .filter(|v| *v >= 0)
            .collect();
        vlans.sort_unstable();
        vlans.dedup();
        vlans
    }

    /// Number of attached taps (trunks and tunnels excluded).
    pub async fn tap_count(&self) -> usize {
        self.state.lock().await.taps.len()
    }

    /// Tear down everything attached, then the bridge itself unless it
    /// preexisted this process.
    async fn destroy(&self) -> Result<()> {
        self.reap_defunct().await;

        let (taps, had_netflow, learner) = {
            let mut state = self.state.lock().await;
            let taps: Vec<String> = state.taps.drain().map(|(name, _)| name).collect();
            state.trunks.clear();
            state.tunnels.clear();
            (taps, state.netflow.take().is_some(), state.learner.take())
        };

        if let Some(learner) = learner {
            learner.stop();
        }
        if had_netflow {
            let argv = vec![
                "ovs-vsctl".to_string(),
                "clear".to_string(),
                "Bridge".to_string(),
                self.name.clone(),
                "netflow".to_string(),
            ];
            let _ = self.tools.run(&argv).await;
        }
        if !taps.is_empty() {
            self.ovs_del_ports(&taps).await?;
            for tap in &taps {
                let _ = self.link_del(tap).await;
            }
        }

        if !self.preexisted {
            let argv = vec![
                "ovs-vsctl".to_string(),
                "del-br".to_string(),
                self.name.clone(),
            ];
            self.tools.run(&argv).await?;
        }
        info!(bridge = %self.name, "destroyed");
        Ok(())
    }

    // ── external tool plumbing ────────────────────────────────────────

    async fn ovs_add_port(&self, iface: &str, vlan: i32) -> Result<()> {
        let mut argv = vec![
            "ovs-vsctl".to_string(),
            "add-port".to_string(),
            self.name.clone(),
            iface.to_string(),
        ];
        if vlan >= 0 {
            argv.push(format!("tag={}", vlan));
        }
        self.tools.run(&argv).await.map(|_| ())
    }

    /// One `--`-separated multi-op invocation removing every named port.
    async fn ovs_del_ports(&self, ports: &[String]) -> Result<()> {
        let mut argv = vec!["ovs-vsctl".to_string()];
        for (i, port) in ports.iter().enumerate() {
            if i > 0 {
                argv.push("--".to_string());
            }
            argv.push("del-port".to_string());
            argv.push(self.name.clone());
            argv.push(port.clone());
        }
        self.tools.run(&argv).await.map(|_| ())
    }

    async fn ovs_set_netflow(&self, port: u16, active_timeout: u32) -> Result<()> {
        let argv = vec![
            "ovs-vsctl".to_string(),
            "--".to_string(),
            "set".to_string(),
            "Bridge".to_string(),
            self.name.clone(),
            "netflow=@nf".to_string(),
            "--".to_string(),
            "--id=@nf".to_string(),
            "create".to_string(),
            "NetFlow".to_string(),
            format!("targets=\"127.0.0.1:{}\"", port),
            format!("active-timeout={}", active_timeout),
        ];
        self.tools.run(&argv).await.map(|_| ())
    }

    async fn link_up(&self, iface: &str, promisc: bool) -> Result<()> {
        let mut argv = vec![
            "ip".to_string(),
            "link".to_string(),
            "set".to_string(),
            iface.to_string(),
            "up".to_string(),
        ];
        if promisc {
            argv.push("promisc".to_string());
            argv.push("on".to_string());
        }
        self.tools.run(&argv).await.map(|_| ())
    }

    async fn link_del(&self, iface: &str) -> Result<()> {
        let argv = vec![
            "ip".to_string(),
            "link".to_string(),
            "del".to_string(),
            iface.to_string(),
        ];
        self.tools.run(&argv).await.map(|_| ())
    }
}

/// Tunnel encapsulations supported by the switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelKind {
    Vxlan,
    Gre,
}

impl TunnelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelKind::Vxlan => "vxlan",
            TunnelKind::Gre => "gre",
        }
    }
}

impl std::str::FromStr for TunnelKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "vxlan" => Ok(TunnelKind::Vxlan),
            "gre" => Ok(TunnelKind::Gre),
            other => Err(Error::Validation(format!("unknown tunnel type: {}", other))),
        }
    }
}

/// Process-wide bridge registry.
pub struct Bridges {
    tools: Arc<dyn ToolRunner>,
    base: PathBuf,
    namegen: TapNameGenerator,
    inner: Mutex<HashMap<String, Arc<Bridge>>>,
}

impl Bridges {
    pub fn new(tools: Arc<dyn ToolRunner>, base: impl Into<PathBuf>) -> Self {
        Self {
            tools,
            base: base.into(),
            namegen: TapNameGenerator::new(),
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Registry with a sysfs override for the tap-name generator.
    pub fn with_namegen(
        tools: Arc<dyn ToolRunner>,
        base: impl Into<PathBuf>,
        namegen: TapNameGenerator,
    ) -> Self {
        Self {
            tools,
            base: base.into(),
            namegen,
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub fn namegen(&self) -> &TapNameGenerator {
        &self.namegen
    }

    /// Return the named bridge, creating the OS bridge idempotently and
    /// bringing its interface up on first reference. If bring-up fails the
    /// half-made bridge is deleted and no registry entry is left behind.
    pub async fn get_or_create(&self, name: &str) -> Result<Arc<Bridge>> {
        let mut inner = self.inner.lock().await;
        if let Some(bridge) = inner.get(name) {
            return Ok(bridge.clone());
        }

        let existing = self
            .tools
            .run(&["ovs-vsctl".to_string(), "list-br".to_string()])
            .await?;
        let preexisted = existing.stdout.lines().any(|l| l.trim() == name);

        if !preexisted {
            let add = vec![
                "ovs-vsctl".to_string(),
                "--may-exist".to_string(),
                "add-br".to_string(),
                name.to_string(),
            ];
            self.tools.run(&add).await?;
        }

        let up = vec![
            "ip".to_string(),
            "link".to_string(),
            "set".to_string(),
            name.to_string(),
            "up".to_string(),
        ];
        if let Err(e) = self.tools.run(&up).await {
            if !preexisted {
                let del = vec![
                    "ovs-vsctl".to_string(),
                    "del-br".to_string(),
                    name.to_string(),
                ];
                let _ = self.tools.run(&del).await;
            }
            return Err(e);
        }

        let bridge = Arc::new(Bridge {
            name: name.to_string(),
            preexisted,
            tools: self.tools.clone(),
            state: Mutex::new(BridgeState::default()),
        });
        inner.insert(name.to_string(), bridge.clone());
        drop(inner);

        info!(bridge = %name, preexisted, "bridge registered");
        self.persist().await?;
        Ok(bridge)
    }

    /// Look up an existing bridge.
    pub async fn get(&self, name: &str) -> Result<Arc<Bridge>> {
        self.inner
            .lock()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found("bridge", name))
    }

    /// All registered bridges, sorted by name.
    pub async fn list(&self) -> Vec<Arc<Bridge>> {
        let inner = self.inner.lock().await;
        let mut bridges: Vec<_> = inner.values().cloned().collect();
        bridges.sort_by(|a, b| a.name.cmp(&b.name));
        bridges
    }

    /// Destroy one bridge and everything attached to it.
    pub async fn destroy(&self, name: &str) -> Result<()> {
        let bridge = {
            let mut inner = self.inner.lock().await;
            inner
                .remove(name)
                .ok_or_else(|| Error::not_found("bridge", name))?
        };
        bridge.destroy().await?;
        self.persist().await
    }

    /// Drain every bridge's defunct list. Called by the reaper tick.
    pub async fn reap_all(&self) {
        for bridge in self.list().await {
            bridge.reap_defunct().await;
        }
    }

    /// {bridge, tap, params} rows for every shaped tap.
    pub async fn qos_list(&self) -> Vec<(String, String, QosParams)> {
        let mut rows = Vec::new();
        for bridge in self.list().await {
            for (tap, params) in bridge.qos_entries().await {
                rows.push((bridge.name.clone(), tap, params));
            }
        }
        rows
    }

    /// Destroy everything: final reap, then each bridge in turn.
    pub async fn teardown(&self) {
        self.reap_all().await;
        let names: Vec<String> = self.list().await.iter().map(|b| b.name.clone()).collect();
        for name in names {
            if let Err(e) = self.destroy(&name).await {
                warn!(bridge = %name, error = %e, "bridge teardown failed");
            }
        }
    }

    /// Rewrite `<base>/bridges`: one line per bridge with its pre-existed
    /// flag and active vlans.
    async fn persist(&self) -> Result<()> {
        let mut lines = vec!["# bridge preexisted vlans".to_string()];
        for bridge in self.list().await {
            let vlans: Vec<String> = bridge.vlans().await.iter().map(|v| v.to_string()).collect();
            lines.push(format!(
                "{} {} {}",
                bridge.name,
                bridge.preexisted,
                vlans.join(",")
            ));
        }
        let path = self.base.join("bridges");
        tokio::fs::write(&path, lines.join("\n") + "\n").await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{MockResult, MockTools};

    fn registry(tools: Arc<MockTools>, dir: &tempfile::TempDir) -> Bridges {
        let sysfs = dir.path().join("net");
        std::fs::create_dir_all(&sysfs).unwrap();
        Bridges::with_namegen(tools, dir.path(), TapNameGenerator::with_sysfs(sysfs))
    }

    #[tokio::test]
    async fn get_or_create_is_idempotent() {
        let tools = Arc::new(MockTools::new());
        let dir = tempfile::tempdir().unwrap();
        let bridges = registry(tools.clone(), &dir);

        let a = bridges.get_or_create("mega_bridge").await.unwrap();
        let b = bridges.get_or_create("mega_bridge").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        // One list-br, one add-br, one link up — the second call hit the map.
        assert_eq!(tools.calls_for("ovs-vsctl").len(), 2);
        assert!(!a.preexisted);
    }

    #[tokio::test]
    async fn preexisting_bridge_is_not_recreated() {
        let tools = Arc::new(MockTools::new());
        tools.push_result(MockResult::Ok("br-ext\nmega_bridge\n"));
        let dir = tempfile::tempdir().unwrap();
        let bridges = registry(tools.clone(), &dir);

        let bridge = bridges.get_or_create("mega_bridge").await.unwrap();
        assert!(bridge.preexisted);
        // list-br only; no add-br.
        assert_eq!(tools.calls_for("ovs-vsctl").len(), 1);
    }

    #[tokio::test]
    async fn failed_bring_up_rolls_back() {
        let tools = Arc::new(MockTools::new());
        tools.push_result(MockResult::Ok("")); // list-br
        tools.push_result(MockResult::Ok("")); // add-br
        tools.push_result(MockResult::Err("no such device")); // link up
        let dir = tempfile::tempdir().unwrap();
        let bridges = registry(tools.clone(), &dir);

        assert!(bridges.get_or_create("mega_bridge").await.is_err());
        assert!(bridges.get("mega_bridge").await.is_err());

        let last = tools.calls_for("ovs-vsctl").pop().unwrap();
        assert_eq!(last[1], "del-br");
    }

    #[tokio::test]
    async fn create_tap_rolls_back_created_device_only() {
        let tools = Arc::new(MockTools::new());
        let dir = tempfile::tempdir().unwrap();
        let bridges = registry(tools.clone(), &dir);
        let bridge = bridges.get_or_create("mega_bridge").await.unwrap();

        tools.push_result(MockResult::Ok("")); // tuntap add
        tools.push_result(MockResult::Err("device busy")); // link up
        let err = bridge
            .create_tap(bridges.namegen(), None, 100, false)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("device busy"));

        let ip_calls = tools.calls_for("ip");
        let last = ip_calls.last().unwrap();
        assert_eq!(&last[1..3], &["link".to_string(), "del".to_string()]);
    }

    #[tokio::test]
    async fn caller_supplied_existing_tap_is_accepted() {
        let tools = Arc::new(MockTools::new());
        let dir = tempfile::tempdir().unwrap();
        let bridges = registry(tools.clone(), &dir);
        let bridge = bridges.get_or_create("mega_bridge").await.unwrap();

        tools.push_result(MockResult::Err("ioctl(TUNSETIFF): Device or resource busy: already exists"));
        let name = bridge
            .create_tap(bridges.namegen(), Some("my_tap".into()), 100, false)
            .await
            .unwrap();
        assert_eq!(name, "my_tap");
        assert_eq!(bridge.tap_count().await, 1);
    }

    #[tokio::test]
    async fn queued_taps_reap_in_one_batch() {
        let tools = Arc::new(MockTools::new());
        let dir = tempfile::tempdir().unwrap();
        let bridges = registry(tools.clone(), &dir);
        let bridge = bridges.get_or_create("mega_bridge").await.unwrap();

        for _ in 0..10 {
            bridge
                .create_tap(bridges.namegen(), None, 100, false)
                .await
                .unwrap();
        }
        let names: Vec<String> = (0..10).map(|i| format!("mega_tap{}", i)).collect();
        for name in &names {
            bridge.queue_tap_remove(name).await.unwrap();
        }

        let before = tools.calls_for("ovs-vsctl").len();
        bridges.reap_all().await;
        let calls = tools.calls_for("ovs-vsctl");
        assert_eq!(calls.len(), before + 1, "one batched invocation");

        let batch = calls.last().unwrap().join(" ");
        for name in &names {
            assert!(batch.contains(name));
        }
        assert_eq!(batch.matches("del-port").count(), 10);
        assert_eq!(bridge.tap_count().await, 0);
    }

    #[tokio::test]
    async fn destroy_tap_is_synchronous() {
        let tools = Arc::new(MockTools::new());
        let dir = tempfile::tempdir().unwrap();
        let bridges = registry(tools.clone(), &dir);
        let bridge = bridges.get_or_create("mega_bridge").await.unwrap();

        bridge
            .create_tap(bridges.namegen(), None, 200, false)
            .await
            .unwrap();
        assert_eq!(bridge.tap_count().await, 1);
        bridge.destroy_tap("mega_tap0").await.unwrap();
        assert_eq!(bridge.tap_count().await, 0);

        let joined: Vec<String> = tools.calls().iter().map(|c| c.join(" ")).collect();
        assert!(joined.contains(&"ovs-vsctl del-port mega_bridge mega_tap0".to_string()));
        assert!(joined.contains(&"ip link del mega_tap0".to_string()));
    }

    #[tokio::test]
    async fn netflow_allocates_local_port() {
        let tools = Arc::new(MockTools::new());
        let dir = tempfile::tempdir().unwrap();
        let bridges = registry(tools.clone(), &dir);
        let bridge = bridges.get_or_create("mega_bridge").await.unwrap();

        let port = bridge.netflow_enable(30).await.unwrap();
        assert!(port > 0);
        assert!(bridge.netflow_enable(30).await.is_err());

        let set = tools.calls_for("ovs-vsctl").pop().unwrap().join(" ");
        assert!(set.contains(&format!("targets=\"127.0.0.1:{}\"", port)));
        assert!(set.contains("active-timeout=30"));

        bridge.netflow_disable().await.unwrap();
        assert!(bridge.netflow_disable().await.is_err());
    }

    #[tokio::test]
    async fn bridges_file_tracks_registry() {
        let tools = Arc::new(MockTools::new());
        let dir = tempfile::tempdir().unwrap();
        let bridges = registry(tools.clone(), &dir);
        bridges.get_or_create("mega_bridge").await.unwrap();
        bridges.get_or_create("lan0").await.unwrap();

        let text = std::fs::read_to_string(dir.path().join("bridges")).unwrap();
        assert!(text.contains("lan0 false"));
        assert!(text.contains("mega_bridge false"));

        bridges.destroy("lan0").await.unwrap();
        let text = std::fs::read_to_string(dir.path().join("bridges")).unwrap();
        assert!(!text.contains("lan0"));
    }

    #[tokio::test]
    async fn tunnel_round_trip() {
        let tools = Arc::new(MockTools::new());
        let dir = tempfile::tempdir().unwrap();
        let bridges = registry(tools.clone(), &dir);
        let bridge = bridges.get_or_create("mega_bridge").await.unwrap();

        let name = bridge
            .tunnel_add(TunnelKind::Vxlan, "10.0.0.2")
            .await
            .unwrap();
        assert_eq!(name, "mega_tun0");
        let add = tools.calls_for("ovs-vsctl").pop().unwrap().join(" ");
        assert!(add.contains("type=vxlan"));
        assert!(add.contains("options:remote_ip=10.0.0.2"));

        bridge.tunnel_remove(&name).await.unwrap();
        assert!(bridge.tunnel_remove(&name).await.is_err());
    }
}
