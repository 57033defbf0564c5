//! VM lifecycle and supervision.
//!
//! A [`Vm`] is a tagged variant (KVM or container) behind one capability
//! set. Every state transition happens under the per-VM lock; two
//! background watchers per VM — the exit-waiter and the kill-waiter —
//! observe the emulator process independently and never block the command
//! path.

pub mod config;
pub mod container;
pub mod kvm;
pub mod qemu_args;
pub mod registry;
pub mod screenshot;

use std::collections::HashMap;
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::info;

use crate::bridge::Bridges;
use crate::process::ToolRunner;
use crate::qmp::QmpClient;
use crate::{Error, Result};

pub use config::{
    conflict_between, random_mac, ContainerConfig, KvmConfig, NetConfig, ScheduleHints, VmConfig,
    VmKindConfig,
};
pub use qemu_args::QemuOverride;
pub use registry::VmRegistry;

/// VM lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum VmState {
    Building,
    Running,
    Paused,
    Quit,
    Error,
}

impl VmState {
    /// Terminal states a relaunch may proceed from.
    pub fn is_terminal(&self) -> bool {
        matches!(self, VmState::Quit | VmState::Error)
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VmState::Building => "BUILDING",
            VmState::Running => "RUNNING",
            VmState::Paused => "PAUSED",
            VmState::Quit => "QUIT",
            VmState::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// One-shot kill signal, closed exactly once.
///
/// Subsequent fires are ignored via a compare-and-swap on the guard flag.
#[derive(Debug)]
pub struct KillSwitch {
    fired: AtomicBool,
    tx: watch::Sender<bool>,
}

impl KillSwitch {
    pub fn new() -> Arc<Self> {
        let (tx, _) = watch::channel(false);
        Arc::new(Self {
            fired: AtomicBool::new(false),
            tx,
        })
    }

    /// Fire the switch. Returns true only for the call that closed it.
    pub fn fire(&self) -> bool {
        if self
            .fired
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let _ = self.tx.send(true);
            true
        } else {
            false
        }
    }

    pub fn fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Addresses the learner has attributed to one interface.
#[derive(Debug, Clone, Copy, Default)]
pub struct LearnedAddrs {
    pub v4: Option<Ipv4Addr>,
    pub v6: Option<Ipv6Addr>,
}

/// Mutable per-VM state, guarded by the per-VM lock.
#[derive(Debug)]
pub struct VmRuntime {
    pub state: VmState,
    pub pid: Option<i32>,
    pub qmp: Option<Arc<QmpClient>>,
    pub cc_connected: bool,
    /// Realised tap names, parallel to `config.networks`.
    pub taps: Vec<String>,
    pub kill: Arc<KillSwitch>,
    /// Closed by the exit-waiter when the process is gone.
    pub exited: Option<watch::Receiver<bool>>,
    /// Stderr tail recorded on abnormal exit.
    pub error: Option<String>,
    pub hotplug: HashMap<u32, String>,
    pub hotplug_counter: u32,
}

impl VmRuntime {
    fn new() -> Self {
        Self {
            state: VmState::Building,
            pid: None,
            qmp: None,
            cc_connected: false,
            taps: Vec::new(),
            kill: KillSwitch::new(),
            exited: None,
            error: None,
            hotplug: HashMap::new(),
            hotplug_counter: 0,
        }
    }
}

/// Shared collaborators every VM operation needs.
#[derive(Clone)]
pub struct VmContext {
    pub tools: Arc<dyn ToolRunner>,
    pub bridges: Arc<Bridges>,
    /// Rewrites applied to the emulator argv, snapshot at launch time.
    pub overrides: Vec<QemuOverride>,
    /// Kill-acks land here, one VM id per completed kill.
    pub ack_tx: mpsc::UnboundedSender<u32>,
}

/// A virtual machine: cluster-wide UUID, per-host id, namespace-unique name.
#[derive(Debug)]
pub struct Vm {
    pub id: u32,
    pub uuid: String,
    pub name: String,
    pub namespace: String,
    pub dir: PathBuf,
    pub config: VmConfig,
    /// Free-form key/value tags; orthogonal to launch and never block it.
    tags: std::sync::Mutex<HashMap<String, String>>,
    /// Learner results, outside the per-VM lock so address updates never
    /// contend with a launch in flight.
    addrs: Arc<std::sync::Mutex<Vec<LearnedAddrs>>>,
    runtime: Mutex<VmRuntime>,
}

impl Vm {
    pub fn new(
        id: u32,
        uuid: String,
        name: String,
        namespace: String,
        dir: PathBuf,
        config: VmConfig,
    ) -> Arc<Self> {
        let ifaces = config.networks.len();
        Arc::new(Self {
            id,
            uuid,
            name,
            namespace,
            dir,
            config,
            tags: std::sync::Mutex::new(HashMap::new()),
            addrs: Arc::new(std::sync::Mutex::new(vec![LearnedAddrs::default(); ifaces])),
            runtime: Mutex::new(VmRuntime::new()),
        })
    }

    pub fn kind(&self) -> &'static str {
        self.config.kind.kind_name()
    }

    /// Current state. Reads take the per-VM lock like every transition, so
    /// observers always see transitions in order.
    pub async fn state(&self) -> VmState {
        self.runtime.lock().await.state
    }

    /// Launch the VM. Legal from `Building` (first launch); relaunching a
    /// terminal VM goes through [`Vm::start`].
    pub async fn launch(self: &Arc<Self>, ctx: &VmContext) -> Result<()> {
        let mut runtime = self.runtime.lock().await;
        if runtime.state != VmState::Building {
            return Err(Error::State(format!(
                "vm {} is {}, not buildable",
                self.name, runtime.state
            )));
        }
        self.launch_locked(&mut runtime, ctx).await
    }

    async fn launch_locked(
        self: &Arc<Self>,
        runtime: &mut VmRuntime,
        ctx: &VmContext,
    ) -> Result<()> {
        let result = match &self.config.kind {
            VmKindConfig::Kvm(kvm) => kvm::launch(self, runtime, kvm, ctx).await,
            VmKindConfig::Container(c) => container::launch(self, runtime, c, ctx).await,
        };
        match result {
            Ok(()) => {
                self.set_state(runtime, VmState::Running);
                info!(vm = %self.name, id = self.id, "launched");
                Ok(())
            }
            Err(e) => {
                runtime.error = Some(e.to_string());
                self.set_state(runtime, VmState::Error);
                Err(e)
            }
        }
    }

    /// Resume a paused VM, or relaunch one that has quit or errored.
    pub async fn start(self: &Arc<Self>, ctx: &VmContext) -> Result<()> {
        let mut runtime = self.runtime.lock().await;
        match runtime.state {
            VmState::Paused => {
                match &self.config.kind {
                    VmKindConfig::Kvm(_) => {
                        let qmp = runtime
                            .qmp
                            .clone()
                            .ok_or_else(|| Error::State("no control socket".into()))?;
                        qmp.cont().await?;
                    }
                    VmKindConfig::Container(_) => {
                        if let Some(pid) = runtime.pid {
                            signal(pid, libc::SIGCONT)?;
                        }
                    }
                }
                self.set_state(&mut runtime, VmState::Running);
                Ok(())
            }
            VmState::Quit | VmState::Error => {
                // Relaunch: old taps go to the reaper, the kill channel is
                // rebuilt, and the launch protocol runs again.
                self.release_taps(&mut runtime, ctx).await;
                runtime.kill = KillSwitch::new();
                runtime.error = None;
                runtime.pid = None;
                runtime.qmp = None;
                runtime.cc_connected = false;
                runtime.exited = None;
                runtime.state = VmState::Building;
                self.launch_locked(&mut runtime, ctx).await
            }
            other => Err(Error::State(format!(
                "vm {} is {}, cannot start",
                self.name, other
            ))),
        }
    }

    /// Pause a running VM.
    pub async fn stop(&self) -> Result<()> {
        let mut runtime = self.runtime.lock().await;
        if runtime.state != VmState::Running {
            return Err(Error::State(format!(
                "vm {} is {}, not running",
                self.name, runtime.state
            )));
        }
        match &self.config.kind {
            VmKindConfig::Kvm(_) => {
                let qmp = runtime
                    .qmp
                    .clone()
                    .ok_or_else(|| Error::State("no control socket".into()))?;
                qmp.stop().await?;
            }
            VmKindConfig::Container(_) => {
                if let Some(pid) = runtime.pid {
                    signal(pid, libc::SIGSTOP)?;
                }
            }
        }
        self.set_state(&mut runtime, VmState::Paused);
        Ok(())
    }

    /// Fire the kill channel. The kill-waiter delivers SIGKILL and emits
    /// the kill-ack once the exit-waiter has seen the process go.
    pub async fn kill(&self) -> Result<()> {
        let runtime = self.runtime.lock().await;
        if runtime.state.is_terminal() || runtime.state == VmState::Building {
            return Err(Error::State(format!(
                "vm {} is {}, nothing to kill",
                self.name, runtime.state
            )));
        }
        runtime.kill.fire();
        Ok(())
    }

    /// Queue this VM's taps for batched removal.
    pub(crate) async fn release_taps(&self, runtime: &mut VmRuntime, ctx: &VmContext) {
        for (net, tap) in self.config.networks.iter().zip(runtime.taps.drain(..)) {
            if let Ok(bridge) = ctx.bridges.get(&net.bridge).await {
                let _ = bridge.queue_tap_remove(&tap).await;
            }
        }
    }

    /// Flush cleanup: release taps and forget runtime handles. Only legal
    /// on a terminal VM.
    pub async fn cleanup(&self, ctx: &VmContext) -> Result<()> {
        let mut runtime = self.runtime.lock().await;
        if !runtime.state.is_terminal() {
            return Err(Error::State(format!(
                "vm {} is {}, not flushable",
                self.name, runtime.state
            )));
        }
        self.release_taps(&mut runtime, ctx).await;
        runtime.qmp = None;
        Ok(())
    }

    /// Grab a screenshot as PNG bytes, thumbnailed within `max_dim`
    /// (0 keeps the native resolution). Rejected unless Running.
    pub async fn screenshot(&self, max_dim: u32) -> Result<Vec<u8>> {
        let runtime = self.runtime.lock().await;
        if runtime.state != VmState::Running {
            return Err(Error::State(format!(
                "vm {} is {}, not running",
                self.name, runtime.state
            )));
        }
        let qmp = runtime
            .qmp
            .clone()
            .ok_or_else(|| Error::State("screenshot unsupported for this vm type".into()))?;
        drop(runtime);

        let tmp = tempfile::NamedTempFile::new()?;
        let path = tmp
            .path()
            .to_str()
            .ok_or_else(|| Error::Validation("non-utf8 temp path".into()))?
            .to_string();
        qmp.screendump(&path).await?;
        let ppm = tokio::fs::read(&path).await?;
        // tmp unlinks on drop.
        screenshot::ppm_to_png(&ppm, max_dim)
    }

    /// Begin a disk migration into `path`.
    pub async fn migrate(&self, path: &str) -> Result<()> {
        let runtime = self.runtime.lock().await;
        let qmp = runtime
            .qmp
            .clone()
            .ok_or_else(|| Error::State("migration unsupported for this vm type".into()))?;
        drop(runtime);
        qmp.migrate(path).await
    }

    /// Migration status and fractional progress.
    pub async fn query_migrate(&self) -> Result<(String, f64)> {
        let runtime = self.runtime.lock().await;
        let qmp = runtime
            .qmp
            .clone()
            .ok_or_else(|| Error::State("migration unsupported for this vm type".into()))?;
        drop(runtime);
        qmp.query_migrate().await
    }

    /// Raw QMP passthrough: `input` is a full QMP request object.
    pub async fn qmp_raw(&self, input: &str) -> Result<Value> {
        let request: Value = serde_json::from_str(input)
            .map_err(|e| Error::Validation(format!("bad qmp json: {}", e)))?;
        let command = request
            .get("execute")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Validation("qmp json missing execute".into()))?
            .to_string();
        let arguments = request.get("arguments").cloned();

        let runtime = self.runtime.lock().await;
        let qmp = runtime
            .qmp
            .clone()
            .ok_or_else(|| Error::State("no control socket".into()))?;
        drop(runtime);
        qmp.execute(&command, arguments).await
    }

    /// Hot-attach a disk image over USB. Returns the hotplug slot id.
    pub async fn hotplug_add(&self, file: &str) -> Result<u32> {
        let mut runtime = self.runtime.lock().await;
        if runtime.state != VmState::Running {
            return Err(Error::State(format!(
                "vm {} is {}, not running",
                self.name, runtime.state
            )));
        }
        let qmp = runtime
            .qmp
            .clone()
            .ok_or_else(|| Error::State("hotplug unsupported for this vm type".into()))?;
        let slot = runtime.hotplug_counter;
        runtime.hotplug_counter += 1;

        qmp.human_monitor(&format!("drive_add 0 file={},if=none,id=hotplug{}", file, slot))
            .await?;
        qmp.device_add(
            serde_json::json!({ "drive": format!("hotplug{}", slot) }),
            "usb-storage",
            &format!("hotplug{}", slot),
        )
        .await?;
        runtime.hotplug.insert(slot, file.to_string());
        Ok(slot)
    }

    /// Detach a hotplugged disk.
    pub async fn hotplug_remove(&self, slot: u32) -> Result<()> {
        let mut runtime = self.runtime.lock().await;
        runtime
            .hotplug
            .remove(&slot)
            .ok_or_else(|| Error::not_found("hotplug device", slot.to_string()))?;
        let qmp = runtime
            .qmp
            .clone()
            .ok_or_else(|| Error::State("no control socket".into()))?;
        drop(runtime);
        qmp.device_del(&format!("hotplug{}", slot)).await
    }

    /// (slot, file) for every hotplugged device.
    pub async fn hotplug_list(&self) -> Vec<(u32, String)> {
        let runtime = self.runtime.lock().await;
        let mut list: Vec<(u32, String)> =
            runtime.hotplug.iter().map(|(k, v)| (*k, v.clone())).collect();
        list.sort_by_key(|(slot, _)| *slot);
        list
    }

    pub fn set_tag(&self, key: impl Into<String>, value: impl Into<String>) {
        self.tags.lock().unwrap().insert(key.into(), value.into());
    }

    pub fn get_tag(&self, key: &str) -> Option<String> {
        self.tags.lock().unwrap().get(key).cloned()
    }

    pub fn tags(&self) -> HashMap<String, String> {
        self.tags.lock().unwrap().clone()
    }

    /// Learned addresses for each interface.
    pub fn learned_addrs(&self) -> Vec<LearnedAddrs> {
        self.addrs.lock().unwrap().clone()
    }

    pub(crate) fn addrs_handle(&self) -> Arc<std::sync::Mutex<Vec<LearnedAddrs>>> {
        self.addrs.clone()
    }

    /// Stderr tail recorded by the exit-waiter, if the VM errored.
    pub async fn error_detail(&self) -> Option<String> {
        self.runtime.lock().await.error.clone()
    }

    /// Wait until the underlying process has exited. Returns immediately
    /// when nothing is running.
    pub async fn wait_exit(&self) {
        let exited = {
            let runtime = self.runtime.lock().await;
            runtime.exited.clone()
        };
        if let Some(mut exited) = exited {
            while !*exited.borrow() {
                if exited.changed().await.is_err() {
                    return;
                }
            }
        }
    }

    /// One tabular info row: see [`Vm::info_header`].
    pub async fn info_row(&self) -> Vec<String> {
        let runtime = self.runtime.lock().await;
        let vlans: Vec<String> = self
            .config
            .networks
            .iter()
            .map(|n| n.vlan.to_string())
            .collect();
        let addrs = self.learned_addrs();
        let ips: Vec<String> = addrs
            .iter()
            .flat_map(|a| {
                a.v4.map(|ip| ip.to_string())
                    .into_iter()
                    .chain(a.v6.map(|ip| ip.to_string()))
            })
            .collect();
        let tags = self.tags();
        let mut tag_pairs: Vec<String> = tags.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        tag_pairs.sort();

        vec![
            self.id.to_string(),
            self.name.clone(),
            runtime.state.to_string(),
            self.kind().to_string(),
            self.uuid.clone(),
            self.config.memory.to_string(),
            self.config.vcpus.to_string(),
            vlans.join(","),
            ips.join(","),
            tag_pairs.join(","),
            self.dir.display().to_string(),
        ]
    }

    pub fn info_header() -> Vec<String> {
        ["id", "name", "state", "type", "uuid", "memory", "vcpus", "vlan", "ip", "tags", "dir"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    /// Write the state file and update in-memory state.
    pub(crate) fn set_state(&self, runtime: &mut VmRuntime, state: VmState) {
        runtime.state = state;
        let _ = std::fs::write(self.dir.join("state"), format!("{}\n", state));
    }

    /// Exclusive access to the runtime for the launch implementations.
    pub(crate) async fn lock_runtime(&self) -> tokio::sync::MutexGuard<'_, VmRuntime> {
        self.runtime.lock().await
    }
}

/// Deliver a signal to a pid.
pub(crate) fn signal(pid: i32, sig: i32) -> Result<()> {
    // SAFETY: plain kill(2); an ESRCH answer means the process is gone,
    // which every caller treats as success.
    let rc = unsafe { libc::kill(pid, sig) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            return Err(Error::Io(err));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kill_switch_fires_once() {
        let kill = KillSwitch::new();
        let mut rx = kill.subscribe();
        assert!(!*rx.borrow());
        assert!(kill.fire());
        assert!(!kill.fire());
        assert!(kill.fired());
        assert!(rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn state_transitions_guarded() {
        let dir = tempfile::tempdir().unwrap();
        let vm = Vm::new(
            0,
            "uuid".into(),
            "t0".into(),
            "default".into(),
            dir.path().to_path_buf(),
            VmConfig::default(),
        );
        assert_eq!(vm.state().await, VmState::Building);

        // Stop before launch is a state error.
        let err = vm.stop().await.unwrap_err();
        assert!(matches!(err, Error::State(_)));

        // Kill before launch likewise.
        assert!(vm.kill().await.is_err());
    }

    #[tokio::test]
    async fn screenshot_rejected_unless_running() {
        let dir = tempfile::tempdir().unwrap();
        let vm = Vm::new(
            1,
            "uuid".into(),
            "t1".into(),
            "default".into(),
            dir.path().to_path_buf(),
            VmConfig::default(),
        );
        assert!(vm.screenshot(0).await.is_err());
    }

    #[test]
    fn tags_are_orthogonal() {
        let dir = tempfile::tempdir().unwrap();
        let vm = Vm::new(
            2,
            "uuid".into(),
            "t2".into(),
            "default".into(),
            dir.path().to_path_buf(),
            VmConfig::default(),
        );
        vm.set_tag("rack", "r7");
        assert_eq!(vm.get_tag("rack").unwrap(), "r7");
        assert!(vm.get_tag("missing").is_none());
    }
}
