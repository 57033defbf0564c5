//! The engine: one value owning every piece of global state.
//!
//! Bridges, namespaces, the mesh node, the tap reaper, the emulator argv
//! overrides, and the kernel-tunable save state all hang off [`Engine`].
//! Tests build their own engine over a tempdir and a mock tool runner;
//! nothing in the crate reaches for process-wide mutable state.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tracing::{error, info, warn};

use vmesh_protocol::{WireCommand, WireQueuedVms};

use crate::bridge::{reaper::ReaperHandle, spawn_reaper, Bridges};
use crate::mesh::Mesh;
use crate::namespace::{Namespace, Namespaces};
use crate::process::ToolRunner;
use crate::scheduler::{self, CommitMetric, HostStats, QueuedVms};
use crate::vm::{ContainerConfig, QemuOverride, VmConfig, VmContext};
use crate::{Error, Result};

/// Engine construction parameters, straight off the flag set.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Base data path; instance dirs, the bridges table, and the control
    /// socket all live under it.
    pub base: PathBuf,
    pub hostname: String,
    pub mesh_port: u16,
    /// Target outbound connection count; 0 means don't dial.
    pub degree: usize,
    /// Membership advertisement period.
    pub msa_timeout: Duration,
    /// Per-send response deadline.
    pub send_timeout: Duration,
    /// KSM tunables root, overridable for tests.
    pub ksm_root: PathBuf,
}

impl EngineConfig {
    pub fn new(base: impl Into<PathBuf>, hostname: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            hostname: hostname.into(),
            mesh_port: 9000,
            degree: 0,
            msa_timeout: Duration::from_secs(10),
            send_timeout: Duration::from_secs(30),
            ksm_root: PathBuf::from("/sys/kernel/mm/ksm"),
        }
    }
}

pub struct Engine {
    pub config: EngineConfig,
    pub tools: Arc<dyn ToolRunner>,
    pub bridges: Arc<Bridges>,
    pub namespaces: Namespaces,
    pub mesh: Arc<Mesh>,
    /// Emulator argv rewrites; snapshot into each launch.
    pub overrides: std::sync::Mutex<Vec<QemuOverride>>,
    /// The config the next `vm launch` captures.
    pub current: Mutex<VmConfig>,
    /// Container-variant settings paired with `current`.
    pub current_container: Mutex<ContainerConfig>,
    reaper: Mutex<Option<ReaperHandle>>,
    ksm_saved: std::sync::Mutex<Option<String>>,
    shutdown_tx: watch::Sender<bool>,
}

impl Engine {
    pub fn new(config: EngineConfig, tools: Arc<dyn ToolRunner>) -> Arc<Self> {
        let bridges = Arc::new(Bridges::new(tools.clone(), &config.base));
        let namespaces = Namespaces::new(&config.base);
        let mesh = Mesh::new(config.hostname.clone(), config.mesh_port, config.degree);
        let (shutdown_tx, _) = watch::channel(false);

        Arc::new(Self {
            config,
            tools,
            bridges,
            namespaces,
            mesh,
            overrides: std::sync::Mutex::new(Vec::new()),
            current: Mutex::new(VmConfig::default()),
            current_container: Mutex::new(ContainerConfig::default()),
            reaper: Mutex::new(None),
            ksm_saved: std::sync::Mutex::new(None),
            shutdown_tx,
        })
    }

    /// Engine with a mock-friendly config used across the test suite.
    pub fn for_tests(dir: &std::path::Path, tools: Arc<dyn ToolRunner>) -> Arc<Self> {
        let mut config = EngineConfig::new(dir, "testhost");
        config.ksm_root = dir.join("ksm");
        Engine::new(config, tools)
    }

    /// Create the base path and start the background machinery. Failure to
    /// make the base path is fatal.
    pub async fn start(self: &Arc<Self>, serve_mesh: bool) -> Result<()> {
        std::fs::create_dir_all(&self.config.base)?;
        std::fs::create_dir_all(self.config.base.join("files"))?;

        *self.reaper.lock().await = Some(spawn_reaper(self.bridges.clone()));
        if serve_mesh {
            self.mesh.serve();
            self.mesh.spawn_msa(self.config.msa_timeout);
        }
        self.spawn_inbox_service();
        info!(base = %self.config.base.display(), host = %self.config.hostname, "engine up");
        Ok(())
    }

    /// Observe shutdown requests (the `quit` command, signals).
    pub fn shutdown_watch(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Request an orderly exit after `delay`.
    pub fn request_shutdown(self: &Arc<Self>, delay: Duration) {
        let engine = self.clone();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let _ = engine.shutdown_tx.send(true);
        });
    }

    /// Kill every VM, tear the network plane down, restore kernel
    /// tunables, and remove the control socket.
    pub async fn teardown(self: &Arc<Self>) {
        info!("tearing down");
        for ns in self.namespaces.all().await {
            let killed = ns.registry.kill_all(Duration::from_secs(5)).await;
            if killed > 0 {
                info!(namespace = %ns.name, killed, "vms killed");
            }
            let ctx = self.vm_context(&ns);
            if let Err(e) = ns.registry.flush(&ctx).await {
                warn!(namespace = %ns.name, error = %e, "flush failed");
            }
        }

        if let Some(reaper) = self.reaper.lock().await.take() {
            reaper.shutdown().await;
        }
        self.bridges.teardown().await;

        if let Err(e) = self.ksm_restore() {
            warn!(error = %e, "ksm restore failed");
        }
        let _ = std::fs::remove_file(self.config.base.join("vmesh"));
    }

    /// The collaborator bundle for VM operations in `ns`.
    pub fn vm_context(&self, ns: &Namespace) -> VmContext {
        VmContext {
            tools: self.tools.clone(),
            bridges: self.bridges.clone(),
            overrides: self.overrides.lock().unwrap().clone(),
            ack_tx: ns.registry.ack_sender(),
        }
    }

    // ── KSM ───────────────────────────────────────────────────────────

    /// Turn kernel samepage merging on, saving the prior value once.
    pub fn ksm_enable(&self) -> Result<()> {
        let run = self.config.ksm_root.join("run");
        let prior = std::fs::read_to_string(&run)?;
        {
            let mut saved = self.ksm_saved.lock().unwrap();
            if saved.is_none() {
                *saved = Some(prior.trim().to_string());
            }
        }
        std::fs::write(&run, "1")?;
        Ok(())
    }

    pub fn ksm_disable(&self) -> Result<()> {
        std::fs::write(self.config.ksm_root.join("run"), "0")?;
        Ok(())
    }

    /// Put the tunable back the way we found it.
    pub fn ksm_restore(&self) -> Result<()> {
        if let Some(saved) = self.ksm_saved.lock().unwrap().take() {
            std::fs::write(self.config.ksm_root.join("run"), saved)?;
        }
        Ok(())
    }

    // ── Host stats ────────────────────────────────────────────────────

    /// This host's capacity and commit snapshot, summed over every
    /// namespace.
    pub async fn local_stats(&self) -> HostStats {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get() as u64)
            .unwrap_or(1);
        let mem_total = read_mem_total_mb().unwrap_or(0);

        let mut stats = HostStats::new(self.config.hostname.clone(), cpus, mem_total);
        for ns in self.namespaces.all().await {
            let (cpu, mem, net) = ns.registry.commits().await;
            stats.cpu_commit += cpu;
            stats.mem_commit += mem;
            stats.net_commit += net;
            stats.vm_count += ns.registry.count().await as u64;
        }
        stats
    }

    /// Stats for every host in `hosts`: local snapshot for this host, one
    /// mesh round for the rest. Hosts that miss the deadline are dropped
    /// with a warning.
    pub async fn collect_host_stats(self: &Arc<Self>, hosts: &[String]) -> Vec<HostStats> {
        let mut stats = Vec::new();
        let mut remote: Vec<String> = Vec::new();
        for host in hosts {
            if *host == self.config.hostname {
                stats.push(self.local_stats().await);
            } else {
                remote.push(host.clone());
            }
        }
        if remote.is_empty() {
            return stats;
        }

        let cmd = WireCommand {
            original: "host stats".to_string(),
            path: vec!["host".to_string(), "stats".to_string()],
            ..Default::default()
        };
        let mut rx = self
            .mesh
            .send(remote, cmd, self.config.send_timeout);
        if let Some(batch) = rx.recv().await {
            for resp in batch {
                if !resp.error.is_empty() {
                    warn!(host = %resp.host, error = %resp.error, "host stats unavailable");
                    continue;
                }
                match parse_stats_row(&resp.tabular) {
                    Some(row) => stats.push(row),
                    None => warn!(host = %resp.host, "malformed host stats row"),
                }
            }
        }
        stats
    }

    /// The tabular row `host stats` answers with; the inverse of
    /// [`parse_stats_row`].
    pub fn stats_row(stats: &HostStats) -> Vec<String> {
        vec![
            stats.name.clone(),
            stats.cpus.to_string(),
            stats.mem_total.to_string(),
            stats.cpu_commit.to_string(),
            stats.mem_commit.to_string(),
            stats.net_commit.to_string(),
            stats.vm_count.to_string(),
            stats.limit.to_string(),
        ]
    }

    pub fn stats_header() -> Vec<String> {
        ["host", "cpus", "memtotal", "cpucommit", "memcommit", "netcommit", "vms", "limit"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    // ── Launch ────────────────────────────────────────────────────────

    /// Queue a launch request against the active namespace. `target` is a
    /// name list or a bare count.
    pub async fn queue_launch(self: &Arc<Self>, kind: &str, target: &str) -> Result<usize> {
        let ns = self.namespaces.active().await;
        let names = self.expand_names(&ns, target).await;
        if names.is_empty() {
            return Err(Error::Validation("no names to launch".into()));
        }

        let mut config = self.current.lock().await.clone();
        match kind {
            "kvm" => {}
            "container" => {
                config.kind =
                    crate::vm::VmKindConfig::Container(self.current_container.lock().await.clone());
            }
            other => {
                return Err(Error::Validation(format!("unknown vm type: {}", other)));
            }
        }

        let count = names.len();
        ns.enqueue(QueuedVms { names, config }).await;
        Ok(count)
    }

    async fn expand_names(&self, ns: &Namespace, target: &str) -> Vec<String> {
        if let Ok(count) = target.parse::<u32>() {
            let start = ns.registry.count().await + ns.queue_len().await;
            (0..count as usize)
                .map(|i| format!("vm{}", start + i))
                .collect()
        } else {
            target
                .split(',')
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect()
        }
    }

    /// Schedule and launch everything queued in the active namespace.
    ///
    /// With no namespace hosts (or only this host) the whole queue runs
    /// locally; otherwise the scheduler partitions it and remote batches go
    /// out as remote-launch messages. Remote errors come back as strings
    /// and are joined with newline.
    pub async fn launch_queued(self: &Arc<Self>) -> Result<usize> {
        let ns = self.namespaces.active().await;
        let queue = ns.drain_queue().await;
        if queue.is_empty() {
            return Err(Error::Validation("launch queue is empty".into()));
        }
        let total: usize = queue.iter().map(|q| q.names.len()).sum();

        let hosts = ns.hosts().await;
        let local_only =
            hosts.is_empty() || hosts == [self.config.hostname.clone()];

        let mut errors: Vec<String> = Vec::new();
        if local_only {
            for queued in queue {
                errors.extend(self.launch_partition(&ns, queued).await);
            }
        } else {
            let stats = self.collect_host_stats(&hosts).await;
            if stats.is_empty() {
                return Err(Error::Transport("no hosts reported stats".into()));
            }
            let placement = scheduler::schedule(&queue, &stats, CommitMetric::Cpu)?;

            for (host, partitions) in placement {
                if host == self.config.hostname {
                    for queued in partitions {
                        errors.extend(self.launch_partition(&ns, queued).await);
                    }
                    continue;
                }
                let wire: Vec<WireQueuedVms> = partitions
                    .iter()
                    .map(|q| {
                        Ok(WireQueuedVms {
                            names: q.names.clone(),
                            config: serde_json::to_value(&q.config)?,
                        })
                    })
                    .collect::<Result<_>>()?;
                match self
                    .mesh
                    .remote_launch(&host, &ns.name, wire, self.config.send_timeout)
                    .await
                {
                    Ok(remote_errors) => errors.extend(remote_errors),
                    Err(e) => errors.push(format!("{}: {}", host, e)),
                }
            }
        }

        if errors.is_empty() {
            Ok(total)
        } else {
            Err(Error::Validation(errors.join("\n")))
        }
    }

    /// Create and launch one partition locally; returns error strings.
    pub async fn launch_partition(self: &Arc<Self>, ns: &Namespace, queued: QueuedVms) -> Vec<String> {
        let ctx = self.vm_context(ns);
        let mut errors = Vec::new();
        for name in &queued.names {
            let vm = match ns.registry.create(name, queued.config.clone()).await {
                Ok(vm) => vm,
                Err(e) => {
                    errors.push(format!("{}: {}", name, e));
                    continue;
                }
            };
            if let Err(e) = vm.launch(&ctx).await {
                errors.push(format!("{}: {}", name, e));
            }
        }
        errors
    }

    // ── Mesh service loops ────────────────────────────────────────────

    /// Service inbound mesh traffic: remote commands, remote launches, and
    /// file transfers.
    fn spawn_inbox_service(self: &Arc<Self>) {
        let Some(mut inbox) = self.mesh.take_inbox() else {
            return;
        };

        let engine = self.clone();
        tokio::spawn(async move {
            while let Some((from, msg)) = inbox.commands.recv().await {
                let response = crate::dispatch::handle_command(&engine, &msg.command).await;
                engine.mesh.reply(&from, msg.tid, response).await;
            }
        });

        let engine = self.clone();
        tokio::spawn(async move {
            while let Some((from, msg)) = inbox.launches.recv().await {
                let ns = engine.namespaces.get_or_create(&msg.namespace).await;
                let mut errors: Vec<String> = Vec::new();
                for wire in msg.queued {
                    match serde_json::from_value::<VmConfig>(wire.config) {
                        Ok(config) => {
                            let queued = QueuedVms {
                                names: wire.names,
                                config,
                            };
                            errors.extend(engine.launch_partition(&ns, queued).await);
                        }
                        Err(e) => errors.push(format!("bad config: {}", e)),
                    }
                }
                engine.mesh.remote_launch_reply(&from, msg.tid, errors).await;
            }
        });

        let engine = self.clone();
        tokio::spawn(async move {
            while let Some((from, msg)) = inbox.files.recv().await {
                if let Err(e) = engine.receive_file(&msg).await {
                    error!(from = %from, file = %msg.filename, error = %e, "file receive failed");
                }
            }
        });
    }

    /// Append one file-transfer chunk under `<base>/files`.
    async fn receive_file(&self, msg: &vmesh_protocol::FileTransferMessage) -> Result<()> {
        let name = msg.filename.trim_start_matches('/');
        if name.contains("..") {
            return Err(Error::Validation(format!("bad transfer path: {}", name)));
        }
        let path = self.config.base.join("files").join(name);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        use tokio::io::AsyncSeekExt;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(&path)
            .await?;
        file.seek(std::io::SeekFrom::Start(msg.offset)).await?;
        tokio::io::AsyncWriteExt::write_all(&mut file, &msg.data).await?;
        Ok(())
    }
}

/// MemTotal from /proc/meminfo, in MB.
fn read_mem_total_mb() -> Option<u64> {
    let text = std::fs::read_to_string("/proc/meminfo").ok()?;
    let line = text.lines().find(|l| l.starts_with("MemTotal:"))?;
    let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb / 1024)
}

/// Parse the single tabular row a `host stats` response carries.
fn parse_stats_row(tabular: &[Vec<String>]) -> Option<HostStats> {
    let row = tabular.first()?;
    if row.len() != 8 {
        return None;
    }
    Some(HostStats {
        name: row[0].clone(),
        cpus: row[1].parse().ok()?,
        mem_total: row[2].parse().ok()?,
        cpu_commit: row[3].parse().ok()?,
        mem_commit: row[4].parse().ok()?,
        net_commit: row[5].parse().ok()?,
        vm_count: row[6].parse().ok()?,
        limit: row[7].parse().ok()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::MockTools;

    #[tokio::test]
    async fn stats_row_round_trips() {
        let stats = HostStats {
            name: "h7".into(),
            cpus: 16,
            mem_total: 64000,
            cpu_commit: 4,
            mem_commit: 8192,
            net_commit: 3,
            vm_count: 2,
            limit: -1,
        };
        let row = Engine::stats_row(&stats);
        let back = parse_stats_row(&[row]).unwrap();
        assert_eq!(back.name, "h7");
        assert_eq!(back.cpus, 16);
        assert_eq!(back.limit, -1);
    }

    #[tokio::test]
    async fn ksm_saves_and_restores() {
        let dir = tempfile::tempdir().unwrap();
        let tools = Arc::new(MockTools::new());
        let engine = Engine::for_tests(dir.path(), tools);

        let ksm = dir.path().join("ksm");
        std::fs::create_dir_all(&ksm).unwrap();
        std::fs::write(ksm.join("run"), "0\n").unwrap();

        engine.ksm_enable().unwrap();
        assert_eq!(std::fs::read_to_string(ksm.join("run")).unwrap(), "1");
        // A second enable keeps the original saved value.
        engine.ksm_enable().unwrap();
        engine.ksm_restore().unwrap();
        assert_eq!(std::fs::read_to_string(ksm.join("run")).unwrap(), "0");
    }

    #[tokio::test]
    async fn queue_expands_counts_and_names() {
        let dir = tempfile::tempdir().unwrap();
        let tools = Arc::new(MockTools::new());
        let engine = Engine::for_tests(dir.path(), tools);

        assert_eq!(engine.queue_launch("kvm", "3").await.unwrap(), 3);
        assert_eq!(engine.queue_launch("kvm", "alpha,beta").await.unwrap(), 2);
        let ns = engine.namespaces.active().await;
        assert_eq!(ns.queue_len().await, 5);

        let queue = ns.drain_queue().await;
        assert_eq!(queue[0].names, vec!["vm0", "vm1", "vm2"]);
        assert_eq!(queue[1].names, vec!["alpha", "beta"]);
    }

    #[tokio::test]
    async fn empty_queue_launch_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let tools = Arc::new(MockTools::new());
        let engine = Engine::for_tests(dir.path(), tools);
        assert!(engine.launch_queued().await.is_err());
    }

    #[tokio::test]
    async fn unknown_vm_type_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let tools = Arc::new(MockTools::new());
        let engine = Engine::for_tests(dir.path(), tools);
        assert!(engine.queue_launch("xen", "1").await.is_err());
    }
}
