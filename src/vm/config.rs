//! VM configuration: the platform-agnostic base plus per-variant settings.
//!
//! A config is a value object. It is cloned into QueuedVms batches, dumped
//! into the instance directory at launch, and shipped across the mesh for
//! remote launches, so everything here serializes.

use std::collections::HashSet;
use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::bridge::DEFAULT_BRIDGE;
use crate::Error;

/// Vendor prefixes MACs are sampled from (locally-administered KVM and Xen
/// ranges).
pub const MAC_PREFIXES: [[u8; 3]; 2] = [[0x52, 0x54, 0x00], [0x00, 0x16, 0x3e]];

/// One guest network interface.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetConfig {
    /// Bridge the interface's tap attaches to.
    pub bridge: String,
    /// Vlan tag on the bridge.
    pub vlan: i32,
    /// Guest MAC. Filled from the vendor pool at launch when unset.
    pub mac: Option<String>,
    /// Emulated NIC driver.
    pub driver: String,
    /// Tap name once the interface is realised.
    #[serde(default)]
    pub tap: Option<String>,
}

impl NetConfig {
    pub fn new(vlan: i32) -> Self {
        Self {
            bridge: DEFAULT_BRIDGE.to_string(),
            vlan,
            mac: None,
            driver: "e1000".to_string(),
            tap: None,
        }
    }
}

/// Scheduling hints attached to a launch request.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ScheduleHints {
    /// Pin to this host.
    pub schedule: Option<String>,
    /// Maximum number of peer VMs on the same host; -1 is unbounded, 0
    /// demands a host to itself.
    pub coschedule: i64,
    /// Land on whatever host this named VM lands on.
    pub colocate: Option<String>,
}

impl ScheduleHints {
    pub fn unbounded() -> Self {
        Self {
            coschedule: -1,
            ..Default::default()
        }
    }
}

/// KVM-specific settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KvmConfig {
    /// Emulator binary.
    pub binary: String,
    /// Disk image paths, attached in order.
    pub disks: Vec<String>,
    /// Treat disks as copy-on-write, discarding changes at exit.
    pub snapshot: bool,
    pub kernel: Option<String>,
    pub initrd: Option<String>,
    /// Kernel command line (only meaningful with `kernel`).
    pub append: Option<String>,
    pub cdrom: Option<String>,
    /// Guest CPU model passed straight through.
    pub cpu: Option<String>,
    /// ISA serial port count; sockets appear as `serial<N>`.
    pub serial_ports: u32,
    /// Extra virtio-serial port count; sockets appear as `virtio-serial<N>`.
    pub virtio_ports: u32,
    /// Hugepage mount backing guest memory.
    pub hugepages: Option<String>,
    /// Raw extra arguments appended before `-uuid`.
    pub qemu_append: Vec<String>,
    /// Incoming migration image to restore from.
    pub migrate_path: Option<String>,
    /// Host CPUs to pin the emulator to.
    pub affinity: Option<Vec<usize>>,
}

impl Default for KvmConfig {
    fn default() -> Self {
        Self {
            binary: "qemu-system-x86_64".to_string(),
            disks: Vec::new(),
            snapshot: true,
            kernel: None,
            initrd: None,
            append: None,
            cdrom: None,
            cpu: None,
            serial_ports: 0,
            virtio_ports: 0,
            hugepages: None,
            qemu_append: Vec::new(),
            migrate_path: None,
            affinity: None,
        }
    }
}

/// Container-specific settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContainerConfig {
    /// External namespace-capable runtime binary.
    pub runtime: String,
    /// Root filesystem the runtime pivots into.
    pub fs_path: String,
    /// Hook run inside the namespaces before init.
    pub preinit: Option<String>,
    /// Init program and arguments.
    pub init: Vec<String>,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            runtime: "vmesh-shim".to_string(),
            fs_path: String::new(),
            preinit: None,
            init: vec!["/init".to_string()],
        }
    }
}

/// Per-variant configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase", tag = "type")]
pub enum VmKindConfig {
    Kvm(KvmConfig),
    Container(ContainerConfig),
}

impl VmKindConfig {
    pub fn kind_name(&self) -> &'static str {
        match self {
            VmKindConfig::Kvm(_) => "kvm",
            VmKindConfig::Container(_) => "container",
        }
    }
}

/// The effective configuration a VM is launched with.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VmConfig {
    /// Guest memory in MB.
    pub memory: u64,
    pub vcpus: u32,
    pub networks: Vec<NetConfig>,
    pub hints: ScheduleHints,
    pub kind: VmKindConfig,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            memory: 2048,
            vcpus: 1,
            networks: Vec::new(),
            hints: ScheduleHints::unbounded(),
            kind: VmKindConfig::Kvm(KvmConfig::default()),
        }
    }
}

impl VmConfig {
    /// Disk paths and the snapshot flag, when the variant has disks.
    pub fn disks(&self) -> (&[String], bool) {
        match &self.kind {
            VmKindConfig::Kvm(kvm) => (&kvm.disks, kvm.snapshot),
            VmKindConfig::Container(_) => (&[], true),
        }
    }

    /// Every explicitly-set MAC.
    pub fn macs(&self) -> impl Iterator<Item = &str> {
        self.networks.iter().filter_map(|n| n.mac.as_deref())
    }

    /// Fill unset MACs from the vendor pool, rejecting collisions with
    /// `taken` and with this config's own interfaces.
    pub fn assign_macs(&mut self, taken: &HashSet<String>) {
        let mut used: HashSet<String> = taken.clone();
        used.extend(self.macs().map(str::to_string));

        let mut rng = rand::thread_rng();
        for net in &mut self.networks {
            if net.mac.is_some() {
                continue;
            }
            loop {
                let mac = random_mac(&mut rng);
                if used.insert(mac.clone()) {
                    net.mac = Some(mac);
                    break;
                }
            }
        }
    }
}

impl fmt::Display for VmConfig {
    /// The text dump written to the instance directory's `config` file.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "type:    {}", self.kind.kind_name())?;
        writeln!(f, "memory:  {}", self.memory)?;
        writeln!(f, "vcpus:   {}", self.vcpus)?;
        for net in &self.networks {
            writeln!(
                f,
                "net:     {},{},{},{}",
                net.bridge,
                net.vlan,
                net.mac.as_deref().unwrap_or("auto"),
                net.driver
            )?;
        }
        match &self.kind {
            VmKindConfig::Kvm(kvm) => {
                writeln!(f, "disks:   {}", kvm.disks.join(","))?;
                writeln!(f, "snapshot: {}", kvm.snapshot)?;
            }
            VmKindConfig::Container(c) => {
                writeln!(f, "fs:      {}", c.fs_path)?;
                writeln!(f, "init:    {}", c.init.join(" "))?;
            }
        }
        Ok(())
    }
}

/// Sample one MAC from the vendor-prefix table.
pub fn random_mac<R: Rng>(rng: &mut R) -> String {
    let prefix = MAC_PREFIXES[rng.gen_range(0..MAC_PREFIXES.len())];
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        prefix[0],
        prefix[1],
        prefix[2],
        rng.gen::<u8>(),
        rng.gen::<u8>(),
        rng.gen::<u8>()
    )
}

/// Why two configurations cannot run at the same time, if they cannot.
///
/// Disks may only be shared when every sharer runs in snapshot mode; MACs
/// may never be shared.
pub fn conflict_between(a: &VmConfig, b: &VmConfig) -> Option<Error> {
    let (disks_a, snap_a) = a.disks();
    let (disks_b, snap_b) = b.disks();
    for disk in disks_a {
        if disks_b.contains(disk) && !(snap_a && snap_b) {
            return Some(Error::Conflict(format!(
                "disk {} shared without snapshot",
                disk
            )));
        }
    }

    let macs_a: HashSet<&str> = a.macs().collect();
    for mac in b.macs() {
        if macs_a.contains(mac) {
            return Some(Error::Conflict(format!("duplicate MAC {}", mac)));
        }
    }
    None
}
