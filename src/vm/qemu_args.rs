//! Emulator argument-vector composition.
//!
//! The vector is wire-exact: a migration target rebuilds the same machine
//! from the same config, so ordering and device addressing must not drift
//! between releases. Guest PCI devices hang off `pci-bridge` devices with
//! 32 slots each (address 0 reserved); virtio-serial ports pack 30 to a
//! `virtio-serial-pci` device.

use std::path::Path;

use regex::Regex;

use crate::vm::config::{KvmConfig, VmConfig};
use crate::{Error, Result};

/// Slots per PCI bridge, address 0 reserved.
const PCI_SLOTS: usize = 32;
/// Ports per virtio-serial-pci device.
const VIRTIO_PORTS_PER_DEVICE: u32 = 30;

/// Allocates (bus, addr) pairs across numbered PCI bridges.
///
/// Addresses start at 1 on bus `pci.1`; bus 0 belongs to the machine's
/// builtin devices.
#[derive(Debug)]
pub struct PciAllocator {
    bus: usize,
    addr: usize,
}

impl PciAllocator {
    pub fn new() -> Self {
        Self { bus: 1, addr: 1 }
    }

    /// Next free (bus, addr).
    pub fn next(&mut self) -> (usize, usize) {
        if self.addr >= PCI_SLOTS {
            self.bus += 1;
            self.addr = 1;
        }
        let slot = (self.bus, self.addr);
        self.addr += 1;
        slot
    }

    /// Number of bridges a device count requires.
    pub fn bridges_for(devices: usize) -> usize {
        devices.div_ceil(PCI_SLOTS - 1)
    }
}

impl Default for PciAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// A user-supplied rewrite applied to the composed vector.
#[derive(Debug, Clone)]
pub struct QemuOverride {
    pub pattern: String,
    pub replacement: String,
}

/// Apply overrides to the joined argument string, then re-split.
pub fn apply_overrides(args: Vec<String>, overrides: &[QemuOverride]) -> Result<Vec<String>> {
    if overrides.is_empty() {
        return Ok(args);
    }
    let mut joined = args.join(" ");
    for ov in overrides {
        let re = Regex::new(&ov.pattern)
            .map_err(|e| Error::Validation(format!("bad override pattern: {}", e)))?;
        joined = re.replace_all(&joined, ov.replacement.as_str()).into_owned();
    }
    Ok(joined.split_whitespace().map(String::from).collect())
}

/// Compose the full emulator argument vector for one VM.
///
/// `taps` must be parallel to `config.networks`, already realised on their
/// bridges; every network interface must have a MAC by this point.
pub fn build(
    config: &VmConfig,
    kvm: &KvmConfig,
    id: u32,
    uuid: &str,
    dir: &Path,
    taps: &[String],
) -> Vec<String> {
    let dir = dir.display();
    let mut args: Vec<String> = Vec::new();
    let mut push = |parts: &[&str]| args.extend(parts.iter().map(|s| s.to_string()));

    push(&["-enable-kvm"]);
    push(&["-name", &id.to_string()]);
    push(&["-m", &config.memory.to_string()]);
    push(&["-nographic"]);
    push(&["-balloon", "none"]);
    push(&["-vnc", &format!("unix:{}/vnc", dir)]);
    push(&["-usbdevice", "tablet"]);
    push(&["-smp", &config.vcpus.to_string()]);
    push(&["-qmp", &format!("unix:{}/qmp,server", dir)]);
    push(&["-vga", "cirrus"]);
    push(&["-rtc", "clock=vm,base=utc"]);

    // The builtin virtio-serial bus carries only the in-guest agent port.
    push(&["-device", "virtio-serial"]);
    push(&[
        "-chardev",
        &format!("socket,id=charcc,path={}/cc,server,nowait", dir),
    ]);
    push(&[
        "-device",
        "virtserialport,bus=virtio-serial0.0,chardev=charcc,id=charcc,name=cc",
    ]);

    push(&["-pidfile", &format!("{}/qemu.pid", dir)]);
    push(&["-k", "en-us"]);
    if let Some(cpu) = &kvm.cpu {
        push(&["-cpu", cpu.as_str()]);
    }
    push(&["-net", "none"]);
    push(&["-S"]);

    if let Some(path) = &kvm.migrate_path {
        push(&["-incoming", &format!("exec:cat {}", path)]);
    }

    for disk in &kvm.disks {
        push(&["-drive", &format!("file={},media=disk", disk)]);
    }
    if kvm.snapshot {
        push(&["-snapshot"]);
    }

    if let Some(kernel) = &kvm.kernel {
        push(&["-kernel", kernel.as_str()]);
    }
    if let Some(initrd) = &kvm.initrd {
        push(&["-initrd", initrd.as_str()]);
    }
    if let Some(append) = &kvm.append {
        push(&["-append", append.as_str()]);
    }

    if let Some(cdrom) = &kvm.cdrom {
        push(&[
            "-drive",
            &format!("file={},if=ide,index=1,media=cdrom", cdrom),
        ]);
        push(&["-boot", "once=d"]);
    }

    let virtio_devices = kvm.virtio_ports.div_ceil(VIRTIO_PORTS_PER_DEVICE) as usize;
    let pci_devices = taps.len() + virtio_devices;
    for n in 1..=PciAllocator::bridges_for(pci_devices) {
        push(&[
            "-device",
            &format!("pci-bridge,id=pci.{},chassis_nr={}", n, n),
        ]);
    }

    let mut pci = PciAllocator::new();
    for (net, tap) in config.networks.iter().zip(taps) {
        let (bus, addr) = pci.next();
        push(&[
            "-netdev",
            &format!("tap,id={},script=no,ifname={}", tap, tap),
        ]);
        push(&[
            "-device",
            &format!(
                "driver={},netdev={},mac={},bus=pci.{},addr=0x{:x}",
                net.driver,
                tap,
                net.mac.as_deref().unwrap_or_default(),
                bus,
                addr
            ),
        ]);
    }

    for slot in 0..virtio_devices {
        let (bus, addr) = pci.next();
        // Slot 0 is the builtin agent bus; pci-attached buses start at 1.
        push(&[
            "-device",
            &format!(
                "virtio-serial-pci,id=virtio-serial{},bus=pci.{},addr=0x{:x}",
                slot + 1,
                bus,
                addr
            ),
        ]);
    }
    for i in 0..kvm.virtio_ports {
        let slot = i / VIRTIO_PORTS_PER_DEVICE + 1;
        let nr = i % VIRTIO_PORTS_PER_DEVICE + 1;
        push(&[
            "-chardev",
            &format!(
                "socket,id=charvserial{},path={}/virtio-serial{},server,nowait",
                i, dir, i
            ),
        ]);
        push(&[
            "-device",
            &format!(
                "virtserialport,nr={},bus=virtio-serial{}.0,chardev=charvserial{},id=charvserial{},name=virtio-serial{}",
                nr, slot, i, i, i
            ),
        ]);
    }

    for i in 0..kvm.serial_ports {
        push(&[
            "-chardev",
            &format!("socket,id=charserial{},path={}/serial{},server,nowait", i, dir, i),
        ]);
        push(&["-device", &format!("isa-serial,chardev=charserial{}", i)]);
    }

    if let Some(hugepages) = &kvm.hugepages {
        push(&["-mem-path", hugepages.as_str()]);
    }

    for extra in &kvm.qemu_append {
        push(&[extra.as_str()]);
    }

    push(&["-uuid", uuid]);
    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::config::{NetConfig, VmKindConfig};
    use std::path::PathBuf;

    fn base_config() -> (VmConfig, KvmConfig) {
        let kvm = KvmConfig {
            disks: vec!["a.qc2".to_string()],
            snapshot: true,
            ..Default::default()
        };
        let config = VmConfig {
            memory: 512,
            vcpus: 1,
            kind: VmKindConfig::Kvm(kvm.clone()),
            ..Default::default()
        };
        (config, kvm)
    }

    #[test]
    fn minimal_vector_is_wire_exact() {
        let (config, kvm) = base_config();
        let dir = PathBuf::from("/tmp/vm0");
        let args = build(&config, &kvm, 0, "uuid-0", &dir, &[]);

        let expected = "-enable-kvm -name 0 -m 512 -nographic -balloon none \
-vnc unix:/tmp/vm0/vnc -usbdevice tablet -smp 1 -qmp unix:/tmp/vm0/qmp,server \
-vga cirrus -rtc clock=vm,base=utc -device virtio-serial \
-chardev socket,id=charcc,path=/tmp/vm0/cc,server,nowait \
-device virtserialport,bus=virtio-serial0.0,chardev=charcc,id=charcc,name=cc \
-pidfile /tmp/vm0/qemu.pid -k en-us -net none -S \
-drive file=a.qc2,media=disk -snapshot -uuid uuid-0";
        assert_eq!(args.join(" "), expected);
    }

    #[test]
    fn network_devices_get_bridge_slots() {
        let (mut config, kvm) = base_config();
        config.networks = vec![
            NetConfig {
                mac: Some("52:54:00:00:00:01".into()),
                ..NetConfig::new(100)
            },
            NetConfig {
                mac: Some("52:54:00:00:00:02".into()),
                ..NetConfig::new(100)
            },
        ];
        let taps = vec!["mega_tap0".to_string(), "mega_tap1".to_string()];
        let args = build(&config, &kvm, 3, "u", Path::new("/i"), &taps);
        let joined = args.join(" ");

        assert!(joined.contains("pci-bridge,id=pci.1,chassis_nr=1"));
        assert!(joined.contains("tap,id=mega_tap0,script=no,ifname=mega_tap0"));
        assert!(joined.contains(
            "driver=e1000,netdev=mega_tap0,mac=52:54:00:00:00:01,bus=pci.1,addr=0x1"
        ));
        assert!(joined.contains(
            "driver=e1000,netdev=mega_tap1,mac=52:54:00:00:00:02,bus=pci.1,addr=0x2"
        ));
    }

    #[test]
    fn pci_addresses_wrap_after_31_slots() {
        let mut pci = PciAllocator::new();
        let mut last = (0, 0);
        for _ in 0..31 {
            last = pci.next();
        }
        assert_eq!(last, (1, 31));
        assert_eq!(pci.next(), (2, 1));
        assert_eq!(PciAllocator::bridges_for(31), 1);
        assert_eq!(PciAllocator::bridges_for(32), 2);
    }

    #[test]
    fn virtio_ports_pack_thirty_per_device() {
        let (mut config, mut kvm) = base_config();
        kvm.virtio_ports = 31;
        config.kind = VmKindConfig::Kvm(kvm.clone());
        let args = build(&config, &kvm, 0, "u", Path::new("/i"), &[]);
        let joined = args.join(" ");

        assert!(joined.contains("virtio-serial-pci,id=virtio-serial1,bus=pci.1,addr=0x1"));
        assert!(joined.contains("virtio-serial-pci,id=virtio-serial2,bus=pci.1,addr=0x2"));
        // Port 0 on the first pci device, port 30 spills onto the second.
        assert!(joined.contains("virtserialport,nr=1,bus=virtio-serial1.0,chardev=charvserial0"));
        assert!(joined.contains("virtserialport,nr=1,bus=virtio-serial2.0,chardev=charvserial30"));
    }

    #[test]
    fn overrides_rewrite_the_joined_vector() {
        let args = vec!["-vga".to_string(), "cirrus".to_string()];
        let overrides = vec![QemuOverride {
            pattern: "-vga cirrus".into(),
            replacement: "-vga std".into(),
        }];
        let rewritten = apply_overrides(args, &overrides).unwrap();
        assert_eq!(rewritten, vec!["-vga", "std"]);

        assert!(apply_overrides(vec![], &[QemuOverride {
            pattern: "(".into(),
            replacement: "".into(),
        }])
        .is_err());
    }

    #[test]
    fn migrate_source_gets_incoming_exec() {
        let (config, mut kvm) = base_config();
        kvm.migrate_path = Some("/tmp/save.img".into());
        let args = build(&config, &kvm, 0, "u", Path::new("/i"), &[]);
        let joined = args.join(" ");
        assert!(joined.contains("-incoming exec:cat /tmp/save.img"));
        // -incoming sits between -S and the drives.
        let s = joined.find(" -S ").unwrap();
        let inc = joined.find("-incoming").unwrap();
        let drive = joined.find("-drive").unwrap();
        assert!(s < inc && inc < drive);
    }
}
