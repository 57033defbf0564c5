//! Tap naming and per-tap state.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::qos::QosParams;

/// Vlan sentinel: detached from its bridge but not destroyed.
pub const VLAN_DISCONNECTED: i32 = -1;
/// Vlan sentinel: trunk port carrying all vlans.
pub const VLAN_TRUNK: i32 = -2;

/// A host-side interface attached to a bridge: a tuntap device or one half
/// of a veth pair.
#[derive(Debug, Clone)]
pub struct Tap {
    /// OS interface name, unique across all bridges on the host.
    pub name: String,
    /// Owning bridge.
    pub bridge: String,
    /// Vlan id, or one of the negative sentinels.
    pub vlan: i32,
    /// Brought up in promiscuous mode as a host-visible interface.
    pub host: bool,
    /// True once queued for deferred removal.
    pub defunct: bool,
    /// Installed traffic-shaping state, if any.
    pub qos: Option<QosParams>,
}

impl Tap {
    pub fn new(name: impl Into<String>, bridge: impl Into<String>, vlan: i32, host: bool) -> Self {
        Self {
            name: name.into(),
            bridge: bridge.into(),
            vlan,
            host,
            defunct: false,
            qos: None,
        }
    }
}

/// Monotonic tap-name generator.
///
/// Names are `mega_tap<N>`; N advances for the lifetime of the process and
/// skips names that already exist under `/sys/class/net`, so a name is never
/// handed out twice even across restarts that left stale devices behind.
#[derive(Debug)]
pub struct TapNameGenerator {
    counter: AtomicU64,
    sysfs_net: PathBuf,
}

impl TapNameGenerator {
    pub fn new() -> Self {
        Self::with_sysfs("/sys/class/net")
    }

    /// Use an alternate sysfs root. Tests point this at a tempdir.
    pub fn with_sysfs(root: impl Into<PathBuf>) -> Self {
        Self {
            counter: AtomicU64::new(0),
            sysfs_net: root.into(),
        }
    }

    /// Next unused tap name.
    pub fn next(&self) -> String {
        loop {
            let n = self.counter.fetch_add(1, Ordering::SeqCst);
            let name = format!("mega_tap{}", n);
            if !self.sysfs_net.join(&name).exists() {
                return name;
            }
        }
    }
}

impl Default for TapNameGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generator_is_monotonic() {
        let dir = tempfile::tempdir().unwrap();
        let generator = TapNameGenerator::with_sysfs(dir.path());
        assert_eq!(generator.next(), "mega_tap0");
        assert_eq!(generator.next(), "mega_tap1");
        assert_eq!(generator.next(), "mega_tap2");
    }

    #[test]
    fn generator_skips_taken_names() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("mega_tap0")).unwrap();
        std::fs::create_dir(dir.path().join("mega_tap1")).unwrap();
        let generator = TapNameGenerator::with_sysfs(dir.path());
        assert_eq!(generator.next(), "mega_tap2");
    }
}
