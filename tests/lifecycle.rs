//! VM lifecycle scenarios against a mock network plane.
//!
//! The emulator binary is bogus on purpose: a failed spawn drives the
//! Building → Error path, and flush/relaunch exercise tap bookkeeping
//! without touching a real switch.

use std::sync::Arc;

use vmesh::engine::Engine;
use vmesh::process::MockTools;
use vmesh::vm::{KvmConfig, NetConfig, VmKindConfig, VmState};

fn bogus_kvm_config() -> vmesh::vm::VmConfig {
    let mut config = vmesh::vm::VmConfig {
        kind: VmKindConfig::Kvm(KvmConfig {
            binary: "/nonexistent/emulator".to_string(),
            disks: vec!["a.qc2".to_string()],
            snapshot: true,
            ..Default::default()
        }),
        memory: 512,
        vcpus: 1,
        ..Default::default()
    };
    config.networks.push(NetConfig::new(100));
    config
}

#[tokio::test]
async fn failed_spawn_lands_in_error_with_taps_released_by_flush() {
    let dir = tempfile::tempdir().unwrap();
    let tools = Arc::new(MockTools::new());
    let engine = Engine::for_tests(dir.path(), tools.clone());
    engine.start(false).await.unwrap();

    let ns = engine.namespaces.active().await;
    let ctx = engine.vm_context(&ns);
    let vm = ns.registry.create("t1", bogus_kvm_config()).await.unwrap();

    assert!(vm.launch(&ctx).await.is_err());
    assert_eq!(vm.state().await, VmState::Error);
    assert!(vm.error_detail().await.is_some());

    // The instance dir was created with its metadata files before the
    // spawn failed.
    assert!(vm.dir.join("config").exists());
    assert!(vm.dir.join("name").exists());
    let taps = std::fs::read_to_string(vm.dir.join("taps")).unwrap();
    assert_eq!(taps.trim(), "mega_tap0");

    // The MAC was auto-assigned from the vendor pool.
    let mac = vm.config.networks[0].mac.clone().unwrap();
    assert!(mac.starts_with("52:54:00") || mac.starts_with("00:16:3e"));

    // Flush removes the terminal VM and queues its tap for the reaper.
    assert_eq!(ns.registry.flush(&ctx).await.unwrap(), 1);
    assert!(ns.registry.get("t1").await.is_err());

    engine.bridges.reap_all().await;
    let batches: Vec<String> = tools
        .calls_for("ovs-vsctl")
        .iter()
        .map(|c| c.join(" "))
        .filter(|c| c.contains("del-port"))
        .collect();
    assert_eq!(batches.len(), 1);
    assert!(batches[0].contains("mega_tap0"));
}

#[tokio::test]
async fn relaunch_rebuilds_the_kill_channel_and_taps() {
    let dir = tempfile::tempdir().unwrap();
    let tools = Arc::new(MockTools::new());
    let engine = Engine::for_tests(dir.path(), tools.clone());
    engine.start(false).await.unwrap();

    let ns = engine.namespaces.active().await;
    let ctx = engine.vm_context(&ns);
    let vm = ns.registry.create("t2", bogus_kvm_config()).await.unwrap();

    assert!(vm.launch(&ctx).await.is_err());
    assert_eq!(vm.state().await, VmState::Error);

    // start() on a terminal VM relaunches: same failure, but a fresh tap
    // was allocated (names are never reused).
    assert!(vm.start(&ctx).await.is_err());
    assert_eq!(vm.state().await, VmState::Error);

    let taps = std::fs::read_to_string(vm.dir.join("taps")).unwrap();
    assert_eq!(taps.trim(), "mega_tap1");
}

#[tokio::test]
async fn state_file_tracks_transitions() {
    let dir = tempfile::tempdir().unwrap();
    let tools = Arc::new(MockTools::new());
    let engine = Engine::for_tests(dir.path(), tools);
    engine.start(false).await.unwrap();

    let ns = engine.namespaces.active().await;
    let ctx = engine.vm_context(&ns);
    let vm = ns.registry.create("t3", bogus_kvm_config()).await.unwrap();
    let _ = vm.launch(&ctx).await;

    let state = std::fs::read_to_string(vm.dir.join("state")).unwrap();
    assert_eq!(state.trim(), "ERROR");
}

#[tokio::test]
async fn info_rows_surface_tags_and_vlans() {
    let dir = tempfile::tempdir().unwrap();
    let tools = Arc::new(MockTools::new());
    let engine = Engine::for_tests(dir.path(), tools);
    engine.start(false).await.unwrap();

    let ns = engine.namespaces.active().await;
    let vm = ns.registry.create("tagged", bogus_kvm_config()).await.unwrap();
    vm.set_tag("rack", "r2");

    let row = vm.info_row().await;
    let header = vmesh::vm::Vm::info_header();
    assert_eq!(row.len(), header.len());
    assert_eq!(row[1], "tagged");
    assert_eq!(row[2], "BUILDING");
    assert_eq!(row[7], "100");
    assert!(row[9].contains("rack=r2"));
}
