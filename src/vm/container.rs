//! Container launch protocol.
//!
//! The heavy lifting — unsharing namespaces and pivoting into the
//! configured filesystem — belongs to an external namespace-capable
//! runtime; this module realises the network (a named netns plus veth
//! pairs) and supervises the runtime process with the same exit/kill
//! watchers the KVM variant uses.

use std::process::Stdio;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::vm::config::ContainerConfig;
use crate::vm::{kvm, Vm, VmContext, VmRuntime, VmState};
use crate::{Error, Result};

/// Network namespace name for a container VM.
pub fn netns_name(id: u32) -> String {
    format!("vmesh{}", id)
}

pub(super) async fn launch(
    vm: &Arc<Vm>,
    runtime: &mut VmRuntime,
    container: &ContainerConfig,
    ctx: &VmContext,
) -> Result<()> {
    if container.fs_path.is_empty() {
        return Err(Error::Validation("container filesystem not set".into()));
    }
    kvm::write_instance_files(vm).await?;

    let netns = netns_name(vm.id);
    let add_ns = vec![
        "ip".to_string(),
        "netns".to_string(),
        "add".to_string(),
        netns.clone(),
    ];
    match ctx.tools.run(&add_ns).await {
        Ok(_) => {}
        Err(e) if e.is_already_exists() => {}
        Err(e) => return Err(e),
    }

    let mut taps = Vec::new();
    for (index, net) in vm.config.networks.iter().enumerate() {
        let bridge = ctx.bridges.get_or_create(&net.bridge).await?;
        let mac = net.mac.clone().unwrap_or_default();
        let tap = bridge
            .create_container_tap(
                ctx.bridges.namegen(),
                net.tap.clone(),
                net.vlan,
                &netns,
                &mac,
                index as u32,
            )
            .await?;
        taps.push(tap);
    }
    runtime.taps = taps.clone();
    tokio::fs::write(vm.dir.join("taps"), taps.join("\n") + "\n").await?;

    let mut argv: Vec<String> = vec![
        "--fs".to_string(),
        container.fs_path.clone(),
        "--netns".to_string(),
        netns.clone(),
    ];
    if let Some(preinit) = &container.preinit {
        argv.push("--preinit".to_string());
        argv.push(preinit.clone());
    }
    argv.push("--".to_string());
    argv.extend(container.init.iter().cloned());
    debug!(vm = %vm.name, runtime = %container.runtime, args = ?argv, "spawning container");

    let child = tokio::process::Command::new(&container.runtime)
        .args(&argv)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| Error::external(container.runtime.clone(), e.to_string()))?;

    let pid = child
        .id()
        .ok_or_else(|| Error::State("container runtime exited before pid capture".into()))?
        as i32;
    runtime.pid = Some(pid);

    let (exit_tx, exit_rx) = watch::channel(false);
    runtime.exited = Some(exit_rx.clone());
    spawn_exit_waiter(vm.clone(), child, exit_tx, ctx.clone(), netns);

    kvm::spawn_kill_waiter(vm, runtime, pid, exit_rx, ctx);
    Ok(())
}

/// Like the KVM exit-waiter, plus netns teardown once the runtime is gone.
fn spawn_exit_waiter(
    vm: Arc<Vm>,
    child: tokio::process::Child,
    exit_tx: watch::Sender<bool>,
    ctx: VmContext,
    netns: String,
) {
    tokio::spawn(async move {
        let output = child.wait_with_output().await;
        {
            let mut runtime = vm.lock_runtime().await;
            match output {
                Ok(out) if out.status.success() => {
                    if runtime.state != VmState::Error {
                        vm.set_state(&mut runtime, VmState::Quit);
                    }
                }
                Ok(out) => {
                    runtime.error =
                        Some(String::from_utf8_lossy(&out.stderr).trim().to_string());
                    vm.set_state(&mut runtime, VmState::Error);
                }
                Err(e) => {
                    runtime.error = Some(e.to_string());
                    vm.set_state(&mut runtime, VmState::Error);
                }
            }
        }

        let del_ns = vec![
            "ip".to_string(),
            "netns".to_string(),
            "del".to_string(),
            netns.clone(),
        ];
        if let Err(e) = ctx.tools.run(&del_ns).await {
            warn!(netns = %netns, error = %e, "netns teardown failed");
        }
        let _ = exit_tx.send(true);
    });
}
