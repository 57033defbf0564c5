//! KVM launch protocol.
//!
//! Launch runs entirely under the per-VM lock: instance directory, tap
//! realisation, argv composition, process spawn, control-socket dial. Two
//! watchers outlive the call — the exit-waiter owning the child process and
//! the kill-waiter bridging the kill channel to SIGKILL — plus one
//! learner consumer per interface and one async-event drainer.

use std::net::IpAddr;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UnixStream;
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

use crate::bridge::NetUpdate;
use crate::vm::config::KvmConfig;
use crate::vm::qemu_args::{self, apply_overrides};
use crate::vm::{LearnedAddrs, Vm, VmContext, VmRuntime, VmState};
use crate::qmp::QmpClient;
use crate::{Error, Result};

/// Control-socket dial policy.
const QMP_RETRIES: u32 = 20;
const QMP_DELAY: Duration = Duration::from_millis(250);

/// How many trailing stderr lines survive into the error detail.
const STDERR_TAIL: usize = 20;

pub(super) async fn launch(
    vm: &Arc<Vm>,
    runtime: &mut VmRuntime,
    kvm: &KvmConfig,
    ctx: &VmContext,
) -> Result<()> {
    write_instance_files(vm).await?;

    // Realise every interface and hook its learner consumer.
    let mut taps = Vec::new();
    for (index, net) in vm.config.networks.iter().enumerate() {
        let bridge = ctx.bridges.get_or_create(&net.bridge).await?;
        let tap = bridge
            .create_tap(ctx.bridges.namegen(), net.tap.clone(), net.vlan, false)
            .await?;
        if let Some(updates) = bridge.updates().await {
            spawn_addr_consumer(vm, runtime, net.mac.clone().unwrap_or_default(), index, updates);
        }
        taps.push(tap);
    }
    runtime.taps = taps.clone();
    let tap_lines = taps.join("\n") + "\n";
    tokio::fs::write(vm.dir.join("taps"), tap_lines).await?;

    // Compose the argument vector and let user overrides rewrite it.
    let args = qemu_args::build(&vm.config, kvm, vm.id, &vm.uuid, &vm.dir, &taps);
    let args = apply_overrides(args, &ctx.overrides)?;
    debug!(vm = %vm.name, argv = %args.join(" "), "spawning emulator");

    let child = tokio::process::Command::new(&kvm.binary)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| Error::external(kvm.binary.clone(), e.to_string()))?;

    let pid = child
        .id()
        .ok_or_else(|| Error::State("emulator exited before pid capture".into()))? as i32;
    runtime.pid = Some(pid);

    if let Some(cpus) = &kvm.affinity {
        let list: Vec<String> = cpus.iter().map(|c| c.to_string()).collect();
        let argv = vec![
            "taskset".to_string(),
            "-a".to_string(),
            "-p".to_string(),
            "-c".to_string(),
            list.join(","),
            pid.to_string(),
        ];
        if let Err(e) = ctx.tools.run(&argv).await {
            warn!(vm = %vm.name, error = %e, "cpu pinning failed");
        }
    }

    let (exit_tx, exit_rx) = watch::channel(false);
    runtime.exited = Some(exit_rx.clone());
    spawn_exit_waiter(vm.clone(), child, exit_tx);

    // Dial QMP; a dead socket means a dead or wedged emulator.
    let qmp = match QmpClient::connect(&vm.dir.join("qmp"), QMP_RETRIES, QMP_DELAY).await {
        Ok(client) => Arc::new(client),
        Err(e) => {
            let _ = super::signal(pid, libc::SIGKILL);
            return Err(e);
        }
    };

    if let Some(mut events) = qmp.take_events().await {
        let name = vm.name.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                debug!(vm = %name, event = %event, "emulator event");
            }
        });
    }
    runtime.qmp = Some(qmp);

    // The in-guest agent socket is best-effort.
    match UnixStream::connect(vm.dir.join("cc")).await {
        Ok(_) => runtime.cc_connected = true,
        Err(e) => warn!(vm = %vm.name, error = %e, "cc socket dial failed"),
    }

    spawn_kill_waiter(vm, runtime, pid, exit_rx, ctx);
    Ok(())
}

pub(super) async fn write_instance_files(vm: &Vm) -> Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(&vm.dir)?;

    tokio::fs::write(vm.dir.join("config"), vm.config.to_string()).await?;
    tokio::fs::write(vm.dir.join("name"), format!("{}\n", vm.name)).await?;
    Ok(())
}

/// Consume learner updates for one interface until the kill channel fires.
/// A closed learner channel ends the task silently.
fn spawn_addr_consumer(
    vm: &Arc<Vm>,
    runtime: &VmRuntime,
    mac: String,
    index: usize,
    mut updates: broadcast::Receiver<NetUpdate>,
) {
    let mac = mac.to_lowercase();
    let addrs = vm.addrs_handle();
    let mut kill = runtime.kill.subscribe();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                fired = kill.wait_for(|k| *k) => {
                    let _ = fired;
                    return;
                }
                update = updates.recv() => match update {
                    Ok(update) if update.mac == mac => {
                        record_addr(&addrs, index, update.ip);
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return,
                },
            }
        }
    });
}

fn record_addr(addrs: &std::sync::Mutex<Vec<LearnedAddrs>>, index: usize, ip: IpAddr) {
    let mut addrs = addrs.lock().unwrap();
    let Some(slot) = addrs.get_mut(index) else {
        return;
    };
    match ip {
        IpAddr::V4(ip) => slot.v4 = Some(ip),
        IpAddr::V6(ip) => {
            let link_local = (ip.segments()[0] & 0xffc0) == 0xfe80;
            let have_global =
                slot.v6.is_some_and(|cur| (cur.segments()[0] & 0xffc0) != 0xfe80);
            if !(link_local && have_global) {
                slot.v6 = Some(ip);
            }
        }
    }
}

/// Owns the child process; records the outcome and closes the exited
/// channel. A clean exit lands in Quit unless something already marked the
/// VM errored; anything else preserves the stderr tail and lands in Error.
fn spawn_exit_waiter(vm: Arc<Vm>, child: tokio::process::Child, exit_tx: watch::Sender<bool>) {
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
                    let stderr = String::from_utf8_lossy(&out.stderr);
                    let mut tail: Vec<&str> = stderr.lines().rev().take(STDERR_TAIL).collect();
                    tail.reverse();
                    runtime.error = Some(tail.join("\n"));
                    vm.set_state(&mut runtime, VmState::Error);
                }
                Err(e) => {
                    runtime.error = Some(e.to_string());
                    vm.set_state(&mut runtime, VmState::Error);
                }
            }
        }
        let _ = exit_tx.send(true);
    });
}

/// Bridges the kill channel to SIGKILL, then acks once the exit-waiter has
/// seen the process go. A kill channel dropped without firing (relaunch)
/// ends the task without an ack.
pub(super) fn spawn_kill_waiter(
    vm: &Arc<Vm>,
    runtime: &VmRuntime,
    pid: i32,
    mut exited: watch::Receiver<bool>,
    ctx: &VmContext,
) {
    let mut kill = runtime.kill.subscribe();
    let ack = ctx.ack_tx.clone();
    let id = vm.id;
    let name = vm.name.clone();

    tokio::spawn(async move {
        if kill.wait_for(|k| *k).await.is_err() {
            return;
        }
        debug!(vm = %name, pid, "kill fired, delivering SIGKILL");
        let _ = super::signal(pid, libc::SIGKILL);
        let _ = exited.wait_for(|e| *e).await;
        let _ = ack.send(id);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn addr_recording_prefers_global_v6() {
        let addrs = std::sync::Mutex::new(vec![LearnedAddrs::default()]);

        record_addr(&addrs, 0, "10.0.0.5".parse().unwrap());
        assert_eq!(addrs.lock().unwrap()[0].v4, Some(Ipv4Addr::new(10, 0, 0, 5)));

        // Link-local lands while nothing better is known.
        record_addr(&addrs, 0, "fe80::1".parse().unwrap());
        assert_eq!(
            addrs.lock().unwrap()[0].v6,
            Some("fe80::1".parse::<Ipv6Addr>().unwrap())
        );

        // A global address replaces it.
        record_addr(&addrs, 0, "2001:db8::7".parse().unwrap());
        assert_eq!(
            addrs.lock().unwrap()[0].v6,
            Some("2001:db8::7".parse::<Ipv6Addr>().unwrap())
        );

        // Later link-local updates no longer overwrite the global one.
        record_addr(&addrs, 0, "fe80::2".parse().unwrap());
        assert_eq!(
            addrs.lock().unwrap()[0].v6,
            Some("2001:db8::7".parse::<Ipv6Addr>().unwrap())
        );
    }

    #[test]
    fn out_of_range_interface_is_ignored() {
        let addrs = std::sync::Mutex::new(vec![LearnedAddrs::default()]);
        record_addr(&addrs, 5, "10.0.0.5".parse().unwrap());
        assert!(addrs.lock().unwrap()[0].v4.is_none());
    }
}
