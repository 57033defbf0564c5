//! Command routing.
//!
//! [`dispatch`] turns one compiled command into a stream of response
//! batches: local commands produce a single batch, namespace-spanning
//! commands fan out over the mesh with the local answer appended, and
//! `mesh send` streams whatever the remote side produces. Every handler
//! writes into a [`WireResponse`]; errors become the response's error
//! string at this boundary.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::debug;

use vmesh_protocol::{WireCommand, WireResponse};

use crate::bridge::TunnelKind;
use crate::command::{self, args, check_nesting};
use crate::engine::Engine;
use crate::qos;
use crate::vm::{NetConfig, Vm, VmKindConfig};
use crate::{disk, Error, Result};

/// Commands that fan out to every host in the active namespace.
fn broadcasts(path: &[String]) -> bool {
    matches!(
        path.iter().map(String::as_str).collect::<Vec<_>>()[..],
        ["vm", "info"]
            | ["vm", "start"]
            | ["vm", "stop"]
            | ["vm", "kill"]
            | ["vm", "flush"]
            | ["host", "stats"]
            | ["qos", "list"]
    )
}

/// Route one command, returning the streaming response channel.
pub fn dispatch(
    engine: &Arc<Engine>,
    cmd: WireCommand,
) -> mpsc::UnboundedReceiver<Vec<WireResponse>> {
    let (tx, rx) = mpsc::unbounded_channel();
    let engine = engine.clone();

    tokio::spawn(async move {
        if cmd.path == ["mesh", "send"] {
            match mesh_send_stream(&engine, &cmd).await {
                Ok(mut batches) => {
                    while let Some(batch) = batches.recv().await {
                        let _ = tx.send(batch);
                    }
                }
                Err(e) => {
                    let _ = tx.send(vec![WireResponse::error(
                        engine.config.hostname.clone(),
                        e.to_string(),
                    )]);
                }
            }
            return;
        }

        if broadcasts(&cmd.path) {
            let ns = engine.namespaces.active().await;
            let mut remote: Vec<String> = ns.hosts().await;
            remote.retain(|h| *h != engine.config.hostname);
            if !remote.is_empty() {
                let mut batches =
                    engine
                        .mesh
                        .send(remote, cmd.clone(), engine.config.send_timeout);
                while let Some(batch) = batches.recv().await {
                    let _ = tx.send(batch);
                }
            }
        }

        let response = handle_command(&engine, &cmd).await;
        let _ = tx.send(vec![response]);
    });

    rx
}

/// Resolve `mesh send` recipients and return the raw mesh batch stream.
async fn mesh_send_stream(
    engine: &Arc<Engine>,
    cmd: &WireCommand,
) -> Result<mpsc::UnboundedReceiver<Vec<WireResponse>>> {
    let recipients_arg = cmd
        .string_args
        .get("recipients")
        .ok_or_else(|| Error::Validation("mesh send needs recipients".into()))?;
    let nested_text = cmd
        .string_args
        .get("command")
        .ok_or_else(|| Error::Validation("mesh send needs a command".into()))?;

    check_nesting(nested_text)?;
    let nested = command::compile(nested_text)?;

    let recipients = resolve_recipients(engine, recipients_arg).await;
    Ok(engine
        .mesh
        .send(recipients, nested, engine.config.send_timeout))
}

/// A wildcard resolves against the active namespace, falling back to the
/// whole known mesh; the local host is excluded either way.
async fn resolve_recipients(engine: &Arc<Engine>, arg: &str) -> Vec<String> {
    let mut hosts = if arg == "all" || arg == "*" {
        let ns = engine.namespaces.active().await;
        let ns_hosts = ns.hosts().await;
        if ns_hosts.is_empty() {
            engine.mesh.broadcast_recipients().await
        } else {
            ns_hosts
        }
    } else {
        arg.split(',').filter(|s| !s.is_empty()).map(String::from).collect()
    };
    hosts.retain(|h| *h != engine.config.hostname);
    hosts
}

/// Execute one command locally and shape the outcome into a response.
pub fn handle_command<'a>(
    engine: &'a Arc<Engine>,
    cmd: &'a WireCommand,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = WireResponse> + Send + 'a>> {
    Box::pin(async move {
        debug!(command = %cmd.original, "handling");
        let host = engine.config.hostname.clone();
        match handle(engine, cmd).await {
            Ok(mut response) => {
                response.host = host;
                response
            }
            Err(e) => WireResponse::error(host, e.to_string()),
        }
    })
}

fn text(body: impl Into<String>) -> WireResponse {
    WireResponse {
        response: body.into(),
        ..Default::default()
    }
}

fn table(header: Vec<String>, tabular: Vec<Vec<String>>) -> WireResponse {
    WireResponse {
        header,
        tabular,
        ..Default::default()
    }
}

fn arg<'a>(cmd: &'a WireCommand, index: usize) -> Result<&'a str> {
    args(cmd)
        .get(index)
        .map(String::as_str)
        .ok_or_else(|| Error::Validation(format!("{}: missing argument", cmd.original)))
}

async fn handle(engine: &Arc<Engine>, cmd: &WireCommand) -> Result<WireResponse> {
    let path: Vec<&str> = cmd.path.iter().map(String::as_str).collect();
    match path[..] {
        // ── vm config ─────────────────────────────────────────────
        ["vm", "config"] => {
            let current = engine.current.lock().await;
            Ok(text(current.to_string()))
        }
        ["vm", "config", "clear"] => {
            *engine.current.lock().await = Default::default();
            *engine.current_container.lock().await = Default::default();
            Ok(text(""))
        }
        ["vm", "config", "memory"] => {
            let mb: u64 = parse_num(cmd, 0)?;
            engine.current.lock().await.memory = mb;
            Ok(text(""))
        }
        ["vm", "config", "vcpus"] => {
            let vcpus: u32 = parse_num(cmd, 0)?;
            engine.current.lock().await.vcpus = vcpus;
            Ok(text(""))
        }
        ["vm", "config", "disk"] => {
            let disks: Vec<String> = arg(cmd, 0)?.split(',').map(String::from).collect();
            with_kvm(engine, |kvm| kvm.disks = disks).await
        }
        ["vm", "config", "snapshot"] => {
            let snapshot = parse_bool(arg(cmd, 0)?)?;
            with_kvm(engine, |kvm| kvm.snapshot = snapshot).await
        }
        ["vm", "config", "kernel"] => {
            let path = arg(cmd, 0)?.to_string();
            with_kvm(engine, |kvm| kvm.kernel = Some(path)).await
        }
        ["vm", "config", "initrd"] => {
            let path = arg(cmd, 0)?.to_string();
            with_kvm(engine, |kvm| kvm.initrd = Some(path)).await
        }
        ["vm", "config", "append"] => {
            let value = args(cmd).join(" ");
            with_kvm(engine, |kvm| kvm.append = Some(value)).await
        }
        ["vm", "config", "cdrom"] => {
            let path = arg(cmd, 0)?.to_string();
            with_kvm(engine, |kvm| kvm.cdrom = Some(path)).await
        }
        ["vm", "config", "net"] => {
            let mut networks = Vec::new();
            for spec in args(cmd) {
                networks.push(parse_net(spec)?);
            }
            engine.current.lock().await.networks = networks;
            Ok(text(""))
        }
        ["vm", "config", "filesystem"] => {
            engine.current_container.lock().await.fs_path = arg(cmd, 0)?.to_string();
            Ok(text(""))
        }
        ["vm", "config", "init"] => {
            engine.current_container.lock().await.init =
                args(cmd).iter().cloned().collect();
            Ok(text(""))
        }
        ["vm", "config", "schedule"] => {
            engine.current.lock().await.hints.schedule = Some(arg(cmd, 0)?.to_string());
            Ok(text(""))
        }
        ["vm", "config", "coschedule"] => {
            let limit: i64 = parse_num(cmd, 0)?;
            engine.current.lock().await.hints.coschedule = limit;
            Ok(text(""))
        }
        ["vm", "config", "colocate"] => {
            engine.current.lock().await.hints.colocate = Some(arg(cmd, 0)?.to_string());
            Ok(text(""))
        }

        // ── vm lifecycle ──────────────────────────────────────────
        ["vm", "launch", kind @ ("kvm" | "container")] => {
            let queued = engine.queue_launch(kind, arg(cmd, 0)?).await?;
            Ok(text(format!("queued {}", queued)))
        }
        ["vm", "launch"] => {
            let launched = engine.launch_queued().await?;
            Ok(text(format!("launched {}", launched)))
        }
        ["vm", "start"] => vm_apply(engine, arg(cmd, 0)?, VmOp::Start).await,
        ["vm", "stop"] => vm_apply(engine, arg(cmd, 0)?, VmOp::Stop).await,
        ["vm", "kill"] => vm_apply(engine, arg(cmd, 0)?, VmOp::Kill).await,
        ["vm", "flush"] => {
            let ns = engine.namespaces.active().await;
            let ctx = engine.vm_context(&ns);
            let flushed = ns.registry.flush(&ctx).await?;
            Ok(text(format!("flushed {}", flushed)))
        }
        ["vm", "info"] => {
            let ns = engine.namespaces.active().await;
            let mut rows = Vec::new();
            for vm in ns.registry.list().await {
                rows.push(vm.info_row().await);
            }
            Ok(table(Vm::info_header(), rows))
        }
        ["vm", "screenshot"] => {
            let ns = engine.namespaces.active().await;
            let vm = ns.registry.resolve(arg(cmd, 0)?).await?;
            let max_dim = match args(cmd).get(1) {
                Some(raw) => raw
                    .parse()
                    .map_err(|_| Error::Validation(format!("bad size: {}", raw)))?,
                None => 0,
            };
            let png = vm.screenshot(max_dim).await?;
            let path = vm.dir.join("screenshot.png");
            tokio::fs::write(&path, &png).await?;
            Ok(text(path.display().to_string()))
        }
        ["vm", "tag"] => {
            let ns = engine.namespaces.active().await;
            let vm = ns.registry.resolve(arg(cmd, 0)?).await?;
            let key = arg(cmd, 1)?;
            match args(cmd).get(2) {
                Some(value) => {
                    vm.set_tag(key, value.clone());
                    Ok(text(""))
                }
                None => Ok(text(vm.get_tag(key).unwrap_or_default())),
            }
        }
        ["vm", "migrate"] => {
            let ns = engine.namespaces.active().await;
            let vm = ns.registry.resolve(arg(cmd, 0)?).await?;
            match args(cmd).get(1) {
                Some(path) => {
                    vm.migrate(path).await?;
                    Ok(text(""))
                }
                None => {
                    let (status, progress) = vm.query_migrate().await?;
                    Ok(text(format!("{} {:.2}", status, progress)))
                }
            }
        }
        ["vm", "qmp"] => {
            let ns = engine.namespaces.active().await;
            let vm = ns.registry.resolve(arg(cmd, 0)?).await?;
            let request = args(cmd)[1..].join(" ");
            let reply = vm.qmp_raw(&request).await?;
            Ok(text(reply.to_string()))
        }
        ["vm", "hotplug", "add"] => {
            let ns = engine.namespaces.active().await;
            let vm = ns.registry.resolve(arg(cmd, 0)?).await?;
            let slot = vm.hotplug_add(arg(cmd, 1)?).await?;
            Ok(text(slot.to_string()))
        }
        ["vm", "hotplug", "remove"] => {
            let ns = engine.namespaces.active().await;
            let vm = ns.registry.resolve(arg(cmd, 0)?).await?;
            let slot: u32 = parse_num(cmd, 1)?;
            vm.hotplug_remove(slot).await?;
            Ok(text(""))
        }
        ["vm", "hotplug"] => {
            let ns = engine.namespaces.active().await;
            let vm = ns.registry.resolve(arg(cmd, 0)?).await?;
            let rows: Vec<Vec<String>> = vm
                .hotplug_list()
                .await
                .into_iter()
                .map(|(slot, file)| vec![slot.to_string(), file])
                .collect();
            Ok(table(vec!["slot".into(), "file".into()], rows))
        }

        // ── mesh ──────────────────────────────────────────────────
        ["mesh", "dial"] => {
            engine.mesh.dial(arg(cmd, 0)?).await?;
            Ok(text(""))
        }
        ["mesh", "send"] => {
            // Interactive sends stream through dispatch(); a nested send
            // arriving here (e.g. from a read script) collects one batch.
            let mut batches = mesh_send_stream(engine, cmd).await?;
            let mut out = String::new();
            while let Some(batch) = batches.recv().await {
                for resp in batch {
                    if resp.error.is_empty() {
                        out.push_str(&format!("{}: {}\n", resp.host, resp.response));
                    } else {
                        out.push_str(&format!("{}: error: {}\n", resp.host, resp.error));
                    }
                }
            }
            Ok(text(out))
        }
        ["mesh", "status"] => {
            let peers = engine.mesh.peers().await;
            let known = engine.mesh.broadcast_recipients().await;
            Ok(text(format!(
                "degree {} peers {} mesh size {}",
                engine.mesh.degree(),
                peers.len(),
                known.len() + 1
            )))
        }
        ["mesh", "list"] => {
            let peers = engine.mesh.peers().await;
            let known = engine.mesh.broadcast_recipients().await;
            Ok(text(format!(
                "peers: {}\nknown: {}",
                peers.join(","),
                known.join(",")
            )))
        }
        ["mesh", "degree"] => match args(cmd).first() {
            Some(raw) => {
                let degree = raw
                    .parse()
                    .map_err(|_| Error::Validation(format!("bad degree: {}", raw)))?;
                engine.mesh.set_degree(degree);
                Ok(text(""))
            }
            None => Ok(text(engine.mesh.degree().to_string())),
        },

        // ── bridge / tap ──────────────────────────────────────────
        ["bridge", "info"] => {
            let mut rows = Vec::new();
            for bridge in engine.bridges.list().await {
                let vlans: Vec<String> =
                    bridge.vlans().await.iter().map(|v| v.to_string()).collect();
                rows.push(vec![
                    bridge.name.clone(),
                    bridge.preexisted.to_string(),
                    vlans.join(","),
                    bridge.tap_count().await.to_string(),
                ]);
            }
            Ok(table(
                vec!["bridge".into(), "preexisted".into(), "vlans".into(), "taps".into()],
                rows,
            ))
        }
        ["bridge", "destroy"] => {
            engine.bridges.destroy(arg(cmd, 0)?).await?;
            Ok(text(""))
        }
        ["bridge", "trunk"] => {
            let bridge = engine.bridges.get_or_create(arg(cmd, 0)?).await?;
            bridge.trunk_add(arg(cmd, 1)?).await?;
            Ok(text(""))
        }
        ["bridge", "notrunk"] => {
            let bridge = engine.bridges.get(arg(cmd, 0)?).await?;
            bridge.trunk_remove(arg(cmd, 1)?).await?;
            Ok(text(""))
        }
        ["bridge", "tunnel"] => {
            let kind: TunnelKind = arg(cmd, 0)?.parse()?;
            let bridge = engine.bridges.get_or_create(arg(cmd, 1)?).await?;
            let name = bridge.tunnel_add(kind, arg(cmd, 2)?).await?;
            Ok(text(name))
        }
        ["bridge", "notunnel"] => {
            let bridge = engine.bridges.get(arg(cmd, 0)?).await?;
            bridge.tunnel_remove(arg(cmd, 1)?).await?;
            Ok(text(""))
        }
        ["bridge", "netflow"] => {
            let bridge = engine.bridges.get_or_create(arg(cmd, 0)?).await?;
            match arg(cmd, 1)? {
                "off" => {
                    bridge.netflow_disable().await?;
                    Ok(text(""))
                }
                raw => {
                    let timeout: u32 = raw
                        .parse()
                        .map_err(|_| Error::Validation(format!("bad timeout: {}", raw)))?;
                    let port = bridge.netflow_enable(timeout).await?;
                    Ok(text(format!("127.0.0.1:{}", port)))
                }
            }
        }
        ["tap", "create"] => {
            let bridge = engine.bridges.get_or_create(arg(cmd, 0)?).await?;
            let vlan: i32 = parse_num(cmd, 1)?;
            let host = args(cmd).get(2).map(String::as_str) == Some("host");
            let name = bridge
                .create_tap(engine.bridges.namegen(), None, vlan, host)
                .await?;
            Ok(text(name))
        }
        ["tap", "delete"] => {
            let bridge = engine.bridges.get(arg(cmd, 0)?).await?;
            bridge.destroy_tap(arg(cmd, 1)?).await?;
            Ok(text(""))
        }

        // ── qos ───────────────────────────────────────────────────
        ["qos", "add"] => {
            let bridge = engine.bridges.get(arg(cmd, 0)?).await?;
            let tap = arg(cmd, 1)?;
            let mut params = bridge
                .qos_entries()
                .await
                .into_iter()
                .find(|(name, _)| name.as_str() == tap)
                .map(|(_, params)| params)
                .unwrap_or_default();
            match arg(cmd, 2)? {
                "rate" => params.rate = Some(qos::parse_rate(arg(cmd, 3)?)?),
                "loss" => params.loss = Some(qos::parse_loss(arg(cmd, 3)?)?),
                "delay" => params.delay = Some(qos::parse_delay(arg(cmd, 3)?)?),
                other => {
                    return Err(Error::Validation(format!("unknown qos option: {}", other)))
                }
            }
            bridge.set_qos(tap, params).await?;
            Ok(text(""))
        }
        ["qos", "clear"] => {
            let bridge = engine.bridges.get(arg(cmd, 0)?).await?;
            bridge.clear_qos(arg(cmd, 1)?).await?;
            Ok(text(""))
        }
        ["qos", "list"] => {
            let rows: Vec<Vec<String>> = engine
                .bridges
                .qos_list()
                .await
                .into_iter()
                .map(|(bridge, tap, params)| {
                    vec![
                        bridge,
                        tap,
                        params.rate.clone().unwrap_or_default(),
                        params.loss_display(),
                        params.delay_display(),
                    ]
                })
                .collect();
            Ok(table(
                vec!["bridge".into(), "tap".into(), "rate".into(), "loss".into(), "delay".into()],
                rows,
            ))
        }

        // ── disk ──────────────────────────────────────────────────
        ["disk", "create"] => {
            disk::create(engine.tools.as_ref(), arg(cmd, 0)?, arg(cmd, 1)?).await?;
            Ok(text(""))
        }
        ["disk", "snapshot"] => {
            disk::snapshot(engine.tools.as_ref(), arg(cmd, 0)?, arg(cmd, 1)?).await?;
            Ok(text(""))
        }
        ["disk", "info"] => {
            let info = disk::info(engine.tools.as_ref(), arg(cmd, 0)?).await?;
            Ok(table(
                vec!["format".into(), "virtual-size".into(), "backing".into()],
                vec![vec![
                    info.format,
                    info.virtual_size.to_string(),
                    info.backing.unwrap_or_default(),
                ]],
            ))
        }
        ["disk", "inject"] => {
            let image = arg(cmd, 0)?;
            let mut files = std::collections::HashMap::new();
            for pair in &args(cmd)[1..] {
                let (src, dst) = pair.split_once(':').ok_or_else(|| {
                    Error::Validation(format!("inject wants src:dst, got {}", pair))
                })?;
                files.insert(src.to_string(), dst.to_string());
            }
            disk::inject(engine.tools.as_ref(), image, None, &files).await?;
            Ok(text(""))
        }

        // ── namespace / host ──────────────────────────────────────
        ["namespace"] => match args(cmd).first() {
            Some(name) => {
                engine.namespaces.activate(name).await?;
                Ok(text(""))
            }
            None => {
                let active = engine.namespaces.active().await.name.clone();
                let lines: Vec<String> = engine
                    .namespaces
                    .list()
                    .await
                    .into_iter()
                    .map(|name| {
                        if name == active {
                            format!("{} (active)", name)
                        } else {
                            name
                        }
                    })
                    .collect();
                Ok(text(lines.join("\n")))
            }
        },
        ["namespace", "hosts"] => {
            let ns = engine.namespaces.active().await;
            match args(cmd).first() {
                Some(list) => {
                    ns.add_hosts(list.split(',').map(String::from)).await;
                    Ok(text(""))
                }
                None => Ok(text(ns.hosts().await.join(","))),
            }
        }
        ["host", "stats"] => {
            let stats = engine.local_stats().await;
            Ok(table(Engine::stats_header(), vec![Engine::stats_row(&stats)]))
        }

        // ── misc ──────────────────────────────────────────────────
        ["optimize", "ksm"] => {
            if parse_bool(arg(cmd, 0)?)? {
                engine.ksm_enable()?;
            } else {
                engine.ksm_disable()?;
            }
            Ok(text(""))
        }
        ["read"] => {
            let file = arg(cmd, 0)?;
            let check_only = args(cmd).get(1).map(String::as_str) == Some("check");
            let script = tokio::fs::read_to_string(file).await?;
            let mut out = String::new();
            for line in script.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                check_nesting(line)?;
                let sub = command::compile(line)?;
                if check_only {
                    continue;
                }
                let nested: std::pin::Pin<
                    Box<dyn std::future::Future<Output = WireResponse> + Send + '_>,
                > = Box::pin(handle_command(engine, &sub));
                let resp = nested.await;
                if !resp.error.is_empty() {
                    return Err(Error::Validation(format!("{}: {}", line, resp.error)));
                }
                if !resp.response.is_empty() {
                    out.push_str(&resp.response);
                    out.push('\n');
                }
            }
            Ok(text(out))
        }
        ["quit"] => {
            let delay = match args(cmd).first() {
                Some(raw) => raw
                    .parse::<humantime::Duration>()
                    .map(Into::into)
                    .map_err(|_| Error::Validation(format!("bad delay: {}", raw)))?,
                None => Duration::ZERO,
            };
            engine.request_shutdown(delay);
            Ok(text("quitting"))
        }
        ["version"] => Ok(text(format!(
            "vmesh {} {}",
            env!("CARGO_PKG_VERSION"),
            crate::BUILD_DATE
        ))),
        ["debug"] => {
            let ns = engine.namespaces.active().await;
            Ok(text(format!(
                "namespaces {} bridges {} vms {} peers {}",
                engine.namespaces.list().await.len(),
                engine.bridges.list().await.len(),
                ns.registry.count().await,
                engine.mesh.peers().await.len()
            )))
        }
        _ => Err(Error::Validation(format!(
            "unhandled command: {}",
            cmd.original
        ))),
    }
}

enum VmOp {
    Start,
    Stop,
    Kill,
}

/// Apply a lifecycle op to one VM or `all`, collecting per-VM errors.
async fn vm_apply(engine: &Arc<Engine>, target: &str, op: VmOp) -> Result<WireResponse> {
    let ns = engine.namespaces.active().await;
    let ctx = engine.vm_context(&ns);
    let vms = if target == "all" {
        ns.registry.list().await
    } else {
        vec![ns.registry.resolve(target).await?]
    };

    let mut applied = 0usize;
    let mut errors = Vec::new();
    for vm in vms {
        let result = match op {
            VmOp::Start => vm.start(&ctx).await,
            VmOp::Stop => vm.stop().await,
            VmOp::Kill => vm.kill().await,
        };
        match result {
            Ok(()) => applied += 1,
            Err(e) => errors.push(format!("{}: {}", vm.name, e)),
        }
    }

    if errors.is_empty() {
        Ok(text(format!("{}", applied)))
    } else if target == "all" {
        // Bulk ops report partial failure without aborting the rest.
        Ok(text(format!("{} ({})", applied, errors.join("; "))))
    } else {
        Err(Error::Validation(errors.join("; ")))
    }
}

fn parse_num<T: std::str::FromStr>(cmd: &WireCommand, index: usize) -> Result<T> {
    let raw = arg(cmd, index)?;
    raw.parse()
        .map_err(|_| Error::Validation(format!("bad number: {}", raw)))
}

fn parse_bool(raw: &str) -> Result<bool> {
    match raw {
        "true" | "on" => Ok(true),
        "false" | "off" => Ok(false),
        other => Err(Error::Validation(format!("bad boolean: {}", other))),
    }
}

/// `vlan` | `bridge,vlan` | `[bridge,]vlan,mac[,driver]`
fn parse_net(spec: &str) -> Result<NetConfig> {
    let fields: Vec<&str> = spec.split(',').collect();
    let mut net = NetConfig::new(0);
    let mut rest = &fields[..];

    if let Ok(vlan) = fields[0].parse::<i32>() {
        net.vlan = vlan;
        rest = &fields[1..];
    } else {
        let vlan = fields
            .get(1)
            .and_then(|f| f.parse::<i32>().ok())
            .ok_or_else(|| Error::Validation(format!("bad net spec: {}", spec)))?;
        net.bridge = fields[0].to_string();
        net.vlan = vlan;
        rest = &fields[2..];
    }

    for field in rest {
        if field.contains(':') {
            net.mac = Some(field.to_string());
        } else if !field.is_empty() {
            net.driver = field.to_string();
        }
    }
    if net.vlan < 0 {
        return Err(Error::Validation(format!("bad vlan in {}", spec)));
    }
    Ok(net)
}

async fn with_kvm(
    engine: &Arc<Engine>,
    mutate: impl FnOnce(&mut crate::vm::KvmConfig),
) -> Result<WireResponse> {
    let mut current = engine.current.lock().await;
    match &mut current.kind {
        VmKindConfig::Kvm(kvm) => {
            mutate(kvm);
            Ok(text(""))
        }
        VmKindConfig::Container(_) => Err(Error::State("current config is not kvm".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{MockResult, MockTools};

    async fn test_engine() -> (Arc<Engine>, tempfile::TempDir, Arc<MockTools>) {
        let dir = tempfile::tempdir().unwrap();
        let tools = Arc::new(MockTools::new());
        let engine = Engine::for_tests(dir.path(), tools.clone());
        (engine, dir, tools)
    }

    async fn run(engine: &Arc<Engine>, line: &str) -> WireResponse {
        let cmd = command::compile(line).unwrap();
        handle_command(engine, &cmd).await
    }

    #[tokio::test]
    async fn vm_config_round_trip() {
        let (engine, _dir, _tools) = test_engine().await;
        assert!(run(&engine, "vm config memory 512").await.error.is_empty());
        assert!(run(&engine, "vm config vcpus 2").await.error.is_empty());
        assert!(run(&engine, "vm config disk a.qc2").await.error.is_empty());
        assert!(run(&engine, "vm config net 100").await.error.is_empty());

        let shown = run(&engine, "vm config").await;
        assert!(shown.response.contains("memory:  512"));
        assert!(shown.response.contains("a.qc2"));

        run(&engine, "vm config clear").await;
        let shown = run(&engine, "vm config").await;
        assert!(shown.response.contains("memory:  2048"));
    }

    #[tokio::test]
    async fn net_spec_forms() {
        let net = parse_net("100").unwrap();
        assert_eq!(net.bridge, "mega_bridge");
        assert_eq!(net.vlan, 100);

        let net = parse_net("lan0,200,00:11:22:33:44:55,virtio-net-pci").unwrap();
        assert_eq!(net.bridge, "lan0");
        assert_eq!(net.vlan, 200);
        assert_eq!(net.mac.as_deref(), Some("00:11:22:33:44:55"));
        assert_eq!(net.driver, "virtio-net-pci");

        assert!(parse_net("lan0,abc").is_err());
    }

    #[tokio::test]
    async fn unknown_target_reports_not_found() {
        let (engine, _dir, _tools) = test_engine().await;
        let resp = run(&engine, "vm start ghost").await;
        assert!(resp.error.contains("not found"));
        assert_eq!(resp.host, "testhost");
    }

    #[tokio::test]
    async fn tap_create_and_qos_flow() {
        let (engine, _dir, tools) = test_engine().await;

        let created = run(&engine, "tap create mega_bridge 100").await;
        assert!(created.error.is_empty(), "{}", created.error);
        let tap = created.response.clone();
        assert!(tap.starts_with("mega_tap"));

        let added = run(&engine, &format!("qos add mega_bridge {} rate 1mbit", tap)).await;
        assert!(added.error.is_empty(), "{}", added.error);
        let added = run(&engine, &format!("qos add mega_bridge {} loss 5", tap)).await;
        assert!(added.error.is_empty(), "{}", added.error);

        // Chain: tbf root then netem child (after the shape change).
        let tc: Vec<String> = tools.calls_for("tc").iter().map(|c| c.join(" ")).collect();
        assert!(tc.iter().any(|c| c.contains("root handle 1: tbf")));
        assert!(tc.iter().any(|c| c.contains("parent 1: handle 2: netem loss 5%")));

        let listed = run(&engine, "qos list").await;
        assert_eq!(listed.tabular.len(), 1);
        assert_eq!(listed.tabular[0][2], "1mbit");

        let cleared = run(&engine, &format!("qos clear mega_bridge {}", tap)).await;
        assert!(cleared.error.is_empty());
        let listed = run(&engine, "qos list").await;
        assert!(listed.tabular.is_empty());
    }

    #[tokio::test]
    async fn host_stats_row_shape() {
        let (engine, _dir, _tools) = test_engine().await;
        let resp = run(&engine, "host stats").await;
        assert_eq!(resp.header.len(), 8);
        assert_eq!(resp.tabular.len(), 1);
        assert_eq!(resp.tabular[0][0], "testhost");
    }

    #[tokio::test]
    async fn read_executes_scripts_and_rejects_nesting() {
        let (engine, dir, _tools) = test_engine().await;
        let script = dir.path().join("setup.mm");
        std::fs::write(&script, "# comment\nvm config memory 768\nvm config vcpus 4\n").unwrap();

        let resp = run(&engine, &format!("read {}", script.display())).await;
        assert!(resp.error.is_empty(), "{}", resp.error);
        assert_eq!(engine.current.lock().await.memory, 768);

        let nested = dir.path().join("nested.mm");
        std::fs::write(&nested, format!("read {}\n", script.display())).unwrap();
        let resp = run(&engine, &format!("read {}", nested.display())).await;
        assert!(resp.error.contains("nested"));

        // A script may not fan out over the mesh either.
        let sending = dir.path().join("sending.mm");
        std::fs::write(&sending, "vm config memory 256\nmesh send all vm info\n").unwrap();
        let resp = run(&engine, &format!("read {}", sending.display())).await;
        assert!(resp.error.contains("nested"));
        // Lines run in order; everything before the offending line landed.
        assert_eq!(engine.current.lock().await.memory, 256);
    }

    #[tokio::test]
    async fn disk_info_renders_table() {
        let (engine, _dir, tools) = test_engine().await;
        tools.push_result(MockResult::Ok(
            r#"{"format": "qcow2", "virtual-size": 1024, "backing-filename": null}"#,
        ));
        let resp = run(&engine, "disk info base.qc2").await;
        assert!(resp.error.is_empty());
        assert_eq!(resp.tabular[0][0], "qcow2");
    }

    #[tokio::test]
    async fn version_reports_revision_and_date() {
        let (engine, _dir, _tools) = test_engine().await;
        let resp = run(&engine, "version").await;
        assert!(resp.response.starts_with("vmesh "));
        assert!(resp.response.contains(crate::BUILD_DATE));
    }
}
