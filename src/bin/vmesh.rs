//! vmesh daemon and one-shot client.
//!
//! Usage:
//!   vmesh --base /tmp/vmesh --degree 2 --port 9000
//!   vmesh -e vm info

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use vmesh::control;
use vmesh::dispatch;
use vmesh::engine::{Engine, EngineConfig};
use vmesh::process::HostTools;
use vmesh::{command, Result};

#[derive(Parser, Debug)]
#[command(name = "vmesh", version, about = "distributed VM orchestrator")]
struct Args {
    /// Base data path for instance dirs, state files, and the control
    /// socket.
    #[arg(long, env = "VMESH_BASE", default_value = "/tmp/vmesh")]
    base: PathBuf,

    /// Mesh identity; defaults to the system hostname.
    #[arg(long)]
    hostname: Option<String>,

    /// Target outbound mesh connections (0 = don't dial).
    #[arg(long, default_value_t = 0)]
    degree: usize,

    /// Mesh TCP port.
    #[arg(long, default_value_t = 9000)]
    port: u16,

    /// Membership advertisement period.
    #[arg(long, default_value = "10s")]
    msa_timeout: humantime::Duration,

    /// Per-send response deadline.
    #[arg(long, default_value = "30s")]
    send_timeout: humantime::Duration,

    /// Start even if a stale control socket is present.
    #[arg(long)]
    force: bool,

    /// Log filter (tracing env-filter syntax).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Also log to this file.
    #[arg(long)]
    logfile: Option<PathBuf>,

    /// Optional YAML config; flags win over file values.
    #[arg(long)]
    config: Option<PathBuf>,

    /// One-shot client mode: run a command against a live daemon and
    /// exit.
    #[arg(short = 'e', num_args = 1.., allow_hyphen_values = true)]
    execute: Vec<String>,
}

/// Subset of the flags that may come from a YAML file.
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    base: Option<PathBuf>,
    hostname: Option<String>,
    degree: Option<usize>,
    port: Option<u16>,
}

fn system_hostname() -> String {
    let mut buf = [0u8; 256];
    // SAFETY: buf outlives the call and the length is passed alongside.
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if rc == 0 {
        let end = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());
        String::from_utf8_lossy(&buf[..end]).into_owned()
    } else {
        "localhost".to_string()
    }
}

fn init_tracing(args: &Args) {
    let filter = EnvFilter::try_new(&args.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match &args.logfile {
        Some(path) => {
            let dir = path.parent().unwrap_or(std::path::Path::new("."));
            let file = path.file_name().map(PathBuf::from).unwrap_or_default();
            let appender = tracing_appender::rolling::never(dir, file);
            builder.with_writer(appender).with_ansi(false).init();
        }
        None => builder.init(),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let mut args = Args::parse();

    if let Some(path) = &args.config {
        match std::fs::read_to_string(path)
            .map_err(|e| e.to_string())
            .and_then(|text| serde_yaml::from_str::<FileConfig>(&text).map_err(|e| e.to_string()))
        {
            Ok(file) => {
                if let Some(base) = file.base {
                    args.base = base;
                }
                if args.hostname.is_none() {
                    args.hostname = file.hostname;
                }
                if let Some(degree) = file.degree {
                    args.degree = degree;
                }
                if let Some(port) = file.port {
                    args.port = port;
                }
            }
            Err(e) => {
                eprintln!("config {}: {}", path.display(), e);
                return ExitCode::FAILURE;
            }
        }
    }

    // One-shot client: no daemon, no tracing noise.
    if !args.execute.is_empty() {
        let line = args.execute.join(" ");
        return match control::one_shot(&args.base, &line) {
            Ok(batches) => {
                print!("{}", control::render(&batches));
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("{}", e);
                ExitCode::FAILURE
            }
        };
    }

    init_tracing(&args);
    match daemon(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn daemon(args: Args) -> Result<()> {
    let hostname = args.hostname.clone().unwrap_or_else(system_hostname);

    let socket = args.base.join(control::SOCKET_NAME);
    if socket.exists() {
        if !args.force {
            return Err(vmesh::Error::State(format!(
                "control socket {} exists; already running? (--force to override)",
                socket.display()
            )));
        }
        std::fs::remove_file(&socket)?;
    }

    let mut config = EngineConfig::new(&args.base, hostname);
    config.mesh_port = args.port;
    config.degree = args.degree;
    config.msa_timeout = args.msa_timeout.into();
    config.send_timeout = args.send_timeout.into();

    let engine = Engine::new(config, Arc::new(HostTools));
    engine.start(true).await?;
    let _control = control::serve(engine.clone())?;

    let mut shutdown = engine.shutdown_watch();
    let repl_engine = engine.clone();
    tokio::spawn(async move {
        let stdin = BufReader::new(tokio::io::stdin());
        let mut lines = stdin.lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match command::compile(line) {
                Ok(cmd) => {
                    let mut batches = dispatch::dispatch(&repl_engine, cmd);
                    while let Some(batch) = batches.recv().await {
                        print!("{}", control::render(&[batch]));
                    }
                }
                Err(e) => eprintln!("{}", e),
            }
        }
    });

    let mut sigterm =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt, shutting down");
        }
        _ = sigterm.recv() => {
            info!("terminated, shutting down");
        }
        _ = shutdown.changed() => {
            info!("quit requested");
        }
    }

    engine.teardown().await;
    // Give detached watchers a beat to finish their acks.
    tokio::time::sleep(Duration::from_millis(100)).await;
    Ok(())
}
