//! Client for the emulator's QMP control socket.
//!
//! QMP is newline-delimited JSON over a unix socket: a greeting, a
//! capabilities negotiation, then request/response pairs correlated by id,
//! with asynchronous events interleaved. The reader task demultiplexes
//! events onto their own channel so a VNC connect or block event never
//! blocks a command in flight.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, warn};

use crate::{Error, Result};

/// How long a single command may wait for its response.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>>;

/// Connected QMP session.
#[derive(Debug)]
pub struct QmpClient {
    writer: Mutex<tokio::net::unix::OwnedWriteHalf>,
    pending: Pending,
    ids: AtomicU64,
    events: Mutex<Option<mpsc::UnboundedReceiver<Value>>>,
}

impl QmpClient {
    /// Dial the socket, retrying `retries` times with `delay` between
    /// attempts, then negotiate capabilities.
    pub async fn connect(path: &Path, retries: u32, delay: Duration) -> Result<Self> {
        let mut last_err: Option<std::io::Error> = None;
        for attempt in 0..retries {
            match UnixStream::connect(path).await {
                Ok(stream) => {
                    debug!(path = %path.display(), attempt, "qmp connected");
                    return Self::negotiate(stream).await;
                }
                Err(e) => {
                    last_err = Some(e);
                    tokio::time::sleep(delay).await;
                }
            }
        }
        Err(Error::Transport(format!(
            "qmp dial {} failed: {}",
            path.display(),
            last_err.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    async fn negotiate(stream: UnixStream) -> Result<Self> {
        let (read_half, write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        // Greeting: {"QMP": {"version": ..., "capabilities": [...]}}
        let mut greeting = String::new();
        reader.read_line(&mut greeting).await?;
        let banner: Value = serde_json::from_str(&greeting)?;
        if banner.get("QMP").is_none() {
            return Err(Error::Transport("not a QMP socket".into()));
        }

        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let reader_pending = pending.clone();
        tokio::spawn(async move {
            let mut lines = reader.lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let msg: Value = match serde_json::from_str(&line) {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(error = %e, "bad qmp line");
                        continue;
                    }
                };
                if msg.get("event").is_some() {
                    let _ = event_tx.send(msg);
                    continue;
                }
                if msg.get("return").is_some() || msg.get("error").is_some() {
                    let id = msg.get("id").and_then(Value::as_u64);
                    if let Some(id) = id {
                        if let Some(waiter) = reader_pending.lock().await.remove(&id) {
                            let _ = waiter.send(msg);
                        }
                    }
                }
            }
            // Socket closed: every waiter gets dropped, turning into an error.
            reader_pending.lock().await.clear();
        });

        let client = Self {
            writer: Mutex::new(write_half),
            pending,
            ids: AtomicU64::new(1),
            events: Mutex::new(Some(event_rx)),
        };

        client.execute("qmp_capabilities", None).await?;
        Ok(client)
    }

    /// Take the asynchronous event stream. Yields `None` after the first
    /// call; there is exactly one drainer per VM.
    pub async fn take_events(&self) -> Option<mpsc::UnboundedReceiver<Value>> {
        self.events.lock().await.take()
    }

    /// Execute one QMP command and return its `return` value.
    pub async fn execute(&self, command: &str, arguments: Option<Value>) -> Result<Value> {
        let id = self.ids.fetch_add(1, Ordering::SeqCst);
        let mut request = json!({ "execute": command, "id": id });
        if let Some(args) = arguments {
            request["arguments"] = args;
        }

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        {
            let mut writer = self.writer.lock().await;
            let mut line = serde_json::to_vec(&request)?;
            line.push(b'\n');
            writer.write_all(&line).await?;
        }

        let reply = match tokio::time::timeout(COMMAND_TIMEOUT, rx).await {
            Ok(Ok(value)) => value,
            Ok(Err(_)) => return Err(Error::Transport("qmp socket closed".into())),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                return Err(Error::Transport(format!("qmp {} timed out", command)));
            }
        };

        if let Some(err) = reply.get("error") {
            let desc = err
                .get("desc")
                .and_then(Value::as_str)
                .unwrap_or("unknown qmp error");
            return Err(Error::State(desc.to_string()));
        }
        Ok(reply.get("return").cloned().unwrap_or(Value::Null))
    }

    /// Pause guest execution.
    pub async fn stop(&self) -> Result<()> {
        self.execute("stop", None).await.map(|_| ())
    }

    /// Resume guest execution.
    pub async fn cont(&self) -> Result<()> {
        self.execute("cont", None).await.map(|_| ())
    }

    /// Ask the guest to power down via ACPI.
    pub async fn system_powerdown(&self) -> Result<()> {
        self.execute("system_powerdown", None).await.map(|_| ())
    }

    /// Write a PPM screendump to `filename` on the host.
    pub async fn screendump(&self, filename: &str) -> Result<()> {
        self.execute("screendump", Some(json!({ "filename": filename })))
            .await
            .map(|_| ())
    }

    /// Start a migration writing the VM state through `cat` into `path`.
    pub async fn migrate(&self, path: &str) -> Result<()> {
        let uri = format!("exec:cat > {}", path);
        self.execute("migrate", Some(json!({ "uri": uri })))
            .await
            .map(|_| ())
    }

    /// Migration status and fractional progress in [0, 1].
    ///
    /// 1.0 iff completed; "failed" reports 0. While active the fraction is
    /// ram.transferred / ram.total.
    pub async fn query_migrate(&self) -> Result<(String, f64)> {
        let reply = self.execute("query-migrate", None).await?;
        let status = reply
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or("none")
            .to_string();
        let progress = match status.as_str() {
            "completed" => 1.0,
            "failed" => 0.0,
            _ => {
                let ram = reply.get("ram");
                let transferred = ram
                    .and_then(|r| r.get("transferred"))
                    .and_then(Value::as_f64)
                    .unwrap_or(0.0);
                let total = ram
                    .and_then(|r| r.get("total"))
                    .and_then(Value::as_f64)
                    .unwrap_or(0.0);
                if total > 0.0 {
                    (transferred / total).clamp(0.0, 1.0)
                } else {
                    0.0
                }
            }
        };
        Ok((status, progress))
    }

    /// Hot-add a device.
    pub async fn device_add(&self, mut arguments: Value, driver: &str, id: &str) -> Result<()> {
        arguments["driver"] = json!(driver);
        arguments["id"] = json!(id);
        self.execute("device_add", Some(arguments)).await.map(|_| ())
    }

    /// Hot-remove a device.
    pub async fn device_del(&self, id: &str) -> Result<()> {
        self.execute("device_del", Some(json!({ "id": id })))
            .await
            .map(|_| ())
    }

    /// Raw passthrough for the human monitor.
    pub async fn human_monitor(&self, command_line: &str) -> Result<String> {
        let reply = self
            .execute(
                "human-monitor-command",
                Some(json!({ "command-line": command_line })),
            )
            .await?;
        Ok(reply.as_str().unwrap_or_default().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::UnixListener;

    /// Minimal scripted QMP endpoint: greets, acks capabilities, then
    /// answers every command from the provided closure.
    async fn serve_one(
        listener: UnixListener,
        mut respond: impl FnMut(&Value) -> Vec<Value> + Send + 'static,
    ) {
        let (mut stream, _) = listener.accept().await.unwrap();
        stream
            .write_all(b"{\"QMP\": {\"version\": {}, \"capabilities\": []}}\n")
            .await
            .unwrap();

        let mut buf = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            match stream.read_exact(&mut byte).await {
                Ok(_) => {}
                Err(_) => return,
            }
            if byte[0] != b'\n' {
                buf.push(byte[0]);
                continue;
            }
            let request: Value = serde_json::from_slice(&buf).unwrap();
            buf.clear();
            for mut reply in respond(&request) {
                if reply.get("event").is_none() {
                    reply["id"] = request["id"].clone();
                }
                let mut line = serde_json::to_vec(&reply).unwrap();
                line.push(b'\n');
                stream.write_all(&line).await.unwrap();
            }
        }
    }

    fn sock(dir: &tempfile::TempDir) -> std::path::PathBuf {
        dir.path().join("qmp")
    }

    #[tokio::test]
    async fn negotiates_and_executes() {
        let dir = tempfile::tempdir().unwrap();
        let listener = UnixListener::bind(sock(&dir)).unwrap();
        tokio::spawn(serve_one(listener, |req| {
            match req["execute"].as_str().unwrap() {
                "qmp_capabilities" => vec![json!({"return": {}})],
                "stop" => vec![json!({"return": {}})],
                other => vec![json!({"error": {"desc": format!("unknown: {}", other)}})],
            }
        }));

        let client = QmpClient::connect(&sock(&dir), 5, Duration::from_millis(10))
            .await
            .unwrap();
        client.stop().await.unwrap();
        assert!(client.execute("bogus", None).await.is_err());
    }

    #[tokio::test]
    async fn events_are_demultiplexed() {
        let dir = tempfile::tempdir().unwrap();
        let listener = UnixListener::bind(sock(&dir)).unwrap();
        tokio::spawn(serve_one(listener, |req| {
            match req["execute"].as_str().unwrap() {
                "qmp_capabilities" => vec![json!({"return": {}})],
                "cont" => vec![
                    json!({"event": "VNC_CONNECTED", "data": {}}),
                    json!({"return": {}}),
                ],
                _ => vec![json!({"return": {}})],
            }
        }));

        let client = QmpClient::connect(&sock(&dir), 5, Duration::from_millis(10))
            .await
            .unwrap();
        let mut events = client.take_events().await.unwrap();
        assert!(client.take_events().await.is_none());

        client.cont().await.unwrap();
        let event = events.recv().await.unwrap();
        assert_eq!(event["event"], "VNC_CONNECTED");
    }

    #[tokio::test]
    async fn migrate_progress_mapping() {
        let dir = tempfile::tempdir().unwrap();
        let listener = UnixListener::bind(sock(&dir)).unwrap();
        let mut polls = 0u32;
        tokio::spawn(serve_one(listener, move |req| {
            match req["execute"].as_str().unwrap() {
                "qmp_capabilities" => vec![json!({"return": {}})],
                "query-migrate" => {
                    polls += 1;
                    let reply = match polls {
                        1 => json!({"return": {"status": "active",
                                    "ram": {"transferred": 250.0, "total": 1000.0}}}),
                        2 => json!({"return": {"status": "completed"}}),
                        _ => json!({"return": {"status": "failed"}}),
                    };
                    vec![reply]
                }
                _ => vec![json!({"return": {}})],
            }
        }));

        let client = QmpClient::connect(&sock(&dir), 5, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(client.query_migrate().await.unwrap(), ("active".into(), 0.25));
        assert_eq!(
            client.query_migrate().await.unwrap(),
            ("completed".into(), 1.0)
        );
        assert_eq!(client.query_migrate().await.unwrap(), ("failed".into(), 0.0));
    }

    #[tokio::test]
    async fn dial_gives_up_after_retries() {
        let dir = tempfile::tempdir().unwrap();
        let err = QmpClient::connect(&sock(&dir), 3, Duration::from_millis(5))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }
}
