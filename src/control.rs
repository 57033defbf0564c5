//! Local control socket.
//!
//! A unix domain socket at `<base>/vmesh` speaking length-prefixed JSON
//! frames: a [`WireCommand`] in, a stream of [`ControlReply`] batches out,
//! the last one flagged `done`. The `-e` one-shot client connects, runs
//! one command, prints, and exits.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use vmesh_protocol::{Frame, MessageType, WireCommand, WireResponse};

use crate::command;
use crate::dispatch;
use crate::engine::Engine;
use crate::mesh::{read_frame, write_frame};
use crate::{Error, Result};

/// Control socket filename under the base path.
pub const SOCKET_NAME: &str = "vmesh";

/// One streamed unit of a command's output.
#[derive(Debug, Serialize, Deserialize)]
pub struct ControlReply {
    pub batch: Vec<WireResponse>,
    /// True on the final (empty) frame of a command.
    pub done: bool,
}

/// Bind and serve the control socket.
pub fn serve(engine: Arc<Engine>) -> Result<JoinHandle<()>> {
    let path = engine.config.base.join(SOCKET_NAME);
    let listener = UnixListener::bind(&path)
        .map_err(|e| Error::Transport(format!("control socket {}: {}", path.display(), e)))?;
    debug!(path = %path.display(), "control socket listening");

    Ok(tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let engine = engine.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve_client(engine, stream).await {
                            debug!(error = %e, "control client gone");
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "control accept failed");
                    return;
                }
            }
        }
    }))
}

async fn serve_client(engine: Arc<Engine>, mut stream: UnixStream) -> Result<()> {
    loop {
        let frame = read_frame(&mut stream).await?;
        if frame.msg_type != MessageType::Command {
            continue;
        }
        let cmd: WireCommand = frame.decode()?;
        let mut batches = dispatch::dispatch(&engine, cmd);
        while let Some(batch) = batches.recv().await {
            let reply = ControlReply { batch, done: false };
            let frame = Frame::encode(MessageType::Response, &reply)?;
            write_frame(&mut stream, &frame).await?;
        }
        let done = Frame::encode(
            MessageType::Response,
            &ControlReply {
                batch: Vec::new(),
                done: true,
            },
        )?;
        write_frame(&mut stream, &done).await?;
    }
}

/// Synchronous one-shot client: compile `line`, run it through a live
/// daemon's control socket, and return the batches.
pub fn one_shot(base: &Path, line: &str) -> Result<Vec<Vec<WireResponse>>> {
    let cmd = command::compile(line)?;
    let mut stream = std::os::unix::net::UnixStream::connect(base.join(SOCKET_NAME))
        .map_err(|e| Error::Transport(format!("is a vmesh daemon running here? {}", e)))?;

    Frame::encode(MessageType::Command, &cmd)?.write_to_sync(&mut stream)?;

    let mut batches = Vec::new();
    loop {
        let frame = Frame::read_from_sync(&mut stream)?;
        let reply: ControlReply = frame.decode()?;
        if reply.done {
            return Ok(batches);
        }
        batches.push(reply.batch);
    }
}

/// Render response batches the way the CLI prints them.
pub fn render(batches: &[Vec<WireResponse>]) -> String {
    let mut out = String::new();
    for batch in batches {
        for resp in batch {
            if !resp.error.is_empty() {
                out.push_str(&format!("{}: error: {}\n", resp.host, resp.error));
                continue;
            }
            if !resp.header.is_empty() {
                out.push_str(&resp.header.join("\t"));
                out.push('\n');
                for row in &resp.tabular {
                    out.push_str(&row.join("\t"));
                    out.push('\n');
                }
                continue;
            }
            if !resp.response.is_empty() {
                out.push_str(&resp.response);
                if !resp.response.ends_with('\n') {
                    out.push('\n');
                }
            }
        }
    }
    out
}
