//! Peer-to-peer control mesh.
//!
//! Every host is a node identified by its hostname. Nodes hold TCP
//! connections to a handful of peers and flood framed messages; a seen-set
//! keyed on (sender, sequence) stops re-floods. Flooded membership
//! advertisements give each node the adjacency list of the whole mesh, so
//! any node can name any other as a recipient without a direct connection.

pub mod send;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use vmesh_protocol::{
    CommandMessage, Envelope, Frame, FileTransferMessage, MessageType, MsaMessage,
    RemoteLaunchMessage, RemoteLaunchResponseMessage, ResponseMessage, HEADER_SIZE, MAX_PAYLOAD,
};

use crate::{Error, Result};

/// Read one frame from an async stream.
pub async fn read_frame<R: tokio::io::AsyncRead + Unpin>(reader: &mut R) -> Result<Frame> {
    let mut header = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header).await?;
    let length = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
    if length > MAX_PAYLOAD {
        return Err(Error::Transport(format!("oversized frame: {} bytes", length)));
    }
    let msg_type = MessageType::try_from(header[4])?;
    let mut payload = vec![0u8; length];
    if length > 0 {
        reader.read_exact(&mut payload).await?;
    }
    Ok(Frame { msg_type, payload })
}

/// Write one frame to an async stream.
pub async fn write_frame<W: tokio::io::AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> Result<()> {
    writer.write_all(&frame.serialize()).await?;
    Ok(())
}

struct PeerHandle {
    tx: mpsc::UnboundedSender<Frame>,
}

#[derive(Default)]
struct MeshState {
    peers: HashMap<String, PeerHandle>,
    /// host → its advertised neighbors, for the whole known mesh.
    adjacency: HashMap<String, Vec<String>>,
}

/// Inbound typed deliveries, handed to the command dispatcher.
pub struct Inbox {
    pub commands: mpsc::UnboundedReceiver<(String, CommandMessage)>,
    pub launches: mpsc::UnboundedReceiver<(String, RemoteLaunchMessage)>,
    pub files: mpsc::UnboundedReceiver<(String, FileTransferMessage)>,
}

pub struct Mesh {
    hostname: String,
    port: u16,
    degree: AtomicUsize,
    seq: AtomicU64,
    state: Mutex<MeshState>,
    seen: Mutex<HashSet<(String, u64)>>,

    /// One send outstanding at a time; guards the correlation space.
    pub(crate) send_lock: Mutex<()>,
    pub(crate) resp_tx: mpsc::UnboundedSender<ResponseMessage>,
    pub(crate) resp_rx: Mutex<mpsc::UnboundedReceiver<ResponseMessage>>,
    pub(crate) launch_resp_tx: mpsc::UnboundedSender<RemoteLaunchResponseMessage>,
    pub(crate) launch_resp_rx: Mutex<mpsc::UnboundedReceiver<RemoteLaunchResponseMessage>>,

    command_tx: mpsc::UnboundedSender<(String, CommandMessage)>,
    launch_tx: mpsc::UnboundedSender<(String, RemoteLaunchMessage)>,
    file_tx: mpsc::UnboundedSender<(String, FileTransferMessage)>,
    inbox: std::sync::Mutex<Option<Inbox>>,
}

impl Mesh {
    pub fn new(hostname: impl Into<String>, port: u16, degree: usize) -> Arc<Self> {
        let (resp_tx, resp_rx) = mpsc::unbounded_channel();
        let (launch_resp_tx, launch_resp_rx) = mpsc::unbounded_channel();
        let (command_tx, commands) = mpsc::unbounded_channel();
        let (launch_tx, launches) = mpsc::unbounded_channel();
        let (file_tx, files) = mpsc::unbounded_channel();

        Arc::new(Self {
            hostname: hostname.into(),
            port,
            degree: AtomicUsize::new(degree),
            seq: AtomicU64::new(0),
            state: Mutex::new(MeshState::default()),
            seen: Mutex::new(HashSet::new()),
            send_lock: Mutex::new(()),
            resp_tx,
            resp_rx: Mutex::new(resp_rx),
            launch_resp_tx,
            launch_resp_rx: Mutex::new(launch_resp_rx),
            command_tx,
            launch_tx,
            file_tx,
            inbox: std::sync::Mutex::new(Some(Inbox {
                commands,
                launches,
                files,
            })),
        })
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn degree(&self) -> usize {
        self.degree.load(Ordering::SeqCst)
    }

    pub fn set_degree(&self, degree: usize) {
        self.degree.store(degree, Ordering::SeqCst);
    }

    /// The typed inbound channels; taken once by the dispatcher.
    pub fn take_inbox(&self) -> Option<Inbox> {
        self.inbox.lock().unwrap().take()
    }

    /// Directly-connected peers, sorted.
    pub async fn peers(&self) -> Vec<String> {
        let state = self.state.lock().await;
        let mut peers: Vec<String> = state.peers.keys().cloned().collect();
        peers.sort();
        peers
    }

    /// Every host known through flooded MSAs, excluding this one.
    pub async fn broadcast_recipients(&self) -> Vec<String> {
        let state = self.state.lock().await;
        let mut hosts: HashSet<String> = state.peers.keys().cloned().collect();
        for (host, neighbors) in &state.adjacency {
            hosts.insert(host.clone());
            hosts.extend(neighbors.iter().cloned());
        }
        hosts.remove(&self.hostname);
        let mut hosts: Vec<String> = hosts.into_iter().collect();
        hosts.sort();
        hosts
    }

    /// Accept-loop over the mesh port.
    pub fn serve(self: &Arc<Self>) -> JoinHandle<()> {
        let mesh = self.clone();
        tokio::spawn(async move {
            let listener = match TcpListener::bind(("0.0.0.0", mesh.port)).await {
                Ok(l) => l,
                Err(e) => {
                    warn!(port = mesh.port, error = %e, "mesh listen failed");
                    return;
                }
            };
            info!(host = %mesh.hostname, port = mesh.port, "mesh listening");
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        debug!(peer = %addr, "mesh connection accepted");
                        mesh.clone().spawn_peer(stream);
                    }
                    Err(e) => {
                        warn!(error = %e, "mesh accept failed");
                    }
                }
            }
        })
    }

    /// Bind a loopback listener on an ephemeral port and serve it.
    /// Returns the bound address; single-machine clusters and tests dial
    /// it directly.
    pub async fn listen_local(self: &Arc<Self>) -> Result<std::net::SocketAddr> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| Error::Transport(format!("mesh listen failed: {}", e)))?;
        let addr = listener.local_addr()?;
        let mesh = self.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => mesh.clone().spawn_peer(stream),
                    Err(_) => return,
                }
            }
        });
        Ok(addr)
    }

    /// Dial another node by hostname on the shared mesh port.
    pub async fn dial(self: &Arc<Self>, host: &str) -> Result<()> {
        self.dial_addr((host.to_string(), self.port)).await
    }

    /// Dial an explicit address.
    pub async fn dial_addr<A: tokio::net::ToSocketAddrs>(self: &Arc<Self>, addr: A) -> Result<()> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| Error::Transport(format!("mesh dial failed: {}", e)))?;
        self.clone().spawn_peer(stream);
        Ok(())
    }

    /// Periodic MSA flood plus degree maintenance.
    pub fn spawn_msa(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let mesh = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            loop {
                tick.tick().await;
                mesh.advertise().await;

                // Dial known-but-unconnected hosts up to the target degree.
                let want = mesh.degree();
                let connected = mesh.peers().await;
                if want == 0 || connected.len() >= want {
                    continue;
                }
                for candidate in mesh.broadcast_recipients().await {
                    if connected.contains(&candidate) {
                        continue;
                    }
                    if mesh.peers().await.len() >= want {
                        break;
                    }
                    if let Err(e) = mesh.dial(&candidate).await {
                        debug!(host = %candidate, error = %e, "degree dial failed");
                    }
                }
            }
        })
    }

    /// Flood this node's membership advertisement.
    pub async fn advertise(self: &Arc<Self>) {
        let msa = MsaMessage {
            host: self.hostname.clone(),
            neighbors: self.peers().await,
        };
        let _ = self.send_body(MessageType::Msa, Vec::new(), &msa).await;
    }

    /// Wrap a body in an envelope and flood it. An empty `to` reaches every
    /// host.
    pub(crate) async fn send_body<T: Serialize>(
        self: &Arc<Self>,
        msg_type: MessageType,
        to: Vec<String>,
        body: &T,
    ) -> Result<()> {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let envelope = Envelope {
            from: self.hostname.clone(),
            to,
            seq,
            body,
        };
        let frame = Frame::encode(msg_type, &envelope)?;
        self.seen
            .lock()
            .await
            .insert((self.hostname.clone(), seq));
        self.flood(&frame, None).await;
        Ok(())
    }

    /// Forward a frame to every peer except the one it arrived from.
    async fn flood(&self, frame: &Frame, except: Option<&str>) {
        let state = self.state.lock().await;
        for (host, peer) in &state.peers {
            if Some(host.as_str()) == except {
                continue;
            }
            let _ = peer.tx.send(frame.clone());
        }
    }

    /// Start the writer and reader tasks for one connection.
    fn spawn_peer(self: Arc<Self>, stream: TcpStream) {
        tokio::spawn(async move {
            let _ = stream.set_nodelay(true);
            let (mut reader, mut writer) = stream.into_split();

            let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
            let writer_task = tokio::spawn(async move {
                while let Some(frame) = rx.recv().await {
                    if write_frame(&mut writer, &frame).await.is_err() {
                        return;
                    }
                }
            });

            // Hello: both ends advertise themselves first; the first MSA on
            // the wire names the peer.
            let hello = MsaMessage {
                host: self.hostname.clone(),
                neighbors: self.peers().await,
            };
            let seq = self.seq.fetch_add(1, Ordering::SeqCst);
            if let Ok(frame) = Frame::encode(
                MessageType::Msa,
                &Envelope {
                    from: self.hostname.clone(),
                    to: Vec::new(),
                    seq,
                    body: hello,
                },
            ) {
                let _ = tx.send(frame);
            }

            let peer_name = loop {
                let frame = match read_frame(&mut reader).await {
                    Ok(f) => f,
                    Err(_) => {
                        writer_task.abort();
                        return;
                    }
                };
                if frame.msg_type != MessageType::Msa {
                    continue;
                }
                let Ok(envelope) = frame.decode::<Envelope<MsaMessage>>() else {
                    continue;
                };
                break envelope.body.host;
            };

            {
                let mut state = self.state.lock().await;
                state.peers.insert(peer_name.clone(), PeerHandle { tx });
            }
            info!(host = %self.hostname, peer = %peer_name, "mesh peer up");
            self.advertise().await;

            loop {
                let frame = match read_frame(&mut reader).await {
                    Ok(f) => f,
                    Err(_) => break,
                };
                self.handle_frame(&peer_name, frame).await;
            }

            let mut state = self.state.lock().await;
            state.peers.remove(&peer_name);
            drop(state);
            writer_task.abort();
            info!(host = %self.hostname, peer = %peer_name, "mesh peer down");
        });
    }

    /// Route one inbound frame: deliver if addressed here, re-flood for
    /// anyone else.
    async fn handle_frame(self: &Arc<Self>, from_peer: &str, frame: Frame) {
        match frame.msg_type {
            MessageType::Msa => {
                let Ok(envelope) = frame.decode::<Envelope<MsaMessage>>() else {
                    return;
                };
                if !self.mark_seen(&envelope.from, envelope.seq).await {
                    return;
                }
                {
                    let mut state = self.state.lock().await;
                    state
                        .adjacency
                        .insert(envelope.body.host.clone(), envelope.body.neighbors.clone());
                }
                self.flood(&frame, Some(from_peer)).await;
            }
            MessageType::Command => {
                self.route::<CommandMessage>(from_peer, frame, |mesh, from, body| {
                    let _ = mesh.command_tx.send((from, body));
                })
                .await;
            }
            MessageType::Response => {
                self.route::<ResponseMessage>(from_peer, frame, |mesh, _, body| {
                    let _ = mesh.resp_tx.send(body);
                })
                .await;
            }
            MessageType::RemoteLaunch => {
                self.route::<RemoteLaunchMessage>(from_peer, frame, |mesh, from, body| {
                    let _ = mesh.launch_tx.send((from, body));
                })
                .await;
            }
            MessageType::RemoteLaunchResponse => {
                self.route::<RemoteLaunchResponseMessage>(from_peer, frame, |mesh, _, body| {
                    let _ = mesh.launch_resp_tx.send(body);
                })
                .await;
            }
            MessageType::FileTransfer => {
                self.route::<FileTransferMessage>(from_peer, frame, |mesh, from, body| {
                    let _ = mesh.file_tx.send((from, body));
                })
                .await;
            }
        }
    }

    async fn route<T: DeserializeOwned>(
        self: &Arc<Self>,
        from_peer: &str,
        frame: Frame,
        deliver: impl Fn(&Mesh, String, T),
    ) {
        let Ok(envelope) = frame.decode::<Envelope<T>>() else {
            return;
        };
        if !self.mark_seen(&envelope.from, envelope.seq).await {
            return;
        }
        let for_me =
            envelope.to.is_empty() || envelope.to.iter().any(|h| h == &self.hostname);
        let for_others = envelope.to.is_empty()
            || envelope.to.iter().any(|h| h != &self.hostname);
        if for_others {
            self.flood(&frame, Some(from_peer)).await;
        }
        if for_me {
            deliver(self, envelope.from, envelope.body);
        }
    }

    /// Returns false when (from, seq) was already seen.
    async fn mark_seen(&self, from: &str, seq: u64) -> bool {
        let mut seen = self.seen.lock().await;
        if seen.len() > 100_000 {
            seen.clear();
        }
        seen.insert((from.to_string(), seq))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Bind node listeners on loopback with ephemeral ports and connect
    /// them in a line: a — b — c.
    pub(super) async fn line_of_three() -> (Arc<Mesh>, Arc<Mesh>, Arc<Mesh>) {
        let a = Mesh::new("a", 0, 0);
        let b = Mesh::new("b", 0, 0);
        let c = Mesh::new("c", 0, 0);

        let lb = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let lc = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let b_addr = lb.local_addr().unwrap();
        let c_addr = lc.local_addr().unwrap();

        for (mesh, listener) in [(b.clone(), lb), (c.clone(), lc)] {
            tokio::spawn(async move {
                loop {
                    let Ok((stream, _)) = listener.accept().await else {
                        return;
                    };
                    mesh.clone().spawn_peer(stream);
                }
            });
        }

        a.dial_addr(b_addr).await.unwrap();
        b.dial_addr(c_addr).await.unwrap();

        // Wait for both links to register.
        for _ in 0..100 {
            if a.peers().await.len() == 1 && b.peers().await.len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        (a, b, c)
    }

    #[tokio::test]
    async fn peers_identify_by_hostname() {
        let (a, b, c) = line_of_three().await;
        assert_eq!(a.peers().await, vec!["b"]);
        assert_eq!(b.peers().await, vec!["a", "c"]);
        assert_eq!(c.peers().await, vec!["b"]);
    }

    #[tokio::test]
    async fn msa_flood_builds_full_adjacency() {
        let (a, _b, c) = line_of_three().await;
        a.advertise().await;
        c.advertise().await;

        for _ in 0..100 {
            if a.broadcast_recipients().await == vec!["b", "c"] {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        // a sees c through b without a direct connection.
        assert_eq!(a.broadcast_recipients().await, vec!["b", "c"]);
        assert_eq!(c.broadcast_recipients().await, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn commands_cross_multiple_hops() {
        let (a, _b, c) = line_of_three().await;
        let mut inbox = c.take_inbox().unwrap();

        let msg = CommandMessage {
            tid: 7,
            command: vmesh_protocol::WireCommand {
                original: "vm info".into(),
                path: vec!["vm".into(), "info".into()],
                ..Default::default()
            },
        };
        a.send_body(MessageType::Command, vec!["c".to_string()], &msg)
            .await
            .unwrap();

        let (from, received) =
            tokio::time::timeout(Duration::from_secs(5), inbox.commands.recv())
                .await
                .unwrap()
                .unwrap();
        assert_eq!(from, "a");
        assert_eq!(received.tid, 7);
        assert_eq!(received.command.path, vec!["vm", "info"]);
    }
}
