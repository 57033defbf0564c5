//! Command fan-out with transaction-id correlation.
//!
//! A send assigns a random 31-bit TID, floods the command, and hands the
//! caller a channel that later yields exactly one batch: one response per
//! recipient, absent hosts filled with a timeout error. The mesh command
//! lock keeps a single send outstanding so stale responses cannot cross
//! TIDs; mismatched TIDs encountered mid-collection go back on the channel
//! for whichever waiter owns them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use vmesh_protocol::{
    CommandMessage, MessageType, RemoteLaunchMessage, RemoteLaunchResponseMessage,
    ResponseMessage, WireCommand, WireQueuedVms, WireResponse,
};

use super::Mesh;
use crate::{Error, Result};

/// A fresh 31-bit transaction id.
pub fn new_tid() -> i32 {
    rand::thread_rng().gen_range(0..i32::MAX)
}

impl Mesh {
    /// Send `command` to `recipients` and return the response channel.
    ///
    /// Non-blocking: the channel arrives immediately and receives one
    /// `Vec<WireResponse>` batch (then closes). Zero recipients close the
    /// channel without a batch. `timeout` of `Duration::MAX` waits forever.
    pub fn send(
        self: &Arc<Self>,
        recipients: Vec<String>,
        command: WireCommand,
        timeout: Duration,
    ) -> mpsc::UnboundedReceiver<Vec<WireResponse>> {
        let (batch_tx, batch_rx) = mpsc::unbounded_channel();
        if recipients.is_empty() {
            return batch_rx;
        }

        let mesh = self.clone();
        tokio::spawn(async move {
            let _guard = mesh.send_lock.lock().await;
            let tid = new_tid();
            debug!(tid, recipients = ?recipients, "mesh send");

            let msg = CommandMessage { tid, command };
            if let Err(e) = mesh
                .send_body(MessageType::Command, recipients.clone(), &msg)
                .await
            {
                warn!(tid, error = %e, "mesh send dispatch failed");
            }

            let mut collected: HashMap<String, WireResponse> = HashMap::new();
            let mut strays: Vec<ResponseMessage> = Vec::new();
            let deadline = tokio::time::Instant::now()
                + if timeout == Duration::MAX {
                    Duration::from_secs(u32::MAX as u64)
                } else {
                    timeout
                };

            {
                let mut resp_rx = mesh.resp_rx.lock().await;
                while collected.len() < recipients.len() {
                    let next = tokio::time::timeout_at(deadline, resp_rx.recv()).await;
                    match next {
                        Ok(Some(resp)) if resp.tid == tid => {
                            for response in resp.responses {
                                if recipients.contains(&response.host) {
                                    collected.insert(response.host.clone(), response);
                                }
                            }
                        }
                        Ok(Some(stray)) => strays.push(stray),
                        Ok(None) => break,
                        Err(_) => break,
                    }
                }
            }
            // Another waiter's responses go back on the channel.
            for stray in strays {
                let _ = mesh.resp_tx.send(stray);
            }

            let batch: Vec<WireResponse> = recipients
                .iter()
                .map(|host| {
                    collected
                        .remove(host)
                        .unwrap_or_else(|| WireResponse::error(host.clone(), "timed out"))
                })
                .collect();
            let _ = batch_tx.send(batch);
            // batch_tx drops here, closing the channel after one batch.
        });

        batch_rx
    }

    /// Answer a command received off the mesh.
    pub async fn reply(self: &Arc<Self>, to: &str, tid: i32, response: WireResponse) {
        let msg = ResponseMessage {
            tid,
            responses: vec![response],
        };
        if let Err(e) = self
            .send_body(MessageType::Response, vec![to.to_string()], &msg)
            .await
        {
            warn!(tid, to, error = %e, "mesh reply failed");
        }
    }

    /// Ship a batch of queued VMs to `host` for launch; returns the remote
    /// errors (empty on success).
    ///
    /// Error values cannot cross the encoder, so the remote side flattens
    /// them to strings; callers join them with newline.
    pub async fn remote_launch(
        self: &Arc<Self>,
        host: &str,
        namespace: &str,
        queued: Vec<WireQueuedVms>,
        timeout: Duration,
    ) -> Result<Vec<String>> {
        let _guard = self.send_lock.lock().await;
        let tid = new_tid();
        let msg = RemoteLaunchMessage {
            tid,
            namespace: namespace.to_string(),
            queued,
        };
        self.send_body(MessageType::RemoteLaunch, vec![host.to_string()], &msg)
            .await?;

        let deadline = tokio::time::Instant::now() + timeout;
        let mut strays: Vec<RemoteLaunchResponseMessage> = Vec::new();
        let result = {
            let mut rx = self.launch_resp_rx.lock().await;
            loop {
                match tokio::time::timeout_at(deadline, rx.recv()).await {
                    Ok(Some(resp)) if resp.tid == tid => break Ok(resp.errors),
                    Ok(Some(stray)) => strays.push(stray),
                    Ok(None) => {
                        break Err(Error::Transport("mesh response channel closed".into()))
                    }
                    Err(_) => {
                        break Err(Error::Transport(format!(
                            "remote launch on {} timed out",
                            host
                        )))
                    }
                }
            }
        };
        for stray in strays {
            let _ = self.launch_resp_tx.send(stray);
        }
        result
    }

    /// Acknowledge a remote-launch request with the launch outcome.
    pub async fn remote_launch_reply(self: &Arc<Self>, to: &str, tid: i32, errors: Vec<String>) {
        let msg = RemoteLaunchResponseMessage { tid, errors };
        if let Err(e) = self
            .send_body(MessageType::RemoteLaunchResponse, vec![to.to_string()], &msg)
            .await
        {
            warn!(tid, to, error = %e, "remote launch reply failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::tests::line_of_three;

    fn command(text: &str) -> WireCommand {
        WireCommand {
            original: text.to_string(),
            path: text.split_whitespace().map(String::from).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn tids_are_31_bit() {
        for _ in 0..1000 {
            let tid = new_tid();
            assert!(tid >= 0);
        }
    }

    #[tokio::test]
    async fn zero_recipients_close_immediately() {
        let mesh = Mesh::new("solo", 0, 0);
        let mut rx = mesh.send(Vec::new(), command("vm info"), Duration::from_secs(1));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn responses_pair_with_timeouts() {
        let (a, b, _c) = line_of_three().await;

        // b answers every command it sees; "dead" never will.
        let mut b_inbox = b.take_inbox().unwrap();
        let b2 = b.clone();
        tokio::spawn(async move {
            while let Some((from, msg)) = b_inbox.commands.recv().await {
                let response = WireResponse::text("b", format!("ran {}", msg.command.original));
                b2.reply(&from, msg.tid, response).await;
            }
        });

        let mut rx = a.send(
            vec!["b".to_string(), "dead".to_string()],
            command("vm info"),
            Duration::from_millis(300),
        );
        let batch = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].host, "b");
        assert_eq!(batch[0].response, "ran vm info");
        assert!(batch[0].error.is_empty());
        assert_eq!(batch[1].host, "dead");
        assert_eq!(batch[1].error, "timed out");

        // One batch only, then closed.
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn remote_launch_round_trip() {
        let (a, _b, c) = line_of_three().await;

        let mut c_inbox = c.take_inbox().unwrap();
        let c2 = c.clone();
        tokio::spawn(async move {
            while let Some((from, msg)) = c_inbox.launches.recv().await {
                assert_eq!(msg.namespace, "testing");
                let names = &msg.queued[0].names;
                let errors = vec![format!("no disk for {}", names[0])];
                c2.remote_launch_reply(&from, msg.tid, errors).await;
            }
        });

        let queued = vec![WireQueuedVms {
            names: vec!["w0".to_string()],
            config: serde_json::json!({"memory": 512}),
        }];
        let errors = a
            .remote_launch("c", "testing", queued, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(errors, vec!["no disk for w0"]);
    }

    #[tokio::test]
    async fn remote_launch_timeout_is_transport_error() {
        let (a, _b, _c) = line_of_three().await;
        let err = a
            .remote_launch("ghost", "ns", Vec::new(), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }
}
