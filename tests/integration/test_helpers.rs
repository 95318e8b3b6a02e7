//! Shared fixtures for integration tests.
//!
//! A [`Remote`] plays the training process on the far end of an in-memory
//! duplex pipe attached to a real [`SessionManager`].

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadHalf, WriteHalf};
use tokio_util::sync::CancellationToken;

use tensorwatch::config::GlobalConfig;
use tensorwatch::models::command::{AckStatus, CommandId};
use tensorwatch::models::graph::{NodeDef, NodeKind};
use tensorwatch::models::session::Device;
use tensorwatch::models::tensor::DType;
use tensorwatch::orchestrator::control::SessionHandle;
use tensorwatch::orchestrator::session::SessionSnapshot;
use tensorwatch::orchestrator::session_manager::SessionManager;
use tensorwatch::stream::frames::{InboundFrame, OutboundFrame, TensorChunk};

pub const RECV_TIMEOUT: Duration = Duration::from_secs(2);

/// Nodes every test graph declares on `dev0`, in order.
pub const NODES: [&str; 3] = ["conv1/weight", "conv1/bias", "fc/weight"];

/// Configuration with generous timeouts unless a test narrows them.
pub fn test_config() -> GlobalConfig {
    let mut config = GlobalConfig::default();
    config.timeouts.heartbeat_timeout_ms = 30_000;
    config.timeouts.command_ack_timeout_ms = 5_000;
    config
}

pub fn manager(config: GlobalConfig) -> Arc<SessionManager> {
    Arc::new(SessionManager::new(Arc::new(config), CancellationToken::new()))
}

/// Far end of a session connection.
pub struct Remote {
    lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
    writer: WriteHalf<DuplexStream>,
}

impl Remote {
    pub async fn send(&mut self, frame: &InboundFrame) {
        let line = serde_json::to_string(frame).expect("serialize frame");
        self.send_raw(&line).await;
    }

    pub async fn send_raw(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.expect("write");
        self.writer.write_all(b"\n").await.expect("write newline");
        self.writer.flush().await.expect("flush");
    }

    pub async fn recv(&mut self) -> OutboundFrame {
        let line = tokio::time::timeout(RECV_TIMEOUT, self.lines.next_line())
            .await
            .expect("frame before timeout")
            .expect("read")
            .expect("stream open");
        serde_json::from_str(&line).expect("outbound frame")
    }

    /// Receive the next control command; returns its id.
    pub async fn recv_command_id(&mut self) -> CommandId {
        match self.recv().await {
            OutboundFrame::ControlCommand { command_id, .. }
            | OutboundFrame::WatchpointSet {
                command_id: Some(command_id),
                ..
            }
            | OutboundFrame::WatchpointClear {
                command_id: Some(command_id),
                ..
            } => command_id,
            other => panic!("expected a tracked command, got {other:?}"),
        }
    }

    pub async fn ack(&mut self, command_id: CommandId) {
        self.send(&InboundFrame::CommandAck {
            command_id,
            status: AckStatus::Ok,
            message: None,
        })
        .await;
    }

    /// Announce `dev0` and its graph; returns the `Welcome` contents.
    pub async fn handshake(&mut self, reconnect_token: Option<String>) -> (String, String) {
        self.send(&InboundFrame::Metadata {
            devices: vec![Device {
                device_id: "dev0".into(),
                rank: 0,
            }],
            graph_version: 1,
            reconnect_token,
        })
        .await;
        let welcome = match self.recv().await {
            OutboundFrame::Welcome {
                session_id,
                reconnect_token,
            } => (session_id, reconnect_token),
            other => panic!("expected welcome, got {other:?}"),
        };
        self.send(&InboundFrame::GraphDef {
            device_id: "dev0".into(),
            nodes: NODES
                .iter()
                .map(|name| NodeDef {
                    name: (*name).to_owned(),
                    kind: NodeKind::Parameter,
                    op_type: "Variable".into(),
                    inputs: vec![],
                    outputs: vec![],
                })
                .collect(),
            incremental: false,
        })
        .await;
        welcome
    }

    pub async fn tensor(&mut self, node: &str, step: u64, values: &[f32]) {
        self.send(&tensor_frame(node, step, values)).await;
    }

    pub async fn step_end(&mut self, step: u64) {
        self.send(&InboundFrame::StepEnd { step }).await;
    }

    pub async fn heartbeat(&mut self, step: u64) {
        self.send(&InboundFrame::Heartbeat {
            step,
            device_id: "dev0".into(),
        })
        .await;
    }
}

pub fn tensor_frame(node: &str, step: u64, values: &[f32]) -> InboundFrame {
    InboundFrame::TensorChunk(TensorChunk {
        device_id: Some("dev0".into()),
        node: node.into(),
        output_index: 0,
        step,
        seq: 0,
        total_seqs: 1,
        dtype: DType::F32,
        shape: vec![values.len() as u64],
        bytes: Bytes::from(values.iter().flat_map(|v| v.to_le_bytes()).collect::<Vec<u8>>()),
    })
}

/// Attach a new session to `manager` over an in-memory pipe.
pub fn connect(manager: &SessionManager) -> (Arc<SessionHandle>, Remote) {
    let (local, remote) = tokio::io::duplex(256 * 1024);
    let (source, sink) = tokio::io::split(local);
    let handle = manager.attach(source, sink).expect("attach");
    let (read, writer) = tokio::io::split(remote);
    let remote = Remote {
        lines: BufReader::new(read).lines(),
        writer,
    };
    (handle, remote)
}

/// Connect and complete the handshake; the session is `Running` on return.
pub async fn connect_running(manager: &SessionManager) -> (Arc<SessionHandle>, Remote) {
    let (handle, mut remote) = connect(manager);
    remote.handshake(None).await;
    wait_until(&handle, |s| {
        s.status.state == tensorwatch::models::session::SessionState::Running
    })
    .await;
    (handle, remote)
}

/// Poll published snapshots until `pred` holds.
pub async fn wait_until<F>(handle: &SessionHandle, pred: F) -> Arc<SessionSnapshot>
where
    F: Fn(&SessionSnapshot) -> bool,
{
    tokio::time::timeout(RECV_TIMEOUT, async {
        loop {
            let snapshot = handle.snapshot();
            if pred(&snapshot) {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition reached before timeout")
}
