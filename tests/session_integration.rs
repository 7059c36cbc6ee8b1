//! Integration tests for full retrieval sessions.
//!
//! A scripted connector replays canned agent output so each session path
//! (remote success, fallback on every failure kind) runs without an agent.
//! The last test drives a real TCP listener that answers commands.
//!
//! # Running
//!
//! ```bash
//! cargo test --test session_integration -- --nocapture
//! ```

use std::sync::{Arc, Mutex};
use std::time::Duration;

use atomata::config::ClientConfig;
use atomata::ipc::{Connector, Endpoint, Transport, TransportError};
use atomata::session::{DataSource, Session, SessionState, FALLBACK_SLOT_ID};
use pretty_assertions::assert_eq;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

/// Timeout applied to every session so a hung test fails instead of blocking.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

const SLOTS: &str = "PyON 1 slots\n[{\"id\": \"0\", \"status\": \"RUNNING\", \"description\": \"cpu:4\"}]\n---\n";
const TOPOLOGY: &str =
    "PyON 1 topology\n{\"atoms\": [[\"C\", 0, 1.7], [\"O\", 0, 1.52]], \"bonds\": [[0, 1]]}\n---\n";
const CHECKPOINT_0: &str =
    "PyON 1 checkpoint\n{\"index\": 0, \"positions\": [[0.0, 0.0, 0.0], [1.2, 0.0, 0.0]]}\n---\n";
const CHECKPOINT_1: &str =
    "PyON 1 checkpoint\n{\"index\": 1, \"positions\": [[0.0, 0.1, 0.0], [1.25, 0.0, 0.0]]}\n---\n";
const END: &str = "PyON 1 end\nNone\n---\n";

/// Transport replaying one connection's worth of agent output.
struct ScriptedTransport {
    chunks: Vec<Vec<u8>>,
    sent: Arc<Mutex<Vec<String>>>,
}

impl Transport for ScriptedTransport {
    async fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let mut sent = self.sent.lock().unwrap();
        sent.push(String::from_utf8_lossy(bytes).into_owned());
        Ok(())
    }

    async fn receive(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize, TransportError> {
        if self.chunks.is_empty() {
            return Ok(0);
        }
        let chunk = self.chunks.remove(0);
        buf[..chunk.len()].copy_from_slice(&chunk);
        Ok(chunk.len())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Connector that either refuses or hands out a [`ScriptedTransport`].
struct ScriptedConnector {
    chunks: Option<Vec<&'static str>>,
    sent: Arc<Mutex<Vec<String>>>,
}

impl ScriptedConnector {
    fn replaying(chunks: Vec<&'static str>) -> (Self, Arc<Mutex<Vec<String>>>) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                chunks: Some(chunks),
                sent: Arc::clone(&sent),
            },
            sent,
        )
    }

    fn refusing() -> Self {
        Self {
            chunks: None,
            sent: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl Connector for ScriptedConnector {
    type Transport = ScriptedTransport;

    async fn connect(
        &self,
        _endpoint: &Endpoint,
        _timeout: Duration,
    ) -> Result<ScriptedTransport, TransportError> {
        match &self.chunks {
            Some(chunks) => Ok(ScriptedTransport {
                chunks: chunks.iter().map(|c| c.as_bytes().to_vec()).collect(),
                sent: Arc::clone(&self.sent),
            }),
            None => Err(TransportError::ConnectionFailed(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "connection refused",
            ))),
        }
    }
}

#[tokio::test]
async fn test_remote_trajectory_end_to_end() {
    let (connector, sent) = ScriptedConnector::replaying(vec![
        "Welcome to the Folding@home Client command server.\n> ",
        SLOTS,
        TOPOLOGY,
        CHECKPOINT_0,
        CHECKPOINT_1,
        END,
    ]);
    let mut session = Session::new(ClientConfig::default(), connector);

    let trajectories = tokio::time::timeout(TEST_TIMEOUT, session.retrieve())
        .await
        .expect("Session timed out")
        .unwrap();

    assert_eq!(trajectories.len(), 1);
    let trajectory = &trajectories[0];
    assert_eq!(trajectory.slot_id, "0");
    assert_eq!(trajectory.len(), 2);

    let indices: Vec<u64> = trajectory.snapshots().iter().map(|s| s.index).collect();
    assert_eq!(indices, vec![0, 1]);
    for snapshot in trajectory.snapshots() {
        assert_eq!(snapshot.atoms.len(), 2);
        assert_eq!(snapshot.bonds.len(), 1);
    }
    assert_eq!(trajectory.snapshots()[1].atoms[1].position, [1.25, 0.0, 0.0]);

    assert_eq!(session.source(), Some(DataSource::Remote));
    assert_eq!(
        session.history(),
        &[
            SessionState::Idle,
            SessionState::Connecting,
            SessionState::AwaitingSlotList,
            SessionState::AwaitingPerSlotData,
            SessionState::Complete,
        ]
    );
    assert_eq!(
        *sent.lock().unwrap(),
        vec!["slot-info\n".to_string(), "trajectory 0\n".to_string()]
    );
}

#[tokio::test]
async fn test_password_is_sent_first() {
    let (connector, sent) =
        ScriptedConnector::replaying(vec![SLOTS, TOPOLOGY, CHECKPOINT_0, END]);
    let config = ClientConfig {
        password: Some("hunter2".to_string()),
        ..ClientConfig::default()
    };
    let mut session = Session::new(config, connector);
    session.retrieve().await.unwrap();

    assert_eq!(
        *sent.lock().unwrap(),
        vec![
            "auth hunter2\n".to_string(),
            "slot-info\n".to_string(),
            "trajectory 0\n".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_unreachable_agent_uses_demo_data() {
    let mut session = Session::new(ClientConfig::default(), ScriptedConnector::refusing());
    let trajectories = session.retrieve().await.unwrap();

    assert_eq!(trajectories.len(), 1);
    assert_eq!(trajectories[0].slot_id, FALLBACK_SLOT_ID);
    assert!(!trajectories[0].is_empty());
    assert_eq!(session.state(), SessionState::Fallback);
    assert_eq!(session.source(), Some(DataSource::Fallback));
}

#[tokio::test]
async fn test_malformed_slot_listing_uses_demo_data() {
    let (connector, _) = ScriptedConnector::replaying(vec![
        "PyON 1 slots\n[{\"id\": \"0\", \"status\": }]\n---\n",
    ]);
    let mut session = Session::new(ClientConfig::default(), connector);
    let trajectories = session.retrieve().await.unwrap();

    assert_eq!(trajectories.len(), 1);
    assert_eq!(trajectories[0].slot_id, FALLBACK_SLOT_ID);
    assert_eq!(
        session.history(),
        &[
            SessionState::Idle,
            SessionState::Connecting,
            SessionState::AwaitingSlotList,
            SessionState::Fallback,
        ]
    );
}

#[tokio::test]
async fn test_remote_stream_ending_in_bare_header_is_kept() {
    let (connector, _) = ScriptedConnector::replaying(vec![
        SLOTS,
        TOPOLOGY,
        CHECKPOINT_0,
        "PyON 1 end\n",
    ]);
    let mut session = Session::new(ClientConfig::default(), connector);
    let trajectories = session.retrieve().await.unwrap();

    assert_eq!(session.source(), Some(DataSource::Remote));
    assert_eq!(session.state(), SessionState::Complete);
    assert_eq!(trajectories[0].slot_id, "0");
    assert_eq!(trajectories[0].len(), 1);
}

#[tokio::test]
async fn test_empty_slot_list_uses_demo_data() {
    let (connector, sent) = ScriptedConnector::replaying(vec!["PyON 1 slots\n[]\n---\n"]);
    let mut session = Session::new(ClientConfig::default(), connector);
    let trajectories = session.retrieve().await.unwrap();

    assert_eq!(trajectories.len(), 1);
    assert_eq!(trajectories[0].slot_id, FALLBACK_SLOT_ID);
    assert_eq!(
        session.history(),
        &[
            SessionState::Idle,
            SessionState::Connecting,
            SessionState::AwaitingSlotList,
            SessionState::Fallback,
        ]
    );
    assert_eq!(*sent.lock().unwrap(), vec!["slot-info\n".to_string()]);
}

#[tokio::test]
async fn test_only_failed_slots_uses_demo_data() {
    let (connector, sent) = ScriptedConnector::replaying(vec![
        "PyON 1 slots\n[{\"id\": \"0\", \"status\": \"FAILED\"}]\n---\n",
    ]);
    let mut session = Session::new(ClientConfig::default(), connector);
    let trajectories = session.retrieve().await.unwrap();

    assert_eq!(trajectories[0].slot_id, FALLBACK_SLOT_ID);
    assert_eq!(*sent.lock().unwrap(), vec!["slot-info\n".to_string()]);
}

#[tokio::test]
async fn test_out_of_order_checkpoint_uses_demo_data() {
    let (connector, _) = ScriptedConnector::replaying(vec![
        SLOTS,
        TOPOLOGY,
        CHECKPOINT_1,
        CHECKPOINT_0,
        END,
    ]);
    let mut session = Session::new(ClientConfig::default(), connector);
    let trajectories = session.retrieve().await.unwrap();

    assert_eq!(trajectories[0].slot_id, FALLBACK_SLOT_ID);
    assert_eq!(session.source(), Some(DataSource::Fallback));
}

#[tokio::test]
async fn test_agent_closing_without_snapshots_is_fatal_when_fallback_disabled() {
    let (connector, _) = ScriptedConnector::replaying(vec![SLOTS, TOPOLOGY]);
    let config = ClientConfig {
        allow_fallback: false,
        ..ClientConfig::default()
    };
    let mut session = Session::new(config, connector);
    let err = session.retrieve().await.unwrap_err();
    assert!(err.to_string().contains("sent no snapshots"), "{}", err);
}

/// Serve one connection, answering commands the way the agent does.
async fn serve_agent(listener: TcpListener) {
    let (stream, _) = listener.accept().await.unwrap();
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    write_half
        .write_all(b"Welcome to the Folding@home Client command server.\n> ")
        .await
        .unwrap();

    while let Ok(Some(line)) = lines.next_line().await {
        let reply = match line.trim() {
            "slot-info" => SLOTS.to_string(),
            "trajectory 0" => format!("{}{}{}{}", TOPOLOGY, CHECKPOINT_0, CHECKPOINT_1, END),
            _ => "\nERROR: unknown command\n> ".to_string(),
        };
        if write_half.write_all(reply.as_bytes()).await.is_err() {
            break;
        }
    }
}

#[tokio::test]
async fn test_tcp_agent_end_to_end() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = tokio::spawn(serve_agent(listener));

    let config = ClientConfig {
        connect: Endpoint::new("127.0.0.1", port),
        allow_fallback: false,
        ..ClientConfig::default()
    };
    let mut session = Session::tcp(config);
    let trajectories = tokio::time::timeout(TEST_TIMEOUT, session.retrieve())
        .await
        .expect("Session timed out")
        .unwrap();

    assert_eq!(trajectories.len(), 1);
    assert_eq!(trajectories[0].len(), 2);
    assert_eq!(trajectories[0].topology().elements, vec!["C", "O"]);
    assert_eq!(session.source(), Some(DataSource::Remote));

    tokio::time::timeout(TEST_TIMEOUT, server)
        .await
        .expect("Server did not finish")
        .unwrap();
}
