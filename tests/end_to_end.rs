//! Drives a daemon over in-memory pipes the way a ground peer would.

use bytes::{BufMut, BytesMut};
use cnc_daemon::command::{Action, Command};
use cnc_daemon::config::Config;
use cnc_daemon::daemon::Daemon;
use cnc_daemon::dispatch::DispatchError;
use cnc_daemon::frame::{self, Frame, FrameDecoder};
use cnc_daemon::net::{PacketHeader, Priority};
use cnc_daemon::plugin::{HandlerSet, StaticLoader};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

const NODE: u8 = 1;
const PEER: u8 = 2;
const PORT: u8 = 10;
const MTU: usize = 250;

/// The ground side of the link.
struct Peer {
    tx: DuplexStream,
    rx: DuplexStream,
    decoder: FrameDecoder,
    buffer: BytesMut,
}

impl Peer {
    async fn send_raw(&mut self, bytes: &[u8]) {
        self.tx.write_all(bytes).await.unwrap();
        self.tx.flush().await.unwrap();
    }

    async fn send_payload(&mut self, sport: u8, data: &[u8]) {
        let header = PacketHeader {
            priority: Priority::Norm,
            src: PEER,
            dst: NODE,
            dport: PORT,
            sport,
            flags: 0,
        };
        let mut payload = BytesMut::new();
        payload.put_u32(header.pack());
        payload.put_slice(data);
        let encoded = frame::encode(&payload, MTU).unwrap();
        self.send_raw(&encoded).await;
    }

    async fn send_command(&mut self, sport: u8, command: &Command) {
        self.send_payload(sport, &command.encode()).await;
    }

    async fn next_frame(&mut self, wait: Duration) -> Option<Frame> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if let Some(frame) = self.decoder.decode(&mut self.buffer).unwrap() {
                return Some(frame);
            }
            match tokio::time::timeout_at(deadline, self.rx.read_buf(&mut self.buffer)).await {
                Ok(Ok(n)) if n > 0 => {}
                _ => return None,
            }
        }
    }

    /// Wait for an acknowledgment and return its header and data.
    async fn ack(&mut self) -> (PacketHeader, Vec<u8>) {
        let frame = self
            .next_frame(Duration::from_secs(2))
            .await
            .expect("no acknowledgment");
        let id = u32::from_be_bytes([
            frame.payload[0],
            frame.payload[1],
            frame.payload[2],
            frame.payload[3],
        ]);
        (PacketHeader::unpack(id), frame.payload[4..].to_vec())
    }
}

struct Fixture {
    daemon: Daemon,
    peer: Peer,
    invocations: Arc<AtomicUsize>,
}

fn config() -> Config {
    Config {
        address: NODE,
        port: PORT,
        peer_address: PEER,
        peer_port: PORT,
        mtu: MTU,
        timeout: Duration::from_millis(200),
        ..Config::default()
    }
}

fn fixture() -> Fixture {
    let invocations = Arc::new(AtomicUsize::new(0));
    let (execute, status) = (Arc::clone(&invocations), Arc::clone(&invocations));
    let slow = Arc::clone(&invocations);

    let loader = StaticLoader::new()
        .register(
            "status_module",
            HandlerSet::new()
                .with(Action::Execute, move || {
                    execute.fetch_add(1, Ordering::SeqCst);
                })
                .with(Action::Status, move || {
                    status.fetch_add(1, Ordering::SeqCst);
                }),
        )
        .register(
            "slow_module",
            HandlerSet::new().with(Action::Execute, move || {
                std::thread::sleep(Duration::from_millis(150));
                slow.fetch_add(1, Ordering::SeqCst);
            }),
        );

    let (peer_tx, node_rx) = tokio::io::duplex(4096);
    let (node_tx, peer_rx) = tokio::io::duplex(4096);
    let daemon = Daemon::with_transport(&config(), node_rx, node_tx, Box::new(loader)).unwrap();

    Fixture {
        daemon,
        peer: Peer {
            tx: peer_tx,
            rx: peer_rx,
            decoder: FrameDecoder::new(MTU),
            buffer: BytesMut::new(),
        },
        invocations,
    }
}

#[tokio::test]
async fn test_execute_invokes_plugin_and_acks_success() {
    let mut f = fixture();

    f.peer
        .send_command(40, &Command::new(Action::Execute, "status_module"))
        .await;
    assert_eq!(f.daemon.run_once().await, Some(Ok(())));
    assert_eq!(f.invocations.load(Ordering::SeqCst), 1);

    let (header, data) = f.peer.ack().await;
    assert_eq!(data, b"Return MSG");
    assert_eq!(header.src, NODE);
    assert_eq!(header.dst, PEER);
    assert_eq!(header.dport, PORT);
    assert_eq!(header.priority, Priority::Norm);

    assert_eq!(f.daemon.registry().loaded(), vec!["status_module".to_string()]);
    f.daemon.shutdown().await;
}

#[tokio::test]
async fn test_missing_module_acks_failure() {
    let mut f = fixture();

    f.peer
        .send_command(41, &Command::new(Action::Help, "missing_module"))
        .await;
    let outcome = f.daemon.run_once().await.unwrap();
    assert!(matches!(outcome, Err(DispatchError::LoadFailed { .. })));
    assert_eq!(f.invocations.load(Ordering::SeqCst), 0);

    let (_, data) = f.peer.ack().await;
    assert_eq!(data, b"Error MSG");
    f.daemon.shutdown().await;
}

#[tokio::test]
async fn test_unknown_action_never_loads() {
    let mut f = fixture();

    f.peer.send_payload(42, b"\x09status_module\0").await;
    assert_eq!(
        f.daemon.run_once().await,
        Some(Err(DispatchError::UnknownAction(9)))
    );
    assert!(f.daemon.registry().loaded().is_empty());

    let (_, data) = f.peer.ack().await;
    assert_eq!(data, b"Error MSG");
    f.daemon.shutdown().await;
}

#[tokio::test]
async fn test_oversized_frame_is_rejected() {
    let mut f = fixture();

    let mut oversized = BytesMut::new();
    oversized.put_u32_ne(300);
    oversized.put_u16_ne(0);
    oversized.put_bytes(0xAB, 300);
    f.peer.send_raw(&oversized).await;

    assert!(f.daemon.run_once().await.is_none());
    assert!(f.peer.next_frame(Duration::from_millis(100)).await.is_none());
    assert_eq!(f.invocations.load(Ordering::SeqCst), 0);

    // Link stays usable after the rejected frame
    f.peer
        .send_command(43, &Command::new(Action::Status, "status_module"))
        .await;
    assert_eq!(f.daemon.run_once().await, Some(Ok(())));
    assert_eq!(f.invocations.load(Ordering::SeqCst), 1);
    f.daemon.shutdown().await;
}

#[tokio::test]
async fn test_commands_are_handled_in_order_while_link_receives() {
    let mut f = fixture();

    // Second command arrives while the first handler is still running
    f.peer
        .send_command(44, &Command::new(Action::Execute, "slow_module"))
        .await;
    f.peer
        .send_command(45, &Command::new(Action::Version, "status_module"))
        .await;

    assert_eq!(f.daemon.run_once().await, Some(Ok(())));
    assert!(matches!(
        f.daemon.run_once().await,
        Some(Err(DispatchError::SymbolNotFound { .. }))
    ));

    let (_, first) = f.peer.ack().await;
    let (_, second) = f.peer.ack().await;
    assert_eq!(first, b"Return MSG");
    assert_eq!(second, b"Error MSG");
    assert_eq!(f.invocations.load(Ordering::SeqCst), 1);
    f.daemon.shutdown().await;
}

#[tokio::test]
async fn test_ack_sent_while_inbound_traffic_holds_buffers() {
    let Fixture {
        mut daemon,
        mut peer,
        invocations,
    } = fixture();

    peer.send_command(50, &Command::new(Action::Execute, "slow_module"))
        .await;

    // Traffic arriving while the handler runs piles up on connections
    // nobody reads
    let flood = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        for sport in 51..55 {
            for _ in 0..3 {
                peer.send_payload(sport, b"noise").await;
            }
        }
    };
    let (outcome, ()) = tokio::join!(daemon.run_once(), flood);
    assert_eq!(outcome, Some(Ok(())));
    assert_eq!(invocations.load(Ordering::SeqCst), 1);

    let pool = daemon.stack().pool();
    assert_eq!(pool.available(), pool.reserved());

    let (_, data) = peer.ack().await;
    assert_eq!(data, b"Return MSG");
    daemon.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_unloads_plugins() {
    let mut f = fixture();

    f.peer
        .send_command(46, &Command::new(Action::Execute, "status_module"))
        .await;
    assert_eq!(f.daemon.run_once().await, Some(Ok(())));

    let registry = Arc::clone(f.daemon.registry());
    f.daemon.shutdown().await;
    assert!(registry.loaded().is_empty());
}
