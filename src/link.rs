//! Link adapter between the raw pipe transport and the packet stack.
//!
//! Outbound, the stack calls [`LinkAdapter::transmit`] (through the
//! [`Interface`] trait) and the packet is framed and written in one go.
//! Inbound, a [`ReceivePump`] task reads the transport, decodes frames and
//! injects the packets they carry into the stack.

use crate::frame::{self, Frame, FrameDecoder, HEADER_LEN};
use crate::net::packet::HEADER_SIZE;
use crate::net::{Interface, Packet, Stack, StackError};
use async_trait::async_trait;
use bytes::BytesMut;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Consecutive read errors tolerated before the pump gives up on the
/// transport.
const MAX_READ_ERRORS: usize = 3;

/// Link traffic counters.
#[derive(Debug, Default)]
pub struct LinkStats {
    frames_tx: AtomicU64,
    frames_rx: AtomicU64,
    dropped_tx: AtomicU64,
    dropped_rx: AtomicU64,
    partial_tx: AtomicU64,
}

impl LinkStats {
    pub fn frames_tx(&self) -> u64 {
        self.frames_tx.load(Ordering::Relaxed)
    }

    pub fn frames_rx(&self) -> u64 {
        self.frames_rx.load(Ordering::Relaxed)
    }

    pub fn dropped_tx(&self) -> u64 {
        self.dropped_tx.load(Ordering::Relaxed)
    }

    pub fn dropped_rx(&self) -> u64 {
        self.dropped_rx.load(Ordering::Relaxed)
    }

    /// Frames abandoned after part of them reached the transport.
    pub fn partial_tx(&self) -> u64 {
        self.partial_tx.load(Ordering::Relaxed)
    }
}

/// Framed link over a byte-stream transport.
///
/// Owns the transport's write half; the read half is owned by the
/// [`ReceivePump`].
pub struct LinkAdapter<W> {
    name: String,
    mtu: usize,
    writer: Mutex<W>,
    stats: LinkStats,
}

impl<W> LinkAdapter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    /// Create an adapter writing frames of at most `mtu` payload bytes.
    pub fn new(name: impl Into<String>, writer: W, mtu: usize) -> Self {
        Self {
            name: name.into(),
            mtu,
            writer: Mutex::new(writer),
            stats: LinkStats::default(),
        }
    }

    pub fn stats(&self) -> &LinkStats {
        &self.stats
    }

    async fn write_packet(&self, packet: &Packet, timeout: Duration) -> Result<(), StackError> {
        let mut payload = BytesMut::with_capacity(packet.wire_len());
        packet.write_wire(&mut payload);
        let encoded = frame::encode(&payload, self.mtu)?;

        let mut written = 0;
        let write = async {
            let mut writer = self.writer.lock().await;
            while written < encoded.len() {
                let n = writer.write(&encoded[written..]).await?;
                if n == 0 {
                    return Err(std::io::ErrorKind::WriteZero.into());
                }
                written += n;
            }
            writer.flush().await
        };
        let result = tokio::time::timeout(timeout, write).await;

        match result {
            Ok(result) => result.map_err(StackError::from),
            Err(_) if written > 0 => {
                // The peer now holds a truncated frame and loses sync
                error!(
                    interface = %self.name,
                    written,
                    len = encoded.len(),
                    "Frame write timed out midway, link framing broken"
                );
                self.stats.partial_tx.fetch_add(1, Ordering::Relaxed);
                Err(StackError::Timeout)
            }
            Err(_) => Err(StackError::Timeout),
        }
    }

    /// Turn one decoded frame into a packet and hand it to the stack.
    fn deliver(&self, stack: &Arc<Stack>, frame: Frame) {
        let size = frame.len().saturating_sub(HEADER_SIZE);
        let Some(mut packet) = stack.get_inbound_buffer(size) else {
            warn!(interface = %self.name, len = frame.len(), "No packet buffer, frame dropped");
            self.stats.dropped_rx.fetch_add(1, Ordering::Relaxed);
            return;
        };

        if !packet.read_wire(&frame.payload) {
            warn!(interface = %self.name, len = frame.len(), "Malformed packet, frame dropped");
            self.stats.dropped_rx.fetch_add(1, Ordering::Relaxed);
            return;
        }

        trace!(interface = %self.name, header = ?packet.header(), "Frame received");
        self.stats.frames_rx.fetch_add(1, Ordering::Relaxed);
        stack.ingress(packet, &self.name);
    }
}

#[async_trait]
impl<W> Interface for LinkAdapter<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn mtu(&self) -> usize {
        self.mtu
    }

    async fn transmit(&self, packet: Packet, timeout: Duration) -> Result<(), StackError> {
        let result = self.write_packet(&packet, timeout).await;
        // Buffer goes back to the pool whatever the outcome
        drop(packet);

        match &result {
            Ok(()) => {
                self.stats.frames_tx.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                warn!(interface = %self.name, error = %e, "Failed to write frame");
                self.stats.dropped_tx.fetch_add(1, Ordering::Relaxed);
            }
        }
        result
    }
}

/// Why the receive pump stopped.
#[derive(Debug)]
pub enum PumpExit {
    /// Shutdown was requested.
    Cancelled,
    /// The transport reported end of stream.
    Closed,
    /// The transport kept failing.
    Failed(std::io::Error),
    /// The pump task itself panicked or was aborted.
    Aborted,
}

/// Background task feeding inbound frames into the stack.
pub struct ReceivePump {
    cancel: CancellationToken,
    handle: JoinHandle<PumpExit>,
}

impl ReceivePump {
    /// Start pumping `reader` into `stack` through `link`.
    pub fn spawn<R, W>(reader: R, link: Arc<LinkAdapter<W>>, stack: Arc<Stack>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move { pump(reader, link, stack, token).await });

        Self { cancel, handle }
    }

    /// True once the pump has stopped on its own or after cancellation.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Request the pump to stop and wait for it.
    pub async fn shutdown(self) -> PumpExit {
        self.cancel.cancel();
        match self.handle.await {
            Ok(exit) => exit,
            Err(e) => {
                error!(error = %e, "Receive pump task failed");
                PumpExit::Aborted
            }
        }
    }
}

async fn pump<R, W>(
    mut reader: R,
    link: Arc<LinkAdapter<W>>,
    stack: Arc<Stack>,
    cancel: CancellationToken,
) -> PumpExit
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send,
{
    let mut decoder = FrameDecoder::new(link.mtu);
    let mut buffer = BytesMut::with_capacity(HEADER_LEN + link.mtu);
    let mut read_errors = 0;

    info!(interface = %link.name, mtu = link.mtu, "Receive pump started");

    loop {
        loop {
            match decoder.decode(&mut buffer) {
                Ok(Some(frame)) => link.deliver(&stack, frame),
                Ok(None) => break,
                Err(e) => {
                    warn!(interface = %link.name, error = %e, "Rejected inbound frame");
                    link.stats.dropped_rx.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        let read = tokio::select! {
            _ = cancel.cancelled() => {
                debug!(interface = %link.name, "Receive pump cancelled");
                return PumpExit::Cancelled;
            }
            read = reader.read_buf(&mut buffer) => read,
        };

        match read {
            Ok(0) => {
                info!(interface = %link.name, "Transport closed, receive pump stopping");
                return PumpExit::Closed;
            }
            Ok(n) => {
                read_errors = 0;
                trace!(interface = %link.name, bytes = n, "Transport read");
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => {
                read_errors += 1;
                error!(interface = %link.name, error = %e, "Transport read failed");
                // Whatever was partially buffered can no longer be trusted
                buffer.clear();
                decoder = FrameDecoder::new(decoder.mtu());
                link.stats.dropped_rx.fetch_add(1, Ordering::Relaxed);
                if read_errors >= MAX_READ_ERRORS {
                    return PumpExit::Failed(e);
                }
            }
        }
    }
}
