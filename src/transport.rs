//! Named-pipe transport endpoints.
//!
//! The link runs over two unidirectional FIFOs: one the peer writes and we
//! read, one we write and the peer reads. Both are opened read-write on Linux
//! so opening never blocks waiting for the other side and the pipe does not
//! report EOF while the peer restarts.

use std::path::{Path, PathBuf};
use tokio::net::unix::pipe;
use tracing::info;

/// Which side of the link a pipe serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Rx,
    Tx,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Rx => write!(f, "RX"),
            Direction::Tx => write!(f, "TX"),
        }
    }
}

/// Failure to open a transport channel.
#[derive(Debug)]
pub struct TransportError {
    pub direction: Direction,
    pub path: PathBuf,
    pub source: std::io::Error,
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Failed to open {} channel '{}': {}",
            self.direction,
            self.path.display(),
            self.source
        )
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

/// Open both channels of the link.
///
/// Must be called from within a Tokio runtime.
pub fn open(rx_path: &Path, tx_path: &Path) -> Result<(pipe::Receiver, pipe::Sender), TransportError> {
    let tx = options().open_sender(tx_path).map_err(|source| TransportError {
        direction: Direction::Tx,
        path: tx_path.to_path_buf(),
        source,
    })?;

    let rx = options().open_receiver(rx_path).map_err(|source| TransportError {
        direction: Direction::Rx,
        path: rx_path.to_path_buf(),
        source,
    })?;

    info!(rx = %rx_path.display(), tx = %tx_path.display(), "Transport opened");
    Ok((rx, tx))
}

fn options() -> pipe::OpenOptions {
    #[allow(unused_mut)]
    let mut options = pipe::OpenOptions::new();
    #[cfg(target_os = "linux")]
    options.read_write(true);
    options
}
