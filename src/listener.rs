//! Command listener on the node's service port.

use crate::command::Command;
use crate::dispatch::DispatchError;
use crate::net::{Socket, Stack, StackError};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Connections queued on the service port before new ones are refused.
pub const BACKLOG: usize = 5;

/// Accepts one connection at a time and reads a single command from it.
pub struct CommandListener {
    socket: Socket,
    timeout: Duration,
}

impl CommandListener {
    /// Bind `port` on `stack`.
    pub fn bind(stack: &Arc<Stack>, port: u8, timeout: Duration) -> Result<Self, StackError> {
        let socket = stack.bind(port, BACKLOG)?;
        info!(port, "Listening for commands");
        Ok(Self { socket, timeout })
    }

    pub fn port(&self) -> u8 {
        self.socket.port()
    }

    /// Wait for the next command.
    ///
    /// Returns `Ok(None)` when no connection arrived, or one arrived without
    /// a packet, within the timeout. Payloads that do not decode are reported
    /// as errors. The connection is closed and the packet released before
    /// returning.
    pub async fn accept_command(&mut self) -> Result<Option<Command>, DispatchError> {
        let Some(mut conn) = self.socket.accept(self.timeout).await else {
            return Ok(None);
        };

        let Some(packet) = conn.read(self.timeout).await else {
            warn!(
                peer = conn.remote_address(),
                "Connection closed without a command"
            );
            return Ok(None);
        };

        let decoded = Command::decode(packet.data());
        debug!(
            peer = conn.remote_address(),
            len = packet.len(),
            "Command payload received"
        );
        drop(packet);
        conn.close();

        match decoded {
            Ok(command) => {
                info!(action = %command.action, plugin = %command.args, "Received command");
                Ok(Some(command))
            }
            Err(e) => {
                warn!(error = %e, "Rejected command");
                Err(e.into())
            }
        }
    }
}
