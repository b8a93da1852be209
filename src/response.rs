//! Acknowledgments back to the commanding peer.

use crate::dispatch::DispatchError;
use crate::net::{CapacityError, Priority, Stack, StackError};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Sends a fixed acknowledgment to the configured peer after every command.
pub struct ResponseSender {
    stack: Arc<Stack>,
    peer: u8,
    port: u8,
    timeout: Duration,
    success: Bytes,
    failure: Bytes,
}

impl ResponseSender {
    pub fn new(
        stack: Arc<Stack>,
        peer: u8,
        port: u8,
        timeout: Duration,
        success: impl Into<Bytes>,
        failure: impl Into<Bytes>,
    ) -> Self {
        Self {
            stack,
            peer,
            port,
            timeout,
            success: success.into(),
            failure: failure.into(),
        }
    }

    /// Payload sent for `outcome`.
    pub fn payload_for(&self, outcome: &Result<(), DispatchError>) -> &Bytes {
        match outcome {
            Ok(()) => &self.success,
            Err(_) => &self.failure,
        }
    }

    /// Send the acknowledgment for `outcome` on a fresh connection.
    ///
    /// Not retried on failure.
    pub async fn send_ack(&self, outcome: &Result<(), DispatchError>) -> Result<(), StackError> {
        let payload = self.payload_for(outcome);
        let capacity = self.stack.pool().buffer_size();
        if payload.len() > capacity {
            return Err(CapacityError {
                requested: payload.len(),
                capacity,
            }
            .into());
        }

        let mut packet = self
            .stack
            .get_buffer(payload.len())
            .ok_or(StackError::PoolExhausted)?;
        packet.set_data(payload)?;

        let conn = self.stack.connect(Priority::Norm, self.peer, self.port)?;
        debug!(
            peer = self.peer,
            port = self.port,
            payload = %String::from_utf8_lossy(payload),
            "Sending acknowledgment"
        );
        let result = conn.send(packet, self.timeout).await;
        conn.close();

        if let Err(e) = &result {
            warn!(peer = self.peer, port = self.port, error = %e, "Failed to send acknowledgment");
        }
        result
    }
}
