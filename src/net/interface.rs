//! Link interface hook.
//!
//! The stack hands outbound packets to whatever interface is registered as
//! its default route. An interface takes ownership of the packet; the packet
//! is released when the interface is done with it, whether or not the
//! transmission succeeded.

use super::packet::Packet;
use super::stack::StackError;
use async_trait::async_trait;
use std::time::Duration;

/// A link the stack can route packets through.
#[async_trait]
pub trait Interface: Send + Sync {
    /// Interface name, used to tag inbound packets and in logs.
    fn name(&self) -> &str;

    /// Largest link payload (packet header included) this interface carries.
    fn mtu(&self) -> usize;

    /// Place one packet on the link.
    async fn transmit(&self, packet: Packet, timeout: Duration) -> Result<(), StackError>;
}
