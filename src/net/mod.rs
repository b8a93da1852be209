//! Packet-oriented network layer.
//!
//! - `packet`: packet header and the pooled packet buffers
//! - `stack`: addressing, ports, connections and routing
//! - `interface`: the hook through which a link registers with the stack

pub mod interface;
pub mod packet;
pub mod stack;

pub use interface::Interface;
pub use packet::{BufferPool, CapacityError, Packet, PacketHeader, Priority};
pub use stack::{Connection, Socket, Stack, StackError};
