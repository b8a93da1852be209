//! cnc-daemon: a command-and-control node on a packet radio link
//!
//! The node listens on one service port for single-packet commands, runs
//! the named plugin handler and acknowledges the peer.
//!
//! - `frame`: length-prefixed framing on the byte link
//! - `net`: packets, buffer pool and the routing stack
//! - `transport` and `link`: named pipes and the adapter joining them to the stack
//! - `command`, `plugin` and `dispatch`: decoding and running commands
//! - `listener` and `response`: the command port and acknowledgments
//! - `daemon`: startup, main loop and teardown

pub mod command;
pub mod config;
pub mod daemon;
pub mod dispatch;
pub mod frame;
pub mod link;
pub mod listener;
pub mod net;
pub mod plugin;
pub mod response;
pub mod transport;
