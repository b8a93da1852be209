//! Packet buffers and the shared buffer pool.
//!
//! Buffers are pre-allocated and handed out as owned [`Packet`] values.
//! A packet returns its buffer to the pool when dropped, so every buffer is
//! released exactly once no matter which component holds it last.

use bytes::BufMut;
use std::sync::{Arc, Mutex};

/// Size of the packed packet header on the wire.
pub const HEADER_SIZE: usize = 4;

/// Highest node address.
pub const MAX_ADDRESS: u8 = 31;

/// Highest port number.
pub const MAX_PORT: u8 = 63;

/// Packet priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    Critical,
    High,
    #[default]
    Norm,
    Low,
}

impl Priority {
    fn bits(self) -> u32 {
        match self {
            Priority::Critical => 0,
            Priority::High => 1,
            Priority::Norm => 2,
            Priority::Low => 3,
        }
    }

    fn from_bits(bits: u32) -> Self {
        match bits & 0x3 {
            0 => Priority::Critical,
            1 => Priority::High,
            2 => Priority::Norm,
            _ => Priority::Low,
        }
    }
}

/// Routing metadata carried in front of every packet's data.
///
/// Packed into 32 bits, network byte order:
/// `prio:2 | src:5 | dst:5 | dport:6 | sport:6 | flags:8`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketHeader {
    pub priority: Priority,
    pub src: u8,
    pub dst: u8,
    pub dport: u8,
    pub sport: u8,
    pub flags: u8,
}

impl PacketHeader {
    /// Pack into the 32-bit wire identifier.
    pub fn pack(&self) -> u32 {
        (self.priority.bits() << 30)
            | ((self.src as u32 & 0x1F) << 25)
            | ((self.dst as u32 & 0x1F) << 20)
            | ((self.dport as u32 & 0x3F) << 14)
            | ((self.sport as u32 & 0x3F) << 8)
            | self.flags as u32
    }

    /// Unpack from the 32-bit wire identifier.
    pub fn unpack(raw: u32) -> Self {
        Self {
            priority: Priority::from_bits(raw >> 30),
            src: ((raw >> 25) & 0x1F) as u8,
            dst: ((raw >> 20) & 0x1F) as u8,
            dport: ((raw >> 14) & 0x3F) as u8,
            sport: ((raw >> 8) & 0x3F) as u8,
            flags: (raw & 0xFF) as u8,
        }
    }
}

struct PoolShared {
    free_list: Mutex<Vec<Vec<u8>>>,
    buffer_size: usize,
    capacity: usize,
    reserved: usize,
}

impl PoolShared {
    fn release(&self, mut buf: Vec<u8>) {
        buf.clear();
        if let Ok(mut free) = self.free_list.lock() {
            free.push(buf);
        }
    }
}

/// Thread-safe pool of fixed-size packet buffers.
///
/// A number of buffers can be held back for outbound traffic: inbound
/// allocations through [`get_inbound`](Self::get_inbound) never take the
/// last `reserved` free buffers, while [`get`](Self::get) may take any.
///
/// Cloning the pool yields another handle to the same buffers.
#[derive(Clone)]
pub struct BufferPool {
    shared: Arc<PoolShared>,
}

impl BufferPool {
    /// Create a pool of `count` buffers of `size` bytes each.
    pub fn new(count: usize, size: usize) -> Self {
        Self::with_reserve(count, size, 0)
    }

    /// Create a pool holding back `reserved` of its `count` buffers for
    /// outbound packets.
    pub fn with_reserve(count: usize, size: usize, reserved: usize) -> Self {
        let free_list = (0..count).map(|_| Vec::with_capacity(size)).collect();

        Self {
            shared: Arc::new(PoolShared {
                free_list: Mutex::new(free_list),
                buffer_size: size,
                capacity: count,
                reserved: reserved.min(count),
            }),
        }
    }

    /// Acquire a packet able to hold `size` bytes of data.
    ///
    /// Returns `None` if the pool is exhausted or `size` exceeds the
    /// buffer size. Never blocks beyond the free-list lock.
    pub fn get(&self, size: usize) -> Option<Packet> {
        self.take(size, 0)
    }

    /// Acquire a packet for inbound data, leaving the reserve untouched.
    pub fn get_inbound(&self, size: usize) -> Option<Packet> {
        self.take(size, self.shared.reserved)
    }

    fn take(&self, size: usize, keep: usize) -> Option<Packet> {
        if size > self.shared.buffer_size {
            return None;
        }

        let buf = {
            let mut free = self.shared.free_list.lock().ok()?;
            if free.len() <= keep {
                return None;
            }
            free.pop()?
        };

        Some(Packet {
            header: PacketHeader::default(),
            buf,
            pool: Arc::clone(&self.shared),
        })
    }

    /// Size of each buffer.
    pub fn buffer_size(&self) -> usize {
        self.shared.buffer_size
    }

    /// Total number of buffers.
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Buffers held back for outbound packets.
    pub fn reserved(&self) -> usize {
        self.shared.reserved
    }

    /// Number of buffers currently free.
    pub fn available(&self) -> usize {
        self.shared.free_list.lock().map(|free| free.len()).unwrap_or(0)
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("buffer_size", &self.buffer_size())
            .field("capacity", &self.capacity())
            .field("reserved", &self.reserved())
            .field("available", &self.available())
            .finish()
    }
}

/// Error returned when data does not fit into a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacityError {
    pub requested: usize,
    pub capacity: usize,
}

impl std::fmt::Display for CapacityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} bytes do not fit a {} byte packet buffer",
            self.requested, self.capacity
        )
    }
}

impl std::error::Error for CapacityError {}

/// A pooled buffer holding one application payload plus routing metadata.
pub struct Packet {
    header: PacketHeader,
    buf: Vec<u8>,
    pool: Arc<PoolShared>,
}

impl Packet {
    pub fn header(&self) -> &PacketHeader {
        &self.header
    }

    pub fn header_mut(&mut self) -> &mut PacketHeader {
        &mut self.header
    }

    /// Application data.
    pub fn data(&self) -> &[u8] {
        &self.buf
    }

    /// Number of valid data bytes.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Maximum data bytes this packet can hold.
    pub fn capacity(&self) -> usize {
        self.pool.buffer_size
    }

    /// Replace the packet data.
    pub fn set_data(&mut self, data: &[u8]) -> Result<(), CapacityError> {
        if data.len() > self.capacity() {
            return Err(CapacityError {
                requested: data.len(),
                capacity: self.capacity(),
            });
        }
        self.buf.clear();
        self.buf.extend_from_slice(data);
        Ok(())
    }

    /// Bytes this packet occupies on a link: header plus data.
    pub fn wire_len(&self) -> usize {
        HEADER_SIZE + self.buf.len()
    }

    /// Append the wire representation (header then data) to `out`.
    pub fn write_wire(&self, out: &mut impl BufMut) {
        out.put_u32(self.header.pack());
        out.put_slice(&self.buf);
    }

    /// Fill this packet from its wire representation.
    ///
    /// Returns `false` if `raw` is too short to hold a header or the data
    /// does not fit.
    pub fn read_wire(&mut self, raw: &[u8]) -> bool {
        if raw.len() < HEADER_SIZE {
            return false;
        }
        let (id, data) = raw.split_at(HEADER_SIZE);
        let id = u32::from_be_bytes([id[0], id[1], id[2], id[3]]);
        if self.set_data(data).is_err() {
            return false;
        }
        self.header = PacketHeader::unpack(id);
        true
    }
}

impl Drop for Packet {
    fn drop(&mut self) {
        self.pool.release(std::mem::take(&mut self.buf));
    }
}

impl std::fmt::Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Packet")
            .field("header", &self.header)
            .field("len", &self.buf.len())
            .finish()
    }
}
