//! Packet buffers as they move through a worker pipeline.
//!
//! Wire layout of a datagram between nodes:
//!
//! ```text
//! 0        4                16                         length
//! +--------+----------------+--------------------------+-----+
//! | src ip |     nonce      | packet (maybe transformed) | tag |
//! +--------+----------------+--------------------------+-----+
//! ```
//!
//! The device side reads the raw IP packet straight into the packet region
//! so no copy is needed before sending.

use std::net::Ipv4Addr;

pub const IP_START: usize = 0;
pub const IP_END: usize = 4;
pub const NONCE_START: usize = 4;
pub const NONCE_END: usize = 16;
pub const HEADER_SIZE: usize = 16;
pub const PACKET_START: usize = HEADER_SIZE;
/// Authentication tag appended by encryption.
pub const TAG_SIZE: usize = 16;
/// Largest datagram put on the wire.
pub const MAX_PACKET_LENGTH: usize = 1470;
/// MTU of the virtual device, leaving room for header and tag.
pub const MTU: usize = MAX_PACKET_LENGTH - HEADER_SIZE - TAG_SIZE;
/// Per-worker scratch buffer size.
pub const BUFFER_SIZE: usize = 2048;

/// A datagram borrowed from a worker's buffer.
///
/// `length` covers header and packet; nothing past it is valid.
#[derive(Debug)]
pub struct Payload<'a> {
    raw: &'a mut [u8],
    length: usize,
}

impl<'a> Payload<'a> {
    /// Wrap a packet the device wrote at `raw[PACKET_START..]`.
    pub fn from_device(raw: &'a mut [u8], packet_len: usize) -> Option<Self> {
        let length = PACKET_START + packet_len;
        (length <= raw.len()).then_some(Self { raw, length })
    }

    /// Wrap a datagram received from the transport at `raw[..len]`.
    pub fn from_socket(raw: &'a mut [u8], len: usize) -> Option<Self> {
        (HEADER_SIZE..=raw.len())
            .contains(&len)
            .then_some(Self { raw, length: len })
    }

    /// Valid bytes, header included.
    pub fn length(&self) -> usize {
        self.length
    }

    /// Overlay address of the sending node.
    pub fn ip(&self) -> Ipv4Addr {
        let mut octets = [0u8; 4];
        octets.copy_from_slice(&self.raw[IP_START..IP_END]);
        Ipv4Addr::from(octets)
    }

    pub fn set_ip(&mut self, ip: Ipv4Addr) {
        self.raw[IP_START..IP_END].copy_from_slice(&ip.octets());
    }

    pub fn packet(&self) -> &[u8] {
        &self.raw[PACKET_START..self.length]
    }

    pub fn packet_mut(&mut self) -> &mut [u8] {
        &mut self.raw[PACKET_START..self.length]
    }

    pub fn packet_len(&self) -> usize {
        self.length - PACKET_START
    }

    /// Room available for the packet region.
    pub fn packet_capacity(&self) -> usize {
        self.raw.len() - PACKET_START
    }

    /// Resize the packet region. Fails if the buffer is too small.
    pub fn set_packet_len(&mut self, len: usize) -> bool {
        if len > self.packet_capacity() {
            return false;
        }
        self.length = PACKET_START + len;
        true
    }

    /// Header and the whole packet capacity, for transforms that grow or
    /// shrink the packet in place.
    pub fn split_mut(&mut self) -> (&mut [u8], &mut [u8]) {
        self.raw.split_at_mut(PACKET_START)
    }

    /// Bytes to put on the wire.
    pub fn wire(&self) -> &[u8] {
        &self.raw[..self.length]
    }
}
