//! Test doubles for the data plane collaborators
//!
//! Used by unit tests and the integration tests under `tests/`.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{IpProtocol, Ipv4Packet, Ipv4Repr};

use crate::dataplane::{Device, Socket};
use crate::mapping::{Mapping, NodeKeys, NodeRecord};
use crate::payload::{PACKET_START, Payload};
use crate::plugin::{Direction, Plugin};
use crate::store::MappingSource;

/// IP header size (without options)
pub const IP_HDR_SIZE: usize = 20;

/// How long an idle mock read waits, so worker loops do not spin
const IDLE: Duration = Duration::from_millis(1);

/// Build a raw IPv4/UDP-protocol packet carrying `payload`.
pub fn ipv4_packet(src: [u8; 4], dst: [u8; 4], payload: &[u8]) -> Vec<u8> {
    let mut buf = vec![0u8; IP_HDR_SIZE + payload.len()];
    let ip_repr = Ipv4Repr {
        src_addr: Ipv4Addr::from(src).into(),
        dst_addr: Ipv4Addr::from(dst).into(),
        next_header: IpProtocol::Udp,
        payload_len: payload.len(),
        hop_limit: 64,
    };
    let mut packet = Ipv4Packet::new_unchecked(&mut buf);
    ip_repr.emit(&mut packet, &ChecksumCapabilities::default());
    packet.payload_mut().copy_from_slice(payload);
    buf
}

/// A mapping for a node with fresh keys, reachable at `192.0.2.<last octet>:1099`.
pub fn mapping_for(machine_id: &str, ip: Ipv4Addr) -> Mapping {
    let keys = NodeKeys::generate();
    Mapping::from_record(
        NodeRecord {
            machine_id: machine_id.to_string(),
            private_ip: ip,
            public_address: Ipv4Addr::new(192, 0, 2, ip.octets()[3]).into(),
            public_port: 1099,
            public_key: keys.public_key().to_bytes(),
            supported_plugins: Vec::new(),
            floating: false,
        },
        &keys,
    )
}

/// Fixed mapping table for driving a [`crate::router::Router`] without a datastore.
#[derive(Default)]
pub struct StaticSource {
    mappings: HashMap<Ipv4Addr, Arc<Mapping>>,
    gateway: Option<Ipv4Addr>,
}

impl StaticSource {
    pub fn new(mappings: impl IntoIterator<Item = Mapping>) -> Self {
        Self {
            mappings: mappings
                .into_iter()
                .map(|m| (m.private_ip, Arc::new(m)))
                .collect(),
            gateway: None,
        }
    }

    pub fn with_gateway(mut self, ip: Ipv4Addr) -> Self {
        self.gateway = Some(ip);
        self
    }
}

impl MappingSource for StaticSource {
    fn mapping(&self, ip: Ipv4Addr) -> Option<Arc<Mapping>> {
        self.mappings.get(&ip).cloned()
    }

    fn gateway_mapping(&self) -> Option<Arc<Mapping>> {
        self.gateway.and_then(|ip| self.mapping(ip))
    }
}

/// In-memory device: packets are injected per queue and writes are captured.
pub struct MockDevice {
    inbound: Vec<Mutex<VecDeque<Vec<u8>>>>,
    written: Mutex<Vec<(usize, Vec<u8>)>>,
    closed: AtomicBool,
}

impl MockDevice {
    pub fn new(queues: usize) -> Self {
        Self {
            inbound: (0..queues.max(1)).map(|_| Mutex::default()).collect(),
            written: Mutex::default(),
            closed: AtomicBool::new(false),
        }
    }

    /// Queue a raw IP packet to be read from `queue`.
    pub fn inject(&self, queue: usize, packet: Vec<u8>) {
        self.inbound[queue].lock().unwrap().push_back(packet);
    }

    /// Packets not yet read, over all queues.
    pub fn pending(&self) -> usize {
        self.inbound.iter().map(|q| q.lock().unwrap().len()).sum()
    }

    /// Packets written so far, with the queue they were written on.
    pub fn written(&self) -> Vec<(usize, Vec<u8>)> {
        self.written.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Device for MockDevice {
    fn name(&self) -> &str {
        "mock0"
    }

    fn queues(&self) -> usize {
        self.inbound.len()
    }

    fn read<'a>(&self, queue: usize, buf: &'a mut [u8]) -> Option<Payload<'a>> {
        let next = self.inbound.get(queue)?.lock().unwrap().pop_front();
        let Some(packet) = next else {
            thread::sleep(IDLE);
            return None;
        };
        buf[PACKET_START..PACKET_START + packet.len()].copy_from_slice(&packet);
        Payload::from_device(buf, packet.len())
    }

    fn write(&self, queue: usize, payload: &Payload<'_>) -> bool {
        self.written
            .lock()
            .unwrap()
            .push((queue, payload.packet().to_vec()));
        true
    }

    fn close(&self) -> io::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// In-memory transport: datagrams are injected per queue and sends are captured.
pub struct MockSocket {
    inbound: Vec<Mutex<VecDeque<Vec<u8>>>>,
    sent: Mutex<Vec<(SocketAddr, Vec<u8>)>>,
    fail_writes: AtomicBool,
    closed: AtomicBool,
}

impl MockSocket {
    pub fn new(queues: usize) -> Self {
        Self {
            inbound: (0..queues.max(1)).map(|_| Mutex::default()).collect(),
            sent: Mutex::default(),
            fail_writes: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Queue a wire datagram to be received on `queue`.
    pub fn inject(&self, queue: usize, datagram: Vec<u8>) {
        self.inbound[queue].lock().unwrap().push_back(datagram);
    }

    pub fn pending(&self) -> usize {
        self.inbound.iter().map(|q| q.lock().unwrap().len()).sum()
    }

    /// Datagrams sent so far, with their destination endpoint.
    pub fn sent(&self) -> Vec<(SocketAddr, Vec<u8>)> {
        self.sent.lock().unwrap().clone()
    }

    /// Make every following write fail.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Socket for MockSocket {
    fn read<'a>(&self, queue: usize, buf: &'a mut [u8]) -> Option<Payload<'a>> {
        let next = self.inbound.get(queue)?.lock().unwrap().pop_front();
        let Some(datagram) = next else {
            thread::sleep(IDLE);
            return None;
        };
        buf[..datagram.len()].copy_from_slice(&datagram);
        Payload::from_socket(buf, datagram.len())
    }

    fn write(&self, _queue: usize, payload: &Payload<'_>, mapping: &Mapping) -> bool {
        if self.fail_writes.load(Ordering::SeqCst) {
            return false;
        }
        self.sent
            .lock()
            .unwrap()
            .push((mapping.endpoint(), payload.wire().to_vec()));
        true
    }

    fn close(&self) -> io::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn fds(&self) -> Vec<RawFd> {
        Vec::new()
    }
}

pub type PluginLog = Arc<Mutex<Vec<(&'static str, Direction)>>>;

/// Plugin that records every call in a shared log.
pub struct OrderedPlugin {
    name: &'static str,
    order: i32,
    log: PluginLog,
    fail: bool,
}

impl OrderedPlugin {
    pub fn new(name: &'static str, order: i32, log: PluginLog) -> Self {
        Self {
            name,
            order,
            log,
            fail: false,
        }
    }

    /// Like [`OrderedPlugin::new`] but drops every packet.
    pub fn failing(name: &'static str, order: i32, log: PluginLog) -> Self {
        Self {
            fail: true,
            ..Self::new(name, order, log)
        }
    }
}

impl Plugin for OrderedPlugin {
    fn name(&self) -> &'static str {
        self.name
    }

    fn order(&self) -> i32 {
        self.order
    }

    fn apply(&self, direction: Direction, _payload: &mut Payload<'_>, _mapping: &Mapping) -> bool {
        self.log.lock().unwrap().push((self.name, direction));
        !self.fail
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ipv4_packet_is_valid() {
        let bytes = ipv4_packet([10, 0, 0, 1], [10, 0, 0, 2], b"hi");
        let packet = Ipv4Packet::new_checked(&bytes[..]).unwrap();
        assert_eq!(Ipv4Addr::from(packet.dst_addr()), Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(packet.payload(), b"hi");
    }

    #[test]
    fn test_mock_device_round_trip() {
        let device = MockDevice::new(2);
        device.inject(1, vec![1, 2, 3]);
        let mut buf = vec![0u8; 64];
        assert!(device.read(0, &mut buf).is_none());
        let payload = device.read(1, &mut buf).unwrap();
        assert_eq!(payload.packet(), &[1, 2, 3]);
        assert!(device.write(1, &payload));
        assert_eq!(device.written(), vec![(1, vec![1, 2, 3])]);
    }
}
