//! Deflate compression of the packet region.

use std::io::{Read, Write};

use flate2::Compression as Level;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use tracing::trace;

use super::{Direction, Plugin};
use crate::mapping::Mapping;
use crate::payload::{MTU, Payload, TAG_SIZE};

pub const NAME: &str = "compression";

pub struct Compression {
    level: Level,
}

impl Default for Compression {
    fn default() -> Self {
        Self {
            level: Level::fast(),
        }
    }
}

impl Compression {
    fn compress(&self, payload: &mut Payload<'_>) -> bool {
        let mut encoder = DeflateEncoder::new(Vec::with_capacity(payload.packet_len()), self.level);
        if encoder.write_all(payload.packet()).is_err() {
            return false;
        }
        let Ok(compressed) = encoder.finish() else {
            return false;
        };

        // keep room for a tag added further down the chain
        if compressed.len() + TAG_SIZE > payload.packet_capacity() {
            trace!(len = compressed.len(), "compressed packet too large");
            return false;
        }
        let (_, body) = payload.split_mut();
        body[..compressed.len()].copy_from_slice(&compressed);
        payload.set_packet_len(compressed.len())
    }

    fn decompress(&self, payload: &mut Payload<'_>) -> bool {
        let mut decompressed = Vec::with_capacity(MTU);
        {
            let mut decoder = DeflateDecoder::new(payload.packet()).take(MTU as u64 + 1);
            if decoder.read_to_end(&mut decompressed).is_err() {
                return false;
            }
        }
        if decompressed.len() > MTU || decompressed.len() > payload.packet_capacity() {
            return false;
        }
        let (_, body) = payload.split_mut();
        body[..decompressed.len()].copy_from_slice(&decompressed);
        payload.set_packet_len(decompressed.len())
    }
}

impl Plugin for Compression {
    fn name(&self) -> &'static str {
        NAME
    }

    fn order(&self) -> i32 {
        0
    }

    fn apply(&self, direction: Direction, payload: &mut Payload<'_>, mapping: &Mapping) -> bool {
        if !mapping.supports(NAME) {
            return true;
        }
        match direction {
            Direction::Outgoing => self.compress(payload),
            Direction::Incoming => self.decompress(payload),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::{BUFFER_SIZE, PACKET_START};
    use crate::test_util::mapping_for;
    use std::net::Ipv4Addr;

    fn peer(plugins: &[&str]) -> Mapping {
        let mut m = mapping_for("peer", Ipv4Addr::new(10, 0, 0, 2));
        m.supported_plugins = plugins.iter().map(|s| s.to_string()).collect();
        m
    }

    #[test]
    fn test_compress_then_decompress() {
        let plugin = Compression::default();
        let mapping = peer(&[NAME]);
        let original: Vec<u8> = b"abcabcabc".iter().cycle().take(1000).copied().collect();

        let mut buf = vec![0u8; BUFFER_SIZE];
        buf[PACKET_START..PACKET_START + original.len()].copy_from_slice(&original);
        let mut payload = Payload::from_device(&mut buf, original.len()).unwrap();

        assert!(plugin.apply(Direction::Outgoing, &mut payload, &mapping));
        assert!(payload.packet_len() < original.len());

        assert!(plugin.apply(Direction::Incoming, &mut payload, &mapping));
        assert_eq!(payload.packet(), original.as_slice());
    }

    #[test]
    fn test_skipped_when_peer_lacks_support() {
        let plugin = Compression::default();
        let mapping = peer(&["encryption"]);
        let mut buf = vec![0u8; 64];
        buf[PACKET_START..PACKET_START + 4].copy_from_slice(&[9, 9, 9, 9]);
        let mut payload = Payload::from_device(&mut buf, 4).unwrap();

        assert!(plugin.apply(Direction::Outgoing, &mut payload, &mapping));
        assert_eq!(payload.packet(), &[9, 9, 9, 9]);
    }

    #[test]
    fn test_rejects_corrupt_input() {
        let plugin = Compression::default();
        let mapping = peer(&[NAME]);
        let mut buf = vec![0u8; BUFFER_SIZE];
        buf[PACKET_START..PACKET_START + 4].copy_from_slice(&[0xff, 0xff, 0xff, 0xff]);
        let mut payload = Payload::from_device(&mut buf, 4).unwrap();

        assert!(!plugin.apply(Direction::Incoming, &mut payload, &mapping));
    }
}
