//! Authenticated encryption of the packet region with the per-peer cipher.
//!
//! Each packet gets a random nonce, stored in the header. The sender's
//! address is authenticated as associated data.

use chacha20poly1305::aead::AeadInPlace;
use chacha20poly1305::{Nonce, Tag};
use rand::RngCore;
use tracing::trace;

use super::{Direction, Plugin};
use crate::mapping::Mapping;
use crate::payload::{IP_END, IP_START, NONCE_END, NONCE_START, Payload, TAG_SIZE};

pub const NAME: &str = "encryption";

pub struct Encryption;

impl Encryption {
    fn seal(payload: &mut Payload<'_>, mapping: &Mapping) -> bool {
        let len = payload.packet_len();
        if len + TAG_SIZE > payload.packet_capacity() {
            return false;
        }

        let (header, body) = payload.split_mut();
        rand::thread_rng().fill_bytes(&mut header[NONCE_START..NONCE_END]);
        let nonce = Nonce::from_slice(&header[NONCE_START..NONCE_END]);
        let aad = &header[IP_START..IP_END];

        match mapping
            .cipher()
            .encrypt_in_place_detached(nonce, aad, &mut body[..len])
        {
            Ok(tag) => {
                body[len..len + TAG_SIZE].copy_from_slice(&tag);
                payload.set_packet_len(len + TAG_SIZE)
            }
            Err(_) => false,
        }
    }

    fn open(payload: &mut Payload<'_>, mapping: &Mapping) -> bool {
        let Some(len) = payload.packet_len().checked_sub(TAG_SIZE) else {
            return false;
        };

        let (header, body) = payload.split_mut();
        let (data, rest) = body.split_at_mut(len);
        let tag = Tag::clone_from_slice(&rest[..TAG_SIZE]);
        let nonce = Nonce::from_slice(&header[NONCE_START..NONCE_END]);
        let aad = &header[IP_START..IP_END];

        if mapping
            .cipher()
            .decrypt_in_place_detached(nonce, aad, data, &tag)
            .is_err()
        {
            trace!(peer = %mapping.private_ip, "packet failed authentication");
            return false;
        }
        payload.set_packet_len(len)
    }
}

impl Plugin for Encryption {
    fn name(&self) -> &'static str {
        NAME
    }

    fn order(&self) -> i32 {
        1
    }

    fn apply(&self, direction: Direction, payload: &mut Payload<'_>, mapping: &Mapping) -> bool {
        if !mapping.supports(NAME) {
            return true;
        }
        match direction {
            Direction::Outgoing => Self::seal(payload, mapping),
            Direction::Incoming => Self::open(payload, mapping),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::{NodeKeys, NodeRecord};
    use crate::payload::{BUFFER_SIZE, PACKET_START};
    use std::net::Ipv4Addr;

    fn view(of: &NodeKeys, from: &NodeKeys, ip: Ipv4Addr) -> Mapping {
        Mapping::from_record(
            NodeRecord {
                machine_id: ip.to_string(),
                private_ip: ip,
                public_address: "192.0.2.1".parse().unwrap(),
                public_port: 1099,
                public_key: of.public_key().to_bytes(),
                supported_plugins: vec![NAME.to_string()],
                floating: false,
            },
            from,
        )
    }

    #[test]
    fn test_seal_and_open_between_peers() {
        let alice = NodeKeys::generate();
        let bob = NodeKeys::generate();
        let alice_ip = Ipv4Addr::new(10, 0, 0, 1);
        let bob_seen_by_alice = view(&bob, &alice, Ipv4Addr::new(10, 0, 0, 2));
        let alice_seen_by_bob = view(&alice, &bob, alice_ip);

        let mut buf = vec![0u8; BUFFER_SIZE];
        buf[PACKET_START..PACKET_START + 5].copy_from_slice(b"hello");
        let mut payload = Payload::from_device(&mut buf, 5).unwrap();
        payload.set_ip(alice_ip);

        assert!(Encryption.apply(Direction::Outgoing, &mut payload, &bob_seen_by_alice));
        assert_eq!(payload.packet_len(), 5 + TAG_SIZE);
        assert_ne!(&payload.packet()[..5], b"hello");

        assert!(Encryption.apply(Direction::Incoming, &mut payload, &alice_seen_by_bob));
        assert_eq!(payload.packet(), b"hello");
    }

    #[test]
    fn test_tampered_packet_rejected() {
        let alice = NodeKeys::generate();
        let bob = NodeKeys::generate();
        let to_bob = view(&bob, &alice, Ipv4Addr::new(10, 0, 0, 2));
        let from_alice = view(&alice, &bob, Ipv4Addr::new(10, 0, 0, 1));

        let mut buf = vec![0u8; BUFFER_SIZE];
        let mut payload = Payload::from_device(&mut buf, 8).unwrap();
        payload.set_ip(Ipv4Addr::new(10, 0, 0, 1));
        assert!(Encryption.apply(Direction::Outgoing, &mut payload, &to_bob));

        payload.packet_mut()[0] ^= 0x01;
        assert!(!Encryption.apply(Direction::Incoming, &mut payload, &from_alice));
    }

    #[test]
    fn test_spoofed_sender_rejected() {
        let alice = NodeKeys::generate();
        let bob = NodeKeys::generate();
        let to_bob = view(&bob, &alice, Ipv4Addr::new(10, 0, 0, 2));
        let from_alice = view(&alice, &bob, Ipv4Addr::new(10, 0, 0, 1));

        let mut buf = vec![0u8; BUFFER_SIZE];
        let mut payload = Payload::from_device(&mut buf, 8).unwrap();
        payload.set_ip(Ipv4Addr::new(10, 0, 0, 1));
        assert!(Encryption.apply(Direction::Outgoing, &mut payload, &to_bob));

        payload.set_ip(Ipv4Addr::new(10, 0, 0, 3));
        assert!(!Encryption.apply(Direction::Incoming, &mut payload, &from_alice));
    }

    #[test]
    fn test_short_packet_rejected() {
        let keys = NodeKeys::generate();
        let peer = view(&keys, &keys, Ipv4Addr::new(10, 0, 0, 2));
        let mut buf = vec![0u8; 64];
        let mut payload = Payload::from_device(&mut buf, TAG_SIZE - 1).unwrap();
        assert!(!Encryption.apply(Direction::Incoming, &mut payload, &peer));
    }
}
