//! Node records and the per-peer mappings derived from them.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use chacha20poly1305::{ChaCha20Poly1305, Key};
use chacha20poly1305::aead::KeyInit;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::{Error, Result};

/// Key used by the mapping table for a private address.
pub fn ip_key(ip: Ipv4Addr) -> u32 {
    u32::from(ip)
}

/// The local node's x25519 key pair.
pub struct NodeKeys {
    secret: StaticSecret,
    public: PublicKey,
}

impl NodeKeys {
    pub fn generate() -> Self {
        Self::from_secret(StaticSecret::random_from_rng(OsRng).to_bytes())
    }

    pub fn from_secret(bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_key(&self) -> PublicKey {
        self.public
    }

    /// Cipher shared with the holder of `remote`.
    ///
    /// Both ends derive the same key, so this is symmetric in
    /// (local secret, remote public).
    fn cipher_for(&self, remote: &PublicKey) -> ChaCha20Poly1305 {
        let shared = self.secret.diffie_hellman(remote);
        ChaCha20Poly1305::new(Key::from_slice(shared.as_bytes()))
    }
}

impl fmt::Debug for NodeKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeKeys")
            .field("public", &self.public.as_bytes())
            .finish_non_exhaustive()
    }
}

/// Wire form of a node, stored at `<prefix>/nodes/<machineID>`.
///
/// A floating IP claim uses the same form with `floating` set and is
/// stored at `<prefix>/nodes/<privateIP>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRecord {
    #[serde(rename = "machineID")]
    pub machine_id: String,
    #[serde(rename = "privateIP")]
    pub private_ip: Ipv4Addr,
    pub public_address: IpAddr,
    pub public_port: u16,
    #[serde(with = "base64_key")]
    pub public_key: [u8; 32],
    #[serde(default)]
    pub supported_plugins: Vec<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub floating: bool,
}

impl NodeRecord {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let record: NodeRecord =
            serde_json::from_slice(bytes).map_err(|e| Error::InvalidRecord(e.to_string()))?;
        if record.machine_id.is_empty() {
            return Err(Error::InvalidRecord("empty machineID".to_string()));
        }
        Ok(record)
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Last segment of the key the record is stored under.
    pub fn key_name(&self) -> String {
        key_name(&self.machine_id, self.private_ip, self.floating)
    }
}

fn key_name(machine_id: &str, private_ip: Ipv4Addr, floating: bool) -> String {
    if floating {
        private_ip.to_string()
    } else {
        machine_id.to_string()
    }
}

/// A node as seen from this process: its record plus the derived cipher.
#[derive(Clone)]
pub struct Mapping {
    pub machine_id: String,
    pub private_ip: Ipv4Addr,
    pub public_address: IpAddr,
    pub public_port: u16,
    pub public_key: PublicKey,
    pub supported_plugins: Vec<String>,
    /// A floating IP currently held by `machine_id`.
    pub floating: bool,
    cipher: ChaCha20Poly1305,
}

impl Mapping {
    pub fn from_record(record: NodeRecord, keys: &NodeKeys) -> Self {
        let public_key = PublicKey::from(record.public_key);
        Self {
            cipher: keys.cipher_for(&public_key),
            machine_id: record.machine_id,
            private_ip: record.private_ip,
            public_address: record.public_address,
            public_port: record.public_port,
            public_key,
            supported_plugins: record.supported_plugins,
            floating: record.floating,
        }
    }

    pub fn record(&self) -> NodeRecord {
        NodeRecord {
            machine_id: self.machine_id.clone(),
            private_ip: self.private_ip,
            public_address: self.public_address,
            public_port: self.public_port,
            public_key: self.public_key.to_bytes(),
            supported_plugins: self.supported_plugins.clone(),
            floating: self.floating,
        }
    }

    pub fn key_name(&self) -> String {
        key_name(&self.machine_id, self.private_ip, self.floating)
    }

    /// Transport endpoint of the node.
    pub fn endpoint(&self) -> SocketAddr {
        SocketAddr::new(self.public_address, self.public_port)
    }

    /// Whether the node advertises the named plugin.
    pub fn supports(&self, plugin: &str) -> bool {
        self.supported_plugins.iter().any(|p| p == plugin)
    }

    pub fn cipher(&self) -> &ChaCha20Poly1305 {
        &self.cipher
    }
}

impl fmt::Debug for Mapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mapping")
            .field("machine_id", &self.machine_id)
            .field("private_ip", &self.private_ip)
            .field("endpoint", &self.endpoint())
            .field("supported_plugins", &self.supported_plugins)
            .field("floating", &self.floating)
            .finish_non_exhaustive()
    }
}

mod base64_key {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer, de};

    pub fn serialize<S: Serializer>(key: &[u8; 32], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(key))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let encoded = String::deserialize(d)?;
        let bytes = STANDARD.decode(encoded).map_err(de::Error::custom)?;
        <[u8; 32]>::try_from(bytes.as_slice())
            .map_err(|_| de::Error::invalid_length(bytes.len(), &"a 32 byte public key"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chacha20poly1305::Nonce;
    use chacha20poly1305::aead::Aead;

    fn record(keys: &NodeKeys) -> NodeRecord {
        NodeRecord {
            machine_id: "machine-a".to_string(),
            private_ip: Ipv4Addr::new(10, 9, 16, 1),
            public_address: "192.0.2.10".parse().unwrap(),
            public_port: 1099,
            public_key: keys.public_key().to_bytes(),
            supported_plugins: vec!["compression".to_string(), "encryption".to_string()],
            floating: false,
        }
    }

    #[test]
    fn test_record_json_round_trip() {
        let keys = NodeKeys::generate();
        let rec = record(&keys);
        let json = rec.to_json().unwrap();
        let text = std::str::from_utf8(&json).unwrap();
        assert!(text.contains("\"machineID\":\"machine-a\""));
        assert!(text.contains("\"privateIP\":\"10.9.16.1\""));
        assert!(text.contains("\"publicPort\":1099"));
        assert!(!text.contains("cipher"));
        assert!(!text.contains("floating"));
        assert_eq!(NodeRecord::parse(&json).unwrap(), rec);
    }

    #[test]
    fn test_floating_record_keyed_by_ip() {
        let keys = NodeKeys::generate();
        let mut rec = record(&keys);
        assert_eq!(rec.key_name(), "machine-a");

        rec.floating = true;
        rec.private_ip = Ipv4Addr::new(10, 9, 2, 1);
        let json = rec.to_json().unwrap();
        assert!(std::str::from_utf8(&json).unwrap().contains("\"floating\":true"));
        let parsed = NodeRecord::parse(&json).unwrap();
        assert_eq!(parsed.key_name(), "10.9.2.1");
        assert_eq!(Mapping::from_record(parsed, &keys).key_name(), "10.9.2.1");
    }

    #[test]
    fn test_record_rejects_bad_key() {
        let json = br#"{"machineID":"m","privateIP":"10.0.0.1","publicAddress":"192.0.2.1","publicPort":1,"publicKey":"AAAA"}"#;
        assert!(matches!(
            NodeRecord::parse(json),
            Err(Error::InvalidRecord(_))
        ));
    }

    #[test]
    fn test_mapping_preserves_record() {
        let keys = NodeKeys::generate();
        let rec = record(&keys);
        let mapping = Mapping::from_record(rec.clone(), &keys);
        assert_eq!(mapping.record(), rec);
        assert_eq!(mapping.endpoint(), "192.0.2.10:1099".parse().unwrap());
        assert!(mapping.supports("encryption"));
        assert!(!mapping.supports("gzip"));
    }

    #[test]
    fn test_derived_cipher_is_symmetric() {
        let alice = NodeKeys::generate();
        let bob = NodeKeys::generate();

        // alice's view of bob and bob's view of alice
        let to_bob = Mapping::from_record(record(&bob), &alice);
        let from_alice = Mapping::from_record(record(&alice), &bob);

        let nonce = Nonce::from_slice(&[7u8; 12]);
        let sealed = to_bob.cipher().encrypt(nonce, b"hello".as_ref()).unwrap();
        let opened = from_alice.cipher().decrypt(nonce, sealed.as_ref()).unwrap();
        assert_eq!(opened, b"hello");
    }

    #[test]
    fn test_debug_hides_secret() {
        let keys = NodeKeys::from_secret([1u8; 32]);
        let out = format!("{keys:?}");
        assert!(out.contains("public"));
        assert!(!out.contains("secret"));
    }
}
