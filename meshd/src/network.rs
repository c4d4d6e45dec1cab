//! Cluster-wide overlay network configuration and address allocation.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::time::Duration;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const DEFAULT_NETWORK: (Ipv4Addr, u8) = (Ipv4Addr::new(10, 99, 0, 0), 16);
/// Static addresses live here; dynamic allocation starts above it.
const DEFAULT_RESERVED_SUBNET: (Ipv4Addr, u8) = (Ipv4Addr::new(10, 99, 0, 0), 23);
/// Default lease of a node record.
pub const DEFAULT_LEASE_TIME: Duration = Duration::from_secs(48 * 60 * 60);

/// Network configuration shared by every node, persisted at `<prefix>/config`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConfig {
    pub network: Ipv4Net,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reserved_subnet: Option<Ipv4Net>,
    #[serde(with = "duration_secs", default = "default_lease_time")]
    pub lease_time: Duration,
    /// Floating IPs live here; never allocated to a node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub floating_subnet: Option<Ipv4Net>,
}

fn default_lease_time() -> Duration {
    DEFAULT_LEASE_TIME
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            network: Ipv4Net::new(DEFAULT_NETWORK.0, DEFAULT_NETWORK.1).unwrap_or_default(),
            reserved_subnet: Ipv4Net::new(DEFAULT_RESERVED_SUBNET.0, DEFAULT_RESERVED_SUBNET.1)
                .ok(),
            lease_time: DEFAULT_LEASE_TIME,
            floating_subnet: None,
        }
    }
}

impl NetworkConfig {
    pub fn new(network: Ipv4Net, reserved_subnet: Option<Ipv4Net>, lease_time: Duration) -> Self {
        Self {
            network: network.trunc(),
            reserved_subnet: reserved_subnet.map(|r| r.trunc()),
            lease_time,
            floating_subnet: None,
        }
    }

    pub fn with_floating_subnet(mut self, floating_subnet: Option<Ipv4Net>) -> Self {
        self.floating_subnet = floating_subnet.map(|f| f.trunc());
        self
    }

    /// Parse and validate a JSON-encoded config.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let raw: NetworkConfig = serde_json::from_slice(bytes)
            .map_err(|e| Error::InvalidNetworkConfig(e.to_string()))?;
        let config = Self::new(raw.network, raw.reserved_subnet, raw.lease_time)
            .with_floating_subnet(raw.floating_subnet);
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.network.prefix_len() > 30 {
            return Err(Error::InvalidNetworkConfig(format!(
                "network {} is too small, need at least a /30",
                self.network
            )));
        }
        if let Some(reserved) = self.reserved_subnet
            && !self.network.contains(&reserved)
        {
            return Err(Error::InvalidNetworkConfig(format!(
                "reserved subnet {} is not inside network {}",
                reserved, self.network
            )));
        }
        if let Some(floating) = self.floating_subnet {
            if !self.network.contains(&floating) {
                return Err(Error::InvalidNetworkConfig(format!(
                    "floating subnet {} is not inside network {}",
                    floating, self.network
                )));
            }
            if let Some(reserved) = self.reserved_subnet
                && (reserved.contains(&floating) || floating.contains(&reserved))
            {
                return Err(Error::InvalidNetworkConfig(format!(
                    "floating subnet {floating} overlaps reserved subnet {reserved}"
                )));
            }
        }
        if self.lease_time.is_zero() {
            return Err(Error::InvalidNetworkConfig(
                "lease time must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether `ip` lies inside the overlay network.
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        self.network.contains(&ip)
    }

    /// Whether `ip` may ever be handed out by [`free_ip`](Self::free_ip).
    pub fn is_allocatable(&self, ip: Ipv4Addr) -> bool {
        let last = ip.octets()[3];
        self.network.contains(&ip)
            && ip != self.network.network()
            && ip != self.network.broadcast()
            && last != 0
            && last != 255
            && !self.reserved_subnet.is_some_and(|r| r.contains(&ip))
            && !self.floating_subnet.is_some_and(|f| f.contains(&ip))
    }

    /// Check that `ip` may be claimed as a floating IP.
    pub fn check_floating(&self, ip: Ipv4Addr) -> Result<()> {
        let reason = if !self.network.contains(&ip) {
            "outside the overlay network"
        } else if self.reserved_subnet.is_some_and(|r| r.contains(&ip)) {
            "inside the reserved subnet"
        } else if self.floating_subnet.is_some_and(|f| !f.contains(&ip)) {
            "outside the floating subnet"
        } else {
            return Ok(());
        };
        Err(Error::InvalidFloatingIp { ip, reason })
    }

    /// First allocatable address in ascending order that is not in `claimed`.
    pub fn free_ip(&self, claimed: &HashSet<Ipv4Addr>) -> Result<Ipv4Addr> {
        let start = match self.reserved_subnet {
            // Everything up to the end of the reserved block is off limits.
            Some(r) if r.network() == self.network.network() => {
                u32::from(r.broadcast()).saturating_add(1)
            }
            _ => u32::from(self.network.network()),
        };
        let end = u32::from(self.network.broadcast());

        (start..=end)
            .map(Ipv4Addr::from)
            .find(|ip| self.is_allocatable(*ip) && !claimed.contains(ip))
            .ok_or(Error::AddressSpaceExhausted(self.network))
    }
}

/// Serialize a [`Duration`] as whole seconds.
mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(network: &str, reserved: Option<&str>) -> NetworkConfig {
        NetworkConfig::new(
            network.parse().unwrap(),
            reserved.map(|r| r.parse().unwrap()),
            Duration::from_secs(60),
        )
    }

    #[test]
    fn test_default_config() {
        let cfg = NetworkConfig::default();
        assert_eq!(cfg.network.to_string(), "10.99.0.0/16");
        assert_eq!(cfg.reserved_subnet.unwrap().to_string(), "10.99.0.0/23");
        assert_eq!(cfg.lease_time, Duration::from_secs(172800));
        cfg.validate().unwrap();
    }

    #[test]
    fn test_first_free_ip_skips_reserved() {
        let cfg = config("10.9.0.0/16", Some("10.9.0.0/20"));
        let ip = cfg.free_ip(&HashSet::new()).unwrap();
        assert_eq!(ip, Ipv4Addr::new(10, 9, 16, 1));
    }

    #[test]
    fn test_free_ip_skips_claimed_and_forbidden_octets() {
        let cfg = config("10.1.0.0/16", None);
        let mut claimed = HashSet::new();
        for i in 1..=254 {
            claimed.insert(Ipv4Addr::new(10, 1, 0, i));
        }
        // .255 and .0 of the next block are never handed out
        assert_eq!(cfg.free_ip(&claimed).unwrap(), Ipv4Addr::new(10, 1, 1, 1));
    }

    #[test]
    fn test_free_ip_never_returns_forbidden() {
        let cfg = config("10.2.0.0/22", Some("10.2.1.0/24"));
        let mut claimed = HashSet::new();
        while let Ok(ip) = cfg.free_ip(&claimed) {
            assert!(ip != cfg.network.network());
            assert!(ip.octets()[3] != 0 && ip.octets()[3] != 255);
            assert!(!cfg.reserved_subnet.unwrap().contains(&ip));
            assert!(claimed.insert(ip), "{ip} handed out twice");
        }
        // 10.2.0.x and 10.2.2.x, 10.2.3.x with .0/.255 removed
        assert_eq!(claimed.len(), 3 * 254);
    }

    #[test]
    fn test_free_ip_small_network() {
        let cfg = config("10.3.0.4/30", None);
        let first = cfg.free_ip(&HashSet::new()).unwrap();
        assert_eq!(first, Ipv4Addr::new(10, 3, 0, 5));
        let claimed = HashSet::from([first, Ipv4Addr::new(10, 3, 0, 6)]);
        assert!(matches!(
            cfg.free_ip(&claimed),
            Err(Error::AddressSpaceExhausted(_))
        ));
    }

    #[test]
    fn test_free_ip_skips_floating_subnet() {
        let cfg = config("10.9.0.0/16", Some("10.9.0.0/20"))
            .with_floating_subnet(Some("10.9.16.0/24".parse().unwrap()));
        cfg.validate().unwrap();
        assert_eq!(
            cfg.free_ip(&HashSet::new()).unwrap(),
            Ipv4Addr::new(10, 9, 17, 1)
        );
    }

    #[test]
    fn test_check_floating() {
        let cfg = config("10.9.0.0/16", Some("10.9.0.0/20"))
            .with_floating_subnet(Some("10.9.16.0/24".parse().unwrap()));
        cfg.check_floating(Ipv4Addr::new(10, 9, 16, 10)).unwrap();
        for ip in [
            Ipv4Addr::new(10, 10, 0, 1),
            Ipv4Addr::new(10, 9, 1, 1),
            Ipv4Addr::new(10, 9, 17, 1),
        ] {
            assert!(matches!(
                cfg.check_floating(ip),
                Err(Error::InvalidFloatingIp { .. })
            ));
        }

        // without a floating subnet anything outside the reserved block will do
        let open = config("10.9.0.0/16", Some("10.9.0.0/20"));
        open.check_floating(Ipv4Addr::new(10, 9, 200, 1)).unwrap();
    }

    #[test]
    fn test_floating_subnet_must_not_overlap_reserved() {
        let overlapping = config("10.9.0.0/16", Some("10.9.0.0/20"))
            .with_floating_subnet(Some("10.9.1.0/24".parse().unwrap()));
        assert!(matches!(
            overlapping.validate(),
            Err(Error::InvalidNetworkConfig(_))
        ));
        let outside = config("10.9.0.0/16", None)
            .with_floating_subnet(Some("10.10.0.0/24".parse().unwrap()));
        assert!(matches!(
            outside.validate(),
            Err(Error::InvalidNetworkConfig(_))
        ));
    }

    #[test]
    fn test_parse_json() {
        let cfg = NetworkConfig::parse(
            br#"{"network":"10.9.0.0/16","reservedSubnet":"10.9.0.0/20","leaseTime":120}"#,
        )
        .unwrap();
        assert_eq!(cfg, config("10.9.0.0/16", Some("10.9.0.0/20")).with_lease(120));

        let back = NetworkConfig::parse(&cfg.to_json().unwrap()).unwrap();
        assert_eq!(back, cfg);
    }

    #[test]
    fn test_parse_floating_subnet() {
        let cfg = NetworkConfig::parse(
            br#"{"network":"10.9.0.0/16","floatingSubnet":"10.9.2.0/23","leaseTime":60}"#,
        )
        .unwrap();
        assert_eq!(cfg.floating_subnet, Some("10.9.2.0/23".parse().unwrap()));
        assert_eq!(NetworkConfig::parse(&cfg.to_json().unwrap()).unwrap(), cfg);
    }

    #[test]
    fn test_parse_defaults_lease_time() {
        let cfg = NetworkConfig::parse(br#"{"network":"10.9.0.0/16"}"#).unwrap();
        assert_eq!(cfg.lease_time, DEFAULT_LEASE_TIME);
        assert!(cfg.reserved_subnet.is_none());
    }

    #[test]
    fn test_parse_rejects_reserved_outside_network() {
        let err = NetworkConfig::parse(
            br#"{"network":"10.9.0.0/16","reservedSubnet":"10.10.0.0/24","leaseTime":60}"#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidNetworkConfig(_)));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(NetworkConfig::parse(b"{\"network\":\"nope\"}").is_err());
        assert!(NetworkConfig::parse(b"not json").is_err());
    }

    impl NetworkConfig {
        fn with_lease(mut self, secs: u64) -> Self {
            self.lease_time = Duration::from_secs(secs);
            self
        }
    }
}
