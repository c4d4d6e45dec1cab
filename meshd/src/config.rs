//! Command line and environment configuration.

use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, ValueEnum};
use ipnet::Ipv4Net;
use tracing::{debug, warn};

use crate::dataplane::DataplaneSettings;
use crate::dataplane::tun::DEFAULT_NAME;
use crate::dataplane::udp::DEFAULT_PORT;
use crate::error::{Error, Result};
use crate::kv::DatastoreKind;
use crate::network::NetworkConfig;
use crate::plugin::{PluginChain, PluginKind};
use crate::store::{GatewayPolicy, StoreSettings};

const MACHINE_ID_PATH: &str = "/etc/machine-id";

/// Longest interface name the kernel accepts, without the trailing NUL.
const MAX_DEVICE_NAME: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DatastoreArg {
    Memory,
    Sqlite,
}

#[derive(Parser, Debug, Clone)]
#[command(name = "meshd")]
#[command(about = "Overlay network node")]
pub struct NodeArgs {
    /// Unique id of this machine [default: /etc/machine-id or a random uuid]
    #[arg(long, env = "MESHD_MACHINE_ID")]
    pub machine_id: Option<String>,

    /// Static private IP inside the overlay network
    #[arg(long, env = "MESHD_PRIVATE_IP")]
    pub private_ip: Option<Ipv4Addr>,

    /// Address other nodes reach us at [default: auto-detected]
    #[arg(long, env = "MESHD_PUBLIC_ADDRESS")]
    pub public_address: Option<IpAddr>,

    /// Address the transport binds to
    #[arg(long, env = "MESHD_LISTEN", default_value = "0.0.0.0")]
    pub listen: IpAddr,

    /// UDP port of the transport
    #[arg(short, long, env = "MESHD_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Name of the TUN device
    #[arg(long, env = "MESHD_DEVICE", default_value = DEFAULT_NAME)]
    pub device: String,

    /// Worker queues, 0 for one per CPU
    #[arg(short, long, env = "MESHD_WORKERS", default_value = "0")]
    pub workers: usize,

    /// Datastore key prefix
    #[arg(long, env = "MESHD_PREFIX", default_value = "/meshd")]
    pub prefix: String,

    /// Datastore backend
    #[arg(long, env = "MESHD_DATASTORE", value_enum, default_value = "memory")]
    pub datastore: DatastoreArg,

    /// Database file for the sqlite datastore
    #[arg(long, env = "MESHD_DATASTORE_PATH", default_value = "/var/lib/meshd/meshd.db")]
    pub datastore_path: PathBuf,

    /// Overlay network written to the datastore if the cluster has none yet
    #[arg(long, env = "MESHD_NETWORK")]
    pub network: Option<Ipv4Net>,

    /// Subnet excluded from dynamic allocation, for static addresses
    #[arg(long, env = "MESHD_RESERVED_SUBNET")]
    pub reserved_subnet: Option<Ipv4Net>,

    /// Subnet reserved for floating IPs, for a new cluster's network config
    #[arg(long, env = "MESHD_FLOATING_SUBNET")]
    pub floating_subnet: Option<Ipv4Net>,

    /// Floating IPs this node competes for, comma separated
    #[arg(long, env = "MESHD_FLOATING_IPS", value_delimiter = ',')]
    pub floating_ips: Vec<Ipv4Addr>,

    /// Lease of a floating IP claim
    #[arg(long, env = "MESHD_FLOATING_TTL", value_parser = parse_duration, default_value = "10s")]
    pub floating_ttl: Duration,

    /// Lease of a node record, for a new cluster's network config
    #[arg(long, env = "MESHD_LEASE_TIME", value_parser = parse_duration, default_value = "48h")]
    pub lease_time: Duration,

    /// Full resync of the mapping table
    #[arg(long, env = "MESHD_SYNC_INTERVAL", value_parser = parse_duration, default_value = "60s")]
    pub sync_interval: Duration,

    /// Lease refresh of the local record
    #[arg(long, env = "MESHD_REFRESH_INTERVAL", value_parser = parse_duration, default_value = "60s")]
    pub refresh_interval: Duration,

    /// TTL of the cluster lock
    #[arg(long, env = "MESHD_LOCK_TTL", value_parser = parse_duration, default_value = "10s")]
    pub lock_ttl: Duration,

    /// Wait between attempts to take the cluster lock
    #[arg(long, env = "MESHD_LOCK_RETRY", value_parser = parse_duration, default_value = "1s")]
    pub lock_retry: Duration,

    /// Give up on the cluster lock after this long [default: never]
    #[arg(long, env = "MESHD_LOCK_TIMEOUT", value_parser = parse_duration)]
    pub lock_timeout: Option<Duration>,

    /// Packet plugins to enable and advertise
    #[arg(
        long,
        env = "MESHD_PLUGINS",
        value_enum,
        value_delimiter = ',',
        default_values_t = [PluginKind::Compression, PluginKind::Encryption]
    )]
    pub plugins: Vec<PluginKind>,

    /// Private IP of the node that handles traffic leaving the overlay
    #[arg(long, env = "MESHD_GATEWAY")]
    pub gateway: Option<Ipv4Addr>,

    /// Log traffic stats this often, 0 to disable
    #[arg(long, env = "MESHD_STATS_INTERVAL", value_parser = parse_duration, default_value = "60s")]
    pub stats_interval: Duration,

    /// Pin each worker queue to one CPU
    #[arg(long, env = "MESHD_PIN_WORKERS")]
    pub pin_workers: bool,

    /// Log level used when RUST_LOG is unset
    #[arg(long, env = "MESHD_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

/// Parse `500ms`, `30s`, `5m`, `48h` or a bare number of seconds.
pub fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    let s = s.trim();
    let (number, unit): (&str, fn(u64) -> Duration) = if let Some(n) = s.strip_suffix("ms") {
        (n, Duration::from_millis)
    } else if let Some(n) = s.strip_suffix('s') {
        (n, Duration::from_secs)
    } else if let Some(n) = s.strip_suffix('m') {
        (n, |m| Duration::from_secs(m.saturating_mul(60)))
    } else if let Some(n) = s.strip_suffix('h') {
        (n, |h| Duration::from_secs(h.saturating_mul(60 * 60)))
    } else {
        (s, Duration::from_secs)
    };

    number
        .trim()
        .parse::<u64>()
        .map(unit)
        .map_err(|_| format!("invalid duration: {s:?}"))
}

/// This machine's id, from `/etc/machine-id` or a fresh uuid.
pub fn machine_id() -> String {
    machine_id_from(Path::new(MACHINE_ID_PATH))
}

fn machine_id_from(path: &Path) -> String {
    match fs::read_to_string(path) {
        Ok(id) if !id.trim().is_empty() => id.trim().to_string(),
        Ok(_) => {
            warn!(path = %path.display(), "machine id file is empty, using a random id");
            uuid::Uuid::new_v4().to_string()
        }
        Err(e) => {
            debug!(path = %path.display(), error = %e, "no machine id file, using a random id");
            uuid::Uuid::new_v4().to_string()
        }
    }
}

/// Address of the interface holding the default route.
///
/// Connecting a UDP socket only selects a route; nothing is sent.
pub fn detect_public_address() -> std::io::Result<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.connect("192.0.2.1:9")?;
    Ok(socket.local_addr()?.ip())
}

impl NodeArgs {
    /// Check values clap cannot check on its own.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("sync-interval", self.sync_interval),
            ("refresh-interval", self.refresh_interval),
            ("lock-ttl", self.lock_ttl),
            ("lock-retry", self.lock_retry),
            ("lease-time", self.lease_time),
            ("floating-ttl", self.floating_ttl),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, d)| d.is_zero()) {
            return Err(Error::Config(format!("{name} must be greater than zero")));
        }
        if self.refresh_interval >= self.lease_time {
            return Err(Error::Config(format!(
                "refresh-interval ({:?}) must be shorter than lease-time ({:?})",
                self.refresh_interval, self.lease_time
            )));
        }
        if self.device.is_empty() || self.device.len() > MAX_DEVICE_NAME {
            return Err(Error::Config(format!(
                "device name {:?} must be 1 to {MAX_DEVICE_NAME} bytes",
                self.device
            )));
        }
        if self.prefix.is_empty() {
            return Err(Error::Config("prefix must not be empty".to_string()));
        }
        if self.plugins.is_empty() {
            debug!("no plugins enabled, traffic is sent in the clear");
        }
        self.default_network().validate()
    }

    /// Network config written by the first node of a cluster.
    pub fn default_network(&self) -> NetworkConfig {
        let defaults = NetworkConfig::default();
        let (network, reserved) = match self.network {
            Some(network) => (network, self.reserved_subnet),
            None => (
                defaults.network,
                self.reserved_subnet.or(defaults.reserved_subnet),
            ),
        };
        NetworkConfig::new(network, reserved, self.lease_time)
            .with_floating_subnet(self.floating_subnet)
    }

    pub fn plugin_chain(&self) -> PluginChain {
        PluginChain::from_kinds(&self.plugins)
    }

    pub fn datastore_kind(&self) -> DatastoreKind {
        match self.datastore {
            DatastoreArg::Memory => DatastoreKind::Memory,
            DatastoreArg::Sqlite => DatastoreKind::Sqlite {
                path: self.datastore_path.clone(),
            },
        }
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen, self.port)
    }

    pub fn stats_interval(&self) -> Option<Duration> {
        (!self.stats_interval.is_zero()).then_some(self.stats_interval)
    }

    /// Settings for the mapping store, resolving machine id and public address.
    pub fn store_settings(&self) -> Result<StoreSettings> {
        self.validate()?;

        let id = self.machine_id.clone().unwrap_or_else(machine_id);
        let public_address = match self.public_address {
            Some(addr) => addr,
            None => detect_public_address().map_err(|e| {
                Error::Config(format!(
                    "cannot detect public address, set --public-address: {e}"
                ))
            })?,
        };

        let mut settings = StoreSettings::new(id, public_address, self.port);
        settings.prefix = self.prefix.clone();
        settings.private_ip = self.private_ip;
        settings.supported_plugins = self.plugin_chain().names();
        settings.default_network = self.default_network();
        settings.sync_interval = self.sync_interval;
        settings.refresh_interval = self.refresh_interval;
        settings.lock_ttl = self.lock_ttl;
        settings.lock_retry = self.lock_retry;
        settings.lock_timeout = self.lock_timeout;
        settings.gateway = self
            .gateway
            .map_or(GatewayPolicy::Drop, GatewayPolicy::Node);
        settings.floating_ips = self.floating_ips.clone();
        settings.floating_ttl = self.floating_ttl;
        Ok(settings)
    }

    pub fn dataplane_settings(&self) -> DataplaneSettings {
        let workers = match self.workers {
            0 => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            n => n,
        };
        DataplaneSettings {
            workers,
            pin_workers: self.pin_workers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn args(extra: &[&str]) -> NodeArgs {
        let mut argv = vec![
            "meshd",
            "--machine-id",
            "m1",
            "--public-address",
            "192.0.2.5",
        ];
        argv.extend_from_slice(extra);
        NodeArgs::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("500ms"), Ok(Duration::from_millis(500)));
        assert_eq!(parse_duration("30s"), Ok(Duration::from_secs(30)));
        assert_eq!(parse_duration("5m"), Ok(Duration::from_secs(300)));
        assert_eq!(parse_duration("48h"), Ok(Duration::from_secs(48 * 3600)));
        assert_eq!(parse_duration("7"), Ok(Duration::from_secs(7)));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("10x").is_err());
        assert!(parse_duration("-1s").is_err());
    }

    #[test]
    fn test_defaults() {
        let args = args(&[]);
        assert_eq!(args.port, 1099);
        assert_eq!(args.device, "meshd0");
        assert_eq!(args.prefix, "/meshd");
        assert_eq!(args.datastore, DatastoreArg::Memory);
        assert_eq!(
            args.plugins,
            vec![PluginKind::Compression, PluginKind::Encryption]
        );
        assert_eq!(args.lock_timeout, None);
        assert_eq!(args.default_network(), NetworkConfig::default());
    }

    #[test]
    fn test_store_settings() {
        let args = args(&[
            "--prefix",
            "/cluster",
            "--private-ip",
            "10.99.0.4",
            "--plugins",
            "encryption",
            "--gateway",
            "10.99.0.1",
            "--refresh-interval",
            "30s",
            "--lock-timeout",
            "1m",
        ]);
        let settings = args.store_settings().unwrap();
        assert_eq!(settings.machine_id, "m1");
        assert_eq!(settings.prefix, "/cluster");
        assert_eq!(settings.public_address, "192.0.2.5".parse::<IpAddr>().unwrap());
        assert_eq!(settings.private_ip, Some(Ipv4Addr::new(10, 99, 0, 4)));
        assert_eq!(settings.supported_plugins, vec!["encryption".to_string()]);
        assert_eq!(
            settings.gateway,
            GatewayPolicy::Node(Ipv4Addr::new(10, 99, 0, 1))
        );
        assert_eq!(settings.refresh_interval, Duration::from_secs(30));
        assert_eq!(settings.lock_timeout, Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_floating_ip_settings() {
        let args = args(&[
            "--floating-ips",
            "10.99.2.1,10.99.2.2",
            "--floating-subnet",
            "10.99.2.0/23",
            "--floating-ttl",
            "5s",
        ]);
        assert_eq!(
            args.default_network().floating_subnet,
            Some("10.99.2.0/23".parse().unwrap())
        );
        let settings = args.store_settings().unwrap();
        assert_eq!(
            settings.floating_ips,
            vec![Ipv4Addr::new(10, 99, 2, 1), Ipv4Addr::new(10, 99, 2, 2)]
        );
        assert_eq!(settings.floating_ttl, Duration::from_secs(5));
        assert!(self::args(&[]).store_settings().unwrap().floating_ips.is_empty());
    }

    #[test]
    fn test_custom_network_drops_default_reserved_subnet() {
        let args = args(&["--network", "172.16.0.0/24"]);
        let network = args.default_network();
        assert_eq!(network.network, "172.16.0.0/24".parse::<Ipv4Net>().unwrap());
        assert_eq!(network.reserved_subnet, None);
    }

    #[test]
    fn test_validate_rejects() {
        assert!(matches!(
            args(&["--refresh-interval", "0"]).store_settings(),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            args(&["--refresh-interval", "2h", "--lease-time", "1h"]).validate(),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            args(&["--device", "a-much-too-long-name"]).validate(),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            args(&["--network", "10.0.0.0/24", "--reserved-subnet", "10.1.0.0/28"]).validate(),
            Err(Error::InvalidNetworkConfig(_))
        ));
    }

    #[test]
    fn test_dataplane_settings() {
        let settings = args(&["--workers", "3", "--pin-workers"]).dataplane_settings();
        assert_eq!(settings.workers, 3);
        assert!(settings.pin_workers);
        assert!(args(&[]).dataplane_settings().workers >= 1);
    }

    #[test]
    fn test_datastore_kind() {
        let args = args(&["--datastore", "sqlite", "--datastore-path", "/tmp/x.db"]);
        assert_eq!(
            args.datastore_kind(),
            DatastoreKind::Sqlite {
                path: PathBuf::from("/tmp/x.db")
            }
        );
    }

    #[test]
    fn test_machine_id_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "abc123").unwrap();
        assert_eq!(machine_id_from(file.path()), "abc123");

        let empty = NamedTempFile::new().unwrap();
        let generated = machine_id_from(empty.path());
        assert!(uuid::Uuid::parse_str(&generated).is_ok());
    }

    #[test]
    fn test_stats_interval_zero_disables() {
        assert_eq!(args(&["--stats-interval", "0"]).stats_interval(), None);
        assert_eq!(
            args(&[]).stats_interval(),
            Some(Duration::from_secs(60))
        );
    }
}
