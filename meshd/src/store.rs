//! Mapping store: cluster membership and address allocation.
//!
//! The store owns the local node record, a cache of every node record in
//! the datastore and the shared [`NetworkConfig`]. It also competes for the
//! configured floating IPs: whichever node holds a claim's lease gets the
//! traffic for that address. Readers (the router and
//! every data plane worker) see the cache through an [`ArcSwap`], so lookups
//! never block. Writers (resync and watch) are serialized by `writer` and
//! always publish a complete table in one `store()`.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::{ArcSwap, ArcSwapOption};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};

use crate::error::{DatastoreContext, Error, Result};
use crate::kv::{KeyLayout, KvStore, WatchEvent};
use crate::mapping::{Mapping, NodeKeys, NodeRecord, ip_key};
use crate::network::NetworkConfig;

const WATCH_BACKOFF_MIN: Duration = Duration::from_millis(250);
const WATCH_BACKOFF_MAX: Duration = Duration::from_secs(30);
/// A lease is refreshed at least this many times per TTL.
const REFRESHES_PER_LEASE: u32 = 3;

type MappingTable = HashMap<u32, Arc<Mapping>>;

/// Where to send traffic for destinations outside the overlay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GatewayPolicy {
    /// Out-of-overlay traffic has no mapping and is dropped.
    #[default]
    Drop,
    /// Forward out-of-overlay traffic to the node owning this private IP.
    Node(Ipv4Addr),
}

/// Settings for a [`MappingStore`].
#[derive(Debug, Clone)]
pub struct StoreSettings {
    /// Root of every key this node reads or writes.
    pub prefix: String,
    pub machine_id: String,
    /// Static private IP; allocated from the network when unset.
    pub private_ip: Option<Ipv4Addr>,
    pub public_address: IpAddr,
    pub public_port: u16,
    /// Plugin names advertised to peers.
    pub supported_plugins: Vec<String>,
    /// Written to the datastore by the first node of a cluster.
    pub default_network: NetworkConfig,
    pub sync_interval: Duration,
    pub refresh_interval: Duration,
    pub lock_ttl: Duration,
    pub lock_retry: Duration,
    /// Give up on the cluster lock after this long. Retries forever if unset.
    pub lock_timeout: Option<Duration>,
    pub gateway: GatewayPolicy,
    /// Shared addresses this node offers to hold.
    pub floating_ips: Vec<Ipv4Addr>,
    /// Lease of a floating IP claim.
    pub floating_ttl: Duration,
}

impl StoreSettings {
    pub fn new(machine_id: impl Into<String>, public_address: IpAddr, public_port: u16) -> Self {
        Self {
            prefix: "/meshd".to_string(),
            machine_id: machine_id.into(),
            private_ip: None,
            public_address,
            public_port,
            supported_plugins: Vec::new(),
            default_network: NetworkConfig::default(),
            sync_interval: Duration::from_secs(60),
            refresh_interval: Duration::from_secs(60),
            lock_ttl: Duration::from_secs(10),
            lock_retry: Duration::from_secs(1),
            lock_timeout: None,
            gateway: GatewayPolicy::Drop,
            floating_ips: Vec::new(),
            floating_ttl: Duration::from_secs(10),
        }
    }
}

/// Read-only view of the mapping table, as consumed by the router.
pub trait MappingSource: Send + Sync {
    /// Mapping of the node owning `ip`.
    fn mapping(&self, ip: Ipv4Addr) -> Option<Arc<Mapping>>;

    /// Mapping used for destinations outside the overlay network.
    fn gateway_mapping(&self) -> Option<Arc<Mapping>>;
}

pub struct MappingStore {
    kv: Arc<dyn KvStore>,
    keys: KeyLayout,
    settings: StoreSettings,
    node_keys: NodeKeys,
    network: ArcSwapOption<NetworkConfig>,
    local: ArcSwapOption<Mapping>,
    mappings: ArcSwap<MappingTable>,
    /// Held while building and publishing a new table.
    writer: tokio::sync::Mutex<()>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MappingStore {
    pub fn new(kv: Arc<dyn KvStore>, settings: StoreSettings, node_keys: NodeKeys) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            kv,
            keys: KeyLayout::new(&settings.prefix),
            settings,
            node_keys,
            network: ArcSwapOption::empty(),
            local: ArcSwapOption::empty(),
            mappings: ArcSwap::from_pointee(HashMap::new()),
            writer: tokio::sync::Mutex::new(()),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Join the cluster: claim a private IP and publish the local record.
    pub async fn init(&self) -> Result<()> {
        let lock_key = self.keys.lock();
        self.acquire_lock(&lock_key).await?;

        let result = self.init_locked().await;

        if let Err(e) = self.kv.delete(&lock_key).await {
            warn!(error = %e, "failed to release cluster lock, it will expire on its own");
        } else {
            debug!("cluster lock released");
        }

        result
    }

    async fn acquire_lock(&self, key: &str) -> Result<()> {
        let started = Instant::now();
        let owner = self.settings.machine_id.as_bytes().to_vec();

        loop {
            let acquired = self
                .kv
                .create(key, owner.clone(), Some(self.settings.lock_ttl))
                .await
                .op("acquire cluster lock")?;
            if acquired {
                debug!(machine_id = %self.settings.machine_id, "cluster lock acquired");
                return Ok(());
            }

            if let Some(timeout) = self.settings.lock_timeout
                && started.elapsed() >= timeout
            {
                return Err(Error::LockTimeout(timeout));
            }
            debug!(retry_in = ?self.settings.lock_retry, "cluster lock busy");
            tokio::time::sleep(self.settings.lock_retry).await;
        }
    }

    async fn init_locked(&self) -> Result<()> {
        let network = self.fetch_network_config().await?;

        let _guard = self.writer.lock().await;
        let mut table = self.fetch_mappings().await?;
        let private_ip = self.choose_private_ip(&network, &table)?;
        self.check_floating_ips(&network, &table, private_ip)?;

        let local = Arc::new(Mapping::from_record(
            NodeRecord {
                machine_id: self.settings.machine_id.clone(),
                private_ip,
                public_address: self.settings.public_address,
                public_port: self.settings.public_port,
                public_key: self.node_keys.public_key().to_bytes(),
                supported_plugins: self.settings.supported_plugins.clone(),
                floating: false,
            },
            &self.node_keys,
        ));
        self.publish(&local, network.lease_time).await?;

        let name = local.key_name();
        table.retain(|_, m| m.key_name() != name);
        table.insert(ip_key(private_ip), local.clone());
        self.mappings.store(Arc::new(table));
        self.network.store(Some(Arc::new(network)));
        self.local.store(Some(local));

        info!(
            machine_id = %self.settings.machine_id,
            private_ip = %private_ip,
            "joined overlay network"
        );
        Ok(())
    }

    async fn fetch_network_config(&self) -> Result<NetworkConfig> {
        let key = self.keys.config();
        match self.kv.get(&key).await.op("fetch network config")? {
            Some(bytes) => NetworkConfig::parse(&bytes),
            None => {
                let config = self.settings.default_network.clone();
                config.validate()?;
                self.kv
                    .put(&key, config.to_json()?, None)
                    .await
                    .op("store default network config")?;
                info!(network = %config.network, "stored default network config");
                Ok(config)
            }
        }
    }

    /// Read every node record from the datastore.
    async fn fetch_mappings(&self) -> Result<MappingTable> {
        let entries = self
            .kv
            .list(&self.keys.nodes())
            .await
            .op("list node records")?;

        let mut table = MappingTable::with_capacity(entries.len());
        for entry in entries {
            match self.parse_record(&entry.key, &entry.value) {
                Ok(mapping) => insert_mapping(&mut table, Arc::new(mapping)),
                Err(e) => warn!(key = %entry.key, error = %e, "skipping node record"),
            }
        }
        Ok(table)
    }

    fn parse_record(&self, key: &str, value: &[u8]) -> Result<Mapping> {
        let record = NodeRecord::parse(value)?;
        let name = record.key_name();
        if self.keys.node_name(key) != Some(name.as_str()) {
            return Err(Error::InvalidRecord(format!(
                "record for {name} stored under {key}"
            )));
        }
        Ok(Mapping::from_record(record, &self.node_keys))
    }

    fn choose_private_ip(&self, network: &NetworkConfig, table: &MappingTable) -> Result<Ipv4Addr> {
        let machine_id = &self.settings.machine_id;

        if let Some(ip) = self.settings.private_ip {
            if !network.contains(ip) {
                return Err(Error::StaticIpOutsideNetwork {
                    ip,
                    network: network.network,
                });
            }
            if let Some(owner) = table.get(&ip_key(ip))
                && (owner.floating || &owner.machine_id != machine_id)
            {
                return Err(Error::StaticIpConflict {
                    ip,
                    owner: owner.machine_id.clone(),
                });
            }
            return Ok(ip);
        }

        if let Some(existing) = table.values().find(|m| {
            !m.floating && &m.machine_id == machine_id && network.contains(m.private_ip)
        }) {
            debug!(private_ip = %existing.private_ip, "reusing private ip");
            return Ok(existing.private_ip);
        }

        let claimed: HashSet<Ipv4Addr> = table.values().map(|m| m.private_ip).collect();
        network.free_ip(&claimed)
    }

    /// Floating IPs must be claimable and not be any node's own address.
    fn check_floating_ips(
        &self,
        network: &NetworkConfig,
        table: &MappingTable,
        private_ip: Ipv4Addr,
    ) -> Result<()> {
        for &ip in &self.settings.floating_ips {
            network.check_floating(ip)?;
            if ip == private_ip {
                return Err(Error::FloatingIpConflict {
                    ip,
                    owner: self.settings.machine_id.clone(),
                });
            }
            if let Some(owner) = table.get(&ip_key(ip))
                && !owner.floating
            {
                return Err(Error::FloatingIpConflict {
                    ip,
                    owner: owner.machine_id.clone(),
                });
            }
        }
        Ok(())
    }

    /// Write the local record with a fresh lease.
    async fn publish(&self, local: &Mapping, lease: Duration) -> Result<()> {
        let value = local.record().to_json()?;
        self.kv
            .put(&self.keys.node(&local.machine_id), value, Some(lease))
            .await
            .op("publish local record")
    }

    /// Launch the resync, lease refresh and watch tasks.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let network = self.network().ok_or(Error::NotInitialized)?;
        if self.local().is_none() {
            return Err(Error::NotInitialized);
        }

        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        if !tasks.is_empty() {
            warn!("mapping store already started");
            return Ok(());
        }

        let refresh = refresh_period(self.settings.refresh_interval, network.lease_time);
        if refresh < self.settings.refresh_interval {
            warn!(
                configured = ?self.settings.refresh_interval,
                lease = ?network.lease_time,
                refresh = ?refresh,
                "refresh interval does not fit inside the cluster lease, shortened"
            );
        }

        tasks.push(tokio::spawn(self.clone().resync_loop(self.shutdown.subscribe())));
        tasks.push(tokio::spawn(
            self.clone().refresh_loop(refresh, self.shutdown.subscribe()),
        ));
        tasks.push(tokio::spawn(self.clone().watch_loop(self.shutdown.subscribe())));
        for &ip in &self.settings.floating_ips {
            tasks.push(tokio::spawn(
                self.clone().floating_loop(ip, self.shutdown.subscribe()),
            ));
        }
        info!(
            sync_interval = ?self.settings.sync_interval,
            refresh_interval = ?refresh,
            floating_ips = self.settings.floating_ips.len(),
            "mapping store started"
        );
        Ok(())
    }

    /// Stop the background tasks. Safe to call more than once.
    pub async fn stop(&self) {
        self.shutdown.send_replace(true);
        let tasks: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            tasks.drain(..).collect()
        };
        if tasks.is_empty() {
            return;
        }
        for task in tasks {
            if let Err(e) = task.await {
                error!(error = %e, "mapping store task failed");
            }
        }
        info!("mapping store stopped");
    }

    /// Remove the local record and any floating IP claims this node holds.
    pub async fn deregister(&self) -> Result<()> {
        for &ip in &self.settings.floating_ips {
            if let Err(e) = self.release_floating(ip).await {
                warn!(floating_ip = %ip, error = %e, "failed to release floating ip");
            }
        }
        self.kv
            .delete(&self.keys.node(&self.settings.machine_id))
            .await
            .op("delete local record")
    }

    pub fn local(&self) -> Option<Arc<Mapping>> {
        self.local.load_full()
    }

    pub fn network(&self) -> Option<Arc<NetworkConfig>> {
        self.network.load_full()
    }

    /// Floating IPs this node holds according to its mapping table.
    pub fn held_floating_ips(&self) -> Vec<Ipv4Addr> {
        let mut held: Vec<Ipv4Addr> = self
            .mappings
            .load()
            .values()
            .filter(|m| m.floating && m.machine_id == self.settings.machine_id)
            .map(|m| m.private_ip)
            .collect();
        held.sort();
        held
    }

    /// Every known mapping, local one included.
    pub fn snapshot(&self) -> Vec<Arc<Mapping>> {
        self.mappings.load().values().cloned().collect()
    }

    /// Replace the table with a fresh read of the datastore.
    async fn resync(&self) -> Result<()> {
        let _guard = self.writer.lock().await;
        let table = self.fetch_mappings().await?;
        debug!(nodes = table.len(), "mapping table resynced");
        self.mappings.store(Arc::new(table));
        Ok(())
    }

    /// Apply one watch event as a single table swap.
    async fn apply(&self, event: WatchEvent) {
        let _guard = self.writer.lock().await;
        let mut next = (**self.mappings.load()).clone();

        match event {
            WatchEvent::Put { key, value } => match self.parse_record(&key, &value) {
                Ok(mapping) => {
                    debug!(
                        machine_id = %mapping.machine_id,
                        private_ip = %mapping.private_ip,
                        "node updated"
                    );
                    let name = mapping.key_name();
                    next.retain(|_, m| m.key_name() != name);
                    insert_mapping(&mut next, Arc::new(mapping));
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "ignoring node record");
                    return;
                }
            },
            WatchEvent::Delete { key } => {
                let Some(name) = self.keys.node_name(&key) else {
                    return;
                };
                debug!(name = %name, "node removed");
                next.retain(|_, m| m.key_name() != name);
            }
        }

        self.mappings.store(Arc::new(next));
    }

    async fn resync_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let period = self.settings.sync_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !*shutdown.borrow() {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.resync().await {
                        warn!(error = %e, "resync failed");
                    }
                }
            }
        }
        debug!("resync loop exited");
    }

    async fn refresh_loop(self: Arc<Self>, period: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !*shutdown.borrow() {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    let (Some(local), Some(network)) = (self.local(), self.network()) else {
                        continue;
                    };
                    match self.publish(&local, network.lease_time).await {
                        Ok(()) => debug!(private_ip = %local.private_ip, "lease refreshed"),
                        Err(e) => error!(error = %e, "lease refresh failed"),
                    }
                }
            }
        }
        debug!("refresh loop exited");
    }

    async fn watch_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let prefix = self.keys.nodes();
        let mut backoff = WATCH_BACKOFF_MIN;

        while !*shutdown.borrow() {
            match self.kv.watch(&prefix).await {
                Ok(mut stream) => {
                    // Pick up whatever changed while we were not watching.
                    if let Err(e) = self.resync().await {
                        warn!(error = %e, "resync after watch connect failed");
                    }
                    backoff = WATCH_BACKOFF_MIN;

                    loop {
                        tokio::select! {
                            _ = shutdown.changed() => {
                                debug!("watch loop exited");
                                return;
                            }
                            event = stream.next() => match event {
                                Some(Ok(event)) => self.apply(event).await,
                                Some(Err(e)) => {
                                    warn!(error = %e, "watch stream failed");
                                    break;
                                }
                                None => {
                                    warn!("watch stream closed");
                                    break;
                                }
                            }
                        }
                    }
                }
                Err(e) => warn!(error = %e, retry_in = ?backoff, "failed to watch node records"),
            }

            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(WATCH_BACKOFF_MAX);
        }
        debug!("watch loop exited");
    }

    /// Whether `value` is a floating claim made by this node.
    fn holds(&self, value: &[u8]) -> bool {
        NodeRecord::parse(value)
            .is_ok_and(|r| r.floating && r.machine_id == self.settings.machine_id)
    }

    /// Take or refresh the claim on `ip`. Returns whether this node holds it.
    async fn claim_floating(&self, ip: Ipv4Addr) -> Result<bool> {
        let local = self.local().ok_or(Error::NotInitialized)?;
        let mut record = local.record();
        record.private_ip = ip;
        record.floating = true;

        let key = self.keys.node(&record.key_name());
        let value = record.to_json()?;
        let ttl = Some(self.settings.floating_ttl);

        if self
            .kv
            .create(&key, value.clone(), ttl)
            .await
            .op("claim floating ip")?
        {
            return Ok(true);
        }
        match self.kv.get(&key).await.op("read floating ip claim")? {
            Some(current) if self.holds(&current) => {
                self.kv
                    .put(&key, value, ttl)
                    .await
                    .op("refresh floating ip")?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_floating(&self, ip: Ipv4Addr) -> Result<()> {
        let key = self.keys.node(&ip.to_string());
        match self.kv.get(&key).await.op("read floating ip claim")? {
            Some(current) if self.holds(&current) => {
                self.kv
                    .delete(&key)
                    .await
                    .op("release floating ip")?;
                info!(floating_ip = %ip, "floating ip released");
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Hold `ip` while this process lives, or retry once the holder's
    /// claim could have lapsed.
    async fn floating_loop(self: Arc<Self>, ip: Ipv4Addr, mut shutdown: watch::Receiver<bool>) {
        let ttl = self.settings.floating_ttl;
        let mut held = None;

        while !*shutdown.borrow() {
            let now_held = match self.claim_floating(ip).await {
                Ok(now_held) => now_held,
                Err(e) => {
                    warn!(floating_ip = %ip, error = %e, "floating ip claim failed");
                    false
                }
            };
            if held != Some(now_held) {
                if now_held {
                    info!(floating_ip = %ip, "floating ip claimed");
                } else {
                    info!(floating_ip = %ip, "floating ip held by another node");
                }
                held = Some(now_held);
            }

            let wait = if now_held {
                refresh_period(ttl, ttl)
            } else {
                ttl
            };
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }
        debug!(floating_ip = %ip, "floating ip loop exited");
    }
}

/// Add `mapping` to `table`. A node's own address wins over a floating claim.
fn insert_mapping(table: &mut MappingTable, mapping: Arc<Mapping>) {
    let key = ip_key(mapping.private_ip);
    if let Some(prev) = table.get(&key) {
        if mapping.floating && !prev.floating {
            warn!(
                private_ip = %mapping.private_ip,
                owner = %prev.machine_id,
                "ignoring floating claim on a node address"
            );
            return;
        }
        if prev.key_name() != mapping.key_name() {
            warn!(
                private_ip = %prev.private_ip,
                machine_id = %prev.machine_id,
                "private ip claimed by more than one node"
            );
        }
    }
    table.insert(key, mapping);
}

/// Refresh period that keeps a record alive under `lease`.
fn refresh_period(configured: Duration, lease: Duration) -> Duration {
    let ceiling = (lease / REFRESHES_PER_LEASE).max(Duration::from_millis(1));
    configured.min(ceiling)
}

impl MappingSource for MappingStore {
    fn mapping(&self, ip: Ipv4Addr) -> Option<Arc<Mapping>> {
        self.mappings.load().get(&ip_key(ip)).cloned()
    }

    fn gateway_mapping(&self) -> Option<Arc<Mapping>> {
        match self.settings.gateway {
            GatewayPolicy::Drop => None,
            GatewayPolicy::Node(ip) => self.mapping(ip),
        }
    }
}
