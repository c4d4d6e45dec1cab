//! Packet transforms applied between the device and the transport.
//!
//! Plugins run in ascending [`Plugin::order`] on the way out and in
//! descending order on the way in, so each transform is undone in the
//! reverse order it was applied.

pub mod compression;
pub mod encryption;

use std::sync::Arc;

use clap::ValueEnum;

use crate::mapping::Mapping;
use crate::payload::Payload;

pub use compression::Compression;
pub use encryption::Encryption;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Device to transport.
    Outgoing,
    /// Transport to device.
    Incoming,
}

pub trait Plugin: Send + Sync {
    /// Name advertised in `supportedPlugins`.
    fn name(&self) -> &'static str;

    fn order(&self) -> i32;

    /// Transform `payload` for exchange with `mapping`'s node.
    ///
    /// Returns `false` if the packet must be dropped. A plugin the peer
    /// does not support leaves the payload untouched and returns `true`.
    fn apply(&self, direction: Direction, payload: &mut Payload<'_>, mapping: &Mapping) -> bool;
}

/// Plugins selectable on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PluginKind {
    Compression,
    Encryption,
}

impl PluginKind {
    pub fn build(self) -> Arc<dyn Plugin> {
        match self {
            PluginKind::Compression => Arc::new(Compression::default()),
            PluginKind::Encryption => Arc::new(Encryption),
        }
    }
}

/// The configured plugins, sorted by order.
#[derive(Clone, Default)]
pub struct PluginChain {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl PluginChain {
    pub fn new(mut plugins: Vec<Arc<dyn Plugin>>) -> Self {
        plugins.sort_by_key(|p| p.order());
        plugins.dedup_by(|a, b| a.name() == b.name());
        Self { plugins }
    }

    pub fn from_kinds(kinds: &[PluginKind]) -> Self {
        Self::new(kinds.iter().map(|k| k.build()).collect())
    }

    pub fn outgoing(&self) -> impl Iterator<Item = &Arc<dyn Plugin>> {
        self.plugins.iter()
    }

    pub fn incoming(&self) -> impl Iterator<Item = &Arc<dyn Plugin>> {
        self.plugins.iter().rev()
    }

    /// Run every plugin for `direction`, stopping at the first failure.
    pub fn apply(
        &self,
        direction: Direction,
        payload: &mut Payload<'_>,
        mapping: &Mapping,
    ) -> bool {
        match direction {
            Direction::Outgoing => self
                .outgoing()
                .all(|p| p.apply(direction, payload, mapping)),
            Direction::Incoming => self
                .incoming()
                .all(|p| p.apply(direction, payload, mapping)),
        }
    }

    /// Names to advertise to peers.
    pub fn names(&self) -> Vec<String> {
        self.plugins.iter().map(|p| p.name().to_string()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{OrderedPlugin, mapping_for};
    use std::net::Ipv4Addr;
    use std::sync::Mutex;

    #[test]
    fn test_chain_sorted_by_order() {
        let chain = PluginChain::from_kinds(&[PluginKind::Encryption, PluginKind::Compression]);
        let out: Vec<_> = chain.outgoing().map(|p| p.name()).collect();
        let inc: Vec<_> = chain.incoming().map(|p| p.name()).collect();
        assert_eq!(out, vec!["compression", "encryption"]);
        assert_eq!(inc, vec!["encryption", "compression"]);
        assert_eq!(chain.names(), vec!["compression", "encryption"]);
    }

    #[test]
    fn test_duplicate_kinds_collapse() {
        let chain = PluginChain::from_kinds(&[PluginKind::Compression, PluginKind::Compression]);
        assert_eq!(chain.names(), vec!["compression"]);
    }

    #[test]
    fn test_empty_chain_passes_through() {
        let chain = PluginChain::default();
        let mapping = mapping_for("peer", Ipv4Addr::new(10, 0, 0, 2));
        let mut buf = [0u8; 64];
        buf[16..20].copy_from_slice(&[1, 2, 3, 4]);
        let mut payload = Payload::from_device(&mut buf, 4).unwrap();
        assert!(chain.apply(Direction::Outgoing, &mut payload, &mapping));
        assert_eq!(payload.packet(), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_failure_short_circuits() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = PluginChain::new(vec![
            Arc::new(OrderedPlugin::new("first", 0, log.clone())),
            Arc::new(OrderedPlugin::failing("second", 1, log.clone())),
            Arc::new(OrderedPlugin::new("third", 2, log.clone())),
        ]);
        let mapping = mapping_for("peer", Ipv4Addr::new(10, 0, 0, 2));
        let mut buf = [0u8; 32];
        let mut payload = Payload::from_device(&mut buf, 0).unwrap();

        assert!(!chain.apply(Direction::Outgoing, &mut payload, &mapping));
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                ("first", Direction::Outgoing),
                ("second", Direction::Outgoing)
            ]
        );
    }
}
