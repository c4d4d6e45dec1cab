//! Destination resolution for the data plane.

use std::net::Ipv4Addr;
use std::sync::Arc;

use ipnet::Ipv4Net;

use crate::mapping::Mapping;
use crate::store::MappingSource;

/// Resolves packet addresses to peer mappings.
///
/// Addresses inside the overlay network map to the owning node; everything
/// else goes through the gateway mapping.
#[derive(Clone)]
pub struct Router {
    network: Ipv4Net,
    source: Arc<dyn MappingSource>,
}

impl Router {
    pub fn new(network: Ipv4Net, source: Arc<dyn MappingSource>) -> Self {
        Self { network, source }
    }

    pub fn resolve(&self, destination: Ipv4Addr) -> Option<Arc<Mapping>> {
        if self.network.contains(&destination) {
            self.source.mapping(destination)
        } else {
            self.source.gateway_mapping()
        }
    }
}
