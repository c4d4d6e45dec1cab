//! Error types for the control plane and datastore layer.

use std::net::Ipv4Addr;
use std::time::Duration;

use ipnet::Ipv4Net;
use thiserror::Error;

/// Errors raised by a [`KvStore`](crate::kv::KvStore) backend.
#[derive(Debug, Error)]
pub enum KvError {
    /// SQLite backend failure.
    #[error("sqlite: {0}")]
    Sqlite(#[from] sqlx::Error),

    /// A watcher fell behind and missed events.
    #[error("watch lagged, {0} events skipped")]
    Lagged(u64),
}

/// Errors surfaced by the mapping store and its helpers.
#[derive(Debug, Error)]
pub enum Error {
    /// A datastore call failed; `op` names the step that issued it.
    #[error("{op}: {source}")]
    Datastore {
        op: &'static str,
        #[source]
        source: KvError,
    },

    #[error("invalid network config: {0}")]
    InvalidNetworkConfig(String),

    #[error("invalid node record: {0}")]
    InvalidRecord(String),

    #[error("no free address left in {0}")]
    AddressSpaceExhausted(Ipv4Net),

    #[error("static ip {ip} is already claimed by machine {owner}")]
    StaticIpConflict { ip: Ipv4Addr, owner: String },

    #[error("static ip {ip} lies outside network {network}")]
    StaticIpOutsideNetwork { ip: Ipv4Addr, network: Ipv4Net },

    #[error("floating ip {ip} is {reason}")]
    InvalidFloatingIp { ip: Ipv4Addr, reason: &'static str },

    #[error("floating ip {ip} is already assigned to machine {owner}")]
    FloatingIpConflict { ip: Ipv4Addr, owner: String },

    #[error("cluster lock not acquired within {0:?}")]
    LockTimeout(Duration),

    /// `init` has not completed yet.
    #[error("mapping store not initialized")]
    NotInitialized,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Result type for control plane operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Attach the failing operation's name to a datastore error.
pub(crate) trait DatastoreContext<T> {
    fn op(self, op: &'static str) -> Result<T>;
}

impl<T> DatastoreContext<T> for std::result::Result<T, KvError> {
    fn op(self, op: &'static str) -> Result<T> {
        self.map_err(|source| Error::Datastore { op, source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_datastore_error_names_operation() {
        let res: std::result::Result<(), KvError> = Err(KvError::Lagged(3));
        let err = res.op("fetch network config").unwrap_err();
        assert_eq!(
            err.to_string(),
            "fetch network config: watch lagged, 3 events skipped"
        );
    }
}
