pub mod config;
pub mod dataplane;
pub mod error;
pub mod kv;
pub mod mapping;
pub mod metric;
pub mod network;
pub mod payload;
pub mod plugin;
pub mod router;
pub mod store;
pub mod test_util;

pub use error::{Error, KvError, Result};
