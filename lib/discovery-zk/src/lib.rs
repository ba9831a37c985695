//! Service discovery over a ZooKeeper-style coordination store
//!
//! Instances register as protected ephemeral sequential nodes under
//! `<root>/<service>`. Lookups read that subtree and arm a children watch;
//! watch deliveries and a periodic refresh keep the connection cache and
//! the resolvers handed out by `get_conn` current.

pub mod client;
pub mod config;
mod event_loop;
mod refresh;
pub mod resolver;
mod session;
pub mod state;
pub mod store;

pub use client::ZkClient;
pub use config::{Credentials, ZkConfig, ZkConfigBuilder};
pub use resolver::ResolverHandle;
pub use state::Registration;
pub use store::{Connector, CoordinationStore, MemoryStore};

#[cfg(feature = "zookeeper")]
pub use store::zookeeper::ZooKeeperConnector;
