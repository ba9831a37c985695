//! Capability traits exposed to RPC client code
//!
//! Callers depend on these traits only; each coordination backend provides
//! one implementation.

use crate::{DialOptions, Result};
use async_trait::async_trait;
use tonic::transport::Channel;

/// Connection lookup for named services
#[async_trait]
pub trait Conn: Send + Sync {
    /// All instances of `service_name`, dialed. Served from the local cache
    /// when possible.
    async fn get_conns(&self, service_name: &str, opts: DialOptions) -> Result<Vec<Channel>>;

    /// One balanced channel for `service_name` that follows membership
    /// changes for as long as it lives.
    async fn get_conn(&self, service_name: &str, opts: DialOptions) -> Result<Channel>;

    /// The address this process registered under, if any.
    async fn get_self_conn_target(&self) -> Option<String>;

    /// Add dial options applied to every later dial.
    async fn add_option(&self, opts: DialOptions);

    fn close_conn(&self, conn: Channel) {
        drop(conn);
    }
}

/// Service registration on top of connection lookup
#[async_trait]
pub trait SvcDiscoveryRegistry: Conn {
    async fn register(
        &self,
        service_name: &str,
        host: &str,
        port: u16,
        opts: DialOptions,
    ) -> Result<()>;

    async fn unregister(&self) -> Result<()>;

    /// Store a configuration blob under `key`, replacing any previous value.
    async fn register_conf(&self, key: &str, conf: &[u8]) -> Result<()>;

    async fn get_conf(&self, key: &str) -> Result<Vec<u8>>;

    async fn close(&self);
}
