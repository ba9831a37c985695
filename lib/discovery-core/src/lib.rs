//! Core service discovery functionality
//!
//! This library provides:
//! - Address and target types shared by discovery backends
//! - The `Conn` / `SvcDiscoveryRegistry` capability traits
//! - Dial options and channel construction
//! - The resolver sink that feeds discovered addresses into a tonic balance channel

pub mod address;
pub mod balancer;
pub mod dial;
pub mod error;
pub mod registry;
pub mod resolver;

pub use address::{join_host_port, Address, Target};
pub use balancer::BalancingPolicy;
pub use dial::DialOptions;
pub use error::{DiscoveryError, Result};
pub use registry::{Conn, SvcDiscoveryRegistry};
pub use resolver::{BalanceSink, ResolverSink};
