//! Balancing policies for logical `scheme:///service` channels

use crate::Address;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Which resolved addresses a balanced channel routes across
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalancingPolicy {
    /// Spread calls over every resolved address
    #[default]
    RoundRobin,
    /// Send every call to the first resolved address
    PickFirst,
}

impl BalancingPolicy {
    pub fn name(&self) -> &'static str {
        match self {
            BalancingPolicy::RoundRobin => "round_robin",
            BalancingPolicy::PickFirst => "pick_first",
        }
    }

    /// Addresses the channel should see for this policy
    pub fn select<'a>(&self, addrs: &'a [Address]) -> &'a [Address] {
        match self {
            BalancingPolicy::RoundRobin => addrs,
            BalancingPolicy::PickFirst => &addrs[..addrs.len().min(1)],
        }
    }
}

impl fmt::Display for BalancingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BalancingPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round_robin" => Ok(BalancingPolicy::RoundRobin),
            "pick_first" => Ok(BalancingPolicy::PickFirst),
            other => Err(format!("unknown balancing policy: {}", other)),
        }
    }
}
