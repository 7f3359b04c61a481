//! Parent side network interface creation.
//!
//! Interfaces are created from the parent while the container process
//! waits in its fresh network namespace. The actual link handling lives
//! in strategy implementations outside this crate; the drivers look
//! them up by the network type of the configuration and record the
//! materialized interface in the payload sent to the init process.

use anyhow::Result;
use std::collections::HashMap;

use crate::runtime::{config::Network, error::Error, Pid};

/// Creates one kind of network interface bound to a target process's
/// network namespace.
pub trait NetworkStrategy {
    /// Create the interface for `network`, tied to the network
    /// namespace of `pid`. Implementations update `network` with the
    /// materialized interface name.
    fn create(&self, network: &mut Network, pid: Pid) -> Result<()>;
}

/// Network strategies keyed by network type.
pub struct Registry {
    strategies: HashMap<String, Box<dyn NetworkStrategy + Send>>,
}

impl Registry {
    /// A registry with no strategies.
    pub fn empty() -> Registry {
        Registry {
            strategies: HashMap::new(),
        }
    }

    /// Register `strategy` for networks of type `kind`.
    pub fn register(
        &mut self,
        kind: impl Into<String>,
        strategy: Box<dyn NetworkStrategy + Send>,
    ) {
        self.strategies.insert(kind.into(), strategy);
    }

    /// The strategy for `kind`.
    pub fn strategy(&self, kind: &str) -> Result<&(dyn NetworkStrategy + Send), Error> {
        self.strategies
            .get(kind)
            .map(AsRef::as_ref)
            .ok_or_else(|| Error::NetworkStrategy(kind.to_string()))
    }
}

impl Default for Registry {
    /// A registry with the built in loopback strategy.
    fn default() -> Registry {
        let mut registry = Registry::empty();
        registry.register("loopback", Box::new(Loopback));
        registry
    }
}

/// Loopback networks. The interface exists in every fresh network
/// namespace; the parent only assigns the name, bring up happens on the
/// child side.
pub struct Loopback;

impl NetworkStrategy for Loopback {
    fn create(&self, network: &mut Network, _pid: Pid) -> Result<()> {
        network.name = "lo".to_string();
        Ok(())
    }
}
