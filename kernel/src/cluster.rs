// Coordinator Discovery
//
// Read-only view of which node currently coordinates administrative
// work. Electing that node is someone else's job; the membership
// record here is only updated from the outside.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Address at which a node serves the admin surface.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeAddress {
    pub host: String,
    pub port: u16,
}

impl NodeAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// One node's knowledge of the current coordinator.
pub trait CoordinatorView: Send + Sync {
    fn local_address(&self) -> &NodeAddress;

    /// The coordinator's address, or `None` while coordination is in flux.
    fn coordinator(&self) -> Option<NodeAddress>;

    fn is_coordinator(&self) -> bool {
        self.coordinator().as_ref() == Some(self.local_address())
    }
}

/// Shared record of the current coordinator, fed by whatever
/// election mechanism the deployment uses.
#[derive(Debug, Default)]
pub struct Membership {
    coordinator: RwLock<Option<NodeAddress>>,
}

impl Membership {
    pub fn new(coordinator: Option<NodeAddress>) -> Self {
        Self {
            coordinator: RwLock::new(coordinator),
        }
    }

    pub fn set_coordinator(&self, coordinator: Option<NodeAddress>) {
        let mut current = self.coordinator.write();
        if *current != coordinator {
            tracing::info!(
                from = ?current.as_ref().map(ToString::to_string),
                to = ?coordinator.as_ref().map(ToString::to_string),
                "coordinator changed"
            );
        }
        *current = coordinator;
    }

    pub fn coordinator(&self) -> Option<NodeAddress> {
        self.coordinator.read().clone()
    }
}

/// A node's view backed by a shared [`Membership`].
#[derive(Debug, Clone)]
pub struct NodeView {
    local: NodeAddress,
    membership: Arc<Membership>,
}

impl NodeView {
    pub fn new(local: NodeAddress, membership: Arc<Membership>) -> Self {
        Self { local, membership }
    }
}

impl CoordinatorView for NodeView {
    fn local_address(&self) -> &NodeAddress {
        &self.local
    }

    fn coordinator(&self) -> Option<NodeAddress> {
        self.membership.coordinator()
    }
}
