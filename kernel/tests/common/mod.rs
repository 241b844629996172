//! Shared helpers for integration tests: an in-process cluster of admin
//! nodes sharing one membership record.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use admiral_kernel::admin::{AdminApi, AdminService, AuthContext, ExecutionInfo, RequestContext};
use admiral_kernel::client::EndpointDirectory;
use admiral_kernel::cluster::{Membership, NodeAddress, NodeView};
use admiral_kernel::config::AdminConfig;
use admiral_kernel::metadata::MetadataStore;
use admiral_kernel::observe::MemoryStateLog;
use admiral_kernel::plan::{PlanId, PlanStateBroadcaster, ScriptedEngine};

/// Upper bound on how long a test waits for a plan to finish.
pub const PLAN_TIMEOUT: Duration = Duration::from_secs(10);

pub struct TestNode {
    pub address: NodeAddress,
    pub service: Arc<AdminService<ScriptedEngine>>,
    pub broadcaster: Arc<PlanStateBroadcaster>,
    pub log: Arc<MemoryStateLog>,
}

pub struct TestCluster {
    pub membership: Arc<Membership>,
    pub nodes: Vec<TestNode>,
}

impl TestCluster {
    /// Start `size` nodes named `admin1..`; none coordinates yet.
    /// Must be called from inside a tokio runtime.
    pub fn start(size: u16) -> Self {
        let membership = Arc::new(Membership::default());
        let nodes = (1..=size)
            .map(|n| {
                let config = AdminConfig {
                    node_name: format!("admin{n}"),
                    node_id: n,
                    address: NodeAddress::new(format!("node-{n}"), 5000 + n),
                    test_mode: true,
                    ..AdminConfig::default_config()
                };
                let address = config.address.clone();
                let log = Arc::new(MemoryStateLog::default());
                let broadcaster = Arc::new(PlanStateBroadcaster::new(log.clone()));
                let store = Arc::new(MetadataStore::new(config.metadata_history_limit));
                let view = Arc::new(NodeView::new(address.clone(), membership.clone()));
                let service = Arc::new(AdminService::new(
                    config,
                    view,
                    store,
                    broadcaster.clone(),
                    ScriptedEngine::new(),
                    tokio::runtime::Handle::current(),
                ));
                TestNode {
                    address,
                    service,
                    broadcaster,
                    log,
                }
            })
            .collect();

        Self { membership, nodes }
    }

    pub fn elect(&self, index: usize) {
        self.membership
            .set_coordinator(Some(self.nodes[index].address.clone()));
    }

    pub fn directory(&self) -> EndpointDirectory {
        let mut directory = EndpointDirectory::new();
        for node in &self.nodes {
            directory.register(node.address.clone(), node.service.clone());
        }
        directory
    }

    pub fn node_at(&self, address: &NodeAddress) -> &TestNode {
        self.nodes
            .iter()
            .find(|node| &node.address == address)
            .unwrap_or_else(|| panic!("no node at {address}"))
    }
}

pub fn ctx() -> RequestContext {
    RequestContext::current(AuthContext::from_token(b"operator".to_vec()))
}

/// Wait for a condition that trails a plan's visible status, such as
/// the broadcast of its last transition.
pub async fn eventually(mut done: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + PLAN_TIMEOUT;
    while !done() {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached");
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

/// Poll until the plan is terminal, recording every status seen.
pub async fn poll_until_terminal(
    api: &dyn AdminApi,
    plan_id: PlanId,
) -> (ExecutionInfo, Vec<ExecutionInfo>) {
    let deadline = tokio::time::Instant::now() + PLAN_TIMEOUT;
    let mut seen = Vec::new();
    loop {
        let info = api
            .execution_status(&ctx(), plan_id)
            .unwrap_or_else(|err| panic!("status of plan {plan_id}: {err}"));
        seen.push(info.clone());
        if info.is_terminal() {
            return (info, seen);
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "plan {plan_id} did not finish"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
