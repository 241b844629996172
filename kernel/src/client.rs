// Coordinator-Aware Client
//
// Routes statements to whichever node currently coordinates. Nodes
// never forward `execute`; the client follows `NotMaster` redirects,
// asks the nodes it knows where the coordinator is, and backs off
// while nobody knows.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::admin::{AdminApi, AdminError, ExecutionInfo, RequestContext};
use crate::cluster::NodeAddress;
use crate::config::RetryPolicy;
use crate::plan::PlanId;

/// Resolves node addresses to admin endpoints. Transport framing lives
/// behind this trait.
pub trait Endpoints: Send + Sync {
    fn connect(&self, address: &NodeAddress) -> Option<Arc<dyn AdminApi>>;
}

/// Fixed address book, e.g. for in-process clusters.
#[derive(Default, Clone)]
pub struct EndpointDirectory {
    nodes: HashMap<NodeAddress, Arc<dyn AdminApi>>,
}

impl EndpointDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, address: NodeAddress, api: Arc<dyn AdminApi>) {
        self.nodes.insert(address, api);
    }
}

impl Endpoints for EndpointDirectory {
    fn connect(&self, address: &NodeAddress) -> Option<Arc<dyn AdminApi>> {
        self.nodes.get(address).cloned()
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RoutingError {
    #[error("no coordinator reachable after {attempts} attempts")]
    NoCoordinator { attempts: u32 },

    #[error("no endpoint for {0}")]
    Unreachable(NodeAddress),

    #[error(transparent)]
    Admin(#[from] AdminError),
}

pub struct AdminClient<D: Endpoints> {
    endpoints: D,
    seeds: Vec<NodeAddress>,
    retry: RetryPolicy,
    ctx: RequestContext,
}

impl<D: Endpoints> AdminClient<D> {
    pub fn new(
        endpoints: D,
        seeds: Vec<NodeAddress>,
        retry: RetryPolicy,
        ctx: RequestContext,
    ) -> Self {
        Self {
            endpoints,
            seeds,
            retry,
            ctx,
        }
    }

    /// Ask the seed nodes where the coordinator is.
    pub fn discover(&self) -> Option<NodeAddress> {
        self.seeds.iter().find_map(|seed| {
            let api = self.endpoints.connect(seed)?;
            if api.can_handle_ddl() {
                Some(seed.clone())
            } else {
                api.master_rmi_address()
            }
        })
    }

    /// Submit a statement to the coordinator.
    ///
    /// Returns the coordinator's address with the initial snapshot. One
    /// idempotency key is used for every attempt, so a retransmission
    /// reaching the same coordinator twice admits a single plan.
    pub async fn execute(
        &self,
        statement: &str,
    ) -> Result<(NodeAddress, ExecutionInfo), RoutingError> {
        let key = Uuid::new_v4().to_string();
        let mut target: Option<NodeAddress> = None;

        for attempt in 1..=self.retry.max_attempts {
            let candidate = target.take().or_else(|| self.discover());

            if let Some(address) = candidate {
                if let Some(api) = self.endpoints.connect(&address) {
                    match api.execute(&self.ctx, statement, Some(&key)) {
                        Ok(info) => return Ok((address, info)),
                        Err(AdminError::NotMaster {
                            master: Some(master),
                            ..
                        }) if master != address => {
                            tracing::debug!(
                                from = %address,
                                to = %master,
                                "following coordinator redirect"
                            );
                            target = Some(master);
                            continue;
                        }
                        Err(AdminError::NotMaster { .. }) => {}
                        Err(err) => return Err(err.into()),
                    }
                }
            }

            let delay = self.retry.delay(attempt);
            tracing::debug!(attempt, ?delay, "coordinator unknown, backing off");
            tokio::time::sleep(delay).await;
        }

        Err(RoutingError::NoCoordinator {
            attempts: self.retry.max_attempts,
        })
    }

    pub fn status(
        &self,
        address: &NodeAddress,
        plan_id: PlanId,
    ) -> Result<ExecutionInfo, RoutingError> {
        Ok(self.endpoint(address)?.execution_status(&self.ctx, plan_id)?)
    }

    pub fn cancel(
        &self,
        address: &NodeAddress,
        plan_id: PlanId,
    ) -> Result<ExecutionInfo, RoutingError> {
        Ok(self.endpoint(address)?.interrupt_and_cancel(&self.ctx, plan_id)?)
    }

    /// Poll until the plan reaches a terminal status.
    pub async fn wait_for_completion(
        &self,
        address: &NodeAddress,
        plan_id: PlanId,
        poll: Duration,
    ) -> Result<ExecutionInfo, RoutingError> {
        let api = self.endpoint(address)?;
        loop {
            let info = api.execution_status(&self.ctx, plan_id)?;
            if info.is_terminal() {
                return Ok(info);
            }
            tokio::time::sleep(poll).await;
        }
    }

    fn endpoint(&self, address: &NodeAddress) -> Result<Arc<dyn AdminApi>, RoutingError> {
        self.endpoints
            .connect(address)
            .ok_or_else(|| RoutingError::Unreachable(address.clone()))
    }
}
