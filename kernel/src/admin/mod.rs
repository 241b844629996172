// Admin Execution Surface
//
// Remote control-plane operations: submit a statement, poll it, cancel
// it, and find out which node coordinates. Every call that touches a
// plan carries an opaque credential and the protocol version the
// caller speaks.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::cluster::NodeAddress;
use crate::plan::{PlanId, PlanStatus};

pub mod error;
pub mod service;

pub use error::{AdminError, ClientError, ErrorKind};
pub use service::AdminService;

/// Wire protocol revision spoken by a caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProtocolVersion(pub u16);

/// Newest protocol revision this build understands.
pub const CURRENT_PROTOCOL_VERSION: ProtocolVersion = ProtocolVersion(2);

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Opaque credential token. Forwarded to the [`Authorizer`], never
/// inspected here.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthContext(Vec<u8>);

impl AuthContext {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn from_token(token: impl Into<Vec<u8>>) -> Self {
        Self(token.into())
    }

    pub fn token(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for AuthContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AuthContext(<{} bytes>)", self.0.len())
    }
}

/// Per-call envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    pub auth: AuthContext,
    pub version: ProtocolVersion,
}

impl RequestContext {
    pub fn new(auth: AuthContext, version: ProtocolVersion) -> Self {
        Self { auth, version }
    }

    /// Context speaking [`CURRENT_PROTOCOL_VERSION`].
    pub fn current(auth: AuthContext) -> Self {
        Self::new(auth, CURRENT_PROTOCOL_VERSION)
    }
}

/// Operations checked against the [`Authorizer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminOperation {
    Execute,
    ExecutionStatus,
    Cancel,
}

/// External authorization collaborator.
pub trait Authorizer: Send + Sync {
    /// `Err` carries the reason shown to the caller.
    fn authorize(&self, auth: &AuthContext, operation: AdminOperation) -> Result<(), String>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn authorize(&self, _: &AuthContext, _: AdminOperation) -> Result<(), String> {
        Ok(())
    }
}

/// Externally visible snapshot of a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionInfo {
    pub plan_id: PlanId,
    pub statement: String,
    pub status: PlanStatus,
    /// Set once `interrupt_and_cancel` reached the plan before it finished.
    pub cancel_requested: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ClientError>,
}

impl ExecutionInfo {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// The remote admin surface as seen by clients.
///
/// Discovery calls (`can_handle_ddl`, `master_rmi_address`) need no
/// credentials and never fail, so any client can locate the coordinator.
pub trait AdminApi: Send + Sync {
    /// Admit a statement for asynchronous execution. A repeated
    /// `idempotency_key` returns the plan admitted under that key.
    fn execute(
        &self,
        ctx: &RequestContext,
        statement: &str,
        idempotency_key: Option<&str>,
    ) -> Result<ExecutionInfo, AdminError>;

    fn execution_status(
        &self,
        ctx: &RequestContext,
        plan_id: PlanId,
    ) -> Result<ExecutionInfo, AdminError>;

    /// True iff this node currently coordinates.
    fn can_handle_ddl(&self) -> bool;

    /// Where the coordinator is, or `None` while that is unknown.
    fn master_rmi_address(&self) -> Option<NodeAddress>;

    /// Request cooperative cancellation and return the current snapshot.
    fn interrupt_and_cancel(
        &self,
        ctx: &RequestContext,
        plan_id: PlanId,
    ) -> Result<ExecutionInfo, AdminError>;
}
