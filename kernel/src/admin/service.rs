// Admin Execution Service
//
// Coordinator-side implementation of the admin surface. `execute`
// prepares the statement, registers a plan and hands it to a blocking
// worker; status and cancellation only read or flag the registry, so
// no call ever waits for a statement to finish.

use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;

use crate::admin::{
    AdminApi, AdminError, AdminOperation, AllowAll, Authorizer, ClientError, ErrorKind,
    ExecutionInfo, RequestContext, CURRENT_PROTOCOL_VERSION,
};
use crate::cluster::{CoordinatorView, NodeAddress};
use crate::config::AdminConfig;
use crate::metadata::MetadataStore;
use crate::observe::panic_message;
use crate::plan::{
    CancelToken, EngineError, ExecutionContext, PlanEvent, PlanId, PlanStateBroadcaster,
    PlanStateChange, PlanStateMachine, PlanStatus, StatementEngine,
};

struct PlanRecord {
    machine: PlanStateMachine,
    error: Option<ClientError>,
}

struct PlanEntry {
    id: PlanId,
    statement: String,
    idempotency_key: Option<String>,
    cancel: CancelToken,
    record: Mutex<PlanRecord>,
}

impl PlanEntry {
    fn info(&self) -> ExecutionInfo {
        let record = self.record.lock();
        self.snapshot(&record)
    }

    fn snapshot(&self, record: &PlanRecord) -> ExecutionInfo {
        ExecutionInfo {
            plan_id: self.id,
            statement: self.statement.clone(),
            status: record.machine.current_status(),
            cancel_requested: self.cancel.is_cancelled(),
            error: record.error.clone(),
        }
    }
}

#[derive(Default)]
struct Registry {
    plans: HashMap<PlanId, Arc<PlanEntry>>,
    /// Idempotency key -> plan admitted under it.
    keys: HashMap<String, PlanId>,
    /// Finished plans, oldest first.
    retired: VecDeque<PlanId>,
}

/// Plans owned by this node and the bookkeeping that moves them along.
struct PlanTracker {
    resource_id: String,
    node_id: u16,
    test_mode: bool,
    retention: Option<usize>,
    next_sequence: AtomicU64,
    registry: RwLock<Registry>,
    broadcaster: Arc<PlanStateBroadcaster>,
}

impl PlanTracker {
    /// Register a new plan. Its NEW state is broadcast first, then it
    /// becomes visible to lookups.
    fn admit(&self, statement: &str, idempotency_key: Option<&str>) -> Arc<PlanEntry> {
        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        let id = PlanId::new(self.node_id, sequence);
        let entry = Arc::new(PlanEntry {
            id,
            statement: statement.to_string(),
            idempotency_key: idempotency_key.map(str::to_string),
            cancel: CancelToken::new(),
            record: Mutex::new(PlanRecord {
                machine: PlanStateMachine::new(),
                error: None,
            }),
        });

        tracing::info!(plan = %id, statement, "plan admitted");
        self.broadcast(&entry.info());

        let mut registry = self.registry.write();
        registry.plans.insert(id, Arc::clone(&entry));
        if let Some(key) = idempotency_key {
            registry.keys.insert(key.to_string(), id);
        }
        entry
    }

    fn get(&self, id: PlanId) -> Option<Arc<PlanEntry>> {
        self.registry.read().plans.get(&id).cloned()
    }

    fn find_by_key(&self, key: &str) -> Option<Arc<PlanEntry>> {
        let registry = self.registry.read();
        let id = registry.keys.get(key)?;
        registry.plans.get(id).cloned()
    }

    fn transition(
        &self,
        entry: &PlanEntry,
        event: PlanEvent,
        error: Option<ClientError>,
    ) -> ExecutionInfo {
        self.transition_with(entry, |_| (event, error))
    }

    /// `decide` sees the cancellation flag under the plan lock, so a
    /// concurrent `interrupt_and_cancel` lands either before the final
    /// transition or after it, never in between. The change is
    /// broadcast after the lock is released; only the plan's own worker
    /// moves it once admitted, which keeps its events in order.
    fn transition_with(
        &self,
        entry: &PlanEntry,
        decide: impl FnOnce(bool) -> (PlanEvent, Option<ClientError>),
    ) -> ExecutionInfo {
        let info = {
            let mut record = entry.record.lock();
            let (event, error) = decide(entry.cancel.is_cancelled());
            if let Err(err) = record.machine.apply(event) {
                if self.test_mode {
                    panic!("plan {}: {err}", entry.id);
                }
                tracing::warn!(plan = %entry.id, error = %err, "dropped illegal plan transition");
                return entry.snapshot(&record);
            }
            if error.is_some() {
                record.error = error;
            }
            entry.snapshot(&record)
        };

        self.settle(&info);
        info
    }

    fn finish(&self, entry: &PlanEntry, outcome: Result<(), EngineError>) -> ExecutionInfo {
        if let Err(EngineError::Internal { message, context }) = &outcome {
            tracing::error!(
                plan = %entry.id,
                statement = %entry.statement,
                diagnostic = %context,
                "internal engine error: {message}"
            );
        }

        self.transition_with(entry, |cancelled| match outcome {
            Ok(()) | Err(EngineError::Interrupted) if cancelled => (PlanEvent::Interrupt, None),
            Ok(()) => (PlanEvent::Complete, None),
            Err(err) => (
                PlanEvent::Fail,
                Some(ClientError::from_engine(&err, |context| {
                    self.diagnostic(entry, context)
                })),
            ),
        })
    }

    /// Fail a plan whose worker went away without finishing it. No-op
    /// once the plan is terminal.
    fn abandon(&self, entry: &PlanEntry) {
        let info = {
            let mut record = entry.record.lock();
            let event = match record.machine.current_status() {
                PlanStatus::New => PlanEvent::Reject,
                PlanStatus::Running => PlanEvent::Fail,
                _ => return,
            };
            if record.machine.apply(event).is_err() {
                return;
            }

            let context = if thread::panicking() {
                "worker panicked"
            } else {
                "worker dropped before running to completion"
            };
            tracing::error!(
                plan = %entry.id,
                statement = %entry.statement,
                "plan abandoned: {context}"
            );
            record.error = Some(
                ClientError::new(ErrorKind::InternalEngineError, "plan worker stopped")
                    .with_diagnostic(self.diagnostic(entry, context)),
            );
            entry.snapshot(&record)
        };

        self.settle(&info);
    }

    fn settle(&self, info: &ExecutionInfo) {
        self.broadcast(info);
        if info.is_terminal() {
            self.retire(info.plan_id);
        }
    }

    /// Forget the oldest finished plans beyond the retention limit,
    /// together with the idempotency keys they were admitted under.
    fn retire(&self, id: PlanId) {
        let Some(limit) = self.retention else {
            return;
        };

        let mut registry = self.registry.write();
        registry.retired.push_back(id);
        while registry.retired.len() > limit {
            let Some(oldest) = registry.retired.pop_front() else {
                break;
            };
            let Some(entry) = registry.plans.remove(&oldest) else {
                continue;
            };
            if let Some(key) = &entry.idempotency_key {
                if registry.keys.get(key) == Some(&oldest) {
                    registry.keys.remove(key);
                }
            }
            tracing::debug!(plan = %oldest, "evicted finished plan");
        }
    }

    fn diagnostic(&self, entry: &PlanEntry, context: &str) -> String {
        format!(
            "{} plan {} `{}`: {}",
            self.resource_id, entry.id, entry.statement, context
        )
    }

    fn broadcast(&self, info: &ExecutionInfo) {
        let change = PlanStateChange {
            plan_id: info.plan_id,
            statement: info.statement.clone(),
            status: info.status,
            error: info.error.clone(),
        };
        self.broadcaster.apply_new_info(&self.resource_id, &change);
    }
}

/// Owned by a plan's blocking task. Dropping it settles the plan if the
/// task panicked past the engine boundary or was dropped unrun because
/// the runtime shut down.
struct WorkerGuard {
    tracker: Arc<PlanTracker>,
    entry: Arc<PlanEntry>,
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        self.tracker.abandon(&self.entry);
    }
}

fn run_plan<E: StatementEngine>(
    tracker: &PlanTracker,
    entry: &PlanEntry,
    engine: &E,
    prepared: E::Prepared,
    store: Arc<MetadataStore>,
) {
    tracker.transition(entry, PlanEvent::Start, None);

    let ctx = ExecutionContext::new(entry.id, entry.cancel.clone(), store);
    let outcome = ctx.checkpoint().and_then(|()| {
        panic::catch_unwind(AssertUnwindSafe(|| engine.run(prepared, &ctx))).unwrap_or_else(
            |payload| {
                Err(EngineError::Internal {
                    message: format!("engine panicked: {}", panic_message(payload.as_ref())),
                    context: "statement execution".into(),
                })
            },
        )
    });

    let info = tracker.finish(entry, outcome);
    tracing::info!(plan = %info.plan_id, status = %info.status, "plan finished");
}

/// Admin surface of one node.
///
/// Plans live only on the node that admitted them. Status and
/// cancellation are answered by that node whether or not it is still
/// the coordinator; other nodes report `NotFound`.
pub struct AdminService<E: StatementEngine> {
    config: AdminConfig,
    node: Arc<dyn CoordinatorView>,
    store: Arc<MetadataStore>,
    engine: Arc<E>,
    authorizer: Arc<dyn Authorizer>,
    runtime: Handle,
    tracker: Arc<PlanTracker>,
    /// Serializes keyed admissions so concurrent retransmissions of one
    /// key cannot both admit a plan.
    keyed_admission: Mutex<()>,
}

impl<E: StatementEngine> AdminService<E> {
    /// Plans are executed on `runtime`'s blocking pool.
    pub fn new(
        config: AdminConfig,
        node: Arc<dyn CoordinatorView>,
        store: Arc<MetadataStore>,
        broadcaster: Arc<PlanStateBroadcaster>,
        engine: E,
        runtime: Handle,
    ) -> Self {
        let tracker = Arc::new(PlanTracker {
            resource_id: config.node_name.clone(),
            node_id: config.node_id,
            test_mode: config.test_mode,
            retention: config.plan_retention,
            next_sequence: AtomicU64::new(1),
            registry: RwLock::new(Registry::default()),
            broadcaster,
        });

        Self {
            config,
            node,
            store,
            engine: Arc::new(engine),
            authorizer: Arc::new(AllowAll),
            runtime,
            tracker,
            keyed_admission: Mutex::new(()),
        }
    }

    pub fn with_authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }

    pub fn config(&self) -> &AdminConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<MetadataStore> {
        &self.store
    }

    fn check(&self, ctx: &RequestContext, operation: AdminOperation) -> Result<(), AdminError> {
        if ctx.version < self.config.min_protocol_version || ctx.version > CURRENT_PROTOCOL_VERSION
        {
            return Err(AdminError::UnsupportedVersion {
                requested: ctx.version,
                min: self.config.min_protocol_version,
                max: CURRENT_PROTOCOL_VERSION,
            });
        }

        self.authorizer
            .authorize(&ctx.auth, operation)
            .map_err(|reason| {
                tracing::warn!(?operation, %reason, "admin call refused");
                AdminError::Unauthorized(reason)
            })
    }

    fn lookup(&self, plan_id: PlanId) -> Result<Arc<PlanEntry>, AdminError> {
        self.tracker
            .get(plan_id)
            .ok_or(AdminError::NotFound(plan_id))
    }

    fn admit(
        &self,
        statement: &str,
        idempotency_key: Option<&str>,
    ) -> Result<ExecutionInfo, AdminError> {
        let prepared = panic::catch_unwind(AssertUnwindSafe(|| self.engine.prepare(statement)))
            .unwrap_or_else(|payload| {
                Err(EngineError::Internal {
                    message: format!("engine panicked: {}", panic_message(payload.as_ref())),
                    context: "statement preparation".into(),
                })
            });

        match prepared {
            Ok(prepared) => {
                let entry = self.tracker.admit(statement, idempotency_key);
                let info = entry.info();
                self.spawn(entry, prepared);
                Ok(info)
            }
            Err(EngineError::Internal { message, context }) => {
                let diagnostic = format!(
                    "{} preparing `{}`: {}",
                    self.config.node_name, statement, context
                );
                tracing::error!(%diagnostic, "internal engine error: {message}");
                Err(AdminError::Internal(
                    ClientError::new(ErrorKind::InternalEngineError, message)
                        .with_diagnostic(diagnostic),
                ))
            }
            Err(err) => {
                tracing::info!(statement, error = %err, "statement rejected");
                let entry = self.tracker.admit(statement, idempotency_key);
                let error = ClientError::from_engine(&err, ToString::to_string);
                Ok(self.tracker.transition(&entry, PlanEvent::Reject, Some(error)))
            }
        }
    }

    fn spawn(&self, entry: Arc<PlanEntry>, prepared: E::Prepared) {
        let engine = Arc::clone(&self.engine);
        let store = Arc::clone(&self.store);
        let guard = WorkerGuard {
            tracker: Arc::clone(&self.tracker),
            entry,
        };

        // Not joined: `guard` settles the plan however the task ends.
        self.runtime.spawn_blocking(move || {
            run_plan(&guard.tracker, &guard.entry, engine.as_ref(), prepared, store);
            drop(guard);
        });
    }
}

impl<E: StatementEngine> AdminApi for AdminService<E> {
    fn execute(
        &self,
        ctx: &RequestContext,
        statement: &str,
        idempotency_key: Option<&str>,
    ) -> Result<ExecutionInfo, AdminError> {
        self.check(ctx, AdminOperation::Execute)?;

        if !self.node.is_coordinator() {
            let master = self.node.coordinator();
            tracing::warn!(
                master = ?master.as_ref().map(ToString::to_string),
                "execute refused: not the coordinator"
            );
            return Err(AdminError::NotMaster {
                local: self.node.local_address().clone(),
                master,
            });
        }

        let Some(key) = idempotency_key else {
            return self.admit(statement, None);
        };

        let _admission = self.keyed_admission.lock();
        if let Some(entry) = self.tracker.find_by_key(key) {
            tracing::debug!(plan = %entry.id, key, "duplicate submission");
            return Ok(entry.info());
        }
        self.admit(statement, Some(key))
    }

    fn execution_status(
        &self,
        ctx: &RequestContext,
        plan_id: PlanId,
    ) -> Result<ExecutionInfo, AdminError> {
        self.check(ctx, AdminOperation::ExecutionStatus)?;
        Ok(self.lookup(plan_id)?.info())
    }

    fn can_handle_ddl(&self) -> bool {
        self.node.is_coordinator()
    }

    fn master_rmi_address(&self) -> Option<NodeAddress> {
        self.node.coordinator()
    }

    fn interrupt_and_cancel(
        &self,
        ctx: &RequestContext,
        plan_id: PlanId,
    ) -> Result<ExecutionInfo, AdminError> {
        self.check(ctx, AdminOperation::Cancel)?;
        let entry = self.lookup(plan_id)?;

        let record = entry.record.lock();
        let status = record.machine.current_status();
        if !status.is_terminal() {
            entry.cancel.cancel();
            tracing::info!(plan = %plan_id, %status, "cancellation requested");
        }
        Ok(entry.snapshot(&record))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::sync::{OnceLock, Weak};
    use std::time::{Duration, Instant};

    use super::*;
    use crate::admin::{AuthContext, ProtocolVersion};
    use crate::cluster::{Membership, NodeView};
    use crate::metadata::MetadataType;
    use crate::observe::{ListenerError, MemoryStateLog, StateListener};
    use crate::plan::ScriptedEngine;

    struct Fixture {
        service: AdminService<ScriptedEngine>,
        log: Arc<MemoryStateLog>,
        broadcaster: Arc<PlanStateBroadcaster>,
        membership: Arc<Membership>,
    }

    fn fixture() -> Fixture {
        fixture_with(AdminConfig::default_config(), Handle::current())
    }

    fn fixture_with(config: AdminConfig, runtime: Handle) -> Fixture {
        let membership = Arc::new(Membership::new(Some(config.address.clone())));
        let node = Arc::new(NodeView::new(config.address.clone(), membership.clone()));
        let log = Arc::new(MemoryStateLog::default());
        let broadcaster = Arc::new(PlanStateBroadcaster::new(log.clone()));
        let store = Arc::new(MetadataStore::new(config.metadata_history_limit));

        let service = AdminService::new(
            config,
            node,
            store,
            broadcaster.clone(),
            ScriptedEngine::new(),
            runtime,
        );
        Fixture {
            service,
            log,
            broadcaster,
            membership,
        }
    }

    fn ctx() -> RequestContext {
        RequestContext::current(AuthContext::anonymous())
    }

    async fn wait_terminal(service: &dyn AdminApi, plan_id: PlanId) -> ExecutionInfo {
        for _ in 0..500 {
            let info = service.execution_status(&ctx(), plan_id).unwrap();
            if info.is_terminal() {
                return info;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("plan {plan_id} did not finish");
    }

    /// Broadcasts of a transition trail its visibility through status
    /// reads, so wait for them explicitly.
    async fn wait_until(mut done: impl FnMut() -> bool) {
        for _ in 0..500 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn execute_admits_and_runs_asynchronously() {
        let f = fixture();

        let info = f
            .service
            .execute(&ctx(), "sleep 50; apply table create users", None)
            .unwrap();
        assert_eq!(info.status, PlanStatus::New);
        assert!(f.service.execution_status(&ctx(), info.plan_id).is_ok());

        let done = wait_terminal(&f.service, info.plan_id).await;
        assert_eq!(done.status, PlanStatus::Succeeded);
        assert_eq!(done.error, None);
        assert_eq!(f.service.store().sequence_number(MetadataType::Table), 1);
        assert_eq!(info.plan_id.node_id(), 1);

        wait_until(|| f.log.lines().len() == 3).await;
        let id = info.plan_id;
        assert_eq!(
            f.log.lines(),
            vec![
                format!("[admin1] Plan {id} [sleep 50; apply table create users] NEW"),
                format!("[admin1] Plan {id} [sleep 50; apply table create users] RUNNING"),
                format!("[admin1] Plan {id} [sleep 50; apply table create users] SUCCEEDED"),
            ]
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn malformed_statement_is_reported_as_data() {
        let f = fixture();

        let info = f.service.execute(&ctx(), "frobnicate everything", None).unwrap();
        assert_eq!(info.status, PlanStatus::Failed);
        let error = info.error.clone().unwrap();
        assert_eq!(error.kind, ErrorKind::Malformed);
        assert_eq!(error.diagnostic, None);

        assert_eq!(f.service.execution_status(&ctx(), info.plan_id).unwrap(), info);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn plan_ids_are_unique_and_increasing() {
        let f = fixture();
        let first = f.service.execute(&ctx(), "apply table a", None).unwrap();
        let second = f.service.execute(&ctx(), "bogus", None).unwrap();
        let third = f.service.execute(&ctx(), "apply table b", None).unwrap();

        assert!(first.plan_id < second.plan_id);
        assert!(second.plan_id < third.plan_id);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn non_coordinator_refuses_execute_but_answers_discovery() {
        let f = fixture();
        let elsewhere = NodeAddress::new("node-b", 5000);
        f.membership.set_coordinator(Some(elsewhere.clone()));

        assert!(!f.service.can_handle_ddl());
        assert_eq!(f.service.master_rmi_address(), Some(elsewhere.clone()));

        let err = f.service.execute(&ctx(), "apply table t", None).unwrap_err();
        assert_eq!(
            err,
            AdminError::NotMaster {
                local: NodeAddress::new("localhost", 5000),
                master: Some(elsewhere),
            }
        );

        f.membership.set_coordinator(None);
        assert!(!f.service.can_handle_ddl());
        assert_eq!(f.service.master_rmi_address(), None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unknown_plan_is_not_found() {
        let f = fixture();
        assert_eq!(
            f.service.execution_status(&ctx(), PlanId(42)),
            Err(AdminError::NotFound(PlanId(42)))
        );
        assert_eq!(
            f.service.interrupt_and_cancel(&ctx(), PlanId(42)),
            Err(AdminError::NotFound(PlanId(42)))
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancel_interrupts_running_plan() {
        let f = fixture();
        let info = f.service.execute(&ctx(), "sleep 5000", None).unwrap();

        for _ in 0..500 {
            let status = f.service.execution_status(&ctx(), info.plan_id).unwrap().status;
            if status == PlanStatus::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        let requested = f.service.interrupt_and_cancel(&ctx(), info.plan_id).unwrap();
        assert!(requested.cancel_requested);
        assert_eq!(requested.status, PlanStatus::Running);

        let done = wait_terminal(&f.service, info.plan_id).await;
        assert_eq!(done.status, PlanStatus::Interrupted);
        assert!(done.cancel_requested);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancel_on_terminal_plan_is_a_no_op() {
        let f = fixture();
        let info = f.service.execute(&ctx(), "apply security grant", None).unwrap();
        let done = wait_terminal(&f.service, info.plan_id).await;

        let first = f.service.interrupt_and_cancel(&ctx(), info.plan_id).unwrap();
        let second = f.service.interrupt_and_cancel(&ctx(), info.plan_id).unwrap();
        assert_eq!(first, done);
        assert_eq!(second, done);
        assert!(!second.cancel_requested);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn engine_failures_become_structured_errors() {
        let f = fixture();

        let failed = f.service.execute(&ctx(), "fail table locked", None).unwrap();
        let failed = wait_terminal(&f.service, failed.plan_id).await;
        assert_eq!(failed.status, PlanStatus::Failed);
        assert_eq!(
            failed.error,
            Some(ClientError::new(ErrorKind::ExecutionFailed, "table locked"))
        );

        let broken = f.service.execute(&ctx(), "invariant lost topology", None).unwrap();
        let broken = wait_terminal(&f.service, broken.plan_id).await;
        let error = broken.error.unwrap();
        assert_eq!(error.kind, ErrorKind::InternalEngineError);
        assert_eq!(error.message, "lost topology");
        let diagnostic = error.diagnostic.unwrap();
        assert!(diagnostic.starts_with("admin1 plan"));
        assert!(diagnostic.contains("scripted engine"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn engine_panic_does_not_take_down_the_node() {
        let f = fixture();

        let crashed = f.service.execute(&ctx(), "panic index corrupted", None).unwrap();
        let crashed = wait_terminal(&f.service, crashed.plan_id).await;
        let error = crashed.error.unwrap();
        assert_eq!(crashed.status, PlanStatus::Failed);
        assert_eq!(error.kind, ErrorKind::InternalEngineError);
        assert!(error.message.contains("index corrupted"));
        assert!(error.diagnostic.unwrap().contains("statement execution"));

        let next = f.service.execute(&ctx(), "apply table t", None).unwrap();
        assert_eq!(
            wait_terminal(&f.service, next.plan_id).await.status,
            PlanStatus::Succeeded
        );
    }

    struct ExplodingParser;

    impl StatementEngine for ExplodingParser {
        type Prepared = ();

        fn prepare(&self, _: &str) -> Result<(), EngineError> {
            panic!("parser state corrupted");
        }

        fn run(&self, _: (), _: &ExecutionContext) -> Result<(), EngineError> {
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn preparation_panic_is_wrapped_for_the_client() {
        let config = AdminConfig::default_config();
        let membership = Arc::new(Membership::new(Some(config.address.clone())));
        let node = Arc::new(NodeView::new(config.address.clone(), membership));
        let broadcaster = Arc::new(PlanStateBroadcaster::new(Arc::new(MemoryStateLog::default())));
        let service = AdminService::new(
            config,
            node,
            Arc::new(MetadataStore::default()),
            broadcaster,
            ExplodingParser,
            Handle::current(),
        );

        match service.execute(&ctx(), "anything", None) {
            Err(AdminError::Internal(error)) => {
                assert_eq!(error.kind, ErrorKind::InternalEngineError);
                assert!(error.message.contains("parser state corrupted"));
                assert!(error.diagnostic.unwrap().contains("preparing `anything`"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn idempotency_key_deduplicates_retransmissions() {
        let f = fixture();

        let first = f.service.execute(&ctx(), "apply table t", Some("req-1")).unwrap();
        let again = f.service.execute(&ctx(), "apply table t", Some("req-1")).unwrap();
        let other = f.service.execute(&ctx(), "apply table t", Some("req-2")).unwrap();

        assert_eq!(first.plan_id, again.plan_id);
        assert_ne!(first.plan_id, other.plan_id);

        wait_terminal(&f.service, first.plan_id).await;
        wait_terminal(&f.service, other.plan_id).await;
        assert_eq!(f.service.store().sequence_number(MetadataType::Table), 2);
    }

    struct DenyCancel;

    impl Authorizer for DenyCancel {
        fn authorize(&self, _: &AuthContext, operation: AdminOperation) -> Result<(), String> {
            match operation {
                AdminOperation::Cancel => Err("cancel requires operator role".into()),
                _ => Ok(()),
            }
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn calls_are_checked_for_version_and_authorization() {
        let f = fixture();
        let service = f.service.with_authorizer(Arc::new(DenyCancel));

        let old = RequestContext::new(AuthContext::anonymous(), ProtocolVersion(0));
        assert!(matches!(
            service.execute(&old, "apply table t", None),
            Err(AdminError::UnsupportedVersion { .. })
        ));
        let future = RequestContext::new(AuthContext::anonymous(), ProtocolVersion(99));
        assert_eq!(
            service.execution_status(&future, PlanId(1)).unwrap_err().kind(),
            ErrorKind::UnsupportedVersion
        );

        let info = service.execute(&ctx(), "apply table t", None).unwrap();
        assert_eq!(
            service.interrupt_and_cancel(&ctx(), info.plan_id),
            Err(AdminError::Unauthorized("cancel requires operator role".into()))
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_submissions_get_distinct_visible_ids() {
        let f = fixture();
        let service = &f.service;

        let ids: Vec<PlanId> = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..8)
                .map(|_| {
                    scope.spawn(move || {
                        (0..10)
                            .map(|_| {
                                let info = service
                                    .execute(&ctx(), "apply topology x", None)
                                    .unwrap();
                                assert!(service.execution_status(&ctx(), info.plan_id).is_ok());
                                info.plan_id
                            })
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            workers
                .into_iter()
                .flat_map(|worker| worker.join().unwrap())
                .collect()
        });

        let mut unique = ids.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), 80);
    }

    /// Holds up the terminal delivery of one statement.
    struct SlowMonitor {
        statement: &'static str,
        entered: AtomicBool,
        hold: Duration,
    }

    impl StateListener<PlanStateChange> for SlowMonitor {
        fn on_state_change(&self, _: &str, change: &PlanStateChange) -> Result<(), ListenerError> {
            if change.statement == self.statement && change.status.is_terminal() {
                self.entered.store(true, Ordering::SeqCst);
                thread::sleep(self.hold);
            }
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn slow_listener_does_not_stall_other_plans() {
        let f = fixture();
        let monitor = Arc::new(SlowMonitor {
            statement: "apply table a",
            entered: AtomicBool::new(false),
            hold: Duration::from_millis(1000),
        });
        f.broadcaster.add_listener(monitor.clone());

        let other = f
            .service
            .execute(&ctx(), "sleep 200; apply table b", None)
            .unwrap();
        f.service.execute(&ctx(), "apply table a", None).unwrap();

        wait_until(|| monitor.entered.load(Ordering::SeqCst)).await;
        // `other` finishes meanwhile; its delivery queues behind the slow one.
        tokio::time::sleep(Duration::from_millis(400)).await;

        let started = Instant::now();
        let status = f.service.execution_status(&ctx(), other.plan_id).unwrap();
        let cancel = f.service.interrupt_and_cancel(&ctx(), other.plan_id).unwrap();
        let elapsed = started.elapsed();

        assert!(elapsed < Duration::from_millis(200), "took {elapsed:?}");
        assert_eq!(status.status, PlanStatus::Succeeded);
        assert_eq!(cancel, status);
    }

    /// Reads the status of every plan it hears about from its callback.
    struct StatusEcho {
        service: OnceLock<Weak<AdminService<ScriptedEngine>>>,
        seen: Mutex<Vec<PlanStatus>>,
    }

    impl StateListener<PlanStateChange> for StatusEcho {
        fn on_state_change(&self, _: &str, change: &PlanStateChange) -> Result<(), ListenerError> {
            let Some(service) = self.service.get().and_then(|weak| weak.upgrade()) else {
                return Ok(());
            };
            let info = service
                .execution_status(&ctx(), change.plan_id)
                .map_err(|err| ListenerError(err.to_string()))?;
            self.seen.lock().push(info.status);
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn listener_may_read_plan_status_from_its_callback() {
        let f = fixture();
        let service = Arc::new(f.service);
        let echo = Arc::new(StatusEcho {
            service: OnceLock::new(),
            seen: Mutex::new(Vec::new()),
        });
        assert!(echo.service.set(Arc::downgrade(&service)).is_ok());
        f.broadcaster.add_listener(echo.clone());

        let info = service.execute(&ctx(), "apply table t", None).unwrap();
        wait_terminal(service.as_ref(), info.plan_id).await;

        wait_until(|| echo.seen.lock().len() == 2).await;
        assert_eq!(
            *echo.seen.lock(),
            vec![PlanStatus::Running, PlanStatus::Succeeded]
        );
    }

    #[test]
    fn cancel_before_start_interrupts_through_running() {
        // One blocking thread: the second plan queues behind the first.
        let runtime = tokio::runtime::Builder::new_current_thread()
            .max_blocking_threads(1)
            .enable_all()
            .build()
            .unwrap();

        runtime.block_on(async {
            let f = fixture();
            let blocker = f.service.execute(&ctx(), "sleep 5000", None).unwrap();
            let queued = f.service.execute(&ctx(), "apply table t", None).unwrap();

            let requested = f
                .service
                .interrupt_and_cancel(&ctx(), queued.plan_id)
                .unwrap();
            assert_eq!(requested.status, PlanStatus::New);
            assert!(requested.cancel_requested);

            f.service
                .interrupt_and_cancel(&ctx(), blocker.plan_id)
                .unwrap();
            let done = wait_terminal(&f.service, queued.plan_id).await;
            assert_eq!(done.status, PlanStatus::Interrupted);
            assert_eq!(done.error, None);
            assert_eq!(f.service.store().sequence_number(MetadataType::Table), 0);

            let id = queued.plan_id;
            let lines_for_plan = || {
                f.log
                    .lines()
                    .into_iter()
                    .filter(|line| line.contains(&format!("Plan {id} ")))
                    .collect::<Vec<_>>()
            };
            wait_until(|| lines_for_plan().len() == 3).await;
            assert_eq!(
                lines_for_plan(),
                vec![
                    format!("[admin1] Plan {id} [apply table t] NEW"),
                    format!("[admin1] Plan {id} [apply table t] RUNNING"),
                    format!("[admin1] Plan {id} [apply table t] INTERRUPTED"),
                ]
            );
        });
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn finished_plans_are_forgotten_beyond_retention() {
        let config = AdminConfig {
            plan_retention: Some(2),
            ..AdminConfig::default_config()
        };
        let f = fixture_with(config, Handle::current());
        let service = &f.service;

        let long = service.execute(&ctx(), "sleep 5000", None).unwrap();
        let mut finished = Vec::new();
        for key in ["k1", "k2", "k3"] {
            let info = service.execute(&ctx(), "apply table t", Some(key)).unwrap();
            wait_terminal(service, info.plan_id).await;
            finished.push(info.plan_id);
        }

        wait_until(|| service.execution_status(&ctx(), finished[0]).is_err()).await;
        assert_eq!(
            service.execution_status(&ctx(), finished[0]),
            Err(AdminError::NotFound(finished[0]))
        );
        assert!(service.execution_status(&ctx(), finished[1]).is_ok());
        assert!(service.execution_status(&ctx(), finished[2]).is_ok());
        // Unfinished plans are never evicted.
        assert!(!service
            .execution_status(&ctx(), long.plan_id)
            .unwrap()
            .is_terminal());

        // Retained keys still deduplicate; evicted ones admit afresh.
        let again = service.execute(&ctx(), "apply table t", Some("k3")).unwrap();
        assert_eq!(again.plan_id, finished[2]);
        let fresh = service.execute(&ctx(), "apply table t", Some("k1")).unwrap();
        assert!(fresh.plan_id > finished[2]);

        service.interrupt_and_cancel(&ctx(), long.plan_id).unwrap();
        wait_terminal(service, long.plan_id).await;
    }

    #[test]
    fn plan_fails_when_its_worker_never_runs() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let handle = runtime.handle().clone();
        drop(runtime);

        let f = fixture_with(AdminConfig::default_config(), handle);
        let info = f.service.execute(&ctx(), "apply table t", None).unwrap();
        assert_eq!(info.status, PlanStatus::New);

        let settled = f.service.execution_status(&ctx(), info.plan_id).unwrap();
        assert_eq!(settled.status, PlanStatus::Failed);
        let error = settled.error.unwrap();
        assert_eq!(error.kind, ErrorKind::InternalEngineError);
        assert!(error.diagnostic.unwrap().contains("worker dropped"));
        assert_eq!(f.service.store().sequence_number(MetadataType::Table), 0);
        assert_eq!(f.log.lines().len(), 2);
    }
}
