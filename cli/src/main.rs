use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use tokio::runtime::Handle;
use tracing_subscriber::EnvFilter;

use admiral_kernel::admin::{AdminService, AuthContext, ExecutionInfo, RequestContext};
use admiral_kernel::client::{AdminClient, EndpointDirectory};
use admiral_kernel::cluster::{Membership, NodeView};
use admiral_kernel::config::AdminConfig;
use admiral_kernel::metadata::{MetadataStore, MetadataType, SequenceNumber};
use admiral_kernel::observe::{ListenerError, MemoryStateLog, StateListener};
use admiral_kernel::plan::{PlanStateBroadcaster, PlanStateChange, ScriptedEngine};

/// Admiral Control Plane CLI
#[derive(Parser, Debug)]
#[command(name = "admiral")]
#[command(about = "Run admin statements against an in-process coordinator", long_about = None)]
struct Cli {
    /// Path to node config JSON
    #[arg(long)]
    config: Option<String>,

    /// Statement to execute; repeat for several plans
    #[arg(long = "statement", required = true)]
    statements: Vec<String>,

    /// Cancel each plan this many milliseconds after submission
    #[arg(long)]
    cancel_after_ms: Option<u64>,

    /// Report metadata changes after this sequence number
    #[arg(long, default_value_t = 0)]
    since: SequenceNumber,

    /// Status polling interval in milliseconds
    #[arg(long, default_value_t = 20)]
    poll_ms: u64,
}

#[derive(Debug, Serialize)]
struct ChangeSummary {
    metadata_type: MetadataType,
    sequence_number: SequenceNumber,
    changes: Vec<String>,
}

/// Counts terminal broadcasts, which land just after the status
/// becomes readable.
#[derive(Debug, Default)]
struct Finished(AtomicUsize);

impl StateListener<PlanStateChange> for Finished {
    fn on_state_change(&self, _: &str, change: &PlanStateChange) -> Result<(), ListenerError> {
        if change.status.is_terminal() {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Wrapper for JSON output
#[derive(Debug, Serialize)]
struct CliOutput {
    node: String,
    plans: Vec<ExecutionInfo>,
    state_log: Vec<String>,
    metadata: Vec<ChangeSummary>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // ----------------------------
    // Load config
    // ----------------------------
    let config = if let Some(path) = &cli.config {
        let data = fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
        AdminConfig::from_json(&data)?
    } else {
        AdminConfig::default_config()
    };

    // ----------------------------
    // Single-node coordinator
    // ----------------------------
    let address = config.address.clone();
    let node_name = config.node_name.clone();
    let membership = Arc::new(Membership::new(Some(address.clone())));
    let view = Arc::new(NodeView::new(address.clone(), membership));
    let store = Arc::new(MetadataStore::new(config.metadata_history_limit));
    let log = Arc::new(MemoryStateLog::default());
    let broadcaster = Arc::new(PlanStateBroadcaster::new(log.clone()));
    let finished = Arc::new(Finished::default());
    broadcaster.add_listener(finished.clone());
    let retry = config.client_retry.clone();

    let service = Arc::new(AdminService::new(
        config,
        view,
        store.clone(),
        broadcaster,
        ScriptedEngine::new(),
        Handle::current(),
    ));

    let mut directory = EndpointDirectory::new();
    directory.register(address.clone(), service);
    let client = AdminClient::new(
        directory,
        vec![address],
        retry,
        RequestContext::current(AuthContext::anonymous()),
    );

    // ----------------------------
    // Execute statements
    // ----------------------------
    let poll = Duration::from_millis(cli.poll_ms);
    let mut plans = Vec::with_capacity(cli.statements.len());
    for statement in &cli.statements {
        let (coordinator, info) = client.execute(statement).await?;
        tracing::info!(plan = %info.plan_id, %coordinator, "submitted");

        if let Some(ms) = cli.cancel_after_ms {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            client.cancel(&coordinator, info.plan_id)?;
        }

        plans.push(
            client
                .wait_for_completion(&coordinator, info.plan_id, poll)
                .await?,
        );
    }

    let settled = tokio::time::timeout(Duration::from_secs(5), async {
        while finished.0.load(Ordering::SeqCst) < plans.len() {
            tokio::time::sleep(poll).await;
        }
    })
    .await;
    if settled.is_err() {
        tracing::warn!("state log may be missing final transitions");
    }

    // ----------------------------
    // Output
    // ----------------------------
    let metadata = MetadataType::ALL
        .iter()
        .map(|&metadata_type| {
            let info = store.change_info(metadata_type, cli.since);
            ChangeSummary {
                metadata_type,
                sequence_number: store.sequence_number(metadata_type),
                changes: info
                    .changes
                    .iter()
                    .map(|c| {
                        format!(
                            "{}: {}",
                            c.sequence_number,
                            String::from_utf8_lossy(&c.payload)
                        )
                    })
                    .collect(),
            }
        })
        .collect();

    let output = CliOutput {
        node: node_name,
        plans,
        state_log: log.lines(),
        metadata,
    };

    println!("{}", serde_json::to_string_pretty(&output)?);

    Ok(())
}
