use std::sync::Arc;

use agency::config::{Config, RuntimeKind};
use agency::events::EventHub;
use agency::nudge::{Nudger, spawn_nudge_loop};
use agency::queue::QueueRegistry;
use agency::recovery::{Recovery, spawn_recovery_loop};
use agency::runtime::{AgentRuntime, CliRuntime};
use agency::store::{LibSqlStore, Store, StoreRegistry};
use agency::tenant::SchemaProvisioner;
use agency::workflow::{CancelRegistry, TaskWorkflow, spawn_lifecycle};
use agency::workspace::WorkspaceManager;
use anyhow::Context;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = Config::from_env();
    std::fs::create_dir_all(&config.data_root)
        .with_context(|| format!("creating data root {}", config.data_root.display()))?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        data_root = %config.data_root.display(),
        "Agency starting"
    );

    // ── Persistence ──────────────────────────────────────────────────────
    let canonical: Arc<dyn Store> = Arc::new(
        LibSqlStore::open(&config.canonical_db_path())
            .await
            .context("opening canonical database")?,
    );
    let stores = Arc::new(StoreRegistry::new(config.data_root.clone()));
    let provisioner = Arc::new(SchemaProvisioner::new(
        config.data_root.clone(),
        Arc::clone(&canonical),
        Arc::clone(&stores),
    ));
    provisioner
        .ensure_template()
        .await
        .context("creating template namespace")?;

    // ── Core plumbing ────────────────────────────────────────────────────
    let hub = EventHub::new();
    let cancels = CancelRegistry::new();
    let runtime: Arc<dyn AgentRuntime> = match config.runtime {
        RuntimeKind::Cli => Arc::new(CliRuntime::new(
            config.cli_bin.clone(),
            config.default_model.clone(),
        )),
        RuntimeKind::Embedded => {
            anyhow::bail!(
                "the embedded runtime needs an in-process engine wired by an embedding \
                 program; set AGENCY_RUNTIME=cli"
            );
        }
    };
    let workflow = Arc::new(TaskWorkflow::new(
        Arc::clone(&stores),
        runtime,
        cancels.clone(),
        hub.clone(),
        config.clone(),
    ));
    let queues = Arc::new(QueueRegistry::new(
        Arc::clone(&stores),
        workflow,
        cancels.clone(),
        hub.clone(),
        config.max_task_retries,
    ));

    // ── Startup recovery + background sweeps ─────────────────────────────
    let recovery = Arc::new(Recovery::new(
        Arc::clone(&canonical),
        Arc::clone(&stores),
        Arc::clone(&queues),
        cancels.clone(),
        hub.clone(),
    ));
    // First tick fires immediately: orphan reset + pending re-admission
    let recovery_loop = spawn_recovery_loop(Arc::clone(&recovery), &config);

    let nudger = Arc::new(Nudger::new(
        Arc::clone(&canonical),
        Arc::clone(&stores),
        Arc::clone(&queues),
        hub.clone(),
    ));
    let nudge_loop = spawn_nudge_loop(nudger, &config);

    // ── Lifecycle loops for every agent of every active tenant ──────────
    let workspaces = WorkspaceManager::new(config.workspace_root.clone());
    let mut lifecycles = Vec::new();
    let tenants = canonical
        .list_tenants(agency::model::TenantStatus::Active)
        .await
        .context("listing tenants")?;
    for tenant in &tenants {
        let store = match stores.store_for(&tenant.schema_name).await {
            Ok(store) => store,
            Err(e) => {
                warn!(tenant = %tenant.schema_name, error = %e, "Skipping tenant with unopenable namespace");
                continue;
            }
        };
        let agents = store
            .list_agents()
            .await
            .with_context(|| format!("listing agents of {}", tenant.schema_name))?;
        for agent in agents {
            if let Err(e) = workspaces.ensure(&tenant.schema_name, &agent.name) {
                warn!(agent = %agent.name, error = %e, "Workspace unavailable");
            }
            lifecycles.push(spawn_lifecycle(
                tenant.schema_name.clone(),
                agent.name.clone(),
                Arc::clone(&stores),
                Arc::clone(&queues),
                hub.clone(),
                &config,
            ));
        }
    }
    info!(
        tenants = tenants.len(),
        agents = lifecycles.len(),
        "Scheduler running"
    );

    // ── Shutdown ─────────────────────────────────────────────────────────
    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("Shutting down");
    for handle in &lifecycles {
        handle.shutdown();
    }
    if let Some(handle) = nudge_loop {
        handle.abort();
    }
    recovery_loop.abort();
    queues.shutdown().await;

    Ok(())
}
