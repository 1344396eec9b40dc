use std::sync::Arc;

use marketflow::actions::stub_services::{BridgedHttpService, DirectHttpService, LocalEchoService};
use marketflow::actions::{ActionRegistry, HandlerTable, TaskSpec};
use marketflow::batch::BatchRegistry;
use marketflow::bridge::PluginBridge;
use marketflow::config::AppConfig;
use marketflow::db::Db;
use marketflow::dispatcher::Dispatcher;
use marketflow::facade::JobsService;
use marketflow::logger::init_tracing;
use marketflow::model::{Marketplace, TaskType};
use marketflow::orchestrator::TaskOrchestrator;
use marketflow::ratelimit::RateLimiter;
use marketflow::stats::StatsAggregator;
use marketflow::store::sqlx_store::SqlxStore;
use marketflow::store::TenantStore;

/// Declares the task pipelines the orchestrator knows how to run out of the
/// box. A deployment grows this table as it onboards new marketplace
/// actions; it is not meant to be exhaustive here.
fn bootstrap_action_registry() -> ActionRegistry {
    let mut registry = ActionRegistry::new();

    registry.register(
        Marketplace::M1,
        "sync_listing",
        vec![TaskSpec::new("push listing through plugin session", TaskType::PluginHttp)],
    );
    registry.register(
        Marketplace::M2,
        "sync_listing",
        vec![TaskSpec::new("call marketplace API directly", TaskType::DirectHttp)],
    );
    registry.register(
        Marketplace::M3,
        "sync_listing",
        vec![TaskSpec::new("call marketplace API directly", TaskType::DirectHttp)],
    );

    registry
}

fn bootstrap_handler_table(bridge: Arc<PluginBridge>, cfg: &AppConfig) -> HandlerTable {
    let mut handlers = HandlerTable::new();
    handlers.register(
        TaskType::PluginHttp,
        Arc::new(BridgedHttpService::new(
            bridge,
            std::time::Duration::from_secs(cfg.bridge_request_default_timeout_s),
        )),
    );
    handlers.register(
        TaskType::DirectHttp,
        Arc::new(DirectHttpService::new("https://marketplace.example/api")),
    );
    handlers.register(TaskType::Db, Arc::new(LocalEchoService));
    handlers.register(TaskType::File, Arc::new(LocalEchoService));
    handlers
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    sqlx::any::install_default_drivers();

    let is_production = std::env::var("APP_ENV").unwrap_or_default() == "production";
    init_tracing(is_production);

    tracing::info!("Starting marketflow orchestrator...");

    let cfg = AppConfig::from_env();

    let db = Db::connect(&cfg.database_url).await?;
    db.migrate().await?;

    let store: Arc<dyn TenantStore> = Arc::new(SqlxStore::new(db.pool.clone()));

    let bridge = Arc::new(PluginBridge::new(cfg.bridge_queue_capacity));
    let registry = Arc::new(bootstrap_action_registry());
    let handlers = Arc::new(bootstrap_handler_table(bridge.clone(), &cfg));

    let orchestrator = Arc::new(TaskOrchestrator::new(store.clone(), registry.clone(), handlers));
    let batches = Arc::new(BatchRegistry::new(store.clone(), cfg.clone()));
    let stats = Arc::new(StatsAggregator::new(store.clone()));
    let ratelimit = Arc::new(RateLimiter::new(&cfg));

    let dispatcher = Arc::new(Dispatcher::new(
        store.clone(),
        orchestrator,
        batches.clone(),
        stats,
        ratelimit,
        cfg.clone(),
    ));
    let worker_handles = dispatcher.spawn();

    let _service = JobsService::new(store, batches, dispatcher, bridge, registry, cfg);

    tracing::info!("Dispatcher started; waiting for shutdown signal");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");

    for handle in worker_handles {
        handle.abort();
    }

    Ok(())
}
