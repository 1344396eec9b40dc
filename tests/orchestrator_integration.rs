use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use marketflow::actions::{ActionRegistry, HandlerTable, MarketplaceService, TaskSpec};
use marketflow::batch::{BatchRegistry, JobSpec};
use marketflow::bridge::PluginBridge;
use marketflow::config::AppConfig;
use marketflow::db::Db;
use marketflow::dispatcher::Dispatcher;
use marketflow::error::OrchestratorError;
use marketflow::facade::JobsService;
use marketflow::model::{ActionOutcome, BatchStatus, Job, JobStatus, Marketplace, Priority, Task, TaskStatus, TaskType, Tenant};
use marketflow::orchestrator::TaskOrchestrator;
use marketflow::ratelimit::RateLimiter;
use marketflow::stats::StatsAggregator;
use marketflow::store::sqlx_store::SqlxStore;
use marketflow::store::TenantStore;

struct AlwaysSucceeds;

#[async_trait]
impl MarketplaceService for AlwaysSucceeds {
    async fn execute(&self, _job: &Job, task: &Task) -> Result<ActionOutcome, OrchestratorError> {
        Ok(ActionOutcome {
            success: true,
            result: task.payload.clone(),
            error: None,
        })
    }
}

struct AlwaysSessionLost;

#[async_trait]
impl MarketplaceService for AlwaysSessionLost {
    async fn execute(&self, job: &Job, _task: &Task) -> Result<ActionOutcome, OrchestratorError> {
        Err(OrchestratorError::SessionLost(job.tenant.to_string()))
    }
}

/// Fails its first `fail_count` calls, then succeeds forever after.
struct FailsNTimes {
    remaining: AtomicU32,
}

impl FailsNTimes {
    fn new(fail_count: u32) -> Self {
        Self {
            remaining: AtomicU32::new(fail_count),
        }
    }
}

#[async_trait]
impl MarketplaceService for FailsNTimes {
    async fn execute(&self, _job: &Job, task: &Task) -> Result<ActionOutcome, OrchestratorError> {
        let prev = self.remaining.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
            if v > 0 { Some(v - 1) } else { None }
        });
        if prev.is_ok() {
            Err(OrchestratorError::UpstreamFailure("simulated upstream hiccup".into()))
        } else {
            Ok(ActionOutcome {
                success: true,
                result: task.payload.clone(),
                error: None,
            })
        }
    }
}

/// Fails when the task payload carries `{"should_fail": true}`, succeeds otherwise.
struct FlakyByPayload;

#[async_trait]
impl MarketplaceService for FlakyByPayload {
    async fn execute(&self, _job: &Job, task: &Task) -> Result<ActionOutcome, OrchestratorError> {
        if task.payload.get("should_fail").and_then(|v| v.as_bool()).unwrap_or(false) {
            Err(OrchestratorError::UpstreamFailure("flaky marketplace error".into()))
        } else {
            Ok(ActionOutcome {
                success: true,
                result: task.payload.clone(),
                error: None,
            })
        }
    }
}

struct Harness {
    service: JobsService,
    dispatcher: Arc<Dispatcher>,
}

async fn build_harness(
    handlers: HandlerTable,
    pipelines: Vec<(Marketplace, &str, Vec<TaskSpec>)>,
    cfg_mut: impl FnOnce(&mut AppConfig),
) -> Harness {
    sqlx::any::install_default_drivers();
    let db = Db::connect("sqlite::memory:").await.unwrap();
    db.migrate().await.unwrap();
    let store: Arc<dyn TenantStore> = Arc::new(SqlxStore::new(db.pool.clone()));

    let mut registry = ActionRegistry::new();
    for (marketplace, action_code, steps) in pipelines {
        registry.register(marketplace, action_code, steps);
    }
    let registry = Arc::new(registry);

    let mut cfg = AppConfig::from_env();
    cfg.database_url = "sqlite::memory:".into();
    cfg_mut(&mut cfg);

    let orchestrator = Arc::new(TaskOrchestrator::new(
        store.clone(),
        registry.clone(),
        Arc::new(handlers),
    ));
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
    let bridge = Arc::new(PluginBridge::new(cfg.bridge_queue_capacity));
    let service = JobsService::new(store, batches, dispatcher.clone(), bridge, registry, cfg);

    Harness { service, dispatcher }
}

#[tokio::test]
async fn direct_happy_path_completes_job() {
    let mut handlers = HandlerTable::new();
    handlers.register(TaskType::DirectHttp, Arc::new(AlwaysSucceeds));

    let h = build_harness(
        handlers,
        vec![(
            Marketplace::M2,
            "sync_listing",
            vec![TaskSpec::new("call api", TaskType::DirectHttp)],
        )],
        |_| {},
    )
    .await;

    let tenant = Tenant::new("acme");
    let job = h
        .service
        .submit_job(
            &tenant,
            Marketplace::M2,
            "sync_listing",
            None,
            serde_json::json!({"sku": "abc"}),
            Priority::NORMAL,
            None,
        )
        .await
        .unwrap();

    assert!(h.dispatcher.try_claim_and_run().await.unwrap());

    let fetched = h.service.get_job(&tenant, job.id).await.unwrap().unwrap();
    assert_eq!(fetched.job.status, JobStatus::Completed);
}

#[tokio::test]
async fn retry_succeeds_and_skips_already_completed_tasks() {
    let mut handlers = HandlerTable::new();
    handlers.register(TaskType::Db, Arc::new(AlwaysSucceeds));
    handlers.register(TaskType::DirectHttp, Arc::new(FailsNTimes::new(1)));

    let h = build_harness(
        handlers,
        vec![(
            Marketplace::M2,
            "two_step",
            vec![
                TaskSpec::new("persist artifact", TaskType::Db),
                TaskSpec::new("call api", TaskType::DirectHttp),
            ],
        )],
        |cfg| cfg.retry_backoff_base_s = 0,
    )
    .await;

    let tenant = Tenant::new("acme");
    let job = h
        .service
        .submit_job(
            &tenant,
            Marketplace::M2,
            "two_step",
            None,
            serde_json::json!({}),
            Priority::NORMAL,
            Some(2),
        )
        .await
        .unwrap();

    // First attempt: task 1 succeeds, task 2 fails, job goes back to pending.
    assert!(h.dispatcher.try_claim_and_run().await.unwrap());
    let after_first = h.service.get_job(&tenant, job.id).await.unwrap().unwrap();
    assert_eq!(after_first.job.status, JobStatus::Pending);
    assert_eq!(after_first.job.retry_count, 1);

    // Second attempt: task 1 is skipped (already succeeded), task 2 succeeds now.
    assert!(h.dispatcher.try_claim_and_run().await.unwrap());
    let after_second = h.service.get_job(&tenant, job.id).await.unwrap().unwrap();
    assert_eq!(after_second.job.status, JobStatus::Completed);

    let tasks = h
        .service
        .list_tasks(&tenant, Default::default(), Default::default())
        .await
        .unwrap()
        .0;
    let db_task = tasks.iter().find(|t| t.task_type == TaskType::Db).unwrap();
    assert_eq!(db_task.retry_count, 0, "skip-completed must not re-run task 1");
    assert_eq!(db_task.status, TaskStatus::Success);
}

#[tokio::test]
async fn session_loss_fails_job_without_retry() {
    let mut handlers = HandlerTable::new();
    handlers.register(TaskType::PluginHttp, Arc::new(AlwaysSessionLost));

    let h = build_harness(
        handlers,
        vec![(
            Marketplace::M1,
            "sync_listing",
            vec![TaskSpec::new("bridge call", TaskType::PluginHttp)],
        )],
        |_| {},
    )
    .await;

    let tenant = Tenant::new("acme");
    let job = h
        .service
        .submit_job(
            &tenant,
            Marketplace::M1,
            "sync_listing",
            None,
            serde_json::json!({}),
            Priority::NORMAL,
            Some(5),
        )
        .await
        .unwrap();

    assert!(h.dispatcher.try_claim_and_run().await.unwrap());

    let fetched = h.service.get_job(&tenant, job.id).await.unwrap().unwrap();
    assert_eq!(fetched.job.status, JobStatus::Failed);
    assert_eq!(fetched.job.retry_count, 0, "session loss is terminal, never retried");
}

#[tokio::test]
async fn batch_rollup_reports_partial_when_one_job_fails_permanently() {
    let mut handlers = HandlerTable::new();
    handlers.register(TaskType::DirectHttp, Arc::new(FlakyByPayload));

    let h = build_harness(
        handlers,
        vec![(
            Marketplace::M2,
            "sync_listing",
            vec![TaskSpec::new("call api", TaskType::DirectHttp)],
        )],
        |_| {},
    )
    .await;

    let tenant = Tenant::new("acme");
    let batch = h
        .service
        .submit_batch(
            &tenant,
            Marketplace::M2,
            "sync_listing",
            vec![
                JobSpec {
                    product_id: Some("ok-1".into()),
                    input_data: serde_json::json!({"should_fail": false}),
                    priority: Priority::NORMAL,
                    max_retries: None,
                },
                JobSpec {
                    product_id: Some("bad-1".into()),
                    input_data: serde_json::json!({"should_fail": true}),
                    priority: Priority::NORMAL,
                    max_retries: Some(0),
                },
            ],
        )
        .await
        .unwrap();

    assert!(h.dispatcher.try_claim_and_run().await.unwrap());
    assert!(h.dispatcher.try_claim_and_run().await.unwrap());
    assert!(!h.dispatcher.try_claim_and_run().await.unwrap());

    let (batches, _) = h
        .service
        .list_batches(&tenant, None, None, Default::default())
        .await
        .unwrap();
    let updated = batches.into_iter().find(|b| b.id == batch.id).unwrap();
    assert_eq!(updated.status, BatchStatus::Partial);
    assert_eq!(updated.completed_jobs, 1);
    assert_eq!(updated.failed_jobs, 1);
}

#[tokio::test]
async fn cancel_pause_resume_transitions() {
    let mut handlers = HandlerTable::new();
    handlers.register(TaskType::DirectHttp, Arc::new(AlwaysSucceeds));

    let h = build_harness(
        handlers,
        vec![(
            Marketplace::M2,
            "sync_listing",
            vec![TaskSpec::new("call api", TaskType::DirectHttp)],
        )],
        |_| {},
    )
    .await;

    let tenant = Tenant::new("acme");
    let job = h
        .service
        .submit_job(
            &tenant,
            Marketplace::M2,
            "sync_listing",
            None,
            serde_json::json!({}),
            Priority::NORMAL,
            None,
        )
        .await
        .unwrap();

    let paused = h.service.pause_job(&tenant, job.id).await.unwrap();
    assert_eq!(paused.status, JobStatus::Paused);

    // Paused jobs are off the ready queue; nothing to claim.
    assert!(!h.dispatcher.try_claim_and_run().await.unwrap());

    let resumed = h.service.resume_job(&tenant, job.id).await.unwrap();
    assert_eq!(resumed.status, JobStatus::Pending);

    let cancelled_job = h
        .service
        .submit_job(
            &tenant,
            Marketplace::M2,
            "sync_listing",
            None,
            serde_json::json!({}),
            Priority::NORMAL,
            None,
        )
        .await
        .unwrap();
    let cancelled = h.service.cancel_job(&tenant, cancelled_job.id).await.unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);
    assert!(h.service.cancel_job(&tenant, cancelled_job.id).await.is_err());
}

/// Simulates an operator cancelling a job through a side channel while its
/// first task is still executing, by writing the cancellation straight to
/// the store from inside the handler rather than through the dispatcher.
struct CancelsJobAfterFirstTask {
    store: Arc<dyn TenantStore>,
}

#[async_trait]
impl MarketplaceService for CancelsJobAfterFirstTask {
    async fn execute(&self, job: &Job, task: &Task) -> Result<ActionOutcome, OrchestratorError> {
        if task.position == 0 {
            let conn = self.store.bind(&job.tenant).await.unwrap();
            let mut current = self.store.get_job(&conn, job.id).await.unwrap().unwrap();
            current.status = JobStatus::Cancelled;
            current.completed_at = Some(marketflow::time::now_utc());
            self.store.update_job(&conn, &current).await.unwrap();
        }
        Ok(ActionOutcome {
            success: true,
            result: task.payload.clone(),
            error: None,
        })
    }
}

#[tokio::test]
async fn cancellation_observed_mid_pipeline_stops_remaining_tasks_and_is_not_overwritten() {
    sqlx::any::install_default_drivers();
    let db = Db::connect("sqlite::memory:").await.unwrap();
    db.migrate().await.unwrap();
    let store: Arc<dyn TenantStore> = Arc::new(SqlxStore::new(db.pool.clone()));

    let mut registry = ActionRegistry::new();
    registry.register(
        Marketplace::M2,
        "two_step",
        vec![
            TaskSpec::new("step one", TaskType::DirectHttp),
            TaskSpec::new("step two", TaskType::Db),
        ],
    );
    let registry = Arc::new(registry);

    let mut handlers = HandlerTable::new();
    handlers.register(TaskType::DirectHttp, Arc::new(CancelsJobAfterFirstTask { store: store.clone() }));
    handlers.register(TaskType::Db, Arc::new(AlwaysSucceeds));

    let cfg = AppConfig::from_env();
    let orchestrator = Arc::new(TaskOrchestrator::new(store.clone(), registry.clone(), Arc::new(handlers)));
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
    let bridge = Arc::new(PluginBridge::new(cfg.bridge_queue_capacity));
    let service = JobsService::new(store.clone(), batches, dispatcher.clone(), bridge, registry, cfg);

    let tenant = Tenant::new("acme");
    let job = service
        .submit_job(
            &tenant,
            Marketplace::M2,
            "two_step",
            None,
            serde_json::json!({}),
            Priority::NORMAL,
            None,
        )
        .await
        .unwrap();

    assert!(dispatcher.try_claim_and_run().await.unwrap());

    let fetched = service.get_job(&tenant, job.id).await.unwrap().unwrap();
    assert_eq!(
        fetched.job.status,
        JobStatus::Cancelled,
        "cancellation observed mid-pipeline must survive, not be overwritten by finish_failure"
    );

    let tasks = service
        .list_tasks(&tenant, Default::default(), Default::default())
        .await
        .unwrap()
        .0;
    let step_two = tasks.iter().find(|t| t.position == 1).unwrap();
    assert_eq!(
        step_two.status,
        TaskStatus::Cancelled,
        "a pending task still attached to a cancelled job must be cascade-cancelled, never left dangling"
    );
}
