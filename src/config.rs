#[derive(Clone, Debug)]
pub struct AppConfig {
    /// Database connection string.
    pub database_url: String,

    // =========================
    // Dispatcher configuration
    // =========================
    /// Number of parallel worker tasks in the dispatcher pool.
    pub dispatcher_workers: usize,

    /// Interval between claim attempts when a worker finds no eligible job.
    pub dispatcher_idle_poll_ms: u64,

    /// Interval between janitor sweeps for expired jobs.
    pub janitor_interval_ms: u64,

    /// Logs a warning when a single job's execution exceeds this, in
    /// milliseconds.
    pub slow_job_warn_ms: u64,

    // =========================
    // Retry / backoff configuration
    // =========================
    /// Base backoff applied to the first retry, in seconds.
    ///
    /// Effective backoff is `min(retry_backoff_base_s * 2^retry_count,
    /// retry_backoff_cap_s)`.
    pub retry_backoff_base_s: u64,

    /// Upper bound on backoff duration, in seconds.
    pub retry_backoff_cap_s: u64,

    /// Default max retries for a job unless overridden at submission.
    pub default_max_retries: u32,

    /// Job lifetime before the janitor expires it, in seconds.
    pub job_expiry_s: i64,

    // =========================
    // Plugin-bridge configuration
    // =========================
    /// Default long-poll hold time, in seconds.
    pub bridge_long_poll_default_s: u64,

    /// Default per-request timeout when the caller does not specify one.
    pub bridge_request_default_timeout_s: u64,

    /// Maximum number of pending requests queued per tenant before
    /// `ChannelSaturated` is returned to the calling task.
    pub bridge_queue_capacity: usize,

    // =========================
    // Rate-limit cap table
    // =========================
    /// M1 (bridged): jobs/minute/tenant.
    pub cap_m1_jobs_per_minute: u32,
    /// M2 (direct): calls/day/tenant.
    pub cap_m2_calls_per_day: u32,
    /// M3 (direct): calls/day/tenant.
    pub cap_m3_calls_per_day: u32,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://marketflow_dev.db".to_string());

        Self {
            database_url,

            dispatcher_workers: 8,
            dispatcher_idle_poll_ms: 250,
            janitor_interval_ms: 30_000,
            slow_job_warn_ms: 5_000,

            retry_backoff_base_s: 60,
            retry_backoff_cap_s: 3_600,
            default_max_retries: 3,
            job_expiry_s: 3_600,

            bridge_long_poll_default_s: 30,
            bridge_request_default_timeout_s: 60,
            bridge_queue_capacity: 256,

            cap_m1_jobs_per_minute: 10,
            cap_m2_calls_per_day: 5_000,
            cap_m3_calls_per_day: 10_000,
        }
    }
}
