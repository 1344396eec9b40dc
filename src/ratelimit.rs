//! Rate Limiter: enforces the per-tenant, per-marketplace cap
//! table the dispatcher consults before claiming a job for execution.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::AppConfig;
use crate::error::OrchestratorError;
use crate::model::{Marketplace, Tenant};

struct Window {
    count: u32,
    resets_at_ms: i64,
}

pub struct RateLimiter {
    windows: Mutex<HashMap<(Tenant, Marketplace), Window>>,
    cap_m1_per_minute: u32,
    cap_m2_per_day: u32,
    cap_m3_per_day: u32,
}

impl RateLimiter {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            cap_m1_per_minute: config.cap_m1_jobs_per_minute,
            cap_m2_per_day: config.cap_m2_calls_per_day,
            cap_m3_per_day: config.cap_m3_calls_per_day,
        }
    }

    fn cap_and_window(&self, marketplace: Marketplace) -> (u32, Duration) {
        match marketplace {
            Marketplace::M1 => (self.cap_m1_per_minute, Duration::from_secs(60)),
            Marketplace::M2 => (self.cap_m2_per_day, Duration::from_secs(86_400)),
            Marketplace::M3 => (self.cap_m3_per_day, Duration::from_secs(86_400)),
        }
    }

    /// Admits one unit of work for `(tenant, marketplace)`, or rejects with
    /// [`OrchestratorError::RateLimited`] if the tenant's cap for the current
    /// window is exhausted. Fixed-window counting, reset on window rollover —
    /// simple and sufficient for the coarse per-minute/per-day caps here.
    pub fn check_and_increment(&self, tenant: &Tenant, marketplace: Marketplace) -> Result<(), OrchestratorError> {
        let (cap, window) = self.cap_and_window(marketplace);
        let now = crate::time::now_ms() as i64;
        let mut guard = self.windows.lock();
        let entry = guard
            .entry((tenant.clone(), marketplace))
            .or_insert_with(|| Window {
                count: 0,
                resets_at_ms: now + window.as_millis() as i64,
            });

        if now >= entry.resets_at_ms {
            entry.count = 0;
            entry.resets_at_ms = now + window.as_millis() as i64;
        }

        if entry.count >= cap {
            return Err(OrchestratorError::RateLimited(format!(
                "tenant {tenant} exceeded {} cap for {}",
                cap,
                marketplace.as_str()
            )));
        }

        entry.count += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_once_cap_is_exhausted() {
        let mut cfg = AppConfig::from_env();
        cfg.cap_m1_jobs_per_minute = 2;
        let limiter = RateLimiter::new(&cfg);
        let tenant = Tenant::new("acme");

        assert!(limiter.check_and_increment(&tenant, Marketplace::M1).is_ok());
        assert!(limiter.check_and_increment(&tenant, Marketplace::M1).is_ok());
        assert!(limiter.check_and_increment(&tenant, Marketplace::M1).is_err());
    }

    #[test]
    fn tenants_and_marketplaces_are_independent() {
        let mut cfg = AppConfig::from_env();
        cfg.cap_m1_jobs_per_minute = 1;
        let limiter = RateLimiter::new(&cfg);

        assert!(limiter.check_and_increment(&Tenant::new("a"), Marketplace::M1).is_ok());
        assert!(limiter.check_and_increment(&Tenant::new("b"), Marketplace::M1).is_ok());
        assert!(limiter.check_and_increment(&Tenant::new("a"), Marketplace::M2).is_ok());
    }

    use proptest::prelude::*;

    proptest! {
        /// R4: within a single window, a (tenant, marketplace) pair is never
        /// admitted more than its configured cap, however many attempts it
        /// makes.
        #[test]
        fn never_admits_more_than_cap_within_one_window(cap in 0u32..20, attempts in 0u32..40) {
            let mut cfg = AppConfig::from_env();
            cfg.cap_m1_jobs_per_minute = cap;
            let limiter = RateLimiter::new(&cfg);
            let tenant = Tenant::new("acme");

            let admitted = (0..attempts)
                .filter(|_| limiter.check_and_increment(&tenant, Marketplace::M1).is_ok())
                .count() as u32;

            prop_assert!(admitted <= cap);
        }
    }
}
