//! Per-IP rate limiting over CPU-seconds.
//!
//! One table keyed by submitter IP, one lock, O(1) bookkeeping per call
//! and no I/O under the lock. A submission reserves its declared CPU
//! seconds; completion swaps the reservation for the actual usage, which
//! then ages out of a sliding window. Idle entries are garbage-collected
//! wholesale, discarding accumulated usage; that forgetting is the
//! IP-rotation privacy property, not a leak.

use sandrun_protocol::RejectReason;
use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Sliding window CPU-second accounting covers
    pub window: Duration,
    /// CPU seconds one IP may hold per window
    pub window_cpu_budget: f64,
    pub per_ip_concurrency: usize,
    pub hourly_cap: usize,
    pub hourly_window: Duration,
    /// Idle age after which an IP's state is forgotten
    pub idle_reset: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            window_cpu_budget: 10.0,
            per_ip_concurrency: 2,
            hourly_cap: 20,
            hourly_window: Duration::from_secs(3600),
            idle_reset: Duration::from_secs(3600),
        }
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    Admitted,
    RateLimited {
        reason: RejectReason,
        retry_after_seconds: u64,
    },
}

#[derive(Debug, Default)]
struct IpState {
    /// (expiry, cpu seconds) of completed jobs still inside the window
    window: VecDeque<(Instant, f64)>,
    /// Declared CPU seconds of jobs admitted but not yet completed
    reserved_cpu: f64,
    active_jobs: usize,
    /// Submission instants inside the hourly window
    recent: VecDeque<Instant>,
    last_activity: Option<Instant>,
}

impl IpState {
    fn prune(&mut self, now: Instant, hourly_window: Duration) {
        while self.window.front().is_some_and(|(expiry, _)| *expiry <= now) {
            self.window.pop_front();
        }
        while self
            .recent
            .front()
            .is_some_and(|at| now.duration_since(*at) > hourly_window)
        {
            self.recent.pop_front();
        }
    }

    fn window_usage(&self) -> f64 {
        self.reserved_cpu + self.window.iter().map(|(_, cpu)| cpu).sum::<f64>()
    }
}

pub struct RateLimiter {
    config: RateLimitConfig,
    table: Mutex<HashMap<IpAddr, IpState>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            table: Mutex::new(HashMap::new()),
        }
    }

    /// Read-only admission check against the three gates, in contract
    /// order: CPU budget, concurrency, hourly cap.
    pub fn check_quota(&self, ip: IpAddr, declared_cpu_seconds: u64) -> Admission {
        let mut table = self.lock();
        let state = table.entry(ip).or_default();
        let now = Instant::now();
        state.prune(now, self.config.hourly_window);
        self.gate(state, declared_cpu_seconds as f64, now)
    }

    /// Admission check and start registration under one lock acquisition,
    /// so two racing submissions from one IP cannot both squeeze through
    /// the last slot.
    pub fn try_admit(&self, ip: IpAddr, declared_cpu_seconds: u64) -> Admission {
        let mut table = self.lock();
        let state = table.entry(ip).or_default();
        let now = Instant::now();
        state.prune(now, self.config.hourly_window);
        let admission = self.gate(state, declared_cpu_seconds as f64, now);
        if admission == Admission::Admitted {
            state.active_jobs += 1;
            state.reserved_cpu += declared_cpu_seconds as f64;
            state.recent.push_back(now);
            state.last_activity = Some(now);
        }
        admission
    }

    /// Record a job start admitted through [`check_quota`].
    ///
    /// [`check_quota`]: RateLimiter::check_quota
    pub fn register_start(&self, ip: IpAddr, declared_cpu_seconds: u64) {
        let mut table = self.lock();
        let state = table.entry(ip).or_default();
        let now = Instant::now();
        state.active_jobs += 1;
        state.reserved_cpu += declared_cpu_seconds as f64;
        state.recent.push_back(now);
        state.last_activity = Some(now);
    }

    /// Swap the reservation for actual usage; the actual CPU time ages out
    /// of the window from now.
    pub fn register_end(&self, ip: IpAddr, declared_cpu_seconds: u64, actual_cpu_seconds: f64) {
        let mut table = self.lock();
        let Some(state) = table.get_mut(&ip) else {
            return;
        };
        let now = Instant::now();
        state.active_jobs = state.active_jobs.saturating_sub(1);
        state.reserved_cpu = (state.reserved_cpu - declared_cpu_seconds as f64).max(0.0);
        if actual_cpu_seconds > 0.0 {
            state
                .window
                .push_back((now + self.config.window, actual_cpu_seconds));
        }
        state.last_activity = Some(now);
    }

    /// Forget IPs idle past the reset period. Never touches an entry with
    /// active jobs.
    pub fn gc_idle(&self) -> usize {
        let mut table = self.lock();
        let before = table.len();
        let idle_reset = self.config.idle_reset;
        table.retain(|_, state| {
            state.active_jobs > 0
                || state
                    .last_activity
                    .map_or(true, |at| at.elapsed() <= idle_reset)
        });
        let removed = before - table.len();
        if removed > 0 {
            debug!(removed, "rate limiter forgot idle IPs");
        }
        removed
    }

    pub fn tracked_ips(&self) -> usize {
        self.lock().len()
    }

    fn gate(&self, state: &IpState, declared_cpu: f64, now: Instant) -> Admission {
        if state.window_usage() + declared_cpu > self.config.window_cpu_budget {
            let retry = state
                .window
                .front()
                .map(|(expiry, _)| expiry.saturating_duration_since(now).as_secs() + 1)
                .unwrap_or_else(|| self.config.window.as_secs());
            return Admission::RateLimited {
                reason: RejectReason::CpuBudget,
                retry_after_seconds: retry,
            };
        }
        if state.active_jobs >= self.config.per_ip_concurrency {
            return Admission::RateLimited {
                reason: RejectReason::ConcurrencyCap,
                retry_after_seconds: 5,
            };
        }
        if state.recent.len() >= self.config.hourly_cap {
            let retry = state
                .recent
                .front()
                .map(|at| {
                    (self.config.hourly_window.saturating_sub(at.elapsed())).as_secs() + 1
                })
                .unwrap_or_else(|| self.config.hourly_window.as_secs());
            return Admission::RateLimited {
                reason: RejectReason::HourlyCap,
                retry_after_seconds: retry,
            };
        }
        Admission::Admitted
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<IpAddr, IpState>> {
        self.table
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(last: u8) -> IpAddr {
        IpAddr::from([10, 0, 0, last])
    }

    fn limited_reason(admission: Admission) -> RejectReason {
        match admission {
            Admission::RateLimited { reason, .. } => reason,
            Admission::Admitted => panic!("expected rate limiting"),
        }
    }

    #[test]
    fn cpu_budget_gates_third_submission() {
        // Spec scenario: 10 CPU-seconds per window, jobs declaring 4 each.
        let limiter = RateLimiter::new(RateLimitConfig::default());
        assert_eq!(limiter.try_admit(ip(1), 4), Admission::Admitted);
        assert_eq!(limiter.try_admit(ip(1), 4), Admission::Admitted);
        assert_eq!(
            limited_reason(limiter.try_admit(ip(1), 4)),
            RejectReason::CpuBudget
        );
    }

    #[test]
    fn concurrency_cap_applies_after_cpu_budget() {
        let config = RateLimitConfig {
            window_cpu_budget: 100.0,
            per_ip_concurrency: 2,
            ..Default::default()
        };
        let limiter = RateLimiter::new(config);
        assert_eq!(limiter.try_admit(ip(1), 1), Admission::Admitted);
        assert_eq!(limiter.try_admit(ip(1), 1), Admission::Admitted);
        assert_eq!(
            limited_reason(limiter.try_admit(ip(1), 1)),
            RejectReason::ConcurrencyCap
        );
        // A different IP is untouched.
        assert_eq!(limiter.try_admit(ip(2), 1), Admission::Admitted);
    }

    #[test]
    fn completion_frees_a_concurrency_slot() {
        let config = RateLimitConfig {
            window_cpu_budget: 100.0,
            per_ip_concurrency: 1,
            ..Default::default()
        };
        let limiter = RateLimiter::new(config);
        assert_eq!(limiter.try_admit(ip(1), 1), Admission::Admitted);
        assert_ne!(limiter.try_admit(ip(1), 1), Admission::Admitted);
        limiter.register_end(ip(1), 1, 0.0);
        assert_eq!(limiter.try_admit(ip(1), 1), Admission::Admitted);
    }

    #[test]
    fn actual_usage_ages_out_of_the_window() {
        let config = RateLimitConfig {
            window: Duration::from_millis(150),
            window_cpu_budget: 10.0,
            per_ip_concurrency: 10,
            ..Default::default()
        };
        let limiter = RateLimiter::new(config);
        assert_eq!(limiter.try_admit(ip(1), 8), Admission::Admitted);
        limiter.register_end(ip(1), 8, 8.0);

        // Used 8 of 10 inside the window: a 4-second job will not fit.
        assert_eq!(
            limited_reason(limiter.try_admit(ip(1), 4)),
            RejectReason::CpuBudget
        );
        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(limiter.try_admit(ip(1), 4), Admission::Admitted);
    }

    #[test]
    fn cheap_actual_usage_replenishes_declared_reservation() {
        let limiter = RateLimiter::new(RateLimitConfig::default());
        assert_eq!(limiter.try_admit(ip(1), 8), Admission::Admitted);
        // Declared 8 but only burned 0.2: the difference frees up at once.
        limiter.register_end(ip(1), 8, 0.2);
        assert_eq!(limiter.try_admit(ip(1), 8), Admission::Admitted);
    }

    #[test]
    fn hourly_cap_limits_bursts() {
        let config = RateLimitConfig {
            window_cpu_budget: 1000.0,
            per_ip_concurrency: 1000,
            hourly_cap: 3,
            ..Default::default()
        };
        let limiter = RateLimiter::new(config);
        for _ in 0..3 {
            assert_eq!(limiter.try_admit(ip(1), 1), Admission::Admitted);
        }
        let admission = limiter.try_admit(ip(1), 1);
        assert_eq!(limited_reason(admission.clone()), RejectReason::HourlyCap);
        if let Admission::RateLimited {
            retry_after_seconds,
            ..
        } = admission
        {
            assert!(retry_after_seconds > 0);
        }
    }

    #[test]
    fn check_quota_does_not_reserve() {
        let limiter = RateLimiter::new(RateLimitConfig::default());
        for _ in 0..5 {
            assert_eq!(limiter.check_quota(ip(1), 4), Admission::Admitted);
        }
        limiter.register_start(ip(1), 4);
        assert_eq!(limiter.check_quota(ip(1), 8), Admission::Admitted);
        assert_ne!(limiter.check_quota(ip(1), 7), Admission::Admitted);
    }

    #[test]
    fn idle_ips_are_forgotten_but_active_ones_are_not() {
        let config = RateLimitConfig {
            idle_reset: Duration::from_millis(50),
            ..Default::default()
        };
        let limiter = RateLimiter::new(config);
        assert_eq!(limiter.try_admit(ip(1), 4), Admission::Admitted);
        limiter.register_end(ip(1), 4, 4.0);
        assert_eq!(limiter.try_admit(ip(2), 4), Admission::Admitted);

        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(limiter.gc_idle(), 1); // ip(1) forgotten, ip(2) still active
        assert_eq!(limiter.tracked_ips(), 1);

        // Forgetting discarded the usage: ip(1) starts from a clean slate.
        assert_eq!(limiter.try_admit(ip(1), 8), Admission::Admitted);
    }
}
