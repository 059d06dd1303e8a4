//! Shared gate for every model call.
//!
//! A [`RateController`] is constructed once and handed to the executor and
//! the fitness evaluator, so concurrent evolutions never share hidden state.
//! It bounds in-flight calls with a semaphore, caps calls per sliding
//! window, and optionally caps concurrently running workflows.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, warn};

use evoflow_core::config::BudgetConfig;
use evoflow_core::error::{EvoflowError, Result};
use evoflow_core::traits::ModelClient;
use evoflow_core::types::{CompletionRequest, CompletionResponse};

/// Limits a [`RateController`] enforces.
#[derive(Debug, Clone)]
pub struct RateLimits {
    pub max_concurrent: usize,
    pub max_per_window: usize,
    pub window: Duration,
    /// Cap on concurrently running workflows; `None` disables the guard.
    pub max_workflows: Option<usize>,
    /// Idle time before a run is declared stalled; `None` disables the guard.
    pub stall_timeout: Option<Duration>,
}

impl RateLimits {
    pub fn from_budget(budget: &BudgetConfig) -> Self {
        Self {
            max_concurrent: budget.max_concurrent_ai_requests,
            max_per_window: budget.max_requests_per_window,
            window: Duration::from_millis(budget.rate_window_ms),
            max_workflows: budget
                .enable_parallel_limit
                .then_some(budget.max_concurrent_workflows),
            stall_timeout: budget
                .enable_stall_guard
                .then(|| Duration::from_secs(budget.stall_timeout_secs)),
        }
    }
}

impl Default for RateLimits {
    fn default() -> Self {
        Self::from_budget(&BudgetConfig::default())
    }
}

struct Inner {
    limits: RateLimits,
    calls: Arc<Semaphore>,
    workflows: Option<Arc<Semaphore>>,
    window: Mutex<VecDeque<Instant>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    granted: AtomicU64,
}

/// Cloneable handle to a shared call reservoir.
#[derive(Clone)]
pub struct RateController {
    inner: Arc<Inner>,
}

impl RateController {
    pub fn new(limits: RateLimits) -> Self {
        let calls = Arc::new(Semaphore::new(limits.max_concurrent.max(1)));
        let workflows = limits
            .max_workflows
            .map(|n| Arc::new(Semaphore::new(n.max(1))));
        Self {
            inner: Arc::new(Inner {
                calls,
                workflows,
                window: Mutex::new(VecDeque::new()),
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                granted: AtomicU64::new(0),
                limits,
            }),
        }
    }

    pub fn from_budget(budget: &BudgetConfig) -> Self {
        Self::new(RateLimits::from_budget(budget))
    }

    pub fn limits(&self) -> &RateLimits {
        &self.inner.limits
    }

    /// Wait for a call slot. The permit releases the slot on drop, so every
    /// exit path of the caller gives it back.
    pub async fn acquire(&self) -> Result<RatePermit> {
        let permit = self
            .inner
            .calls
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| EvoflowError::RateControllerClosed)?;
        self.reserve_window_slot().await;

        let now = self.inner.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.peak.fetch_max(now, Ordering::SeqCst);
        self.inner.granted.fetch_add(1, Ordering::Relaxed);

        Ok(RatePermit {
            _permit: permit,
            inner: self.inner.clone(),
        })
    }

    /// Give a permit back explicitly. Equivalent to dropping it.
    pub fn release(&self, permit: RatePermit) {
        drop(permit);
    }

    /// Run one model call. Each attempt holds its own permit; backoff
    /// between attempts runs with the slot given back.
    pub async fn complete(
        &self,
        model: &dyn ModelClient,
        request: CompletionRequest,
    ) -> Result<CompletionResponse> {
        let mut attempt = 0;
        loop {
            let permit = self.acquire().await?;
            let response = model.attempt(request.clone()).await;
            self.release(permit);

            let error = match response {
                Ok(response) => return Ok(response),
                Err(e) => e,
            };
            match model.retry_after(&error, attempt) {
                Some(backoff) => {
                    warn!(
                        attempt = attempt + 1,
                        backoff_ms = backoff.as_millis() as u64,
                        model = %request.model,
                        error = %error,
                        "Retrying model request"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                None => return Err(error),
            }
        }
    }

    /// Wait for a workflow slot when the parallel-limit guard is enabled.
    pub async fn acquire_workflow(&self) -> Result<WorkflowPermit> {
        match &self.inner.workflows {
            Some(sem) => {
                let permit = sem
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| EvoflowError::RateControllerClosed)?;
                Ok(WorkflowPermit(Some(permit)))
            }
            None => Ok(WorkflowPermit(None)),
        }
    }

    /// Whether a call slot is free right now.
    pub fn has_capacity(&self) -> bool {
        self.inner.calls.available_permits() > 0
    }

    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    pub fn peak_in_flight(&self) -> usize {
        self.inner.peak.load(Ordering::SeqCst)
    }

    pub fn total_granted(&self) -> u64 {
        self.inner.granted.load(Ordering::Relaxed)
    }

    /// A stall guard for one run, if the guard is enabled.
    pub fn stall_guard(&self) -> Option<StallGuard> {
        self.inner.limits.stall_timeout.map(StallGuard::new)
    }

    async fn reserve_window_slot(&self) {
        let limits = &self.inner.limits;
        if limits.max_per_window == 0 || limits.window.is_zero() {
            return;
        }
        loop {
            let wait = {
                let mut window = self.inner.window.lock().await;
                let now = Instant::now();
                while window
                    .front()
                    .is_some_and(|t| now.duration_since(*t) >= limits.window)
                {
                    window.pop_front();
                }
                if window.len() < limits.max_per_window {
                    window.push_back(now);
                    return;
                }
                window
                    .front()
                    .map(|t| limits.window.saturating_sub(now.duration_since(*t)))
                    .unwrap_or(limits.window)
            };
            debug!(wait_ms = wait.as_millis() as u64, "Rate window full, waiting");
            tokio::time::sleep(wait).await;
        }
    }
}

/// A granted call slot.
pub struct RatePermit {
    _permit: OwnedSemaphorePermit,
    inner: Arc<Inner>,
}

impl Drop for RatePermit {
    fn drop(&mut self) {
        self.inner.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A granted workflow slot; empty when the parallel-limit guard is off.
pub struct WorkflowPermit(Option<OwnedSemaphorePermit>);

impl WorkflowPermit {
    pub fn is_limited(&self) -> bool {
        self.0.is_some()
    }
}

/// Liveness check for one run: fires when nothing has completed for
/// `timeout` while the controller still had free capacity.
#[derive(Debug, Clone)]
pub struct StallGuard {
    timeout: Duration,
    last_progress: Instant,
}

impl StallGuard {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            last_progress: Instant::now(),
        }
    }

    /// Record progress.
    pub fn touch(&mut self) {
        self.last_progress = Instant::now();
    }

    pub fn remaining(&self) -> Duration {
        self.timeout.saturating_sub(self.last_progress.elapsed())
    }

    pub fn deadline(&self) -> Instant {
        self.last_progress + self.timeout
    }

    /// Evaluate the guard after its deadline passes. Saturation by other
    /// callers is not a stall, so the guard re-arms instead of firing.
    pub fn check(&mut self, rate: &RateController) -> Result<()> {
        let idle = self.last_progress.elapsed();
        if idle < self.timeout {
            return Ok(());
        }
        if rate.has_capacity() {
            return Err(EvoflowError::Stalled {
                idle_secs: idle.as_secs(),
            });
        }
        self.touch();
        Ok(())
    }
}
