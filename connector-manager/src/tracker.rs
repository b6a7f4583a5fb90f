//! Per-instance call accounting.
//!
//! Every public data call runs inside [`InstanceMetrics::track`]. The guard
//! records on drop, so a call that is cancelled mid-flight still counts (as
//! an error).

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use conduit::Result;

use crate::types::InstanceStats;

#[derive(Debug, Default)]
pub struct InstanceMetrics {
    requests: AtomicU64,
    errors: AtomicU64,
    total_duration_ms: AtomicU64,
}

impl InstanceMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `fut`, recording duration and outcome on every exit path.
    pub async fn track<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let mut guard = CallGuard {
            metrics: self,
            started: Instant::now(),
            succeeded: false,
        };
        let result = fut.await;
        guard.succeeded = result.is_ok();
        result
    }

    pub fn snapshot(&self) -> InstanceStats {
        let request_count = self.requests.load(Ordering::Relaxed);
        let total_duration_ms = self.total_duration_ms.load(Ordering::Relaxed);
        InstanceStats {
            request_count,
            error_count: self.errors.load(Ordering::Relaxed),
            total_duration_ms,
            avg_duration_ms: if request_count == 0 {
                0.0
            } else {
                total_duration_ms as f64 / request_count as f64
            },
        }
    }

    fn record(&self, duration_ms: u64, succeeded: bool) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.total_duration_ms.fetch_add(duration_ms, Ordering::Relaxed);
        if !succeeded {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
    }
}

struct CallGuard<'a> {
    metrics: &'a InstanceMetrics,
    started: Instant,
    succeeded: bool,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        let elapsed = self.started.elapsed().as_millis() as u64;
        self.metrics.record(elapsed, self.succeeded);
    }
}
