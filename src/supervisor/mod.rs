//! Supervised worker pools.
//!
//! A pool owns a fixed number of worker slots. Each slot runs one worker at a
//! time; when a worker returns an error or panics the slot logs the failure,
//! waits out a backoff delay and spawns a replacement. Slots stop once the
//! pool's cancellation token fires.

mod backoff;

pub use backoff::{BackoffConfig, ExponentialBackoff};

use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::metrics::WorkerMetrics;

/// Result returned by a single worker run
pub type WorkerResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// How failed workers are replaced
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    pub backoff: BackoffConfig,
    /// A worker that ran at least this long resets its slot's backoff
    pub stable_after: Duration,
}

impl RestartPolicy {
    /// Restart after `delay`, doubling on repeated failures up to 30x the delay.
    pub fn with_delay(delay: Duration) -> Self {
        let initial_delay_ms = delay.as_millis() as u64;
        Self {
            backoff: BackoffConfig {
                initial_delay_ms,
                max_delay_ms: initial_delay_ms.saturating_mul(30),
                ..BackoffConfig::default()
            },
            stable_after: Duration::from_secs(60),
        }
    }
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self::with_delay(Duration::from_secs(10))
    }
}

#[derive(Default)]
struct PoolCounters {
    live: AtomicUsize,
    restarts: AtomicU64,
}

/// A running pool of supervised workers
pub struct WorkerPool {
    name: &'static str,
    size: usize,
    counters: Arc<PoolCounters>,
    slots: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `size` workers built by `factory(slot)`.
    pub fn spawn<F, Fut>(
        name: &'static str,
        size: usize,
        policy: RestartPolicy,
        cancel: CancellationToken,
        factory: F,
    ) -> Self
    where
        F: Fn(usize) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = WorkerResult> + Send + 'static,
    {
        let factory = Arc::new(factory);
        let counters = Arc::new(PoolCounters::default());

        let slots = (0..size)
            .map(|slot| {
                tokio::spawn(supervise_slot(
                    name,
                    slot,
                    policy.clone(),
                    cancel.clone(),
                    factory.clone(),
                    counters.clone(),
                ))
            })
            .collect();

        tracing::info!(pool = name, size = size, "Worker pool started");

        Self {
            name,
            size,
            counters,
            slots,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Workers currently running (slots waiting out a backoff are not counted)
    pub fn live_workers(&self) -> usize {
        self.counters.live.load(Ordering::Acquire)
    }

    /// Total replacements spawned since the pool started
    pub fn restarts(&self) -> u64 {
        self.counters.restarts.load(Ordering::Acquire)
    }

    /// Wait for every slot to stop (after cancellation).
    pub async fn join(self) {
        for slot in self.slots {
            let _ = slot.await;
        }
    }
}

async fn supervise_slot<F, Fut>(
    name: &'static str,
    slot: usize,
    policy: RestartPolicy,
    cancel: CancellationToken,
    factory: Arc<F>,
    counters: Arc<PoolCounters>,
) where
    F: Fn(usize) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = WorkerResult> + Send + 'static,
{
    let mut backoff = ExponentialBackoff::with_config(policy.backoff.clone());

    loop {
        let started = Instant::now();
        counters.live.fetch_add(1, Ordering::AcqRel);
        let outcome = tokio::spawn(factory(slot)).await;
        counters.live.fetch_sub(1, Ordering::AcqRel);

        if cancel.is_cancelled() {
            return;
        }

        match outcome {
            Ok(Ok(())) => {
                tracing::warn!(pool = name, worker = slot, "Worker exited before shutdown");
            }
            Ok(Err(e)) => {
                tracing::error!(pool = name, worker = slot, error = %e, "Worker failed");
            }
            Err(e) if e.is_panic() => {
                let message = panic_message(e.into_panic());
                tracing::error!(pool = name, worker = slot, panic = %message, "Worker panicked");
            }
            Err(_) => return,
        }

        if started.elapsed() >= policy.stable_after {
            backoff.reset();
        }
        let delay = backoff.next_delay();

        tracing::warn!(
            pool = name,
            worker = slot,
            delay_ms = delay.as_millis() as u64,
            "Restarting worker after backoff"
        );

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }

        counters.restarts.fetch_add(1, Ordering::AcqRel);
        WorkerMetrics::record_restart(name);
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
