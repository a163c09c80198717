//! Continuous metrics sampling and test-finish lifecycle hooks.
//!
//! The sampler runs one fixed-interval timer per page context and must be
//! explicitly stopped on test completion; leaving it running leaks the
//! timer task. [`FinalizerSet`] is the companion seam: hosts whose runner
//! exposes a teardown hook register the stop there, hosts without one wrap
//! the test body and drain the set in a `finally`-equivalent block.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::driver::PerformanceSnapshot;

/// Fixed-interval sampler collecting [`PerformanceSnapshot`]s.
///
/// The sampling closure adapts whatever driver the host uses; it is called
/// on the sampler task, so it must be cheap and non-blocking.
#[derive(Debug)]
pub struct MetricsSampler {
    handle: JoinHandle<()>,
    samples: Arc<Mutex<Vec<PerformanceSnapshot>>>,
}

impl MetricsSampler {
    /// Start sampling every `interval` until [`stop`](Self::stop).
    pub fn start<F>(interval: Duration, mut sample: F) -> Self
    where
        F: FnMut() -> Option<PerformanceSnapshot> + Send + 'static,
    {
        let samples = Arc::new(Mutex::new(Vec::new()));
        let sink = samples.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately; skip it so samples are
            // spaced by the interval from the start call.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Some(snapshot) = sample() {
                    sink.lock().unwrap().push(snapshot);
                }
            }
        });
        Self { handle, samples }
    }

    /// Number of samples collected so far.
    pub fn len(&self) -> usize {
        self.samples.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop the timer and return the collected samples.
    ///
    /// Must be called on test completion; an unstopped sampler keeps its
    /// task alive until the worker process exits.
    pub fn stop(self) -> Vec<PerformanceSnapshot> {
        self.handle.abort();
        let samples = self.samples.lock().unwrap().drain(..).collect();
        debug!("metrics sampler stopped");
        samples
    }
}

impl Drop for MetricsSampler {
    fn drop(&mut self) {
        // Last-resort cleanup so a forgotten stop() cannot leak the task.
        self.handle.abort();
    }
}

type Finalizer = Box<dyn FnOnce() + Send>;

/// Registered cleanups run exactly once at test teardown.
///
/// Mirrors a runner's "on test finished" hook for hosts that have one, and
/// substitutes for it where none exists. Draining is idempotent; finalizers
/// registered after the drain are run on the next drain.
#[derive(Default)]
pub struct FinalizerSet {
    pending: Mutex<Vec<Finalizer>>,
}

impl FinalizerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a cleanup to run at teardown.
    pub fn register<F: FnOnce() + Send + 'static>(&self, finalizer: F) {
        self.pending.lock().unwrap().push(Box::new(finalizer));
    }

    /// Number of pending finalizers.
    pub fn pending(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// Run and discard all pending finalizers, in registration order.
    pub fn drain(&self) {
        let pending: Vec<Finalizer> = {
            let mut guard = self.pending.lock().unwrap();
            guard.drain(..).collect()
        };
        for finalizer in pending {
            finalizer();
        }
    }
}

impl Drop for FinalizerSet {
    fn drop(&mut self) {
        let pending = self.pending.get_mut().map(std::mem::take).unwrap_or_default();
        if !pending.is_empty() {
            warn!(
                count = pending.len(),
                "finalizers still pending at drop, running them now"
            );
            for finalizer in pending {
                finalizer();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn sampler_collects_until_stopped() {
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();
        let sampler = MetricsSampler::start(Duration::from_millis(5), move || {
            counter_clone.fetch_add(1, Ordering::SeqCst);
            Some(PerformanceSnapshot {
                dom_node_count: Some(42),
                ..Default::default()
            })
        });

        tokio::time::sleep(Duration::from_millis(40)).await;
        let samples = sampler.stop();
        assert!(!samples.is_empty());
        assert_eq!(samples[0].dom_node_count, Some(42));

        // No further sampling after stop.
        let after = counter.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(counter.load(Ordering::SeqCst), after);
    }

    #[tokio::test]
    async fn sampler_skips_empty_readings() {
        let sampler = MetricsSampler::start(Duration::from_millis(5), || None);
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert!(sampler.stop().is_empty());
    }

    #[test]
    fn finalizers_run_in_registration_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let set = FinalizerSet::new();
        for i in 0..3 {
            let order = order.clone();
            set.register(move || order.lock().unwrap().push(i));
        }

        assert_eq!(set.pending(), 3);
        set.drain();
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
        assert_eq!(set.pending(), 0);

        // Draining again is a no-op.
        set.drain();
        assert_eq!(order.lock().unwrap().len(), 3);
    }

    #[test]
    fn drop_runs_pending_finalizers() {
        let ran = Arc::new(AtomicUsize::new(0));
        {
            let set = FinalizerSet::new();
            let ran = ran.clone();
            set.register(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
