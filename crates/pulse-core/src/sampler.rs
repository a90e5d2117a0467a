//! Background sampler that refreshes the [`SnapshotStore`] on a fixed period.
//!
//! Each tick queries the CPU, memory and task sources independently, so the
//! fields of one snapshot may come from slightly different instants. A failed
//! source keeps its last good value; the loop itself never stops on a
//! metric failure.

use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::snapshot::{Snapshot, SnapshotStore};
use crate::source::{ActiveTaskSource, CpuLoadSource, MemoryLoadSource, MetricSource};

/// Log a persistent failure once per this many consecutive failed ticks.
const FAILURE_LOG_EVERY: u64 = 60;

pub type LoadSource = Box<dyn MetricSource<Value = f64>>;
pub type CountSource = Box<dyn MetricSource<Value = u64>>;

/// Consecutive-failure bookkeeping for one field.
#[derive(Debug, Default)]
struct FieldHealth {
    consecutive_failures: u64,
}

impl FieldHealth {
    /// Resolve a sample against the retained value, logging transitions.
    fn settle<T: Copy>(
        &mut self,
        name: &'static str,
        result: Result<T, crate::source::MetricSourceError>,
        retained: T,
    ) -> T {
        match result {
            Ok(value) => {
                if self.consecutive_failures > 0 {
                    tracing::info!(
                        source = name,
                        failures = self.consecutive_failures,
                        "metric source recovered"
                    );
                    self.consecutive_failures = 0;
                }
                value
            }
            Err(err) => {
                self.consecutive_failures += 1;
                if self.consecutive_failures == 1
                    || self.consecutive_failures % FAILURE_LOG_EVERY == 0
                {
                    tracing::warn!(
                        source = name,
                        failures = self.consecutive_failures,
                        error = %err,
                        "metric source failed, keeping last value"
                    );
                }
                retained
            }
        }
    }
}

/// Periodic telemetry sampler.
pub struct MetricsSampler {
    store: SnapshotStore,
    period: Duration,
    cpu: LoadSource,
    memory: LoadSource,
    tasks: CountSource,
    cpu_health: FieldHealth,
    memory_health: FieldHealth,
    tasks_health: FieldHealth,
}

impl MetricsSampler {
    /// Create a sampler reading the host and the current tokio runtime.
    pub fn new(store: SnapshotStore, period: Duration) -> Self {
        Self::with_sources(
            store,
            period,
            Box::new(CpuLoadSource::new()),
            Box::new(MemoryLoadSource::new()),
            Box::new(ActiveTaskSource::new()),
        )
    }

    /// Create a sampler over explicit sources.
    pub fn with_sources(
        store: SnapshotStore,
        period: Duration,
        cpu: LoadSource,
        memory: LoadSource,
        tasks: CountSource,
    ) -> Self {
        Self {
            store,
            period,
            cpu,
            memory,
            tasks,
            cpu_health: FieldHealth::default(),
            memory_health: FieldHealth::default(),
            tasks_health: FieldHealth::default(),
        }
    }

    /// Sample every source once and publish the assembled snapshot.
    pub fn refresh(&mut self) -> Snapshot {
        let last = *self.store.read();

        let cpu_load = self
            .cpu_health
            .settle(self.cpu.name(), self.cpu.sample(), last.cpu_load);
        let mem_load = self
            .memory_health
            .settle(self.memory.name(), self.memory.sample(), last.mem_load);
        let active_tasks = self
            .tasks_health
            .settle(self.tasks.name(), self.tasks.sample(), last.active_tasks);

        let snapshot = Snapshot {
            cpu_load,
            mem_load,
            active_tasks,
            timestamp: Utc::now(),
        };
        self.store.publish(snapshot);
        tracing::trace!(cpu_load, mem_load, active_tasks, "snapshot published");
        snapshot
    }

    /// Run the sampler on the current runtime until `shutdown` is cancelled.
    ///
    /// The first refresh happens immediately.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    async fn run(mut self, shutdown: CancellationToken) {
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(period = ?self.period, "metrics sampler started");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.refresh();
                }
            }
        }

        tracing::info!("metrics sampler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MetricSourceError;
    use std::collections::{BTreeSet, VecDeque};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    /// Replays scripted results, then repeats `fallback`.
    struct Scripted<T> {
        script: VecDeque<Result<T, MetricSourceError>>,
        fallback: T,
    }

    impl<T> Scripted<T> {
        fn new(script: Vec<Result<T, MetricSourceError>>, fallback: T) -> Self {
            Self {
                script: script.into(),
                fallback,
            }
        }
    }

    impl<T: Copy + Send> MetricSource for Scripted<T> {
        type Value = T;

        fn name(&self) -> &'static str {
            "scripted"
        }

        fn sample(&mut self) -> Result<T, MetricSourceError> {
            self.script.pop_front().unwrap_or(Ok(self.fallback))
        }
    }

    struct Counting(Arc<AtomicU64>);

    impl MetricSource for Counting {
        type Value = u64;

        fn name(&self) -> &'static str {
            "counting"
        }

        fn sample(&mut self) -> Result<u64, MetricSourceError> {
            Ok(self.0.fetch_add(1, Ordering::SeqCst) + 1)
        }
    }

    fn failure() -> MetricSourceError {
        MetricSourceError::Unavailable {
            source_name: "scripted",
            reason: "forced".into(),
        }
    }

    fn sampler(
        store: &SnapshotStore,
        period: Duration,
        cpu: Vec<Result<f64, MetricSourceError>>,
        memory: Vec<Result<f64, MetricSourceError>>,
    ) -> MetricsSampler {
        MetricsSampler::with_sources(
            store.clone(),
            period,
            Box::new(Scripted::new(cpu, 10.0)),
            Box::new(Scripted::new(memory, 50.0)),
            Box::new(Scripted::new(Vec::new(), 4)),
        )
    }

    #[test]
    fn refresh_publishes_all_fields() {
        let store = SnapshotStore::new();
        let mut s = sampler(&store, Duration::from_secs(1), vec![Ok(12.0)], vec![Ok(34.0)]);

        let snap = s.refresh();
        assert_eq!(*store.read(), snap);
        assert_eq!(snap.cpu_load, 12.0);
        assert_eq!(snap.mem_load, 34.0);
        assert_eq!(snap.active_tasks, 4);
        assert!(snap.timestamp > chrono::DateTime::<Utc>::UNIX_EPOCH);
    }

    #[test]
    fn failed_field_keeps_previous_value() {
        let store = SnapshotStore::new();
        let mut s = sampler(
            &store,
            Duration::from_secs(1),
            vec![Ok(20.0), Ok(21.0), Ok(22.0)],
            vec![Ok(61.5), Err(failure()), Ok(63.0)],
        );

        let first = s.refresh();
        assert_eq!(first.mem_load, 61.5);

        let second = s.refresh();
        assert_eq!(second.mem_load, 61.5, "memory should be retained");
        assert_eq!(second.cpu_load, 21.0, "other fields still refresh");
        assert!(second.timestamp >= first.timestamp);

        let third = s.refresh();
        assert_eq!(third.mem_load, 63.0);
    }

    #[test]
    fn failure_before_first_success_reports_zero() {
        let store = SnapshotStore::new();
        let mut s = sampler(
            &store,
            Duration::from_secs(1),
            vec![Err(failure())],
            vec![Ok(5.0)],
        );

        let snap = s.refresh();
        assert_eq!(snap.cpu_load, 0.0);
        assert_eq!(snap.mem_load, 5.0);
    }

    #[test]
    fn health_counts_and_resets_failures() {
        let mut health = FieldHealth::default();
        assert_eq!(health.settle("x", Err::<u64, _>(failure()), 7), 7);
        assert_eq!(health.settle("x", Err::<u64, _>(failure()), 7), 7);
        assert_eq!(health.consecutive_failures, 2);
        assert_eq!(health.settle("x", Ok(9u64), 7), 9);
        assert_eq!(health.consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn publishes_distinct_snapshots_each_period() {
        let store = SnapshotStore::new();
        let shutdown = CancellationToken::new();
        let handle = sampler(&store, Duration::from_secs(1), Vec::new(), Vec::new())
            .spawn(shutdown.clone());

        let mut seen = BTreeSet::new();
        for _ in 0..14 {
            tokio::time::sleep(Duration::from_millis(250)).await;
            seen.insert(store.read().timestamp);
        }

        // 3.5s of runtime: ticks at 0s, 1s, 2s and 3s.
        assert!(seen.len() >= 3, "only {} distinct snapshots", seen.len());

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn keeps_ticking_after_metric_failure() {
        let store = SnapshotStore::new();
        let ticks = Arc::new(AtomicU64::new(0));
        let shutdown = CancellationToken::new();
        let handle = MetricsSampler::with_sources(
            store.clone(),
            Duration::from_secs(1),
            Box::new(Scripted::new(Vec::new(), 10.0)),
            Box::new(Scripted::new(vec![Ok(70.0), Err(failure())], 71.0)),
            Box::new(Counting(ticks.clone())),
        )
        .spawn(shutdown.clone());

        tokio::time::sleep(Duration::from_millis(1500)).await;
        let after_failure = *store.read();
        assert_eq!(after_failure.mem_load, 70.0);
        assert_eq!(after_failure.active_tasks, 2);

        tokio::time::sleep(Duration::from_secs(2)).await;
        let later = *store.read();
        assert_eq!(later.mem_load, 71.0);
        assert!(ticks.load(Ordering::SeqCst) >= 4);

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_publishing() {
        let store = SnapshotStore::new();
        let ticks = Arc::new(AtomicU64::new(0));
        let shutdown = CancellationToken::new();
        let handle = MetricsSampler::with_sources(
            store.clone(),
            Duration::from_secs(1),
            Box::new(Scripted::new(Vec::new(), 1.0)),
            Box::new(Scripted::new(Vec::new(), 1.0)),
            Box::new(Counting(ticks.clone())),
        )
        .spawn(shutdown.clone());

        tokio::time::sleep(Duration::from_millis(2500)).await;
        shutdown.cancel();
        handle.await.unwrap();

        let stopped_at = ticks.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), stopped_at);
    }
}
