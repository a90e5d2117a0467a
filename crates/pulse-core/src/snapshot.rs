use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One set of telemetry readings taken on a single sampler tick.
///
/// The default value is the zero snapshot published before the first tick:
/// every metric is zero and the timestamp is the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Snapshot {
    /// Global CPU usage as a percentage (0.0–100.0).
    pub cpu_load: f64,
    /// Used physical memory as a percentage (0.0–100.0).
    pub mem_load: f64,
    /// Tasks alive on the serving runtime.
    ///
    /// Serialized as `goroutines`, the name existing dashboards read.
    #[serde(rename = "goroutines")]
    pub active_tasks: u64,
    /// When the snapshot was assembled.
    pub timestamp: DateTime<Utc>,
}

impl Snapshot {
    /// Encode as the JSON text of one data frame.
    pub fn to_frame(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Shared cell holding the latest [`Snapshot`].
///
/// Clones are cheap handles to the same cell. Reads never wait on the
/// writer: `publish` swaps in a new `Arc` and readers keep whatever value
/// they already loaded.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    current: Arc<ArcSwap<Snapshot>>,
}

impl Default for SnapshotStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotStore {
    /// Create a store holding the zero snapshot.
    pub fn new() -> Self {
        Self {
            current: Arc::new(ArcSwap::from_pointee(Snapshot::default())),
        }
    }

    /// Replace the current snapshot.
    ///
    /// Timestamps never move backwards: a snapshot older than the current
    /// one is stored with the current timestamp.
    pub fn publish(&self, snapshot: Snapshot) {
        self.current.rcu(|current| {
            let mut next = snapshot;
            if next.timestamp < current.timestamp {
                next.timestamp = current.timestamp;
            }
            Arc::new(next)
        });
    }

    /// Return the latest published snapshot.
    pub fn read(&self) -> Arc<Snapshot> {
        self.current.load_full()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use std::thread;

    fn snapshot_at(timestamp: DateTime<Utc>, cpu: f64) -> Snapshot {
        Snapshot {
            cpu_load: cpu,
            mem_load: 40.0,
            active_tasks: 3,
            timestamp,
        }
    }

    #[test]
    fn new_store_holds_zero_snapshot() {
        let store = SnapshotStore::new();
        let snap = store.read();
        assert_eq!(snap.cpu_load, 0.0);
        assert_eq!(snap.mem_load, 0.0);
        assert_eq!(snap.active_tasks, 0);
        assert_eq!(snap.timestamp, DateTime::<Utc>::UNIX_EPOCH);
    }

    #[test]
    fn publish_replaces_current_value() {
        let store = SnapshotStore::new();
        let snap = snapshot_at(Utc::now(), 12.5);
        store.publish(snap);
        assert_eq!(*store.read(), snap);
    }

    #[test]
    fn clones_share_the_same_cell() {
        let store = SnapshotStore::new();
        let reader = store.clone();
        let snap = snapshot_at(Utc::now(), 99.0);
        store.publish(snap);
        assert_eq!(*reader.read(), snap);
    }

    #[test]
    fn older_timestamp_is_clamped() {
        let store = SnapshotStore::new();
        let now = Utc::now();
        store.publish(snapshot_at(now, 10.0));
        store.publish(snapshot_at(now - TimeDelta::seconds(5), 20.0));

        let snap = store.read();
        assert_eq!(snap.cpu_load, 20.0);
        assert_eq!(snap.timestamp, now);
    }

    #[test]
    fn earlier_reads_keep_their_value() {
        let store = SnapshotStore::new();
        let first = snapshot_at(Utc::now(), 1.0);
        store.publish(first);
        let held = store.read();
        store.publish(snapshot_at(Utc::now(), 2.0));
        assert_eq!(*held, first);
        assert_eq!(store.read().cpu_load, 2.0);
    }

    #[test]
    fn concurrent_readers_see_whole_monotonic_snapshots() {
        let store = SnapshotStore::new();
        let base = Utc::now();

        let readers: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                thread::spawn(move || {
                    let mut last = DateTime::<Utc>::UNIX_EPOCH;
                    for _ in 0..2_000 {
                        let snap = store.read();
                        assert!(snap.timestamp >= last, "timestamp went backwards");
                        // Writer keeps cpu and mem in lockstep.
                        assert_eq!(snap.cpu_load, snap.mem_load);
                        assert!((0.0..=100.0).contains(&snap.cpu_load));
                        last = snap.timestamp;
                    }
                })
            })
            .collect();

        for i in 0..2_000u32 {
            let load = f64::from(i % 101);
            store.publish(Snapshot {
                cpu_load: load,
                mem_load: load,
                active_tasks: u64::from(i),
                timestamp: base + TimeDelta::milliseconds(i64::from(i)),
            });
        }

        for reader in readers {
            reader.join().unwrap();
        }
    }

    #[test]
    fn frame_uses_wire_field_names() {
        let snap = snapshot_at(Utc::now(), 33.0);
        let frame = snap.to_frame().unwrap();
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        let obj = value.as_object().unwrap();
        assert_eq!(obj.len(), 4);
        for key in ["cpu_load", "mem_load", "goroutines", "timestamp"] {
            assert!(obj.contains_key(key), "missing {key}");
        }
        assert_eq!(obj["goroutines"], 3);
    }

    #[test]
    fn frame_decodes_to_published_fields() {
        let snap = Snapshot {
            cpu_load: 17.375,
            mem_load: 63.1,
            active_tasks: 42,
            timestamp: Utc::now(),
        };
        let decoded: Snapshot = serde_json::from_str(&snap.to_frame().unwrap()).unwrap();
        assert!((decoded.cpu_load - snap.cpu_load).abs() < f64::EPSILON);
        assert!((decoded.mem_load - snap.mem_load).abs() < f64::EPSILON);
        assert_eq!(decoded.active_tasks, snap.active_tasks);
        assert_eq!(decoded.timestamp, snap.timestamp);
    }

    #[test]
    fn timestamp_is_rfc3339() {
        let frame = Snapshot::default().to_frame().unwrap();
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        let raw = value["timestamp"].as_str().unwrap();
        assert!(DateTime::parse_from_rfc3339(raw).is_ok(), "not rfc3339: {raw}");
    }
}
