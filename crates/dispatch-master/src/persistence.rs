//! Durable scheduler state, grounded on the sled+bincode shape used by
//! `hootenanny`'s event journal: one tree holding a single authoritative
//! snapshot, a second append-only tree as a best-effort diagnostic trail.
//!
//! The snapshot is what restart actually restores from; the journal is
//! never replayed, only inspected. Sled's blocking API is called directly
//! from async context here rather than wrapped in `spawn_blocking` — both
//! trees are written on intervals measured in seconds, so the occasional
//! blocked scheduler tick is an accepted tradeoff rather than a bug.

use std::collections::VecDeque;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

const SNAPSHOT_KEY: &[u8] = b"latest";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerSnapshot {
    pub pending_queue: VecDeque<i64>,
    /// (node_id, task_id) pairs for tasks in flight at snapshot time.
    pub assigned: Vec<(i64, i64)>,
    /// (task_id, value) pairs already delivered via `finishCompute`.
    pub results: Vec<(i64, i64)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum JournalEvent {
    NodeJoined { node_id: i64, address: String },
    TaskAssigned { node_id: i64, task_id: i64 },
    TaskReclaimed { node_id: i64, task_id: i64 },
    TaskDone { task_id: i64, time_usage_ms: i64 },
}

pub struct Persistence {
    db: sled::Db,
    snapshots: sled::Tree,
    journal: sled::Tree,
}

impl Persistence {
    pub fn open(dir: &Path) -> Result<Self> {
        let db = sled::open(dir).with_context(|| format!("failed to open sled database at {}", dir.display()))?;
        let snapshots = db.open_tree("snapshots").context("failed to open snapshots tree")?;
        let journal = db.open_tree("journal").context("failed to open journal tree")?;
        Ok(Self { db, snapshots, journal })
    }

    pub fn save_snapshot(&self, snapshot: &SchedulerSnapshot) -> Result<()> {
        let bytes = bincode::serialize(snapshot).context("failed to serialize snapshot")?;
        self.snapshots.insert(SNAPSHOT_KEY, bytes).context("failed to write snapshot")?;
        self.snapshots.flush().context("failed to flush snapshot tree")?;
        Ok(())
    }

    pub fn load_snapshot(&self) -> Result<Option<SchedulerSnapshot>> {
        match self.snapshots.get(SNAPSHOT_KEY).context("failed to read snapshot")? {
            Some(bytes) => {
                let snapshot = bincode::deserialize(&bytes).context("failed to deserialize snapshot")?;
                Ok(Some(snapshot))
            }
            None => Ok(None),
        }
    }

    pub fn append_journal(&mut self, event: &JournalEvent) -> Result<u64> {
        let id = self.db.generate_id().context("failed to generate journal id")?;
        let bytes = bincode::serialize(event).context("failed to serialize journal event")?;
        self.journal.insert(id.to_be_bytes(), bytes).context("failed to insert journal entry")?;
        Ok(id)
    }

    pub fn read_journal(&self) -> Result<Vec<JournalEvent>> {
        let mut events = Vec::new();
        for entry in self.journal.iter() {
            let (_key, value) = entry.context("failed to read journal entry")?;
            events.push(bincode::deserialize(&value).context("failed to deserialize journal entry")?);
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = Persistence::open(dir.path()).unwrap();
        assert!(persistence.load_snapshot().unwrap().is_none());

        let snapshot = SchedulerSnapshot {
            pending_queue: VecDeque::from(vec![1, 2, 3]),
            assigned: vec![(10, 4)],
            results: vec![(0, 0), (1, 1)],
        };
        persistence.save_snapshot(&snapshot).unwrap();

        let loaded = persistence.load_snapshot().unwrap().unwrap();
        assert_eq!(loaded.pending_queue, snapshot.pending_queue);
        assert_eq!(loaded.assigned, snapshot.assigned);
        assert_eq!(loaded.results, snapshot.results);
    }

    #[test]
    fn journal_records_events_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut persistence = Persistence::open(dir.path()).unwrap();

        persistence.append_journal(&JournalEvent::NodeJoined { node_id: 1, address: "tcp://127.0.0.1:3320".into() }).unwrap();
        persistence.append_journal(&JournalEvent::TaskAssigned { node_id: 1, task_id: 7 }).unwrap();
        persistence.append_journal(&JournalEvent::TaskDone { task_id: 7, time_usage_ms: 42 }).unwrap();

        let events = persistence.read_journal().unwrap();
        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], JournalEvent::NodeJoined { node_id: 1, .. }));
        assert!(matches!(events[2], JournalEvent::TaskDone { task_id: 7, time_usage_ms: 42 }));
    }

    #[test]
    fn second_snapshot_overwrites_first() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = Persistence::open(dir.path()).unwrap();

        persistence.save_snapshot(&SchedulerSnapshot { pending_queue: VecDeque::from(vec![1]), ..Default::default() }).unwrap();
        persistence.save_snapshot(&SchedulerSnapshot { pending_queue: VecDeque::from(vec![2, 3]), ..Default::default() }).unwrap();

        let loaded = persistence.load_snapshot().unwrap().unwrap();
        assert_eq!(loaded.pending_queue, VecDeque::from(vec![2, 3]));
    }
}
