//! Per-consumer delivery cursors
//!
//! Each consumer owns one JSON record in the offsets directory:
//!
//! ```text
//! offsets/
//!   team%2Fworker.json
//!   core.json
//! ```
//!
//! The record holds the timestamp of the newest delivered message plus the
//! filenames already delivered within that exact second, so two messages
//! written in the same second are never conflated.

use super::address::AgentId;
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

const OFFSET_EXTENSION: &str = "json";

/// Durable cursor for one consumer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OffsetRecord {
    pub agent_id: AgentId,
    pub last_processed_timestamp: DateTime<Utc>,
    /// Filenames delivered whose timestamp equals `last_processed_timestamp`
    #[serde(default)]
    pub delivered_at_timestamp: BTreeSet<String>,
    pub updated_at: DateTime<Utc>,
}

impl OffsetRecord {
    pub fn new(agent_id: AgentId, timestamp: DateTime<Utc>) -> Self {
        Self {
            agent_id,
            last_processed_timestamp: timestamp,
            delivered_at_timestamp: BTreeSet::new(),
            updated_at: Utc::now(),
        }
    }

    /// Whether a message still needs delivery under this cursor
    pub fn is_pending(&self, timestamp: DateTime<Utc>, filename: &str) -> bool {
        timestamp > self.last_processed_timestamp
            || (timestamp == self.last_processed_timestamp
                && !self.delivered_at_timestamp.contains(filename))
    }

    /// Move the cursor past a delivered message
    ///
    /// Older timestamps leave the cursor where it is.
    pub fn advance(&mut self, timestamp: DateTime<Utc>, filename: &str) {
        if timestamp > self.last_processed_timestamp {
            self.last_processed_timestamp = timestamp;
            self.delivered_at_timestamp.clear();
        } else if timestamp < self.last_processed_timestamp {
            return;
        }
        self.delivered_at_timestamp.insert(filename.to_string());
        self.updated_at = Utc::now();
    }
}

/// Reads and writes offset records in one directory
#[derive(Debug, Clone)]
pub struct OffsetTracker {
    dir: PathBuf,
}

impl OffsetTracker {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Record path for an agent
    ///
    /// The identity is percent-encoded, so `team/worker` and `team_worker`
    /// never share a file.
    pub fn path_for(&self, agent: &AgentId) -> PathBuf {
        self.dir.join(format!(
            "{}.{}",
            urlencoding::encode(agent.as_str()),
            OFFSET_EXTENSION
        ))
    }

    /// Timestamp of the last delivered message, if any
    pub fn load(&self, agent: &AgentId) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .load_record(agent)?
            .map(|record| record.last_processed_timestamp))
    }

    /// Full record, if one exists
    ///
    /// A record that exists but cannot be parsed is an error.
    pub fn load_record(&self, agent: &AgentId) -> Result<Option<OffsetRecord>> {
        let path = self.path_for(agent);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let record: OffsetRecord = serde_json::from_str(&content)?;
        Ok(Some(record))
    }

    /// Overwrite the cursor with a bare timestamp
    ///
    /// Saving the timestamp already stored keeps the same-second delivery set,
    /// so repeated saves are idempotent.
    pub fn save(&self, agent: &AgentId, timestamp: DateTime<Utc>) -> Result<()> {
        let existing = match self.load_record(agent) {
            Ok(record) => record,
            Err(e) => {
                debug!(agent = %agent, error = %e, "Replacing unreadable offset record");
                None
            }
        };

        let record = match existing {
            Some(mut record) if record.last_processed_timestamp == timestamp => {
                record.updated_at = Utc::now();
                record
            }
            _ => OffsetRecord::new(agent.clone(), timestamp),
        };

        self.save_record(&record)
    }

    /// Atomically replace the record on disk
    pub fn save_record(&self, record: &OffsetRecord) -> Result<()> {
        fs::create_dir_all(&self.dir)?;

        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        serde_json::to_writer_pretty(&mut tmp, record)?;
        tmp.write_all(b"\n")?;
        tmp.as_file().sync_all()?;
        tmp.persist(self.path_for(&record.agent_id))?;

        debug!(
            agent = %record.agent_id,
            last_processed = %record.last_processed_timestamp,
            "Saved offset"
        );
        Ok(())
    }

    /// Remove an agent's record; returns whether one existed
    pub fn clear(&self, agent: &AgentId) -> Result<bool> {
        match fs::remove_file(self.path_for(agent)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => {
                warn!(agent = %agent, error = %e, "Failed to remove offset record");
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use tempfile::TempDir;

    fn agent(id: &str) -> AgentId {
        id.parse().unwrap()
    }

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_790_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_missing_record_is_absent() {
        let temp = TempDir::new().unwrap();
        let tracker = OffsetTracker::new(temp.path().join("offsets"));
        assert_eq!(tracker.load(&agent("worker")).unwrap(), None);
    }

    #[test]
    fn test_save_then_load() {
        let temp = TempDir::new().unwrap();
        let tracker = OffsetTracker::new(temp.path().join("offsets"));
        let me = agent("team/worker");

        tracker.save(&me, ts(5)).unwrap();
        assert_eq!(tracker.load(&me).unwrap(), Some(ts(5)));

        let raw = fs::read_to_string(tracker.path_for(&me)).unwrap();
        assert!(raw.contains("\"lastProcessedTimestamp\""));
        assert!(raw.contains("\"agentId\": \"team/worker\""));
    }

    #[test]
    fn test_idempotent_save() {
        let temp = TempDir::new().unwrap();
        let tracker = OffsetTracker::new(temp.path());
        let me = agent("worker");

        let mut record = OffsetRecord::new(me.clone(), ts(1));
        record.advance(ts(1), "a.md");
        tracker.save_record(&record).unwrap();

        tracker.save(&me, ts(1)).unwrap();
        tracker.save(&me, ts(1)).unwrap();

        let loaded = tracker.load_record(&me).unwrap().unwrap();
        assert_eq!(loaded.last_processed_timestamp, ts(1));
        assert!(loaded.delivered_at_timestamp.contains("a.md"));
    }

    #[test]
    fn test_identity_flattening_is_injective() {
        let tracker = OffsetTracker::new("/bus/offsets");
        let compound = tracker.path_for(&agent("team/worker"));
        let flat = tracker.path_for(&agent("team_worker"));
        let encoded = tracker.path_for(&agent("team%2Fworker"));

        assert_ne!(compound, flat);
        assert_ne!(compound, encoded);
        assert_eq!(compound.parent(), Some(Path::new("/bus/offsets")));
        assert_eq!(
            compound.file_name().unwrap().to_str(),
            Some("team%2Fworker.json")
        );
    }

    #[test]
    fn test_corrupt_record_is_an_error() {
        let temp = TempDir::new().unwrap();
        let tracker = OffsetTracker::new(temp.path());
        let me = agent("worker");
        fs::write(tracker.path_for(&me), "{not json").unwrap();

        assert!(tracker.load(&me).is_err());

        // A save replaces it
        tracker.save(&me, ts(9)).unwrap();
        assert_eq!(tracker.load(&me).unwrap(), Some(ts(9)));
    }

    #[test]
    fn test_same_second_cursor() {
        let mut record = OffsetRecord::new(agent("worker"), ts(10));
        assert!(record.is_pending(ts(10), "a.md"));
        assert!(!record.is_pending(ts(9), "z.md"));

        record.advance(ts(10), "a.md");
        assert!(!record.is_pending(ts(10), "a.md"));
        assert!(record.is_pending(ts(10), "b.md"));

        record.advance(ts(11), "c.md");
        assert!(record.delivered_at_timestamp.len() == 1);
        assert!(!record.is_pending(ts(10), "b.md"));

        record.advance(ts(10) - Duration::seconds(5), "old.md");
        assert_eq!(record.last_processed_timestamp, ts(11));
        assert!(!record.delivered_at_timestamp.contains("old.md"));
    }

    #[test]
    fn test_clear() {
        let temp = TempDir::new().unwrap();
        let tracker = OffsetTracker::new(temp.path());
        let me = agent("worker");

        assert!(!tracker.clear(&me).unwrap());
        tracker.save(&me, ts(0)).unwrap();
        assert!(tracker.clear(&me).unwrap());
        assert_eq!(tracker.load(&me).unwrap(), None);
    }
}
