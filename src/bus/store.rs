//! Message store
//!
//! Writes messages into the shared log directory and reads them back.
//!
//! Directory structure:
//! ```text
//! messages/
//!   1019143005-task-core>worker-abc123.md
//!   1019143112-ask_human-worker>core-f3a9c1.md
//! ```
//!
//! Files are only ever created, never modified or removed, so readers need no
//! locking. Each file is written to a temporary name and renamed into place.

use super::address::AgentId;
use super::filename;
use super::message::{format_message, MessageDraft, MessageFilter, StoredMessage};
use super::sinks::{ActivitySink, LifecycleSink, LifecycleState};
use crate::config::BusConfig;
use crate::rearmatter;
use crate::Result;
use chrono::{DateTime, SubsecRound, Utc};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

/// Per-write options
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteOptions {
    /// Also copy the message into `legacy_dir`
    pub dual_write: bool,
    /// Destination directory for the dual-write copy
    pub legacy_dir: Option<PathBuf>,
}

impl WriteOptions {
    pub fn dual_write(legacy_dir: impl Into<PathBuf>) -> Self {
        Self {
            dual_write: true,
            legacy_dir: Some(legacy_dir.into()),
        }
    }
}

/// Writer and reader for the shared message log
pub struct MessageStore {
    messages_dir: PathBuf,
    defaults: WriteOptions,
    activity: Option<Arc<dyn ActivitySink>>,
    lifecycle: Option<Arc<dyn LifecycleSink>>,
}

impl MessageStore {
    /// Create a store for a message directory
    ///
    /// The directory is created on first write.
    pub fn new(messages_dir: impl Into<PathBuf>) -> Self {
        Self {
            messages_dir: messages_dir.into(),
            defaults: WriteOptions::default(),
            activity: None,
            lifecycle: None,
        }
    }

    /// Create a store using the configured directory and dual-write settings
    pub fn from_config(config: &BusConfig) -> Self {
        Self::new(config.messages_dir()).with_write_options(WriteOptions {
            dual_write: config.dual_write,
            legacy_dir: config.legacy_dir.clone(),
        })
    }

    /// Options used by [`MessageStore::write`]
    pub fn with_write_options(mut self, options: WriteOptions) -> Self {
        self.defaults = options;
        self
    }

    pub fn with_activity_sink(mut self, sink: Arc<dyn ActivitySink>) -> Self {
        self.activity = Some(sink);
        self
    }

    pub fn with_lifecycle_sink(mut self, sink: Arc<dyn LifecycleSink>) -> Self {
        self.lifecycle = Some(sink);
        self
    }

    pub fn messages_dir(&self) -> &Path {
        &self.messages_dir
    }

    /// Filename a draft gets when written at `timestamp`
    pub fn build_filename(draft: &MessageDraft, timestamp: DateTime<Utc>) -> Result<String> {
        Ok(filename::encode(
            timestamp,
            draft.from.as_str(),
            draft.to.as_str(),
            &draft.msg_type,
            &draft.id,
        )?)
    }

    /// Write a message with the store's default options
    pub fn write(&self, draft: &MessageDraft) -> Result<PathBuf> {
        self.write_with(draft, &self.defaults)
    }

    /// Write a message, returning the path in the shared directory
    ///
    /// Rearmatter problems are logged and never block the write. Activity,
    /// lifecycle and dual-write side effects are best effort.
    pub fn write_with(&self, draft: &MessageDraft, options: &WriteOptions) -> Result<PathBuf> {
        let timestamp = Utc::now().trunc_subsecs(0);
        let name = Self::build_filename(draft, timestamp)?;
        let path = self.messages_dir.join(&name);

        log_rearmatter(&name, &draft.body);

        let text = format_message(&draft.frontmatter(timestamp), &draft.body)?;
        write_new_file(&self.messages_dir, &path, &text)?;

        info!(
            path = %path.display(),
            from = %draft.from,
            to = %draft.to,
            msg_type = %draft.msg_type,
            "Message written"
        );

        self.notify_sinks(draft);

        if options.dual_write {
            self.copy_to_legacy(&name, &text, options.legacy_dir.as_deref());
        }

        Ok(path)
    }

    /// Read one message file
    pub fn read(&self, path: impl AsRef<Path>) -> Result<StoredMessage> {
        let path = path.as_ref();
        if path.is_relative() {
            StoredMessage::read(self.messages_dir.join(path))
        } else {
            StoredMessage::read(path)
        }
    }

    /// Messages matching a filter, oldest first
    ///
    /// Files that are not well-formed messages are skipped.
    pub fn list(&self, filter: &MessageFilter) -> Result<Vec<StoredMessage>> {
        let mut messages: Vec<StoredMessage> = message_files(&self.messages_dir)?
            .into_iter()
            .filter_map(|(_, path)| match StoredMessage::read(&path) {
                Ok(message) => Some(message),
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "Skipping unreadable message");
                    None
                }
            })
            .filter(|message| filter.matches(message))
            .collect();

        sort_messages(&mut messages);
        Ok(messages)
    }

    /// All messages addressed to an agent, oldest first
    pub fn inbox(&self, agent: &AgentId) -> Result<Vec<StoredMessage>> {
        self.list(&MessageFilter::new().addressed_to(agent.clone()))
    }

    fn notify_sinks(&self, draft: &MessageDraft) {
        if let Some(ref activity) = self.activity {
            if let Err(e) = activity.record_activity(&draft.from) {
                warn!(agent = %draft.from, error = %e, "Failed to record agent activity");
            }
        }

        if let (Some(lifecycle), Some(state)) = (
            &self.lifecycle,
            LifecycleState::for_message_type(&draft.msg_type),
        ) {
            if let Err(e) = lifecycle.request_transition(&draft.from, state) {
                warn!(
                    agent = %draft.from,
                    state = %state,
                    error = %e,
                    "Failed to request lifecycle transition"
                );
            }
        }
    }

    fn copy_to_legacy(&self, name: &str, text: &str, legacy_dir: Option<&Path>) {
        let Some(legacy_dir) = legacy_dir else {
            warn!(file = name, "Dual-write requested without a legacy directory");
            return;
        };

        // Legacy readers poll this directory too; never expose a partial file
        let target = legacy_dir.join(name);
        match write_new_file(legacy_dir, &target, text) {
            Ok(()) => debug!(path = %target.display(), "Dual-write copy written"),
            Err(e) => warn!(path = %target.display(), error = %e, "Dual-write copy failed"),
        }
    }
}

/// Sort by frontmatter timestamp, then filename
pub(crate) fn sort_messages(messages: &mut [StoredMessage]) {
    messages.sort_by(|a, b| {
        a.timestamp()
            .cmp(&b.timestamp())
            .then_with(|| a.file_name().cmp(b.file_name()))
    });
}

/// `(file name, path)` for every `.md` entry in a directory
///
/// A missing directory has no messages.
pub(crate) fn message_files(dir: &Path) -> io::Result<Vec<(String, PathBuf)>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name.ends_with(&format!(".{}", filename::MESSAGE_EXTENSION)) {
            files.push((name.to_string(), path.clone()));
        }
    }
    Ok(files)
}

/// Write `text` to `path` through a temporary file in the same directory
///
/// Fails if `path` already exists.
fn write_new_file(dir: &Path, path: &Path, text: &str) -> Result<()> {
    fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(text.as_bytes())?;
    tmp.as_file().sync_all()?;
    tmp.persist_noclobber(path)?;
    Ok(())
}

fn log_rearmatter(name: &str, body: &str) {
    let Some(block) = rearmatter::extract(body).block else {
        return;
    };

    let report = rearmatter::validate(block);
    if !report.valid {
        warn!(
            file = name,
            errors = ?report.errors,
            "Rearmatter failed validation, writing message anyway"
        );
    } else if !report.warnings.is_empty() {
        debug!(file = name, warnings = ?report.warnings, "Rearmatter has warnings");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::message::parse_message;
    use parking_lot::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingSink {
        activity: Mutex<Vec<String>>,
        transitions: Mutex<Vec<(String, LifecycleState)>>,
        fail: bool,
    }

    impl ActivitySink for RecordingSink {
        fn record_activity(&self, agent: &AgentId) -> anyhow::Result<()> {
            self.activity.lock().push(agent.to_string());
            anyhow::ensure!(!self.fail, "activity tracker offline");
            Ok(())
        }
    }

    impl LifecycleSink for RecordingSink {
        fn request_transition(&self, agent: &AgentId, state: LifecycleState) -> anyhow::Result<()> {
            self.transitions.lock().push((agent.to_string(), state));
            anyhow::ensure!(!self.fail, "state service offline");
            Ok(())
        }
    }

    fn draft(msg_type: &str, id: &str, body: &str) -> MessageDraft {
        MessageDraft::try_new("core/core", "team/worker", msg_type, id, body).unwrap()
    }

    #[test]
    fn test_write_layout() {
        let temp = TempDir::new().unwrap();
        let store = MessageStore::new(temp.path().join("messages"));

        let path = store.write(&draft("task", "abc123", "hello")).unwrap();
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.ends_with("-task-core>worker-abc123.md"));

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.starts_with(
            "---\nto: team/worker\nfrom: core/core\ntype: task\nmsg-id: abc123\ntimestamp: "
        ));
        assert!(text.ends_with("\n---\n\nhello"));

        let (frontmatter, body) = parse_message(&text).unwrap();
        assert_eq!(frontmatter.msg_id, "abc123");
        assert_eq!(body, "hello");
    }

    #[test]
    fn test_invalid_rearmatter_does_not_block_write() {
        let temp = TempDir::new().unwrap();
        let store = MessageStore::new(temp.path());
        let body = "Done.\n\n---\nrearmatter:\n  confidence: 2.5\n---";

        let path = store.write(&draft("result", "r1", body)).unwrap();
        let message = store.read(&path).unwrap();

        assert_eq!(message.recipient().as_str(), "team/worker");
        assert_eq!(message.body, body);
        assert_eq!(message.content(), "Done.");
        assert!(!message.rearmatter().unwrap().valid);
    }

    #[test]
    fn test_sinks_are_notified_and_fail_soft() {
        let temp = TempDir::new().unwrap();
        let sink = Arc::new(RecordingSink {
            fail: true,
            ..Default::default()
        });
        let store = MessageStore::new(temp.path())
            .with_activity_sink(sink.clone())
            .with_lifecycle_sink(sink.clone());

        store.write(&draft("ask-human", "q1", "Need a decision")).unwrap();
        store.write(&draft("task", "t1", "Plain task")).unwrap();

        assert_eq!(sink.activity.lock().len(), 2);
        assert_eq!(
            *sink.transitions.lock(),
            vec![("core/core".to_string(), LifecycleState::Blocked)]
        );
    }

    #[test]
    fn test_dual_write() {
        let temp = TempDir::new().unwrap();
        let legacy = temp.path().join("legacy");
        let store = MessageStore::new(temp.path().join("messages"));

        let path = store
            .write_with(&draft("task", "d1", "copy me"), &WriteOptions::dual_write(&legacy))
            .unwrap();

        let copy = legacy.join(path.file_name().unwrap());
        assert_eq!(
            fs::read_to_string(copy).unwrap(),
            fs::read_to_string(&path).unwrap()
        );
    }

    #[test]
    fn test_dual_write_leaves_only_complete_files() {
        let temp = TempDir::new().unwrap();
        let legacy = temp.path().join("legacy");
        let store = MessageStore::new(temp.path().join("messages"))
            .with_write_options(WriteOptions::dual_write(&legacy));

        let path = store.write(&draft("task", "d3", "atomic")).unwrap();
        let names: Vec<String> = fs::read_dir(&legacy)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(
            names,
            vec![path.file_name().unwrap().to_string_lossy().to_string()]
        );

        // An existing legacy copy is kept; the primary write still succeeds
        let existing = legacy.join("0101000000-task-core>worker-x.md");
        fs::write(&existing, "legacy original").unwrap();
        store.copy_to_legacy(
            "0101000000-task-core>worker-x.md",
            "replacement",
            Some(legacy.as_path()),
        );
        assert_eq!(fs::read_to_string(&existing).unwrap(), "legacy original");
    }

    #[test]
    fn test_dual_write_failure_is_not_raised() {
        let temp = TempDir::new().unwrap();
        // A file where the legacy directory should be
        let blocked = temp.path().join("legacy");
        fs::write(&blocked, "not a directory").unwrap();

        let store = MessageStore::new(temp.path().join("messages"))
            .with_write_options(WriteOptions::dual_write(&blocked));
        let path = store.write(&draft("task", "d2", "primary only")).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_list_filters_and_skips_junk() {
        let temp = TempDir::new().unwrap();
        let store = MessageStore::new(temp.path());

        store.write(&draft("task", "a1", "one")).unwrap();
        let reply = MessageDraft::try_new("team/worker", "core/core", "result", "b2", "two")
            .unwrap();
        store.write(&reply).unwrap();
        fs::write(temp.path().join("README.md"), "not a message").unwrap();
        fs::write(temp.path().join("0101000000-x-a>b-c.md"), "no frontmatter").unwrap();

        assert_eq!(store.list(&MessageFilter::new()).unwrap().len(), 2);

        let worker: AgentId = "worker".parse().unwrap();
        let inbox = store.inbox(&worker).unwrap();
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].id(), "a1");

        let results = store
            .list(&MessageFilter::new().of_type("result"))
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].sender().as_str(), "team/worker");
    }

    #[test]
    fn test_list_missing_directory() {
        let temp = TempDir::new().unwrap();
        let store = MessageStore::new(temp.path().join("absent"));
        assert!(store.list(&MessageFilter::new()).unwrap().is_empty());
    }

    #[test]
    fn test_existing_file_is_not_overwritten() {
        let temp = TempDir::new().unwrap();
        let target = temp.path().join("x.md");
        write_new_file(temp.path(), &target, "first").unwrap();
        assert!(write_new_file(temp.path(), &target, "second").is_err());
        assert_eq!(fs::read_to_string(target).unwrap(), "first");
    }

    #[test]
    fn test_colliding_filename_keeps_first_message() {
        let temp = TempDir::new().unwrap();
        let store = MessageStore::new(temp.path());
        let ts = Utc::now().trunc_subsecs(0);

        let first = draft("task", "a-b", "first");
        let second = draft("task", "a_b", "second");
        let name = MessageStore::build_filename(&first, ts).unwrap();
        assert_eq!(name, MessageStore::build_filename(&second, ts).unwrap());

        let path = temp.path().join(&name);
        let fm = first.frontmatter(ts);
        write_new_file(temp.path(), &path, &format_message(&fm, &first.body).unwrap()).unwrap();
        let fm = second.frontmatter(ts);
        assert!(
            write_new_file(temp.path(), &path, &format_message(&fm, &second.body).unwrap())
                .is_err()
        );

        let kept = store.read(&path).unwrap();
        assert_eq!(kept.id(), "a-b");
    }
}
