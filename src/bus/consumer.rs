//! Log consumer
//!
//! One consumer follows the shared message directory on behalf of one agent.
//! It replays the backlog it has not yet delivered, then waits for change
//! notifications and delivers every new message addressed to its agent.
//!
//! Change notifications are only a hint that something arrived. Every wakeup
//! rescans the directory and orders candidates by their frontmatter
//! timestamp. When native notification is unavailable (or the directory does
//! not exist yet) the consumer polls, and it rescans periodically even while
//! watching to pick up anything a notification missed.
//!
//! Delivery is at-least-once: the offset is saved only after the handler
//! accepts a message.

use super::address::AgentId;
use super::filename;
use super::message::StoredMessage;
use super::offsets::{OffsetRecord, OffsetTracker};
use super::retry::{deliver_with_retry, shutdown_requested, DeliveryOutcome, RetryPolicy};
use super::sinks::MessageHandler;
use super::store::{message_files, sort_messages};
use crate::config::{validate_config_result, BusConfig, StartPosition};
use crate::{MeshBusError, Result};
use chrono::{DateTime, Duration as ChronoDuration, SubsecRound, Utc};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::RwLock;
use serde::Serialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

/// Consumer lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsumerState {
    Stopped,
    Starting,
    Running,
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsumerState::Stopped => write!(f, "stopped"),
            ConsumerState::Starting => write!(f, "starting"),
            ConsumerState::Running => write!(f, "running"),
        }
    }
}

/// Point-in-time view of a consumer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsumerStatus {
    pub state: ConsumerState,
    pub running: bool,
    /// Timestamp of the most recently delivered message
    pub last_processed: Option<DateTime<Utc>>,
    /// Messages accepted by the handler since construction
    pub delivered: u64,
    /// Messages moved to the dead-letter directory since construction
    pub dead_lettered: u64,
    /// Native change notification is active (false while polling)
    pub watching: bool,
}

impl Default for ConsumerStatus {
    fn default() -> Self {
        Self {
            state: ConsumerState::Stopped,
            running: false,
            last_processed: None,
            delivered: 0,
            dead_lettered: 0,
            watching: false,
        }
    }
}

type SharedStatus = Arc<RwLock<ConsumerStatus>>;

/// Filenames older than the cursor by more than this are not opened
///
/// Covers the year inference in filename decoding and writers whose clocks
/// drift from the frontmatter timestamp.
const PREFILTER_MARGIN_HOURS: i64 = 24;

/// Delivers messages addressed to one agent
pub struct LogConsumer {
    agent: AgentId,
    config: Arc<BusConfig>,
    handler: Arc<dyn MessageHandler>,
    offsets: OffsetTracker,
    status: SharedStatus,
    /// Raised by `stop`; reachable while `start` still holds `task`
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl LogConsumer {
    pub fn new(agent: AgentId, config: Arc<BusConfig>, handler: Arc<dyn MessageHandler>) -> Self {
        let offsets = OffsetTracker::new(config.offsets_dir());
        Self {
            agent,
            config,
            handler,
            offsets,
            status: Arc::new(RwLock::new(ConsumerStatus::default())),
            shutdown: watch::channel(false).0,
            task: Mutex::new(None),
        }
    }

    pub fn agent(&self) -> &AgentId {
        &self.agent
    }

    /// Whether a message is addressed to this consumer's agent
    ///
    /// Accepts both the full `group/name` identity and the bare base name.
    pub fn is_for_me(&self, message: &StoredMessage) -> bool {
        self.agent.matches(message.recipient().as_str())
    }

    /// Replay the backlog, start watching and spawn the delivery loop
    ///
    /// Returns once the backlog has been delivered and the watch (or polling
    /// fallback) is in place. Starting a running consumer is a no-op. A
    /// `stop` issued during the backlog replay ends it early and `start`
    /// returns an error.
    pub async fn start(&self) -> Result<()> {
        let mut task = self.task.lock().await;
        if task.is_some() {
            debug!(agent = %self.agent, "Consumer already running");
            return Ok(());
        }

        validate_config_result(&self.config)?;
        let messages_dir = self.config.messages_dir();
        if messages_dir.exists() && !messages_dir.is_dir() {
            return Err(MeshBusError::Consumer(format!(
                "message path is not a directory: {}",
                messages_dir.display()
            )));
        }

        self.status.write().state = ConsumerState::Starting;
        info!(agent = %self.agent, dir = %messages_dir.display(), "Starting consumer");

        self.shutdown.send_replace(false);
        let mut worker = Worker::new(self, messages_dir, self.shutdown.subscribe());
        worker.try_watch();
        if worker.scan().await == ScanOutcome::Shutdown {
            mark_stopped(&self.status);
            info!(agent = %self.agent, "Consumer stopped during backlog replay");
            return Err(MeshBusError::Consumer(format!(
                "consumer for {} was stopped while starting",
                self.agent
            )));
        }

        *task = Some(tokio::spawn(worker.run()));

        {
            let mut status = self.status.write();
            status.state = ConsumerState::Running;
            status.running = true;
        }
        info!(agent = %self.agent, "Consumer running");
        Ok(())
    }

    /// Stop watching and wait for the delivery loop to exit
    ///
    /// Safe to call at any point, including while `start` is replaying the
    /// backlog. The saved offset is left as it is. If the loop does not exit
    /// within the configured grace period it is aborted and an error is
    /// returned.
    pub async fn stop(&self) -> Result<()> {
        self.shutdown.send_replace(true);

        let mut guard = self.task.lock().await;
        let Some(mut task) = guard.take() else {
            debug!(agent = %self.agent, "Consumer not running");
            return Ok(());
        };

        let result = match tokio::time::timeout(self.config.stop_grace(), &mut task).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(MeshBusError::Consumer(format!(
                "consumer task for {} failed: {}",
                self.agent, e
            ))),
            Err(_) => {
                task.abort();
                Err(MeshBusError::Consumer(format!(
                    "consumer for {} did not stop within {:?}, aborted",
                    self.agent,
                    self.config.stop_grace()
                )))
            }
        };

        mark_stopped(&self.status);
        info!(agent = %self.agent, "Consumer stopped");
        result
    }

    pub fn status(&self) -> ConsumerStatus {
        self.status.read().clone()
    }

    pub fn is_running(&self) -> bool {
        self.status.read().running
    }

    pub fn last_processed(&self) -> Option<DateTime<Utc>> {
        self.status.read().last_processed
    }
}

impl Drop for LogConsumer {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

fn mark_stopped(status: &SharedStatus) {
    let mut status = status.write();
    status.state = ConsumerState::Stopped;
    status.running = false;
    status.watching = false;
}

/// How a directory scan ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanOutcome {
    /// Everything pending was handled
    Complete,
    /// A message could be neither delivered nor dead-lettered; the rest
    /// waits for the next scan
    Blocked,
    Shutdown,
}

/// State owned by the delivery loop
struct Worker {
    agent: AgentId,
    config: Arc<BusConfig>,
    messages_dir: PathBuf,
    handler: Arc<dyn MessageHandler>,
    offsets: OffsetTracker,
    retry: RetryPolicy,
    cursor: Option<OffsetRecord>,
    status: SharedStatus,
    shutdown: watch::Receiver<bool>,
    events_tx: mpsc::UnboundedSender<()>,
    events_rx: mpsc::UnboundedReceiver<()>,
    watcher: Option<RecommendedWatcher>,
}

impl Worker {
    fn new(consumer: &LogConsumer, messages_dir: PathBuf, shutdown: watch::Receiver<bool>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let cursor = initial_cursor(consumer);
        if let Some(ref record) = cursor {
            consumer.status.write().last_processed = Some(record.last_processed_timestamp);
        }

        Self {
            agent: consumer.agent.clone(),
            config: consumer.config.clone(),
            messages_dir,
            handler: consumer.handler.clone(),
            offsets: consumer.offsets.clone(),
            retry: consumer.config.retry_policy(),
            cursor,
            status: consumer.status.clone(),
            shutdown,
            events_tx,
            events_rx,
            watcher: None,
        }
    }

    async fn run(mut self) {
        let mut tick = tokio::time::interval(self.config.poll_interval());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tick.tick().await;
        let mut last_scan = Instant::now();

        loop {
            tokio::select! {
                _ = shutdown_requested(&mut self.shutdown) => break,
                Some(()) = self.events_rx.recv() => {
                    if !self.settle().await {
                        break;
                    }
                    while self.events_rx.try_recv().is_ok() {}
                    if self.scan().await == ScanOutcome::Shutdown {
                        break;
                    }
                    last_scan = Instant::now();
                }
                _ = tick.tick() => {
                    self.try_watch();
                    if self.watcher.is_none() || last_scan.elapsed() >= self.config.rescan_interval() {
                        trace!(agent = %self.agent, "Periodic rescan");
                        if self.scan().await == ScanOutcome::Shutdown {
                            break;
                        }
                        last_scan = Instant::now();
                    }
                }
            }
        }

        self.watcher = None;
        debug!(agent = %self.agent, "Delivery loop exited");
    }

    /// Give a writer time to finish; false if shutdown came first
    async fn settle(&mut self) -> bool {
        tokio::select! {
            _ = sleep(self.config.settle_delay()) => true,
            _ = shutdown_requested(&mut self.shutdown) => false,
        }
    }

    /// Register native change notification if possible
    fn try_watch(&mut self) {
        if self.watcher.is_some() || !self.messages_dir.is_dir() {
            return;
        }

        let tx = self.events_tx.clone();
        let agent = self.agent.clone();
        let result = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                if is_arrival(&event.kind) {
                    let _ = tx.send(());
                }
            }
            Err(e) => warn!(agent = %agent, error = %e, "Watch error"),
        })
        .and_then(|mut watcher| {
            watcher.watch(&self.messages_dir, RecursiveMode::NonRecursive)?;
            Ok(watcher)
        });

        match result {
            Ok(watcher) => {
                debug!(agent = %self.agent, dir = %self.messages_dir.display(), "Watching message directory");
                self.watcher = Some(watcher);
                self.status.write().watching = true;
            }
            Err(e) => {
                debug!(agent = %self.agent, error = %e, "Change notification unavailable, polling");
            }
        }
    }

    /// Deliver everything pending in timestamp order
    async fn scan(&mut self) -> ScanOutcome {
        let pending = match self.pending_messages() {
            Ok(pending) => pending,
            Err(e) => {
                warn!(agent = %self.agent, error = %e, "Failed to scan message directory");
                return ScanOutcome::Complete;
            }
        };

        for message in pending {
            if *self.shutdown.borrow() {
                return ScanOutcome::Shutdown;
            }
            // Later messages would move the cursor past this one
            match self.deliver(message).await {
                ScanOutcome::Complete => {}
                halted => return halted,
            }
        }
        ScanOutcome::Complete
    }

    fn pending_messages(&self) -> std::io::Result<Vec<StoredMessage>> {
        let mut pending = Vec::new();

        for (name, path) in message_files(&self.messages_dir)? {
            let parsed = match filename::decode(&name) {
                Ok(parsed) => parsed,
                Err(e) => {
                    trace!(file = %name, error = %e, "Skipping non-message file");
                    continue;
                }
            };
            if !self.agent.matches(&parsed.to) {
                continue;
            }
            if !may_be_pending(self.cursor.as_ref(), parsed.timestamp) {
                continue;
            }

            // Frontmatter carries the full identities and timestamp
            let message = match StoredMessage::read(&path) {
                Ok(message) => message,
                Err(e) => {
                    debug!(file = %name, error = %e, "Skipping unreadable message");
                    continue;
                }
            };
            if !self.agent.matches(message.recipient().as_str()) {
                continue;
            }

            let is_pending = self
                .cursor
                .as_ref()
                .map_or(true, |c| c.is_pending(message.timestamp(), message.file_name()));
            if is_pending {
                pending.push(message);
            }
        }

        sort_messages(&mut pending);
        Ok(pending)
    }

    async fn deliver(&mut self, message: StoredMessage) -> ScanOutcome {
        let handler = self.handler.clone();
        let operation = format!("deliver {} to {}", message.file_name(), self.agent);
        let mut stop = self.shutdown.clone();
        // A blocked handler is abandoned on stop; the offset stays put
        let outcome = tokio::select! {
            outcome = deliver_with_retry(&self.retry, &operation, &mut self.shutdown, || {
                handler.deliver(&message)
            }) => outcome,
            _ = shutdown_requested(&mut stop) => DeliveryOutcome::Interrupted { attempts: 0 },
        };

        match outcome {
            DeliveryOutcome::Delivered { attempts } => {
                debug!(
                    agent = %self.agent,
                    file = message.file_name(),
                    attempts,
                    "Message delivered"
                );
                self.status.write().delivered += 1;
                self.advance(&message);
                ScanOutcome::Complete
            }
            DeliveryOutcome::Exhausted { attempts, error } => {
                match self.dead_letter(&message, attempts, &error) {
                    Ok(path) => {
                        warn!(
                            agent = %self.agent,
                            file = message.file_name(),
                            dead_letter = %path.display(),
                            "Message moved to dead-letter directory"
                        );
                        self.status.write().dead_lettered += 1;
                        self.advance(&message);
                        ScanOutcome::Complete
                    }
                    Err(e) => {
                        error!(
                            agent = %self.agent,
                            file = message.file_name(),
                            error = %e,
                            "Failed to write dead-letter copy, offset not advanced"
                        );
                        ScanOutcome::Blocked
                    }
                }
            }
            DeliveryOutcome::Interrupted { .. } => ScanOutcome::Shutdown,
        }
    }

    fn advance(&mut self, message: &StoredMessage) {
        let record = self
            .cursor
            .get_or_insert_with(|| OffsetRecord::new(self.agent.clone(), message.timestamp()));
        record.advance(message.timestamp(), message.file_name());

        if let Err(e) = self.offsets.save_record(record) {
            warn!(agent = %self.agent, error = %e, "Failed to save offset");
        }
        self.status.write().last_processed = Some(record.last_processed_timestamp);
    }

    fn dead_letter(
        &self,
        message: &StoredMessage,
        attempts: u32,
        error: &anyhow::Error,
    ) -> std::io::Result<PathBuf> {
        let dir = self
            .config
            .dead_letter_dir()
            .join(urlencoding::encode(self.agent.as_str()).as_ref());
        fs::create_dir_all(&dir)?;

        let target = dir.join(message.file_name());
        fs::copy(&message.path, &target)?;

        let note = format!(
            "agent: {}\nmessage: {}\nattempts: {}\nfailed_at: {}\nerror: {:#}\n",
            self.agent,
            message.file_name(),
            attempts,
            Utc::now().to_rfc3339(),
            error
        );
        fs::write(dir.join(format!("{}.error", message.file_name())), note)?;
        Ok(target)
    }
}

fn initial_cursor(consumer: &LogConsumer) -> Option<OffsetRecord> {
    match consumer.offsets.load_record(&consumer.agent) {
        Ok(Some(record)) => return Some(record),
        Ok(None) => {}
        Err(e) => warn!(
            agent = %consumer.agent,
            error = %e,
            "Unreadable offset record, treating as absent"
        ),
    }

    match consumer.config.start_position {
        StartPosition::Beginning => None,
        StartPosition::Latest => Some(latest_baseline(
            &consumer.agent,
            &consumer.config.messages_dir(),
            Utc::now(),
        )),
    }
}

/// Cursor that treats everything written up to `now` as already seen
///
/// The cursor has second precision, so files already present in the
/// current second are recorded as delivered.
fn latest_baseline(agent: &AgentId, messages_dir: &Path, now: DateTime<Utc>) -> OffsetRecord {
    let baseline = now.trunc_subsecs(0);
    let mut record = OffsetRecord::new(agent.clone(), baseline);

    let files = match message_files(messages_dir) {
        Ok(files) => files,
        Err(e) => {
            debug!(agent = %agent, error = %e, "No backlog to baseline");
            return record;
        }
    };
    for (name, path) in files {
        let same_second = filename::decode_at(&name, baseline)
            .is_ok_and(|parsed| parsed.timestamp == baseline);
        if !same_second {
            continue;
        }
        if let Ok(message) = StoredMessage::read(&path) {
            if message.timestamp() == baseline {
                record.advance(baseline, message.file_name());
            }
        }
    }
    record
}

/// Cheap check on the filename timestamp before a file is opened
fn may_be_pending(cursor: Option<&OffsetRecord>, filename_timestamp: DateTime<Utc>) -> bool {
    cursor.map_or(true, |c| {
        filename_timestamp >= c.last_processed_timestamp - ChronoDuration::hours(PREFILTER_MARGIN_HOURS)
    })
}

fn is_arrival(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Any
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::message::MessageDraft;
    use crate::bus::sinks::HandlerFn;
    use crate::bus::store::MessageStore;
    use crate::config::DeliveryRetryConfig;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::TempDir;

    fn test_config(root: &Path) -> BusConfig {
        BusConfig::with_root(root)
            .with_settle_delay(Duration::from_millis(10))
            .with_poll_interval(Duration::from_millis(20))
            .with_rescan_interval(Duration::from_millis(100))
            .with_stop_grace(Duration::from_secs(2))
            .with_delivery_retry(DeliveryRetryConfig {
                max_retries: 1,
                initial_backoff_ms: 5,
                max_backoff_ms: 10,
                multiplier: 2.0,
                jitter: false,
            })
    }

    fn agent(id: &str) -> AgentId {
        id.parse().unwrap()
    }

    fn send(store: &MessageStore, to: &str, id: &str) {
        let draft = MessageDraft::try_new("core/core", to, "task", id, "hello").unwrap();
        store.write(&draft).unwrap();
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<StoredMessage>) -> StoredMessage {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for delivery")
            .expect("channel closed")
    }

    #[test]
    fn test_is_for_me() {
        let temp = TempDir::new().unwrap();
        let config = Arc::new(test_config(temp.path()));
        let store = MessageStore::from_config(&config);
        let (tx, _rx) = mpsc::unbounded_channel();
        let consumer = LogConsumer::new(agent("mesh-x/agent-y"), config, Arc::new(tx));

        let cases = [
            ("mesh-x/agent-y", true),
            ("agent-y", true),
            ("mesh-x/agent-z", false),
            ("agent-z", false),
        ];
        for (i, (to, expected)) in cases.into_iter().enumerate() {
            let draft = MessageDraft::try_new("core", to, "task", format!("m{}", i), "x").unwrap();
            let path = store.write(&draft).unwrap();
            let message = store.read(&path).unwrap();
            assert_eq!(consumer.is_for_me(&message), expected, "to = {}", to);
        }
    }

    #[tokio::test]
    async fn test_backlog_replayed_in_order() {
        let temp = TempDir::new().unwrap();
        let config = Arc::new(test_config(temp.path()));
        let store = MessageStore::from_config(&config);
        send(&store, "team/worker", "a1");
        send(&store, "team/other", "zz");
        send(&store, "team/worker", "b2");

        let (tx, mut rx) = mpsc::unbounded_channel();
        let consumer = LogConsumer::new(agent("team/worker"), config, Arc::new(tx));
        consumer.start().await.unwrap();

        assert_eq!(recv(&mut rx).await.id(), "a1");
        assert_eq!(recv(&mut rx).await.id(), "b2");
        assert!(rx.try_recv().is_err());

        let status = consumer.status();
        assert_eq!(status.state, ConsumerState::Running);
        assert_eq!(status.delivered, 2);
        assert!(status.last_processed.is_some());

        consumer.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_new_arrival_before_directory_exists() {
        let temp = TempDir::new().unwrap();
        let config = Arc::new(test_config(temp.path()));
        assert!(!config.messages_dir().exists());

        let (tx, mut rx) = mpsc::unbounded_channel();
        let consumer = LogConsumer::new(agent("worker"), config.clone(), Arc::new(tx));
        consumer.start().await.unwrap();
        assert!(!consumer.status().watching);

        let store = MessageStore::from_config(&config);
        send(&store, "team/worker", "late1");
        assert_eq!(recv(&mut rx).await.id(), "late1");

        consumer.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_restart_resumes_from_offset() {
        let temp = TempDir::new().unwrap();
        let config = Arc::new(test_config(temp.path()));
        let store = MessageStore::from_config(&config);
        send(&store, "worker", "once");

        let (tx, mut rx) = mpsc::unbounded_channel();
        let consumer = LogConsumer::new(agent("worker"), config.clone(), Arc::new(tx.clone()));
        consumer.start().await.unwrap();
        assert_eq!(recv(&mut rx).await.id(), "once");
        consumer.stop().await.unwrap();

        let restarted = LogConsumer::new(agent("worker"), config, Arc::new(tx));
        restarted.start().await.unwrap();
        assert!(restarted.last_processed().is_some());
        sleep(Duration::from_millis(150)).await;
        assert!(rx.try_recv().is_err());
        restarted.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_latest_skips_backlog() {
        let temp = TempDir::new().unwrap();
        let config = Arc::new(test_config(temp.path()).with_start_position(StartPosition::Latest));
        let store = MessageStore::from_config(&config);
        let old = MessageDraft::try_new("core", "worker", "task", "old", "x").unwrap();
        store.write(&old).unwrap();

        // Move the backlog message's timestamp into the past
        let path = store.list(&Default::default()).unwrap()[0].path.clone();
        let text = fs::read_to_string(&path).unwrap();
        let (mut fm, body) = crate::bus::message::parse_message(&text).unwrap();
        fm.timestamp -= chrono::Duration::minutes(5);
        fs::write(&path, crate::bus::message::format_message(&fm, &body).unwrap()).unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let consumer = LogConsumer::new(agent("worker"), config, Arc::new(tx));
        consumer.start().await.unwrap();
        sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());

        send(&store, "worker", "fresh");
        assert_eq!(recv(&mut rx).await.id(), "fresh");
        consumer.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_failing_handler_dead_letters() {
        let temp = TempDir::new().unwrap();
        let config = Arc::new(test_config(temp.path()));
        let store = MessageStore::from_config(&config);
        send(&store, "team/worker", "poison");

        let handler = HandlerFn(|_: &StoredMessage| -> anyhow::Result<()> {
            anyhow::bail!("handler rejected message")
        });
        let consumer = LogConsumer::new(agent("team/worker"), config.clone(), Arc::new(handler));
        consumer.start().await.unwrap();

        let status = consumer.status();
        assert_eq!(status.dead_lettered, 1);
        assert_eq!(status.delivered, 0);

        let dir = config.dead_letter_dir().join("team%2Fworker");
        let entries: Vec<String> = fs::read_dir(&dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(entries.len(), 2);
        let note = entries.iter().find(|n| n.ends_with(".md.error")).unwrap();
        let note = fs::read_to_string(dir.join(note)).unwrap();
        assert!(note.contains("attempts: 2"));
        assert!(note.contains("handler rejected message"));

        let offsets = OffsetTracker::new(config.offsets_dir());
        assert!(offsets.load(&agent("team/worker")).unwrap().is_some());

        consumer.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let temp = TempDir::new().unwrap();
        let config = Arc::new(test_config(temp.path()));
        let (tx, _rx) = mpsc::unbounded_channel();
        let consumer = LogConsumer::new(agent("worker"), config, Arc::new(tx));

        assert_eq!(consumer.status().state, ConsumerState::Stopped);
        consumer.start().await.unwrap();
        consumer.start().await.unwrap();
        assert!(consumer.is_running());

        consumer.stop().await.unwrap();
        let status = consumer.status();
        assert_eq!(status.state, ConsumerState::Stopped);
        assert!(!status.running);

        // Stopping twice is harmless
        consumer.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_timing_refused_at_start() {
        let temp = TempDir::new().unwrap();
        let config = Arc::new(test_config(temp.path()).with_poll_interval(Duration::ZERO));
        let (tx, _rx) = mpsc::unbounded_channel();
        let consumer = LogConsumer::new(agent("worker"), config, Arc::new(tx));

        assert!(matches!(
            consumer.start().await,
            Err(MeshBusError::Config(_))
        ));
        let status = consumer.status();
        assert_eq!(status.state, ConsumerState::Stopped);
        assert!(!status.running);
    }

    struct SlowHandler;

    #[async_trait::async_trait]
    impl MessageHandler for SlowHandler {
        async fn deliver(&self, _message: &StoredMessage) -> anyhow::Result<()> {
            sleep(Duration::from_secs(30)).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_stop_during_backlog_replay() {
        let temp = TempDir::new().unwrap();
        let config = Arc::new(test_config(temp.path()).with_stop_grace(Duration::from_millis(200)));
        let store = MessageStore::from_config(&config);
        send(&store, "worker", "slow");

        let consumer = Arc::new(LogConsumer::new(
            agent("worker"),
            config.clone(),
            Arc::new(SlowHandler),
        ));
        let starting = tokio::spawn({
            let consumer = consumer.clone();
            async move { consumer.start().await }
        });
        sleep(Duration::from_millis(200)).await;

        let stopped = tokio::time::timeout(Duration::from_secs(3), consumer.stop()).await;
        assert!(matches!(stopped, Ok(Ok(()))));
        assert!(starting.await.unwrap().is_err());

        assert_eq!(consumer.status().state, ConsumerState::Stopped);
        let offsets = OffsetTracker::new(config.offsets_dir());
        assert!(offsets.load(&agent("worker")).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unwritable_dead_letter_keeps_offset() {
        let temp = TempDir::new().unwrap();
        let blocked = temp.path().join("dead-letter");
        fs::write(&blocked, "not a directory").unwrap();
        let config = Arc::new(test_config(temp.path()).with_dead_letter_dir(&blocked));
        let store = MessageStore::from_config(&config);
        send(&store, "worker", "keep");

        let failing = HandlerFn(|_: &StoredMessage| -> anyhow::Result<()> {
            anyhow::bail!("handler down")
        });
        let consumer = LogConsumer::new(agent("worker"), config.clone(), Arc::new(failing));
        consumer.start().await.unwrap();
        assert_eq!(consumer.status().dead_lettered, 0);
        consumer.stop().await.unwrap();

        let offsets = OffsetTracker::new(config.offsets_dir());
        assert!(offsets.load(&agent("worker")).unwrap().is_none());

        let (tx, mut rx) = mpsc::unbounded_channel();
        let restarted = LogConsumer::new(agent("worker"), config, Arc::new(tx));
        restarted.start().await.unwrap();
        assert_eq!(recv(&mut rx).await.id(), "keep");
        restarted.stop().await.unwrap();
    }

    #[test]
    fn test_filename_prefilter() {
        let now = Utc::now().trunc_subsecs(0);
        let cursor = OffsetRecord::new(agent("worker"), now);

        assert!(may_be_pending(None, now - ChronoDuration::days(400)));
        assert!(may_be_pending(Some(&cursor), now));
        assert!(may_be_pending(Some(&cursor), now - ChronoDuration::hours(23)));
        assert!(!may_be_pending(Some(&cursor), now - ChronoDuration::hours(25)));
    }

    #[tokio::test]
    async fn test_delivered_files_not_reopened() {
        let temp = TempDir::new().unwrap();
        let config = Arc::new(test_config(temp.path()));
        let store = MessageStore::from_config(&config);
        send(&store, "worker", "first");

        let (tx, mut rx) = mpsc::unbounded_channel();
        let consumer = LogConsumer::new(agent("worker"), config.clone(), Arc::new(tx));
        consumer.start().await.unwrap();
        assert_eq!(recv(&mut rx).await.id(), "first");

        // Old filename, fresh frontmatter: only opening the file would make it pending
        let stamp = Utc::now().trunc_subsecs(0) - ChronoDuration::days(3);
        let draft = MessageDraft::try_new("core", "worker", "task", "stale", "x").unwrap();
        let name = MessageStore::build_filename(&draft, stamp).unwrap();
        let fm = draft.frontmatter(Utc::now() + ChronoDuration::hours(1));
        fs::write(
            config.messages_dir().join(&name),
            crate::bus::message::format_message(&fm, &draft.body).unwrap(),
        )
        .unwrap();

        sleep(Duration::from_millis(250)).await;
        assert!(rx.try_recv().is_err());
        consumer.stop().await.unwrap();
    }

    #[test]
    fn test_latest_baseline_covers_current_second() {
        let temp = TempDir::new().unwrap();
        let config = test_config(temp.path());
        let store = MessageStore::from_config(&config);
        let path = store
            .write(&MessageDraft::try_new("core", "worker", "task", "same", "x").unwrap())
            .unwrap();
        let message = store.read(&path).unwrap();

        let now = message.timestamp() + ChronoDuration::milliseconds(300);
        let record = latest_baseline(&agent("worker"), &config.messages_dir(), now);
        assert_eq!(record.last_processed_timestamp, message.timestamp());
        assert!(!record.is_pending(message.timestamp(), message.file_name()));

        // Missing directory gives a bare baseline
        let empty = latest_baseline(&agent("worker"), &temp.path().join("none"), now);
        assert!(empty.delivered_at_timestamp.is_empty());
    }

    #[tokio::test]
    async fn test_messages_path_must_be_a_directory() {
        let temp = TempDir::new().unwrap();
        let config = Arc::new(test_config(temp.path()));
        fs::write(config.messages_dir(), "oops").unwrap();

        let (tx, _rx) = mpsc::unbounded_channel();
        let consumer = LogConsumer::new(agent("worker"), config, Arc::new(tx));
        assert!(matches!(
            consumer.start().await,
            Err(MeshBusError::Consumer(_))
        ));
        assert_eq!(consumer.status().state, ConsumerState::Stopped);
    }
}
