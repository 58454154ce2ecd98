//! The per-(partition, duplication-id) state machine.
//!
//! Tracks `kimberlite-vsr`'s functional-core/imperative-shell split: a
//! single `step` match owns every transition of the table below so the
//! whole lifecycle is auditable from one place, the way
//! `kimberlite-vsr/src/replica/mod.rs` centralizes its transitions in one
//! `ReplicaEvent` match even though (unlike the VSR replica) log reads and
//! backlog ships here are unavoidably real I/O, not pure functions.
//!
//! ```text
//! Paused --start()--> LoadingFile --found file--> Reading
//! Reading --batch non-empty--> Shipping --ok--> Reading
//! Reading --EOF, rotation fails--> Reading (delayed)
//! any --pause()--> Paused
//! ```

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::batch::MutationBatch;
use crate::config::DuplicationOptions;
use crate::error::{DuplicationError, Result};
use crate::instrumentation::DuplicationMetrics;
use crate::log_reader::{self, LogReader};
use crate::types::{Decree, DupId, DuplicationStatus, Gpid, Message, ReplicaRole};
use crate::view::DuplicationView;

/// Capability surface the duplicator needs from its owning replica.
///
/// A weak back-reference plus this narrow trait, not an ownership edge —
/// the duplicator never outlives the replica that spawned it and never
/// reaches back into anything but these four queries.
pub trait ReplicaHandle: Send + Sync {
    fn gpid(&self) -> Gpid;
    fn status(&self) -> ReplicaRole;
    /// The log-retention floor: decrees at or below this may already have
    /// been garbage collected from the private log.
    fn last_durable_decree(&self) -> Decree;
    /// The largest decree actually committed to disk so far.
    fn max_commit_on_disk(&self) -> Decree;
    fn private_log_dir(&self) -> &Path;
}

/// Sink for ordered wire messages on the remote cluster.
///
/// Expected to be idempotent with respect to `(gpid, decree)` — on error
/// the duplicator retries with the exact same vector.
pub trait BacklogHandler: Send + Sync {
    fn duplicate(
        &self,
        messages: Vec<Message>,
    ) -> impl std::future::Future<Output = Result<()>> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicatorState {
    Paused,
    LoadingFile,
    Reading,
    Shipping,
}

#[derive(Debug, Clone)]
struct LogCursor {
    index: u32,
    offset: u64,
    from_start: bool,
}

/// Read-only snapshot for introspection callers (a command-manager style
/// dump, not a process-wide registration — see design notes).
#[derive(Debug, Clone)]
pub struct DuplicatorSnapshot {
    pub dupid: DupId,
    pub state: DuplicatorState,
    pub last_decree: Decree,
    pub confirmed_decree: Decree,
}

/// One running duplicator. Owns its batch and cursor exclusively; shares
/// its [`DuplicationView`] with the [`crate::host::DuplicationHost`].
pub struct Duplicator<R, B> {
    dupid: DupId,
    remote_address: String,
    replica: Arc<R>,
    backlog: Arc<B>,
    options: Arc<DuplicationOptions>,
    view: DuplicationView,
    state: DuplicatorState,
    cursor: Option<LogCursor>,
    reader: Option<LogReader>,
    batch: MutationBatch,
    paused: Arc<AtomicBool>,
    resume: Arc<Notify>,
    metrics: Arc<DuplicationMetrics>,
}

/// A handle to a spawned duplicator task: pause/resume it, inspect its
/// view, or shut it down.
pub struct DuplicatorHandle {
    dupid: DupId,
    view: DuplicationView,
    paused: Arc<AtomicBool>,
    resume: Arc<Notify>,
    metrics: Arc<DuplicationMetrics>,
    join: JoinHandle<()>,
}

impl DuplicatorHandle {
    pub fn dupid(&self) -> DupId {
        self.dupid
    }

    pub fn view(&self) -> &DuplicationView {
        &self.view
    }

    pub fn metrics(&self) -> &DuplicationMetrics {
        &self.metrics
    }

    /// Requests the `Paused` state. The next loop iteration observes the
    /// flag and stops re-entering the state machine without forcibly
    /// cancelling any in-flight ship.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    /// Resumes from `Paused`, waking the task immediately rather than
    /// waiting for its next poll.
    pub fn start(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.resume.notify_one();
    }

    /// Tears down the task. The loop has no natural exit point of its
    /// own — it only ever moves between `Paused` and the active states —
    /// so shutdown is a hard cancellation rather than a cooperative one,
    /// the Rust analogue of `~mutation_duplicator()` dropping its pending
    /// work instead of draining it.
    pub async fn shutdown(self) {
        self.join.abort();
        let _ = self.join.await;
    }
}

impl<R, B> Duplicator<R, B>
where
    R: ReplicaHandle + 'static,
    B: BacklogHandler + 'static,
{
    /// Validates the log-truncation invariant and constructs a duplicator
    /// starting in `Paused` with `last_decree = confirmed_decree`.
    ///
    /// # Errors
    ///
    /// Returns [`DuplicationError::TruncatedPastBarrier`] if the replica's
    /// log-retention floor has already advanced past `confirmed_decree` —
    /// the log entries this duplicator would need to resume from have
    /// been garbage collected.
    pub fn new(
        dupid: DupId,
        remote_address: String,
        replica: Arc<R>,
        backlog: Arc<B>,
        options: Arc<DuplicationOptions>,
        confirmed_decree: Decree,
    ) -> Result<Self> {
        let last_durable_decree = replica.last_durable_decree();
        if last_durable_decree > confirmed_decree {
            tracing::error!(
                gpid = %replica.gpid(),
                dupid = %dupid,
                %last_durable_decree,
                %confirmed_decree,
                "private log already truncated past confirmed_decree"
            );
            return Err(DuplicationError::TruncatedPastBarrier {
                confirmed_decree: confirmed_decree.get(),
                last_durable_decree: last_durable_decree.get(),
            });
        }

        let view = DuplicationView::new(dupid, confirmed_decree, DuplicationStatus::Init);
        let capacity = options.prepare_list_capacity;

        Ok(Self {
            dupid,
            remote_address,
            replica,
            backlog,
            options,
            view: view.clone(),
            state: DuplicatorState::Paused,
            cursor: None,
            reader: None,
            batch: MutationBatch::new(confirmed_decree.next(), capacity),
            paused: Arc::new(AtomicBool::new(true)),
            resume: Arc::new(Notify::new()),
            metrics: Arc::new(DuplicationMetrics::new()),
        })
    }

    pub fn metrics(&self) -> &DuplicationMetrics {
        &self.metrics
    }

    pub fn view(&self) -> &DuplicationView {
        &self.view
    }

    pub fn remote_address(&self) -> &str {
        &self.remote_address
    }

    pub fn snapshot(&self) -> DuplicatorSnapshot {
        let (last_decree, confirmed_decree, _) = self.view.snapshot();
        DuplicatorSnapshot {
            dupid: self.dupid,
            state: self.state,
            last_decree,
            confirmed_decree,
        }
    }

    /// Spawns the cooperative task loop and returns a handle to control
    /// it. The duplicator starts paused; call [`DuplicatorHandle::start`]
    /// to kick it off.
    pub fn spawn(mut self) -> DuplicatorHandle {
        let dupid = self.dupid;
        let view = self.view.clone();
        let paused = Arc::clone(&self.paused);
        let resume = Arc::clone(&self.resume);
        let metrics = Arc::clone(&self.metrics);

        let join = tokio::spawn(async move {
            loop {
                if paused.load(Ordering::SeqCst) {
                    self.state = DuplicatorState::Paused;
                    resume.notified().await;
                    continue;
                }

                let delay = self.step().await;
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
            }
        });

        DuplicatorHandle { dupid, view, paused, resume, metrics, join }
    }

    /// Runs exactly one transition of the table in the module docs,
    /// returning the delay (if any) to wait before the next one.
    async fn step(&mut self) -> Option<std::time::Duration> {
        match self.state {
            DuplicatorState::Paused => {
                tracing::debug!(dupid = %self.dupid, "starting duplication");
                // Resuming from a pause must not re-scan from the oldest
                // log file when a reader is already positioned partway
                // through the stream — that would re-feed already-shipped
                // decrees into the batch and the prepare-list would reject
                // them as stale.
                self.state = if self.reader.is_some() {
                    DuplicatorState::Reading
                } else {
                    DuplicatorState::LoadingFile
                };
                None
            }
            DuplicatorState::LoadingFile => self.step_loading_file().await,
            DuplicatorState::Reading => self.step_reading().await,
            DuplicatorState::Shipping => self.step_shipping().await,
        }
    }

    async fn step_loading_file(&mut self) -> Option<std::time::Duration> {
        let files = match log_reader::list_log_files(self.replica.private_log_dir()) {
            Ok(files) => files,
            Err(e) => {
                tracing::error!(dupid = %self.dupid, error = %e, "failed to list private log directory");
                panic!("duplicator {} cannot list log directory: {e}", self.dupid);
            }
        };

        let Some(oldest) = log_reader::find_log_file_with_min_index(&files) else {
            tracing::debug!(dupid = %self.dupid, "no log files yet, waiting");
            return Some(self.options.rotation_probe_delay());
        };

        match LogReader::open(&oldest.path, 0) {
            Ok(reader) => {
                tracing::debug!(dupid = %self.dupid, index = oldest.index, "opened oldest private log file");
                self.reader = Some(reader);
                self.cursor = Some(LogCursor { index: oldest.index, offset: 0, from_start: true });
                self.state = DuplicatorState::Reading;
                None
            }
            Err(e) => {
                tracing::error!(dupid = %self.dupid, error = %e, "failed to open private log file");
                panic!("duplicator {} cannot open log file {:?}: {e}", self.dupid, oldest.path);
            }
        }
    }

    async fn step_reading(&mut self) -> Option<std::time::Duration> {
        let max_commit_on_disk = self.replica.max_commit_on_disk();

        if self.batch.empty() && max_commit_on_disk <= self.batch.last_decree() {
            return Some(self.options.idle_poll_delay());
        }

        let mut reader = self.reader.take().expect("Reading state always has an open reader");
        let batch = &mut self.batch;
        let mut read_count = 0u64;
        let result = reader.replay_block(|mu| {
            read_count += 1;
            batch.add(mu)
        });
        self.reader = Some(reader);
        self.metrics.record_mutations_read(read_count);

        match result {
            Ok(()) => unreachable!("replay_block only returns on error or forever"),
            Err(DuplicationError::Eof) => self.handle_eof().await,
            Err(DuplicationError::Corrupt(msg)) => {
                self.metrics.record_corrupt_block();
                tracing::warn!(dupid = %self.dupid, error = %msg, "corrupt or truncated block, waiting");
                Some(self.options.rotation_probe_delay())
            }
            Err(e) if e.is_retriable() => {
                tracing::warn!(dupid = %self.dupid, error = %e, "retriable read failure, waiting");
                Some(self.options.rotation_probe_delay())
            }
            Err(e) => {
                tracing::error!(dupid = %self.dupid, error = %e, "fatal replay failure");
                panic!("duplicator {} hit a fatal log replay error: {e}", self.dupid);
            }
        }
    }

    async fn handle_eof(&mut self) -> Option<std::time::Duration> {
        if !self.batch.empty() {
            self.state = DuplicatorState::Shipping;
            return None;
        }

        let cursor = self.cursor.as_ref().expect("Reading state always has a cursor");
        let current_end_offset = self.reader.as_ref().unwrap().cursor_offset();
        let candidate_path = self
            .replica
            .private_log_dir()
            .join(log_reader::format_log_filename(cursor.index + 1, current_end_offset));

        if candidate_path.exists() {
            match LogReader::open(&candidate_path, 0) {
                Ok(reader) => {
                    tracing::debug!(dupid = %self.dupid, next_index = cursor.index + 1, "rotated to next log file");
                    self.metrics.record_rotation();
                    self.reader = Some(reader);
                    self.cursor = Some(LogCursor {
                        index: cursor.index + 1,
                        offset: 0,
                        from_start: true,
                    });
                    return None;
                }
                Err(e) => {
                    tracing::warn!(dupid = %self.dupid, error = %e, "rotation candidate failed to open, waiting");
                }
            }
        }

        Some(self.options.rotation_probe_delay())
    }

    async fn step_shipping(&mut self) -> Option<std::time::Duration> {
        let messages = self.batch.drain();
        let message_count = messages.len() as u64;
        self.metrics.record_ship_attempt();

        match self.backlog.duplicate(messages.clone()).await {
            Ok(()) => {
                let shipped_decree = self.batch.last_decree();
                self.view.advance_last_decree(shipped_decree);
                self.metrics.record_ship_success(message_count);
                tracing::debug!(dupid = %self.dupid, last_decree = %shipped_decree, "shipped batch");
                self.state = DuplicatorState::Reading;
                Some(self.options.inter_batch_delay())
            }
            Err(e) => {
                self.metrics.record_ship_failure();
                tracing::warn!(dupid = %self.dupid, error = %e, "backlog ship failed, retrying same batch");
                // Put the drained messages back so the retry ships the
                // exact same vector (at-least-once, contiguous prefix).
                self.batch.requeue(messages);
                Some(self.options.ship_retry_delay())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Ballot, MutationUpdate};
    use bytes::Bytes;
    use std::path::PathBuf;
    use std::sync::Mutex as StdMutex;

    struct FakeReplica {
        gpid: Gpid,
        last_durable_decree: Decree,
        max_commit_on_disk: Decree,
        dir: PathBuf,
    }

    impl ReplicaHandle for FakeReplica {
        fn gpid(&self) -> Gpid {
            self.gpid
        }
        fn status(&self) -> ReplicaRole {
            ReplicaRole::Primary
        }
        fn last_durable_decree(&self) -> Decree {
            self.last_durable_decree
        }
        fn max_commit_on_disk(&self) -> Decree {
            self.max_commit_on_disk
        }
        fn private_log_dir(&self) -> &Path {
            &self.dir
        }
    }

    struct RecordingBacklog {
        received: StdMutex<Vec<Vec<Message>>>,
    }

    impl BacklogHandler for RecordingBacklog {
        async fn duplicate(&self, messages: Vec<Message>) -> Result<()> {
            self.received.lock().unwrap().push(messages);
            Ok(())
        }
    }

    fn message(tag: u8) -> Message {
        Message { opcode: 1, serialization_tag: tag, payload: Bytes::new() }
    }

    #[test]
    fn construction_rejects_log_truncated_past_confirmed_decree() {
        let dir = tempfile::tempdir().unwrap();
        let replica = Arc::new(FakeReplica {
            gpid: Gpid::new(1, 0),
            last_durable_decree: Decree::from(200),
            max_commit_on_disk: Decree::from(200),
            dir: dir.path().to_path_buf(),
        });
        let backlog = Arc::new(RecordingBacklog { received: StdMutex::new(Vec::new()) });
        let options = Arc::new(DuplicationOptions::default());

        let err = Duplicator::new(
            DupId::new(1),
            "remote:1".into(),
            replica,
            backlog,
            options,
            Decree::from(100),
        )
        .unwrap_err();

        assert!(matches!(err, DuplicationError::TruncatedPastBarrier { .. }));
    }

    #[test]
    fn construction_succeeds_and_starts_paused_with_last_decree_at_confirmed() {
        let dir = tempfile::tempdir().unwrap();
        let replica = Arc::new(FakeReplica {
            gpid: Gpid::new(1, 0),
            last_durable_decree: Decree::from(90),
            max_commit_on_disk: Decree::from(90),
            dir: dir.path().to_path_buf(),
        });
        let backlog = Arc::new(RecordingBacklog { received: StdMutex::new(Vec::new()) });
        let options = Arc::new(DuplicationOptions::default());

        let dup = Duplicator::new(
            DupId::new(1),
            "remote:1".into(),
            replica,
            backlog,
            options,
            Decree::from(100),
        )
        .unwrap();

        assert_eq!(dup.state, DuplicatorState::Paused);
        assert_eq!(dup.view().last_decree(), Decree::from(100));
        assert_eq!(dup.view().confirmed_decree(), Decree::from(100));
    }

    #[tokio::test]
    async fn pause_and_start_toggle_the_handle_flag() {
        let dir = tempfile::tempdir().unwrap();
        let replica = Arc::new(FakeReplica {
            gpid: Gpid::new(1, 0),
            last_durable_decree: Decree::from(0),
            max_commit_on_disk: Decree::from(0),
            dir: dir.path().to_path_buf(),
        });
        let backlog = Arc::new(RecordingBacklog { received: StdMutex::new(Vec::new()) });
        let options = Arc::new(DuplicationOptions::default());

        let dup = Duplicator::new(
            DupId::new(9),
            "remote:9".into(),
            replica,
            backlog,
            options,
            Decree::from(0),
        )
        .unwrap();

        let handle = dup.spawn();
        assert!(handle.view().status() == DuplicationStatus::Init);
        handle.start();
        handle.pause();
        handle.shutdown().await;
    }

    #[test]
    fn message_helper_builds_a_tagged_empty_payload() {
        let m = message(3);
        assert_eq!(m.serialization_tag, 3);
    }
}
