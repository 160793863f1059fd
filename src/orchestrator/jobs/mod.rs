use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::storage::JobRecord;
use crate::wire::Packet;

/// Caller-chosen (or broker-generated) job identity inside one function.
#[derive(Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UniqueId(Vec<u8>);

impl UniqueId {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|byte| format!("{byte:02x}")).collect()
    }

    /// Inverse of [`UniqueId::to_hex`]. `None` for odd lengths or non-hex digits.
    pub fn from_hex(hex: &str) -> Option<Self> {
        if hex.len() % 2 != 0 {
            return None;
        }
        let bytes = (0..hex.len())
            .step_by(2)
            .map(|index| u8::from_str_radix(hex.get(index..index + 2)?, 16).ok())
            .collect::<Option<Vec<u8>>>()?;
        Some(Self(bytes))
    }
}

impl From<&str> for UniqueId {
    fn from(value: &str) -> Self {
        Self(value.as_bytes().to_vec())
    }
}

impl From<String> for UniqueId {
    fn from(value: String) -> Self {
        Self(value.into_bytes())
    }
}

impl From<Vec<u8>> for UniqueId {
    fn from(value: Vec<u8>) -> Self {
        Self(value)
    }
}

impl fmt::Display for UniqueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for UniqueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UniqueId({self})")
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    High,
    Normal,
    Low,
}

impl JobPriority {
    pub const ALL: [JobPriority; 3] = [Self::High, Self::Normal, Self::Low];

    pub fn tier(self) -> usize {
        match self {
            Self::High => 0,
            Self::Normal => 1,
            Self::Low => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Working,
    Complete,
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Working => "working",
            Self::Complete => "complete",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a job left the broker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobOutcome {
    Completed(Vec<u8>),
    Cancelled,
}

impl JobOutcome {
    pub fn packet_for(&self, handle: &str) -> Packet {
        match self {
            Self::Completed(data) => Packet::WorkComplete {
                handle: handle.to_owned(),
                data: data.clone(),
            },
            Self::Cancelled => Packet::WorkFail {
                handle: handle.to_owned(),
            },
        }
    }
}

/// A connected client or worker as seen by the job engine.
pub trait Session: Send + Sync {
    fn session_id(&self) -> Uuid;

    /// Delivery failures are the session's concern; the engine never retries.
    fn send_packet(&self, packet: Packet);

    /// Tells an idle worker that one of its functions may have gained work.
    fn wake(&self) {
        self.send_packet(Packet::Noop);
    }

    /// Drops the session's claim on a job it is working. Returns `false` when the
    /// session no longer tracks the handle.
    fn release_job(&self, handle: &str) -> bool;
}

#[derive(Clone, Debug)]
pub struct NewJob {
    pub unique_id: UniqueId,
    pub payload: Vec<u8>,
    pub priority: JobPriority,
    pub background: bool,
}

impl NewJob {
    pub fn foreground(unique_id: impl Into<UniqueId>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            unique_id: unique_id.into(),
            payload: payload.into(),
            priority: JobPriority::Normal,
            background: false,
        }
    }

    pub fn background(unique_id: impl Into<UniqueId>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            background: true,
            ..Self::foreground(unique_id, payload)
        }
    }

    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }
}

struct JobRuntime {
    state: JobState,
    creator: Option<Weak<dyn Session>>,
    listeners: Vec<Arc<dyn Session>>,
    assigned_worker: Option<Arc<dyn Session>>,
    progress: Option<(u32, u32)>,
}

pub struct Job {
    unique_id: UniqueId,
    handle: String,
    function: String,
    payload: Vec<u8>,
    priority: JobPriority,
    background: bool,
    created_at: DateTime<Utc>,
    runtime: Mutex<JobRuntime>,
}

impl Job {
    pub(crate) fn new(
        function: &str,
        handle: String,
        unique_id: UniqueId,
        request: NewJob,
        creator: &Arc<dyn Session>,
    ) -> Self {
        let listeners = if request.background {
            Vec::new()
        } else {
            vec![Arc::clone(creator)]
        };

        Self {
            unique_id,
            handle,
            function: function.to_owned(),
            payload: request.payload,
            priority: request.priority,
            background: request.background,
            created_at: Utc::now(),
            runtime: Mutex::new(JobRuntime {
                state: JobState::Queued,
                creator: Some(Arc::downgrade(creator)),
                listeners,
                assigned_worker: None,
                progress: None,
            }),
        }
    }

    /// Rebuilds a persisted background job. It has no creator and no listeners.
    pub(crate) fn restore(handle: String, unique_id: UniqueId, record: JobRecord) -> Self {
        Self {
            unique_id,
            handle,
            function: record.function,
            payload: record.payload,
            priority: record.priority,
            background: true,
            created_at: record.created_at,
            runtime: Mutex::new(JobRuntime {
                state: JobState::Queued,
                creator: None,
                listeners: Vec::new(),
                assigned_worker: None,
                progress: None,
            }),
        }
    }

    pub fn unique_id(&self) -> &UniqueId {
        &self.unique_id
    }

    pub fn handle(&self) -> &str {
        &self.handle
    }

    pub fn function(&self) -> &str {
        &self.function
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn priority(&self) -> JobPriority {
        self.priority
    }

    pub fn is_background(&self) -> bool {
        self.background
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn state(&self) -> JobState {
        self.runtime().state
    }

    pub fn creator(&self) -> Option<Arc<dyn Session>> {
        self.runtime().creator.as_ref().and_then(Weak::upgrade)
    }

    pub fn listeners(&self) -> Vec<Arc<dyn Session>> {
        self.runtime().listeners.clone()
    }

    pub fn listener_count(&self) -> usize {
        self.runtime().listeners.len()
    }

    pub fn assigned_worker(&self) -> Option<Arc<dyn Session>> {
        self.runtime().assigned_worker.clone()
    }

    pub fn progress(&self) -> Option<(u32, u32)> {
        self.runtime().progress
    }

    pub fn created_packet(&self) -> Packet {
        Packet::JobCreated {
            handle: self.handle.clone(),
            unique_id: self.unique_id.clone(),
        }
    }

    pub fn to_record(&self) -> JobRecord {
        JobRecord {
            function: self.function.clone(),
            unique_id: self.unique_id.to_hex(),
            handle: self.handle.clone(),
            payload: self.payload.clone(),
            priority: self.priority,
            created_at: self.created_at,
        }
    }

    /// Adds `session` as a listener of a live job. Returns `false` once the job is complete.
    pub(crate) fn join(&self, session: &Arc<dyn Session>, background: bool) -> bool {
        let mut runtime = self.runtime();
        if runtime.state == JobState::Complete {
            return false;
        }
        if !background {
            let session_id = session.session_id();
            if !runtime
                .listeners
                .iter()
                .any(|listener| listener.session_id() == session_id)
            {
                runtime.listeners.push(Arc::clone(session));
            }
        }
        true
    }

    pub(crate) fn remove_listener(&self, session_id: Uuid) -> bool {
        let mut runtime = self.runtime();
        let before = runtime.listeners.len();
        runtime
            .listeners
            .retain(|listener| listener.session_id() != session_id);
        runtime.listeners.len() != before
    }

    pub(crate) fn record_progress(&self, numerator: u32, denominator: u32) {
        self.runtime().progress = Some((numerator, denominator));
    }

    // QUEUED -> WORKING
    pub(crate) fn begin_work(&self, worker: Arc<dyn Session>) {
        let mut runtime = self.runtime();
        assert!(
            runtime.state == JobState::Queued,
            "job {} cannot start working from state {}",
            self.handle,
            runtime.state
        );
        runtime.state = JobState::Working;
        runtime.assigned_worker = Some(worker);
    }

    // WORKING -> QUEUED; a queued job stays where it is
    pub(crate) fn return_to_queue(&self) -> bool {
        let mut runtime = self.runtime();
        match runtime.state {
            JobState::Queued => false,
            JobState::Working => {
                runtime.state = JobState::Queued;
                runtime.assigned_worker = None;
                true
            }
            JobState::Complete => {
                panic!("job {} cannot be requeued after completion", self.handle)
            }
        }
    }

    // QUEUED | WORKING -> COMPLETE; yields the previous state and the listeners to notify
    pub(crate) fn finish(&self) -> (JobState, Vec<Arc<dyn Session>>) {
        let mut runtime = self.runtime();
        let previous = runtime.state;
        assert!(
            previous != JobState::Complete,
            "job {} completed twice",
            self.handle
        );
        runtime.state = JobState::Complete;
        runtime.assigned_worker = None;
        runtime.creator = None;
        (previous, std::mem::take(&mut runtime.listeners))
    }

    fn runtime(&self) -> std::sync::MutexGuard<'_, JobRuntime> {
        self.runtime.lock().expect("job runtime lock poisoned")
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("handle", &self.handle)
            .field("function", &self.function)
            .field("unique_id", &self.unique_id)
            .field("priority", &self.priority)
            .field("background", &self.background)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::orchestrator::jobs::Session;
    use crate::test_support::RecordingSession;

    use super::{Job, JobPriority, JobState, NewJob, UniqueId};

    fn queued_job(creator: &Arc<dyn Session>, request: NewJob) -> Job {
        let unique_id = request.unique_id.clone();
        Job::new("resize", "H:test:1".to_owned(), unique_id, request, creator)
    }

    #[test]
    fn foreground_job_starts_queued_with_creator_listening() {
        let creator: Arc<dyn Session> = RecordingSession::new();
        let job = queued_job(&creator, NewJob::foreground("u1", b"img".to_vec()));

        assert_eq!(job.state(), JobState::Queued);
        assert_eq!(job.listener_count(), 1);
        assert_eq!(job.priority(), JobPriority::Normal);
        assert!(job.creator().is_some());
        assert!(job.assigned_worker().is_none());
        assert_eq!(job.payload(), b"img");
    }

    #[test]
    fn background_job_has_no_listeners() {
        let creator: Arc<dyn Session> = RecordingSession::new();
        let job = queued_job(&creator, NewJob::background("u2", Vec::new()));

        assert!(job.is_background());
        assert_eq!(job.listener_count(), 0);

        let other: Arc<dyn Session> = RecordingSession::new();
        assert!(job.join(&other, true));
        assert_eq!(job.listener_count(), 0);
    }

    #[test]
    fn join_deduplicates_listeners_and_refuses_completed_jobs() {
        let creator: Arc<dyn Session> = RecordingSession::new();
        let job = queued_job(&creator, NewJob::foreground("u3", Vec::new()));

        assert!(job.join(&creator, false));
        assert_eq!(job.listener_count(), 1);

        let other: Arc<dyn Session> = RecordingSession::new();
        assert!(job.join(&other, false));
        assert_eq!(job.listener_count(), 2);
        assert!(job.remove_listener(other.session_id()));
        assert!(!job.remove_listener(other.session_id()));

        let (previous, listeners) = job.finish();
        assert_eq!(previous, JobState::Queued);
        assert_eq!(listeners.len(), 1);
        assert!(!job.join(&other, false));
    }

    #[test]
    fn working_cycle_binds_and_clears_worker() {
        let creator: Arc<dyn Session> = RecordingSession::new();
        let worker: Arc<dyn Session> = RecordingSession::new();
        let job = queued_job(&creator, NewJob::foreground("u4", Vec::new()));

        job.begin_work(Arc::clone(&worker));
        assert_eq!(job.state(), JobState::Working);
        assert_eq!(
            job.assigned_worker().map(|w| w.session_id()),
            Some(worker.session_id())
        );

        assert!(job.return_to_queue());
        assert_eq!(job.state(), JobState::Queued);
        assert!(job.assigned_worker().is_none());
        assert!(!job.return_to_queue());
    }

    #[test]
    #[should_panic(expected = "cannot start working from state working")]
    fn working_to_working_is_an_invariant_violation() {
        let creator: Arc<dyn Session> = RecordingSession::new();
        let job = queued_job(&creator, NewJob::foreground("u5", Vec::new()));
        job.begin_work(Arc::clone(&creator));
        job.begin_work(creator);
    }

    #[test]
    #[should_panic(expected = "completed twice")]
    fn completing_twice_is_an_invariant_violation() {
        let creator: Arc<dyn Session> = RecordingSession::new();
        let job = queued_job(&creator, NewJob::foreground("u6", Vec::new()));
        let _ = job.finish();
        let _ = job.finish();
    }

    #[test]
    #[should_panic(expected = "cannot be requeued after completion")]
    fn requeue_after_completion_is_an_invariant_violation() {
        let creator: Arc<dyn Session> = RecordingSession::new();
        let job = queued_job(&creator, NewJob::foreground("u7", Vec::new()));
        let _ = job.finish();
        job.return_to_queue();
    }

    #[test]
    fn record_uses_hex_unique_id() {
        let creator: Arc<dyn Session> = RecordingSession::new();
        let job = queued_job(
            &creator,
            NewJob::background(UniqueId::new(vec![0x00, 0xab]), b"x".to_vec())
                .with_priority(JobPriority::Low),
        );

        let record = job.to_record();
        assert_eq!(record.unique_id, "00ab");
        assert_eq!(record.function, "resize");
        assert_eq!(record.priority, JobPriority::Low);
        assert_eq!(record.handle, "H:test:1");
    }

    #[test]
    fn hex_unique_ids_decode_back_and_reject_garbage() {
        assert_eq!(
            UniqueId::from_hex("00ab"),
            Some(UniqueId::new(vec![0x00, 0xab]))
        );
        assert_eq!(UniqueId::from_hex(""), Some(UniqueId::empty()));
        assert_eq!(UniqueId::from_hex("abc"), None);
        assert_eq!(UniqueId::from_hex("zz"), None);
    }

    #[test]
    fn restored_job_is_queued_background_work_without_listeners() {
        let creator: Arc<dyn Session> = RecordingSession::new();
        let original = queued_job(
            &creator,
            NewJob::background("u8", b"thumb".to_vec()).with_priority(JobPriority::High),
        );
        let record = original.to_record();

        let restored = Job::restore("H:test:9".to_owned(), UniqueId::from("u8"), record);
        assert_eq!(restored.state(), JobState::Queued);
        assert!(restored.is_background());
        assert!(restored.creator().is_none());
        assert_eq!(restored.listener_count(), 0);
        assert_eq!(restored.priority(), JobPriority::High);
        assert_eq!(restored.payload(), b"thumb");
        assert_eq!(restored.created_at(), original.created_at());
        assert_eq!(restored.handle(), "H:test:9");
    }
}
