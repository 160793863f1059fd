mod registry;

pub use registry::{FunctionHandle, FunctionRegistry};

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::json;
use uuid::Uuid;

use crate::context::BrokerContext;
use crate::logging::LogLevel;
use crate::orchestrator::jobs::{Job, JobOutcome, JobState, NewJob, Session, UniqueId};
use crate::orchestrator::queues::PriorityJobQueue;
use crate::storage::JobRecord;
use crate::sync::{KeyedGuard, KeyedLock};
use crate::wire::{Packet, QUEUE_FULL_CODE};

const LOG_CONTEXT: &str = "orchestrator::functions";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CreateOutcome {
    Created { handle: String, unique_id: UniqueId },
    Joined { handle: String, unique_id: UniqueId },
    QueueFull,
}

impl CreateOutcome {
    pub fn handle(&self) -> Option<&str> {
        match self {
            Self::Created { handle, .. } | Self::Joined { handle, .. } => Some(handle),
            Self::QueueFull => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CancelOutcome {
    NotFound,
    Cancelled,
    /// The assigned worker is already reporting on the job.
    Busy,
}

#[derive(Clone, Debug)]
pub struct JobAssignment {
    pub job: Arc<Job>,
    pub unique_id: Option<UniqueId>,
}

impl JobAssignment {
    pub fn handle(&self) -> &str {
        self.job.handle()
    }

    pub fn to_packet(&self) -> Packet {
        match &self.unique_id {
            Some(unique_id) => Packet::JobAssignUniq {
                handle: self.job.handle().to_owned(),
                function: self.job.function().to_owned(),
                unique_id: unique_id.clone(),
                payload: self.job.payload().to_vec(),
            },
            None => Packet::JobAssign {
                handle: self.job.handle().to_owned(),
                function: self.job.function().to_owned(),
                payload: self.job.payload().to_vec(),
            },
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FunctionStatus {
    pub name: String,
    pub total: usize,
    pub running: usize,
    pub idle_workers: usize,
}

impl fmt::Display for FunctionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{}\t{}\t{}\t{}",
            self.name, self.total, self.running, self.idle_workers
        )
    }
}

#[derive(Default)]
struct FunctionState {
    jobs: HashMap<UniqueId, Arc<Job>>,
    queue: PriorityJobQueue,
}

/// Job registry, priority queue and idle workers for one function name.
///
/// `state` is always locked before any job's runtime lock, and no packet is sent while
/// either is held.
pub struct Function {
    name: String,
    context: Arc<BrokerContext>,
    creation_lock: KeyedLock<UniqueId>,
    state: Mutex<FunctionState>,
    idle_workers: Mutex<HashMap<Uuid, Arc<dyn Session>>>,
    max_queue_depth: AtomicUsize,
    generated_ids: AtomicU64,
    holders: AtomicUsize,
}

impl Function {
    pub fn new(name: impl Into<String>, context: Arc<BrokerContext>) -> Self {
        let max_queue_depth = context.settings().default_max_queue_depth;
        Self {
            name: name.into(),
            context,
            creation_lock: KeyedLock::new(),
            state: Mutex::new(FunctionState::default()),
            idle_workers: Mutex::new(HashMap::new()),
            max_queue_depth: AtomicUsize::new(max_queue_depth),
            generated_ids: AtomicU64::new(0),
            holders: AtomicUsize::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Submits a job, or joins the live job with the same unique id.
    ///
    /// The creator receives `JOB_CREATED` before the job is queued, and the job is queued
    /// before idle workers are woken. Completion must not resubmit the same unique id from
    /// inside a notification delivered by this call; the key is still held.
    pub fn create_job(&self, request: NewJob, creator: &Arc<dyn Session>) -> CreateOutcome {
        let (unique_id, _guard) = if request.unique_id.is_empty() {
            self.reserve_generated_id()
        } else {
            let unique_id = request.unique_id.clone();
            let guard = self.creation_lock.acquire(unique_id.clone());
            (unique_id, guard)
        };

        let existing = self.state().jobs.get(&unique_id).cloned();
        if let Some(job) = existing {
            if job.join(creator, request.background) {
                creator.send_packet(job.created_packet());
                self.context.logger().debug(
                    Some(LOG_CONTEXT),
                    &format!("session joined job {} of '{}'", job.handle(), self.name),
                );
                return CreateOutcome::Joined {
                    handle: job.handle().to_owned(),
                    unique_id,
                };
            }
        }

        // Racy by nature: two creators for different ids may both pass the check.
        let max_queue_depth = self.max_queue_depth();
        if max_queue_depth > 0 && self.job_count() >= max_queue_depth {
            creator.send_packet(Packet::error(
                QUEUE_FULL_CODE,
                format!(
                    "function '{}' reached its max queue depth of {max_queue_depth}",
                    self.name
                ),
            ));
            self.context.logger().warn(
                Some(LOG_CONTEXT),
                &format!("rejected job for '{}': queue full", self.name),
            );
            return CreateOutcome::QueueFull;
        }

        let handle = self.context.next_job_handle();
        let job = Arc::new(Job::new(
            &self.name,
            handle.clone(),
            unique_id.clone(),
            request,
            creator,
        ));
        self.state()
            .jobs
            .insert(unique_id.clone(), Arc::clone(&job));

        if job.is_background() {
            self.persist(&job);
        }

        creator.send_packet(job.created_packet());

        {
            let mut state = self.state();
            let added = state.queue.add(Arc::clone(&job));
            assert!(added, "new job {} was already queued", job.handle());
        }

        if self.context.logger().is_enabled(LogLevel::Debug) {
            self.context.logger().log(
                LogLevel::Debug,
                Some(LOG_CONTEXT),
                "job created",
                Some(json!({
                    "function": self.name,
                    "handle": handle,
                    "priority": job.priority().as_str(),
                    "background": job.is_background(),
                })),
            );
        }

        self.wake_idle_workers();
        CreateOutcome::Created { handle, unique_id }
    }

    /// Queues a persisted background job under a fresh handle and rewrites its record.
    /// Returns `false` when the unique id is unreadable or already live.
    pub fn restore_job(&self, record: JobRecord) -> bool {
        let Some(unique_id) = UniqueId::from_hex(&record.unique_id) else {
            self.context.logger().warn(
                Some(LOG_CONTEXT),
                &format!(
                    "skipping persisted job of '{}' with malformed unique id '{}'",
                    self.name, record.unique_id
                ),
            );
            return false;
        };
        let _guard = self.creation_lock.acquire(unique_id.clone());

        let job = {
            let mut state = self.state();
            if state.jobs.contains_key(&unique_id) {
                return false;
            }
            let job = Arc::new(Job::restore(
                self.context.next_job_handle(),
                unique_id.clone(),
                record,
            ));
            state.jobs.insert(unique_id, Arc::clone(&job));
            let added = state.queue.add(Arc::clone(&job));
            assert!(added, "restored job {} was already queued", job.handle());
            job
        };

        self.persist(&job);
        self.wake_idle_workers();
        true
    }

    /// Hands the oldest highest-priority job to `worker`. Never blocks on an empty queue.
    pub fn grab_job(&self, worker: &Arc<dyn Session>) -> Option<JobAssignment> {
        let job = self.take_next(worker)?;
        Some(JobAssignment {
            job,
            unique_id: None,
        })
    }

    pub fn grab_job_unique_id(&self, worker: &Arc<dyn Session>) -> Option<JobAssignment> {
        let job = self.take_next(worker)?;
        let unique_id = job.unique_id().clone();
        Some(JobAssignment {
            job,
            unique_id: Some(unique_id),
        })
    }

    pub fn complete_job(&self, job: &Arc<Job>, data: Vec<u8>) {
        self.finish_job(job, JobOutcome::Completed(data));
    }

    /// A worker gave up on `job`; it goes back to the tail of its tier.
    pub fn fail_job(&self, job: &Arc<Job>) -> bool {
        self.context.logger().info(
            Some(LOG_CONTEXT),
            &format!("worker failed job {}; requeueing", job.handle()),
        );
        self.requeue_job(job)
    }

    /// Returns a WORKING job to the queue and wakes idle workers. A job that is already
    /// queued is left alone and `false` is returned.
    pub fn requeue_job(&self, job: &Arc<Job>) -> bool {
        {
            let mut state = self.state();
            if !job.return_to_queue() {
                return false;
            }
            let added = state.queue.add(Arc::clone(job));
            assert!(added, "requeued job {} was already queued", job.handle());
        }

        self.wake_idle_workers();
        true
    }

    /// Ends a job on behalf of an administrator. Listeners receive `WORK_FAIL`.
    pub fn cancel_job(&self, unique_id: &UniqueId) -> CancelOutcome {
        let _guard = self.creation_lock.acquire(unique_id.clone());

        let (job, worker) = {
            let mut state = self.state();
            let Some(job) = state.jobs.get(unique_id).cloned() else {
                return CancelOutcome::NotFound;
            };
            if job.state() == JobState::Queued {
                let (_, listeners) = job.finish();
                state.queue.remove(&job);
                state.jobs.remove(unique_id);
                drop(state);
                if job.is_background() {
                    self.forget(&job);
                }
                self.notify(&job, listeners, &JobOutcome::Cancelled);
                self.log_cancelled(&job);
                return CancelOutcome::Cancelled;
            }
            let worker = job.assigned_worker();
            (job, worker)
        };

        // The session that removes the handle from its working set owns the job's end.
        let released = worker.is_some_and(|worker| worker.release_job(job.handle()));
        if !released {
            return CancelOutcome::Busy;
        }

        self.finish_job(&job, JobOutcome::Cancelled);
        self.log_cancelled(&job);
        CancelOutcome::Cancelled
    }

    pub fn update_progress(&self, job: &Job, numerator: u32, denominator: u32) {
        job.record_progress(numerator, denominator);
        let packet = Packet::WorkStatus {
            handle: job.handle().to_owned(),
            numerator,
            denominator,
        };
        for listener in job.listeners() {
            listener.send_packet(packet.clone());
        }
    }

    pub fn forward_data(&self, job: &Job, data: Vec<u8>) {
        let packet = Packet::WorkData {
            handle: job.handle().to_owned(),
            data,
        };
        for listener in job.listeners() {
            listener.send_packet(packet.clone());
        }
    }

    pub fn add_idle_worker(&self, worker: &Arc<dyn Session>) {
        self.idle_workers()
            .insert(worker.session_id(), Arc::clone(worker));
    }

    pub fn remove_idle_worker(&self, session_id: Uuid) -> bool {
        self.idle_workers().remove(&session_id).is_some()
    }

    pub fn idle_worker_count(&self) -> usize {
        self.idle_workers().len()
    }

    pub fn set_max_queue_depth(&self, max_queue_depth: usize) {
        self.max_queue_depth
            .store(max_queue_depth, Ordering::Relaxed);
    }

    pub fn max_queue_depth(&self) -> usize {
        self.max_queue_depth.load(Ordering::Relaxed)
    }

    pub fn status(&self) -> FunctionStatus {
        let (total, queued) = {
            let state = self.state();
            (state.jobs.len(), state.queue.len())
        };
        FunctionStatus {
            name: self.name.clone(),
            total,
            running: total.saturating_sub(queued),
            idle_workers: self.idle_worker_count(),
        }
    }

    pub fn job_count(&self) -> usize {
        self.state().jobs.len()
    }

    pub fn queued_count(&self) -> usize {
        self.state().queue.len()
    }

    pub fn has_queued_jobs(&self) -> bool {
        !self.state().queue.is_empty()
    }

    pub fn get_job(&self, unique_id: &UniqueId) -> Option<Arc<Job>> {
        self.state().jobs.get(unique_id).cloned()
    }

    pub(crate) fn holders(&self) -> usize {
        self.holders.load(Ordering::Acquire)
    }

    pub(crate) fn retain(&self) {
        self.holders.fetch_add(1, Ordering::AcqRel);
    }

    /// Returns the holder count left after this release.
    pub(crate) fn release(&self) -> usize {
        self.holders.fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub(crate) fn is_evictable(&self) -> bool {
        self.job_count() == 0 && self.idle_worker_count() == 0
    }

    fn reserve_generated_id(&self) -> (UniqueId, KeyedGuard<'_, UniqueId>) {
        let prefix = &self.context.settings().generated_id_prefix;
        loop {
            let counter = self.generated_ids.fetch_add(1, Ordering::Relaxed) + 1;
            let unique_id = UniqueId::from(format!("{prefix}{counter}"));
            let guard = self.creation_lock.acquire(unique_id.clone());
            if !self.state().jobs.contains_key(&unique_id) {
                return (unique_id, guard);
            }
        }
    }

    fn take_next(&self, worker: &Arc<dyn Session>) -> Option<Arc<Job>> {
        let mut state = self.state();
        let job = state.queue.poll()?;
        job.begin_work(Arc::clone(worker));
        Some(job)
    }

    fn finish_job(&self, job: &Arc<Job>, outcome: JobOutcome) {
        let listeners = {
            let mut state = self.state();
            let (previous, listeners) = job.finish();
            if previous == JobState::Queued {
                let removed = state.queue.remove(job);
                assert!(removed, "queued job {} missing from queue", job.handle());
            }
            if state
                .jobs
                .get(job.unique_id())
                .is_some_and(|current| Arc::ptr_eq(current, job))
            {
                state.jobs.remove(job.unique_id());
            }
            listeners
        };

        if job.is_background() {
            self.forget(job);
        }
        self.notify(job, listeners, &outcome);
        self.context.logger().debug(
            Some(LOG_CONTEXT),
            &format!("job {} of '{}' finished", job.handle(), self.name),
        );
    }

    fn notify(&self, job: &Job, listeners: Vec<Arc<dyn Session>>, outcome: &JobOutcome) {
        let packet = outcome.packet_for(job.handle());
        for listener in listeners {
            listener.send_packet(packet.clone());
        }
    }

    fn wake_idle_workers(&self) {
        let idle: Vec<Arc<dyn Session>> = self.idle_workers().values().cloned().collect();
        for worker in idle {
            worker.wake();
        }
    }

    fn persist(&self, job: &Job) {
        let Some(persistence) = self.context.persistence() else {
            return;
        };
        if let Err(err) = persistence.write(&job.to_record()) {
            self.context.logger().warn(
                Some(LOG_CONTEXT),
                &format!("failed to persist background job {}: {err}", job.handle()),
            );
        }
    }

    fn forget(&self, job: &Job) {
        let Some(persistence) = self.context.persistence() else {
            return;
        };
        if let Err(err) = persistence.remove(&self.name, &job.unique_id().to_hex()) {
            self.context.logger().warn(
                Some(LOG_CONTEXT),
                &format!("failed to drop persisted job {}: {err}", job.handle()),
            );
        }
    }

    fn log_cancelled(&self, job: &Job) {
        self.context.logger().info(
            Some(LOG_CONTEXT),
            &format!("job {} of '{}' cancelled", job.handle(), self.name),
        );
    }

    fn state(&self) -> MutexGuard<'_, FunctionState> {
        self.state.lock().expect("function state lock poisoned")
    }

    fn idle_workers(&self) -> MutexGuard<'_, HashMap<Uuid, Arc<dyn Session>>> {
        self.idle_workers
            .lock()
            .expect("function idle worker lock poisoned")
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Function")
            .field("name", &self.name)
            .field("max_queue_depth", &self.max_queue_depth())
            .field("holders", &self.holders())
            .finish_non_exhaustive()
    }
}
