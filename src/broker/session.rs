use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::context::BrokerContext;
use crate::orchestrator::functions::{FunctionHandle, FunctionRegistry, JobAssignment};
use crate::orchestrator::jobs::{Job, JobState, Session};
use crate::transport::Connection;
use crate::wire::Packet;

const LOG_CONTEXT: &str = "broker::session";

/// Broker-side state of one connected client or worker.
pub struct ClientSession {
    session_id: Uuid,
    me: Weak<ClientSession>,
    connection: Arc<dyn Connection<ClientSession>>,
    connected_at: DateTime<Utc>,
    pub(super) context: Arc<BrokerContext>,
    pub(super) registry: FunctionRegistry,
    state: Mutex<SessionState>,
}

#[derive(Default)]
pub(super) struct SessionState {
    pub(super) closed: bool,
    pub(super) client_id: Option<String>,
    pub(super) abilities: HashMap<String, FunctionHandle>,
    pub(super) working: HashMap<String, WorkingJob>,
    pub(super) created: Vec<Weak<Job>>,
}

pub(super) struct WorkingJob {
    pub(super) function: FunctionHandle,
    pub(super) job: Arc<Job>,
}

impl ClientSession {
    pub(super) fn new(
        connection: Arc<dyn Connection<ClientSession>>,
        context: Arc<BrokerContext>,
        registry: FunctionRegistry,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            session_id: Uuid::new_v4(),
            me: me.clone(),
            connection,
            connected_at: Utc::now(),
            context,
            registry,
            state: Mutex::new(SessionState::default()),
        })
    }

    pub fn connection_id(&self) -> u64 {
        self.connection.id()
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn client_id(&self) -> Option<String> {
        self.state().client_id.clone()
    }

    pub fn abilities(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state().abilities.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn working_count(&self) -> usize {
        self.state().working.len()
    }

    /// Foreground jobs this session tracks. Finished ones are pruned on the next submission.
    pub fn tracked_job_count(&self) -> usize {
        self.state().created.len()
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    pub(super) fn as_session(&self) -> Option<Arc<dyn Session>> {
        let me = self.me.upgrade()?;
        Some(me as Arc<dyn Session>)
    }

    pub(super) fn connection(&self) -> &Arc<dyn Connection<ClientSession>> {
        &self.connection
    }

    /// Records the assignment before the worker learns about it. A session closed in the
    /// meantime gets nothing and the job goes straight back to the queue.
    pub(super) fn track_assignment(&self, function: FunctionHandle, assignment: &JobAssignment) {
        let rejected = {
            let mut state = self.state();
            if state.closed {
                Some(function)
            } else {
                state.working.insert(
                    assignment.handle().to_owned(),
                    WorkingJob {
                        function,
                        job: Arc::clone(&assignment.job),
                    },
                );
                None
            }
        };

        match rejected {
            Some(function) => {
                function.requeue_job(&assignment.job);
            }
            None => self.send_packet(assignment.to_packet()),
        }
    }

    /// Remembers a foreground job so a disconnect can stop listening to it. Finished jobs
    /// are pruned on the way. A session that closed while the job was being created
    /// leaves the job's listeners right away.
    pub(super) fn track_created(&self, job: &Arc<Job>) {
        {
            let mut state = self.state();
            if !state.closed {
                state.created.retain(|created| {
                    created
                        .upgrade()
                        .is_some_and(|created| created.state() != JobState::Complete)
                });
                state.created.push(Arc::downgrade(job));
                return;
            }
        }
        job.remove_listener(self.session_id);
    }

    pub(super) fn take_working(&self, handle: &str) -> Option<WorkingJob> {
        self.state().working.remove(handle)
    }

    pub(super) fn working_job(&self, handle: &str) -> Option<(FunctionHandle, Arc<Job>)> {
        self.state()
            .working
            .get(handle)
            .map(|entry| (entry.function.clone(), Arc::clone(&entry.job)))
    }

    /// Runs the disconnect contract once: leave every idle set, requeue working jobs
    /// without telling their listeners, stop listening to created jobs and release every
    /// function holder.
    pub(super) fn close(&self) {
        let (abilities, working, created) = {
            let mut state = self.state();
            if state.closed {
                return;
            }
            state.closed = true;
            (
                std::mem::take(&mut state.abilities),
                std::mem::take(&mut state.working),
                std::mem::take(&mut state.created),
            )
        };

        for function in abilities.values() {
            function.remove_idle_worker(self.session_id);
        }

        let requeued = working.len();
        for entry in working.into_values() {
            entry.function.requeue_job(&entry.job);
        }

        for job in created.iter().filter_map(Weak::upgrade) {
            job.remove_listener(self.session_id);
        }

        if requeued > 0 {
            self.context.logger().info(
                Some(LOG_CONTEXT),
                &format!(
                    "session {} disconnected; requeued {requeued} working job(s)",
                    self.session_id
                ),
            );
        } else {
            self.context.logger().debug(
                Some(LOG_CONTEXT),
                &format!("session {} disconnected", self.session_id),
            );
        }
    }

    pub(super) fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().expect("client session lock poisoned")
    }
}

impl Session for ClientSession {
    fn session_id(&self) -> Uuid {
        self.session_id
    }

    fn send_packet(&self, packet: Packet) {
        let kind = packet.kind();
        if let Err(err) = self.connection.send_packet(packet) {
            self.context.logger().debug(
                Some(LOG_CONTEXT),
                &format!(
                    "dropping {kind} for session {}: {err}",
                    self.session_id
                ),
            );
            self.connection.close();
        }
    }

    fn release_job(&self, handle: &str) -> bool {
        let released = self.take_working(handle);
        released.is_some()
    }
}

impl fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSession")
            .field("session_id", &self.session_id)
            .field("connection_id", &self.connection.id())
            .field("connected_at", &self.connected_at)
            .finish_non_exhaustive()
    }
}
