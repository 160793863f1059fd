use std::sync::Arc;

use serde_json::json;

use crate::logging::LogLevel;
use crate::orchestrator::functions::{CancelOutcome, CreateOutcome, FunctionHandle};
use crate::orchestrator::jobs::{Job, NewJob, Session, UniqueId};
use crate::wire::{ADMIN_OK, JOB_BUSY_CODE, JOB_NOT_FOUND_CODE, Packet};

use super::session::ClientSession;

const LOG_CONTEXT: &str = "broker::interpreter";

impl ClientSession {
    pub(super) fn handle_packet(&self, packet: Packet) {
        if self.is_closed() {
            return;
        }

        let kind = packet.kind();
        if kind.is_server_to_client() {
            self.send_packet(Packet::protocol_violation(format!(
                "{kind} is only sent by the broker"
            )));
            return;
        }

        self.context.logger().verbose(
            Some(LOG_CONTEXT),
            &format!("session {} sent {kind}", self.session_id()),
        );

        match packet {
            Packet::CanDo { function } => self.can_do(function),
            Packet::CantDo { function } => self.cant_do(&function),
            Packet::ResetAbilities => self.reset_abilities(),
            Packet::PreSleep => self.pre_sleep(),
            Packet::GrabJob => self.grab(false),
            Packet::GrabJobUniq => self.grab(true),
            Packet::SubmitJob {
                function,
                unique_id,
                payload,
                priority,
                background,
            } => self.submit(
                &function,
                NewJob {
                    unique_id,
                    payload,
                    priority,
                    background,
                },
            ),
            Packet::WorkStatus {
                handle,
                numerator,
                denominator,
            } => {
                if let Some((function, job)) = self.working_or_report(&handle) {
                    function.update_progress(&job, numerator, denominator);
                }
            }
            Packet::WorkData { handle, data } => {
                if let Some((function, job)) = self.working_or_report(&handle) {
                    function.forward_data(&job, data);
                }
            }
            Packet::WorkComplete { handle, data } => match self.take_working(&handle) {
                Some(entry) => entry.function.complete_job(&entry.job, data),
                None => self.report_unknown_handle(&handle),
            },
            Packet::WorkFail { handle } => match self.take_working(&handle) {
                Some(entry) => {
                    entry.function.fail_job(&entry.job);
                }
                None => self.report_unknown_handle(&handle),
            },
            Packet::EchoReq { data } => self.send_packet(Packet::EchoRes { data }),
            Packet::SetClientId { client_id } => {
                self.state().client_id = Some(client_id);
            }
            Packet::AdminStatus => self.registry.broadcast_status(self),
            Packet::AdminMaxQueue {
                function,
                max_queue_depth,
            } => {
                self.registry.set_max_queue_depth(&function, max_queue_depth);
                self.send_packet(Packet::Text(ADMIN_OK.to_owned()));
            }
            Packet::AdminCancel {
                function,
                unique_id,
            } => self.cancel(&function, &unique_id),
            Packet::JobCreated { .. }
            | Packet::NoJob
            | Packet::Noop
            | Packet::JobAssign { .. }
            | Packet::JobAssignUniq { .. }
            | Packet::EchoRes { .. }
            | Packet::Error { .. }
            | Packet::Text(_) => {}
        }
    }

    fn can_do(&self, function: String) {
        if function.is_empty() {
            self.send_packet(Packet::protocol_violation("CAN_DO needs a function name"));
            return;
        }

        let handle = self.registry.get_or_create(&function);
        let replaced = {
            let mut state = self.state();
            if state.closed {
                Some(handle)
            } else {
                state.abilities.insert(function, handle)
            }
        };
        drop(replaced);
    }

    fn cant_do(&self, function: &str) {
        let removed = self.state().abilities.remove(function);
        if let Some(handle) = removed {
            handle.remove_idle_worker(self.session_id());
        }
    }

    fn reset_abilities(&self) {
        let removed = std::mem::take(&mut self.state().abilities);
        for handle in removed.values() {
            handle.remove_idle_worker(self.session_id());
        }
    }

    fn pre_sleep(&self) {
        let Some(me) = self.as_session() else {
            return;
        };

        // registered under the session lock so a concurrent close sees every idle entry
        let mut has_work = false;
        {
            let state = self.state();
            if state.closed {
                return;
            }
            for function in state.abilities.values() {
                function.add_idle_worker(&me);
                has_work |= function.has_queued_jobs();
            }
        }

        if has_work {
            self.wake();
        }
    }

    fn grab(&self, with_unique_id: bool) {
        let Some(me) = self.as_session() else {
            return;
        };

        let mut abilities: Vec<(String, FunctionHandle)> = self
            .state()
            .abilities
            .iter()
            .map(|(name, handle)| (name.clone(), handle.clone()))
            .collect();
        if abilities.is_empty() {
            self.send_packet(Packet::protocol_violation(
                "grab requested without any registered ability",
            ));
            return;
        }
        abilities.sort_by(|left, right| left.0.cmp(&right.0));

        for (_, function) in &abilities {
            function.remove_idle_worker(self.session_id());
        }

        for (_, function) in abilities {
            let assignment = if with_unique_id {
                function.grab_job_unique_id(&me)
            } else {
                function.grab_job(&me)
            };
            if let Some(assignment) = assignment {
                self.track_assignment(function, &assignment);
                return;
            }
        }

        self.send_packet(Packet::NoJob);
    }

    fn submit(&self, function: &str, request: NewJob) {
        if function.is_empty() {
            self.send_packet(Packet::protocol_violation("SUBMIT_JOB needs a function name"));
            return;
        }
        let Some(me) = self.as_session() else {
            return;
        };

        let background = request.background;
        let handle = self.registry.get_or_create(function);
        let outcome = handle.create_job(request, &me);

        if self.context.logger().is_enabled(LogLevel::Debug) {
            self.context.logger().log(
                LogLevel::Debug,
                Some(LOG_CONTEXT),
                "job submitted",
                Some(json!({
                    "session": self.session_id().to_string(),
                    "function": function,
                    "background": background,
                    "handle": outcome.handle(),
                })),
            );
        }

        let unique_id = match &outcome {
            CreateOutcome::Created { unique_id, .. } | CreateOutcome::Joined { unique_id, .. } => {
                unique_id
            }
            CreateOutcome::QueueFull => return,
        };
        if background {
            return;
        }
        if let Some(job) = handle.get_job(unique_id) {
            self.track_created(&job);
        }
    }

    fn cancel(&self, function: &str, unique_id: &UniqueId) {
        let outcome = self
            .registry
            .get_if_present(function)
            .map(|handle| handle.cancel_job(unique_id))
            .unwrap_or(CancelOutcome::NotFound);

        let reply = match outcome {
            CancelOutcome::Cancelled => Packet::Text(ADMIN_OK.to_owned()),
            CancelOutcome::NotFound => Packet::error(
                JOB_NOT_FOUND_CODE,
                format!("no job '{unique_id}' for function '{function}'"),
            ),
            CancelOutcome::Busy => Packet::error(
                JOB_BUSY_CODE,
                format!("job '{unique_id}' is being reported by its worker"),
            ),
        };
        self.send_packet(reply);
    }

    fn working_or_report(&self, handle: &str) -> Option<(FunctionHandle, Arc<Job>)> {
        let working = self.working_job(handle);
        if working.is_none() {
            self.report_unknown_handle(handle);
        }
        working
    }

    fn report_unknown_handle(&self, handle: &str) {
        self.context.logger().warn(
            Some(LOG_CONTEXT),
            &format!(
                "session {} reported on job {handle} it is not working",
                self.session_id()
            ),
        );
        self.send_packet(Packet::protocol_violation(format!(
            "job {handle} is not assigned to this session"
        )));
    }
}
