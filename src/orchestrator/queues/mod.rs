use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use crate::orchestrator::jobs::{Job, UniqueId};

/// Three FIFO tiers polled high before normal before low.
///
/// Not synchronized; the owning function guards it with its queue mutex. Membership is
/// tracked by unique id so a job is never queued twice.
#[derive(Debug, Default)]
pub struct PriorityJobQueue {
    tiers: [VecDeque<Arc<Job>>; 3],
    members: HashSet<UniqueId>,
}

impl PriorityJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends to the tail of the job's tier. Returns `false` if the job is already queued.
    pub fn add(&mut self, job: Arc<Job>) -> bool {
        if !self.members.insert(job.unique_id().clone()) {
            return false;
        }
        self.tiers[job.priority().tier()].push_back(job);
        true
    }

    pub fn poll(&mut self) -> Option<Arc<Job>> {
        let job = self.tiers.iter_mut().find_map(VecDeque::pop_front)?;
        self.members.remove(job.unique_id());
        Some(job)
    }

    pub fn remove(&mut self, job: &Job) -> bool {
        if !self.members.remove(job.unique_id()) {
            return false;
        }
        let tier = &mut self.tiers[job.priority().tier()];
        match tier
            .iter()
            .position(|queued| queued.unique_id() == job.unique_id())
        {
            Some(index) => {
                tier.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, job: &Job) -> bool {
        self.members.contains(job.unique_id())
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }
}
