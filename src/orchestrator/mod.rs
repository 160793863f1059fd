pub mod functions;
pub mod jobs;
pub mod queues;
