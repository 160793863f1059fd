pub mod broker;
pub mod config;
pub mod context;
pub mod logging;
pub mod maintenance;
pub mod orchestrator;
pub mod shutdown;
pub mod storage;
pub mod sync;
pub mod transport;
pub mod wire;

#[cfg(test)]
pub(crate) mod test_support;

pub use broker::{BrokerError, ClientSession, LocalBroker};
pub use context::{BrokerContext, BrokerSettings};
pub use orchestrator::functions::{Function, FunctionHandle, FunctionRegistry};
pub use orchestrator::jobs::{Job, JobPriority, JobState, NewJob, Session, UniqueId};
pub use wire::Packet;
