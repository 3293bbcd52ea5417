//! In-memory registries shared by the agent's tasks.

pub mod jobs;
pub mod services;

pub use jobs::{Job, JobRegistry, RunPhase, RunState};
pub use services::{Instance, InstanceHealth, Observation, ServiceRecord, ServiceRegistry};
