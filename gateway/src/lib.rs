pub mod config;
pub mod credential;
pub mod executors;
pub mod registry;
pub mod run;
pub mod store;
pub mod submission;

pub use registry::{GatewayServer, RegistryError, RunRecord};
pub use run::{RunReference, RunRequest, RunStatus, RunSummary};
