pub mod local;
pub mod remote;
pub mod slurm;
mod wrapper;

use crate::{
    config::{ConfigErrors, ExecutorConfig},
    credential::CredentialError,
    run::{ExecutionSnippet, MoveError, RunRequest, RunStatus, SnippetError},
    submission::{RequestError, SubmissionError},
};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::{io, thread, time::Duration};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Failed to start `{command}`")]
    Spawn { command: String, source: io::Error },
    #[error("`{command}` failed: {stderr}")]
    Command { command: String, stderr: String },
    #[error("More than one input file is named `{0}`")]
    DuplicateResource(String),
    #[error("Failed to relocate input file")]
    Relocation(#[from] MoveError),
    #[error("Invalid execution snippet")]
    Snippet(#[from] SnippetError),
    #[error("Invalid resource request")]
    Request(#[from] RequestError),
    #[error("Credential unavailable")]
    Credential(#[from] CredentialError),
    #[error("Submission failed")]
    Submission(#[from] SubmissionError),
    #[error("Failed to render wrapper script")]
    Template(#[from] minijinja::Error),
    #[error("Failed to prepare scratch files")]
    Scratch(#[source] io::Error),
    #[error("Run id `{0}` cannot name a run directory")]
    InvalidRunId(String),
    #[error("Run directory {0:?} already exists")]
    RunDirectoryExists(std::path::PathBuf),
    #[error("Failed to query run state: {0}")]
    Query(String),
    #[error("{0} is not supported by this executor")]
    Unsupported(&'static str),
}

impl ExecutorError {
    /// true for both duplicate catalog entries and relocation collisions
    pub fn is_duplicate(&self) -> bool {
        matches!(
            self,
            Self::DuplicateResource(_) | Self::Relocation(MoveError::Collision(_))
        )
    }
}

/// Something that can start a run on a compute resource
pub trait Executor {
    /// Start the snippet and return as soon as the work has been accepted.
    ///
    /// Failing to hand over the work is always an error and never a handle in
    /// a failed state.
    fn run_context_async(
        &self,
        snippet: ExecutionSnippet,
        request: &RunRequest,
    ) -> Result<RunHandle, ExecutorError>;

    /// short backend name used in summaries and logs
    fn backend(&self) -> &'static str;
}

/// All supported executors
/// (tagged enum instead of dynamic dispatch, config decides the variant)
#[derive(Debug)]
pub enum Executors {
    Local(local::LocalExecutor),
    Slurm(slurm::SlurmExecutor),
    Remote(remote::RemoteExecutor),
}

impl Executors {
    pub fn load(config: &ExecutorConfig) -> Result<Self, ConfigErrors> {
        match config {
            ExecutorConfig::Local(config) => Ok(Self::Local(local::LocalExecutor::load(config))),
            ExecutorConfig::Slurm(config) => Ok(Self::Slurm(slurm::SlurmExecutor::load(config))),
            ExecutorConfig::Remote(config) => {
                Ok(Self::Remote(remote::RemoteExecutor::load(config)?))
            }
        }
    }

    /// reconnect a handle read back from storage with the live parts of this executor
    pub fn reattach(&self, handle: &mut RunHandle) {
        if let (Self::Remote(executor), RunHandle::Remote(handle)) = (self, handle) {
            executor.reattach(handle);
        }
    }
}

impl Executor for Executors {
    fn run_context_async(
        &self,
        snippet: ExecutionSnippet,
        request: &RunRequest,
    ) -> Result<RunHandle, ExecutorError> {
        match self {
            Self::Local(executor) => executor.run_context_async(snippet, request),
            Self::Slurm(executor) => executor.run_context_async(snippet, request),
            Self::Remote(executor) => executor.run_context_async(snippet, request),
        }
    }

    fn backend(&self) -> &'static str {
        match self {
            Self::Local(executor) => executor.backend(),
            Self::Slurm(executor) => executor.backend(),
            Self::Remote(executor) => executor.backend(),
        }
    }
}

/// Backend specific handle on a started run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum RunHandle {
    Local(local::LocalHandle),
    Slurm(slurm::SlurmHandle),
    Remote(remote::RemoteHandle),
}

impl RunHandle {
    pub fn backend(&self) -> &'static str {
        match self {
            Self::Local(_) => "local",
            Self::Slurm(_) => "slurm",
            Self::Remote(_) => "remote",
        }
    }

    /// process id or cluster job ids
    pub fn job_ids(&self) -> Vec<String> {
        match self {
            Self::Local(handle) => vec![handle.pid.to_string()],
            Self::Slurm(handle) => handle.job_ids.clone(),
            Self::Remote(handle) => handle.job_ids.clone(),
        }
    }

    /// non-blocking snapshot of the run's state
    pub fn status(&self) -> RunStatus {
        match self {
            Self::Local(handle) => handle.status(),
            Self::Slurm(handle) => handle.status(),
            Self::Remote(handle) => handle.status(),
        }
    }

    /// block until the run reached a final state
    pub fn wait(&self) -> Result<RunStatus, ExecutorError> {
        match self {
            Self::Local(handle) => handle.wait(),
            Self::Slurm(handle) => handle.wait(),
            Self::Remote(handle) => handle.wait(),
        }
    }

    pub fn cancel(&self) -> Result<(), ExecutorError> {
        match self {
            Self::Local(handle) => handle.cancel(),
            Self::Slurm(handle) => handle.cancel(),
            Self::Remote(handle) => handle.cancel(),
        }
    }
}

/// environment every run gets, whatever the backend
pub(crate) fn run_environment(request: &RunRequest) -> Vec<(&'static str, String)> {
    vec![
        ("MLFLOW_RUN_ID", request.run_id.clone()),
        ("MLFLOW_TRACKING_URI", request.tracking_uri.clone()),
        ("MLFLOW_EXPERIMENT_ID", request.experiment_id.clone()),
        ("MLTF_ENTRY_POINT", request.entry_point.clone()),
        (
            "MLTF_PARAMS",
            request
                .params
                .iter()
                .map(|(key, value)| format!("{key}={value}"))
                .join("\n"),
        ),
    ]
}

/// combine the states of all jobs belonging to a single run
pub(crate) fn combine_statuses<I: IntoIterator<Item = RunStatus>>(statuses: I) -> RunStatus {
    let statuses = statuses.into_iter().collect_vec();

    if statuses.is_empty() {
        RunStatus::Unknown
    } else if statuses.contains(&RunStatus::Failed) {
        RunStatus::Failed
    } else if statuses.contains(&RunStatus::Running) {
        RunStatus::Running
    } else if statuses.iter().all(|status| *status == RunStatus::Completed) {
        RunStatus::Completed
    } else {
        RunStatus::Unknown
    }
}

/// reject catalogs where two files would end up with the same name
/// unknown answers in a row before waiting on cluster jobs gives up
pub(crate) const MAX_UNKNOWN_POLLS: u32 = 10;

/// Poll `status` every `interval` until the jobs reach a terminal state.
///
/// A lost query or a job missing from the queue for a moment reads as
/// unknown, so only `MAX_UNKNOWN_POLLS` consecutive unknowns end the wait.
pub(crate) fn poll_until_terminal<F: FnMut() -> RunStatus>(
    job_ids: &[String],
    interval: Duration,
    mut status: F,
) -> Result<RunStatus, ExecutorError> {
    let mut unknown = 0;

    loop {
        match status() {
            RunStatus::Running => unknown = 0,
            RunStatus::Unknown => {
                unknown += 1;
                if unknown >= MAX_UNKNOWN_POLLS {
                    return Err(ExecutorError::Query(format!(
                        "state of job(s) {} is unavailable",
                        job_ids.join(",")
                    )));
                }

                debug!(job_ids = %job_ids.join(","), attempt = unknown, "Job state unknown, polling again");
            }
            status => return Ok(status),
        }

        thread::sleep(interval);
    }
}

pub(crate) fn check_unique_names(snippet: &ExecutionSnippet) -> Result<(), ExecutorError> {
    match snippet
        .files
        .values()
        .filter_map(|reference| reference.base_name())
        .duplicates()
        .next()
    {
        Some(name) => Err(ExecutorError::DuplicateResource(name)),
        None => Ok(()),
    }
}
