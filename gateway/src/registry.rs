use crate::{
    config::{ConfigErrors, GatewayConfig, ScriptsConfig},
    executors::{Executor, ExecutorError, Executors, RunHandle},
    run::{
        CommandToken, ExecutionSnippet, MovableReference, RunReference, RunRequest, RunStatus,
        RunSummary,
    },
    store::{RunStore, StoreError, Stores},
};
use chrono::{DateTime, Utc};
use itertools::Itertools;
use parking_lot::FairMutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, instrument, warn};

/// catalog names of the files every run is bootstrapped with
pub const OUTSIDE_SCRIPT: &str = "outside.sh";
pub const INSIDE_SCRIPT: &str = "inside.sh";
pub const BUNDLE: &str = "project.tar.gz";

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("No run with reference {0}")]
    NotFound(RunReference),
    #[error("Failed to dispatch run")]
    Executor(#[from] ExecutorError),
    #[error("Failed to persist runs")]
    Store(#[from] StoreError),
}

/// Everything the gateway remembers about a submitted run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub reference: RunReference,
    pub request: RunRequest,
    pub handle: RunHandle,
    pub submitted_at: DateTime<Utc>,
}

impl RunRecord {
    pub fn summary(&self, status: RunStatus) -> RunSummary {
        RunSummary {
            reference: self.reference,
            run_id: self.request.run_id.clone(),
            entry_point: self.request.entry_point.clone(),
            experiment_id: self.request.experiment_id.clone(),
            user_subject: self.request.user_subject.clone(),
            backend: self.handle.backend().to_owned(),
            status,
            submitted_at: self.submitted_at,
        }
    }
}

#[derive(Debug)]
struct RegistryState {
    runs: Vec<RunRecord>,
    store: Stores,
}

impl RegistryState {
    fn find(&self, reference: &RunReference) -> Option<&RunRecord> {
        self.runs.iter().find(|record| record.reference == *reference)
    }
}

/// Single entry point for submitting and following runs
#[derive(Debug)]
pub struct GatewayServer {
    executor: Executors,
    scripts: ScriptsConfig,
    // serializes dispatch and persist, readers never take it
    dispatch: FairMutex<()>,
    state: FairMutex<RegistryState>,
}

impl GatewayServer {
    /// open the registry on top of whatever `store` persisted before
    pub fn new(executor: Executors, scripts: ScriptsConfig, mut store: Stores) -> Self {
        let mut runs = store.load();
        runs.iter_mut()
            .for_each(|record| executor.reattach(&mut record.handle));

        info!(
            runs = runs.len(),
            backend = executor.backend(),
            "Opened run registry"
        );

        Self {
            executor,
            scripts,
            dispatch: FairMutex::new(()),
            state: FairMutex::new(RegistryState { runs, store }),
        }
    }

    pub fn load(config: &GatewayConfig) -> Result<Self, ConfigErrors> {
        Ok(Self::new(
            Executors::load(&config.executor)?,
            config.scripts.clone(),
            Stores::load(&config.store)?,
        ))
    }

    /// bootstrap scripts plus the bundle, launched as `outside.sh -i inside.sh -t bundle`
    fn snippet(&self, request: &RunRequest) -> ExecutionSnippet {
        let files = [
            (OUTSIDE_SCRIPT, MovableReference::new(&self.scripts.outside)),
            (INSIDE_SCRIPT, MovableReference::new(&self.scripts.inside)),
            (BUNDLE, MovableReference::new(&request.tarball_path)),
        ]
        .into_iter()
        .map(|(name, reference)| (name.to_owned(), reference))
        .collect();

        ExecutionSnippet {
            command: vec![
                CommandToken::Literal("/bin/bash".to_owned()),
                CommandToken::File(OUTSIDE_SCRIPT.to_owned()),
                CommandToken::Literal("-i".to_owned()),
                CommandToken::File(INSIDE_SCRIPT.to_owned()),
                CommandToken::Literal("-t".to_owned()),
                CommandToken::File(BUNDLE.to_owned()),
            ],
            files,
        }
    }

    /// Dispatch a run exactly once and record it.
    ///
    /// The record only exists if dispatch and persistence both succeeded. A
    /// run whose record could not be persisted is cancelled again.
    #[instrument(skip_all, fields(run_id = %request.run_id, user = %request.user_subject), level = "info")]
    pub fn enqueue(&self, request: RunRequest) -> Result<RunRecord, RegistryError> {
        let snippet = self.snippet(&request);

        // held across dispatch and persist, so the sequence matches submission order
        let _dispatch = self.dispatch.lock();
        let handle = self.executor.run_context_async(snippet, &request)?;
        let record = RunRecord {
            reference: RunReference::mint(),
            request,
            handle,
            submitted_at: Utc::now(),
        };

        let persisted = {
            let mut state = self.state.lock();
            state
                .store
                .append(&record)
                .map(|()| state.runs.push(record.clone()))
        };

        if let Err(error) = persisted {
            error!(error = ?error, job_ids = %record.handle.job_ids().iter().join(","), "Failed to persist run, cancelling it");

            if let Err(cancel_error) = record.handle.cancel() {
                warn!(error = ?cancel_error, "Failed to cancel unrecorded run");
            }

            return Err(error.into());
        }

        info!(reference = %record.reference, backend = record.handle.backend(), "Enqueued run");

        Ok(record)
    }

    /// enqueue and hand out nothing but the reference
    pub fn enqueue_client(&self, request: RunRequest) -> Result<RunReference, RegistryError> {
        self.enqueue(request).map(|record| record.reference)
    }

    pub fn resolve(&self, reference: &RunReference) -> Result<RunRecord, RegistryError> {
        self.state
            .lock()
            .find(reference)
            .cloned()
            .ok_or(RegistryError::NotFound(*reference))
    }

    /// non-blocking, the registry lock is released before the backend is asked
    pub fn status(&self, reference: &RunReference) -> Result<RunStatus, RegistryError> {
        Ok(self.resolve(reference)?.handle.status())
    }

    #[instrument(skip(self), level = "info")]
    pub fn wait(&self, reference: &RunReference) -> Result<RunStatus, RegistryError> {
        let status = self.resolve(reference)?.handle.wait()?;
        info!(status = %status, "Run finished");

        Ok(status)
    }

    #[instrument(skip(self), level = "info")]
    pub fn cancel(&self, reference: &RunReference) -> Result<(), RegistryError> {
        Ok(self.resolve(reference)?.handle.cancel()?)
    }

    /// Runs submitted by `user_subject`, in submission order.
    ///
    /// Without `include_completed` only runs still running (or in an unknown
    /// state) are listed.
    pub fn list(&self, user_subject: &str, include_completed: bool) -> Vec<RunSummary> {
        let records = self
            .state
            .lock()
            .runs
            .iter()
            .filter(|record| record.request.user_subject == user_subject)
            .cloned()
            .collect_vec();

        records
            .iter()
            .map(|record| record.summary(record.handle.status()))
            .filter(|summary| include_completed || !summary.status.is_terminal())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
