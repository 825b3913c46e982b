use super::{
    check_unique_names, combine_statuses, poll_until_terminal, wrapper, Executor, ExecutorError,
    RunHandle,
};
use crate::{
    config::{ConfigErrors, RemoteConfig},
    credential::{Credential, Credentials},
    run::{ExecutionSnippet, RunRequest, RunStatus},
    submission::{SlurmRequest, SubmissionClient, Upload},
};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::{fmt, fs, path::PathBuf, sync::Arc, time::Duration};
use tracing::{info, instrument, warn};

/// Remote side sees every input under this directory, next to the entry script
const INPUT_DIR: &str = "input";

/// What a remote handle needs to talk to the submission API
pub struct RemoteSession {
    client: SubmissionClient,
    auth: Credentials,
    poll_interval: Duration,
}

impl fmt::Debug for RemoteSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteSession")
            .field("base_url", &self.client.base_url())
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

impl RemoteSession {
    fn token(&self) -> Result<String, ExecutorError> {
        self.auth.ensure_fresh()?;
        Ok(self.auth.get_token()?)
    }
}

/// Executor handing runs to the HTTP submission API in front of a Slurm cluster
#[derive(Debug)]
pub struct RemoteExecutor {
    session: Arc<RemoteSession>,
    slurm_token: Option<Credentials>,
    experiment_dir: Option<String>,
    scratch_dir: PathBuf,
}

impl RemoteExecutor {
    pub fn load(config: &RemoteConfig) -> Result<Self, ConfigErrors> {
        let base_url = config
            .base_url
            .as_deref()
            .ok_or(ConfigErrors::MissingBaseUrl)?;
        let timeout = Duration::from_secs(config.timeout);

        let session = RemoteSession {
            client: SubmissionClient::new(base_url, timeout)?,
            auth: Credentials::load(&config.auth, timeout)?,
            poll_interval: Duration::from_secs(config.poll_interval),
        };
        let slurm_token = config
            .slurm_token
            .as_ref()
            .map(|token| Credentials::load(token, timeout))
            .transpose()?;

        Ok(Self {
            session: Arc::new(session),
            slurm_token,
            experiment_dir: config.experiment_dir.clone(),
            scratch_dir: config.scratch_dir.clone(),
        })
    }

    /// give a handle read back from storage a live session again
    pub fn reattach(&self, handle: &mut RemoteHandle) {
        if handle.base_url == self.session.client.base_url() {
            handle.session = Some(self.session.clone());
        } else {
            warn!(
                job_ids = %handle.job_ids.iter().join(","),
                base_url = %handle.base_url,
                "Run was submitted to another API, leaving it detached"
            );
        }
    }

    /// administrative calls, failures only end up in the log
    fn push_settings(&self, token: &str) {
        let client = &self.session.client;

        if let Some(slurm_token) = &self.slurm_token {
            match slurm_token.get_token() {
                Ok(slurm_token) => {
                    if let Err(error) = client.push_slurm_token(token, &slurm_token) {
                        warn!(error = ?error, "Failed to push Slurm token");
                    }
                }
                Err(error) => warn!(error = ?error, "Slurm token unavailable"),
            }
        }

        if let Some(experiment_dir) = &self.experiment_dir {
            if let Err(error) = client.push_experiment_folder(token, experiment_dir) {
                warn!(error = ?error, "Failed to push experiment folder");
            }
        }
    }
}

impl Executor for RemoteExecutor {
    #[instrument(skip_all, fields(run_id = %request.run_id), level = "info")]
    fn run_context_async(
        &self,
        mut snippet: ExecutionSnippet,
        request: &RunRequest,
    ) -> Result<RunHandle, ExecutorError> {
        let token = self.session.token()?;

        // nothing may leave the machine if two inputs would clash remotely
        check_unique_names(&snippet)?;
        let slurm_request = SlurmRequest::from_backend_config(&request.backend_config)?;

        // staging and script are removed on drop, whichever way we leave
        let staging = tempfile::Builder::new()
            .prefix("mltf-staging-")
            .tempdir_in(&self.scratch_dir)
            .map_err(ExecutorError::Scratch)?;

        for reference in snippet.files.values_mut() {
            reference.relocate_to(staging.path())?;
        }

        let command = snippet.resolve_with(|reference| {
            format!(
                "{INPUT_DIR}/{}",
                reference.base_name().unwrap_or_default()
            )
        })?;
        let script = wrapper::write_scratch(
            &self.scratch_dir,
            &wrapper::render(&command, request)?,
        )?;
        let entry_script = fs::read_to_string(script.path()).map_err(ExecutorError::Scratch)?;

        let uploads = snippet
            .files
            .values()
            .map(|reference| Upload {
                name: reference.base_name().unwrap_or_default(),
                path: reference.target().to_path_buf(),
            })
            .collect_vec();

        self.push_settings(&token);
        let submitted = self
            .session
            .client
            .submit(&token, &entry_script, &slurm_request, &uploads);

        if let Err(error) = script.close() {
            warn!(error = ?error, "Failed to remove wrapper script");
        }
        if let Err(error) = staging.close() {
            warn!(error = ?error, "Failed to remove staging directory");
        }

        let job_uuid = submitted?;
        info!(job_uuid = %job_uuid, uploads = uploads.len(), "Submitted run to remote API");

        Ok(RunHandle::Remote(RemoteHandle {
            job_ids: vec![job_uuid],
            base_url: self.session.client.base_url().to_owned(),
            session: Some(self.session.clone()),
        }))
    }

    fn backend(&self) -> &'static str {
        "remote"
    }
}

/// Handle on jobs accepted by the submission API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteHandle {
    pub job_ids: Vec<String>,
    pub base_url: String,
    #[serde(skip)]
    session: Option<Arc<RemoteSession>>,
}

impl RemoteHandle {
    pub fn is_attached(&self) -> bool {
        self.session.is_some()
    }

    fn job_status(session: &RemoteSession, job_uuid: &str) -> RunStatus {
        let result = session
            .token()
            .and_then(|token| Ok(session.client.job_status(&token, job_uuid)?));

        match result {
            Ok(status) => status,
            Err(error) => {
                warn!(job_uuid = job_uuid, error = ?error, "Failed to query remote job");
                RunStatus::Unknown
            }
        }
    }

    pub fn status(&self) -> RunStatus {
        match &self.session {
            Some(session) => combine_statuses(
                self.job_ids
                    .iter()
                    .map(|job_uuid| Self::job_status(session, job_uuid)),
            ),
            None => RunStatus::Unknown,
        }
    }

    pub fn wait(&self) -> Result<RunStatus, ExecutorError> {
        let Some(session) = &self.session else {
            return Err(ExecutorError::Query(format!(
                "run {} is not attached to a submission API",
                self.job_ids.join(",")
            )));
        };

        poll_until_terminal(&self.job_ids, session.poll_interval, || self.status())
    }

    pub fn cancel(&self) -> Result<(), ExecutorError> {
        Err(ExecutorError::Unsupported("cancelling remote runs"))
    }
}
