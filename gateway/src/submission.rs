pub mod request;

pub use request::{RequestError, SlurmRequest};

use crate::{executors::slurm::status_from_state, run::RunStatus};
use reqwest::blocking::{
    multipart::{Form, Part},
    Client, Response,
};
use serde::Deserialize;
use serde_json::json;
use std::{fs, io, path::PathBuf, time::Duration};
use thiserror::Error;
use tracing::{debug, instrument};

#[derive(Error, Debug)]
pub enum SubmissionError {
    #[error("Submission API answered HTTP {status}: {body}")]
    Transport {
        status: http::StatusCode,
        body: String,
    },
    #[error("Submission API rejected the request: {0}")]
    Rejected(String),
    #[error("Unexpected response from submission API: {0}")]
    MalformedResponse(String),
    #[error("Failed to read upload {path:?}")]
    Read { path: PathBuf, source: io::Error },
    #[error("Failed to encode request")]
    Encode(#[from] serde_json::Error),
    #[error("Request to submission API failed")]
    Http(#[from] reqwest::Error),
}

#[derive(Deserialize, Debug)]
struct Envelope<T> {
    success: bool,
    data: Option<T>,
    message: Option<String>,
}

#[derive(Deserialize, Debug)]
struct Submitted {
    job_uuid: String,
}

#[derive(Deserialize, Debug)]
struct JobState {
    state: String,
}

/// A file to upload, `name` is what the remote side will call it
#[derive(Debug, Clone)]
pub struct Upload {
    pub name: String,
    pub path: PathBuf,
}

/// Client for the HTTP service fronting the Slurm cluster
#[derive(Debug, Clone)]
pub struct SubmissionClient {
    base_url: String,
    client: Client,
}

impl SubmissionClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, SubmissionError> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_owned(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// non-2xx is a transport error, kept apart from a structured `success: false`
    fn check_status(response: Response) -> Result<Response, SubmissionError> {
        let status = response.status();

        if status.is_success() {
            Ok(response)
        } else {
            Err(SubmissionError::Transport {
                status,
                body: response.text().unwrap_or_default(),
            })
        }
    }

    fn unwrap_envelope<T>(envelope: Envelope<T>) -> Result<T, SubmissionError> {
        if !envelope.success {
            return Err(SubmissionError::Rejected(
                envelope
                    .message
                    .unwrap_or_else(|| "no reason given".to_owned()),
            ));
        }

        envelope
            .data
            .ok_or_else(|| SubmissionError::MalformedResponse("missing `data`".to_owned()))
    }

    /// Send one multipart submission and return the remote job identifier
    #[instrument(skip(self, token, entry_script, uploads), fields(base_url = %self.base_url, uploads = uploads.len()))]
    pub fn submit(
        &self,
        token: &str,
        entry_script: &str,
        request: &SlurmRequest,
        uploads: &[Upload],
    ) -> Result<String, SubmissionError> {
        let mut form = Form::new();

        for upload in uploads {
            let content = fs::read(&upload.path).map_err(|source| SubmissionError::Read {
                path: upload.path.clone(),
                source,
            })?;

            form = form.part(
                "files",
                Part::bytes(content)
                    .file_name(upload.name.clone())
                    .mime_str("application/octet-stream")?,
            );
        }

        let form = form
            .text("entry_script", entry_script.to_owned())
            .text("slurm_request", serde_json::to_string(request)?);

        let response = self
            .client
            .post(self.url("/api/slurm"))
            .bearer_auth(token)
            .multipart(form)
            .send()?;

        let envelope: Envelope<Submitted> = Self::check_status(response)?
            .json()
            .map_err(|error| SubmissionError::MalformedResponse(error.to_string()))?;
        let job_uuid = Self::unwrap_envelope(envelope)?.job_uuid;

        debug!(job_uuid = %job_uuid, "Submission accepted");

        Ok(job_uuid)
    }

    fn post_json(
        &self,
        token: &str,
        path: &str,
        body: serde_json::Value,
    ) -> Result<(), SubmissionError> {
        let response = self
            .client
            .post(self.url(path))
            .bearer_auth(token)
            .json(&body)
            .send()?;

        Self::check_status(response).map(|_| ())
    }

    /// hand the cluster access token to the service
    pub fn push_slurm_token(&self, token: &str, slurm_token: &str) -> Result<(), SubmissionError> {
        self.post_json(
            token,
            "/api/cluster_slurm_token",
            json!({ "slurm_token": slurm_token }),
        )
    }

    /// tell the service where experiment folders live on the cluster
    pub fn push_experiment_folder(
        &self,
        token: &str,
        base_experiment_path: &str,
    ) -> Result<(), SubmissionError> {
        self.post_json(
            token,
            "/api/experiment_folder",
            json!({ "base_experiment_path": base_experiment_path }),
        )
    }

    /// current state of a submitted job
    pub fn job_status(&self, token: &str, job_uuid: &str) -> Result<RunStatus, SubmissionError> {
        let response = self
            .client
            .get(self.url(&format!("/api/slurm/{job_uuid}")))
            .bearer_auth(token)
            .send()?;

        let envelope: Envelope<JobState> = Self::check_status(response)?
            .json()
            .map_err(|error| SubmissionError::MalformedResponse(error.to_string()))?;

        Ok(status_from_state(&Self::unwrap_envelope(envelope)?.state))
    }
}
