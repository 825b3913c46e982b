use super::{combine_statuses, poll_until_terminal, wrapper, Executor, ExecutorError, RunHandle};
use crate::{
    config::SlurmConfig,
    run::{ExecutionSnippet, RunRequest, RunStatus},
    submission::SlurmRequest,
};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::{
    path::PathBuf,
    process::{Command, Output},
    time::Duration,
};
use tracing::{debug, info, instrument, warn};

/// Map a Slurm job state (as printed by squeue/sacct or the submission API) to a run status
pub fn status_from_state(state: &str) -> RunStatus {
    // sacct prints e.g. `CANCELLED by 1000` or `COMPLETED+`
    let state = state
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .trim_end_matches('+')
        .to_uppercase();

    match state.as_str() {
        "PENDING" | "RUNNING" | "CONFIGURING" | "COMPLETING" | "REQUEUED" | "RESIZING"
        | "SUSPENDED" | "STAGE_OUT" | "SIGNALING" => RunStatus::Running,
        "COMPLETED" => RunStatus::Completed,
        "FAILED" | "CANCELLED" | "TIMEOUT" | "NODE_FAIL" | "OUT_OF_MEMORY" | "PREEMPTED"
        | "BOOT_FAIL" | "DEADLINE" | "REVOKED" => RunStatus::Failed,
        _ => RunStatus::Unknown,
    }
}

/// Slurm client binaries, kept with every handle so they work after a restart
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlurmCommands {
    pub squeue: String,
    pub sacct: String,
    pub scancel: String,
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,
}

fn default_poll_interval() -> u64 {
    30
}

fn run(program: &str, args: &[String]) -> Result<Output, ExecutorError> {
    Command::new(program)
        .args(args)
        .output()
        .map_err(|source| ExecutorError::Spawn {
            command: format!("{program} {}", args.join(" ")),
            source,
        })
}

/// Executor that submits batch jobs with `sbatch` on a cluster sharing our filesystem
#[derive(Debug)]
pub struct SlurmExecutor {
    sbatch: String,
    extra_args: Vec<String>,
    scratch_dir: PathBuf,
    commands: SlurmCommands,
}

impl SlurmExecutor {
    pub fn load(config: &SlurmConfig) -> Self {
        Self {
            sbatch: config.sbatch.clone(),
            extra_args: config.extra_args.clone(),
            scratch_dir: config.scratch_dir.clone(),
            commands: SlurmCommands {
                squeue: config.squeue.clone(),
                sacct: config.sacct.clone(),
                scancel: config.scancel.clone(),
                poll_interval: config.poll_interval,
            },
        }
    }
}

impl Executor for SlurmExecutor {
    #[instrument(skip_all, fields(run_id = %request.run_id), level = "info")]
    fn run_context_async(
        &self,
        snippet: ExecutionSnippet,
        request: &RunRequest,
    ) -> Result<RunHandle, ExecutorError> {
        let command = snippet.resolve()?;
        let slurm_request = SlurmRequest::from_backend_config(&request.backend_config)?;
        let script = wrapper::write_scratch(
            &self.scratch_dir,
            &wrapper::render(&command, request)?,
        )?;

        let mut args = vec!["--parsable".to_owned()];
        args.extend(slurm_request.sbatch_args());
        args.extend(self.extra_args.iter().cloned());
        args.push(script.path().to_string_lossy().into_owned());

        // sbatch keeps its own copy of the script, ours goes away with `script`
        let output = run(&self.sbatch, &args)?;
        if let Err(error) = script.close() {
            warn!(error = ?error, "Failed to remove wrapper script");
        }

        if !output.status.success() {
            return Err(ExecutorError::Command {
                command: self.sbatch.clone(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }

        // --parsable prints `jobid` or `jobid;cluster`
        let stdout = String::from_utf8_lossy(&output.stdout);
        let job_id = stdout
            .trim()
            .split(';')
            .next()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ExecutorError::Command {
                command: self.sbatch.clone(),
                stderr: format!("no job id in output `{}`", stdout.trim()),
            })?
            .to_owned();

        info!(job_id = %job_id, "Submitted batch job");

        Ok(RunHandle::Slurm(SlurmHandle {
            job_ids: vec![job_id],
            commands: self.commands.clone(),
        }))
    }

    fn backend(&self) -> &'static str {
        "slurm"
    }
}

/// Handle on jobs submitted with `sbatch`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlurmHandle {
    pub job_ids: Vec<String>,
    pub commands: SlurmCommands,
}

impl SlurmHandle {
    fn query(&self, program: &str, args: &[String]) -> Option<String> {
        match run(program, args) {
            Ok(output) if output.status.success() => {
                let stdout = String::from_utf8_lossy(&output.stdout).trim().to_owned();
                (!stdout.is_empty()).then_some(stdout)
            }
            Ok(output) => {
                debug!(
                    program = program,
                    stderr = %String::from_utf8_lossy(&output.stderr),
                    "State query failed"
                );
                None
            }
            Err(error) => {
                warn!(error = ?error, "Failed to query job state");
                None
            }
        }
    }

    fn job_status(&self, job_id: &str) -> RunStatus {
        // squeue only knows about jobs that haven't left the queue yet
        let state = self
            .query(
                &self.commands.squeue,
                &["-h".into(), "-j".into(), job_id.into(), "-o".into(), "%T".into()],
            )
            .or_else(|| {
                self.query(
                    &self.commands.sacct,
                    &[
                        "-n".into(),
                        "-X".into(),
                        "-P".into(),
                        "-j".into(),
                        job_id.into(),
                        "-o".into(),
                        "State".into(),
                    ],
                )
            });

        match state {
            Some(state) => status_from_state(state.lines().next().unwrap_or_default()),
            None => RunStatus::Unknown,
        }
    }

    pub fn status(&self) -> RunStatus {
        combine_statuses(self.job_ids.iter().map(|job_id| self.job_status(job_id)))
    }

    pub fn wait(&self) -> Result<RunStatus, ExecutorError> {
        poll_until_terminal(
            &self.job_ids,
            Duration::from_secs(self.commands.poll_interval),
            || self.status(),
        )
    }

    pub fn cancel(&self) -> Result<(), ExecutorError> {
        let output = run(&self.commands.scancel, &self.job_ids)?;

        if output.status.success() {
            info!(job_ids = %self.job_ids.iter().join(","), "Cancelled batch job");
            Ok(())
        } else {
            Err(ExecutorError::Command {
                command: self.commands.scancel.clone(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::CommandToken;
    use std::{collections::BTreeMap, fs, os::unix::fs::PermissionsExt, path::Path};

    /// executable stand-in for a Slurm client binary
    fn fake_binary(directory: &Path, name: &str, body: &str) -> String {
        let path = directory.join(name);
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();

        path.to_string_lossy().into_owned()
    }

    fn config(bin: &Path, scratch: &Path) -> SlurmConfig {
        SlurmConfig {
            sbatch: fake_binary(bin, "sbatch", r#"echo "$@" > "$(dirname "$0")/sbatch.args"; echo '4242;cluster'"#),
            squeue: fake_binary(bin, "squeue", "echo RUNNING"),
            sacct: fake_binary(bin, "sacct", "exit 1"),
            scancel: fake_binary(bin, "scancel", "exit 0"),
            extra_args: vec!["--account=mltf".to_owned()],
            scratch_dir: scratch.to_path_buf(),
            poll_interval: 1,
        }
    }

    fn request() -> RunRequest {
        RunRequest {
            run_id: "run-7".to_owned(),
            tarball_path: "/tmp/project.tar.gz".into(),
            entry_point: "main".to_owned(),
            params: BTreeMap::new(),
            backend_config: serde_json::from_value(serde_json::json!({"nodes": 2})).unwrap(),
            tracking_uri: "http://localhost:5000".to_owned(),
            experiment_id: "0".to_owned(),
            user_subject: "tester".to_owned(),
        }
    }

    fn snippet() -> ExecutionSnippet {
        ExecutionSnippet {
            command: vec![CommandToken::Literal("true".to_owned())],
            files: BTreeMap::new(),
        }
    }

    #[test]
    fn state_mapping() {
        assert_eq!(status_from_state("PENDING"), RunStatus::Running);
        assert_eq!(status_from_state("COMPLETED+"), RunStatus::Completed);
        assert_eq!(status_from_state("CANCELLED by 1000"), RunStatus::Failed);
        assert_eq!(status_from_state("running"), RunStatus::Running);
        assert_eq!(status_from_state(""), RunStatus::Unknown);
    }

    #[test]
    fn submits_with_sbatch() {
        let bin = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let executor = SlurmExecutor::load(&config(bin.path(), scratch.path()));

        let handle = executor.run_context_async(snippet(), &request()).unwrap();

        assert_eq!(handle.job_ids(), vec!["4242".to_owned()]);
        assert_eq!(handle.status(), RunStatus::Running);
        handle.cancel().unwrap();

        let args = fs::read_to_string(bin.path().join("sbatch.args")).unwrap();
        assert!(args.starts_with("--parsable"));
        assert!(args.contains("--nodes=2"));
        assert!(args.contains("--account=mltf"));
        // wrapper script is gone once sbatch returned
        assert_eq!(fs::read_dir(scratch.path()).unwrap().count(), 0);
    }

    #[test]
    fn sbatch_failure_is_reported_and_cleaned_up() {
        let bin = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let mut config = config(bin.path(), scratch.path());
        config.sbatch = fake_binary(
            bin.path(),
            "sbatch-broken",
            "echo 'invalid partition' >&2; exit 1",
        );

        let error = SlurmExecutor::load(&config)
            .run_context_async(snippet(), &request())
            .unwrap_err();

        assert!(matches!(
            error,
            ExecutorError::Command { stderr, .. } if stderr == "invalid partition"
        ));
        assert_eq!(fs::read_dir(scratch.path()).unwrap().count(), 0);
    }

    #[test]
    fn finished_jobs_fall_back_to_sacct() {
        let bin = tempfile::tempdir().unwrap();
        let handle = SlurmHandle {
            job_ids: vec!["1".to_owned()],
            commands: SlurmCommands {
                squeue: fake_binary(bin.path(), "squeue", "exit 0"),
                sacct: fake_binary(bin.path(), "sacct", "echo COMPLETED"),
                scancel: "scancel".to_owned(),
                poll_interval: 1,
            },
        };

        assert_eq!(handle.wait().unwrap(), RunStatus::Completed);
    }

    #[test]
    fn wait_outlasts_a_lagging_accounting_query() {
        let bin = tempfile::tempdir().unwrap();
        // unknown to both tools on the first poll, finished on the second
        let sacct = r#"count="$0.count"
polls=$(cat "$count" 2>/dev/null || echo 0)
echo $((polls + 1)) > "$count"
[ "$polls" -ge 1 ] || exit 1
echo COMPLETED"#;
        let handle = SlurmHandle {
            job_ids: vec!["1".to_owned()],
            commands: SlurmCommands {
                squeue: fake_binary(bin.path(), "squeue", "exit 0"),
                sacct: fake_binary(bin.path(), "sacct", sacct),
                scancel: "scancel".to_owned(),
                poll_interval: 1,
            },
        };

        assert_eq!(handle.wait().unwrap(), RunStatus::Completed);
        assert_eq!(
            fs::read_to_string(bin.path().join("sacct.count")).unwrap().trim(),
            "2"
        );
    }
}
