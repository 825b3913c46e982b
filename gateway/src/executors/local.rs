use super::{run_environment, Executor, ExecutorError, RunHandle};
use crate::{
    config::LocalConfig,
    run::{ExecutionSnippet, RunRequest, RunStatus},
};
use itertools::Itertools;
use nix::{
    sys::signal::{kill, killpg, Signal},
    unistd::{setsid, Pid},
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{
    fs::{self, File},
    io,
    os::unix::process::CommandExt,
    path::{Component, Path, PathBuf},
    process::{Child, Command, ExitStatus, Stdio},
    sync::Arc,
    thread,
    time::Duration,
};
use tracing::{debug, info, instrument, warn};
use wait_timeout::ChildExt;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Executor that starts runs as processes on this machine
#[derive(Debug)]
pub struct LocalExecutor {
    work_dir: PathBuf,
}

impl LocalExecutor {
    pub fn load(config: &LocalConfig) -> Self {
        Self {
            work_dir: config.work_dir.clone(),
        }
    }

    /// fresh directory below `work_dir` named after the run id
    fn create_run_dir(&self, run_id: &str) -> Result<PathBuf, ExecutorError> {
        // exactly one plain component, no separators, `.` or `..`
        let mut components = Path::new(run_id).components();
        let single = matches!(
            (components.next(), components.next()),
            (Some(Component::Normal(_)), None)
        );
        if !single || run_id.contains('/') {
            return Err(ExecutorError::InvalidRunId(run_id.to_owned()));
        }

        fs::create_dir_all(&self.work_dir).map_err(ExecutorError::Scratch)?;

        let run_dir = self.work_dir.join(run_id);
        match fs::create_dir(&run_dir) {
            Ok(()) => Ok(run_dir),
            Err(error) if error.kind() == io::ErrorKind::AlreadyExists => {
                Err(ExecutorError::RunDirectoryExists(run_dir))
            }
            Err(error) => Err(ExecutorError::Scratch(error)),
        }
    }
}

impl Executor for LocalExecutor {
    /// spawn the command line in its own session, so it outlives the gateway
    #[instrument(skip_all, fields(run_id = %request.run_id), level = "info")]
    fn run_context_async(
        &self,
        snippet: ExecutionSnippet,
        request: &RunRequest,
    ) -> Result<RunHandle, ExecutorError> {
        // shared filesystem, files stay where they are
        let command = snippet.resolve()?;
        let printable = command.iter().join(" ");
        let spawn_error = |source: io::Error| ExecutorError::Spawn {
            command: printable.clone(),
            source,
        };

        let Some((program, args)) = command.split_first() else {
            return Err(spawn_error(io::Error::new(
                io::ErrorKind::InvalidInput,
                "empty command line",
            )));
        };

        let run_dir = self.create_run_dir(&request.run_id)?;
        let stdout = File::create(run_dir.join("stdout.log")).map_err(spawn_error)?;
        let stderr = File::create(run_dir.join("stderr.log")).map_err(spawn_error)?;

        let mut process = Command::new(program);
        process
            .args(args)
            .current_dir(&run_dir)
            .envs(run_environment(request))
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr);

        // SAFETY: setsid is async-signal-safe and nothing else runs between fork and exec
        unsafe {
            process.pre_exec(|| setsid().map(|_| ()).map_err(io::Error::from));
        }

        let child = process.spawn().map_err(spawn_error)?;
        let pid = child.id();

        info!(pid = pid, run_dir = ?run_dir, "Started local run");

        Ok(RunHandle::Local(LocalHandle {
            pid,
            command,
            process: Some(Arc::new(Mutex::new(LocalProcess { child, exit: None }))),
        }))
    }

    fn backend(&self) -> &'static str {
        "local"
    }
}

#[derive(Debug)]
struct LocalProcess {
    child: Child,
    exit: Option<ExitStatus>,
}

fn status_from_exit(exit: ExitStatus) -> RunStatus {
    if exit.success() {
        RunStatus::Completed
    } else {
        RunStatus::Failed
    }
}

impl LocalProcess {
    fn poll(&mut self) -> RunStatus {
        if let Some(exit) = self.exit {
            return status_from_exit(exit);
        }

        match self.child.try_wait() {
            Ok(Some(exit)) => {
                self.exit = Some(exit);
                status_from_exit(exit)
            }
            Ok(None) => RunStatus::Running,
            Err(error) => {
                warn!(pid = self.child.id(), error = ?error, "Failed to poll child process");
                RunStatus::Unknown
            }
        }
    }
}

/// Handle on a local process.
///
/// Only the pid survives serialization. A handle read back after a restart
/// can tell whether the process is still alive but no longer learns its exit
/// status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalHandle {
    pub pid: u32,
    pub command: Vec<String>,
    #[serde(skip)]
    process: Option<Arc<Mutex<LocalProcess>>>,
}

impl LocalHandle {
    fn detached_status(&self) -> RunStatus {
        // signal 0 only checks for existence
        match kill(Pid::from_raw(self.pid as i32), None::<Signal>) {
            Ok(()) => RunStatus::Running,
            Err(_) => RunStatus::Unknown,
        }
    }

    pub fn is_attached(&self) -> bool {
        self.process.is_some()
    }

    pub fn status(&self) -> RunStatus {
        match &self.process {
            Some(process) => process.lock().poll(),
            None => self.detached_status(),
        }
    }

    pub fn wait(&self) -> Result<RunStatus, ExecutorError> {
        let Some(process) = &self.process else {
            while self.detached_status() == RunStatus::Running {
                thread::sleep(POLL_INTERVAL);
            }

            return Ok(RunStatus::Unknown);
        };

        loop {
            // lock only per poll so status queries stay responsive
            let mut process = process.lock();

            if let Some(exit) = process.exit {
                return Ok(status_from_exit(exit));
            }

            match process.child.wait_timeout(POLL_INTERVAL) {
                Ok(Some(exit)) => {
                    debug!(pid = self.pid, exit = ?exit, "Local run finished");
                    process.exit = Some(exit);

                    return Ok(status_from_exit(exit));
                }
                Ok(None) => {}
                Err(error) => return Err(ExecutorError::Query(error.to_string())),
            }
        }
    }

    /// terminate the whole process group started for this run
    pub fn cancel(&self) -> Result<(), ExecutorError> {
        if self.status().is_terminal() {
            return Ok(());
        }

        killpg(Pid::from_raw(self.pid as i32), Signal::SIGTERM).map_err(|error| {
            ExecutorError::Query(format!("failed to signal {}: {error}", self.pid))
        })?;

        info!(pid = self.pid, "Sent SIGTERM to local run");

        Ok(())
    }
}
