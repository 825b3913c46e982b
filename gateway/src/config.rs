use crate::{credential::CredentialError, store::StoreError, submission::SubmissionError};
use serde::{Deserialize, Serialize};
use std::{
    env, fs,
    io::Error,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{error, info, warn};

pub const DEFAULT_EXPERIMENT_DIR: &str = "/tmp/mltf-experiments";

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("Failed to read configuration {path:?}")]
    Io { path: PathBuf, source: Error },
    #[error("Configuration is invalid")]
    Parse(#[from] serde_yaml::Error),
    #[error("Executor `{0}` not supported, please use `local`, `slurm` or `remote`")]
    UnsupportedExecutor(String),
    #[error("Store `{0}` not supported by this build")]
    UnsupportedStore(String),
    #[error("No submission API configured, set executor.base_url or SSAM_URL")]
    MissingBaseUrl,
    #[error("Credential failed to load")]
    Credential(#[from] CredentialError),
    #[error("Submission client failed to load")]
    Submission(#[from] SubmissionError),
    #[error("Run store failed to open")]
    Store(#[from] StoreError),
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    // executor selected by `name`, see ExecutorConfig
    pub executor: ExecutorConfig,
    // bootstrap scripts shipped with every run
    #[serde(default)]
    pub scripts: ScriptsConfig,
    // where the run sequence is persisted
    #[serde(default)]
    pub store: StoreConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(tag = "name", rename_all = "lowercase")]
pub enum ExecutorConfig {
    Local(LocalConfig),
    Slurm(SlurmConfig),
    Remote(RemoteConfig),
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct LocalConfig {
    // every run gets a subdirectory holding its stdout/stderr
    pub work_dir: PathBuf,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            work_dir: env::temp_dir().join("mltf-runs"),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct SlurmConfig {
    pub sbatch: String,
    pub squeue: String,
    pub sacct: String,
    pub scancel: String,
    // appended verbatim to every sbatch call, e.g. --account
    pub extra_args: Vec<String>,
    pub scratch_dir: PathBuf,
    // seconds between state queries while waiting
    pub poll_interval: u64,
}

impl Default for SlurmConfig {
    fn default() -> Self {
        Self {
            sbatch: "sbatch".to_owned(),
            squeue: "squeue".to_owned(),
            sacct: "sacct".to_owned(),
            scancel: "scancel".to_owned(),
            extra_args: Vec::new(),
            scratch_dir: env::temp_dir(),
            poll_interval: 30,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct RemoteConfig {
    pub base_url: Option<String>,
    // HTTP timeout in seconds
    pub timeout: u64,
    pub poll_interval: u64,
    pub auth: TokenConfig,
    pub slurm_token: Option<TokenConfig>,
    pub experiment_dir: Option<String>,
    pub scratch_dir: PathBuf,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout: 30,
            poll_interval: 30,
            auth: TokenConfig::default(),
            slurm_token: None,
            experiment_dir: None,
            scratch_dir: env::temp_dir(),
        }
    }
}

/// Where a bearer token comes from, exactly one of `token` and `token_file` must be set
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct TokenConfig {
    pub token: Option<String>,
    pub token_file: Option<PathBuf>,
    // swap the configured token for one issued to us
    pub exchange: Option<ExchangeConfig>,
}

impl TokenConfig {
    pub fn is_empty(&self) -> bool {
        self.token.is_none() && self.token_file.is_none()
    }

    /// inline token from `token_var`, otherwise a token file from `file_var`
    fn from_env<F: Fn(&str) -> Option<String>>(
        lookup: &F,
        token_var: &str,
        file_var: &str,
    ) -> Self {
        match lookup(token_var) {
            Some(token) => Self {
                token: Some(token),
                ..Default::default()
            },
            None => Self {
                token_file: lookup(file_var).map(PathBuf::from),
                ..Default::default()
            },
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ExchangeConfig {
    pub issuer: String,
    pub client_id: String,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub audience: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ScriptsConfig {
    pub inside: PathBuf,
    pub outside: PathBuf,
}

impl Default for ScriptsConfig {
    fn default() -> Self {
        let scripts = Path::new(env!("CARGO_MANIFEST_DIR")).join("scripts");

        Self {
            inside: scripts.join("inside.sh"),
            outside: scripts.join("outside.sh"),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(tag = "name", rename_all = "lowercase")]
pub enum StoreConfig {
    Memory,
    File {
        #[serde(default = "default_file_store")]
        path: PathBuf,
    },
    Sqlite {
        #[serde(default = "default_sqlite_store")]
        path: PathBuf,
    },
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::File {
            path: default_file_store(),
        }
    }
}

fn default_file_store() -> PathBuf {
    PathBuf::from("mltf-runs.json")
}

fn default_sqlite_store() -> PathBuf {
    PathBuf::from("mltf-runs.db")
}

impl RemoteConfig {
    /// Fill everything the file left unset from the environment
    pub fn apply_env_from<F: Fn(&str) -> Option<String>>(&mut self, lookup: F) {
        if self.base_url.is_none() {
            self.base_url = lookup("SSAM_URL");
        }

        // auth and slurm tokens never share a variable
        if self.auth.is_empty() {
            let auth = TokenConfig::from_env(&lookup, "AUTH_TOKEN", "AUTH_TOKEN_FILE");
            self.auth.token = auth.token;
            self.auth.token_file = auth.token_file;
        }

        if self.slurm_token.is_none() {
            self.slurm_token = Some(TokenConfig::from_env(
                &lookup,
                "SLURM_TOKEN",
                "SLURM_TOKEN_FILE",
            ))
            .filter(|config| !config.is_empty());
        }

        if self.experiment_dir.is_none() {
            self.experiment_dir =
                Some(lookup("PROJECT_ROOT_DIR").unwrap_or_else(|| DEFAULT_EXPERIMENT_DIR.to_owned()));
        }
    }
}

impl ExecutorConfig {
    /// default configuration for an executor selected by name
    pub fn from_name(name: &str) -> Result<Self, ConfigErrors> {
        match name.to_lowercase().as_str() {
            "local" => Ok(Self::Local(LocalConfig::default())),
            "slurm" => Ok(Self::Slurm(SlurmConfig::default())),
            "remote" => Ok(Self::Remote(RemoteConfig::default())),
            _ => Err(ConfigErrors::UnsupportedExecutor(name.to_owned())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Local(_) => "local",
            Self::Slurm(_) => "slurm",
            Self::Remote(_) => "remote",
        }
    }

    pub fn apply_env_from<F: Fn(&str) -> Option<String>>(&mut self, lookup: F) {
        if let Self::Remote(config) = self {
            config.apply_env_from(lookup);
        }
    }
}

impl GatewayConfig {
    /// read a YAML configuration and complete it from the process environment
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        let content = fs::read_to_string(path).map_err(|source| ConfigErrors::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let mut config: Self = serde_yaml::from_str(&content)?;
        config.executor.apply_env_from(|name| env::var(name).ok());

        info!(path = ?path, executor = config.executor.name(), "Loaded configuration");

        Ok(config)
    }

    /// configuration used when no file exists, only the executor is chosen
    pub fn with_executor(executor: ExecutorConfig) -> Self {
        let mut config = Self {
            executor,
            scripts: ScriptsConfig::default(),
            store: StoreConfig::default(),
        };
        config.executor.apply_env_from(|name| env::var(name).ok());

        config
    }

    pub fn preflight_checks(&mut self) -> bool {
        // attempt to catch all errors instead of piece-by-piece to make debugging easier for users
        let mut contains_error = false;

        for (name, path) in [
            ("inside", &self.scripts.inside),
            ("outside", &self.scripts.outside),
        ] {
            if !path.is_file() {
                error!(
                    "scripts.{name} ({}) is not a file, runs cannot be bootstrapped",
                    path.to_string_lossy()
                );
                contains_error = true;
            }
        }

        match &mut self.executor {
            ExecutorConfig::Local(config) => {
                if let Err(e) = fs::create_dir_all(&config.work_dir) {
                    error!(
                        "executor.work_dir ({}) cannot be created: {e}",
                        config.work_dir.to_string_lossy()
                    );
                    contains_error = true;
                }
            }
            ExecutorConfig::Slurm(config) => {
                if !config.scratch_dir.is_dir() {
                    error!(
                        "executor.scratch_dir ({}) is not a directory",
                        config.scratch_dir.to_string_lossy()
                    );
                    contains_error = true;
                }

                if config.poll_interval == 0 {
                    warn!("executor.poll_interval is 0, falling back to 1 second");
                    config.poll_interval = 1;
                }
            }
            ExecutorConfig::Remote(config) => {
                match config.base_url.as_deref() {
                    None => {
                        error!("executor.base_url is not set and SSAM_URL is empty");
                        contains_error = true;
                    }
                    Some(url) if !url.starts_with("http://") && !url.starts_with("https://") => {
                        error!("executor.base_url ({url}) must be an http(s) URL");
                        contains_error = true;
                    }
                    Some(_) => {}
                }

                if config.auth.is_empty() {
                    error!("executor.auth has neither token nor token_file and AUTH_TOKEN(_FILE) is empty");
                    contains_error = true;
                } else if config.auth.token.is_some() && config.auth.token_file.is_some() {
                    error!("executor.auth sets both token and token_file, please pick one");
                    contains_error = true;
                }

                if config.slurm_token.is_none() {
                    warn!("No Slurm token configured, the submission API has to know one already");
                }

                if !config.scratch_dir.is_dir() {
                    error!(
                        "executor.scratch_dir ({}) is not a directory",
                        config.scratch_dir.to_string_lossy()
                    );
                    contains_error = true;
                }

                if config.timeout == 0 {
                    error!("executor.timeout cannot be 0");
                    contains_error = true;
                }

                if config.poll_interval == 0 {
                    warn!("executor.poll_interval is 0, falling back to 1 second");
                    config.poll_interval = 1;
                }
            }
        }

        if matches!(self.store, StoreConfig::Sqlite { .. }) && !cfg!(feature = "sqlite") {
            error!("store.name (sqlite) needs the `sqlite` feature");
            contains_error = true;
        }

        contains_error
    }
}
