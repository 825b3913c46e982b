use chrono::{TimeZone, Utc};
use clap::{Args, Parser, Subcommand};
use mltf_gateway::{
    config::{ExecutorConfig, GatewayConfig},
    credential::{Claims, CredentialError, TokenSource},
    GatewayServer, RegistryError, RunReference, RunRequest, RunStatus,
};
use serde::Serialize;
use std::{path::PathBuf, process::ExitCode};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tracing_unwrap::ResultExt;

#[derive(Parser)]
#[command(name = "mltf-gateway", version, about = "Dispatch MLflow project runs to a local, Slurm or remote executor", long_about = None)]
struct Cli {
    /// YAML configuration
    #[arg(short, long, default_value = "gateway.yaml", env = "MLTF_GATEWAY_CONFIG")]
    config: PathBuf,

    /// Skip the configuration file and use the defaults of this executor (local, slurm, remote)
    #[arg(long)]
    executor: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a run and print its reference
    Submit(SubmitArgs),
    /// Print the current state of a run
    Status { reference: RunReference },
    /// Block until a run finished and print its final state
    Wait { reference: RunReference },
    /// Stop a run
    Cancel { reference: RunReference },
    /// List runs of a user as JSON
    List {
        #[arg(long, env = "USER", default_value = "")]
        user: String,
        /// include completed and failed runs
        #[arg(long)]
        all: bool,
    },
    /// Show the claims of the configured auth token
    AuthStatus,
}

#[derive(Args)]
struct SubmitArgs {
    /// run id issued by the tracking service
    #[arg(long)]
    run_id: String,
    /// packaged project tarball
    #[arg(long)]
    bundle: PathBuf,
    #[arg(long, default_value = "main")]
    entry_point: String,
    /// entry point parameter, repeatable
    #[arg(short = 'P', long = "param", value_parser = parse_key_value)]
    params: Vec<(String, String)>,
    /// backend option such as nodes=2 or mem=8gb, repeatable
    #[arg(short = 'B', long = "backend-config", value_parser = parse_key_value)]
    backend_config: Vec<(String, String)>,
    #[arg(long, env = "MLFLOW_TRACKING_URI", default_value = "http://localhost:5000")]
    tracking_uri: String,
    #[arg(long, default_value = "0")]
    experiment_id: String,
    #[arg(long, env = "USER", default_value = "")]
    user: String,
}

fn parse_key_value(argument: &str) -> Result<(String, String), String> {
    match argument.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_owned(), value.to_owned())),
        _ => Err(format!("expected KEY=VALUE, got `{argument}`")),
    }
}

impl SubmitArgs {
    fn into_request(self) -> RunRequest {
        RunRequest {
            run_id: self.run_id,
            tarball_path: self.bundle,
            entry_point: self.entry_point,
            params: self.params.into_iter().collect(),
            // `2` becomes a number, `8gb` stays a string
            backend_config: self
                .backend_config
                .into_iter()
                .map(|(key, value)| {
                    let parsed =
                        serde_json::from_str(&value).unwrap_or(serde_json::Value::String(value));
                    (key, parsed)
                })
                .collect(),
            tracking_uri: self.tracking_uri,
            experiment_id: self.experiment_id,
            user_subject: self.user,
        }
    }
}

#[derive(Serialize)]
struct TokenReport {
    subject: String,
    issuer: Option<String>,
    issued_at: Option<String>,
    expires_at: String,
    expired: bool,
    needs_refresh: bool,
}

fn auth_status(config: &GatewayConfig) -> Result<TokenReport, CredentialError> {
    let ExecutorConfig::Remote(remote) = &config.executor else {
        return Err(CredentialError::MissingSource);
    };

    let source = TokenSource::from_parts(remote.auth.token.clone(), remote.auth.token_file.clone())?;
    let claims = Claims::decode(&source.read()?)?;
    let now = Utc::now();

    Ok(TokenReport {
        subject: claims.subject().to_owned(),
        issuer: claims.iss.clone(),
        issued_at: claims
            .iat
            .and_then(|iat| Utc.timestamp_opt(iat, 0).single())
            .map(|iat| iat.to_rfc3339()),
        expires_at: claims.expires_at().to_rfc3339(),
        expired: claims.is_expired_at(now),
        needs_refresh: claims.needs_refresh_at(now),
    })
}

fn execute(config: &GatewayConfig, command: Commands) -> Result<ExitCode, RegistryError> {
    // auth-status works without touching the executor or the store
    let open = || GatewayServer::load(config).unwrap_or_log();

    match command {
        Commands::Submit(args) => {
            let reference = open().enqueue_client(args.into_request())?;
            println!("{reference}");
        }
        Commands::Status { reference } => println!("{}", open().status(&reference)?),
        Commands::Wait { reference } => {
            let status = open().wait(&reference)?;
            println!("{status}");

            if status == RunStatus::Failed {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Cancel { reference } => {
            open().cancel(&reference)?;
            info!(reference = %reference, "Cancelled run");
        }
        Commands::List { user, all } => {
            let summaries = open().list(&user, all);
            println!("{}", serde_json::to_string_pretty(&summaries).unwrap_or_log());
        }
        Commands::AuthStatus => {
            let report = auth_status(config).unwrap_or_log();
            println!("{}", serde_json::to_string_pretty(&report).unwrap_or_log());

            if report.expired {
                return Ok(ExitCode::FAILURE);
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.executor {
        Some(name) => GatewayConfig::with_executor(ExecutorConfig::from_name(name).unwrap_or_log()),
        None => GatewayConfig::load(&cli.config).unwrap_or_log(),
    };

    if config.preflight_checks() {
        error!("Configuration contains errors, see above");
        return ExitCode::FAILURE;
    }

    match execute(&config, cli.command) {
        Ok(code) => code,
        Err(error) => {
            error!(error = ?error, "{error}");
            ExitCode::FAILURE
        }
    }
}
