use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

pub const DEFAULT_JOB_NAME: &str = "mlflow-job";
pub const DEFAULT_PARTITION: &str = "shared";
pub const DEFAULT_MEMORY: &str = "4gb";
pub const DEFAULT_TIME: &str = "00:05:00";

#[derive(Error, Debug)]
pub enum RequestError {
    #[error("backend_config.{key} {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Resource request sent along with every Slurm submission
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SlurmRequest {
    pub job_name: String,
    pub partition: String,
    pub nodes: u32,
    #[serde(rename = "ntasks-per-node")]
    pub ntasks_per_node: u32,
    #[serde(rename = "cpus-per-task")]
    pub cpus_per_task: u32,
    pub mem: String,
    pub time: String,
    pub gpus: Option<u32>,
}

impl Default for SlurmRequest {
    fn default() -> Self {
        Self {
            job_name: DEFAULT_JOB_NAME.to_owned(),
            partition: DEFAULT_PARTITION.to_owned(),
            nodes: 1,
            ntasks_per_node: 1,
            cpus_per_task: 1,
            mem: DEFAULT_MEMORY.to_owned(),
            time: DEFAULT_TIME.to_owned(),
            gpus: None,
        }
    }
}

fn as_count(key: &'static str, value: &Value) -> Result<u32, RequestError> {
    let invalid = |reason: &str| RequestError::Invalid {
        key,
        reason: reason.to_owned(),
    };

    let number = match value {
        Value::Number(number) => number
            .as_u64()
            .ok_or_else(|| invalid("must be a non-negative integer"))?,
        Value::String(string) => string
            .trim()
            .parse::<u64>()
            .map_err(|_| invalid("must be a non-negative integer"))?,
        _ => return Err(invalid("must be a non-negative integer")),
    };

    u32::try_from(number).map_err(|_| invalid("is too large"))
}

fn as_text(key: &'static str, value: &Value) -> Result<String, RequestError> {
    match value {
        Value::String(string) => Ok(string.clone()),
        Value::Number(number) => Ok(number.to_string()),
        _ => Err(RequestError::Invalid {
            key,
            reason: "must be a string".to_owned(),
        }),
    }
}

impl SlurmRequest {
    /// derive the request from a run's backend configuration, keys that are absent keep their defaults
    pub fn from_backend_config(config: &BTreeMap<String, Value>) -> Result<Self, RequestError> {
        let mut request = Self::default();

        for (key, value) in config.iter() {
            match key.as_str() {
                "job_name" => request.job_name = as_text("job_name", value)?,
                "partition" => request.partition = as_text("partition", value)?,
                "nodes" => request.nodes = as_count("nodes", value)?,
                "ntasks-per-node" => request.ntasks_per_node = as_count("ntasks-per-node", value)?,
                "cpus-per-task" => request.cpus_per_task = as_count("cpus-per-task", value)?,
                "mem" => request.mem = as_text("mem", value)?,
                "time" => request.time = as_text("time", value)?,
                "gpus" => {
                    request.gpus = match value {
                        Value::Null => None,
                        value => Some(as_count("gpus", value)?),
                    }
                }
                // everything else is meant for other consumers of the backend config
                _ => {}
            }
        }

        Ok(request)
    }

    /// the same request expressed as `sbatch` options
    pub fn sbatch_args(&self) -> Vec<String> {
        let mut args = vec![
            format!("--job-name={}", self.job_name),
            format!("--partition={}", self.partition),
            format!("--nodes={}", self.nodes),
            format!("--ntasks-per-node={}", self.ntasks_per_node),
            format!("--cpus-per-task={}", self.cpus_per_task),
            // sbatch wants `8G`, clients tend to write `8gb`
            format!(
                "--mem={}",
                self.mem.trim_end_matches(['b', 'B']).to_uppercase()
            ),
            format!("--time={}", self.time),
        ];

        if let Some(gpus) = self.gpus {
            args.push(format!("--gpus={gpus}"));
        }

        args
    }
}
