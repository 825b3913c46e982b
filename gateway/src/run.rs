pub mod movable;

pub use movable::{MovableReference, MoveError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, path::PathBuf, str::FromStr};
use thiserror::Error;
use uuid::Uuid;

/// Everything a client hands over for a single run, immutable once created
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRequest {
    /// run identifier issued by the tracking service (or chosen by the caller)
    pub run_id: String,
    /// packaged project bundle
    pub tarball_path: PathBuf,
    pub entry_point: String,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    /// free form backend options, resource requests are derived from these
    #[serde(default)]
    pub backend_config: BTreeMap<String, serde_json::Value>,
    pub tracking_uri: String,
    pub experiment_id: String,
    /// subject of the submitting user, filled in by the front door
    #[serde(default)]
    pub user_subject: String,
}

/// Client facing execution state of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Unknown,
}

impl RunStatus {
    /// true once the run can no longer change state
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Unknown => "unknown",
        })
    }
}

/// Opaque handle exchanged with clients instead of the record itself.
///
/// Minted once per enqueue and never derived from the position of a record,
/// so it survives restarts of a persisted registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunReference(Uuid);

impl RunReference {
    pub fn mint() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for RunReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for RunReference {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// Read-only projection of a run that is safe to hand to clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub reference: RunReference,
    pub run_id: String,
    pub entry_point: String,
    pub experiment_id: String,
    pub user_subject: String,
    pub backend: String,
    pub status: RunStatus,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Error, Debug)]
pub enum SnippetError {
    #[error("Command line references `{0}` which is not part of the file catalog")]
    UnknownFile(String),
}

/// A single argument of an execution snippet
#[derive(Debug, Clone, PartialEq)]
pub enum CommandToken {
    Literal(String),
    /// logical name of an entry in the file catalog
    File(String),
}

/// What to run and which files it needs
#[derive(Debug, Clone, Default)]
pub struct ExecutionSnippet {
    pub command: Vec<CommandToken>,
    pub files: BTreeMap<String, MovableReference>,
}

impl ExecutionSnippet {
    /// turn the command line into plain strings, file tokens are rendered with `render`
    pub fn resolve_with<F>(&self, render: F) -> Result<Vec<String>, SnippetError>
    where
        F: Fn(&MovableReference) -> String,
    {
        self.command
            .iter()
            .map(|token| match token {
                CommandToken::Literal(value) => Ok(value.clone()),
                CommandToken::File(name) => self
                    .files
                    .get(name)
                    .map(&render)
                    .ok_or_else(|| SnippetError::UnknownFile(name.clone())),
            })
            .collect()
    }

    /// resolve file tokens to wherever the files currently live
    pub fn resolve(&self) -> Result<Vec<String>, SnippetError> {
        self.resolve_with(|reference| reference.target().to_string_lossy().into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snippet() -> ExecutionSnippet {
        let mut files = BTreeMap::new();
        files.insert(
            "inside.sh".to_owned(),
            MovableReference::new("/opt/mltf/inside.sh"),
        );

        ExecutionSnippet {
            command: vec![
                CommandToken::Literal("/bin/bash".to_owned()),
                CommandToken::File("inside.sh".to_owned()),
            ],
            files,
        }
    }

    #[test]
    fn resolve_uses_current_targets() {
        assert_eq!(
            snippet().resolve().unwrap(),
            vec!["/bin/bash".to_owned(), "/opt/mltf/inside.sh".to_owned()]
        );
    }

    #[test]
    fn resolve_with_custom_renderer() {
        let resolved = snippet()
            .resolve_with(|reference| format!("input/{}", reference.base_name().unwrap()))
            .unwrap();

        assert_eq!(resolved[1], "input/inside.sh");
    }

    #[test]
    fn resolve_rejects_unknown_files() {
        let mut snippet = snippet();
        snippet
            .command
            .push(CommandToken::File("missing".to_owned()));

        assert!(matches!(
            snippet.resolve(),
            Err(SnippetError::UnknownFile(name)) if name == "missing"
        ));
    }

    #[test]
    fn reference_parses_its_own_display() {
        let reference = RunReference::mint();

        assert_eq!(reference.to_string().parse::<RunReference>().unwrap(), reference);
        assert!("not-a-reference".parse::<RunReference>().is_err());
    }

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&RunStatus::Completed).unwrap(),
            "\"completed\""
        );
        assert!(RunStatus::Failed.is_terminal());
        assert!(!RunStatus::Unknown.is_terminal());
    }
}
