use serde::{Deserialize, Serialize};
use std::{
    fs::{File, OpenOptions},
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum MoveError {
    #[error("{0} was already relocated once")]
    AlreadyRelocated(PathBuf),
    #[error("{0} has no file name")]
    NoFileName(PathBuf),
    #[error("Relocation target {0} is not a directory")]
    NotADirectory(PathBuf),
    #[error("Relocation target {0} already exists")]
    Collision(PathBuf),
    #[error("Failed to copy file")]
    Io(#[from] io::Error),
}

/// A path that can travel inside a command line and later be moved by an
/// executor that doesn't share a filesystem with the caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovableReference {
    target: PathBuf,
    #[serde(default)]
    relocated: bool,
}

impl MovableReference {
    pub fn new<P: Into<PathBuf>>(target: P) -> Self {
        Self {
            target: target.into(),
            relocated: false,
        }
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    pub fn is_relocated(&self) -> bool {
        self.relocated
    }

    pub fn base_name(&self) -> Option<String> {
        self.target
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
    }

    /// Copy the file into `directory` and point this reference at the copy.
    ///
    /// A reference is only ever relocated once and an existing file in the
    /// target directory is never overwritten.
    pub fn relocate_to(&mut self, directory: &Path) -> Result<&Path, MoveError> {
        if self.relocated {
            return Err(MoveError::AlreadyRelocated(self.target.clone()));
        }

        if !directory.is_dir() {
            return Err(MoveError::NotADirectory(directory.to_path_buf()));
        }

        let file_name = self
            .target
            .file_name()
            .ok_or_else(|| MoveError::NoFileName(self.target.clone()))?;
        let destination = directory.join(file_name);
        let mut input = File::open(&self.target)?;

        // create_new makes the collision check and the creation a single step
        let mut output = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&destination)
        {
            Ok(output) => output,
            Err(error) if error.kind() == ErrorKind::AlreadyExists => {
                return Err(MoveError::Collision(destination))
            }
            Err(error) => return Err(error.into()),
        };
        io::copy(&mut input, &mut output)?;

        debug!(from = ?self.target, to = ?destination, "Relocated file");

        self.target = destination;
        self.relocated = true;

        Ok(&self.target)
    }
}
