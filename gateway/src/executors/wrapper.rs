use super::{run_environment, ExecutorError};
use crate::run::RunRequest;
use itertools::Itertools;
use minijinja::{context, Environment};
use std::{io::Write, path::Path};
use tempfile::NamedTempFile;

const WRAPPER_NAME: &str = "slurm-wrapper.sh";
const WRAPPER_TEMPLATE: &str = include_str!("../../templates/slurm-wrapper.sh");

/// quote a single word for a POSIX shell
pub fn shell_quote(word: &str) -> String {
    let is_plain = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_@%+=:,./-".contains(c));

    if is_plain {
        word.to_owned()
    } else {
        format!("'{}'", word.replace('\'', r#"'"'"'"#))
    }
}

pub fn shell_join<S: AsRef<str>>(words: &[S]) -> String {
    words.iter().map(|word| shell_quote(word.as_ref())).join(" ")
}

/// render the batch script wrapping `command`
pub fn render(command: &[String], request: &RunRequest) -> Result<String, ExecutorError> {
    let mut environment = Environment::new();
    environment.add_template(WRAPPER_NAME, WRAPPER_TEMPLATE)?;

    let exports = run_environment(request)
        .into_iter()
        .map(|(key, value)| format!("export {key}={}", shell_quote(&value)))
        .collect_vec();

    Ok(environment.get_template(WRAPPER_NAME)?.render(context! {
        run_id => request.run_id,
        exports => exports,
        command => shell_join(command),
    })?)
}

/// Write the wrapper to a scratch file, removed again once the returned value is dropped
pub fn write_scratch(directory: &Path, content: &str) -> Result<NamedTempFile, ExecutorError> {
    let mut file = tempfile::Builder::new()
        .prefix("mltf-wrapper-")
        .suffix(".sh")
        .tempfile_in(directory)
        .map_err(ExecutorError::Scratch)?;

    file.write_all(content.as_bytes())
        .and_then(|_| file.flush())
        .map_err(ExecutorError::Scratch)?;

    Ok(file)
}
