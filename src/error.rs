use std::{path::PathBuf, time::Duration};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("No files were found in stream {stream} between {start} and {end}")]
    NoInputFiles {
        stream: String,
        start: String,
        end: String,
    },

    #[error("Insufficient coverage in {section}: {reason}")]
    InsufficientCoverage { section: String, reason: String },

    #[error("{variable} is not available in {stream} output:\n{}", .available.join(", "))]
    VariableUnavailable {
        variable: String,
        stream: String,
        available: Vec<String>,
    },

    #[error(
        "Output {} is missing required variables ({}) and will be rebuilt",
        .path.display(),
        .missing.join(", ")
    )]
    StaleProductVariableMismatch { path: PathBuf, missing: Vec<String> },

    #[error("{program} not found. Make sure the latest nco package is installed: {source}")]
    ToolNotFound {
        program: String,
        #[source]
        source: which::Error,
    },

    #[error("{command} failed with {}:\n{stderr}", describe_exit(.exit_code))]
    ToolExecutionFailed {
        command: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("{command} timed out after {timeout:?}")]
    ToolTimedOut { command: String, timeout: Duration },

    #[error("Skipped because '{dependency}' did not complete")]
    DependencyFailed { dependency: String },

    #[error("Stream '{0}' is not declared in the [streams] section")]
    UnknownStream(String),

    #[error("{0}")]
    NotPrepared(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Dependency error: {0}")]
    Dependency(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Worker stopped unexpectedly: {0}")]
    Panicked(String),

    #[error("Task '{task}' failed: {source}")]
    Task {
        task: String,
        #[source]
        source: Box<Error>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn in_task(self, task: &str) -> Self {
        match self {
            Error::Task { .. } => self,
            other => Error::Task {
                task: task.to_string(),
                source: Box::new(other),
            },
        }
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Parse(err.to_string())
    }
}

impl From<toml::ser::Error> for Error {
    fn from(err: toml::ser::Error) -> Self {
        Error::Parse(err.to_string())
    }
}

impl From<glob::PatternError> for Error {
    fn from(err: glob::PatternError) -> Self {
        Error::Config(format!("Invalid stream template: {}", err))
    }
}

impl From<glob::GlobError> for Error {
    fn from(err: glob::GlobError) -> Self {
        Error::Io(err.into_error())
    }
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {}", code),
        None => "no exit code (terminated by signal)".to_string(),
    }
}

pub type Result<T> = std::result::Result<T, Error>;
