use std::path::PathBuf;

use thiserror::Error;

/// Errors from loading and validating the YAML configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Errors from parsing the plain-text task file.
///
/// Malformed blocks are never fatal (they are skipped with a `warn!`, per
/// spec); this type only covers the cases that prevent the file from being
/// read at all.
#[derive(Debug, Error)]
pub enum TaskFileError {
    #[error("failed to read task file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// The classification of a recoverable command failure, per spec §4.5 /
/// §7 item 1. Mirrors the original's `exit_code_<n>` / `timeout` /
/// exception-class-name tags.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FailureKind {
    #[error("exit_code_{0}")]
    ExitCode(i32),
    #[error("timeout")]
    Timeout,
    #[error("spawn_error: {0}")]
    SpawnError(String),
}
