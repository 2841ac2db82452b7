//! OS updater error types
//!
//! `CacheError` covers the package cache, `BreadcrumbError` the marker files,
//! and `UpdaterError` is what an orchestration worker finishes with.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("command execution failed: {command}")]
    CommandFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("command returned non-zero exit code: {command}\nStderr: {stderr}")]
    CommandExitCode { command: String, stderr: String },

    #[error("unexpected output from {command}: {reason}")]
    Parse { command: String, reason: String },

    #[error("package not found: {0}")]
    UnknownPackage(String),
}

impl CacheError {
    pub fn command_failed(command: impl Into<String>, source: std::io::Error) -> Self {
        CacheError::CommandFailed {
            command: command.into(),
            source,
        }
    }

    pub fn parse(command: impl Into<String>, reason: impl Into<String>) -> Self {
        CacheError::Parse {
            command: command.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum BreadcrumbError {
    #[error("breadcrumb {path} is not set")]
    NotSet { path: PathBuf },

    #[error("io error on breadcrumb {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl BreadcrumbError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        BreadcrumbError::Io {
            path: path.into(),
            source,
        }
    }
}

#[derive(Error, Debug)]
pub enum UpdaterError {
    #[error("package cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("breadcrumb error: {0}")]
    Breadcrumb(#[from] BreadcrumbError),

    #[error("failed to install packages: {}", .packages.join(", "))]
    InstallFailed { packages: Vec<String> },

    #[error("package {0} has no installation candidate")]
    NoCandidate(String),

    #[error("update worker panicked: {0}")]
    WorkerPanicked(String),
}

pub type Result<T> = std::result::Result<T, UpdaterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_failure_lists_every_package() {
        let err = UpdaterError::InstallFailed {
            packages: vec!["libfoo".to_string(), "device-portal".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "failed to install packages: libfoo, device-portal"
        );
    }
}
