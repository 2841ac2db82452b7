//! The package-manager contract the updater consumes
//!
//! The cache, its dependency graph and the download/install mechanics belong
//! to the system package manager. [`PackageCache`] is the narrow surface the
//! backend adapter drives; [`crate::apt::AptCache`] implements it for apt.

use crate::error::CacheError;
use crate::progress::ProgressSink;
use std::future::Future;

/// One package that can satisfy a dependency, with every version of it that
/// would do
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyTarget {
    pub name: String,
    pub target_versions: Vec<String>,
}

impl DependencyTarget {
    pub fn new<I, S>(name: impl Into<String>, versions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            target_versions: versions.into_iter().map(Into::into).collect(),
        }
    }
}

/// Alternatives for a single requirement ("needs A or B")
pub type DependencyGroup = Vec<DependencyTarget>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub version: String,
    pub dependencies: Vec<DependencyGroup>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Package {
    pub name: String,
    pub installed_version: Option<String>,
    pub candidate: Option<Candidate>,
}

impl Package {
    pub fn is_installed(&self) -> bool {
        self.installed_version.is_some()
    }

    /// Installed, and the candidate differs from what is installed
    pub fn is_upgradable(&self) -> bool {
        match (&self.installed_version, &self.candidate) {
            (Some(installed), Some(candidate)) => {
                crate::version::compare_versions(&candidate.version, installed).is_gt()
            }
            _ => false,
        }
    }
}

/// What committing the currently marked changes would cost
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChangeSummary {
    pub download_size: u64,
    pub required_space: i64,
    pub install_count: u64,
}

pub trait PackageCache: Send + Sync + 'static {
    /// (Re)load the cache, discarding any marked changes
    fn open(&mut self) -> impl Future<Output = Result<(), CacheError>> + Send;

    /// Refresh the package index from the configured sources
    fn update(
        &mut self,
        progress: &dyn ProgressSink,
    ) -> impl Future<Output = Result<(), CacheError>> + Send;

    /// Mark every upgradable package
    fn upgrade(&mut self, dist_upgrade: bool) -> impl Future<Output = Result<(), CacheError>> + Send;

    fn package(
        &self,
        name: &str,
    ) -> impl Future<Output = Result<Option<Package>, CacheError>> + Send;

    /// Mark a package for upgrade, optionally pinned to a version
    fn mark_upgrade(&mut self, name: &str, version: Option<&str>) -> Result<(), CacheError>;

    fn changes(&self) -> impl Future<Output = Result<ChangeSummary, CacheError>> + Send;

    /// Download and install the marked changes
    fn commit(
        &mut self,
        fetch: &dyn ProgressSink,
        install: &dyn ProgressSink,
    ) -> impl Future<Output = Result<(), CacheError>> + Send;
}
