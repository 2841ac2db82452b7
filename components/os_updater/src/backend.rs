//! Package backend adapter
//!
//! Thin layer over a [`PackageCache`] that the orchestrator drives. It is
//! only reachable through a held session guard, so it carries no lock of its
//! own.

use crate::cache::{ChangeSummary, PackageCache};
use crate::error::{Result, UpdaterError};
use crate::progress::{FetchProgress, InstallProgress, ProgressSink};
use crate::resolver::DependencyClosure;
use crate::version::highest;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

pub struct PackageBackend<C> {
    cache: C,
}

impl<C: PackageCache> PackageBackend<C> {
    pub fn new(cache: C) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &C {
        &self.cache
    }

    /// Refresh the package index, then reload the cache from it
    pub async fn update(&mut self, progress: &dyn ProgressSink) -> Result<()> {
        self.cache.update(progress).await?;
        self.cache.open().await?;
        Ok(())
    }

    /// Mark every upgradable package
    pub async fn stage_full(&mut self) -> Result<ChangeSummary> {
        self.cache.open().await?;
        self.cache.upgrade(true).await?;
        Ok(self.cache.changes().await?)
    }

    /// Mark the highest acceptable version of every package in the closure
    ///
    /// A package whose acceptable set narrowed to nothing is still marked,
    /// without a version, and left for the package manager to reject.
    /// Installed packages with nothing newer available are left alone.
    pub async fn stage_closure(&mut self, closure: &DependencyClosure) -> Result<ChangeSummary> {
        self.cache.open().await?;

        for (name, versions) in closure.iter() {
            let current = self.cache.package(name).await?;
            if current.is_some_and(|p| p.is_installed() && !p.is_upgradable()) {
                debug!("  {} is already current", name);
                continue;
            }
            match highest(versions) {
                Some(version) => {
                    info!("  Staging {} {}", name, version);
                    self.cache.mark_upgrade(name, Some(version))?;
                }
                None => {
                    warn!(
                        "⚠️  No version of {} satisfies every dependent, staging it unpinned",
                        name
                    );
                    self.cache.mark_upgrade(name, None)?;
                }
            }
        }

        Ok(self.cache.changes().await?)
    }

    /// Download and install the staged changes
    ///
    /// Install failures are collected rather than aborting on the first; if
    /// any package failed, a single error names all of them.
    pub async fn upgrade(
        &mut self,
        fetch: &dyn ProgressSink,
        install: &dyn ProgressSink,
    ) -> Result<()> {
        let collector = FailureCollector::new(install);
        let committed = self.cache.commit(fetch, &collector).await;

        let failed = collector.into_failed();
        if !failed.is_empty() {
            if let Err(e) = committed {
                warn!("Package manager also reported: {}", e);
            }
            return Err(UpdaterError::InstallFailed { packages: failed });
        }

        committed?;
        Ok(())
    }

    pub async fn download_size(&self) -> Result<u64> {
        Ok(self.cache.changes().await?.download_size)
    }

    pub async fn required_space(&self) -> Result<i64> {
        Ok(self.cache.changes().await?.required_space)
    }

    pub async fn install_count(&self) -> Result<u64> {
        Ok(self.cache.changes().await?.install_count)
    }
}

/// Forwards install progress and remembers which packages failed, in order
struct FailureCollector<'a> {
    inner: &'a dyn ProgressSink,
    failed: Mutex<Vec<String>>,
}

impl<'a> FailureCollector<'a> {
    fn new(inner: &'a dyn ProgressSink) -> Self {
        Self {
            inner,
            failed: Mutex::new(Vec::new()),
        }
    }

    fn into_failed(self) -> Vec<String> {
        self.failed.into_inner()
    }
}

impl ProgressSink for FailureCollector<'_> {
    fn fetch(&self, progress: FetchProgress) {
        self.inner.fetch(progress);
    }

    fn install(&self, progress: InstallProgress) {
        if let InstallProgress::Failed { package, message } = &progress {
            warn!("❌ {} failed to install: {}", package, message);
            let mut failed = self.failed.lock();
            if !failed.contains(package) {
                failed.push(package.clone());
            }
        }
        self.inner.install(progress);
    }
}
