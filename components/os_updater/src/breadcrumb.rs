//! Breadcrumb files
//!
//! The firmware updater service watches two marker files. `ready` tells it
//! the OS side is done; `extend-timeout` asks it to keep waiting while an OS
//! upgrade is in flight. Presence is the signal, the content is a free-form
//! reason for whoever is debugging the device.
//!
//! Operations are plain blocking file calls so they can run from `Drop`.

use crate::error::BreadcrumbError;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Breadcrumb {
    path: PathBuf,
}

impl Breadcrumb {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_set(&self) -> bool {
        self.path.exists()
    }

    /// Create the marker. Setting an already set marker keeps the first
    /// reason.
    pub fn set(&self, reason: &str) -> Result<(), BreadcrumbError> {
        if self.is_set() {
            debug!("Breadcrumb {} already set", self.path.display());
            return Ok(());
        }

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| BreadcrumbError::io(parent, e))?;
        }

        // Write next to the target so the rename stays on one filesystem
        let temp = self.temp_path();
        fs::write(&temp, reason).map_err(|e| BreadcrumbError::io(&temp, e))?;
        fs::rename(&temp, &self.path).map_err(|e| BreadcrumbError::io(&self.path, e))?;

        info!("📍 Set breadcrumb {} ({})", self.path.display(), reason);
        Ok(())
    }

    pub fn reason(&self) -> Result<String, BreadcrumbError> {
        match fs::read_to_string(&self.path) {
            Ok(reason) => Ok(reason),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(BreadcrumbError::NotSet {
                path: self.path.clone(),
            }),
            Err(e) => Err(BreadcrumbError::io(&self.path, e)),
        }
    }

    pub fn clear(&self) -> Result<(), BreadcrumbError> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                info!("🧹 Cleared breadcrumb {}", self.path.display());
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Err(BreadcrumbError::NotSet {
                path: self.path.clone(),
            }),
            Err(e) => Err(BreadcrumbError::io(&self.path, e)),
        }
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

/// The two markers shared with the firmware updater
#[derive(Debug, Clone)]
pub struct BreadcrumbCoordinator {
    pub ready: Breadcrumb,
    pub extend_timeout: Breadcrumb,
}

impl BreadcrumbCoordinator {
    pub fn new(ready: impl Into<PathBuf>, extend_timeout: impl Into<PathBuf>) -> Self {
        Self {
            ready: Breadcrumb::new(ready),
            extend_timeout: Breadcrumb::new(extend_timeout),
        }
    }

    /// Ask the firmware updater to wait, unless it is already told we are
    /// ready. The returned guard signals `ready` when dropped.
    pub fn begin_upgrade(&self) -> UpgradeBreadcrumbs<'_> {
        let extended = !self.ready.is_set()
            && match self.extend_timeout.set("OS upgrade in progress") {
                Ok(()) => true,
                Err(e) => {
                    warn!("Could not extend firmware updater timeout: {}", e);
                    false
                }
            };
        UpgradeBreadcrumbs {
            coordinator: self,
            extended,
        }
    }
}

/// Held for the duration of an upgrade run
pub struct UpgradeBreadcrumbs<'a> {
    coordinator: &'a BreadcrumbCoordinator,
    extended: bool,
}

impl UpgradeBreadcrumbs<'_> {
    /// Whether this run set `extend-timeout`
    pub fn extended(&self) -> bool {
        self.extended
    }
}

impl Drop for UpgradeBreadcrumbs<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.coordinator.ready.set("OS upgrade finished") {
            warn!("Could not set ready breadcrumb: {}", e);
        }
        if self.extended {
            if let Err(e) = self.coordinator.extend_timeout.clear() {
                warn!("Could not clear extend-timeout breadcrumb: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tempfile::TempDir;

    fn breadcrumb(dir: &TempDir, name: &str) -> Breadcrumb {
        Breadcrumb::new(dir.path().join(name))
    }

    #[test]
    fn set_twice_keeps_first_reason() {
        let dir = TempDir::new().unwrap();
        let crumb = breadcrumb(&dir, "ready");

        crumb.set("first").unwrap();
        crumb.set("second").unwrap();

        assert!(crumb.is_set());
        assert_eq!(crumb.reason().unwrap(), "first");
    }

    #[test]
    fn clearing_unset_marker_is_an_error() {
        let dir = TempDir::new().unwrap();
        let crumb = breadcrumb(&dir, "extend-timeout");

        assert_matches!(crumb.clear(), Err(BreadcrumbError::NotSet { .. }));
    }

    #[test]
    fn clear_after_set_leaves_it_unset() {
        let dir = TempDir::new().unwrap();
        let crumb = breadcrumb(&dir, "extend-timeout");

        crumb.set("upgrading").unwrap();
        crumb.clear().unwrap();

        assert!(!crumb.is_set());
        assert_matches!(crumb.reason(), Err(BreadcrumbError::NotSet { .. }));
    }

    #[test]
    fn upgrade_extends_timeout_until_done() {
        let dir = TempDir::new().unwrap();
        let crumbs = BreadcrumbCoordinator::new(
            dir.path().join("ready"),
            dir.path().join("extend-timeout"),
        );

        let upgrade = crumbs.begin_upgrade();
        assert!(upgrade.extended());
        assert!(crumbs.extend_timeout.is_set());
        assert!(!crumbs.ready.is_set());

        drop(upgrade);
        assert!(!crumbs.extend_timeout.is_set());
        assert!(crumbs.ready.is_set());
    }

    #[test]
    fn already_ready_does_not_extend() {
        let dir = TempDir::new().unwrap();
        let crumbs = BreadcrumbCoordinator::new(
            dir.path().join("ready"),
            dir.path().join("extend-timeout"),
        );
        crumbs.ready.set("earlier run").unwrap();

        let upgrade = crumbs.begin_upgrade();
        assert!(!upgrade.extended());
        assert!(!crumbs.extend_timeout.is_set());
        drop(upgrade);

        assert_eq!(crumbs.ready.reason().unwrap(), "earlier run");
    }

    #[test]
    fn set_creates_missing_directories_and_leaves_no_temp_file() {
        let dir = TempDir::new().unwrap();
        let crumb = Breadcrumb::new(dir.path().join("run/updater/ready"));

        crumb.set("done").unwrap();

        let entries: Vec<_> = std::fs::read_dir(dir.path().join("run/updater"))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries, vec![std::ffi::OsString::from("ready")]);
    }
}
