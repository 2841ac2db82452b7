//! Dry run or apply
//!
//! Package reads and staging always run; the mode only decides whether the
//! index refresh and the commit touch the system.

/// Whether package operations touch the system
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Simulate commits and skip the index refresh
    #[default]
    DryRun,
    /// Actually refresh, download and install
    Apply,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::DryRun => "DRY RUN",
            ExecutionMode::Apply => "APPLY",
        }
    }
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
