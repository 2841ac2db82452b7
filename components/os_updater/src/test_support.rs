//! In-memory package cache and time sync used by the unit tests

use crate::cache::{Candidate, ChangeSummary, DependencyGroup, DependencyTarget, Package, PackageCache};
use crate::clock::TimeSync;
use crate::error::CacheError;
use crate::progress::{FetchProgress, InstallProgress, ProgressSink};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

pub fn dep(name: &str, versions: &[&str]) -> DependencyTarget {
    DependencyTarget::new(name, versions.iter().copied())
}

pub fn package(name: &str, candidate: &str, dependencies: Vec<DependencyGroup>) -> Package {
    Package {
        name: name.to_string(),
        installed_version: Some("0".to_string()),
        candidate: Some(Candidate {
            version: candidate.to_string(),
            dependencies,
        }),
    }
}

#[derive(Default)]
struct FakeState {
    packages: HashMap<String, Package>,
    changes: ChangeSummary,
    failing_installs: Vec<String>,
    update_error: Option<String>,
    commit_error: Option<String>,
    panic_on_commit: bool,
    gate: Option<Arc<Notify>>,
    fetch_script: Vec<FetchProgress>,
    lookups: HashMap<String, usize>,
    marked: Vec<(String, Option<String>)>,
    dist_upgrade: bool,
    updates: usize,
    commits: usize,
}

/// Clones share state, so a test can keep a handle after handing the cache
/// to a backend
#[derive(Clone, Default)]
pub struct FakeCache {
    state: Arc<Mutex<FakeState>>,
}

impl FakeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_package(self, package: Package) -> Self {
        self.state
            .lock()
            .packages
            .insert(package.name.clone(), package);
        self
    }

    pub fn with_changes(self, changes: ChangeSummary) -> Self {
        self.state.lock().changes = changes;
        self
    }

    pub fn failing_installs(self, packages: &[&str]) -> Self {
        self.state.lock().failing_installs = packages.iter().map(|p| p.to_string()).collect();
        self
    }

    pub fn failing_update(self, message: &str) -> Self {
        self.state.lock().update_error = Some(message.to_string());
        self
    }

    pub fn failing_commit(self, message: &str) -> Self {
        self.state.lock().commit_error = Some(message.to_string());
        self
    }

    pub fn panicking_commit(self) -> Self {
        self.state.lock().panic_on_commit = true;
        self
    }

    /// Every update, upgrade and commit waits for a notification
    pub fn gated(self, gate: Arc<Notify>) -> Self {
        self.state.lock().gate = Some(gate);
        self
    }

    pub fn with_fetch_script(self, script: Vec<FetchProgress>) -> Self {
        self.state.lock().fetch_script = script;
        self
    }

    pub fn lookups_of(&self, name: &str) -> usize {
        self.state.lock().lookups.get(name).copied().unwrap_or(0)
    }

    pub fn marked(&self) -> Vec<(String, Option<String>)> {
        self.state.lock().marked.clone()
    }

    pub fn dist_upgrade_marked(&self) -> bool {
        self.state.lock().dist_upgrade
    }

    pub fn updates(&self) -> usize {
        self.state.lock().updates
    }

    pub fn commits(&self) -> usize {
        self.state.lock().commits
    }

    async fn wait_for_gate(&self) {
        let gate = self.state.lock().gate.clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
    }

    fn failure(command: &str, message: &str) -> CacheError {
        CacheError::CommandExitCode {
            command: command.to_string(),
            stderr: message.to_string(),
        }
    }
}

impl PackageCache for FakeCache {
    async fn open(&mut self) -> Result<(), CacheError> {
        let mut state = self.state.lock();
        state.marked.clear();
        state.dist_upgrade = false;
        Ok(())
    }

    async fn update(&mut self, progress: &dyn ProgressSink) -> Result<(), CacheError> {
        self.wait_for_gate().await;
        let (script, error) = {
            let mut state = self.state.lock();
            state.updates += 1;
            (state.fetch_script.clone(), state.update_error.clone())
        };
        for step in script {
            progress.fetch(step);
        }
        match error {
            Some(message) => Err(Self::failure("apt-get update", &message)),
            None => Ok(()),
        }
    }

    async fn upgrade(&mut self, dist_upgrade: bool) -> Result<(), CacheError> {
        self.wait_for_gate().await;
        self.state.lock().dist_upgrade = dist_upgrade;
        Ok(())
    }

    async fn package(&self, name: &str) -> Result<Option<Package>, CacheError> {
        let mut state = self.state.lock();
        *state.lookups.entry(name.to_string()).or_default() += 1;
        Ok(state.packages.get(name).cloned())
    }

    fn mark_upgrade(&mut self, name: &str, version: Option<&str>) -> Result<(), CacheError> {
        self.state
            .lock()
            .marked
            .push((name.to_string(), version.map(str::to_string)));
        Ok(())
    }

    async fn changes(&self) -> Result<ChangeSummary, CacheError> {
        Ok(self.state.lock().changes)
    }

    async fn commit(
        &mut self,
        fetch: &dyn ProgressSink,
        install: &dyn ProgressSink,
    ) -> Result<(), CacheError> {
        self.wait_for_gate().await;
        let (script, failing, error, panic) = {
            let mut state = self.state.lock();
            state.commits += 1;
            (
                state.fetch_script.clone(),
                state.failing_installs.clone(),
                state.commit_error.clone(),
                state.panic_on_commit,
            )
        };
        if panic {
            panic!("package manager crashed");
        }
        for step in script {
            fetch.fetch(step);
        }
        install.install(InstallProgress::Status {
            percent: 50.0,
            description: "Unpacking".to_string(),
        });
        for package in failing {
            install.install(InstallProgress::Failed {
                package,
                message: "dpkg returned an error code".to_string(),
            });
        }
        match error {
            Some(message) => Err(Self::failure("apt-get install", &message)),
            None => Ok(()),
        }
    }
}

/// Time sync that becomes synchronized after a number of polls
#[derive(Clone, Default)]
pub struct FakeTimeSync {
    synchronized_after: Arc<AtomicUsize>,
    polls: Arc<AtomicUsize>,
    resyncs: Arc<AtomicUsize>,
    network_up: Arc<AtomicBool>,
}

impl FakeTimeSync {
    pub fn synchronized() -> Self {
        Self::after_polls(0)
    }

    pub fn after_polls(polls: usize) -> Self {
        let sync = Self::default();
        sync.synchronized_after.store(polls, Ordering::SeqCst);
        sync.network_up.store(true, Ordering::SeqCst);
        sync
    }

    pub fn never() -> Self {
        Self::after_polls(usize::MAX)
    }

    pub fn offline(self) -> Self {
        self.network_up.store(false, Ordering::SeqCst);
        self
    }

    pub fn polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }

    pub fn resyncs(&self) -> usize {
        self.resyncs.load(Ordering::SeqCst)
    }
}

impl TimeSync for FakeTimeSync {
    async fn is_synchronized(&self) -> Result<bool, CacheError> {
        let polls = self.polls.fetch_add(1, Ordering::SeqCst);
        Ok(polls >= self.synchronized_after.load(Ordering::SeqCst))
    }

    async fn wait_for_network(&self, _timeout: Duration) -> bool {
        self.network_up.load(Ordering::SeqCst)
    }

    async fn trigger_resync(&self) -> Result<(), CacheError> {
        self.resyncs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
