//! The single-flight upgrade session
//!
//! One mutex guards the package backend; holding its owned guard *is* the
//! session. The guard is acquired without waiting, so a second caller is
//! turned away instead of queued, and dropping it (normally or while
//! unwinding) always puts the session back to `Idle`.
//!
//! A caller is refused exactly while the phase is a working one. The backend
//! is released before the phase returns to `Idle`, so nobody sees an idle
//! session they cannot take.

use crate::backend::PackageBackend;
use crate::cache::PackageCache;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};
use updater_protocol::UpgradeSize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Phase {
    #[default]
    Idle,
    UpdatingSources,
    Staging,
    Upgrading,
    Finished,
    Failed,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::UpdatingSources => "updating_sources",
            Phase::Staging => "staging",
            Phase::Upgrading => "upgrading",
            Phase::Finished => "finished",
            Phase::Failed => "failed",
        }
    }

    pub fn is_working(&self) -> bool {
        matches!(
            self,
            Phase::UpdatingSources | Phase::Staging | Phase::Upgrading
        )
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of the most recent successful staging run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StagedChanges {
    pub size: UpgradeSize,
    pub install_count: u64,
    /// Empty for a full upgrade
    pub targets: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SessionState {
    pub phase: Phase,
    pub staged: Option<StagedChanges>,
    pub last_outcome: Option<Phase>,
}

pub struct Session<C> {
    backend: Arc<Mutex<PackageBackend<C>>>,
    state: Arc<parking_lot::Mutex<SessionState>>,
}

impl<C: PackageCache> Session<C> {
    pub fn new(backend: PackageBackend<C>) -> Self {
        Self {
            backend: Arc::new(Mutex::new(backend)),
            state: Arc::default(),
        }
    }

    /// Take the session for `phase`, or `None` if another one is running
    pub fn try_begin(&self, phase: Phase) -> Option<SessionGuard<C>> {
        let mut state = self.state.lock();
        if state.phase.is_working() {
            return None;
        }
        let backend = Arc::clone(&self.backend).try_lock_owned().ok()?;
        debug!("Session {} -> {}", state.phase, phase);
        state.phase = phase;
        Some(SessionGuard {
            backend,
            release: Release {
                state: Arc::clone(&self.state),
                outcome: None,
            },
        })
    }

    pub fn is_busy(&self) -> bool {
        self.state.lock().phase.is_working()
    }

    pub fn snapshot(&self) -> SessionState {
        self.state.lock().clone()
    }

    pub fn phase(&self) -> Phase {
        self.state.lock().phase
    }

    pub fn last_outcome(&self) -> Option<Phase> {
        self.state.lock().last_outcome
    }

    /// Sizes of the last successful staging, zero if nothing was staged
    pub fn upgrade_size(&self) -> UpgradeSize {
        self.state
            .lock()
            .staged
            .as_ref()
            .map(|staged| staged.size)
            .unwrap_or_default()
    }
}

/// Exclusive access to the backend for one operation
pub struct SessionGuard<C> {
    // Fields drop in order: the backend is unlocked before `release` runs.
    backend: OwnedMutexGuard<PackageBackend<C>>,
    release: Release,
}

impl<C: PackageCache> SessionGuard<C> {
    pub fn backend(&mut self) -> &mut PackageBackend<C> {
        &mut self.backend
    }

    pub fn record_staged(&self, staged: StagedChanges) {
        self.release.state.lock().staged = Some(staged);
    }

    /// Record how the operation ended; takes effect when the guard drops
    pub fn conclude<T, E>(&mut self, result: &Result<T, E>) {
        self.release.outcome = Some(match result {
            Ok(_) => Phase::Finished,
            Err(_) => Phase::Failed,
        });
    }
}

/// Puts the session back to `Idle` once the backend is free
struct Release {
    state: Arc<parking_lot::Mutex<SessionState>>,
    outcome: Option<Phase>,
}

impl Drop for Release {
    fn drop(&mut self) {
        let outcome = self.outcome.unwrap_or_else(|| {
            warn!("Session ended without an outcome, recording failure");
            Phase::Failed
        });
        let mut state = self.state.lock();
        debug!("Session {} -> {} -> {}", state.phase, outcome, Phase::Idle);
        state.last_outcome = Some(outcome);
        state.phase = Phase::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeCache;

    fn session() -> Session<FakeCache> {
        Session::new(PackageBackend::new(FakeCache::new()))
    }

    #[test]
    fn second_session_is_refused_while_first_is_held() {
        let session = session();

        let first = session.try_begin(Phase::Staging);
        assert!(first.is_some());
        assert!(session.is_busy());
        assert!(session.try_begin(Phase::Upgrading).is_none());
        assert_eq!(session.phase(), Phase::Staging);
    }

    #[test]
    fn dropping_the_guard_returns_to_idle() {
        let session = session();

        let mut guard = session.try_begin(Phase::UpdatingSources).unwrap();
        guard.conclude::<(), ()>(&Ok(()));
        drop(guard);

        assert!(!session.is_busy());
        assert_eq!(session.phase(), Phase::Idle);
        assert_eq!(session.last_outcome(), Some(Phase::Finished));
        assert!(session.try_begin(Phase::Staging).is_some());
    }

    #[test]
    fn guard_dropped_without_outcome_records_failure() {
        let session = session();

        drop(session.try_begin(Phase::Upgrading).unwrap());

        assert_eq!(session.last_outcome(), Some(Phase::Failed));
        assert_eq!(session.phase(), Phase::Idle);
    }

    #[test]
    fn guard_released_while_unwinding() {
        let session = session();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = session.try_begin(Phase::Upgrading).unwrap();
            panic!("worker blew up");
        }));

        assert!(result.is_err());
        assert!(!session.is_busy());
        assert_eq!(session.last_outcome(), Some(Phase::Failed));
    }

    #[test]
    fn working_phase_refuses_even_with_backend_free() {
        let session = session();
        session.state.lock().phase = Phase::Staging;

        assert!(session.backend.try_lock().is_ok());
        assert!(session.is_busy());
        assert!(session.try_begin(Phase::Upgrading).is_none());
    }

    #[test]
    fn backend_is_free_once_session_reads_idle() {
        let session = session();

        let mut guard = session.try_begin(Phase::Staging).unwrap();
        guard.conclude::<(), ()>(&Ok(()));
        drop(guard);

        assert!(!session.is_busy());
        assert!(session.backend.try_lock().is_ok());
    }

    #[test]
    fn upgrade_size_is_zero_before_staging() {
        assert_eq!(session().upgrade_size(), UpgradeSize::default());
    }

    #[test]
    fn upgrade_size_reflects_last_staging() {
        let session = session();
        let guard = session.try_begin(Phase::Staging).unwrap();
        guard.record_staged(StagedChanges {
            size: UpgradeSize {
                download_size: 10,
                required_space: -4,
            },
            install_count: 2,
            targets: vec![],
        });
        drop(guard);

        assert_eq!(session.upgrade_size().required_space, -4);
    }
}
