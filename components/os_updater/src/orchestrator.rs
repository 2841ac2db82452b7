//! OS update orchestrator
//!
//! Entry point for everything the portal asks of the updater. Mutating
//! operations take the session synchronously, so a caller learns right away
//! whether it was accepted, and then do their work on a tokio task. Progress
//! goes into the event channel; lifecycle changes go onto the bus.

use crate::backend::PackageBackend;
use crate::breadcrumb::BreadcrumbCoordinator;
use crate::broadcast::{Broadcaster, Observer};
use crate::bus::{EventBus, LifecycleStatus, Topic};
use crate::cache::PackageCache;
use crate::clock::{ClockGuard, TimeSync};
use crate::error::{Result, UpdaterError};
use crate::progress::{EventSender, ProgressReporter};
use crate::resolver::{PackageFamily, Resolver};
use crate::session::{Phase, Session, SessionGuard, StagedChanges};
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use updater_protocol::{MessageType, UpgradeSize};

/// Message of the error event a refused call emits
pub const LOCKED_MESSAGE: &str = "backend is locked";

/// Outcome of asking for a mutating operation
#[derive(Debug)]
pub enum Dispatch {
    Started(JoinHandle<Result<()>>),
    /// Another operation holds the session
    Rejected,
}

impl Dispatch {
    pub fn is_started(&self) -> bool {
        matches!(self, Dispatch::Started(_))
    }

    /// Wait for the worker. `None` if the call was rejected.
    pub async fn join(self) -> Option<Result<()>> {
        match self {
            Dispatch::Started(handle) => Some(
                handle
                    .await
                    .unwrap_or_else(|e| Err(UpdaterError::WorkerPanicked(e.to_string()))),
            ),
            Dispatch::Rejected => None,
        }
    }
}

/// Snapshot for state requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdaterState {
    pub busy: bool,
    pub clients: usize,
    pub phase: Phase,
}

/// Process-specific settings for the orchestrator
#[derive(Debug, Clone)]
pub struct UpdaterSettings {
    /// Package name of the portal itself
    pub self_package: String,
    pub family: PackageFamily,
    pub breadcrumbs: BreadcrumbCoordinator,
}

struct Inner<C, T> {
    session: Session<C>,
    clock: ClockGuard<T>,
    bus: EventBus,
    broadcaster: Broadcaster,
    events: EventSender,
    settings: UpdaterSettings,
}

pub struct OsUpdater<C, T> {
    inner: Arc<Inner<C, T>>,
}

impl<C, T> Clone for OsUpdater<C, T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: PackageCache, T: TimeSync> OsUpdater<C, T> {
    pub fn new(
        backend: PackageBackend<C>,
        clock: ClockGuard<T>,
        bus: EventBus,
        broadcaster: Broadcaster,
        events: EventSender,
        settings: UpdaterSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                session: Session::new(backend),
                clock,
                bus,
                broadcaster,
                events,
                settings,
            }),
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        &self.inner.broadcaster
    }

    /// Refresh the package index, synchronizing the clock first if needed
    pub fn update_sources(&self) -> Dispatch {
        let reporter = self.reporter(MessageType::UpdateSources);
        let Some(session) = self.inner.session.try_begin(Phase::UpdatingSources) else {
            return self.reject(&reporter);
        };
        let work = Arc::clone(&self.inner).update_sources(session, Arc::clone(&reporter));
        self.spawn_worker(Topic::UpdateSources, reporter, work)
    }

    /// Stage `targets` and their first-party closure, or every upgradable
    /// package when `targets` is empty
    pub fn stage_packages(&self, targets: Vec<String>) -> Dispatch {
        let reporter = self.reporter(MessageType::OsPrepareUpgrade);
        let Some(session) = self.inner.session.try_begin(Phase::Staging) else {
            return self.reject(&reporter);
        };
        let work = Arc::clone(&self.inner).stage(session, Arc::clone(&reporter), targets);
        self.spawn_worker(Topic::Prepare, reporter, work)
    }

    /// Stage only the portal's own package closure
    pub fn stage_web_portal_self(&self) -> Dispatch {
        self.stage_packages(vec![self.inner.settings.self_package.clone()])
    }

    /// Download and install whatever was staged
    pub fn start_upgrade(&self) -> Dispatch {
        let reporter = self.reporter(MessageType::OsUpgrade);
        let Some(session) = self.inner.session.try_begin(Phase::Upgrading) else {
            return self.reject(&reporter);
        };
        let work = Arc::clone(&self.inner).upgrade(session, Arc::clone(&reporter));
        self.spawn_worker(Topic::Upgrade, reporter, work)
    }

    pub fn upgrade_size(&self) -> UpgradeSize {
        self.inner.session.upgrade_size()
    }

    pub fn staged(&self) -> Option<StagedChanges> {
        self.inner.session.snapshot().staged
    }

    /// Busy flag and live observer count, registering `observer` first if
    /// given
    pub fn state(&self, observer: Option<Arc<dyn Observer>>) -> UpdaterState {
        if let Some(observer) = observer {
            self.inner.broadcaster.admit(observer);
        }
        UpdaterState {
            busy: self.inner.session.is_busy(),
            clients: self.inner.broadcaster.active_observer_count(),
            phase: self.inner.session.phase(),
        }
    }

    pub fn last_outcome(&self) -> Option<Phase> {
        self.inner.session.last_outcome()
    }

    fn reporter(&self, kind: MessageType) -> Arc<ProgressReporter> {
        Arc::new(ProgressReporter::new(kind, self.inner.events.clone()))
    }

    fn reject(&self, reporter: &ProgressReporter) -> Dispatch {
        warn!("🔒 {:?} refused, {}", reporter.kind(), LOCKED_MESSAGE);
        reporter.error(LOCKED_MESSAGE);
        Dispatch::Rejected
    }

    fn spawn_worker<F>(&self, topic: Topic, reporter: Arc<ProgressReporter>, work: F) -> Dispatch
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let bus = self.inner.bus.clone();
        bus.publish(topic, LifecycleStatus::Started);

        Dispatch::Started(tokio::spawn(async move {
            let result = match AssertUnwindSafe(work).catch_unwind().await {
                Ok(result) => result,
                Err(panic) => Err(UpdaterError::WorkerPanicked(panic_message(panic))),
            };

            match &result {
                Ok(()) => {
                    info!("✅ {} finished", topic);
                    bus.publish(topic, LifecycleStatus::Success);
                }
                Err(e) => {
                    error!("❌ {} failed: {}", topic, e);
                    reporter.error(e.to_string());
                    bus.publish(topic, LifecycleStatus::Failed);
                }
            }
            result
        }))
    }
}

impl<C: PackageCache, T: TimeSync> Inner<C, T> {
    async fn update_sources(
        self: Arc<Self>,
        mut session: SessionGuard<C>,
        reporter: Arc<ProgressReporter>,
    ) -> Result<()> {
        reporter.start("Updating package sources");
        self.clock.ensure_synchronized().await;

        let result = session.backend().update(&*reporter).await;
        session.conclude(&result);
        drop(session);
        result?;

        reporter.finish("Package sources updated");
        Ok(())
    }

    async fn stage(
        self: Arc<Self>,
        mut session: SessionGuard<C>,
        reporter: Arc<ProgressReporter>,
        targets: Vec<String>,
    ) -> Result<()> {
        reporter.start("Preparing upgrade");

        let result = self.stage_changes(&mut session, &reporter, &targets).await;
        if let Ok(staged) = &result {
            session.record_staged(staged.clone());
        }
        session.conclude(&result);
        drop(session);
        let staged = result?;

        reporter.finish(format!(
            "{} package(s) staged, {} bytes to download",
            staged.install_count, staged.size.download_size
        ));
        Ok(())
    }

    async fn stage_changes(
        &self,
        session: &mut SessionGuard<C>,
        reporter: &ProgressReporter,
        targets: &[String],
    ) -> Result<StagedChanges> {
        let backend = session.backend();

        let changes = if targets.is_empty() {
            reporter.status("Marking all upgradable packages", 10.0);
            backend.stage_full().await?
        } else {
            reporter.status(format!("Resolving {}", targets.join(", ")), 10.0);
            let closure = Resolver::new(backend.cache(), &self.settings.family)
                .closure_for(targets)
                .await?;
            for name in closure.unsatisfiable() {
                warn!("⚠️  Dependents of {} disagree on every version", name);
            }

            reporter.status(format!("Staging {} package(s)", closure.len()), 50.0);
            backend.stage_closure(&closure).await?
        };

        info!(
            "📦 Staged {} package(s): download {} bytes, disk {} bytes",
            changes.install_count, changes.download_size, changes.required_space
        );
        Ok(StagedChanges {
            size: UpgradeSize {
                download_size: changes.download_size,
                required_space: changes.required_space,
            },
            install_count: changes.install_count,
            targets: targets.to_vec(),
        })
    }

    async fn upgrade(
        self: Arc<Self>,
        mut session: SessionGuard<C>,
        reporter: Arc<ProgressReporter>,
    ) -> Result<()> {
        let breadcrumbs = self.settings.breadcrumbs.begin_upgrade();

        reporter.start("Downloading packages");
        let install = reporter.next_phase();

        let result = session.backend().upgrade(&*reporter, &install).await;
        session.conclude(&result);
        drop(session);
        drop(breadcrumbs);
        result?;

        install.finish("Upgrade complete");
        Ok(())
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
