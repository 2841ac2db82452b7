//! OS update orchestration for the device portal
//!
//! Refreshes package sources, stages a dependency-consistent set of packages,
//! runs the upgrade and streams progress to whoever is watching. Only one of
//! those runs at a time.

pub mod apt;
pub mod backend;
pub mod breadcrumb;
pub mod broadcast;
pub mod bus;
pub mod cache;
pub mod clock;
mod error;
pub mod mode;
pub mod orchestrator;
pub mod progress;
pub mod resolver;
pub mod session;
pub mod version;

#[cfg(test)]
mod test_support;

pub use apt::AptCache;
pub use backend::PackageBackend;
pub use breadcrumb::{Breadcrumb, BreadcrumbCoordinator};
pub use broadcast::{Broadcaster, Observer, ObserverGone, ObserverId, RegistrationPolicy};
pub use bus::{EventBus, Lifecycle, LifecycleStatus, Topic};
pub use cache::{ChangeSummary, PackageCache};
pub use clock::{ClockGuard, ClockSettings, Timedatectl, TimeSync};
pub use error::{BreadcrumbError, CacheError, Result, UpdaterError};
pub use mode::ExecutionMode;
pub use orchestrator::{Dispatch, OsUpdater, UpdaterSettings, UpdaterState, LOCKED_MESSAGE};
pub use progress::{event_channel, EventReceiver, EventSender};
pub use resolver::PackageFamily;
pub use session::{Phase, StagedChanges};
