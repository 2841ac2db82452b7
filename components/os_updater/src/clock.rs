//! System clock guard
//!
//! Package signatures only verify against a correct clock. Before refreshing
//! sources the updater makes a best-effort attempt to get the clock
//! synchronized; it never fails the operation, since signature verification
//! will complain loudly on its own if the clock is still wrong.

use crate::error::CacheError;
use std::future::Future;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::time::{sleep, timeout, Instant};
use tracing::{info, warn};

pub trait TimeSync: Send + Sync + 'static {
    /// Point-in-time check against the time sync daemon
    fn is_synchronized(&self) -> impl Future<Output = Result<bool, CacheError>> + Send;

    /// Wait up to `timeout` for the network; true if it came up
    fn wait_for_network(&self, timeout: Duration) -> impl Future<Output = bool> + Send;

    fn trigger_resync(&self) -> impl Future<Output = Result<(), CacheError>> + Send;
}

/// systemd-timesyncd through `timedatectl`
#[derive(Debug, Clone)]
pub struct Timedatectl {
    /// `host:port` used to decide whether the network is up
    probe: String,
}

impl Timedatectl {
    pub fn new(probe: impl Into<String>) -> Self {
        Self {
            probe: probe.into(),
        }
    }
}

impl TimeSync for Timedatectl {
    async fn is_synchronized(&self) -> Result<bool, CacheError> {
        let command = "timedatectl show --property=NTPSynchronized --value";
        let output = Command::new("timedatectl")
            .args(["show", "--property=NTPSynchronized", "--value"])
            .output()
            .await
            .map_err(|e| CacheError::command_failed(command, e))?;

        if !output.status.success() {
            return Err(CacheError::CommandExitCode {
                command: command.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim() == "yes")
    }

    async fn wait_for_network(&self, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            let attempt = remaining.min(Duration::from_secs(5));
            if let Ok(Ok(_)) = timeout(attempt, TcpStream::connect(self.probe.as_str())).await {
                return true;
            }
            sleep(Duration::from_secs(1).min(deadline.saturating_duration_since(Instant::now())))
                .await;
        }
    }

    async fn trigger_resync(&self) -> Result<(), CacheError> {
        let command = "systemctl restart systemd-timesyncd";
        let output = Command::new("systemctl")
            .args(["restart", "systemd-timesyncd"])
            .output()
            .await
            .map_err(|e| CacheError::command_failed(command, e))?;

        if !output.status.success() {
            return Err(CacheError::CommandExitCode {
                command: command.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ClockSettings {
    pub network_timeout: Duration,
    pub poll_interval: Duration,
    pub max_attempts: u32,
}

impl Default for ClockSettings {
    fn default() -> Self {
        Self {
            network_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_secs(1),
            max_attempts: 10,
        }
    }
}

pub struct ClockGuard<T> {
    sync: T,
    settings: ClockSettings,
}

impl<T: TimeSync> ClockGuard<T> {
    pub fn new(sync: T, settings: ClockSettings) -> Self {
        Self { sync, settings }
    }

    pub async fn is_synchronized(&self) -> bool {
        match self.sync.is_synchronized().await {
            Ok(synchronized) => synchronized,
            Err(e) => {
                warn!("Could not query clock synchronization: {}", e);
                false
            }
        }
    }

    /// Synchronize only if the clock is not already
    pub async fn ensure_synchronized(&self) {
        if self.is_synchronized().await {
            return;
        }
        self.synchronize().await;
    }

    /// Wait for the network, trigger a resync, then poll until synchronized
    /// or out of attempts. Returns the final state.
    pub async fn synchronize(&self) -> bool {
        info!("🕐 Clock not synchronized, waiting for network...");
        if !self.sync.wait_for_network(self.settings.network_timeout).await {
            warn!(
                "Network not available after {:?}, trying to sync anyway",
                self.settings.network_timeout
            );
        }

        if let Err(e) = self.sync.trigger_resync().await {
            warn!("Could not trigger clock resync: {}", e);
        }

        for attempt in 1..=self.settings.max_attempts {
            if self.is_synchronized().await {
                info!("✅ Clock synchronized after {} attempt(s)", attempt);
                return true;
            }
            sleep(self.settings.poll_interval).await;
        }

        warn!(
            "⚠️  Clock still not synchronized after {} attempts, continuing",
            self.settings.max_attempts
        );
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeTimeSync;

    fn fast() -> ClockSettings {
        ClockSettings {
            network_timeout: Duration::from_millis(10),
            poll_interval: Duration::from_millis(1),
            max_attempts: 5,
        }
    }

    #[tokio::test]
    async fn synchronized_clock_is_left_alone() {
        let sync = FakeTimeSync::synchronized();
        let guard = ClockGuard::new(sync.clone(), fast());

        guard.ensure_synchronized().await;

        assert_eq!(sync.resyncs(), 0);
        assert_eq!(sync.polls(), 1);
    }

    #[tokio::test]
    async fn polls_until_synchronized() {
        let sync = FakeTimeSync::after_polls(3);
        let guard = ClockGuard::new(sync.clone(), fast());

        guard.ensure_synchronized().await;

        assert_eq!(sync.resyncs(), 1);
        assert_eq!(sync.polls(), 4);
    }

    #[tokio::test]
    async fn gives_up_after_bounded_attempts() {
        let sync = FakeTimeSync::never();
        let guard = ClockGuard::new(sync.clone(), fast());

        assert!(!guard.synchronize().await);
        assert_eq!(sync.polls(), 5);
    }

    #[tokio::test]
    async fn missing_network_does_not_stop_the_attempt() {
        let sync = FakeTimeSync::after_polls(1).offline();
        let guard = ClockGuard::new(sync.clone(), fast());

        assert!(guard.synchronize().await);
        assert_eq!(sync.resyncs(), 1);
    }
}
