// bases/device_portal/src/main.rs
use clap::Parser;
use color_eyre::Result;
use os_updater::{
    event_channel, AptCache, BreadcrumbCoordinator, Broadcaster, ClockGuard, EventBus,
    LifecycleStatus, OsUpdater, PackageBackend, PackageFamily, Timedatectl, Topic,
    UpdaterSettings,
};
use tokio_util::sync::CancellationToken;

mod config;
mod error;
mod server;
mod socket;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "device_portal=info,os_updater=info,tower_http=info".into()),
        )
        .init();

    // Parse CLI arguments
    let args = config::CliArgs::parse();
    let config = config::Config::from_args(args);

    if config.is_check_mode() {
        tracing::warn!(
            "🔍 CHECK MODE: Running on port {}, upgrades are simulated",
            config.port
        );
        tracing::warn!("   Use --apply to actually install packages");
    } else {
        tracing::warn!("⚠️  APPLY MODE: Packages WILL be installed on this device!");
    }

    // Composition root: everything the updater needs is built here
    let (events, event_rx) = event_channel();
    let broadcaster = Broadcaster::new(config.registration_policy);
    let bus = EventBus::new();
    log_lifecycle(&bus);

    let updater = OsUpdater::new(
        PackageBackend::new(AptCache::new(config.execution_mode)),
        ClockGuard::new(
            Timedatectl::new(config.connectivity_probe.clone()),
            config.clock_settings(),
        ),
        bus,
        broadcaster.clone(),
        events,
        UpdaterSettings {
            self_package: config.self_package.clone(),
            family: PackageFamily::new(config.first_party_prefixes.clone()),
            breadcrumbs: BreadcrumbCoordinator::new(
                &config.ready_breadcrumb,
                &config.extend_timeout_breadcrumb,
            ),
        },
    );

    let pump = tokio::spawn(broadcaster.run(event_rx));

    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_signal(shutdown.clone()));

    let state = server::AppState { updater, config };
    server::run(state, shutdown).await?;

    pump.abort();
    Ok(())
}

/// Mirror updater lifecycle changes into the log
fn log_lifecycle(bus: &EventBus) {
    for topic in [Topic::UpdateSources, Topic::Prepare, Topic::Upgrade] {
        bus.subscribe(topic, |event| match event.status {
            LifecycleStatus::Failed => tracing::warn!("{} = {}", event.topic, event.status),
            _ => tracing::info!("{} = {}", event.topic, event.status),
        });
    }
}

async fn cancel_on_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => {}
                    _ = tokio::signal::ctrl_c() => {}
                }
            }
            Err(e) => {
                tracing::warn!("Could not listen for SIGTERM: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    tracing::info!("Shutting down...");
    shutdown.cancel();
}
