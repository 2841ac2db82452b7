// bases/device_portal/src/server.rs
use crate::config::Config;
use crate::error::{PortalError, Result};
use crate::socket;
use askama::Template;
use axum::{extract::State, response::Html, routing::get, Json, Router};
use os_updater::{AptCache, OsUpdater, Timedatectl};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::info;
use updater_protocol::UpgradeSize;

pub type Updater = OsUpdater<AptCache, Timedatectl>;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub updater: Updater,
    pub config: Config,
}

/// Landing page
#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    version: &'static str,
    mode: String,
    busy: bool,
    clients: usize,
    phase: String,
    download: String,
    disk: String,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct StateResponse {
    pub busy: bool,
    pub clients: usize,
    pub phase: String,
}

/// Run the portal HTTP server until `shutdown` is cancelled
pub async fn run(state: AppState, shutdown: CancellationToken) -> Result<()> {
    let config = state.config.clone();

    let app = Router::new()
        .route("/", get(index))
        .route("/api/os-upgrade/state", get(upgrade_state))
        .route("/api/os-upgrade/size", get(upgrade_size))
        .route("/os-upgrade", get(socket::os_upgrade))
        .nest_service("/static", ServeDir::new(&config.static_dir))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| PortalError::bind(&addr, e))?;

    if config.is_check_mode() {
        info!("🔍 Portal listening on http://localhost:{}", config.port);
        info!("   CHECK mode - upgrades are simulated");
        info!("   Use --apply flag to actually upgrade");
    } else {
        info!("⚠️  Portal listening on http://0.0.0.0:{}", config.port);
        info!("   APPLY mode - packages WILL be installed!");
    }

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(PortalError::Serve)?;

    info!("Portal stopped");
    Ok(())
}

/// Handler for the main page
async fn index(State(state): State<AppState>) -> Result<Html<String>> {
    let snapshot = state.updater.state(None);
    let size = state.updater.upgrade_size();

    let template = IndexTemplate {
        version: env!("CARGO_PKG_VERSION"),
        mode: state.config.execution_mode.to_string(),
        busy: snapshot.busy,
        clients: snapshot.clients,
        phase: snapshot.phase.to_string(),
        download: format_bytes(size.download_size as i64),
        disk: format_bytes(size.required_space),
    };

    Ok(Html(template.render()?))
}

async fn upgrade_state(State(state): State<AppState>) -> Json<StateResponse> {
    let snapshot = state.updater.state(None);
    Json(StateResponse {
        busy: snapshot.busy,
        clients: snapshot.clients,
        phase: snapshot.phase.to_string(),
    })
}

async fn upgrade_size(State(state): State<AppState>) -> Json<UpgradeSize> {
    Json(state.updater.upgrade_size())
}

/// SI units, the way apt reports them
fn format_bytes(bytes: i64) -> String {
    const UNITS: [&str; 4] = ["kB", "MB", "GB", "TB"];

    let sign = if bytes < 0 { "-" } else { "" };
    let mut value = bytes.unsigned_abs() as f64;
    if value < 1000.0 {
        return format!("{}{} B", sign, value);
    }

    let mut unit = UNITS[0];
    for next in UNITS {
        value /= 1000.0;
        unit = next;
        if value < 1000.0 {
            break;
        }
    }
    format!("{}{:.1} {}", sign, value, unit)
}
