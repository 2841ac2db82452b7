// bases/device_portal/src/config.rs
use clap::Parser;
use os_updater::{ClockSettings, ExecutionMode, RegistrationPolicy};
use std::path::PathBuf;
use std::time::Duration;

/// Portal configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Port to listen on
    pub port: u16,

    /// Execution mode (DryRun or Apply)
    pub execution_mode: ExecutionMode,

    pub ready_breadcrumb: PathBuf,
    pub extend_timeout_breadcrumb: PathBuf,

    /// Package the portal itself is installed from
    pub self_package: String,
    pub first_party_prefixes: Vec<String>,

    pub registration_policy: RegistrationPolicy,

    pub network_wait: Duration,
    pub sync_attempts: u32,
    pub connectivity_probe: String,

    pub static_dir: PathBuf,
}

/// Device Portal - OS update orchestration for the device
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Port to listen on (defaults: 8080 in check mode, 80 in apply mode)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Actually refresh sources and install packages (DANGEROUS!)
    ///
    /// By default the portal runs in --check mode: package commits are
    /// simulated and the index is never refreshed.
    #[arg(long, alias = "danger")]
    pub apply: bool,

    /// Check mode (dry run) - show what would be done without making changes
    ///
    /// This is the DEFAULT mode. Only use --apply on a device you mean to upgrade.
    #[arg(long, conflicts_with = "apply")]
    pub check: bool,

    /// Marker telling the firmware updater the OS side is done
    #[arg(long, default_value = "/run/device-portal/ready")]
    pub ready_breadcrumb: PathBuf,

    /// Marker asking the firmware updater to keep waiting
    #[arg(long, default_value = "/run/device-portal/extend-timeout")]
    pub extend_timeout_breadcrumb: PathBuf,

    #[arg(long, default_value = "device-portal")]
    pub self_package: String,

    /// Name prefix of first-party packages (repeatable)
    #[arg(long = "first-party-prefix", default_value = "device-")]
    pub first_party_prefixes: Vec<String>,

    /// Only the first connected viewer receives progress
    #[arg(long)]
    pub single_viewer: bool,

    /// How long to wait for the network before resyncing the clock
    #[arg(long, default_value_t = 60)]
    pub network_wait_secs: u64,

    /// How many times to poll for clock synchronization
    #[arg(long, default_value_t = 10)]
    pub sync_attempts: u32,

    /// host:port dialled to decide whether the network is up
    #[arg(long, default_value = "deb.debian.org:80")]
    pub connectivity_probe: String,

    #[arg(long, default_value = "static")]
    pub static_dir: PathBuf,
}

impl Config {
    /// Create configuration from CLI arguments
    pub fn from_args(args: CliArgs) -> Self {
        let execution_mode = if args.apply {
            ExecutionMode::Apply
        } else {
            ExecutionMode::default()
        };

        let default_port = if execution_mode == ExecutionMode::Apply {
            80
        } else {
            8080
        };

        let registration_policy = if args.single_viewer {
            RegistrationPolicy::FirstAttacher
        } else {
            RegistrationPolicy::Shared
        };

        Self {
            port: args.port.unwrap_or(default_port),
            execution_mode,
            ready_breadcrumb: args.ready_breadcrumb,
            extend_timeout_breadcrumb: args.extend_timeout_breadcrumb,
            self_package: args.self_package,
            first_party_prefixes: args.first_party_prefixes,
            registration_policy,
            network_wait: Duration::from_secs(args.network_wait_secs),
            sync_attempts: args.sync_attempts,
            connectivity_probe: args.connectivity_probe,
            static_dir: args.static_dir,
        }
    }

    pub fn clock_settings(&self) -> ClockSettings {
        ClockSettings {
            network_timeout: self.network_wait,
            max_attempts: self.sync_attempts,
            ..ClockSettings::default()
        }
    }

    /// Check if running in check mode (safe)
    pub fn is_check_mode(&self) -> bool {
        self.execution_mode == ExecutionMode::DryRun
    }
}
