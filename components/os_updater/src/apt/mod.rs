//! [`PackageCache`] on top of the apt command-line tools
//!
//! Marks live in memory until [`PackageCache::commit`] turns them into a
//! single `apt-get` invocation. Progress comes from `APT::Status-Fd`, pointed
//! at stdout so it can be read line by line alongside the regular output.

mod parse;

pub use parse::{
    parse_policy, parse_show_depends, parse_size, parse_status_line, parse_summary, Policy,
    Requirement, StatusLine,
};

use crate::cache::{Candidate, ChangeSummary, DependencyTarget, Package, PackageCache};
use crate::error::CacheError;
use crate::mode::ExecutionMode;
use crate::progress::{FetchProgress, InstallProgress, ProgressSink};
use futures::{Stream, StreamExt};
use std::io;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, trace, warn};

const DPKG_OPTIONS: [&str; 4] = [
    "-o",
    "Dpkg::Options::=--force-confdef",
    "-o",
    "Dpkg::Options::=--force-confold",
];

/// What the next commit will ask apt to do
#[derive(Debug, Clone, Default, PartialEq, Eq)]
enum Selection {
    #[default]
    Nothing,
    Upgrade {
        dist: bool,
    },
    Packages(Vec<String>),
}

impl Selection {
    fn args(&self) -> Option<Vec<String>> {
        match self {
            Selection::Nothing => None,
            Selection::Upgrade { dist: true } => Some(vec!["dist-upgrade".to_string()]),
            Selection::Upgrade { dist: false } => Some(vec!["upgrade".to_string()]),
            Selection::Packages(packages) => {
                let mut args = vec!["install".to_string(), "--only-upgrade".to_string()];
                args.extend(packages.iter().cloned());
                Some(args)
            }
        }
    }
}

pub struct AptCache {
    mode: ExecutionMode,
    selection: Selection,
}

impl AptCache {
    pub fn new(mode: ExecutionMode) -> Self {
        Self {
            mode,
            selection: Selection::Nothing,
        }
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    fn command(program: &str) -> Command {
        let mut command = Command::new(program);
        command
            .env("LC_ALL", "C")
            .env("DEBIAN_FRONTEND", "noninteractive")
            .stdin(Stdio::null())
            .kill_on_drop(true);
        command
    }

    async fn read(mut command: Command, label: &str) -> Result<String, CacheError> {
        let output = command
            .output()
            .await
            .map_err(|e| CacheError::command_failed(label, e))?;
        if !output.status.success() {
            return Err(CacheError::CommandExitCode {
                command: label.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    async fn policy(&self, name: &str) -> Result<Option<Policy>, CacheError> {
        let mut command = Self::command("apt-cache");
        command.args(["policy", name]);
        let output = Self::read(command, &format!("apt-cache policy {}", name)).await?;
        Ok(parse_policy(&output))
    }

    async fn dependencies(
        &self,
        name: &str,
        version: &str,
    ) -> Result<Vec<Vec<DependencyTarget>>, CacheError> {
        let selector = format!("{}={}", name, version);
        let mut command = Self::command("apt-cache");
        command.args(["show", selector.as_str()]);
        let output = Self::read(command, &format!("apt-cache show {}", selector)).await?;

        let mut groups = Vec::new();
        for group in parse_show_depends(&output) {
            let mut targets = Vec::with_capacity(group.len());
            for requirement in group {
                // Virtual packages have no versions of their own
                let available = self
                    .policy(&requirement.name)
                    .await?
                    .map(|policy| policy.versions)
                    .unwrap_or_default();
                let accepted = requirement.accepts(&available);
                targets.push(DependencyTarget::new(
                    requirement.name.as_str(),
                    accepted.into_iter().cloned(),
                ));
            }
            groups.push(targets);
        }
        Ok(groups)
    }

    /// Run an apt-get invocation that reports on `APT::Status-Fd`
    async fn run_with_status<F>(
        mut command: Command,
        label: &str,
        mut on_status: F,
    ) -> Result<(), CacheError>
    where
        F: FnMut(StatusLine) + Send,
    {
        command
            .args(["-o", "APT::Status-Fd=1"])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = command
            .spawn()
            .map_err(|e| CacheError::command_failed(label, e))?;

        let (Some(stdout), Some(mut stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(CacheError::parse(label, "child output was not captured"));
        };

        let read_stdout = async {
            let lines = status_lines(stdout);
            futures::pin_mut!(lines);
            while let Some(status) = lines.next().await {
                on_status(status?);
            }
            Ok::<(), io::Error>(())
        };
        let read_stderr = async {
            let mut text = String::new();
            stderr.read_to_string(&mut text).await.map(|_| text)
        };
        let (stdout_result, stderr_result) = tokio::join!(read_stdout, read_stderr);
        stdout_result.map_err(|e| CacheError::command_failed(label, e))?;
        let stderr_text = stderr_result.unwrap_or_default();

        let status = child
            .wait()
            .await
            .map_err(|e| CacheError::command_failed(label, e))?;
        if !status.success() {
            return Err(CacheError::CommandExitCode {
                command: label.to_string(),
                stderr: stderr_text,
            });
        }
        Ok(())
    }
}

/// Status-Fd lines from apt's stdout; other output is only traced
fn status_lines<R>(reader: R) -> impl Stream<Item = io::Result<StatusLine>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    async_stream::try_stream! {
        let mut lines = BufReader::new(reader).lines();
        while let Some(line) = lines.next_line().await? {
            match parse_status_line(&line) {
                Some(status) => yield status,
                None => trace!("apt: {}", line),
            }
        }
    }
}

/// dlstatus only carries a percentage; express it as a fraction of 10000
fn fetch_progress(percent: f64, description: String) -> FetchProgress {
    FetchProgress {
        current_bytes: (percent.clamp(0.0, 100.0) * 100.0).round() as u64,
        total_bytes: 10_000,
        current_items: 0,
        total_items: 0,
        description,
    }
}

fn forward(status: StatusLine, fetch: &dyn ProgressSink, install: &dyn ProgressSink) {
    match status {
        StatusLine::Download {
            percent,
            description,
        } => fetch.fetch(fetch_progress(percent, description)),
        StatusLine::Install {
            percent,
            description,
        } => install.install(InstallProgress::Status {
            percent,
            description,
        }),
        StatusLine::Error { package, message } => {
            install.install(InstallProgress::Failed { package, message })
        }
    }
}

impl PackageCache for AptCache {
    async fn open(&mut self) -> Result<(), CacheError> {
        self.selection = Selection::Nothing;
        Ok(())
    }

    async fn update(&mut self, progress: &dyn ProgressSink) -> Result<(), CacheError> {
        if self.mode == ExecutionMode::DryRun {
            info!("[{}] Would run apt-get update", self.mode);
            return Ok(());
        }

        let mut command = Self::command("apt-get");
        command.arg("update");
        Self::run_with_status(command, "apt-get update", |status| {
            forward(status, progress, progress)
        })
        .await
    }

    async fn upgrade(&mut self, dist_upgrade: bool) -> Result<(), CacheError> {
        self.selection = Selection::Upgrade { dist: dist_upgrade };
        Ok(())
    }

    async fn package(&self, name: &str) -> Result<Option<Package>, CacheError> {
        let Some(policy) = self.policy(name).await? else {
            return Ok(None);
        };

        let candidate = match &policy.candidate {
            Some(version) => Some(Candidate {
                version: version.clone(),
                dependencies: self.dependencies(name, version).await?,
            }),
            None => None,
        };

        Ok(Some(Package {
            name: name.to_string(),
            installed_version: policy.installed,
            candidate,
        }))
    }

    fn mark_upgrade(&mut self, name: &str, version: Option<&str>) -> Result<(), CacheError> {
        let selector = match version {
            Some(version) => format!("{}={}", name, version),
            None => name.to_string(),
        };
        debug!("Marking {}", selector);
        match &mut self.selection {
            Selection::Packages(packages) => packages.push(selector),
            other => *other = Selection::Packages(vec![selector]),
        }
        Ok(())
    }

    async fn changes(&self) -> Result<ChangeSummary, CacheError> {
        let Some(args) = self.selection.args() else {
            return Ok(ChangeSummary::default());
        };

        let label = format!("apt-get --assume-no {}", args.join(" "));
        let mut command = Self::command("apt-get");
        command
            .args(["--assume-no", "-o", "Debug::NoLocking=1"])
            .args(&args);
        let output = command
            .output()
            .await
            .map_err(|e| CacheError::command_failed(&label, e))?;

        // --assume-no always ends in "Abort." with a failing exit code, so
        // only apt's own error lines count
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.lines().any(|line| line.starts_with("E:")) {
            return Err(CacheError::CommandExitCode {
                command: label,
                stderr: stderr.to_string(),
            });
        }

        Ok(parse_summary(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn commit(
        &mut self,
        fetch: &dyn ProgressSink,
        install: &dyn ProgressSink,
    ) -> Result<(), CacheError> {
        let Some(args) = self.selection.args() else {
            warn!("Nothing staged, nothing to commit");
            return Ok(());
        };

        let mut command = Self::command("apt-get");
        command.arg("-y").args(DPKG_OPTIONS);
        if self.mode == ExecutionMode::DryRun {
            info!("[{}] Simulating apt-get {}", self.mode, args.join(" "));
            command.arg("-s");
        }
        command.args(&args);

        let label = format!("apt-get {}", args.join(" "));
        Self::run_with_status(command, &label, |status| forward(status, fetch, install)).await?;

        self.selection = Selection::Nothing;
        Ok(())
    }
}
