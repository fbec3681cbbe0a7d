//! Managed child processes.
//!
//! A [`ManagedProcess`] is a spawned child whose stdout and stderr are
//! forwarded line-by-line into the log, tagged with the child's name.
//! Stopping is graceful on unix: SIGTERM, then SIGKILL after the grace
//! period.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Everything needed to spawn a child
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    /// Short name used in log fields
    pub name: String,
    pub program: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub workdir: Option<PathBuf>,
}

impl ProcessSpec {
    /// Rendered command line for log messages
    pub fn command_line(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

pub struct ManagedProcess {
    name: String,
    child: Child,
    started_at: Instant,
}

impl ManagedProcess {
    pub fn spawn(spec: &ProcessSpec) -> Result<Self> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        if let Some(dir) = &spec.workdir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().with_context(|| {
            format!("Failed to spawn {} ({})", spec.name, spec.command_line())
        })?;

        if let Some(stdout) = child.stdout.take() {
            forward_lines(&spec.name, "stdout", stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_lines(&spec.name, "stderr", stderr);
        }

        info!(
            child = %spec.name,
            pid = child.id().unwrap_or(0),
            command = %spec.command_line(),
            "Child spawned"
        );

        Ok(Self {
            name: spec.name.clone(),
            child,
            started_at: Instant::now(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// How long this child has been running
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Wait for the child to exit
    pub async fn wait(&mut self) -> Result<ExitStatus> {
        self.child
            .wait()
            .await
            .with_context(|| format!("Failed to wait for {}", self.name))
    }

    /// Non-blocking exit check
    pub fn try_wait(&mut self) -> Result<Option<ExitStatus>> {
        self.child
            .try_wait()
            .with_context(|| format!("Failed to poll {}", self.name))
    }

    /// Stop the child: SIGTERM, then SIGKILL after the grace period
    pub async fn stop(&mut self, grace: Duration) -> Result<()> {
        if self.try_wait()?.is_some() {
            debug!(child = %self.name, "Child already exited");
            return Ok(());
        }

        #[cfg(unix)]
        if let Some(pid) = self.child.id() {
            // Deliver SIGTERM directly; tokio's kill() only knows SIGKILL
            unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };

            match tokio::time::timeout(grace, self.child.wait()).await {
                Ok(status) => {
                    let status =
                        status.with_context(|| format!("Failed to wait for {}", self.name))?;
                    info!(child = %self.name, status = %format_exit(&status), "Child stopped");
                    return Ok(());
                }
                Err(_) => {
                    warn!(
                        child = %self.name,
                        grace_secs = grace.as_secs(),
                        "Child ignored SIGTERM, killing"
                    );
                }
            }
        }

        self.child
            .kill()
            .await
            .with_context(|| format!("Failed to kill {}", self.name))?;
        info!(child = %self.name, "Child killed");
        Ok(())
    }
}

fn forward_lines<R>(name: &str, stream: &'static str, reader: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let name = name.to_string();
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            info!(child = %name, stream = stream, "{}", line);
        }
    });
}

/// Describe an exit status, including the signal on unix
pub fn format_exit(status: &ExitStatus) -> String {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("terminated by signal {}", signal);
        }
    }
    match status.code() {
        Some(code) => format!("exited with code {}", code),
        None => "exited".to_string(),
    }
}
