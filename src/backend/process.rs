//! Native process backend.
//!
//! Units are executables under the base directory. Each run forks a child
//! whose environment is exactly the CGI environment: nothing from the
//! gateway's own environment leaks into it.

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, error, instrument, warn};

use super::{BackendRegistry, CgiEnv, ExecIo, ExecutionBackend};
use crate::config::GatewayConfig;
use crate::context::RequestContext;
use crate::error::GatewayError;
use crate::plumbing::{Plumbing, PlumbingError};
use crate::resolve::{resolve_file, ResolvedUnit};

/// Backend that runs units as child processes.
#[derive(Debug, Clone)]
pub struct ProcessBackend {
    config: Arc<GatewayConfig>,
}

impl ProcessBackend {
    /// Create a new process backend.
    pub const fn new(config: Arc<GatewayConfig>) -> Self {
        Self { config }
    }
}

pub(super) fn register(registry: &mut BackendRegistry) {
    registry.register("os", |config| Ok(Arc::new(ProcessBackend::new(config))));
}

fn not_captured(stream: &str) -> GatewayError {
    GatewayError::Io(std::io::Error::other(format!("child {stream} not captured")))
}

#[async_trait]
impl ExecutionBackend for ProcessBackend {
    fn name(&self) -> &'static str {
        "os"
    }

    #[instrument(skip(self, _ctx))]
    async fn exists(&self, path: &str, _ctx: &RequestContext) -> Result<ResolvedUnit, GatewayError> {
        resolve_file(&self.config.base_dir, path, &self.config.suffix).await
    }

    #[instrument(skip(self, env, io, ctx))]
    async fn run(
        &self,
        unit: &str,
        env: &CgiEnv,
        io: ExecIo,
        ctx: &RequestContext,
    ) -> Result<(), GatewayError> {
        let path = self.config.base_dir.join(unit.trim_start_matches('/'));
        debug!(full_path = %path.display(), timeout = ?self.config.timeout, "path");

        let mut cmd = Command::new(&path);
        cmd.env_clear()
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| GatewayError::Spawn {
            unit: unit.to_string(),
            source,
        })?;
        debug!(pid = ?child.id(), "started");

        let child_stdin = child.stdin.take().ok_or_else(|| not_captured("stdin"))?;
        let child_stdout = child.stdout.take().ok_or_else(|| not_captured("stdout"))?;
        let child_stderr = child.stderr.take().ok_or_else(|| not_captured("stderr"))?;

        let ExecIo {
            stdin,
            stdout,
            stderr,
        } = io;
        let mut plumbing = Plumbing::new();
        plumbing.spawn_pipe("stdin", stdin, child_stdin);
        let stderr_task = plumbing.spawn_pipe("stderr", child_stderr, stderr);
        let stdout_task = plumbing.spawn_pipe("stdout", child_stdout, stdout);

        if let Err(interrupted) = plumbing.wait(self.config.timeout, &ctx.cancel).await {
            warn!(error = %interrupted, "killing unit");
            if let Err(e) = child.kill().await {
                error!(error = %e, "kill failed");
            }
            // Grandchildren may still hold the pipes open.
            stdout_task.abort();
            stderr_task.abort();
            return Err(match interrupted {
                PlumbingError::TimedOut(d) => GatewayError::Timeout(d),
                PlumbingError::Cancelled => GatewayError::Cancelled,
            });
        }

        let status = child.wait().await?;
        debug!(%status, "exited");
        if status.success() {
            Ok(())
        } else {
            Err(GatewayError::ExitStatus {
                unit: unit.to_string(),
                status,
            })
        }
    }
}
