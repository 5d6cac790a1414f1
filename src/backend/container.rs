//! Container backend.
//!
//! Units are local image tags named `<base_dir><unit><suffix>`. A run creates
//! a throwaway container from the image, waits for it to stop, replays its
//! logs into the response and removes it again, on every path.

use std::sync::Arc;

use async_trait::async_trait;
use bollard::container::LogOutput;
use bollard::errors::Error as BollardError;
use bollard::models::{ContainerCreateBody, HostConfig, Mount, MountTypeEnum};
use bollard::query_parameters::{
    CreateContainerOptionsBuilder, ListImagesOptionsBuilder, LogsOptionsBuilder,
    RemoveContainerOptionsBuilder, StartContainerOptions, WaitContainerOptionsBuilder,
};
use bollard::Docker;
use bytes::Bytes;
use futures_util::stream::{BoxStream, StreamExt};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, error, info, instrument, warn};

use super::{BackendRegistry, BoxWriter, CgiEnv, ExecIo, ExecutionBackend};
use crate::config::{GatewayConfig, MountKind, MountSpec};
use crate::context::RequestContext;
use crate::error::GatewayError;
use crate::plumbing::deadline;
use crate::resolve::{resolve_registry, ResolvedUnit};

/// One frame of a container's multiplexed log stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogChunk {
    Stdout(Bytes),
    Stderr(Bytes),
}

/// What a run asks of a container engine.
pub struct ContainerSpec<'a> {
    pub image: &'a str,
    pub env: Vec<String>,
    pub mounts: &'a [MountSpec],
    pub workdir: Option<&'a str>,
}

/// The container engine operations the backend needs.
#[async_trait]
pub trait ContainerApi: Send + Sync {
    /// Every tag of every local image.
    async fn list_image_tags(&self) -> Result<Vec<String>, GatewayError>;

    /// Create a stopped container and return its id.
    async fn create(&self, spec: ContainerSpec<'_>) -> Result<String, GatewayError>;

    async fn start(&self, id: &str) -> Result<(), GatewayError>;

    /// Block until the container is no longer running; returns its exit code.
    async fn wait(&self, id: &str) -> Result<i64, GatewayError>;

    /// Stdout and stderr of a stopped container, in write order.
    fn logs<'a>(&'a self, id: &'a str) -> BoxStream<'a, Result<LogChunk, GatewayError>>;

    /// Force-remove the container together with its anonymous volumes.
    async fn remove(&self, id: &str) -> Result<(), GatewayError>;
}

fn docker_error(op: &str, source: &BollardError) -> GatewayError {
    GatewayError::Setup(format!("docker {op}: {source}"))
}

fn to_bollard_mount(spec: &MountSpec) -> Mount {
    let typ = match spec.kind {
        MountKind::Bind => MountTypeEnum::BIND,
        MountKind::Volume => MountTypeEnum::VOLUME,
        MountKind::Tmpfs => MountTypeEnum::TMPFS,
        MountKind::Npipe => MountTypeEnum::NPIPE,
        MountKind::Cluster => MountTypeEnum::CLUSTER,
    };
    Mount {
        source: (!spec.source.is_empty()).then(|| spec.source.clone()),
        target: Some(spec.target.clone()),
        typ: Some(typ),
        read_only: Some(spec.read_only),
        ..Mount::default()
    }
}

/// [`ContainerApi`] backed by a local Docker daemon.
#[derive(Debug, Clone)]
pub struct DockerApi {
    docker: Docker,
}

impl DockerApi {
    /// Connect using `DOCKER_HOST` or the platform's default socket.
    pub fn connect() -> Result<Self, GatewayError> {
        let docker =
            Docker::connect_with_local_defaults().map_err(|e| docker_error("connect", &e))?;
        Ok(Self { docker })
    }
}

#[async_trait]
impl ContainerApi for DockerApi {
    async fn list_image_tags(&self) -> Result<Vec<String>, GatewayError> {
        let images = self
            .docker
            .list_images(Some(ListImagesOptionsBuilder::new().all(false).build()))
            .await
            .map_err(|e| docker_error("image list", &e))?;
        Ok(images.into_iter().flat_map(|image| image.repo_tags).collect())
    }

    async fn create(&self, spec: ContainerSpec<'_>) -> Result<String, GatewayError> {
        let body = ContainerCreateBody {
            image: Some(spec.image.to_string()),
            env: Some(spec.env),
            working_dir: spec.workdir.map(str::to_string),
            tty: Some(false),
            host_config: Some(HostConfig {
                mounts: Some(spec.mounts.iter().map(to_bollard_mount).collect()),
                ..HostConfig::default()
            }),
            ..ContainerCreateBody::default()
        };
        let created = self
            .docker
            .create_container(Some(CreateContainerOptionsBuilder::new().build()), body)
            .await
            .map_err(|e| docker_error("create", &e))?;
        for warning in &created.warnings {
            warn!(id = %created.id, warning = %warning, "container create warning");
        }
        Ok(created.id)
    }

    async fn start(&self, id: &str) -> Result<(), GatewayError> {
        self.docker
            .start_container(id, None::<StartContainerOptions>)
            .await
            .map_err(|e| docker_error("start", &e))
    }

    async fn wait(&self, id: &str) -> Result<i64, GatewayError> {
        let options = WaitContainerOptionsBuilder::new()
            .condition("not-running")
            .build();
        let mut responses = std::pin::pin!(self.docker.wait_container(id, Some(options)));
        match responses.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // bollard reports a non-zero exit as an error carrying the code
            Some(Err(BollardError::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(docker_error("wait", &e)),
            None => Err(GatewayError::Setup(format!(
                "docker wait: no status for container {id}"
            ))),
        }
    }

    fn logs<'a>(&'a self, id: &'a str) -> BoxStream<'a, Result<LogChunk, GatewayError>> {
        let options = LogsOptionsBuilder::new()
            .stdout(true)
            .stderr(true)
            .follow(false)
            .build();
        self.docker
            .logs(id, Some(options))
            .filter_map(|frame| async move {
                match frame {
                    Ok(LogOutput::StdOut { message } | LogOutput::Console { message }) => {
                        Some(Ok(LogChunk::Stdout(message)))
                    }
                    Ok(LogOutput::StdErr { message }) => Some(Ok(LogChunk::Stderr(message))),
                    Ok(LogOutput::StdIn { .. }) => None,
                    Err(e) => Some(Err(docker_error("logs", &e))),
                }
            })
            .boxed()
    }

    async fn remove(&self, id: &str) -> Result<(), GatewayError> {
        let options = RemoveContainerOptionsBuilder::new().force(true).v(true).build();
        self.docker
            .remove_container(id, Some(options))
            .await
            .map_err(|e| docker_error("remove", &e))
    }
}

/// Route each log frame to the writer for its stream, then close both.
pub async fn demux<O, E>(
    mut frames: BoxStream<'_, Result<LogChunk, GatewayError>>,
    stdout: &mut O,
    stderr: &mut E,
) -> Result<(), GatewayError>
where
    O: AsyncWrite + Unpin + ?Sized,
    E: AsyncWrite + Unpin + ?Sized,
{
    let (mut out_len, mut err_len) = (0usize, 0usize);
    while let Some(frame) = frames.next().await {
        match frame? {
            LogChunk::Stdout(data) => {
                out_len += data.len();
                stdout.write_all(&data).await?;
            }
            LogChunk::Stderr(data) => {
                err_len += data.len();
                stderr.write_all(&data).await?;
            }
        }
    }
    debug!(stdout = out_len, stderr = err_len, "logs forwarded");
    stdout.shutdown().await?;
    stderr.shutdown().await?;
    Ok(())
}

/// Backend running each unit in a fresh container.
pub struct ContainerBackend<A = DockerApi> {
    config: Arc<GatewayConfig>,
    mounts: Vec<MountSpec>,
    api: A,
}

impl<A: ContainerApi> ContainerBackend<A> {
    /// Bind `api` to the configuration. Fails on an invalid mount spec.
    pub fn new(config: Arc<GatewayConfig>, api: A) -> Result<Self, GatewayError> {
        let mounts = config.mounts()?;
        Ok(Self {
            config,
            mounts,
            api,
        })
    }

    fn image_prefix(&self) -> String {
        self.config.base_dir.to_string_lossy().into_owned()
    }

    /// Start, wait, forward logs. The container exists when this is called.
    async fn drive(
        &self,
        id: &str,
        unit: &str,
        mut stdout: BoxWriter,
        mut stderr: BoxWriter,
        ctx: &RequestContext,
    ) -> Result<(), GatewayError> {
        let started = async {
            self.api.start(id).await?;
            debug!(id, "started");
            self.api.wait(id).await
        };
        let code = tokio::select! {
            code = started => code?,
            () = deadline(self.config.timeout) => {
                let limit = self.config.timeout.unwrap_or_default();
                warn!(id, timeout = ?limit, "container timed out");
                return Err(GatewayError::Timeout(limit));
            }
            () = ctx.cancel.cancelled() => {
                warn!(id, "container run cancelled");
                return Err(GatewayError::Cancelled);
            }
        };
        info!(id, code, "container stopped");

        demux(self.api.logs(id), &mut stdout, &mut stderr).await?;
        if code == 0 {
            Ok(())
        } else {
            Err(GatewayError::ExitCode {
                unit: unit.to_string(),
                code,
            })
        }
    }
}

pub(super) fn register(registry: &mut BackendRegistry) {
    registry.register("docker", |config| {
        let api = DockerApi::connect()?;
        Ok(Arc::new(ContainerBackend::new(config, api)?))
    });
}

#[async_trait]
impl<A: ContainerApi + 'static> ExecutionBackend for ContainerBackend<A> {
    fn name(&self) -> &'static str {
        "docker"
    }

    #[instrument(skip(self, _ctx))]
    async fn exists(&self, path: &str, _ctx: &RequestContext) -> Result<ResolvedUnit, GatewayError> {
        let tags = self.api.list_image_tags().await?;
        let prefix = self.image_prefix();
        resolve_registry(tags.iter().map(String::as_str), &prefix, &self.config.suffix, path)
            .inspect_err(|_| warn!(path, prefix = %prefix, suffix = %self.config.suffix, "image not found"))
    }

    #[instrument(skip(self, env, io, ctx))]
    async fn run(
        &self,
        unit: &str,
        env: &CgiEnv,
        io: ExecIo,
        ctx: &RequestContext,
    ) -> Result<(), GatewayError> {
        // request bodies are not forwarded into containers
        let ExecIo { stdout, stderr, .. } = io;

        let spec = ContainerSpec {
            image: unit,
            env: env.iter().map(|(k, v)| format!("{k}={v}")).collect(),
            mounts: &self.mounts,
            workdir: self.config.docker_workdir.as_deref(),
        };
        let id = self.api.create(spec).await?;
        debug!(id = %id, "created");

        let result = self.drive(&id, unit, stdout, stderr, ctx).await;

        if let Err(e) = self.api.remove(&id).await {
            error!(id = %id, error = %e, "failed to remove container");
        } else {
            debug!(id = %id, "removed");
        }
        result
    }
}
