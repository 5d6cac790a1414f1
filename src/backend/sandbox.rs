//! WebAssembly sandbox backend.
//!
//! Units are WASI preview-1 modules under the base directory. Each run gets
//! a fresh store with in-memory standard streams; the guest sees only the
//! CGI environment and the base directory, preopened as `.`.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, instrument, warn};
use wasmtime::{Engine, Linker, Module, Store};
use wasmtime_wasi::p1::WasiP1Ctx;
use wasmtime_wasi::p2::pipe::{MemoryInputPipe, MemoryOutputPipe};
use wasmtime_wasi::{DirPerms, FilePerms, I32Exit, WasiCtxBuilder};

use super::{BackendRegistry, CgiEnv, ExecIo, ExecutionBackend};
use crate::config::GatewayConfig;
use crate::context::RequestContext;
use crate::error::GatewayError;
use crate::plumbing::deadline;
use crate::resolve::{resolve_file, ResolvedUnit};

/// Backend that runs units inside wasmtime.
pub struct SandboxBackend {
    config: Arc<GatewayConfig>,
    engine: Engine,
}

impl SandboxBackend {
    pub fn new(config: Arc<GatewayConfig>) -> Self {
        Self {
            config,
            engine: Engine::default(),
        }
    }
}

pub(super) fn register(registry: &mut BackendRegistry) {
    registry.register("wasmtime", |config| Ok(Arc::new(SandboxBackend::new(config))));
}

fn trap(unit: &str, stage: &str, err: impl std::fmt::Display) -> GatewayError {
    GatewayError::Trap {
        unit: unit.to_string(),
        message: format!("{stage}: {err}"),
    }
}

/// Everything one guest invocation needs, owned so it can move to a
/// blocking worker.
struct Invocation {
    unit: String,
    env: CgiEnv,
    base_dir: PathBuf,
    stdin: Bytes,
    stdout: MemoryOutputPipe,
    stderr: MemoryOutputPipe,
}

impl Invocation {
    fn wasi_context(&self) -> Result<WasiP1Ctx, GatewayError> {
        let mut builder = WasiCtxBuilder::new();
        builder
            .stdin(MemoryInputPipe::new(self.stdin.clone()))
            .stdout(self.stdout.clone())
            .stderr(self.stderr.clone())
            .arg(&self.unit);
        for (key, value) in &self.env {
            builder.env(key, value);
        }
        builder
            .preopened_dir(&self.base_dir, ".", DirPerms::READ, FilePerms::READ)
            .map_err(|e| trap(&self.unit, "preopen base dir", e))?;
        Ok(builder.build_p1())
    }

    /// Run `_start` to completion. Returns the guest's exit code.
    fn call(self, engine: &Engine, module: &Module) -> Result<i32, GatewayError> {
        let wasi = self.wasi_context()?;
        let mut store = Store::new(engine, wasi);
        let mut linker = Linker::new(engine);
        wasmtime_wasi::p1::add_to_linker_sync(&mut linker, |ctx: &mut WasiP1Ctx| ctx)
            .map_err(|e| trap(&self.unit, "link wasi", e))?;
        let instance = linker
            .instantiate(&mut store, module)
            .map_err(|e| trap(&self.unit, "instantiate", e))?;
        let start = instance
            .get_typed_func::<(), ()>(&mut store, "_start")
            .map_err(|e| trap(&self.unit, "entry point", e))?;

        match start.call(&mut store, ()) {
            Ok(()) => Ok(0),
            Err(e) => match e.downcast_ref::<I32Exit>() {
                Some(exit) => Ok(exit.0),
                None => Err(trap(&self.unit, "run", e)),
            },
        }
    }
}

async fn forward<W>(label: &str, captured: &MemoryOutputPipe, out: &mut W) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let contents = captured.contents();
    debug!(pipe = label, length = contents.len(), "captured output");
    out.write_all(&contents).await?;
    out.shutdown().await
}

#[async_trait]
impl ExecutionBackend for SandboxBackend {
    fn name(&self) -> &'static str {
        "wasmtime"
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
        let bytecode = tokio::fs::read(&path)
            .await
            .map_err(|source| GatewayError::Spawn {
                unit: unit.to_string(),
                source,
            })?;
        debug!(length = bytecode.len(), filename = %path.display(), "bytecode read");
        let module =
            Module::new(&self.engine, &bytecode).map_err(|e| trap(unit, "compile", e))?;

        let ExecIo {
            mut stdin,
            mut stdout,
            mut stderr,
        } = io;
        let mut body = Vec::new();
        stdin.read_to_end(&mut body).await?;
        drop(stdin);

        let limit = self.config.sandbox_output_limit;
        let invocation = Invocation {
            unit: unit.to_string(),
            env: env.clone(),
            base_dir: self.config.base_dir.clone(),
            stdin: Bytes::from(body),
            stdout: MemoryOutputPipe::new(limit),
            stderr: MemoryOutputPipe::new(limit),
        };
        let (captured_out, captured_err) = (invocation.stdout.clone(), invocation.stderr.clone());

        let engine = self.engine.clone();
        let call = tokio::task::spawn_blocking(move || invocation.call(&engine, &module));
        let joined = tokio::select! {
            joined = call => joined,
            () = deadline(self.config.timeout) => {
                // the guest keeps its worker until it returns on its own
                warn!(timeout = ?self.config.timeout, "abandoning sandbox run");
                return Ok(());
            }
            () = ctx.cancel.cancelled() => {
                warn!("sandbox run cancelled");
                return Err(GatewayError::Cancelled);
            }
        };
        let outcome = joined.map_err(|e| trap(unit, "worker", e)).and_then(|r| r);

        forward("stdout", &captured_out, &mut stdout).await?;
        if let Err(e) = forward("stderr", &captured_err, &mut stderr).await {
            warn!(error = %e, "failed to forward stderr");
        }

        match outcome? {
            0 => Ok(()),
            code => Err(GatewayError::ExitCode {
                unit: unit.to_string(),
                code: i64::from(code),
            }),
        }
    }
}
