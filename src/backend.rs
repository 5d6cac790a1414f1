//! Execution backend trait and implementations.
//!
//! A backend answers two questions for the gateway: which unit a request path
//! names, and how to run that unit once with a CGI environment and three
//! standard streams. The engine never knows which substrate it talks to.

mod container;
mod process;
mod sandbox;

pub use container::{demux, ContainerApi, ContainerBackend, ContainerSpec, DockerApi, LogChunk};
pub use process::ProcessBackend;
pub use sandbox::SandboxBackend;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::config::GatewayConfig;
use crate::context::RequestContext;
use crate::error::GatewayError;
use crate::resolve::ResolvedUnit;

/// Owned request body stream.
pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;

/// Owned output stream.
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// CGI environment handed to a unit, ordered by name.
pub type CgiEnv = BTreeMap<String, String>;

/// The three standard streams of one execution.
pub struct ExecIo {
    /// Request body, fed to the unit's stdin.
    pub stdin: BoxReader,
    /// Receives the unit's stdout (header block + body).
    pub stdout: BoxWriter,
    /// Receives the unit's stderr.
    pub stderr: BoxWriter,
}

/// Trait for execution backends.
///
/// Implementations are bound to the static configuration when constructed
/// and hold no per-request state: two runs of the same unit are independent.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Registry name of this backend.
    fn name(&self) -> &'static str;

    /// Resolve a request path (prefix already stripped) to a unit.
    ///
    /// Must not execute or modify anything.
    async fn exists(&self, path: &str, ctx: &RequestContext) -> Result<ResolvedUnit, GatewayError>;

    /// Run `unit` once.
    ///
    /// Output is streamed into `io.stdout`/`io.stderr` as it is produced.
    /// Failures to locate or start the unit are reported before anything is
    /// written. The streams in `io` are dropped before this returns.
    async fn run(
        &self,
        unit: &str,
        env: &CgiEnv,
        io: ExecIo,
        ctx: &RequestContext,
    ) -> Result<(), GatewayError>;
}

/// Builds a backend bound to the static configuration.
pub type BackendConstructor =
    fn(Arc<GatewayConfig>) -> Result<Arc<dyn ExecutionBackend>, GatewayError>;

/// Name-keyed constructors of the available backends.
///
/// Filled once at startup and only read afterwards.
pub struct BackendRegistry {
    constructors: HashMap<&'static str, BackendConstructor>,
}

impl BackendRegistry {
    pub fn empty() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// Registry holding the process, container and sandbox backends.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        process::register(&mut registry);
        container::register(&mut registry);
        sandbox::register(&mut registry);
        registry
    }

    pub fn register(&mut self, name: &'static str, constructor: BackendConstructor) {
        self.constructors.insert(name, constructor);
    }

    /// Sorted backend names.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.constructors.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Instantiate the backend called `name`.
    pub fn create(
        &self,
        name: &str,
        config: Arc<GatewayConfig>,
    ) -> Result<Arc<dyn ExecutionBackend>, GatewayError> {
        let constructor = self.constructors.get(name).ok_or_else(|| {
            GatewayError::Config(format!(
                "unknown runner {name:?}, available: {:?}",
                self.names()
            ))
        })?;
        constructor(config)
    }
}
