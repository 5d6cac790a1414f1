//! Per-request orchestration: resolve, build the CGI environment, run the
//! unit and translate its output, then log the outcome.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use http::header::{CONTENT_TYPE, USER_AGENT};
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use tracing::{debug, error, info, instrument, warn};

use crate::backend::{BoxReader, CgiEnv, ExecIo, ExecutionBackend};
use crate::config::GatewayConfig;
use crate::context::RequestContext;
use crate::error::GatewayError;
use crate::plumbing::LogWriter;
use crate::translate::{translate, ResponseSink};

/// Buffer between a unit's stdout and the response translator.
const PIPE_CAPACITY: usize = 64 * 1024;

/// Value of `SERVER_SOFTWARE`.
pub const SERVER_SOFTWARE: &str = concat!("cgi-gateway/", env!("CARGO_PKG_VERSION"));

/// An HTTP request as the engine sees it.
pub struct InvocationRequest {
    pub method: Method,
    /// URL path, prefix not yet stripped.
    pub path: String,
    /// Query string without the leading `?`.
    pub raw_query: String,
    pub headers: HeaderMap,
    /// Peer address as `ip:port`; empty when unknown.
    pub remote_addr: String,
    /// HTTP version, e.g. `HTTP/1.1`.
    pub protocol: String,
    /// Credentials of an `Authorization: Basic` header.
    pub basic_auth: Option<(String, String)>,
    /// Declared body length, `-1` when unknown.
    pub content_length: i64,
    pub body: BoxReader,
}

impl InvocationRequest {
    fn uri(&self) -> String {
        if self.raw_query.is_empty() {
            self.path.clone()
        } else {
            format!("{}?{}", self.path, self.raw_query)
        }
    }
}

/// `HTTP_<NAME>` form of a header or carrier key.
fn http_var(name: &str) -> String {
    format!("HTTP_{}", name.to_ascii_uppercase().replace('-', "_"))
}

/// Build the CGI/1.1 environment for one invocation.
pub fn build_env(
    config: &GatewayConfig,
    req: &InvocationRequest,
    unit: &str,
    path_info: &str,
    ctx: &RequestContext,
) -> CgiEnv {
    let (server_name, server_port) = config.server_name_port();
    let document_root = config.document_root();
    let path_translated = match path_info.trim_start_matches('/') {
        "" => document_root.clone(),
        rest => config.base_dir.join(rest).to_string_lossy().into_owned(),
    };
    let content_type = req
        .headers
        .get(CONTENT_TYPE)
        .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
        .unwrap_or_default();

    let mut env = CgiEnv::from([
        ("SERVER_SOFTWARE".into(), SERVER_SOFTWARE.into()),
        ("SERVER_NAME".into(), server_name),
        ("GATEWAY_INTERFACE".into(), "CGI/1.1".into()),
        ("DOCUMENT_ROOT".into(), document_root),
        ("SERVER_PROTOCOL".into(), req.protocol.clone()),
        ("SERVER_PORT".into(), server_port),
        ("REQUEST_METHOD".into(), req.method.to_string()),
        ("PATH_INFO".into(), path_info.into()),
        ("PATH_TRANSLATED".into(), path_translated),
        ("SCRIPT_NAME".into(), unit.into()),
        ("QUERY_STRING".into(), req.raw_query.clone()),
        ("REMOTE_ADDR".into(), req.remote_addr.clone()),
        ("CONTENT_TYPE".into(), content_type),
        ("CONTENT_LENGTH".into(), req.content_length.to_string()),
    ]);

    if let Some((user, _)) = &req.basic_auth {
        env.insert("REMOTE_USER".into(), user.clone());
        env.insert("AUTH_TYPE".into(), "Basic".into());
    }

    for name in req.headers.keys() {
        let values: Vec<_> = req
            .headers
            .get_all(name)
            .iter()
            .map(|v| String::from_utf8_lossy(v.as_bytes()))
            .collect();
        env.insert(http_var(name.as_str()), values.join(";"));
    }

    if let Some(carrier) = &ctx.carrier {
        for (key, value) in carrier {
            env.insert(http_var(key), value.clone());
        }
    }
    env
}

/// Drives one backend for every request.
pub struct GatewayEngine {
    config: Arc<GatewayConfig>,
    backend: Arc<dyn ExecutionBackend>,
}

impl GatewayEngine {
    pub fn new(config: Arc<GatewayConfig>, backend: Arc<dyn ExecutionBackend>) -> Self {
        Self { config, backend }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Serve one request into `sink`. Returns the status that was sent.
    #[instrument(skip_all, fields(method = %req.method, path = %req.path))]
    pub async fn handle<S>(&self, req: InvocationRequest, sink: S, ctx: &RequestContext) -> StatusCode
    where
        S: ResponseSink + 'static,
    {
        let started = Instant::now();
        let method = req.method.clone();
        let uri = req.uri();
        let remote_addr = req.remote_addr.clone();
        let proto = req.protocol.clone();
        let user_agent = req
            .headers
            .get(USER_AGENT)
            .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
            .unwrap_or_default();

        let status = self.dispatch(req, sink, ctx).await;

        info!(
            method = %method,
            uri = %uri,
            remote_addr = %remote_addr,
            proto = %proto,
            user_agent = %user_agent,
            status = status.as_u16(),
            elapsed = ?started.elapsed(),
            "access-log"
        );
        status
    }

    async fn dispatch<S>(&self, req: InvocationRequest, mut sink: S, ctx: &RequestContext) -> StatusCode
    where
        S: ResponseSink + 'static,
    {
        let requested = req
            .path
            .strip_prefix(self.config.prefix.as_str())
            .map(str::to_string);
        let resolved = match requested {
            Some(ref path) => self.backend.exists(path, ctx).await,
            None => Err(GatewayError::NotFound(req.path.clone())),
        };
        let requested = requested.unwrap_or_else(|| req.path.clone());
        let unit = match resolved {
            Ok(unit) => unit,
            Err(e) => {
                warn!(error = %e, path = %requested, "not found");
                let body = format!("{requested} not found\n");
                return respond_plain(&mut sink, StatusCode::NOT_FOUND, body).await;
            }
        };
        debug!(unit = %unit.unit, path_info = %unit.path_info, "resolved");

        let env = build_env(&self.config, &req, &unit.unit, &unit.path_info, ctx);

        let (output, writer) = tokio::io::duplex(PIPE_CAPACITY);
        let translator = tokio::spawn(async move {
            let translated = translate(output, &mut sink).await;
            (sink, translated)
        });

        let io = ExecIo {
            stdin: req.body,
            stdout: Box::new(writer),
            stderr: Box::new(LogWriter::new(unit.unit.clone())),
        };
        let ran = self.backend.run(&unit.unit, &env, io, ctx).await;

        let (mut sink, translated) = match translator.await {
            Ok(joined) => joined,
            Err(e) => {
                error!(error = %e, "translator task failed");
                return StatusCode::INTERNAL_SERVER_ERROR;
            }
        };

        let failure = match (ran, translated) {
            (Err(e), translated) => {
                if let Err(te) = translated {
                    debug!(error = %te, "output filter");
                }
                Some(e)
            }
            (Ok(()), Err(e)) => Some(e),
            (Ok(()), Ok(length)) => {
                debug!(length, "response forwarded");
                None
            }
        };

        match (sink.status(), failure) {
            (Some(status), None) => status,
            (Some(status), Some(e)) => {
                warn!(error = %e, "unit failed after the response was committed");
                status
            }
            (None, failure) => {
                let message = failure.map_or_else(|| "no response".to_string(), |e| e.to_string());
                error!(error = %message, unit = %unit.unit, "command error");
                let body = format!("command error: {message}");
                respond_plain(&mut sink, StatusCode::INTERNAL_SERVER_ERROR, body).await
            }
        }
    }
}

/// Send a complete `text/plain` response. Returns `status`.
async fn respond_plain<S>(sink: &mut S, status: StatusCode, body: String) -> StatusCode
where
    S: ResponseSink + ?Sized,
{
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    if let Err(e) = sink.send_head(status, headers).await {
        warn!(error = %e, "failed to send response head");
        return status;
    }
    if let Err(e) = sink.send_body(Bytes::from(body)).await {
        warn!(error = %e, "failed to send response body");
    }
    status
}
