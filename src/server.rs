//! HTTP front end.
//!
//! Every request is handed to the [`GatewayEngine`] on its own task; the
//! response head is returned as soon as the unit's header block is parsed and
//! the body streams while the unit is still running.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::os::unix::fs::FileTypeExt;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::response::{IntoResponse, Response};
use axum::Router;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use futures_util::TryStreamExt;
use http::header::{AUTHORIZATION, CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderMap, StatusCode};
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::{mpsc, oneshot};
use tokio_util::io::StreamReader;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{error, info, warn};

use crate::config::Protocol;
use crate::context::RequestContext;
use crate::gateway::{GatewayEngine, InvocationRequest};
use crate::translate::ResponseSink;

/// Body chunks buffered between the translator and the client.
const BODY_CHANNEL_DEPTH: usize = 16;

type Head = (StatusCode, HeaderMap);

/// [`ResponseSink`] feeding an axum response across tasks.
pub struct ChannelSink {
    head: Option<oneshot::Sender<Head>>,
    body: mpsc::Sender<Bytes>,
    status: Option<StatusCode>,
}

impl ChannelSink {
    /// Create a sink plus the receiving ends for the head and body.
    pub fn new(depth: usize) -> (Self, oneshot::Receiver<Head>, mpsc::Receiver<Bytes>) {
        let (head_tx, head_rx) = oneshot::channel();
        let (body_tx, body_rx) = mpsc::channel(depth);
        let sink = Self {
            head: Some(head_tx),
            body: body_tx,
            status: None,
        };
        (sink, head_rx, body_rx)
    }
}

fn client_gone() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "client went away")
}

#[async_trait]
impl ResponseSink for ChannelSink {
    async fn send_head(&mut self, status: StatusCode, headers: HeaderMap) -> io::Result<()> {
        let head = self
            .head
            .take()
            .ok_or_else(|| io::Error::other("response head already sent"))?;
        self.status = Some(status);
        head.send((status, headers)).map_err(|_| client_gone())
    }

    async fn send_body(&mut self, chunk: Bytes) -> io::Result<()> {
        self.body.send(chunk).await.map_err(|_| client_gone())
    }

    fn status(&self) -> Option<StatusCode> {
        self.status
    }
}

/// Credentials of an `Authorization: Basic` header.
pub fn basic_auth(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, encoded) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

/// Declared body length; `-1` for chunked bodies of unknown size.
pub fn content_length(headers: &HeaderMap) -> i64 {
    if let Some(len) = headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
    {
        return len;
    }
    let chunked = headers
        .get_all(TRANSFER_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.to_ascii_lowercase().contains("chunked"));
    if chunked {
        -1
    } else {
        0
    }
}

/// URL path with percent-escapes decoded; `None` when the result is not UTF-8.
pub fn decode_path(raw: &str) -> Option<String> {
    urlencoding::decode(raw).ok().map(|path| path.into_owned())
}

/// Body stream that cancels the request when the client drops it.
fn body_stream(
    rx: mpsc::Receiver<Bytes>,
    guard: DropGuard,
) -> impl futures_util::Stream<Item = io::Result<Bytes>> + Send + 'static {
    futures_util::stream::unfold((rx, guard), |(mut rx, guard)| async move {
        let chunk = rx.recv().await?;
        Some((Ok(chunk), (rx, guard)))
    })
}

async fn handle_request(State(engine): State<Arc<GatewayEngine>>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let Some(path) = decode_path(parts.uri.path()) else {
        warn!(path = %parts.uri.path(), "path is not valid UTF-8 after decoding");
        return (StatusCode::BAD_REQUEST, "invalid path encoding\n").into_response();
    };
    let remote_addr = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_default();

    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();
    let mut ctx = RequestContext::new(cancel);
    if engine.config().propagate_trace {
        ctx = ctx.with_trace_from(&parts.headers);
    }

    let req = InvocationRequest {
        method: parts.method.clone(),
        path,
        raw_query: parts.uri.query().unwrap_or_default().to_string(),
        remote_addr,
        protocol: format!("{:?}", parts.version),
        basic_auth: basic_auth(&parts.headers),
        content_length: content_length(&parts.headers),
        body: Box::new(StreamReader::new(
            body.into_data_stream().map_err(io::Error::other),
        )),
        headers: parts.headers,
    };

    let (sink, head_rx, body_rx) = ChannelSink::new(BODY_CHANNEL_DEPTH);
    tokio::spawn(async move {
        engine.handle(req, sink, &ctx).await;
    });

    match head_rx.await {
        Ok((status, headers)) => {
            let mut response = Response::new(Body::from_stream(body_stream(body_rx, guard)));
            *response.status_mut() = status;
            *response.headers_mut() = headers;
            response
        }
        Err(_) => {
            error!("request finished without a response");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Router sending every path to the engine.
pub fn router(engine: Arc<GatewayEngine>) -> Router {
    Router::new().fallback(handle_request).with_state(engine)
}

/// Serve on an already bound TCP listener until `shutdown` resolves.
pub async fn serve_tcp<F>(listener: TcpListener, engine: Arc<GatewayEngine>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    info!(addr = %listener.local_addr()?, "listen");
    axum::serve(
        listener,
        router(engine).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .context("HTTP server error")
}

/// Serve on a Unix socket until `shutdown` resolves.
pub async fn serve_unix<F>(listener: UnixListener, engine: Arc<GatewayEngine>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    info!(addr = ?listener.local_addr()?, "listen");
    axum::serve(listener, router(engine))
        .with_graceful_shutdown(shutdown)
        .await
        .context("HTTP server error")
}

/// Remove a socket left behind by a previous run. Anything else at `path`
/// is kept, so the bind fails on it.
fn remove_stale_socket(path: &Path) -> Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_socket() => {
            info!(path = %path.display(), "removing stale socket");
            std::fs::remove_file(path)
                .with_context(|| format!("Failed to remove stale socket {}", path.display()))
        }
        _ => Ok(()),
    }
}

/// Bind the configured listener and serve until `shutdown` resolves.
pub async fn serve<F>(engine: Arc<GatewayEngine>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listen = engine.config().listen.clone();
    match engine.config().protocol {
        Protocol::Tcp => {
            let listener = TcpListener::bind(&listen)
                .await
                .with_context(|| format!("Failed to listen on {listen}"))?;
            serve_tcp(listener, engine, shutdown).await
        }
        Protocol::Unix => {
            remove_stale_socket(Path::new(&listen))?;
            let listener = UnixListener::bind(&listen)
                .with_context(|| format!("Failed to listen on {listen}"))?;
            serve_unix(listener, engine, shutdown).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::time::{Duration, Instant};

    use http::HeaderValue;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use crate::backend::ProcessBackend;
    use crate::config::GatewayConfig;

    fn install_script(dir: &Path, name: &str, body: &str) {
        let script = dir.join(name);
        std::fs::write(&script, body).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn process_engine(dir: &Path) -> Arc<GatewayEngine> {
        let config = Arc::new(GatewayConfig {
            base_dir: dir.to_path_buf(),
            timeout: Some(Duration::from_secs(10)),
            ..GatewayConfig::default()
        });
        let backend = Arc::new(ProcessBackend::new(config.clone()));
        Arc::new(GatewayEngine::new(config, backend))
    }

    #[tokio::test]
    async fn channel_sink_delivers_head_then_body() {
        let (mut sink, head_rx, mut body_rx) = ChannelSink::new(4);
        assert!(!sink.is_committed());

        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("text/plain"));
        sink.send_head(StatusCode::CREATED, headers).await.unwrap();
        sink.send_body(Bytes::from_static(b"abc")).await.unwrap();
        assert_eq!(sink.status(), Some(StatusCode::CREATED));

        let (status, headers) = head_rx.await.unwrap();
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(headers["content-type"], "text/plain");
        assert_eq!(body_rx.recv().await.unwrap(), "abc");

        drop(sink);
        assert!(body_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn channel_sink_head_only_once() {
        let (mut sink, _head_rx, _body_rx) = ChannelSink::new(1);
        sink.send_head(StatusCode::OK, HeaderMap::new()).await.unwrap();
        assert!(sink.send_head(StatusCode::OK, HeaderMap::new()).await.is_err());
    }

    #[tokio::test]
    async fn channel_sink_reports_gone_client() {
        let (mut sink, head_rx, body_rx) = ChannelSink::new(1);
        drop(head_rx);
        drop(body_rx);
        let err = sink.send_head(StatusCode::OK, HeaderMap::new()).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        let err = sink.send_body(Bytes::from_static(b"x")).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn basic_auth_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(basic_auth(&headers), None);

        // alice:open:sesame
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic YWxpY2U6b3BlbjpzZXNhbWU="));
        assert_eq!(
            basic_auth(&headers),
            Some(("alice".to_string(), "open:sesame".to_string()))
        );

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        assert_eq!(basic_auth(&headers), None);

        headers.insert(AUTHORIZATION, HeaderValue::from_static("basic !!!"));
        assert_eq!(basic_auth(&headers), None);
    }

    #[test]
    fn content_length_variants() {
        let mut headers = HeaderMap::new();
        assert_eq!(content_length(&headers), 0);

        headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        assert_eq!(content_length(&headers), -1);

        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("42"));
        assert_eq!(content_length(&headers), 42);
    }

    async fn raw_request(addr: SocketAddr, request: &str) -> String {
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        String::from_utf8_lossy(&response).into_owned()
    }

    #[tokio::test]
    async fn serves_process_units_over_http() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("hello.cgi");
        std::fs::write(
            &script,
            "#!/bin/sh\nprintf 'Status: 201\\nContent-Type: text/plain\\n\\n'\n\
             echo \"$REQUEST_METHOD $PATH_INFO $QUERY_STRING $REMOTE_ADDR\"\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let config = Arc::new(GatewayConfig {
            base_dir: dir.path().to_path_buf(),
            timeout: Some(Duration::from_secs(10)),
            ..GatewayConfig::default()
        });
        let backend = Arc::new(ProcessBackend::new(config.clone()));
        let engine = Arc::new(GatewayEngine::new(config, backend));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(serve_tcp(listener, engine, std::future::pending()));

        let response = raw_request(
            addr,
            "GET /hello.cgi/extra?a=1 HTTP/1.1\r\nHost: test\r\nConnection: close\r\n\r\n",
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 201"), "{response}");
        assert!(response.contains("content-type: text/plain"), "{response}");
        assert!(response.contains("GET /extra a=1 127.0.0.1:"), "{response}");

        let response = raw_request(
            addr,
            "GET /missing HTTP/1.1\r\nHost: test\r\nConnection: close\r\n\r\n",
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 404"), "{response}");
        assert!(response.contains("missing not found"), "{response}");

        server.abort();
    }

    #[test]
    fn path_decoding() {
        assert_eq!(decode_path("/my%20script.cgi/a%20b").as_deref(), Some("/my script.cgi/a b"));
        assert_eq!(decode_path("/%2e%2e/x").as_deref(), Some("/../x"));
        assert_eq!(decode_path("/a+b").as_deref(), Some("/a+b"));
        assert_eq!(decode_path("/%ff"), None);
    }

    #[tokio::test]
    async fn serves_units_with_encoded_names() {
        let dir = tempfile::tempdir().unwrap();
        install_script(
            dir.path(),
            "my script.cgi",
            "#!/bin/sh\nprintf 'Content-Type: text/plain\\n\\n'\n\
             echo \"[$SCRIPT_NAME] [$PATH_INFO]\"\n",
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(serve_tcp(
            listener,
            process_engine(dir.path()),
            std::future::pending(),
        ));

        let response = raw_request(
            addr,
            "GET /my%20script.cgi/a%20b HTTP/1.1\r\nHost: test\r\nConnection: close\r\n\r\n",
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 200"), "{response}");
        assert!(response.contains("[my script.cgi] [/a b]"), "{response}");

        let response = raw_request(
            addr,
            "GET /%2e%2e/my%20script.cgi HTTP/1.1\r\nHost: test\r\nConnection: close\r\n\r\n",
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 404"), "{response}");

        let response = raw_request(
            addr,
            "GET /%ff HTTP/1.1\r\nHost: test\r\nConnection: close\r\n\r\n",
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 400"), "{response}");

        server.abort();
    }

    #[tokio::test]
    async fn head_is_sent_while_unit_still_runs() {
        let dir = tempfile::tempdir().unwrap();
        install_script(
            dir.path(),
            "slow.cgi",
            "#!/bin/sh\nprintf 'Content-Type: application/octet-stream\\n\\n'\n\
             /bin/sleep 1\n\
             exec /bin/dd if=/dev/zero bs=1000 count=1500 2>/dev/null\n",
        );
        let engine = process_engine(dir.path());
        let (sink, head_rx, mut body_rx) = ChannelSink::new(BODY_CHANNEL_DEPTH);
        let req = InvocationRequest {
            method: http::Method::GET,
            path: "/slow.cgi".into(),
            raw_query: String::new(),
            headers: HeaderMap::new(),
            remote_addr: String::new(),
            protocol: "HTTP/1.1".into(),
            basic_auth: None,
            content_length: 0,
            body: Box::new(tokio::io::empty()),
        };

        let started = Instant::now();
        let handled = tokio::spawn(async move {
            engine.handle(req, sink, &RequestContext::default()).await
        });

        let (status, headers) = head_rx.await.unwrap();
        let head_at = started.elapsed();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers["content-type"], "application/octet-stream");
        assert!(head_at < Duration::from_millis(800), "head after {head_at:?}");

        // larger than every buffer between the unit and the client
        let mut received = 0;
        while let Some(chunk) = body_rx.recv().await {
            received += chunk.len();
        }
        assert_eq!(received, 1_500_000);
        assert!(started.elapsed() >= Duration::from_secs(1));
        assert_eq!(handled.await.unwrap(), StatusCode::OK);
    }

    #[test]
    fn only_stale_sockets_are_removed() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("typo.txt");
        std::fs::write(&file, b"keep").unwrap();
        remove_stale_socket(&file).unwrap();
        assert!(file.exists());

        let socket = dir.path().join("gateway.sock");
        drop(std::os::unix::net::UnixListener::bind(&socket).unwrap());
        assert!(socket.exists());
        remove_stale_socket(&socket).unwrap();
        assert!(!socket.exists());

        remove_stale_socket(&dir.path().join("missing")).unwrap();
    }

    #[tokio::test]
    async fn unix_listen_on_regular_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("not-a-socket");
        std::fs::write(&file, b"keep").unwrap();
        let config = Arc::new(GatewayConfig {
            listen: file.to_string_lossy().into_owned(),
            protocol: Protocol::Unix,
            base_dir: dir.path().to_path_buf(),
            ..GatewayConfig::default()
        });
        let backend = Arc::new(ProcessBackend::new(config.clone()));
        let engine = Arc::new(GatewayEngine::new(config, backend));

        assert!(serve(engine, std::future::pending()).await.is_err());
        assert_eq!(std::fs::read(&file).unwrap(), b"keep");
    }
}
