//! Turning a unit's raw output into an HTTP response.
//!
//! The output starts with a CGI header block terminated by an empty line;
//! everything after it is the body and is forwarded as-is.

use std::io;

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, StatusCode};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tracing::{debug, info, warn};

use crate::error::GatewayError;

/// Where a translated response goes.
///
/// The head is sent at most once, before any body chunk.
#[async_trait]
pub trait ResponseSink: Send {
    /// Commit the status line and headers.
    async fn send_head(&mut self, status: StatusCode, headers: HeaderMap) -> io::Result<()>;

    /// Append a chunk to the response body.
    async fn send_body(&mut self, chunk: Bytes) -> io::Result<()>;

    /// Status sent with the head, once committed.
    fn status(&self) -> Option<StatusCode>;

    /// Whether the head has been sent.
    fn is_committed(&self) -> bool {
        self.status().is_some()
    }
}

/// Longest header line accepted, terminator included.
const MAX_HEADER_LINE: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    ReadingHeaders,
    WritingBody,
}

/// Leading decimal integer of a `Status` value, e.g. `404 Not Found` -> 404.
fn parse_status(value: &str) -> Option<StatusCode> {
    let end = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let code: u16 = value[..end].parse().ok()?;
    StatusCode::from_u16(code).ok()
}

fn strip_eol(line: &mut Vec<u8>) {
    if line.last() == Some(&b'\n') {
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
    }
}

/// Parse the CGI header block from `output` and stream the rest into `sink`.
///
/// Nothing reaches the sink unless the header block is complete and valid.
/// Returns the number of body bytes forwarded.
pub async fn translate<R, S>(output: R, sink: &mut S) -> Result<u64, GatewayError>
where
    R: AsyncRead + Unpin + Send,
    S: ResponseSink + ?Sized,
{
    let mut reader = BufReader::new(output);
    let mut status = StatusCode::OK;
    let mut headers = HeaderMap::new();
    let mut line = Vec::new();
    let mut state = State::ReadingHeaders;

    while state == State::ReadingHeaders {
        line.clear();
        let read = (&mut reader)
            .take(MAX_HEADER_LINE as u64)
            .read_until(b'\n', &mut line)
            .await?;
        if read == 0 {
            warn!("output ended inside header block");
            return Err(GatewayError::HeaderEof);
        }
        if read == MAX_HEADER_LINE && line.last() != Some(&b'\n') {
            warn!(limit = MAX_HEADER_LINE, "header line too long");
            let head = String::from_utf8_lossy(&line[..64]);
            return Err(GatewayError::InvalidHeader(format!("{head}...")));
        }
        strip_eol(&mut line);
        if line.is_empty() {
            debug!("header finished");
            state = State::WritingBody;
            continue;
        }

        let text = String::from_utf8_lossy(&line);
        let Some((key, value)) = text.split_once(':') else {
            warn!(line = %text, "header format error");
            return Err(GatewayError::InvalidHeader(text.into_owned()));
        };
        let (key, value) = (key.trim(), value.trim());

        if key.eq_ignore_ascii_case("status") {
            match parse_status(value) {
                Some(code) => {
                    info!(status = code.as_u16(), "status code update");
                    status = code;
                }
                None => warn!(line = %text, "status code error"),
            }
            continue;
        }

        match (
            HeaderName::from_bytes(key.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                debug!(key = %name, val = ?value, "add-header");
                headers.append(name, value);
            }
            _ => warn!(line = %text, "skipping unrepresentable header"),
        }
    }

    sink.send_head(status, headers).await?;

    let mut written = 0u64;
    loop {
        let buf = reader.fill_buf().await?;
        if buf.is_empty() {
            break;
        }
        let chunk = Bytes::copy_from_slice(buf);
        let len = chunk.len();
        reader.consume(len);
        sink.send_body(chunk).await?;
        written += len as u64;
    }
    debug!(length = written, "write body");
    Ok(written)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Sink that keeps everything in memory.
    #[derive(Debug, Default)]
    pub struct RecordingSink {
        pub status: Option<StatusCode>,
        pub headers: HeaderMap,
        pub body: Vec<u8>,
    }

    impl RecordingSink {
        pub fn body_str(&self) -> &str {
            std::str::from_utf8(&self.body).unwrap()
        }
    }

    #[async_trait]
    impl ResponseSink for RecordingSink {
        async fn send_head(&mut self, status: StatusCode, headers: HeaderMap) -> io::Result<()> {
            assert!(self.status.is_none(), "head sent twice");
            self.status = Some(status);
            self.headers = headers;
            Ok(())
        }

        async fn send_body(&mut self, chunk: Bytes) -> io::Result<()> {
            assert!(self.status.is_some(), "body before head");
            self.body.extend_from_slice(&chunk);
            Ok(())
        }

        fn status(&self) -> Option<StatusCode> {
            self.status
        }
    }
}
