//! Per-request execution context handed to every backend call.

use std::collections::BTreeMap;

use http::HeaderMap;
use tokio_util::sync::CancellationToken;

/// W3C trace-context headers forwarded to units.
const PROPAGATED_HEADERS: [&str; 2] = ["traceparent", "tracestate"];

/// Cancellation signal plus an opaque trace propagation carrier.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// Cancelled when the client goes away or the server shuts down.
    pub cancel: CancellationToken,

    /// Key/value pairs to expose to the unit as `HTTP_<KEY>`. `None` when no
    /// trace context is active for this request.
    pub carrier: Option<BTreeMap<String, String>>,
}

impl RequestContext {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            carrier: None,
        }
    }

    /// Attach the request's trace context, if it carries a well-formed
    /// `traceparent`.
    #[must_use]
    pub fn with_trace_from(mut self, headers: &HeaderMap) -> Self {
        let mut carrier = BTreeMap::new();
        for name in PROPAGATED_HEADERS {
            if let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) {
                carrier.insert(name.to_string(), value.trim().to_string());
            }
        }
        if carrier.get("traceparent").is_some_and(|tp| is_traceparent(tp)) {
            self.carrier = Some(carrier);
        }
        self
    }
}

/// `version-traceid-parentid-flags`, lowercase hex, 2-32-16-2 digits.
fn is_traceparent(value: &str) -> bool {
    let parts: Vec<&str> = value.split('-').collect();
    let lens = [2, 32, 16, 2];
    parts.len() == lens.len()
        && parts.iter().zip(lens).all(|(part, len)| {
            part.len() == len && part.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    const TP: &str = "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01";

    #[test]
    fn carrier_absent_without_traceparent() {
        let ctx = RequestContext::default().with_trace_from(&HeaderMap::new());
        assert!(ctx.carrier.is_none());
    }

    #[test]
    fn carrier_collects_trace_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("traceparent", TP.parse().unwrap());
        headers.insert("tracestate", "congo=t61rcWkgMzE".parse().unwrap());

        let ctx = RequestContext::default().with_trace_from(&headers);
        let carrier = ctx.carrier.expect("carrier");
        assert_eq!(carrier["traceparent"], TP);
        assert_eq!(carrier["tracestate"], "congo=t61rcWkgMzE");
    }

    #[test]
    fn malformed_traceparent_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert("traceparent", "00-nothex-01".parse().unwrap());
        let ctx = RequestContext::default().with_trace_from(&headers);
        assert!(ctx.carrier.is_none());
    }
}
