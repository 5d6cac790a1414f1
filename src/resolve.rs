//! Mapping a request path onto a runnable unit plus trailing path-info.
//!
//! Two namespaces are supported: a directory of files (process and sandbox
//! backends) and a flat list of names such as image tags (container backend).

use std::path::Path;

use tracing::{debug, warn};

use crate::error::GatewayError;

/// A unit located by one of the resolvers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedUnit {
    /// Name of the unit relative to its namespace.
    pub unit: String,
    /// Remainder of the request path; empty or starting with `/`.
    pub path_info: String,
}

impl ResolvedUnit {
    fn new(unit: impl Into<String>, path_info: impl Into<String>) -> Self {
        Self {
            unit: unit.into(),
            path_info: path_info.into(),
        }
    }
}

/// Parent of a slash separated path: `a/b` -> `a`, `a` -> `.`, `/a` -> `/`.
fn parent(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    if trimmed.len() < path.len() {
        return if trimmed.is_empty() { "/" } else { trimmed };
    }
    match trimmed.rfind('/') {
        Some(0) => "/",
        Some(idx) => match trimmed[..idx].trim_end_matches('/') {
            "" => "/",
            dir => dir,
        },
        None => ".",
    }
}

/// Find the longest ancestor of `requested` (itself included) that ends with
/// `suffix` and names a regular file under `base`.
///
/// Only ancestors of the exact request path are considered, never siblings.
/// Paths containing `..` never resolve.
pub async fn resolve_file(
    base: &Path,
    requested: &str,
    suffix: &str,
) -> Result<ResolvedUnit, GatewayError> {
    if requested.split('/').any(|segment| segment == "..") {
        warn!(path = %requested, "Refusing path with parent segment");
        return Err(GatewayError::NotFound(requested.to_string()));
    }

    let mut candidate = requested;
    while !candidate.is_empty() && candidate != "." && candidate != "/" {
        debug!(base = %base.display(), path = %requested, cur = %candidate, "check");
        if candidate.ends_with(suffix) {
            let full = base.join(candidate.trim_start_matches('/'));
            if let Ok(meta) = tokio::fs::metadata(&full).await {
                if meta.is_file() {
                    return Ok(ResolvedUnit::new(candidate, &requested[candidate.len()..]));
                }
            }
        }
        candidate = parent(candidate);
    }

    warn!(base = %base.display(), path = %requested, "not found");
    Err(GatewayError::NotFound(requested.to_string()))
}

/// Match `requested` against a list of names carrying a literal `prefix` and
/// `suffix`.
///
/// An exact match of the stripped middle part wins immediately. Otherwise a
/// name whose middle is a leading directory of `requested` is a candidate;
/// when several qualify the last one seen is used.
pub fn resolve_registry<'a, I>(
    names: I,
    prefix: &str,
    suffix: &str,
    requested: &str,
) -> Result<ResolvedUnit, GatewayError>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut candidate = None;
    for name in names {
        if name.len() < prefix.len() + suffix.len()
            || !name.starts_with(prefix)
            || !name.ends_with(suffix)
        {
            debug!(name, prefix, suffix, "skip");
            continue;
        }
        let middle = &name[prefix.len()..name.len() - suffix.len()];
        if middle == requested {
            return Ok(ResolvedUnit::new(name, ""));
        }
        if requested.len() > middle.len()
            && requested.starts_with(middle)
            && requested.as_bytes()[middle.len()] == b'/'
        {
            debug!(name, middle, "candidate");
            candidate = Some(ResolvedUnit::new(name, &requested[middle.len()..]));
        }
    }
    candidate.ok_or_else(|| GatewayError::NotFound(requested.to_string()))
}
