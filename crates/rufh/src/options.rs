use std::time::Duration;

use salvo_core::Request;

use crate::{H_UPLOAD_DRAFT_INTEROP_VERSION, H_UPLOAD_TOKEN};

/// Policy for a creation request that names a token already on record.
///
/// The draft leaves this to the server; rejecting is the conservative
/// reading and the default.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum CreateConflict {
    /// Answer `409 Conflict` and leave the existing upload untouched.
    #[default]
    Reject,
    /// Terminate the existing upload and start over with the new request.
    Replace,
}

#[derive(Clone, Debug)]
pub struct RufhOptions {
    /// The route to accept requests.
    pub path: String,

    /// High-water mark, in bytes, for chunks buffered between a producing
    /// transaction and the downstream handler. Producers are paused while
    /// the buffer sits at or above this bound.
    pub buffer_size: usize,

    /// How long a record may sit without activity (no producer attached)
    /// before the sweeper evicts it.
    pub idle_timeout: Duration,

    /// How long a producing transaction may go without delivering bytes
    /// before it is aborted back to the idle state.
    pub transfer_timeout: Duration,

    /// Tick interval of the eviction sweeper.
    pub sweep_interval: Duration,

    /// What to do when a creation request reuses a live token.
    pub create_conflict: CreateConflict,
}

impl Default for RufhOptions {
    fn default() -> Self {
        Self {
            path: "/upload-collection".to_owned(),
            buffer_size: 64 * 1024,
            idle_timeout: Duration::from_secs(60),
            transfer_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(1),
            create_conflict: CreateConflict::default(),
        }
    }
}

impl RufhOptions {
    /// Whether a request targets the upload collection and carries resumable
    /// upload semantics.
    pub fn is_upload_resource(&self, req: &Request) -> bool {
        let path = req.uri().path();
        (path == self.path || path.starts_with(&format!("{}/", self.path)))
            && (req.headers().contains_key(H_UPLOAD_TOKEN)
                || req.headers().contains_key(H_UPLOAD_DRAFT_INTEROP_VERSION))
    }
}

pub(crate) fn normalize_path(p: &str) -> String {
    if p.is_empty() {
        return "/".to_owned();
    }
    let mut out = p.to_owned();
    if !out.starts_with('/') {
        out = format!("/{}", out);
    }
    if out.len() > 1 {
        out = out.trim_end_matches('/').to_owned();
    }
    out
}

#[cfg(test)]
mod tests {
    use salvo_core::http::HeaderValue;

    use super::*;

    #[test]
    fn test_defaults() {
        let opts = RufhOptions::default();
        assert_eq!(opts.path, "/upload-collection");
        assert_eq!(opts.buffer_size, 64 * 1024);
        assert_eq!(opts.create_conflict, CreateConflict::Reject);
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path(""), "/");
        assert_eq!(normalize_path("uploads"), "/uploads");
        assert_eq!(normalize_path("/uploads/"), "/uploads");
        assert_eq!(normalize_path("/a/b/"), "/a/b");
    }

    #[test]
    fn test_is_upload_resource() {
        let opts = RufhOptions::default();

        let mut req = Request::default();
        req.set_uri("http://test/upload-collection".parse().unwrap());
        assert!(!opts.is_upload_resource(&req));

        req.headers_mut()
            .insert(H_UPLOAD_TOKEN, HeaderValue::from_static(":aGVsbG8=:"));
        assert!(opts.is_upload_resource(&req));

        let mut req = Request::default();
        req.set_uri("http://test/upload-collection/abc".parse().unwrap());
        req.headers_mut()
            .insert(H_UPLOAD_DRAFT_INTEROP_VERSION, HeaderValue::from_static("3"));
        assert!(opts.is_upload_resource(&req));

        let mut req = Request::default();
        req.set_uri("http://test/other".parse().unwrap());
        req.headers_mut()
            .insert(H_UPLOAD_TOKEN, HeaderValue::from_static(":aGVsbG8=:"));
        assert!(!opts.is_upload_resource(&req));
    }
}
