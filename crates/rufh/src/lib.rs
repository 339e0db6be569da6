//! Resumable upload (draft-ietf-httpbis-resumable-upload) support for the
//! Salvo web framework.
//!
//! The middleware intercepts uploads that advertise resumable semantics and
//! replays them to an application handler as one logical request with one
//! contiguous body, even when the client delivered that body as a sequence
//! of separate transactions spanning connection losses.
//!
//! # Features
//!
//! - Resumable uploads - interrupted transfers continue from the committed offset
//! - Single downstream request - the wrapped handler never sees the seams
//! - Offset retrieval and cancellation per the draft
//! - Transparent passthrough for requests without upload fields
//! - Configurable buffering, timeouts and token-reuse policy
//!
//! # Example
//!
//! ```ignore
//! use salvo_core::prelude::*;
//! use salvo_rufh::Rufh;
//!
//! #[handler]
//! async fn receive(req: &mut Request, res: &mut Response) {
//!     // Sees exactly one request whose body is the whole upload.
//!     let data = req.payload().await.unwrap();
//!     res.render(format!("stored {} bytes", data.len()));
//! }
//!
//! let rufh = Rufh::new(receive).path("/upload-collection");
//!
//! let router = Router::new().push(rufh.into_router());
//!
//! let acceptor = TcpListener::new("0.0.0.0:8080").bind().await;
//! Server::new(acceptor).serve(router).await;
//! ```
//!
//! # Protocol Endpoints
//!
//! The router created by `into_router()` handles:
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | POST | `/upload-collection` | Creates an upload (with or without interop negotiation) |
//! | PATCH | `/upload-collection/{token}` | Appends from the committed offset |
//! | HEAD | `/upload-collection/{token}` | Reports the committed offset |
//! | DELETE | `/upload-collection/{token}` | Cancels the upload |
//!
//! The upload identity is always the `Upload-Token` header; the `{token}`
//! path segment is the resource name issued through `Location` and is not
//! consulted for lookup.
//!
//! # Offsets
//!
//! The `Upload-Offset` a client is told is the count of bytes the
//! application handler has actually consumed, never what the transport
//! happened to deliver. A transaction that dies mid-body leaves the upload
//! resumable at exactly that committed count.

use std::sync::Arc;
use std::time::Duration;

use salvo_core::http::header::HeaderName;
use salvo_core::{Depot, FlowCtrl, Handler, Request, Response, Router, handler};

mod handlers;
mod record;
mod registry;
mod relay;

pub mod error;
pub mod fields;
pub mod options;

pub use error::{ProtocolError, RufhError, RufhResult};
pub use fields::UploadToken;
pub use options::{CreateConflict, RufhOptions};

use crate::options::normalize_path;
use crate::registry::UploadRegistry;

pub const H_UPLOAD_TOKEN: &str = "upload-token";
pub const H_UPLOAD_OFFSET: &str = "upload-offset";
pub const H_UPLOAD_LENGTH: &str = "upload-length";
pub const H_UPLOAD_INCOMPLETE: &str = "upload-incomplete";
pub const H_UPLOAD_DRAFT_INTEROP_VERSION: &str = "upload-draft-interop-version";

pub(crate) fn is_upload_field(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        H_UPLOAD_TOKEN
            | H_UPLOAD_OFFSET
            | H_UPLOAD_LENGTH
            | H_UPLOAD_INCOMPLETE
            | H_UPLOAD_DRAFT_INTEROP_VERSION
    )
}

#[derive(Clone)]
struct RufhStateHoop {
    state: Arc<Rufh>,
}

#[handler]
impl RufhStateHoop {
    async fn handle(&self, depot: &mut Depot) {
        depot.inject(self.state.clone());
    }
}

/// Catch-all for method/path combinations outside the protocol flows: the
/// middleware is transparent for those.
#[derive(Clone)]
struct PassThrough {
    state: Arc<Rufh>,
}

#[handler]
impl PassThrough {
    async fn handle(
        &self,
        req: &mut Request,
        depot: &mut Depot,
        res: &mut Response,
        ctrl: &mut FlowCtrl,
    ) {
        self.state.goal.handle(req, depot, res, ctrl).await;
    }
}

/// The resumable-upload service: protocol state plus the application
/// handler every upload is replayed into.
pub struct Rufh {
    pub(crate) options: RufhOptions,
    pub(crate) goal: Arc<dyn Handler>,
    pub(crate) registry: Arc<UploadRegistry>,
}

impl std::fmt::Debug for Rufh {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rufh")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

// Service configuration
impl Rufh {
    /// Wrap an application handler. The handler observes one request per
    /// upload, with a streaming body that is the concatenation of all
    /// appends in admission order.
    pub fn new(goal: impl Handler) -> Self {
        Self {
            options: RufhOptions::default(),
            goal: Arc::new(goal),
            registry: Arc::new(UploadRegistry::default()),
        }
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.options.path = normalize_path(&path.into());
        self
    }

    /// High-water mark for bytes buffered between a producing transaction
    /// and the downstream handler.
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.options.buffer_size = size;
        self
    }

    /// How long an upload may sit without an attached producer before it is
    /// evicted.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.options.idle_timeout = timeout;
        self
    }

    /// How long a producing transaction may stall before it is aborted back
    /// to the idle state.
    pub fn transfer_timeout(mut self, timeout: Duration) -> Self {
        self.options.transfer_timeout = timeout;
        self
    }

    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.options.sweep_interval = interval;
        self
    }

    /// What to do when a creation request names a token already on record.
    pub fn create_conflict(mut self, policy: CreateConflict) -> Self {
        self.options.create_conflict = policy;
        self
    }

    pub fn options(&self) -> &RufhOptions {
        &self.options
    }

    pub fn into_router(mut self) -> Router {
        self.options.path = normalize_path(&self.options.path);
        let base_path = self.options.path.clone();
        let state = Arc::new(self);

        Router::with_path(base_path)
            .hoop(RufhStateHoop {
                state: state.clone(),
            })
            .push(handlers::post_handler())
            .push(handlers::patch_handler())
            .push(handlers::head_handler())
            .push(handlers::delete_handler())
            .push(Router::with_path("{**rest}").goal(PassThrough { state }))
    }
}
