use std::sync::Arc;

use salvo_core::http::StatusCode;
use salvo_core::{Depot, Request, Response, Router, handler};

use crate::Rufh;
use crate::error::RufhError;
use crate::handlers::{UploadFields, write_interop};

/// Cancel: terminate the record, abort the downstream handler, and fail the
/// attached producer, if any, at its next admission attempt. The record
/// stays behind as a tombstone so later appends see 410 until the sweeper
/// collects it.
#[handler]
async fn cancel(req: &mut Request, depot: &mut Depot, res: &mut Response) {
    let state = depot
        .obtain::<Arc<Rufh>>()
        .expect("missing rufh state")
        .clone();

    let mut fields = match UploadFields::from_request(req) {
        Ok(fields) => fields,
        Err(e) => {
            res.status_code = Some(RufhError::from(e).status());
            return;
        }
    };
    let token = match fields.require_token() {
        Ok(token) => token,
        Err(e) => {
            res.status_code = Some(RufhError::from(e).status());
            return;
        }
    };

    let Some(record) = state.registry.find(&token) else {
        res.status_code = Some(RufhError::NotFound.status());
        return;
    };
    write_interop(res, record.interop_version());

    tracing::debug!(token = %token.to_segment(), "upload cancelled");
    record.terminate();
    res.status_code = Some(StatusCode::NO_CONTENT);
}

pub(crate) fn delete_handler() -> Router {
    Router::with_path("{token}").delete(cancel)
}
