use std::sync::Arc;

use salvo_core::{Depot, Request, Response, Router, handler};

use crate::error::{ProtocolError, RufhError};
use crate::handlers::{UploadFields, deliver_or_status, pump, write_interop};
use crate::record::AppendParams;
use crate::{H_UPLOAD_OFFSET, Rufh};

/// Append: continue an existing upload from exactly the committed offset.
/// Admission is all-or-nothing; a request that fails any precondition
/// leaves the record untouched.
#[handler]
async fn append(req: &mut Request, depot: &mut Depot, res: &mut Response) {
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

    // The append MUST name the offset the client believes committed.
    let Some(offset) = fields.offset else {
        res.status_code =
            Some(RufhError::from(ProtocolError::MissingHeader(H_UPLOAD_OFFSET)).status());
        return;
    };

    let params = AppendParams {
        offset,
        total_length: fields.length,
        interop_version: fields.interop_version,
    };
    match record.attach(&params) {
        Ok(guard) => {
            let incomplete = fields.incomplete.unwrap_or(false);
            pump(req, res, &state, guard, incomplete, false, None).await;
        }
        Err(err) => {
            tracing::debug!(token = %token.to_segment(), error = %err, "append rejected");
            deliver_or_status(&record, &err, res);
        }
    }
}

pub(crate) fn patch_handler() -> Router {
    Router::with_path("{token}").patch(append)
}
