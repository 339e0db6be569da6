use std::sync::Arc;

use salvo_core::http::{HeaderValue, ResBody, StatusCode, header};
use salvo_core::{Depot, Request, Response, Router, handler};

use crate::error::RufhError;
use crate::handlers::{UploadFields, deliver, write_incomplete, write_interop, write_offset};
use crate::{H_UPLOAD_LENGTH, Rufh};

/// Offset retrieval: report the committed offset without ever touching the
/// producer slot. When the downstream handler has already spoken and nobody
/// collected its response, this is where it gets delivered (status and
/// headers only; a HEAD response has no body).
#[handler]
async fn offset(req: &mut Request, depot: &mut Depot, res: &mut Response) {
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
    let status = record.status();
    write_interop(res, status.interop_version);
    res.headers
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    if let Some(stored) = record.take_response() {
        deliver(stored, res);
        res.body = ResBody::None;
        write_offset(res, status.offset);
        return;
    }

    if status.terminated {
        res.status_code = Some(RufhError::Terminated.status());
        return;
    }

    res.status_code = Some(StatusCode::NO_CONTENT);
    write_offset(res, status.offset);
    write_incomplete(res, !status.complete);
    if let Some(total) = status.total_length {
        res.headers.insert(H_UPLOAD_LENGTH, HeaderValue::from(total));
    }
}

pub(crate) fn head_handler() -> Router {
    Router::with_path("{token}").head(offset)
}
