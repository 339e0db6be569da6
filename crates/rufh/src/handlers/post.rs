use std::sync::Arc;

use salvo_core::{Depot, FlowCtrl, Request, Response, Router, handler};

use crate::error::RufhError;
use crate::handlers::{UploadFields, pump, write_interop};
use crate::record::CreateParams;
use crate::{H_UPLOAD_DRAFT_INTEROP_VERSION, H_UPLOAD_TOKEN, Rufh, relay};

/// Creation: open a record for an unknown token, hand the synthesized
/// request to the application handler, and stream the first (possibly only)
/// chunk of body. A request carrying the interop-version field negotiates
/// that draft revision for the upload's whole life.
#[handler]
async fn create(req: &mut Request, depot: &mut Depot, res: &mut Response, ctrl: &mut FlowCtrl) {
    let state = depot
        .obtain::<Arc<Rufh>>()
        .expect("missing rufh state")
        .clone();

    // No upload fields at all: the middleware is transparent and the
    // request goes straight to the application handler.
    if req.headers().get(H_UPLOAD_TOKEN).is_none()
        && req.headers().get(H_UPLOAD_DRAFT_INTEROP_VERSION).is_none()
    {
        state.goal.handle(req, depot, res, ctrl).await;
        return;
    }

    let mut fields = match UploadFields::from_request(req) {
        Ok(fields) => fields,
        Err(e) => {
            res.status_code = Some(RufhError::from(e).status());
            return;
        }
    };
    write_interop(res, fields.interop_version);

    let token = match fields.require_token() {
        Ok(token) => token,
        Err(e) => {
            res.status_code = Some(RufhError::from(e).status());
            return;
        }
    };

    let params = CreateParams {
        total_length: fields.length,
        interop_version: fields.interop_version,
    };
    let (record, guard) =
        match state
            .registry
            .create_attached(token.clone(), params, &state.options)
        {
            Ok(pair) => pair,
            Err(e) => {
                res.status_code = Some(e.status());
                return;
            }
        };
    tracing::debug!(token = %token.to_segment(), "upload created");

    // One downstream request per upload, alive until the handler returns.
    let forwarded = relay::synthesize(req, &record);
    relay::dispatch(state.goal.clone(), forwarded, record.clone());
    state.registry.ensure_sweeper(&state.options);

    let location = format!("{}/{}", state.options.path, token.to_segment());
    let incomplete = fields.incomplete.unwrap_or(false);
    pump(req, res, &state, guard, incomplete, true, Some(location)).await;
}

pub(crate) fn post_handler() -> Router {
    Router::new().post(create)
}
