mod delete;
mod head;
mod patch;
mod post;

pub(crate) use delete::delete_handler;
pub(crate) use head::head_handler;
pub(crate) use patch::patch_handler;
pub(crate) use post::post_handler;

use futures_util::StreamExt;
use salvo_core::http::header::{self, HeaderName};
use salvo_core::http::{HeaderValue, StatusCode};
use salvo_core::{Request, Response};

use crate::error::{ProtocolError, RufhError};
use crate::fields::{self, UploadToken, format_boolean};
use crate::record::{ParkOutcome, ProducerGuard};
use crate::{
    H_UPLOAD_DRAFT_INTEROP_VERSION, H_UPLOAD_INCOMPLETE, H_UPLOAD_LENGTH, H_UPLOAD_OFFSET,
    H_UPLOAD_TOKEN, Rufh,
};

/// The upload fields of one request, parsed up front so a malformed header
/// rejects the request before any record is touched.
#[derive(Debug, Default)]
pub(crate) struct UploadFields {
    pub(crate) token: Option<UploadToken>,
    pub(crate) offset: Option<u64>,
    pub(crate) length: Option<u64>,
    pub(crate) incomplete: Option<bool>,
    pub(crate) interop_version: Option<i64>,
}

impl UploadFields {
    pub(crate) fn from_request(req: &Request) -> Result<Self, ProtocolError> {
        Ok(Self {
            token: header_str(req, H_UPLOAD_TOKEN)?
                .map(|raw| fields::parse_token(raw, H_UPLOAD_TOKEN))
                .transpose()?,
            offset: header_str(req, H_UPLOAD_OFFSET)?
                .map(|raw| fields::parse_non_negative(raw, H_UPLOAD_OFFSET))
                .transpose()?,
            length: header_str(req, H_UPLOAD_LENGTH)?
                .map(|raw| fields::parse_non_negative(raw, H_UPLOAD_LENGTH))
                .transpose()?,
            incomplete: header_str(req, H_UPLOAD_INCOMPLETE)?
                .map(|raw| fields::parse_boolean(raw, H_UPLOAD_INCOMPLETE))
                .transpose()?,
            interop_version: header_str(req, H_UPLOAD_DRAFT_INTEROP_VERSION)?
                .map(|raw| fields::parse_integer(raw, H_UPLOAD_DRAFT_INTEROP_VERSION))
                .transpose()?,
        })
    }

    pub(crate) fn require_token(&mut self) -> Result<UploadToken, ProtocolError> {
        self.token
            .take()
            .ok_or(ProtocolError::MissingHeader(H_UPLOAD_TOKEN))
    }
}

fn header_str<'a>(req: &'a Request, name: &'static str) -> Result<Option<&'a str>, ProtocolError> {
    match req.headers().get(name) {
        Some(value) => value
            .to_str()
            .map(Some)
            .map_err(|_| ProtocolError::Malformed(name)),
        None => Ok(None),
    }
}

pub(crate) fn write_interop(res: &mut Response, version: Option<i64>) {
    if let Some(version) = version {
        res.headers
            .insert(H_UPLOAD_DRAFT_INTEROP_VERSION, HeaderValue::from(version));
    }
}

pub(crate) fn write_offset(res: &mut Response, offset: u64) {
    res.headers.insert(H_UPLOAD_OFFSET, HeaderValue::from(offset));
}

pub(crate) fn write_incomplete(res: &mut Response, incomplete: bool) {
    res.headers.insert(
        H_UPLOAD_INCOMPLETE,
        HeaderValue::from_static(format_boolean(incomplete)),
    );
}

/// Copy a parked downstream response onto the transaction currently asking
/// for it. Headers are appended wholesale; the caller re-stamps the upload
/// fields afterwards.
pub(crate) fn deliver(mut stored: Response, res: &mut Response) {
    res.status_code = stored.status_code.or(Some(StatusCode::OK));
    let headers = std::mem::take(&mut stored.headers);
    let mut last: Option<HeaderName> = None;
    for (name, value) in headers {
        if let Some(name) = name {
            last = Some(name);
        }
        if let Some(name) = &last {
            res.headers.append(name.clone(), value);
        }
    }
    res.body = stored.take_body();
}

/// Deliver a parked response if one exists; otherwise answer with the
/// admission error. The record itself stays behind (the sweeper collects
/// it), so follow-up appends keep seeing a truthful conflict or 410.
pub(crate) fn deliver_or_status(
    record: &crate::record::UploadRecord,
    err: &RufhError,
    res: &mut Response,
) {
    if matches!(err, RufhError::Terminated | RufhError::Concluded) {
        if let Some(stored) = record.take_response() {
            deliver(stored, res);
            return;
        }
    }
    res.status_code = Some(err.status());
    if let RufhError::OffsetMismatch { expected, .. } = err {
        write_offset(res, *expected);
    }
}

/// Stream the producing transaction's body into the record and write the
/// protocol response for it.
///
/// `relay_response` is true only for a creating transaction: when such an
/// upload completes, the downstream handler's own response is awaited and
/// relayed. A completing append is acknowledged with 201 instead; the
/// handler response is parked for whoever asks next.
pub(crate) async fn pump(
    req: &mut Request,
    res: &mut Response,
    state: &Rufh,
    guard: ProducerGuard,
    incomplete: bool,
    relay_response: bool,
    location: Option<String>,
) {
    let record = guard.record().clone();
    let mut guard = guard;
    let mut body = req.take_body();
    loop {
        let frame = match tokio::time::timeout(state.options.transfer_timeout, body.next()).await {
            Ok(frame) => frame,
            Err(_) => {
                tracing::debug!(token = %record.token().to_segment(), "transfer stalled; parking upload");
                drop(guard);
                res.status_code = Some(StatusCode::REQUEST_TIMEOUT);
                return;
            }
        };
        match frame {
            Some(Ok(frame)) => {
                let Ok(data) = frame.into_data() else {
                    continue;
                };
                if let Err(err) = guard.push(data).await {
                    deliver_or_status(&record, &err, res);
                    return;
                }
            }
            Some(Err(e)) => {
                // Transport failure: the record stays resumable at the
                // downstream-acknowledged offset.
                tracing::debug!(
                    token = %record.token().to_segment(),
                    error = ?e,
                    "request body failed; parking upload"
                );
                drop(guard);
                res.status_code = Some(StatusCode::BAD_REQUEST);
                return;
            }
            None => break,
        }
    }

    if incomplete {
        match guard.park(state.options.transfer_timeout).await {
            ParkOutcome::Parked { offset } => {
                res.status_code = Some(StatusCode::CREATED);
                if let Some(location) = location {
                    if let Ok(value) = HeaderValue::from_str(&location) {
                        res.headers.insert(header::LOCATION, value);
                    }
                }
                write_offset(res, offset);
                write_incomplete(res, true);
            }
            ParkOutcome::Completed { offset } => {
                concluded(&record, res, relay_response, location, offset).await;
            }
            ParkOutcome::Terminated => {
                deliver_or_status(&record, &RufhError::Terminated, res);
            }
        }
    } else {
        // A completing close must land exactly on the declared length; a
        // short body parks the upload at the drained count instead.
        if let Some(err) = guard.unmet_length() {
            drop(guard);
            res.status_code = Some(err.status());
            return;
        }
        guard.complete();
        let offset = record.await_drained(state.options.transfer_timeout).await;
        concluded(&record, res, relay_response, location, offset).await;
    }
}

async fn concluded(
    record: &crate::record::UploadRecord,
    res: &mut Response,
    relay_response: bool,
    location: Option<String>,
    offset: u64,
) {
    if relay_response {
        match record.await_response().await {
            Some(stored) => {
                deliver(stored, res);
            }
            None => {
                res.status_code = Some(StatusCode::GONE);
            }
        }
        if let Some(location) = location {
            if let Ok(value) = HeaderValue::from_str(&location) {
                res.headers.insert(header::LOCATION, value);
            }
        }
    } else if record.status().terminated {
        deliver_or_status(record, &RufhError::Terminated, res);
    } else {
        res.status_code = Some(StatusCode::CREATED);
        write_offset(res, offset);
        write_incomplete(res, false);
    }
}
