//! The downstream side of an upload.
//!
//! One logical request is synthesized from the creating transaction and
//! driven through the wrapped application handler in its own task, so the
//! handler's lifetime is decoupled from any single HTTP transaction. Its
//! body is a [`RelayBody`] that pulls chunks out of the record buffer; the
//! read future survives producer churn and simply sees more bytes whenever
//! the next append is admitted.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use salvo_core::http::body::{Body, Frame};
use salvo_core::http::{HeaderValue, ReqBody, header};
use salvo_core::{BoxedError, Depot, FlowCtrl, Handler, Request, Response};

use crate::is_upload_field;
use crate::record::UploadRecord;

/// Streaming body of the synthesized request. Reaching EOF means the upload
/// completed; an error means it was terminated.
pub(crate) struct RelayBody {
    record: Arc<UploadRecord>,
}

impl RelayBody {
    pub(crate) fn new(record: Arc<UploadRecord>) -> Self {
        Self { record }
    }
}

impl Body for RelayBody {
    type Data = Bytes;
    type Error = BoxedError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        match self.record.poll_pull(cx) {
            Poll::Ready(Some(Ok(chunk))) => Poll::Ready(Some(Ok(Frame::data(chunk)))),
            Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(e.into()))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Build the one request the application handler observes: the creation
/// transaction's method, uri and headers, minus the upload fields, with the
/// body rebound to the record buffer. `Content-Length` is forwarded only
/// when the client declared the total size up front.
pub(crate) fn synthesize(req: &Request, record: &Arc<UploadRecord>) -> Request {
    let mut forwarded = Request::default();
    *forwarded.method_mut() = req.method().clone();
    forwarded.set_uri(req.uri().clone());
    *forwarded.version_mut() = req.version();
    for (name, value) in req.headers() {
        if is_upload_field(name) || *name == header::CONTENT_LENGTH {
            continue;
        }
        forwarded.headers_mut().append(name.clone(), value.clone());
    }
    if let Some(total) = record.status().total_length {
        forwarded
            .headers_mut()
            .insert(header::CONTENT_LENGTH, HeaderValue::from(total));
    }
    forwarded.replace_body(ReqBody::Boxed {
        inner: Box::pin(RelayBody::new(record.clone())),
        fusewire: None,
    });
    forwarded
}

/// Run the application handler to completion in its own task and park its
/// response on the record.
pub(crate) fn dispatch(goal: Arc<dyn Handler>, request: Request, record: Arc<UploadRecord>) {
    tokio::spawn(async move {
        let mut req = request;
        let mut depot = Depot::new();
        let mut res = Response::new();
        let mut ctrl = FlowCtrl::new(vec![]);
        goal.handle(&mut req, &mut depot, &mut res, &mut ctrl).await;
        tracing::debug!(
            token = %record.token().to_segment(),
            status = ?res.status_code,
            "downstream handler returned"
        );
        record.downstream_finished(res);
    });
}

#[cfg(test)]
mod tests {
    use futures_util::future::poll_fn;
    use salvo_core::async_trait;
    use salvo_core::http::{Method, StatusCode};

    use super::*;
    use crate::fields::UploadToken;
    use crate::record::CreateParams;
    use crate::{H_UPLOAD_INCOMPLETE, H_UPLOAD_TOKEN};

    fn new_record(params: CreateParams) -> (Arc<UploadRecord>, crate::record::ProducerGuard) {
        UploadRecord::new_attached(UploadToken::new(b"t".to_vec()), params, 64)
    }

    async fn next_data(body: &mut RelayBody) -> Option<Result<Bytes, BoxedError>> {
        poll_fn(|cx| Pin::new(&mut *body).poll_frame(cx))
            .await
            .map(|r| r.map(|frame| frame.into_data().unwrap_or_default()))
    }

    #[tokio::test]
    async fn test_relay_body_streams_across_producers() {
        let (record, mut guard) = new_record(CreateParams::default());
        let mut body = RelayBody::new(record.clone());

        guard.push(Bytes::from_static(b"ab")).await.unwrap();
        assert_eq!(&next_data(&mut body).await.unwrap().unwrap()[..], b"ab");
        drop(guard);

        let mut guard = record
            .attach(&crate::record::AppendParams {
                offset: 2,
                total_length: None,
                interop_version: None,
            })
            .unwrap();
        guard.push(Bytes::from_static(b"cd")).await.unwrap();
        assert_eq!(&next_data(&mut body).await.unwrap().unwrap()[..], b"cd");
        guard.complete();
        assert!(next_data(&mut body).await.is_none());
    }

    #[tokio::test]
    async fn test_relay_body_errors_after_terminate() {
        let (record, _guard) = new_record(CreateParams::default());
        let mut body = RelayBody::new(record.clone());
        record.terminate();
        assert!(next_data(&mut body).await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_synthesize_strips_upload_fields() {
        let (record, _guard) = new_record(CreateParams {
            total_length: Some(10),
            interop_version: Some(3),
        });

        let mut req = Request::default();
        *req.method_mut() = Method::POST;
        req.set_uri("http://test/upload-collection".parse().unwrap());
        req.headers_mut()
            .insert(H_UPLOAD_TOKEN, HeaderValue::from_static(":dA==:"));
        req.headers_mut()
            .insert(H_UPLOAD_INCOMPLETE, HeaderValue::from_static("?1"));
        req.headers_mut()
            .insert(header::CONTENT_LENGTH, HeaderValue::from_static("5"));
        req.headers_mut()
            .insert("x-custom", HeaderValue::from_static("kept"));

        let forwarded = synthesize(&req, &record);
        assert_eq!(forwarded.method(), &Method::POST);
        assert!(forwarded.headers().get(H_UPLOAD_TOKEN).is_none());
        assert!(forwarded.headers().get(H_UPLOAD_INCOMPLETE).is_none());
        assert_eq!(
            forwarded.headers().get("x-custom").unwrap(),
            &HeaderValue::from_static("kept")
        );
        // The declared total, not the first transaction's body length.
        assert_eq!(
            forwarded.headers().get(header::CONTENT_LENGTH).unwrap(),
            &HeaderValue::from_static("10")
        );
    }

    struct Uppercase;

    #[async_trait]
    impl Handler for Uppercase {
        async fn handle(
            &self,
            req: &mut Request,
            _depot: &mut Depot,
            res: &mut Response,
            _ctrl: &mut FlowCtrl,
        ) {
            use futures_util::StreamExt;
            let mut body = req.take_body();
            let mut data = Vec::new();
            while let Some(Ok(frame)) = body.next().await {
                if let Ok(bytes) = frame.into_data() {
                    data.extend_from_slice(&bytes);
                }
            }
            res.status_code(StatusCode::OK);
            res.render(String::from_utf8_lossy(&data).to_uppercase());
        }
    }

    #[tokio::test]
    async fn test_dispatch_parks_handler_response() {
        let (record, mut guard) = new_record(CreateParams::default());
        let req = synthesize(&Request::default(), &record);
        dispatch(Arc::new(Uppercase), req, record.clone());

        guard.push(Bytes::from_static(b"hi")).await.unwrap();
        guard.complete();

        let response = record.await_response().await.unwrap();
        assert_eq!(response.status_code, Some(StatusCode::OK));
    }
}
