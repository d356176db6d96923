//! Per-RPC proxy plumbing.
//!
//! The handler never knows which method or message types it relays. For each
//! request it picks a healthy worker, checks a client connection out of the
//! worker's pool, opens a downstream stream for the same full method name,
//! and runs two forwarders: upstream request frames down, downstream
//! response frames up. Response headers are withheld until the first
//! downstream frame arrives, and the worker's trailers are copied to the
//! client verbatim.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use http::{Request, Response};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::Incoming;
use relay_balance::Balancer;
use relay_worker::PulledConn;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tonic::client::Grpc;
use tonic::codec::Streaming;
use tonic::metadata::MetadataMap;
use tonic::{Extensions, Status};
use tracing::{debug, info, warn};

use crate::codec::{encode_frame, Frame, FrameDecoder, RawCodec};

/// Response body type produced by the proxy: data frames plus trailers.
pub type ProxyBody = BoxBody<Bytes, Status>;

type BodyFrame = http_body::Frame<Bytes>;

const GRPC_CONTENT_TYPE: &str = "application/grpc";
const GRPC_STATUS: HeaderName = HeaderName::from_static("grpc-status");
const GRPC_MESSAGE: HeaderName = HeaderName::from_static("grpc-message");
const GRPC_ENCODING: HeaderName = HeaderName::from_static("grpc-encoding");

/// Headers that describe the upstream transport rather than the RPC; they
/// are not propagated to the downstream call.
const TRANSPORT_HEADERS: [&str; 8] = [
    "te",
    "content-type",
    "content-length",
    "user-agent",
    "accept-encoding",
    "grpc-encoding",
    "grpc-accept-encoding",
    "grpc-timeout",
];

/// Method-agnostic request handler.
pub struct Proxy {
    balancer: Arc<dyn Balancer>,
    timeout: Duration,
}

impl Proxy {
    pub fn new(balancer: Arc<dyn Balancer>, timeout: Duration) -> Self {
        Self { balancer, timeout }
    }

    /// Relay one RPC. Failures before any response frame are reported as
    /// trailers-only gRPC responses, never as transport errors.
    pub async fn handle(
        &self,
        request: Request<Incoming>,
    ) -> Result<Response<ProxyBody>, std::convert::Infallible> {
        match self.proxy_request(request).await {
            Ok(response) => Ok(response),
            Err(status) => {
                debug!(code = ?status.code(), message = status.message(), "request refused");
                Ok(trailers_only_response(&status))
            }
        }
    }

    async fn proxy_request(&self, request: Request<Incoming>) -> Result<Response<ProxyBody>, Status> {
        let path = request
            .uri()
            .path_and_query()
            .filter(|path| is_grpc_method(path.path()))
            .cloned()
            .ok_or_else(|| Status::internal("method unknown"))?;
        info!(method = %path.path(), "handle grpc request");

        if let Some(encoding) = request.headers().get(&GRPC_ENCODING) {
            if encoding.as_bytes() != b"identity" {
                return Err(Status::unimplemented("message compression is not supported"));
            }
        }

        let worker = self
            .balancer
            .next()
            .ok_or_else(|| Status::unavailable("server unavailable"))?;
        debug!(worker = %worker, "selected worker");

        let pulled = worker.fetch_client_conn().await.map_err(|err| {
            Status::unavailable(format!("failed getting grpc client connection: {err}"))
        })?;

        let deadline = Instant::now() + self.timeout;
        let (parts, body) = request.into_parts();
        let metadata = MetadataMap::from_headers(forwardable_headers(&parts.headers));

        // Request forwarder. Dropping the frame sender ends the downstream
        // request stream, which is the close-send signal to the worker.
        let (frame_tx, frame_rx) = mpsc::channel::<Frame>(16);
        let (abort_tx, mut abort_rx) = mpsc::channel::<Status>(1);
        tokio::spawn(forward_request(body, frame_tx, abort_tx));

        let mut grpc = Grpc::new(pulled.channel())
            .max_decoding_message_size(crate::codec::MAX_FRAME_SIZE)
            .max_encoding_message_size(crate::codec::MAX_FRAME_SIZE);
        grpc.ready()
            .await
            .map_err(|err| Status::unavailable(format!("failed creating downstream: {err}")))?;

        let mut downstream_request =
            tonic::Request::from_parts(metadata, Extensions::default(), ReceiverStream::new(frame_rx));
        downstream_request.set_timeout(self.timeout);

        let response = grpc.streaming(downstream_request, path, RawCodec).await?;
        let (head, mut downstream, _extensions) = response.into_parts();

        // Headers may not be meaningful until the worker produces a frame;
        // hold the upstream response until then.
        let first = tokio::select! {
            message = downstream.message() => message,
            Some(status) = abort_rx.recv() => return Err(status),
            _ = tokio::time::sleep_until(deadline) => {
                return Err(Status::deadline_exceeded("proxy timeout exceeded"));
            }
        };

        let mut headers = head.into_headers();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(GRPC_CONTENT_TYPE));

        let body = match first {
            Ok(Some(frame)) => {
                let (body_tx, body_rx) = mpsc::channel::<Result<BodyFrame, Status>>(16);
                let forward = ResponseForward {
                    downstream,
                    body_tx,
                    abort_rx,
                    deadline,
                    _pulled: pulled,
                };
                tokio::spawn(forward_response(forward, frame));
                StreamBody::new(ReceiverStream::new(body_rx)).boxed()
            }
            Ok(None) => {
                // The worker finished without a single message; relay its
                // trailers under an empty body.
                let trailers = ok_trailers(&mut downstream).await;
                drop(pulled);
                trailers_body(trailers)
            }
            Err(status) => return Err(status),
        };

        let mut response = Response::new(body);
        *response.headers_mut() = headers;
        Ok(response)
    }
}

/// Pump upstream request frames into the downstream stream.
async fn forward_request(
    mut body: Incoming,
    frames: mpsc::Sender<Frame>,
    abort: mpsc::Sender<Status>,
) {
    let mut decoder = FrameDecoder::new();
    loop {
        let Some(piece) = body.frame().await else {
            break;
        };
        match piece {
            Ok(piece) => {
                if let Ok(data) = piece.into_data() {
                    decoder.extend(&data);
                }
            }
            Err(err) => {
                warn!(error = %err, "failed reading upstream request");
                let _ = abort.send(Status::internal("failed proxying request")).await;
                return;
            }
        }

        loop {
            match decoder.next_frame() {
                Ok(Some(payload)) => {
                    if frames.send(Frame(payload)).await.is_err() {
                        // Downstream is gone; the response side reports it.
                        return;
                    }
                }
                Ok(None) => break,
                Err(status) => {
                    let _ = abort.send(status).await;
                    return;
                }
            }
        }
    }

    if !decoder.is_empty() {
        let _ = abort
            .send(Status::internal("failed proxying request"))
            .await;
    }
}

struct ResponseForward {
    downstream: Streaming<Frame>,
    body_tx: mpsc::Sender<Result<BodyFrame, Status>>,
    abort_rx: mpsc::Receiver<Status>,
    deadline: Instant,
    /// Held so the pool slot is returned when forwarding finishes.
    _pulled: PulledConn,
}

/// Pump downstream response frames upstream, finishing with trailers.
async fn forward_response(mut forward: ResponseForward, first: Frame) {
    if send_frame(&forward.body_tx, first).await.is_err() {
        return;
    }

    let mut request_done = false;
    loop {
        tokio::select! {
            message = forward.downstream.message() => match message {
                Ok(Some(frame)) => {
                    if send_frame(&forward.body_tx, frame).await.is_err() {
                        return;
                    }
                }
                Ok(None) => {
                    let trailers = ok_trailers(&mut forward.downstream).await;
                    let _ = forward.body_tx.send(Ok(BodyFrame::trailers(trailers))).await;
                    return;
                }
                Err(status) => {
                    debug!(code = ?status.code(), "downstream stream failed");
                    let _ = forward
                        .body_tx
                        .send(Ok(BodyFrame::trailers(trailers_from_status(&status))))
                        .await;
                    return;
                }
            },
            maybe_abort = forward.abort_rx.recv(), if !request_done => match maybe_abort {
                Some(status) => {
                    let _ = forward
                        .body_tx
                        .send(Ok(BodyFrame::trailers(trailers_from_status(&status))))
                        .await;
                    return;
                }
                None => request_done = true,
            },
            _ = tokio::time::sleep_until(forward.deadline) => {
                let status = Status::deadline_exceeded("proxy timeout exceeded");
                let _ = forward
                    .body_tx
                    .send(Ok(BodyFrame::trailers(trailers_from_status(&status))))
                    .await;
                return;
            }
        }
    }
}

async fn send_frame(
    body_tx: &mpsc::Sender<Result<BodyFrame, Status>>,
    frame: Frame,
) -> Result<(), ()> {
    body_tx
        .send(Ok(BodyFrame::data(encode_frame(&frame.0))))
        .await
        .map_err(|_| ())
}

/// Trailers for a cleanly finished downstream stream.
async fn ok_trailers(downstream: &mut Streaming<Frame>) -> HeaderMap {
    let metadata = match downstream.trailers().await {
        Ok(Some(metadata)) => metadata,
        Ok(None) => MetadataMap::new(),
        Err(status) => return trailers_from_status(&status),
    };
    let mut trailers = metadata.into_headers();
    trailers.insert(GRPC_STATUS, HeaderValue::from(0));
    trailers
}

/// Trailers carrying `status` plus its metadata.
fn trailers_from_status(status: &Status) -> HeaderMap {
    let mut trailers = status.metadata().clone().into_headers();
    trailers.insert(GRPC_STATUS, HeaderValue::from(status.code() as i32));
    trailers.remove(&GRPC_MESSAGE);
    if !status.message().is_empty() {
        if let Ok(value) = HeaderValue::from_str(status.message()) {
            trailers.insert(GRPC_MESSAGE, value);
        }
    }
    trailers
}

/// A gRPC trailers-only response: the status travels in the HTTP headers.
fn trailers_only_response(status: &Status) -> Response<ProxyBody> {
    let mut response = Response::new(empty_body());
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(GRPC_CONTENT_TYPE));
    response.headers_mut().extend(trailers_from_status(status));
    response
}

fn empty_body() -> ProxyBody {
    http_body_util::Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

fn trailers_body(trailers: HeaderMap) -> ProxyBody {
    StreamBody::new(futures::stream::iter([Ok::<_, Status>(BodyFrame::trailers(
        trailers,
    ))]))
    .boxed()
}

/// A gRPC method path has the shape `/package.Service/Method`.
fn is_grpc_method(path: &str) -> bool {
    let Some(rest) = path.strip_prefix('/') else {
        return false;
    };
    match rest.split_once('/') {
        Some((service, method)) => {
            !service.is_empty() && !method.is_empty() && !method.contains('/')
        }
        None => false,
    }
}

fn forwardable_headers(headers: &HeaderMap) -> HeaderMap {
    let mut forwarded = headers.clone();
    for name in TRANSPORT_HEADERS {
        forwarded.remove(name);
    }
    forwarded
}
