//! End-to-end proxying through a live relay listener.
//!
//! Backends are in-process gRPC servers: a real `tonic-health` service for
//! protocol interop, and a byte-level echo service for opaque-frame,
//! metadata, and trailer assertions. Workers are constructed without child
//! processes; membership is driven directly through the balancer.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::header::{HeaderMap, HeaderValue};
use http::uri::PathAndQuery;
use http::{Request, Response};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::Incoming;
use hyper::server::conn::http2;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use relay_balance::{Balancer, RoundRobin};
use relay_proxy::codec::encode_frame;
use relay_proxy::{Frame, FrameDecoder, GrpcServer, Proxy, RawCodec};
use relay_worker::Worker;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::client::Grpc;
use tonic::transport::Endpoint;
use tonic::{Code, Status};
use tonic_health::pb::health_check_response::ServingStatus;
use tonic_health::pb::health_client::HealthClient;
use tonic_health::pb::HealthCheckRequest;

type TestBody = BoxBody<Bytes, Status>;

/// How an in-process backend answers a stream.
#[derive(Clone, Copy)]
enum Behavior {
    /// Echo every request frame, then finish with trailers.
    Echo,
    /// Emit `frames` payloads spaced by `interval`, then finish.
    Slow { frames: usize, interval_ms: u64 },
    /// Emit one payload and keep the stream open.
    HoldOpen,
}

/// Serve a byte-level gRPC backend on `port` until `shutdown` is cancelled.
async fn spawn_backend(port: u16, behavior: Behavior, shutdown: CancellationToken) {
    let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
    tokio::spawn(async move {
        loop {
            let stream = tokio::select! {
                accepted = listener.accept() => accepted.unwrap().0,
                _ = shutdown.cancelled() => return,
            };
            let service = service_fn(move |request| handle_backend(request, behavior));
            let connection =
                http2::Builder::new(TokioExecutor::new()).serve_connection(TokioIo::new(stream), service);
            tokio::spawn(async move {
                let _ = connection.await;
            });
        }
    });
}

async fn handle_backend(
    request: Request<Incoming>,
    behavior: Behavior,
) -> Result<Response<TestBody>, std::convert::Infallible> {
    let seen_custom = request.headers().get("x-custom").cloned();
    let mut body = request.into_body();

    let (tx, rx) = mpsc::channel::<Result<http_body::Frame<Bytes>, Status>>(16);
    tokio::spawn(async move {
        match behavior {
            Behavior::Echo => {
                let mut decoder = FrameDecoder::new();
                while let Some(Ok(piece)) = body.frame().await {
                    if let Ok(data) = piece.into_data() {
                        decoder.extend(&data);
                    }
                    while let Ok(Some(payload)) = decoder.next_frame() {
                        if tx
                            .send(Ok(http_body::Frame::data(encode_frame(&payload))))
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                }
                let _ = tx.send(Ok(http_body::Frame::trailers(ok_trailers()))).await;
            }
            Behavior::Slow { frames, interval_ms } => {
                for i in 0..frames {
                    let payload = format!("tick-{i}");
                    if tx
                        .send(Ok(http_body::Frame::data(encode_frame(payload.as_bytes()))))
                        .await
                        .is_err()
                    {
                        return;
                    }
                    tokio::time::sleep(Duration::from_millis(interval_ms)).await;
                }
                let _ = tx.send(Ok(http_body::Frame::trailers(ok_trailers()))).await;
            }
            Behavior::HoldOpen => {
                let _ = tx
                    .send(Ok(http_body::Frame::data(encode_frame(b"held"))))
                    .await;
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
        }
    });

    let mut response = Response::new(StreamBody::new(ReceiverStream::new(rx)).boxed());
    response
        .headers_mut()
        .insert("content-type", HeaderValue::from_static("application/grpc"));
    response
        .headers_mut()
        .insert("x-worker", HeaderValue::from_static("test-worker"));
    if let Some(value) = seen_custom {
        response.headers_mut().insert("x-seen-custom", value);
    }
    Ok(response)
}

fn ok_trailers() -> HeaderMap {
    let mut trailers = HeaderMap::new();
    trailers.insert("grpc-status", HeaderValue::from_static("0"));
    trailers.insert("x-echo-trailer", HeaderValue::from_static("done"));
    trailers
}

struct Relay {
    balancer: Arc<RoundRobin>,
    shutdown: CancellationToken,
    port: u16,
}

/// Start a relay listener with an empty balancer membership.
async fn spawn_relay(port: u16, pool_size: usize, worker_port: u16) -> (Relay, Arc<Worker>) {
    let worker = Arc::new(Worker::new("worker-1", worker_port, worker_port + 100, "/metrics", pool_size));
    let balancer = Arc::new(RoundRobin::new());
    let shutdown = CancellationToken::new();

    {
        let balancer = balancer.clone();
        let token = shutdown.clone();
        tokio::spawn(async move { balancer.run(token).await });
    }

    let proxy = Arc::new(Proxy::new(balancer.clone(), Duration::from_secs(30)));
    let server = GrpcServer::new("127.0.0.1", port, proxy);
    {
        let token = shutdown.clone();
        tokio::spawn(async move { server.run(token).await.unwrap() });
    }

    // Give the listener a beat to bind.
    wait_for_port(port).await;

    (
        Relay {
            balancer,
            shutdown,
            port,
        },
        worker,
    )
}

async fn wait_for_port(port: u16) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if tokio::net::TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "port {port} did not open"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn join_balancer(relay: &Relay, worker: Arc<Worker>) {
    relay.balancer.add(worker).await;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while relay.balancer.next().is_none() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "worker did not join the balancer"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn raw_client(port: u16) -> Grpc<tonic::transport::Channel> {
    let channel = Endpoint::from_shared(format!("http://127.0.0.1:{port}"))
        .unwrap()
        .connect()
        .await
        .unwrap();
    Grpc::new(channel)
}

/// Deterministic pseudo-random payload.
fn noise(len: usize) -> Vec<u8> {
    let mut state: u64 = 0x9e3779b97f4a7c15;
    (0..len)
        .map(|_| {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (state >> 33) as u8
        })
        .collect()
}

#[tokio::test]
async fn health_check_is_proxied_to_a_real_health_service() {
    let backend_shutdown = CancellationToken::new();
    let (health_reporter, health_service) = tonic_health::server::health_reporter();
    health_reporter
        .set_service_status("", tonic_health::ServingStatus::Serving)
        .await;
    {
        let token = backend_shutdown.clone();
        tokio::spawn(async move {
            tonic::transport::Server::builder()
                .add_service(health_service)
                .serve_with_shutdown("127.0.0.1:19710".parse().unwrap(), token.cancelled())
                .await
                .unwrap();
        });
    }
    wait_for_port(19710).await;

    let (relay, worker) = spawn_relay(19711, 2, 19710).await;
    join_balancer(&relay, worker).await;

    let channel = Endpoint::from_static("http://127.0.0.1:19711")
        .connect()
        .await
        .unwrap();
    let mut client = HealthClient::new(channel);
    let response = client
        .check(HealthCheckRequest {
            service: String::new(),
        })
        .await
        .unwrap();
    assert_eq!(response.into_inner().status(), ServingStatus::Serving);

    relay.shutdown.cancel();
    backend_shutdown.cancel();
}

#[tokio::test]
async fn empty_balancer_yields_unavailable() {
    let (relay, _worker) = spawn_relay(19715, 1, 19716).await;

    let channel = Endpoint::from_static("http://127.0.0.1:19715")
        .connect()
        .await
        .unwrap();
    let mut client = HealthClient::new(channel);
    let err = client
        .check(HealthCheckRequest {
            service: String::new(),
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Unavailable);
    assert_eq!(err.message(), "server unavailable");

    relay.shutdown.cancel();
}

#[tokio::test]
async fn opaque_payload_metadata_and_trailers_round_trip() {
    let backend_shutdown = CancellationToken::new();
    spawn_backend(19720, Behavior::Echo, backend_shutdown.clone()).await;

    let (relay, worker) = spawn_relay(19721, 2, 19720).await;
    join_balancer(&relay, worker).await;

    let payload = noise(64 * 1024);
    let mut grpc = raw_client(relay.port).await;
    grpc.ready().await.unwrap();

    let outbound = futures::stream::iter(vec![Frame(Bytes::from(payload.clone()))]);
    let mut request = tonic::Request::new(outbound);
    request
        .metadata_mut()
        .insert("x-custom", "value".parse().unwrap());

    let response = grpc
        .streaming(
            request,
            PathAndQuery::from_static("/test.Echo/Stream"),
            RawCodec,
        )
        .await
        .unwrap();
    let (head, mut stream, _extensions) = response.into_parts();

    // Worker-emitted headers reach the client, including the echoed request
    // metadata observed by the worker.
    assert_eq!(head.get("x-worker").unwrap(), "test-worker");
    assert_eq!(head.get("x-seen-custom").unwrap(), "value");

    let first = stream.message().await.unwrap().unwrap();
    assert_eq!(&first.0[..], &payload[..]);
    assert!(stream.message().await.unwrap().is_none());

    let trailers = stream.trailers().await.unwrap().unwrap();
    assert_eq!(trailers.get("x-echo-trailer").unwrap(), "done");

    relay.shutdown.cancel();
    backend_shutdown.cancel();
}

#[tokio::test]
async fn server_streaming_frames_arrive_in_order() {
    let backend_shutdown = CancellationToken::new();
    spawn_backend(
        19725,
        Behavior::Slow {
            frames: 5,
            interval_ms: 30,
        },
        backend_shutdown.clone(),
    )
    .await;

    let (relay, worker) = spawn_relay(19726, 2, 19725).await;
    join_balancer(&relay, worker).await;

    let mut grpc = raw_client(relay.port).await;
    grpc.ready().await.unwrap();

    let outbound = futures::stream::iter(vec![Frame(Bytes::from_static(b"go"))]);
    let response = grpc
        .streaming(
            tonic::Request::new(outbound),
            PathAndQuery::from_static("/test.Stream/Ticks"),
            RawCodec,
        )
        .await
        .unwrap();
    let mut stream = response.into_inner();

    let mut received = Vec::new();
    while let Some(frame) = stream.message().await.unwrap() {
        received.push(String::from_utf8(frame.0.to_vec()).unwrap());
    }
    assert_eq!(received, vec!["tick-0", "tick-1", "tick-2", "tick-3", "tick-4"]);

    relay.shutdown.cancel();
    backend_shutdown.cancel();
}

#[tokio::test]
async fn pool_of_one_rejects_a_second_concurrent_rpc() {
    let backend_shutdown = CancellationToken::new();
    spawn_backend(19730, Behavior::HoldOpen, backend_shutdown.clone()).await;

    let (relay, worker) = spawn_relay(19731, 1, 19730).await;
    join_balancer(&relay, worker).await;

    // First RPC takes the only slot and holds it.
    let mut first = raw_client(relay.port).await;
    first.ready().await.unwrap();
    let outbound = futures::stream::iter(vec![Frame(Bytes::from_static(b"hold"))]);
    let response = first
        .streaming(
            tonic::Request::new(outbound),
            PathAndQuery::from_static("/test.Hold/Open"),
            RawCodec,
        )
        .await
        .unwrap();
    let mut stream = response.into_inner();
    assert_eq!(&stream.message().await.unwrap().unwrap().0[..], b"held");

    // Second RPC waits the fetch bound (~5s) and is refused.
    let mut second = raw_client(relay.port).await;
    second.ready().await.unwrap();
    let outbound = futures::stream::iter(vec![Frame(Bytes::from_static(b"busy"))]);
    let err = tokio::time::timeout(
        Duration::from_secs(8),
        second.streaming(
            tonic::Request::new(outbound),
            PathAndQuery::from_static("/test.Hold/Open"),
            RawCodec,
        ),
    )
    .await
    .expect("second rpc should resolve after the fetch bound")
    .unwrap_err();
    assert_eq!(err.code(), Code::Unavailable);

    relay.shutdown.cancel();
    backend_shutdown.cancel();
}

#[tokio::test]
async fn graceful_shutdown_drains_in_flight_stream_and_refuses_new_connections() {
    let backend_shutdown = CancellationToken::new();
    spawn_backend(
        19735,
        Behavior::Slow {
            frames: 8,
            interval_ms: 100,
        },
        backend_shutdown.clone(),
    )
    .await;

    let (relay, worker) = spawn_relay(19736, 2, 19735).await;
    join_balancer(&relay, worker).await;

    let mut grpc = raw_client(relay.port).await;
    grpc.ready().await.unwrap();
    let outbound = futures::stream::iter(vec![Frame(Bytes::from_static(b"go"))]);
    let response = grpc
        .streaming(
            tonic::Request::new(outbound),
            PathAndQuery::from_static("/test.Stream/Ticks"),
            RawCodec,
        )
        .await
        .unwrap();
    let mut stream = response.into_inner();

    // A few frames in, stop the relay.
    for _ in 0..2 {
        stream.message().await.unwrap().unwrap();
    }
    relay.shutdown.cancel();
    tokio::time::sleep(Duration::from_millis(200)).await;

    // The in-flight stream keeps receiving until the worker finishes.
    let mut remaining = 0;
    while let Some(_frame) = stream.message().await.unwrap() {
        remaining += 1;
    }
    assert!(remaining >= 4, "expected the stream to drain, got {remaining}");

    // New connections are refused once the listener is gone.
    let refused = Endpoint::from_static("http://127.0.0.1:19736")
        .connect_timeout(Duration::from_secs(1))
        .connect()
        .await;
    assert!(refused.is_err());

    backend_shutdown.cancel();
}
