// SPDX-License-Identifier: Apache-2.0

use crate::listener::Listener;
use crate::receivers::agent_output::{AgentOutput, StreamState};
use flate2::read::GzDecoder;
use http::header::{CONTENT_ENCODING, CONTENT_TYPE};
use http::{HeaderValue, Method};
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Bytes};
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use hyper_util::service::TowerToHyperService;
use ocagent_proto::agent::interaction::v1::ExportInteractionServiceRequest;
use prost::Message;
use read_restrict::ReadExt;
use std::fmt::{Debug, Display};
use std::future::Future;
use std::io::{ErrorKind, Read};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower::{BoxError, Service, ServiceBuilder};
use tower_http::compression::{Compression, CompressionLayer};
use tower_http::limit::{RequestBodyLimit, RequestBodyLimitLayer};
use tower_http::trace::{HttpMakeClassifier, Trace, TraceLayer};
use tower_http::validate_request::{
    ValidateRequest, ValidateRequestHeader, ValidateRequestHeaderLayer,
};
use tracing::{debug, error};

pub const DEFAULT_INTERACTION_PATH: &str = "/v1/interactions";

// Also bounds the inflated size of gzip bodies
const MAX_BODY_SIZE: usize = 20 * 1024 * 1024;

const DEFAULT_HEADER_TIMEOUT: Duration = Duration::from_secs(30);

const PROTOBUF_CT: &str = "application/x-protobuf";

pub struct InteractionHttpServerBuilder {
    output: AgentOutput,
    path: Option<String>,
    header_timeout: Option<Duration>,
}

impl InteractionHttpServerBuilder {
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_header_timeout(self, header_timeout: Duration) -> Self {
        Self {
            header_timeout: Some(header_timeout),
            ..self
        }
    }

    pub fn build(self) -> InteractionHttpServer {
        InteractionHttpServer {
            output: self.output,
            path: self
                .path
                .unwrap_or_else(|| DEFAULT_INTERACTION_PATH.to_string()),
            header_timeout: self.header_timeout.unwrap_or(DEFAULT_HEADER_TIMEOUT),
        }
    }
}

/// Accepts protobuf encoded `ExportInteractionServiceRequest` bodies posted to a single path.
pub struct InteractionHttpServer {
    output: AgentOutput,
    path: String,
    header_timeout: Duration,
}

impl InteractionHttpServer {
    pub fn builder(output: AgentOutput) -> InteractionHttpServerBuilder {
        InteractionHttpServerBuilder {
            output,
            path: None,
            header_timeout: None,
        }
    }

    pub async fn serve(
        &self,
        listener: Listener,
        cancellation: CancellationToken,
    ) -> Result<(), BoxError> {
        let svc = build_service(self.output.clone(), self.path.clone());
        let svc = TowerToHyperService::new(svc);

        let timer = hyper_util::rt::TokioTimer::new();
        let graceful = hyper_util::server::graceful::GracefulShutdown::new();

        let mut builder = Builder::new(TokioExecutor::new());
        builder
            .http1()
            .header_read_timeout(Some(self.header_timeout))
            .timer(timer.clone());
        builder.http2().timer(timer);

        let listener = listener.into_async();
        loop {
            let stream = tokio::select! {
                r = listener.accept() => {
                    match r {
                        Ok((stream, _)) => stream,
                        Err(e) => return Err(e.into()),
                    }
                },
                _ = cancellation.cancelled() => break
            };

            let io = TokioIo::new(stream);
            let conn = builder.serve_connection(io, svc.clone());
            let fut = graceful.watch(conn.into_owned());

            tokio::spawn(async move {
                if let Err(e) = fut.await {
                    match e.downcast_ref::<hyper::Error>() {
                        // Idle keep-alive connections hit the header timeout, and clients may
                        // race us on close: https://github.com/hyperium/hyper/issues/3775
                        Some(hyper_err) => {
                            let err_str = format!("{:?}", hyper_err);
                            if !err_str.contains("NotConnected") && !err_str.contains("HeaderTimeout")
                            {
                                error!("error serving connection: {:?}", hyper_err);
                            }
                        }
                        None => error!("error serving connection: {:?}", e),
                    }
                }
            });
        }

        graceful.shutdown().await;
        Ok(())
    }
}

#[derive(Clone)]
struct ValidateProtobufContentType {
    path: String,
}

impl<B> ValidateRequest<B> for ValidateProtobufContentType {
    type ResponseBody = Full<Bytes>;

    fn validate(&mut self, request: &mut Request<B>) -> Result<(), Response<Self::ResponseBody>> {
        // Unknown routes fall through so they are answered with a 404, not a 400
        if request.method() != Method::POST || request.uri().path() != self.path {
            return Ok(());
        }

        if request
            .headers()
            .get(CONTENT_TYPE)
            .is_none_or(|ct| ct != PROTOBUF_CT)
        {
            Err(status_response(StatusCode::BAD_REQUEST))
        } else {
            Ok(())
        }
    }
}

type InteractionHttpService = Trace<
    RequestBodyLimit<
        Compression<ValidateRequestHeader<InteractionService, ValidateProtobufContentType>>,
    >,
    HttpMakeClassifier,
>;

fn build_service(output: AgentOutput, path: String) -> InteractionHttpService {
    ServiceBuilder::new()
        .layer(TraceLayer::new_for_http())
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .layer(CompressionLayer::new())
        .layer(ValidateRequestHeaderLayer::custom(
            ValidateProtobufContentType { path: path.clone() },
        ))
        .service(InteractionService { output, path })
}

#[derive(Clone)]
struct InteractionService {
    output: AgentOutput,
    path: String,
}

impl<H> Service<Request<H>> for InteractionService
where
    H: Body + Send + Sync + 'static,
    <H as Body>::Data: Send + Sync + Clone,
    <H as Body>::Error: Display + Debug + Send + Sync + ToString,
{
    type Response = Response<Full<Bytes>>;
    type Error = hyper::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<H>) -> Self::Future {
        if req.method() != Method::POST || req.uri().path() != self.path {
            return Box::pin(futures::future::ok(status_response(StatusCode::NOT_FOUND)));
        }

        Box::pin(handle(req, self.output.clone()))
    }
}

async fn handle<H: Body>(
    req: Request<H>,
    output: AgentOutput,
) -> Result<Response<Full<Bytes>>, hyper::Error>
where
    <H as Body>::Error: Display + Debug + Send + Sync + ToString,
{
    let body = match decode_body(req).await {
        Ok(body) => body,
        Err(code) => return Ok(status_response(code)),
    };
    let request = match ExportInteractionServiceRequest::decode(body) {
        Ok(request) => request,
        Err(e) => {
            debug!(error = %e, "Failed to decode interaction request.");
            return Ok(status_response(StatusCode::BAD_REQUEST));
        }
    };

    // Each post stands alone, there is no node to inherit
    let outcome = output.ingest(&mut StreamState::unary(), request, "http");
    if outcome.refused > 0 {
        return Ok(status_response(StatusCode::SERVICE_UNAVAILABLE));
    }

    // The encoded ExportInteractionServiceResponse is empty
    let mut resp = Response::new(Full::new(Bytes::new()));
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(PROTOBUF_CT));
    Ok(resp)
}

async fn decode_body<H: Body>(req: Request<H>) -> Result<Bytes, StatusCode>
where
    <H as Body>::Error: Display + Debug + Send + Sync + ToString,
{
    let is_gzip = req
        .headers()
        .get(CONTENT_ENCODING)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.eq_ignore_ascii_case("gzip"));

    let body_bytes = match req.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            // The limit error is boxed inside the body error, match on its message
            if e.to_string().contains("length limit exceeded") {
                return Err(StatusCode::PAYLOAD_TOO_LARGE);
            }
            error!("Failed to read request body: {:?}", e);
            return Err(StatusCode::BAD_REQUEST);
        }
    };

    if !is_gzip {
        return Ok(body_bytes);
    }

    decompress_gzip(&body_bytes).map_err(|e| {
        if e.kind() == ErrorKind::InvalidData {
            StatusCode::PAYLOAD_TOO_LARGE
        } else {
            debug!(error = %e, "Failed to decompress gzip body.");
            StatusCode::BAD_REQUEST
        }
    })
}

// DecompressionLayer has no limit on the inflated size
fn decompress_gzip(compressed: &[u8]) -> std::io::Result<Bytes> {
    let mut decoder = GzDecoder::new(compressed).restrict(MAX_BODY_SIZE as u64);
    let mut decompressed = Vec::new();
    decoder.read_to_end(&mut decompressed)?;
    Ok(Bytes::from(decompressed))
}

fn status_response(code: StatusCode) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(Bytes::new()));
    *resp.status_mut() = code;
    resp
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exporters::testing::{GatedSink, RecordingSink};
    use crate::receivers::agent_output::ReceiverCounters;
    use crate::topology::batch::BufferPolicy;
    use crate::topology::payload::RecordData;
    use crate::topology::span_buffer::SpanBuffer;
    use flate2::Compression as GZCompression;
    use flate2::read::GzEncoder;
    use hyper_util::client::legacy::Client;
    use hyper_util::client::legacy::connect::HttpConnector;
    use hyper_util::rt::TokioTimer;
    use std::sync::Arc;
    use tokio::time::sleep;
    use tokio_test::assert_ok;
    use tracing_test::traced_test;
    use utilities::agent::FakeAgent;

    fn new_svc(
        capacity: usize,
    ) -> (
        TowerToHyperService<InteractionHttpService>,
        SpanBuffer,
        RecordingSink,
    ) {
        let sink = RecordingSink::default();
        let policy = BufferPolicy {
            period: Duration::from_secs(60),
            count: 0,
            capacity,
        };
        let buffer = SpanBuffer::start("test", policy, Arc::new(sink.clone())).unwrap();
        let output = AgentOutput::new(buffer.handle(), ReceiverCounters::noop());
        let svc = build_service(output, DEFAULT_INTERACTION_PATH.to_string());
        (TowerToHyperService::new(svc), buffer, sink)
    }

    fn encoded(req: &ExportInteractionServiceRequest) -> Bytes {
        let mut buf = Vec::with_capacity(req.encoded_len());
        req.encode(&mut buf).unwrap();
        Bytes::from(buf)
    }

    fn post(path: &str, body: Bytes) -> Request<Full<Bytes>> {
        Request::builder()
            .uri(path)
            .method(Method::POST)
            .header(CONTENT_TYPE, PROTOBUF_CT)
            .body(Full::new(body))
            .unwrap()
    }

    #[tokio::test]
    async fn invalid_requests() {
        use hyper::service::Service;
        let (svc, buffer, _) = new_svc(10);

        let resp = svc.call(post("/v1/traces", Bytes::new())).await.unwrap();
        assert_eq!(StatusCode::NOT_FOUND, resp.status());

        let req = Request::builder()
            .uri(DEFAULT_INTERACTION_PATH)
            .method(Method::GET)
            .body(Full::<Bytes>::default())
            .unwrap();
        let resp = svc.call(req).await.unwrap();
        assert_eq!(StatusCode::NOT_FOUND, resp.status());

        let req = Request::builder()
            .uri(DEFAULT_INTERACTION_PATH)
            .method(Method::POST)
            .header(CONTENT_TYPE, "application/json")
            .body(Full::<Bytes>::default())
            .unwrap();
        let resp = svc.call(req).await.unwrap();
        assert_eq!(StatusCode::BAD_REQUEST, resp.status());

        let garbage = Bytes::from_static(&[0xff, 0xff, 0xff, 0xff]);
        let resp = svc.call(post(DEFAULT_INTERACTION_PATH, garbage)).await.unwrap();
        assert_eq!(StatusCode::BAD_REQUEST, resp.status());

        buffer.shutdown().await;
    }

    #[tokio::test]
    async fn valid_posts_are_buffered() {
        use hyper::service::Service;
        let (svc, buffer, sink) = new_svc(10);

        let mut req = FakeAgent::interaction_service_request_with_interactions(3);
        req.node = None;
        let resp = svc
            .call(post(DEFAULT_INTERACTION_PATH, encoded(&req)))
            .await
            .unwrap();
        assert_eq!(StatusCode::OK, resp.status());
        assert_eq!(PROTOBUF_CT, resp.headers().get(CONTENT_TYPE).unwrap());

        assert_eq!(Ok(3), buffer.flush().await);
        let batches = sink.batches();
        assert!(
            batches[0]
                .iter()
                .all(|r| matches!(r.data(), RecordData::Interaction(_)))
        );
        buffer.shutdown().await;
    }

    #[tokio::test]
    async fn gzip_bodies_and_size_limits() {
        use hyper::service::Service;
        let (svc, buffer, _) = new_svc(10);

        let body = encoded(&FakeAgent::interaction_service_request_with_interactions(2));
        let mut gz_body = Vec::new();
        GzEncoder::new(&body[..], GZCompression::fast())
            .read_to_end(&mut gz_body)
            .unwrap();
        let mut req = post(DEFAULT_INTERACTION_PATH, Bytes::from(gz_body));
        req.headers_mut()
            .insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        let resp = svc.call(req).await.unwrap();
        assert_eq!(StatusCode::OK, resp.status());
        assert_eq!(Ok(2), buffer.flush().await);

        let large = Bytes::from(vec![0; MAX_BODY_SIZE + 1]);
        let resp = svc.call(post(DEFAULT_INTERACTION_PATH, large)).await.unwrap();
        assert_eq!(StatusCode::PAYLOAD_TOO_LARGE, resp.status());

        // small on the wire, too large once inflated
        let large = vec![0; MAX_BODY_SIZE + 1];
        let mut gz_body = Vec::new();
        GzEncoder::new(&large[..], GZCompression::fast())
            .read_to_end(&mut gz_body)
            .unwrap();
        assert!(gz_body.len() < MAX_BODY_SIZE);
        let mut req = post(DEFAULT_INTERACTION_PATH, Bytes::from(gz_body));
        req.headers_mut()
            .insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        let resp = svc.call(req).await.unwrap();
        assert_eq!(StatusCode::PAYLOAD_TOO_LARGE, resp.status());

        buffer.shutdown().await;
    }

    #[tokio::test]
    async fn corrupt_gzip_is_bad_request() {
        use hyper::service::Service;
        let (svc, buffer, _) = new_svc(10);

        let body = encoded(&FakeAgent::interaction_service_request_with_interactions(2));
        let mut gz_body = Vec::new();
        GzEncoder::new(&body[..], GZCompression::fast())
            .read_to_end(&mut gz_body)
            .unwrap();
        let truncated = gz_body[..gz_body.len() / 2].to_vec();

        for corrupt in [b"not gzip at all".to_vec(), truncated] {
            let mut req = post(DEFAULT_INTERACTION_PATH, Bytes::from(corrupt));
            req.headers_mut()
                .insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
            let resp = svc.call(req).await.unwrap();
            assert_eq!(StatusCode::BAD_REQUEST, resp.status());
        }
        assert_eq!(Ok(0), buffer.flush().await);

        buffer.shutdown().await;
    }

    #[tokio::test]
    async fn saturated_buffer_is_unavailable() {
        use hyper::service::Service;
        let (sink, mut entered, release) = GatedSink::new();
        let policy = BufferPolicy {
            period: Duration::ZERO,
            count: 1,
            capacity: 1,
        };
        let buffer = SpanBuffer::start("test", policy, Arc::new(sink)).unwrap();
        let output = AgentOutput::new(buffer.handle(), ReceiverCounters::noop());
        let svc = TowerToHyperService::new(build_service(
            output,
            DEFAULT_INTERACTION_PATH.to_string(),
        ));

        let one = encoded(&FakeAgent::interaction_service_request_with_interactions(1));
        let resp = svc.call(post(DEFAULT_INTERACTION_PATH, one)).await.unwrap();
        assert_eq!(StatusCode::OK, resp.status());
        entered.recv().await.unwrap();

        let three = encoded(&FakeAgent::interaction_service_request_with_interactions(3));
        let resp = svc.call(post(DEFAULT_INTERACTION_PATH, three)).await.unwrap();
        assert_eq!(StatusCode::SERVICE_UNAVAILABLE, resp.status());

        release.add_permits(10);
        buffer.shutdown().await;
    }

    #[traced_test]
    #[tokio::test]
    async fn serves_posts_and_stops_on_cancel() {
        let sink = RecordingSink::default();
        let buffer =
            SpanBuffer::start("test", BufferPolicy::default(), Arc::new(sink.clone())).unwrap();
        let srv = InteractionHttpServer::builder(AgentOutput::new(
            buffer.handle(),
            ReceiverCounters::noop(),
        ))
        .with_header_timeout(Duration::from_millis(50))
        .build();

        let listener = Listener::listen("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = listener.bound_address().unwrap();
        let cancel = CancellationToken::new();
        let srv_hnd = {
            let cancel = cancel.clone();
            tokio::spawn(async move { srv.serve(listener, cancel).await })
        };

        let client: Client<HttpConnector, Full<Bytes>> = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(2))
            .pool_max_idle_per_host(2)
            .timer(TokioTimer::new())
            .build(HttpConnector::new());
        let req = post(
            &format!("http://{addr}{DEFAULT_INTERACTION_PATH}"),
            encoded(&FakeAgent::interaction_service_request_with_interactions(2)),
        );

        let resp = client.request(req.clone()).await.unwrap();
        assert_eq!(StatusCode::OK, resp.status());

        // idle past the header timeout, then reuse the connection
        sleep(Duration::from_millis(100)).await;
        assert_ok!(client.request(req).await);

        cancel.cancel();
        assert_ok!(srv_hnd.await.unwrap());
        buffer.shutdown().await;

        assert_eq!(4, sink.record_count());
        assert!(!logs_contain("error serving connection"));
    }
}
