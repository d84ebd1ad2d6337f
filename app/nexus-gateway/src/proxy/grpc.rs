//! HTTP to gRPC transcoding via server reflection
//!
//! Dials one channel per backend address, resolves method descriptors
//! through the reflection service (cached per address + service with a
//! TTL), and invokes unary methods with JSON-encoded dynamic messages.

use axum::body::Body;
use axum::extract::Request;
use axum::http::{header, Response};
use prost::Message;
use prost_reflect::{DescriptorPool, DynamicMessage, MethodDescriptor};
use prost_types::{FileDescriptorProto, FileDescriptorSet};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Instant;
use tokio::sync::RwLock;
use tonic::codec::{Codec, DecodeBuf, EncodeBuf};
use tonic::metadata::{MetadataKey, MetadataValue};
use tonic::transport::Channel;
use tonic::Status;
use tonic_reflection::pb::v1alpha::server_reflection_client::ServerReflectionClient;
use tonic_reflection::pb::v1alpha::server_reflection_request::MessageRequest;
use tonic_reflection::pb::v1alpha::server_reflection_response::MessageResponse;
use tonic_reflection::pb::v1alpha::ServerReflectionRequest;
use tracing::{error, warn};

use crate::config::GrpcSection;
use crate::error::{codes, gateway_error, GatewayError};

/// Headers forwarded to the backend as gRPC metadata
const FORWARDED_HEADERS: [&str; 5] = [
    "authorization",
    "x-request-id",
    "x-trace-id",
    "x-user-id",
    "x-user-role",
];

struct CachedService {
    pool: DescriptorPool,
    service: String,
    cached_at: Instant,
}

/// HTTP to gRPC transcoder (unary methods only)
pub struct GrpcTranscoder {
    cfg: GrpcSection,
    channels: RwLock<HashMap<String, Channel>>,
    descriptors: RwLock<HashMap<String, CachedService>>,
}

impl GrpcTranscoder {
    pub fn new(cfg: GrpcSection) -> Self {
        Self {
            cfg,
            channels: RwLock::new(HashMap::new()),
            descriptors: RwLock::new(HashMap::new()),
        }
    }

    /// Transcode one request to `address`, where `method_path` is
    /// `package.Service/Method`.
    pub async fn handle(
        &self,
        address: &str,
        method_path: &str,
        request: Request,
        trace_id: &str,
    ) -> Response<Body> {
        let Some((service, method_name)) = method_path.rsplit_once('/') else {
            return gateway_error(
                codes::BACKEND_ERROR,
                &format!(
                    "invalid gRPC method path: {} (expected Service/Method)",
                    method_path
                ),
                trace_id,
            );
        };

        let channel = match self.channel(address).await {
            Ok(channel) => channel,
            Err(e) => {
                error!("grpc connect failed: {}: {}", address, e);
                return gateway_error(
                    codes::BACKEND_ERROR,
                    &format!("grpc connect failed: {}", address),
                    trace_id,
                );
            }
        };

        let method = match self
            .resolve_method(&channel, address, service, method_name)
            .await
        {
            Ok(method) => method,
            Err(e) => {
                error!("grpc resolve method failed: {}: {}", method_path, e);
                return gateway_error(
                    codes::BACKEND_ERROR,
                    &format!("grpc method not found: {}", method_path),
                    trace_id,
                );
            }
        };

        if method.is_client_streaming() || method.is_server_streaming() {
            return gateway_error(
                codes::BACKEND_ERROR,
                &format!("streaming not supported: {}", method_path),
                trace_id,
            );
        }

        // JSON body -> request message; an empty body is an empty message
        let headers = request.headers().clone();
        let body = match axum::body::to_bytes(request.into_body(), usize::MAX).await {
            Ok(body) => body,
            Err(_) => {
                return gateway_error(codes::BACKEND_ERROR, "failed to read request body", trace_id)
            }
        };
        let input = if body.is_empty() {
            DynamicMessage::new(method.input())
        } else {
            let mut deserializer = serde_json::Deserializer::from_slice(&body);
            match DynamicMessage::deserialize(method.input(), &mut deserializer) {
                Ok(message) => message,
                Err(e) => {
                    // a schema change inside the cache TTL shows up here;
                    // drop the entry so the next request re-reflects
                    self.invalidate(address, service).await;
                    return gateway_error(
                        codes::BACKEND_ERROR,
                        &format!("invalid JSON for {}: {}", method_path, e),
                        trace_id,
                    );
                }
            }
        };

        let mut grpc_request = tonic::Request::new(input);
        for name in FORWARDED_HEADERS {
            if let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) {
                if let (Ok(key), Ok(value)) = (
                    MetadataKey::from_str(name),
                    MetadataValue::from_str(value),
                ) {
                    grpc_request.metadata_mut().insert(key, value);
                }
            }
        }

        let response = match self.invoke(channel, &method, service, grpc_request).await {
            Ok(response) => response,
            Err(InvokeError::Timeout) => {
                return gateway_error(
                    codes::BACKEND_TIMEOUT,
                    &format!("grpc call timed out: {}", method_path),
                    trace_id,
                )
            }
            Err(InvokeError::Status(status)) => {
                return status_response(&status);
            }
            Err(InvokeError::Transport(message)) => {
                error!("grpc call failed: {}: {}", method_path, message);
                return gateway_error(
                    codes::BACKEND_ERROR,
                    &format!("grpc call failed: {}", method_path),
                    trace_id,
                );
            }
        };

        match serde_json::to_vec(&response) {
            Ok(json) => Response::builder()
                .status(200)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json))
                .unwrap_or_else(|_| {
                    gateway_error(codes::BACKEND_ERROR, "marshal response failed", trace_id)
                }),
            Err(e) => gateway_error(
                codes::BACKEND_ERROR,
                &format!("marshal response failed: {}", e),
                trace_id,
            ),
        }
    }

    /// Get or dial the channel for a backend address
    async fn channel(&self, address: &str) -> Result<Channel, GatewayError> {
        if let Some(channel) = self.channels.read().await.get(address) {
            return Ok(channel.clone());
        }

        let mut channels = self.channels.write().await;
        if let Some(channel) = channels.get(address) {
            return Ok(channel.clone());
        }

        let endpoint = Channel::from_shared(format!("http://{}", address))
            .map_err(|e| GatewayError::Transcoding(format!("invalid address {}: {}", address, e)))?
            .connect_timeout(self.cfg.connect_timeout());
        let channel = endpoint
            .connect()
            .await
            .map_err(|e| GatewayError::Transcoding(format!("dial {}: {}", address, e)))?;

        channels.insert(address.to_string(), channel.clone());
        Ok(channel)
    }

    /// Resolve a method descriptor, consulting the reflection cache first.
    ///
    /// A cached descriptor that no longer knows the method is dropped and
    /// fetched again before failing.
    async fn resolve_method(
        &self,
        channel: &Channel,
        address: &str,
        service: &str,
        method_name: &str,
    ) -> Result<MethodDescriptor, GatewayError> {
        let cache_key = format!("{}|{}", address, service);

        {
            let descriptors = self.descriptors.read().await;
            if let Some(cached) = descriptors.get(&cache_key) {
                if cached.cached_at.elapsed() < self.cfg.reflection_cache_ttl() {
                    if let Some(method) = find_method(&cached.pool, &cached.service, method_name) {
                        return Ok(method);
                    }
                    // stale schema: fall through to a fresh fetch
                    warn!("method {} missing from cached schema of {}", method_name, service);
                }
            }
        }
        self.invalidate(address, service).await;

        let pool = fetch_descriptors(channel.clone(), service).await?;
        let method = find_method(&pool, service, method_name).ok_or_else(|| {
            GatewayError::Transcoding(format!(
                "method {} not found in service {}",
                method_name, service
            ))
        })?;

        self.descriptors.write().await.insert(
            cache_key,
            CachedService {
                pool,
                service: service.to_string(),
                cached_at: Instant::now(),
            },
        );
        Ok(method)
    }

    async fn invalidate(&self, address: &str, service: &str) {
        self.descriptors
            .write()
            .await
            .remove(&format!("{}|{}", address, service));
    }

    /// Unary call bounded by the configured request timeout
    async fn invoke(
        &self,
        channel: Channel,
        method: &MethodDescriptor,
        service: &str,
        request: tonic::Request<DynamicMessage>,
    ) -> Result<DynamicMessage, InvokeError> {
        let path = http::uri::PathAndQuery::from_str(&format!("/{}/{}", service, method.name()))
            .map_err(|e| InvokeError::Transport(e.to_string()))?;
        let codec = DynamicCodec::new(method.clone());

        let mut grpc = tonic::client::Grpc::new(channel);
        let call = async move {
            grpc.ready()
                .await
                .map_err(|e| InvokeError::Transport(e.to_string()))?;
            grpc.unary(request, path, codec)
                .await
                .map_err(InvokeError::Status)
        };

        match tokio::time::timeout(self.cfg.request_timeout(), call).await {
            Ok(result) => result.map(|response| response.into_inner()),
            Err(_) => Err(InvokeError::Timeout),
        }
    }

    /// Drop all dialed channels
    pub async fn close(&self) {
        self.channels.write().await.clear();
        self.descriptors.write().await.clear();
    }
}

enum InvokeError {
    Timeout,
    Status(Status),
    Transport(String),
}

fn find_method(
    pool: &DescriptorPool,
    service: &str,
    method_name: &str,
) -> Option<MethodDescriptor> {
    let service = pool
        .services()
        .find(|candidate| candidate.full_name() == service)?;
    let found = service.methods().find(|method| method.name() == method_name);
    found
}

/// Fetch the file descriptors containing `service` over the reflection
/// protocol and assemble them into a descriptor pool.
async fn fetch_descriptors(channel: Channel, service: &str) -> Result<DescriptorPool, GatewayError> {
    let mut client = ServerReflectionClient::new(channel);

    let request = ServerReflectionRequest {
        host: String::new(),
        message_request: Some(MessageRequest::FileContainingSymbol(service.to_string())),
    };
    let mut stream = client
        .server_reflection_info(tokio_stream::once(request))
        .await
        .map_err(|e| GatewayError::Transcoding(format!("reflection call: {}", e)))?
        .into_inner();

    let mut files = Vec::new();
    while let Some(response) = stream
        .message()
        .await
        .map_err(|e| GatewayError::Transcoding(format!("reflection stream: {}", e)))?
    {
        match response.message_response {
            Some(MessageResponse::FileDescriptorResponse(descriptors)) => {
                for bytes in descriptors.file_descriptor_proto {
                    let file = FileDescriptorProto::decode(bytes.as_slice()).map_err(|e| {
                        GatewayError::Transcoding(format!("decode file descriptor: {}", e))
                    })?;
                    files.push(file);
                }
            }
            Some(MessageResponse::ErrorResponse(error)) => {
                return Err(GatewayError::Transcoding(format!(
                    "reflection resolve {}: {} ({})",
                    service, error.error_message, error.error_code
                )));
            }
            _ => {}
        }
    }

    DescriptorPool::from_file_descriptor_set(FileDescriptorSet { file: files })
        .map_err(|e| GatewayError::Transcoding(format!("assemble descriptor pool: {}", e)))
}

/// Map a gRPC status to the HTTP response `{code, message}`
fn status_response(status: &Status) -> Response<Body> {
    let http_status = grpc_code_to_http(status.code());
    let body = serde_json::json!({
        "code": status.code() as i32,
        "message": status.message(),
    });

    Response::builder()
        .status(http_status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap_or_else(|_| {
            Response::builder()
                .status(500)
                .body(Body::from("internal error"))
                .expect("static response")
        })
}

/// gRPC status code to HTTP status mapping
pub fn grpc_code_to_http(code: tonic::Code) -> u16 {
    match code {
        tonic::Code::Ok => 200,
        tonic::Code::InvalidArgument => 400,
        tonic::Code::Unauthenticated => 401,
        tonic::Code::PermissionDenied => 403,
        tonic::Code::NotFound => 404,
        tonic::Code::AlreadyExists => 409,
        tonic::Code::ResourceExhausted => 429,
        tonic::Code::Unimplemented => 501,
        tonic::Code::Unavailable => 503,
        tonic::Code::DeadlineExceeded => 504,
        _ => 500,
    }
}

/// Codec encoding and decoding [`DynamicMessage`]s for one method
#[derive(Clone)]
struct DynamicCodec {
    method: MethodDescriptor,
}

impl DynamicCodec {
    fn new(method: MethodDescriptor) -> Self {
        Self { method }
    }
}

impl Codec for DynamicCodec {
    type Encode = DynamicMessage;
    type Decode = DynamicMessage;
    type Encoder = DynamicEncoder;
    type Decoder = DynamicDecoder;

    fn encoder(&mut self) -> Self::Encoder {
        DynamicEncoder
    }

    fn decoder(&mut self) -> Self::Decoder {
        DynamicDecoder {
            descriptor: self.method.output(),
        }
    }
}

struct DynamicEncoder;

impl tonic::codec::Encoder for DynamicEncoder {
    type Item = DynamicMessage;
    type Error = Status;

    fn encode(&mut self, item: Self::Item, dst: &mut EncodeBuf<'_>) -> Result<(), Self::Error> {
        item.encode(dst)
            .map_err(|e| Status::internal(format!("encode request: {}", e)))
    }
}

struct DynamicDecoder {
    descriptor: prost_reflect::MessageDescriptor,
}

impl tonic::codec::Decoder for DynamicDecoder {
    type Item = DynamicMessage;
    type Error = Status;

    fn decode(&mut self, src: &mut DecodeBuf<'_>) -> Result<Option<Self::Item>, Self::Error> {
        let message = DynamicMessage::decode(self.descriptor.clone(), src)
            .map_err(|e| Status::internal(format!("decode response: {}", e)))?;
        Ok(Some(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_map_per_table() {
        assert_eq!(grpc_code_to_http(tonic::Code::Ok), 200);
        assert_eq!(grpc_code_to_http(tonic::Code::InvalidArgument), 400);
        assert_eq!(grpc_code_to_http(tonic::Code::Unauthenticated), 401);
        assert_eq!(grpc_code_to_http(tonic::Code::PermissionDenied), 403);
        assert_eq!(grpc_code_to_http(tonic::Code::NotFound), 404);
        assert_eq!(grpc_code_to_http(tonic::Code::AlreadyExists), 409);
        assert_eq!(grpc_code_to_http(tonic::Code::ResourceExhausted), 429);
        assert_eq!(grpc_code_to_http(tonic::Code::Unimplemented), 501);
        assert_eq!(grpc_code_to_http(tonic::Code::Unavailable), 503);
        assert_eq!(grpc_code_to_http(tonic::Code::DeadlineExceeded), 504);
        assert_eq!(grpc_code_to_http(tonic::Code::Internal), 500);
        assert_eq!(grpc_code_to_http(tonic::Code::Unknown), 500);
    }

    #[test]
    fn method_paths_split_on_last_slash() {
        let path = "user-service.v1.Greeter/Greet";
        let (service, method) = path.rsplit_once('/').unwrap();
        assert_eq!(service, "user-service.v1.Greeter");
        assert_eq!(method, "Greet");
    }
}
