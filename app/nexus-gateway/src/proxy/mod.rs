//! Backend proxying: resolver pool, HTTP reverse proxy, gRPC transcoder

pub mod grpc;
pub mod http;
pub mod pool;

pub use grpc::GrpcTranscoder;
pub use http::HttpProxy;
pub use pool::{picker_factory, PickerFactory, ResolverPool};
