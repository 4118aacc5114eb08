#![forbid(unsafe_code)]

pub mod decode;
pub mod endpoints;
pub mod gateway;
pub mod pipeline;
pub mod secret;

#[cfg(test)]
mod gateway_tests;

pub use decode::{DecodeError, decode_message};
pub use endpoints::Api;
pub use gateway::{
	ApiError, CallOptions, DEFAULT_BASE_URL, DEFAULT_NOT_FOUND_COOLDOWN, DEFAULT_USER_AGENT, GatewayConfig, HttpRequest,
	HttpResponse, HttpTransport, Method, ReqwestTransport, RestGateway,
};
pub use pipeline::{DEFAULT_PIPELINE_URL, Pipeline, PipelineState, WsConnector, WsSink, WsStream, default_connector};
pub use secret::SecretString;
