//! Anthropic Messages API in front of OpenAI-compatible and Cloud Code upstreams.

pub mod adapters;
pub mod anthropic;
pub mod cache;
pub mod dispatcher;
pub mod error;
pub mod gateway;
pub mod openai;
pub mod retry;
pub mod schema;
pub mod server;
pub mod stream;
pub mod think;
pub mod transform;
pub mod upstream;

pub use error::GatewayError;
pub use gateway::{Gateway, GatewayStatus, MessagesReply};
pub use upstream::{Credential, CredentialResolver, Credentials, EndpointMode, UpstreamConfig};
