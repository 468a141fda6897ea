pub mod auth;
pub mod config;
pub mod error;
pub mod logging;
pub mod registry;
pub mod relay;
pub mod retrieval;
pub mod server;
pub mod transform;

pub use config::GatewayConfig;
pub use error::{GatewayError, GatewayResult};
pub use registry::{CancellationRegistry, RequestId};
pub use relay::{RelayRequest, RelayResponse, StreamRelay};
pub use retrieval::{merge, ScoredDocument};
pub use transform::BodyTransformer;
