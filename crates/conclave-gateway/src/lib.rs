//! REST and WebSocket gateway for Conclave.

pub mod error;
pub mod middleware;
pub mod routes;
pub mod server;
pub mod stream;

pub use error::{ApiError, ApiResult};
pub use middleware::AuthConfig;
pub use server::{AppState, GatewayServer};
