//! HTTP read surface

mod server;

pub use server::{build_router, start_server, ApiState, RateLimiter};
