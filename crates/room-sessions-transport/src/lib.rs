//! Transport layer for room sessions.
//!
//! Provides:
//! - Wire protocol (JSON request and response bodies)
//! - HTTP router over `SessionManager` (feature: http)

pub mod protocol;

#[cfg(feature = "http")]
pub mod http;

pub use protocol::{
    CloseSessionRequest, CloseSessionResponse, CreateSessionRequest, CreateSessionResponse,
    ErrorResponse, HeartbeatResponse, SweepResponse,
};
