//! Core abstractions for room session lifecycle management.
//!
//! This crate provides the fundamental building blocks:
//! - `Session` records and the `SessionStore` trait
//! - `LivenessPolicy` - Heartbeat cadence, kill threshold, recovery hysteresis
//! - `Settings` - Layered configuration
//! - `Clock` - Injectable time source

pub mod clock;
pub mod config;
pub mod policy;
pub mod traits;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, Settings};
pub use policy::LivenessPolicy;
pub use traits::{Session, SessionId, SessionStatus, SessionStore, StorageError, Timestamp};
