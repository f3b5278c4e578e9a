//! Session lifecycle for rooms: one active session per room, kept alive by
//! heartbeats and reclaimed when its connection goes silent.
//!
//! Provides:
//! - `SessionManager` - Create, heartbeat, close and monitor sessions
//! - `SessionCreator` - Atomic get-or-create with stale reclaim
//! - `HealthMonitor` - Heartbeat hysteresis and recovery tracking
//! - `GhostReaper` - Scheduled sweep of silent sessions
//! - Storage implementations (memory, SQLite)

pub mod creator;
pub mod error;
pub mod health;
pub mod heartbeat;
pub mod manager;
pub mod reaper;
pub mod storage;

pub use creator::{RetryPolicy, SessionCreator};
pub use error::SessionError;
pub use health::{HealthMonitor, HealthState};
pub use heartbeat::{Beat, HeartbeatExit, beat, run_heartbeat, spawn_heartbeat};
pub use manager::SessionManager;
pub use reaper::{GhostReaper, spawn_reaper};
