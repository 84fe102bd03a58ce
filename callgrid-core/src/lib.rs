//! CallGrid media-plane orchestration.
//!
//! Manages the lifecycle and topology of multi-party calls — who is in which
//! room, which transports/producers/consumers each participant owns — while
//! delegating packet routing to an external media engine consumed through
//! the narrow [`engine`] interface.
//!
//! ## Architecture
//!
//! - **[`WorkerPool`]**: owns the engine workers, assigns one per new room
//!   round-robin
//! - **[`RoomRegistry`]**: lazy, idempotent room creation and teardown
//! - **[`Room`]**: one call session bound to one routing context
//! - **[`Peer`]**: one participant's transports, producers and consumers
//!
//! Destroying a room transitively closes all contained peers, and destroying
//! a peer transitively closes everything it owns; no orphaned resources
//! remain in the engine afterwards.

pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod peer;
pub mod pool;
pub mod registry;
pub mod room;
mod singleflight;
pub mod types;

pub use config::{Config, EngineConfig, LoggingConfig, SignalConfig};
pub use error::{Error, Result};
pub use peer::Peer;
pub use pool::WorkerPool;
pub use registry::RoomRegistry;
pub use room::Room;
pub use types::{ConsumerId, PeerId, ProducerId, RoomId, TransportId, UserId};
