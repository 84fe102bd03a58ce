//! CallGrid signaling plane.
//!
//! Sits between the bidirectional signaling channel and the media-plane
//! orchestration in `callgrid-core`:
//!
//! - **[`SessionGateway`]**: the protocol state machine — validates
//!   preconditions, drives the registries, emits responses and
//!   peer-to-peer notifications
//! - **[`PresenceTracker`]**: process-wide user → connection mapping,
//!   independent of room state
//! - **[`server`]**: axum WebSocket endpoint carrying the RPC exchange
//! - **[`protocol`]**: request/response/event frame types

pub mod gateway;
pub mod presence;
pub mod protocol;
pub mod server;

pub use gateway::{CallLogSink, SessionGateway};
pub use presence::{ConnectionHandle, PresenceTracker};
pub use server::{router, AppState};
