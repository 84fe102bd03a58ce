//! Abstract interface to the external media engine.
//!
//! The engine owns codec negotiation and packet routing; this layer only
//! drives lifecycle. Engine payloads (ICE/DTLS parameters, RTP capabilities,
//! media parameters) are carried as opaque JSON so the boundary stays narrow.
//!
//! Close handlers registered at creation time are the single cleanup path:
//! engine-originated teardown (a transport dropping, a producer's owner
//! vanishing) runs the same removal code as an explicit leave.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::error::Result;
use crate::types::{ConsumerId, ProducerId, TransportId};

#[cfg(any(test, feature = "test-utils"))]
pub mod mock;

/// Direction a transport carries media in, relative to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportDirection {
    Send,
    Recv,
}

/// Kind of media a producer publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

/// Settings for spawning one engine worker.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
    pub log_level: String,
}

/// Callback invoked at most once when an engine-side entity closes.
pub type CloseHandler = Box<dyn FnOnce() + Send + 'static>;

/// Callback invoked at most once when a worker process dies, with its pid.
pub type DiedHandler = Box<dyn FnOnce(u32) + Send + 'static>;

/// Entry point: spawns engine workers.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    async fn create_worker(&self, settings: WorkerSettings) -> Result<Arc<dyn MediaWorker>>;
}

/// One engine execution context, typically a subprocess.
#[async_trait]
pub trait MediaWorker: Send + Sync {
    /// Engine-side process identifier.
    fn pid(&self) -> u32;

    fn is_alive(&self) -> bool;

    /// Registers the death observer. Worker death is fatal to every room
    /// bound to it; there is no in-place restart.
    fn on_died(&self, handler: DiedHandler);

    /// Creates a routing context for one room.
    async fn create_router(&self, codecs: Value) -> Result<Arc<dyn MediaRouter>>;
}

/// Routing context bound to one room; lives exactly as long as the room.
#[async_trait]
pub trait MediaRouter: Send + Sync {
    fn id(&self) -> String;

    /// RTP capabilities clients need before consuming.
    fn capabilities(&self) -> Value;

    async fn create_transport(
        &self,
        direction: TransportDirection,
    ) -> Result<Arc<dyn MediaTransport>>;

    /// Whether a consumer with the given capabilities can receive the
    /// producer's media.
    fn can_consume(&self, producer_id: &ProducerId, capabilities: &Value) -> bool;

    fn close(&self);
}

/// A media connection endpoint owned by one peer.
#[async_trait]
pub trait MediaTransport: Send + Sync {
    fn id(&self) -> TransportId;

    fn direction(&self) -> TransportDirection;

    /// Parameters the client needs to establish its side (ICE/DTLS).
    fn connect_params(&self) -> Value;

    /// Completes the connection handshake with client-supplied parameters.
    async fn connect(&self, params: Value) -> Result<()>;

    async fn produce(&self, kind: MediaKind, params: Value) -> Result<Arc<dyn MediaProducer>>;

    /// Creates a consumer bound to the producer. Consumers are created
    /// paused; callers resume them once the client-side renderer is ready.
    async fn consume(
        &self,
        producer_id: &ProducerId,
        capabilities: Value,
    ) -> Result<Arc<dyn MediaConsumer>>;

    /// Fires when the underlying connection is torn down engine-side.
    fn on_close(&self, handler: CloseHandler);

    fn close(&self);
}

/// A media source published into a room.
pub trait MediaProducer: Send + Sync {
    fn id(&self) -> ProducerId;

    fn kind(&self) -> MediaKind;

    /// Fires when the producer's transport closes underneath it.
    fn on_transport_close(&self, handler: CloseHandler);

    fn close(&self);
}

/// A media sink referencing exactly one producer.
#[async_trait]
pub trait MediaConsumer: Send + Sync {
    fn id(&self) -> ConsumerId;

    fn producer_id(&self) -> ProducerId;

    fn kind(&self) -> MediaKind;

    /// Parameters the client needs to start rendering this consumer.
    fn params(&self) -> Value;

    fn is_paused(&self) -> bool;

    async fn resume(&self) -> Result<()>;

    /// Fires when the referenced producer closes; the consumer is already
    /// invalid engine-side by then.
    fn on_producer_close(&self, handler: CloseHandler);

    /// Fires when the consumer's own transport closes underneath it.
    fn on_transport_close(&self, handler: CloseHandler);

    fn close(&self);
}
