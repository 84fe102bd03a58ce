use thiserror::Error;

use crate::types::{ConsumerId, PeerId, ProducerId, RoomId, TransportId, UserId};

/// Error taxonomy for call orchestration.
///
/// All variants except [`Error::WorkerDied`] are recovered at the gateway
/// boundary and surfaced to the caller as an `{error}` response. The enum is
/// `Clone` so a single room-creation failure can be shared across every
/// caller waiting on the same singleflight key.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("room not found: {0}")]
    RoomNotFound(RoomId),

    #[error("peer not found: {0}")]
    PeerNotFound(PeerId),

    #[error("transport not found: {0}")]
    TransportNotFound(TransportId),

    #[error("producer not found: {0}")]
    ProducerNotFound(ProducerId),

    #[error("cannot consume producer {0}")]
    CannotConsume(ProducerId),

    #[error("consumer not found: {0}")]
    ConsumerNotFound(ConsumerId),

    #[error("caller not online: {0}")]
    CallerNotFound(UserId),

    #[error("room at capacity: {0}")]
    RoomFull(RoomId),

    #[error("engine operation failed: {0}")]
    Engine(String),

    /// Fatal. Rooms bound to a dead worker are unrecoverable; the process
    /// exits after a grace delay instead of restarting the worker in place.
    #[error("media worker {0} died")]
    WorkerDied(u32),
}

pub type Result<T> = std::result::Result<T, Error>;
