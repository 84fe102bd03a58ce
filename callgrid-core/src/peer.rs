//! A participant's presence and resources within one room.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::engine::{MediaConsumer, MediaProducer, MediaTransport, TransportDirection};
use crate::error::{Error, Result};
use crate::types::{ConsumerId, PeerId, ProducerId, TransportId};

/// One peer: owns its transports, producers and consumers exclusively.
/// Entity maps use `parking_lot` locks and are never held across an await.
pub struct Peer {
    pub id: PeerId,
    pub display_name: String,
    transports: RwLock<HashMap<TransportId, Arc<dyn MediaTransport>>>,
    producers: RwLock<HashMap<ProducerId, Arc<dyn MediaProducer>>>,
    consumers: RwLock<HashMap<ConsumerId, Arc<dyn MediaConsumer>>>,
    closed: AtomicBool,
}

impl Peer {
    pub(crate) fn new(id: PeerId, display_name: String) -> Self {
        Self {
            id,
            display_name,
            transports: RwLock::new(HashMap::new()),
            producers: RwLock::new(HashMap::new()),
            consumers: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn add_transport(&self, transport: Arc<dyn MediaTransport>) {
        self.transports.write().insert(transport.id(), transport);
    }

    pub fn transport(&self, transport_id: &TransportId) -> Result<Arc<dyn MediaTransport>> {
        self.transports
            .read()
            .get(transport_id)
            .cloned()
            .ok_or_else(|| Error::TransportNotFound(transport_id.clone()))
    }

    /// The peer's transport carrying media in the given direction.
    pub fn transport_of(&self, direction: TransportDirection) -> Result<Arc<dyn MediaTransport>> {
        self.transports
            .read()
            .values()
            .find(|t| t.direction() == direction)
            .cloned()
            .ok_or_else(|| Error::Engine(format!("peer {} has no {direction:?} transport", self.id)))
    }

    /// Event-driven removal; returns whether the transport was still
    /// registered so the caller can act exactly once.
    pub fn remove_transport(&self, transport_id: &TransportId) -> bool {
        self.transports.write().remove(transport_id).is_some()
    }

    pub fn add_producer(&self, producer: Arc<dyn MediaProducer>) {
        self.producers.write().insert(producer.id(), producer);
    }

    pub fn producer(&self, producer_id: &ProducerId) -> Result<Arc<dyn MediaProducer>> {
        self.producers
            .read()
            .get(producer_id)
            .cloned()
            .ok_or_else(|| Error::ProducerNotFound(producer_id.clone()))
    }

    pub fn remove_producer(&self, producer_id: &ProducerId) -> bool {
        self.producers.write().remove(producer_id).is_some()
    }

    /// Snapshot of the peer's producers.
    #[must_use]
    pub fn producers(&self) -> Vec<Arc<dyn MediaProducer>> {
        self.producers.read().values().cloned().collect()
    }

    pub fn add_consumer(&self, consumer: Arc<dyn MediaConsumer>) {
        self.consumers.write().insert(consumer.id(), consumer);
    }

    pub fn consumer(&self, consumer_id: &ConsumerId) -> Result<Arc<dyn MediaConsumer>> {
        self.consumers
            .read()
            .get(consumer_id)
            .cloned()
            .ok_or_else(|| Error::ConsumerNotFound(consumer_id.clone()))
    }

    pub fn remove_consumer(&self, consumer_id: &ConsumerId) -> bool {
        self.consumers.write().remove(consumer_id).is_some()
    }

    #[must_use]
    pub fn transport_count(&self) -> usize {
        self.transports.read().len()
    }

    #[must_use]
    pub fn producer_count(&self) -> usize {
        self.producers.read().len()
    }

    #[must_use]
    pub fn consumer_count(&self) -> usize {
        self.consumers.read().len()
    }

    /// Close everything this peer owns. Producers go first, then consumers,
    /// then transports: closing producers while their watchers' consumers
    /// are still registered lets other peers learn about the closure, and
    /// transports go last so the engine never emits producer-close against
    /// consumers this same teardown already removed. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let producers: Vec<_> = self.producers.write().drain().map(|(_, p)| p).collect();
        for producer in producers {
            producer.close();
        }
        let consumers: Vec<_> = self.consumers.write().drain().map(|(_, c)| c).collect();
        for consumer in consumers {
            consumer.close();
        }
        let transports: Vec<_> = self.transports.write().drain().map(|(_, t)| t).collect();
        for transport in transports {
            transport.close();
        }
        debug!(peer_id = %self.id, "peer closed");
    }
}
