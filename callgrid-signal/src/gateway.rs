//! Session gateway: the signaling protocol state machine.
//!
//! Validates preconditions, drives the room/peer registries, performs
//! media-plane operations through the engine interface, and emits
//! notifications to the other peers in the room via presence lookups.
//! Notifications are sent only after registry state reflects the change, so
//! a notified peer never observes state older than the event.

use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

use callgrid_core::config::SignalConfig;
use callgrid_core::engine::{MediaKind, MediaTransport, TransportDirection};
use callgrid_core::error::{Error, Result};
use callgrid_core::peer::Peer;
use callgrid_core::registry::RoomRegistry;
use callgrid_core::room::Room;
use callgrid_core::types::{ConsumerId, PeerId, ProducerId, RoomId, TransportId, UserId};

use crate::presence::PresenceTracker;
use crate::protocol::{
    ClientRequest, ConsumeResponse, CreateRoomResponse, JoinRoomResponse, OutboundFrame,
    ParticipantInfo, ProduceResponse, ProducerInfo, ServerEvent, TransportParams,
};

/// Fire-and-forget sink for call history, implemented by an external
/// persistence service. Failures there must never affect call flow.
pub trait CallLogSink: Send + Sync {
    fn call_created(&self, room_id: &RoomId, caller_id: &UserId);
    fn peer_joined(&self, room_id: &RoomId, peer_id: &PeerId);
    fn peer_left(&self, room_id: &RoomId, peer_id: &PeerId);
}

pub struct SessionGateway {
    registry: Arc<RoomRegistry>,
    presence: Arc<PresenceTracker>,
    /// Which (room, peer) pairs each connection joined, for disconnect
    /// cleanup.
    memberships: DashMap<String, Vec<(RoomId, PeerId)>>,
    call_log: Option<Arc<dyn CallLogSink>>,
    max_peers_per_room: usize,
}

impl SessionGateway {
    #[must_use]
    pub fn new(
        registry: Arc<RoomRegistry>,
        presence: Arc<PresenceTracker>,
        config: &SignalConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            presence,
            memberships: DashMap::new(),
            call_log: None,
            max_peers_per_room: config.max_peers_per_room,
        })
    }

    #[must_use]
    pub fn with_call_log(
        registry: Arc<RoomRegistry>,
        presence: Arc<PresenceTracker>,
        config: &SignalConfig,
        call_log: Arc<dyn CallLogSink>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            presence,
            memberships: DashMap::new(),
            call_log: Some(call_log),
            max_peers_per_room: config.max_peers_per_room,
        })
    }

    /// Dispatch one protocol request. Every error is recovered by the caller
    /// into an `{error}` response frame.
    pub async fn handle(&self, connection_id: &str, request: ClientRequest) -> Result<Value> {
        match request {
            ClientRequest::CreateRoom {
                room_id,
                caller_id,
                target_ids,
                is_video,
                metadata,
            } => to_value(
                self.create_room(room_id, caller_id, target_ids, is_video, metadata)
                    .await?,
            ),
            ClientRequest::JoinRoom {
                room_id,
                peer_id,
                display_name,
            } => to_value(
                self.join_room(connection_id, room_id, peer_id, display_name)
                    .await?,
            ),
            ClientRequest::ConnectTransport {
                room_id,
                peer_id,
                transport_id,
                connection_parameters,
            } => {
                self.connect_transport(&room_id, &peer_id, &transport_id, connection_parameters)
                    .await?;
                Ok(Value::Null)
            }
            ClientRequest::Produce {
                room_id,
                peer_id,
                transport_id,
                kind,
                media_parameters,
            } => to_value(
                self.produce(&room_id, &peer_id, &transport_id, kind, media_parameters)
                    .await?,
            ),
            ClientRequest::GetProducers { room_id, peer_id } => {
                to_value(self.get_producers(&room_id, &peer_id).await?)
            }
            ClientRequest::Consume {
                room_id,
                peer_id,
                producer_id,
                receive_capabilities,
            } => to_value(
                self.consume(&room_id, &peer_id, &producer_id, receive_capabilities)
                    .await?,
            ),
            ClientRequest::ResumeConsumer {
                room_id,
                peer_id,
                consumer_id,
            } => {
                self.resume_consumer(&room_id, &peer_id, &consumer_id).await?;
                Ok(Value::Null)
            }
            ClientRequest::LeaveRoom { room_id, peer_id } => {
                self.leave_room(connection_id, &room_id, &peer_id).await?;
                Ok(Value::Null)
            }
        }
    }

    /// Create (or reuse) the room and ring the targets. An existing room is
    /// reused even for a different caller; multi-initiator rooms are
    /// allowed.
    pub async fn create_room(
        &self,
        room_id: RoomId,
        caller_id: UserId,
        target_ids: Vec<UserId>,
        is_video: bool,
        metadata: Value,
    ) -> Result<CreateRoomResponse> {
        if self.presence.resolve(&caller_id).is_none() {
            return Err(Error::CallerNotFound(caller_id));
        }
        let room = self.registry.get_or_create_room(&room_id).await?;
        let participants = participant_list(&room).await;

        let event = ServerEvent::IncomingCall {
            room_id: room_id.clone(),
            caller_id: caller_id.clone(),
            is_video,
            participants: participants.clone(),
            metadata,
        };
        let mut notified = Vec::new();
        for target in &target_ids {
            if target == &caller_id {
                continue;
            }
            match self.presence.resolve(target) {
                Some(handle) => {
                    if handle.send(OutboundFrame::Event(event.clone())) {
                        notified.push(target.clone());
                    }
                }
                None => debug!(user_id = %target, "call target offline, skipped"),
            }
        }
        info!(
            room_id = %room_id,
            caller_id = %caller_id,
            targets = target_ids.len(),
            notified = notified.len(),
            "call created"
        );
        if let Some(log) = &self.call_log {
            log.call_created(&room_id, &caller_id);
        }

        Ok(CreateRoomResponse {
            room_id,
            participants,
            notified,
        })
    }

    /// Join an existing room: registers the peer, provisions one send and
    /// one recv transport, and tells the other members.
    pub async fn join_room(
        &self,
        connection_id: &str,
        room_id: RoomId,
        peer_id: PeerId,
        display_name: String,
    ) -> Result<JoinRoomResponse> {
        let room = self.registry.get_room(&room_id)?;
        if self.max_peers_per_room > 0
            && !room.contains_peer(&peer_id).await
            && room.peer_count().await >= self.max_peers_per_room
        {
            return Err(Error::RoomFull(room_id));
        }

        let peer = room
            .get_or_create_peer(peer_id.clone(), display_name.clone())
            .await;
        let send = self
            .ensure_transport(&room, &peer, TransportDirection::Send)
            .await?;
        let recv = self
            .ensure_transport(&room, &peer, TransportDirection::Recv)
            .await?;

        self.record_membership(connection_id, &room_id, &peer_id);

        let others = room.peers_except(&peer_id).await;
        let event = ServerEvent::PeerJoined {
            room_id: room_id.clone(),
            peer_id: peer_id.clone(),
            display_name,
        };
        for other in &others {
            self.notify_peer(&other.id, event.clone());
        }
        info!(
            room_id = %room_id,
            peer_id = %peer_id,
            peer_count = others.len() + 1,
            "peer joined"
        );
        if let Some(log) = &self.call_log {
            log.peer_joined(&room_id, &peer_id);
        }

        Ok(JoinRoomResponse {
            routing_capabilities: room.router().capabilities(),
            send_transport: transport_params(&send),
            recv_transport: transport_params(&recv),
            peers: others
                .iter()
                .map(|peer| ParticipantInfo {
                    peer_id: peer.id.clone(),
                    display_name: peer.display_name.clone(),
                })
                .collect(),
        })
    }

    /// Forward the client's connection parameters to complete the transport
    /// handshake.
    pub async fn connect_transport(
        &self,
        room_id: &RoomId,
        peer_id: &PeerId,
        transport_id: &TransportId,
        connection_parameters: Value,
    ) -> Result<()> {
        let room = self.registry.get_room(room_id)?;
        let peer = room.peer(peer_id).await?;
        let transport = peer.transport(transport_id)?;
        transport.connect(connection_parameters).await?;
        debug!(room_id = %room_id, peer_id = %peer_id, transport_id = %transport_id, "transport connected");
        Ok(())
    }

    /// Publish media on the peer's send transport and announce the producer
    /// to every other member. The origin never hears about its own producer.
    pub async fn produce(
        &self,
        room_id: &RoomId,
        peer_id: &PeerId,
        transport_id: &TransportId,
        kind: MediaKind,
        media_parameters: Value,
    ) -> Result<ProduceResponse> {
        let room = self.registry.get_room(room_id)?;
        let peer = room.peer(peer_id).await?;
        let transport = peer.transport(transport_id)?;
        // Only a send transport with this id counts as owned for producing.
        if transport.direction() != TransportDirection::Send {
            return Err(Error::TransportNotFound(transport_id.clone()));
        }

        let producer = transport.produce(kind, media_parameters).await?;
        let producer_id = producer.id();
        let weak_peer = Arc::downgrade(&peer);
        let removed_id = producer_id.clone();
        producer.on_transport_close(Box::new(move || {
            if let Some(peer) = weak_peer.upgrade() {
                peer.remove_producer(&removed_id);
            }
        }));
        peer.add_producer(Arc::clone(&producer));

        let event = ServerEvent::NewProducer {
            room_id: room_id.clone(),
            peer_id: peer_id.clone(),
            producer_id: producer_id.clone(),
            kind,
        };
        for other in room.peers_except(peer_id).await {
            self.notify_peer(&other.id, event.clone());
        }
        info!(
            room_id = %room_id,
            peer_id = %peer_id,
            producer_id = %producer_id,
            kind = ?kind,
            "producer created"
        );

        Ok(ProduceResponse { producer_id })
    }

    /// Producers owned by every member except the caller; what a fresh
    /// joiner consumes.
    pub async fn get_producers(
        &self,
        room_id: &RoomId,
        peer_id: &PeerId,
    ) -> Result<Vec<ProducerInfo>> {
        let room = self.registry.get_room(room_id)?;
        // The caller must be a member to query the room.
        room.peer(peer_id).await?;

        let mut producers = Vec::new();
        for other in room.peers_except(peer_id).await {
            for producer in other.producers() {
                producers.push(ProducerInfo {
                    producer_id: producer.id(),
                    peer_id: other.id.clone(),
                    kind: producer.kind(),
                });
            }
        }
        Ok(producers)
    }

    /// Create a consumer on the peer's recv transport, bound to another
    /// member's producer. Consumers start paused until the client resumes
    /// them, so no media flows before the renderer is ready.
    pub async fn consume(
        &self,
        room_id: &RoomId,
        peer_id: &PeerId,
        producer_id: &ProducerId,
        receive_capabilities: Value,
    ) -> Result<ConsumeResponse> {
        let room = self.registry.get_room(room_id)?;
        let peer = room.peer(peer_id).await?;

        // The producer must still be owned by another live member.
        let mut found = false;
        for other in room.peers_except(peer_id).await {
            if other.producer(producer_id).is_ok() {
                found = true;
                break;
            }
        }
        if !found {
            return Err(Error::ProducerNotFound(producer_id.clone()));
        }
        if !room.router().can_consume(producer_id, &receive_capabilities) {
            return Err(Error::CannotConsume(producer_id.clone()));
        }

        let transport = peer.transport_of(TransportDirection::Recv)?;
        let consumer = transport.consume(producer_id, receive_capabilities).await?;
        let consumer_id = consumer.id();

        // Producer closing invalidates this consumer: drop it from the peer
        // and tell the owner exactly once. Suppressed when the owner is
        // already being torn down.
        let weak_peer = Arc::downgrade(&peer);
        let presence = Arc::clone(&self.presence);
        let closed_room = room_id.clone();
        let closed_consumer = consumer_id.clone();
        let closed_producer = producer_id.clone();
        let owner = peer_id.clone();
        consumer.on_producer_close(Box::new(move || {
            let Some(peer) = weak_peer.upgrade() else {
                return;
            };
            if peer.is_closed() {
                return;
            }
            if let Ok(consumer) = peer.consumer(&closed_consumer) {
                consumer.close();
            }
            if peer.remove_consumer(&closed_consumer) {
                if let Some(handle) = presence.resolve(&owner.as_user()) {
                    handle.send(OutboundFrame::Event(ServerEvent::ProducerClosed {
                        room_id: closed_room,
                        consumer_id: closed_consumer,
                        producer_id: closed_producer,
                    }));
                }
            }
        }));
        let weak_peer = Arc::downgrade(&peer);
        let removed_id = consumer_id.clone();
        consumer.on_transport_close(Box::new(move || {
            if let Some(peer) = weak_peer.upgrade() {
                peer.remove_consumer(&removed_id);
            }
        }));
        peer.add_consumer(Arc::clone(&consumer));

        debug!(
            room_id = %room_id,
            peer_id = %peer_id,
            producer_id = %producer_id,
            consumer_id = %consumer_id,
            "consumer created paused"
        );

        Ok(ConsumeResponse {
            consumer_id,
            producer_id: producer_id.clone(),
            kind: consumer.kind(),
            consumer_parameters: consumer.params(),
        })
    }

    /// Unpause a consumer once the client-side renderer is ready.
    pub async fn resume_consumer(
        &self,
        room_id: &RoomId,
        peer_id: &PeerId,
        consumer_id: &ConsumerId,
    ) -> Result<()> {
        let room = self.registry.get_room(room_id)?;
        let peer = room.peer(peer_id).await?;
        let consumer = peer.consumer(consumer_id)?;
        consumer.resume().await?;
        debug!(room_id = %room_id, peer_id = %peer_id, consumer_id = %consumer_id, "consumer resumed");
        Ok(())
    }

    /// Remove the peer and its resources; close the room when it empties.
    /// Safe to call more than once — disconnect races with explicit leave.
    pub async fn leave_room(
        &self,
        connection_id: &str,
        room_id: &RoomId,
        peer_id: &PeerId,
    ) -> Result<()> {
        let Ok(room) = self.registry.get_room(room_id) else {
            return Ok(());
        };
        let (removed, now_empty) = room.close_peer(peer_id).await;

        if removed.is_some() {
            let event = ServerEvent::PeerLeft {
                room_id: room_id.clone(),
                peer_id: peer_id.clone(),
            };
            for other in room.peers().await {
                self.notify_peer(&other.id, event.clone());
            }
            info!(room_id = %room_id, peer_id = %peer_id, "peer left");
            if let Some(log) = &self.call_log {
                log.peer_left(room_id, peer_id);
            }
        }
        if now_empty {
            self.registry.close_room(room_id).await;
        }
        self.forget_membership(connection_id, room_id, peer_id);
        Ok(())
    }

    /// Transport-level disconnect: replay leave for every membership this
    /// connection holds, then drop the presence entry.
    pub async fn disconnect(&self, connection_id: &str) {
        if let Some((_, memberships)) = self.memberships.remove(connection_id) {
            for (room_id, peer_id) in memberships {
                if let Err(error) = self.leave_room(connection_id, &room_id, &peer_id).await {
                    warn!(
                        connection_id = %connection_id,
                        room_id = %room_id,
                        peer_id = %peer_id,
                        error = %error,
                        "disconnect cleanup failed for room"
                    );
                }
            }
        }
        self.presence.set_offline(connection_id);
        info!(connection_id = %connection_id, "connection cleaned up");
    }

    async fn ensure_transport(
        &self,
        room: &Arc<Room>,
        peer: &Arc<Peer>,
        direction: TransportDirection,
    ) -> Result<Arc<dyn MediaTransport>> {
        if let Ok(existing) = peer.transport_of(direction) {
            return Ok(existing);
        }
        let transport = room.router().create_transport(direction).await?;
        let transport_id = transport.id();
        let weak_peer = Arc::downgrade(peer);
        let removed_id = transport_id.clone();
        // Engine-originated teardown runs the same removal as explicit
        // close.
        transport.on_close(Box::new(move || {
            if let Some(peer) = weak_peer.upgrade() {
                if peer.remove_transport(&removed_id) {
                    debug!(transport_id = %removed_id, "transport removed after engine close");
                }
            }
        }));
        peer.add_transport(Arc::clone(&transport));
        Ok(transport)
    }

    fn record_membership(&self, connection_id: &str, room_id: &RoomId, peer_id: &PeerId) {
        let mut entries = self.memberships.entry(connection_id.to_string()).or_default();
        let pair = (room_id.clone(), peer_id.clone());
        if !entries.contains(&pair) {
            entries.push(pair);
        }
    }

    fn forget_membership(&self, connection_id: &str, room_id: &RoomId, peer_id: &PeerId) {
        if let Some(mut entries) = self.memberships.get_mut(connection_id) {
            entries.retain(|(r, p)| !(r == room_id && p == peer_id));
        }
    }

    fn notify_peer(&self, peer_id: &PeerId, event: ServerEvent) {
        if let Some(handle) = self.presence.resolve(&peer_id.as_user()) {
            handle.send(OutboundFrame::Event(event));
        }
    }
}

async fn participant_list(room: &Arc<Room>) -> Vec<ParticipantInfo> {
    room.peers()
        .await
        .iter()
        .map(|peer| ParticipantInfo {
            peer_id: peer.id.clone(),
            display_name: peer.display_name.clone(),
        })
        .collect()
}

fn transport_params(transport: &Arc<dyn MediaTransport>) -> TransportParams {
    TransportParams {
        transport_id: transport.id(),
        direction: transport.direction(),
        connect_params: transport.connect_params(),
    }
}

fn to_value<T: Serialize>(value: T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| Error::Engine(format!("response encoding failed: {e}")))
}
