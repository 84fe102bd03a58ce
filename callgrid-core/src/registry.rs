//! Process-wide room registry.
//!
//! Rooms are created lazily on first reference and torn down when their last
//! peer leaves. Lookups go through a `DashMap`, so operations on different
//! rooms never contend; creation for one id is additionally funneled through
//! singleflight to guarantee a single routing context per room.

use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::pool::WorkerPool;
use crate::room::Room;
use crate::singleflight::SingleFlight;
use crate::types::RoomId;

pub struct RoomRegistry {
    rooms: DashMap<RoomId, Arc<Room>>,
    pool: Arc<WorkerPool>,
    /// Codec configuration handed to the engine for every new routing
    /// context.
    codecs: Value,
    create_flight: SingleFlight<RoomId, Arc<Room>, Error>,
}

impl RoomRegistry {
    #[must_use]
    pub fn new(pool: Arc<WorkerPool>, codecs: Value) -> Arc<Self> {
        Arc::new(Self {
            rooms: DashMap::new(),
            pool,
            codecs,
            create_flight: SingleFlight::new(),
        })
    }

    /// Return the room, creating it on a round-robin worker if absent.
    /// Concurrent calls for one id share a single routing-context creation.
    pub async fn get_or_create_room(&self, room_id: &RoomId) -> Result<Arc<Room>> {
        if let Some(room) = self.rooms.get(room_id) {
            debug!(room_id = %room_id, "room already exists");
            return Ok(Arc::clone(room.value()));
        }

        let key = room_id.clone();
        self.create_flight
            .run(
                key.clone(),
                async {
                    // A previous leader may have finished between the fast
                    // path and entering the flight.
                    if let Some(room) = self.rooms.get(&key) {
                        return Ok(Arc::clone(room.value()));
                    }
                    let worker = self.pool.next_worker()?;
                    let router = worker.create_router(self.codecs.clone()).await?;
                    let room = Arc::new(Room::new(key.clone(), router));
                    self.rooms.insert(key.clone(), Arc::clone(&room));
                    info!(
                        room_id = %key,
                        worker_pid = worker.pid(),
                        total_rooms = self.rooms.len(),
                        "room created"
                    );
                    Ok(room)
                },
                || Error::Engine("room creation interrupted".to_string()),
            )
            .await
    }

    /// Return the room without creating it.
    pub fn get_room(&self, room_id: &RoomId) -> Result<Arc<Room>> {
        self.rooms
            .get(room_id)
            .map(|room| Arc::clone(room.value()))
            .ok_or_else(|| Error::RoomNotFound(room_id.clone()))
    }

    /// Remove the room from the registry, then cascade-close it. A no-op for
    /// unknown ids. Removing first means late lookups see "not found"
    /// instead of a half-torn-down room.
    pub async fn close_room(&self, room_id: &RoomId) {
        if let Some((_, room)) = self.rooms.remove(room_id) {
            room.close().await;
            debug!(room_id = %room_id, remaining_rooms = self.rooms.len(), "room removed");
        }
    }

    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    #[must_use]
    pub fn room_ids(&self) -> Vec<RoomId> {
        self.rooms.iter().map(|entry| entry.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::engine::mock::MockMediaEngine;
    use crate::types::PeerId;
    use serde_json::json;

    async fn registry_with_workers(
        engine: &Arc<MockMediaEngine>,
        num_workers: usize,
    ) -> Arc<RoomRegistry> {
        let config = EngineConfig {
            num_workers,
            ..Default::default()
        };
        let pool =
            WorkerPool::spawn_with_fatal_handler(engine.as_ref(), &config, Box::new(|_| {}))
                .await
                .expect("spawn");
        RoomRegistry::new(pool, json!({}))
    }

    #[tokio::test]
    async fn test_get_or_create_is_idempotent() {
        let engine = MockMediaEngine::new();
        let registry = registry_with_workers(&engine, 1).await;

        let room_id = RoomId::from("r1");
        let first = registry.get_or_create_room(&room_id).await.expect("create");
        let second = registry.get_or_create_room(&room_id).await.expect("get");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.room_count(), 1);
        assert_eq!(engine.workers()[0].router_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_creation_yields_one_routing_context() {
        let engine = MockMediaEngine::new();
        let registry = registry_with_workers(&engine, 1).await;
        let room_id = RoomId::from("contested");

        let a = registry.get_or_create_room(&room_id);
        let b = registry.get_or_create_room(&room_id);
        let (a, b) = tokio::join!(a, b);
        assert!(Arc::ptr_eq(&a.expect("a"), &b.expect("b")));
        assert_eq!(engine.workers()[0].router_count(), 1);
    }

    #[tokio::test]
    async fn test_round_robin_room_assignment_is_fair() {
        let engine = MockMediaEngine::new();
        let registry = registry_with_workers(&engine, 3).await;

        for i in 0..8 {
            registry
                .get_or_create_room(&RoomId::from(format!("room-{i}")))
                .await
                .expect("create");
        }

        // 8 rooms over 3 workers: each worker gets ceil or floor of 8/3.
        for worker in engine.workers() {
            let count = worker.router_count();
            assert!((2..=3).contains(&count), "unbalanced assignment: {count}");
        }
    }

    #[tokio::test]
    async fn test_close_room_cascades_and_forgets() {
        let engine = MockMediaEngine::new();
        let registry = registry_with_workers(&engine, 1).await;
        let room_id = RoomId::from("r1");

        let room = registry.get_or_create_room(&room_id).await.expect("create");
        let peer = room
            .get_or_create_peer(PeerId::from("alice"), "Alice".to_string())
            .await;

        registry.close_room(&room_id).await;
        assert!(peer.is_closed());
        assert!(matches!(
            registry.get_room(&room_id),
            Err(Error::RoomNotFound(_))
        ));

        // Unknown room close is a no-op.
        registry.close_room(&RoomId::from("ghost")).await;
        assert_eq!(registry.room_count(), 0);
    }
}
