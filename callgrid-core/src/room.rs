//! A call room bound to one engine routing context.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

use crate::engine::MediaRouter;
use crate::error::{Error, Result};
use crate::peer::Peer;
use crate::types::{PeerId, RoomId};

/// A room holds its peers and the routing context they share. The routing
/// context is created from exactly one worker and lives as long as the room.
pub struct Room {
    pub id: RoomId,
    router: Arc<dyn MediaRouter>,
    peers: RwLock<HashMap<PeerId, Arc<Peer>>>,
    closed: AtomicBool,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl Room {
    pub(crate) fn new(id: RoomId, router: Arc<dyn MediaRouter>) -> Self {
        Self {
            id,
            router,
            peers: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
            created_at: chrono::Utc::now(),
        }
    }

    #[must_use]
    pub fn router(&self) -> &Arc<dyn MediaRouter> {
        &self.router
    }

    /// Idempotent create-or-return of a peer within this room.
    pub async fn get_or_create_peer(&self, peer_id: PeerId, display_name: String) -> Arc<Peer> {
        let mut peers = self.peers.write().await;
        if let Some(peer) = peers.get(&peer_id) {
            return Arc::clone(peer);
        }
        let peer = Arc::new(Peer::new(peer_id.clone(), display_name));
        peers.insert(peer_id, Arc::clone(&peer));
        peer
    }

    pub async fn peer(&self, peer_id: &PeerId) -> Result<Arc<Peer>> {
        self.peers
            .read()
            .await
            .get(peer_id)
            .cloned()
            .ok_or_else(|| Error::PeerNotFound(peer_id.clone()))
    }

    pub async fn contains_peer(&self, peer_id: &PeerId) -> bool {
        self.peers.read().await.contains_key(peer_id)
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.peers.read().await.is_empty()
    }

    /// Snapshot of all peers.
    pub async fn peers(&self) -> Vec<Arc<Peer>> {
        self.peers.read().await.values().cloned().collect()
    }

    /// Snapshot of all peers except one, the usual notification audience.
    pub async fn peers_except(&self, exclude: &PeerId) -> Vec<Arc<Peer>> {
        self.peers
            .read()
            .await
            .values()
            .filter(|peer| &peer.id != exclude)
            .cloned()
            .collect()
    }

    /// Close the peer and detach it from the room. Returns the detached peer
    /// (None when it had already left) and whether the room is now empty,
    /// decided under the same lock so a racing join is not miscounted.
    pub async fn close_peer(&self, peer_id: &PeerId) -> (Option<Arc<Peer>>, bool) {
        let (removed, now_empty) = {
            let mut peers = self.peers.write().await;
            let removed = peers.remove(peer_id);
            (removed, peers.is_empty())
        };
        if let Some(peer) = &removed {
            peer.close();
        }
        (removed, now_empty)
    }

    /// Cascade close: every peer first, then the routing context, so the
    /// engine never issues callbacks against a released context. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let peers: Vec<_> = self.peers.write().await.drain().map(|(_, p)| p).collect();
        for peer in &peers {
            peer.close();
        }
        self.router.close();
        info!(room_id = %self.id, peer_count = peers.len(), "room closed");
    }
}
