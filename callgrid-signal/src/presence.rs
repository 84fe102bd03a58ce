//! Process-wide presence: user id → live connection handle.
//!
//! Presence has its own lifecycle, independent of rooms — a user can be
//! online without being in any call. Reconnecting replaces the previous
//! handle; a stale disconnect never evicts the newer session.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use callgrid_core::types::UserId;

use crate::protocol::{OutboundFrame, ServerEvent};

/// Sending half of one signaling connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub connection_id: String,
    sender: mpsc::UnboundedSender<OutboundFrame>,
}

impl ConnectionHandle {
    #[must_use]
    pub fn new(connection_id: String, sender: mpsc::UnboundedSender<OutboundFrame>) -> Self {
        Self {
            connection_id,
            sender,
        }
    }

    /// Best-effort delivery: a closed channel only means the client is gone
    /// and its disconnect cleanup is already on the way.
    pub fn send(&self, frame: OutboundFrame) -> bool {
        if self.sender.send(frame).is_err() {
            debug!(connection_id = %self.connection_id, "dropping frame for closed connection");
            return false;
        }
        true
    }
}

#[derive(Default)]
pub struct PresenceTracker {
    entries: DashMap<UserId, ConnectionHandle>,
}

impl PresenceTracker {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: DashMap::new(),
        })
    }

    /// Upsert: a reconnect replaces the previous session's handle.
    pub fn set_online(&self, user_id: UserId, handle: ConnectionHandle) {
        info!(
            user_id = %user_id,
            connection_id = %handle.connection_id,
            online_users = self.entries.len() + 1,
            "user online"
        );
        self.entries.insert(user_id, handle);
        self.broadcast_online_list();
    }

    /// Remove every entry bound to this connection. The scan is defensive
    /// against duplicates, and matching on the connection id means a user
    /// who already reconnected keeps their newer entry.
    pub fn set_offline(&self, connection_id: &str) {
        let stale: Vec<UserId> = self
            .entries
            .iter()
            .filter(|entry| entry.value().connection_id == connection_id)
            .map(|entry| entry.key().clone())
            .collect();
        if stale.is_empty() {
            return;
        }
        for user_id in stale {
            self.entries
                .remove_if(&user_id, |_, handle| handle.connection_id == connection_id);
            info!(user_id = %user_id, connection_id = %connection_id, "user offline");
        }
        self.broadcast_online_list();
    }

    #[must_use]
    pub fn resolve(&self, user_id: &UserId) -> Option<ConnectionHandle> {
        self.entries.get(user_id).map(|entry| entry.value().clone())
    }

    #[must_use]
    pub fn online_users(&self) -> Vec<UserId> {
        self.entries.iter().map(|entry| entry.key().clone()).collect()
    }

    #[must_use]
    pub fn user_count(&self) -> usize {
        self.entries.len()
    }

    /// Push the full online list to every connection. Runs on every
    /// online/offline change and on the heartbeat, bounding staleness.
    pub fn broadcast_online_list(&self) {
        let users = self.online_users();
        let event = ServerEvent::OnlineUsers { users };
        let mut sent = 0usize;
        for entry in self.entries.iter() {
            if entry.value().send(OutboundFrame::Event(event.clone())) {
                sent += 1;
            }
        }
        debug!(recipients = sent, "online list broadcast");
    }

    /// Periodic broadcast between change-driven pushes.
    pub fn spawn_heartbeat(self: &Arc<Self>, period: Duration) -> tokio::task::JoinHandle<()> {
        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The immediate first tick duplicates the set_online broadcast.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                tracker.broadcast_online_list();
            }
        })
    }
}

impl Drop for PresenceTracker {
    fn drop(&mut self) {
        if !self.entries.is_empty() {
            warn!(
                remaining = self.entries.len(),
                "presence tracker dropped with live entries"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::OutboundFrame;

    fn handle(connection_id: &str) -> (ConnectionHandle, mpsc::UnboundedReceiver<OutboundFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ConnectionHandle::new(connection_id.to_string(), tx), rx)
    }

    fn drain_events(rx: &mut mpsc::UnboundedReceiver<OutboundFrame>) -> Vec<OutboundFrame> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    #[tokio::test]
    async fn test_reconnect_overwrites_and_stale_offline_keeps_newer() {
        let tracker = PresenceTracker::new();
        let user = UserId::from("u1");
        let (h1, _rx1) = handle("conn-1");
        let (h2, _rx2) = handle("conn-2");

        tracker.set_online(user.clone(), h1);
        tracker.set_online(user.clone(), h2);
        // The old session's disconnect arrives late.
        tracker.set_offline("conn-1");

        let resolved = tracker.resolve(&user).expect("still online");
        assert_eq!(resolved.connection_id, "conn-2");

        tracker.set_offline("conn-2");
        assert!(tracker.resolve(&user).is_none());
        assert_eq!(tracker.user_count(), 0);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_connection() {
        let tracker = PresenceTracker::new();
        let (h1, mut rx1) = handle("conn-1");
        let (h2, mut rx2) = handle("conn-2");
        tracker.set_online(UserId::from("u1"), h1);
        tracker.set_online(UserId::from("u2"), h2);

        drain_events(&mut rx1);
        drain_events(&mut rx2);
        tracker.broadcast_online_list();

        for rx in [&mut rx1, &mut rx2] {
            let frames = drain_events(rx);
            assert_eq!(frames.len(), 1);
            match &frames[0] {
                OutboundFrame::Event(ServerEvent::OnlineUsers { users }) => {
                    assert_eq!(users.len(), 2);
                    assert!(users.contains(&UserId::from("u1")));
                    assert!(users.contains(&UserId::from("u2")));
                }
                other => panic!("unexpected frame: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_resolve_unknown_user_is_absent() {
        let tracker = PresenceTracker::new();
        assert!(tracker.resolve(&UserId::from("ghost")).is_none());
        // Offline for an unknown connection is a quiet no-op.
        tracker.set_offline("conn-x");
    }
}
