use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;

use securechat_types::events::GatewayEvent;

/// One live WebSocket connection.
struct ConnectionEntry {
    user_id: Uuid,
    tx: mpsc::UnboundedSender<GatewayEvent>,
    /// Group rooms this connection has joined. Recomputed by the client on
    /// every reconnect via the JoinGroups command.
    rooms: HashSet<Uuid>,
}

/// Presence registry and fan-out router.
///
/// Tracks which users currently have live connections (multi-device: a user
/// is online iff at least one connection is registered) and delivers
/// notification-only events to the right set of connections. Events travel
/// over per-connection mpsc channels drained by each socket's send task,
/// keeping dispatch decoupled from transport.
///
/// Constructed once in main and handed around by clone. Presence is scoped
/// to this process; a multi-instance deployment would swap in a shared
/// external registry behind the same surface.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<RwLock<HashMap<Uuid, ConnectionEntry>>>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a live connection for `user_id`. Returns the connection id
    /// and the receiving end of its event channel, then broadcasts the
    /// updated presence snapshot to everyone.
    pub async fn register(&self, user_id: Uuid) -> (Uuid, mpsc::UnboundedReceiver<GatewayEvent>) {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();

        self.inner.write().await.insert(
            conn_id,
            ConnectionEntry {
                user_id,
                tx,
                rooms: HashSet::new(),
            },
        );

        self.broadcast_presence().await;
        (conn_id, rx)
    }

    /// Remove a connection and broadcast the updated presence snapshot.
    pub async fn unregister(&self, conn_id: Uuid) {
        self.inner.write().await.remove(&conn_id);
        self.broadcast_presence().await;
    }

    /// Replace the room subscriptions of one connection. Membership is
    /// verified by the caller before this is invoked; the dispatcher only
    /// does targeting, never authorization.
    pub async fn join_rooms(&self, conn_id: Uuid, group_ids: Vec<Uuid>) {
        if let Some(entry) = self.inner.write().await.get_mut(&conn_id) {
            entry.rooms = group_ids.into_iter().collect();
        }
    }

    /// Send a targeted event to every connection of one user.
    pub async fn send_to_user(&self, user_id: Uuid, event: GatewayEvent) {
        let connections = self.inner.read().await;
        for entry in connections.values() {
            if entry.user_id == user_id {
                let _ = entry.tx.send(event.clone());
            }
        }
    }

    /// Send an event to every connection that joined the given group room.
    pub async fn send_to_group(&self, group_id: Uuid, event: GatewayEvent) {
        let connections = self.inner.read().await;
        for entry in connections.values() {
            if entry.rooms.contains(&group_id) {
                let _ = entry.tx.send(event.clone());
            }
        }
    }

    /// Users with at least one live connection.
    pub async fn online_users(&self) -> Vec<Uuid> {
        let connections = self.inner.read().await;
        let mut users: Vec<Uuid> = connections
            .values()
            .map(|e| e.user_id)
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        users.sort();
        users
    }

    /// Push the full online-user-id set to every connection. Coarse but
    /// simple: no incremental deltas to keep consistent.
    async fn broadcast_presence(&self) {
        let user_ids = self.online_users().await;
        let event = GatewayEvent::OnlineUsers { user_ids };

        let connections = self.inner.read().await;
        for entry in connections.values() {
            let _ = entry.tx.send(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(rx: &mut mpsc::UnboundedReceiver<GatewayEvent>) -> Vec<GatewayEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn multi_device_user_is_online_once() {
        let dispatcher = Dispatcher::new();
        let user = Uuid::new_v4();

        let (_c1, _rx1) = dispatcher.register(user).await;
        let (_c2, _rx2) = dispatcher.register(user).await;

        assert_eq!(dispatcher.online_users().await, vec![user]);
    }

    #[tokio::test]
    async fn targeted_events_reach_every_device() {
        let dispatcher = Dispatcher::new();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();

        let (_c1, mut rx1) = dispatcher.register(alice).await;
        let (_c2, mut rx2) = dispatcher.register(alice).await;
        let (_c3, mut rx3) = dispatcher.register(bob).await;
        drain(&mut rx1);
        drain(&mut rx2);
        drain(&mut rx3);

        dispatcher
            .send_to_user(alice, GatewayEvent::MessageReceive { from: bob })
            .await;

        assert_eq!(drain(&mut rx1).len(), 1);
        assert_eq!(drain(&mut rx2).len(), 1);
        assert!(drain(&mut rx3).is_empty());
    }

    #[tokio::test]
    async fn group_events_only_reach_joined_rooms() {
        let dispatcher = Dispatcher::new();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let group = Uuid::new_v4();

        let (c1, mut rx1) = dispatcher.register(alice).await;
        let (_c2, mut rx2) = dispatcher.register(bob).await;
        dispatcher.join_rooms(c1, vec![group]).await;
        drain(&mut rx1);
        drain(&mut rx2);

        dispatcher
            .send_to_group(group, GatewayEvent::GroupMessageReceive { group_id: group, from: bob })
            .await;

        assert_eq!(drain(&mut rx1).len(), 1);
        assert!(drain(&mut rx2).is_empty());
    }

    #[tokio::test]
    async fn disconnect_broadcasts_updated_presence() {
        let dispatcher = Dispatcher::new();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();

        let (c1, _rx1) = dispatcher.register(alice).await;
        let (_c2, mut rx2) = dispatcher.register(bob).await;
        drain(&mut rx2);

        dispatcher.unregister(c1).await;

        let events = drain(&mut rx2);
        match events.last() {
            Some(GatewayEvent::OnlineUsers { user_ids }) => {
                assert_eq!(user_ids, &vec![bob]);
            }
            other => panic!("expected presence snapshot, got {:?}", other),
        }
    }
}
