use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Events sent over the WebSocket gateway.
///
/// These are notification-only: they carry identifiers, never message
/// content. Clients re-fetch the affected conversation over the REST API on
/// receipt, so the push path can never diverge from the read path
/// (decryption, reply resolution, reaction joins all happen in one place).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayEvent {
    /// Server confirms successful identification.
    Ready { user_id: Uuid, username: String },

    /// Full presence snapshot, broadcast to everyone on any presence change.
    OnlineUsers { user_ids: Vec<Uuid> },

    /// A new direct message is waiting; re-fetch the conversation.
    MessageReceive { from: Uuid },

    /// A new group message is waiting; re-fetch the group.
    GroupMessageReceive { group_id: Uuid, from: Uuid },

    /// A peer started typing. Clients auto-expire the indicator after 3s
    /// if no explicit StopTyping arrives.
    Typing { from: Uuid },

    /// A peer stopped typing.
    StopTyping { from: Uuid },

    /// A reaction was toggled on a message; re-fetch its summary.
    ReactionUpdate { message_id: Uuid },

    /// A message was edited.
    MessageEdit { message_id: Uuid, from: Uuid },

    /// A message was deleted.
    MessageDelete { message_id: Uuid, from: Uuid },

    /// A file attachment arrived; re-fetch the conversation.
    FileReceived { from: Uuid },
}

/// Commands sent FROM client TO server over WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayCommand {
    /// Authenticate the WebSocket connection and register presence.
    Identify { token: String },

    /// Subscribe this connection to group rooms. Sent on connect and on
    /// reconnect; the server re-checks membership for every id.
    JoinGroups { group_ids: Vec<Uuid> },

    /// Indicate typing to a direct-chat peer.
    Typing { to: Uuid },

    /// Explicitly stop the typing indicator.
    StopTyping { to: Uuid },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_wire_format_round_trips() {
        let cmd = GatewayCommand::JoinGroups {
            group_ids: vec![Uuid::new_v4()],
        };
        let json = serde_json::to_string(&cmd).unwrap();
        assert!(json.contains(r#""type":"JoinGroups""#));
        let back: GatewayCommand = serde_json::from_str(&json).unwrap();
        match back {
            GatewayCommand::JoinGroups { group_ids } => assert_eq!(group_ids.len(), 1),
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn events_never_carry_content() {
        // Structural check that the fan-out payload stays identifier-only.
        let event = GatewayEvent::MessageReceive { from: Uuid::nil() };
        let json = serde_json::to_string(&event).unwrap();
        assert!(!json.contains("content"));
        assert!(!json.contains("ciphertext"));
    }
}
