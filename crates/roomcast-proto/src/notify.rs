//! Server-to-client notification set.

use crate::command::ListName;
use crate::error::WireError;
use crate::message::DeliveredMessage;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// A server-initiated notification. No reply is expected.
///
/// Each variant maps to a wire-level event `name` plus an ordered argument
/// list, mirroring the command side of the protocol. Serializable so
/// cluster instances can relay notifications to each other verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Notification {
    LoginConfirmed { user: String, auth_data: Value },
    LoginRejected { reason: WireError, raw: bool },
    RoomMessage { room: String, message: DeliveredMessage },
    DirectMessage { message: DeliveredMessage },
    DirectMessageEcho { to: String, message: DeliveredMessage },
    RoomUserJoined { room: String, user: String },
    RoomUserLeft { room: String, user: String },
    RoomJoinedEcho { room: String, socket: String, njoined: usize },
    RoomLeftEcho { room: String, socket: String, njoined: usize },
    RoomAccessRemoved { room: String },
    RoomAccessListAdded { room: String, list: ListName, users: Vec<String> },
    RoomAccessListRemoved { room: String, list: ListName, users: Vec<String> },
    RoomModeChanged { room: String, mode: bool },
    SocketConnectEcho { socket: String, nconnected: usize },
    SocketDisconnectEcho { socket: String, nconnected: usize },
    SelfBroadcast { message: DeliveredMessage },
}

impl Notification {
    /// The wire-level event name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::LoginConfirmed { .. } => "loginConfirmed",
            Self::LoginRejected { .. } => "loginRejected",
            Self::RoomMessage { .. } => "roomMessage",
            Self::DirectMessage { .. } => "directMessage",
            Self::DirectMessageEcho { .. } => "directMessageEcho",
            Self::RoomUserJoined { .. } => "roomUserJoined",
            Self::RoomUserLeft { .. } => "roomUserLeft",
            Self::RoomJoinedEcho { .. } => "roomJoinedEcho",
            Self::RoomLeftEcho { .. } => "roomLeftEcho",
            Self::RoomAccessRemoved { .. } => "roomAccessRemoved",
            Self::RoomAccessListAdded { .. } => "roomAccessListAdded",
            Self::RoomAccessListRemoved { .. } => "roomAccessListRemoved",
            Self::RoomModeChanged { .. } => "roomModeChanged",
            Self::SocketConnectEcho { .. } => "socketConnectEcho",
            Self::SocketDisconnectEcho { .. } => "socketDisconnectEcho",
            Self::SelfBroadcast { .. } => "selfBroadcast",
        }
    }

    /// The ordered wire arguments for this notification.
    pub fn args(&self) -> Vec<Value> {
        match self {
            Self::LoginConfirmed { user, auth_data } => vec![json!(user), auth_data.clone()],
            Self::LoginRejected { reason, raw } => vec![reason.encode(*raw)],
            Self::RoomMessage { room, message } => vec![json!(room), json!(message)],
            Self::DirectMessage { message } => vec![json!(message)],
            Self::DirectMessageEcho { to, message } => vec![json!(to), json!(message)],
            Self::RoomUserJoined { room, user } | Self::RoomUserLeft { room, user } => {
                vec![json!(room), json!(user)]
            }
            Self::RoomJoinedEcho { room, socket, njoined }
            | Self::RoomLeftEcho { room, socket, njoined } => {
                vec![json!(room), json!(socket), json!(njoined)]
            }
            Self::RoomAccessRemoved { room } => vec![json!(room)],
            Self::RoomAccessListAdded { room, list, users }
            | Self::RoomAccessListRemoved { room, list, users } => {
                vec![json!(room), json!(list.as_str()), json!(users)]
            }
            Self::RoomModeChanged { room, mode } => vec![json!(room), json!(mode)],
            Self::SocketConnectEcho { socket, nconnected }
            | Self::SocketDisconnectEcho { socket, nconnected } => {
                vec![json!(socket), json!(nconnected)]
            }
            Self::SelfBroadcast { message } => vec![json!(message)],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessagePayload;

    #[test]
    fn echo_notifications_carry_counts() {
        let n = Notification::SocketDisconnectEcho { socket: "s2".into(), nconnected: 1 };
        assert_eq!(n.name(), "socketDisconnectEcho");
        assert_eq!(n.args(), vec![json!("s2"), json!(1)]);
    }

    #[test]
    fn room_message_args_flatten_payload() {
        let n = Notification::RoomMessage {
            room: "lobby".into(),
            message: DeliveredMessage {
                id: Some(3),
                author: "alice".into(),
                timestamp: 1,
                payload: MessagePayload::text("hi"),
            },
        };
        let args = n.args();
        assert_eq!(args[0], json!("lobby"));
        assert_eq!(args[1]["id"], 3);
        assert_eq!(args[1]["textMessage"], "hi");
    }
}
