//! Client command set and argument parsing.

use crate::message::MessagePayload;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A room permission list name.
///
/// `Userlist` is the read-only membership view; it can be fetched with
/// `roomGetAccessList` but never mutated directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListName {
    Whitelist,
    Blacklist,
    Adminlist,
    Userlist,
}

impl ListName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Whitelist => "whitelist",
            Self::Blacklist => "blacklist",
            Self::Adminlist => "adminlist",
            Self::Userlist => "userlist",
        }
    }
}

impl fmt::Display for ListName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ListName {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "whitelist" => Ok(Self::Whitelist),
            "blacklist" => Ok(Self::Blacklist),
            "adminlist" => Ok(Self::Adminlist),
            "userlist" => Ok(Self::Userlist),
            other => Err(ParseError::BadArgument {
                index: 1,
                expected: "list name",
                got: other.to_string(),
            }),
        }
    }
}

/// Command parse failures.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseError {
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("expected {expected} arguments, got {got}")]
    WrongArity { expected: usize, got: usize },

    #[error("argument {index}: expected {expected}, got {got}")]
    BadArgument {
        index: usize,
        expected: &'static str,
        got: String,
    },
}

/// A parsed client command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    RoomJoin { room: String },
    RoomLeave { room: String },
    RoomMessage { room: String, message: MessagePayload },
    RoomHistoryGet { room: String, after_id: u64, limit: usize },
    RoomRecentHistory { room: String },
    RoomCreate { room: String, whitelist_only: bool },
    RoomDelete { room: String },
    RoomAddToList { room: String, list: ListName, users: Vec<String> },
    RoomRemoveFromList { room: String, list: ListName, users: Vec<String> },
    RoomGetAccessList { room: String, list: ListName },
    RoomSetWhitelistMode { room: String, mode: bool },
    DirectMessage { to: String, message: MessagePayload },
    DirectAddToList { list: ListName, users: Vec<String> },
    DirectRemoveFromList { list: ListName, users: Vec<String> },
    DirectGetAccessList { list: ListName },
    DirectSetWhitelistMode { mode: bool },
    ListOwnSockets,
    SelfBroadcast { message: MessagePayload },
}

impl Command {
    /// The wire-level event name for this command.
    pub fn name(&self) -> &'static str {
        match self {
            Self::RoomJoin { .. } => "roomJoin",
            Self::RoomLeave { .. } => "roomLeave",
            Self::RoomMessage { .. } => "roomMessage",
            Self::RoomHistoryGet { .. } => "roomHistoryGet",
            Self::RoomRecentHistory { .. } => "roomRecentHistory",
            Self::RoomCreate { .. } => "roomCreate",
            Self::RoomDelete { .. } => "roomDelete",
            Self::RoomAddToList { .. } => "roomAddToList",
            Self::RoomRemoveFromList { .. } => "roomRemoveFromList",
            Self::RoomGetAccessList { .. } => "roomGetAccessList",
            Self::RoomSetWhitelistMode { .. } => "roomSetWhitelistMode",
            Self::DirectMessage { .. } => "directMessage",
            Self::DirectAddToList { .. } => "directAddToList",
            Self::DirectRemoveFromList { .. } => "directRemoveFromList",
            Self::DirectGetAccessList { .. } => "directGetAccessList",
            Self::DirectSetWhitelistMode { .. } => "directSetWhitelistMode",
            Self::ListOwnSockets => "listOwnSockets",
            Self::SelfBroadcast { .. } => "selfBroadcast",
        }
    }

    /// Parse a `(name, args)` pair as received from the transport.
    pub fn parse(name: &str, args: &[Value]) -> Result<Self, ParseError> {
        match name {
            "roomJoin" => {
                arity(args, 1)?;
                Ok(Self::RoomJoin { room: str_arg(args, 0)? })
            }
            "roomLeave" => {
                arity(args, 1)?;
                Ok(Self::RoomLeave { room: str_arg(args, 0)? })
            }
            "roomMessage" => {
                arity(args, 2)?;
                Ok(Self::RoomMessage {
                    room: str_arg(args, 0)?,
                    message: payload_arg(args, 1)?,
                })
            }
            "roomHistoryGet" => {
                arity(args, 3)?;
                Ok(Self::RoomHistoryGet {
                    room: str_arg(args, 0)?,
                    after_id: uint_arg(args, 1)?,
                    limit: uint_arg(args, 2)? as usize,
                })
            }
            "roomRecentHistory" => {
                arity(args, 1)?;
                Ok(Self::RoomRecentHistory { room: str_arg(args, 0)? })
            }
            "roomCreate" => {
                arity(args, 2)?;
                Ok(Self::RoomCreate {
                    room: str_arg(args, 0)?,
                    whitelist_only: bool_arg(args, 1)?,
                })
            }
            "roomDelete" => {
                arity(args, 1)?;
                Ok(Self::RoomDelete { room: str_arg(args, 0)? })
            }
            "roomAddToList" => {
                arity(args, 3)?;
                Ok(Self::RoomAddToList {
                    room: str_arg(args, 0)?,
                    list: str_arg(args, 1)?.parse()?,
                    users: names_arg(args, 2)?,
                })
            }
            "roomRemoveFromList" => {
                arity(args, 3)?;
                Ok(Self::RoomRemoveFromList {
                    room: str_arg(args, 0)?,
                    list: str_arg(args, 1)?.parse()?,
                    users: names_arg(args, 2)?,
                })
            }
            "roomGetAccessList" => {
                arity(args, 2)?;
                Ok(Self::RoomGetAccessList {
                    room: str_arg(args, 0)?,
                    list: str_arg(args, 1)?.parse()?,
                })
            }
            "roomSetWhitelistMode" => {
                arity(args, 2)?;
                Ok(Self::RoomSetWhitelistMode {
                    room: str_arg(args, 0)?,
                    mode: bool_arg(args, 1)?,
                })
            }
            "directMessage" => {
                arity(args, 2)?;
                Ok(Self::DirectMessage {
                    to: str_arg(args, 0)?,
                    message: payload_arg(args, 1)?,
                })
            }
            "directAddToList" => {
                arity(args, 2)?;
                Ok(Self::DirectAddToList {
                    list: str_arg(args, 0)?.parse()?,
                    users: names_arg(args, 1)?,
                })
            }
            "directRemoveFromList" => {
                arity(args, 2)?;
                Ok(Self::DirectRemoveFromList {
                    list: str_arg(args, 0)?.parse()?,
                    users: names_arg(args, 1)?,
                })
            }
            "directGetAccessList" => {
                arity(args, 1)?;
                Ok(Self::DirectGetAccessList { list: str_arg(args, 0)?.parse()? })
            }
            "directSetWhitelistMode" => {
                arity(args, 1)?;
                Ok(Self::DirectSetWhitelistMode { mode: bool_arg(args, 0)? })
            }
            "listOwnSockets" => {
                arity(args, 0)?;
                Ok(Self::ListOwnSockets)
            }
            "selfBroadcast" => {
                arity(args, 1)?;
                Ok(Self::SelfBroadcast { message: payload_arg(args, 0)? })
            }
            other => Err(ParseError::UnknownCommand(other.to_string())),
        }
    }
}

fn arity(args: &[Value], expected: usize) -> Result<(), ParseError> {
    if args.len() == expected {
        Ok(())
    } else {
        Err(ParseError::WrongArity { expected, got: args.len() })
    }
}

fn str_arg(args: &[Value], index: usize) -> Result<String, ParseError> {
    match args.get(index) {
        Some(Value::String(s)) => Ok(s.clone()),
        other => Err(bad(index, "string", other)),
    }
}

fn bool_arg(args: &[Value], index: usize) -> Result<bool, ParseError> {
    match args.get(index) {
        Some(Value::Bool(b)) => Ok(*b),
        other => Err(bad(index, "boolean", other)),
    }
}

fn uint_arg(args: &[Value], index: usize) -> Result<u64, ParseError> {
    match args.get(index).and_then(Value::as_u64) {
        Some(n) => Ok(n),
        None => Err(bad(index, "unsigned integer", args.get(index))),
    }
}

fn names_arg(args: &[Value], index: usize) -> Result<Vec<String>, ParseError> {
    let list = match args.get(index) {
        Some(Value::Array(items)) => items,
        other => return Err(bad(index, "array of strings", other)),
    };
    list.iter()
        .map(|v| match v {
            Value::String(s) => Ok(s.clone()),
            other => Err(bad(index, "array of strings", Some(other))),
        })
        .collect()
}

fn payload_arg(args: &[Value], index: usize) -> Result<MessagePayload, ParseError> {
    let value = match args.get(index) {
        Some(v @ Value::Object(_)) => v.clone(),
        other => return Err(bad(index, "message object", other)),
    };
    serde_json::from_value(value).map_err(|e| ParseError::BadArgument {
        index,
        expected: "message object",
        got: e.to_string(),
    })
}

fn bad(index: usize, expected: &'static str, got: Option<&Value>) -> ParseError {
    ParseError::BadArgument {
        index,
        expected,
        got: got.map_or_else(|| "nothing".to_string(), |v| v.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_room_join() {
        let cmd = Command::parse("roomJoin", &[json!("lobby")]).unwrap();
        assert_eq!(cmd, Command::RoomJoin { room: "lobby".into() });
        assert_eq!(cmd.name(), "roomJoin");
    }

    #[test]
    fn parses_room_message() {
        let cmd =
            Command::parse("roomMessage", &[json!("lobby"), json!({"textMessage": "hi"})]).unwrap();
        match cmd {
            Command::RoomMessage { room, message } => {
                assert_eq!(room, "lobby");
                assert_eq!(message.text_message.as_deref(), Some("hi"));
            }
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn rejects_wrong_shape() {
        assert!(matches!(
            Command::parse("roomJoin", &[json!(42)]),
            Err(ParseError::BadArgument { index: 0, .. })
        ));
        assert!(matches!(
            Command::parse("roomHistoryGet", &[json!("lobby")]),
            Err(ParseError::WrongArity { expected: 3, got: 1 })
        ));
        assert!(matches!(
            Command::parse("noSuchCommand", &[]),
            Err(ParseError::UnknownCommand(_))
        ));
    }

    #[test]
    fn rejects_trailing_arguments() {
        assert!(matches!(
            Command::parse("roomJoin", &[json!("lobby"), json!("extra")]),
            Err(ParseError::WrongArity { expected: 1, got: 2 })
        ));
        assert!(matches!(
            Command::parse("roomDelete", &[json!("lobby"), json!(true)]),
            Err(ParseError::WrongArity { expected: 1, got: 2 })
        ));
        assert!(matches!(
            Command::parse(
                "roomMessage",
                &[json!("lobby"), json!({"textMessage": "hi"}), json!("extra")]
            ),
            Err(ParseError::WrongArity { expected: 2, got: 3 })
        ));
        assert!(matches!(
            Command::parse("selfBroadcast", &[json!({"textMessage": "hi"}), json!(1)]),
            Err(ParseError::WrongArity { expected: 1, got: 2 })
        ));
    }

    #[test]
    fn rejects_mutating_userlist_name_only_at_engine_level() {
        // Parsing accepts userlist; the engine rejects mutation of it.
        let cmd = Command::parse(
            "roomAddToList",
            &[json!("lobby"), json!("userlist"), json!(["bob"])],
        )
        .unwrap();
        assert!(matches!(cmd, Command::RoomAddToList { list: ListName::Userlist, .. }));
    }
}
