//! Protocol types for the roomcast messaging backend.
//!
//! This crate defines the transport-agnostic protocol surface: the client
//! command set with its argument shapes, the server notification set, the
//! message envelope delivered to clients, and the wire encoding of errors.
//! It contains no engine logic; the `roomcast` crate consumes these types
//! and a transport implementation frames them.

mod command;
mod error;
mod message;
mod names;
mod notify;

pub use command::{Command, ListName, ParseError};
pub use error::WireError;
pub use message::{DeliveredMessage, MessagePayload};
pub use names::{valid_name, MAX_NAME_LEN};
pub use notify::Notification;
