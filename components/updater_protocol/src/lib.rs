//! Wire protocol spoken between the OS updater and its observers
//!
//! Observers send plain-text [`Command`]s and receive JSON [`Envelope`]s.

mod error;
mod protocol;

pub use error::ProtocolError;
pub use protocol::{
    Command, Envelope, MessageType, Payload, ProgressEvent, SizePayload, StatePayload, Status,
    UpgradeSize,
};
