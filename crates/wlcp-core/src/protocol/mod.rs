//! Protocol layer: register map, command encoding, event records.

pub mod command;
pub mod constants;
pub mod event;

pub use command::{CommandError, CommandHeader, CommandId, DeviceInfo};
pub use event::{EventError, EventId, EventRecord};
