//! Device configuration: host-side mirror, key ring, and the ordered
//! sequencer that pushes dirty values to the firmware.

pub mod keys;
pub mod sequencer;
pub mod store;

pub use keys::{CipherSuite, KeyMaterial, KeyRing, KeySlot};
pub use sequencer::{ConfigError, ConfigSequencer, JOIN_GATE_HANDLE};
pub use store::{ConfigStore, Slot};
