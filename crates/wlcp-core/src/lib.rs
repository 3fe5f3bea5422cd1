//! WLCP-Core: control-plane engine for a wireless network coprocessor.
//!
//! This crate drives a WLAN coprocessor reached over a windowed SPI/SDIO-style
//! bus: cold boot, firmware download, ordered configuration push, event
//! dispatch, and the scan service.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: Register map, command encoding, event record parsing
//! - **Bus**: Windowed transaction abstraction (platform glue, mock)
//! - **Partition**: Address-window tables the bus maps onto device space
//! - **Boot**: Cold-boot sequencer and firmware image loader
//! - **Config**: Host-side configuration mirror and ordered sequencer
//! - **Mailbox**: Ping-pong event mailbox dispatcher
//! - **Scan**: Scan service state machine with watchdog escalation
//! - **Events**: Observer pattern for UI decoupling
//! - **Engine**: High-level orchestrator
//!
//! # Example
//!
//! ```no_run
//! use wlcp_core::bus::MockBus;
//! use wlcp_core::engine::{Engine, EngineConfig};
//!
//! let bus = MockBus::new();
//! let mut engine = Engine::new(bus, EngineConfig::default());
//!
//! engine.boot(None).expect("boot failed");
//! ```

pub mod boot;
pub mod bus;
pub mod config;
pub mod engine;
pub mod events;
pub mod mailbox;
pub mod nvs;
pub mod partition;
pub mod protocol;
pub mod scan;

// Re-exports for convenience
pub use boot::{BootAttrs, BootError, BootSequencer, ImageLoader, LoadOutcome};
pub use bus::{Bus, BusError, BusStatus, Completion, MockBus, OpStatus, Transaction, TxnOwner};
pub use config::{ConfigError, ConfigSequencer, ConfigStore, KeyMaterial, KeyRing};
pub use engine::{Engine, EngineConfig, EngineError};
pub use events::{EngineEvent, EngineObserver, EnginePhase, NullObserver, TracingObserver};
pub use mailbox::{EventMailbox, EventSink, MailboxError};
pub use partition::{PartitionTable, PartitionWindow, WindowKind};
pub use protocol::{CommandId, DeviceInfo, EventId, EventRecord};
pub use scan::{
    LinkState, PowerSave, ScanError, ScanOutcome, ScanRequest, ScanServiceSm, ScanStatus, Watchdog,
};
