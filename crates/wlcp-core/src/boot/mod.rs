//! Device bring-up: boot sequencing and firmware image loading.

pub mod loader;
pub mod sequencer;

use thiserror::Error;

use crate::bus::BusError;
use crate::nvs::NvsError;
use crate::protocol::CommandError;

#[derive(Error, Debug)]
pub enum BootError {
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Calibration data error: {0}")]
    Nvs(#[from] NvsError),

    #[error("Unsupported chip: identity 0x{id:08X}")]
    UnsupportedChip { id: u32 },

    #[error("Soft reset did not complete within {polls} polls")]
    ResetTimeout { polls: u32 },

    #[error("Top register 0x{addr:08X} handshake did not complete within {polls} polls")]
    TopRegTimeout { addr: u32, polls: u32 },

    #[error("Firmware did not signal init-complete within {polls} polls")]
    InitCompleteTimeout { polls: u32 },

    #[error("Firmware image length {len} is not word aligned")]
    UnalignedImage { len: usize },

    #[error("Static information readback failed: {0}")]
    StaticInfo(#[from] CommandError),

    #[error("Completion arrived for an idle state machine")]
    UnexpectedCompletion,
}

pub use loader::{ImageLoader, LoadOutcome};
pub use sequencer::{BootAttrs, BootSequencer};
