//! Engine event surface for UI decoupling.
//!
//! Allows a CLI or platform supervisor to follow the engine without tight
//! coupling to the control-plane logic.

use std::fmt;

use crate::scan::ScanOutcome;

/// Engine lifecycle phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnginePhase {
    /// Nothing done yet.
    Off,
    /// Cold-boot sequence running.
    Booting,
    /// Firmware image streaming to the device.
    LoadingFirmware,
    /// Configuration push in progress.
    Configuring,
    /// Firmware up, configuration in sync.
    Ready,
    /// Unrecoverable until the device is reset.
    Failed,
}

impl fmt::Display for EnginePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnginePhase::Off => write!(f, "Off"),
            EnginePhase::Booting => write!(f, "Booting"),
            EnginePhase::LoadingFirmware => write!(f, "Loading Firmware"),
            EnginePhase::Configuring => write!(f, "Configuring"),
            EnginePhase::Ready => write!(f, "Ready"),
            EnginePhase::Failed => write!(f, "Failed"),
        }
    }
}

/// Events emitted by the engine.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// Phase changed.
    PhaseChanged { from: EnginePhase, to: EnginePhase },
    /// The cold-boot sequence finished.
    BootComplete { chip_id: u32 },
    /// Firmware download progress: cumulative bytes written to the device.
    Progress { written: u64 },
    /// The firmware came up and reported its identity.
    FirmwareReady { mac: [u8; 6], fw_version: String },
    /// The firmware confirmed the join.
    Joined,
    /// The link dropped.
    Disconnected,
    /// A scan request reached a terminal state.
    ScanFinished { outcome: ScanOutcome },
    /// The engine wants the device reset and replayed.
    RecoveryNeeded { reason: String },
    /// Error occurred.
    Error { message: String },
}

/// Observer trait for receiving engine events.
///
/// Implement this in the embedding layer to receive updates.
pub trait EngineObserver {
    /// Called when an event occurs.
    fn on_event(&self, event: &EngineEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl EngineObserver for NullObserver {
    fn on_event(&self, _event: &EngineEvent) {
        // Do nothing
    }
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl EngineObserver for TracingObserver {
    fn on_event(&self, event: &EngineEvent) {
        match event {
            EngineEvent::PhaseChanged { from, to } => {
                tracing::info!(from = %from, to = %to, "Phase changed");
            }
            EngineEvent::BootComplete { chip_id } => {
                tracing::info!(chip_id = %format!("{:08X}", chip_id), "Boot complete");
            }
            EngineEvent::Progress { written } => {
                tracing::debug!(written, "Firmware download");
            }
            EngineEvent::FirmwareReady { mac, fw_version } => {
                let mac = mac
                    .iter()
                    .map(|b| format!("{b:02x}"))
                    .collect::<Vec<_>>()
                    .join(":");
                tracing::info!(%mac, version = %fw_version, "Firmware ready");
            }
            EngineEvent::Joined => {
                tracing::info!("Join confirmed");
            }
            EngineEvent::Disconnected => {
                tracing::warn!("Link lost");
            }
            EngineEvent::ScanFinished { outcome } => {
                tracing::info!(
                    tag = outcome.tag,
                    status = ?outcome.status,
                    results = outcome.result_count,
                    "Scan finished"
                );
            }
            EngineEvent::RecoveryNeeded { reason } => {
                tracing::error!("Recovery needed: {}", reason);
            }
            EngineEvent::Error { message } => {
                tracing::error!("Error: {}", message);
            }
        }
    }
}
