//! Scan service state machine.
//!
//! Owns the lifecycle of one scan at a time: optional power-save entry,
//! issuing the scan command, arming a host-side watchdog sized from the
//! request, and cleaning up on completion, timeout, or device reset. The
//! firmware is trusted to run the scan itself; the watchdog exists because
//! a wedged firmware never sends the completion event.

use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::bus::{Bus, BusError, BusStatus, Completion, Transaction, TxnOwner};
use crate::protocol::command::{encode_command, CommandError, CommandId};
use crate::protocol::constants::{INTR_TRIG_CMD, REG_INTERRUPT_TRIG};
use crate::protocol::event::EventRecord;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Command error: {0}")]
    Command(#[from] CommandError),

    #[error("A scan is already in progress")]
    Busy,

    #[error("Command mailbox address not known yet")]
    NotReady,

    #[error("Scan request has no channels")]
    EmptyRequest,

    #[error("Power-save entry failed and the request requires it")]
    PowerSaveUnavailable,
}

/// Result of a power-save transition request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PsTransition {
    /// Transition finished synchronously.
    Done,
    /// Transition in progress; `on_ps_entered` will be called.
    Pending,
    /// The transition cannot be made right now.
    Failed,
}

/// Power-save control seam. The real implementation talks to the link
/// layer; tests script transitions.
pub trait PowerSave {
    fn request_enter(&mut self) -> PsTransition;
    fn request_exit(&mut self) -> PsTransition;
}

/// Power-save stub for platforms that keep the radio awake.
#[derive(Debug, Default)]
pub struct NoopPowerSave;

impl PowerSave for NoopPowerSave {
    fn request_enter(&mut self) -> PsTransition {
        PsTransition::Done
    }
    fn request_exit(&mut self) -> PsTransition {
        PsTransition::Done
    }
}

/// Host-side one-shot timer seam.
pub trait Watchdog {
    fn arm(&mut self, timeout: Duration);
    fn cancel(&mut self);
}

/// Watchdog stub that never fires.
#[derive(Debug, Default)]
pub struct NullWatchdog;

impl Watchdog for NullWatchdog {
    fn arm(&mut self, _timeout: Duration) {}
    fn cancel(&mut self) {}
}

/// How the request relates to power save.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PsPolicy {
    /// Scan without touching power save.
    #[default]
    None,
    /// Enter power save first; abort the scan if that fails.
    Require,
    /// Try to enter power save but scan anyway if it fails.
    BestEffort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanKind {
    Active,
    Passive,
    /// Channel visits scheduled against absolute device time (TSF).
    Scheduled,
}

/// One channel to visit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanChannel {
    pub channel: u8,
    pub dwell: Duration,
}

/// A scan request from the upper layer.
#[derive(Debug, Clone)]
pub struct ScanRequest {
    pub channels: Vec<ScanChannel>,
    pub kind: ScanKind,
    /// Triggered scans wait for medium-idle on each channel, which can
    /// stretch every dwell.
    pub triggered: bool,
    pub priority: u8,
    /// Echoed back in the completion event.
    pub tag: u8,
    pub ps_policy: PsPolicy,
}

/// Link facts the watchdog timeout depends on.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinkState {
    pub connected: bool,
    pub beacon_interval: Duration,
    pub dtim_period: u32,
    /// Whether the scan plan already covers the serving channel around
    /// DTIM beacons, making the extra listen allowance unnecessary.
    pub overlaps_dtim: bool,
}

/// Timeout tuning, owned by the engine configuration.
#[derive(Debug, Clone, Copy)]
pub struct ScanTunables {
    /// Fixed slack added to every watchdog timeout.
    pub guard_margin: Duration,
    /// Extra per-channel allowance for triggered scans.
    pub trigger_slack: Duration,
    /// Consecutive watchdog expiries before recovery is requested.
    pub max_consecutive_timeouts: u32,
}

impl Default for ScanTunables {
    fn default() -> Self {
        Self {
            guard_margin: Duration::from_millis(50),
            trigger_slack: Duration::from_millis(10),
            max_consecutive_timeouts: 3,
        }
    }
}

/// Why a scan ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanStatus {
    Completed,
    TimedOut,
    Aborted,
}

/// Terminal report for one scan request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanOutcome {
    pub tag: u8,
    pub status: ScanStatus,
    pub result_count: u8,
    pub attended_channels: u16,
    pub tsf_error: bool,
}

/// Notification handed up to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanNotice {
    pub outcome: ScanOutcome,
    /// The firmware has stopped responding to scans; a device reset is in
    /// order.
    pub recovery_needed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    Idle,
    AwaitingPsEntry,
    Scanning,
    Stopping,
}

enum CmdPhase {
    Idle,
    Payload(Vec<u8>),
    Trigger,
}

/// The scan service.
pub struct ScanServiceSm {
    state: ScanState,
    request: Option<ScanRequest>,
    link: LinkState,
    tunables: ScanTunables,
    cmd_addr: Option<u32>,
    phase: CmdPhase,
    consecutive_timeouts: u32,
    ps_entered: bool,
}

impl ScanServiceSm {
    pub fn new(tunables: ScanTunables) -> Self {
        Self {
            state: ScanState::Idle,
            request: None,
            link: LinkState::default(),
            tunables,
            cmd_addr: None,
            phase: CmdPhase::Idle,
            consecutive_timeouts: 0,
            ps_entered: false,
        }
    }

    pub fn set_cmd_address(&mut self, addr: u32) {
        self.cmd_addr = Some(addr);
    }

    pub fn state(&self) -> ScanState {
        self.state
    }

    pub fn consecutive_timeouts(&self) -> u32 {
        self.consecutive_timeouts
    }

    /// Watchdog timeout for a request: the sum of all dwells, stretched
    /// per channel for triggered scans, plus a fixed guard, plus one DTIM
    /// interval's worth of serving-channel listening when connected and
    /// the plan does not already overlap DTIM.
    pub fn compute_timeout(&self, request: &ScanRequest, link: &LinkState) -> Duration {
        let mut timeout: Duration = request.channels.iter().map(|c| c.dwell).sum();
        if request.triggered {
            timeout += self.tunables.trigger_slack * request.channels.len() as u32;
        }
        timeout += self.tunables.guard_margin;
        if link.connected && !link.overlaps_dtim {
            timeout += link.beacon_interval * link.dtim_period;
        }
        timeout
    }

    /// Start a scan. Fails if one is already in flight.
    pub fn start<B: Bus>(
        &mut self,
        bus: &mut B,
        ps: &mut dyn PowerSave,
        watchdog: &mut dyn Watchdog,
        request: ScanRequest,
        link: LinkState,
    ) -> Result<(), ScanError> {
        if self.state != ScanState::Idle {
            return Err(ScanError::Busy);
        }
        if self.cmd_addr.is_none() {
            return Err(ScanError::NotReady);
        }
        if request.channels.is_empty() {
            return Err(ScanError::EmptyRequest);
        }

        info!(
            tag = request.tag,
            channels = request.channels.len(),
            triggered = request.triggered,
            "scan requested"
        );
        self.link = link;
        self.request = Some(request);

        let policy = self.request.as_ref().map(|r| r.ps_policy).unwrap_or_default();
        match policy {
            PsPolicy::None => self.issue_scan(bus, watchdog),
            PsPolicy::Require | PsPolicy::BestEffort => match ps.request_enter() {
                PsTransition::Done => {
                    self.ps_entered = true;
                    self.issue_scan(bus, watchdog)
                }
                PsTransition::Pending => {
                    self.state = ScanState::AwaitingPsEntry;
                    Ok(())
                }
                PsTransition::Failed if policy == PsPolicy::BestEffort => {
                    debug!("power-save entry failed; scanning awake");
                    self.issue_scan(bus, watchdog)
                }
                PsTransition::Failed => {
                    self.request = None;
                    Err(ScanError::PowerSaveUnavailable)
                }
            },
        }
    }

    /// Deferred power-save entry finished.
    pub fn on_ps_entered<B: Bus>(
        &mut self,
        bus: &mut B,
        watchdog: &mut dyn Watchdog,
        success: bool,
    ) -> Result<Option<ScanNotice>, ScanError> {
        if self.state != ScanState::AwaitingPsEntry {
            return Ok(None);
        }
        let policy = self.request.as_ref().map(|r| r.ps_policy).unwrap_or_default();
        if success {
            self.ps_entered = true;
        } else if policy == PsPolicy::Require {
            warn!("power-save entry failed; scan aborted");
            let tag = self.request.take().map(|r| r.tag).unwrap_or(0);
            self.state = ScanState::Idle;
            return Ok(Some(ScanNotice {
                outcome: aborted_outcome(tag),
                recovery_needed: false,
            }));
        }
        self.issue_scan(bus, watchdog)?;
        Ok(None)
    }

    /// A scan-complete event arrived.
    ///
    /// From `Scanning` this is the organic path: it resets the timeout
    /// streak and reports the outcome. From `Stopping` (the stop command
    /// is on its way after a timeout or an explicit stop) the cleanup runs
    /// but nothing is reported again and the streak stands. A late event
    /// in `Idle` is ignored, which makes the timeout/completion race
    /// harmless.
    pub fn on_scan_complete(
        &mut self,
        ps: &mut dyn PowerSave,
        watchdog: &mut dyn Watchdog,
        record: &EventRecord,
    ) -> Result<Option<ScanNotice>, ScanError> {
        match self.state {
            ScanState::Scanning => {
                watchdog.cancel();
                self.consecutive_timeouts = 0;
                let notice = ScanNotice {
                    outcome: ScanOutcome {
                        tag: record.scan_tag,
                        status: ScanStatus::Completed,
                        result_count: record.scan_result_count,
                        attended_channels: record.attended_channels,
                        tsf_error: record.tsf_error,
                    },
                    recovery_needed: false,
                };
                info!(
                    tag = record.scan_tag,
                    results = record.scan_result_count,
                    "scan complete"
                );
                self.finish(ps);
                Ok(Some(notice))
            }
            ScanState::Stopping => {
                debug!(tag = record.scan_tag, "scan wound down after stop");
                self.finish(ps);
                Ok(None)
            }
            ScanState::Idle | ScanState::AwaitingPsEntry => Ok(None),
        }
    }

    /// The watchdog fired: force a stop and count the failure.
    pub fn on_timeout<B: Bus>(&mut self, bus: &mut B) -> Result<Option<ScanNotice>, ScanError> {
        if self.state != ScanState::Scanning {
            // Late timer; the scan already ended.
            return Ok(None);
        }
        self.consecutive_timeouts += 1;
        let tag = self.request.as_ref().map(|r| r.tag).unwrap_or(0);
        let recovery_needed = self.consecutive_timeouts >= self.tunables.max_consecutive_timeouts;
        warn!(
            tag,
            streak = self.consecutive_timeouts,
            recovery_needed,
            "scan watchdog expired; forcing stop"
        );

        self.send_cmd(bus, CommandId::ScanStop, &[tag, 0, 0, 0])?;
        self.state = ScanState::Stopping;

        Ok(Some(ScanNotice {
            outcome: ScanOutcome {
                tag,
                status: ScanStatus::TimedOut,
                result_count: 0,
                attended_channels: 0,
                tsf_error: false,
            },
            recovery_needed,
        }))
    }

    /// Upper layer cancels the scan matching `tag`.
    pub fn stop<B: Bus>(
        &mut self,
        bus: &mut B,
        watchdog: &mut dyn Watchdog,
        tag: u8,
    ) -> Result<Option<ScanNotice>, ScanError> {
        if self.state != ScanState::Scanning
            || self.request.as_ref().is_none_or(|r| r.tag != tag)
        {
            return Ok(None);
        }
        watchdog.cancel();
        self.send_cmd(bus, CommandId::ScanStop, &[tag, 0, 0, 0])?;
        self.state = ScanState::Stopping;
        Ok(Some(ScanNotice {
            outcome: aborted_outcome(tag),
            recovery_needed: false,
        }))
    }

    /// The device was reset underneath us. Everything in flight is void.
    pub fn on_device_reset(&mut self, watchdog: &mut dyn Watchdog) -> Option<ScanNotice> {
        watchdog.cancel();
        self.phase = CmdPhase::Idle;
        self.ps_entered = false;
        self.consecutive_timeouts = 0;
        let tag = self.request.take().map(|r| r.tag);
        let was_active = self.state != ScanState::Idle;
        self.state = ScanState::Idle;
        if was_active {
            warn!("device reset with a scan in flight");
            Some(ScanNotice {
                outcome: aborted_outcome(tag.unwrap_or(0)),
                recovery_needed: false,
            })
        } else {
            None
        }
    }

    /// Feed a completed scan-owned bus transaction back in.
    pub fn resume<B: Bus>(&mut self, bus: &mut B, done: Completion) -> Result<(), ScanError> {
        done.result?;
        match std::mem::replace(&mut self.phase, CmdPhase::Idle) {
            CmdPhase::Idle => {}
            CmdPhase::Payload(_) => {
                self.phase = CmdPhase::Trigger;
                self.pump_phase(bus)?;
            }
            CmdPhase::Trigger => {}
        }
        Ok(())
    }

    fn issue_scan<B: Bus>(
        &mut self,
        bus: &mut B,
        watchdog: &mut dyn Watchdog,
    ) -> Result<(), ScanError> {
        let request = self.request.as_ref().expect("request set by start");
        let timeout = self.compute_timeout(request, &self.link);
        let payload = encode_scan_start(request);
        debug!(tag = request.tag, ?timeout, "issuing scan");
        self.send_cmd(bus, CommandId::ScanStart, &payload)?;
        self.state = ScanState::Scanning;
        watchdog.arm(timeout);
        Ok(())
    }

    /// Common tail for a finished scan: leave power save and go idle.
    fn finish(&mut self, ps: &mut dyn PowerSave) {
        if self.ps_entered {
            // Exit completion is not interesting; a failure here is the
            // link layer's problem to report.
            let _ = ps.request_exit();
            self.ps_entered = false;
        }
        self.request = None;
        self.state = ScanState::Idle;
    }

    fn send_cmd<B: Bus>(
        &mut self,
        bus: &mut B,
        id: CommandId,
        payload: &[u8],
    ) -> Result<(), ScanError> {
        let encoded = encode_command(id, payload)?;
        self.phase = CmdPhase::Payload(encoded);
        self.pump_phase(bus)
    }

    fn pump_phase<B: Bus>(&mut self, bus: &mut B) -> Result<(), ScanError> {
        loop {
            let addr = self.cmd_addr.ok_or(ScanError::NotReady)?;
            let txn = match &self.phase {
                CmdPhase::Idle => return Ok(()),
                CmdPhase::Payload(cmd) => Transaction::write(TxnOwner::Scan, addr, cmd.clone()),
                CmdPhase::Trigger => {
                    Transaction::write_reg(TxnOwner::Scan, REG_INTERRUPT_TRIG, INTR_TRIG_CMD)
                }
            };
            match bus.submit(txn)? {
                BusStatus::Pending => return Ok(()),
                BusStatus::Complete => {
                    let done = bus.take_completion().ok_or(BusError::MissingCompletion)?;
                    done.result?;
                    self.phase = match &self.phase {
                        CmdPhase::Payload(_) => CmdPhase::Trigger,
                        _ => CmdPhase::Idle,
                    };
                }
            }
        }
    }
}

fn aborted_outcome(tag: u8) -> ScanOutcome {
    ScanOutcome {
        tag,
        status: ScanStatus::Aborted,
        result_count: 0,
        attended_channels: 0,
        tsf_error: false,
    }
}

fn encode_scan_start(request: &ScanRequest) -> Vec<u8> {
    let mut payload = Vec::with_capacity(4 + request.channels.len() * 4);
    payload.push(request.tag);
    let mut flags = 0u8;
    match request.kind {
        ScanKind::Active => {}
        ScanKind::Passive => flags |= 0x01,
        ScanKind::Scheduled => flags |= 0x04,
    }
    if request.triggered {
        flags |= 0x02;
    }
    payload.push(flags);
    payload.push(request.priority);
    payload.push(request.channels.len() as u8);
    for ch in &request.channels {
        payload.push(ch.channel);
        payload.push(0);
        payload.extend_from_slice(&(ch.dwell.as_millis() as u16).to_le_bytes());
    }
    payload
}
