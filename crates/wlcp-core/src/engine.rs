//! Control-plane engine: high-level orchestrator for the coprocessor.
//!
//! Owns the bus plus every state machine, routes bus completions back to
//! whichever machine issued them, drains the internal signal queue the
//! event sinks feed, and exposes the embedding layer's API surface: boot,
//! firmware load, configuration setters, and the scan service.
//!
//! The engine is single threaded. Pending bus work is advanced by calling
//! [`Engine::pump`] whenever the bus layer reports finished transfers, and
//! device interrupts are delivered through [`Engine::on_interrupt`].

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::boot::{BootAttrs, BootError, BootSequencer, ImageLoader, LoadOutcome};
use crate::bus::{Bus, BusError, OpStatus, TxnOwner};
use crate::config::{ConfigError, ConfigSequencer, ConfigStore, KeyMaterial};
use crate::events::{EngineEvent, EngineObserver, EnginePhase, TracingObserver};
use crate::mailbox::{
    EngineSignal, EventMailbox, EventSink, MailboxError, Registration, SignalQueue,
};
use crate::partition::PartitionTable;
use crate::protocol::command::{
    AcParams, BaPolicy, BeaconFilter, HtCapabilities, HtOperation, JoinParams, KeepAlive,
    RadioParams, RatePolicy, RxConfig, ScanParams, Template,
};
use crate::protocol::constants::{
    FW_BLOCK_SIZE, IND_CTRL_MAX_POLLS, INIT_COMPLETE_MAX_POLLS, INTR_EVENT_A, INTR_EVENT_B,
    SOFT_RESET_MAX_POLLS,
};
use crate::protocol::event::{EventId, EventRecord};
use crate::scan::{
    LinkState, NoopPowerSave, NullWatchdog, PowerSave, ScanError, ScanNotice, ScanRequest,
    ScanServiceSm, ScanTunables, Watchdog,
};

use std::time::Duration;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Boot error: {0}")]
    Boot(#[from] BootError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Mailbox error: {0}")]
    Mailbox(#[from] MailboxError),

    #[error("Scan error: {0}")]
    Scan(#[from] ScanError),

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Operation requires the {expected} phase")]
    WrongPhase { expected: &'static str },
}

/// Handle marking the engine's own event registrations.
const INTERNAL_SINK_HANDLE: u64 = 0;

/// Tunables for an engine instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Reference clock feeding the device, in Hz.
    pub ref_clock_hz: u32,
    /// Leave the firmware debug event unmasked during boot.
    pub firmware_debug: bool,
    /// Fixed slack added to every scan watchdog timeout.
    pub guard_margin_ms: u64,
    /// Extra per-channel allowance for triggered scans.
    pub trigger_slack_ms: u64,
    /// Consecutive scan watchdog expiries before recovery is requested.
    pub max_consecutive_scan_timeouts: u32,
    /// Transfer granularity for firmware download blocks, in bytes.
    pub fw_block_size: usize,
    /// Poll budget for the soft-reset completion bit.
    pub reset_poll_budget: u32,
    /// Poll budget for the firmware init-complete indication.
    pub init_poll_budget: u32,
    /// Poll budget for each indirect top-register handshake.
    pub top_reg_poll_budget: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ref_clock_hz: 26_000_000,
            firmware_debug: false,
            guard_margin_ms: 50,
            trigger_slack_ms: 10,
            max_consecutive_scan_timeouts: 3,
            fw_block_size: FW_BLOCK_SIZE,
            reset_poll_budget: SOFT_RESET_MAX_POLLS,
            init_poll_budget: INIT_COMPLETE_MAX_POLLS,
            top_reg_poll_budget: IND_CTRL_MAX_POLLS,
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: EngineConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    fn boot_attrs(&self) -> BootAttrs {
        BootAttrs {
            ref_clock_hz: self.ref_clock_hz,
            firmware_debug: self.firmware_debug,
            reset_poll_budget: self.reset_poll_budget,
            top_reg_poll_budget: self.top_reg_poll_budget,
        }
    }

    fn image_loader(&self) -> ImageLoader {
        ImageLoader::new().with_tunables(self.fw_block_size, self.init_poll_budget)
    }

    fn scan_tunables(&self) -> ScanTunables {
        ScanTunables {
            guard_margin: Duration::from_millis(self.guard_margin_ms),
            trigger_slack: Duration::from_millis(self.trigger_slack_ms),
            max_consecutive_timeouts: self.max_consecutive_scan_timeouts,
        }
    }
}

/// The control-plane engine.
pub struct Engine<B: Bus, O: EngineObserver> {
    bus: B,
    observer: Arc<O>,
    config: EngineConfig,
    phase: EnginePhase,

    boot: BootSequencer,
    loader: ImageLoader,
    store: ConfigStore,
    sequencer: ConfigSequencer,
    mailbox: EventMailbox,
    scan: ScanServiceSm,

    ps: Box<dyn PowerSave>,
    watchdog: Box<dyn Watchdog>,
    signals: SignalQueue,
    link: LinkState,

    /// Cumulative firmware bytes confirmed written this load cycle.
    fw_written: u64,
    /// Length of the chunk currently going out.
    chunk_in_flight: u64,
}

impl<B: Bus> Engine<B, TracingObserver> {
    /// Create an engine with the default tracing observer.
    pub fn new(bus: B, config: EngineConfig) -> Self {
        Self::with_observer(bus, config, Arc::new(TracingObserver))
    }
}

impl<B: Bus, O: EngineObserver> Engine<B, O> {
    /// Create an engine with a custom observer.
    pub fn with_observer(bus: B, config: EngineConfig, observer: Arc<O>) -> Self {
        let signals: SignalQueue = Rc::new(RefCell::new(VecDeque::new()));
        Self {
            bus,
            observer,
            phase: EnginePhase::Off,
            boot: BootSequencer::new(),
            loader: config.image_loader(),
            store: ConfigStore::new(),
            sequencer: ConfigSequencer::new(signals.clone()),
            mailbox: EventMailbox::new(),
            scan: ScanServiceSm::new(config.scan_tunables()),
            ps: Box::new(NoopPowerSave),
            watchdog: Box::new(NullWatchdog),
            signals,
            link: LinkState::default(),
            fw_written: 0,
            chunk_in_flight: 0,
            config,
        }
    }

    /// Install the platform power-save glue.
    pub fn with_power_save(mut self, ps: Box<dyn PowerSave>) -> Self {
        self.ps = ps;
        self
    }

    /// Install the platform watchdog timer glue.
    pub fn with_watchdog(mut self, watchdog: Box<dyn Watchdog>) -> Self {
        self.watchdog = watchdog;
        self
    }

    pub fn phase(&self) -> EnginePhase {
        self.phase
    }

    pub fn store(&self) -> &ConfigStore {
        &self.store
    }

    pub fn bus(&mut self) -> &mut B {
        &mut self.bus
    }

    // ------------------------------------------------------------------
    // Boot and firmware load
    // ------------------------------------------------------------------

    /// Start the cold-boot sequence. `nvs_blob` carries the calibration
    /// bursts; `None` injects the built-in defaults.
    pub fn boot(&mut self, nvs_blob: Option<&[u8]>) -> Result<OpStatus, EngineError> {
        self.set_phase(EnginePhase::Booting);
        let attrs = self.config.boot_attrs();
        let status = self
            .boot
            .start(&mut self.bus, attrs, nvs_blob)
            .inspect_err(|e| self.fail(&e.to_string()))?;
        if status == OpStatus::Done {
            self.after_boot();
        }
        Ok(status)
    }

    /// Stream one firmware chunk. `is_final` on the last chunk triggers
    /// the run-and-handshake tail.
    pub fn load_firmware(
        &mut self,
        chunk: &[u8],
        base: u32,
        is_final: bool,
    ) -> Result<OpStatus, EngineError> {
        if self.phase != EnginePhase::LoadingFirmware {
            return Err(EngineError::WrongPhase {
                expected: "LoadingFirmware",
            });
        }
        self.chunk_in_flight = chunk.len() as u64;
        let status = self
            .loader
            .load(&mut self.bus, chunk, base, is_final)
            .inspect_err(|e| self.fail(&e.to_string()))?;
        if status == OpStatus::Done {
            self.after_load()?;
        }
        Ok(status)
    }

    fn after_boot(&mut self) {
        if let Some(chip_id) = self.boot.chip_id() {
            self.observer.on_event(&EngineEvent::BootComplete { chip_id });
        }
        // Boot left the working partition programmed; tell the loader so a
        // chunk that fits it costs no extra reprogram.
        self.loader.assume_mapping(PartitionTable::working());
        self.fw_written = 0;
        self.set_phase(EnginePhase::LoadingFirmware);
    }

    fn after_load(&mut self) -> Result<(), EngineError> {
        self.fw_written += std::mem::take(&mut self.chunk_in_flight);
        self.observer.on_event(&EngineEvent::Progress {
            written: self.fw_written,
        });
        match self.loader.outcome().cloned() {
            Some(LoadOutcome::MoreChunks) | None => Ok(()),
            Some(LoadOutcome::Booted(info)) => {
                let addr = self
                    .loader
                    .cmd_mailbox_addr()
                    .expect("handshake records the mailbox address");
                self.sequencer.set_cmd_address(addr);
                self.scan.set_cmd_address(addr);
                self.observer.on_event(&EngineEvent::FirmwareReady {
                    mac: info.mac_address,
                    fw_version: info.fw_version.clone(),
                });
                self.store.set_device_info(info);
                self.install_sinks();
                self.mailbox.init_addresses(&mut self.bus)?;

                self.set_phase(EnginePhase::Configuring);
                let status = self.run_sequencer()?;
                if status == OpStatus::Done {
                    self.set_phase(EnginePhase::Ready);
                }
                Ok(())
            }
        }
    }

    /// Point the engine's own sinks at the events it acts on. Replacing
    /// (not registering) keeps this idempotent across recoveries.
    fn install_sinks(&mut self) {
        fn sink(queue: &SignalQueue, make: fn(&EventRecord) -> EngineSignal) -> Box<dyn EventSink> {
            let queue = queue.clone();
            Box::new(move |_id: EventId, rec: &EventRecord| {
                queue.borrow_mut().push_back(make(rec));
            })
        }

        let q = &self.signals;
        self.mailbox.replace(
            EventId::ScanComplete,
            sink(q, |rec| EngineSignal::ScanComplete { record: *rec }),
            INTERNAL_SINK_HANDLE,
        );
        self.mailbox.replace(
            EventId::ScheduledScanComplete,
            sink(q, |rec| EngineSignal::ScheduledScanComplete { record: *rec }),
            INTERNAL_SINK_HANDLE,
        );
        self.mailbox.replace(
            EventId::PeriodicScanReport,
            sink(q, |rec| EngineSignal::PeriodicScanReport { record: *rec }),
            INTERNAL_SINK_HANDLE,
        );
        self.mailbox.replace(
            EventId::PsReport,
            sink(q, |rec| EngineSignal::PsStatus {
                entered: rec.ps_entered,
            }),
            INTERNAL_SINK_HANDLE,
        );
        self.mailbox.replace(
            EventId::Disconnect,
            sink(q, |_| EngineSignal::Disconnected),
            INTERNAL_SINK_HANDLE,
        );
    }

    // ------------------------------------------------------------------
    // Completion and interrupt entry points
    // ------------------------------------------------------------------

    /// Route every finished bus transaction back to the machine that
    /// issued it, then act on whatever signals the dispatch raised.
    pub fn pump(&mut self) -> Result<(), EngineError> {
        while let Some(done) = self.bus.take_completion() {
            match done.txn.owner {
                TxnOwner::Boot => {
                    let status = self
                        .boot
                        .resume(&mut self.bus, done)
                        .inspect_err(|e| self.fail(&e.to_string()))?;
                    if status == OpStatus::Done {
                        self.after_boot();
                    }
                }
                TxnOwner::Loader => {
                    let status = self
                        .loader
                        .resume(&mut self.bus, done)
                        .inspect_err(|e| self.fail(&e.to_string()))?;
                    if status == OpStatus::Done {
                        self.after_load()?;
                    }
                }
                TxnOwner::Config => {
                    let status = self.sequencer.resume(
                        &mut self.bus,
                        &mut self.store,
                        &mut self.mailbox,
                        done,
                    )?;
                    if status == OpStatus::Done {
                        self.after_config_run()?;
                    }
                }
                TxnOwner::Mailbox => {
                    self.mailbox.resume(&mut self.bus, done)?;
                }
                TxnOwner::Scan => {
                    self.scan.resume(&mut self.bus, done)?;
                }
            }
            self.drain_signals()?;
        }
        Ok(())
    }

    /// Service a device interrupt status word.
    pub fn on_interrupt(&mut self, status: u32) -> Result<OpStatus, EngineError> {
        if status & (INTR_EVENT_A | INTR_EVENT_B) == 0 {
            debug!(status = format!("0x{status:08X}"), "interrupt without event work");
            return Ok(OpStatus::Done);
        }
        let op = self.mailbox.handle(&mut self.bus, status)?;
        self.drain_signals()?;
        Ok(op)
    }

    /// The host-side scan watchdog fired.
    pub fn on_watchdog_expired(&mut self) -> Result<(), EngineError> {
        let notice = self.scan.on_timeout(&mut self.bus)?;
        if let Some(notice) = notice {
            self.notify_scan(notice);
        }
        Ok(())
    }

    fn drain_signals(&mut self) -> Result<(), EngineError> {
        loop {
            let signal = self.signals.borrow_mut().pop_front();
            let Some(signal) = signal else { return Ok(()) };
            debug!(?signal, "engine signal");
            match signal {
                EngineSignal::JoinObserved => {
                    let status = self.sequencer.on_join_observed(
                        &mut self.bus,
                        &mut self.store,
                        &mut self.mailbox,
                    )?;
                    self.observer.on_event(&EngineEvent::Joined);
                    if status == OpStatus::Done {
                        self.after_config_run()?;
                    }
                }
                EngineSignal::ScanComplete { record }
                | EngineSignal::ScheduledScanComplete { record } => {
                    let notice = self.scan.on_scan_complete(
                        self.ps.as_mut(),
                        self.watchdog.as_mut(),
                        &record,
                    )?;
                    if let Some(notice) = notice {
                        self.notify_scan(notice);
                    }
                }
                EngineSignal::PeriodicScanReport { record } => {
                    debug!(results = record.scan_result_count, "periodic scan report");
                }
                EngineSignal::PsStatus { entered } => {
                    let notice =
                        self.scan
                            .on_ps_entered(&mut self.bus, self.watchdog.as_mut(), entered)?;
                    if let Some(notice) = notice {
                        self.notify_scan(notice);
                    }
                }
                EngineSignal::Disconnected => {
                    warn!("firmware reported disconnect");
                    self.store.set_joined(false);
                    self.observer.on_event(&EngineEvent::Disconnected);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Configuration API
    // ------------------------------------------------------------------

    pub fn set_radio_params(&mut self, v: RadioParams) -> Result<OpStatus, EngineError> {
        self.store.radio.set(v);
        self.after_set()
    }

    pub fn set_rx_config(&mut self, v: RxConfig) -> Result<OpStatus, EngineError> {
        self.store.rx_config.set(v);
        self.after_set()
    }

    pub fn set_rate_policy(&mut self, v: RatePolicy) -> Result<OpStatus, EngineError> {
        self.store.rate_policy.set(v);
        self.after_set()
    }

    pub fn set_ac_params(&mut self, v: AcParams) -> Result<OpStatus, EngineError> {
        self.store.set_ac_params(v);
        self.after_set()
    }

    pub fn set_template(&mut self, v: Template) -> Result<OpStatus, EngineError> {
        self.store.set_template(v);
        self.after_set()
    }

    pub fn set_beacon_filter(&mut self, v: BeaconFilter) -> Result<OpStatus, EngineError> {
        self.store.beacon_filter.set(v);
        self.after_set()
    }

    pub fn set_keep_alive(&mut self, v: KeepAlive) -> Result<OpStatus, EngineError> {
        self.store.keep_alive.set(v);
        self.after_set()
    }

    pub fn set_scan_params(&mut self, v: ScanParams) -> Result<OpStatus, EngineError> {
        self.store.scan_params.set(v);
        self.after_set()
    }

    /// Ask the firmware to join a network. The post-join configuration is
    /// held back until the firmware confirms.
    pub fn join(&mut self, v: JoinParams) -> Result<OpStatus, EngineError> {
        self.store.join.set(v);
        self.after_set()
    }

    pub fn set_aid(&mut self, aid: u16) -> Result<OpStatus, EngineError> {
        self.store.aid.set(aid);
        self.after_set()
    }

    pub fn set_ht_capabilities(&mut self, v: HtCapabilities) -> Result<OpStatus, EngineError> {
        self.store.ht_capabilities.set(v);
        self.after_set()
    }

    pub fn set_ht_operation(&mut self, v: HtOperation) -> Result<OpStatus, EngineError> {
        self.store.ht_operation.set(v);
        self.after_set()
    }

    pub fn set_ba_policy(&mut self, v: BaPolicy) -> Result<OpStatus, EngineError> {
        self.store.ba_policy.set(v);
        self.after_set()
    }

    pub fn set_key(&mut self, slot: usize, material: KeyMaterial) -> Result<OpStatus, EngineError> {
        self.store.set_key(slot, material);
        self.after_set()
    }

    pub fn remove_key(&mut self, slot: usize) -> Result<OpStatus, EngineError> {
        self.store.remove_key(slot);
        self.after_set()
    }

    pub fn unmask_event(&mut self, id: EventId) -> Result<OpStatus, EngineError> {
        self.store.unmask_event(id);
        self.after_set()
    }

    pub fn mask_event(&mut self, id: EventId) -> Result<OpStatus, EngineError> {
        self.store.mask_event(id);
        self.after_set()
    }

    /// Push any dirty configuration immediately.
    pub fn commit(&mut self) -> Result<OpStatus, EngineError> {
        self.after_set()
    }

    /// Before the firmware is up, setters only stage values; once Ready
    /// (or still configuring) they kick the sequencer.
    fn after_set(&mut self) -> Result<OpStatus, EngineError> {
        match self.phase {
            EnginePhase::Ready | EnginePhase::Configuring => self.run_sequencer(),
            _ => Ok(OpStatus::Done),
        }
    }

    fn run_sequencer(&mut self) -> Result<OpStatus, EngineError> {
        let status = self
            .sequencer
            .run(&mut self.bus, &mut self.store, &mut self.mailbox)
            .inspect_err(|e| {
                self.observer.on_event(&EngineEvent::Error {
                    message: e.to_string(),
                })
            })?;
        if status == OpStatus::Done {
            self.after_config_run()?;
        }
        Ok(status)
    }

    /// A configuration run finished: promote the phase and pick up values
    /// staged while the run was in flight.
    fn after_config_run(&mut self) -> Result<(), EngineError> {
        if self.phase == EnginePhase::Configuring {
            self.set_phase(EnginePhase::Ready);
        }
        if self.store.any_dirty() && !self.sequencer.is_running() {
            self.run_sequencer()?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Scan service
    // ------------------------------------------------------------------

    /// Link facts the scan watchdog sizing depends on.
    pub fn set_link_state(&mut self, link: LinkState) {
        self.link = link;
    }

    pub fn start_scan(&mut self, request: ScanRequest) -> Result<(), EngineError> {
        if self.phase != EnginePhase::Ready {
            return Err(EngineError::WrongPhase { expected: "Ready" });
        }
        self.scan
            .start(
                &mut self.bus,
                self.ps.as_mut(),
                self.watchdog.as_mut(),
                request,
                self.link,
            )
            .map_err(Into::into)
    }

    pub fn stop_scan(&mut self, tag: u8) -> Result<(), EngineError> {
        let notice = self.scan.stop(&mut self.bus, self.watchdog.as_mut(), tag)?;
        if let Some(notice) = notice {
            self.notify_scan(notice);
        }
        Ok(())
    }

    fn notify_scan(&mut self, notice: ScanNotice) {
        self.observer.on_event(&EngineEvent::ScanFinished {
            outcome: notice.outcome,
        });
        if notice.recovery_needed {
            self.observer.on_event(&EngineEvent::RecoveryNeeded {
                reason: "scan watchdog expiry streak".into(),
            });
        }
    }

    // ------------------------------------------------------------------
    // External event subscriptions
    // ------------------------------------------------------------------

    pub fn register_event_sink(
        &mut self,
        id: EventId,
        sink: Box<dyn EventSink>,
        handle: u64,
    ) -> Result<(), EngineError> {
        self.mailbox.register(id, sink, handle).map_err(Into::into)
    }

    pub fn replace_event_sink(
        &mut self,
        id: EventId,
        sink: Box<dyn EventSink>,
        handle: u64,
    ) -> Option<Registration> {
        self.mailbox.replace(id, sink, handle)
    }

    pub fn unregister_event_sink(&mut self, id: EventId) -> Option<Registration> {
        self.mailbox.unregister(id)
    }

    // ------------------------------------------------------------------
    // Recovery
    // ------------------------------------------------------------------

    /// The device has been (or is about to be) hard reset. Void all
    /// in-flight work and re-arm the configuration mirror so the next
    /// boot/load cycle replays every value the host ever set.
    pub fn notify_device_reset(&mut self) {
        info!("device reset: discarding in-flight state, arming config replay");
        if let Some(notice) = self.scan.on_device_reset(self.watchdog.as_mut()) {
            self.notify_scan(notice);
        }
        self.signals.borrow_mut().clear();
        self.boot = BootSequencer::new();
        self.loader = self.config.image_loader();
        self.mailbox = EventMailbox::new();
        self.sequencer = ConfigSequencer::new(self.signals.clone());
        self.scan = ScanServiceSm::new(self.config.scan_tunables());
        self.fw_written = 0;
        self.chunk_in_flight = 0;
        self.store.mark_all_dirty();
        self.set_phase(EnginePhase::Off);
    }

    /// A bring-up stage failed hard: nothing short of a device reset and a
    /// replay gets the engine out of this.
    fn fail(&mut self, message: &str) {
        self.observer.on_event(&EngineEvent::Error {
            message: message.into(),
        });
        self.observer.on_event(&EngineEvent::RecoveryNeeded {
            reason: message.into(),
        });
        self.set_phase(EnginePhase::Failed);
    }

    fn set_phase(&mut self, to: EnginePhase) {
        if self.phase != to {
            let from = self.phase;
            self.phase = to;
            info!(%from, %to, "engine phase");
            self.observer.on_event(&EngineEvent::PhaseChanged { from, to });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MockBus;
    use crate::protocol::command::{Band, CommandHeader, CommandId, DeviceInfo};
    use crate::protocol::constants::*;
    use crate::scan::{PsPolicy, ScanChannel, ScanKind, ScanStatus};

    const CMD_MBOX: u32 = MEM_WORKING_BASE + 0x1000;
    const EVENT_MBOX: u32 = MEM_WORKING_BASE + 0x2000;

    /// Observer that records every event for assertions.
    #[derive(Default)]
    struct CollectingObserver {
        events: RefCell<Vec<EngineEvent>>,
    }

    impl EngineObserver for CollectingObserver {
        fn on_event(&self, event: &EngineEvent) {
            self.events.borrow_mut().push(event.clone());
        }
    }

    fn script_cold_boot(bus: &mut MockBus) {
        bus.script_reg(REG_CHIP_ID, CHIP_ID_SUPPORTED);
        bus.script_reg(REG_SOFT_RESET, 0);
        bus.script_reg(REG_CHIP_ID, CHIP_ID_SUPPORTED);
        for _ in 0..TOP_REG_FIXUPS.len() {
            bus.script_reg(REG_IND_CTRL, IND_CTRL_DONE);
            bus.script_reg(REG_IND_DATA, 0);
            bus.script_reg(REG_IND_CTRL, IND_CTRL_DONE);
        }
        // Finalize handshake plus mailbox discovery.
        bus.script_reg(REG_ECPU_CONTROL, 0);
        bus.script_reg(REG_INTERRUPT_NO_CLEAR, INTR_INIT_COMPLETE);
        bus.script_reg(REG_CMD_MAILBOX_PTR, CMD_MBOX);
        bus.script_read(CMD_MBOX, device_info_bytes());
        bus.script_reg(REG_EVENT_MAILBOX_PTR, EVENT_MBOX);
    }

    fn device_info_bytes() -> Vec<u8> {
        let mut raw = vec![0u8; DeviceInfo::SIZE];
        raw[..6].copy_from_slice(&[0x01, 0x00, 0xEF, 0xBE, 0xAD, 0xDE]);
        raw[8..13].copy_from_slice(b"7.3.9");
        raw
    }

    fn booted_engine() -> (Engine<MockBus, CollectingObserver>, Arc<CollectingObserver>) {
        let mut bus = MockBus::new();
        bus.relax_mapping();
        script_cold_boot(&mut bus);
        let observer = Arc::new(CollectingObserver::default());
        let mut engine = Engine::with_observer(bus, EngineConfig::default(), observer.clone());

        assert_eq!(engine.boot(None).unwrap(), OpStatus::Done);
        // 64 KiB image split as the platform delivers it: 40 KiB then 24 KiB.
        let head = vec![0x5Au8; 0xA000];
        let tail = vec![0xA5u8; 0x6000];
        assert_eq!(
            engine.load_firmware(&head, MEM_WORKING_BASE, false).unwrap(),
            OpStatus::Done
        );
        assert_eq!(
            engine
                .load_firmware(&tail, MEM_WORKING_BASE + 0xA000, true)
                .unwrap(),
            OpStatus::Done
        );
        assert_eq!(engine.phase(), EnginePhase::Ready);
        (engine, observer)
    }

    fn cmd_ids(bus: &MockBus) -> Vec<u16> {
        bus.writes_to(CMD_MBOX)
            .iter()
            .map(|c| CommandHeader::from_bytes(c).unwrap().id)
            .collect()
    }

    fn event_record(vector: u32, tag: u8, results: u8) -> Vec<u8> {
        let mut raw = vec![0u8; EVENT_RECORD_SIZE];
        raw[..4].copy_from_slice(&vector.to_le_bytes());
        raw[0x0C] = results;
        raw[0x0D] = tag;
        raw
    }

    fn scan_request(tag: u8) -> ScanRequest {
        ScanRequest {
            channels: vec![
                ScanChannel {
                    channel: 1,
                    dwell: Duration::from_millis(30),
                },
                ScanChannel {
                    channel: 6,
                    dwell: Duration::from_millis(30),
                },
            ],
            kind: ScanKind::Active,
            triggered: false,
            priority: 0,
            tag,
            ps_policy: PsPolicy::None,
        }
    }

    #[test]
    fn test_cold_boot_to_ready_with_two_chunk_image() {
        let (mut engine, observer) = booted_engine();

        // The device identity and MAC made it through.
        assert_eq!(
            engine.store().device_info().unwrap().mac_address,
            [0xDE, 0xAD, 0xBE, 0xEF, 0x00, 0x01]
        );

        // Exactly one reprogram beyond the boot-time download mapping: the
        // switch to the working partition. The 64 KiB image fits the
        // working window, so the loader never repartitions.
        let partitions = engine.bus().partitions().to_vec();
        assert_eq!(partitions.len(), 2);
        assert_eq!(partitions[0], PartitionTable::download(MEM_DOWNLOAD_BASE));
        assert_eq!(partitions[1], PartitionTable::working());

        // 64 KiB in 512-byte blocks.
        let fw_writes = engine
            .bus()
            .writes()
            .iter()
            .filter(|(a, _)| (MEM_WORKING_BASE..MEM_WORKING_BASE + 0x10000).contains(a))
            .count();
        assert_eq!(fw_writes, 128);

        let events = observer.events.borrow();
        assert!(events
            .iter()
            .any(|e| matches!(e, EngineEvent::BootComplete { chip_id } if *chip_id == CHIP_ID_SUPPORTED)));
        assert!(events
            .iter()
            .any(|e| matches!(e, EngineEvent::FirmwareReady { fw_version, .. } if fw_version == "7.3.9")));
        assert!(events.iter().any(|e| matches!(
            e,
            EngineEvent::PhaseChanged {
                to: EnginePhase::Ready,
                ..
            }
        )));

        // One progress report per chunk, cumulative.
        let progress: Vec<u64> = events
            .iter()
            .filter_map(|e| match e {
                EngineEvent::Progress { written } => Some(*written),
                _ => None,
            })
            .collect();
        assert_eq!(progress, vec![0xA000, 0x10000]);
    }

    #[test]
    fn test_boot_failure_requests_recovery() {
        let mut bus = MockBus::new();
        bus.relax_mapping();
        bus.script_reg(REG_CHIP_ID, 0x1111_2222);
        let observer = Arc::new(CollectingObserver::default());
        let mut engine = Engine::with_observer(bus, EngineConfig::default(), observer.clone());

        assert!(engine.boot(None).is_err());
        assert_eq!(engine.phase(), EnginePhase::Failed);
        let events = observer.events.borrow();
        assert!(events.iter().any(|e| matches!(e, EngineEvent::Error { .. })));
        assert!(events
            .iter()
            .any(|e| matches!(e, EngineEvent::RecoveryNeeded { .. })));
    }

    #[test]
    fn test_setter_pushes_once_and_only_once() {
        let (mut engine, _observer) = booted_engine();
        engine.bus().clear_writes();

        let rx = RxConfig {
            config: 0x20,
            filter: 0x0F,
        };
        assert_eq!(engine.set_rx_config(rx).unwrap(), OpStatus::Done);
        assert_eq!(cmd_ids(engine.bus()), vec![CommandId::RxConfig as u16]);

        // Committing again with nothing dirty writes nothing.
        engine.bus().clear_writes();
        assert_eq!(engine.commit().unwrap(), OpStatus::Done);
        assert!(engine.bus().writes_to(CMD_MBOX).is_empty());

        // A second identical call changes nothing and so emits nothing.
        assert_eq!(engine.set_rx_config(rx).unwrap(), OpStatus::Done);
        assert!(engine.bus().writes_to(CMD_MBOX).is_empty());

        // A genuinely different value goes out again.
        let rx2 = RxConfig {
            config: 0x21,
            filter: 0x0F,
        };
        assert_eq!(engine.set_rx_config(rx2).unwrap(), OpStatus::Done);
        assert_eq!(cmd_ids(engine.bus()), vec![CommandId::RxConfig as u16]);
    }

    #[test]
    fn test_event_interrupt_reaches_scan_service() {
        let (mut engine, observer) = booted_engine();
        engine.start_scan(scan_request(9)).unwrap();

        engine.bus().script_read(
            EVENT_MBOX,
            event_record(EventId::ScanComplete.bit(), 9, 4),
        );
        engine.on_interrupt(INTR_EVENT_A).unwrap();

        let events = observer.events.borrow();
        let outcome = events
            .iter()
            .find_map(|e| match e {
                EngineEvent::ScanFinished { outcome } => Some(*outcome),
                _ => None,
            })
            .expect("scan finished event");
        assert_eq!(outcome.tag, 9);
        assert_eq!(outcome.status, ScanStatus::Completed);
        assert_eq!(outcome.result_count, 4);
    }

    #[test]
    fn test_watchdog_expiry_forces_stop_and_reports() {
        let (mut engine, observer) = booted_engine();
        engine.start_scan(scan_request(3)).unwrap();
        engine.bus().clear_writes();

        engine.on_watchdog_expired().unwrap();

        assert_eq!(cmd_ids(engine.bus()), vec![CommandId::ScanStop as u16]);
        let events = observer.events.borrow();
        assert!(events.iter().any(|e| matches!(
            e,
            EngineEvent::ScanFinished { outcome } if outcome.status == ScanStatus::TimedOut
        )));
    }

    #[test]
    fn test_join_gate_round_trip_through_events() {
        let (mut engine, observer) = booted_engine();
        engine
            .join(JoinParams {
                bssid: [2; 6],
                channel: 11,
                band: Band::Band2Ghz,
                beacon_interval_ms: 100,
                dtim_period: 1,
                basic_rates: 0x0F,
                ssid: b"net".to_vec(),
            })
            .unwrap();
        engine.set_aid(42).unwrap();
        assert!(engine.sequencer.is_awaiting_join());

        // Firmware confirms the join through the event mailbox.
        engine.bus().script_read(
            EVENT_MBOX,
            event_record(EventId::JoinComplete.bit(), 0, 0),
        );
        engine.on_interrupt(INTR_EVENT_A).unwrap();

        assert!(engine.store().joined());
        let ids = cmd_ids(engine.bus());
        assert!(ids.contains(&(CommandId::Join as u16)));
        assert!(ids.contains(&(CommandId::SetAid as u16)));
        assert!(observer
            .events
            .borrow()
            .iter()
            .any(|e| matches!(e, EngineEvent::Joined)));
    }

    #[test]
    fn test_recovery_replays_full_configuration() {
        let (mut engine, _observer) = booted_engine();
        engine
            .set_radio_params(RadioParams {
                channel: 6,
                band: Band::Band2Ghz,
                tx_power: 20,
                rts_threshold: 2347,
                frag_threshold: 2346,
            })
            .unwrap();
        engine
            .set_rx_config(RxConfig {
                config: 1,
                filter: 2,
            })
            .unwrap();

        // Device falls over and is externally reset.
        engine.notify_device_reset();
        assert_eq!(engine.phase(), EnginePhase::Off);

        script_cold_boot(engine.bus());
        engine.bus().clear_writes();
        engine.boot(None).unwrap();
        let image = vec![0u8; 0x1000];
        engine.load_firmware(&image, MEM_WORKING_BASE, true).unwrap();

        // Both values were replayed from the mirror without new set calls.
        let ids = cmd_ids(engine.bus());
        assert!(ids.contains(&(CommandId::RadioParams as u16)));
        assert!(ids.contains(&(CommandId::RxConfig as u16)));
        assert_eq!(engine.phase(), EnginePhase::Ready);
    }

    #[test]
    fn test_deferred_boot_drives_through_pump() {
        let mut bus = MockBus::new();
        bus.relax_mapping();
        script_cold_boot(&mut bus);
        bus.defer(true);
        let mut engine = Engine::new(bus, EngineConfig::default());

        assert_eq!(engine.boot(None).unwrap(), OpStatus::Pending);
        let mut rounds = 0;
        while engine.phase() == EnginePhase::Booting {
            assert!(engine.bus().complete_one(), "boot stalled");
            engine.pump().unwrap();
            rounds += 1;
            assert!(rounds < 200);
        }
        assert_eq!(engine.phase(), EnginePhase::LoadingFirmware);
    }

    #[test]
    fn test_scan_requires_ready_phase() {
        let mut bus = MockBus::new();
        bus.relax_mapping();
        let mut engine = Engine::new(bus, EngineConfig::default());
        let err = engine.start_scan(scan_request(1)).unwrap_err();
        assert!(matches!(err, EngineError::WrongPhase { .. }));
    }

    #[test]
    fn test_config_roundtrip_through_toml() {
        let config = EngineConfig {
            ref_clock_hz: 38_400_000,
            guard_margin_ms: 75,
            fw_block_size: 256,
            ..EngineConfig::default()
        };
        let text = toml::to_string_pretty(&config).unwrap();
        let back: EngineConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.ref_clock_hz, 38_400_000);
        assert_eq!(back.guard_margin_ms, 75);
        assert_eq!(back.fw_block_size, 256);
        assert_eq!(back.max_consecutive_scan_timeouts, 3);
        assert_eq!(back.reset_poll_budget, SOFT_RESET_MAX_POLLS);
    }
}
