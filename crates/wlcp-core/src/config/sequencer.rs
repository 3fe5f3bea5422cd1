//! Ordered configuration push.
//!
//! The device only accepts configuration in a fixed order, with a hard
//! barrier at the join: AID, HT parameters, block-ack sessions and keys are
//! rejected until the firmware has confirmed the join command. The
//! sequencer walks a fixed step table, emits a command for every dirty
//! [`ConfigStore`] slot a step covers, and parks at the join gate until the
//! join-complete event arrives.
//!
//! Each command is two bus writes: the encoded record to the command
//! mailbox, then the doorbell to the interrupt trigger register. The status
//! word the firmware writes back into the record header is read back and
//! checked before the next command goes out.

use byteorder::{LittleEndian, WriteBytesExt};
use std::collections::VecDeque;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::bus::{Bus, BusError, BusStatus, Completion, OpStatus, Transaction, TxnOwner};
use crate::mailbox::{EngineSignal, EventMailbox, MailboxError, Registration, SignalQueue};
use crate::protocol::command::{
    encode_command, Band, CommandError, CommandHeader, CommandId, TemplateId,
};
use crate::protocol::constants::{INTR_TRIG_CMD, REG_INTERRUPT_TRIG};
use crate::protocol::event::{EventId, EventRecord};

use super::store::ConfigStore;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Command error: {0}")]
    Command(#[from] CommandError),

    #[error("Mailbox error: {0}")]
    Mailbox(#[from] MailboxError),

    #[error("Invalid {what}: {reason}")]
    InvalidValue { what: &'static str, reason: String },

    #[error("Command mailbox address not known yet")]
    NotReady,

    #[error("Sequencer received a completion it did not issue")]
    UnexpectedCompletion,
}

/// Handle marking the join gate's temporary event registration.
pub const JOIN_GATE_HANDLE: u64 = u64::MAX;

/// Configuration steps, in the order the device accepts them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepId {
    RadioParams,
    RxConfig,
    RatePolicy,
    AcParams,
    PreJoinTemplates,
    BeaconFilter,
    EventMask,
    KeepAlive,
    ScanParams,
    Join,
    /// Barrier: wait for the firmware's join confirmation.
    JoinGate,
    Aid,
    PostJoinTemplates,
    HtCapabilities,
    HtOperation,
    BaPolicy,
    Keys,
}

const STEPS: &[StepId] = &[
    StepId::RadioParams,
    StepId::RxConfig,
    StepId::RatePolicy,
    StepId::AcParams,
    StepId::PreJoinTemplates,
    StepId::BeaconFilter,
    StepId::EventMask,
    StepId::KeepAlive,
    StepId::ScanParams,
    StepId::Join,
    StepId::JoinGate,
    StepId::Aid,
    StepId::PostJoinTemplates,
    StepId::HtCapabilities,
    StepId::HtOperation,
    StepId::BaPolicy,
    StepId::Keys,
];

const PRE_JOIN_TEMPLATES: &[TemplateId] =
    &[TemplateId::Beacon, TemplateId::ProbeRequest, TemplateId::NullData];
const POST_JOIN_TEMPLATES: &[TemplateId] = &[TemplateId::PsPoll, TemplateId::QosNull];

/// Phase of the command currently on the wire.
enum CmdPhase {
    Idle,
    /// Writing the encoded record to the command mailbox.
    Payload(CommandId, Vec<u8>),
    /// Ringing the doorbell.
    Trigger(CommandId),
    /// Reading the header back to check the firmware's status word.
    ReadBack(CommandId),
}

/// Walks the configuration step table, pushing dirty store slots to the
/// device. Suspends on pending bus transactions and on the join gate.
pub struct ConfigSequencer {
    index: usize,
    running: bool,
    queue: VecDeque<(CommandId, Vec<u8>)>,
    phase: CmdPhase,
    cmd_addr: Option<u32>,
    awaiting_join: bool,
    /// Registration displaced while the join gate holds the slot.
    saved_join: Option<Option<Registration>>,
    signals: SignalQueue,
}

impl ConfigSequencer {
    pub fn new(signals: SignalQueue) -> Self {
        Self {
            index: 0,
            running: false,
            queue: VecDeque::new(),
            phase: CmdPhase::Idle,
            cmd_addr: None,
            awaiting_join: false,
            saved_join: None,
            signals,
        }
    }

    /// Record the command mailbox address reported by the booted firmware.
    pub fn set_cmd_address(&mut self, addr: u32) {
        self.cmd_addr = Some(addr);
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn is_awaiting_join(&self) -> bool {
        self.awaiting_join
    }

    /// Start a configuration run over every dirty store slot. Returns
    /// `Pending` immediately if a run is already in progress; the active
    /// run picks nothing up retroactively, so the engine re-runs once it
    /// finishes.
    pub fn run<B: Bus>(
        &mut self,
        bus: &mut B,
        store: &mut ConfigStore,
        mailbox: &mut EventMailbox,
    ) -> Result<OpStatus, ConfigError> {
        if self.cmd_addr.is_none() {
            return Err(ConfigError::NotReady);
        }
        if self.running {
            trace!("configuration run already in progress");
            return Ok(OpStatus::Pending);
        }
        self.running = true;
        self.index = 0;
        debug!("configuration run started");
        self.pump(bus, store, mailbox)
    }

    /// Feed a completed bus transaction back in and continue the run.
    pub fn resume<B: Bus>(
        &mut self,
        bus: &mut B,
        store: &mut ConfigStore,
        mailbox: &mut EventMailbox,
        done: Completion,
    ) -> Result<OpStatus, ConfigError> {
        self.absorb(done).inspect_err(|_| self.abort(mailbox))?;
        self.pump(bus, store, mailbox)
    }

    /// The join confirmation arrived: tear down the gate, mark the store
    /// joined, and continue into the post-join steps.
    pub fn on_join_observed<B: Bus>(
        &mut self,
        bus: &mut B,
        store: &mut ConfigStore,
        mailbox: &mut EventMailbox,
    ) -> Result<OpStatus, ConfigError> {
        if !self.awaiting_join {
            trace!("join observed outside a gate; ignored");
            return Ok(OpStatus::Done);
        }
        self.awaiting_join = false;
        store.set_joined(true);
        if let Some(previous) = self.saved_join.take() {
            mailbox.restore(EventId::JoinComplete, previous);
        }
        self.index += 1;
        debug!("join confirmed; continuing post-join configuration");
        self.pump(bus, store, mailbox)
    }

    fn pump<B: Bus>(
        &mut self,
        bus: &mut B,
        store: &mut ConfigStore,
        mailbox: &mut EventMailbox,
    ) -> Result<OpStatus, ConfigError> {
        loop {
            // Finish the command currently on the wire.
            if let Some(txn) = self.phase_txn() {
                match bus.submit(txn)? {
                    BusStatus::Pending => return Ok(OpStatus::Pending),
                    BusStatus::Complete => {
                        let done = bus
                            .take_completion()
                            .ok_or(BusError::MissingCompletion)?;
                        self.absorb(done).inspect_err(|_| self.abort(mailbox))?;
                        continue;
                    }
                }
            }

            // Next queued command of the current step.
            if let Some((id, cmd)) = self.queue.pop_front() {
                trace!(?id, len = cmd.len(), "sending configuration command");
                self.phase = CmdPhase::Payload(id, cmd);
                continue;
            }

            // Advance the step table.
            let Some(&step) = STEPS.get(self.index) else {
                self.running = false;
                debug!("configuration run complete");
                return Ok(OpStatus::Done);
            };

            if step == StepId::JoinGate {
                if store.join.get().is_some() && !store.joined() {
                    self.arm_gate(mailbox);
                    return Ok(OpStatus::Pending);
                }
                self.index += 1;
                continue;
            }

            match self.build_step(step, store) {
                Ok(cmds) => {
                    self.index += 1;
                    self.queue.extend(cmds);
                }
                Err(err) => {
                    // Fail forward: already-sent commands stand, the run
                    // stops here and the offending slot stays dirty.
                    warn!(?step, %err, "configuration step rejected");
                    self.abort(mailbox);
                    return Err(err);
                }
            }
        }
    }

    fn phase_txn(&self) -> Option<Transaction> {
        let addr = self.cmd_addr?;
        match &self.phase {
            CmdPhase::Idle => None,
            CmdPhase::Payload(_, cmd) => {
                Some(Transaction::write(TxnOwner::Config, addr, cmd.clone()))
            }
            CmdPhase::Trigger(_) => Some(Transaction::write_reg(
                TxnOwner::Config,
                REG_INTERRUPT_TRIG,
                INTR_TRIG_CMD,
            )),
            CmdPhase::ReadBack(_) => {
                Some(Transaction::read(TxnOwner::Config, addr, CommandHeader::SIZE))
            }
        }
    }

    fn absorb(&mut self, done: Completion) -> Result<(), ConfigError> {
        done.result?;
        self.phase = match std::mem::replace(&mut self.phase, CmdPhase::Idle) {
            CmdPhase::Idle => return Err(ConfigError::UnexpectedCompletion),
            CmdPhase::Payload(id, _) => CmdPhase::Trigger(id),
            CmdPhase::Trigger(id) => CmdPhase::ReadBack(id),
            CmdPhase::ReadBack(id) => {
                let header = CommandHeader::from_bytes(&done.txn.buffer)?;
                if header.status != 0 {
                    return Err(CommandError::Rejected {
                        id,
                        status: header.status,
                    }
                    .into());
                }
                CmdPhase::Idle
            }
        };
        Ok(())
    }

    /// Stop the run, dropping queued commands and any armed gate.
    fn abort(&mut self, mailbox: &mut EventMailbox) {
        self.running = false;
        self.queue.clear();
        self.phase = CmdPhase::Idle;
        if self.awaiting_join {
            self.awaiting_join = false;
            if let Some(previous) = self.saved_join.take() {
                mailbox.restore(EventId::JoinComplete, previous);
            }
        }
    }

    /// Hijack the join-complete registration with a sink that raises
    /// [`EngineSignal::JoinObserved`], saving whatever was there.
    fn arm_gate(&mut self, mailbox: &mut EventMailbox) {
        let queue = self.signals.clone();
        let sink = Box::new(move |_id: EventId, _rec: &EventRecord| {
            queue.borrow_mut().push_back(EngineSignal::JoinObserved);
        });
        let previous = mailbox.replace(EventId::JoinComplete, sink, JOIN_GATE_HANDLE);
        self.saved_join = Some(previous);
        self.awaiting_join = true;
        debug!("join gate armed");
    }

    /// Encode the commands a step owes, clearing the dirty flags of what
    /// it picks up. Steps whose prerequisites are missing (post-join
    /// before the join confirms) contribute nothing and stay dirty.
    fn build_step(
        &self,
        step: StepId,
        store: &mut ConfigStore,
    ) -> Result<Vec<(CommandId, Vec<u8>)>, ConfigError> {
        let mut cmds = Vec::new();
        let joined = store.joined();
        let join_dependent_ready = joined || store.join.get().is_none();

        match step {
            StepId::RadioParams => {
                if store.radio.is_dirty() {
                    let v = store.radio.get().unwrap();
                    validate_channel("radio channel", v.channel, v.band)?;
                    cmds.push((CommandId::RadioParams, v.to_bytes()));
                    store.radio.clear_dirty();
                }
            }
            StepId::RxConfig => {
                if store.rx_config.is_dirty() {
                    cmds.push((CommandId::RxConfig, store.rx_config.get().unwrap().to_bytes()));
                    store.rx_config.clear_dirty();
                }
            }
            StepId::RatePolicy => {
                if store.rate_policy.is_dirty() {
                    let v = store.rate_policy.get().unwrap();
                    if v.enabled_rates == 0 {
                        return Err(ConfigError::InvalidValue {
                            what: "rate policy",
                            reason: "no rates enabled".into(),
                        });
                    }
                    cmds.push((CommandId::RatePolicy, v.to_bytes()));
                    store.rate_policy.clear_dirty();
                }
            }
            StepId::AcParams => {
                for slot in &mut store.ac_params {
                    if slot.is_dirty() {
                        cmds.push((CommandId::AcParams, slot.get().unwrap().to_bytes()?));
                        slot.clear_dirty();
                    }
                }
            }
            StepId::PreJoinTemplates => {
                collect_templates(store, PRE_JOIN_TEMPLATES, &mut cmds);
            }
            StepId::BeaconFilter => {
                if store.beacon_filter.is_dirty() {
                    cmds.push((
                        CommandId::BeaconFilter,
                        store.beacon_filter.get().unwrap().to_bytes(),
                    ));
                    store.beacon_filter.clear_dirty();
                }
            }
            StepId::EventMask => {
                if store.event_mask.is_dirty() {
                    let mut payload = Vec::with_capacity(4);
                    payload
                        .write_u32::<LittleEndian>(*store.event_mask.get().unwrap())
                        .unwrap();
                    cmds.push((CommandId::EventMask, payload));
                    store.event_mask.clear_dirty();
                }
            }
            StepId::KeepAlive => {
                if store.keep_alive.is_dirty() {
                    let v = store.keep_alive.get().unwrap();
                    if v.enabled && v.interval_ms == 0 {
                        return Err(ConfigError::InvalidValue {
                            what: "keep-alive interval",
                            reason: "enabled with a zero interval".into(),
                        });
                    }
                    cmds.push((CommandId::KeepAlive, v.to_bytes()));
                    store.keep_alive.clear_dirty();
                }
            }
            StepId::ScanParams => {
                if store.scan_params.is_dirty() {
                    cmds.push((CommandId::ScanParams, store.scan_params.get().unwrap().to_bytes()));
                    store.scan_params.clear_dirty();
                }
            }
            StepId::Join => {
                if store.join.is_dirty() {
                    let v = store.join.get().unwrap();
                    validate_channel("join channel", v.channel, v.band)?;
                    cmds.push((CommandId::Join, v.to_bytes()));
                    store.join.clear_dirty();
                }
            }
            StepId::JoinGate => unreachable!("gate handled by the pump"),
            StepId::Aid => {
                if store.aid.is_dirty() && joined {
                    let mut payload = Vec::with_capacity(4);
                    payload
                        .write_u16::<LittleEndian>(*store.aid.get().unwrap())
                        .unwrap();
                    payload.write_u16::<LittleEndian>(0).unwrap();
                    cmds.push((CommandId::SetAid, payload));
                    store.aid.clear_dirty();
                }
            }
            StepId::PostJoinTemplates => {
                if joined {
                    collect_templates(store, POST_JOIN_TEMPLATES, &mut cmds);
                }
            }
            StepId::HtCapabilities => {
                if store.ht_capabilities.is_dirty() && joined {
                    cmds.push((
                        CommandId::HtCapabilities,
                        store.ht_capabilities.get().unwrap().to_bytes(),
                    ));
                    store.ht_capabilities.clear_dirty();
                }
            }
            StepId::HtOperation => {
                if store.ht_operation.is_dirty() && joined {
                    cmds.push((
                        CommandId::HtOperation,
                        store.ht_operation.get().unwrap().to_bytes(),
                    ));
                    store.ht_operation.clear_dirty();
                }
            }
            StepId::BaPolicy => {
                if store.ba_policy.is_dirty() && joined {
                    cmds.push((CommandId::BaSession, store.ba_policy.get().unwrap().to_bytes()));
                    store.ba_policy.clear_dirty();
                }
            }
            StepId::Keys => {
                if join_dependent_ready {
                    let mut clean = Vec::new();
                    for (slot, state) in store.keys.dirty_slots() {
                        if let super::keys::KeySlot::Set(material) = state {
                            material.validate().map_err(|reason| {
                                ConfigError::InvalidValue {
                                    what: "key material",
                                    reason,
                                }
                            })?;
                        }
                        if let Some(payload) = store.keys.encode_slot(slot) {
                            cmds.push((CommandId::SetKey, payload));
                        }
                        clean.push(slot);
                    }
                    for slot in clean {
                        store.keys.clear_dirty(slot);
                    }
                }
            }
        }

        // Encoded commands to wire records.
        cmds.into_iter()
            .map(|(id, payload)| Ok((id, encode_command(id, &payload)?)))
            .collect()
    }
}

fn collect_templates(
    store: &mut ConfigStore,
    which: &[TemplateId],
    cmds: &mut Vec<(CommandId, Vec<u8>)>,
) {
    for id in which {
        if let Some(slot) = store.templates.get_mut(id)
            && slot.is_dirty()
        {
            cmds.push((CommandId::SetTemplate, slot.get().unwrap().to_bytes()));
            slot.clear_dirty();
        }
    }
}

fn validate_channel(what: &'static str, channel: u8, band: Band) -> Result<(), ConfigError> {
    let ok = match band {
        Band::Band2Ghz => (1..=14).contains(&channel),
        Band::Band5Ghz => (36..=165).contains(&channel),
    };
    if ok {
        Ok(())
    } else {
        Err(ConfigError::InvalidValue {
            what,
            reason: format!("channel {channel} not valid on {band:?}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MockBus;
    use crate::config::keys::{CipherSuite, KeyMaterial};
    use crate::protocol::command::{JoinParams, RadioParams, RatePolicy, RxConfig};
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;

    const CMD_ADDR: u32 = 0x0002_9000;

    fn setup() -> (MockBus, ConfigStore, EventMailbox, ConfigSequencer, SignalQueue) {
        let mut bus = MockBus::new();
        bus.relax_mapping();
        let signals: SignalQueue = Rc::new(RefCell::new(VecDeque::new()));
        let mut seq = ConfigSequencer::new(signals.clone());
        seq.set_cmd_address(CMD_ADDR);
        (bus, ConfigStore::new(), EventMailbox::new(), seq, signals)
    }

    fn radio() -> RadioParams {
        RadioParams {
            channel: 6,
            band: Band::Band2Ghz,
            tx_power: 20,
            rts_threshold: 2347,
            frag_threshold: 2346,
        }
    }

    fn sent_ids(bus: &MockBus) -> Vec<u16> {
        bus.writes_to(CMD_ADDR)
            .iter()
            .map(|cmd| CommandHeader::from_bytes(cmd).unwrap().id)
            .collect()
    }

    #[test]
    fn test_emission_follows_table_order() {
        let (mut bus, mut store, mut mbox, mut seq, _sig) = setup();
        // Stored out of order on purpose.
        store.rate_policy.set(RatePolicy {
            index: 0,
            enabled_rates: 0x0F,
            short_retry_limit: 7,
            long_retry_limit: 4,
        });
        store.radio.set(radio());
        store.rx_config.set(RxConfig {
            config: 0x10,
            filter: 0x03,
        });

        let status = seq.run(&mut bus, &mut store, &mut mbox).unwrap();
        assert_eq!(status, OpStatus::Done);
        assert_eq!(
            sent_ids(&bus),
            vec![
                CommandId::RadioParams as u16,
                CommandId::RxConfig as u16,
                CommandId::RatePolicy as u16,
            ]
        );
        // Every command rang the doorbell once.
        assert_eq!(bus.reg_writes(REG_INTERRUPT_TRIG).len(), 3);
    }

    #[test]
    fn test_second_run_sends_nothing() {
        let (mut bus, mut store, mut mbox, mut seq, _sig) = setup();
        store.radio.set(radio());

        seq.run(&mut bus, &mut store, &mut mbox).unwrap();
        bus.clear_writes();

        let status = seq.run(&mut bus, &mut store, &mut mbox).unwrap();
        assert_eq!(status, OpStatus::Done);
        assert!(bus.writes_to(CMD_ADDR).is_empty());
    }

    #[test]
    fn test_join_gate_blocks_then_releases() {
        let (mut bus, mut store, mut mbox, mut seq, signals) = setup();
        store.join.set(JoinParams {
            bssid: [2; 6],
            channel: 11,
            band: Band::Band2Ghz,
            beacon_interval_ms: 100,
            dtim_period: 1,
            basic_rates: 0x0F,
            ssid: b"net".to_vec(),
        });
        store.aid.set(42);

        let status = seq.run(&mut bus, &mut store, &mut mbox).unwrap();
        assert_eq!(status, OpStatus::Pending);
        assert!(seq.is_awaiting_join());
        // Join went out, AID is still held behind the gate.
        assert_eq!(sent_ids(&bus), vec![CommandId::Join as u16]);
        assert_eq!(
            mbox.registered_handle(EventId::JoinComplete),
            Some(JOIN_GATE_HANDLE)
        );

        // The gate sink raises the signal when the event record lands.
        let raw = {
            let mut r = vec![0u8; crate::protocol::constants::EVENT_RECORD_SIZE];
            r[..4].copy_from_slice(&EventId::JoinComplete.bit().to_le_bytes());
            r
        };
        let record = EventRecord::from_bytes(&raw).unwrap();
        if let Some(mut reg) = mbox.unregister(EventId::JoinComplete) {
            reg.sink.on_event(EventId::JoinComplete, &record);
            mbox.restore(EventId::JoinComplete, Some(reg));
        }
        assert_eq!(
            signals.borrow_mut().pop_front(),
            Some(EngineSignal::JoinObserved)
        );

        let status = seq.on_join_observed(&mut bus, &mut store, &mut mbox).unwrap();
        assert_eq!(status, OpStatus::Done);
        assert!(store.joined());
        // Gate gone, AID delivered.
        assert_eq!(mbox.registered_handle(EventId::JoinComplete), None);
        assert_eq!(
            sent_ids(&bus),
            vec![CommandId::Join as u16, CommandId::SetAid as u16]
        );
    }

    #[test]
    fn test_post_join_values_wait_without_join() {
        let (mut bus, mut store, mut mbox, mut seq, _sig) = setup();
        store.aid.set(7);

        let status = seq.run(&mut bus, &mut store, &mut mbox).unwrap();
        assert_eq!(status, OpStatus::Done);
        assert!(bus.writes_to(CMD_ADDR).is_empty());
        // Still owed to the device.
        assert!(store.aid.is_dirty());
    }

    #[test]
    fn test_invalid_value_fails_forward() {
        let (mut bus, mut store, mut mbox, mut seq, _sig) = setup();
        store.radio.set(radio());
        store.set_key(
            0,
            KeyMaterial {
                cipher: CipherSuite::Wep,
                key: vec![0; 9], // not a WEP length
            },
        );

        let err = seq.run(&mut bus, &mut store, &mut mbox).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
        // The radio command before the bad key already went out and stays.
        assert_eq!(sent_ids(&bus), vec![CommandId::RadioParams as u16]);
        assert!(!seq.is_running());
        assert!(store.keys.any_dirty());
    }

    #[test]
    fn test_invalid_channel_rejected() {
        let (mut bus, mut store, mut mbox, mut seq, _sig) = setup();
        let mut bad = radio();
        bad.channel = 200;
        store.radio.set(bad);

        assert!(seq.run(&mut bus, &mut store, &mut mbox).is_err());
        assert!(bus.writes_to(CMD_ADDR).is_empty());
    }

    #[test]
    fn test_rejected_status_aborts_run() {
        let (mut bus, mut store, mut mbox, mut seq, _sig) = setup();
        store.radio.set(radio());
        // Firmware writes a failure status into the record header.
        let mut header = vec![0u8; CommandHeader::SIZE];
        header[..2].copy_from_slice(&(CommandId::RadioParams as u16).to_le_bytes());
        header[2..4].copy_from_slice(&0x0005u16.to_le_bytes());
        bus.script_read(CMD_ADDR, header);

        let err = seq.run(&mut bus, &mut store, &mut mbox).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Command(CommandError::Rejected { status: 5, .. })
        ));
        assert!(!seq.is_running());
    }

    #[test]
    fn test_deferred_run_resumes_to_completion() {
        let (mut bus, mut store, mut mbox, mut seq, _sig) = setup();
        store.radio.set(radio());
        store.rx_config.set(RxConfig { config: 1, filter: 2 });
        bus.defer(true);

        let mut status = seq.run(&mut bus, &mut store, &mut mbox).unwrap();
        let mut guard = 0;
        while status == OpStatus::Pending {
            assert!(bus.complete_one(), "sequencer stalled");
            let done = bus.take_completion().unwrap();
            status = seq.resume(&mut bus, &mut store, &mut mbox, done).unwrap();
            guard += 1;
            assert!(guard < 32);
        }
        assert_eq!(
            sent_ids(&bus),
            vec![CommandId::RadioParams as u16, CommandId::RxConfig as u16]
        );
    }
}
