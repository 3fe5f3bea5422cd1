//! Boot sequencer: chip identification, soft reset, calibration injection
//! and post-boot register fixups.
//!
//! The sequence is a fixed set of numbered stages. Every stage that issues
//! a pending bus transaction suspends the sequencer; the completion
//! callback re-enters it at the remembered stage.

use tracing::{debug, info, warn};

use super::BootError;
use crate::bus::{Bus, BusStatus, Completion, OpStatus, Transaction, TxnOwner};
use crate::nvs::{self, BurstRecord};
use crate::partition::PartitionTable;
use crate::protocol::constants::*;

/// Attributes supplied by the caller before boot.
#[derive(Debug, Clone, Copy)]
pub struct BootAttrs {
    /// Reference clock feeding the device, in Hz.
    pub ref_clock_hz: u32,
    /// Leave the firmware debug interrupt unmasked.
    pub firmware_debug: bool,
    /// Poll budget for the soft-reset completion bit.
    pub reset_poll_budget: u32,
    /// Poll budget for each indirect top-register handshake.
    pub top_reg_poll_budget: u32,
}

impl Default for BootAttrs {
    fn default() -> Self {
        Self {
            ref_clock_hz: 26_000_000,
            firmware_debug: false,
            reset_poll_budget: SOFT_RESET_MAX_POLLS,
            top_reg_poll_budget: IND_CTRL_MAX_POLLS,
        }
    }
}

/// Sub-stage of one indirect top-register read-modify-write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TopPhase {
    SetReadAddr,
    IssueRead,
    PollRead { polls: u32 },
    FetchData,
    PutData,
    SetWriteAddr,
    IssueWrite,
    PollWrite { polls: u32 },
}

/// Numbered boot stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BootStage {
    Idle,
    /// (2) Probe the chip identity register.
    ChipIdProbe,
    /// (3) Request a soft reset.
    SoftResetIssue,
    /// (3) Poll for the reset-done indication.
    SoftResetPoll { polls: u32 },
    /// (4) Stream calibration bursts into the register file.
    NvsBurst { record: usize, word: usize },
    /// (5) Switch to the working partition.
    SetWorkingPartition,
    /// (6) Mask every device interrupt.
    DisableIrqs,
    /// (7) Identity sanity re-probe.
    ChipIdRecheck,
    /// (8) Indirect top-register fixups.
    TopFixup { index: usize, phase: TopPhase },
    Done,
}

/// Drives the multi-stage bring-up sequence.
pub struct BootSequencer {
    stage: BootStage,
    attrs: BootAttrs,
    nvs_records: Vec<BurstRecord>,
    chip_id: Option<u32>,
    /// Latched value during a top-register read-modify-write.
    fixup_value: u32,
}

impl BootSequencer {
    pub fn new() -> Self {
        Self {
            stage: BootStage::Idle,
            attrs: BootAttrs::default(),
            nvs_records: Vec::new(),
            chip_id: None,
            fixup_value: 0,
        }
    }

    /// Begin the boot sequence. Stage (1) programs the download partition;
    /// the remaining stages run until the first pending transaction.
    pub fn start(
        &mut self,
        bus: &mut dyn Bus,
        attrs: BootAttrs,
        nvs_blob: Option<&[u8]>,
    ) -> Result<OpStatus, BootError> {
        self.attrs = attrs;
        self.nvs_records = match nvs_blob {
            Some(blob) => nvs::parse_burst_records(blob)?,
            None => {
                info!("No calibration blob supplied, injecting built-in defaults");
                nvs::parse_burst_records(&nvs::DEFAULT_NVS)?
            }
        };

        bus.set_partition(&PartitionTable::download(MEM_DOWNLOAD_BASE))?;
        self.goto(BootStage::ChipIdProbe);
        self.run(bus)
    }

    /// Re-enter the sequence from a bus completion.
    pub fn resume(&mut self, bus: &mut dyn Bus, done: Completion) -> Result<OpStatus, BootError> {
        self.absorb(done)?;
        if self.stage == BootStage::Done {
            return Ok(OpStatus::Done);
        }
        self.run(bus)
    }

    pub fn is_done(&self) -> bool {
        self.stage == BootStage::Done
    }

    /// Identity read during boot, if the probe has happened.
    pub fn chip_id(&self) -> Option<u32> {
        self.chip_id
    }

    fn goto(&mut self, next: BootStage) {
        debug!(from = ?self.stage, to = ?next, "boot stage");
        self.stage = next;
    }

    /// Issue transactions for the current stage until one goes pending or
    /// the sequence finishes.
    fn run(&mut self, bus: &mut dyn Bus) -> Result<OpStatus, BootError> {
        loop {
            // The partition switch has no transaction of its own.
            if self.stage == BootStage::SetWorkingPartition {
                bus.set_partition(&PartitionTable::working())?;
                self.goto(BootStage::DisableIrqs);
            }

            let txn = self.stage_txn();
            match bus.submit(txn)? {
                BusStatus::Pending => return Ok(OpStatus::Pending),
                BusStatus::Complete => {
                    let done = bus
                        .take_completion()
                        .ok_or(crate::bus::BusError::MissingCompletion)?;
                    self.absorb(done)?;
                    if self.stage == BootStage::Done {
                        info!(
                            chip_id = ?self.chip_id.map(|v| format!("0x{v:08X}")),
                            "boot sequence complete"
                        );
                        return Ok(OpStatus::Done);
                    }
                }
            }
        }
    }

    /// Build the transaction for the current stage.
    fn stage_txn(&self) -> Transaction {
        let o = TxnOwner::Boot;
        match self.stage {
            BootStage::ChipIdProbe | BootStage::ChipIdRecheck => {
                Transaction::read_reg(o, REG_CHIP_ID)
            }
            BootStage::SoftResetIssue => Transaction::write_reg(o, REG_SOFT_RESET, SOFT_RESET_BIT),
            BootStage::SoftResetPoll { .. } => Transaction::read_reg(o, REG_SOFT_RESET),
            BootStage::NvsBurst { record, word } => {
                let burst = &self.nvs_records[record];
                let addr = REG_AREA_BASE + burst.address as u32 + (word as u32) * 4;
                Transaction::write_reg(o, addr, burst.words[word])
            }
            BootStage::DisableIrqs => {
                Transaction::write_reg(o, REG_INTERRUPT_MASK, self.irq_mask())
            }
            BootStage::TopFixup { index, phase } => {
                let fixup = TOP_REG_FIXUPS[index];
                match phase {
                    TopPhase::SetReadAddr | TopPhase::SetWriteAddr => {
                        Transaction::write_reg(o, REG_IND_ADDR, fixup.addr)
                    }
                    TopPhase::IssueRead => Transaction::write_reg(o, REG_IND_CTRL, IND_CTRL_READ),
                    TopPhase::IssueWrite => Transaction::write_reg(o, REG_IND_CTRL, IND_CTRL_WRITE),
                    TopPhase::PollRead { .. } | TopPhase::PollWrite { .. } => {
                        Transaction::read_reg(o, REG_IND_CTRL)
                    }
                    TopPhase::FetchData => Transaction::read_reg(o, REG_IND_DATA),
                    TopPhase::PutData => {
                        Transaction::write_reg(o, REG_IND_DATA, self.fixup_value)
                    }
                }
            }
            BootStage::Idle | BootStage::SetWorkingPartition | BootStage::Done => {
                unreachable!("no transaction for stage {:?}", self.stage)
            }
        }
    }

    /// Interpret a completed transaction and advance the stage.
    fn absorb(&mut self, done: Completion) -> Result<(), BootError> {
        done.result?;
        let txn = done.txn;

        match self.stage {
            BootStage::ChipIdProbe => {
                let id = txn.reg_value();
                if id != CHIP_ID_SUPPORTED {
                    return Err(BootError::UnsupportedChip { id });
                }
                info!(chip_id = format!("0x{id:08X}"), "chip identified");
                self.chip_id = Some(id);
                self.goto(BootStage::SoftResetIssue);
            }
            BootStage::SoftResetIssue => {
                self.goto(BootStage::SoftResetPoll { polls: 0 });
            }
            BootStage::SoftResetPoll { polls } => {
                if txn.reg_value() & SOFT_RESET_BIT == 0 {
                    debug!(polls = polls + 1, "soft reset complete");
                    self.goto(self.first_nvs_stage());
                } else if polls + 1 >= self.attrs.reset_poll_budget {
                    return Err(BootError::ResetTimeout {
                        polls: self.attrs.reset_poll_budget,
                    });
                } else {
                    self.stage = BootStage::SoftResetPoll { polls: polls + 1 };
                }
            }
            BootStage::NvsBurst { record, word } => {
                let burst = &self.nvs_records[record];
                if word + 1 < burst.words.len() {
                    self.stage = BootStage::NvsBurst {
                        record,
                        word: word + 1,
                    };
                } else if record + 1 < self.nvs_records.len() {
                    self.stage = BootStage::NvsBurst {
                        record: record + 1,
                        word: 0,
                    };
                } else {
                    debug!(records = self.nvs_records.len(), "calibration bursts injected");
                    self.goto(BootStage::SetWorkingPartition);
                }
            }
            BootStage::DisableIrqs => {
                self.goto(BootStage::ChipIdRecheck);
            }
            BootStage::ChipIdRecheck => {
                let id = txn.reg_value();
                if Some(id) != self.chip_id {
                    warn!(
                        was = format!("0x{:08X}", self.chip_id.unwrap_or(0)),
                        now = format!("0x{id:08X}"),
                        "chip identity changed across reset"
                    );
                    return Err(BootError::UnsupportedChip { id });
                }
                self.goto(BootStage::TopFixup {
                    index: 0,
                    phase: TopPhase::SetReadAddr,
                });
            }
            BootStage::TopFixup { index, phase } => {
                self.absorb_top_fixup(index, phase, &txn)?;
            }
            BootStage::Idle | BootStage::SetWorkingPartition | BootStage::Done => {
                return Err(BootError::UnexpectedCompletion)
            }
        }
        Ok(())
    }

    fn absorb_top_fixup(
        &mut self,
        index: usize,
        phase: TopPhase,
        txn: &Transaction,
    ) -> Result<(), BootError> {
        let fixup = TOP_REG_FIXUPS[index];
        let next_phase = match phase {
            TopPhase::SetReadAddr => TopPhase::IssueRead,
            TopPhase::IssueRead => TopPhase::PollRead { polls: 0 },
            TopPhase::PollRead { polls } => {
                if txn.reg_value() & IND_CTRL_DONE != 0 {
                    TopPhase::FetchData
                } else if polls + 1 >= self.attrs.top_reg_poll_budget {
                    return Err(BootError::TopRegTimeout {
                        addr: fixup.addr,
                        polls: self.attrs.top_reg_poll_budget,
                    });
                } else {
                    TopPhase::PollRead { polls: polls + 1 }
                }
            }
            TopPhase::FetchData => {
                let current = txn.reg_value();
                self.fixup_value = (current & !fixup.mask) | self.fixup_set(&fixup);
                debug!(
                    addr = format!("0x{:08X}", fixup.addr),
                    from = format!("0x{current:08X}"),
                    to = format!("0x{:08X}", self.fixup_value),
                    "top register fixup"
                );
                TopPhase::PutData
            }
            TopPhase::PutData => TopPhase::SetWriteAddr,
            TopPhase::SetWriteAddr => TopPhase::IssueWrite,
            TopPhase::IssueWrite => TopPhase::PollWrite { polls: 0 },
            TopPhase::PollWrite { polls } => {
                if txn.reg_value() & IND_CTRL_DONE != 0 {
                    if index + 1 < TOP_REG_FIXUPS.len() {
                        self.goto(BootStage::TopFixup {
                            index: index + 1,
                            phase: TopPhase::SetReadAddr,
                        });
                    } else {
                        self.goto(BootStage::Done);
                    }
                    return Ok(());
                } else if polls + 1 >= self.attrs.top_reg_poll_budget {
                    return Err(BootError::TopRegTimeout {
                        addr: fixup.addr,
                        polls: self.attrs.top_reg_poll_budget,
                    });
                } else {
                    TopPhase::PollWrite { polls: polls + 1 }
                }
            }
        };
        self.stage = BootStage::TopFixup {
            index,
            phase: next_phase,
        };
        Ok(())
    }

    /// The set-bits for a fixup; the clock-source select depends on the
    /// boot attributes.
    fn fixup_set(&self, fixup: &TopRegFixup) -> u32 {
        if fixup.addr == TOP_CLK_SELECT.addr {
            match self.attrs.ref_clock_hz {
                19_200_000 => 0x1,
                26_000_000 => 0x2,
                38_400_000 => 0x3,
                other => {
                    warn!(hz = other, "unknown reference clock, assuming 26 MHz");
                    0x2
                }
            }
        } else {
            fixup.set
        }
    }

    fn irq_mask(&self) -> u32 {
        // Keep the firmware debug event unmasked when requested.
        if self.attrs.firmware_debug {
            INTR_ALL & !INTR_EVENT_A
        } else {
            INTR_ALL
        }
    }

    fn first_nvs_stage(&self) -> BootStage {
        // An empty blob (terminator only) skips straight to the partition
        // switch.
        if self.nvs_records.is_empty() {
            BootStage::SetWorkingPartition
        } else {
            BootStage::NvsBurst { record: 0, word: 0 }
        }
    }
}

impl Default for BootSequencer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MockBus;

    fn scripted_bus() -> MockBus {
        let mut bus = MockBus::new();
        bus.script_reg(REG_CHIP_ID, CHIP_ID_SUPPORTED);
        bus.script_reg(REG_SOFT_RESET, 0); // reset done on first poll
        bus.script_reg(REG_CHIP_ID, CHIP_ID_SUPPORTED);
        // Both fixups: read handshake done, current value 0, write done.
        for _ in 0..TOP_REG_FIXUPS.len() {
            bus.script_reg(REG_IND_CTRL, IND_CTRL_DONE);
            bus.script_reg(REG_IND_DATA, 0);
            bus.script_reg(REG_IND_CTRL, IND_CTRL_DONE);
        }
        bus
    }

    #[test]
    fn test_boot_runs_to_completion_synchronously() {
        let mut bus = scripted_bus();
        let mut boot = BootSequencer::new();
        let status = boot
            .start(&mut bus, BootAttrs::default(), Some(&crate::nvs::DEFAULT_NVS))
            .unwrap();
        assert_eq!(status, OpStatus::Done);
        assert!(boot.is_done());
        assert_eq!(boot.chip_id(), Some(CHIP_ID_SUPPORTED));

        // Download then working partition, in that order, exactly once each.
        assert_eq!(bus.partitions().len(), 2);
        assert_eq!(bus.partitions()[0], PartitionTable::download(MEM_DOWNLOAD_BASE));
        assert_eq!(bus.partitions()[1], PartitionTable::working());

        // All six default calibration words landed in the register file.
        let nvs_writes: Vec<_> = bus
            .writes()
            .iter()
            .filter(|(a, _)| (REG_AREA_BASE + 0x0546..REG_AREA_BASE + 0x0546 + 24).contains(a))
            .collect();
        assert_eq!(nvs_writes.len(), 6);

        // Interrupts were masked.
        assert_eq!(bus.reg_writes(REG_INTERRUPT_MASK), vec![INTR_ALL]);
    }

    #[test]
    fn test_boot_suspends_and_resumes() {
        let mut bus = scripted_bus();
        bus.defer(true);
        let mut boot = BootSequencer::new();
        let mut status = boot.start(&mut bus, BootAttrs::default(), None).unwrap();
        assert_eq!(status, OpStatus::Pending);

        let mut rounds = 0;
        while status == OpStatus::Pending {
            assert!(bus.complete_one(), "boot stalled with no pending txn");
            let done = bus.take_completion().unwrap();
            status = boot.resume(&mut bus, done).unwrap();
            rounds += 1;
            assert!(rounds < 200, "boot did not converge");
        }
        assert!(boot.is_done());
    }

    #[test]
    fn test_unsupported_chip_is_fatal() {
        let mut bus = MockBus::new();
        bus.script_reg(REG_CHIP_ID, 0x1111_2222);
        let mut boot = BootSequencer::new();
        let err = boot
            .start(&mut bus, BootAttrs::default(), None)
            .unwrap_err();
        assert!(matches!(err, BootError::UnsupportedChip { id: 0x1111_2222 }));
    }

    #[test]
    fn test_reset_poll_budget_exhausted() {
        let mut bus = MockBus::new();
        bus.script_reg(REG_CHIP_ID, CHIP_ID_SUPPORTED);
        // Reset bit never clears.
        for _ in 0..SOFT_RESET_MAX_POLLS {
            bus.script_reg(REG_SOFT_RESET, SOFT_RESET_BIT);
        }
        let mut boot = BootSequencer::new();
        let err = boot
            .start(&mut bus, BootAttrs::default(), None)
            .unwrap_err();
        assert!(matches!(err, BootError::ResetTimeout { .. }));
    }

    #[test]
    fn test_reset_poll_budget_is_tunable() {
        let mut bus = MockBus::new();
        bus.script_reg(REG_CHIP_ID, CHIP_ID_SUPPORTED);
        bus.script_reg(REG_SOFT_RESET, SOFT_RESET_BIT);
        bus.script_reg(REG_SOFT_RESET, SOFT_RESET_BIT);
        let attrs = BootAttrs {
            reset_poll_budget: 2,
            ..BootAttrs::default()
        };
        let mut boot = BootSequencer::new();
        let err = boot.start(&mut bus, attrs, None).unwrap_err();
        assert!(matches!(err, BootError::ResetTimeout { polls: 2 }));
    }

    #[test]
    fn test_top_reg_handshake_budget_exhausted() {
        let mut bus = MockBus::new();
        bus.script_reg(REG_CHIP_ID, CHIP_ID_SUPPORTED);
        bus.script_reg(REG_SOFT_RESET, 0);
        bus.script_reg(REG_CHIP_ID, CHIP_ID_SUPPORTED);
        // The indirect handshake done bit never comes up.
        for _ in 0..IND_CTRL_MAX_POLLS {
            bus.script_reg(REG_IND_CTRL, 0);
        }
        let mut boot = BootSequencer::new();
        let err = boot
            .start(&mut bus, BootAttrs::default(), None)
            .unwrap_err();
        assert!(matches!(err, BootError::TopRegTimeout { .. }));
    }

    #[test]
    fn test_clock_select_follows_boot_attrs() {
        let mut bus = scripted_bus();
        let attrs = BootAttrs {
            ref_clock_hz: 38_400_000,
            ..BootAttrs::default()
        };
        let mut boot = BootSequencer::new();
        boot.start(&mut bus, attrs, None).unwrap();

        let data_writes = bus.reg_writes(REG_IND_DATA);
        // First fixup is the clock select; 38.4 MHz selects code 3.
        assert_eq!(data_writes[0] & TOP_CLK_SELECT.mask, 0x3);
    }
}
