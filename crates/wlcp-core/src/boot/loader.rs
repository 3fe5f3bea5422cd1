//! Firmware image loader.
//!
//! Streams a firmware image to device memory in bounded blocks,
//! repartitioning the bus window whenever the write cursor would cross the
//! mapped window's upper bound, and runs the finalize handshake once the
//! last chunk has landed.

use tracing::{debug, info};

use super::BootError;
use crate::bus::{Bus, BusStatus, Completion, OpStatus, Transaction, TxnOwner};
use crate::partition::PartitionTable;
use crate::protocol::constants::*;
use crate::protocol::DeviceInfo;

/// What a finished `load` call produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    /// The chunk was written but the image is not complete yet.
    MoreChunks,
    /// The final chunk landed and the firmware reported init-complete.
    Booted(DeviceInfo),
}

/// Finalize handshake sub-stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FinStage {
    ReadEcpu,
    /// Carries the control value read back, with the run bit ORed in.
    WriteEcpu,
    /// Polls for init-complete. Each poll is its own transaction, so the
    /// dispatch context never spins.
    PollInit { polls: u32 },
    AckInit,
    ReadMboxPtr,
    ReadStaticInfo { addr: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoadStage {
    Idle,
    WriteBlock,
    Finalize(FinStage),
    Done,
}

/// Streams firmware chunks and drives the post-load handshake.
pub struct ImageLoader {
    stage: LoadStage,
    chunk: Vec<u8>,
    offset: usize,
    /// Device-space write cursor.
    cursor: u32,
    final_chunk: bool,
    /// The partition table the loader believes is active.
    mapped: Option<PartitionTable>,
    ecpu_value: u32,
    cmd_mailbox_addr: Option<u32>,
    outcome: Option<LoadOutcome>,
    block_size: usize,
    init_poll_budget: u32,
}

impl ImageLoader {
    pub fn new() -> Self {
        Self {
            stage: LoadStage::Idle,
            chunk: Vec::new(),
            offset: 0,
            cursor: 0,
            final_chunk: false,
            mapped: None,
            ecpu_value: 0,
            cmd_mailbox_addr: None,
            outcome: None,
            block_size: FW_BLOCK_SIZE,
            init_poll_budget: INIT_COMPLETE_MAX_POLLS,
        }
    }

    /// Override the transfer granularity and the init-complete poll budget.
    /// The block size is rounded down to a word multiple.
    pub fn with_tunables(mut self, block_size: usize, init_poll_budget: u32) -> Self {
        self.block_size = (block_size - block_size % WORD_SIZE).max(WORD_SIZE);
        self.init_poll_budget = init_poll_budget;
        self
    }

    /// Tell the loader which partition table is currently programmed, so a
    /// chunk landing inside it does not force a redundant reprogram.
    pub fn assume_mapping(&mut self, table: PartitionTable) {
        self.mapped = Some(table);
    }

    /// Write one image chunk at `base`. With `is_final` set, the finalize
    /// handshake runs after the last block; otherwise the loader reports
    /// [`LoadOutcome::MoreChunks`] and waits for the next call.
    pub fn load(
        &mut self,
        bus: &mut dyn Bus,
        chunk: &[u8],
        base: u32,
        is_final: bool,
    ) -> Result<OpStatus, BootError> {
        if chunk.len() % WORD_SIZE != 0 {
            return Err(BootError::UnalignedImage { len: chunk.len() });
        }
        info!(
            len = chunk.len(),
            base = format!("0x{base:08X}"),
            is_final,
            "loading firmware chunk"
        );
        self.chunk = chunk.to_vec();
        self.offset = 0;
        self.cursor = base;
        self.final_chunk = is_final;
        self.outcome = None;
        self.stage = LoadStage::WriteBlock;
        self.run(bus)
    }

    /// Re-enter the loader from a bus completion.
    pub fn resume(&mut self, bus: &mut dyn Bus, done: Completion) -> Result<OpStatus, BootError> {
        self.absorb(done)?;
        if self.stage == LoadStage::Done {
            return Ok(OpStatus::Done);
        }
        self.run(bus)
    }

    /// Result of the last completed `load` call.
    pub fn outcome(&self) -> Option<&LoadOutcome> {
        self.outcome.as_ref()
    }

    /// Command mailbox address learnt during the finalize handshake.
    pub fn cmd_mailbox_addr(&self) -> Option<u32> {
        self.cmd_mailbox_addr
    }

    fn run(&mut self, bus: &mut dyn Bus) -> Result<OpStatus, BootError> {
        loop {
            let txn = match self.next_txn(bus)? {
                Some(txn) => txn,
                None => return Ok(OpStatus::Done),
            };
            match bus.submit(txn)? {
                BusStatus::Pending => return Ok(OpStatus::Pending),
                BusStatus::Complete => {
                    let done = bus
                        .take_completion()
                        .ok_or(crate::bus::BusError::MissingCompletion)?;
                    self.absorb(done)?;
                    if self.stage == LoadStage::Done {
                        return Ok(OpStatus::Done);
                    }
                }
            }
        }
    }

    /// Build the next transaction, reprogramming the partition first when
    /// the block would cross the mapped window. Returns `None` when the
    /// chunk is finished without a finalize handshake.
    fn next_txn(&mut self, bus: &mut dyn Bus) -> Result<Option<Transaction>, BootError> {
        let o = TxnOwner::Loader;
        match self.stage {
            LoadStage::WriteBlock => {
                if self.offset >= self.chunk.len() {
                    if self.final_chunk {
                        self.stage = LoadStage::Finalize(FinStage::ReadEcpu);
                        return self.next_txn(bus);
                    }
                    debug!(written = self.offset, "chunk complete, more portions expected");
                    self.outcome = Some(LoadOutcome::MoreChunks);
                    self.stage = LoadStage::Done;
                    return Ok(None);
                }
                let block_len = (self.chunk.len() - self.offset).min(self.block_size);
                self.ensure_mapped(bus, block_len as u32)?;
                let data = self.chunk[self.offset..self.offset + block_len].to_vec();
                Ok(Some(Transaction::write(o, self.cursor, data)))
            }
            LoadStage::Finalize(fin) => Ok(Some(match fin {
                FinStage::ReadEcpu => Transaction::read_reg(o, REG_ECPU_CONTROL),
                FinStage::WriteEcpu => {
                    Transaction::write_reg(o, REG_ECPU_CONTROL, self.ecpu_value | ECPU_RUN_BIT)
                }
                FinStage::PollInit { .. } => Transaction::read_reg(o, REG_INTERRUPT_NO_CLEAR),
                FinStage::AckInit => {
                    Transaction::write_reg(o, REG_INTERRUPT_ACK, INTR_INIT_COMPLETE)
                }
                FinStage::ReadMboxPtr => Transaction::read_reg(o, REG_CMD_MAILBOX_PTR),
                FinStage::ReadStaticInfo { addr } => Transaction::read(o, addr, DeviceInfo::SIZE),
            })),
            LoadStage::Idle | LoadStage::Done => Err(BootError::UnexpectedCompletion),
        }
    }

    /// Reprogram the window iff the next block would cross its bound.
    fn ensure_mapped(&mut self, bus: &mut dyn Bus, block_len: u32) -> Result<(), BootError> {
        let needs_remap = match &self.mapped {
            Some(table) => !table.memory().contains(self.cursor, block_len),
            None => true,
        };
        if needs_remap {
            let table = PartitionTable::download(self.cursor);
            debug!(
                cursor = format!("0x{:08X}", self.cursor),
                "write cursor crossed window bound, repartitioning"
            );
            bus.set_partition(&table)?;
            self.mapped = Some(table);
        }
        Ok(())
    }

    fn absorb(&mut self, done: Completion) -> Result<(), BootError> {
        done.result?;
        let txn = done.txn;

        match self.stage {
            LoadStage::WriteBlock => {
                let written = txn.buffer.len();
                self.offset += written;
                self.cursor += written as u32;
            }
            LoadStage::Finalize(fin) => {
                let next = match fin {
                    FinStage::ReadEcpu => {
                        self.ecpu_value = txn.reg_value();
                        FinStage::WriteEcpu
                    }
                    FinStage::WriteEcpu => FinStage::PollInit { polls: 0 },
                    FinStage::PollInit { polls } => {
                        if txn.reg_value() & INTR_INIT_COMPLETE != 0 {
                            debug!(polls = polls + 1, "firmware init complete");
                            FinStage::AckInit
                        } else if polls + 1 >= self.init_poll_budget {
                            return Err(BootError::InitCompleteTimeout {
                                polls: self.init_poll_budget,
                            });
                        } else {
                            FinStage::PollInit { polls: polls + 1 }
                        }
                    }
                    FinStage::AckInit => FinStage::ReadMboxPtr,
                    FinStage::ReadMboxPtr => {
                        let addr = txn.reg_value();
                        self.cmd_mailbox_addr = Some(addr);
                        FinStage::ReadStaticInfo { addr }
                    }
                    FinStage::ReadStaticInfo { .. } => {
                        let info = DeviceInfo::from_bytes(&txn.buffer)?;
                        info!(
                            mac = format!(
                                "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
                                info.mac_address[0],
                                info.mac_address[1],
                                info.mac_address[2],
                                info.mac_address[3],
                                info.mac_address[4],
                                info.mac_address[5]
                            ),
                            fw = %info.fw_version,
                            "firmware booted"
                        );
                        self.outcome = Some(LoadOutcome::Booted(info));
                        self.stage = LoadStage::Done;
                        return Ok(());
                    }
                };
                self.stage = LoadStage::Finalize(next);
            }
            LoadStage::Idle | LoadStage::Done => return Err(BootError::UnexpectedCompletion),
        }
        Ok(())
    }
}

impl Default for ImageLoader {
    fn default() -> Self {
        Self::new()
    }
}
