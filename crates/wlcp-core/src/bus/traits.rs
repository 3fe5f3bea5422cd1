//! Bus transaction layer abstraction.
//!
//! Defines the [`Bus`] trait consumed by every state machine in the engine,
//! allowing different implementations (platform SPI/SDIO glue, mock).
//!
//! The engine is single threaded and cooperative: `submit` either finishes
//! a transaction inline (`Complete`, with the completion immediately
//! retrievable) or queues it (`Pending`), in which case the completion is
//! surfaced later through `take_completion` and the issuing state machine
//! resumes from its saved stage.

use thiserror::Error;

use crate::partition::PartitionTable;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("Transaction failed at address 0x{address:08X}: {message}")]
    TransactionFailed { address: u32, message: String },

    #[error("Address 0x{address:08X} not mapped by the active partition")]
    Unmapped { address: u32 },

    #[error("Transaction slot already in flight for {owner:?}")]
    SlotBusy { owner: TxnOwner },

    #[error("Bus reported completion but none was queued")]
    MissingCompletion,
}

/// Immediate status of a submitted transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusStatus {
    /// Finished synchronously; its completion is retrievable right away.
    Complete,
    /// Queued; the completion arrives later.
    Pending,
}

/// Status of a state-machine operation.
///
/// Deliberately distinct from [`BusStatus`]: one describes a single bus
/// transaction, the other a multi-transaction operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpStatus {
    /// The operation ran to completion.
    Done,
    /// The operation suspended on a pending transaction and will be
    /// resumed from a completion.
    Pending,
}

/// Transfer direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

/// State machine that issued a transaction; used to route its completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxnOwner {
    Boot,
    Loader,
    Config,
    Mailbox,
    Scan,
}

/// A single addressed bus transaction.
///
/// Exclusively owned by the issuing state machine until completion; for
/// reads, the buffer length determines the transfer size and the bus fills
/// it before delivering the completion.
#[derive(Debug, Clone)]
pub struct Transaction {
    pub direction: Direction,
    pub address: u32,
    pub buffer: Vec<u8>,
    pub owner: TxnOwner,
}

impl Transaction {
    pub fn read(owner: TxnOwner, address: u32, len: usize) -> Self {
        Self {
            direction: Direction::Read,
            address,
            buffer: vec![0; len],
            owner,
        }
    }

    pub fn write(owner: TxnOwner, address: u32, data: Vec<u8>) -> Self {
        Self {
            direction: Direction::Write,
            address,
            buffer: data,
            owner,
        }
    }

    /// Convenience for the ubiquitous 32-bit register write.
    pub fn write_reg(owner: TxnOwner, address: u32, value: u32) -> Self {
        Self::write(owner, address, value.to_le_bytes().to_vec())
    }

    /// Convenience for the ubiquitous 32-bit register read.
    pub fn read_reg(owner: TxnOwner, address: u32) -> Self {
        Self::read(owner, address, 4)
    }

    /// Interpret the (completed) buffer as a little-endian register value.
    pub fn reg_value(&self) -> u32 {
        let mut raw = [0u8; 4];
        let n = self.buffer.len().min(4);
        raw[..n].copy_from_slice(&self.buffer[..n]);
        u32::from_le_bytes(raw)
    }
}

/// A finished transaction handed back to its issuing state machine.
#[derive(Debug)]
pub struct Completion {
    pub txn: Transaction,
    pub result: Result<(), BusError>,
}

/// Abstract bus transaction interface.
///
/// This trait enables:
/// - Platform implementations over SPI/SDIO-like links
/// - Mock implementation for unit testing
pub trait Bus {
    /// Submit a transaction. `Complete` means the matching completion is
    /// already retrievable via [`Bus::take_completion`]; `Pending` means it
    /// will appear there once the bus layer finishes the transfer.
    ///
    /// Transactions submitted in one dispatch turn are delivered to the
    /// device in submission order.
    fn submit(&mut self, txn: Transaction) -> Result<BusStatus, BusError>;

    /// Atomically reprogram the device's window mapping. Ordering follows
    /// the transaction queue, so transfers submitted afterwards see the new
    /// mapping; no completion is delivered for the reprogramming itself.
    fn set_partition(&mut self, table: &PartitionTable) -> Result<(), BusError>;

    /// Retrieve the next finished transaction, if any.
    fn take_completion(&mut self) -> Option<Completion>;
}
