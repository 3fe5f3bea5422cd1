//! Mock bus for testing the engine's state machines.

use std::collections::{HashMap, HashSet, VecDeque};

use tracing::trace;

use super::traits::{Bus, BusError, BusStatus, Completion, Direction, Transaction, TxnOwner};
use crate::partition::PartitionTable;

/// Mock bus with a captured write log, scripted read data, and deferrable
/// completions for exercising the suspend/resume paths.
#[derive(Default)]
pub struct MockBus {
    /// Captured writes as (address, data).
    write_log: Vec<(u32, Vec<u8>)>,
    /// Scripted read responses, per address, consumed front to back.
    read_scripts: HashMap<u32, VecDeque<Vec<u8>>>,
    /// Every partition table programmed, in order.
    partition_log: Vec<PartitionTable>,
    /// Finished transactions not yet collected.
    completions: VecDeque<Completion>,
    /// Deferred transactions waiting for `complete_one`.
    pending: VecDeque<Transaction>,
    /// Owners with an undelivered pending transaction.
    in_flight: HashSet<TxnOwner>,
    /// When set, submissions are queued instead of completing inline.
    defer: bool,
    /// Addresses whose next transaction fails.
    fail_addresses: HashSet<u32>,
    /// Reject transfers outside the active partition.
    strict_mapping: bool,
}

impl MockBus {
    pub fn new() -> Self {
        Self {
            strict_mapping: true,
            ..Self::default()
        }
    }

    /// Queue raw read data for an address.
    pub fn script_read(&mut self, address: u32, data: Vec<u8>) {
        self.read_scripts.entry(address).or_default().push_back(data);
    }

    /// Queue a 32-bit register read value.
    pub fn script_reg(&mut self, address: u32, value: u32) {
        self.script_read(address, value.to_le_bytes().to_vec());
    }

    /// Defer all following submissions; they complete only via
    /// [`MockBus::complete_one`].
    pub fn defer(&mut self, on: bool) {
        self.defer = on;
    }

    /// Fail the next transaction touching `address`.
    pub fn fail_at(&mut self, address: u32) {
        self.fail_addresses.insert(address);
    }

    /// Disable active-partition mapping checks.
    pub fn relax_mapping(&mut self) {
        self.strict_mapping = false;
    }

    /// Finish the oldest deferred transaction. Returns false when nothing
    /// was pending.
    pub fn complete_one(&mut self) -> bool {
        match self.pending.pop_front() {
            Some(txn) => {
                self.in_flight.remove(&txn.owner);
                let completion = self.finish(txn);
                self.completions.push_back(completion);
                true
            }
            None => false,
        }
    }

    /// Finish every deferred transaction in order.
    pub fn complete_all(&mut self) {
        while self.complete_one() {}
    }

    /// Number of transactions still deferred.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// All captured writes.
    pub fn writes(&self) -> &[(u32, Vec<u8>)] {
        &self.write_log
    }

    /// Captured write payloads for one address.
    pub fn writes_to(&self, address: u32) -> Vec<Vec<u8>> {
        self.write_log
            .iter()
            .filter(|(a, _)| *a == address)
            .map(|(_, d)| d.clone())
            .collect()
    }

    /// Captured 32-bit register writes for one address.
    pub fn reg_writes(&self, address: u32) -> Vec<u32> {
        self.writes_to(address)
            .iter()
            .map(|d| {
                let mut raw = [0u8; 4];
                raw[..d.len().min(4)].copy_from_slice(&d[..d.len().min(4)]);
                u32::from_le_bytes(raw)
            })
            .collect()
    }

    pub fn clear_writes(&mut self) {
        self.write_log.clear();
    }

    /// Partition tables programmed so far.
    pub fn partitions(&self) -> &[PartitionTable] {
        &self.partition_log
    }

    fn finish(&mut self, mut txn: Transaction) -> Completion {
        if txn.direction == Direction::Write {
            self.write_log.push((txn.address, txn.buffer.clone()));
        }
        if self.fail_addresses.remove(&txn.address) {
            return Completion {
                result: Err(BusError::TransactionFailed {
                    address: txn.address,
                    message: "injected failure".into(),
                }),
                txn,
            };
        }
        if txn.direction == Direction::Read {
            let scripted = self
                .read_scripts
                .get_mut(&txn.address)
                .and_then(|q| q.pop_front());
            match scripted {
                Some(data) => {
                    let n = data.len().min(txn.buffer.len());
                    txn.buffer[..n].copy_from_slice(&data[..n]);
                }
                None => txn.buffer.fill(0),
            }
        }
        Completion {
            txn,
            result: Ok(()),
        }
    }
}

impl Bus for MockBus {
    fn submit(&mut self, txn: Transaction) -> Result<BusStatus, BusError> {
        if self.in_flight.contains(&txn.owner) {
            return Err(BusError::SlotBusy { owner: txn.owner });
        }
        if self.strict_mapping
            && let Some(active) = self.partition_log.last()
            && !active.maps(txn.address, txn.buffer.len() as u32)
        {
            return Err(BusError::Unmapped {
                address: txn.address,
            });
        }

        trace!(
            addr = format!("0x{:08X}", txn.address),
            len = txn.buffer.len(),
            dir = ?txn.direction,
            owner = ?txn.owner,
            deferred = self.defer,
            "mock bus transaction"
        );

        if self.defer {
            self.in_flight.insert(txn.owner);
            self.pending.push_back(txn);
            return Ok(BusStatus::Pending);
        }

        let completion = self.finish(txn);
        self.completions.push_back(completion);
        Ok(BusStatus::Complete)
    }

    fn set_partition(&mut self, table: &PartitionTable) -> Result<(), BusError> {
        self.partition_log.push(*table);
        Ok(())
    }

    fn take_completion(&mut self) -> Option<Completion> {
        self.completions.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inline_completion() {
        let mut bus = MockBus::new();
        bus.relax_mapping();
        bus.script_reg(0x100, 0xCAFE_F00D);

        let status = bus
            .submit(Transaction::read_reg(TxnOwner::Boot, 0x100))
            .unwrap();
        assert_eq!(status, BusStatus::Complete);

        let done = bus.take_completion().unwrap();
        assert!(done.result.is_ok());
        assert_eq!(done.txn.reg_value(), 0xCAFE_F00D);
    }

    #[test]
    fn test_deferred_completion() {
        let mut bus = MockBus::new();
        bus.relax_mapping();
        bus.defer(true);

        let status = bus
            .submit(Transaction::write_reg(TxnOwner::Boot, 0x200, 1))
            .unwrap();
        assert_eq!(status, BusStatus::Pending);
        assert!(bus.take_completion().is_none());

        assert!(bus.complete_one());
        let done = bus.take_completion().unwrap();
        assert_eq!(done.txn.address, 0x200);
    }

    #[test]
    fn test_one_in_flight_per_owner() {
        let mut bus = MockBus::new();
        bus.relax_mapping();
        bus.defer(true);

        bus.submit(Transaction::write_reg(TxnOwner::Boot, 0x200, 1))
            .unwrap();
        let err = bus
            .submit(Transaction::write_reg(TxnOwner::Boot, 0x204, 2))
            .unwrap_err();
        assert_eq!(err, BusError::SlotBusy { owner: TxnOwner::Boot });

        // A different owner still has a free slot.
        bus.submit(Transaction::write_reg(TxnOwner::Mailbox, 0x204, 2))
            .unwrap();
    }

    #[test]
    fn test_unmapped_rejected() {
        let mut bus = MockBus::new();
        bus.set_partition(&PartitionTable::working()).unwrap();
        let err = bus
            .submit(Transaction::write_reg(TxnOwner::Loader, 0x7FFF_0000, 1))
            .unwrap_err();
        assert!(matches!(err, BusError::Unmapped { .. }));
    }

    #[test]
    fn test_injected_failure() {
        let mut bus = MockBus::new();
        bus.relax_mapping();
        bus.fail_at(0x300);
        bus.submit(Transaction::read_reg(TxnOwner::Config, 0x300))
            .unwrap();
        let done = bus.take_completion().unwrap();
        assert!(done.result.is_err());
    }
}
