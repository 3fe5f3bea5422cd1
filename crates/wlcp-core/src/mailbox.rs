//! Ping-pong event mailbox dispatcher.
//!
//! The firmware writes event records into two fixed slots (A and B) and
//! raises a per-slot interrupt; the host drains the slot it expects next,
//! acknowledges it, and alternates. Decoded events are demultiplexed to
//! registered [`EventSink`]s by event id.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::bus::{Bus, BusError, BusStatus, Completion, Direction, OpStatus, Transaction, TxnOwner};
use crate::protocol::constants::{
    EVENT_ACK, EVENT_RECORD_SIZE, INTR_EVENT_A, INTR_EVENT_B, REG_EVENT_MAILBOX_PTR,
    REG_INTERRUPT_ACK,
};
use crate::protocol::event::{EventError, EventId, EventRecord};

#[derive(Error, Debug)]
pub enum MailboxError {
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Event decode error: {0}")]
    Event(#[from] EventError),

    #[error("A sink is already registered for {id}")]
    SlotOccupied { id: EventId },

    #[error("Mailbox addresses not initialized")]
    NotInitialized,

    #[error("Mailbox received a completion it did not issue")]
    UnexpectedCompletion,
}

/// Receiver for dispatched device events.
pub trait EventSink {
    fn on_event(&mut self, id: EventId, record: &EventRecord);
}

impl<F: FnMut(EventId, &EventRecord)> EventSink for F {
    fn on_event(&mut self, id: EventId, record: &EventRecord) {
        self(id, record)
    }
}

/// Control-plane notifications produced by internal event sinks, drained by
/// the engine after each dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineSignal {
    /// The firmware confirmed the join command.
    JoinObserved,
    /// A one-shot scan finished.
    ScanComplete { record: EventRecord },
    /// A scheduled scan finished.
    ScheduledScanComplete { record: EventRecord },
    /// Periodic-scan interim report.
    PeriodicScanReport { record: EventRecord },
    /// Power-save transition report.
    PsStatus { entered: bool },
    /// The link dropped.
    Disconnected,
}

/// Shared queue internal sinks push [`EngineSignal`]s into.
pub type SignalQueue = Rc<RefCell<VecDeque<EngineSignal>>>;

/// One registered sink plus the caller-chosen handle returned on
/// replace/unregister so ownership round-trips are verifiable.
pub struct Registration {
    pub sink: Box<dyn EventSink>,
    pub handle: u64,
}

enum MboxOp {
    Idle,
    /// Reading the event mailbox base pointer.
    InitRead,
    /// Reading the expected slot's record.
    EventRead,
    /// Writing the event acknowledge.
    Ack,
}

/// Event mailbox dispatcher state machine.
pub struct EventMailbox {
    table: [Option<Registration>; EventId::COUNT],
    /// Device-space addresses of slots A and B.
    slot_addrs: Option<[u32; 2]>,
    /// Index of the slot the next event is expected in.
    expected_slot: usize,
    op: MboxOp,
}

impl Default for EventMailbox {
    fn default() -> Self {
        Self::new()
    }
}

impl EventMailbox {
    pub fn new() -> Self {
        Self {
            table: std::array::from_fn(|_| None),
            slot_addrs: None,
            expected_slot: 0,
            op: MboxOp::Idle,
        }
    }

    /// Read the event mailbox pointer and derive both slot addresses.
    /// Must finish before [`EventMailbox::handle`] is usable.
    pub fn init_addresses<B: Bus>(&mut self, bus: &mut B) -> Result<OpStatus, MailboxError> {
        self.op = MboxOp::InitRead;
        match bus.submit(Transaction::read_reg(TxnOwner::Mailbox, REG_EVENT_MAILBOX_PTR))? {
            BusStatus::Complete => {
                let done = bus.take_completion().ok_or(BusError::MissingCompletion)?;
                self.absorb(bus, done)
            }
            BusStatus::Pending => Ok(OpStatus::Pending),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.slot_addrs.is_some()
    }

    /// Register a sink for an event id. Fails if the id already has one.
    pub fn register(
        &mut self,
        id: EventId,
        sink: Box<dyn EventSink>,
        handle: u64,
    ) -> Result<(), MailboxError> {
        let entry = &mut self.table[id as usize];
        if entry.is_some() {
            return Err(MailboxError::SlotOccupied { id });
        }
        *entry = Some(Registration { sink, handle });
        trace!(%id, handle, "event sink registered");
        Ok(())
    }

    /// Register a sink, returning the displaced registration if any.
    pub fn replace(
        &mut self,
        id: EventId,
        sink: Box<dyn EventSink>,
        handle: u64,
    ) -> Option<Registration> {
        self.table[id as usize].replace(Registration { sink, handle })
    }

    /// Drop the sink for an event id, returning it to the caller.
    pub fn unregister(&mut self, id: EventId) -> Option<Registration> {
        self.table[id as usize].take()
    }

    /// Put back (or clear) a registration previously displaced by
    /// [`EventMailbox::replace`].
    pub fn restore(&mut self, id: EventId, previous: Option<Registration>) {
        self.table[id as usize] = previous;
    }

    pub fn registered_handle(&self, id: EventId) -> Option<u64> {
        self.table[id as usize].as_ref().map(|r| r.handle)
    }

    /// Service an event interrupt: read the expected slot, dispatch its
    /// record, and acknowledge. `intr_status` is the raw interrupt status
    /// the caller read; a slot indication that disagrees with the expected
    /// slot is logged but the expected slot is drained regardless, keeping
    /// the alternation in lockstep with the device.
    pub fn handle<B: Bus>(&mut self, bus: &mut B, intr_status: u32) -> Result<OpStatus, MailboxError> {
        let addrs = self.slot_addrs.ok_or(MailboxError::NotInitialized)?;

        let indicated = if intr_status & INTR_EVENT_A != 0 {
            Some(0)
        } else if intr_status & INTR_EVENT_B != 0 {
            Some(1)
        } else {
            None
        };
        if let Some(slot) = indicated
            && slot != self.expected_slot
        {
            warn!(
                indicated = slot,
                expected = self.expected_slot,
                "event slot indication out of step"
            );
        }

        self.op = MboxOp::EventRead;
        let txn = Transaction::read(TxnOwner::Mailbox, addrs[self.expected_slot], EVENT_RECORD_SIZE);
        self.drive(bus, txn)
    }

    /// Feed a completed mailbox transaction back in.
    pub fn resume<B: Bus>(
        &mut self,
        bus: &mut B,
        completion: Completion,
    ) -> Result<OpStatus, MailboxError> {
        self.absorb(bus, completion)
    }

    fn drive<B: Bus>(&mut self, bus: &mut B, first: Transaction) -> Result<OpStatus, MailboxError> {
        let mut txn = first;
        loop {
            match bus.submit(txn)? {
                BusStatus::Pending => return Ok(OpStatus::Pending),
                BusStatus::Complete => {
                    let done = bus.take_completion().ok_or(BusError::MissingCompletion)?;
                    match self.step(done)? {
                        Step::Next(next) => txn = next,
                        Step::Done => return Ok(OpStatus::Done),
                    }
                }
            }
        }
    }

    fn absorb<B: Bus>(&mut self, bus: &mut B, done: Completion) -> Result<OpStatus, MailboxError> {
        match self.step(done)? {
            Step::Next(txn) => self.drive(bus, txn),
            Step::Done => Ok(OpStatus::Done),
        }
    }

    /// Advance the operation by one completed transaction.
    fn step(&mut self, done: Completion) -> Result<Step, MailboxError> {
        done.result?;
        match self.op {
            MboxOp::Idle => Err(MailboxError::UnexpectedCompletion),
            MboxOp::InitRead => {
                let base = done.txn.reg_value();
                self.slot_addrs = Some([base, base + EVENT_RECORD_SIZE as u32]);
                self.op = MboxOp::Idle;
                debug!(base = format!("0x{base:08X}"), "event mailbox mapped");
                Ok(Step::Done)
            }
            MboxOp::EventRead => {
                debug_assert_eq!(done.txn.direction, Direction::Read);
                let record = EventRecord::from_bytes(&done.txn.buffer)?;
                self.dispatch(&record);
                self.expected_slot ^= 1;
                self.op = MboxOp::Ack;
                Ok(Step::Next(Transaction::write_reg(
                    TxnOwner::Mailbox,
                    REG_INTERRUPT_ACK,
                    EVENT_ACK,
                )))
            }
            MboxOp::Ack => {
                self.op = MboxOp::Idle;
                Ok(Step::Done)
            }
        }
    }

    /// Invoke the sink of every event announced in the record. Events with
    /// no registered sink fall through to the catch-all sink if present.
    fn dispatch(&mut self, record: &EventRecord) {
        trace!(vector = format!("0x{:08X}", record.events_vector), "dispatching event record");
        for id in EventId::ALL {
            if !record.has(id) {
                continue;
            }
            if let Some(reg) = self.table[id as usize].as_mut() {
                reg.sink.on_event(id, record);
            } else if id != EventId::CatchAll
                && let Some(reg) = self.table[EventId::CatchAll as usize].as_mut()
            {
                reg.sink.on_event(id, record);
            } else {
                debug!(%id, "event without a sink dropped");
            }
        }
    }
}

enum Step {
    Next(Transaction),
    Done,
}
