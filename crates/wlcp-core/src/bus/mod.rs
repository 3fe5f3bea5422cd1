//! Bus transaction layer: trait, transaction types, mock implementation.

pub mod mock;
pub mod traits;

pub use mock::MockBus;
pub use traits::{Bus, BusError, BusStatus, Completion, Direction, OpStatus, Transaction, TxnOwner};
