//! Event mailbox record parsing.
//!
//! The device delivers events as a fixed-size record containing a bitmask
//! plus per-event payload sub-fields. Two such records (slot A/B) alternate
//! so the device can fill one while the host drains the other.

use byteorder::{LittleEndian, ReadBytesExt};
use std::fmt;
use std::io::Cursor;
use thiserror::Error;

use super::constants::EVENT_RECORD_SIZE;

#[derive(Error, Debug)]
pub enum EventError {
    #[error("Event record too small: expected {expected}, got {actual}")]
    RecordTooSmall { expected: usize, actual: usize },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Device event identifiers, one per bit of the event vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EventId {
    /// RSSI/SNR trigger crossed its threshold.
    RssiTrigger = 0,
    /// A one-shot scan finished.
    ScanComplete = 1,
    /// A scheduled (TSF-timed) scan finished.
    ScheduledScanComplete = 2,
    /// Periodic-scan interim report.
    PeriodicScanReport = 3,
    /// The join/start command finished inside the firmware.
    JoinComplete = 4,
    /// Link to the peer was lost.
    Disconnect = 5,
    /// Channel switch announcement handling finished.
    ChannelSwitchComplete = 6,
    /// Power-save state changed.
    PsReport = 7,
    /// Coexistence activity sensed.
    CoexSense = 8,
    /// Coexistence activity predicted.
    CoexPrediction = 9,
    /// A block-ack session was torn down by the peer.
    BaSessionTeardown = 10,
    /// Firmware health-check reply.
    HealthCheckReply = 11,
    /// Firmware debug event.
    DebugEvent = 12,
    /// Any event without a dedicated identifier.
    CatchAll = 13,
}

impl EventId {
    /// Number of defined event identifiers.
    pub const COUNT: usize = 14;

    /// All identifiers, in bit order.
    pub const ALL: [EventId; EventId::COUNT] = [
        EventId::RssiTrigger,
        EventId::ScanComplete,
        EventId::ScheduledScanComplete,
        EventId::PeriodicScanReport,
        EventId::JoinComplete,
        EventId::Disconnect,
        EventId::ChannelSwitchComplete,
        EventId::PsReport,
        EventId::CoexSense,
        EventId::CoexPrediction,
        EventId::BaSessionTeardown,
        EventId::HealthCheckReply,
        EventId::DebugEvent,
        EventId::CatchAll,
    ];

    /// Bit of this event in the record's event vector.
    pub const fn bit(self) -> u32 {
        1 << (self as u32)
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// One decoded event mailbox record.
///
/// Layout (little endian):
///
/// | offset | field                          |
/// |--------|--------------------------------|
/// | 0x00   | events vector (u32)            |
/// | 0x04   | events mask mirror (u32)       |
/// | 0x08   | trigger RSSI (i8), SNR (i8)    |
/// | 0x0C   | scan result count (u8), tag (u8)|
/// | 0x0E   | attended-channel bitmap (u16)  |
/// | 0x10   | TSF error flag (u8)            |
/// | 0x11   | PS status (u8)                 |
/// | 0x12.. | reserved                       |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventRecord {
    pub events_vector: u32,
    pub events_mask: u32,
    pub trigger_rssi: i8,
    pub trigger_snr: i8,
    pub scan_result_count: u8,
    pub scan_tag: u8,
    pub attended_channels: u16,
    pub tsf_error: bool,
    pub ps_entered: bool,
}

impl EventRecord {
    pub fn from_bytes(data: &[u8]) -> Result<Self, EventError> {
        if data.len() < EVENT_RECORD_SIZE {
            return Err(EventError::RecordTooSmall {
                expected: EVENT_RECORD_SIZE,
                actual: data.len(),
            });
        }
        let mut cursor = Cursor::new(data);
        let events_vector = cursor.read_u32::<LittleEndian>()?;
        let events_mask = cursor.read_u32::<LittleEndian>()?;
        let trigger_rssi = cursor.read_i8()?;
        let trigger_snr = cursor.read_i8()?;
        cursor.set_position(0x0C);
        let scan_result_count = cursor.read_u8()?;
        let scan_tag = cursor.read_u8()?;
        let attended_channels = cursor.read_u16::<LittleEndian>()?;
        let tsf_error = cursor.read_u8()? != 0;
        let ps_entered = cursor.read_u8()? != 0;

        Ok(Self {
            events_vector,
            events_mask,
            trigger_rssi,
            trigger_snr,
            scan_result_count,
            scan_tag,
            attended_channels,
            tsf_error,
            ps_entered,
        })
    }

    /// Whether the record announces the given event.
    pub fn has(&self, id: EventId) -> bool {
        self.events_vector & id.bit() != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_record(vector: u32) -> Vec<u8> {
        let mut raw = vec![0u8; EVENT_RECORD_SIZE];
        raw[..4].copy_from_slice(&vector.to_le_bytes());
        raw
    }

    #[test]
    fn test_record_vector_bits() {
        let raw = raw_record(EventId::ScanComplete.bit() | EventId::PsReport.bit());
        let rec = EventRecord::from_bytes(&raw).unwrap();
        assert!(rec.has(EventId::ScanComplete));
        assert!(rec.has(EventId::PsReport));
        assert!(!rec.has(EventId::JoinComplete));
    }

    #[test]
    fn test_record_scan_fields() {
        let mut raw = raw_record(EventId::ScheduledScanComplete.bit());
        raw[0x0C] = 7; // result count
        raw[0x0D] = 2; // tag
        raw[0x0E..0x10].copy_from_slice(&0b0000_0101u16.to_le_bytes());
        raw[0x10] = 1; // TSF error
        let rec = EventRecord::from_bytes(&raw).unwrap();
        assert_eq!(rec.scan_result_count, 7);
        assert_eq!(rec.scan_tag, 2);
        assert_eq!(rec.attended_channels, 0b0000_0101);
        assert!(rec.tsf_error);
    }

    #[test]
    fn test_record_too_small() {
        assert!(EventRecord::from_bytes(&[0u8; 16]).is_err());
    }
}
