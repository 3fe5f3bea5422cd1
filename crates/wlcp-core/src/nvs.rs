//! NVS calibration data parsing.
//!
//! The device normally keeps calibration data in its own non-volatile
//! storage; when it has none, the host injects it at boot as a stream of
//! burst records:
//!
//! ```text
//! [count: u8] [address: u16 le] [count * 4 data bytes] ... [0x00]
//! ```
//!
//! A zero count terminates the stream. Addresses are offsets into the
//! device register file and each record programs `count` consecutive
//! 32-bit words.

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;
use thiserror::Error;

use crate::protocol::constants::NVS_BURST_MAX_WORDS;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum NvsError {
    #[error("Truncated burst record at offset {offset}")]
    Truncated { offset: usize },
    #[error("Burst record at offset {offset} carries {words} words, limit {limit}")]
    BurstTooLong {
        offset: usize,
        words: usize,
        limit: usize,
    },
    #[error("Missing zero-length terminator record")]
    MissingTerminator,
}

/// One decoded burst: `words` programmed at consecutive addresses starting
/// at `address`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BurstRecord {
    /// Register-file offset of the first word.
    pub address: u16,
    pub words: Vec<u32>,
}

/// Parse a calibration blob into its burst records.
pub fn parse_burst_records(blob: &[u8]) -> Result<Vec<BurstRecord>, NvsError> {
    let mut records = Vec::new();
    let mut cursor = Cursor::new(blob);

    loop {
        let offset = cursor.position() as usize;
        let count = cursor
            .read_u8()
            .map_err(|_| NvsError::MissingTerminator)? as usize;
        if count == 0 {
            return Ok(records);
        }
        if count > NVS_BURST_MAX_WORDS {
            return Err(NvsError::BurstTooLong {
                offset,
                words: count,
                limit: NVS_BURST_MAX_WORDS,
            });
        }
        let address = cursor
            .read_u16::<LittleEndian>()
            .map_err(|_| NvsError::Truncated { offset })?;
        let mut words = Vec::with_capacity(count);
        for _ in 0..count {
            words.push(
                cursor
                    .read_u32::<LittleEndian>()
                    .map_err(|_| NvsError::Truncated { offset })?,
            );
        }
        records.push(BurstRecord { address, words });
    }
}

/// Built-in fallback calibration blob (28 bytes).
///
/// Used when the caller supplies no NVS so the device still boots with a
/// usable fixed hardware address. One six-word burst at register offset
/// 0x0546 followed by the terminator.
pub const DEFAULT_NVS: [u8; 28] = [
    0x06, 0x46, 0x05, // count 6, address 0x0546
    0x00, 0x80, 0x00, 0x00, // hardware address low word
    0xDE, 0xAD, 0x12, 0x00, // hardware address high word
    0x00, 0x00, 0x00, 0x00, // radio calibration defaults
    0x05, 0x00, 0x00, 0x00, //
    0x00, 0x04, 0x00, 0x00, //
    0x01, 0x00, 0x00, 0x00, //
    0x00, // terminator
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_nvs_parses() {
        let records = parse_burst_records(&DEFAULT_NVS).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].address, 0x0546);
        assert_eq!(records[0].words.len(), 6);
        assert_eq!(records[0].words[0], 0x0000_8000);
    }

    #[test]
    fn test_multiple_bursts() {
        let blob = [
            0x01, 0x10, 0x00, 0xAA, 0xBB, 0xCC, 0xDD, // one word at 0x0010
            0x02, 0x20, 0x00, 1, 0, 0, 0, 2, 0, 0, 0, // two words at 0x0020
            0x00,
        ];
        let records = parse_burst_records(&blob).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].words, vec![0xDDCC_BBAA]);
        assert_eq!(records[1].address, 0x0020);
        assert_eq!(records[1].words, vec![1, 2]);
    }

    #[test]
    fn test_truncated_record() {
        let blob = [0x02, 0x10, 0x00, 0xAA, 0xBB];
        assert!(matches!(
            parse_burst_records(&blob),
            Err(NvsError::Truncated { offset: 0 })
        ));
    }

    #[test]
    fn test_missing_terminator() {
        let blob = [0x01, 0x10, 0x00, 0xAA, 0xBB, 0xCC, 0xDD];
        assert_eq!(
            parse_burst_records(&blob),
            Err(NvsError::MissingTerminator)
        );
    }

    #[test]
    fn test_oversized_burst() {
        let mut blob = vec![0xFF, 0x10, 0x00];
        blob.extend_from_slice(&[0u8; 255 * 4]);
        blob.push(0);
        assert!(matches!(
            parse_burst_records(&blob),
            Err(NvsError::BurstTooLong { .. })
        ));
    }
}
