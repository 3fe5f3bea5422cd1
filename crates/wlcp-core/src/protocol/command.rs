//! Command mailbox encoding.
//!
//! Every configuration and control command is a small header followed by a
//! command-specific payload, written to the command mailbox and announced
//! through the interrupt trigger register.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;
use thiserror::Error;

use super::constants::{AC_COUNT, CMD_MAX_SIZE};

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("Encoded command too large: {actual} bytes, limit {limit}")]
    TooLarge { actual: usize, limit: usize },
    #[error("Buffer too small: expected {expected}, got {actual}")]
    BufferTooSmall { expected: usize, actual: usize },
    #[error("Device rejected command {id:?}: status 0x{status:04X}")]
    Rejected { id: CommandId, status: u16 },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Command identifiers understood by the firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum CommandId {
    RadioParams = 0x01,
    RxConfig = 0x02,
    RatePolicy = 0x03,
    AcParams = 0x04,
    SetTemplate = 0x05,
    BeaconFilter = 0x06,
    EventMask = 0x07,
    KeepAlive = 0x08,
    ScanParams = 0x09,
    Join = 0x0A,
    SetAid = 0x0B,
    HtCapabilities = 0x0C,
    HtOperation = 0x0D,
    BaSession = 0x0E,
    SetKey = 0x0F,
    ScanStart = 0x10,
    ScanStop = 0x11,
}

/// Command header: identifier plus a status word the device fills on reply.
#[derive(Debug, Clone, Copy)]
pub struct CommandHeader {
    pub id: u16,
    pub status: u16,
}

impl CommandHeader {
    pub const SIZE: usize = 4;

    pub fn from_bytes(data: &[u8]) -> Result<Self, CommandError> {
        if data.len() < Self::SIZE {
            return Err(CommandError::BufferTooSmall {
                expected: Self::SIZE,
                actual: data.len(),
            });
        }
        let mut cursor = Cursor::new(data);
        Ok(Self {
            id: cursor.read_u16::<LittleEndian>()?,
            status: cursor.read_u16::<LittleEndian>()?,
        })
    }
}

/// Encode a complete command mailbox record.
pub fn encode_command(id: CommandId, payload: &[u8]) -> Result<Vec<u8>, CommandError> {
    let total = CommandHeader::SIZE + payload.len();
    if total > CMD_MAX_SIZE {
        return Err(CommandError::TooLarge {
            actual: total,
            limit: CMD_MAX_SIZE,
        });
    }
    let mut buf = Vec::with_capacity(total);
    buf.write_u16::<LittleEndian>(id as u16).unwrap();
    buf.write_u16::<LittleEndian>(0).unwrap();
    buf.extend_from_slice(payload);
    Ok(buf)
}

// ============================================================================
// Configuration payloads
// ============================================================================

/// Radio band selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Band {
    Band2Ghz = 0,
    Band5Ghz = 1,
}

/// General radio parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RadioParams {
    pub channel: u8,
    pub band: Band,
    pub tx_power: u8,
    pub rts_threshold: u16,
    pub frag_threshold: u16,
}

impl RadioParams {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8);
        buf.write_u8(self.channel).unwrap();
        buf.write_u8(self.band as u8).unwrap();
        buf.write_u8(self.tx_power).unwrap();
        buf.write_u8(0).unwrap();
        buf.write_u16::<LittleEndian>(self.rts_threshold).unwrap();
        buf.write_u16::<LittleEndian>(self.frag_threshold).unwrap();
        buf
    }
}

/// Receive path configuration and frame filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxConfig {
    pub config: u32,
    pub filter: u32,
}

impl RxConfig {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8);
        buf.write_u32::<LittleEndian>(self.config).unwrap();
        buf.write_u32::<LittleEndian>(self.filter).unwrap();
        buf
    }
}

/// Transmit rate policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RatePolicy {
    pub index: u8,
    pub enabled_rates: u32,
    pub short_retry_limit: u8,
    pub long_retry_limit: u8,
}

impl RatePolicy {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8);
        buf.write_u8(self.index).unwrap();
        buf.write_u8(self.short_retry_limit).unwrap();
        buf.write_u8(self.long_retry_limit).unwrap();
        buf.write_u8(0).unwrap();
        buf.write_u32::<LittleEndian>(self.enabled_rates).unwrap();
        buf
    }
}

/// Per-AC (traffic class) queue parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcParams {
    pub ac: u8,
    pub cw_min: u16,
    pub cw_max: u16,
    pub aifsn: u8,
    pub txop_limit: u16,
}

impl AcParams {
    pub fn to_bytes(&self) -> Result<Vec<u8>, CommandError> {
        if self.ac as usize >= AC_COUNT {
            return Err(CommandError::TooLarge {
                actual: self.ac as usize,
                limit: AC_COUNT - 1,
            });
        }
        let mut buf = Vec::with_capacity(8);
        buf.write_u8(self.ac).unwrap();
        buf.write_u8(self.aifsn).unwrap();
        buf.write_u16::<LittleEndian>(self.cw_min).unwrap();
        buf.write_u16::<LittleEndian>(self.cw_max).unwrap();
        buf.write_u16::<LittleEndian>(self.txop_limit).unwrap();
        Ok(buf)
    }
}

/// Frame template kinds the firmware can store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum TemplateId {
    Beacon = 0,
    ProbeRequest = 1,
    NullData = 2,
    PsPoll = 3,
    QosNull = 4,
}

/// An opaque frame template blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    pub id: TemplateId,
    pub frame: Vec<u8>,
}

impl Template {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + self.frame.len());
        buf.write_u8(self.id as u8).unwrap();
        buf.write_u8(0).unwrap();
        buf.write_u16::<LittleEndian>(self.frame.len() as u16).unwrap();
        buf.extend_from_slice(&self.frame);
        buf
    }
}

/// Beacon filtering configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeaconFilter {
    pub enabled: bool,
    pub max_num_filters: u8,
}

impl BeaconFilter {
    pub fn to_bytes(&self) -> Vec<u8> {
        vec![self.enabled as u8, self.max_num_filters, 0, 0]
    }
}

/// Keep-alive (null frame) parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAlive {
    pub enabled: bool,
    pub interval_ms: u32,
}

impl KeepAlive {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8);
        buf.write_u32::<LittleEndian>(self.interval_ms).unwrap();
        buf.write_u8(self.enabled as u8).unwrap();
        buf.extend_from_slice(&[0; 3]);
        buf
    }
}

/// Global scan tuning pushed to the firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanParams {
    pub num_probe_requests: u8,
    pub split_scan_timeout_ms: u16,
}

impl ScanParams {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4);
        buf.write_u8(self.num_probe_requests).unwrap();
        buf.write_u8(0).unwrap();
        buf.write_u16::<LittleEndian>(self.split_scan_timeout_ms).unwrap();
        buf
    }
}

/// Join/start parameters for associating with a network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinParams {
    pub bssid: [u8; 6],
    pub channel: u8,
    pub band: Band,
    pub beacon_interval_ms: u16,
    pub dtim_period: u8,
    pub basic_rates: u32,
    pub ssid: Vec<u8>,
}

impl JoinParams {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(20 + self.ssid.len());
        buf.extend_from_slice(&self.bssid);
        buf.write_u8(self.channel).unwrap();
        buf.write_u8(self.band as u8).unwrap();
        buf.write_u16::<LittleEndian>(self.beacon_interval_ms).unwrap();
        buf.write_u8(self.dtim_period).unwrap();
        buf.write_u8(self.ssid.len() as u8).unwrap();
        buf.write_u32::<LittleEndian>(self.basic_rates).unwrap();
        buf.extend_from_slice(&self.ssid);
        buf
    }
}

/// HT capability configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HtCapabilities {
    pub caps: u32,
    pub ampdu_density: u8,
}

impl HtCapabilities {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8);
        buf.write_u32::<LittleEndian>(self.caps).unwrap();
        buf.write_u8(self.ampdu_density).unwrap();
        buf.extend_from_slice(&[0; 3]);
        buf
    }
}

/// HT operation element mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HtOperation {
    pub primary_channel: u8,
    pub protection_mode: u8,
}

impl HtOperation {
    pub fn to_bytes(&self) -> Vec<u8> {
        vec![self.primary_channel, self.protection_mode, 0, 0]
    }
}

/// Block-ack session policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BaPolicy {
    pub tid_bitmap: u8,
    pub win_size: u8,
    pub inactivity_timeout_ms: u16,
}

impl BaPolicy {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4);
        buf.write_u8(self.tid_bitmap).unwrap();
        buf.write_u8(self.win_size).unwrap();
        buf.write_u16::<LittleEndian>(self.inactivity_timeout_ms).unwrap();
        buf
    }
}

// ============================================================================
// Firmware static information
// ============================================================================

/// Number of entries in the per-rate power table.
pub const RATE_POWER_TABLE_LEN: usize = 16;

/// Static information reported by the firmware after boot.
///
/// The raw record is read from the command mailbox address right after the
/// init-complete handshake; multi-byte fields arrive in device order and are
/// corrected here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub mac_address: [u8; 6],
    pub fw_version: String,
    pub hw_revision: u32,
    pub rate_power_table: [u8; RATE_POWER_TABLE_LEN],
}

impl DeviceInfo {
    /// Raw record size: MAC (6) + pad (2) + version (20) + revision (4)
    /// + power table (16).
    pub const SIZE: usize = 48;

    /// Parse and byte-order-correct the raw static-information record.
    pub fn from_bytes(data: &[u8]) -> Result<Self, CommandError> {
        if data.len() < Self::SIZE {
            return Err(CommandError::BufferTooSmall {
                expected: Self::SIZE,
                actual: data.len(),
            });
        }

        // The device reports the MAC reversed.
        let mut mac_address = [0u8; 6];
        for (i, b) in data[..6].iter().rev().enumerate() {
            mac_address[i] = *b;
        }

        let version_raw = &data[8..28];
        let end = version_raw.iter().position(|&b| b == 0).unwrap_or(20);
        let fw_version = String::from_utf8_lossy(&version_raw[..end]).into_owned();

        let mut cursor = Cursor::new(&data[28..32]);
        let hw_revision = cursor.read_u32::<LittleEndian>()?;

        // The power table is transferred in word units; swap each group of
        // four back into rate order.
        let mut rate_power_table = [0u8; RATE_POWER_TABLE_LEN];
        for (chunk_idx, chunk) in data[32..48].chunks(4).enumerate() {
            for (i, b) in chunk.iter().rev().enumerate() {
                rate_power_table[chunk_idx * 4 + i] = *b;
            }
        }

        Ok(Self {
            mac_address,
            fw_version,
            hw_revision,
            rate_power_table,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_command_header() {
        let cmd = encode_command(CommandId::RxConfig, &[0xAA, 0xBB]).unwrap();
        let header = CommandHeader::from_bytes(&cmd).unwrap();
        assert_eq!(header.id, CommandId::RxConfig as u16);
        assert_eq!(header.status, 0);
        assert_eq!(&cmd[4..], &[0xAA, 0xBB]);
    }

    #[test]
    fn test_encode_command_too_large() {
        let payload = vec![0u8; CMD_MAX_SIZE];
        assert!(encode_command(CommandId::SetTemplate, &payload).is_err());
    }

    #[test]
    fn test_device_info_byte_order() {
        let mut raw = vec![0u8; DeviceInfo::SIZE];
        // MAC reversed on the wire: de:ad:be:ef:00:01 arrives 01:00:ef:be:ad:de.
        raw[..6].copy_from_slice(&[0x01, 0x00, 0xEF, 0xBE, 0xAD, 0xDE]);
        raw[8..13].copy_from_slice(b"7.3.9");
        raw[28..32].copy_from_slice(&0x0404_1401u32.to_le_bytes());
        // First power-table word: rates 0..3 arrive as 3,2,1,0.
        raw[32..36].copy_from_slice(&[13, 12, 11, 10]);

        let info = DeviceInfo::from_bytes(&raw).unwrap();
        assert_eq!(info.mac_address, [0xDE, 0xAD, 0xBE, 0xEF, 0x00, 0x01]);
        assert_eq!(info.fw_version, "7.3.9");
        assert_eq!(info.hw_revision, 0x0404_1401);
        assert_eq!(&info.rate_power_table[..4], &[10, 11, 12, 13]);
    }

    #[test]
    fn test_join_params_encoding() {
        let join = JoinParams {
            bssid: [1, 2, 3, 4, 5, 6],
            channel: 11,
            band: Band::Band2Ghz,
            beacon_interval_ms: 100,
            dtim_period: 3,
            basic_rates: 0x0F,
            ssid: b"testnet".to_vec(),
        };
        let bytes = join.to_bytes();
        assert_eq!(&bytes[..6], &[1, 2, 3, 4, 5, 6]);
        assert_eq!(bytes[6], 11);
        assert_eq!(bytes[11], 7); // ssid length
        assert_eq!(&bytes[16..], b"testnet");
    }
}
