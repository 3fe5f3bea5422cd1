//! Security key ring.
//!
//! Keys live in a small fixed-capacity ring indexed by device key slot.
//! Removing a key marks the slot [`KeySlot::Removed`] instead of erasing
//! it, so a recovery replay can distinguish "never set" from "explicitly
//! removed" and resend the right command either way.

use byteorder::WriteBytesExt;

use crate::protocol::constants::KEY_SLOT_COUNT;

/// Cipher suites the firmware accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CipherSuite {
    Wep = 1,
    Tkip = 2,
    Ccmp = 3,
}

/// Key material for one slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyMaterial {
    pub cipher: CipherSuite,
    pub key: Vec<u8>,
}

impl KeyMaterial {
    /// Check cipher/length consistency. Called by the sequencer predicate,
    /// not at store time, so an invalid value aborts the run that would
    /// send it.
    pub fn validate(&self) -> Result<(), String> {
        let ok = match self.cipher {
            CipherSuite::Wep => matches!(self.key.len(), 5 | 13),
            CipherSuite::Tkip => self.key.len() == 32,
            CipherSuite::Ccmp => self.key.len() == 16,
        };
        if ok {
            Ok(())
        } else {
            Err(format!(
                "{:?} key must not be {} bytes",
                self.cipher,
                self.key.len()
            ))
        }
    }
}

/// State of one key slot.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum KeySlot {
    #[default]
    Empty,
    Set(KeyMaterial),
    Removed,
}

/// Fixed-capacity key ring with per-slot dirty tracking.
#[derive(Debug, Default)]
pub struct KeyRing {
    slots: [KeySlot; KEY_SLOT_COUNT],
    dirty: [bool; KEY_SLOT_COUNT],
}

impl KeyRing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store key material in a slot. Returns false for an out-of-range
    /// slot index.
    pub fn set(&mut self, slot: usize, material: KeyMaterial) -> bool {
        if slot >= KEY_SLOT_COUNT {
            return false;
        }
        self.slots[slot] = KeySlot::Set(material);
        self.dirty[slot] = true;
        true
    }

    /// Mark a slot removed. A slot that was never set stays `Empty`.
    pub fn remove(&mut self, slot: usize) -> bool {
        if slot >= KEY_SLOT_COUNT {
            return false;
        }
        if self.slots[slot] != KeySlot::Empty {
            self.slots[slot] = KeySlot::Removed;
            self.dirty[slot] = true;
        }
        true
    }

    pub fn slot(&self, slot: usize) -> &KeySlot {
        &self.slots[slot]
    }

    /// Slots whose state has not been pushed to the device yet.
    pub fn dirty_slots(&self) -> impl Iterator<Item = (usize, &KeySlot)> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(i, _)| self.dirty[*i])
    }

    pub fn clear_dirty(&mut self, slot: usize) {
        self.dirty[slot] = false;
    }

    pub fn any_dirty(&self) -> bool {
        self.dirty.iter().any(|d| *d)
    }

    /// Re-mark every non-empty slot for a recovery replay.
    pub fn mark_all_dirty(&mut self) {
        for (i, slot) in self.slots.iter().enumerate() {
            if *slot != KeySlot::Empty {
                self.dirty[i] = true;
            }
        }
    }

    /// Encode the set-key command payload for a slot.
    pub fn encode_slot(&self, slot: usize) -> Option<Vec<u8>> {
        let mut buf = Vec::new();
        buf.write_u8(slot as u8).unwrap();
        match &self.slots[slot] {
            KeySlot::Empty => return None,
            KeySlot::Set(material) => {
                buf.write_u8(1).unwrap(); // action: set
                buf.write_u8(material.cipher as u8).unwrap();
                buf.write_u8(material.key.len() as u8).unwrap();
                buf.extend_from_slice(&material.key);
            }
            KeySlot::Removed => {
                buf.write_u8(0).unwrap(); // action: remove
                buf.write_u8(0).unwrap();
                buf.write_u8(0).unwrap();
            }
        }
        Some(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ccmp_key() -> KeyMaterial {
        KeyMaterial {
            cipher: CipherSuite::Ccmp,
            key: vec![0x11; 16],
        }
    }

    #[test]
    fn test_removed_differs_from_empty() {
        let mut ring = KeyRing::new();
        ring.set(1, ccmp_key());
        ring.remove(1);
        ring.remove(2); // never set

        assert_eq!(*ring.slot(1), KeySlot::Removed);
        assert_eq!(*ring.slot(2), KeySlot::Empty);
        assert!(ring.encode_slot(1).is_some());
        assert!(ring.encode_slot(2).is_none());
    }

    #[test]
    fn test_mark_all_dirty_skips_empty() {
        let mut ring = KeyRing::new();
        ring.set(0, ccmp_key());
        ring.clear_dirty(0);
        assert!(!ring.any_dirty());

        ring.mark_all_dirty();
        let dirty: Vec<usize> = ring.dirty_slots().map(|(i, _)| i).collect();
        assert_eq!(dirty, vec![0]);
    }

    #[test]
    fn test_validation() {
        assert!(ccmp_key().validate().is_ok());
        let bad = KeyMaterial {
            cipher: CipherSuite::Wep,
            key: vec![0; 7],
        };
        assert!(bad.validate().is_err());
    }
}
