//! Host-side mirror of the device configuration.
//!
//! Every tunable the firmware accepts is cached here together with a dirty
//! flag. The sequencer pushes dirty values to the device and clears the
//! flags; [`ConfigStore::mark_all_dirty`] re-arms everything so a recovery
//! replay resends the full configuration from the mirror alone.

use std::collections::BTreeMap;

use crate::protocol::command::{
    AcParams, BaPolicy, BeaconFilter, DeviceInfo, HtCapabilities, HtOperation, JoinParams,
    KeepAlive, RadioParams, RatePolicy, RxConfig, ScanParams, Template, TemplateId,
};
use crate::protocol::constants::AC_COUNT;
use crate::protocol::event::EventId;

use super::keys::{KeyMaterial, KeyRing};

/// A cached value plus its pushed-to-device state.
#[derive(Debug, Clone)]
pub struct Slot<T> {
    value: Option<T>,
    dirty: bool,
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Self {
            value: None,
            dirty: false,
        }
    }
}

impl<T: PartialEq> Slot<T> {
    /// Cache a value for the next push. Storing the value the slot already
    /// holds is a no-op so repeated identical calls cost no transactions.
    pub fn set(&mut self, value: T) {
        if self.value.as_ref() == Some(&value) {
            return;
        }
        self.value = Some(value);
        self.dirty = true;
    }
}

impl<T> Slot<T> {
    pub fn get(&self) -> Option<&T> {
        self.value.as_ref()
    }

    /// True when a value exists and has not been pushed yet.
    pub fn is_dirty(&self) -> bool {
        self.dirty && self.value.is_some()
    }

    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    /// Re-arm the slot if it holds a value.
    pub fn mark_dirty(&mut self) {
        if self.value.is_some() {
            self.dirty = true;
        }
    }
}

/// Cached device configuration with per-domain dirty tracking.
#[derive(Debug, Default)]
pub struct ConfigStore {
    pub radio: Slot<RadioParams>,
    pub rx_config: Slot<RxConfig>,
    pub rate_policy: Slot<RatePolicy>,
    pub ac_params: [Slot<AcParams>; AC_COUNT],
    pub templates: BTreeMap<TemplateId, Slot<Template>>,
    pub beacon_filter: Slot<BeaconFilter>,
    /// Bitmask of event ids the device is asked to deliver.
    pub event_mask: Slot<u32>,
    pub keep_alive: Slot<KeepAlive>,
    pub scan_params: Slot<ScanParams>,
    pub join: Slot<JoinParams>,
    pub aid: Slot<u16>,
    pub ht_capabilities: Slot<HtCapabilities>,
    pub ht_operation: Slot<HtOperation>,
    pub ba_policy: Slot<BaPolicy>,
    pub keys: KeyRing,

    /// Set once the device confirms the join.
    joined: bool,
    device_info: Option<DeviceInfo>,
}

impl ConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_template(&mut self, template: Template) {
        self.templates.entry(template.id).or_default().set(template);
    }

    pub fn set_ac_params(&mut self, params: AcParams) -> bool {
        let idx = params.ac as usize;
        if idx >= AC_COUNT {
            return false;
        }
        self.ac_params[idx].set(params);
        true
    }

    pub fn set_key(&mut self, slot: usize, material: KeyMaterial) -> bool {
        self.keys.set(slot, material)
    }

    pub fn remove_key(&mut self, slot: usize) -> bool {
        self.keys.remove(slot)
    }

    /// Enable delivery of one event id.
    pub fn unmask_event(&mut self, id: EventId) {
        let mask = self.event_mask.get().copied().unwrap_or(0);
        self.event_mask.set(mask | id.bit());
    }

    /// Suppress delivery of one event id.
    pub fn mask_event(&mut self, id: EventId) {
        let mask = self.event_mask.get().copied().unwrap_or(0);
        self.event_mask.set(mask & !id.bit());
    }

    pub fn joined(&self) -> bool {
        self.joined
    }

    pub fn set_joined(&mut self, joined: bool) {
        self.joined = joined;
    }

    pub fn device_info(&self) -> Option<&DeviceInfo> {
        self.device_info.as_ref()
    }

    pub fn set_device_info(&mut self, info: DeviceInfo) {
        self.device_info = Some(info);
    }

    /// Any value still waiting to be pushed?
    pub fn any_dirty(&self) -> bool {
        self.radio.is_dirty()
            || self.rx_config.is_dirty()
            || self.rate_policy.is_dirty()
            || self.ac_params.iter().any(Slot::is_dirty)
            || self.templates.values().any(Slot::is_dirty)
            || self.beacon_filter.is_dirty()
            || self.event_mask.is_dirty()
            || self.keep_alive.is_dirty()
            || self.scan_params.is_dirty()
            || self.join.is_dirty()
            || self.aid.is_dirty()
            || self.ht_capabilities.is_dirty()
            || self.ht_operation.is_dirty()
            || self.ba_policy.is_dirty()
            || self.keys.any_dirty()
    }

    /// Re-arm every populated slot for a full replay after a device reset.
    /// The joined flag is cleared: the replacement firmware instance has
    /// never seen the join.
    pub fn mark_all_dirty(&mut self) {
        self.radio.mark_dirty();
        self.rx_config.mark_dirty();
        self.rate_policy.mark_dirty();
        for slot in &mut self.ac_params {
            slot.mark_dirty();
        }
        for slot in self.templates.values_mut() {
            slot.mark_dirty();
        }
        self.beacon_filter.mark_dirty();
        self.event_mask.mark_dirty();
        self.keep_alive.mark_dirty();
        self.scan_params.mark_dirty();
        self.join.mark_dirty();
        self.aid.mark_dirty();
        self.ht_capabilities.mark_dirty();
        self.ht_operation.mark_dirty();
        self.ba_policy.mark_dirty();
        self.keys.mark_all_dirty();
        self.joined = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::keys::CipherSuite;
    use crate::protocol::command::Band;

    fn radio() -> RadioParams {
        RadioParams {
            channel: 6,
            band: Band::Band2Ghz,
            tx_power: 20,
            rts_threshold: 2347,
            frag_threshold: 2346,
        }
    }

    #[test]
    fn test_slot_starts_empty_and_clean() {
        let slot = Slot::<RadioParams>::default();
        assert!(slot.get().is_none());
        assert!(!slot.is_dirty());
    }

    #[test]
    fn test_identical_set_does_not_redirty() {
        let mut store = ConfigStore::new();
        store.radio.set(radio());
        store.radio.clear_dirty();

        store.radio.set(radio());
        assert!(!store.radio.is_dirty());

        let mut changed = radio();
        changed.channel = 11;
        store.radio.set(changed);
        assert!(store.radio.is_dirty());
    }

    #[test]
    fn test_slot_dirty_lifecycle() {
        let mut store = ConfigStore::new();
        assert!(!store.any_dirty());

        store.radio.set(radio());
        assert!(store.radio.is_dirty());

        store.radio.clear_dirty();
        assert!(!store.any_dirty());
        assert_eq!(store.radio.get().unwrap().channel, 6);
    }

    #[test]
    fn test_mark_all_dirty_only_populated() {
        let mut store = ConfigStore::new();
        store.radio.set(radio());
        store.set_key(
            0,
            KeyMaterial {
                cipher: CipherSuite::Ccmp,
                key: vec![0; 16],
            },
        );
        store.set_joined(true);
        store.radio.clear_dirty();
        store.keys.clear_dirty(0);

        store.mark_all_dirty();
        assert!(store.radio.is_dirty());
        assert!(store.keys.any_dirty());
        // Untouched slots stay clean: there is nothing to replay.
        assert!(!store.rx_config.is_dirty());
        assert!(!store.joined());
    }

    #[test]
    fn test_event_mask_accumulates() {
        let mut store = ConfigStore::new();
        store.unmask_event(EventId::ScanComplete);
        store.unmask_event(EventId::JoinComplete);
        store.mask_event(EventId::ScanComplete);
        let mask = *store.event_mask.get().unwrap();
        assert_eq!(mask, EventId::JoinComplete.bit());
    }
}
