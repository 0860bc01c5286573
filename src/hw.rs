//! Forwarding table collaborator.

use crate::addr::{Family, IpmcAddr};
use crate::portset::PortSet;

use parking_lot::Mutex;

use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HwError {
    message: &'static str,
}

impl HwError {
    pub fn new(message: &'static str) -> Self {
        Self {
            message,
        }
    }
}

impl std::fmt::Display for HwError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for HwError {}

/// Where an entry currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HwLocation {
    #[default]
    None,
    Tcam,
    MacTable,
}

/// Multicast forwarding hardware.
///
/// `source` is `None` for the any-source entry of a group. Adding an entry
/// that already exists replaces its port set.
pub trait Hardware: Send {
    fn mc_add(&mut self, vid: u16, group: &IpmcAddr, source: Option<&IpmcAddr>, ports: PortSet) -> Result<(), HwError>;

    fn mc_remove(&mut self, vid: u16, group: &IpmcAddr, source: Option<&IpmcAddr>) -> Result<(), HwError>;

    fn mac_add(&mut self, vid: u16, mac: [u8; 6], ports: PortSet) -> Result<(), HwError>;

    fn mac_remove(&mut self, vid: u16, mac: [u8; 6]) -> Result<(), HwError>;

    fn set_flood_members(&mut self, family: Family, ports: PortSet) -> Result<(), HwError>;
}

impl<H: Hardware> Hardware for Arc<Mutex<H>> {
    fn mc_add(&mut self, vid: u16, group: &IpmcAddr, source: Option<&IpmcAddr>, ports: PortSet) -> Result<(), HwError> {
        self.lock().mc_add(vid, group, source, ports)
    }

    fn mc_remove(&mut self, vid: u16, group: &IpmcAddr, source: Option<&IpmcAddr>) -> Result<(), HwError> {
        self.lock().mc_remove(vid, group, source)
    }

    fn mac_add(&mut self, vid: u16, mac: [u8; 6], ports: PortSet) -> Result<(), HwError> {
        self.lock().mac_add(vid, mac, ports)
    }

    fn mac_remove(&mut self, vid: u16, mac: [u8; 6]) -> Result<(), HwError> {
        self.lock().mac_remove(vid, mac)
    }

    fn set_flood_members(&mut self, family: Family, ports: PortSet) -> Result<(), HwError> {
        self.lock().set_flood_members(family, ports)
    }
}

pub type McEntryKey = (u16, IpmcAddr, Option<IpmcAddr>);

/// Software forwarding table. The daemon keeps one for inspection, tests
/// assert against it.
#[derive(Debug, Clone, Default)]
pub struct MemoryHardware {
    mc: BTreeMap<(u16, String), (McEntryKey, PortSet)>,
    mac: BTreeMap<(u16, [u8; 6]), PortSet>,
    flood: BTreeMap<Family, PortSet>,

    /// maximum number of multicast entries, unlimited when `None`
    capacity: Option<usize>,
}

fn entry_name(group: &IpmcAddr, source: Option<&IpmcAddr>) -> String {
    match source {
        Some(source) => format!("({}, {})", source, group),
        None => format!("(*, {})", group),
    }
}

impl MemoryHardware {
    pub fn new() -> Self {
        Self::default()
    }

    /// Table that refuses multicast entries beyond `capacity`.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: Some(capacity),
            ..Self::default()
        }
    }

    pub fn shared(self) -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(self))
    }

    pub fn mc_get(&self, vid: u16, group: &IpmcAddr, source: Option<&IpmcAddr>) -> Option<PortSet> {
        self.mc.get(&(vid, entry_name(group, source))).map(|(_, ports)| *ports)
    }

    pub fn mac_get(&self, vid: u16, mac: [u8; 6]) -> Option<PortSet> {
        self.mac.get(&(vid, mac)).copied()
    }

    pub fn flood_members(&self, family: Family) -> Option<PortSet> {
        self.flood.get(&family).copied()
    }

    pub fn mc_entries(&self) -> Vec<(McEntryKey, PortSet)> {
        self.mc.values().cloned().collect()
    }

    pub fn mc_len(&self) -> usize {
        self.mc.len()
    }

    pub fn mac_len(&self) -> usize {
        self.mac.len()
    }
}

impl Hardware for MemoryHardware {
    fn mc_add(&mut self, vid: u16, group: &IpmcAddr, source: Option<&IpmcAddr>, ports: PortSet) -> Result<(), HwError> {
        let name = entry_name(group, source);
        let key = (vid, name);
        if !self.mc.contains_key(&key) {
            if let Some(capacity) = self.capacity {
                if self.mc.len() >= capacity {
                    return Err(HwError::new("multicast table full"));
                }
            }
        }
        log::debug!("vid {}: {} -> {}", vid, key.1, ports);
        self.mc.insert(key, ((vid, *group, source.copied()), ports));
        Ok(())
    }

    fn mc_remove(&mut self, vid: u16, group: &IpmcAddr, source: Option<&IpmcAddr>) -> Result<(), HwError> {
        let key = (vid, entry_name(group, source));
        match self.mc.remove(&key) {
            Some(_) => {
                log::debug!("vid {}: {} removed", vid, key.1);
                Ok(())
            }
            None => Err(HwError::new("no such multicast entry")),
        }
    }

    fn mac_add(&mut self, vid: u16, mac: [u8; 6], ports: PortSet) -> Result<(), HwError> {
        log::debug!("vid {}: mac {:02x?} -> {}", vid, mac, ports);
        self.mac.insert((vid, mac), ports);
        Ok(())
    }

    fn mac_remove(&mut self, vid: u16, mac: [u8; 6]) -> Result<(), HwError> {
        match self.mac.remove(&(vid, mac)) {
            Some(_) => Ok(()),
            None => Err(HwError::new("no such mac entry")),
        }
    }

    fn set_flood_members(&mut self, family: Family, ports: PortSet) -> Result<(), HwError> {
        log::debug!("{} flood members -> {}", family.protocol_name(), ports);
        self.flood.insert(family, ports);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_refuses_new_entries_only() {
        let mut hw = MemoryHardware::with_capacity(1);
        let group: IpmcAddr = "239.1.1.1".parse().unwrap();
        let other: IpmcAddr = "239.1.1.2".parse().unwrap();

        assert!(hw.mc_add(1, &group, None, PortSet::single(1)).is_ok());
        assert!(hw.mc_add(1, &group, None, PortSet::single(2)).is_ok());
        assert!(hw.mc_add(1, &other, None, PortSet::single(2)).is_err());
        assert_eq!(hw.mc_get(1, &group, None), Some(PortSet::single(2)));

        assert!(hw.mc_remove(1, &group, None).is_ok());
        assert!(hw.mc_remove(1, &group, None).is_err());
        assert_eq!(hw.mc_len(), 0);
    }
}
