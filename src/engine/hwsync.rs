//! Pushes group state to the forwarding hardware.

use super::types::{GroupEntry, GroupKey, HwEntry};
use super::Engine;

use crate::addr::{Family, IpmcAddr};
use crate::config::Owner;
use crate::hw::HwLocation;
use crate::portset::PortSet;

impl Engine {
    /// Prunes ports and sources that no longer hold any state and
    /// programs the changed entries of a group.
    pub(super) fn hw_update(&mut self, key: &GroupKey, grp: &mut GroupEntry) {
        let routers = self.router_ports(&key.vlan);

        let mut listening = grp.exclude_mode_ports;
        for entry in grp.src_map.entries.values() {
            listening |= entry.include_port_list | entry.exclude_port_list;
        }
        grp.active_ports &= listening;

        let gone = grp.active_ports.is_empty();
        if gone {
            grp.asm.changed = true;
            grp.src_map.changed = true;
        }
        grp.exclude_mode_ports &= grp.active_ports;
        let exclude_mode_ports = grp.exclude_mode_ports;

        if grp.asm.changed {
            grp.asm.include_port_list = exclude_mode_ports;
            if gone {
                self.hw_delete(key, None, &mut grp.asm.hw);
            } else {
                let fwd = self.aggr_expand(routers | exclude_mode_ports);
                self.hw_add(key, None, &mut grp.asm.hw, fwd);
            }
            grp.asm.changed = false;
        }

        if grp.src_map.changed {
            let active = grp.active_ports;
            let mut removed = Vec::new();
            for (source, entry) in grp.src_map.entries.iter_mut() {
                if !gone && !entry.changed {
                    continue;
                }
                entry.include_port_list &= active;
                entry.exclude_port_list &= active;
                if gone || (entry.include_port_list.is_empty() && entry.exclude_port_list.is_empty()) {
                    removed.push(*source);
                    continue;
                }

                let ports = routers
                    | (entry.include_port_list - exclude_mode_ports)
                    | (!entry.exclude_port_list & exclude_mode_ports);
                let fwd = self.aggr_expand(ports);
                self.hw_add(key, Some(source), &mut entry.hw, fwd);
                entry.changed = false;
            }

            for source in removed {
                if let Some(mut entry) = grp.src_map.entries.remove(&source) {
                    self.hw_delete(key, Some(&source), &mut entry.hw);
                }
            }

            grp.src_map.changed = false;
            grp.src_map.next_src_timeout_update();
            grp.src_map.next_query_timeout_update();
        }
    }

    fn tcam_supported(&self, family: Family) -> bool {
        match family {
            Family::Ipv4 => self.tcam_ipv4,
            Family::Ipv6 => self.tcam_ipv6,
        }
    }

    /// Programs one entry, in the TCAM when possible and in the MAC table
    /// otherwise.
    fn hw_add(&mut self, key: &GroupKey, source: Option<&IpmcAddr>, hw: &mut HwEntry, fwd: PortSet) {
        let vid = key.vlan.vid;

        if self.tcam_supported(key.vlan.family) && hw.location != HwLocation::MacTable {
            match self.hw.mc_add(vid, &key.group, source, fwd) {
                Ok(()) => {
                    hw.location = HwLocation::Tcam;
                    hw.ports = fwd;
                    return;
                }
                Err(e) => {
                    log::warn!("{}: multicast entry add failed, using the MAC table: {}", key, e);
                    if hw.location == HwLocation::Tcam {
                        if let Err(e) = self.hw.mc_remove(vid, &key.group, source) {
                            log::error!("{}: multicast entry remove failed: {}", key, e);
                        }
                    }
                    hw.location = HwLocation::None;
                }
            }
        }

        let mac = key.group.multicast_mac();
        let users = self.mac_table.entry((vid, mac)).or_default();
        users.insert((key.group, source.copied()), fwd);
        let union = users.values().fold(PortSet::empty(), |union, ports| union | *ports);

        match self.hw.mac_add(vid, mac, union) {
            Ok(()) => {
                hw.location = HwLocation::MacTable;
                hw.ports = fwd;
            }
            Err(e) => {
                log::warn!("{}: MAC table add failed: {}", key, e);
                self.mac_user_remove(vid, mac, &key.group, source);
                hw.location = HwLocation::None;
                hw.ports = PortSet::empty();
            }
        }
    }

    fn hw_delete(&mut self, key: &GroupKey, source: Option<&IpmcAddr>, hw: &mut HwEntry) {
        let vid = key.vlan.vid;
        match hw.location {
            HwLocation::Tcam => {
                if let Err(e) = self.hw.mc_remove(vid, &key.group, source) {
                    log::error!("{}: multicast entry remove failed: {}", key, e);
                }
            }
            HwLocation::MacTable => {
                let mac = key.group.multicast_mac();
                match self.mac_user_remove(vid, mac, &key.group, source) {
                    Some(union) => {
                        if let Err(e) = self.hw.mac_add(vid, mac, union) {
                            log::error!("{}: MAC table update failed: {}", key, e);
                        }
                    }
                    None => {
                        if let Err(e) = self.hw.mac_remove(vid, mac) {
                            log::error!("{}: MAC table remove failed: {}", key, e);
                        }
                    }
                }
            }
            HwLocation::None => {}
        }
        hw.location = HwLocation::None;
        hw.ports = PortSet::empty();
    }

    /// Forgets one user of a multicast MAC. Returns the union of the
    /// remaining users, or `None` when there are none.
    fn mac_user_remove(&mut self, vid: u16, mac: [u8; 6], group: &IpmcAddr, source: Option<&IpmcAddr>) -> Option<PortSet> {
        let users = self.mac_table.get_mut(&(vid, mac))?;
        users.remove(&(*group, source.copied()));
        if users.is_empty() {
            self.mac_table.remove(&(vid, mac));
            return None;
        }
        Some(users.values().fold(PortSet::empty(), |union, ports| union | *ports))
    }

    /// Recomputes where unknown multicast of a family is flooded. IPMC and
    /// MVR each ask for a mask; the hardware gets their intersection.
    pub(super) fn unregistered_flooding_update(&mut self, owner: Owner, family: Family) {
        let all = PortSet::all(self.port_count);
        let Some(global) = self.globals.get(&(owner, family)) else {
            return;
        };
        let mask = if !global.conf.admin_active || global.conf.unregistered_flooding {
            all
        } else {
            global.router_ports()
        };

        if self.flood_mask.get(&(owner, family)) == Some(&mask) {
            return;
        }
        self.flood_mask.insert((owner, family), mask);

        let combined = [Owner::Ipmc, Owner::Mvr].iter()
            .map(|owner| self.flood_mask.get(&(*owner, family)).copied().unwrap_or(all))
            .fold(all, |combined, mask| combined & mask);
        if self.flood_members.get(&family) == Some(&combined) {
            return;
        }
        self.flood_members.insert(family, combined);

        log::debug!("{}: unregistered flooding to {}", family.protocol_name(), combined);
        if let Err(e) = self.hw.set_flood_members(family, combined) {
            log::warn!("{}: setting flood members failed: {}", family.protocol_name(), e);
        }
    }

    /// Removes a group taken out of the directory, hardware first, and tells
    /// the routers when we speak for the hosts.
    pub(super) fn group_erase(&mut self, key: &GroupKey, mut grp: GroupEntry) {
        grp.active_ports.clear();
        self.hw_update(key, &mut grp);

        if self.is_proxy(&key.vlan) || self.is_leave_proxy(&key.vlan) {
            self.tx_leave(&key.vlan, &key.group);
        }

        self.proxy_queue.remove(key);
        log::info!("{}: removed", key);
        self.host_compat_update(&key.vlan);
    }
}
