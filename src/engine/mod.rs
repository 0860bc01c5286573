//! The snooping engine.
//!
//! One [`Engine`] holds every VLAN instance, every joined group and the
//! router ports of each (owner, family). Every operation takes `&mut self`,
//! so the caller decides the locking; the daemon keeps the engine behind a
//! single mutex.

mod filter;
mod hwsync;
mod querier;
mod rx;
mod stats;
mod tx;
mod types;

pub use filter::{transition, Transition};
pub use stats::{Counters, IgmpCounters, MldCounters, VlanStatistics};
pub use types::{
    FilterMode, GlobalStatus, GroupInfo, GroupKey, QuerierState, RouterStatus, Seconds, SourceInfo, VlanKey,
    VlanStatus, DYNAMIC_ROUTER_TIMEOUT, QUERY_SUPPRESSION_TIMEOUT,
};

use types::{GlobalState, GroupEntry, VlanState};

use crate::addr::{link_local_from_mac, Family, IpmcAddr};
use crate::config::{parse_mac, Config, GlobalConf, Owner, PortConf, PortRole, ProfilesConfig, VlanConf};
use crate::hw::Hardware;
use crate::portset::{PortNo, PortSet};
use crate::profile::ProfileTable;
use crate::transmit::Transmit;

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;

pub const OWNERS: [Owner; 2] = [Owner::Ipmc, Owner::Mvr];
pub const FAMILIES: [Family; 2] = [Family::Ipv4, Family::Ipv6];

/// Source MAC used when none is configured or discovered.
pub const DEFAULT_SYSTEM_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x01];

/// IPv4 querier address of last resort (TEST-NET-1).
const FALLBACK_IPV4: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 1);

/// Forwarding masks of the entries sharing one multicast MAC in one VLAN.
type MacUsers = BTreeMap<(IpmcAddr, Option<IpmcAddr>), PortSet>;

pub struct Engine {
    port_count: usize,
    smac: [u8; 6],

    grp_cnt_max: usize,
    src_per_grp_cnt_max: usize,
    tcam_ipv4: bool,
    tcam_ipv6: bool,
    vlan_cnt_max: u32,

    profiles_config: ProfilesConfig,
    profiles: ProfileTable,

    link_up: PortSet,
    stp_forwarding: PortSet,

    /// aggregation partners of each port, the port itself included
    aggr: Vec<PortSet>,

    vlan_if_ipv4: BTreeMap<u16, Ipv4Addr>,
    any_ipv4: Option<Ipv4Addr>,

    globals: BTreeMap<(Owner, Family), GlobalState>,
    vlans: BTreeMap<VlanKey, VlanState>,
    groups: BTreeMap<GroupKey, GroupEntry>,

    /// groups to report upstream on the next tick
    proxy_queue: BTreeSet<GroupKey>,

    mac_table: BTreeMap<(u16, [u8; 6]), MacUsers>,

    /// unregistered flooding mask wanted by each (owner, family)
    flood_mask: BTreeMap<(Owner, Family), PortSet>,

    /// combined mask last handed to the hardware, per family
    flood_members: BTreeMap<Family, PortSet>,

    now: Seconds,

    hw: Box<dyn Hardware>,
    tx: Box<dyn Transmit>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("port_count", &self.port_count)
            .field("now", &self.now)
            .field("vlans", &self.vlans.len())
            .field("groups", &self.groups.len())
            .finish()
    }
}

fn vlan_ports(conf: &VlanConf, ports: &[PortNo], port_count: usize) -> PortSet {
    ports.iter()
        .chain(conf.source_ports.iter())
        .chain(conf.receiver_ports.iter())
        .copied()
        .filter(|port| *port < port_count)
        .collect()
}

impl Engine {
    pub fn new(config: &Config, hw: Box<dyn Hardware>, tx: Box<dyn Transmit>) -> Self {
        let port_count = config.port_count();
        let smac = config.system.mac.as_deref().and_then(parse_mac).unwrap_or(DEFAULT_SYSTEM_MAC);
        let all = PortSet::all(port_count);

        let mut engine = Self {
            port_count,
            smac,
            grp_cnt_max: config.system.grp_cnt_max,
            src_per_grp_cnt_max: config.system.src_per_grp_cnt_max,
            tcam_ipv4: config.system.tcam_ipv4,
            tcam_ipv6: config.system.tcam_ipv6,
            vlan_cnt_max: config.system.vlan_cnt_max,
            profiles_config: config.profiles.clone(),
            profiles: ProfileTable::from_config(&config.profiles),
            link_up: all,
            stp_forwarding: all,
            aggr: (0..port_count).map(PortSet::single).collect(),
            vlan_if_ipv4: BTreeMap::new(),
            any_ipv4: None,
            globals: BTreeMap::new(),
            vlans: BTreeMap::new(),
            groups: BTreeMap::new(),
            proxy_queue: BTreeSet::new(),
            mac_table: BTreeMap::new(),
            flood_mask: BTreeMap::new(),
            flood_members: BTreeMap::new(),
            now: 1,
            hw,
            tx,
        };

        for owner in OWNERS {
            for family in FAMILIES {
                let port_conf = Self::port_conf_from_config(config, family, port_count);
                let global = GlobalState::new(owner, family, config.global(owner, family).clone(), port_conf);
                engine.globals.insert((owner, family), global);
            }
        }

        for entry in &config.vlans {
            let key = VlanKey::new(entry.owner, entry.family, entry.vid);
            engine.vlan_conf_set(key, entry.conf.clone(), &entry.ports);
        }

        for owner in OWNERS {
            for family in FAMILIES {
                for port in 0..port_count {
                    let router = engine.globals.get(&(owner, family))
                        .and_then(|global| global.port_conf.get(port))
                        .map(|conf| conf.router)
                        .unwrap_or(false);
                    if router {
                        engine.router_status_update(owner, family, Some(port), false, true);
                    }
                }
                engine.unregistered_flooding_update(owner, family);
            }
        }

        engine
    }

    fn port_conf_from_config(config: &Config, family: Family, port_count: usize) -> Vec<PortConf> {
        let mut port_conf = vec![PortConf::default(); port_count];
        for port in &config.ports {
            if let Some(slot) = port_conf.get_mut(port.index) {
                *slot = port.conf(family).clone();
            }
        }
        port_conf
    }

    /// Seconds since the engine was created, starting at 1.
    pub fn now(&self) -> Seconds {
        self.now
    }

    pub fn port_count(&self) -> usize {
        self.port_count
    }

    pub fn system_mac(&self) -> [u8; 6] {
        self.smac
    }

    pub fn set_system_mac(&mut self, mac: [u8; 6]) {
        if self.smac == mac {
            return;
        }
        self.smac = mac;
        self.querier_address_changed(None);
    }

    /// Records the IPv4 address of the interface of `vid`, or with `vid`
    /// unset, the address used when a VLAN has none.
    pub fn set_interface_address(&mut self, vid: Option<u16>, addr: Option<Ipv4Addr>) {
        let changed = match (vid, addr) {
            (Some(vid), Some(addr)) => self.vlan_if_ipv4.insert(vid, addr) != Some(addr),
            (Some(vid), None) => self.vlan_if_ipv4.remove(&vid).is_some(),
            (None, addr) => std::mem::replace(&mut self.any_ipv4, addr) != addr,
        };
        if changed {
            self.querier_address_changed(vid);
        }
    }

    fn querier_address_changed(&mut self, vid: Option<u16>) {
        let keys: Vec<VlanKey> = self.vlans.keys()
            .filter(|key| vid.map(|vid| vid == key.vid).unwrap_or(true))
            .copied()
            .collect();
        for key in keys {
            self.querier_state_update(&key);
        }
    }

    /// Address used as source of our queries and reports in `key`.
    pub fn our_ip(&self, key: &VlanKey) -> IpmcAddr {
        match key.family {
            Family::Ipv4 => {
                let configured = self.vlans.get(key)
                    .and_then(|vlan| vlan.conf.querier_address)
                    .filter(|addr| !addr.is_unspecified());
                let addr = configured
                    .or_else(|| self.vlan_if_ipv4.get(&key.vid).copied())
                    .or(self.any_ipv4)
                    .unwrap_or(FALLBACK_IPV4);
                IpmcAddr::V4(addr)
            }
            Family::Ipv6 => IpmcAddr::V6(link_local_from_mac(&self.smac)),
        }
    }

    pub fn vlan_keys(&self) -> Vec<VlanKey> {
        self.vlans.keys().copied().collect()
    }

    pub fn vlan_status(&self, key: &VlanKey) -> Option<&VlanStatus> {
        self.vlans.get(key).map(|vlan| &vlan.status)
    }

    pub fn vlan_statistics(&self, key: &VlanKey) -> Option<&VlanStatistics> {
        self.vlans.get(key).map(|vlan| &vlan.statistics)
    }

    pub fn statistics_clear(&mut self, key: &VlanKey) {
        if let Some(vlan) = self.vlans.get_mut(key) {
            vlan.statistics = VlanStatistics::default();
        }
    }

    pub fn global_status(&self, owner: Owner, family: Family) -> Option<GlobalStatus> {
        let global = self.globals.get(&(owner, family))?;
        Some(GlobalStatus {
            router_ports: global.router_ports(),
            static_router_ports: global.static_router_ports,
            dynamic_router_ports: global.dynamic_router_ports,
            query_flooding_cnt: global.query_flooding_cnt,
            grp_cnt_exceeded: global.grp_cnt_exceeded,
            src_cnt_exceeded: global.src_cnt_exceeded,
        })
    }

    pub fn router_status(&self, owner: Owner, family: Family, port: PortNo) -> RouterStatus {
        self.globals.get(&(owner, family))
            .map(|global| global.router_status(port))
            .unwrap_or_default()
    }

    fn group_info(key: &GroupKey, grp: &GroupEntry) -> GroupInfo {
        GroupInfo {
            key: *key,
            active_ports: grp.active_ports,
            exclude_mode_ports: grp.exclude_mode_ports,
            grp_compat: grp.grp_compat,
            asm_ports: grp.asm.include_port_list,
            sources: grp.src_map.entries.iter().map(|(source, entry)| SourceInfo {
                source: *source,
                include_port_list: entry.include_port_list,
                exclude_port_list: entry.exclude_port_list,
                hw_location: entry.hw.location,
            }).collect(),
        }
    }

    pub fn groups(&self) -> Vec<GroupInfo> {
        self.groups.iter().map(|(key, grp)| Self::group_info(key, grp)).collect()
    }

    pub fn group(&self, key: &GroupKey) -> Option<GroupInfo> {
        self.groups.get(key).map(|grp| Self::group_info(key, grp))
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    fn global(&self, key: &VlanKey) -> Option<&GlobalState> {
        self.globals.get(&(key.owner, key.family))
    }

    fn global_mut(&mut self, key: &VlanKey) -> Option<&mut GlobalState> {
        self.globals.get_mut(&(key.owner, key.family))
    }

    fn router_ports(&self, key: &VlanKey) -> PortSet {
        self.global(key).map(|global| global.router_ports()).unwrap_or_default()
    }

    fn is_proxy(&self, key: &VlanKey) -> bool {
        self.global(key).map(|global| global.conf.proxy).unwrap_or(false)
    }

    fn is_leave_proxy(&self, key: &VlanKey) -> bool {
        self.global(key).map(|global| global.conf.leave_proxy).unwrap_or(false)
    }

    fn port_role(&self, key: &VlanKey, port: PortNo) -> PortRole {
        match key.owner {
            Owner::Ipmc => PortRole::None,
            Owner::Mvr => self.vlans.get(key).map(|vlan| vlan.conf.port_role(port)).unwrap_or_default(),
        }
    }

    /// Adds the aggregation partners of every port in `ports`.
    fn aggr_expand(&self, ports: PortSet) -> PortSet {
        let mut expanded = ports;
        for port in ports.iter() {
            if let Some(partners) = self.aggr.get(port) {
                expanded |= *partners;
            }
        }
        expanded
    }

    fn vlan_oper_active(&self, vlan: &VlanState) -> bool {
        let Some(global) = self.global(&vlan.key) else {
            return false;
        };
        if !vlan.conf.admin_active || !global.conf.admin_active {
            return false;
        }
        match vlan.key.owner {
            Owner::Ipmc => true,
            Owner::Mvr => self.profiles.is_enabled() && self.profiles.contains(&vlan.conf.channel_profile),
        }
    }

    fn vlan_keys_of(&self, owner: Owner, family: Family) -> Vec<VlanKey> {
        self.vlans.keys()
            .filter(|key| key.owner == owner && key.family == family)
            .copied()
            .collect()
    }

    fn group_keys_of(&self, vlan: &VlanKey) -> Vec<GroupKey> {
        self.groups.keys()
            .filter(|key| key.vlan == *vlan)
            .copied()
            .collect()
    }

    /// Brings the operational state of `key` in line with its configuration.
    fn oper_state_update(&mut self, key: &VlanKey) {
        let Some(vlan) = self.vlans.get(key) else {
            return;
        };
        let active = self.vlan_oper_active(vlan);
        if active == vlan.status.oper_active {
            return;
        }

        if active {
            log::info!("{}: operationally active", key);
            if let Some(vlan) = self.vlans.get_mut(key) {
                vlan.status.oper_active = true;
            }
            self.vlan_state_init(key, false);
        } else {
            log::info!("{}: operationally inactive", key);
            self.deactivate(key);
            if let Some(vlan) = self.vlans.get_mut(key) {
                vlan.status.oper_active = false;
            }
            self.querier_state_update(key);
        }
    }

    /// Removes every group of `key` from the directory and the hardware and
    /// restarts its querier. Statistics are kept.
    pub fn deactivate(&mut self, key: &VlanKey) {
        for grp_key in self.group_keys_of(key) {
            if let Some(grp) = self.groups.remove(&grp_key) {
                self.group_erase(&grp_key, grp);
            }
        }
        self.proxy_queue_clear(key);
        self.vlan_state_init(key, false);
    }

    fn proxy_queue_clear(&mut self, key: &VlanKey) {
        self.proxy_queue.retain(|grp_key| grp_key.vlan != *key);
    }

    /// Creates or reconfigures a VLAN instance. `ports` are the member
    /// ports in addition to the MVR source and receiver ports.
    pub fn vlan_conf_set(&mut self, key: VlanKey, conf: VlanConf, ports: &[PortNo]) {
        let members = vlan_ports(&conf, ports, self.port_count);

        if !self.vlans.contains_key(&key) {
            log::info!("{}: created", key);
            self.vlans.insert(key, VlanState::new(key, conf, members));
            self.vlan_state_init(&key, true);
            self.oper_state_update(&key);
            return;
        }
        let Some(vlan) = self.vlans.get_mut(&key) else {
            return;
        };

        if vlan.conf == conf && vlan.members == members {
            return;
        }

        let old_conf = std::mem::replace(&mut vlan.conf, conf);
        let old_members = std::mem::replace(&mut vlan.members, members);
        let new_conf = vlan.conf.clone();
        let was_active = vlan.status.oper_active;

        if old_conf.querier_enable != new_conf.querier_enable {
            vlan.status.querier_state = QuerierState::Disabled;
        }

        self.oper_state_update(&key);
        let active = self.vlans.get(&key).map(|vlan| vlan.status.oper_active).unwrap_or(false);

        if was_active && !active && self.vlan_keys_of(key.owner, key.family).iter().all(|other| {
            *other == key || !self.vlans.get(other).map(|vlan| vlan.status.oper_active).unwrap_or(false)
        }) {
            self.router_status_update(key.owner, key.family, None, true, false);
        }

        if !active || !was_active {
            return;
        }

        for port in (old_members - members).iter() {
            self.vlan_port_remove(&key, port);
        }

        let querier_update = old_conf.querier_enable != new_conf.querier_enable
            || (key.family.is_ipv4() && old_conf.querier_address != new_conf.querier_address)
            || old_conf.rv != new_conf.rv
            || old_conf.qi != new_conf.qi
            || old_conf.qri != new_conf.qri
            || old_conf.lmqi != new_conf.lmqi;
        if querier_update {
            self.querier_state_update(&key);
        }

        if old_conf.compatibility != new_conf.compatibility {
            self.compatibility_status_update(&key, old_conf.compatibility);
        }

        if old_conf.channel_profile != new_conf.channel_profile {
            self.vlan_profile_changed(&key);
        }

        if old_conf.compatible_mode != new_conf.compatible_mode {
            self.vlan_compatible_mode_changed(&key);
        }

        for port in 0..self.port_count {
            if old_conf.port_role(port) != new_conf.port_role(port) {
                self.vlan_port_role_changed(&key, port);
            }
        }
    }

    pub fn vlan_remove(&mut self, key: &VlanKey) {
        if !self.vlans.contains_key(key) {
            return;
        }
        self.deactivate(key);
        self.vlans.remove(key);
        log::info!("{}: removed", key);

        if self.vlan_keys_of(key.owner, key.family).is_empty() {
            self.router_status_update(key.owner, key.family, None, true, false);
        }
    }

    pub fn global_conf_set(&mut self, owner: Owner, family: Family, conf: GlobalConf) {
        let Some(global) = self.globals.get(&(owner, family)) else {
            return;
        };
        if global.conf == conf {
            return;
        }
        let old_conf = global.conf.clone();
        let keys = self.vlan_keys_of(owner, family);

        if old_conf.admin_active && !conf.admin_active {
            log::info!("{}-{}: deactivating", owner, family.protocol_name());
            for key in &keys {
                self.deactivate(key);
            }
        }

        if old_conf.proxy && !conf.proxy {
            for key in &keys {
                self.proxy_queue_clear(key);
            }
        }

        let admin_changed = old_conf.admin_active != conf.admin_active;
        let flooding_changed = admin_changed || old_conf.unregistered_flooding != conf.unregistered_flooding;
        if let Some(global) = self.globals.get_mut(&(owner, family)) {
            global.conf = conf;
        }

        if old_conf.admin_active && admin_changed {
            self.router_status_update(owner, family, None, true, false);
        }

        if flooding_changed {
            self.unregistered_flooding_update(owner, family);
        }

        if admin_changed {
            for key in &keys {
                self.oper_state_update(key);
            }
        }
    }

    pub fn port_conf_set(&mut self, owner: Owner, family: Family, port: PortNo, conf: PortConf) {
        let Some(global) = self.globals.get_mut(&(owner, family)) else {
            return;
        };
        let Some(slot) = global.port_conf.get_mut(port) else {
            return;
        };
        if *slot == conf {
            return;
        }
        let old_conf = std::mem::replace(slot, conf.clone());

        let grp_cnt_max_update = conf.grp_cnt_max != 0
            && (old_conf.grp_cnt_max == 0 || conf.grp_cnt_max < old_conf.grp_cnt_max);
        if grp_cnt_max_update {
            self.grp_cnt_max_update(owner, family, port);
        }

        if old_conf.router != conf.router {
            self.router_status_update(owner, family, Some(port), false, conf.router);
        }

        if old_conf.profile != conf.profile {
            self.port_profile_changed(owner, family, port);
        }
    }

    /// Replaces the profile table and re-evaluates every group against it.
    pub fn profiles_set(&mut self, config: &ProfilesConfig) {
        if self.profiles_config == *config {
            return;
        }
        self.profiles_config = config.clone();
        self.profiles = ProfileTable::from_config(config);
        self.profile_changed();
    }

    /// Removes ports and groups the profiles no longer permit.
    pub fn profile_changed(&mut self) {
        for key in self.vlan_keys() {
            self.oper_state_update(&key);
        }
        for owner in OWNERS {
            for family in FAMILIES {
                for port in 0..self.port_count {
                    self.port_profile_changed(owner, family, port);
                }
            }
        }
        for key in self.vlan_keys() {
            self.vlan_profile_changed(&key);
        }
    }

    /// Applies a reloaded configuration, changing only what differs.
    pub fn apply_config(&mut self, config: &Config) {
        if config.port_count() != self.port_count {
            log::warn!("port count change from {} to {} needs a restart", self.port_count, config.port_count());
        }

        if let Some(mac) = config.system.mac.as_deref().and_then(parse_mac) {
            self.set_system_mac(mac);
        }
        self.grp_cnt_max = config.system.grp_cnt_max;
        self.src_per_grp_cnt_max = config.system.src_per_grp_cnt_max;
        self.vlan_cnt_max = config.system.vlan_cnt_max;

        self.profiles_set(&config.profiles);

        for owner in OWNERS {
            for family in FAMILIES {
                self.global_conf_set(owner, family, config.global(owner, family).clone());
                let port_conf = Self::port_conf_from_config(config, family, self.port_count);
                for (port, conf) in port_conf.into_iter().enumerate() {
                    self.port_conf_set(owner, family, port, conf);
                }
            }
        }

        let wanted: BTreeSet<VlanKey> = config.vlans.iter()
            .map(|entry| VlanKey::new(entry.owner, entry.family, entry.vid))
            .collect();
        for key in self.vlan_keys() {
            if !wanted.contains(&key) {
                self.vlan_remove(&key);
            }
        }
        for entry in &config.vlans {
            let key = VlanKey::new(entry.owner, entry.family, entry.vid);
            self.vlan_conf_set(key, entry.conf.clone(), &entry.ports);
        }
    }

    /// Link state of `port`. Losing the link drops the port from every
    /// group and from the dynamic router ports.
    pub fn link_set(&mut self, port: PortNo, up: bool) {
        if port >= self.port_count || self.link_up.contains(port) == up {
            return;
        }
        self.link_up.set(port, up);
        if !up {
            self.port_down(port);
        }
    }

    pub fn port_down(&mut self, port: PortNo) {
        log::info!("port {}: down", port);
        let keys: Vec<GroupKey> = self.groups.keys().copied().collect();
        for key in keys {
            self.grp_port_remove(&key, port);
        }
        for owner in OWNERS {
            for family in FAMILIES {
                self.router_status_update(owner, family, Some(port), true, false);
            }
        }
    }

    /// Spanning tree forwarding state of `port`.
    pub fn stp_forwarding_set(&mut self, port: PortNo, forwarding: bool) {
        if port >= self.port_count || self.stp_forwarding.contains(port) == forwarding {
            return;
        }
        self.stp_forwarding.set(port, forwarding);
        if !forwarding {
            return;
        }
        for key in self.vlan_keys() {
            let active = self.vlans.get(&key).map(|vlan| vlan.status.oper_active).unwrap_or(false);
            if active {
                self.vlan_stp_forwarding(&key, port);
            }
        }
    }

    /// Replaces the aggregation groups. Ports not listed stand alone.
    pub fn aggregation_set(&mut self, aggregations: &[PortSet]) {
        let mut aggr: Vec<PortSet> = (0..self.port_count).map(PortSet::single).collect();
        for members in aggregations {
            for port in members.iter() {
                if let Some(slot) = aggr.get_mut(port) {
                    *slot |= *members;
                }
            }
        }
        if aggr == self.aggr {
            return;
        }
        let changed: Vec<PortNo> = (0..self.port_count).filter(|port| aggr[*port] != self.aggr[*port]).collect();
        self.aggr = aggr;
        for port in changed {
            self.aggregation_changed(port);
        }
    }

    /// Re-programs every group active on `port`.
    pub fn aggregation_changed(&mut self, port: PortNo) {
        let keys: Vec<GroupKey> = self.groups.iter()
            .filter(|(_, grp)| grp.active_ports.contains(port))
            .map(|(key, _)| *key)
            .collect();
        for key in keys {
            if let Some(mut grp) = self.groups.remove(&key) {
                grp.mark_all_changed();
                self.hw_update(&key, &mut grp);
                self.group_reinsert(key, grp);
            }
        }
    }

    /// Re-programs every group, for instance after router ports were
    /// changed behind the engine's back.
    pub fn router_status_changed(&mut self) {
        for owner in OWNERS {
            for family in FAMILIES {
                self.router_status_changed_for(owner, family);
            }
        }
    }

    fn router_status_changed_for(&mut self, owner: Owner, family: Family) {
        let keys: Vec<GroupKey> = self.groups.keys()
            .filter(|key| key.vlan.owner == owner && key.vlan.family == family)
            .copied()
            .collect();
        for key in keys {
            if let Some(mut grp) = self.groups.remove(&key) {
                grp.mark_all_changed();
                self.hw_update(&key, &mut grp);
                self.group_reinsert(key, grp);
            }
        }
    }

    /// Puts a group taken out of the directory back, or erases it when no
    /// port is left.
    fn group_reinsert(&mut self, key: GroupKey, grp: GroupEntry) {
        if grp.active_ports.is_empty() {
            self.group_erase(&key, grp);
        } else {
            self.groups.insert(key, grp);
        }
    }

    /// Drops `port` from the group, erasing the group if it was the last.
    fn grp_port_remove(&mut self, key: &GroupKey, port: PortNo) {
        let Some(mut grp) = self.groups.remove(key) else {
            return;
        };
        if !grp.active_ports.contains(port) {
            self.groups.insert(*key, grp);
            return;
        }

        for entry in grp.src_map.entries.values_mut() {
            if entry.include_port_list.contains(port) || entry.exclude_port_list.contains(port) {
                entry.include_port_list.remove(port);
                entry.exclude_port_list.remove(port);
                entry.changed = true;
                grp.src_map.changed = true;
            }
        }
        grp.active_ports.remove(port);
        grp.asm.changed = true;

        self.hw_update(key, &mut grp);
        self.group_reinsert(*key, grp);
    }

    fn vlan_port_remove(&mut self, key: &VlanKey, port: PortNo) {
        for grp_key in self.group_keys_of(key) {
            self.grp_port_remove(&grp_key, port);
        }
    }

    /// Removes the groups of (owner, family) that `port` joined beyond its
    /// limit.
    fn grp_cnt_max_update(&mut self, owner: Owner, family: Family, port: PortNo) {
        let Some(global) = self.globals.get(&(owner, family)) else {
            return;
        };
        if !global.conf.admin_active {
            return;
        }
        let max = global.port_conf.get(port).map(|conf| conf.grp_cnt_max).unwrap_or(0) as usize;
        if max == 0 {
            return;
        }

        let surplus: Vec<GroupKey> = self.groups.iter()
            .filter(|(key, grp)| key.vlan.owner == owner && key.vlan.family == family && grp.active_ports.contains(port))
            .map(|(key, _)| *key)
            .skip(max)
            .collect();
        for key in surplus {
            log::info!("{}: port {} beyond its group limit", key, port);
            self.grp_port_remove(&key, port);
        }
    }

    fn port_profile_changed(&mut self, owner: Owner, family: Family, port: PortNo) {
        if owner != Owner::Ipmc {
            return;
        }
        let Some(global) = self.globals.get(&(owner, family)) else {
            return;
        };
        let profile = global.port_conf.get(port).map(|conf| conf.profile.clone()).unwrap_or_default();

        let denied: Vec<GroupKey> = self.groups.iter()
            .filter(|(key, grp)| key.vlan.owner == owner && key.vlan.family == family && grp.active_ports.contains(port))
            .filter(|(key, _)| !self.permit(&key.vlan, &profile, &key.group, &IpmcAddr::zero(family), port, false))
            .map(|(key, _)| *key)
            .collect();
        for key in denied {
            log::info!("{}: port {} no longer permitted", key, port);
            self.grp_port_remove(&key, port);
        }
    }

    fn vlan_profile_changed(&mut self, key: &VlanKey) {
        if key.owner != Owner::Mvr {
            return;
        }
        let Some(vlan) = self.vlans.get(key) else {
            return;
        };
        let profile = vlan.conf.channel_profile.clone();
        let zero = IpmcAddr::zero(key.family);

        for grp_key in self.group_keys_of(key) {
            if self.permit(key, &profile, &grp_key.group, &zero, 0, false) {
                continue;
            }
            log::info!("{}: no longer permitted", grp_key);
            if let Some(grp) = self.groups.remove(&grp_key) {
                self.group_erase(&grp_key, grp);
            }
        }
    }

    fn vlan_compatible_mode_changed(&mut self, key: &VlanKey) {
        let compatible_mode = self.vlans.get(key).map(|vlan| vlan.conf.compatible_mode).unwrap_or(false);
        if !compatible_mode {
            return;
        }
        for port in 0..self.port_count {
            if self.port_role(key, port) == PortRole::Source {
                self.vlan_port_remove(key, port);
            }
        }
    }

    fn vlan_port_role_changed(&mut self, key: &VlanKey, port: PortNo) {
        let compatible_mode = self.vlans.get(key).map(|vlan| vlan.conf.compatible_mode).unwrap_or(false);
        if compatible_mode && self.port_role(key, port) == PortRole::Source {
            self.vlan_port_remove(key, port);
        }
    }

    fn permit(&self, key: &VlanKey, profile: &str, group: &IpmcAddr, source: &IpmcAddr, port: PortNo, log: bool) -> bool {
        let query = crate::profile::PermitQuery {
            profile,
            group,
            source,
            vid: key.vid,
            port,
        };
        self.profiles.permit(key.owner, &query, log)
    }

    /// Adds or removes `port` (all ports when `None`) as a static or
    /// dynamic router port.
    fn router_status_update(&mut self, owner: Owner, family: Family, port: Option<PortNo>, dynamic: bool, add: bool) {
        let port_count = self.port_count;
        let Some(global) = self.globals.get_mut(&(owner, family)) else {
            return;
        };

        let ports: Vec<PortNo> = match port {
            Some(port) if port < port_count => vec![port],
            Some(_) => Vec::new(),
            None => (0..port_count).collect(),
        };

        let mut update_chip = false;
        for port in ports {
            let list = if dynamic { &mut global.dynamic_router_ports } else { &mut global.static_router_ports };
            if list.contains(port) == add {
                continue;
            }
            list.set(port, add);
            if dynamic && !add {
                if let Some(timeout) = global.dynamic_router_timeout.get_mut(port) {
                    *timeout = 0;
                }
            }

            let old_status = global.router_status(port);
            let new_status = global.router_status_refresh(port);
            log::info!("{}-{}: port {} router status {:?}", owner, family.protocol_name(), port, new_status);
            if global.conf.admin_active && (old_status == RouterStatus::None) != (new_status == RouterStatus::None) {
                update_chip = true;
            }
        }

        if update_chip {
            self.router_status_changed_for(owner, family);
        }
        self.unregistered_flooding_update(owner, family);
    }

    /// Runs the once-per-second timers.
    pub fn tick(&mut self) {
        self.now += 1;

        let keys: Vec<GroupKey> = self.groups.keys().copied().collect();
        for key in keys {
            self.group_tick(&key);
        }

        self.proxy_queue_tick();

        for key in self.vlan_keys() {
            let active = self.vlans.get(&key).map(|vlan| vlan.status.oper_active).unwrap_or(false);
            if !active {
                continue;
            }
            self.proxy_tick(&key);
            self.general_query_tx_tick(&key);
            self.older_version_querier_tick(&key);
        }

        self.global_tick();
    }

    fn group_tick(&mut self, key: &GroupKey) {
        let Some(mut grp) = self.groups.remove(key) else {
            return;
        };

        self.src_timer_tick(&mut grp);
        self.group_timer_tick(&mut grp);

        if grp.asm.changed || grp.src_map.changed {
            self.hw_update(key, &mut grp);
            if grp.active_ports.is_empty() {
                log::info!("{}: all ports timed out", key);
                self.group_erase(key, grp);
                return;
            }
        }

        self.query_retransmit_tick(key, &mut grp);
        let compat_changed = self.older_version_host_tick(key, &mut grp);
        self.groups.insert(*key, grp);

        if compat_changed {
            self.host_compat_update(&key.vlan);
        }
    }

    fn proxy_queue_tick(&mut self) {
        let queue = std::mem::take(&mut self.proxy_queue);
        for key in queue {
            let Some(compat) = self.vlans.get(&key.vlan).map(|vlan| vlan.status.querier_compat) else {
                continue;
            };
            self.tx_report(&key.vlan, &key.group, compat);
        }
    }

    fn global_tick(&mut self) {
        let mut expired = Vec::new();
        for global in self.globals.values_mut() {
            global.query_suppression_timeout = global.query_suppression_timeout.saturating_sub(1);
            if global.query_suppression_timeout == 0 {
                global.query_flooding_cnt = 0;
                global.query_suppression_timeout = QUERY_SUPPRESSION_TIMEOUT;
            }

            for port in global.dynamic_router_ports.iter() {
                let Some(timeout) = global.dynamic_router_timeout.get_mut(port) else {
                    continue;
                };
                if *timeout == 0 {
                    *timeout = 1;
                }
                *timeout -= 1;
                if *timeout == 0 {
                    expired.push((global.owner, global.family, port));
                }
            }
        }

        for (owner, family, port) in expired {
            log::info!("{}-{}: dynamic router port {} timed out", owner, family.protocol_name(), port);
            self.router_status_update(owner, family, Some(port), true, false);
        }
    }
}
