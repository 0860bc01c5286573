use crate::addr::{Family, IpmcAddr};
use crate::config::{Compatibility, GlobalConf, Owner, PortConf, VlanConf};
use crate::hw::HwLocation;
use crate::portset::{PortNo, PortSet};

use super::stats::VlanStatistics;

use std::collections::BTreeMap;

/// Seconds since the engine started. Zero marks an inactive timer.
pub type Seconds = u64;

/// Reception of a query from a router keeps its port a router port for this long.
pub const DYNAMIC_ROUTER_TIMEOUT: u32 = 300;

/// Window over which forwarded queries are counted.
pub const QUERY_SUPPRESSION_TIMEOUT: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VlanKey {
    pub owner: Owner,
    pub family: Family,
    pub vid: u16,
}

impl VlanKey {
    pub fn new(owner: Owner, family: Family, vid: u16) -> Self {
        Self {
            owner,
            family,
            vid,
        }
    }
}

impl std::fmt::Display for VlanKey {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}-{}:{}", self.owner, self.family.protocol_name(), self.vid)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GroupKey {
    pub vlan: VlanKey,
    pub group: IpmcAddr,
}

impl GroupKey {
    pub fn new(vlan: VlanKey, group: IpmcAddr) -> Self {
        Self {
            vlan,
            group,
        }
    }
}

impl std::fmt::Display for GroupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{} {}", self.vlan, self.group)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PortTimers {
    pub src_timeout: Seconds,
    pub query_timeout: Seconds,
    pub tx_cnt_left: u32,
}

/// Hardware placement of a forwarding entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HwEntry {
    pub location: HwLocation,
    pub ports: PortSet,
}

/// Forwarding state of one source of a group, or of the group's any-source
/// entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceEntry {
    /// ports forwarding the source
    pub include_port_list: PortSet,

    /// ports blocking the source
    pub exclude_port_list: PortSet,

    pub ports: Vec<PortTimers>,
    pub next_src_timeout: Seconds,
    pub next_query_timeout: Seconds,
    pub hw: HwEntry,
    pub changed: bool,
}

impl SourceEntry {
    pub fn new(port_count: usize) -> Self {
        Self {
            include_port_list: PortSet::empty(),
            exclude_port_list: PortSet::empty(),
            ports: vec![PortTimers::default(); port_count],
            next_src_timeout: 0,
            next_query_timeout: 0,
            hw: HwEntry::default(),
            changed: false,
        }
    }

    /// Recomputes `next_src_timeout` from the forwarding ports. Returns
    /// whether it moved.
    pub fn next_src_timeout_update(&mut self) -> bool {
        let mut next = 0;
        for port in self.include_port_list.iter() {
            let Some(timers) = self.ports.get_mut(port) else {
                continue;
            };
            if timers.src_timeout == 0 {
                log::error!("port {}: forwarding source without a source timer", port);
                timers.src_timeout = 1;
            }
            if next == 0 || next > timers.src_timeout {
                next = timers.src_timeout;
            }
        }
        let moved = self.next_src_timeout != next;
        self.next_src_timeout = next;
        moved
    }

    /// Recomputes `next_query_timeout` from the forwarding ports. Returns
    /// whether it moved.
    pub fn next_query_timeout_update(&mut self) -> bool {
        let mut next = 0;
        for port in self.include_port_list.iter() {
            let Some(timers) = self.ports.get(port) else {
                continue;
            };
            if timers.query_timeout != 0 && (next == 0 || next > timers.query_timeout) {
                next = timers.query_timeout;
            }
        }
        let moved = self.next_query_timeout != next;
        self.next_query_timeout = next;
        moved
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SourceMap {
    pub entries: BTreeMap<IpmcAddr, SourceEntry>,
    pub next_src_timeout: Seconds,
    pub next_query_timeout: Seconds,
    pub changed: bool,
}

impl SourceMap {
    pub fn next_src_timeout_update(&mut self) {
        self.next_src_timeout = self.entries.values()
            .map(|entry| entry.next_src_timeout)
            .filter(|timeout| *timeout != 0)
            .min()
            .unwrap_or(0);
    }

    pub fn next_query_timeout_update(&mut self) {
        self.next_query_timeout = self.entries.values()
            .map(|entry| entry.next_query_timeout)
            .filter(|timeout| *timeout != 0)
            .min()
            .unwrap_or(0);
    }

    /// Sources forwarded on `port`.
    pub fn included(&self, port: PortNo) -> crate::pdu::SourceList {
        self.entries.iter()
            .filter(|(_, entry)| entry.include_port_list.contains(port))
            .map(|(addr, _)| *addr)
            .collect()
    }

    /// Sources blocked on `port`.
    pub fn excluded(&self, port: PortNo) -> crate::pdu::SourceList {
        self.entries.iter()
            .filter(|(_, entry)| !entry.include_port_list.contains(port) && entry.exclude_port_list.contains(port))
            .map(|(addr, _)| *addr)
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterMode {
    Include,
    Exclude,
}

/// A group joined on at least one port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupEntry {
    pub active_ports: PortSet,
    pub exclude_mode_ports: PortSet,

    pub grp_compat: Compatibility,
    pub old_present_timer: Seconds,
    pub gen_present_timer: Seconds,

    /// per-port group (filter) timer
    pub grp_timeout: Vec<Seconds>,

    /// any-source entry; `include_port_list` mirrors the EXCLUDE mode ports
    pub asm: SourceEntry,

    pub src_map: SourceMap,
}

impl GroupEntry {
    pub fn new(port_count: usize, grp_compat: Compatibility) -> Self {
        Self {
            active_ports: PortSet::empty(),
            exclude_mode_ports: PortSet::empty(),
            grp_compat,
            old_present_timer: 0,
            gen_present_timer: 0,
            grp_timeout: vec![0; port_count],
            asm: SourceEntry::new(port_count),
            src_map: SourceMap::default(),
        }
    }

    pub fn filter_mode(&self, port: PortNo) -> FilterMode {
        if self.exclude_mode_ports.contains(port) {
            FilterMode::Exclude
        } else {
            FilterMode::Include
        }
    }

    /// Forces every entry of the group to be pushed to hardware again.
    pub fn mark_all_changed(&mut self) {
        self.asm.changed = true;
        for entry in self.src_map.entries.values_mut() {
            entry.changed = true;
        }
        if !self.src_map.entries.is_empty() {
            self.src_map.changed = true;
        }
    }

    pub fn filter_mode_set(&mut self, port: PortNo, mode: FilterMode) {
        match mode {
            FilterMode::Exclude => self.exclude_mode_ports.insert(port),
            FilterMode::Include => {
                self.exclude_mode_ports.remove(port);
                if let Some(timeout) = self.grp_timeout.get_mut(port) {
                    *timeout = 0;
                }
            }
        }
        self.mark_all_changed();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QuerierState {
    #[default]
    Disabled,
    Init,
    Idle,
    Active,
}

impl std::fmt::Display for QuerierState {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let name = match self {
            QuerierState::Disabled => "disabled",
            QuerierState::Init => "init",
            QuerierState::Idle => "idle",
            QuerierState::Active => "active",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VlanStatus {
    pub oper_active: bool,
    pub querier_state: QuerierState,
    pub active_querier_address: IpmcAddr,

    /// seconds we have been the active querier
    pub querier_uptime: u32,

    /// seconds until the next general query
    pub query_interval_left: u32,

    /// seconds until another querier is considered gone
    pub other_querier_expiry: u32,

    pub host_compat: Compatibility,
    pub querier_compat: Compatibility,
    pub older_version_querier_present_timeout_old: Seconds,
    pub older_version_querier_present_timeout_gen: Seconds,
}

impl VlanStatus {
    pub fn new(family: Family) -> Self {
        Self {
            oper_active: false,
            querier_state: QuerierState::Disabled,
            active_querier_address: IpmcAddr::zero(family),
            querier_uptime: 0,
            query_interval_left: 0,
            other_querier_expiry: 0,
            host_compat: Compatibility::Sfm,
            querier_compat: Compatibility::Sfm,
            older_version_querier_present_timeout_old: 0,
            older_version_querier_present_timeout_gen: 0,
        }
    }
}

/// Timer constants snapshotted at querier state transitions, plus the
/// proxy timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VlanInternal {
    pub cur_rv: u32,
    pub cur_qi: u32,
    pub cur_qri: u32,
    pub cur_lmqi: u32,
    pub startup_query_cnt_left: u32,
    pub proxy_query_timeout: u32,
    pub proxy_report_timeout: u32,
}

#[derive(Debug, Clone)]
pub struct VlanState {
    pub key: VlanKey,
    pub conf: VlanConf,
    pub members: PortSet,
    pub status: VlanStatus,
    pub internal: VlanInternal,
    pub statistics: VlanStatistics,
}

impl VlanState {
    pub fn new(key: VlanKey, conf: VlanConf, members: PortSet) -> Self {
        Self {
            key,
            conf,
            members,
            status: VlanStatus::new(key.family),
            internal: VlanInternal::default(),
            statistics: VlanStatistics::default(),
        }
    }

    pub(crate) fn current_from_conf(&mut self) {
        self.internal.cur_rv = self.conf.rv;
        self.internal.cur_qi = self.conf.qi;
        self.internal.cur_qri = self.conf.qri;
        self.internal.cur_lmqi = self.conf.lmqi;
    }

    /// Group membership interval (multicast address listening interval).
    pub fn gmi(&self) -> Seconds {
        let internal = &self.internal;
        (internal.cur_rv * internal.cur_qi + internal.cur_qri / 10) as Seconds
    }

    /// Last member (listener) query time.
    pub fn lmqt(&self) -> Seconds {
        (self.internal.cur_lmqi * self.internal.cur_rv / 10) as Seconds
    }

    /// Older version host/querier present interval.
    pub fn older_version_present_interval(&self) -> Seconds {
        self.gmi()
    }

    /// Other querier present interval.
    pub fn other_querier_present_timeout(&self) -> u32 {
        self.internal.cur_rv * self.conf.qi + self.internal.cur_qri / 20
    }

    /// Last member query interval in whole seconds, never zero.
    pub fn lmqi_seconds(&self) -> Seconds {
        ((self.internal.cur_lmqi / 10) as Seconds).max(1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RouterStatus {
    #[default]
    None,
    Static,
    Dynamic,
    Both,
}

impl RouterStatus {
    fn from_flags(is_static: bool, is_dynamic: bool) -> Self {
        match (is_static, is_dynamic) {
            (false, false) => RouterStatus::None,
            (true, false) => RouterStatus::Static,
            (false, true) => RouterStatus::Dynamic,
            (true, true) => RouterStatus::Both,
        }
    }
}

/// Settings and router ports of one (owner, family).
#[derive(Debug, Clone)]
pub struct GlobalState {
    pub owner: Owner,
    pub family: Family,
    pub conf: GlobalConf,
    pub port_conf: Vec<PortConf>,
    pub static_router_ports: PortSet,
    pub dynamic_router_ports: PortSet,
    pub dynamic_router_timeout: Vec<u32>,
    pub router_status: Vec<RouterStatus>,
    pub query_flooding_cnt: u32,
    pub query_suppression_timeout: u32,

    /// sticky counters of refused groups and sources
    pub grp_cnt_exceeded: u64,
    pub src_cnt_exceeded: u64,
}

impl GlobalState {
    pub fn new(owner: Owner, family: Family, conf: GlobalConf, port_conf: Vec<PortConf>) -> Self {
        let port_count = port_conf.len();
        Self {
            owner,
            family,
            conf,
            port_conf,
            static_router_ports: PortSet::empty(),
            dynamic_router_ports: PortSet::empty(),
            dynamic_router_timeout: vec![0; port_count],
            router_status: vec![RouterStatus::None; port_count],
            query_flooding_cnt: 0,
            query_suppression_timeout: 0,
            grp_cnt_exceeded: 0,
            src_cnt_exceeded: 0,
        }
    }

    pub fn router_ports(&self) -> PortSet {
        self.static_router_ports | self.dynamic_router_ports
    }

    pub fn router_status(&self, port: PortNo) -> RouterStatus {
        self.router_status.get(port).copied().unwrap_or_default()
    }

    pub(crate) fn router_status_refresh(&mut self, port: PortNo) -> RouterStatus {
        let status = RouterStatus::from_flags(self.static_router_ports.contains(port), self.dynamic_router_ports.contains(port));
        if let Some(slot) = self.router_status.get_mut(port) {
            *slot = status;
        }
        status
    }

    pub fn fast_leave(&self, port: PortNo) -> bool {
        self.port_conf.get(port).map(|conf| conf.fast_leave).unwrap_or(false)
    }
}

/// Read-only view of a group, for inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupInfo {
    pub key: GroupKey,
    pub active_ports: PortSet,
    pub exclude_mode_ports: PortSet,
    pub grp_compat: Compatibility,
    pub asm_ports: PortSet,
    pub sources: Vec<SourceInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceInfo {
    pub source: IpmcAddr,
    pub include_port_list: PortSet,
    pub exclude_port_list: PortSet,
    pub hw_location: HwLocation,
}

/// Status of one (owner, family).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalStatus {
    pub router_ports: PortSet,
    pub static_router_ports: PortSet,
    pub dynamic_router_ports: PortSet,
    pub query_flooding_cnt: u32,
    pub grp_cnt_exceeded: u64,
    pub src_cnt_exceeded: u64,
}
