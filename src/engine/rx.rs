//! Received frames: dispatch to VLAN instances, membership processing and
//! the forwarding decision.

use super::querier::{compat_accepts, compat_of};
use super::types::{FilterMode, GroupEntry, GroupKey, QuerierState, VlanKey, DYNAMIC_ROUTER_TIMEOUT};
use super::Engine;

use crate::addr::{Family, IpmcAddr};
use crate::config::{Compatibility, Owner, PortRole};
use crate::pdu::{self, Pdu, PduBody, PduVersion, Query, RecordType, Report, RxAction, SourceList};
use crate::portset::{PortNo, PortSet};

use rand::Rng;

/// Family of an untagged Ethernet frame, judged from its EtherType.
fn frame_family(frame: &[u8]) -> Option<Family> {
    let ethertype = u16::from_be_bytes([*frame.get(12)?, *frame.get(13)?]);
    match ethertype {
        pdu::ETHERTYPE_IPV4 => Some(Family::Ipv4),
        pdu::ETHERTYPE_IPV6 => Some(Family::Ipv6),
        _ => None,
    }
}

impl Engine {
    /// Handles an untagged IGMP or MLD frame received on `port` in VLAN
    /// `vid`, and forwards it where it has to go.
    pub fn rx_frame(&mut self, port: PortNo, vid: u16, frame: &[u8]) {
        if port >= self.port_count {
            return;
        }
        if !self.link_up.contains(port) || !self.stp_forwarding.contains(port) {
            log::debug!("port {}: not forwarding, frame dropped", port);
            return;
        }

        let pdu = match pdu::parse(frame) {
            Ok(pdu) => pdu,
            Err(e) => {
                log::debug!("port {} vid {}: {}", port, vid, e);
                let Some(family) = frame_family(frame) else {
                    return;
                };
                let key = VlanKey::new(Owner::Ipmc, family, vid);
                if let Some(vlan) = self.vlans.get_mut(&key) {
                    vlan.statistics.rx_errors += 1;
                }
                if e.action() == RxAction::Flood {
                    self.flood(&key, frame, port);
                }
                return;
            }
        };

        let family = pdu.family();
        let mut handled = false;

        for key in self.vlan_keys_of(Owner::Mvr, family) {
            let Some(vlan) = self.vlans.get(&key) else {
                continue;
            };
            if !vlan.status.oper_active || !vlan.members.contains(port) {
                continue;
            }
            let role = vlan.conf.port_role(port);
            if role == PortRole::None || (role == PortRole::Source && key.vid != vid) {
                continue;
            }

            match &pdu.body {
                PduBody::Report(report) => {
                    if vlan.conf.compatible_mode && role == PortRole::Source {
                        log::debug!("{}: report on source port {} ignored", key, port);
                        self.count_rx(&key, &pdu, true);
                        continue;
                    }
                    let profile = vlan.conf.channel_profile.clone();
                    let zero = IpmcAddr::zero(family);
                    let ours = report.records.iter()
                        .any(|record| self.permit(&key, &profile, &record.group, &zero, port, false));
                    if !ours {
                        continue;
                    }
                }
                PduBody::Query(_) => {
                    if role != PortRole::Source {
                        log::debug!("{}: query on receiver port {} ignored", key, port);
                        self.count_rx(&key, &pdu, true);
                        continue;
                    }
                }
            }

            let dst = self.process_pdu(&key, port, &pdu);
            self.forward_frame(&key, frame, dst, port);
            handled = true;
        }

        if handled {
            return;
        }

        let key = VlanKey::new(Owner::Ipmc, family, vid);
        let state = self.vlans.get(&key).map(|vlan| (vlan.status.oper_active, vlan.members.contains(port)));
        match state {
            Some((true, true)) => {
                let dst = self.process_pdu(&key, port, &pdu);
                self.forward_frame(&key, frame, dst, port);
            }
            Some((true, false)) => {
                log::debug!("{}: port {} is not a member, frame dropped", key, port);
            }
            _ => self.flood(&key, frame, port),
        }
    }

    fn flood(&mut self, key: &VlanKey, frame: &[u8], port: PortNo) {
        let all = PortSet::all(self.port_count);
        self.forward_frame(key, frame, all, port);
    }

    fn count_rx(&mut self, key: &VlanKey, pdu: &Pdu, ignored: bool) {
        let Some(vlan) = self.vlans.get_mut(key) else {
            return;
        };
        let counters = if ignored { &mut vlan.statistics.rx_ignored } else { &mut vlan.statistics.rx_utilized };
        match &pdu.body {
            PduBody::Query(query) => {
                counters.count_query(query.version, !query.is_general(), !query.sources.is_empty());
            }
            PduBody::Report(report) => counters.count_report(report.version, report.is_leave),
        }
    }

    /// Processes a decoded PDU received on `port` of VLAN `key`. Returns the
    /// ports the frame should be forwarded to.
    pub fn process_pdu(&mut self, key: &VlanKey, port: PortNo, pdu: &Pdu) -> PortSet {
        if !self.vlans.contains_key(key) || pdu.family() != key.family {
            return PortSet::empty();
        }
        match &pdu.body {
            PduBody::Query(query) => {
                let dst = self.query_forward_ports(key, query);
                let ignored = !self.rx_query(key, port, &pdu.sip, query);
                self.count_rx(key, pdu, ignored);
                dst
            }
            PduBody::Report(report) => {
                let (known, ignored) = self.rx_report(key, port, report);
                self.count_rx(key, pdu, ignored);
                self.report_forward_ports(key, report.is_leave, !known)
            }
        }
    }

    fn query_forward_ports(&self, key: &VlanKey, query: &Query) -> PortSet {
        let Some(global) = self.global(key) else {
            return PortSet::empty();
        };
        if global.query_flooding_cnt >= self.vlan_cnt_max {
            log::debug!("{}: query flooding suppressed", key);
            return PortSet::empty();
        }
        if global.conf.proxy {
            return global.router_ports();
        }
        if query.is_general() {
            return match key.owner {
                Owner::Ipmc => PortSet::all(self.port_count),
                Owner::Mvr => (0..self.port_count)
                    .filter(|port| self.port_role(key, *port) != PortRole::None)
                    .collect(),
            };
        }
        self.groups.get(&GroupKey::new(*key, query.group))
            .map(|grp| grp.active_ports)
            .unwrap_or_default()
    }

    fn report_forward_ports(&self, key: &VlanKey, is_leave: bool, leave_without_group: bool) -> PortSet {
        let Some(global) = self.global(key) else {
            return PortSet::empty();
        };
        let forward = if is_leave {
            leave_without_group || !(global.conf.proxy || global.conf.leave_proxy)
        } else {
            !global.conf.proxy
        };
        if !forward {
            return PortSet::empty();
        }
        match key.owner {
            Owner::Ipmc => global.router_ports(),
            Owner::Mvr => (0..self.port_count)
                .filter(|port| self.port_role(key, *port) == PortRole::Source)
                .collect(),
        }
    }

    /// Handles a query from another querier. Returns false when the query
    /// was ignored.
    fn rx_query(&mut self, key: &VlanKey, port: PortNo, sip: &IpmcAddr, query: &Query) -> bool {
        let Some(vlan) = self.vlans.get(key) else {
            return false;
        };
        if !compat_accepts(vlan.conf.compatibility, query.version) {
            log::debug!("{}: {} query ignored in {:?} compatibility", key, query.version, vlan.conf.compatibility);
            return false;
        }

        if !sip.is_zero() {
            self.router_status_update(key.owner, key.family, Some(port), true, true);
            if let Some(timeout) = self.global_mut(key).and_then(|global| global.dynamic_router_timeout.get_mut(port)) {
                *timeout = DYNAMIC_ROUTER_TIMEOUT;
            }
        }

        self.update_from_pdu(key, sip);

        if let Some(global) = self.global_mut(key) {
            global.query_flooding_cnt = global.query_flooding_cnt.saturating_add(1);
        }

        let proxy = self.is_proxy(key);
        if query.is_general() {
            if proxy {
                self.proxy_report_schedule(key, query);
            }
        } else {
            self.rx_specific_query(key, query, proxy);
        }

        self.querier_compat_from_query(key, query.version);
        true
    }

    /// Picks a random delay within the query's response time for the proxy
    /// reports, unless an earlier one is pending.
    fn proxy_report_schedule(&mut self, key: &VlanKey, query: &Query) {
        let Some(vlan) = self.vlans.get_mut(key) else {
            return;
        };
        let mut max = query.max_resp_time_ms / 1000;
        if max == 0 {
            max = if query.version == PduVersion::IgmpV1 { 1 } else { vlan.internal.cur_qri / 10 };
        }
        let max = max.max(1);
        let timeout = rand::thread_rng().gen_range(0..max).max(1);

        let internal = &mut vlan.internal;
        if internal.proxy_report_timeout == 0 || timeout < internal.proxy_report_timeout {
            log::debug!("{}: proxy reports in {} s", key, timeout);
            internal.proxy_report_timeout = timeout;
        }
    }

    /// A group-specific or group-and-source-specific query makes a
    /// non-querier lower its timers to what the querier will use.
    fn rx_specific_query(&mut self, key: &VlanKey, query: &Query, proxy: bool) {
        let grp_key = GroupKey::new(*key, query.group);
        if !self.groups.contains_key(&grp_key) {
            return;
        }
        let now = self.now;

        let mut lmqt = None;
        if let Some(vlan) = self.vlans.get_mut(key) {
            if vlan.status.querier_state == QuerierState::Idle && !query.s_flag {
                let internal = &mut vlan.internal;
                internal.cur_qri = query.max_resp_time_ms / 100;
                if query.qrv != 0 {
                    internal.cur_rv = query.qrv as u32;
                }
                if query.qqi != 0 {
                    internal.cur_qi = query.qqi;
                }
                internal.cur_lmqi = query.max_resp_time_ms / 100;
                lmqt = Some(vlan.lmqt() + now);
            }
        }

        if let Some(lmqt) = lmqt {
            if let Some(grp) = self.groups.get_mut(&grp_key) {
                Self::lower_timers_from_query(grp, &query.sources, lmqt);
            }
        }

        if proxy {
            self.proxy_queue.insert(grp_key);
        }
    }

    /// Ports may join at most their configured number of groups.
    fn port_group_limit_reached(&self, key: &VlanKey, port: PortNo) -> bool {
        let max = self.global(key)
            .and_then(|global| global.port_conf.get(port))
            .map(|conf| conf.grp_cnt_max)
            .unwrap_or(0) as usize;
        if max == 0 {
            return false;
        }
        let joined = self.groups.iter()
            .filter(|(grp_key, grp)| {
                grp_key.vlan.owner == key.owner && grp_key.vlan.family == key.family && grp.active_ports.contains(port)
            })
            .count();
        joined >= max
    }

    /// Applies the records of a membership report. Returns whether a leave
    /// named a known group, and whether the report as a whole was ignored.
    fn rx_report(&mut self, key: &VlanKey, port: PortNo, report: &Report) -> (bool, bool) {
        let Some(vlan) = self.vlans.get(key) else {
            return (true, true);
        };
        let conf_compat = vlan.conf.compatibility;
        let auto = conf_compat == Compatibility::Auto;
        let interval = vlan.older_version_present_interval() + self.now;
        let channel_profile = vlan.conf.channel_profile.clone();
        let Some(global) = self.global(key) else {
            return (true, true);
        };
        let proxy = global.conf.proxy;
        let ssm_prefix = global.conf.ssm_prefix(key.family);
        let profile = match key.owner {
            Owner::Ipmc => global.port_conf.get(port).map(|conf| conf.profile.clone()).unwrap_or_default(),
            Owner::Mvr => channel_profile,
        };

        if key.owner == Owner::Ipmc && !report.version.is_source_specific() {
            if let Some(record) = report.records.first() {
                if ssm_prefix.contains(&record.group) {
                    log::debug!("{}: {} report for SSM group {} ignored", key, report.version, record.group);
                    return (true, true);
                }
            }
        }

        if !compat_accepts(conf_compat, report.version) {
            log::debug!("{}: {} report ignored in {:?} compatibility", key, report.version, conf_compat);
            return (true, true);
        }

        let new_compat = compat_of(report.version);
        let zero = IpmcAddr::zero(key.family);
        let mut processed_any = false;

        for record in &report.records {
            if !self.permit(key, &profile, &record.group, &zero, port, true) {
                log::debug!("{}: port {} group {} denied by profile", key, port, record.group);
                continue;
            }

            let grp_key = GroupKey::new(*key, record.group);
            let empty_include = matches!(record.record_type, RecordType::IsIn | RecordType::ToIn) && record.sources.is_empty();
            let existing = self.groups.remove(&grp_key);
            let is_new = existing.is_none();
            let init_port = existing.as_ref().map(|grp| !grp.active_ports.contains(port)).unwrap_or(true);

            if init_port {
                if empty_include {
                    if let Some(grp) = existing {
                        self.groups.insert(grp_key, grp);
                    }
                    if report.is_leave {
                        log::debug!("{}: leave from port {} that never joined", grp_key, port);
                        return (false, true);
                    }
                    continue;
                }

                if is_new && self.groups.len() >= self.grp_cnt_max {
                    log::debug!("{}: group table full", grp_key);
                    if let Some(global) = self.global_mut(key) {
                        global.grp_cnt_exceeded += 1;
                    }
                    return (true, false);
                }

                if self.port_group_limit_reached(key, port) {
                    log::debug!("{}: port {} reached its group limit", grp_key, port);
                    if let Some(grp) = existing {
                        self.groups.insert(grp_key, grp);
                    }
                    return (true, !processed_any);
                }
            }

            let mut grp = match existing {
                Some(grp) => grp,
                None => {
                    log::info!("{}: created on port {}", grp_key, port);
                    GroupEntry::new(self.port_count, if auto { new_compat } else { conf_compat })
                }
            };
            let old_grp_compat = grp.grp_compat;

            if init_port {
                if let Some(timers) = grp.asm.ports.get_mut(port) {
                    *timers = Default::default();
                }
                grp.filter_mode_set(port, FilterMode::Include);
            }

            processed_any = true;
            if !grp.active_ports.contains(port) {
                grp.active_ports.insert(port);
                grp.asm.changed = true;
            }

            let none = SourceList::new();
            let mut sources = &record.sources;
            let mut skip = false;
            if auto {
                match new_compat {
                    Compatibility::Old => {
                        grp.grp_compat = Compatibility::Old;
                        grp.old_present_timer = interval;
                    }
                    Compatibility::Gen => {
                        if grp.grp_compat != Compatibility::Old {
                            grp.grp_compat = Compatibility::Gen;
                        }
                        grp.gen_present_timer = interval;
                    }
                    _ => {}
                }

                // RFC 3376 section 7.3.2, RFC 3810 section 8.3.2
                match grp.grp_compat {
                    Compatibility::Old => {
                        skip = record.record_type == RecordType::Block
                            || (report.version == PduVersion::IgmpV3 && record.record_type == RecordType::ToIn)
                            || report.is_leave;
                        if record.record_type == RecordType::ToEx {
                            sources = &none;
                        }
                    }
                    Compatibility::Gen => {
                        skip = record.record_type == RecordType::Block;
                        if record.record_type == RecordType::ToEx {
                            sources = &none;
                        }
                    }
                    _ => {}
                }
            }

            if skip {
                log::debug!("{}: {} ignored in {:?} compatibility", grp_key, record.record_type.name(), grp.grp_compat);
                self.hw_update(&grp_key, &mut grp);
            } else {
                self.process_src(&grp_key, &mut grp, port, record.record_type, sources, report.is_leave);
            }

            if grp.active_ports.is_empty() {
                self.group_erase(&grp_key, grp);
                continue;
            }

            if is_new && !report.is_leave && proxy {
                self.proxy_queue.insert(grp_key);
            }
            let compat_changed = is_new || grp.grp_compat != old_grp_compat;
            self.groups.insert(grp_key, grp);
            if compat_changed {
                self.host_compat_update(key);
            }
        }

        (true, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn family_from_ethertype() {
        let mut frame = vec![0u8; 14];
        frame[12] = 0x08;
        assert_eq!(frame_family(&frame), Some(Family::Ipv4));
        frame[12] = 0x86;
        frame[13] = 0xdd;
        assert_eq!(frame_family(&frame), Some(Family::Ipv6));
        assert_eq!(frame_family(&frame[..10]), None);
    }
}
