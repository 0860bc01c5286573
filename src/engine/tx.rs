//! Frames the engine originates or forwards.

use super::types::VlanKey;
use super::Engine;

use crate::addr::{Family, IpmcAddr};
use crate::config::{Compatibility, Owner};
use crate::pdu::{self, GroupRecord, PduVersion, Query, RecordType, Report, SourceList};
use crate::portset::{PortNo, PortSet};
use crate::transmit::Tagging;

/// Protocol version spoken towards hosts or routers in compatibility `compat`.
pub(super) fn pdu_version(family: Family, compat: Compatibility) -> PduVersion {
    match (family, compat) {
        (Family::Ipv4, Compatibility::Old) => PduVersion::IgmpV1,
        (Family::Ipv4, Compatibility::Gen) => PduVersion::IgmpV2,
        (Family::Ipv4, _) => PduVersion::IgmpV3,
        (Family::Ipv6, Compatibility::Old | Compatibility::Gen) => PduVersion::MldV1,
        (Family::Ipv6, _) => PduVersion::MldV2,
    }
}

impl Engine {
    fn tagging(&self, key: &VlanKey) -> Tagging {
        let Some(vlan) = self.vlans.get(key) else {
            return Tagging::default();
        };
        Tagging {
            pcp: vlan.conf.pcp,
            force_untag: key.owner == Owner::Mvr && !vlan.conf.tx_tagged,
        }
    }

    /// Narrows `dst` to the ports a frame may actually leave on: up,
    /// forwarding, members of the VLAN and not `src_port`. Aggregations are
    /// expanded first and then represented by their lowest usable member.
    pub(super) fn tx_ports(&self, key: &VlanKey, dst: PortSet, src_port: Option<PortNo>) -> PortSet {
        let members = self.vlans.get(key)
            .map(|vlan| vlan.members)
            .unwrap_or_else(|| PortSet::all(self.port_count));
        let src_aggr = src_port.and_then(|port| self.aggr.get(port).copied()).unwrap_or_default();

        let mut expanded = PortSet::empty();
        for port in dst.iter() {
            let partners = self.aggr.get(port).copied().unwrap_or_else(|| PortSet::single(port));
            if (partners & src_aggr).is_empty() {
                expanded |= partners;
            }
        }

        let usable = expanded & self.link_up & self.stp_forwarding & members;
        let mut ports = PortSet::empty();
        let mut covered = PortSet::empty();
        for port in usable.iter() {
            if Some(port) == src_port || covered.contains(port) {
                continue;
            }
            ports.insert(port);
            covered |= self.aggr.get(port).copied().unwrap_or_else(|| PortSet::single(port));
        }
        ports
    }

    fn transmit(&mut self, key: &VlanKey, frame: &[u8], dst: PortSet, src_port: Option<PortNo>) -> bool {
        let ports = self.tx_ports(key, dst, src_port);
        if ports.is_empty() {
            return false;
        }
        let tagging = self.tagging(key);
        match self.tx.transmit(frame, ports, key.vid, tagging) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("{}: transmit to {} failed: {}", key, ports, e);
                false
            }
        }
    }

    /// Re-sends a received frame to `dst`, never back to `src_port`.
    pub(super) fn forward_frame(&mut self, key: &VlanKey, frame: &[u8], dst: PortSet, src_port: PortNo) {
        if dst.is_empty() {
            return;
        }
        log::debug!("{}: forwarding frame from port {} to {}", key, src_port, dst);
        self.transmit(key, frame, dst, Some(src_port));
    }

    /// Sends a query to `dst`. A zero `group` makes it a general query.
    pub(super) fn tx_query(
        &mut self,
        key: &VlanKey,
        dst: PortSet,
        group: &IpmcAddr,
        sources: &SourceList,
        s_flag: bool,
        compat: Compatibility,
    ) {
        if dst.is_empty() {
            return;
        }
        let Some(vlan) = self.vlans.get(key) else {
            return;
        };

        let version = pdu_version(key.family, compat);
        let general = group.is_zero() || version == PduVersion::IgmpV1;
        let internal = vlan.internal;
        let (max_resp_time_ms, qqi) = if general {
            (internal.cur_qri * 100, internal.cur_qi)
        } else {
            (internal.cur_lmqi * 100, internal.cur_lmqi / 10)
        };

        let query = Query {
            version,
            max_resp_time_ms,
            group: if general { IpmcAddr::zero(key.family) } else { *group },
            s_flag: s_flag && !general,
            qrv: internal.cur_rv.min(u8::MAX as u32) as u8,
            qqi,
            sources: if general || !version.is_source_specific() { SourceList::new() } else { sources.clone() },
        };

        let sip = self.our_ip(key);
        let frame = match pdu::build_query(&self.smac, &sip, &query) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("{}: cannot build {} query: {}", key, version, e);
                return;
            }
        };

        log::debug!("{}: {} query for {} ({} sources) to {}", key, version, query.group, query.sources.len(), dst);
        if self.transmit(key, &frame, dst, None) {
            let with_sources = !query.sources.is_empty();
            if let Some(vlan) = self.vlans.get_mut(key) {
                vlan.statistics.tx.count_query(version, !general, with_sources);
            }
        }
    }

    /// Sends a general query to every port of the VLAN, in the version the
    /// hosts understand.
    pub(super) fn tx_general_query(&mut self, key: &VlanKey, dst: PortSet) {
        let Some(compat) = self.vlans.get(key).map(|vlan| vlan.status.host_compat) else {
            return;
        };
        let zero = IpmcAddr::zero(key.family);
        self.tx_query(key, dst, &zero, &SourceList::new(), false, compat);
    }

    fn tx_report_pdu(&mut self, key: &VlanKey, report: Report) {
        let dst = self.router_ports(key);
        if dst.is_empty() {
            return;
        }

        let sip = self.our_ip(key);
        let frame = match pdu::build_report(&self.smac, &sip, &report) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("{}: cannot build {} report: {}", key, report.version, e);
                return;
            }
        };

        if self.transmit(key, &frame, dst, None) {
            if let Some(vlan) = self.vlans.get_mut(key) {
                vlan.statistics.tx.count_report(report.version, report.is_leave);
            }
        }
    }

    /// Reports membership of `group` towards the router ports.
    pub(super) fn tx_report(&mut self, key: &VlanKey, group: &IpmcAddr, compat: Compatibility) {
        if group.is_zero() {
            return;
        }
        let version = pdu_version(key.family, compat);
        log::debug!("{}: proxy {} report for {}", key, version, group);
        self.tx_report_pdu(key, Report {
            version,
            is_leave: false,
            records: vec![GroupRecord {
                record_type: RecordType::IsEx,
                group: *group,
                sources: SourceList::new(),
            }],
            skipped_records: 0,
        });
    }

    /// Tells the routers that the last listener of `group` left.
    pub(super) fn tx_leave(&mut self, key: &VlanKey, group: &IpmcAddr) {
        let Some(compat) = self.vlans.get(key).map(|vlan| vlan.status.querier_compat) else {
            return;
        };
        let version = pdu_version(key.family, compat);
        if version == PduVersion::IgmpV1 {
            return;
        }
        log::debug!("{}: proxy {} leave for {}", key, version, group);
        self.tx_report_pdu(key, Report {
            version,
            is_leave: !version.is_source_specific(),
            records: vec![GroupRecord {
                record_type: RecordType::ToIn,
                group: *group,
                sources: SourceList::new(),
            }],
            skipped_records: 0,
        });
    }
}
