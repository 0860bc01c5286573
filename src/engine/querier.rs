//! Querier election (RFC 3376 section 6.6, RFC 3810 section 7.6), the
//! older version compatibility timers and the proxy timers.

use super::types::{QuerierState, VlanInternal, VlanKey, VlanStatus};
use super::{Engine, RouterStatus};

use crate::addr::{Family, IpmcAddr};
use crate::config::Compatibility;
use crate::pdu::PduVersion;
use crate::portset::{PortNo, PortSet};

/// Whether a VLAN in compatibility `compat` accepts PDUs of `version`.
pub(super) fn compat_accepts(compat: Compatibility, version: PduVersion) -> bool {
    match compat {
        Compatibility::Auto => true,
        Compatibility::Old => version == PduVersion::IgmpV1,
        Compatibility::Gen => matches!(version, PduVersion::IgmpV2 | PduVersion::MldV1),
        Compatibility::Sfm => version.is_source_specific(),
    }
}

/// Compatibility a PDU of `version` puts its sender in.
pub(super) fn compat_of(version: PduVersion) -> Compatibility {
    match version {
        PduVersion::IgmpV1 => Compatibility::Old,
        PduVersion::IgmpV2 | PduVersion::MldV1 => Compatibility::Gen,
        PduVersion::IgmpV3 | PduVersion::MldV2 => Compatibility::Sfm,
    }
}

impl Engine {
    /// Resets the run-time state of a VLAN.
    pub(super) fn vlan_state_init(&mut self, key: &VlanKey, clear_statistics: bool) {
        let Some(vlan) = self.vlans.get_mut(key) else {
            return;
        };
        let oper_active = vlan.status.oper_active;
        vlan.status = VlanStatus::new(key.family);
        vlan.status.oper_active = oper_active;
        vlan.internal = VlanInternal::default();
        if clear_statistics {
            vlan.statistics = Default::default();
        }
        vlan.status.querier_compat = match vlan.conf.compatibility {
            Compatibility::Auto => Compatibility::Sfm,
            compat => compat,
        };

        self.host_compat_update(key);
        self.querier_state_update(key);
    }

    /// Drives the querier state machine after a configuration or address
    /// change.
    pub(super) fn querier_state_update(&mut self, key: &VlanKey) {
        let our_ip = self.our_ip(key);
        let Some(vlan) = self.vlans.get_mut(key) else {
            return;
        };
        let old_state = vlan.status.querier_state;
        if !vlan.status.oper_active {
            vlan.status.querier_state = QuerierState::Disabled;
        }

        match vlan.status.querier_state {
            QuerierState::Disabled => {
                vlan.internal.proxy_query_timeout = 0;
                vlan.current_from_conf();
                vlan.status.active_querier_address = IpmcAddr::zero(key.family);
                vlan.status.querier_uptime = 0;

                if !vlan.status.oper_active {
                    // stays disabled until the VLAN comes up
                } else if vlan.conf.querier_enable {
                    vlan.status.active_querier_address = our_ip;
                    vlan.status.querier_state = QuerierState::Init;
                    vlan.status.query_interval_left = 0;
                    vlan.status.other_querier_expiry = 0;
                    vlan.internal.startup_query_cnt_left = vlan.conf.rv;
                } else {
                    vlan.status.querier_state = QuerierState::Idle;
                    vlan.status.query_interval_left = vlan.conf.qi;
                    vlan.status.other_querier_expiry = vlan.other_querier_present_timeout();
                    vlan.internal.startup_query_cnt_left = 0;
                }
            }
            QuerierState::Init => {
                vlan.current_from_conf();
                vlan.internal.startup_query_cnt_left = vlan.internal.startup_query_cnt_left.min(vlan.conf.rv);
                vlan.status.query_interval_left = vlan.status.query_interval_left.min(vlan.conf.qi / 4);
            }
            QuerierState::Idle => {
                if vlan.status.other_querier_expiry != 0 {
                    let expiry = vlan.other_querier_present_timeout();
                    vlan.status.other_querier_expiry = vlan.status.other_querier_expiry.min(expiry);
                }

                // A newly configured, lower querier address wins the
                // election at once.
                let configured_lower = match (vlan.conf.querier_address, vlan.status.active_querier_address) {
                    (Some(configured), IpmcAddr::V4(active)) => {
                        !configured.is_unspecified() && !active.is_unspecified() && configured < active
                    }
                    _ => false,
                };
                if key.family == Family::Ipv4 && vlan.conf.querier_enable && configured_lower {
                    vlan.current_from_conf();
                    vlan.internal.startup_query_cnt_left = vlan.conf.rv;
                    vlan.status.active_querier_address = our_ip;
                    vlan.status.querier_state = QuerierState::Init;
                    vlan.status.query_interval_left = 0;
                    vlan.status.other_querier_expiry = 0;
                }
            }
            QuerierState::Active => {
                vlan.status.active_querier_address = our_ip;
                vlan.current_from_conf();
                vlan.status.query_interval_left = vlan.status.query_interval_left.min(vlan.conf.qi);
            }
        }

        if vlan.status.querier_state != old_state {
            log::info!("{}: querier {} -> {}", key, old_state, vlan.status.querier_state);
        }
    }

    /// Runs the election against the source address of a received query.
    pub(super) fn update_from_pdu(&mut self, key: &VlanKey, sip: &IpmcAddr) {
        if sip.is_zero() {
            return;
        }
        let our_ip = self.our_ip(key);
        let Some(vlan) = self.vlans.get_mut(key) else {
            return;
        };

        if *sip < our_ip {
            if vlan.status.querier_state != QuerierState::Idle {
                log::info!("{}: querier {} -> {}, {} is lower", key, vlan.status.querier_state, QuerierState::Idle, sip);
            }
            vlan.status.querier_state = QuerierState::Idle;
            vlan.status.active_querier_address = *sip;
            vlan.internal.startup_query_cnt_left = 0;
            vlan.status.other_querier_expiry = vlan.other_querier_present_timeout();
        } else if !vlan.conf.querier_enable {
            let active = vlan.status.active_querier_address;
            if active.is_zero() || *sip < active {
                vlan.status.active_querier_address = *sip;
            }
        }
    }

    /// Sends general queries while we are the querier.
    pub(super) fn general_query_tx_tick(&mut self, key: &VlanKey) {
        let our_ip = self.our_ip(key);
        let proxy = self.is_proxy(key);
        let Some(vlan) = self.vlans.get_mut(key) else {
            return;
        };
        let old_state = vlan.status.querier_state;
        let status = &mut vlan.status;
        let internal = &mut vlan.internal;

        if !vlan.conf.querier_enable {
            status.querier_state = QuerierState::Idle;
            if status.other_querier_expiry == 0 {
                status.other_querier_expiry = internal.cur_rv * vlan.conf.qi + internal.cur_qri / 20;
            }
            if old_state != QuerierState::Idle {
                log::info!("{}: querier {} -> {}", key, old_state, QuerierState::Idle);
            }
            return;
        }

        let mut tx = false;
        match status.querier_state {
            QuerierState::Init => {
                if status.query_interval_left == 0 {
                    tx = !proxy;
                    status.query_interval_left = vlan.conf.qi / 4;
                    internal.startup_query_cnt_left = internal.startup_query_cnt_left.saturating_sub(1);
                } else {
                    status.query_interval_left -= 1;
                }

                if internal.startup_query_cnt_left == 0 {
                    internal.cur_rv = vlan.conf.rv;
                    internal.cur_qi = vlan.conf.qi;
                    internal.cur_qri = vlan.conf.qri;
                    internal.cur_lmqi = vlan.conf.lmqi;
                    status.querier_uptime = 0;
                    status.querier_state = QuerierState::Active;
                    status.active_querier_address = our_ip;
                }
            }
            QuerierState::Active => {
                status.querier_uptime += 1;
                status.active_querier_address = our_ip;
                status.query_interval_left = status.query_interval_left.saturating_sub(1);
                if status.query_interval_left == 0 {
                    tx = !proxy;
                    status.query_interval_left = vlan.conf.qi;
                }
            }
            QuerierState::Idle => {
                status.querier_uptime = 0;
                if status.other_querier_expiry != 0 {
                    status.other_querier_expiry -= 1;
                } else {
                    internal.cur_rv = vlan.conf.rv;
                    internal.cur_qi = vlan.conf.qi;
                    internal.cur_qri = vlan.conf.qri;
                    internal.cur_lmqi = vlan.conf.lmqi;
                    status.query_interval_left = vlan.conf.qi;
                    status.querier_state = QuerierState::Active;
                    status.active_querier_address = our_ip;
                    tx = !proxy;
                }
            }
            QuerierState::Disabled => {}
        }

        if status.querier_state != old_state {
            log::info!("{}: querier {} -> {}", key, old_state, status.querier_state);
        }

        if tx {
            let members = vlan.members;
            self.tx_general_query(key, members);
        }
    }

    /// Ages the older version querier present timers of a VLAN in
    /// automatic compatibility.
    pub(super) fn older_version_querier_tick(&mut self, key: &VlanKey) {
        let now = self.now;
        let Some(vlan) = self.vlans.get_mut(key) else {
            return;
        };
        let status = &mut vlan.status;

        if vlan.conf.compatibility != Compatibility::Auto {
            status.older_version_querier_present_timeout_old = 0;
            status.older_version_querier_present_timeout_gen = 0;
            return;
        }

        let old_compat = status.querier_compat;
        if status.querier_compat == Compatibility::Old && status.older_version_querier_present_timeout_old <= now {
            status.querier_compat = if status.older_version_querier_present_timeout_gen != 0 {
                Compatibility::Gen
            } else {
                Compatibility::Sfm
            };
            status.older_version_querier_present_timeout_old = 0;
        }
        if status.querier_compat == Compatibility::Gen && status.older_version_querier_present_timeout_gen <= now {
            status.querier_compat = Compatibility::Sfm;
            status.older_version_querier_present_timeout_gen = 0;
        }

        if status.querier_compat != old_compat {
            log::info!("{}: querier compatibility {:?} -> {:?}", key, old_compat, status.querier_compat);
        }
    }

    /// Records the version of a query from another querier.
    pub(super) fn querier_compat_from_query(&mut self, key: &VlanKey, version: PduVersion) {
        let now = self.now;
        let Some(vlan) = self.vlans.get_mut(key) else {
            return;
        };
        if vlan.conf.compatibility != Compatibility::Auto {
            return;
        }
        let interval = vlan.older_version_present_interval() + now;
        let status = &mut vlan.status;
        let old_compat = status.querier_compat;

        match compat_of(version) {
            Compatibility::Old => {
                status.querier_compat = Compatibility::Old;
                status.older_version_querier_present_timeout_old = interval;
            }
            Compatibility::Gen => {
                if status.querier_compat != Compatibility::Old {
                    status.querier_compat = Compatibility::Gen;
                }
                status.older_version_querier_present_timeout_gen = interval;
            }
            _ => {}
        }

        if status.querier_compat != old_compat {
            log::info!("{}: querier compatibility {:?} -> {:?}", key, old_compat, status.querier_compat);
        }
    }

    /// Sends our general queries towards hosts and the periodic membership
    /// reports towards routers while in proxy mode.
    pub(super) fn proxy_tick(&mut self, key: &VlanKey) {
        let proxy = self.is_proxy(key);
        let Some(vlan) = self.vlans.get_mut(key) else {
            return;
        };
        let internal = &mut vlan.internal;

        if !proxy {
            internal.proxy_query_timeout = 0;
            internal.proxy_report_timeout = 0;
            return;
        }

        let mut tx_query = false;
        if internal.proxy_query_timeout != 0 {
            internal.proxy_query_timeout -= 1;
        }
        if internal.proxy_query_timeout == 0 {
            tx_query = true;
            internal.proxy_query_timeout = vlan.conf.qi;
        }

        let mut tx_reports = false;
        if internal.proxy_report_timeout != 0 {
            internal.proxy_report_timeout -= 1;
            tx_reports = internal.proxy_report_timeout == 0;
        }

        let members = vlan.members;
        let compat = vlan.status.querier_compat;

        if tx_query {
            self.tx_general_query(key, members);
        }

        if tx_reports {
            for grp_key in self.group_keys_of(key) {
                self.tx_report(key, &grp_key.group, compat);
            }
        }
    }

    /// Answers a port that started forwarding with a general query, so that
    /// its hosts report at once.
    pub(super) fn vlan_stp_forwarding(&mut self, key: &VlanKey, port: PortNo) {
        if !self.is_proxy(key) {
            return;
        }
        let router = self.global(key).map(|global| global.router_status(port)).unwrap_or_default();
        if router != RouterStatus::None {
            return;
        }
        let querying = self.vlans.get(key)
            .map(|vlan| matches!(vlan.status.querier_state, QuerierState::Active | QuerierState::Idle))
            .unwrap_or(false);
        if querying {
            log::debug!("{}: port {} forwarding, sending general query", key, port);
            self.tx_general_query(key, PortSet::single(port));
        }
    }

    /// Recomputes the version hosts are addressed in: the oldest version
    /// of any group in the VLAN.
    pub(super) fn host_compat_update(&mut self, key: &VlanKey) {
        let Some(vlan) = self.vlans.get(key) else {
            return;
        };
        let host_compat = match vlan.conf.compatibility {
            Compatibility::Auto => self.groups.iter()
                .filter(|(grp_key, _)| grp_key.vlan == *key)
                .map(|(_, grp)| grp.grp_compat)
                .fold(Compatibility::Sfm, |lowest, compat| if compat.rank() < lowest.rank() { compat } else { lowest }),
            compat => compat,
        };

        if let Some(vlan) = self.vlans.get_mut(key) {
            if vlan.status.host_compat != host_compat {
                log::info!("{}: host compatibility {:?} -> {:?}", key, vlan.status.host_compat, host_compat);
                vlan.status.host_compat = host_compat;
            }
        }
    }

    /// Applies a change of the configured compatibility. Groups holding
    /// source state cannot be expressed in IGMPv1/v2 or MLDv1 and are
    /// removed when moving to one of those.
    pub(super) fn compatibility_status_update(&mut self, key: &VlanKey, old_compat: Compatibility) {
        let now = self.now;
        let Some(vlan) = self.vlans.get_mut(key) else {
            return;
        };
        let new_compat = vlan.conf.compatibility;
        vlan.status.querier_compat = match new_compat {
            Compatibility::Auto => Compatibility::Sfm,
            compat => compat,
        };
        vlan.status.older_version_querier_present_timeout_old = 0;
        vlan.status.older_version_querier_present_timeout_gen = 0;
        let interval = vlan.older_version_present_interval() + now;

        let remove_sources = matches!(old_compat, Compatibility::Auto | Compatibility::Sfm)
            && matches!(new_compat, Compatibility::Old | Compatibility::Gen);

        for grp_key in self.group_keys_of(key) {
            let Some(mut grp) = self.groups.remove(&grp_key) else {
                continue;
            };

            if remove_sources && !grp.src_map.entries.is_empty() {
                log::info!("{}: has sources, removed on compatibility change", grp_key);
                self.group_erase(&grp_key, grp);
                continue;
            }

            if new_compat == Compatibility::Auto {
                match old_compat {
                    Compatibility::Old => grp.old_present_timer = interval,
                    Compatibility::Gen => grp.gen_present_timer = interval,
                    _ => {}
                }
            } else {
                grp.old_present_timer = 0;
                grp.gen_present_timer = 0;
                grp.grp_compat = new_compat;
            }
            self.groups.insert(grp_key, grp);
        }

        self.host_compat_update(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_compatibility_accepts_one_version() {
        assert!(compat_accepts(Compatibility::Auto, PduVersion::IgmpV1));
        assert!(compat_accepts(Compatibility::Old, PduVersion::IgmpV1));
        assert!(!compat_accepts(Compatibility::Old, PduVersion::IgmpV2));
        assert!(compat_accepts(Compatibility::Gen, PduVersion::MldV1));
        assert!(!compat_accepts(Compatibility::Gen, PduVersion::IgmpV3));
        assert!(compat_accepts(Compatibility::Sfm, PduVersion::MldV2));
        assert!(!compat_accepts(Compatibility::Sfm, PduVersion::IgmpV2));
    }
}
