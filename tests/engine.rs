use mcsnoopd::addr::{Family, IpmcAddr};
use mcsnoopd::config::{Compatibility, Config, Owner};
use mcsnoopd::engine::{Engine, GroupKey, QuerierState, RouterStatus, VlanKey};
use mcsnoopd::hw::MemoryHardware;
use mcsnoopd::pdu::{self, GroupRecord, PduBody, PduVersion, Query, RecordType, Report, SourceList};
use mcsnoopd::portset::PortSet;
use mcsnoopd::transmit::RecordingTransmit;

use parking_lot::Mutex;

use std::sync::Arc;

const BASE: &str = r#"
[system]
mac = "02:00:00:00:00:01"
port_count = 8
grp_cnt_max = 16

[[ports]]
name = "uplink"
index = 0
igmp = { router = true }

[[ports]]
name = "fast"
index = 4
igmp = { fast_leave = true }

[[ports]]
name = "filtered"
index = 5
igmp = { profile = "restricted" }

[ipmc.igmp]
admin_active = true
leave_proxy = true

[[vlans]]
family = "igmp"
vid = 1
ports = [0, 1, 2, 3, 4, 5, 6, 7]

[profiles]
enable = true

[[profiles.ranges]]
name = "blocked"
start = "239.1.0.0"
end = "239.1.255.255"

[[profiles.ranges]]
name = "any"
start = "224.0.0.0"
end = "239.255.255.255"

[[profiles.entries]]
name = "restricted"
rules = [{ range = "blocked", deny = true }, { range = "any" }]
"#;

struct Fixture {
    engine: Engine,
    hw: Arc<Mutex<MemoryHardware>>,
    tx: Arc<Mutex<RecordingTransmit>>,
}

impl Fixture {
    fn new(toml: &str) -> Self {
        Self::with_hardware(toml, MemoryHardware::new())
    }

    fn with_hardware(toml: &str, hw: MemoryHardware) -> Self {
        let config = Config::from_toml(toml).unwrap();
        let hw = hw.shared();
        let tx = RecordingTransmit::new().shared();
        let engine = Engine::new(&config, Box::new(hw.clone()), Box::new(tx.clone()));
        tx.lock().take();
        Self { engine, hw, tx }
    }
}

fn v4(addr: &str) -> IpmcAddr {
    addr.parse().unwrap()
}

fn vlan() -> VlanKey {
    VlanKey::new(Owner::Ipmc, Family::Ipv4, 1)
}

fn host_mac(port: usize) -> [u8; 6] {
    [0x02, 0x00, 0x00, 0x00, 0x01, port as u8]
}

fn report(version: PduVersion, is_leave: bool, record_type: RecordType, group: &str, sources: &[&str]) -> Report {
    Report {
        version,
        is_leave,
        records: vec![GroupRecord {
            record_type,
            group: v4(group),
            sources: sources.iter().map(|source| v4(source)).collect(),
        }],
        skipped_records: 0,
    }
}

fn report_frame(port: usize, report: &Report) -> Vec<u8> {
    let sip = v4(&format!("10.0.0.{}", 10 + port));
    pdu::build_report(&host_mac(port), &sip, report).unwrap()
}

fn general_query_frame(sip: &str) -> Vec<u8> {
    let query = Query {
        version: PduVersion::IgmpV3,
        max_resp_time_ms: 10000,
        group: IpmcAddr::zero(Family::Ipv4),
        s_flag: false,
        qrv: 2,
        qqi: 125,
        sources: SourceList::new(),
    };
    pdu::build_query(&[0x02, 0, 0, 0, 0x02, 0x01], &v4(sip), &query).unwrap()
}

fn specific_query_frame(sip: &str, group: &str) -> Vec<u8> {
    let query = Query {
        version: PduVersion::IgmpV3,
        max_resp_time_ms: 1000,
        group: v4(group),
        s_flag: false,
        qrv: 2,
        qqi: 125,
        sources: SourceList::new(),
    };
    pdu::build_query(&[0x02, 0, 0, 0, 0x02, 0x01], &v4(sip), &query).unwrap()
}

/// Group-specific queries for `group` sent to `port` alone.
fn specific_queries(f: &Fixture, port: usize, group: &str) -> Vec<Query> {
    f.tx.lock().take().into_iter()
        .filter(|sent| sent.ports == ports(&[port]))
        .filter_map(|sent| match pdu::parse(&sent.frame).unwrap().body {
            PduBody::Query(query) if query.group == v4(group) => Some(query),
            _ => None,
        })
        .collect()
}

fn querier_config() -> String {
    BASE.replace("vid = 1\n", "vid = 1\nquerier_enable = true\n")
}

fn ports(list: &[usize]) -> PortSet {
    list.iter().copied().collect()
}

#[test]
fn exclude_report_programs_router_and_member_ports() {
    let mut f = Fixture::new(BASE);
    let group = v4("239.2.2.2");
    let frame = report_frame(3, &report(PduVersion::IgmpV3, false, RecordType::IsEx, "239.2.2.2", &[]));

    f.engine.rx_frame(3, 1, &frame);

    let info = f.engine.group(&GroupKey::new(vlan(), group)).unwrap();
    assert_eq!(info.active_ports, ports(&[3]));
    assert_eq!(info.exclude_mode_ports, ports(&[3]));
    assert_eq!(info.grp_compat, Compatibility::Sfm);
    assert_eq!(f.hw.lock().mc_get(1, &group, None), Some(ports(&[0, 3])));

    let sent = f.tx.lock().take();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].ports, ports(&[0]));
    assert_eq!(sent[0].frame, frame);

    let stats = f.engine.vlan_statistics(&vlan()).unwrap();
    assert_eq!(stats.rx_utilized.igmp.v3_report, 1);
}

#[test]
fn repeated_report_changes_nothing() {
    let mut f = Fixture::new(BASE);
    let group = v4("239.2.2.2");
    let frame = report_frame(3, &report(PduVersion::IgmpV3, false, RecordType::IsEx, "239.2.2.2", &[]));

    f.engine.rx_frame(3, 1, &frame);
    let first = f.engine.group(&GroupKey::new(vlan(), group)).unwrap();
    let entries = f.hw.lock().mc_entries();

    f.engine.rx_frame(3, 1, &frame);
    assert_eq!(f.engine.group(&GroupKey::new(vlan(), group)).unwrap(), first);
    assert_eq!(f.hw.lock().mc_entries(), entries);
    assert_eq!(f.engine.group_count(), 1);
}

#[test]
fn fast_leave_erases_group_and_proxies_the_leave() {
    let mut f = Fixture::new(BASE);
    let group = v4("239.3.3.3");
    let key = GroupKey::new(vlan(), group);

    f.engine.rx_frame(4, 1, &report_frame(4, &report(PduVersion::IgmpV2, false, RecordType::IsEx, "239.3.3.3", &[])));
    assert_eq!(f.engine.group(&key).unwrap().grp_compat, Compatibility::Gen);
    f.tx.lock().take();

    f.engine.rx_frame(4, 1, &report_frame(4, &report(PduVersion::IgmpV2, true, RecordType::ToIn, "239.3.3.3", &[])));
    assert!(f.engine.group(&key).is_none());
    assert_eq!(f.hw.lock().mc_get(1, &group, None), None);

    let sent = f.tx.lock().take();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].ports, ports(&[0]));
    let leave = pdu::parse(&sent[0].frame).unwrap();
    let PduBody::Report(leave) = leave.body else {
        panic!("expected a report, got {:?}", leave.body);
    };
    assert_eq!(leave.records.len(), 1);
    assert_eq!(leave.records[0].record_type, RecordType::ToIn);
    assert_eq!(leave.records[0].group, group);
}

#[test]
fn group_times_out_after_membership_interval() {
    let mut f = Fixture::new(BASE);
    let key = GroupKey::new(vlan(), v4("239.2.2.2"));
    f.engine.rx_frame(3, 1, &report_frame(3, &report(PduVersion::IgmpV3, false, RecordType::IsEx, "239.2.2.2", &[])));

    // 2 * 125 + 100 / 10
    for _ in 0..259 {
        f.engine.tick();
    }
    assert!(f.engine.group(&key).is_some());

    f.engine.tick();
    assert!(f.engine.group(&key).is_none());
    assert_eq!(f.hw.lock().mc_len(), 0);
}

#[test]
fn include_sources_are_forwarded_to_the_port() {
    let mut f = Fixture::new(BASE);
    let group = v4("239.2.2.2");
    let source = v4("192.168.1.1");
    f.engine.rx_frame(2, 1, &report_frame(2, &report(PduVersion::IgmpV3, false, RecordType::Allow, "239.2.2.2", &["192.168.1.1"])));

    let info = f.engine.group(&GroupKey::new(vlan(), group)).unwrap();
    assert!(info.exclude_mode_ports.is_empty());
    assert_eq!(info.sources.len(), 1);
    assert_eq!(info.sources[0].include_port_list, ports(&[2]));
    assert_eq!(f.hw.lock().mc_get(1, &group, Some(&source)), Some(ports(&[0, 2])));
    assert_eq!(f.hw.lock().mc_get(1, &group, None), Some(ports(&[0])));
}

#[test]
fn profile_denies_blocked_range() {
    let mut f = Fixture::new(BASE);
    f.engine.rx_frame(5, 1, &report_frame(5, &report(PduVersion::IgmpV3, false, RecordType::IsEx, "239.1.1.1", &[])));
    assert!(f.engine.group(&GroupKey::new(vlan(), v4("239.1.1.1"))).is_none());

    f.engine.rx_frame(5, 1, &report_frame(5, &report(PduVersion::IgmpV3, false, RecordType::IsEx, "239.2.2.2", &[])));
    assert!(f.engine.group(&GroupKey::new(vlan(), v4("239.2.2.2"))).is_some());

    // ports without a profile are not filtered
    f.engine.rx_frame(6, 1, &report_frame(6, &report(PduVersion::IgmpV3, false, RecordType::IsEx, "239.1.1.1", &[])));
    assert!(f.engine.group(&GroupKey::new(vlan(), v4("239.1.1.1"))).is_some());
}

#[test]
fn ssm_group_in_v2_report_is_ignored() {
    let mut f = Fixture::new(BASE);
    f.engine.rx_frame(3, 1, &report_frame(3, &report(PduVersion::IgmpV2, false, RecordType::IsEx, "232.1.1.1", &[])));
    assert_eq!(f.engine.group_count(), 0);
    assert_eq!(f.engine.vlan_statistics(&vlan()).unwrap().rx_ignored.igmp.v2_report, 1);
}

#[test]
fn link_down_removes_the_port_from_groups() {
    let mut f = Fixture::new(BASE);
    let key = GroupKey::new(vlan(), v4("239.2.2.2"));
    f.engine.rx_frame(3, 1, &report_frame(3, &report(PduVersion::IgmpV3, false, RecordType::IsEx, "239.2.2.2", &[])));
    f.engine.rx_frame(6, 1, &report_frame(6, &report(PduVersion::IgmpV3, false, RecordType::IsEx, "239.2.2.2", &[])));

    f.engine.link_set(3, false);
    assert_eq!(f.engine.group(&key).unwrap().active_ports, ports(&[6]));

    f.engine.link_set(6, false);
    assert!(f.engine.group(&key).is_none());
}

#[test]
fn lower_querier_wins_the_election() {
    let mut f = Fixture::new(&querier_config());
    assert_eq!(f.engine.vlan_status(&vlan()).unwrap().querier_state, QuerierState::Init);

    f.engine.tick();
    let sent = f.tx.lock().take();
    assert_eq!(sent.len(), 1);
    let query = pdu::parse(&sent[0].frame).unwrap();
    let PduBody::Query(query) = query.body else {
        panic!("expected a query, got {:?}", query.body);
    };
    assert!(query.is_general());
    assert_eq!(query.version, PduVersion::IgmpV3);
    assert_eq!(f.engine.vlan_statistics(&vlan()).unwrap().tx_query(), 1);

    f.engine.rx_frame(2, 1, &general_query_frame("10.0.0.1"));
    let status = f.engine.vlan_status(&vlan()).unwrap();
    assert_eq!(status.querier_state, QuerierState::Idle);
    assert_eq!(status.active_querier_address, v4("10.0.0.1"));
    assert_eq!(f.engine.router_status(Owner::Ipmc, Family::Ipv4, 2), RouterStatus::Dynamic);
    assert_eq!(f.engine.router_status(Owner::Ipmc, Family::Ipv4, 0), RouterStatus::Static);

    let sent = f.tx.lock().take();
    assert_eq!(sent.len(), 1);
    assert!(!sent[0].ports.contains(2));
    assert!(sent[0].ports.contains(0));
}

#[test]
fn higher_querier_is_ignored_by_an_active_querier() {
    let toml = BASE.replace("vid = 1\n", "vid = 1\nquerier_enable = true\nquerier_address = \"10.0.0.1\"\n");
    let mut f = Fixture::new(&toml);

    f.engine.rx_frame(2, 1, &general_query_frame("10.0.0.200"));
    let status = f.engine.vlan_status(&vlan()).unwrap();
    assert_ne!(status.querier_state, QuerierState::Idle);
    assert_eq!(status.active_querier_address, v4("10.0.0.1"));
}

#[test]
fn specific_query_from_other_querier_lowers_group_timer() {
    let mut f = Fixture::new(BASE);
    let key = GroupKey::new(vlan(), v4("239.2.2.2"));
    f.engine.tick();
    assert_eq!(f.engine.vlan_status(&vlan()).unwrap().querier_state, QuerierState::Idle);

    f.engine.rx_frame(3, 1, &report_frame(3, &report(PduVersion::IgmpV3, false, RecordType::IsEx, "239.2.2.2", &[])));
    f.engine.rx_frame(2, 1, &specific_query_frame("10.0.0.1", "239.2.2.2"));

    // last member query time: 10 * 2 / 10
    f.engine.tick();
    assert!(f.engine.group(&key).is_some());
    f.engine.tick();
    assert!(f.engine.group(&key).is_none());
    assert_eq!(f.hw.lock().mc_len(), 0);
}

#[test]
fn groups_sharing_a_mac_fall_back_to_the_mac_table() {
    let mut f = Fixture::with_hardware(BASE, MemoryHardware::with_capacity(0));
    let mac = v4("239.2.0.1").multicast_mac();
    assert_eq!(mac, v4("224.2.0.1").multicast_mac());

    f.engine.rx_frame(1, 1, &report_frame(1, &report(PduVersion::IgmpV3, false, RecordType::IsEx, "239.2.0.1", &[])));
    f.engine.rx_frame(2, 1, &report_frame(2, &report(PduVersion::IgmpV3, false, RecordType::IsEx, "224.2.0.1", &[])));
    assert_eq!(f.hw.lock().mc_len(), 0);
    assert_eq!(f.hw.lock().mac_get(1, mac), Some(ports(&[0, 1, 2])));
    assert_eq!(f.hw.lock().mac_len(), 1);

    f.engine.link_set(1, false);
    assert_eq!(f.hw.lock().mac_get(1, mac), Some(ports(&[0, 2])));

    f.engine.link_set(2, false);
    assert_eq!(f.hw.lock().mac_get(1, mac), None);
    assert_eq!(f.hw.lock().mac_len(), 0);
}

#[test]
fn full_group_table_refuses_new_groups() {
    let mut f = Fixture::new(&BASE.replace("grp_cnt_max = 16", "grp_cnt_max = 2"));
    for group in ["239.2.0.1", "239.2.0.2"] {
        f.engine.rx_frame(1, 1, &report_frame(1, &report(PduVersion::IgmpV3, false, RecordType::IsEx, group, &[])));
    }
    let joined = f.engine.groups();
    let entries = f.hw.lock().mc_entries();

    let frame = report_frame(1, &report(PduVersion::IgmpV3, false, RecordType::IsEx, "239.2.0.3", &[]));
    f.engine.rx_frame(1, 1, &frame);
    assert!(f.engine.group(&GroupKey::new(vlan(), v4("239.2.0.3"))).is_none());
    assert_eq!(f.engine.global_status(Owner::Ipmc, Family::Ipv4).unwrap().grp_cnt_exceeded, 1);

    f.engine.rx_frame(1, 1, &frame);
    assert_eq!(f.engine.global_status(Owner::Ipmc, Family::Ipv4).unwrap().grp_cnt_exceeded, 2);
    assert_eq!(f.engine.groups(), joined);
    assert_eq!(f.hw.lock().mc_entries(), entries);
}

#[test]
fn full_group_refuses_new_sources() {
    let mut f = Fixture::new(&BASE.replace("grp_cnt_max = 16", "grp_cnt_max = 16\nsrc_per_grp_cnt_max = 2"));
    let key = GroupKey::new(vlan(), v4("239.2.2.2"));
    let group = v4("239.2.2.2");

    let sources = ["10.1.0.1", "10.1.0.2", "10.1.0.3"];
    f.engine.rx_frame(2, 1, &report_frame(2, &report(PduVersion::IgmpV3, false, RecordType::Allow, "239.2.2.2", &sources)));
    let info = f.engine.group(&key).unwrap();
    assert_eq!(info.sources.len(), 2);
    assert_eq!(f.engine.global_status(Owner::Ipmc, Family::Ipv4).unwrap().src_cnt_exceeded, 1);

    f.engine.rx_frame(3, 1, &report_frame(3, &report(PduVersion::IgmpV3, false, RecordType::Allow, "239.2.2.2", &["10.1.0.4"])));
    assert_eq!(f.engine.global_status(Owner::Ipmc, Family::Ipv4).unwrap().src_cnt_exceeded, 2);
    let after = f.engine.group(&key).unwrap();
    assert_eq!(after.sources, info.sources);
    assert_eq!(after.active_ports, ports(&[2]));
    assert_eq!(f.hw.lock().mc_get(1, &group, Some(&v4("10.1.0.4"))), None);
}

#[test]
fn leave_is_queried_and_group_expires_after_last_member_query_time() {
    let mut f = Fixture::new(&querier_config());
    let key = GroupKey::new(vlan(), v4("239.2.2.2"));
    f.engine.rx_frame(3, 1, &report_frame(3, &report(PduVersion::IgmpV3, false, RecordType::IsEx, "239.2.2.2", &[])));
    f.tx.lock().take();

    f.engine.rx_frame(3, 1, &report_frame(3, &report(PduVersion::IgmpV3, false, RecordType::ToIn, "239.2.2.2", &[])));
    let queries = specific_queries(&f, 3, "239.2.2.2");
    assert_eq!(queries.len(), 1);
    assert_eq!(queries[0].version, PduVersion::IgmpV3);
    assert!(!queries[0].s_flag);
    assert_eq!(queries[0].max_resp_time_ms, 1000);

    // one last member query interval later
    f.engine.tick();
    let queries = specific_queries(&f, 3, "239.2.2.2");
    assert_eq!(queries.len(), 1);
    assert!(!queries[0].s_flag);
    assert!(f.engine.group(&key).is_some());

    f.engine.tick();
    assert!(specific_queries(&f, 3, "239.2.2.2").is_empty());
    assert!(f.engine.group(&key).is_none());
    assert_eq!(f.hw.lock().mc_get(1, &v4("239.2.2.2"), None), None);
}

#[test]
fn refreshed_group_sets_suppress_flag_on_retransmission() {
    let mut f = Fixture::new(&querier_config());
    let key = GroupKey::new(vlan(), v4("239.2.2.2"));
    let join = report_frame(3, &report(PduVersion::IgmpV3, false, RecordType::IsEx, "239.2.2.2", &[]));
    f.engine.rx_frame(3, 1, &join);
    f.engine.rx_frame(3, 1, &report_frame(3, &report(PduVersion::IgmpV3, false, RecordType::ToIn, "239.2.2.2", &[])));
    let queries = specific_queries(&f, 3, "239.2.2.2");
    assert_eq!(queries.len(), 1);
    assert!(!queries[0].s_flag);

    // another member answers before the retransmission
    f.engine.rx_frame(3, 1, &join);
    f.tx.lock().take();

    f.engine.tick();
    let queries = specific_queries(&f, 3, "239.2.2.2");
    assert_eq!(queries.len(), 1);
    assert!(queries[0].s_flag);

    for _ in 0..5 {
        f.engine.tick();
    }
    assert_eq!(f.engine.group(&key).unwrap().active_ports, ports(&[3]));
}

#[test]
fn expired_source_on_exclude_port_becomes_blocked() {
    let mut f = Fixture::new(BASE);
    let key = GroupKey::new(vlan(), v4("239.2.2.2"));
    let group = v4("239.2.2.2");
    let source = v4("192.168.1.1");

    f.engine.rx_frame(3, 1, &report_frame(3, &report(PduVersion::IgmpV3, false, RecordType::IsEx, "239.2.2.2", &[])));
    f.engine.rx_frame(3, 1, &report_frame(3, &report(PduVersion::IgmpV3, false, RecordType::Allow, "239.2.2.2", &["192.168.1.1"])));
    assert_eq!(f.hw.lock().mc_get(1, &group, Some(&source)), Some(ports(&[0, 3])));

    // the block lowers the source timer to the last member query time
    f.engine.rx_frame(3, 1, &report_frame(3, &report(PduVersion::IgmpV3, false, RecordType::Block, "239.2.2.2", &["192.168.1.1"])));
    f.engine.tick();
    let info = f.engine.group(&key).unwrap();
    assert_eq!(info.sources[0].include_port_list, ports(&[3]));

    f.engine.tick();
    let info = f.engine.group(&key).unwrap();
    assert_eq!(info.exclude_mode_ports, ports(&[3]));
    assert_eq!(info.sources.len(), 1);
    assert!(info.sources[0].include_port_list.is_empty());
    assert_eq!(info.sources[0].exclude_port_list, ports(&[3]));
    assert_eq!(f.hw.lock().mc_get(1, &group, Some(&source)), Some(ports(&[0])));
    assert_eq!(f.hw.lock().mc_get(1, &group, None), Some(ports(&[0, 3])));
}

#[test]
fn idle_querier_takes_over_when_other_querier_goes_away() {
    let mut f = Fixture::new(&querier_config());
    f.engine.rx_frame(2, 1, &general_query_frame("10.0.0.1"));
    let status = f.engine.vlan_status(&vlan()).unwrap();
    assert_eq!(status.querier_state, QuerierState::Idle);
    // 2 * 125 + 100 / 20
    assert_eq!(status.other_querier_expiry, 255);
    f.tx.lock().take();

    for _ in 0..255 {
        f.engine.tick();
    }
    assert_eq!(f.engine.vlan_status(&vlan()).unwrap().querier_state, QuerierState::Idle);
    assert!(f.tx.lock().take().is_empty());

    f.engine.tick();
    let status = f.engine.vlan_status(&vlan()).unwrap();
    assert_eq!(status.querier_state, QuerierState::Active);
    assert_eq!(status.active_querier_address, v4("192.0.2.1"));

    let sent = f.tx.lock().take();
    assert_eq!(sent.len(), 1);
    let query = pdu::parse(&sent[0].frame).unwrap();
    let PduBody::Query(query) = query.body else {
        panic!("expected a query, got {:?}", query.body);
    };
    assert!(query.is_general());
}

#[test]
fn corrupt_frame_is_counted_and_dropped() {
    let mut f = Fixture::new(BASE);
    let mut frame = report_frame(3, &report(PduVersion::IgmpV3, false, RecordType::IsEx, "239.2.2.2", &[]));
    // IGMP checksum
    frame[14 + 24 + 2] ^= 0x10;

    f.engine.rx_frame(3, 1, &frame);
    assert_eq!(f.engine.group_count(), 0);
    assert!(f.tx.lock().take().is_empty());
    assert_eq!(f.engine.vlan_statistics(&vlan()).unwrap().rx_errors, 1);
}

#[test]
fn dynamic_router_port_times_out() {
    let mut f = Fixture::new(BASE);
    f.engine.rx_frame(2, 1, &general_query_frame("10.0.0.1"));
    assert_eq!(f.engine.router_status(Owner::Ipmc, Family::Ipv4, 2), RouterStatus::Dynamic);

    for _ in 0..299 {
        f.engine.tick();
    }
    assert_eq!(f.engine.router_status(Owner::Ipmc, Family::Ipv4, 2), RouterStatus::Dynamic);

    f.engine.tick();
    assert_eq!(f.engine.router_status(Owner::Ipmc, Family::Ipv4, 2), RouterStatus::None);
    assert!(!f.engine.global_status(Owner::Ipmc, Family::Ipv4).unwrap().dynamic_router_ports.contains(2));
}
