use super::*;

use crate::addr::{Family, IpmcAddr};

/// Minimum Ethernet frame length without FCS.
const MIN_FRAME_LEN: usize = 60;

/// Builds a query frame. General queries go to the all-nodes address,
/// specific queries to the group itself.
pub fn build_query(smac: &[u8; 6], sip: &IpmcAddr, query: &Query) -> Result<Vec<u8>, TxError> {
    let family = query.version.family();
    if sip.family() != family || query.group.family() != family {
        return Err(TxError::new("address family mismatch"));
    }

    let group = if query.version == PduVersion::IgmpV1 {
        IpmcAddr::zero(family)
    } else {
        query.group
    };
    let dip = if group.is_zero() {
        IpmcAddr::all_nodes(family)
    } else {
        group
    };
    let with_sources = query.version.is_source_specific();
    let qrv = if query.qrv > 7 { 0 } else { query.qrv };
    let s_qrv = (if query.s_flag { 0x08 } else { 0x00 }) | qrv;

    let mut data;
    match family {
        Family::Ipv4 => {
            data = vec![0u8; 8];
            data[0] = IGMP_QUERY;
            data[1] = match query.version {
                PduVersion::IgmpV1 => 0,
                PduVersion::IgmpV2 => (query.max_resp_time_ms / 100).min(255) as u8,
                _ => float::encode8(query.max_resp_time_ms / 100),
            };
            data[4..8].copy_from_slice(&group.octets());
        }
        Family::Ipv6 => {
            data = vec![0u8; 24];
            data[0] = MLD_QUERY;
            let code = match query.version {
                PduVersion::MldV1 => query.max_resp_time_ms.min(65535) as u16,
                _ => float::encode16(query.max_resp_time_ms),
            };
            data[4..6].copy_from_slice(&code.to_be_bytes());
            data[8..24].copy_from_slice(&group.octets());
        }
    }

    if with_sources {
        data.push(s_qrv);
        data.push(float::encode8(query.qqi));
        data.extend_from_slice(&(query.sources.len() as u16).to_be_bytes());
        for source in &query.sources {
            if source.family() != family {
                return Err(TxError::new("address family mismatch"));
            }
            data.extend_from_slice(&source.octets());
        }
    }

    build_frame(smac, sip, &dip, data)
}

/// Builds a report frame.
///
/// IGMPv1/v2 and MLDv1 carry the first record's group only, as a report
/// or, with `is_leave`, as a leave/done towards the all-routers address.
/// IGMPv3 and MLDv2 carry all records.
pub fn build_report(smac: &[u8; 6], sip: &IpmcAddr, report: &Report) -> Result<Vec<u8>, TxError> {
    let family = report.version.family();
    if sip.family() != family {
        return Err(TxError::new("address family mismatch"));
    }
    if report.records.is_empty() {
        return Err(TxError::new("report without records"));
    }
    if report.records.len() > MAX_GROUP_RECORDS {
        return Err(TxError::new("too many group records"));
    }
    if report.records.iter().any(|record| record.group.family() != family) {
        return Err(TxError::new("address family mismatch"));
    }

    let first = &report.records[0];
    let mut data;
    let dip;
    match report.version {
        PduVersion::IgmpV1 | PduVersion::IgmpV2 => {
            data = vec![0u8; 8];
            data[0] = match (report.version, report.is_leave) {
                (_, true) => IGMP_V2_LEAVE,
                (PduVersion::IgmpV1, false) => IGMP_V1_REPORT,
                _ => IGMP_V2_REPORT,
            };
            data[4..8].copy_from_slice(&first.group.octets());
            dip = if report.is_leave { IpmcAddr::ALL_ROUTERS_V4 } else { first.group };
        }
        PduVersion::MldV1 => {
            data = vec![0u8; 24];
            data[0] = if report.is_leave { MLD_V1_DONE } else { MLD_V1_REPORT };
            data[8..24].copy_from_slice(&first.group.octets());
            dip = if report.is_leave { IpmcAddr::ALL_ROUTERS_V6 } else { first.group };
        }
        PduVersion::IgmpV3 | PduVersion::MldV2 => {
            data = vec![0u8; 8];
            data[0] = if family.is_ipv4() { IGMP_V3_REPORT } else { MLD_V2_REPORT };
            data[6..8].copy_from_slice(&(report.records.len() as u16).to_be_bytes());
            for record in &report.records {
                // record type, aux data length, number of sources
                data.push(record.record_type as u8);
                data.push(0);
                data.extend_from_slice(&(record.sources.len() as u16).to_be_bytes());
                data.extend_from_slice(&record.group.octets());
                for source in &record.sources {
                    if source.family() != family {
                        return Err(TxError::new("address family mismatch"));
                    }
                    data.extend_from_slice(&source.octets());
                }
            }
            dip = if family.is_ipv4() { IpmcAddr::IGMPV3_ROUTERS } else { IpmcAddr::MLDV2_ROUTERS };
        }
    }

    build_frame(smac, sip, &dip, data)
}

/// Wraps a message into Ethernet and IP headers and fills in the checksums.
fn build_frame(smac: &[u8; 6], sip: &IpmcAddr, dip: &IpmcAddr, mut message: Vec<u8>) -> Result<Vec<u8>, TxError> {
    let mut frame = Vec::with_capacity(MIN_FRAME_LEN.max(14 + 48 + message.len()));
    frame.extend_from_slice(&dip.multicast_mac());
    frame.extend_from_slice(smac);

    match (sip, dip) {
        (IpmcAddr::V4(_), IpmcAddr::V4(_)) => {
            let sum = checksum::checksum(&message);
            message[2..4].copy_from_slice(&sum.to_be_bytes());

            let total_len = 24 + message.len();
            if 14 + total_len > MAX_FRAME_LEN {
                return Err(TxError::new("frame too large"));
            }

            let mut header = [0u8; 24];
            // version, header length
            header[0] = 0x46;
            header[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
            // TTL
            header[8] = 1;
            // protocol (IGMP)
            header[9] = 2;
            header[12..16].copy_from_slice(&sip.octets());
            header[16..20].copy_from_slice(&dip.octets());
            // router alert
            header[20] = 0x94;
            header[21] = 0x04;
            let sum = checksum::checksum(&header);
            header[10..12].copy_from_slice(&sum.to_be_bytes());

            frame.extend_from_slice(&ETHERTYPE_IPV4.to_be_bytes());
            frame.extend_from_slice(&header);
        }
        (IpmcAddr::V6(src), IpmcAddr::V6(dst)) => {
            let sum = checksum::checksum_v6(src, dst, 58, &message);
            message[2..4].copy_from_slice(&sum.to_be_bytes());

            let payload_len = 8 + message.len();
            if 14 + 40 + payload_len > MAX_FRAME_LEN {
                return Err(TxError::new("frame too large"));
            }

            let mut header = [0u8; 48];
            header[0] = 0x60;
            header[4..6].copy_from_slice(&(payload_len as u16).to_be_bytes());
            // next header (hop-by-hop)
            header[6] = 0;
            // hop limit
            header[7] = 1;
            header[8..24].copy_from_slice(&src.octets());
            header[24..40].copy_from_slice(&dst.octets());

            // next header (ICMPv6)
            header[40] = 58;
            // length
            header[41] = 0;
            // router alert (MLD)
            header[42] = 0x05;
            header[43] = 0x02;
            header[44] = 0x00;
            header[45] = 0x00;
            // padding
            header[46] = 0x01;
            header[47] = 0x00;

            frame.extend_from_slice(&ETHERTYPE_IPV6.to_be_bytes());
            frame.extend_from_slice(&header);
        }
        _ => {
            return Err(TxError::new("address family mismatch"));
        }
    }

    frame.extend_from_slice(&message);
    if frame.len() < MIN_FRAME_LEN {
        frame.resize(MIN_FRAME_LEN, 0);
    }
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SMAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x01];

    fn addr(s: &str) -> IpmcAddr {
        s.parse().unwrap()
    }

    fn sources(list: &[&str]) -> SourceList {
        list.iter().map(|s| addr(s)).collect()
    }

    #[test]
    fn igmpv3_group_and_source_query_parses_back() {
        let query = Query {
            version: PduVersion::IgmpV3,
            max_resp_time_ms: 1000,
            group: addr("239.1.1.1"),
            s_flag: true,
            qrv: 2,
            qqi: 125,
            sources: sources(&["10.0.0.1", "10.0.0.2"]),
        };
        let frame = build_query(&SMAC, &addr("192.0.2.1"), &query).unwrap();
        assert_eq!(&frame[0..6], &[0x01, 0x00, 0x5e, 0x01, 0x01, 0x01]);

        let pdu = parse(&frame).unwrap();
        assert_eq!(pdu.dip, addr("239.1.1.1"));
        assert_eq!(pdu.sip, addr("192.0.2.1"));
        assert_eq!(pdu.smac, SMAC);
        assert_eq!(pdu.body, PduBody::Query(query));
    }

    #[test]
    fn mldv1_general_query_goes_to_all_nodes() {
        let query = Query {
            version: PduVersion::MldV1,
            max_resp_time_ms: 10_000,
            group: IpmcAddr::zero(Family::Ipv6),
            s_flag: false,
            qrv: 0,
            qqi: 0,
            sources: SourceList::new(),
        };
        let frame = build_query(&SMAC, &addr("fe80::1"), &query).unwrap();
        assert_eq!(frame.len(), 14 + 48 + 24);
        let pdu = parse(&frame).unwrap();
        assert_eq!(pdu.dip, IpmcAddr::ALL_NODES_V6);
        assert_eq!(pdu.body, PduBody::Query(query));
    }

    #[test]
    fn leave_and_done_go_to_all_routers() {
        let record = |group: &str| GroupRecord {
            record_type: RecordType::ToIn,
            group: addr(group),
            sources: SourceList::new(),
        };
        let leave = Report {
            version: PduVersion::IgmpV2,
            is_leave: true,
            records: vec![record("239.1.1.1")],
            skipped_records: 0,
        };
        let frame = build_report(&SMAC, &addr("192.0.2.1"), &leave).unwrap();
        assert_eq!(frame.len(), MIN_FRAME_LEN);
        let pdu = parse(&frame).unwrap();
        assert_eq!(pdu.dip, IpmcAddr::ALL_ROUTERS_V4);
        assert_eq!(pdu.body, PduBody::Report(leave));

        let done = Report {
            version: PduVersion::MldV1,
            is_leave: true,
            records: vec![record("ff3e::1:2")],
            skipped_records: 0,
        };
        let frame = build_report(&SMAC, &addr("fe80::1"), &done).unwrap();
        let pdu = parse(&frame).unwrap();
        assert_eq!(pdu.dip, IpmcAddr::ALL_ROUTERS_V6);
        assert_eq!(pdu.body, PduBody::Report(done));
    }

    #[test]
    fn mldv2_report_goes_to_mldv2_routers() {
        let report = Report {
            version: PduVersion::MldV2,
            is_leave: false,
            records: vec![
                GroupRecord {
                    record_type: RecordType::IsEx,
                    group: addr("ff3e::1"),
                    sources: SourceList::new(),
                },
                GroupRecord {
                    record_type: RecordType::Allow,
                    group: addr("ff3e::2"),
                    sources: sources(&["2001:db8::1"]),
                },
            ],
            skipped_records: 0,
        };
        let frame = build_report(&SMAC, &addr("fe80::1"), &report).unwrap();
        let pdu = parse(&frame).unwrap();
        assert_eq!(pdu.dip, IpmcAddr::MLDV2_ROUTERS);
        assert_eq!(pdu.body, PduBody::Report(report));
    }

    fn query(version: PduVersion, max_resp_time_ms: u32, group: &str, list: &[&str]) -> Query {
        let source_specific = version.is_source_specific();
        Query {
            version,
            max_resp_time_ms,
            group: addr(group),
            s_flag: false,
            qrv: if source_specific { 2 } else { 0 },
            qqi: if source_specific { 125 } else { 0 },
            sources: sources(list),
        }
    }

    fn report(version: PduVersion, is_leave: bool, records: Vec<GroupRecord>) -> Report {
        Report {
            version,
            is_leave,
            records,
            skipped_records: 0,
        }
    }

    fn record(record_type: RecordType, group: &str, list: &[&str]) -> GroupRecord {
        GroupRecord {
            record_type,
            group: addr(group),
            sources: sources(list),
        }
    }

    /// Flips every bit of the IGMP or MLD message and of the IPv6
    /// addresses covered by the pseudo-header.
    fn assert_bit_flips_discarded(frame: &[u8]) {
        let range = match u16::from_be_bytes([frame[12], frame[13]]) {
            ETHERTYPE_IPV4 => {
                let total_len = u16::from_be_bytes([frame[16], frame[17]]) as usize;
                (14 + 24)..(14 + total_len)
            }
            _ => (14 + 8)..frame.len(),
        };
        for byte in range {
            if (14 + 40..14 + 48).contains(&byte) && frame[12..14] == ETHERTYPE_IPV6.to_be_bytes() {
                continue;
            }
            for bit in 0..8 {
                let mut corrupt = frame.to_vec();
                corrupt[byte] ^= 1 << bit;
                let err = parse(&corrupt).unwrap_err();
                assert_eq!(err.action(), RxAction::Discard, "byte {} bit {}: {}", byte, bit, err);
            }
        }
    }

    #[test]
    fn igmpv1_and_v2_queries_parse_back() {
        let v1 = query(PduVersion::IgmpV1, 10_000, "0.0.0.0", &[]);
        let frame = build_query(&SMAC, &addr("192.0.2.1"), &v1).unwrap();
        assert_eq!(frame.len(), MIN_FRAME_LEN);
        let pdu = parse(&frame).unwrap();
        assert_eq!(pdu.dip, IpmcAddr::all_nodes(Family::Ipv4));
        assert_eq!(pdu.body, PduBody::Query(v1));

        let v2 = query(PduVersion::IgmpV2, 1000, "239.1.1.1", &[]);
        let frame = build_query(&SMAC, &addr("192.0.2.1"), &v2).unwrap();
        assert_eq!(&frame[0..6], &[0x01, 0x00, 0x5e, 0x01, 0x01, 0x01]);
        let pdu = parse(&frame).unwrap();
        assert_eq!(pdu.dip, addr("239.1.1.1"));
        assert_eq!(pdu.body, PduBody::Query(v2));
    }

    #[test]
    fn igmp_reports_parse_back() {
        let v1 = report(PduVersion::IgmpV1, false, vec![record(RecordType::IsEx, "239.1.1.1", &[])]);
        let frame = build_report(&SMAC, &addr("192.0.2.1"), &v1).unwrap();
        let pdu = parse(&frame).unwrap();
        assert_eq!(pdu.dip, addr("239.1.1.1"));
        assert_eq!(pdu.body, PduBody::Report(v1));

        let v2 = report(PduVersion::IgmpV2, false, vec![record(RecordType::IsEx, "239.1.1.2", &[])]);
        let frame = build_report(&SMAC, &addr("192.0.2.1"), &v2).unwrap();
        assert_eq!(parse(&frame).unwrap().body, PduBody::Report(v2));

        let v3 = report(PduVersion::IgmpV3, false, vec![
            record(RecordType::IsEx, "239.1.1.1", &[]),
            record(RecordType::Allow, "232.1.1.1", &["10.0.0.1", "10.0.0.2"]),
            record(RecordType::Block, "239.1.1.3", &["10.0.0.3"]),
        ]);
        let frame = build_report(&SMAC, &addr("192.0.2.1"), &v3).unwrap();
        let pdu = parse(&frame).unwrap();
        assert_eq!(pdu.dip, IpmcAddr::IGMPV3_ROUTERS);
        assert_eq!(pdu.body, PduBody::Report(v3));
    }

    #[test]
    fn any_bit_flip_in_message_is_discarded() {
        let v4 = addr("192.0.2.1");
        let v6 = addr("fe80::1");
        let frames = [
            build_query(&SMAC, &v4, &query(PduVersion::IgmpV1, 10_000, "0.0.0.0", &[])),
            build_query(&SMAC, &v4, &query(PduVersion::IgmpV2, 1000, "239.1.1.1", &[])),
            build_query(&SMAC, &v4, &query(PduVersion::IgmpV3, 1000, "239.1.1.1", &["10.0.0.1"])),
            build_query(&SMAC, &v6, &query(PduVersion::MldV1, 1000, "ff3e::1", &[])),
            build_query(&SMAC, &v6, &query(PduVersion::MldV2, 10_000, "ff3e::1", &["2001:db8::1"])),
            build_report(&SMAC, &v4, &report(PduVersion::IgmpV1, false, vec![record(RecordType::IsEx, "239.1.1.1", &[])])),
            build_report(&SMAC, &v4, &report(PduVersion::IgmpV2, false, vec![record(RecordType::IsEx, "239.1.1.1", &[])])),
            build_report(&SMAC, &v4, &report(PduVersion::IgmpV2, true, vec![record(RecordType::ToIn, "239.1.1.1", &[])])),
            build_report(&SMAC, &v4, &report(PduVersion::IgmpV3, false, vec![record(RecordType::Allow, "239.1.1.1", &["10.0.0.1"])])),
            build_report(&SMAC, &v6, &report(PduVersion::MldV1, false, vec![record(RecordType::IsEx, "ff3e::1", &[])])),
            build_report(&SMAC, &v6, &report(PduVersion::MldV1, true, vec![record(RecordType::ToIn, "ff3e::1", &[])])),
            build_report(&SMAC, &v6, &report(PduVersion::MldV2, false, vec![record(RecordType::IsIn, "ff3e::1", &["2001:db8::1"])])),
        ];
        for frame in frames {
            let frame = frame.unwrap();
            parse(&frame).unwrap();
            assert_bit_flips_discarded(&frame);
        }
    }

    #[test]
    fn igmp_checksum_flip_is_discarded() {
        let v3 = report(PduVersion::IgmpV3, false, vec![record(RecordType::IsEx, "239.1.1.1", &[])]);
        let mut frame = build_report(&SMAC, &addr("192.0.2.1"), &v3).unwrap();
        // IGMP checksum field
        frame[14 + 24 + 2] ^= 0x10;
        let err = parse(&frame).unwrap_err();
        assert_eq!(err.action(), RxAction::Discard);
    }

    #[test]
    fn oversized_report_is_rejected() {
        let report = Report {
            version: PduVersion::IgmpV3,
            is_leave: false,
            records: vec![GroupRecord {
                record_type: RecordType::IsIn,
                group: addr("239.1.1.1"),
                sources: (1..=400u32).map(|i| IpmcAddr::V4(std::net::Ipv4Addr::from(0x0a00_0000 + i))).collect(),
            }],
            skipped_records: 0,
        };
        assert!(build_report(&SMAC, &addr("192.0.2.1"), &report).is_err());
    }
}
