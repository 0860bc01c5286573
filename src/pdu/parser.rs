use super::*;

use crate::addr::{Family, IpmcAddr};

use std::net::{Ipv4Addr, Ipv6Addr};

const ALL_NODES_MAC_V4: [u8; 6] = [0x01, 0x00, 0x5e, 0x00, 0x00, 0x01];
const ALL_NODES_MAC_V6: [u8; 6] = [0x33, 0x33, 0x00, 0x00, 0x00, 0x01];

/// Addressing of the network layer, as needed by the message parsers.
struct L3Info {
    dmac: [u8; 6],
    smac: [u8; 6],
    sip: IpmcAddr,
    dip: IpmcAddr,
}

/// Decodes an Ethernet frame, without FCS, into an IGMP or MLD message.
///
/// A single 802.1Q tag is skipped if present. The error tells whether the
/// frame should be dropped or flooded unprocessed.
pub fn parse(frame: &[u8]) -> Result<Pdu, RxError> {
    if frame.len() < 14 {
        return Err(RxError::discard("frame too short"));
    }

    let mut dmac = [0u8; 6];
    let mut smac = [0u8; 6];
    dmac.copy_from_slice(&frame[0..6]);
    smac.copy_from_slice(&frame[6..12]);

    let mut offset = 12;
    let mut etype = u16::from_be_bytes([frame[offset], frame[offset + 1]]);
    if etype == ETHERTYPE_VLAN {
        if frame.len() < 18 {
            return Err(RxError::discard("frame too short"));
        }
        offset += 4;
        etype = u16::from_be_bytes([frame[offset], frame[offset + 1]]);
    }
    let l3 = &frame[(offset + 2)..];

    match etype {
        ETHERTYPE_IPV4 => parse_ipv4(dmac, smac, l3),
        ETHERTYPE_IPV6 => parse_ipv6(dmac, smac, l3),
        _ => Err(RxError::discard("not an IP frame")),
    }
}

fn parse_ipv4(dmac: [u8; 6], smac: [u8; 6], l3: &[u8]) -> Result<Pdu, RxError> {
    if l3.len() < 20 {
        return Err(RxError::discard("IPv4 header truncated"));
    }
    if l3[0] >> 4 != 4 {
        return Err(RxError::discard("IPv4 version mismatch"));
    }

    let ihl = ((l3[0] & 0x0f) as usize) * 4;
    if ihl < 20 || l3.len() < ihl {
        return Err(RxError::flood("IPv4 header length"));
    }

    // the header checksum goes first so that corrupt lengths are not trusted
    if !checksum::verify(&l3[..ihl]) {
        return Err(RxError::discard("IPv4 header checksum"));
    }

    let total_len = u16::from_be_bytes([l3[2], l3[3]]) as usize;
    if total_len <= ihl || total_len - ihl < 8 || l3.len() < total_len {
        return Err(RxError::flood("IPv4 total length"));
    }

    // more fragments, fragment offset
    let fragment = u16::from_be_bytes([l3[6], l3[7]]);
    if fragment & 0x3fff != 0 {
        return Err(RxError::flood("IPv4 fragment"));
    }

    if l3[8] != 1 {
        return Err(RxError::discard("IPv4 TTL != 1"));
    }
    if l3[9] != 2 {
        return Err(RxError::discard("IPv4 protocol is not IGMP"));
    }

    let sip = IpmcAddr::V4(Ipv4Addr::new(l3[12], l3[13], l3[14], l3[15]));
    let dip = IpmcAddr::V4(Ipv4Addr::new(l3[16], l3[17], l3[18], l3[19]));
    if !dip.is_multicast() {
        return Err(RxError::flood("IPv4 destination is not multicast"));
    }

    // options
    let options = &l3[20..ihl];
    let mut i = 0;
    while i < options.len() {
        let option_type = options[i];
        if option_type == 0x00 {
            break;
        }
        if option_type == 0x01 {
            i += 1;
            continue;
        }
        if i + 1 >= options.len() {
            break;
        }
        let option_len = options[i + 1] as usize;
        if option_len < 2 || i + option_len > options.len() {
            break;
        }
        // router alert
        if option_type == 0x94 && option_len == 4 && (options[i + 2] != 0 || options[i + 3] != 0) {
            return Err(RxError::flood("IPv4 router alert value"));
        }
        i += option_len;
    }

    let l4 = &l3[ihl..total_len];
    if !checksum::verify(l4) {
        return Err(RxError::discard("IGMP checksum"));
    }

    let info = L3Info {
        dmac,
        smac,
        sip,
        dip,
    };

    match l4[0] {
        IGMP_QUERY => parse_igmp_query(info, l4),
        IGMP_V1_REPORT => parse_report(info, l4, PduVersion::IgmpV1, false),
        IGMP_V2_REPORT => parse_report(info, l4, PduVersion::IgmpV2, false),
        IGMP_V2_LEAVE => parse_report(info, l4, PduVersion::IgmpV2, true),
        IGMP_V3_REPORT => parse_report(info, l4, PduVersion::IgmpV3, false),
        MLD_QUERY | MLD_V1_REPORT | MLD_V1_DONE | MLD_V2_REPORT => {
            Err(RxError::discard("MLD message in IPv4"))
        }
        _ => Err(RxError::flood("unknown IGMP message type")),
    }
}

fn parse_ipv6(dmac: [u8; 6], smac: [u8; 6], l3: &[u8]) -> Result<Pdu, RxError> {
    if l3.len() < 40 {
        return Err(RxError::discard("IPv6 header truncated"));
    }
    if l3[0] >> 4 != 6 {
        return Err(RxError::discard("IPv6 version mismatch"));
    }

    let payload_len = u16::from_be_bytes([l3[4], l3[5]]) as usize;
    if l3.len() < 40 + payload_len || payload_len < 8 {
        return Err(RxError::flood("IPv6 payload length"));
    }

    // next header must be hop-by-hop
    if l3[6] != 0 {
        return Err(RxError::discard("IPv6 without hop-by-hop header"));
    }
    if l3[7] != 1 {
        return Err(RxError::discard("IPv6 hop limit != 1"));
    }

    let mut src = [0u8; 16];
    let mut dst = [0u8; 16];
    src.copy_from_slice(&l3[8..24]);
    dst.copy_from_slice(&l3[24..40]);
    let src = Ipv6Addr::from(src);
    let dst = Ipv6Addr::from(dst);

    let payload = &l3[40..(40 + payload_len)];
    if payload[0] != 58 {
        return Err(RxError::discard("hop-by-hop next header is not ICMPv6"));
    }
    let hbh_len = (payload[1] as usize + 1) * 8;
    if hbh_len > payload_len {
        return Err(RxError::flood("hop-by-hop length"));
    }

    let mut router_alert = false;
    let options = &payload[2..hbh_len];
    let mut i = 0;
    while i < options.len() {
        let option_type = options[i];
        if option_type == 0 {
            // Pad1
            i += 1;
            continue;
        }
        if i + 1 >= options.len() {
            break;
        }
        let option_len = options[i + 1] as usize;
        if i + 2 + option_len > options.len() {
            break;
        }
        if option_type == 0x05 && option_len == 2 && options[i + 2] == 0 && options[i + 3] == 0 {
            router_alert = true;
        }
        i += 2 + option_len;
    }
    if !router_alert {
        return Err(RxError::discard("MLD without router alert"));
    }

    let l4 = &payload[hbh_len..];
    if l4.len() < 24 {
        return Err(RxError::flood("MLD message too short"));
    }
    if !checksum::verify_v6(&src, &dst, 58, l4) {
        return Err(RxError::discard("MLD checksum"));
    }

    let info = L3Info {
        dmac,
        smac,
        sip: IpmcAddr::V6(src),
        dip: IpmcAddr::V6(dst),
    };

    match l4[0] {
        MLD_QUERY => parse_mld_query(info, l4),
        MLD_V1_REPORT => parse_report(info, l4, PduVersion::MldV1, false),
        MLD_V1_DONE => parse_report(info, l4, PduVersion::MldV1, true),
        MLD_V2_REPORT => parse_report(info, l4, PduVersion::MldV2, false),
        IGMP_QUERY | IGMP_V1_REPORT | IGMP_V2_REPORT | IGMP_V2_LEAVE | IGMP_V3_REPORT => {
            Err(RxError::discard("IGMP message in IPv6"))
        }
        _ => Err(RxError::flood("unknown MLD message type")),
    }
}

fn read_sources(family: Family, data: &[u8], count: usize) -> SourceList {
    let width = address_width(family);
    data.chunks_exact(width)
        .take(count)
        .filter_map(|chunk| IpmcAddr::from_slice(family, chunk))
        .collect()
}

fn address_width(family: Family) -> usize {
    match family {
        Family::Ipv4 => 4,
        Family::Ipv6 => 16,
    }
}

fn read_addr(family: Family, data: &[u8]) -> Result<IpmcAddr, RxError> {
    IpmcAddr::from_slice(family, data).ok_or(RxError::discard("address truncated"))
}

fn check_query_dmac(info: &L3Info, group: &IpmcAddr) -> Result<(), RxError> {
    let all_nodes = match group.family() {
        Family::Ipv4 => ALL_NODES_MAC_V4,
        Family::Ipv6 => ALL_NODES_MAC_V6,
    };
    if info.dmac != all_nodes && info.dmac != group.multicast_mac() {
        return Err(RxError::discard("query DMAC does not match group"));
    }
    Ok(())
}

fn parse_igmp_query(info: L3Info, data: &[u8]) -> Result<Pdu, RxError> {
    let code = data[1];
    let (version, max_resp_time_ms) = if data.len() == 8 {
        if code == 0 {
            (PduVersion::IgmpV1, 10_000)
        } else {
            (PduVersion::IgmpV2, 100 * code as u32)
        }
    } else {
        if data.len() < 12 {
            return Err(RxError::discard("IGMPv3 query too short"));
        }
        let max_resp_time_ms = 100 * float::decode8(code);
        if max_resp_time_ms == 0 {
            return Err(RxError::discard("IGMPv3 query with zero max response time"));
        }
        (PduVersion::IgmpV3, max_resp_time_ms)
    };

    let group = if version == PduVersion::IgmpV1 {
        IpmcAddr::zero(Family::Ipv4)
    } else {
        let group = read_addr(Family::Ipv4, &data[4..8])?;
        if !group.is_zero() && !group.is_multicast() {
            return Err(RxError::discard("query group is not multicast"));
        }
        check_query_dmac(&info, &group)?;
        group
    };

    let mut query = Query {
        version,
        max_resp_time_ms,
        group,
        s_flag: false,
        qrv: 0,
        qqi: 0,
        sources: SourceList::new(),
    };

    if version == PduVersion::IgmpV3 {
        query.s_flag = (data[8] >> 3) & 0x01 != 0;
        query.qrv = data[8] & 0x07;
        query.qqi = float::decode8(data[9]);
        let count = u16::from_be_bytes([data[10], data[11]]) as usize;
        if data.len() < 12 + count * 4 {
            return Err(RxError::discard("IGMPv3 query source list truncated"));
        }
        query.sources = read_sources(Family::Ipv4, &data[12..], count);
    }

    Ok(Pdu {
        dmac: info.dmac,
        smac: info.smac,
        sip: info.sip,
        dip: info.dip,
        body: PduBody::Query(query),
    })
}

fn parse_mld_query(info: L3Info, data: &[u8]) -> Result<Pdu, RxError> {
    if !info.sip.is_link_local() {
        return Err(RxError::discard("MLD query source is not link-local"));
    }

    let code = u16::from_be_bytes([data[4], data[5]]);
    if code == 0 {
        return Err(RxError::discard("MLD query with zero max response delay"));
    }
    let (version, max_resp_time_ms) = if data.len() == 24 {
        (PduVersion::MldV1, code as u32)
    } else {
        if data.len() < 28 {
            return Err(RxError::discard("MLDv2 query too short"));
        }
        (PduVersion::MldV2, float::decode16(code))
    };

    let group = read_addr(Family::Ipv6, &data[8..24])?;
    if !group.is_zero() && !group.is_multicast() {
        return Err(RxError::discard("query group is not multicast"));
    }
    check_query_dmac(&info, &group)?;

    let mut query = Query {
        version,
        max_resp_time_ms,
        group,
        s_flag: false,
        qrv: 0,
        qqi: 0,
        sources: SourceList::new(),
    };

    if version == PduVersion::MldV2 {
        query.s_flag = (data[24] >> 3) & 0x01 != 0;
        query.qrv = data[24] & 0x07;
        if query.qrv == 0 {
            return Err(RxError::discard("MLDv2 query with zero QRV"));
        }
        query.qqi = float::decode8(data[25]);
        let count = u16::from_be_bytes([data[26], data[27]]) as usize;
        if data.len() < 28 + count * 16 {
            return Err(RxError::discard("MLDv2 query source list truncated"));
        }
        query.sources = read_sources(Family::Ipv6, &data[28..], count);
    }

    Ok(Pdu {
        dmac: info.dmac,
        smac: info.smac,
        sip: info.sip,
        dip: info.dip,
        body: PduBody::Query(query),
    })
}

fn report_group_valid(group: &IpmcAddr) -> bool {
    group.is_multicast() && !group.is_reserved_group()
}

fn parse_report(info: L3Info, data: &[u8], version: PduVersion, is_leave: bool) -> Result<Pdu, RxError> {
    let family = version.family();
    if family == Family::Ipv6 && !info.sip.is_link_local() && !info.sip.is_zero() {
        return Err(RxError::discard("MLD report source is not link-local"));
    }

    let mut report = Report {
        version,
        is_leave,
        records: Vec::new(),
        skipped_records: 0,
    };

    if !version.is_source_specific() {
        let group = match family {
            Family::Ipv4 => read_addr(family, &data[4..8])?,
            Family::Ipv6 => read_addr(family, &data[8..24])?,
        };
        if !report_group_valid(&group) {
            return Err(RxError::flood("report group address"));
        }
        report.records.push(GroupRecord {
            record_type: if is_leave { RecordType::ToIn } else { RecordType::IsEx },
            group,
            sources: SourceList::new(),
        });
    } else {
        let min_len = match family {
            Family::Ipv4 => 16,
            Family::Ipv6 => 28,
        };
        if data.len() < min_len {
            return Err(RxError::discard("report too short"));
        }

        let record_count = u16::from_be_bytes([data[6], data[7]]) as usize;
        if record_count == 0 || record_count > MAX_GROUP_RECORDS {
            return Err(RxError::flood("report record count"));
        }

        let width = address_width(family);
        let mut offset = 8;
        for _ in 0..record_count {
            if data.len() < offset + 4 {
                return Err(RxError::discard("group record truncated"));
            }
            let record_type = RecordType::from_u8(data[offset]);
            let aux_len = data[offset + 1] as usize * 4;
            let source_count = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
            if source_count > MAX_RECORD_SOURCES {
                return Err(RxError::flood("too many sources in group record"));
            }

            let end = offset + 4 + width + source_count * width + aux_len;
            if data.len() < end {
                return Err(RxError::discard("group record truncated"));
            }

            let group = read_addr(family, &data[(offset + 4)..])?;
            let sources = read_sources(family, &data[(offset + 4 + width)..], source_count);
            offset = end;

            let record_type = match record_type {
                Some(record_type) => record_type,
                None => {
                    report.skipped_records += 1;
                    continue;
                }
            };
            if !report_group_valid(&group) || !sources.iter().all(|source| source.is_unicast()) {
                report.skipped_records += 1;
                continue;
            }

            report.records.push(GroupRecord {
                record_type,
                group,
                sources,
            });
        }

        if report.records.is_empty() {
            return Err(RxError::flood("no valid group record"));
        }
    }

    Ok(Pdu {
        dmac: info.dmac,
        smac: info.smac,
        sip: info.sip,
        dip: info.dip,
        body: PduBody::Report(report),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4(s: &str) -> IpmcAddr {
        s.parse().unwrap()
    }

    /// Wraps an IGMP message into an Ethernet/IPv4 frame with router alert.
    fn igmp_frame(dip: [u8; 4], dmac: [u8; 6], mut message: Vec<u8>) -> Vec<u8> {
        message[2] = 0;
        message[3] = 0;
        let sum = checksum::checksum(&message);
        message[2..4].copy_from_slice(&sum.to_be_bytes());

        let mut frame = Vec::new();
        frame.extend_from_slice(&dmac);
        frame.extend_from_slice(&[0x02, 0, 0, 0, 0, 0x09]);
        frame.extend_from_slice(&[0x08, 0x00]);

        let total_len = (24 + message.len()) as u16;
        let mut ip = vec![0x46, 0, 0, 0, 0, 0, 0, 0, 1, 2, 0, 0, 10, 0, 0, 9];
        ip[2..4].copy_from_slice(&total_len.to_be_bytes());
        ip.extend_from_slice(&dip);
        ip.extend_from_slice(&[0x94, 0x04, 0x00, 0x00]);
        let sum = checksum::checksum(&ip);
        ip[10..12].copy_from_slice(&sum.to_be_bytes());

        frame.extend_from_slice(&ip);
        frame.extend_from_slice(&message);
        frame
    }

    fn v3_report(records: &[(u8, [u8; 4], &[[u8; 4]])]) -> Vec<u8> {
        let mut message = vec![IGMP_V3_REPORT, 0, 0, 0, 0, 0];
        message.extend_from_slice(&(records.len() as u16).to_be_bytes());
        for (record_type, group, sources) in records {
            message.push(*record_type);
            message.push(0);
            message.extend_from_slice(&(sources.len() as u16).to_be_bytes());
            message.extend_from_slice(group);
            for source in sources.iter() {
                message.extend_from_slice(source);
            }
        }
        igmp_frame([224, 0, 0, 22], [0x01, 0x00, 0x5e, 0, 0, 0x16], message)
    }

    #[test]
    fn igmpv2_report() {
        let frame = igmp_frame(
            [239, 1, 1, 1],
            [0x01, 0x00, 0x5e, 0x01, 0x01, 0x01],
            vec![IGMP_V2_REPORT, 0, 0, 0, 239, 1, 1, 1],
        );
        let pdu = parse(&frame).unwrap();
        assert_eq!(pdu.sip, v4("10.0.0.9"));
        match pdu.body {
            PduBody::Report(report) => {
                assert_eq!(report.version, PduVersion::IgmpV2);
                assert!(!report.is_leave);
                assert_eq!(report.records.len(), 1);
                assert_eq!(report.records[0].record_type, RecordType::IsEx);
                assert_eq!(report.records[0].group, v4("239.1.1.1"));
            }
            _ => panic!("expected report"),
        }
    }

    #[test]
    fn igmpv2_leave_is_to_in() {
        let frame = igmp_frame(
            [224, 0, 0, 2],
            [0x01, 0x00, 0x5e, 0, 0, 2],
            vec![IGMP_V2_LEAVE, 0, 0, 0, 239, 1, 1, 1],
        );
        match parse(&frame).unwrap().body {
            PduBody::Report(report) => {
                assert!(report.is_leave);
                assert_eq!(report.records[0].record_type, RecordType::ToIn);
            }
            _ => panic!("expected report"),
        }
    }

    #[test]
    fn query_versions_by_length_and_code() {
        let all_nodes = [0x01, 0x00, 0x5e, 0, 0, 1];
        let v1 = igmp_frame([224, 0, 0, 1], all_nodes, vec![IGMP_QUERY, 0, 0, 0, 0, 0, 0, 0]);
        let v2 = igmp_frame([224, 0, 0, 1], all_nodes, vec![IGMP_QUERY, 100, 0, 0, 0, 0, 0, 0]);
        let v3 = igmp_frame([224, 0, 0, 1], all_nodes, vec![IGMP_QUERY, 100, 0, 0, 0, 0, 0, 0, 0x0a, 125, 0, 0]);

        let query = |frame: &[u8]| match parse(frame).unwrap().body {
            PduBody::Query(query) => query,
            _ => panic!("expected query"),
        };
        let q1 = query(&v1);
        assert_eq!(q1.version, PduVersion::IgmpV1);
        assert_eq!(q1.max_resp_time_ms, 10_000);
        let q2 = query(&v2);
        assert_eq!(q2.version, PduVersion::IgmpV2);
        assert_eq!(q2.max_resp_time_ms, 10_000);
        let q3 = query(&v3);
        assert_eq!(q3.version, PduVersion::IgmpV3);
        assert!(q3.s_flag);
        assert_eq!(q3.qrv, 2);
        assert_eq!(q3.qqi, 125);
        assert!(q3.is_general());
    }

    #[test]
    fn igmpv3_query_with_zero_max_response_is_discarded() {
        let frame = igmp_frame(
            [224, 0, 0, 1],
            [0x01, 0x00, 0x5e, 0, 0, 1],
            vec![IGMP_QUERY, 0, 0, 0, 0, 0, 0, 0, 0x02, 125, 0, 0],
        );
        assert_eq!(parse(&frame).unwrap_err().action(), RxAction::Discard);
    }

    #[test]
    fn query_with_foreign_dmac_is_discarded() {
        let frame = igmp_frame(
            [239, 1, 1, 1],
            [0x01, 0x00, 0x5e, 0x02, 0x02, 0x02],
            vec![IGMP_QUERY, 100, 0, 0, 239, 1, 1, 1],
        );
        assert_eq!(parse(&frame).unwrap_err().action(), RxAction::Discard);
    }

    #[test]
    fn too_many_sources_floods() {
        let sources: Vec<[u8; 4]> = (0..400u32).map(|i| (0x0a00_0001 + i).to_be_bytes()).collect();
        let frame = v3_report(&[(2, [239, 1, 1, 1], &sources[..])]);
        assert_eq!(parse(&frame).unwrap_err().action(), RxAction::Flood);
    }

    #[test]
    fn invalid_records_are_skipped() {
        let frame = v3_report(&[
            (2, [239, 1, 1, 1], &[]),
            (9, [239, 1, 1, 2], &[]),
            (1, [224, 0, 0, 5], &[]),
            (1, [239, 1, 1, 3], &[[224, 1, 1, 1]]),
            (5, [239, 1, 1, 4], &[[10, 0, 0, 1], [10, 0, 0, 2]]),
        ]);
        match parse(&frame).unwrap().body {
            PduBody::Report(report) => {
                assert_eq!(report.records.len(), 2);
                assert_eq!(report.skipped_records, 3);
                assert_eq!(report.records[1].record_type, RecordType::Allow);
                assert_eq!(report.records[1].sources.len(), 2);
            }
            _ => panic!("expected report"),
        }
    }

    #[test]
    fn no_valid_record_floods() {
        let frame = v3_report(&[(7, [239, 1, 1, 1], &[])]);
        assert_eq!(parse(&frame).unwrap_err().action(), RxAction::Flood);
    }

    #[test]
    fn ttl_and_checksum_errors_discard() {
        let mut frame = igmp_frame(
            [239, 1, 1, 1],
            [0x01, 0x00, 0x5e, 0x01, 0x01, 0x01],
            vec![IGMP_V2_REPORT, 0, 0, 0, 239, 1, 1, 1],
        );
        let last = frame.len() - 1;
        frame[last] ^= 0x01;
        assert_eq!(parse(&frame).unwrap_err().action(), RxAction::Discard);

        let mut frame = igmp_frame(
            [239, 1, 1, 1],
            [0x01, 0x00, 0x5e, 0x01, 0x01, 0x01],
            vec![IGMP_V2_REPORT, 0, 0, 0, 239, 1, 1, 1],
        );
        // TTL 2 with a fixed up header checksum
        frame[14 + 8] = 2;
        frame[14 + 10] = 0;
        frame[14 + 11] = 0;
        let sum = checksum::checksum(&frame[14..38]);
        frame[24..26].copy_from_slice(&sum.to_be_bytes());
        assert_eq!(parse(&frame).unwrap_err().message(), "IPv4 TTL != 1");
    }

    #[test]
    fn fragment_floods() {
        let mut frame = igmp_frame(
            [239, 1, 1, 1],
            [0x01, 0x00, 0x5e, 0x01, 0x01, 0x01],
            vec![IGMP_V2_REPORT, 0, 0, 0, 239, 1, 1, 1],
        );
        frame[14 + 6] = 0x20;
        frame[14 + 10] = 0;
        frame[14 + 11] = 0;
        let sum = checksum::checksum(&frame[14..38]);
        frame[24..26].copy_from_slice(&sum.to_be_bytes());
        assert_eq!(parse(&frame).unwrap_err().action(), RxAction::Flood);
    }

    #[test]
    fn non_ip_is_discarded() {
        let mut frame = vec![0u8; 60];
        frame[12] = 0x08;
        frame[13] = 0x06;
        assert_eq!(parse(&frame).unwrap_err().action(), RxAction::Discard);
        assert_eq!(parse(&frame[..10]).unwrap_err().action(), RxAction::Discard);
    }
}
