//! Per-VLAN protocol counters.

use crate::pdu::PduVersion;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IgmpCounters {
    pub v1_report: u64,
    pub v1_query: u64,
    pub v2_report: u64,
    pub v2_leave: u64,
    pub v2_g_query: u64,
    pub v2_gs_query: u64,
    pub v3_report: u64,
    pub v3_g_query: u64,
    pub v3_gs_query: u64,
    pub v3_gss_query: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MldCounters {
    pub v1_report: u64,
    pub v1_done: u64,
    pub v1_g_query: u64,
    pub v1_gs_query: u64,
    pub v2_report: u64,
    pub v2_g_query: u64,
    pub v2_gs_query: u64,
    pub v2_gss_query: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Counters {
    pub igmp: IgmpCounters,
    pub mld: MldCounters,
}

impl Counters {
    /// Counts a query. `group_specific` is false for general queries,
    /// `with_sources` tells group-and-source-specific ones apart.
    pub fn count_query(&mut self, version: PduVersion, group_specific: bool, with_sources: bool) {
        let counter = match version {
            PduVersion::IgmpV1 => &mut self.igmp.v1_query,
            PduVersion::IgmpV2 if group_specific => &mut self.igmp.v2_gs_query,
            PduVersion::IgmpV2 => &mut self.igmp.v2_g_query,
            PduVersion::IgmpV3 if with_sources => &mut self.igmp.v3_gss_query,
            PduVersion::IgmpV3 if group_specific => &mut self.igmp.v3_gs_query,
            PduVersion::IgmpV3 => &mut self.igmp.v3_g_query,
            PduVersion::MldV1 if group_specific => &mut self.mld.v1_gs_query,
            PduVersion::MldV1 => &mut self.mld.v1_g_query,
            PduVersion::MldV2 if with_sources => &mut self.mld.v2_gss_query,
            PduVersion::MldV2 if group_specific => &mut self.mld.v2_gs_query,
            PduVersion::MldV2 => &mut self.mld.v2_g_query,
        };
        *counter += 1;
    }

    pub fn count_report(&mut self, version: PduVersion, is_leave: bool) {
        let counter = match version {
            PduVersion::IgmpV1 => &mut self.igmp.v1_report,
            PduVersion::IgmpV2 if is_leave => &mut self.igmp.v2_leave,
            PduVersion::IgmpV2 => &mut self.igmp.v2_report,
            PduVersion::IgmpV3 => &mut self.igmp.v3_report,
            PduVersion::MldV1 if is_leave => &mut self.mld.v1_done,
            PduVersion::MldV1 => &mut self.mld.v1_report,
            PduVersion::MldV2 => &mut self.mld.v2_report,
        };
        *counter += 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VlanStatistics {
    pub rx_utilized: Counters,
    pub rx_ignored: Counters,
    pub tx: Counters,
    pub rx_errors: u64,
}

impl VlanStatistics {
    /// Queries of any kind sent.
    pub fn tx_query(&self) -> u64 {
        let igmp = &self.tx.igmp;
        let mld = &self.tx.mld;
        igmp.v1_query + igmp.v2_g_query + igmp.v3_g_query + mld.v1_g_query + mld.v2_g_query + self.tx_specific_query()
    }

    /// Group and group-and-source specific queries sent.
    pub fn tx_specific_query(&self) -> u64 {
        let igmp = &self.tx.igmp;
        let mld = &self.tx.mld;
        igmp.v2_gs_query + igmp.v3_gs_query + igmp.v3_gss_query + mld.v1_gs_query + mld.v2_gs_query + mld.v2_gss_query
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queries_are_counted_by_kind() {
        let mut counters = Counters::default();
        counters.count_query(PduVersion::IgmpV3, false, false);
        counters.count_query(PduVersion::IgmpV3, true, false);
        counters.count_query(PduVersion::IgmpV3, true, true);
        counters.count_query(PduVersion::MldV1, true, false);
        assert_eq!(counters.igmp.v3_g_query, 1);
        assert_eq!(counters.igmp.v3_gs_query, 1);
        assert_eq!(counters.igmp.v3_gss_query, 1);
        assert_eq!(counters.mld.v1_gs_query, 1);
        assert_eq!(counters.mld.v1_g_query, 0);

        let statistics = VlanStatistics {
            tx: counters,
            ..VlanStatistics::default()
        };
        assert_eq!(statistics.tx_query(), 4);
        assert_eq!(statistics.tx_specific_query(), 3);
    }

    #[test]
    fn leaves_are_not_reports() {
        let mut counters = Counters::default();
        counters.count_report(PduVersion::IgmpV2, true);
        counters.count_report(PduVersion::MldV1, false);
        assert_eq!(counters.igmp.v2_leave, 1);
        assert_eq!(counters.igmp.v2_report, 0);
        assert_eq!(counters.mld.v1_report, 1);
    }
}
