//! IGMP and MLD frame codec.

pub mod checksum;
pub mod float;

mod parser;
mod writer;

pub use parser::parse;
pub use writer::build_query;
pub use writer::build_report;

use crate::addr::{Family, IpmcAddr};

use std::collections::BTreeSet;

/// Sorted, de-duplicated list of source addresses.
pub type SourceList = BTreeSet<IpmcAddr>;

/// Maximum number of group records in a single IGMPv3/MLDv2 report.
pub const MAX_GROUP_RECORDS: usize = 183;

/// Maximum number of sources in a single group record.
pub const MAX_RECORD_SOURCES: usize = 365;

/// Largest frame handled, without FCS.
pub const MAX_FRAME_LEN: usize = 1514;

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_IPV6: u16 = 0x86dd;
pub const ETHERTYPE_VLAN: u16 = 0x8100;

pub(crate) const IGMP_QUERY: u8 = 0x11;
pub(crate) const IGMP_V1_REPORT: u8 = 0x12;
pub(crate) const IGMP_V2_REPORT: u8 = 0x16;
pub(crate) const IGMP_V2_LEAVE: u8 = 0x17;
pub(crate) const IGMP_V3_REPORT: u8 = 0x22;

pub(crate) const MLD_QUERY: u8 = 0x82;
pub(crate) const MLD_V1_REPORT: u8 = 0x83;
pub(crate) const MLD_V1_DONE: u8 = 0x84;
pub(crate) const MLD_V2_REPORT: u8 = 0x8f;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PduVersion {
    IgmpV1,
    IgmpV2,
    IgmpV3,
    MldV1,
    MldV2,
}

impl PduVersion {
    pub fn family(&self) -> Family {
        match self {
            PduVersion::IgmpV1 | PduVersion::IgmpV2 | PduVersion::IgmpV3 => Family::Ipv4,
            PduVersion::MldV1 | PduVersion::MldV2 => Family::Ipv6,
        }
    }

    /// IGMPv3 and MLDv2 carry source lists.
    pub fn is_source_specific(&self) -> bool {
        matches!(self, PduVersion::IgmpV3 | PduVersion::MldV2)
    }
}

impl std::fmt::Display for PduVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let name = match self {
            PduVersion::IgmpV1 => "IGMPv1",
            PduVersion::IgmpV2 => "IGMPv2",
            PduVersion::IgmpV3 => "IGMPv3",
            PduVersion::MldV1 => "MLDv1",
            PduVersion::MldV2 => "MLDv2",
        };
        write!(f, "{}", name)
    }
}

/// Group record types (RFC 3376 section 4.2.12).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordType {
    IsIn = 1,
    IsEx = 2,
    ToIn = 3,
    ToEx = 4,
    Allow = 5,
    Block = 6,
}

impl RecordType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(RecordType::IsIn),
            2 => Some(RecordType::IsEx),
            3 => Some(RecordType::ToIn),
            4 => Some(RecordType::ToEx),
            5 => Some(RecordType::Allow),
            6 => Some(RecordType::Block),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            RecordType::IsIn => "IS_IN",
            RecordType::IsEx => "IS_EX",
            RecordType::ToIn => "TO_IN",
            RecordType::ToEx => "TO_EX",
            RecordType::Allow => "ALLOW",
            RecordType::Block => "BLOCK",
        }
    }
}

/// Verdict on a received frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxAction {
    /// Well-formed, hand it to the engine.
    Process,

    /// Corrupt or not ours, drop it.
    Discard,

    /// Sound enough to forward, not sound enough to act upon.
    Flood,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupRecord {
    pub record_type: RecordType,
    pub group: IpmcAddr,
    pub sources: SourceList,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub version: PduVersion,
    pub max_resp_time_ms: u32,

    /// zero for a general query
    pub group: IpmcAddr,

    /// suppress router-side processing
    pub s_flag: bool,

    pub qrv: u8,

    /// querier's query interval, seconds
    pub qqi: u32,

    pub sources: SourceList,
}

impl Query {
    pub fn is_general(&self) -> bool {
        self.group.is_zero()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    pub version: PduVersion,

    /// IGMPv2 leave or MLDv1 done
    pub is_leave: bool,

    /// valid records only
    pub records: Vec<GroupRecord>,

    /// records dropped because of an unknown type or a bad address
    pub skipped_records: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PduBody {
    Query(Query),
    Report(Report),
}

/// A decoded IGMP or MLD message with the addressing it arrived with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pdu {
    pub dmac: [u8; 6],
    pub smac: [u8; 6],
    pub sip: IpmcAddr,
    pub dip: IpmcAddr,
    pub body: PduBody,
}

impl Pdu {
    pub fn version(&self) -> PduVersion {
        match &self.body {
            PduBody::Query(query) => query.version,
            PduBody::Report(report) => report.version,
        }
    }

    pub fn family(&self) -> Family {
        self.version().family()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RxError {
    action: RxAction,
    message: &'static str,
}

impl RxError {
    pub fn new(action: RxAction, message: &'static str) -> Self {
        Self {
            action,
            message,
        }
    }

    pub(crate) fn discard(message: &'static str) -> Self {
        Self::new(RxAction::Discard, message)
    }

    pub(crate) fn flood(message: &'static str) -> Self {
        Self::new(RxAction::Flood, message)
    }

    pub fn action(&self) -> RxAction {
        self.action
    }

    pub fn message(&self) -> &'static str {
        self.message
    }
}

impl std::fmt::Display for RxError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.action, self.message)
    }
}

impl std::error::Error for RxError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxError {
    message: &'static str,
}

impl TxError {
    pub fn new(message: &'static str) -> Self {
        Self {
            message,
        }
    }
}

impl std::fmt::Display for TxError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for TxError {}
