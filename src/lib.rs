//! IGMP and MLD snooping for a switch: the protocol engine and the Linux
//! plumbing that feeds it.

pub mod addr;
pub mod config;
pub mod engine;
pub mod hw;
pub mod interface;
pub mod pdu;
pub mod portset;
pub mod profile;
pub mod rtnl;
pub mod socket;
pub mod transmit;
