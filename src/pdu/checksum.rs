//! Internet checksum (RFC 1071).

use std::net::Ipv6Addr;

/// Adds `data` to a running one's complement sum.
pub fn accumulate(mut sum: u32, data: &[u8]) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
        sum = (sum & 0xffff) + (sum >> 16);
    }
    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
        sum = (sum & 0xffff) + (sum >> 16);
    }
    sum
}

pub fn fold(mut sum: u32) -> u16 {
    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    sum as u16
}

/// Checksum field value for `data`, with the checksum field zeroed.
pub fn checksum(data: &[u8]) -> u16 {
    !fold(accumulate(0, data))
}

/// True if `data`, checksum field included, sums to all ones.
pub fn verify(data: &[u8]) -> bool {
    fold(accumulate(0, data)) == 0xffff
}

/// Partial sum of the IPv6 pseudo-header for an upper-layer packet.
pub fn pseudo_header_v6(src: &Ipv6Addr, dst: &Ipv6Addr, length: u32, next_header: u8) -> u32 {
    let mut sum = accumulate(0, &src.octets());
    sum = accumulate(sum, &dst.octets());
    sum = accumulate(sum, &length.to_be_bytes());
    accumulate(sum, &[0, 0, 0, next_header])
}

pub fn checksum_v6(src: &Ipv6Addr, dst: &Ipv6Addr, next_header: u8, data: &[u8]) -> u16 {
    let sum = pseudo_header_v6(src, dst, data.len() as u32, next_header);
    !fold(accumulate(sum, data))
}

pub fn verify_v6(src: &Ipv6Addr, dst: &Ipv6Addr, next_header: u8, data: &[u8]) -> bool {
    let sum = pseudo_header_v6(src, dst, data.len() as u32, next_header);
    fold(accumulate(sum, data)) == 0xffff
}
