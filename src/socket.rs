//! Raw link-layer sockets, one per switch port.

use crate::pdu::{ETHERTYPE_IPV4, ETHERTYPE_IPV6, ETHERTYPE_VLAN};
use crate::portset::{PortNo, PortSet};
use crate::transmit::{Tagging, Transmit};

use tokio::io::unix::AsyncFd;
use tokio::io::Interest;

use std::ffi::{c_int, c_uint};
use std::os::fd::AsRawFd;
use std::sync::Arc;

const IPPROTO_IGMP: u8 = 2;
const IPV6_HOP_BY_HOP: u8 = 0;
const IPV6_ICMP: u8 = 58;

/// Whether `frame` may carry IGMP or MLD. Everything else seen on the
/// socket is bridged by the kernel and none of our business.
pub fn is_membership_frame(frame: &[u8]) -> bool {
    if frame.len() < 14 {
        return false;
    }
    let ethertype = u16::from_be_bytes([frame[12], frame[13]]);
    let l3 = &frame[14..];
    match ethertype {
        ETHERTYPE_IPV4 => l3.len() > 9 && l3[9] == IPPROTO_IGMP,
        ETHERTYPE_IPV6 => match l3.get(6) {
            Some(&IPV6_HOP_BY_HOP) => true,
            Some(&IPV6_ICMP) => matches!(l3.get(40), Some(130..=132 | 143)),
            _ => false,
        },
        _ => false,
    }
}

/// Removes an 802.1Q tag. Returns the VID and the untagged frame.
pub fn strip_tag(frame: &[u8]) -> Option<(u16, Vec<u8>)> {
    if frame.len() < 18 || u16::from_be_bytes([frame[12], frame[13]]) != ETHERTYPE_VLAN {
        return None;
    }
    let vid = u16::from_be_bytes([frame[14], frame[15]]) & 0x0fff;
    let mut untagged = Vec::with_capacity(frame.len() - 4);
    untagged.extend_from_slice(&frame[..12]);
    untagged.extend_from_slice(&frame[16..]);
    Some((vid, untagged))
}

/// Inserts an 802.1Q tag after the MAC addresses.
pub fn insert_tag(frame: &[u8], vid: u16, pcp: u8) -> Vec<u8> {
    if frame.len() < 12 {
        return frame.to_vec();
    }
    let tci = ((pcp as u16 & 0x7) << 13) | (vid & 0x0fff);
    let mut tagged = Vec::with_capacity(frame.len() + 4);
    tagged.extend_from_slice(&frame[..12]);
    tagged.extend_from_slice(&ETHERTYPE_VLAN.to_be_bytes());
    tagged.extend_from_slice(&tci.to_be_bytes());
    tagged.extend_from_slice(&frame[12..]);
    tagged
}

/// A received frame. `vid` is set when the kernel took the tag off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecvInfo {
    pub len: usize,
    pub vid: Option<u16>,

    /// our own transmission, looped back
    pub outgoing: bool,
}

#[derive(Debug)]
pub struct RawPacketSocket {
    socket: c_int,
    if_index: c_uint,
}

impl RawPacketSocket {
    /// Opens an AF_PACKET socket bound to `if_index`.
    pub fn new(if_index: c_uint) -> Result<Self, std::io::Error> {
        let protocol = (libc::ETH_P_ALL as u16).to_be();
        let socket = unsafe { libc::socket(libc::AF_PACKET, libc::SOCK_RAW, protocol as c_int) };
        if socket < 0 {
            return Err(std::io::Error::last_os_error());
        }
        let socket = Self { socket, if_index };

        let mut addr: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
        addr.sll_family = libc::AF_PACKET as libc::c_ushort;
        addr.sll_protocol = protocol;
        addr.sll_ifindex = if_index as c_int;
        let code = unsafe {
            libc::bind(
                socket.socket,
                &addr as *const _ as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if code < 0 {
            return Err(std::io::Error::last_os_error());
        }

        let on: c_int = 1;
        unsafe { socket.setsockopt(libc::SOL_PACKET, libc::PACKET_AUXDATA, &on)? };
        Ok(socket)
    }

    pub fn if_index(&self) -> c_uint {
        self.if_index
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<(), std::io::Error> {
        let flags = unsafe { libc::fcntl(self.socket, libc::F_GETFL, 0) };
        if flags < 0 {
            return Err(std::io::Error::last_os_error());
        }

        let oldflags = flags;

        let flags = if nonblocking {
            flags | libc::O_NONBLOCK
        } else {
            flags & !libc::O_NONBLOCK
        };

        if flags == oldflags {
            return Ok(());
        }

        let code = unsafe { libc::fcntl(self.socket, libc::F_SETFL, flags) };
        if code < 0 {
            return Err(std::io::Error::last_os_error());
        }

        Ok(())
    }

    unsafe fn setsockopt<T: Sized>(&self, level: c_int, optname: c_int, optval: &T) -> Result<(), std::io::Error> {
        let code = unsafe {
            libc::setsockopt(self.socket, level, optname, optval as *const _ as *const libc::c_void, std::mem::size_of::<T>() as libc::socklen_t)
        };
        if code < 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }

    /// Receives all multicast on the interface, not just the groups the
    /// host itself joined.
    pub fn set_all_multicast(&self) -> Result<(), std::io::Error> {
        let mut mreq: libc::packet_mreq = unsafe { std::mem::zeroed() };
        mreq.mr_ifindex = self.if_index as c_int;
        mreq.mr_type = libc::PACKET_MR_ALLMULTI as libc::c_ushort;
        unsafe { self.setsockopt(libc::SOL_PACKET, libc::PACKET_ADD_MEMBERSHIP, &mreq) }
    }

    pub fn recv(&self, buf: &mut [u8]) -> Result<RecvInfo, std::io::Error> {
        let mut info = RecvInfo::default();
        unsafe {
            let mut cmsg = [0u8; 256];
            let mut src: libc::sockaddr_ll = std::mem::zeroed();
            let mut msg: libc::msghdr = std::mem::zeroed();
            msg.msg_name = &mut src as *mut _ as *mut libc::c_void;
            msg.msg_namelen = std::mem::size_of_val(&src) as libc::socklen_t;

            let mut iov = [std::io::IoSliceMut::new(buf)];
            msg.msg_iov = iov.as_mut_ptr() as *mut libc::iovec;
            msg.msg_iovlen = iov.len();

            msg.msg_control = cmsg.as_mut_ptr() as *mut libc::c_void;
            msg.msg_controllen = cmsg.len();

            let code = libc::recvmsg(self.socket, &mut msg, 0);
            if code < 0 {
                return Err(std::io::Error::last_os_error());
            }
            info.len = code as usize;
            info.outgoing = src.sll_pkttype == libc::PACKET_OUTGOING as libc::c_uchar;

            let mut chdr = libc::CMSG_FIRSTHDR(&msg).as_ref();
            while let Some(hdr) = chdr {
                if hdr.cmsg_level == libc::SOL_PACKET && hdr.cmsg_type == libc::PACKET_AUXDATA {
                    let aux = std::ptr::read_unaligned(libc::CMSG_DATA(hdr) as *const libc::tpacket_auxdata);
                    if aux.tp_status & libc::TP_STATUS_VLAN_VALID != 0 {
                        info.vid = Some(aux.tp_vlan_tci & 0x0fff);
                    }
                }
                chdr = libc::CMSG_NXTHDR(&msg, hdr).as_ref();
            }
        }
        Ok(info)
    }

    pub fn send(&self, frame: &[u8]) -> Result<(), std::io::Error> {
        let code = unsafe { libc::send(self.socket, frame.as_ptr() as *const libc::c_void, frame.len(), 0) };
        if code < 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn into_async(self) -> Result<AsyncPacketSocket, std::io::Error> {
        AsyncPacketSocket::new(self)
    }
}

impl Drop for RawPacketSocket {
    fn drop(&mut self) {
        if self.socket < 0 {
            return;
        }
        unsafe { libc::close(self.socket) };
    }
}

impl AsRawFd for RawPacketSocket {
    fn as_raw_fd(&self) -> std::os::unix::io::RawFd {
        self.socket
    }
}

#[derive(Debug, Clone)]
pub struct AsyncPacketSocket {
    inner: Arc<AsyncFd<RawPacketSocket>>,
}

impl AsyncPacketSocket {
    pub(crate) fn new(socket: RawPacketSocket) -> Result<Self, std::io::Error> {
        socket.set_nonblocking(true)?;
        // SAFETY: the socket owns its descriptor and closes it only on drop.
        let inner = unsafe { AsyncFd::register_with_interest(socket, Interest::READABLE)? };
        let inner = Arc::new(inner);
        Ok(Self { inner })
    }

    pub async fn recv(&self, buf: &mut [u8]) -> Result<RecvInfo, std::io::Error> {
        loop {
            let mut guard = self.inner.readable().await?;
            match guard.try_io(|inner| inner.get_ref().recv(buf)) {
                Ok(res) => {
                    return res;
                }

                Err(_) => continue,
            }
        }
    }

    /// Sends without waiting. A full socket buffer is reported as
    /// `WouldBlock`.
    pub fn try_send(&self, frame: &[u8]) -> Result<(), std::io::Error> {
        self.inner.get_ref().send(frame)
    }
}

#[derive(Debug, Clone)]
pub struct PortSocket {
    pub socket: AsyncPacketSocket,

    /// VLAN of untagged frames
    pub pvid: u16,
}

/// Transmits engine frames on the port sockets, tagged unless the frame
/// belongs to the port's PVID or untagging is forced.
#[derive(Debug, Clone, Default)]
pub struct SocketTransmit {
    ports: Vec<Option<PortSocket>>,
}

impl SocketTransmit {
    pub fn new(port_count: usize) -> Self {
        Self {
            ports: vec![None; port_count],
        }
    }

    pub fn set_port(&mut self, port: PortNo, socket: Option<PortSocket>) {
        if let Some(slot) = self.ports.get_mut(port) {
            *slot = socket;
        }
    }
}

impl Transmit for SocketTransmit {
    fn transmit(&mut self, frame: &[u8], ports: PortSet, vid: u16, tagging: Tagging) -> std::io::Result<()> {
        let mut result = Ok(());
        for port in ports.iter() {
            let Some(Some(port_socket)) = self.ports.get(port) else {
                continue;
            };
            let sent = if tagging.force_untag || vid == port_socket.pvid {
                port_socket.socket.try_send(frame)
            } else {
                port_socket.socket.try_send(&insert_tag(frame, vid, tagging.pcp))
            };
            if let Err(e) = sent {
                log::debug!("port {}: send failed: {}", port, e);
                result = Err(e);
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn untagged() -> Vec<u8> {
        let mut frame = vec![0u8; 64];
        frame[..6].copy_from_slice(&[0x01, 0x00, 0x5e, 0x01, 0x01, 0x01]);
        frame[6..12].copy_from_slice(&[0x02, 0, 0, 0, 0, 0x05]);
        frame[12..14].copy_from_slice(&ETHERTYPE_IPV4.to_be_bytes());
        frame[14] = 0x46;
        frame[23] = IPPROTO_IGMP;
        frame
    }

    #[test]
    fn tag_insert_and_strip() {
        let frame = untagged();
        let tagged = insert_tag(&frame, 100, 5);
        assert_eq!(tagged.len(), frame.len() + 4);
        assert_eq!(&tagged[12..16], &[0x81, 0x00, 0xa0, 0x64]);

        let (vid, stripped) = strip_tag(&tagged).unwrap();
        assert_eq!(vid, 100);
        assert_eq!(stripped, frame);
        assert!(strip_tag(&frame).is_none());
    }

    #[test]
    fn only_membership_frames_pass() {
        let mut frame = untagged();
        assert!(is_membership_frame(&frame));

        frame[23] = 17;
        assert!(!is_membership_frame(&frame));

        let mut v6 = vec![0u8; 80];
        v6[12..14].copy_from_slice(&ETHERTYPE_IPV6.to_be_bytes());
        v6[20] = IPV6_ICMP;
        v6[54] = 143;
        assert!(is_membership_frame(&v6));
        v6[54] = 128;
        assert!(!is_membership_frame(&v6));
        v6[20] = IPV6_HOP_BY_HOP;
        assert!(is_membership_frame(&v6));
    }
}
