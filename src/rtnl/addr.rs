use futures::TryStreamExt;

pub struct AddressManager {
    handle: rtnetlink::AddressHandle,
}

impl AddressManager {
    pub(crate) fn new(handle: &super::RtnetlinkConnection) -> Self {
        Self { handle: handle.handle.address() }
    }

    /// IPv4 addresses of `if_index`, or of every interface when it is 0,
    /// keyed by interface index.
    pub async fn get_v4(&self, if_index: std::ffi::c_uint) -> Result<Vec<(std::ffi::c_uint, std::net::Ipv4Addr)>, std::io::Error> {
        let mut addrs = Vec::new();
        let mut req = self.handle.get();
        if if_index != 0 {
            req = req.set_link_index_filter(if_index);
        }
        let response = req.execute();

        futures::pin_mut!(response);
        while let Some(response) = response.try_next().await.map_err(std::io::Error::other)? {
            if response.header.family != netlink_packet_route::AddressFamily::Inet {
                continue;
            }
            for attr in response.attributes.iter() {
                if let netlink_packet_route::address::AddressAttribute::Address(std::net::IpAddr::V4(addr)) = attr {
                    log::trace!("found address {} on {}", addr, response.header.index);
                    addrs.push((response.header.index, *addr));
                }
            }
        }
        Ok(addrs)
    }
}
