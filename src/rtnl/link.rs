use futures::TryStreamExt;

use netlink_packet_route::link::{LinkAttribute, LinkMessage, State};

use crate::interface::Interface;

pub struct LinkManager {
    handle: rtnetlink::LinkHandle,
}

fn interface_from_message(message: &LinkMessage) -> Option<Interface> {
    let if_index = message.header.index;
    if if_index == 0 {
        return None;
    }

    let mut if_name = None;
    let mut mac = None;
    let mut oper_up = false;
    for attr in message.attributes.iter() {
        match attr {
            LinkAttribute::IfName(name) => {
                if_name = Some(name.clone());
            }
            LinkAttribute::Address(addr) => {
                mac = <[u8; 6]>::try_from(addr.as_slice()).ok();
            }
            LinkAttribute::OperState(state) => {
                oper_up = *state == State::Up;
            }
            _ => {}
        }
    }

    Some(Interface {
        if_index,
        if_name: if_name?,
        mac,
        oper_up,
    })
}

impl LinkManager {
    pub(crate) fn new(handle: &super::RtnetlinkConnection) -> Self {
        Self { handle: handle.handle.link() }
    }

    pub async fn get_all(&mut self) -> Result<Vec<Interface>, std::io::Error> {
        let mut interfaces = Vec::new();
        let response = self.handle.get().execute();
        futures::pin_mut!(response);
        while let Some(response) = response.try_next().await.map_err(std::io::Error::other)? {
            if let Some(interface) = interface_from_message(&response) {
                interfaces.push(interface);
            }
        }
        Ok(interfaces)
    }

    pub async fn get_by_name(&mut self, if_name: &str) -> Result<Option<Interface>, std::io::Error> {
        let response = self.handle.get().match_name(if_name.to_owned()).execute();
        futures::pin_mut!(response);
        while let Some(response) = response.try_next().await.map_err(std::io::Error::other)? {
            if let Some(interface) = interface_from_message(&response) {
                return Ok(Some(interface));
            }
        }
        Ok(None)
    }
}
