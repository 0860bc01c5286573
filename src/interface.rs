//! Linux interface state, polled over rtnetlink.

use parking_lot::RwLock;

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, oneshot};

const POLL_INTERVAL: Duration = Duration::from_secs(2);

pub fn name_to_index(name: &str) -> Result<libc::c_uint, std::io::Error> {
    let name = std::ffi::CString::new(name).map_err(std::io::Error::other)?;
    let index = unsafe { libc::if_nametoindex(name.as_ptr()) };
    if index == 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(index)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
    pub if_index: libc::c_uint,
    pub if_name: String,
    pub mac: Option<[u8; 6]>,

    /// operational state is up
    pub oper_up: bool,
}

#[derive(Debug, Default)]
struct InterfaceState {
    interfaces: RwLock<HashMap<libc::c_uint, Interface>>,
    if_by_name: RwLock<HashMap<String, libc::c_uint>>,
    ipv4_addrs: RwLock<HashMap<libc::c_uint, Vec<Ipv4Addr>>>,
}

/// Aborts the poller when the last manager clone goes away.
#[derive(Debug)]
struct Updater(tokio::task::JoinHandle<()>);

impl Drop for Updater {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[derive(Debug, Clone)]
pub struct InterfaceStateManager {
    state: Arc<InterfaceState>,
    broadcast: broadcast::Sender<()>,
    _updater: Arc<Updater>,
}

impl InterfaceStateManager {
    /// Starts polling and returns once the first snapshot is in.
    pub async fn new() -> Result<Self, std::io::Error> {
        let rtnl = crate::rtnl::RtnetlinkConnection::new().await?;
        let state = Arc::new(InterfaceState::default());
        let broadcast = broadcast::channel(4).0;

        let state_clone = state.clone();
        let broadcast_clone = broadcast.clone();
        let (init_sender, init_receiver) = oneshot::channel();
        let join = tokio::spawn(async move {
            let mut link_manager = rtnl.link();
            let addr_manager = rtnl.address();
            let mut init_sender = Some(init_sender);

            loop {
                let interfaces = match link_manager.get_all().await {
                    Ok(interfaces) => interfaces,
                    Err(e) => {
                        log::error!("failed to get interfaces: {}", e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                };
                let addrs = match addr_manager.get_v4(0).await {
                    Ok(addrs) => addrs,
                    Err(e) => {
                        log::error!("failed to get IPv4 addresses: {}", e);
                        Vec::new()
                    }
                };

                let mut interfaces_map = HashMap::new();
                let mut if_by_name = HashMap::new();
                for interface in interfaces {
                    if_by_name.insert(interface.if_name.clone(), interface.if_index);
                    interfaces_map.insert(interface.if_index, interface);
                }
                let mut ipv4_addrs: HashMap<libc::c_uint, Vec<Ipv4Addr>> = HashMap::new();
                for (if_index, addr) in addrs {
                    ipv4_addrs.entry(if_index).or_default().push(addr);
                }

                let mut changed = false;
                {
                    let mut current = state_clone.interfaces.write();
                    if *current != interfaces_map {
                        *current = interfaces_map;
                        changed = true;
                    }
                }
                *state_clone.if_by_name.write() = if_by_name;
                {
                    let mut current = state_clone.ipv4_addrs.write();
                    if *current != ipv4_addrs {
                        *current = ipv4_addrs;
                        changed = true;
                    }
                }

                if let Some(sender) = init_sender.take() {
                    let _ = sender.send(());
                } else if changed {
                    log::debug!("interface state changed");
                    let _ = broadcast_clone.send(());
                }

                tokio::time::sleep(POLL_INTERVAL).await;
            }
        });
        let updater = Arc::new(Updater(join));

        let _ = init_receiver.await;
        Ok(Self { state, broadcast, _updater: updater })
    }

    /// Fires after a poll that saw a difference.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.broadcast.subscribe()
    }

    pub fn get_index_by_name(&self, name: &str) -> Option<libc::c_uint> {
        self.state.if_by_name.read().get(name).copied()
    }

    pub fn get(&self, if_index: libc::c_uint) -> Option<Interface> {
        self.state.interfaces.read().get(&if_index).cloned()
    }

    pub fn get_by_name(&self, name: &str) -> Option<Interface> {
        let if_index = self.get_index_by_name(name)?;
        self.get(if_index)
    }

    pub fn get_ipv4_addr(&self, if_index: libc::c_uint) -> Option<Ipv4Addr> {
        self.state.ipv4_addrs.read().get(&if_index).and_then(|v| v.first().copied())
    }

    /// First IPv4 address of the interface called `name`.
    pub fn get_ipv4_addr_by_name(&self, name: &str) -> Option<Ipv4Addr> {
        let if_index = self.get_index_by_name(name)?;
        self.get_ipv4_addr(if_index)
    }
}
