use crate::addr::{Family, IpmcAddr};
use crate::portset::{PortNo, PORT_MAX};

use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;

use parking_lot::RwLock;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/mcsnoopd.toml";

#[derive(Debug, Clone)]
pub struct ConfigManager {
    config_path: Arc<PathBuf>,
    config: Arc<RwLock<Option<Config>>>,
    broadcast: tokio::sync::broadcast::Sender<()>,
}

impl ConfigManager {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        let config = None;
        Self {
            config_path: Arc::new(path),
            config: Arc::new(RwLock::new(config)),
            broadcast: tokio::sync::broadcast::channel(1).0,
        }
    }

    fn notify_change(&self) {
        let _ = self.broadcast.send(());
    }

    /// Reads and validates the file. The previous configuration is kept if
    /// either step fails.
    pub async fn load(&self) -> Result<(), std::io::Error> {
        tokio::task::block_in_place(|| {
            let config = Config::from_file(self.config_path.as_ref())?;
            config.validate().map_err(std::io::Error::other)?;
            let result = Some(config);
            let orig = std::mem::replace(&mut *self.config.write(), result.clone());
            if orig != result {
                self.notify_change();
            }
            Ok(())
        })
    }

    pub fn get(&self) -> Option<Config> {
        self.config.read().clone()
    }

    pub fn is_loaded(&self) -> bool {
        self.config.read().is_some()
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<()> {
        self.broadcast.subscribe()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    message: &'static str,
}

impl ConfigError {
    pub fn new(message: &'static str) -> Self {
        Self {
            message,
        }
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ConfigError {}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Config {
    #[serde(default)]
    pub system: SystemConfig,

    #[serde(default)]
    pub ports: Vec<PortEntry>,

    #[serde(default)]
    pub ipmc: OwnerConfig,

    #[serde(default)]
    pub mvr: OwnerConfig,

    #[serde(default)]
    pub vlans: Vec<VlanEntry>,

    #[serde(default)]
    pub profiles: ProfilesConfig,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(file: P) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(file)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, std::io::Error> {
        let config: Config = toml::from_str(content).map_err(std::io::Error::other)?;
        Ok(config)
    }

    /// Number of ports handled by the engine: the configured count, or one
    /// past the highest port index.
    pub fn port_count(&self) -> usize {
        if self.system.port_count != 0 {
            return self.system.port_count;
        }
        self.ports.iter().map(|port| port.index + 1).max().unwrap_or(0)
    }

    pub fn global(&self, owner: Owner, family: Family) -> &GlobalConf {
        let owner_config = match owner {
            Owner::Ipmc => &self.ipmc,
            Owner::Mvr => &self.mvr,
        };
        match family {
            Family::Ipv4 => &owner_config.igmp,
            Family::Ipv6 => &owner_config.mld,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let port_count = self.port_count();
        if port_count > PORT_MAX {
            return Err(ConfigError::new("too many ports"));
        }
        if let Some(mac) = &self.system.mac {
            if parse_mac(mac).is_none() {
                return Err(ConfigError::new("invalid system MAC address"));
            }
        }
        if self.system.src_per_grp_cnt_max == 0 {
            return Err(ConfigError::new("src_per_grp_cnt_max must be at least 1"));
        }

        let mut indexes = BTreeSet::new();
        for port in &self.ports {
            if port.index >= port_count {
                return Err(ConfigError::new("port index beyond port count"));
            }
            if !indexes.insert(port.index) {
                return Err(ConfigError::new("duplicate port index"));
            }
            if port.pvid == 0 || port.pvid > 4095 {
                return Err(ConfigError::new("port PVID out of range"));
            }
            port.igmp.validate()?;
            port.mld.validate()?;
        }

        for owner in [Owner::Ipmc, Owner::Mvr] {
            for family in [Family::Ipv4, Family::Ipv6] {
                if let Some(prefix) = &self.global(owner, family).ssm_prefix {
                    if prefix.addr.family() != family {
                        return Err(ConfigError::new("SSM prefix of the wrong address family"));
                    }
                }
            }
        }

        let mut vlan_keys = BTreeSet::new();
        for vlan in &self.vlans {
            if vlan.vid == 0 || vlan.vid > 4095 {
                return Err(ConfigError::new("VLAN ID out of range"));
            }
            if !vlan_keys.insert((vlan.owner, vlan.family, vlan.vid)) {
                return Err(ConfigError::new("duplicate VLAN instance"));
            }
            if vlan.ports.iter().any(|port| *port >= port_count) {
                return Err(ConfigError::new("VLAN member port beyond port count"));
            }
            vlan.conf.validate(vlan.family)?;
        }

        self.profiles.validate()
    }
}

/// Parses `aa:bb:cc:dd:ee:ff`.
pub fn parse_mac(s: &str) -> Option<[u8; 6]> {
    let mut mac = [0u8; 6];
    let mut parts = s.split(':');
    for byte in mac.iter_mut() {
        *byte = u8::from_str_radix(parts.next()?, 16).ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(mac)
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Owner {
    /// IGMP/MLD snooping
    Ipmc,

    /// Multicast VLAN registration
    Mvr,
}

impl Default for Owner {
    fn default() -> Self {
        Owner::Ipmc
    }
}

impl std::fmt::Display for Owner {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Owner::Ipmc => write!(f, "IPMC"),
            Owner::Mvr => write!(f, "MVR"),
        }
    }
}

/// Host/router compatibility mode (RFC 3376 section 7, RFC 3810 section 8).
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Compatibility {
    /// follow what is seen on the wire
    Auto,

    /// IGMPv1
    Old,

    /// IGMPv2 or MLDv1
    Gen,

    /// IGMPv3 or MLDv2
    Sfm,
}

impl Default for Compatibility {
    fn default() -> Self {
        Compatibility::Auto
    }
}

impl Compatibility {
    /// Position in the OLD < GEN < SFM ordering. AUTO ranks with SFM.
    pub fn rank(&self) -> u8 {
        match self {
            Compatibility::Old => 1,
            Compatibility::Gen => 2,
            Compatibility::Sfm | Compatibility::Auto => 3,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PortRole {
    None,
    Source,
    Receiver,
}

impl Default for PortRole {
    fn default() -> Self {
        PortRole::None
    }
}

/// IP prefix written as `232.0.0.0/8`.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(try_from = "String", into = "String")]
pub struct Prefix {
    pub addr: IpmcAddr,
    pub len: u8,
}

impl Prefix {
    pub fn default_ssm(family: Family) -> Self {
        match family {
            Family::Ipv4 => Prefix {
                addr: IpmcAddr::V4(Ipv4Addr::new(232, 0, 0, 0)),
                len: 8,
            },
            Family::Ipv6 => Prefix {
                addr: IpmcAddr::V6(std::net::Ipv6Addr::new(0xff3e, 0, 0, 0, 0, 0, 0, 0)),
                len: 32,
            },
        }
    }

    pub fn contains(&self, addr: &IpmcAddr) -> bool {
        addr.prefix_matches(&self.addr, self.len)
    }
}

impl TryFrom<String> for Prefix {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let (addr, len) = value.split_once('/').ok_or(ConfigError::new("prefix without length"))?;
        let addr: IpmcAddr = addr.parse().map_err(|_| ConfigError::new("invalid prefix address"))?;
        let len: u8 = len.parse().map_err(|_| ConfigError::new("invalid prefix length"))?;
        let max = if addr.is_ipv4() { 32 } else { 128 };
        if len > max {
            return Err(ConfigError::new("prefix length out of range"));
        }
        Ok(Prefix {
            addr,
            len,
        })
    }
}

impl From<Prefix> for String {
    fn from(prefix: Prefix) -> Self {
        format!("{}/{}", prefix.addr, prefix.len)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct SystemConfig {
    /// source MAC of generated frames, `aa:bb:cc:dd:ee:ff`
    pub mac: Option<String>,

    /// host interface on the switched segment. Its MAC is used when `mac`
    /// is unset, its IPv4 address is the querier address of last resort,
    /// and `<interface>.<vid>` supplies the address of each VLAN.
    pub interface: Option<String>,

    /// 0 derives the count from the port list
    pub port_count: usize,

    pub grp_cnt_max: usize,
    pub src_per_grp_cnt_max: usize,

    /// source-specific forwarding entries are available for IPv4
    pub tcam_ipv4: bool,

    /// source-specific forwarding entries are available for IPv6
    pub tcam_ipv6: bool,

    /// queries forwarded per suppression window
    pub vlan_cnt_max: u32,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            mac: None,
            interface: None,
            port_count: 0,
            grp_cnt_max: 1024,
            src_per_grp_cnt_max: 8,
            tcam_ipv4: true,
            tcam_ipv6: true,
            vlan_cnt_max: 32,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct PortEntry {
    /// Linux interface name
    pub name: String,

    pub index: PortNo,

    #[serde(default = "default_pvid")]
    pub pvid: u16,

    #[serde(default)]
    pub igmp: PortConf,

    #[serde(default)]
    pub mld: PortConf,
}

fn default_pvid() -> u16 {
    1
}

impl PortEntry {
    pub fn conf(&self, family: Family) -> &PortConf {
        match family {
            Family::Ipv4 => &self.igmp,
            Family::Ipv6 => &self.mld,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
#[serde(default)]
pub struct PortConf {
    /// static router port
    pub router: bool,

    pub fast_leave: bool,

    /// maximum number of groups joined on the port, 0 is unlimited
    pub grp_cnt_max: u32,

    /// filtering profile, empty for none
    pub profile: String,
}

impl PortConf {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.grp_cnt_max > 10 {
            return Err(ConfigError::new("port grp_cnt_max out of range"));
        }
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
#[serde(default)]
pub struct OwnerConfig {
    pub igmp: GlobalConf,
    pub mld: GlobalConf,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct GlobalConf {
    pub admin_active: bool,
    pub unregistered_flooding: bool,
    pub proxy: bool,
    pub leave_proxy: bool,

    /// defaults to 232.0.0.0/8 or ff3e::/32
    pub ssm_prefix: Option<Prefix>,
}

impl Default for GlobalConf {
    fn default() -> Self {
        Self {
            admin_active: false,
            unregistered_flooding: true,
            proxy: false,
            leave_proxy: false,
            ssm_prefix: None,
        }
    }
}

impl GlobalConf {
    pub fn ssm_prefix(&self, family: Family) -> Prefix {
        self.ssm_prefix.unwrap_or_else(|| Prefix::default_ssm(family))
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct VlanEntry {
    #[serde(default)]
    pub owner: Owner,

    pub family: Family,
    pub vid: u16,

    /// member ports
    #[serde(default)]
    pub ports: Vec<PortNo>,

    #[serde(flatten)]
    pub conf: VlanConf,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct VlanConf {
    pub admin_active: bool,
    pub name: String,
    pub querier_enable: bool,

    /// IGMP only; unset uses the VLAN interface address
    pub querier_address: Option<Ipv4Addr>,

    pub compatibility: Compatibility,

    /// robustness variable
    pub rv: u32,

    /// query interval, seconds
    pub qi: u32,

    /// query response interval, tenths of a second
    pub qri: u32,

    /// last member query interval, tenths of a second
    pub lmqi: u32,

    /// unsolicited report interval, seconds
    pub uri: u32,

    pub pcp: u8,

    /// MVR: send queries tagged on receiver ports
    pub tx_tagged: bool,

    /// MVR: reports are not accepted on source ports
    pub compatible_mode: bool,

    /// MVR: profile deciding which groups belong to this VLAN
    pub channel_profile: String,

    /// MVR
    pub source_ports: Vec<PortNo>,

    /// MVR
    pub receiver_ports: Vec<PortNo>,
}

impl Default for VlanConf {
    fn default() -> Self {
        Self {
            admin_active: true,
            name: String::new(),
            querier_enable: false,
            querier_address: None,
            compatibility: Compatibility::Auto,
            rv: 2,
            qi: 125,
            qri: 100,
            lmqi: 10,
            uri: 1,
            pcp: 0,
            tx_tagged: true,
            compatible_mode: false,
            channel_profile: String::new(),
            source_ports: Vec::new(),
            receiver_ports: Vec::new(),
        }
    }
}

impl VlanConf {
    pub fn validate(&self, family: Family) -> Result<(), ConfigError> {
        if self.rv < 1 || self.rv > 255 {
            return Err(ConfigError::new("rv out of range"));
        }
        if self.qi < 1 || self.qi > 31744 {
            return Err(ConfigError::new("qi out of range"));
        }
        if self.qri > 31744 || self.qri >= self.qi * 10 {
            return Err(ConfigError::new("qri must be below qi"));
        }
        if self.lmqi > 31744 {
            return Err(ConfigError::new("lmqi out of range"));
        }
        if self.uri < 1 || self.uri > 31744 {
            return Err(ConfigError::new("uri out of range"));
        }
        if self.pcp > 7 {
            return Err(ConfigError::new("pcp out of range"));
        }
        if family == Family::Ipv6 && self.compatibility == Compatibility::Old {
            return Err(ConfigError::new("MLD has no IGMPv1 compatibility"));
        }
        if self.source_ports.iter().any(|port| self.receiver_ports.contains(port)) {
            return Err(ConfigError::new("port is both source and receiver"));
        }
        Ok(())
    }

    pub fn port_role(&self, port: PortNo) -> PortRole {
        if self.source_ports.contains(&port) {
            PortRole::Source
        } else if self.receiver_ports.contains(&port) {
            PortRole::Receiver
        } else {
            PortRole::None
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
#[serde(default)]
pub struct ProfilesConfig {
    pub enable: bool,
    pub ranges: Vec<RangeConfig>,
    pub entries: Vec<ProfileConfig>,
}

impl ProfilesConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        let mut names = BTreeSet::new();
        for range in &self.ranges {
            if !names.insert(range.name.as_str()) {
                return Err(ConfigError::new("duplicate range name"));
            }
            if range.start.is_ipv4() != range.end.is_ipv4() {
                return Err(ConfigError::new("range start and end in different families"));
            }
            if IpmcAddr::from(range.start) > IpmcAddr::from(range.end) {
                return Err(ConfigError::new("range start above range end"));
            }
        }

        let mut profiles = BTreeSet::new();
        for profile in &self.entries {
            if profile.name.is_empty() {
                return Err(ConfigError::new("empty profile name"));
            }
            if !profiles.insert(profile.name.as_str()) {
                return Err(ConfigError::new("duplicate profile name"));
            }
            for rule in &profile.rules {
                if !names.contains(rule.range.as_str()) {
                    return Err(ConfigError::new("profile rule references an unknown range"));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct RangeConfig {
    pub name: String,
    pub start: IpAddr,
    pub end: IpAddr,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ProfileConfig {
    pub name: String,

    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct RuleConfig {
    pub range: String,

    #[serde(default)]
    pub deny: bool,

    #[serde(default)]
    pub log: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[system]
mac = "02:00:00:00:00:01"
grp_cnt_max = 16

[[ports]]
name = "eth0"
index = 0
igmp = { router = true }

[[ports]]
name = "eth1"
index = 1
igmp = { fast_leave = true, grp_cnt_max = 2, profile = "tv" }

[ipmc.igmp]
admin_active = true
proxy = true
ssm_prefix = "232.0.0.0/8"

[[vlans]]
family = "igmp"
vid = 10
ports = [0, 1]
querier_enable = true
qi = 60

[[vlans]]
owner = "mvr"
family = "mld"
vid = 20
ports = [0, 1]
channel_profile = "tv"
source_ports = [0]
receiver_ports = [1]

[profiles]
enable = true

[[profiles.ranges]]
name = "tv-range"
start = "239.1.0.0"
end = "239.1.255.255"

[[profiles.entries]]
name = "tv"
rules = [{ range = "tv-range" }]
"#;

    #[test]
    fn parses_sample() {
        let config = Config::from_toml(SAMPLE).unwrap();
        config.validate().unwrap();
        assert_eq!(config.port_count(), 2);
        assert_eq!(config.system.src_per_grp_cnt_max, 8);
        assert!(config.ports[0].igmp.router);
        assert_eq!(config.ports[1].pvid, 1);
        assert!(config.global(Owner::Ipmc, Family::Ipv4).proxy);
        assert!(config.global(Owner::Ipmc, Family::Ipv4).unregistered_flooding);
        assert!(!config.global(Owner::Mvr, Family::Ipv6).admin_active);

        let vlan = &config.vlans[0];
        assert_eq!(vlan.owner, Owner::Ipmc);
        assert_eq!(vlan.conf.qi, 60);
        assert_eq!(vlan.conf.rv, 2);
        assert_eq!(config.vlans[1].conf.port_role(0), PortRole::Source);
        assert_eq!(config.vlans[1].conf.port_role(1), PortRole::Receiver);
        assert_eq!(config.vlans[1].conf.port_role(2), PortRole::None);
        assert_eq!(config.profiles.entries[0].rules[0].range, "tv-range");
    }

    #[test]
    fn rejects_bad_values() {
        let mut config = Config::from_toml(SAMPLE).unwrap();
        config.vlans[0].conf.qri = 600;
        assert!(config.validate().is_err());

        let mut config = Config::from_toml(SAMPLE).unwrap();
        config.profiles.entries[0].rules[0].range = "missing".to_string();
        assert!(config.validate().is_err());

        assert!(Config::from_toml("[ipmc.igmp]\nssm_prefix = \"232.0.0.0\"\n").is_err());
    }

    #[test]
    fn prefix_and_mac() {
        let prefix = Prefix::try_from("ff3e::/32".to_string()).unwrap();
        assert!(prefix.contains(&"ff3e::1234".parse().unwrap()));
        assert!(!prefix.contains(&"ff3f::1".parse().unwrap()));
        assert!(Prefix::default_ssm(Family::Ipv4).contains(&"232.1.2.3".parse().unwrap()));
        assert_eq!(parse_mac("02:00:00:00:00:0a"), Some([2, 0, 0, 0, 0, 10]));
        assert_eq!(parse_mac("02:00:00:00:00"), None);
    }
}
