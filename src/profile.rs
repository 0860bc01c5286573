//! Group filtering profiles.

use crate::addr::IpmcAddr;
use crate::config::{Owner, ProfilesConfig};
use crate::portset::PortNo;

use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Range {
    start: IpmcAddr,
    end: IpmcAddr,
}

impl Range {
    fn contains(&self, addr: &IpmcAddr) -> bool {
        if self.start.family() != addr.family() {
            return false;
        }
        self.start <= *addr && *addr <= self.end
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Rule {
    range: String,
    deny: bool,
    log: bool,
}

/// Ingress details used when a matching rule asks for logging.
#[derive(Debug, Clone, Copy)]
pub struct PermitQuery<'a> {
    pub profile: &'a str,
    pub group: &'a IpmcAddr,
    pub source: &'a IpmcAddr,
    pub vid: u16,
    pub port: PortNo,
}

/// Compiled profile configuration.
#[derive(Debug, Clone, Default)]
pub struct ProfileTable {
    enable: bool,
    ranges: HashMap<String, Range>,
    profiles: HashMap<String, Vec<Rule>>,
}

impl ProfileTable {
    pub fn from_config(config: &ProfilesConfig) -> Self {
        let ranges = config.ranges.iter().map(|range| {
            (range.name.clone(), Range {
                start: range.start.into(),
                end: range.end.into(),
            })
        }).collect();

        let profiles = config.entries.iter().map(|profile| {
            let rules = profile.rules.iter().map(|rule| Rule {
                range: rule.range.clone(),
                deny: rule.deny,
                log: rule.log,
            }).collect();
            (profile.name.clone(), rules)
        }).collect();

        Self {
            enable: config.enable,
            ranges,
            profiles,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enable
    }

    pub fn contains(&self, name: &str) -> bool {
        self.profiles.contains_key(name)
    }

    /// Decides whether `query.group` may be joined.
    ///
    /// MVR needs an attached profile, IPMC does not. The first rule whose
    /// range holds the group decides. No match denies.
    pub fn permit(&self, owner: Owner, query: &PermitQuery, log: bool) -> bool {
        if !self.enable || query.profile.is_empty() {
            return owner == Owner::Ipmc;
        }

        let rules = match self.profiles.get(query.profile) {
            Some(rules) => rules,
            None => return false,
        };

        for rule in rules {
            let range = match self.ranges.get(&rule.range) {
                Some(range) => range,
                None => return false,
            };

            if !range.contains(query.group) {
                continue;
            }

            let permit = !rule.deny;
            if log && rule.log {
                log::info!(
                    "{}: group {} source {} vid {} port {}: {} by profile {} range {}",
                    query.group.family().protocol_name(),
                    query.group,
                    query.source,
                    query.vid,
                    query.port,
                    if permit { "permitted" } else { "denied" },
                    query.profile,
                    rule.range,
                );
            }
            return permit;
        }

        false
    }
}
