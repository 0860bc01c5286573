//! Group and source filter state (RFC 3376 section 6.4, RFC 3810 section 7.4).

use super::types::{FilterMode, GroupEntry, GroupKey, QuerierState, Seconds, SourceEntry};
use super::Engine;

use crate::config::Compatibility;
use crate::pdu::{RecordType, SourceList};
use crate::portset::{PortNo, PortSet};

/// Result of applying one group record to one port.
///
/// `x` is the include (requested) list and `y` the exclude list of the port
/// after the record. Sources in `to` get their timer set to `src_timeout`,
/// sources in `q` are queried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub mode: FilterMode,
    pub x: SourceList,
    pub y: SourceList,
    pub to: SourceList,
    pub src_timeout: Seconds,
    pub q: SourceList,

    /// send a group-specific query
    pub group_query: bool,

    /// new group timer, if it changes
    pub grp_timeout: Option<Seconds>,
}

/// Computes the state table row for `record_type` received while the port is
/// in `mode` with include list `x` and exclude list `y`.
///
/// `gmi` and `grp_timeout` are absolute. `fast_leave` makes a leave drop
/// the port at once.
#[allow(clippy::too_many_arguments)]
pub fn transition(
    mode: FilterMode,
    x: &SourceList,
    y: &SourceList,
    record_type: RecordType,
    a: &SourceList,
    fast_leave: bool,
    gmi: Seconds,
    grp_timeout: Seconds,
) -> Transition {
    let mut t = Transition {
        mode,
        x: x.clone(),
        y: SourceList::new(),
        to: SourceList::new(),
        src_timeout: 0,
        q: SourceList::new(),
        group_query: false,
        grp_timeout: None,
    };

    match (mode, record_type) {
        (FilterMode::Include, RecordType::IsIn | RecordType::Allow) => {
            // INCLUDE (X+A), (A) = GMI
            t.x = x | a;
            t.to = a.clone();
            t.src_timeout = gmi;
        }
        (FilterMode::Include, RecordType::IsEx) => {
            // EXCLUDE (X*A, A-X), (A-X) = 0, group timer = GMI
            t.mode = FilterMode::Exclude;
            t.x = x & a;
            t.y = a - x;
            t.to = a - x;
            t.grp_timeout = Some(gmi);
        }
        (FilterMode::Include, RecordType::Block) => {
            // INCLUDE (X), Q(G, X*A)
            t.q = x & a;
        }
        (FilterMode::Include, RecordType::ToEx) => {
            // EXCLUDE (X*A, A-X), (A-X) = 0, Q(G, X*A), group timer = GMI
            t.mode = FilterMode::Exclude;
            t.x = x & a;
            t.y = a - x;
            t.to = a - x;
            t.q = x & a;
            t.grp_timeout = Some(gmi);
        }
        (FilterMode::Include, RecordType::ToIn) => {
            if fast_leave {
                t.x.clear();
            } else {
                // INCLUDE (X+A), (A) = GMI, Q(G, X-A)
                t.x = x | a;
                t.y = y - a;
                t.to = a.clone();
                t.src_timeout = gmi;
                t.q = x - a;
            }
        }
        (FilterMode::Exclude, RecordType::IsIn | RecordType::Allow) => {
            // EXCLUDE (X+A, Y-A), (A) = GMI
            t.x = x | a;
            t.y = y - a;
            t.to = a.clone();
            t.src_timeout = gmi;
        }
        (FilterMode::Exclude, RecordType::IsEx) => {
            // EXCLUDE (A-Y, Y*A), (A-X-Y) = GMI, group timer = GMI
            t.x = a - y;
            t.y = y & a;
            t.to = &(a - x) - y;
            t.src_timeout = gmi;
            t.grp_timeout = Some(gmi);
        }
        (FilterMode::Exclude, RecordType::Block) => {
            // EXCLUDE (X+(A-Y), Y), (A-X-Y) = group timer, Q(G, A-Y)
            t.x = x | &(a - y);
            t.y = y.clone();
            t.to = &(a - x) - y;
            t.src_timeout = grp_timeout;
            t.q = a - y;
        }
        (FilterMode::Exclude, RecordType::ToEx) => {
            // EXCLUDE (A-Y, Y*A), (A-X-Y) = group timer, Q(G, A-Y), group timer = GMI
            t.x = a - y;
            t.y = y & a;
            t.to = &(a - x) - y;
            t.src_timeout = grp_timeout;
            t.q = a - y;
            t.grp_timeout = Some(gmi);
        }
        (FilterMode::Exclude, RecordType::ToIn) => {
            t.to = a.clone();
            t.src_timeout = gmi;
            if fast_leave {
                t.mode = FilterMode::Include;
                t.x.clear();
            } else {
                // EXCLUDE (X+A, Y-A), (A) = GMI, Q(G, X-A), Q(G)
                t.x = x | a;
                t.y = y - a;
                t.q = x - a;
                t.group_query = true;
            }
        }
    }

    t
}

/// Lowers the group timer of `port` to `lmqt`. With `tx_cnt`, also starts
/// sending that many group-specific queries.
fn lower_group_timer(grp: &mut GroupEntry, port: PortNo, lmqt: Seconds, tx_cnt: Option<u32>) {
    if let Some(timeout) = grp.grp_timeout.get_mut(port) {
        *timeout = lmqt;
    }
    let Some(tx_cnt) = tx_cnt else {
        return;
    };
    if let Some(timers) = grp.asm.ports.get_mut(port) {
        timers.query_timeout = 1;
        timers.tx_cnt_left = tx_cnt;
    }
    grp.asm.next_query_timeout_update();
}

/// Lowers the timers of the forwarded sources in `q` to `lmqt`. With
/// `tx_cnt`, also starts sending that many group-and-source-specific
/// queries.
fn lower_source_timers(grp: &mut GroupEntry, port: PortNo, q: &SourceList, lmqt: Seconds, tx_cnt: Option<u32>) {
    let mut moved = false;
    for source in q {
        let Some(entry) = grp.src_map.entries.get_mut(source) else {
            continue;
        };
        if !entry.include_port_list.contains(port) {
            continue;
        }
        let Some(timers) = entry.ports.get_mut(port) else {
            continue;
        };
        if timers.src_timeout <= lmqt {
            continue;
        }

        log::trace!("port {}: source {} timer {} -> {}", port, source, timers.src_timeout, lmqt);
        timers.src_timeout = lmqt;
        if let Some(tx_cnt) = tx_cnt {
            timers.query_timeout = 1;
            timers.tx_cnt_left = tx_cnt;
        }
        entry.next_src_timeout_update();
        entry.next_query_timeout_update();
        moved = true;
    }

    if moved {
        grp.src_map.next_src_timeout_update();
        grp.src_map.next_query_timeout_update();
    }
}

/// Counts down one retransmission of `port`. Returns whether a query is
/// due now.
fn retransmit_due(entry: &mut SourceEntry, port: PortNo, now: Seconds, interval: Seconds) -> bool {
    let Some(timers) = entry.ports.get_mut(port) else {
        return false;
    };
    if timers.query_timeout == 0 || timers.query_timeout > now {
        return false;
    }
    if timers.tx_cnt_left == 0 {
        timers.query_timeout = 0;
        return false;
    }
    timers.tx_cnt_left -= 1;
    timers.query_timeout = if timers.tx_cnt_left == 0 { 0 } else { now + interval };
    true
}

impl Engine {
    /// Applies one group record received on `port` to a group taken out of
    /// the directory, then pushes the result to hardware and starts any
    /// queries it calls for.
    pub(super) fn process_src(
        &mut self,
        key: &GroupKey,
        grp: &mut GroupEntry,
        port: PortNo,
        record_type: RecordType,
        a: &SourceList,
        is_leave: bool,
    ) {
        let Some(vlan) = self.vlans.get(&key.vlan) else {
            return;
        };
        let gmi = vlan.gmi() + self.now;
        let fast_leave = is_leave && self.global(&key.vlan).map(|global| global.fast_leave(port)).unwrap_or(false);

        let old_mode = grp.filter_mode(port);
        let old_x = grp.src_map.included(port);
        let old_y = grp.src_map.excluded(port);
        let grp_timeout = grp.grp_timeout.get(port).copied().unwrap_or(0);

        let t = transition(old_mode, &old_x, &old_y, record_type, a, fast_leave, gmi, grp_timeout);
        log::debug!(
            "{}: port {} {:?}({:?}, {:?}) {} {:?} -> {:?}({:?}, {:?})",
            key, port, old_mode, old_x, old_y, record_type.name(), a, t.mode, t.x, t.y,
        );

        if let Some(timeout) = t.grp_timeout {
            if let Some(slot) = grp.grp_timeout.get_mut(port) {
                *slot = timeout;
            }
        }

        self.src_map_update(key, grp, port, &t.x, &t.y);

        if t.mode != old_mode {
            grp.filter_mode_set(port, t.mode);
        }

        Self::src_timeout_update(grp, port, &t.to, t.src_timeout);

        self.hw_update(key, grp);

        self.tx_query_start(key, grp, port, &t.q, t.group_query, is_leave);
    }

    /// Makes the include and exclude lists of `port` equal `x` and `y`,
    /// creating sources as long as the group has room for them.
    fn src_map_update(&mut self, key: &GroupKey, grp: &mut GroupEntry, port: PortNo, x: &SourceList, y: &SourceList) {
        let map = &mut grp.src_map;

        for (source, entry) in map.entries.iter_mut() {
            let include = x.contains(source);
            let exclude = y.contains(source);
            if include && exclude {
                log::error!("{}: port {} source {} both forwarded and blocked", key, port, source);
            }
            if entry.include_port_list.contains(port) != include || entry.exclude_port_list.contains(port) != exclude {
                entry.include_port_list.set(port, include);
                entry.exclude_port_list.set(port, exclude);
                entry.changed = true;
                map.changed = true;
            }
        }

        let mut refused = 0;
        for (source, include) in x.iter().map(|source| (source, true)).chain(y.iter().map(|source| (source, false))) {
            if map.entries.contains_key(source) {
                continue;
            }
            if map.entries.len() >= self.src_per_grp_cnt_max {
                refused += 1;
                continue;
            }
            let mut entry = SourceEntry::new(self.port_count);
            if include {
                entry.include_port_list.insert(port);
            } else {
                entry.exclude_port_list.insert(port);
            }
            entry.changed = true;
            map.entries.insert(*source, entry);
            map.changed = true;
        }

        if refused != 0 {
            log::debug!("{}: {} sources refused, group is full", key, refused);
            if let Some(global) = self.global_mut(&key.vlan) {
                global.src_cnt_exceeded += refused;
            }
        }

        if map.changed {
            grp.asm.changed = true;
        }
    }

    fn src_timeout_update(grp: &mut GroupEntry, port: PortNo, to: &SourceList, src_timeout: Seconds) {
        let mut moved = false;
        for source in to {
            let Some(entry) = grp.src_map.entries.get_mut(source) else {
                continue;
            };
            if let Some(timers) = entry.ports.get_mut(port) {
                timers.src_timeout = src_timeout;
            }
            if entry.next_src_timeout_update() {
                moved = true;
            }
        }
        if moved {
            grp.src_map.next_src_timeout_update();
        }
    }

    /// Lowers the timers a leave-ish record asked about and, if we are
    /// querying, starts the specific queries.
    fn tx_query_start(&mut self, key: &GroupKey, grp: &mut GroupEntry, port: PortNo, q: &SourceList, group_query: bool, is_leave: bool) {
        if q.is_empty() && !group_query {
            return;
        }

        let Some(global) = self.global(&key.vlan) else {
            return;
        };
        let proxy = global.conf.proxy || (is_leave && global.conf.leave_proxy);
        if proxy && global.router_status(port) != super::RouterStatus::None {
            return;
        }

        let Some(vlan) = self.vlans.get(&key.vlan) else {
            return;
        };
        let lmqt = vlan.lmqt() + self.now;
        let querying = vlan.status.querier_state != QuerierState::Idle;
        let tx_cnt = querying.then_some(vlan.internal.cur_rv);

        if group_query {
            lower_group_timer(grp, port, lmqt, tx_cnt);
        }
        lower_source_timers(grp, port, q, lmqt, tx_cnt);

        if querying {
            self.query_retransmit_tick(key, grp);
        }
    }

    /// Lowers timers on behalf of a group-specific or
    /// group-and-source-specific query from the active querier.
    pub(super) fn lower_timers_from_query(grp: &mut GroupEntry, sources: &SourceList, lmqt: Seconds) {
        for port in grp.active_ports.iter() {
            if sources.is_empty() {
                lower_group_timer(grp, port, lmqt, None);
            } else {
                lower_source_timers(grp, port, sources, lmqt, None);
            }
        }
    }

    /// Sends the specific queries that are due.
    pub(super) fn query_retransmit_tick(&mut self, key: &GroupKey, grp: &mut GroupEntry) {
        let Some(vlan) = self.vlans.get(&key.vlan) else {
            return;
        };
        let now = self.now;
        let lmqt = vlan.lmqt() + now;
        let interval = vlan.lmqi_seconds();

        let mut group_queries = Vec::new();
        if grp.asm.next_query_timeout != 0 && grp.asm.next_query_timeout <= now {
            for port in grp.active_ports.iter() {
                if retransmit_due(&mut grp.asm, port, now, interval) {
                    let s_flag = grp.grp_timeout.get(port).copied().unwrap_or(0) > lmqt;
                    group_queries.push((port, s_flag));
                }
            }
            grp.asm.next_query_timeout_update();
        }

        let mut source_queries = Vec::new();
        if grp.src_map.next_query_timeout != 0 && grp.src_map.next_query_timeout <= now {
            for port in grp.active_ports.iter() {
                let mut suppressed = SourceList::new();
                let mut unsuppressed = SourceList::new();
                for (source, entry) in grp.src_map.entries.iter_mut() {
                    if !entry.include_port_list.contains(port) {
                        continue;
                    }
                    let src_timeout = entry.ports.get(port).map(|timers| timers.src_timeout).unwrap_or(0);
                    if !retransmit_due(entry, port, now, interval) {
                        continue;
                    }
                    if src_timeout > lmqt {
                        suppressed.insert(*source);
                    } else {
                        unsuppressed.insert(*source);
                    }
                }
                source_queries.push((port, suppressed, unsuppressed));
            }
            for entry in grp.src_map.entries.values_mut() {
                entry.next_query_timeout_update();
            }
            grp.src_map.next_query_timeout_update();
        }

        let compat = grp.grp_compat;
        let none = SourceList::new();
        for (port, s_flag) in group_queries {
            self.tx_query(&key.vlan, PortSet::single(port), &key.group, &none, s_flag, compat);
        }
        for (port, suppressed, unsuppressed) in source_queries {
            if !suppressed.is_empty() {
                self.tx_query(&key.vlan, PortSet::single(port), &key.group, &suppressed, true, compat);
            }
            if !unsuppressed.is_empty() {
                self.tx_query(&key.vlan, PortSet::single(port), &key.group, &unsuppressed, false, compat);
            }
        }
    }

    /// Expires source timers. A source that times out stops being
    /// forwarded; on an EXCLUDE mode port it becomes blocked instead.
    pub(super) fn src_timer_tick(&mut self, grp: &mut GroupEntry) {
        let now = self.now;
        let exclude_mode_ports = grp.exclude_mode_ports;
        let map = &mut grp.src_map;
        if map.next_src_timeout == 0 || map.next_src_timeout > now {
            return;
        }

        for (source, entry) in map.entries.iter_mut() {
            if entry.next_src_timeout == 0 || entry.next_src_timeout > now {
                continue;
            }
            let ports: Vec<PortNo> = entry.include_port_list.iter().collect();
            for port in ports {
                let Some(timers) = entry.ports.get_mut(port) else {
                    continue;
                };
                if timers.src_timeout > now {
                    continue;
                }
                log::trace!("port {}: source {} timed out", port, source);
                timers.src_timeout = 0;
                timers.query_timeout = 0;
                entry.include_port_list.remove(port);
                if exclude_mode_ports.contains(port) {
                    entry.exclude_port_list.insert(port);
                }
                entry.changed = true;
                map.changed = true;
            }
            entry.next_src_timeout_update();
            entry.next_query_timeout_update();
        }

        map.next_src_timeout_update();
        map.next_query_timeout_update();
        if map.changed {
            grp.asm.changed = true;
        }
    }

    /// Expires group timers. An EXCLUDE mode port whose timer runs out
    /// forgets its blocked sources and falls back to INCLUDE.
    pub(super) fn group_timer_tick(&mut self, grp: &mut GroupEntry) {
        let now = self.now;
        let expired: Vec<PortNo> = (grp.exclude_mode_ports & grp.active_ports).iter()
            .filter(|port| grp.grp_timeout.get(*port).copied().unwrap_or(0) <= now)
            .collect();

        for port in expired {
            for entry in grp.src_map.entries.values_mut() {
                if entry.exclude_port_list.contains(port) {
                    entry.exclude_port_list.remove(port);
                    entry.changed = true;
                    grp.src_map.changed = true;
                }
            }
            grp.filter_mode_set(port, FilterMode::Include);
        }

        if grp.src_map.changed {
            grp.asm.changed = true;
        }
    }

    /// Ages the older version host present timers of a group in automatic
    /// compatibility. Returns whether the group's compatibility changed.
    pub(super) fn older_version_host_tick(&mut self, key: &GroupKey, grp: &mut GroupEntry) -> bool {
        let auto = self.vlans.get(&key.vlan)
            .map(|vlan| vlan.conf.compatibility == Compatibility::Auto)
            .unwrap_or(false);
        if !auto {
            return false;
        }

        let now = self.now;
        let old_compat = grp.grp_compat;
        if grp.grp_compat == Compatibility::Old && grp.old_present_timer <= now {
            grp.grp_compat = if grp.gen_present_timer != 0 { Compatibility::Gen } else { Compatibility::Sfm };
            grp.old_present_timer = 0;
        }
        if grp.grp_compat == Compatibility::Gen && grp.gen_present_timer <= now {
            grp.grp_compat = Compatibility::Sfm;
            grp.gen_present_timer = 0;
        }

        if grp.grp_compat != old_compat {
            log::info!("{}: host compatibility {:?} -> {:?}", key, old_compat, grp.grp_compat);
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::IpmcAddr;

    const GMI: Seconds = 260;
    const GRP_TIMEOUT: Seconds = 100;

    fn list(addrs: &[&str]) -> SourceList {
        addrs.iter().map(|addr| addr.parse::<IpmcAddr>().unwrap()).collect()
    }

    fn run(mode: FilterMode, x: &[&str], y: &[&str], record_type: RecordType, a: &[&str]) -> Transition {
        transition(mode, &list(x), &list(y), record_type, &list(a), false, GMI, GRP_TIMEOUT)
    }

    #[test]
    fn include_mode_rows() {
        let x = ["1.1.1.1", "3.3.3.3"];
        let a = ["1.1.1.1", "2.2.2.2"];

        let t = run(FilterMode::Include, &x, &[], RecordType::IsIn, &a);
        assert_eq!(t.mode, FilterMode::Include);
        assert_eq!(t.x, list(&["1.1.1.1", "2.2.2.2", "3.3.3.3"]));
        assert_eq!(t.to, list(&a));
        assert_eq!(t.src_timeout, GMI);
        assert!(t.q.is_empty());

        let t = run(FilterMode::Include, &x, &[], RecordType::Allow, &a);
        assert_eq!(t.x, list(&["1.1.1.1", "2.2.2.2", "3.3.3.3"]));

        let t = run(FilterMode::Include, &x, &[], RecordType::IsEx, &a);
        assert_eq!(t.mode, FilterMode::Exclude);
        assert_eq!(t.x, list(&["1.1.1.1"]));
        assert_eq!(t.y, list(&["2.2.2.2"]));
        assert_eq!(t.to, list(&["2.2.2.2"]));
        assert_eq!(t.src_timeout, 0);
        assert_eq!(t.grp_timeout, Some(GMI));

        let t = run(FilterMode::Include, &x, &[], RecordType::Block, &a);
        assert_eq!(t.mode, FilterMode::Include);
        assert_eq!(t.x, list(&x));
        assert_eq!(t.q, list(&["1.1.1.1"]));
        assert!(t.to.is_empty());

        let t = run(FilterMode::Include, &x, &[], RecordType::ToEx, &a);
        assert_eq!(t.mode, FilterMode::Exclude);
        assert_eq!(t.x, list(&["1.1.1.1"]));
        assert_eq!(t.y, list(&["2.2.2.2"]));
        assert_eq!(t.q, list(&["1.1.1.1"]));
        assert_eq!(t.grp_timeout, Some(GMI));

        let t = run(FilterMode::Include, &x, &[], RecordType::ToIn, &a);
        assert_eq!(t.mode, FilterMode::Include);
        assert_eq!(t.x, list(&["1.1.1.1", "2.2.2.2", "3.3.3.3"]));
        assert_eq!(t.q, list(&["3.3.3.3"]));
        assert!(!t.group_query);
    }

    #[test]
    fn exclude_mode_rows() {
        let x = ["1.1.1.1"];
        let y = ["3.3.3.3", "4.4.4.4"];
        let a = ["1.1.1.1", "2.2.2.2", "3.3.3.3"];

        let t = run(FilterMode::Exclude, &x, &y, RecordType::IsIn, &a);
        assert_eq!(t.mode, FilterMode::Exclude);
        assert_eq!(t.x, list(&["1.1.1.1", "2.2.2.2", "3.3.3.3"]));
        assert_eq!(t.y, list(&["4.4.4.4"]));
        assert_eq!(t.to, list(&a));
        assert_eq!(t.src_timeout, GMI);

        let t = run(FilterMode::Exclude, &x, &y, RecordType::Allow, &a);
        assert_eq!(t.y, list(&["4.4.4.4"]));

        let t = run(FilterMode::Exclude, &x, &y, RecordType::IsEx, &a);
        assert_eq!(t.x, list(&["1.1.1.1", "2.2.2.2"]));
        assert_eq!(t.y, list(&["3.3.3.3"]));
        assert_eq!(t.to, list(&["2.2.2.2"]));
        assert_eq!(t.src_timeout, GMI);
        assert_eq!(t.grp_timeout, Some(GMI));

        let t = run(FilterMode::Exclude, &x, &y, RecordType::Block, &a);
        assert_eq!(t.x, list(&["1.1.1.1", "2.2.2.2"]));
        assert_eq!(t.y, list(&y));
        assert_eq!(t.to, list(&["2.2.2.2"]));
        assert_eq!(t.src_timeout, GRP_TIMEOUT);
        assert_eq!(t.q, list(&["1.1.1.1", "2.2.2.2"]));
        assert_eq!(t.grp_timeout, None);

        let t = run(FilterMode::Exclude, &x, &y, RecordType::ToEx, &a);
        assert_eq!(t.x, list(&["1.1.1.1", "2.2.2.2"]));
        assert_eq!(t.y, list(&["3.3.3.3"]));
        assert_eq!(t.src_timeout, GRP_TIMEOUT);
        assert_eq!(t.q, list(&["1.1.1.1", "2.2.2.2"]));
        assert_eq!(t.grp_timeout, Some(GMI));

        let t = run(FilterMode::Exclude, &x, &y, RecordType::ToIn, &a);
        assert_eq!(t.mode, FilterMode::Exclude);
        assert_eq!(t.x, list(&["1.1.1.1", "2.2.2.2", "3.3.3.3"]));
        assert_eq!(t.y, list(&["4.4.4.4"]));
        assert!(t.q.is_empty());
        assert!(t.group_query);
    }

    #[test]
    fn fast_leave_drops_everything() {
        let x = list(&["1.1.1.1"]);
        let y = list(&["3.3.3.3"]);
        let none = SourceList::new();

        let t = transition(FilterMode::Exclude, &x, &y, RecordType::ToIn, &none, true, GMI, GRP_TIMEOUT);
        assert_eq!(t.mode, FilterMode::Include);
        assert!(t.x.is_empty() && t.y.is_empty() && t.q.is_empty());
        assert!(!t.group_query);

        let t = transition(FilterMode::Include, &x, &none, RecordType::ToIn, &none, true, GMI, GRP_TIMEOUT);
        assert!(t.x.is_empty() && t.q.is_empty());
    }

    #[test]
    fn retransmissions_count_down() {
        let mut entry = SourceEntry::new(2);
        entry.ports[1].query_timeout = 1;
        entry.ports[1].tx_cnt_left = 2;

        assert!(retransmit_due(&mut entry, 1, 5, 1));
        assert_eq!(entry.ports[1].query_timeout, 6);
        assert!(!retransmit_due(&mut entry, 1, 5, 1));
        assert!(retransmit_due(&mut entry, 1, 6, 1));
        assert_eq!(entry.ports[1].query_timeout, 0);
        assert!(!retransmit_due(&mut entry, 1, 7, 1));
    }
}
