// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Recursive next-hop resolution.
//!
//! Resolution walks each route's winning next-hop set down to terminal
//! forwarding state: an egress interface, a drop, or a punt to the CPU.
//! A gateway next-hop is chased through longest-prefix-match lookups in
//! its own address family until it lands on a directly connected subnet
//! or a terminal action, inheriting resolved next-hops (and label
//! stacks) from the covering route.
//!
//! Cycles are broken with the PROCESSING flag: a lookup that lands on a
//! route currently being resolved (or on the route that owns the
//! next-hop) retries at the next shorter covering prefix, and fails once
//! the chain is exhausted. Every recursion step enters a route that is
//! not yet on the stack, so resolution terminates.

use crate::tree::RouteTable;
use crate::types::{
    Forwarding, InterfaceId, NextHop, Prefix, ResolvedNextHop, RouteAction,
    RouteFlags,
};
use std::collections::BTreeSet;
use std::net::IpAddr;

/// Re-resolve every route in the table. Forwarding state is a pure
/// function of the table's contributions: equal tables resolve to equal
/// forwarding state.
pub(crate) fn resolve_table(table: &mut RouteTable) {
    let keys = table.keys();
    for prefix in &keys {
        if let Some(route) = table.exact_match_mut(prefix) {
            route.begin_resolution();
        }
    }
    for prefix in &keys {
        resolve_route(table, *prefix);
    }
}

/// Resolve one route, memoized via the RESOLVED/UNRESOLVABLE flags.
/// Returns the route's forwarding state; `Unresolved` means the route is
/// unresolvable (or currently on the stack) and must not be inherited.
fn resolve_route(table: &mut RouteTable, prefix: Prefix) -> Forwarding {
    let (action, connected, nexthops) = {
        let Some(route) = table.exact_match_mut(&prefix) else {
            return Forwarding::Unresolved;
        };
        if route
            .flags
            .intersects(RouteFlags::RESOLVED | RouteFlags::UNRESOLVABLE)
        {
            return route.forwarding.clone();
        }
        if route.flags.contains(RouteFlags::PROCESSING) {
            return Forwarding::Unresolved;
        }
        let Some(best) = route.best_entry() else {
            // Contribution-less routes are removed by the updater; one
            // reaching here resolves to nothing.
            route.flags.remove(RouteFlags::NEEDS_RESOLVE);
            route.flags.insert(RouteFlags::UNRESOLVABLE);
            return Forwarding::Unresolved;
        };
        let result = (
            best.action,
            route.flags.contains(RouteFlags::CONNECTED),
            best.nexthops.clone(),
        );
        route.flags.insert(RouteFlags::PROCESSING);
        result
    };

    let forwarding = match action {
        RouteAction::Drop => Forwarding::Drop,
        RouteAction::ToCpu => Forwarding::ToCpu,
        RouteAction::Forward if connected => {
            // A directly connected subnet egresses its interface; the
            // neighbor is resolved per packet.
            let set: BTreeSet<ResolvedNextHop> = nexthops
                .iter()
                .filter_map(|nh| nh.interface.map(|i| nh.attached(i)))
                .collect();
            if set.is_empty() {
                Forwarding::Unresolved
            } else {
                Forwarding::Forward(set)
            }
        }
        RouteAction::Forward => resolve_nexthops(table, &prefix, &nexthops),
    };

    if let Some(route) = table.exact_match_mut(&prefix) {
        route
            .flags
            .remove(RouteFlags::PROCESSING | RouteFlags::NEEDS_RESOLVE);
        if forwarding == Forwarding::Unresolved {
            route.flags.insert(RouteFlags::UNRESOLVABLE);
        } else {
            route.flags.insert(RouteFlags::RESOLVED);
        }
        route.forwarding = forwarding.clone();
    }
    forwarding
}

/// The outcome of resolving a single next-hop.
enum Resolution {
    Forward(Vec<ResolvedNextHop>),
    Drop,
    ToCpu,
    Unresolved,
}

fn resolve_nexthops(
    table: &mut RouteTable,
    origin: &Prefix,
    nexthops: &BTreeSet<NextHop>,
) -> Forwarding {
    let mut forward: Vec<ResolvedNextHop> = Vec::new();
    let mut saw_drop = false;
    let mut saw_cpu = false;
    for nh in nexthops {
        match resolve_nexthop(table, origin, nh) {
            Resolution::Forward(set) => forward.extend(set),
            Resolution::Drop => saw_drop = true,
            Resolution::ToCpu => saw_cpu = true,
            Resolution::Unresolved => {}
        }
    }

    // Any usable next-hop wins over inherited terminal actions; drop
    // wins over punt; nothing usable at all leaves the route
    // unresolvable.
    if !forward.is_empty() {
        Forwarding::Forward(merge_weights(forward))
    } else if saw_drop {
        Forwarding::Drop
    } else if saw_cpu {
        Forwarding::ToCpu
    } else {
        Forwarding::Unresolved
    }
}

// Normalize a resolved set: next-hops identical up to weight collapse
// into one entry with the weights summed.
fn merge_weights(nexthops: Vec<ResolvedNextHop>) -> BTreeSet<ResolvedNextHop> {
    let mut merged: Vec<ResolvedNextHop> = Vec::new();
    for nh in nexthops {
        match merged.iter_mut().find(|m| {
            m.addr == nh.addr
                && m.interface == nh.interface
                && m.labels == nh.labels
        }) {
            Some(existing) => existing.weight += nh.weight,
            None => merged.push(nh),
        }
    }
    merged.into_iter().collect()
}

fn resolve_nexthop(
    table: &mut RouteTable,
    origin: &Prefix,
    nh: &NextHop,
) -> Resolution {
    if let Some(interface) = nh.interface {
        // Interface-pinned next-hop: valid only if that interface's
        // connected subnet covers the gateway address.
        return if connected_subnet_covers(table, nh.addr, interface) {
            Resolution::Forward(vec![nh.attached(interface)])
        } else {
            Resolution::Unresolved
        };
    }

    let mut key = Prefix::host(nh.addr);
    loop {
        let Some((matched, skip)) = table.covering(&key).map(|(p, r)| {
            (p, p == *origin || r.flags.contains(RouteFlags::PROCESSING))
        }) else {
            return Resolution::Unresolved;
        };

        // No self-cover, and no revisiting routes on the resolution
        // stack: retry at the next shorter covering prefix.
        if skip {
            match shorter_key(nh.addr, matched.length()) {
                Some(k) => {
                    key = k;
                    continue;
                }
                None => return Resolution::Unresolved,
            }
        }

        if let Some(interface) = table
            .exact_match(&matched)
            .and_then(|r| r.connected_interface())
        {
            return Resolution::Forward(vec![nh.attached(interface)]);
        }

        return match resolve_route(table, matched) {
            Forwarding::Drop => Resolution::Drop,
            Forwarding::ToCpu => Resolution::ToCpu,
            Forwarding::Forward(set) => Resolution::Forward(
                set.iter().map(|m| m.inherited_by(nh)).collect(),
            ),
            Forwarding::Unresolved => Resolution::Unresolved,
        };
    }
}

/// Whether a connected subnet carrying `interface` covers `addr`.
fn connected_subnet_covers(
    table: &RouteTable,
    addr: IpAddr,
    interface: InterfaceId,
) -> bool {
    let mut key = Prefix::host(addr);
    loop {
        let Some((matched, connected_if)) = table
            .covering(&key)
            .map(|(p, r)| (p, r.connected_interface()))
        else {
            return false;
        };
        if connected_if == Some(interface) {
            return true;
        }
        match shorter_key(addr, matched.length()) {
            Some(k) => key = k,
            None => return false,
        }
    }
}

// The lookup key for the covering prefix strictly less specific than a
// match of length `matched_len`. Each retry strictly shortens the match,
// bounding the walk by the address width.
fn shorter_key(addr: IpAddr, matched_len: u8) -> Option<Prefix> {
    if matched_len == 0 {
        return None;
    }
    Prefix::new(addr, matched_len - 1).ok()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::types::{ClientId, Label, NextHopEntry};
    use rib_common::{cidr, ip};

    // Build a table directly; the updater drives this in production.
    fn add(
        table: &mut RouteTable,
        prefix: &str,
        client: ClientId,
        entry: NextHopEntry,
    ) {
        let prefix: Prefix = cidr!(prefix);
        table.insert_or_default(&prefix).set_entry(client, entry);
    }

    fn interface_entry(addr: &str, interface: u32) -> NextHopEntry {
        NextHopEntry::forward(
            [NextHop::gateway(ip!(addr))
                .with_interface(InterfaceId(interface))],
            crate::ADMIN_DISTANCE_DIRECTLY_CONNECTED,
        )
        .expect("non-empty next-hop set")
    }

    fn static_via(addrs: &[&str]) -> NextHopEntry {
        NextHopEntry::forward(
            addrs.iter().map(|a| NextHop::gateway(ip!(*a))),
            crate::ADMIN_DISTANCE_STATIC,
        )
        .expect("non-empty next-hop set")
    }

    fn forwarding(table: &RouteTable, prefix: &str) -> Forwarding {
        let prefix: Prefix = cidr!(prefix);
        table
            .exact_match(&prefix)
            .expect("route exists")
            .forwarding
            .clone()
    }

    #[test]
    fn connected_route_resolves_to_itself() {
        let mut table = RouteTable::new();
        add(
            &mut table,
            "10.0.0.0/24",
            ClientId::Interface,
            interface_entry("10.0.0.1", 4),
        );
        resolve_table(&mut table);

        let fwd = forwarding(&table, "10.0.0.0/24");
        let nhs = fwd.nexthops().expect("forwarding next-hops");
        assert_eq!(nhs.len(), 1);
        let nh = nhs.first().unwrap();
        assert_eq!(nh.interface, InterfaceId(4));
        let expected: IpAddr = ip!("10.0.0.1");
        assert_eq!(nh.addr, expected);
    }

    #[test]
    fn gateway_resolves_via_connected_subnet() {
        let mut table = RouteTable::new();
        add(
            &mut table,
            "10.0.0.0/24",
            ClientId::Interface,
            interface_entry("10.0.0.1", 4),
        );
        add(
            &mut table,
            "8.8.0.0/16",
            ClientId::Bgp,
            static_via(&["10.0.0.7"]),
        );
        resolve_table(&mut table);

        let fwd = forwarding(&table, "8.8.0.0/16");
        let nhs = fwd.nexthops().expect("forwarding next-hops");
        let nh = nhs.first().unwrap();
        assert_eq!(nh.interface, InterfaceId(4));
        // The gateway address itself, resolved on the connected subnet.
        let expected: IpAddr = ip!("10.0.0.7");
        assert_eq!(nh.addr, expected);
    }

    #[test]
    fn recursion_inherits_resolved_set_and_labels() {
        let mut table = RouteTable::new();
        add(
            &mut table,
            "10.0.0.0/24",
            ClientId::Interface,
            interface_entry("10.0.0.1", 4),
        );
        // 5.5.5.5/32 via 10.0.0.9 pushing label 100.
        add(
            &mut table,
            "5.5.5.5/32",
            ClientId::Static,
            NextHopEntry::forward(
                [NextHop::gateway(ip!("10.0.0.9"))
                    .with_labels(vec![Label(100)])],
                crate::ADMIN_DISTANCE_STATIC,
            )
            .unwrap(),
        );
        // 7.0.0.0/8 via 5.5.5.5 pushing label 200.
        add(
            &mut table,
            "7.0.0.0/8",
            ClientId::Bgp,
            NextHopEntry::forward(
                [NextHop::gateway(ip!("5.5.5.5"))
                    .with_labels(vec![Label(200)])],
                crate::ADMIN_DISTANCE_EBGP,
            )
            .unwrap(),
        );
        resolve_table(&mut table);

        let fwd = forwarding(&table, "7.0.0.0/8");
        let nhs = fwd.nexthops().expect("forwarding next-hops");
        let nh = nhs.first().unwrap();
        assert_eq!(nh.interface, InterfaceId(4));
        let expected: IpAddr = ip!("10.0.0.9");
        assert_eq!(nh.addr, expected);
        // Covering route's labels first, then the dependent's.
        assert_eq!(nh.labels, vec![Label(100), Label(200)]);
    }

    #[test]
    fn terminal_actions_inherited() {
        let mut table = RouteTable::new();
        add(
            &mut table,
            "2.2.2.2/32",
            ClientId::StaticCpu,
            NextHopEntry::to_cpu(crate::MAX_ADMIN_DISTANCE),
        );
        add(
            &mut table,
            "4.4.4.4/32",
            ClientId::Static,
            static_via(&["2.2.2.2"]),
        );
        add(
            &mut table,
            "3.3.3.3/32",
            ClientId::StaticNull,
            NextHopEntry::drop(crate::MAX_ADMIN_DISTANCE),
        );
        add(
            &mut table,
            "6.6.6.6/32",
            ClientId::Static,
            static_via(&["3.3.3.3"]),
        );
        resolve_table(&mut table);

        assert_eq!(forwarding(&table, "4.4.4.4/32"), Forwarding::ToCpu);
        assert_eq!(forwarding(&table, "6.6.6.6/32"), Forwarding::Drop);
    }

    #[test]
    fn drop_beats_cpu_when_no_nexthops() {
        let mut table = RouteTable::new();
        add(
            &mut table,
            "2.2.2.2/32",
            ClientId::StaticCpu,
            NextHopEntry::to_cpu(crate::MAX_ADMIN_DISTANCE),
        );
        add(
            &mut table,
            "3.3.3.3/32",
            ClientId::StaticNull,
            NextHopEntry::drop(crate::MAX_ADMIN_DISTANCE),
        );
        add(
            &mut table,
            "9.0.0.0/8",
            ClientId::Static,
            static_via(&["2.2.2.2", "3.3.3.3"]),
        );
        resolve_table(&mut table);
        assert_eq!(forwarding(&table, "9.0.0.0/8"), Forwarding::Drop);
    }

    #[test]
    fn nexthops_beat_inherited_terminal_actions() {
        let mut table = RouteTable::new();
        add(
            &mut table,
            "10.0.0.0/24",
            ClientId::Interface,
            interface_entry("10.0.0.1", 4),
        );
        add(
            &mut table,
            "3.3.3.3/32",
            ClientId::StaticNull,
            NextHopEntry::drop(crate::MAX_ADMIN_DISTANCE),
        );
        add(
            &mut table,
            "9.0.0.0/8",
            ClientId::Static,
            static_via(&["3.3.3.3", "10.0.0.7"]),
        );
        resolve_table(&mut table);

        let fwd = forwarding(&table, "9.0.0.0/8");
        let nhs = fwd.nexthops().expect("forwarding next-hops");
        assert_eq!(nhs.len(), 1);
        let expected: IpAddr = ip!("10.0.0.7");
        assert_eq!(nhs.first().unwrap().addr, expected);
    }

    #[test]
    fn unresolvable_without_cover() {
        let mut table = RouteTable::new();
        add(
            &mut table,
            "8.8.0.0/16",
            ClientId::Bgp,
            static_via(&["10.0.0.7"]),
        );
        resolve_table(&mut table);

        let prefix: Prefix = cidr!("8.8.0.0/16");
        let route = table.exact_match(&prefix).unwrap();
        assert!(route.flags.contains(RouteFlags::UNRESOLVABLE));
        assert_eq!(route.forwarding, Forwarding::Unresolved);
    }

    #[test]
    fn mutual_recursion_is_unresolvable() {
        let mut table = RouteTable::new();
        add(
            &mut table,
            "1.0.0.0/8",
            ClientId::Static,
            static_via(&["2.0.0.1"]),
        );
        add(
            &mut table,
            "2.0.0.0/8",
            ClientId::Static,
            static_via(&["1.0.0.1"]),
        );
        resolve_table(&mut table);

        for p in ["1.0.0.0/8", "2.0.0.0/8"] {
            let prefix: Prefix = cidr!(p);
            let route = table.exact_match(&prefix).unwrap();
            assert!(route.flags.contains(RouteFlags::UNRESOLVABLE));
        }
    }

    #[test]
    fn self_cover_skips_to_shorter_prefix() {
        let mut table = RouteTable::new();
        add(
            &mut table,
            "10.0.0.0/16",
            ClientId::Interface,
            interface_entry("10.0.0.1", 4),
        );
        // The static /24 is the longest match for its own gateway; the
        // self-skip must retry at shorter prefixes and land on the
        // connected /16.
        add(
            &mut table,
            "10.0.0.0/24",
            ClientId::Static,
            static_via(&["10.0.0.9"]),
        );
        resolve_table(&mut table);

        let fwd = forwarding(&table, "10.0.0.0/24");
        let nhs = fwd.nexthops().expect("forwarding next-hops");
        assert_eq!(nhs.first().unwrap().interface, InterfaceId(4));
    }

    #[test]
    fn default_route_no_self_match() {
        let mut table = RouteTable::new();
        add(
            &mut table,
            "0.0.0.0/0",
            ClientId::Static,
            static_via(&["203.0.113.1"]),
        );
        resolve_table(&mut table);

        // The default route covers its own gateway; with nothing else in
        // the table, it must not resolve through itself.
        let prefix: Prefix = cidr!("0.0.0.0/0");
        let route = table.exact_match(&prefix).unwrap();
        assert!(route.flags.contains(RouteFlags::UNRESOLVABLE));

        // A connected subnet covering the gateway fixes it.
        add(
            &mut table,
            "203.0.113.0/24",
            ClientId::Interface,
            interface_entry("203.0.113.2", 9),
        );
        resolve_table(&mut table);
        let fwd = forwarding(&table, "0.0.0.0/0");
        assert!(fwd.nexthops().is_some());
    }

    #[test]
    fn interface_pinned_nexthop_requires_covering_subnet() {
        let mut table = RouteTable::new();
        add(
            &mut table,
            "10.0.0.0/24",
            ClientId::Interface,
            interface_entry("10.0.0.1", 4),
        );
        add(
            &mut table,
            "8.8.0.0/16",
            ClientId::Static,
            NextHopEntry::forward(
                [NextHop::gateway(ip!("10.0.0.7"))
                    .with_interface(InterfaceId(4))],
                crate::ADMIN_DISTANCE_STATIC,
            )
            .unwrap(),
        );
        // Same gateway pinned to an interface whose subnet does not
        // cover it.
        add(
            &mut table,
            "9.9.0.0/16",
            ClientId::Static,
            NextHopEntry::forward(
                [NextHop::gateway(ip!("10.0.0.7"))
                    .with_interface(InterfaceId(5))],
                crate::ADMIN_DISTANCE_STATIC,
            )
            .unwrap(),
        );
        resolve_table(&mut table);

        assert!(forwarding(&table, "8.8.0.0/16").nexthops().is_some());
        let prefix: Prefix = cidr!("9.9.0.0/16");
        assert!(table
            .exact_match(&prefix)
            .unwrap()
            .flags
            .contains(RouteFlags::UNRESOLVABLE));
    }

    #[test]
    fn ecmp_weights_merge_on_duplicates() {
        let mut table = RouteTable::new();
        add(
            &mut table,
            "10.0.0.0/24",
            ClientId::Interface,
            interface_entry("10.0.0.1", 4),
        );
        // Two mid-routes that both resolve to the same gateway.
        add(
            &mut table,
            "5.5.5.5/32",
            ClientId::Static,
            static_via(&["10.0.0.9"]),
        );
        add(
            &mut table,
            "6.6.6.6/32",
            ClientId::Static,
            static_via(&["10.0.0.9"]),
        );
        add(
            &mut table,
            "7.0.0.0/8",
            ClientId::Bgp,
            static_via(&["5.5.5.5", "6.6.6.6"]),
        );
        resolve_table(&mut table);

        let fwd = forwarding(&table, "7.0.0.0/8");
        let nhs = fwd.nexthops().expect("forwarding next-hops");
        assert_eq!(nhs.len(), 1);
        let nh = nhs.first().unwrap();
        let expected: IpAddr = ip!("10.0.0.9");
        assert_eq!(nh.addr, expected);
        assert_eq!(nh.weight, 2 * crate::DEFAULT_ECMP_WEIGHT);
    }

    #[test]
    fn v4_prefix_with_v6_nexthop_resolves_in_v6_tree() {
        let mut table = RouteTable::new();
        add(
            &mut table,
            "2001:db8::/64",
            ClientId::Interface,
            interface_entry("2001:db8::1", 11),
        );
        add(
            &mut table,
            "8.8.0.0/16",
            ClientId::Bgp,
            static_via(&["2001:db8::7"]),
        );
        resolve_table(&mut table);

        let fwd = forwarding(&table, "8.8.0.0/16");
        let nhs = fwd.nexthops().expect("forwarding next-hops");
        assert_eq!(nhs.first().unwrap().interface, InterfaceId(11));
    }

    #[test]
    fn resolution_is_pure_function_of_contributions() {
        let build = |order_swapped: bool| {
            let mut table = RouteTable::new();
            let mut items = vec![
                ("10.0.0.0/24", interface_entry("10.0.0.1", 4)),
                ("8.8.0.0/16", static_via(&["10.0.0.7"])),
                ("9.0.0.0/8", static_via(&["8.8.1.1"])),
            ];
            if order_swapped {
                items.reverse();
            }
            for (p, e) in items {
                let client = match e.action {
                    RouteAction::Forward
                        if e.admin_distance
                            == crate::ADMIN_DISTANCE_DIRECTLY_CONNECTED =>
                    {
                        ClientId::Interface
                    }
                    _ => ClientId::Static,
                };
                add(&mut table, p, client, e);
            }
            resolve_table(&mut table);
            table
        };
        assert!(build(false) == build(true));
    }
}
