// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Property-based tests for the merge, updater and resolution layers.

use crate::tree::RouteTable;
use crate::types::{
    ClientId, NextHop, NextHopEntry, Prefix, Prefix4, RouteFlags,
};
use crate::updater::RouteUpdater;
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};

fn prefix_strategy() -> impl Strategy<Value = Prefix> {
    (any::<u32>(), 0u8..=32u8).prop_map(|(bits, length)| {
        Prefix::V4(
            Prefix4::new(Ipv4Addr::from(bits), length)
                .expect("length within bounds"),
        )
    })
}

fn client_strategy() -> impl Strategy<Value = ClientId> {
    prop_oneof![
        Just(ClientId::Static),
        Just(ClientId::StaticNull),
        Just(ClientId::StaticCpu),
        Just(ClientId::Interface),
        Just(ClientId::OpenR),
        Just(ClientId::Bgp),
    ]
}

fn entry_strategy() -> impl Strategy<Value = NextHopEntry> {
    (any::<u8>(), any::<u32>(), 0u8..3u8).prop_map(
        |(distance, addr, kind)| match kind {
            0 => NextHopEntry::drop(distance),
            1 => NextHopEntry::to_cpu(distance),
            _ => NextHopEntry::forward(
                [NextHop::gateway(IpAddr::V4(Ipv4Addr::from(addr)))],
                distance,
            )
            .expect("one next-hop"),
        },
    )
}

// A contribution set: at most one entry per (prefix, client), which is
// exactly what the rib stores.
fn contributions_strategy(
) -> impl Strategy<Value = BTreeMap<(Prefix, ClientId), NextHopEntry>> {
    proptest::collection::btree_map(
        (prefix_strategy(), client_strategy()),
        entry_strategy(),
        0..24,
    )
}

fn build_table(
    contributions: impl IntoIterator<
        Item = ((Prefix, ClientId), NextHopEntry),
    >,
) -> RouteTable {
    let mut table = RouteTable::new();
    let mut updater = RouteUpdater::new(&mut table);
    for ((prefix, client), entry) in contributions {
        updater.add_route(&prefix, client, entry);
    }
    updater.finalize();
    table
}

proptest! {
    /// Applying a contribution set in any order yields the same table:
    /// merge is commutative and associative.
    #[test]
    fn prop_merge_is_order_independent(
        contributions in contributions_strategy()
    ) {
        let forward = build_table(contributions.clone());
        let reverse = build_table(contributions.into_iter().rev());
        prop_assert!(forward == reverse);
    }

    /// Every committed route's winner is the minimum of its entries by
    /// (admin distance, client priority).
    #[test]
    fn prop_best_entry_is_admin_distance_winner(
        contributions in contributions_strategy()
    ) {
        let table = build_table(contributions);
        for (_, route) in table.iter() {
            let best = route.best().expect("non-empty route has a winner");
            let best_key = {
                let e = route.best_entry().expect("winner has an entry");
                (e.admin_distance, best)
            };
            for (client, entry) in route.entries() {
                prop_assert!(
                    best_key <= (entry.admin_distance, client),
                    "winner {best_key:?} beaten by {client}",
                );
            }
        }
    }

    /// Applying a batch and then its inverse restores the exact
    /// pre-transaction table.
    #[test]
    fn prop_inverse_delta_restores_table(
        seed in contributions_strategy(),
        batch in contributions_strategy(),
        deletes in proptest::collection::vec(
            (prefix_strategy(), client_strategy()),
            0..12,
        ),
    ) {
        let mut table = build_table(seed);
        let before = table.clone();

        let mut updater = RouteUpdater::new(&mut table);
        for ((prefix, client), entry) in batch {
            updater.add_route(&prefix, client, entry);
        }
        for (prefix, client) in deletes {
            updater.del_route(&prefix, client);
        }
        updater.finalize();
        let inverse = updater.into_inverse();

        let mut updater = RouteUpdater::new(&mut table);
        updater.apply_inverse(inverse);
        updater.finalize();
        prop_assert!(table == before);
    }

    /// Resolution is a pure function of the contributions: running it
    /// again changes nothing, and every route ends up either resolved or
    /// unresolvable.
    #[test]
    fn prop_resolution_is_stable_and_total(
        contributions in contributions_strategy()
    ) {
        let mut table = build_table(contributions);
        let once = table.clone();
        let mut updater = RouteUpdater::new(&mut table);
        updater.finalize();
        prop_assert!(table == once);

        for (_, route) in table.iter() {
            prop_assert!(route.flags.intersects(
                RouteFlags::RESOLVED | RouteFlags::UNRESOLVABLE
            ));
            prop_assert!(!route.flags.contains(RouteFlags::PROCESSING));
            prop_assert!(!route.flags.contains(RouteFlags::NEEDS_RESOLVE));
        }
    }

    /// Snapshots round-trip: serializing any committed table set and
    /// loading it back yields an identical rib, forwarding included
    /// (resolution is rerun on load).
    #[test]
    fn prop_snapshot_round_trip(contributions in contributions_strategy()) {
        use crate::db::RouterTables;
        use crate::snapshot;
        use crate::types::RouterId;

        let mut tables = RouterTables::new();
        tables.insert(RouterId(0), build_table(contributions));
        let bytes = snapshot::serialize(&tables).expect("serialize");
        let restored = snapshot::deserialize(&bytes).expect("deserialize");
        prop_assert!(restored == tables);
    }

    /// A gateway inside a connected subnet always resolves out that
    /// subnet's interface.
    #[test]
    fn prop_connected_gateway_resolves(host in any::<u8>()) {
        use crate::types::InterfaceId;

        let mut table = RouteTable::new();
        let mut updater = RouteUpdater::new(&mut table);
        let connected: Prefix = "10.0.0.0/24".parse().expect("prefix");
        updater.add_route(
            &connected,
            ClientId::Interface,
            NextHopEntry::forward(
                [NextHop::gateway("10.0.0.1".parse().expect("addr"))
                    .with_interface(InterfaceId(4))],
                crate::ADMIN_DISTANCE_DIRECTLY_CONNECTED,
            )
            .expect("one next-hop"),
        );
        let target: Prefix = "8.8.0.0/16".parse().expect("prefix");
        let gateway = IpAddr::V4(Ipv4Addr::new(10, 0, 0, host));
        updater.add_route(
            &target,
            ClientId::Bgp,
            NextHopEntry::forward(
                [NextHop::gateway(gateway)],
                crate::ADMIN_DISTANCE_EBGP,
            )
            .expect("one next-hop"),
        );
        updater.finalize();

        let route = table.exact_match(&target).expect("route exists");
        let nexthops =
            route.forwarding.nexthops().expect("gateway resolves");
        prop_assert_eq!(nexthops.len(), 1);
        let nh = nexthops.first().expect("one next-hop");
        prop_assert_eq!(nh.interface, InterfaceId(4));
        prop_assert_eq!(nh.addr, gateway);
    }
}
