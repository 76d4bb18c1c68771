// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Longest-prefix-match route containers.
//!
//! [`RouteTree`] is a thin wrapper around a [`prefix_trie::PrefixMap`]
//! keyed by an address-family-specific network type. [`RouteTable`] pairs
//! the IPv4 and IPv6 trees of one VRF and dispatches on mixed-family
//! [`Prefix`] values.
//!
//! Keys are canonicalized (host bits zeroed) on every operation, so a
//! lookup with a non-canonical prefix lands on the canonical route.

use crate::types::Route;
use ipnet::{Ipv4Net, Ipv6Net};
use prefix_trie::PrefixMap;
use rib_types::{Prefix, Prefix4, Prefix6};
use std::net::IpAddr;

/// One address family's longest-prefix-match tree of routes.
#[derive(Clone)]
pub struct RouteTree<P: prefix_trie::Prefix> {
    map: PrefixMap<P, Route>,
}

impl<P> RouteTree<P>
where
    P: prefix_trie::Prefix + Copy + Ord,
{
    pub fn new() -> Self {
        Self {
            map: PrefixMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.map.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.map.iter().next().is_none()
    }

    /// Fetch the route for `prefix`, creating an empty one if absent.
    /// Idempotent on the prefix.
    pub fn insert_or_default(&mut self, prefix: P) -> &mut Route {
        self.map.entry(prefix).or_default()
    }

    pub fn exact_match(&self, prefix: &P) -> Option<&Route> {
        self.map.get(prefix)
    }

    pub fn exact_match_mut(&mut self, prefix: &P) -> Option<&mut Route> {
        self.map.get_mut(prefix)
    }

    /// The most specific stored prefix covering `key`, along with its
    /// route. `key` itself is a candidate.
    pub fn longest_match(&self, key: &P) -> Option<(P, &Route)> {
        self.map.get_lpm(key).map(|(p, r)| (*p, r))
    }

    pub fn remove(&mut self, prefix: &P) -> Option<Route> {
        self.map.remove(prefix)
    }

    /// Iterate routes in lexicographic prefix order.
    pub fn iter(&self) -> impl Iterator<Item = (P, &Route)> + '_ {
        self.map.iter().map(|(p, r)| (*p, r))
    }

    pub fn keys(&self) -> impl Iterator<Item = P> + '_ {
        self.map.iter().map(|(p, _)| *p)
    }
}

impl<P> Default for RouteTree<P>
where
    P: prefix_trie::Prefix + Copy + Ord,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<P> PartialEq for RouteTree<P>
where
    P: prefix_trie::Prefix + Copy + Ord,
{
    fn eq(&self, other: &Self) -> bool {
        self.iter().eq(other.iter())
    }
}

impl<P> Eq for RouteTree<P> where P: prefix_trie::Prefix + Copy + Ord {}

fn v4_key(p: Prefix4) -> Ipv4Net {
    Ipv4Net::from(p).trunc()
}

fn v6_key(p: Prefix6) -> Ipv6Net {
    Ipv6Net::from(p).trunc()
}

/// The route tables of one VRF: a tree per address family.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct RouteTable {
    pub v4: RouteTree<Ipv4Net>,
    pub v6: RouteTree<Ipv6Net>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.v4.len() + self.v6.len()
    }

    pub fn is_empty(&self) -> bool {
        self.v4.is_empty() && self.v6.is_empty()
    }

    pub fn exact_match(&self, prefix: &Prefix) -> Option<&Route> {
        match prefix {
            Prefix::V4(p) => self.v4.exact_match(&v4_key(*p)),
            Prefix::V6(p) => self.v6.exact_match(&v6_key(*p)),
        }
    }

    pub fn exact_match_mut(&mut self, prefix: &Prefix) -> Option<&mut Route> {
        match prefix {
            Prefix::V4(p) => self.v4.exact_match_mut(&v4_key(*p)),
            Prefix::V6(p) => self.v6.exact_match_mut(&v6_key(*p)),
        }
    }

    pub fn insert_or_default(&mut self, prefix: &Prefix) -> &mut Route {
        match prefix {
            Prefix::V4(p) => self.v4.insert_or_default(v4_key(*p)),
            Prefix::V6(p) => self.v6.insert_or_default(v6_key(*p)),
        }
    }

    pub fn remove(&mut self, prefix: &Prefix) -> Option<Route> {
        match prefix {
            Prefix::V4(p) => self.v4.remove(&v4_key(*p)),
            Prefix::V6(p) => self.v6.remove(&v6_key(*p)),
        }
    }

    /// The most specific stored prefix covering `key`, in `key`'s address
    /// family.
    pub fn covering(&self, key: &Prefix) -> Option<(Prefix, &Route)> {
        match key {
            Prefix::V4(p) => self
                .v4
                .longest_match(&v4_key(*p))
                .map(|(n, r)| (Prefix::V4(n.into()), r)),
            Prefix::V6(p) => self
                .v6
                .longest_match(&v6_key(*p))
                .map(|(n, r)| (Prefix::V6(n.into()), r)),
        }
    }

    /// Longest-prefix-match lookup of a single address.
    pub fn longest_match(&self, addr: &IpAddr) -> Option<(Prefix, &Route)> {
        self.covering(&Prefix::host(*addr))
    }

    /// All prefixes in the table, v4 in tree order then v6 in tree order.
    pub fn keys(&self) -> Vec<Prefix> {
        self.v4
            .keys()
            .map(|n| Prefix::V4(n.into()))
            .chain(self.v6.keys().map(|n| Prefix::V6(n.into())))
            .collect()
    }

    /// Iterate both trees in order, as mixed-family prefixes.
    pub fn iter(&self) -> impl Iterator<Item = (Prefix, &Route)> + '_ {
        self.v4
            .iter()
            .map(|(n, r)| (Prefix::V4(n.into()), r))
            .chain(self.v6.iter().map(|(n, r)| (Prefix::V6(n.into()), r)))
    }
}
