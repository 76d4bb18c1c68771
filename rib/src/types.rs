// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Core route entities: clients, next-hops, per-client contributions and
//! the merged per-prefix route.

use crate::error::Error;
use bitflags::bitflags;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Display, Formatter};
use std::net::IpAddr;

pub use rib_types::{AddressFamily, Prefix, Prefix4, Prefix6, RouterId};

/// A route source. Each client owns its own contribution per prefix; the
/// rib merges contributions by admin distance.
///
/// The numeric id doubles as the tie-break priority between clients whose
/// contributions carry equal admin distance: the lower id wins, so the
/// declared order here is the documented total order
/// `Static > StaticNull > StaticCpu > Interface > OpenR > Bgp`.
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    JsonSchema,
)]
#[serde(rename_all = "snake_case")]
#[repr(u32)]
pub enum ClientId {
    /// Static routes with next-hops from configuration.
    Static = 0,
    /// Static routes to null (drop) from configuration.
    StaticNull = 1,
    /// Static routes punted to the CPU from configuration.
    StaticCpu = 2,
    /// Directly connected interface subnets.
    Interface = 3,
    /// Routes learned from Open/R.
    OpenR = 4,
    /// Routes learned from BGP.
    Bgp = 5,
}

impl ClientId {
    pub fn id(&self) -> u32 {
        *self as u32
    }

    pub fn from_id(id: u32) -> Option<Self> {
        match id {
            0 => Some(Self::Static),
            1 => Some(Self::StaticNull),
            2 => Some(Self::StaticCpu),
            3 => Some(Self::Interface),
            4 => Some(Self::OpenR),
            5 => Some(Self::Bgp),
            _ => None,
        }
    }

    /// The admin distance a client's routes get when the client does not
    /// override it per route.
    pub fn default_admin_distance(&self) -> u8 {
        match self {
            Self::Interface => crate::ADMIN_DISTANCE_DIRECTLY_CONNECTED,
            Self::Static => crate::ADMIN_DISTANCE_STATIC,
            Self::StaticNull | Self::StaticCpu => crate::MAX_ADMIN_DISTANCE,
            Self::OpenR => crate::ADMIN_DISTANCE_OPENR,
            Self::Bgp => crate::ADMIN_DISTANCE_EBGP,
        }
    }
}

impl Display for ClientId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Static => "static",
            Self::StaticNull => "static-null",
            Self::StaticCpu => "static-cpu",
            Self::Interface => "interface",
            Self::OpenR => "openr",
            Self::Bgp => "bgp",
        };
        write!(f, "{name}")
    }
}

/// An egress interface identifier, assigned by the platform layer.
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    JsonSchema,
)]
pub struct InterfaceId(pub u32);

impl Display for InterfaceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An MPLS label.
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    JsonSchema,
)]
pub struct Label(pub u32);

impl Display for Label {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A stack of MPLS labels to push, outermost last.
pub type LabelStack = Vec<Label>;

/// A traffic classification tag attached to a route and handed through to
/// the forwarding plane.
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    JsonSchema,
)]
pub struct ClassId(pub u32);

impl Display for ClassId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A route counter identifier, handed through to the forwarding plane.
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    JsonSchema,
)]
pub struct CounterId(pub u32);

impl Display for CounterId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An unresolved next-hop as contributed by a client: a gateway address,
/// optionally pinned to an interface, with labels to push and an ECMP
/// weight.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Eq, PartialEq)]
pub struct NextHop {
    pub addr: IpAddr,
    pub interface: Option<InterfaceId>,
    #[serde(default)]
    pub labels: LabelStack,
    pub weight: u32,
}

// Next-hop sets live in BTreeSets; this ordering is the canonical order
// (address, then interface, then labels, then weight) used for equality
// and hashing of sets.
impl PartialOrd for NextHop {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for NextHop {
    fn cmp(&self, other: &Self) -> Ordering {
        if self.addr != other.addr {
            return self.addr.cmp(&other.addr);
        }
        if self.interface != other.interface {
            return self.interface.cmp(&other.interface);
        }
        if self.labels != other.labels {
            return self.labels.cmp(&other.labels);
        }
        self.weight.cmp(&other.weight)
    }
}

impl NextHop {
    pub fn gateway(addr: IpAddr) -> Self {
        Self {
            addr,
            interface: None,
            labels: LabelStack::default(),
            weight: crate::DEFAULT_ECMP_WEIGHT,
        }
    }

    pub fn with_interface(mut self, interface: InterfaceId) -> Self {
        self.interface = Some(interface);
        self
    }

    pub fn with_labels(mut self, labels: LabelStack) -> Self {
        self.labels = labels;
        self
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    /// An IPv6 link-local gateway is only meaningful on a specific
    /// interface.
    pub fn requires_interface(&self) -> bool {
        match self.addr {
            IpAddr::V4(_) => false,
            IpAddr::V6(a) => a.is_unicast_link_local(),
        }
    }

    /// Resolve this next-hop directly out `interface`, keeping the
    /// gateway address, labels and weight.
    pub(crate) fn attached(&self, interface: InterfaceId) -> ResolvedNextHop {
        ResolvedNextHop {
            interface,
            addr: self.addr,
            labels: self.labels.clone(),
            weight: self.weight,
        }
    }
}

impl Display for NextHop {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.interface {
            Some(ifid) => write!(f, "{}%{}", self.addr, ifid),
            None => write!(f, "{}", self.addr),
        }
    }
}

/// A fully resolved forwarding next-hop: egress interface, gateway
/// address on that interface, label stack and weight.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Eq, PartialEq)]
pub struct ResolvedNextHop {
    pub interface: InterfaceId,
    pub addr: IpAddr,
    #[serde(default)]
    pub labels: LabelStack,
    pub weight: u32,
}

impl PartialOrd for ResolvedNextHop {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for ResolvedNextHop {
    fn cmp(&self, other: &Self) -> Ordering {
        if self.addr != other.addr {
            return self.addr.cmp(&other.addr);
        }
        if self.interface != other.interface {
            return self.interface.cmp(&other.interface);
        }
        if self.labels != other.labels {
            return self.labels.cmp(&other.labels);
        }
        self.weight.cmp(&other.weight)
    }
}

impl ResolvedNextHop {
    /// Inherit this resolved next-hop on behalf of `dependent`: the
    /// covering route's labels are pushed first, then the dependent's.
    pub(crate) fn inherited_by(&self, dependent: &NextHop) -> Self {
        let mut labels = self.labels.clone();
        labels.extend(dependent.labels.iter().copied());
        Self {
            interface: self.interface,
            addr: self.addr,
            labels,
            weight: self.weight,
        }
    }
}

impl Display for ResolvedNextHop {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}%{}", self.addr, self.interface)
    }
}

/// What a route does with matching packets.
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum RouteAction {
    /// Silently discard.
    Drop,
    /// Punt to the control plane CPU.
    ToCpu,
    /// Forward via the entry's next-hop set.
    Forward,
}

impl Display for RouteAction {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Drop => "drop",
            Self::ToCpu => "to-cpu",
            Self::Forward => "forward",
        };
        write!(f, "{name}")
    }
}

/// A single client's contribution for a prefix. The next-hop set is
/// non-empty exactly when the action is `Forward`; the constructors
/// enforce this.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Eq, PartialEq)]
pub struct NextHopEntry {
    pub action: RouteAction,
    pub nexthops: BTreeSet<NextHop>,
    pub admin_distance: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counter_id: Option<CounterId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_id: Option<ClassId>,
}

impl NextHopEntry {
    pub fn forward(
        nexthops: impl IntoIterator<Item = NextHop>,
        admin_distance: u8,
    ) -> Result<Self, Error> {
        let nexthops: BTreeSet<NextHop> = nexthops.into_iter().collect();
        if nexthops.is_empty() {
            return Err(Error::InvalidNextHop(
                "a forwarding entry requires at least one next-hop"
                    .to_string(),
            ));
        }
        Ok(Self {
            action: RouteAction::Forward,
            nexthops,
            admin_distance,
            counter_id: None,
            class_id: None,
        })
    }

    pub fn drop(admin_distance: u8) -> Self {
        Self {
            action: RouteAction::Drop,
            nexthops: BTreeSet::new(),
            admin_distance,
            counter_id: None,
            class_id: None,
        }
    }

    pub fn to_cpu(admin_distance: u8) -> Self {
        Self {
            action: RouteAction::ToCpu,
            nexthops: BTreeSet::new(),
            admin_distance,
            counter_id: None,
            class_id: None,
        }
    }

    /// Build an entry from a client-supplied route, falling back to
    /// `default_distance` when the route carries no override.
    pub fn from_unicast(
        route: &UnicastRoute,
        default_distance: u8,
    ) -> Result<Self, Error> {
        let admin_distance = route.admin_distance.unwrap_or(default_distance);
        let mut entry = match route.action {
            RouteAction::Drop => Self::drop(admin_distance),
            RouteAction::ToCpu => Self::to_cpu(admin_distance),
            RouteAction::Forward => {
                Self::forward(route.nexthops.iter().cloned(), admin_distance)?
            }
        };
        entry.counter_id = route.counter_id;
        entry.class_id = route.class_id;
        Ok(entry)
    }
}

/// A route as supplied by a client through the update interface.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Eq, PartialEq)]
pub struct UnicastRoute {
    pub prefix: Prefix,
    pub action: RouteAction,
    #[serde(default)]
    pub nexthops: Vec<NextHop>,
    /// Per-route admin distance override; the client's default applies
    /// when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_distance: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counter_id: Option<CounterId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_id: Option<ClassId>,
}

impl UnicastRoute {
    pub fn forward(
        prefix: Prefix,
        nexthops: impl IntoIterator<Item = NextHop>,
    ) -> Self {
        Self {
            prefix,
            action: RouteAction::Forward,
            nexthops: nexthops.into_iter().collect(),
            admin_distance: None,
            counter_id: None,
            class_id: None,
        }
    }

    pub fn drop(prefix: Prefix) -> Self {
        Self {
            prefix,
            action: RouteAction::Drop,
            nexthops: Vec::new(),
            admin_distance: None,
            counter_id: None,
            class_id: None,
        }
    }

    pub fn to_cpu(prefix: Prefix) -> Self {
        Self {
            prefix,
            action: RouteAction::ToCpu,
            nexthops: Vec::new(),
            admin_distance: None,
            counter_id: None,
            class_id: None,
        }
    }
}

/// The resolved forwarding state of a route.
#[derive(
    Debug, Clone, Default, Serialize, Deserialize, JsonSchema, Eq, PartialEq,
)]
#[serde(rename_all = "snake_case")]
pub enum Forwarding {
    /// Not resolved (yet, or at all). Routes left in this state after
    /// resolution are unresolvable and omitted from the programmed FIB.
    #[default]
    Unresolved,
    Drop,
    ToCpu,
    /// Forward over a non-empty set of fully resolved next-hops.
    Forward(BTreeSet<ResolvedNextHop>),
}

impl Forwarding {
    pub fn nexthops(&self) -> Option<&BTreeSet<ResolvedNextHop>> {
        match self {
            Self::Forward(set) => Some(set),
            _ => None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        !matches!(self, Self::Unresolved)
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct RouteFlags: u8 {
        /// The winning contribution is a directly connected subnet.
        const CONNECTED = 0x01;
        /// Resolution produced usable forwarding state.
        const RESOLVED = 0x02;
        /// Resolution ran and failed; the route is not programmed.
        const UNRESOLVABLE = 0x04;
        /// The route is on the resolution stack right now.
        const PROCESSING = 0x08;
        /// The winning contribution changed since the last resolution.
        const NEEDS_RESOLVE = 0x10;
    }
}

/// The merged state of one prefix: every client's contribution, the
/// admin-distance winner, and the forwarding state derived from it. The
/// prefix itself is the key of the containing tree.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct Route {
    entries: BTreeMap<ClientId, NextHopEntry>,
    best: Option<ClientId>,
    pub forwarding: Forwarding,
    pub flags: RouteFlags,
    pub class_id: Option<ClassId>,
}

impl Route {
    pub fn entry(&self, client: ClientId) -> Option<&NextHopEntry> {
        self.entries.get(&client)
    }

    pub fn entries(
        &self,
    ) -> impl Iterator<Item = (ClientId, &NextHopEntry)> + '_ {
        self.entries.iter().map(|(c, e)| (*c, e))
    }

    /// The client whose contribution won the admin-distance merge.
    pub fn best(&self) -> Option<ClientId> {
        self.best
    }

    pub fn best_entry(&self) -> Option<&NextHopEntry> {
        self.best.and_then(|c| self.entries.get(&c))
    }

    /// A route with no contributions left must be removed from its tree.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Install or replace `client`'s contribution, returning the prior
    /// one. Recomputes the winner.
    pub fn set_entry(
        &mut self,
        client: ClientId,
        entry: NextHopEntry,
    ) -> Option<NextHopEntry> {
        let prior_best = self.best_entry().cloned();
        let prior = self.entries.insert(client, entry);
        self.rebuild_best(prior_best);
        prior
    }

    /// Withdraw `client`'s contribution, returning it. Recomputes the
    /// winner.
    pub fn remove_entry(&mut self, client: ClientId) -> Option<NextHopEntry> {
        let prior_best = self.best_entry().cloned();
        let prior = self.entries.remove(&client);
        self.rebuild_best(prior_best);
        prior
    }

    // Lower admin distance wins; equal distances fall back to the fixed
    // client priority order (ClientId's Ord).
    fn rebuild_best(&mut self, prior_best: Option<NextHopEntry>) {
        self.best = self
            .entries
            .iter()
            .min_by_key(|(client, entry)| (entry.admin_distance, **client))
            .map(|(client, _)| *client);

        self.flags.set(
            RouteFlags::CONNECTED,
            self.best == Some(ClientId::Interface),
        );
        if self.best_entry().cloned() != prior_best {
            self.flags.insert(RouteFlags::NEEDS_RESOLVE);
        }
    }

    /// Reset derived resolution state ahead of a resolution pass.
    pub(crate) fn begin_resolution(&mut self) {
        self.flags.remove(
            RouteFlags::RESOLVED
                | RouteFlags::UNRESOLVABLE
                | RouteFlags::PROCESSING,
        );
        self.flags.insert(RouteFlags::NEEDS_RESOLVE);
        self.forwarding = Forwarding::Unresolved;
    }

    /// The egress interface of a directly connected route.
    pub fn connected_interface(&self) -> Option<InterfaceId> {
        if !self.flags.contains(RouteFlags::CONNECTED) {
            return None;
        }
        self.best_entry()
            .and_then(|e| e.nexthops.first())
            .and_then(|nh| nh.interface)
    }

    /// Flattened, serializable view of this route.
    pub fn details(&self, prefix: Prefix) -> RouteDetails {
        RouteDetails {
            prefix,
            entries: self
                .entries
                .iter()
                .map(|(client, entry)| ClientEntry {
                    client: *client,
                    entry: entry.clone(),
                })
                .collect(),
            best: self.best,
            forwarding: self.forwarding.clone(),
            connected: self.flags.contains(RouteFlags::CONNECTED),
            resolved: self.flags.contains(RouteFlags::RESOLVED),
            unresolvable: self.flags.contains(RouteFlags::UNRESOLVABLE),
            class_id: self.class_id,
        }
    }
}

/// One client's contribution, paired with its client, for external
/// consumption.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Eq, PartialEq)]
pub struct ClientEntry {
    pub client: ClientId,
    pub entry: NextHopEntry,
}

/// A flattened view of a route for inspection interfaces.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Eq, PartialEq)]
pub struct RouteDetails {
    pub prefix: Prefix,
    pub entries: Vec<ClientEntry>,
    pub best: Option<ClientId>,
    pub forwarding: Forwarding,
    pub connected: bool,
    pub resolved: bool,
    pub unresolvable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_id: Option<ClassId>,
}
