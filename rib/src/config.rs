// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Declarative route configuration and its application to a VRF's
//! tables.
//!
//! [`RibConfig`] is the full desired state handed to
//! [`crate::db::Rib::reconfigure`]: interface subnets per VRF plus the
//! three flavors of static routes. [`ConfigApplier`] reconciles one
//! VRF's tables against it by replacing the interface and static client
//! contributions wholesale; everything else in the table is left alone.

use crate::error::Error;
use crate::types::{
    ClientId, InterfaceId, Label, LabelStack, NextHop, NextHopEntry, Prefix,
    RouterId,
};
use crate::updater::RouteUpdater;
use itertools::Itertools;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;

/// A directly connected subnet: the interface's own address and mask,
/// plus the interface that owns it.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Eq, PartialEq)]
pub struct InterfaceRoute {
    /// The subnet, as configured on the interface.
    pub prefix: Prefix,
    /// The interface's own address inside the subnet.
    pub addr: IpAddr,
    pub interface: InterfaceId,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Eq, PartialEq)]
pub struct StaticRouteWithNextHops {
    pub vrf: RouterId,
    pub prefix: Prefix,
    pub nexthops: Vec<NextHop>,
}

#[derive(
    Debug, Copy, Clone, Serialize, Deserialize, JsonSchema, Eq, PartialEq,
)]
pub struct StaticRouteNoNextHops {
    pub vrf: RouterId,
    pub prefix: Prefix,
}

/// An MPLS next-hop for label cross-connects. Carried in configuration
/// and validated here; the label FIB itself is programmed by a different
/// subsystem.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Eq, PartialEq)]
pub struct MplsNextHop {
    pub addr: IpAddr,
    pub interface: Option<InterfaceId>,
    #[serde(default)]
    pub labels: LabelStack,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Eq, PartialEq)]
pub struct StaticMplsRouteWithNextHops {
    pub ingress_label: Label,
    pub nexthops: Vec<MplsNextHop>,
}

/// The full declarative route configuration.
#[derive(
    Debug, Clone, Default, Serialize, Deserialize, JsonSchema, Eq, PartialEq,
)]
pub struct RibConfig {
    pub vrf_interface_routes: BTreeMap<RouterId, Vec<InterfaceRoute>>,
    pub static_routes_with_nexthops: Vec<StaticRouteWithNextHops>,
    pub static_routes_to_null: Vec<StaticRouteNoNextHops>,
    pub static_routes_to_cpu: Vec<StaticRouteNoNextHops>,
    pub static_mpls_routes_with_nexthops: Vec<StaticMplsRouteWithNextHops>,
}

impl RibConfig {
    /// Every VRF named by this config, in order: the interface-route map
    /// plus any VRFs referenced only by static routes.
    pub fn vrfs(&self) -> Vec<RouterId> {
        self.vrf_interface_routes
            .keys()
            .copied()
            .chain(self.static_routes_with_nexthops.iter().map(|s| s.vrf))
            .chain(self.static_routes_to_null.iter().map(|s| s.vrf))
            .chain(self.static_routes_to_cpu.iter().map(|s| s.vrf))
            .sorted()
            .unique()
            .collect()
    }

    /// Reject malformed configuration before any table is touched.
    pub fn validate(&self) -> Result<(), Error> {
        for (vrf, routes) in &self.vrf_interface_routes {
            for ir in routes {
                ir.prefix.canonical()?;
                if !ir.prefix.covers(&ir.addr) {
                    return Err(Error::InvalidConfig(format!(
                        "vrf {vrf}: interface {} address {} is outside \
                         its subnet {}",
                        ir.interface, ir.addr, ir.prefix,
                    )));
                }
            }
        }
        for s in &self.static_routes_with_nexthops {
            s.prefix.canonical()?;
            if s.nexthops.is_empty() {
                return Err(Error::InvalidConfig(format!(
                    "static route {} has no next-hops",
                    s.prefix,
                )));
            }
            for nh in &s.nexthops {
                if nh.requires_interface() && nh.interface.is_none() {
                    return Err(Error::InvalidConfig(format!(
                        "static route {}: link-local next-hop {} requires \
                         an interface",
                        s.prefix, nh.addr,
                    )));
                }
            }
        }
        for s in self
            .static_routes_to_null
            .iter()
            .chain(self.static_routes_to_cpu.iter())
        {
            s.prefix.canonical()?;
        }
        for m in &self.static_mpls_routes_with_nexthops {
            if m.nexthops.is_empty() {
                return Err(Error::InvalidConfig(format!(
                    "mpls route for label {} has no next-hops",
                    m.ingress_label,
                )));
            }
            for nh in &m.nexthops {
                let link_local = match nh.addr {
                    IpAddr::V4(_) => false,
                    IpAddr::V6(a) => a.is_unicast_link_local(),
                };
                if link_local && nh.interface.is_none() {
                    return Err(Error::InvalidConfig(format!(
                        "mpls route for label {}: link-local next-hop {} \
                         requires an interface",
                        m.ingress_label, nh.addr,
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Reconciles one VRF's tables against a [`RibConfig`]. The config must
/// have passed [`RibConfig::validate`].
pub(crate) struct ConfigApplier<'a, 'b> {
    vrf: RouterId,
    config: &'a RibConfig,
    updater: &'a mut RouteUpdater<'b>,
}

impl<'a, 'b> ConfigApplier<'a, 'b> {
    pub(crate) fn new(
        vrf: RouterId,
        config: &'a RibConfig,
        updater: &'a mut RouteUpdater<'b>,
    ) -> Self {
        Self {
            vrf,
            config,
            updater,
        }
    }

    /// Replace the interface and static contributions of this VRF so
    /// they equal the configured sets. The caller finalizes and
    /// publishes.
    pub(crate) fn apply(&mut self) {
        self.apply_interface_routes();
        self.apply_static_routes();
    }

    fn apply_interface_routes(&mut self) {
        self.updater.remove_client_routes(ClientId::Interface);
        let Some(routes) = self.config.vrf_interface_routes.get(&self.vrf)
        else {
            return;
        };
        for ir in routes {
            let nh = NextHop::gateway(ir.addr).with_interface(ir.interface);
            let Ok(entry) = NextHopEntry::forward(
                [nh],
                crate::ADMIN_DISTANCE_DIRECTLY_CONNECTED,
            ) else {
                continue;
            };
            self.updater.add_route(&ir.prefix, ClientId::Interface, entry);
        }
    }

    fn apply_static_routes(&mut self) {
        self.updater.remove_client_routes(ClientId::Static);
        self.updater.remove_client_routes(ClientId::StaticNull);
        self.updater.remove_client_routes(ClientId::StaticCpu);

        for s in self
            .config
            .static_routes_with_nexthops
            .iter()
            .filter(|s| s.vrf == self.vrf)
        {
            // Validation guarantees a non-empty next-hop set.
            let Ok(entry) = NextHopEntry::forward(
                s.nexthops.iter().cloned(),
                crate::ADMIN_DISTANCE_STATIC,
            ) else {
                continue;
            };
            self.updater.add_route(&s.prefix, ClientId::Static, entry);
        }
        for s in self
            .config
            .static_routes_to_null
            .iter()
            .filter(|s| s.vrf == self.vrf)
        {
            self.updater.add_route(
                &s.prefix,
                ClientId::StaticNull,
                NextHopEntry::drop(crate::MAX_ADMIN_DISTANCE),
            );
        }
        for s in self
            .config
            .static_routes_to_cpu
            .iter()
            .filter(|s| s.vrf == self.vrf)
        {
            self.updater.add_route(
                &s.prefix,
                ClientId::StaticCpu,
                NextHopEntry::to_cpu(crate::MAX_ADMIN_DISTANCE),
            );
        }
    }
}
