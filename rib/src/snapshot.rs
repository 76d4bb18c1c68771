// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Warm-boot snapshot codec.
//!
//! The rib serializes to a self-describing JSON document: a top-level
//! map of stringified router ids, each holding the VRF's v4 and v6
//! routes with their per-client contributions. The winning entry is
//! written out for self-description but recomputed on load, and
//! forwarding state is rederived by running resolution; only the
//! contributions are authoritative.
//!
//! The format is additive: unknown fields are ignored on load, so newer
//! snapshots load on older code. Structural damage surfaces as
//! [`Error::CorruptSnapshot`] and leaves the caller's state untouched.

use crate::error::Error;
use crate::resolve;
use crate::tree::RouteTable;
use crate::types::{
    ClassId, ClientId, CounterId, Label, NextHop, NextHopEntry, Prefix,
    Route, RouteAction, RouterId,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;

use crate::db::RouterTables;

#[derive(Debug, Serialize, Deserialize)]
struct TableSnapshot {
    #[serde(rename = "routerId")]
    router_id: u32,
    v4: Vec<RouteSnapshot>,
    v6: Vec<RouteSnapshot>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RouteSnapshot {
    prefix: String,
    client_entries: Vec<ClientEntrySnapshot>,
    best_entry: Option<ClientEntrySnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    class_id: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ClientEntrySnapshot {
    client_id: u32,
    admin_distance: u8,
    action: RouteAction,
    nexthops: Vec<NextHopSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    counter_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    class_id: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
struct NextHopSnapshot {
    addr: IpAddr,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    interface: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    labels: Vec<u32>,
    weight: u32,
}

fn entry_snapshot(
    client: ClientId,
    entry: &NextHopEntry,
) -> ClientEntrySnapshot {
    ClientEntrySnapshot {
        client_id: client.id(),
        admin_distance: entry.admin_distance,
        action: entry.action,
        nexthops: entry
            .nexthops
            .iter()
            .map(|nh| NextHopSnapshot {
                addr: nh.addr,
                interface: nh.interface.map(|i| i.0),
                labels: nh.labels.iter().map(|l| l.0).collect(),
                weight: nh.weight,
            })
            .collect(),
        counter_id: entry.counter_id.map(|c| c.0),
        class_id: entry.class_id.map(|c| c.0),
    }
}

fn route_snapshot(prefix: Prefix, route: &Route) -> RouteSnapshot {
    RouteSnapshot {
        prefix: prefix.to_string(),
        client_entries: route
            .entries()
            .map(|(client, entry)| entry_snapshot(client, entry))
            .collect(),
        best_entry: route
            .best()
            .zip(route.best_entry())
            .map(|(client, entry)| entry_snapshot(client, entry)),
        class_id: route.class_id.map(|c| c.0),
    }
}

pub(crate) fn serialize(tables: &RouterTables) -> Result<Vec<u8>, Error> {
    let mut document: BTreeMap<String, TableSnapshot> = BTreeMap::new();
    for (vrf, table) in tables {
        document.insert(
            vrf.to_string(),
            TableSnapshot {
                router_id: vrf.0,
                v4: table
                    .v4
                    .iter()
                    .map(|(p, r)| route_snapshot(Prefix::V4(p.into()), r))
                    .collect(),
                v6: table
                    .v6
                    .iter()
                    .map(|(p, r)| route_snapshot(Prefix::V6(p.into()), r))
                    .collect(),
            },
        );
    }
    Ok(serde_json::to_vec(&document)?)
}

fn corrupt(detail: impl ToString) -> Error {
    Error::CorruptSnapshot(detail.to_string())
}

fn load_entry(
    snapshot: &ClientEntrySnapshot,
) -> Result<(ClientId, NextHopEntry), Error> {
    let client = ClientId::from_id(snapshot.client_id).ok_or_else(|| {
        corrupt(format!("unknown client id {}", snapshot.client_id))
    })?;
    let nexthops = snapshot.nexthops.iter().map(|nh| NextHop {
        addr: nh.addr,
        interface: nh.interface.map(crate::types::InterfaceId),
        labels: nh.labels.iter().copied().map(Label).collect(),
        weight: nh.weight,
    });
    let mut entry = match snapshot.action {
        RouteAction::Drop => NextHopEntry::drop(snapshot.admin_distance),
        RouteAction::ToCpu => NextHopEntry::to_cpu(snapshot.admin_distance),
        RouteAction::Forward => {
            NextHopEntry::forward(nexthops, snapshot.admin_distance)
                .map_err(|e| corrupt(format!("client {client}: {e}")))?
        }
    };
    entry.counter_id = snapshot.counter_id.map(CounterId);
    entry.class_id = snapshot.class_id.map(ClassId);
    Ok((client, entry))
}

fn load_route(
    table: &mut RouteTable,
    snapshot: &RouteSnapshot,
    v4: bool,
) -> Result<(), Error> {
    let prefix: Prefix = snapshot
        .prefix
        .parse()
        .map_err(|e| corrupt(format!("prefix {}: {e}", snapshot.prefix)))?;
    if prefix.is_v4() != v4 {
        return Err(corrupt(format!(
            "prefix {} in the wrong address-family list",
            snapshot.prefix,
        )));
    }
    if snapshot.client_entries.is_empty() {
        return Err(corrupt(format!(
            "route {} has no client entries",
            snapshot.prefix,
        )));
    }
    let route = table.insert_or_default(&prefix);
    for entry in &snapshot.client_entries {
        let (client, entry) = load_entry(entry)?;
        route.set_entry(client, entry);
    }
    route.class_id = snapshot.class_id.map(ClassId);
    Ok(())
}

pub(crate) fn deserialize(bytes: &[u8]) -> Result<RouterTables, Error> {
    let document: BTreeMap<String, TableSnapshot> =
        serde_json::from_slice(bytes).map_err(corrupt)?;

    let mut tables = RouterTables::new();
    for (key, table_snapshot) in &document {
        let vrf: u32 = key
            .parse()
            .map_err(|_| corrupt(format!("router id key `{key}`")))?;
        if vrf != table_snapshot.router_id {
            return Err(corrupt(format!(
                "router id key {key} does not match body {}",
                table_snapshot.router_id,
            )));
        }
        let mut table = RouteTable::new();
        for route in &table_snapshot.v4 {
            load_route(&mut table, route, true)?;
        }
        for route in &table_snapshot.v6 {
            load_route(&mut table, route, false)?;
        }
        resolve::resolve_table(&mut table);
        tables.insert(RouterId(vrf), table);
    }
    Ok(tables)
}
