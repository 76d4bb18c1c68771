// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The RIB coordinator.
//!
//! [`Rib`] owns the map of VRF route tables and the single writer thread
//! that serializes every mutation. Callers hand mutating operations a
//! forwarding-plane publish hook; within one writer task the rib stages
//! the changes, re-resolves forwarding, publishes the resolved trees,
//! and either commits or rolls the tables back to their pre-task state
//! when the hardware rejects the publish.
//!
//! Readers take a shared lock on the VRF map and see either the full
//! pre-state or the full post-state of any committed task.

use crate::config::{ConfigApplier, RibConfig};
use crate::error::{Error, HwError};
use crate::log::rib_log;
use crate::snapshot;
use crate::tree::{RouteTable, RouteTree};
use crate::types::{
    ClassId, ClientId, NextHopEntry, Prefix, RouteDetails, RouterId,
    UnicastRoute,
};
use crate::updater::RouteUpdater;
use ipnet::{Ipv4Net, Ipv6Net};
use rib_common::{lock, read_lock, write_lock};
use slog::Logger;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// The VRF map: every routing domain's tables.
pub type RouterTables = BTreeMap<RouterId, RouteTable>;

/// Result of a forwarding-plane publish.
pub type FibUpdateResult = Result<(), HwError>;

/// The forwarding-plane publish hook. Called synchronously from the
/// writer, once per committed update per VRF, with immutable views of
/// the resolved trees. Routes left unresolvable are present in the trees
/// but carry no forwarding state; the programmer skips them.
///
/// The hook must not call back into the [`Rib`]: the writer is blocked
/// for the duration of the call.
pub type FibUpdateFn = Arc<
    dyn Fn(RouterId, &RouteTree<Ipv4Net>, &RouteTree<Ipv6Net>) -> FibUpdateResult
        + Send
        + Sync,
>;

/// Counters for one update call.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct UpdateStatistics {
    pub v4_routes_added: u64,
    pub v4_routes_deleted: u64,
    pub v6_routes_added: u64,
    pub v6_routes_deleted: u64,
    pub duration: Duration,
}

type Task = Box<dyn FnOnce() + Send>;

/// The writer thread and its FIFO queue. Dropping the handle closes the
/// queue; the thread drains whatever is left and exits, and the drop
/// joins it.
struct Writer {
    tx: Mutex<Option<Sender<Task>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Writer {
    fn spawn(log: Logger) -> Self {
        let (tx, rx) = mpsc::channel::<Task>();
        let thread = thread::Builder::new()
            .name("rib-writer".to_string())
            .spawn(move || {
                while let Ok(task) = rx.recv() {
                    task();
                }
                rib_log!(log, debug, "rib writer drained, exiting");
            })
            .expect("spawn rib writer thread");
        Self {
            tx: Mutex::new(Some(tx)),
            thread: Mutex::new(Some(thread)),
        }
    }

    fn submit(&self, task: Task) -> Result<(), Error> {
        match lock!(self.tx).as_ref() {
            Some(tx) => tx.send(task).map_err(|_| Error::Shutdown),
            None => Err(Error::Shutdown),
        }
    }
}

impl Drop for Writer {
    fn drop(&mut self) {
        lock!(self.tx).take();
        if let Some(thread) = lock!(self.thread).take() {
            let _ = thread.join();
        }
    }
}

/// The routing information base. Cheap to clone; all clones share the
/// same tables and writer. The writer drains and joins when the last
/// clone is dropped.
#[derive(Clone)]
pub struct Rib {
    tables: Arc<RwLock<RouterTables>>,
    writer: Arc<Writer>,
    log: Logger,
}

impl Rib {
    pub fn new(log: Logger) -> Self {
        let writer = Writer::spawn(log.clone());
        Self {
            tables: Arc::new(RwLock::new(RouterTables::new())),
            writer: Arc::new(writer),
            log,
        }
    }

    /// Restore a rib from a snapshot produced by [`Rib::to_snapshot`].
    /// Forwarding state is rederived by running resolution; nothing is
    /// published.
    pub fn from_snapshot(bytes: &[u8], log: Logger) -> Result<Self, Error> {
        let tables = snapshot::deserialize(bytes)?;
        let rib = Self::new(log);
        *write_lock!(rib.tables) = tables;
        Ok(rib)
    }

    /// Serialize the whole rib as a self-describing document.
    pub fn to_snapshot(&self) -> Result<Vec<u8>, Error> {
        snapshot::serialize(&read_lock!(self.tables))
    }

    /// Run `f` on the writer thread and wait for its result.
    fn run_sync<R, F>(&self, f: F) -> Result<R, Error>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        self.writer.submit(Box::new(move || {
            let _ = tx.send(f());
        }))?;
        rx.recv().map_err(|_| Error::Shutdown)
    }

    /// Create a VRF if it does not exist yet. Idempotent.
    pub fn ensure_vrf(&self, vrf: RouterId) -> Result<(), Error> {
        let tables = self.tables.clone();
        self.run_sync(move || {
            write_lock!(tables).entry(vrf).or_default();
        })
    }

    /// The currently configured VRFs.
    pub fn vrfs(&self) -> Vec<RouterId> {
        read_lock!(self.tables).keys().copied().collect()
    }

    /// A consistent snapshot of every route in `vrf`.
    pub fn get_routes(&self, vrf: RouterId) -> Result<Vec<RouteDetails>, Error> {
        let guard = read_lock!(self.tables);
        let table = guard.get(&vrf).ok_or(Error::UnknownVrf(vrf))?;
        Ok(table.iter().map(|(p, r)| r.details(p)).collect())
    }

    /// Longest-prefix-match lookup of one address in `vrf`.
    pub fn longest_match(
        &self,
        vrf: RouterId,
        addr: IpAddr,
    ) -> Result<Option<RouteDetails>, Error> {
        let guard = read_lock!(self.tables);
        let table = guard.get(&vrf).ok_or(Error::UnknownVrf(vrf))?;
        Ok(table.longest_match(&addr).map(|(p, r)| r.details(p)))
    }

    /// Apply one client's delta to a VRF: add or replace `to_add`,
    /// withdraw `to_delete`, optionally dropping every prior route of
    /// the client first. The call is serialized with all other mutations
    /// and atomic: on a hardware publish failure the tables are rolled
    /// back, the prior state is republished, and the original error is
    /// returned.
    #[allow(clippy::too_many_arguments)]
    pub fn update(
        &self,
        vrf: RouterId,
        client: ClientId,
        admin_distance: u8,
        to_add: Vec<UnicastRoute>,
        to_delete: Vec<Prefix>,
        reset_client_routes: bool,
        fib: FibUpdateFn,
    ) -> Result<UpdateStatistics, Error> {
        // Validate and stage everything before any mutation.
        let mut adds: Vec<(Prefix, NextHopEntry)> =
            Vec::with_capacity(to_add.len());
        for route in &to_add {
            let prefix = route.prefix.canonical()?;
            let entry = NextHopEntry::from_unicast(route, admin_distance)?;
            adds.push((prefix, entry));
        }
        let mut dels: Vec<Prefix> = Vec::with_capacity(to_delete.len());
        for prefix in &to_delete {
            dels.push(prefix.canonical()?);
        }

        let tables = self.tables.clone();
        let log = self.log.clone();
        self.run_sync(move || {
            run_update(
                &tables,
                &log,
                vrf,
                client,
                adds,
                dels,
                reset_client_routes,
                fib,
            )
        })?
    }

    /// Reconcile the rib against a full declarative config: the VRF set
    /// is replaced to equal the config's, and each VRF's interface and
    /// static contributions are replaced and republished.
    pub fn reconfigure(
        &self,
        config: RibConfig,
        fib: FibUpdateFn,
    ) -> Result<(), Error> {
        config.validate()?;
        let tables = self.tables.clone();
        let log = self.log.clone();
        self.run_sync(move || run_reconfigure(&tables, &log, &config, fib))?
    }

    /// Tag (or untag, with `None`) routes with a forwarding class. The
    /// change goes through the writer like any other mutation and is
    /// republished; with `async_update` the call returns as soon as the
    /// task is queued.
    pub fn set_class_id(
        &self,
        vrf: RouterId,
        prefixes: Vec<Prefix>,
        class_id: Option<ClassId>,
        fib: FibUpdateFn,
        async_update: bool,
    ) -> Result<(), Error> {
        let mut canonical: Vec<Prefix> = Vec::with_capacity(prefixes.len());
        for prefix in &prefixes {
            canonical.push(prefix.canonical()?);
        }

        let tables = self.tables.clone();
        if async_update {
            let log = self.log.clone();
            self.writer.submit(Box::new(move || {
                if let Err(e) =
                    run_set_class_id(&tables, vrf, canonical, class_id, fib)
                {
                    rib_log!(log,
                        error,
                        "async class-id update for vrf {vrf} failed: {e}";
                        "vrf" => format!("{vrf}"),
                        "error" => format!("{e}")
                    );
                }
            }))
        } else {
            self.run_sync(move || {
                run_set_class_id(&tables, vrf, canonical, class_id, fib)
            })?
        }
    }
}

impl PartialEq for Rib {
    fn eq(&self, other: &Self) -> bool {
        if Arc::ptr_eq(&self.tables, &other.tables) {
            return true;
        }
        *read_lock!(self.tables) == *read_lock!(other.tables)
    }
}

#[allow(clippy::too_many_arguments)]
fn run_update(
    tables: &RwLock<RouterTables>,
    log: &Logger,
    vrf: RouterId,
    client: ClientId,
    adds: Vec<(Prefix, NextHopEntry)>,
    dels: Vec<Prefix>,
    reset_client_routes: bool,
    fib: FibUpdateFn,
) -> Result<UpdateStatistics, Error> {
    let start = Instant::now();
    let mut guard = write_lock!(tables);
    let table = guard.get_mut(&vrf).ok_or(Error::UnknownVrf(vrf))?;

    let mut stats = UpdateStatistics::default();
    let mut updater = RouteUpdater::new(table);

    if reset_client_routes {
        let removed = updater.remove_client_routes(client);
        rib_log!(log,
            debug,
            "vrf {vrf}: reset {client}, removed {} routes", removed.len();
            "vrf" => format!("{vrf}"),
            "client" => format!("{client}")
        );
    }
    for (prefix, entry) in adds {
        if prefix.is_v4() {
            stats.v4_routes_added += 1;
        } else {
            stats.v6_routes_added += 1;
        }
        updater.add_route(&prefix, client, entry);
    }
    for prefix in dels {
        if updater.del_route(&prefix, client).is_some() {
            if prefix.is_v4() {
                stats.v4_routes_deleted += 1;
            } else {
                stats.v6_routes_deleted += 1;
            }
        }
    }
    updater.finalize();
    let inverse = updater.into_inverse();

    match fib(vrf, &table.v4, &table.v6) {
        Ok(()) => {
            stats.duration = start.elapsed();
            Ok(stats)
        }
        Err(hw) => {
            rib_log!(log,
                error,
                "vrf {vrf}: fib update failed, rolling back {} routes: {hw}",
                inverse.len();
                "vrf" => format!("{vrf}"),
                "error" => format!("{hw}")
            );
            let mut rollback = RouteUpdater::new(table);
            rollback.apply_inverse(inverse);
            rollback.finalize();
            if let Err(e) = fib(vrf, &table.v4, &table.v6) {
                fatal_republish_failure(log, vrf, &e);
            }
            Err(Error::HwUpdate(hw))
        }
    }
}

fn run_reconfigure(
    tables: &RwLock<RouterTables>,
    log: &Logger,
    config: &RibConfig,
    fib: FibUpdateFn,
) -> Result<(), Error> {
    let mut guard = write_lock!(tables);

    // Replace the VRF set: keep tables for VRFs the config names, start
    // empty ones for VRFs it introduces, drop the rest.
    let vrfs = config.vrfs();
    let mut new_tables = RouterTables::new();
    for vrf in &vrfs {
        let table = guard.remove(vrf).unwrap_or_default();
        new_tables.insert(*vrf, table);
    }
    let dropped = guard.len();
    if dropped > 0 {
        rib_log!(log, info, "reconfigure: dropping {dropped} stale vrfs");
    }
    *guard = new_tables;

    for vrf in &vrfs {
        let Some(table) = guard.get_mut(vrf) else {
            continue;
        };
        let mut updater = RouteUpdater::new(table);
        ConfigApplier::new(*vrf, config, &mut updater).apply();
        updater.finalize();
        let inverse = updater.into_inverse();

        if let Err(hw) = fib(*vrf, &table.v4, &table.v6) {
            rib_log!(log,
                error,
                "vrf {vrf}: fib update failed during reconfigure, \
                 rolling back: {hw}";
                "vrf" => format!("{vrf}"),
                "error" => format!("{hw}")
            );
            let mut rollback = RouteUpdater::new(table);
            rollback.apply_inverse(inverse);
            rollback.finalize();
            if let Err(e) = fib(*vrf, &table.v4, &table.v6) {
                fatal_republish_failure(log, *vrf, &e);
            }
            return Err(Error::HwUpdate(hw));
        }
    }
    Ok(())
}

fn run_set_class_id(
    tables: &RwLock<RouterTables>,
    vrf: RouterId,
    prefixes: Vec<Prefix>,
    class_id: Option<ClassId>,
    fib: FibUpdateFn,
) -> Result<(), Error> {
    let mut guard = write_lock!(tables);
    let table = guard.get_mut(&vrf).ok_or(Error::UnknownVrf(vrf))?;
    for prefix in &prefixes {
        if let Some(route) = table.exact_match_mut(prefix) {
            route.class_id = class_id;
        }
    }
    fib(vrf, &table.v4, &table.v6)?;
    Ok(())
}

// The rollback republish is the last line of defense: if the hardware
// will not take the pre-update state back, the rib and the forwarding
// plane have diverged and nothing further can be trusted.
fn fatal_republish_failure(log: &Logger, vrf: RouterId, err: &HwError) -> ! {
    rib_log!(log,
        crit,
        "vrf {vrf}: republish of pre-update state failed: {err}";
        "vrf" => format!("{vrf}"),
        "error" => format!("{err}")
    );
    std::process::abort();
}
