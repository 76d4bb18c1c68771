// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-transaction route table mutation.
//!
//! A [`RouteUpdater`] stages one batch of per-client adds and deletes
//! against a VRF's [`RouteTable`], then [`RouteUpdater::finalize`]
//! recomputes resolved forwarding for the whole table.
//!
//! Every `(prefix, client)` pair touched by the batch records the
//! contribution that was in place before the batch, exactly once. That
//! journal, extracted with [`RouteUpdater::into_inverse`], is sufficient
//! to restore the pre-transaction table if the downstream publish fails:
//! merge and resolution are pure functions of the contributions.

use crate::resolve::resolve_table;
use crate::tree::RouteTable;
use crate::types::{ClientId, NextHopEntry, Prefix};
use std::collections::BTreeSet;

struct JournalEntry {
    prefix: Prefix,
    client: ClientId,
    prior: Option<NextHopEntry>,
}

/// The add/delete batch that undoes a transaction, produced by
/// [`RouteUpdater::into_inverse`] and consumed by
/// [`RouteUpdater::apply_inverse`].
pub struct InverseDelta {
    entries: Vec<JournalEntry>,
}

impl InverseDelta {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

pub struct RouteUpdater<'a> {
    table: &'a mut RouteTable,
    journal: Vec<JournalEntry>,
    touched: BTreeSet<(Prefix, ClientId)>,
}

impl<'a> RouteUpdater<'a> {
    pub fn new(table: &'a mut RouteTable) -> Self {
        Self {
            table,
            journal: Vec::new(),
            touched: BTreeSet::new(),
        }
    }

    /// Install or replace `client`'s contribution for `prefix`. The
    /// prefix length must be valid (the coordinator validates inputs
    /// before staging); host bits are zeroed here so the journal keys
    /// by the canonical prefix.
    pub fn add_route(
        &mut self,
        prefix: &Prefix,
        client: ClientId,
        entry: NextHopEntry,
    ) {
        let prefix = prefix.normalized();
        let route = self.table.insert_or_default(&prefix);
        let prior = route.entry(client).cloned();
        route.set_entry(client, entry);
        if self.touched.insert((prefix, client)) {
            self.journal.push(JournalEntry {
                prefix,
                client,
                prior,
            });
        }
    }

    /// Withdraw `client`'s contribution for `prefix`, removing the route
    /// once its last contribution is gone. Deleting an absent pair is a
    /// no-op, not an error.
    pub fn del_route(
        &mut self,
        prefix: &Prefix,
        client: ClientId,
    ) -> Option<NextHopEntry> {
        let prefix = prefix.normalized();
        let route = self.table.exact_match_mut(&prefix)?;
        let prior = route.remove_entry(client)?;
        if self
            .table
            .exact_match(&prefix)
            .is_some_and(|r| r.is_empty())
        {
            self.table.remove(&prefix);
        }
        if self.touched.insert((prefix, client)) {
            self.journal.push(JournalEntry {
                prefix,
                client,
                prior: Some(prior.clone()),
            });
        }
        Some(prior)
    }

    /// Withdraw every contribution `client` has in the table. Returns
    /// the prefixes that carried one.
    pub fn remove_client_routes(&mut self, client: ClientId) -> Vec<Prefix> {
        let mut removed = Vec::new();
        for prefix in self.table.keys() {
            if self.del_route(&prefix, client).is_some() {
                removed.push(prefix);
            }
        }
        removed
    }

    /// Recompute resolved forwarding for the whole table. Call after all
    /// adds and deletes of the transaction are staged.
    pub fn finalize(&mut self) {
        resolve_table(self.table);
    }

    /// Consume the updater, handing back the journal that restores the
    /// pre-transaction contributions.
    pub fn into_inverse(self) -> InverseDelta {
        InverseDelta {
            entries: self.journal,
        }
    }

    /// Re-stage the contributions recorded in `inverse`: adds and
    /// deletes swap, prior winners come back.
    pub fn apply_inverse(&mut self, inverse: InverseDelta) {
        for entry in inverse.entries {
            match entry.prior {
                Some(prior) => {
                    self.add_route(&entry.prefix, entry.client, prior)
                }
                None => {
                    self.del_route(&entry.prefix, entry.client);
                }
            }
        }
    }
}
