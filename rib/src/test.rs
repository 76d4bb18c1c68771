// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Test utilities: a stateful mock forwarding-plane programmer and
//! small helpers shared by the crate's test modules.

use crate::db::FibUpdateFn;
use crate::error::HwError;
use crate::tree::RouteTree;
use crate::types::{Forwarding, Prefix, RouterId};
use ipnet::{Ipv4Net, Ipv6Net};
use rib_common::lock;
use slog::Logger;
use std::sync::{Arc, Mutex};

pub fn test_logger() -> Logger {
    rib_common::log::build_logger(std::io::sink())
}

/// One successful publish as observed by the mock hardware: the VRF and
/// the programmable (resolved) routes, in tree order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FibSnapshot {
    pub vrf: RouterId,
    pub routes: Vec<(Prefix, Forwarding)>,
}

/// A stateful mock forwarding-plane programmer, with programmable
/// failure injection. Carries just enough state to be useful for tests.
/// Cheap to clone; all clones share the same state.
#[derive(Clone, Default)]
pub struct TestFib {
    published: Arc<Mutex<Vec<FibSnapshot>>>,
    failures_remaining: Arc<Mutex<usize>>,
}

impl TestFib {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject the next `n` publish attempts.
    pub fn fail_next(&self, n: usize) {
        *lock!(self.failures_remaining) = n;
    }

    /// The publish hook to hand to the rib. Records a snapshot of the
    /// resolved routes on success.
    pub fn callback(&self) -> FibUpdateFn {
        let fib = self.clone();
        Arc::new(move |vrf: RouterId,
                       v4: &RouteTree<Ipv4Net>,
                       v6: &RouteTree<Ipv6Net>| {
            {
                let mut failures = lock!(fib.failures_remaining);
                if *failures > 0 {
                    *failures -= 1;
                    return Err(HwError("injected failure".to_string()));
                }
            }
            let mut routes: Vec<(Prefix, Forwarding)> = Vec::new();
            for (p, r) in v4.iter() {
                if r.forwarding.is_resolved() {
                    routes.push((Prefix::V4(p.into()), r.forwarding.clone()));
                }
            }
            for (p, r) in v6.iter() {
                if r.forwarding.is_resolved() {
                    routes.push((Prefix::V6(p.into()), r.forwarding.clone()));
                }
            }
            lock!(fib.published).push(FibSnapshot { vrf, routes });
            Ok(())
        })
    }

    /// Number of successful publishes so far.
    pub fn publish_count(&self) -> usize {
        lock!(self.published).len()
    }

    /// The most recent successful publish.
    pub fn last(&self) -> Option<FibSnapshot> {
        lock!(self.published).last().cloned()
    }
}
