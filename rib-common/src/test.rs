// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Test macros shared across the workspace's test modules.

pub const DEFAULT_INTERVAL_MS: u64 = 10;
pub const DEFAULT_ITERATIONS: u64 = 500;

#[macro_export]
macro_rules! wait_for {
    ($cond:expr, $period_ms:expr, $count:expr, $msg:tt) => {
        let mut ok = false;
        for _ in 0..$count {
            if $cond {
                ok = true;
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis($period_ms));
        }
        if !ok {
            assert!($cond, $msg);
        }
    };
    ($cond:expr, $period_ms:expr, $count:expr) => {
        $crate::wait_for!($cond, $period_ms, $count, "condition not reached");
    };
    ($cond:expr, $msg:tt) => {
        $crate::wait_for!(
            $cond,
            $crate::test::DEFAULT_INTERVAL_MS,
            $crate::test::DEFAULT_ITERATIONS,
            $msg
        );
    };
    ($cond:expr) => {
        $crate::wait_for!(
            $cond,
            $crate::test::DEFAULT_INTERVAL_MS,
            $crate::test::DEFAULT_ITERATIONS,
            "condition not reached"
        );
    };
}

#[macro_export]
macro_rules! parse {
    ($x:expr, $err:expr) => {
        $x.parse().expect($err)
    };
}

#[macro_export]
macro_rules! ip {
    ($x:expr) => {
        $crate::parse!($x, "ip address")
    };
}

#[macro_export]
macro_rules! cidr {
    ($x:expr) => {
        $crate::parse!($x, "ip cidr")
    };
}
