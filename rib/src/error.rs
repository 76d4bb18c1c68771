// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use rib_types::RouterId;

/// Error returned by a downstream forwarding-plane programmer that
/// rejected a published snapshot.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("hardware update rejected: {0}")]
pub struct HwError(pub String);

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid prefix: {0}")]
    InvalidPrefix(#[from] rib_types::PrefixError),

    #[error("invalid next hop: {0}")]
    InvalidNextHop(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("VRF {0} not configured")]
    UnknownVrf(RouterId),

    #[error("hardware update failed: {0}")]
    HwUpdate(#[from] HwError),

    #[error("corrupt snapshot: {0}")]
    CorruptSnapshot(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("rib writer is shut down")]
    Shutdown,
}
