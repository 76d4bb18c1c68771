// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Prefix and routing-domain primitives shared across the RIB workspace.
//!
//! This crate has minimal dependencies so that clients of the RIB can name
//! prefixes and routing domains without pulling in the full implementation.

use ipnet::{Ipv4Net, Ipv6Net};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt::{self, Formatter};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// Errors produced when validating prefixes at the API boundary.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PrefixError {
    #[error("prefix length {length} exceeds maximum {max}")]
    Length { length: u8, max: u8 },

    #[error("malformed prefix `{0}`")]
    Malformed(String),
}

/// A routing domain identifier (VRF id). Routes in different domains do
/// not cross-resolve.
#[derive(
    Debug,
    Copy,
    Clone,
    Serialize,
    Deserialize,
    Hash,
    Eq,
    PartialEq,
    PartialOrd,
    Ord,
    JsonSchema,
)]
pub struct RouterId(pub u32);

impl fmt::Display for RouterId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for RouterId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

#[derive(
    Debug, Copy, Clone, Serialize, Deserialize, Hash, Eq, PartialEq, JsonSchema,
)]
pub struct Prefix4 {
    pub addr: Ipv4Addr,
    pub length: u8,
}

impl PartialOrd for Prefix4 {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Prefix4 {
    fn cmp(&self, other: &Self) -> Ordering {
        if self.addr != other.addr {
            return self.addr.cmp(&other.addr);
        }
        self.length.cmp(&other.length)
    }
}

impl Prefix4 {
    pub const MAX_LENGTH: u8 = 32;

    /// Create a new `Prefix4`, validating the mask length and zeroing host
    /// bits beyond the mask.
    pub fn new(addr: Ipv4Addr, length: u8) -> Result<Self, PrefixError> {
        if length > Self::MAX_LENGTH {
            return Err(PrefixError::Length {
                length,
                max: Self::MAX_LENGTH,
            });
        }
        let mut p = Self { addr, length };
        p.unset_host_bits();
        Ok(p)
    }

    /// A host route covering exactly `addr`.
    pub fn host(addr: Ipv4Addr) -> Self {
        Self {
            addr,
            length: Self::MAX_LENGTH,
        }
    }

    fn mask(&self) -> u32 {
        match self.length {
            0 => 0,
            _ => (!0u32) << (32 - self.length),
        }
    }

    pub fn host_bits_are_unset(&self) -> bool {
        self.addr.to_bits() & self.mask() == self.addr.to_bits()
    }

    pub fn unset_host_bits(&mut self) {
        self.addr = Ipv4Addr::from_bits(self.addr.to_bits() & self.mask());
    }

    /// Check whether this prefix covers `addr`.
    pub fn covers(&self, addr: &Ipv4Addr) -> bool {
        addr.to_bits() & self.mask() == self.addr.to_bits() & self.mask()
    }
}

impl fmt::Display for Prefix4 {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.length)
    }
}

impl FromStr for Prefix4 {
    type Err = PrefixError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, length) = s
            .split_once('/')
            .ok_or_else(|| PrefixError::Malformed(s.to_string()))?;
        let addr = addr
            .parse()
            .map_err(|_| PrefixError::Malformed(s.to_string()))?;
        let length = length
            .parse()
            .map_err(|_| PrefixError::Malformed(s.to_string()))?;
        Self::new(addr, length)
    }
}

impl From<Prefix4> for Ipv4Net {
    fn from(value: Prefix4) -> Self {
        // Lengths are validated at construction.
        Ipv4Net::new(value.addr, value.length).expect("prefix length <= 32")
    }
}

impl From<Ipv4Net> for Prefix4 {
    fn from(value: Ipv4Net) -> Self {
        let value = value.trunc();
        Self {
            addr: value.addr(),
            length: value.prefix_len(),
        }
    }
}

#[derive(
    Debug, Copy, Clone, Serialize, Deserialize, Hash, Eq, PartialEq, JsonSchema,
)]
pub struct Prefix6 {
    pub addr: Ipv6Addr,
    pub length: u8,
}

impl PartialOrd for Prefix6 {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Prefix6 {
    fn cmp(&self, other: &Self) -> Ordering {
        if self.addr != other.addr {
            return self.addr.cmp(&other.addr);
        }
        self.length.cmp(&other.length)
    }
}

impl Prefix6 {
    pub const MAX_LENGTH: u8 = 128;

    /// Create a new `Prefix6`, validating the mask length and zeroing host
    /// bits beyond the mask.
    pub fn new(addr: Ipv6Addr, length: u8) -> Result<Self, PrefixError> {
        if length > Self::MAX_LENGTH {
            return Err(PrefixError::Length {
                length,
                max: Self::MAX_LENGTH,
            });
        }
        let mut p = Self { addr, length };
        p.unset_host_bits();
        Ok(p)
    }

    /// A host route covering exactly `addr`.
    pub fn host(addr: Ipv6Addr) -> Self {
        Self {
            addr,
            length: Self::MAX_LENGTH,
        }
    }

    fn mask(&self) -> u128 {
        match self.length {
            0 => 0,
            _ => (!0u128) << (128 - self.length),
        }
    }

    pub fn host_bits_are_unset(&self) -> bool {
        self.addr.to_bits() & self.mask() == self.addr.to_bits()
    }

    pub fn unset_host_bits(&mut self) {
        self.addr = Ipv6Addr::from_bits(self.addr.to_bits() & self.mask());
    }

    /// Check whether this prefix covers `addr`.
    pub fn covers(&self, addr: &Ipv6Addr) -> bool {
        addr.to_bits() & self.mask() == self.addr.to_bits() & self.mask()
    }
}

impl fmt::Display for Prefix6 {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.length)
    }
}

impl FromStr for Prefix6 {
    type Err = PrefixError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, length) = s
            .split_once('/')
            .ok_or_else(|| PrefixError::Malformed(s.to_string()))?;
        let addr = addr
            .parse()
            .map_err(|_| PrefixError::Malformed(s.to_string()))?;
        let length = length
            .parse()
            .map_err(|_| PrefixError::Malformed(s.to_string()))?;
        Self::new(addr, length)
    }
}

impl From<Prefix6> for Ipv6Net {
    fn from(value: Prefix6) -> Self {
        // Lengths are validated at construction.
        Ipv6Net::new(value.addr, value.length).expect("prefix length <= 128")
    }
}

impl From<Ipv6Net> for Prefix6 {
    fn from(value: Ipv6Net) -> Self {
        let value = value.trunc();
        Self {
            addr: value.addr(),
            length: value.prefix_len(),
        }
    }
}

#[derive(
    Debug,
    Copy,
    Clone,
    Serialize,
    Deserialize,
    Eq,
    Hash,
    PartialEq,
    JsonSchema,
    PartialOrd,
    Ord,
)]
pub enum Prefix {
    V4(Prefix4),
    V6(Prefix6),
}

impl fmt::Display for Prefix {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Prefix::V4(p) => p.fmt(f),
            Prefix::V6(p) => p.fmt(f),
        }
    }
}

impl From<Prefix4> for Prefix {
    fn from(value: Prefix4) -> Self {
        Self::V4(value)
    }
}

impl From<Prefix6> for Prefix {
    fn from(value: Prefix6) -> Self {
        Self::V6(value)
    }
}

impl FromStr for Prefix {
    type Err = PrefixError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.contains(':') {
            Ok(Self::V6(s.parse()?))
        } else {
            Ok(Self::V4(s.parse()?))
        }
    }
}

impl Prefix {
    pub fn new(addr: IpAddr, length: u8) -> Result<Self, PrefixError> {
        match addr {
            IpAddr::V4(a) => Ok(Self::V4(Prefix4::new(a, length)?)),
            IpAddr::V6(a) => Ok(Self::V6(Prefix6::new(a, length)?)),
        }
    }

    /// A host route covering exactly `addr`.
    pub fn host(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(a) => Self::V4(Prefix4::host(a)),
            IpAddr::V6(a) => Self::V6(Prefix6::host(a)),
        }
    }

    pub fn addr(&self) -> IpAddr {
        match self {
            Self::V4(p) => IpAddr::V4(p.addr),
            Self::V6(p) => IpAddr::V6(p.addr),
        }
    }

    pub fn length(&self) -> u8 {
        match self {
            Self::V4(p) => p.length,
            Self::V6(p) => p.length,
        }
    }

    pub fn family(&self) -> AddressFamily {
        match self {
            Self::V4(_) => AddressFamily::Ipv4,
            Self::V6(_) => AddressFamily::Ipv6,
        }
    }

    pub fn is_v4(&self) -> bool {
        matches!(self, Self::V4(_))
    }

    pub fn host_bits_are_unset(&self) -> bool {
        match self {
            Self::V4(p) => p.host_bits_are_unset(),
            Self::V6(p) => p.host_bits_are_unset(),
        }
    }

    /// This prefix with host bits beyond the mask zeroed. The length
    /// must be valid; use [`Prefix::canonical`] for unvalidated input.
    pub fn normalized(&self) -> Self {
        let mut p = *self;
        match &mut p {
            Self::V4(v) => v.unset_host_bits(),
            Self::V6(v) => v.unset_host_bits(),
        }
        p
    }

    /// The canonical form of this prefix: mask length validated and host
    /// bits zeroed. Values built through the constructors are already
    /// canonical; values arriving through deserialization may not be.
    pub fn canonical(&self) -> Result<Self, PrefixError> {
        match self {
            Self::V4(p) => Ok(Self::V4(Prefix4::new(p.addr, p.length)?)),
            Self::V6(p) => Ok(Self::V6(Prefix6::new(p.addr, p.length)?)),
        }
    }

    /// Check whether this prefix covers `addr`. Cross-family is always
    /// false.
    pub fn covers(&self, addr: &IpAddr) -> bool {
        match (self, addr) {
            (Self::V4(p), IpAddr::V4(a)) => p.covers(a),
            (Self::V6(p), IpAddr::V6(a)) => p.covers(a),
            _ => false,
        }
    }
}

/// The address family (protocol version) of a route or prefix.
#[derive(
    Clone,
    Copy,
    Eq,
    Debug,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
    Deserialize,
    JsonSchema,
)]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
}

impl AddressFamily {
    /// Number of bits in an address of this family.
    pub fn bits(&self) -> u8 {
        match self {
            Self::Ipv4 => 32,
            Self::Ipv6 => 128,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn host_bits_zeroed_on_construction() {
        let p = Prefix4::new("10.0.0.10".parse().unwrap(), 24).unwrap();
        assert_eq!(p.addr, "10.0.0.0".parse::<Ipv4Addr>().unwrap());
        assert!(p.host_bits_are_unset());

        let p = Prefix6::new("2001:db8::1".parse().unwrap(), 64).unwrap();
        assert_eq!(p.addr, "2001:db8::".parse::<Ipv6Addr>().unwrap());
        assert!(p.host_bits_are_unset());
    }

    #[test]
    fn length_bounds_rejected() {
        assert!(matches!(
            Prefix4::new(Ipv4Addr::UNSPECIFIED, 33),
            Err(PrefixError::Length { length: 33, max: 32 })
        ));
        assert!(matches!(
            Prefix6::new(Ipv6Addr::UNSPECIFIED, 129),
            Err(PrefixError::Length { length: 129, max: 128 })
        ));
    }

    #[test]
    fn display_round_trip() {
        for s in ["0.0.0.0/0", "10.1.2.0/24", "192.168.0.1/32"] {
            let p: Prefix = s.parse().unwrap();
            assert_eq!(p.to_string(), s);
        }
        for s in ["::/0", "2001:db8::/32", "fd00::1/128"] {
            let p: Prefix = s.parse().unwrap();
            assert_eq!(p.to_string(), s);
        }
    }

    #[test]
    fn covers() {
        let p: Prefix = "10.1.0.0/16".parse().unwrap();
        assert!(p.covers(&"10.1.2.3".parse().unwrap()));
        assert!(!p.covers(&"10.2.0.1".parse().unwrap()));
        assert!(!p.covers(&"2001:db8::1".parse().unwrap()));

        let all: Prefix = "::/0".parse().unwrap();
        assert!(all.covers(&"fe80::1".parse().unwrap()));
    }

    #[test]
    fn ipnet_conversions() {
        let p: Prefix4 = "10.1.2.0/24".parse().unwrap();
        let net: Ipv4Net = p.into();
        assert_eq!(net.to_string(), "10.1.2.0/24");
        assert_eq!(Prefix4::from(net), p);

        let p: Prefix6 = "2001:db8::/32".parse().unwrap();
        let net: Ipv6Net = p.into();
        assert_eq!(Prefix6::from(net), p);
    }

    #[test]
    fn canonicalize_deserialized_prefix() {
        // Serde bypasses the constructors, so host bits can arrive set.
        let p: Prefix =
            serde_json::from_str(r#"{"V4":{"addr":"10.0.0.9","length":24}}"#)
                .unwrap();
        assert!(!p.host_bits_are_unset());
        let c = p.canonical().unwrap();
        assert_eq!(c.to_string(), "10.0.0.0/24");

        let bad: Prefix =
            serde_json::from_str(r#"{"V4":{"addr":"10.0.0.9","length":60}}"#)
                .unwrap();
        assert!(bad.canonical().is_err());
    }
}
