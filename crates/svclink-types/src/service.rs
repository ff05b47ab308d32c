//! Service identity: versions, service types and the [`ServiceItem`] triple.

use crate::address::AddressError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Semantic version of a service interface.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl Version {
    /// The invalid version `0.0.0`.
    pub const INVALID: Version = Version::new(0, 0, 0);

    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }

    /// Whether a provider of this version can serve a consumer that
    /// requires `required`: same major, equal or newer minor.
    pub fn is_compatible(&self, required: &Version) -> bool {
        self.is_valid()
            && required.is_valid()
            && self.major == required.major
            && self.minor >= required.minor
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for Version {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('.');
        let mut next = || -> Result<u32, AddressError> {
            parts
                .next()
                .and_then(|p| p.parse::<u32>().ok())
                .ok_or_else(|| AddressError::InvalidVersion(s.to_string()))
        };
        let version = Version::new(next()?, next()?, next()?);
        if parts.next().is_some() {
            return Err(AddressError::InvalidVersion(s.to_string()));
        }
        Ok(version)
    }
}

/// Visibility of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ServiceType {
    /// Visible only inside the hosting process.
    Local = 0,
    /// Announced to the router and reachable from other processes.
    Public = 1,
    /// Not a usable service type.
    Invalid = 255,
}

impl ServiceType {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Map a raw byte to a service type. Unknown values become `Invalid`.
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => ServiceType::Local,
            1 => ServiceType::Public,
            _ => ServiceType::Invalid,
        }
    }

    pub fn is_valid(self) -> bool {
        self != ServiceType::Invalid
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u8())
    }
}

/// The (name, version, type) triple identifying a service interface.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceItem {
    pub name: String,
    pub version: Version,
    pub service_type: ServiceType,
}

impl ServiceItem {
    pub fn new(name: impl Into<String>, version: Version, service_type: ServiceType) -> Self {
        Self {
            name: name.into(),
            version,
            service_type,
        }
    }

    /// An item that can never be connected.
    pub fn invalid() -> Self {
        Self {
            name: String::new(),
            version: Version::INVALID,
            service_type: ServiceType::Invalid,
        }
    }

    pub fn is_valid(&self) -> bool {
        !self.name.is_empty() && self.version.is_valid() && self.service_type.is_valid()
    }

    /// Public services are announced to peer processes.
    pub fn is_public(&self) -> bool {
        self.service_type == ServiceType::Public
    }

    /// Whether this provider item satisfies the `required` consumer item.
    pub fn is_compatible_with(&self, required: &ServiceItem) -> bool {
        self.is_valid()
            && required.is_valid()
            && self.name == required.name
            && self.service_type == required.service_type
            && self.version.is_compatible(&required.version)
    }
}

impl Default for ServiceItem {
    fn default() -> Self {
        Self::invalid()
    }
}
