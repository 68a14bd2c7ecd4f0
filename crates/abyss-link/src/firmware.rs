//! Firmware distribution metadata and version ordering.
//!
//! The distribution endpoint's HTTP surface lives outside this crate; only
//! the shape of the data it serves is modeled here, plus the dotted-numeric
//! version order used to decide whether a device needs an update.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Latest-release metadata for one device model, as served by
/// `GET /firmware/latest?model=...`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirmwareRelease {
    pub model: String,
    pub version: String,
    pub url: String,
    pub checksum: String,
    pub size: u64,
    pub mandatory: bool,
    pub release_notes: String,
}

impl FirmwareRelease {
    /// Whether this release is strictly newer than the version a device
    /// reported during handshake.
    pub fn is_newer_than(&self, device_version: &str) -> Result<bool, VersionError> {
        let latest: FwVersion = self.version.parse()?;
        let current: FwVersion = device_version.parse()?;
        Ok(latest > current)
    }
}

/// Firmware distribution endpoint, consumed at the interface boundary.
pub trait FirmwareEndpoint {
    /// Latest release metadata for a device model.
    fn latest(&self, model: &str) -> Result<FirmwareRelease>;

    /// Download the release's image as raw bytes.
    fn download(&self, release: &FirmwareRelease) -> Result<Vec<u8>>;
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum VersionError {
    #[error("empty version string")]
    Empty,
    #[error("invalid version component {component:?} in {version:?}")]
    InvalidComponent { version: String, component: String },
}

/// Dotted-numeric firmware version, e.g. `1.2.3`.
///
/// Total order by component-wise integer comparison; missing components
/// compare as 0, so `1.2` == `1.2.0` and `1.10` > `1.9`.
#[derive(Debug, Clone)]
pub struct FwVersion {
    components: Vec<u32>,
}

// Equality must agree with Ord: "1.2" and "1.2.0" are the same version,
// so it cannot be derived from the raw component vectors.
impl PartialEq for FwVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for FwVersion {}

impl FromStr for FwVersion {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(VersionError::Empty);
        }
        let components = trimmed
            .split('.')
            .map(|part| {
                part.parse::<u32>()
                    .map_err(|_| VersionError::InvalidComponent {
                        version: s.to_string(),
                        component: part.to_string(),
                    })
            })
            .collect::<Result<Vec<u32>, VersionError>>()?;
        Ok(Self { components })
    }
}

impl Ord for FwVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.components.len().max(other.components.len());
        for i in 0..len {
            let a = self.components.get(i).copied().unwrap_or(0);
            let b = other.components.get(i).copied().unwrap_or(0);
            match a.cmp(&b) {
                Ordering::Equal => continue,
                unequal => return unequal,
            }
        }
        Ordering::Equal
    }
}

impl PartialOrd for FwVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for FwVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for c in &self.components {
            if !first {
                write!(f, ".")?;
            }
            write!(f, "{c}")?;
            first = false;
        }
        Ok(())
    }
}
