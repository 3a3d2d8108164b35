#![forbid(unsafe_code)]

use std::fmt::{Display, Formatter};

use crate::codec;

const PAYLOAD_LEN: usize = 12;

/// Schema version of the on-disk state layout.
///
/// Ordering is lexicographic on `(major, minor, patch)`; the derived `Ord`
/// provides exactly that because of field order. `(0, 0, 0)` is the
/// empty/unknown sentinel, never a real schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum VersionError {
    #[error("corrupt storage version record")]
    Corrupt,
    #[error("build version {0:?} is not of the form <major>.<minor>.<patch>")]
    BadBuildVersion(String),
}

impl Version {
    pub const EMPTY: Version = Version {
        major: 0,
        minor: 0,
        patch: 0,
    };

    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::EMPTY
    }

    /// Serialize as a framed record of three big-endian `u32` fields.
    pub fn serialize(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(PAYLOAD_LEN);
        payload.extend_from_slice(&self.major.to_be_bytes());
        payload.extend_from_slice(&self.minor.to_be_bytes());
        payload.extend_from_slice(&self.patch.to_be_bytes());
        codec::encode_framed(&payload)
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, VersionError> {
        let payload = codec::decode_framed(bytes).map_err(|_| VersionError::Corrupt)?;
        if payload.len() != PAYLOAD_LEN {
            return Err(VersionError::Corrupt);
        }
        let mut fields = [0u32; 3];
        for (field, chunk) in fields.iter_mut().zip(payload.chunks_exact(4)) {
            *field = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        Ok(Self::new(fields[0], fields[1], fields[2]))
    }

    /// Parse a build metadata string of the form `<major>.<minor>.<patch>...`.
    /// Characters after the patch digits are ignored.
    pub fn from_build(raw: &str) -> Result<Self, VersionError> {
        let bad = || VersionError::BadBuildVersion(raw.to_owned());
        let mut parts = raw.splitn(3, '.');
        let major = parse_numeric(parts.next().ok_or_else(bad)?).ok_or_else(bad)?;
        let minor = parse_numeric(parts.next().ok_or_else(bad)?).ok_or_else(bad)?;
        let patch = parse_leading_numeric(parts.next().ok_or_else(bad)?).ok_or_else(bad)?;
        Ok(Self::new(major, minor, patch))
    }

    /// The schema version baked into this binary. Failure here is fatal at
    /// startup: the engine cannot know what to migrate to.
    pub fn current_from_build() -> Result<Self, VersionError> {
        Self::from_build(env!("CARGO_PKG_VERSION"))
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Version({}, {}, {})", self.major, self.minor, self.patch)
    }
}

fn parse_numeric(part: &str) -> Option<u32> {
    if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    part.parse().ok()
}

fn parse_leading_numeric(part: &str) -> Option<u32> {
    let digits = part.bytes().take_while(u8::is_ascii_digit).count();
    if digits == 0 {
        return None;
    }
    part[..digits].parse().ok()
}
