#![forbid(unsafe_code)]

pub mod codec;
pub mod state;
pub mod version;

pub use codec::CodecError;
pub use version::{Version, VersionError};
