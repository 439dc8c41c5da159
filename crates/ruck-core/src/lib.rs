pub mod archiver;
pub mod chunker;
pub mod crypto;
pub mod index;
pub mod platform;
pub mod repo;
pub mod snapshot;

#[cfg(test)]
mod tests;
#[cfg(test)]
mod testutil;

pub use ruck_types::{BlobType, CancelToken, Id, Result, RuckError};
