pub mod blob;
pub mod cancel;
pub mod error;
pub mod id;

pub use blob::BlobType;
pub use cancel::CancelToken;
pub use error::{Result, RuckError};
pub use id::Id;
