//! Shared vocabulary for the Amphora storage node: content addresses,
//! the object model, checksums, configuration and the common error type.

pub mod checksum;
pub mod config;
pub mod error;
pub mod object;
pub mod types;

// Re-exports
pub use checksum::{hex_decode, hex_encode, payload_digest};
pub use config::{BlobStorConfig, BlobovniczaConfig, ShardConfig, WriteCacheConfig};
pub use error::{Error, Result};
pub use object::{Object, ObjectHeader, ObjectType, SplitInfo};
pub use types::{Address, AddressParseError, ContainerId, ObjectId};
