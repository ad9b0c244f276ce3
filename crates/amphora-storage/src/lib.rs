//! Local object-storage engine of an Amphora node.
//!
//! A shard composes three tiers:
//! - a write-cache that absorbs put bursts (in-memory ring, small-object
//!   database, large-object fstree) and flushes in the background;
//! - a blob store routing small objects into size-bounded blobovnicza
//!   containers and large objects into a hashed-directory fstree;
//! - a metabase indexing every object's header, location hint and status.

pub mod blobovnicza;
pub mod blobstor;
pub mod compress;
pub mod fstree;
pub mod metabase;
pub mod shard;
pub mod writecache;

// Re-exports
pub use blobovnicza::Blobovnicza;
pub use blobstor::BlobStor;
pub use fstree::FsTree;
pub use metabase::{HeadRecord, Metabase, ObjectStatus};
pub use shard::{GetResult, HeadResult, Shard};
pub use writecache::{ErrorCallback, Mode, WriteCache};
