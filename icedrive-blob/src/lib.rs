//! Content-addressed blob storage with reference counting, chunked
//! transfer sessions, and federated resolution across peer nodes.

pub mod digest;
pub mod error;
pub mod pending;
pub mod remote;
pub mod resolver;
pub mod server;
pub mod service;
pub mod store;
pub mod transfer;

pub use digest::BlobDigest;
pub use error::{BlobError, TransferError};
pub use resolver::{FederationResolver, ResolverConfig};
pub use server::QueryServer;
pub use service::{AcceptAll, BlobService, IdentityVerifier, LinkOutcome, Principal};
pub use store::{BlobRecord, BlobStore};
pub use transfer::{DataTransfer, FileTransfer, MemoryTransfer};
