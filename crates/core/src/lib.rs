//! Core types and traits for persista
//!
//! This crate defines the foundational types shared by every layer of the
//! persistence kernel:
//! - InstanceId / ObjectId / IdKey: session-local and durable identities
//! - Version: opaque optimistic concurrency token
//! - FieldValue: the value of one declared field
//! - FieldSet: per-field bit-vector used for loaded/dirty/flushed tracking
//! - LockLevel: none < read < write
//! - Metadata: type and field descriptors, consumed read-only
//! - Traits: the storage and lock collaborator contracts
//! - Error: error taxonomy shared by all crates

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod fields;
pub mod id;
pub mod lock;
pub mod meta;
pub mod traits;
pub mod value;
pub mod version;

pub use error::{Error, ErrorKind, Result};
pub use fields::FieldSet;
pub use id::{IdKey, InstanceId, ObjectId, TypeName};
pub use lock::LockLevel;
pub use meta::{
    Cascade, CascadeMode, FieldDescriptor, FieldKind, IdentityStrategy, Management,
    MetadataRepository, StaticRepository, TypeDescriptor, TypeDescriptorBuilder, UpdateStrategy,
    DEFAULT_FETCH_GROUP,
};
pub use traits::{
    AssignRequest, FlushEntry, FlushFailure, FlushOp, FlushOutcome, LoadRequest, LoadedState,
    LockManager, StoreManager,
};
pub use value::FieldValue;
pub use version::Version;
