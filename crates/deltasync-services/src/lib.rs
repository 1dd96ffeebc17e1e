//! deltasync-services: the sync engine and the state it owns.
//!
//! `delta` is pure: diff two manifests, rebuild a file from a delta.
//! `engine` wires it to a [`fs::ProjectFs`] and a persisted
//! [`store::ManifestStore`].

pub mod credentials;
pub mod delta;
pub mod engine;
pub mod fs;
pub mod store;

pub use credentials::{CredentialValidator, TokenStore};
pub use delta::ApplyError;
pub use engine::{ApplyOutcome, SyncEngine, SyncError};
pub use fs::{FsError, LocalFs, ProjectFs};
pub use store::{ManifestStore, StoreError};
