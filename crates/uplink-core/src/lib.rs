//! Uplink - Core Library
//!
//! Folder watchers that ship new files to object storage, credential
//! rotation for rejected uploads, memory-pressure purging and the
//! append-only activity log.

pub mod activity;
pub mod archive;
pub mod credentials;
pub mod error;
pub mod folder;
pub mod memory;
pub mod persistence;
pub mod purge;
pub mod routing;
pub mod settings;
pub mod store;
pub mod supervisor;
pub mod types;
pub mod upload;
pub mod watcher;

pub use activity::{ActivityLogger, ActivityRecord};
pub use credentials::{CredentialBroker, CredentialSnapshot, CredentialSource};
pub use error::*;
pub use routing::BucketRouter;
pub use settings::AgentSettings;
pub use store::{RemoteStore, S3Store};
pub use supervisor::{Supervisor, SupervisorDeps, SupervisorSettings};
pub use types::*;
pub use upload::{UploadClient, Uploader};
