//! Shared versioned store for Tandem.
//!
//! Both environments synchronize only through a `VersionedStore`: a git
//! repository, a revisioned directory, or an in-process store for tests.
//! `StateSync` owns the pull / replay / validate / commit cycle.

pub mod dir;
pub mod error;
pub mod git;
pub mod layout;
pub mod memory;
pub mod store;
pub mod sync;

pub use dir::DirStore;
pub use error::StorageError;
pub use git::{GitStore, GitStoreOptions};
pub use memory::MemoryStore;
pub use store::{Checkout, CommitOutcome, Revision, VersionedStore};
pub use sync::{StateSync, SyncOutcome, SyncPolicy, WorkingCopy};
