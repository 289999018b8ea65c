//! Pipeline catalog for Tandem.
//!
//! Holds the in-memory view of one committed snapshot, the per-field
//! compare-and-swap state machine, and the changeset of mutations that
//! StateSync replays onto newer snapshots, together with the digests a
//! run recorded.

pub mod digest;
pub mod error;
pub mod filter;
pub mod mutation;
pub mod snapshot;
pub mod state_machine;
pub mod store;

pub use digest::{apply_digest, replay_changeset, Changeset};
pub use error::CatalogError;
pub use filter::StatusPredicate;
pub use mutation::{replay, DroppedMutation, Mutation, MutationKind, ReplayReport, Seen};
pub use snapshot::{CatalogSummary, PipelineSnapshot};
pub use state_machine::{compare_and_swap, validate_transition, Cas, StatusChange, StatusField};
pub use store::{CatalogStore, Upsert};
