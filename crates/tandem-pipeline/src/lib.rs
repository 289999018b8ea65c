//! Pipeline stages for Tandem.
//!
//! Environment A discovers videos and fetches transcripts; environment B
//! analyzes, publishes, builds digests and sweeps. Each stage works on a
//! checked-out `CatalogStore` and reaches the outside world only through the
//! service traits in [`services`].

pub mod artifact;
pub mod digest;
pub mod discovery;
pub mod environment;
pub mod feed;
pub mod fetcher;
pub mod http;
pub mod mock;
pub mod publisher;
pub mod report;
pub mod runner;
pub mod services;
pub mod sweeper;

pub use artifact::DirArtifactStore;
pub use digest::{DigestBuilder, DigestOptions, DigestSchedule, DigestWindow};
pub use discovery::Discovery;
pub use environment::{Pipeline, Step};
pub use feed::RssCatalogFeed;
pub use fetcher::{FetchOptions, TranscriptFetcher};
pub use http::{HttpAnalysisService, HttpArtifactStore, HttpSummaryService, HttpTranscriptSource};
pub use publisher::{ArtifactPublisher, PublishOptions};
pub use report::{RunReport, StageReport};
pub use runner::{AnalysisOptions, AnalysisRunner};
pub use services::{
    put_json, AnalysisOutput, AnalysisRequest, AnalysisService, Artifact, ArtifactStore,
    CatalogFeed, DigestEntry, DigestRequest, FeedEntry, ServiceError, SummaryOutput,
    SummaryService, TranscriptError, TranscriptSource,
};
pub use sweeper::RetentionSweeper;
