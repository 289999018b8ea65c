//! Tandem environment runs.
//!
//! A run checks out the shared pipeline state, drives a list of stages over
//! the local catalog and commits the resulting changeset through
//! [`StateSync`]. Environment A runs discovery and fetching; environment B
//! runs analysis, publishing, digests and sweeping.

use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use tracing::{info, warn};

use tandem_catalog::CatalogStore;
use tandem_core::types::{Stage, VideoId};
use tandem_core::{Result, TandemError};
use tandem_storage::{StateSync, SyncOutcome, WorkingCopy};

use crate::digest::DigestBuilder;
use crate::discovery::Discovery;
use crate::fetcher::TranscriptFetcher;
use crate::publisher::ArtifactPublisher;
use crate::report::{commit_message, RunReport, StageReport};
use crate::runner::AnalysisRunner;
use crate::sweeper::RetentionSweeper;

/// One stage of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    Discover,
    Fetch,
    Analyze,
    Publish,
    Digest,
    Sweep,
}

impl Step {
    /// Steps of an environment A run. Discovery is skipped when no feed is
    /// configured.
    pub const FETCH_RUN: &'static [Step] = &[Step::Discover, Step::Fetch];
    /// Steps of an environment B run. The digest is skipped when no summary
    /// service is configured.
    pub const PROCESS_RUN: &'static [Step] =
        &[Step::Analyze, Step::Publish, Step::Digest, Step::Sweep];

    pub fn as_str(&self) -> &'static str {
        match self {
            Step::Discover => "discover",
            Step::Fetch => "fetch",
            Step::Analyze => "analyze",
            Step::Publish => "publish",
            Step::Digest => "digest",
            Step::Sweep => "sweep",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Step {
    type Err = TandemError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "discover" => Ok(Step::Discover),
            "fetch" => Ok(Step::Fetch),
            "analyze" => Ok(Step::Analyze),
            "publish" => Ok(Step::Publish),
            "digest" => Ok(Step::Digest),
            "sweep" => Ok(Step::Sweep),
            other => Err(TandemError::InvalidInput(format!("unknown step: {}", other))),
        }
    }
}

/// The stages of both environments wired to one state store.
///
/// Components are optional so each environment only needs to configure the
/// providers it actually talks to.
pub struct Pipeline {
    sync: StateSync,
    discovery: Option<Discovery>,
    fetcher: Option<TranscriptFetcher>,
    runner: Option<AnalysisRunner>,
    publisher: Option<ArtifactPublisher>,
    digest: Option<DigestBuilder>,
    sweeper: Option<RetentionSweeper>,
}

impl Pipeline {
    pub fn new(sync: StateSync) -> Self {
        Self {
            sync,
            discovery: None,
            fetcher: None,
            runner: None,
            publisher: None,
            digest: None,
            sweeper: None,
        }
    }

    pub fn with_discovery(mut self, discovery: Discovery) -> Self {
        self.discovery = Some(discovery);
        self
    }

    pub fn with_fetcher(mut self, fetcher: TranscriptFetcher) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn with_runner(mut self, runner: AnalysisRunner) -> Self {
        self.runner = Some(runner);
        self
    }

    pub fn with_publisher(mut self, publisher: ArtifactPublisher) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn with_digest(mut self, digest: DigestBuilder) -> Self {
        self.digest = Some(digest);
        self
    }

    pub fn with_sweeper(mut self, sweeper: RetentionSweeper) -> Self {
        self.sweeper = Some(sweeper);
        self
    }

    pub fn sync(&self) -> &StateSync {
        &self.sync
    }

    /// Check out the current state without changing anything.
    pub async fn checkout(&self) -> Result<WorkingCopy> {
        self.sync.checkout().await
    }

    /// Environment A: discover new videos, then fetch missing transcripts.
    pub async fn run_fetch(&self) -> Result<RunReport> {
        let steps: Vec<Step> = Step::FETCH_RUN
            .iter()
            .copied()
            .filter(|s| *s != Step::Discover || self.discovery.is_some())
            .collect();
        self.run("fetch", &steps).await
    }

    /// Environment B: analyze, publish, digest and sweep.
    pub async fn run_process(&self) -> Result<RunReport> {
        let steps: Vec<Step> = Step::PROCESS_RUN
            .iter()
            .copied()
            .filter(|s| *s != Step::Digest || self.digest.is_some())
            .collect();
        self.run("process", &steps).await
    }

    /// Run `steps` in order over one checkout and commit the outcome.
    ///
    /// Any error, `EnvironmentBlocked` in particular, returns before the
    /// commit, so nothing this run recorded reaches the shared store.
    pub async fn run(&self, label: &str, steps: &[Step]) -> Result<RunReport> {
        for step in steps {
            self.ensure_configured(*step)?;
        }

        let WorkingCopy {
            revision,
            mut catalog,
        } = self.sync.checkout().await?;
        info!(run = label, %revision, steps = steps.len(), "Starting run");

        let mut stages = Vec::with_capacity(steps.len());
        for step in steps {
            let report = self.run_step(*step, &mut catalog).await?;
            stages.push(report);
        }

        let message = commit_message(label, &stages);
        let sync = self.sync.commit(catalog, &message).await?;
        log_outcome(label, &sync);
        Ok(RunReport { stages, sync })
    }

    async fn run_step(&self, step: Step, catalog: &mut CatalogStore) -> Result<StageReport> {
        match step {
            Step::Discover => self.discovery()?.run(catalog).await,
            Step::Fetch => self.fetcher()?.run(catalog).await,
            Step::Analyze => self.runner()?.run(catalog).await,
            Step::Publish => self.publisher()?.run(catalog).await,
            Step::Digest => self.digest()?.run(catalog).await,
            Step::Sweep => self.sweeper()?.run(catalog),
        }
    }

    fn ensure_configured(&self, step: Step) -> Result<()> {
        let configured = match step {
            Step::Discover => self.discovery.is_some(),
            Step::Fetch => self.fetcher.is_some(),
            Step::Analyze => self.runner.is_some(),
            Step::Publish => self.publisher.is_some(),
            Step::Digest => self.digest.is_some(),
            Step::Sweep => self.sweeper.is_some(),
        };
        if configured {
            Ok(())
        } else {
            Err(missing(step))
        }
    }

    fn discovery(&self) -> Result<&Discovery> {
        self.discovery.as_ref().ok_or_else(|| missing(Step::Discover))
    }

    fn fetcher(&self) -> Result<&TranscriptFetcher> {
        self.fetcher.as_ref().ok_or_else(|| missing(Step::Fetch))
    }

    fn runner(&self) -> Result<&AnalysisRunner> {
        self.runner.as_ref().ok_or_else(|| missing(Step::Analyze))
    }

    fn publisher(&self) -> Result<&ArtifactPublisher> {
        self.publisher.as_ref().ok_or_else(|| missing(Step::Publish))
    }

    fn digest(&self) -> Result<&DigestBuilder> {
        self.digest.as_ref().ok_or_else(|| missing(Step::Digest))
    }

    fn sweeper(&self) -> Result<&RetentionSweeper> {
        self.sweeper.as_ref().ok_or_else(|| missing(Step::Sweep))
    }

    /// Reset an exhausted stage of one video and commit the reset.
    pub async fn requeue(&self, id: &VideoId, stage: Stage) -> Result<SyncOutcome> {
        let mut copy = self.sync.checkout().await?;
        copy.catalog.requeue(id, stage, Utc::now())?;
        let outcome = self
            .sync
            .commit(copy.catalog, &format!("tandem requeue {} {}", id, stage))
            .await?;
        log_outcome("requeue", &outcome);
        Ok(outcome)
    }

    /// Send an analyzed, unpublished video back for analysis.
    pub async fn reanalyze(&self, id: &VideoId) -> Result<SyncOutcome> {
        let mut copy = self.sync.checkout().await?;
        copy.catalog.reanalyze(id, Utc::now())?;
        let outcome = self
            .sync
            .commit(copy.catalog, &format!("tandem reanalyze {}", id))
            .await?;
        log_outcome("reanalyze", &outcome);
        Ok(outcome)
    }
}

fn missing(step: Step) -> TandemError {
    TandemError::Config(format!("no {} stage configured for this environment", step))
}

fn log_outcome(label: &str, outcome: &SyncOutcome) {
    for dropped in outcome.dropped() {
        warn!(
            run = label,
            video_id = %dropped.video_id,
            kind = dropped.kind,
            reason = %dropped.reason,
            "Local change superseded by the other environment"
        );
    }
    match outcome {
        SyncOutcome::Committed {
            revision, attempts, ..
        } => info!(run = label, %revision, attempts, "Run committed"),
        SyncOutcome::UpToDate { revision, .. } => {
            info!(run = label, %revision, "Run finished with nothing to commit")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use tandem_storage::{MemoryStore, SyncPolicy};

    use crate::fetcher::FetchOptions;
    use crate::mock::MockTranscriptSource;

    fn sync(store: Arc<MemoryStore>) -> StateSync {
        StateSync::new(
            store,
            SyncPolicy {
                max_attempts: 3,
                backoff: Duration::from_millis(1),
            },
        )
    }

    #[test]
    fn test_step_parse_and_display() {
        for step in [
            Step::Discover,
            Step::Fetch,
            Step::Analyze,
            Step::Publish,
            Step::Digest,
            Step::Sweep,
        ] {
            assert_eq!(step.to_string().parse::<Step>().unwrap(), step);
        }
        assert!("transcode".parse::<Step>().is_err());
    }

    #[tokio::test]
    async fn test_unconfigured_step_fails_before_checkout() {
        let store = Arc::new(MemoryStore::new());
        let pipeline = Pipeline::new(sync(store.clone()));
        let err = pipeline.run_process().await.unwrap_err();
        assert!(matches!(err, TandemError::Config(_)));
        assert!(store.messages().await.is_empty());
    }

    #[tokio::test]
    async fn test_fetch_run_without_feed_skips_discovery() {
        let store = Arc::new(MemoryStore::new());
        let pipeline = Pipeline::new(sync(store.clone())).with_fetcher(TranscriptFetcher::new(
            Arc::new(MockTranscriptSource::new()),
            FetchOptions {
                concurrency: 1,
                timeout: Duration::from_secs(1),
                max_attempts: 3,
            },
        ));
        let report = pipeline.run_fetch().await.unwrap();
        assert_eq!(report.stages.len(), 1);
        assert_eq!(report.stages[0].name, "fetch");
        assert!(!report.committed());
    }
}
