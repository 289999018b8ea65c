//! Discovery of new videos from the catalog feed (environment A).

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use tandem_catalog::{CatalogError, CatalogStore, Upsert};
use tandem_core::Result;

use crate::report::StageReport;
use crate::services::CatalogFeed;

pub struct Discovery {
    feed: Arc<dyn CatalogFeed>,
}

impl Discovery {
    pub fn new(feed: Arc<dyn CatalogFeed>) -> Self {
        Self { feed }
    }

    /// Upsert every feed entry into the catalog. A feed outage is logged
    /// and leaves the catalog as it was.
    pub async fn run(&self, catalog: &mut CatalogStore) -> Result<StageReport> {
        let mut report = StageReport::new("discover");
        let entries = match self.feed.entries().await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Catalog feed unavailable: {}", e);
                return Ok(report);
            }
        };
        report.considered = entries.len();

        let now = Utc::now();
        for entry in entries {
            match catalog.upsert(entry.video_id.clone(), entry.source(), now) {
                Ok(Upsert::Inserted) => {
                    debug!(video_id = %entry.video_id, title = %entry.title, "Discovered");
                    report.succeeded += 1;
                }
                Ok(Upsert::Updated) | Ok(Upsert::Unchanged) => report.skipped += 1,
                Err(CatalogError::InvariantViolation(reason)) => {
                    warn!(video_id = %entry.video_id, "Ignoring feed entry: {}", reason);
                    report.failed += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }

        info!("{}", report);
        Ok(report)
    }
}
