use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use super::MessageHandler;
use crate::index::WriteOutcome;
use crate::modules::pipeline::Outcome;
use crate::modules::pipeline::error::PipelineError;
use crate::modules::pipeline::events::ResultEvent;
use crate::modules::search::indexing::IndexingService;

/// Applies result events to the shared index. Lock contention surfaces as a
/// transient error and goes back through the retry queue.
pub struct IndexWorker {
    indexing: Arc<IndexingService>,
}

impl IndexWorker {
    pub fn new(indexing: Arc<IndexingService>) -> Self {
        Self { indexing }
    }
}

#[async_trait]
impl MessageHandler for IndexWorker {
    type Message = ResultEvent;

    fn name(&self) -> &'static str {
        "indexer"
    }

    async fn handle(&self, event: &ResultEvent, attempt: u32) -> Result<Outcome, PipelineError> {
        let asset_id = event.asset_id();
        match self.indexing.apply(event).await? {
            WriteOutcome::Committed { generation } => {
                info!(asset_id = %asset_id, generation, attempt, "Index updated");
                Ok(Outcome::Done)
            }
            WriteOutcome::Unchanged => Ok(Outcome::Stale(format!("asset {asset_id} already indexed"))),
            WriteOutcome::Superseded => Ok(Outcome::Stale(format!(
                "a newer version of asset {asset_id} is indexed"
            ))),
        }
    }
}
