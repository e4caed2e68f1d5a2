use std::sync::Arc;

use crate::infrastructure::queue::MessageBus;
use crate::infrastructure::storage::cdn::PlaybackLinks;
use crate::modules::asset::repository::AssetStore;
use crate::modules::pipeline::service::PipelineService;
use crate::modules::search::indexing::IndexingService;
use crate::modules::search::service::SearchService;

#[derive(Clone)]
pub struct AppState {
    pub assets: Arc<dyn AssetStore>,
    pub bus: Arc<dyn MessageBus>,
    pub pipeline: Arc<PipelineService>,
    pub search: Arc<SearchService>,
    pub indexing: Arc<IndexingService>,
    pub links: PlaybackLinks,
}

impl AppState {
    pub fn new(
        assets: Arc<dyn AssetStore>,
        bus: Arc<dyn MessageBus>,
        pipeline: Arc<PipelineService>,
        search: Arc<SearchService>,
        indexing: Arc<IndexingService>,
        links: PlaybackLinks,
    ) -> Self {
        Self {
            assets,
            bus,
            pipeline,
            search,
            indexing,
            links,
        }
    }
}
