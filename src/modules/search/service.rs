use std::sync::Arc;

use futures_util::future::join_all;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use super::dto::{SearchRequest, SearchResponse, SearchResultItem};
use crate::index::{IndexError, IndexReader, SearchHit};
use crate::infrastructure::storage::cdn::PlaybackLinks;
use crate::modules::asset::model::{AssetState, MediaAsset};
use crate::modules::asset::repository::AssetStore;
use crate::modules::subtitle::format_timestamp;

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("search index unavailable: {0}")]
    Index(#[from] IndexError),
    #[error("search task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Query front: runs the query against the shared index and hydrates every
/// hit from the asset store.
pub struct SearchService {
    reader: Arc<IndexReader>,
    assets: Arc<dyn AssetStore>,
    links: PlaybackLinks,
}

impl SearchService {
    pub fn new(reader: Arc<IndexReader>, assets: Arc<dyn AssetStore>, links: PlaybackLinks) -> Self {
        Self {
            reader,
            assets,
            links,
        }
    }

    pub async fn search(&self, request: &SearchRequest) -> Result<SearchResponse, SearchError> {
        let query = request.to_query();
        let reader = self.reader.clone();
        let results = tokio::task::spawn_blocking(move || reader.search(&query)).await??;

        let hydrated: Vec<SearchResultItem> = join_all(results.hits.iter().map(|hit| self.hydrate(hit)))
            .await
            .into_iter()
            .flatten()
            .collect();
        let dropped = results.hits.len() - hydrated.len();
        if dropped > 0 {
            debug!(dropped, "Search hits dropped during hydration");
        }

        Ok(SearchResponse {
            query: request.q.trim().to_string(),
            generation: results.generation,
            total: results.total.saturating_sub(dropped),
            index_total: results.total,
            results: hydrated,
        })
    }

    /// `None` drops the hit: unknown or unparseable asset, asset not
    /// currently subtitled, or a store failure.
    async fn hydrate(&self, hit: &SearchHit) -> Option<SearchResultItem> {
        let id = match Uuid::parse_str(&hit.asset_id) {
            Ok(id) => id,
            Err(_) => {
                warn!(asset_id = %hit.asset_id, "Index holds a non-uuid asset id");
                return None;
            }
        };

        let asset = match self.assets.get(id).await {
            Ok(Some(asset)) => asset,
            Ok(None) => {
                debug!(asset_id = %id, "Search hit for unknown asset");
                return None;
            }
            Err(e) => {
                warn!(asset_id = %id, "Failed to hydrate search hit: {}", e);
                return None;
            }
        };
        if asset.state != AssetState::Subtitled {
            debug!(asset_id = %id, state = %asset.state, "Search hit for asset not subtitled");
            return None;
        }

        self.item(hit, &asset)
    }

    fn item(&self, hit: &SearchHit, asset: &MediaAsset) -> Option<SearchResultItem> {
        let playback_url = self.links.playback_url(&asset.source_key, hit.start_ms)?;
        let subtitle_url = asset
            .subtitle_tracks
            .iter()
            .find(|track| track.language == hit.language)
            .and_then(|track| self.links.object_url(&track.key));
        let thumbnail_url = asset
            .frame_keys
            .first()
            .and_then(|key| self.links.object_url(key));

        Some(SearchResultItem {
            asset_id: asset.id,
            title: asset.title.clone(),
            language: hit.language.clone(),
            score: hit.score,
            snippet: hit.snippet.clone(),
            timestamp: format_timestamp(hit.start_ms, '.'),
            start_seconds: hit.start_ms as f64 / 1000.0,
            playback_url,
            thumbnail_url,
            subtitle_url,
        })
    }
}
