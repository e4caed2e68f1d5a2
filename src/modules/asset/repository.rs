use async_trait::async_trait;
use sqlx::FromRow;
use sqlx::types::Json;
use time::OffsetDateTime;
use uuid::Uuid;

use super::model::{AssetChange, AssetState, Guard, MediaAsset, SubtitleTrack};
use crate::infrastructure::db::pool::DbPool;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Corrupt asset record {id}: {reason}")]
    Corrupt { id: Uuid, reason: String },
    #[error("Illegal transition {from} -> {to}")]
    IllegalTransition { from: AssetState, to: AssetState },
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Durable per-asset records. Every mutation is a conditional update keyed on
/// the expected prior state, so overlapping deliveries cannot both win.
#[async_trait]
pub trait AssetStore: Send + Sync {
    async fn get(&self, id: Uuid) -> StoreResult<Option<MediaAsset>>;

    async fn find_by_transcription_job(&self, handle: &str) -> StoreResult<Option<MediaAsset>>;

    async fn list(&self, limit: i64, offset: i64) -> StoreResult<Vec<MediaAsset>>;

    /// Inserts `asset` unless a record with its id exists. Returns the stored
    /// record either way, and whether it was created by this call.
    async fn create_if_absent(&self, asset: &MediaAsset) -> StoreResult<(MediaAsset, bool)>;

    /// Applies `change` only while `guard` holds. `None` means the guard did
    /// not hold (or the asset is unknown) and nothing was written.
    async fn transition(
        &self,
        id: Uuid,
        guard: &Guard,
        change: &AssetChange,
    ) -> StoreResult<Option<MediaAsset>>;
}

/// Rejects changes the lifecycle does not allow from any guarded state.
pub fn check_transition(guard: &Guard, change: &AssetChange) -> StoreResult<()> {
    match guard.states.iter().find(|from| !from.can_move_to(change.state)) {
        Some(from) => Err(StoreError::IllegalTransition {
            from: *from,
            to: change.state,
        }),
        None => Ok(()),
    }
}

#[derive(Debug, FromRow)]
struct AssetRow {
    id: Uuid,
    state: String,
    source_key: String,
    title: String,
    source_language: String,
    revision: i32,
    duration_seconds: Option<f64>,
    frame_keys: Vec<String>,
    transcription_job: Option<String>,
    transcript_key: Option<String>,
    subtitle_tracks: Json<Vec<SubtitleTrack>>,
    error_detail: Option<String>,
    version: i64,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<AssetRow> for MediaAsset {
    type Error = StoreError;

    fn try_from(row: AssetRow) -> Result<Self, Self::Error> {
        let state = row
            .state
            .parse::<AssetState>()
            .map_err(|reason| StoreError::Corrupt { id: row.id, reason })?;

        Ok(MediaAsset {
            id: row.id,
            state,
            source_key: row.source_key,
            title: row.title,
            source_language: row.source_language,
            revision: row.revision,
            duration_seconds: row.duration_seconds,
            frame_keys: row.frame_keys,
            transcription_job: row.transcription_job,
            transcript_key: row.transcript_key,
            subtitle_tracks: row.subtitle_tracks.0,
            error_detail: row.error_detail,
            version: row.version,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn into_asset(row: Option<AssetRow>) -> StoreResult<Option<MediaAsset>> {
    row.map(MediaAsset::try_from).transpose()
}

#[derive(Clone)]
pub struct AssetRepository {
    pool: DbPool,
}

impl AssetRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

const UPDATE_GUARDED: &str = r#"
UPDATE media_assets SET
    state = $2,
    revision = revision + CASE WHEN $3 THEN 1 ELSE 0 END,
    transcription_job = CASE WHEN $3 THEN NULL ELSE COALESCE($4, transcription_job) END,
    transcript_key = CASE WHEN $3 THEN NULL ELSE COALESCE($5, transcript_key) END,
    subtitle_tracks = CASE WHEN $3 THEN '[]'::jsonb ELSE COALESCE($6, subtitle_tracks) END,
    frame_keys = COALESCE($7, frame_keys),
    duration_seconds = COALESCE($8, duration_seconds),
    error_detail = CASE WHEN $9 THEN $10 ELSE error_detail END,
    version = version + 1,
    updated_at = NOW()
WHERE id = $1
  AND state = ANY($11)
  AND ($12::TEXT IS NULL OR transcription_job = $12)
RETURNING *
"#;

#[async_trait]
impl AssetStore for AssetRepository {
    async fn get(&self, id: Uuid) -> StoreResult<Option<MediaAsset>> {
        let row = sqlx::query_as::<_, AssetRow>("SELECT * FROM media_assets WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        into_asset(row)
    }

    async fn find_by_transcription_job(&self, handle: &str) -> StoreResult<Option<MediaAsset>> {
        let row = sqlx::query_as::<_, AssetRow>(
            "SELECT * FROM media_assets WHERE transcription_job = $1",
        )
        .bind(handle)
        .fetch_optional(&self.pool)
        .await?;
        into_asset(row)
    }

    async fn list(&self, limit: i64, offset: i64) -> StoreResult<Vec<MediaAsset>> {
        let rows = sqlx::query_as::<_, AssetRow>(
            "SELECT * FROM media_assets ORDER BY created_at DESC, id LIMIT $1 OFFSET $2",
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(MediaAsset::try_from).collect()
    }

    async fn create_if_absent(&self, asset: &MediaAsset) -> StoreResult<(MediaAsset, bool)> {
        let inserted = sqlx::query_as::<_, AssetRow>(
            r#"
            INSERT INTO media_assets (id, state, source_key, title, source_language)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(asset.id)
        .bind(asset.state.as_str())
        .bind(&asset.source_key)
        .bind(&asset.title)
        .bind(&asset.source_language)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            return Ok((MediaAsset::try_from(row)?, true));
        }

        let existing = self.get(asset.id).await?.ok_or_else(|| StoreError::Corrupt {
            id: asset.id,
            reason: "insert conflicted but no row found".to_string(),
        })?;
        Ok((existing, false))
    }

    async fn transition(
        &self,
        id: Uuid,
        guard: &Guard,
        change: &AssetChange,
    ) -> StoreResult<Option<MediaAsset>> {
        check_transition(guard, change)?;

        let states: Vec<String> = guard.states.iter().map(|s| s.as_str().to_string()).collect();
        let row = sqlx::query_as::<_, AssetRow>(UPDATE_GUARDED)
            .bind(id)
            .bind(change.state.as_str())
            .bind(change.reset)
            .bind(change.transcription_job.as_deref())
            .bind(change.transcript_key.as_deref())
            .bind(change.subtitle_tracks.clone().map(Json))
            .bind(change.frame_keys.clone())
            .bind(change.duration_seconds)
            .bind(change.error_detail.is_some())
            .bind(change.error_detail.clone().flatten())
            .bind(states)
            .bind(guard.transcription_job.as_deref())
            .fetch_optional(&self.pool)
            .await?;
        into_asset(row)
    }
}
