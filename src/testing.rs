//! In-memory collaborators and end-to-end pipeline scenarios.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde_json::json;
use tempfile::TempDir;
use uuid::Uuid;

use crate::common::retry::RetryConfig;
use crate::index::{IndexReader, IndexWriter, IndexWriterConfig, LeaseConfig};
use crate::infrastructure::external::frames::{FrameExtractor, FrameSet, frame_key};
use crate::infrastructure::external::transcription::{TranscriptionRequest, TranscriptionService};
use crate::infrastructure::external::translation::TranslationService;
use crate::infrastructure::external::{ExternalError, ExternalResult};
use crate::infrastructure::queue::{
    Destination, Envelope, MessageBus, Publisher, QueueError, QueueResult, SUBTITLE_JOBS, SUBTITLE_RESULTS,
};
use crate::infrastructure::storage::cdn::PlaybackLinks;
use crate::infrastructure::storage::{ObjectStore, StorageError, StorageResult};
use crate::modules::asset::model::{AssetChange, Guard, MediaAsset};
use crate::modules::asset::repository::{AssetStore, StoreError, StoreResult, check_transition};
use crate::modules::pipeline::events::{ResultEvent, SubtitleJob};
use crate::modules::pipeline::service::{PipelineService, PipelineSettings};
use crate::modules::search::indexing::IndexingService;
use crate::modules::search::service::SearchService;
use crate::state::AppState;
use crate::workers::RetryPolicy;
use crate::workers::subtitle::{SubtitleWorker, SubtitleWorkerSettings};

type TransitionHook = Box<dyn FnOnce(&mut MediaAsset) + Send>;

#[derive(Default)]
pub struct MemoryAssets {
    records: Mutex<HashMap<Uuid, MediaAsset>>,
    failing: Mutex<HashSet<Uuid>>,
    before_transition: Mutex<Option<TransitionHook>>,
}

impl MemoryAssets {
    pub fn snapshot(&self, id: Uuid) -> Option<MediaAsset> {
        self.records.lock().unwrap().get(&id).cloned()
    }

    /// Makes `get` for `id` fail like an unreachable database.
    pub fn fail_get(&self, id: Uuid) {
        self.failing.lock().unwrap().insert(id);
    }

    /// Runs `hook` on the stored record at the start of the next
    /// transition, before its guard is checked.
    pub fn before_next_transition(&self, hook: impl FnOnce(&mut MediaAsset) + Send + 'static) {
        *self.before_transition.lock().unwrap() = Some(Box::new(hook));
    }
}

#[async_trait]
impl AssetStore for MemoryAssets {
    async fn get(&self, id: Uuid) -> StoreResult<Option<MediaAsset>> {
        if self.failing.lock().unwrap().contains(&id) {
            return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
        }
        Ok(self.snapshot(id))
    }

    async fn find_by_transcription_job(&self, handle: &str) -> StoreResult<Option<MediaAsset>> {
        let records = self.records.lock().unwrap();
        Ok(records.values().find(|a| a.holds_job(handle)).cloned())
    }

    async fn list(&self, limit: i64, offset: i64) -> StoreResult<Vec<MediaAsset>> {
        let mut assets: Vec<MediaAsset> = self.records.lock().unwrap().values().cloned().collect();
        assets.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        Ok(assets
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn create_if_absent(&self, asset: &MediaAsset) -> StoreResult<(MediaAsset, bool)> {
        let mut records = self.records.lock().unwrap();
        if let Some(existing) = records.get(&asset.id) {
            return Ok((existing.clone(), false));
        }
        records.insert(asset.id, asset.clone());
        Ok((asset.clone(), true))
    }

    async fn transition(
        &self,
        id: Uuid,
        guard: &Guard,
        change: &AssetChange,
    ) -> StoreResult<Option<MediaAsset>> {
        check_transition(guard, change)?;
        let mut records = self.records.lock().unwrap();
        let Some(asset) = records.get_mut(&id) else {
            return Ok(None);
        };
        if let Some(hook) = self.before_transition.lock().unwrap().take() {
            hook(&mut *asset);
        }
        if !guard.admits(asset) {
            return Ok(None);
        }
        change.apply(asset);
        Ok(Some(asset.clone()))
    }
}

#[derive(Default)]
pub struct MemoryStorage {
    objects: Mutex<BTreeMap<String, Bytes>>,
}

impl MemoryStorage {
    pub fn insert(&self, key: &str, body: impl Into<Bytes>) {
        self.objects.lock().unwrap().insert(key.to_string(), body.into());
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.lock().unwrap().contains_key(key)
    }

    pub fn text(&self, key: &str) -> Option<String> {
        let objects = self.objects.lock().unwrap();
        objects.get(key).map(|b| String::from_utf8_lossy(b).into_owned())
    }
}

#[async_trait]
impl ObjectStore for MemoryStorage {
    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        self.objects
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn put(&self, key: &str, body: Bytes, _content_type: &str) -> StorageResult<()> {
        self.insert(key, body);
        Ok(())
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.objects.lock().unwrap().remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let objects = self.objects.lock().unwrap();
        Ok(objects.keys().filter(|k| k.starts_with(prefix)).cloned().collect())
    }

    fn uri(&self, key: &str) -> String {
        format!("mem://media/{key}")
    }
}

/// Records every publish; can be switched to fail.
#[derive(Default)]
pub struct RecordingBus {
    published: Mutex<Vec<(Destination, Vec<u8>)>>,
    failing: AtomicBool,
}

impl RecordingBus {
    pub fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn raw(&self, destination: &Destination) -> Vec<Vec<u8>> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .filter(|(d, _)| d == destination)
            .map(|(_, body)| body.clone())
            .collect()
    }

    pub fn messages<T: DeserializeOwned>(&self, destination: &Destination) -> Vec<T> {
        self.raw(destination)
            .iter()
            .map(|body| serde_json::from_slice::<Envelope<T>>(body).unwrap().payload)
            .collect()
    }
}

#[async_trait]
impl MessageBus for RecordingBus {
    async fn publish(&self, destination: &Destination, payload: &[u8]) -> QueueResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(QueueError::Broker("broker unreachable".to_string()));
        }
        self.published
            .lock()
            .unwrap()
            .push((destination.clone(), payload.to_vec()));
        Ok(())
    }
}

/// Records every start request. A job name seen before is accepted without
/// creating a second job, like the managed service answering "already exists".
#[derive(Default)]
pub struct FakeTranscription {
    pub requests: Mutex<Vec<TranscriptionRequest>>,
    rejecting: AtomicBool,
}

impl FakeTranscription {
    pub fn reject(&self, rejecting: bool) {
        self.rejecting.store(rejecting, Ordering::SeqCst);
    }

    /// Distinct jobs the service would be running.
    pub fn jobs(&self) -> Vec<String> {
        let mut jobs: Vec<String> = Vec::new();
        for request in self.requests.lock().unwrap().iter() {
            if !jobs.contains(&request.job_name) {
                jobs.push(request.job_name.clone());
            }
        }
        jobs
    }
}

#[async_trait]
impl TranscriptionService for FakeTranscription {
    async fn start(&self, request: &TranscriptionRequest) -> ExternalResult<()> {
        if self.rejecting.load(Ordering::SeqCst) {
            return Err(ExternalError::Rejected("unsupported media".to_string()));
        }
        self.requests.lock().unwrap().push(request.clone());
        Ok(())
    }
}

/// Word-for-word dictionary translation; listed languages always fail.
#[derive(Default)]
pub struct FakeTranslation {
    failing: Mutex<HashSet<String>>,
}

impl FakeTranslation {
    pub fn fail_language(&self, lang: &str) {
        self.failing.lock().unwrap().insert(lang.to_string());
    }

    fn word(word: &str) -> &str {
        match word {
            "egg" => "oeuf",
            "fried" => "frit",
            "rice" => "riz",
            "hello" => "bonjour",
            other => other,
        }
    }
}

#[async_trait]
impl TranslationService for FakeTranslation {
    async fn translate(&self, texts: &[String], _source: &str, target: &str) -> ExternalResult<Vec<String>> {
        if self.failing.lock().unwrap().contains(target) {
            return Err(ExternalError::Unavailable(format!("no model for {target}")));
        }
        Ok(texts
            .iter()
            .map(|text| {
                text.split(' ')
                    .map(|w| {
                        let bare = w.trim_end_matches(|c: char| !c.is_alphanumeric());
                        format!("{}{}", Self::word(&bare.to_lowercase()), &w[bare.len()..])
                    })
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .collect())
    }
}

pub struct FakeFrames;

#[async_trait]
impl FrameExtractor for FakeFrames {
    async fn extract(&self, asset_id: Uuid, _video_key: &str) -> ExternalResult<FrameSet> {
        Ok(FrameSet {
            frame_keys: vec![frame_key(asset_id)],
            duration_seconds: Some(12.5),
        })
    }
}

/// Transcript JSON in the managed service's output shape. Each `(word,
/// start_seconds)` lasts half a second; `.` closes a sentence.
pub fn transcript(words: &[(&str, f64)]) -> Vec<u8> {
    let items: Vec<serde_json::Value> = words
        .iter()
        .map(|(word, start)| {
            if *word == "." {
                json!({"type": "punctuation", "alternatives": [{"content": "."}]})
            } else {
                json!({
                    "type": "pronunciation",
                    "start_time": format!("{start:.3}"),
                    "end_time": format!("{:.3}", start + 0.5),
                    "alternatives": [{"content": word}]
                })
            }
        })
        .collect();
    serde_json::to_vec(&json!({"jobName": "x", "results": {"items": items}})).unwrap()
}

pub struct Harness {
    pub assets: Arc<MemoryAssets>,
    pub storage: Arc<MemoryStorage>,
    pub bus: Arc<RecordingBus>,
    pub transcription: Arc<FakeTranscription>,
    pub translation: Arc<FakeTranslation>,
    pub pipeline: Arc<PipelineService>,
    pub worker: SubtitleWorker,
    pub indexing: Arc<IndexingService>,
    pub search: Arc<SearchService>,
    pub links: PlaybackLinks,
    pub index_dir: TempDir,
}

impl Harness {
    pub fn new(targets: &[&str], required: &[&str]) -> Self {
        let assets = Arc::new(MemoryAssets::default());
        let storage = Arc::new(MemoryStorage::default());
        let bus = Arc::new(RecordingBus::default());
        let transcription = Arc::new(FakeTranscription::default());
        let translation = Arc::new(FakeTranslation::default());
        let links = PlaybackLinks::new("https://cdn.example.com/media/").unwrap();

        let bus_dyn: Arc<dyn MessageBus> = bus.clone();
        let results = Publisher::new(bus_dyn.clone(), Destination::exchange(SUBTITLE_RESULTS));
        let pipeline = Arc::new(PipelineService::new(
            assets.clone(),
            storage.clone(),
            transcription.clone(),
            Arc::new(FakeFrames),
            Publisher::new(bus_dyn, Destination::queue(SUBTITLE_JOBS)),
            results.clone(),
            PipelineSettings {
                target_languages: targets.iter().map(|s| s.to_string()).collect(),
                default_source_language: "en".to_string(),
                frame_timeout: Duration::from_secs(1),
            },
        ));

        let policy = RetryPolicy { max_retries: 2 };
        let worker = SubtitleWorker::new(
            assets.clone(),
            storage.clone(),
            translation.clone(),
            results,
            SubtitleWorkerSettings {
                required_languages: required.iter().map(|s| s.to_string()).collect(),
                translate_retry: RetryConfig {
                    max_retries: 1,
                    base_delay: Duration::from_millis(1),
                    max_delay: Duration::from_millis(2),
                },
                policy,
            },
        );

        let index_dir = tempfile::tempdir().unwrap();
        let writer_config = IndexWriterConfig {
            lease: LeaseConfig {
                duration: Duration::from_secs(30),
                acquire_timeout: Duration::from_secs(5),
                poll_interval: Duration::from_millis(2),
            },
            gc_grace: Duration::ZERO,
            ..IndexWriterConfig::for_holder("test-writer")
        };
        let writer = Arc::new(IndexWriter::open(index_dir.path(), writer_config).unwrap());
        let reader = Arc::new(IndexReader::open(index_dir.path(), Duration::ZERO));
        let indexing = Arc::new(IndexingService::new(storage.clone(), writer));
        let search = Arc::new(SearchService::new(reader, assets.clone(), links.clone()));

        Self {
            assets,
            storage,
            bus,
            transcription,
            translation,
            pipeline,
            worker,
            indexing,
            search,
            links,
            index_dir,
        }
    }

    pub fn state(&self) -> AppState {
        AppState::new(
            self.assets.clone(),
            self.bus.clone(),
            self.pipeline.clone(),
            self.search.clone(),
            self.indexing.clone(),
            self.links.clone(),
        )
    }

    pub fn jobs(&self) -> Vec<SubtitleJob> {
        self.bus.messages(&Destination::queue(SUBTITLE_JOBS))
    }

    pub fn results(&self) -> Vec<ResultEvent> {
        self.bus.messages(&Destination::exchange(SUBTITLE_RESULTS))
    }
}

mod scenarios {
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use super::*;
    use crate::index::WriteOutcome;
    use crate::infrastructure::queue::PIPELINE_EVENTS_DLQ;
    use crate::modules::asset::model::{AssetState, asset_id_for};
    use crate::modules::pipeline::Outcome;
    use crate::modules::pipeline::error::PipelineError;
    use crate::modules::pipeline::events::{JobKind, SubtitleResult, TranscriptionEvent, TranscriptionStatus};
    use crate::modules::search::dto::SearchRequest;
    use crate::workers::MessageHandler;

    const KEY: &str = "video/Egg+Fried+Rice.en.mp4";
    const DECODED: &str = "video/Egg Fried Rice.en.mp4";

    fn completed(handle: &str) -> TranscriptionEvent {
        TranscriptionEvent {
            job_name: handle.to_string(),
            status: TranscriptionStatus::Completed,
            failure_reason: None,
        }
    }

    fn query(q: &str, lang: Option<&str>) -> SearchRequest {
        SearchRequest {
            q: q.to_string(),
            lang: lang.map(str::to_string),
            asset_id: None,
            from: None,
            to: None,
            limit: None,
            offset: None,
        }
    }

    /// Upload, complete transcription and store the transcript. Returns the
    /// asset id and the enqueued job.
    async fn transcribed(h: &Harness) -> (Uuid, SubtitleJob) {
        assert_eq!(h.pipeline.on_object_created("media", KEY).await.unwrap(), Outcome::Done);
        let id = asset_id_for(DECODED);
        let asset = h.assets.snapshot(id).unwrap();
        let handle = asset.transcription_job.clone().unwrap();

        h.storage.insert(
            asset.transcript_key.as_deref().unwrap(),
            transcript(&[
                ("Hello", 0.0),
                (".", 0.0),
                ("Egg", 2.0),
                ("fried", 2.5),
                ("rice", 3.0),
                (".", 0.0),
            ]),
        );
        assert_eq!(
            h.pipeline.on_transcription_event(&completed(&handle)).await.unwrap(),
            Outcome::Done
        );
        let job = h.jobs().pop().unwrap();
        (id, job)
    }

    async fn index_all(h: &Harness) {
        for event in h.results() {
            h.indexing.apply(&event).await.unwrap();
        }
    }

    #[tokio::test]
    async fn upload_claims_the_asset_before_transcription_starts() {
        let h = Harness::new(&["en"], &[]);
        let outcome = h.pipeline.on_object_created("media", KEY).await.unwrap();
        assert_eq!(outcome, Outcome::Done);

        let asset = h.assets.snapshot(asset_id_for(DECODED)).unwrap();
        assert_eq!(asset.state, AssetState::Transcribing);
        assert_eq!(asset.title, "Egg Fried Rice");
        assert_eq!(asset.source_language, "en");
        assert_eq!(asset.frame_keys, vec![frame_key(asset.id)]);
        assert_eq!(asset.duration_seconds, Some(12.5));

        let requests = h.transcription.requests.lock().unwrap().clone();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].job_name, asset.transcription_job.clone().unwrap());
        assert_eq!(requests[0].media_uri, format!("mem://media/{DECODED}"));
    }

    #[tokio::test]
    async fn duplicate_notifications_start_one_transcription() {
        let h = Harness::new(&["en"], &[]);
        h.pipeline.on_object_created("media", KEY).await.unwrap();
        let again = h.pipeline.on_object_created("media", KEY).await.unwrap();

        assert_eq!(again, Outcome::Done);
        let asset = h.assets.snapshot(asset_id_for(DECODED)).unwrap();
        assert_eq!(h.transcription.jobs(), vec![asset.transcription_job.clone().unwrap()]);
        assert_eq!(asset.state, AssetState::Transcribing);
    }

    #[tokio::test]
    async fn redelivery_after_claim_starts_the_missing_job() {
        let h = Harness::new(&["en"], &[]);
        let id = asset_id_for(DECODED);
        let asset = MediaAsset::new(DECODED, "Egg Fried Rice", "en");
        h.assets.create_if_absent(&asset).await.unwrap();

        // A first delivery claimed the asset and died before starting the job.
        let handle = asset.transcription_handle();
        let claim = AssetChange::to(AssetState::Transcribing).job(&handle, &format!("transcription/{handle}"));
        h.assets
            .transition(id, &Guard::state(AssetState::Uploaded), &claim)
            .await
            .unwrap()
            .unwrap();
        assert!(h.transcription.jobs().is_empty());

        assert_eq!(h.pipeline.on_object_created("media", KEY).await.unwrap(), Outcome::Done);
        assert_eq!(h.transcription.jobs(), vec![handle.clone()]);
        let requests = h.transcription.requests.lock().unwrap().clone();
        assert_eq!(requests[0].output_key, format!("transcription/{handle}"));
        assert_eq!(h.assets.snapshot(id).unwrap().state, AssetState::Transcribing);
    }

    #[tokio::test]
    async fn rejected_restart_fails_the_claimed_asset() {
        let h = Harness::new(&["en"], &[]);
        h.pipeline.on_object_created("media", KEY).await.unwrap();
        h.transcription.reject(true);

        let err = h.pipeline.on_object_created("media", KEY).await.unwrap_err();
        assert!(!err.is_transient());
        assert_eq!(h.assets.snapshot(asset_id_for(DECODED)).unwrap().state, AssetState::Failed);
    }

    #[tokio::test]
    async fn non_video_keys_are_ignored() {
        let h = Harness::new(&["en"], &[]);
        let outcome = h.pipeline.on_object_created("media", "video/notes.txt").await.unwrap();
        assert!(matches!(outcome, Outcome::Ignored(_)));
        let outcome = h.pipeline.on_object_created("media", "thumbnail/a.mp4").await.unwrap();
        assert!(matches!(outcome, Outcome::Ignored(_)));
    }

    #[tokio::test]
    async fn rejected_transcription_fails_the_asset() {
        let h = Harness::new(&["en"], &[]);
        h.transcription.reject(true);

        let err = h.pipeline.on_object_created("media", KEY).await.unwrap_err();
        assert!(!err.is_transient());
        let asset = h.assets.snapshot(asset_id_for(DECODED)).unwrap();
        assert_eq!(asset.state, AssetState::Failed);
        assert!(asset.error_detail.unwrap().contains("rejected"));
    }

    #[tokio::test]
    async fn duplicate_completion_enqueues_exactly_one_job() {
        let h = Harness::new(&["en"], &[]);
        let (id, job) = transcribed(&h).await;

        let again = h
            .pipeline
            .on_transcription_event(&completed(&job.transcription_job))
            .await
            .unwrap();
        assert!(matches!(again, Outcome::Stale(_)));
        assert_eq!(h.jobs().len(), 1);
        assert_eq!(job.asset_id, id);
        assert_eq!(job.source_language, "en");
        assert_eq!(h.assets.snapshot(id).unwrap().state, AssetState::Transcribed);
    }

    #[tokio::test]
    async fn unfinished_and_unknown_completions_change_nothing() {
        let h = Harness::new(&["en"], &[]);
        h.pipeline.on_object_created("media", KEY).await.unwrap();
        let asset = h.assets.snapshot(asset_id_for(DECODED)).unwrap();
        let handle = asset.transcription_job.clone().unwrap();

        let in_progress = TranscriptionEvent {
            status: TranscriptionStatus::InProgress,
            ..completed(&handle)
        };
        assert!(matches!(
            h.pipeline.on_transcription_event(&in_progress).await.unwrap(),
            Outcome::Ignored(_)
        ));
        assert!(matches!(
            h.pipeline.on_transcription_event(&completed("nobody-r0")).await.unwrap(),
            Outcome::Stale(_)
        ));
        assert_eq!(h.assets.snapshot(asset.id).unwrap().state, AssetState::Transcribing);
        assert!(h.jobs().is_empty());
    }

    #[tokio::test]
    async fn failed_transcription_fails_the_asset() {
        let h = Harness::new(&["en"], &[]);
        h.pipeline.on_object_created("media", KEY).await.unwrap();
        let asset = h.assets.snapshot(asset_id_for(DECODED)).unwrap();

        let failed = TranscriptionEvent {
            status: TranscriptionStatus::Failed,
            failure_reason: Some("audio track missing".to_string()),
            ..completed(&asset.transcription_job.clone().unwrap())
        };
        assert_eq!(h.pipeline.on_transcription_event(&failed).await.unwrap(), Outcome::Done);

        let asset = h.assets.snapshot(asset.id).unwrap();
        assert_eq!(asset.state, AssetState::Failed);
        assert!(asset.error_detail.unwrap().contains("audio track missing"));
    }

    #[tokio::test]
    async fn enqueue_failure_hands_the_completion_back() {
        let h = Harness::new(&["en"], &[]);
        h.pipeline.on_object_created("media", KEY).await.unwrap();
        let asset = h.assets.snapshot(asset_id_for(DECODED)).unwrap();
        let handle = asset.transcription_job.clone().unwrap();

        h.bus.fail(true);
        let err = h.pipeline.on_transcription_event(&completed(&handle)).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(h.assets.snapshot(asset.id).unwrap().state, AssetState::Transcribing);

        h.bus.fail(false);
        assert_eq!(
            h.pipeline.on_transcription_event(&completed(&handle)).await.unwrap(),
            Outcome::Done
        );
        assert_eq!(h.jobs().len(), 1);
    }

    #[tokio::test]
    async fn full_pipeline_makes_every_language_searchable() {
        let h = Harness::new(&["en", "fr"], &[]);
        let (id, job) = transcribed(&h).await;

        assert_eq!(h.worker.handle(&job, 0).await.unwrap(), Outcome::Done);
        let asset = h.assets.snapshot(id).unwrap();
        assert_eq!(asset.state, AssetState::Subtitled);
        assert_eq!(asset.subtitle_tracks.len(), 2);
        assert!(asset.error_detail.is_none());

        let fr = h.storage.text(&format!("subtitle/{id}/fr.vtt")).unwrap();
        assert!(fr.starts_with("WEBVTT"));
        assert!(fr.contains("oeuf frit riz."));
        assert!(h.storage.contains(&SubtitleResult::record_key(id)));
        let srt = h.storage.text(&format!("subtitle/{id}/en.srt")).unwrap();
        assert!(srt.contains("00:00:02,000 --> "));

        index_all(&h).await;

        let english = h.search.search(&query("rice", Some("en"))).await.unwrap();
        assert_eq!(english.results.len(), 1);
        let hit = &english.results[0];
        assert_eq!(hit.asset_id, id);
        assert_eq!(hit.title, "Egg Fried Rice");
        assert_eq!(hit.timestamp, "00:00:02.000");
        assert_eq!(
            hit.playback_url,
            "https://cdn.example.com/media/video/Egg%20Fried%20Rice.en.mp4#t=2.000"
        );
        assert_eq!(
            hit.subtitle_url,
            Some(format!("https://cdn.example.com/media/subtitle/{id}/en.vtt"))
        );
        assert!(hit.thumbnail_url.is_some());

        let french = h.search.search(&query("riz", Some("fr"))).await.unwrap();
        assert_eq!(french.results.len(), 1);
        assert_eq!(french.results[0].language, "fr");
    }

    #[tokio::test]
    async fn failed_language_degrades_to_fewer_tracks() {
        let h = Harness::new(&["en", "fr"], &[]);
        h.translation.fail_language("fr");
        let (id, job) = transcribed(&h).await;

        assert_eq!(h.worker.handle(&job, 0).await.unwrap(), Outcome::Done);
        let asset = h.assets.snapshot(id).unwrap();
        assert_eq!(asset.state, AssetState::Subtitled);
        let languages: Vec<&str> = asset.subtitle_tracks.iter().map(|t| t.language.as_str()).collect();
        assert_eq!(languages, vec!["en"]);
        assert!(asset.error_detail.unwrap().contains("fr"));

        let ResultEvent::Ready(result) = &h.results()[0] else {
            panic!("expected a ready event");
        };
        assert_eq!(result.missing_languages, vec!["fr".to_string()]);

        index_all(&h).await;
        assert_eq!(h.search.search(&query("rice", None)).await.unwrap().results.len(), 1);
        assert!(h.search.search(&query("riz", None)).await.unwrap().results.is_empty());
    }

    #[tokio::test]
    async fn failed_required_language_fails_the_asset() {
        let h = Harness::new(&["en", "fr"], &["fr"]);
        h.translation.fail_language("fr");
        let (id, job) = transcribed(&h).await;

        let err = h.worker.handle(&job, 0).await.unwrap_err();
        assert!(matches!(err, PipelineError::LanguagesFailed(_)));
        assert!(!err.is_transient());

        let asset = h.assets.snapshot(id).unwrap();
        assert_eq!(asset.state, AssetState::Failed);
        assert!(h.results().is_empty());
    }

    #[tokio::test]
    async fn missing_transcript_fails_the_asset() {
        let h = Harness::new(&["en"], &[]);
        let (id, job) = transcribed(&h).await;
        h.storage.delete(&job.transcript_key).await.unwrap();

        let err = h.worker.handle(&job, 0).await.unwrap_err();
        assert!(!err.is_transient());
        assert_eq!(h.assets.snapshot(id).unwrap().state, AssetState::Failed);
    }

    #[tokio::test]
    async fn redelivered_job_republishes_the_same_result() {
        let h = Harness::new(&["en"], &[]);
        let (_, job) = transcribed(&h).await;

        h.worker.handle(&job, 0).await.unwrap();
        assert_eq!(h.worker.handle(&job, 0).await.unwrap(), Outcome::Done);

        let results = h.results();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0], results[1]);

        assert!(matches!(
            h.indexing.apply(&results[0]).await.unwrap(),
            WriteOutcome::Committed { .. }
        ));
        assert_eq!(h.indexing.apply(&results[1]).await.unwrap(), WriteOutcome::Unchanged);
    }

    #[tokio::test]
    async fn stale_job_for_an_older_run_is_discarded() {
        let h = Harness::new(&["en"], &[]);
        let (_, job) = transcribed(&h).await;
        let stale = SubtitleJob {
            transcription_job: format!("{}-old", job.transcription_job),
            ..job.clone()
        };

        assert!(matches!(h.worker.handle(&stale, 0).await.unwrap(), Outcome::Stale(_)));
        assert!(h.results().is_empty());
    }

    #[tokio::test]
    async fn result_publish_failure_is_recovered_on_redelivery() {
        let h = Harness::new(&["en"], &[]);
        let (id, job) = transcribed(&h).await;

        h.bus.fail(true);
        assert!(h.worker.handle(&job, 0).await.unwrap_err().is_transient());
        assert_eq!(h.assets.snapshot(id).unwrap().state, AssetState::Subtitled);

        h.bus.fail(false);
        assert_eq!(h.worker.handle(&job, 1).await.unwrap(), Outcome::Done);
        assert_eq!(h.results().len(), 1);
    }

    #[tokio::test]
    async fn reprocess_withdraws_and_starts_a_new_revision() {
        let h = Harness::new(&["en"], &[]);
        let (id, job) = transcribed(&h).await;
        h.worker.handle(&job, 0).await.unwrap();
        index_all(&h).await;
        assert_eq!(h.search.search(&query("rice", None)).await.unwrap().results.len(), 1);

        let asset = h.pipeline.reprocess(id).await.unwrap();
        assert_eq!(asset.state, AssetState::Transcribing);
        assert_eq!(asset.revision, 1);
        assert!(asset.transcription_job.clone().unwrap().ends_with("-r1"));
        assert!(asset.subtitle_tracks.is_empty());
        assert!(!h.storage.contains(&SubtitleResult::record_key(id)));

        // Not yet withdrawn from the index, but hidden by hydration.
        let hidden = h.search.search(&query("rice", None)).await.unwrap();
        assert_eq!(hidden.total, 0);
        assert_eq!(hidden.index_total, 1);
        assert!(hidden.results.is_empty());

        let withdrawn = h.results().pop().unwrap();
        assert!(matches!(withdrawn, ResultEvent::Withdrawn { .. }));
        h.indexing.apply(&withdrawn).await.unwrap();
        assert_eq!(h.search.search(&query("rice", None)).await.unwrap().total, 0);

        // The first run's completion no longer matches any asset.
        assert!(matches!(
            h.pipeline
                .on_transcription_event(&completed(&job.transcription_job))
                .await
                .unwrap(),
            Outcome::Stale(_)
        ));
    }

    #[tokio::test]
    async fn reprocess_losing_a_race_keeps_the_published_result() {
        let h = Harness::new(&["en"], &[]);
        let (id, job) = transcribed(&h).await;
        h.worker.handle(&job, 0).await.unwrap();
        let published = h.results().len();

        // Another delivery moves the asset between the read and the reset.
        h.assets.before_next_transition(|asset| {
            asset.state = AssetState::Failed;
        });
        let err = h.pipeline.reprocess(id).await.unwrap_err();
        assert!(matches!(err, PipelineError::Conflict(_)));

        assert!(h.storage.contains(&SubtitleResult::record_key(id)));
        assert_eq!(h.results().len(), published);
        assert!(!h.results().iter().any(|e| matches!(e, ResultEvent::Withdrawn { .. })));
        assert_eq!(h.assets.snapshot(id).unwrap().revision, 0);
    }

    #[tokio::test]
    async fn hydration_failure_drops_only_that_hit() {
        let h = Harness::new(&["en"], &[]);
        let (first, job) = transcribed(&h).await;
        h.worker.handle(&job, 0).await.unwrap();

        const OTHER: &str = "video/More+Fried+Rice.en.mp4";
        assert_eq!(h.pipeline.on_object_created("media", OTHER).await.unwrap(), Outcome::Done);
        let second = asset_id_for("video/More Fried Rice.en.mp4");
        let asset = h.assets.snapshot(second).unwrap();
        h.storage.insert(
            asset.transcript_key.as_deref().unwrap(),
            transcript(&[("More", 1.0), ("fried", 1.5), ("rice", 2.0), (".", 0.0)]),
        );
        h.pipeline
            .on_transcription_event(&completed(&asset.transcription_job.clone().unwrap()))
            .await
            .unwrap();
        let job = h.jobs().pop().unwrap();
        h.worker.handle(&job, 0).await.unwrap();
        index_all(&h).await;

        let both = h.search.search(&query("rice", None)).await.unwrap();
        assert_eq!(both.total, 2);
        assert_eq!(both.results.len(), 2);

        h.assets.fail_get(first);
        let response = h.search.search(&query("rice", None)).await.unwrap();
        let ids: Vec<Uuid> = response.results.iter().map(|r| r.asset_id).collect();
        assert_eq!(ids, vec![second]);
        assert_eq!(response.total, 1);
        assert_eq!(response.index_total, 2);
    }

    #[tokio::test]
    async fn added_language_is_merged_and_republished() {
        let h = Harness::new(&["en"], &[]);
        let (id, job) = transcribed(&h).await;
        h.worker.handle(&job, 0).await.unwrap();

        let extra = h.pipeline.add_language(id, "fr-CA").await.unwrap();
        assert_eq!(extra.kind, JobKind::AddLanguages);
        assert_eq!(extra.target_languages, vec!["fr".to_string()]);
        assert_eq!(h.jobs().last(), Some(&extra));

        assert_eq!(h.worker.handle(&extra, 0).await.unwrap(), Outcome::Done);
        // A second request for the same language replaces the track.
        let again = h.pipeline.add_language(id, "fr").await.unwrap();
        assert_eq!(h.worker.handle(&again, 0).await.unwrap(), Outcome::Done);

        let asset = h.assets.snapshot(id).unwrap();
        assert_eq!(asset.state, AssetState::Subtitled);
        let languages: Vec<&str> = asset.subtitle_tracks.iter().map(|t| t.language.as_str()).collect();
        assert_eq!(languages, vec!["en", "fr"]);
        assert!(h.storage.text(&format!("subtitle/{id}/fr.vtt")).unwrap().contains("oeuf frit riz."));

        let ResultEvent::Ready(result) = h.results().pop().unwrap() else {
            panic!("expected a ready event");
        };
        assert_eq!(result.tracks, asset.subtitle_tracks);
        assert!(result.missing_languages.is_empty());

        index_all(&h).await;
        let french = h.search.search(&query("riz", Some("fr"))).await.unwrap();
        assert_eq!(french.results.len(), 1);
        assert_eq!(h.search.search(&query("rice", Some("en"))).await.unwrap().results.len(), 1);
    }

    #[tokio::test]
    async fn languages_are_only_added_to_subtitled_assets() {
        let h = Harness::new(&["en"], &[]);
        let (id, job) = transcribed(&h).await;

        assert!(matches!(
            h.pipeline.add_language(id, "fr").await.unwrap_err(),
            PipelineError::Conflict(_)
        ));
        assert!(matches!(
            h.pipeline.add_language(Uuid::new_v4(), "fr").await.unwrap_err(),
            PipelineError::NotFound(_)
        ));

        h.worker.handle(&job, 0).await.unwrap();
        let extra = h.pipeline.add_language(id, "fr").await.unwrap();
        h.pipeline.reprocess(id).await.unwrap();
        assert!(matches!(h.worker.handle(&extra, 0).await.unwrap(), Outcome::Stale(_)));
        assert!(h.assets.snapshot(id).unwrap().subtitle_tracks.is_empty());
    }

    #[tokio::test]
    async fn failed_added_language_keeps_existing_tracks() {
        let h = Harness::new(&["en"], &[]);
        let (id, job) = transcribed(&h).await;
        h.worker.handle(&job, 0).await.unwrap();
        let published = h.results().len();

        h.translation.fail_language("fr");
        let extra = h.pipeline.add_language(id, "fr").await.unwrap();
        let err = h.worker.handle(&extra, 0).await.unwrap_err();
        assert!(matches!(err, PipelineError::LanguagesFailed(_)));

        let asset = h.assets.snapshot(id).unwrap();
        assert_eq!(asset.state, AssetState::Subtitled);
        assert_eq!(asset.subtitle_tracks.len(), 1);
        assert_eq!(h.results().len(), published);
    }

    #[tokio::test]
    async fn missing_index_is_rebuilt_from_result_records() {
        let h = Harness::new(&["en"], &[]);
        let (_, job) = transcribed(&h).await;
        h.worker.handle(&job, 0).await.unwrap();
        h.storage.insert("results/garbage.json", "not json");

        let report = h.indexing.ensure_ready().await.unwrap().unwrap();
        assert_eq!(report.documents, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(h.search.search(&query("rice", None)).await.unwrap().results.len(), 1);

        assert!(h.indexing.ensure_ready().await.unwrap().is_none());
    }

    async fn send(h: &Harness, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = crate::app::create_app(h.state()).oneshot(request).await.unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
        (status, value)
    }

    fn post_json(uri: &str, body: impl Into<Body>) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(body.into())
            .unwrap()
    }

    #[tokio::test]
    async fn storage_webhook_starts_the_pipeline() {
        let h = Harness::new(&["en"], &[]);
        let body = json!({
            "Records": [{
                "eventName": "s3:ObjectCreated:Put",
                "s3": {"bucket": {"name": "media"}, "object": {"key": KEY, "size": 10}}
            }]
        });

        let (status, value) = send(&h, post_json("/api/v1/events/storage", body.to_string())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(value["data"][0]["outcome"], "handled");
        assert_eq!(
            h.assets.snapshot(asset_id_for(DECODED)).unwrap().state,
            AssetState::Transcribing
        );
    }

    #[tokio::test]
    async fn malformed_webhook_is_dead_lettered() {
        let h = Harness::new(&["en"], &[]);
        let (status, _) = send(&h, post_json("/api/v1/events/transcription", "{\"job\":1}")).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(h.bus.raw(&Destination::queue(PIPELINE_EVENTS_DLQ)).len(), 1);
    }

    #[tokio::test]
    async fn subtitle_endpoint_enqueues_extra_languages() {
        let h = Harness::new(&["en"], &[]);
        let (id, job) = transcribed(&h).await;
        let uri = format!("/api/v1/assets/{id}/subtitles");

        let (status, _) = send(&h, post_json(&uri, json!({"target_lang": "fr"}).to_string())).await;
        assert_eq!(status, StatusCode::CONFLICT);

        h.worker.handle(&job, 0).await.unwrap();
        let (status, _) = send(&h, post_json(&uri, json!({"target_lang": ""}).to_string())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = send(&h, post_json(&uri, "{\"lang\":\"fr\"}")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, value) = send(&h, post_json(&uri, json!({"target_lang": "fr"}).to_string())).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(value["data"]["target_lang"], "fr");
        assert_eq!(h.jobs().last().unwrap().kind, JobKind::AddLanguages);

        let unknown = format!("/api/v1/assets/{}/subtitles", Uuid::new_v4());
        let (status, _) = send(&h, post_json(&unknown, json!({"target_lang": "fr"}).to_string())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn search_endpoint_validates_and_answers() {
        let h = Harness::new(&["en"], &[]);
        let (_, job) = transcribed(&h).await;
        h.worker.handle(&job, 0).await.unwrap();
        index_all(&h).await;

        let get = |uri: &str| Request::builder().uri(uri).body(Body::empty()).unwrap();

        let (status, _) = send(&h, get("/api/v1/search?q=rice&limit=500")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, value) = send(&h, get("/api/v1/search?q=rice&lang=en")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(value["data"]["results"][0]["title"], "Egg Fried Rice");

        let (status, _) = send(&h, get(&format!("/api/v1/assets/{}", Uuid::new_v4()))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
