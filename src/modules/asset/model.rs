use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use utoipa::ToSchema;
use uuid::Uuid;

/// Namespace for asset ids derived from object keys.
const ASSET_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2d0e_8a57_4b8e_9d3a_52c4_e1b7_a903);

pub fn asset_id_for(object_key: &str) -> Uuid {
    Uuid::new_v5(&ASSET_NAMESPACE, object_key.as_bytes())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum AssetState {
    Uploaded,
    Transcribing,
    Transcribed,
    Subtitling,
    Subtitled,
    Failed,
}

impl AssetState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetState::Uploaded => "uploaded",
            AssetState::Transcribing => "transcribing",
            AssetState::Transcribed => "transcribed",
            AssetState::Subtitling => "subtitling",
            AssetState::Subtitled => "subtitled",
            AssetState::Failed => "failed",
        }
    }

    /// Edges of the lifecycle. Backward edges into `uploaded` are reserved for
    /// reprocessing; `subtitling -> transcribed` and `transcribing ->
    /// uploaded` hand a claimed asset back for retry.
    pub fn can_move_to(self, next: AssetState) -> bool {
        use AssetState::*;
        match (self, next) {
            (Uploaded, Transcribing)
            | (Transcribing, Transcribed)
            | (Transcribed, Subtitling)
            | (Subtitling, Subtitled) => true,
            (Subtitling, Transcribed) | (Transcribing, Uploaded) | (Transcribed, Transcribing) => {
                true
            }
            // Extra languages are merged into a subtitled asset in place.
            (Subtitled, Subtitled) => true,
            (Failed, _) | (Subtitled, _) => next == Uploaded,
            (_, Failed) => true,
            (_, Uploaded) => true,
            _ => false,
        }
    }
}

impl fmt::Display for AssetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AssetState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uploaded" => Ok(AssetState::Uploaded),
            "transcribing" => Ok(AssetState::Transcribing),
            "transcribed" => Ok(AssetState::Transcribed),
            "subtitling" => Ok(AssetState::Subtitling),
            "subtitled" => Ok(AssetState::Subtitled),
            "failed" => Ok(AssetState::Failed),
            other => Err(format!("unknown asset state `{other}`")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct SubtitleTrack {
    pub language: String,
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct MediaAsset {
    pub id: Uuid,
    pub state: AssetState,
    pub source_key: String,
    pub title: String,
    pub source_language: String,
    /// Bumped on every reprocess; part of the transcription job handle.
    pub revision: i32,
    pub duration_seconds: Option<f64>,
    pub frame_keys: Vec<String>,
    pub transcription_job: Option<String>,
    pub transcript_key: Option<String>,
    pub subtitle_tracks: Vec<SubtitleTrack>,
    pub error_detail: Option<String>,
    pub version: i64,
    #[schema(value_type = String, format = DateTime)]
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[schema(value_type = String, format = DateTime)]
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl MediaAsset {
    pub fn new(source_key: &str, title: &str, source_language: &str) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id: asset_id_for(source_key),
            state: AssetState::Uploaded,
            source_key: source_key.to_string(),
            title: title.to_string(),
            source_language: source_language.to_string(),
            revision: 0,
            duration_seconds: None,
            frame_keys: Vec::new(),
            transcription_job: None,
            transcript_key: None,
            subtitle_tracks: Vec::new(),
            error_detail: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Handle for the transcription run of the current revision.
    pub fn transcription_handle(&self) -> String {
        format!("{}-r{}", self.id, self.revision)
    }

    pub fn holds_job(&self, handle: &str) -> bool {
        self.transcription_job.as_deref() == Some(handle)
    }
}

/// Preconditions of a conditional update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Guard {
    pub states: Vec<AssetState>,
    pub transcription_job: Option<String>,
}

impl Guard {
    pub fn state(state: AssetState) -> Self {
        Self {
            states: vec![state],
            transcription_job: None,
        }
    }

    pub fn states(states: &[AssetState]) -> Self {
        Self {
            states: states.to_vec(),
            transcription_job: None,
        }
    }

    pub fn with_job(mut self, handle: &str) -> Self {
        self.transcription_job = Some(handle.to_string());
        self
    }

    pub fn admits(&self, asset: &MediaAsset) -> bool {
        self.states.contains(&asset.state)
            && self
                .transcription_job
                .as_deref()
                .is_none_or(|job| asset.holds_job(job))
    }
}

/// Fields written by a transition. `None` leaves a field untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct AssetChange {
    pub state: AssetState,
    /// Clears job, transcript, tracks and error and bumps the revision.
    pub reset: bool,
    pub transcription_job: Option<String>,
    pub transcript_key: Option<String>,
    pub frame_keys: Option<Vec<String>>,
    pub duration_seconds: Option<f64>,
    pub subtitle_tracks: Option<Vec<SubtitleTrack>>,
    pub error_detail: Option<Option<String>>,
}

impl AssetChange {
    pub fn to(state: AssetState) -> Self {
        Self {
            state,
            reset: false,
            transcription_job: None,
            transcript_key: None,
            frame_keys: None,
            duration_seconds: None,
            subtitle_tracks: None,
            error_detail: None,
        }
    }

    pub fn reset() -> Self {
        Self {
            reset: true,
            error_detail: Some(None),
            ..Self::to(AssetState::Uploaded)
        }
    }

    pub fn job(mut self, handle: &str, transcript_key: &str) -> Self {
        self.transcription_job = Some(handle.to_string());
        self.transcript_key = Some(transcript_key.to_string());
        self
    }

    pub fn frames(mut self, keys: Vec<String>, duration_seconds: Option<f64>) -> Self {
        self.frame_keys = Some(keys);
        self.duration_seconds = duration_seconds;
        self
    }

    pub fn tracks(mut self, tracks: Vec<SubtitleTrack>) -> Self {
        self.subtitle_tracks = Some(tracks);
        self
    }

    pub fn error(mut self, detail: Option<String>) -> Self {
        self.error_detail = Some(detail);
        self
    }

    /// Applies the change in memory, the way the store's UPDATE does.
    pub fn apply(&self, asset: &mut MediaAsset) {
        asset.state = self.state;
        if self.reset {
            asset.revision += 1;
            asset.transcription_job = None;
            asset.transcript_key = None;
            asset.subtitle_tracks.clear();
        }
        if let Some(job) = &self.transcription_job {
            asset.transcription_job = Some(job.clone());
        }
        if let Some(key) = &self.transcript_key {
            asset.transcript_key = Some(key.clone());
        }
        if let Some(frames) = &self.frame_keys {
            asset.frame_keys = frames.clone();
        }
        if let Some(duration) = self.duration_seconds {
            asset.duration_seconds = Some(duration);
        }
        if let Some(tracks) = &self.subtitle_tracks {
            asset.subtitle_tracks = tracks.clone();
        }
        if let Some(detail) = &self.error_detail {
            asset.error_detail = detail.clone();
        }
        asset.version += 1;
        asset.updated_at = OffsetDateTime::now_utc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use AssetState::*;

    #[test]
    fn asset_id_is_stable_per_key() {
        let a = asset_id_for("video/Egg Fried Rice.en-GB.mp4");
        assert_eq!(a, asset_id_for("video/Egg Fried Rice.en-GB.mp4"));
        assert_ne!(a, asset_id_for("video/Egg Fried Rice.ko.mp4"));
    }

    #[test]
    fn forward_path_is_allowed() {
        let path = [Uploaded, Transcribing, Transcribed, Subtitling, Subtitled];
        for pair in path.windows(2) {
            assert!(pair[0].can_move_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn terminal_states_only_reset() {
        for next in [Transcribing, Transcribed, Subtitling, Failed] {
            assert!(!Subtitled.can_move_to(next));
            assert!(!Failed.can_move_to(next));
        }
        assert!(!Failed.can_move_to(Subtitled));
        assert!(Failed.can_move_to(Uploaded));
        assert!(Subtitled.can_move_to(Uploaded));
        assert!(Subtitled.can_move_to(Subtitled));
    }

    #[test]
    fn no_skipping_ahead() {
        assert!(!Uploaded.can_move_to(Subtitled));
        assert!(!Transcribing.can_move_to(Subtitling));
        assert!(!Uploaded.can_move_to(Transcribed));
    }

    #[test]
    fn state_names_round_trip_through_text() {
        for state in [Uploaded, Transcribing, Transcribed, Subtitling, Subtitled, Failed] {
            assert_eq!(state.as_str().parse::<AssetState>().unwrap(), state);
        }
        assert!("done".parse::<AssetState>().is_err());
    }

    #[test]
    fn reset_bumps_revision_and_clears_outputs() {
        let mut asset = MediaAsset::new("video/a.en.mp4", "a", "en");
        AssetChange::to(Transcribing).job("h", "transcription/h").apply(&mut asset);
        asset.subtitle_tracks.push(SubtitleTrack {
            language: "en".into(),
            key: "subtitle/x/en.vtt".into(),
        });
        asset.error_detail = Some("boom".into());

        AssetChange::reset().apply(&mut asset);
        assert_eq!(asset.state, Uploaded);
        assert_eq!(asset.revision, 1);
        assert!(asset.transcription_job.is_none());
        assert!(asset.subtitle_tracks.is_empty());
        assert!(asset.error_detail.is_none());
        assert_eq!(asset.version, 2);
        assert!(asset.transcription_handle().ends_with("-r1"));
    }

    #[test]
    fn guard_checks_state_and_job() {
        let mut asset = MediaAsset::new("video/a.en.mp4", "a", "en");
        AssetChange::to(Transcribing).job("h1", "t").apply(&mut asset);

        assert!(Guard::state(Transcribing).with_job("h1").admits(&asset));
        assert!(!Guard::state(Transcribing).with_job("h0").admits(&asset));
        assert!(!Guard::state(Transcribed).admits(&asset));
    }
}
