use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::process::Command;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{ExternalError, ExternalResult};
use crate::infrastructure::storage::ObjectStore;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct FrameSet {
    pub frame_keys: Vec<String>,
    pub duration_seconds: Option<f64>,
}

pub fn frame_key(asset_id: Uuid) -> String {
    format!("thumbnail/{asset_id}.jpg")
}

/// Video in, representative still frame(s) out.
#[async_trait]
pub trait FrameExtractor: Send + Sync {
    async fn extract(&self, asset_id: Uuid, video_key: &str) -> ExternalResult<FrameSet>;
}

pub struct FfmpegFrameExtractor {
    storage: Arc<dyn ObjectStore>,
    ffmpeg: String,
    ffprobe: String,
}

impl FfmpegFrameExtractor {
    pub fn new(storage: Arc<dyn ObjectStore>, ffmpeg: &str, ffprobe: &str) -> Self {
        Self {
            storage,
            ffmpeg: ffmpeg.to_string(),
            ffprobe: ffprobe.to_string(),
        }
    }

    async fn run(&self, asset_id: Uuid, video_key: &str, work_dir: &Path) -> ExternalResult<FrameSet> {
        let video = self
            .storage
            .get(video_key)
            .await
            .map_err(|e| ExternalError::Unavailable(e.to_string()))?;

        let input = work_dir.join("input");
        let output = work_dir.join("frame.jpg");
        tokio::fs::write(&input, &video)
            .await
            .map_err(|e| ExternalError::Unavailable(format!("write input: {e}")))?;

        let duration_seconds = self.read_duration(&input).await;
        // Short clips have no frame at one second in.
        let seek = match duration_seconds {
            Some(d) if d < 2.0 => "0",
            _ => "1",
        };

        let status = Command::new(&self.ffmpeg)
            .args(["-v", "error", "-ss", seek, "-i"])
            .arg(&input)
            .args(["-frames:v", "1", "-q:v", "2", "-y"])
            .arg(&output)
            .kill_on_drop(true)
            .status()
            .await
            .map_err(|e| ExternalError::Unavailable(format!("spawn ffmpeg: {e}")))?;
        if !status.success() {
            return Err(ExternalError::Rejected(format!("ffmpeg exited with {status}")));
        }

        let frame = tokio::fs::read(&output)
            .await
            .map_err(|e| ExternalError::InvalidResponse(format!("read frame: {e}")))?;
        let key = frame_key(asset_id);
        self.storage
            .put(&key, Bytes::from(frame), "image/jpeg")
            .await
            .map_err(|e| ExternalError::Unavailable(e.to_string()))?;

        Ok(FrameSet {
            frame_keys: vec![key],
            duration_seconds,
        })
    }

    async fn read_duration(&self, input: &Path) -> Option<f64> {
        let output = Command::new(&self.ffprobe)
            .args([
                "-v",
                "error",
                "-show_entries",
                "format=duration",
                "-of",
                "default=noprint_wrappers=1:nokey=1",
            ])
            .arg(input)
            .kill_on_drop(true)
            .output()
            .await
            .ok()?;
        if !output.status.success() {
            return None;
        }
        String::from_utf8_lossy(&output.stdout).trim().parse::<f64>().ok()
    }
}

#[async_trait]
impl FrameExtractor for FfmpegFrameExtractor {
    async fn extract(&self, asset_id: Uuid, video_key: &str) -> ExternalResult<FrameSet> {
        let work_dir: PathBuf = std::env::temp_dir().join(format!("frames-{}", Uuid::new_v4()));
        tokio::fs::create_dir_all(&work_dir)
            .await
            .map_err(|e| ExternalError::Unavailable(format!("create work dir: {e}")))?;

        debug!(%asset_id, video_key, "Extracting frames");
        let result = self.run(asset_id, video_key, &work_dir).await;

        if let Err(e) = tokio::fs::remove_dir_all(&work_dir).await {
            warn!(path = %work_dir.display(), "Failed to clean frame work dir: {}", e);
        }
        result
    }
}
