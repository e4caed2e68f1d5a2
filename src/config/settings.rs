use std::path::PathBuf;
use std::time::Duration;

use crate::config::env::{self, EnvKey};

/// Which parts of the service run in this process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Roles {
    pub api: bool,
    pub subtitle: bool,
    pub indexer: bool,
}

impl Roles {
    pub fn parse(raw: &[String]) -> Result<Self, ConfigError> {
        let mut roles = Roles {
            api: false,
            subtitle: false,
            indexer: false,
        };
        for role in raw {
            match role.to_ascii_lowercase().as_str() {
                "api" => roles.api = true,
                "subtitle" => roles.subtitle = true,
                "indexer" => roles.indexer = true,
                other => return Err(ConfigError::Invalid(EnvKey::Roles.as_str(), other.to_string())),
            }
        }
        if !(roles.api || roles.subtitle || roles.indexer) {
            return Err(ConfigError::Invalid(EnvKey::Roles.as_str(), "no role enabled".to_string()));
        }
        Ok(roles)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable {0}")]
    Missing(&'static str),
    #[error("Invalid value for {0}: {1}")]
    Invalid(&'static str, String),
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub server_port: u16,
    pub roles: Roles,
    pub database_url: String,
    pub rabbitmq_url: String,
    pub minio_url: String,
    pub minio_bucket: String,
    pub minio_access_key: String,
    pub minio_secret_key: String,
    pub cdn_base_url: String,
    pub transcribe_api_url: String,
    pub translate_api_url: String,
    pub index: IndexSettings,
    pub subtitles: SubtitleSettings,
    pub queue: QueueSettings,
    pub frame_timeout: Duration,
    pub external_timeout: Duration,
    pub ffmpeg_path: String,
    pub ffprobe_path: String,
}

#[derive(Clone, Debug)]
pub struct IndexSettings {
    pub mount: PathBuf,
    pub lease: Duration,
    pub lock_timeout: Duration,
    pub max_segments: usize,
    pub refresh_interval: Duration,
}

#[derive(Clone, Debug)]
pub struct SubtitleSettings {
    pub target_languages: Vec<String>,
    pub required_languages: Vec<String>,
    pub default_source_language: String,
    pub translate_retries: u32,
}

#[derive(Clone, Debug)]
pub struct QueueSettings {
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub worker_slots: usize,
}

fn required(key: EnvKey) -> Result<String, ConfigError> {
    let name = key.as_str();
    env::get(key).map_err(|_| ConfigError::Missing(name))
}

impl AppConfig {
    pub fn new() -> Result<Self, ConfigError> {
        let invocation_timeout = env::get_parsed(EnvKey::InvocationTimeoutSecs, 300u64);
        let minio_url = required(EnvKey::MinioUrl)?;
        let minio_bucket = required(EnvKey::MinioBucket)?;
        let default_cdn = format!("{}/{}/", minio_url.trim_end_matches('/'), minio_bucket);

        let target_languages = env::get_list(EnvKey::TargetLanguages, "en");
        if target_languages.is_empty() {
            return Err(ConfigError::Invalid(
                EnvKey::TargetLanguages.as_str(),
                "at least one language is required".to_string(),
            ));
        }

        Ok(Self {
            server_port: env::get_parsed(EnvKey::ServerPort, 3000),
            roles: Roles::parse(&env::get_list(EnvKey::Roles, "api,subtitle,indexer"))?,
            database_url: required(EnvKey::DatabaseUrl)?,
            rabbitmq_url: required(EnvKey::RabbitMqUrl)?,
            minio_url,
            minio_bucket,
            minio_access_key: required(EnvKey::MinioAccessKey)?,
            minio_secret_key: required(EnvKey::MinioSecretKey)?,
            cdn_base_url: env::get_or(EnvKey::CdnBaseUrl, &default_cdn),
            transcribe_api_url: required(EnvKey::TranscribeApiUrl)?,
            translate_api_url: required(EnvKey::TranslateApiUrl)?,
            index: IndexSettings {
                mount: PathBuf::from(env::get_or(EnvKey::IndexMount, "/mnt/index")),
                lease: Duration::from_secs(env::get_parsed(
                    EnvKey::IndexLeaseSecs,
                    invocation_timeout * 2,
                )),
                lock_timeout: Duration::from_secs(env::get_parsed(EnvKey::IndexLockTimeoutSecs, 10)),
                max_segments: env::get_parsed(EnvKey::IndexMaxSegments, 8usize).max(1),
                refresh_interval: Duration::from_millis(env::get_parsed(
                    EnvKey::IndexRefreshMillis,
                    500,
                )),
            },
            subtitles: SubtitleSettings {
                target_languages,
                required_languages: env::get_list(EnvKey::RequiredLanguages, ""),
                default_source_language: env::get_or(EnvKey::DefaultSourceLanguage, "en"),
                translate_retries: env::get_parsed(EnvKey::TranslateRetries, 3),
            },
            queue: QueueSettings {
                max_retries: env::get_parsed(EnvKey::QueueMaxRetries, 3),
                retry_delay: Duration::from_secs(env::get_parsed(EnvKey::QueueRetryDelaySecs, 30)),
                worker_slots: env::get_parsed(EnvKey::WorkerSlots, 1usize).max(1),
            },
            frame_timeout: Duration::from_secs(env::get_parsed(EnvKey::FrameTimeoutSecs, 30)),
            external_timeout: Duration::from_secs(env::get_parsed(EnvKey::ExternalTimeoutSecs, 15)),
            ffmpeg_path: env::get_or(EnvKey::FfmpegPath, "ffmpeg"),
            ffprobe_path: env::get_or(EnvKey::FfprobePath, "ffprobe"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn roles_parse_known_names() {
        let roles = Roles::parse(&list(&["API", "indexer"])).unwrap();
        assert!(roles.api && roles.indexer && !roles.subtitle);
    }

    #[test]
    fn roles_reject_unknown_or_empty() {
        assert!(matches!(
            Roles::parse(&list(&["api", "transcoder"])),
            Err(ConfigError::Invalid(_, value)) if value == "transcoder"
        ));
        assert!(Roles::parse(&[]).is_err());
    }
}
