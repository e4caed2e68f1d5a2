use std::env;
use std::str::FromStr;

pub enum EnvKey {
    ServerPort,
    Roles,
    DatabaseUrl,
    RabbitMqUrl,
    MinioUrl,
    MinioBucket,
    MinioAccessKey,
    MinioSecretKey,
    CdnBaseUrl,
    TranscribeApiUrl,
    TranslateApiUrl,
    IndexMount,
    IndexLeaseSecs,
    IndexLockTimeoutSecs,
    IndexMaxSegments,
    IndexRefreshMillis,
    TargetLanguages,
    RequiredLanguages,
    DefaultSourceLanguage,
    QueueMaxRetries,
    QueueRetryDelaySecs,
    WorkerSlots,
    InvocationTimeoutSecs,
    FrameTimeoutSecs,
    ExternalTimeoutSecs,
    TranslateRetries,
    FfmpegPath,
    FfprobePath,
}

impl EnvKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvKey::ServerPort => "APP_PORT",
            EnvKey::Roles => "APP_ROLES",
            EnvKey::DatabaseUrl => "DATABASE_URL",
            EnvKey::RabbitMqUrl => "RABBITMQ_URL",
            EnvKey::MinioUrl => "MINIO_ENDPOINT",
            EnvKey::MinioBucket => "MINIO_BUCKET_MEDIA",
            EnvKey::MinioAccessKey => "AWS_ACCESS_KEY_ID",
            EnvKey::MinioSecretKey => "AWS_SECRET_ACCESS_KEY",
            EnvKey::CdnBaseUrl => "CDN_BASE_URL",
            EnvKey::TranscribeApiUrl => "TRANSCRIBE_API_URL",
            EnvKey::TranslateApiUrl => "TRANSLATE_API_URL",
            EnvKey::IndexMount => "INDEX_MOUNT",
            EnvKey::IndexLeaseSecs => "INDEX_LEASE_SECS",
            EnvKey::IndexLockTimeoutSecs => "INDEX_LOCK_TIMEOUT_SECS",
            EnvKey::IndexMaxSegments => "INDEX_MAX_SEGMENTS",
            EnvKey::IndexRefreshMillis => "INDEX_REFRESH_MILLIS",
            EnvKey::TargetLanguages => "SUBTITLE_TARGET_LANGUAGES",
            EnvKey::RequiredLanguages => "SUBTITLE_REQUIRED_LANGUAGES",
            EnvKey::DefaultSourceLanguage => "DEFAULT_SOURCE_LANGUAGE",
            EnvKey::QueueMaxRetries => "QUEUE_MAX_RETRIES",
            EnvKey::QueueRetryDelaySecs => "QUEUE_RETRY_DELAY_SECS",
            EnvKey::WorkerSlots => "WORKER_SLOTS",
            EnvKey::InvocationTimeoutSecs => "INVOCATION_TIMEOUT_SECS",
            EnvKey::FrameTimeoutSecs => "FRAME_TIMEOUT_SECS",
            EnvKey::ExternalTimeoutSecs => "EXTERNAL_TIMEOUT_SECS",
            EnvKey::TranslateRetries => "TRANSLATE_RETRIES",
            EnvKey::FfmpegPath => "FFMPEG_PATH",
            EnvKey::FfprobePath => "FFPROBE_PATH",
        }
    }
}

pub fn get(key: EnvKey) -> Result<String, env::VarError> {
    env::var(key.as_str())
}

pub fn get_or(key: EnvKey, default: &str) -> String {
    env::var(key.as_str()).unwrap_or_else(|_| default.to_string())
}

pub fn get_parsed<T: FromStr>(key: EnvKey, default: T) -> T {
    match get(key) {
        Ok(val) => val.parse::<T>().unwrap_or(default),
        Err(_) => default,
    }
}

/// Comma separated list, blanks dropped.
pub fn get_list(key: EnvKey, default: &str) -> Vec<String> {
    split_list(&get_or(key, default))
}

pub fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|item| item.trim())
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}
