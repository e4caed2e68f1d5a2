pub mod model;
pub mod transcript;

pub use model::{Cue, Subtitle, SubtitleError, format_timestamp};

/// `en` of `en-GB`.
pub fn primary_language(tag: &str) -> String {
    tag.split(['-', '_'])
        .next()
        .unwrap_or(tag)
        .to_ascii_lowercase()
}

pub fn track_key(asset_id: uuid::Uuid, language: &str) -> String {
    format!("subtitle/{asset_id}/{language}.vtt")
}
