use tracing::{debug, info};

use super::error::{PipelineError, PipelineResult};
use super::service::PipelineService;
use super::Outcome;
use crate::modules::asset::model::{AssetState, MediaAsset};

pub const VIDEO_PREFIX: &str = "video/";

/// Title and spoken language carried in `video/<title>.<lang>.<ext>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoKey {
    pub title: String,
    pub language: String,
}

impl VideoKey {
    pub fn parse(key: &str, default_language: &str) -> Option<Self> {
        let file = key.strip_prefix(VIDEO_PREFIX)?.rsplit('/').next()?;
        let (stem, _ext) = file.rsplit_once('.')?;

        let (title, language) = match stem.rsplit_once('.') {
            Some((title, tag)) if !title.is_empty() && looks_like_language(tag) => {
                (title, tag.to_string())
            }
            _ => (stem, default_language.to_string()),
        };
        let title = title.trim();
        if title.is_empty() {
            return None;
        }

        Some(Self {
            title: title.to_string(),
            language,
        })
    }
}

/// ISO 639-1 codes plus the ISO 639-3 codes transcription services accept.
const LANGUAGES: &[&str] = &[
    "aa", "ab", "ae", "af", "ak", "am", "an", "ar", "ara", "as", "av", "ay", "az", "ba", "be",
    "bg", "bh", "bi", "bm", "bn", "bo", "br", "bs", "ca", "ce", "ch", "cmn", "co", "cr", "cs",
    "cu", "cv", "cy", "da", "de", "deu", "dv", "dz", "ee", "el", "en", "eng", "eo", "es", "et",
    "eu", "fa", "ff", "fi", "fil", "fj", "fo", "fr", "fra", "fy", "ga", "gd", "gl", "gn", "gu",
    "gv", "ha", "he", "hi", "ho", "hr", "ht", "hu", "hy", "hz", "ia", "id", "ie", "ig", "ii",
    "ik", "io", "is", "it", "iu", "ja", "jpn", "jv", "ka", "kg", "ki", "kj", "kk", "kl", "km",
    "kn", "ko", "kor", "kr", "ks", "ku", "kv", "kw", "ky", "la", "lb", "lg", "li", "ln", "lo",
    "lt", "lu", "lv", "mg", "mh", "mi", "mk", "ml", "mn", "mr", "ms", "mt", "my", "na", "nb",
    "nd", "ne", "ng", "nl", "nn", "no", "nr", "nv", "ny", "oc", "oj", "om", "or", "os", "pa",
    "pi", "pl", "por", "ps", "pt", "qu", "rm", "rn", "ro", "ru", "rus", "rw", "sa", "sc", "sd",
    "se", "sg", "si", "sk", "sl", "sm", "sn", "so", "spa", "sq", "sr", "ss", "st", "su", "sv",
    "sw", "ta", "te", "tg", "th", "ti", "tk", "tl", "tn", "to", "tr", "ts", "tt", "tw", "ty",
    "ug", "uk", "ur", "uz", "ve", "vi", "vo", "wa", "wo", "xh", "yi", "yo", "yue", "za", "zh",
    "zho", "zu",
];

/// `en`, `kor`, `en-GB`, `zh-Hant`. The primary subtag must be a known
/// lowercase code, so title words such as `Who` in `Dr.Who` are not taken
/// for a language.
fn looks_like_language(tag: &str) -> bool {
    let mut parts = tag.split('-');
    let primary_ok = parts
        .next()
        .is_some_and(|p| LANGUAGES.binary_search(&p).is_ok());
    primary_ok && parts.all(|p| (2..=8).contains(&p.len()) && p.chars().all(|c| c.is_ascii_alphanumeric()))
}

/// Object keys arrive URL-encoded with `+` for space.
pub fn decode_object_key(raw: &str) -> PipelineResult<String> {
    let spaced = raw.replace('+', " ");
    urlencoding::decode(&spaced)
        .map(|key| key.into_owned())
        .map_err(|e| PipelineError::InvalidInput(format!("undecodable object key `{raw}`: {e}")))
}

pub fn is_video(key: &str) -> bool {
    mime_guess::from_path(key)
        .first()
        .is_some_and(|m| m.type_() == mime::VIDEO)
}

impl PipelineService {
    pub async fn on_object_created(&self, bucket: &str, raw_key: &str) -> PipelineResult<Outcome> {
        let key = decode_object_key(raw_key)?;
        if !key.starts_with(VIDEO_PREFIX) {
            return Ok(Outcome::Ignored(format!("key `{key}` is outside {VIDEO_PREFIX}")));
        }
        if !is_video(&key) {
            return Ok(Outcome::Ignored(format!("key `{key}` is not a video")));
        }
        let Some(parsed) = VideoKey::parse(&key, &self.settings.default_source_language) else {
            return Ok(Outcome::Ignored(format!("key `{key}` has no title")));
        };

        let candidate = MediaAsset::new(&key, &parsed.title, &parsed.language);
        let (asset, created) = self.assets.create_if_absent(&candidate).await?;
        debug!(asset_id = %asset.id, bucket, created, "Storage notification received");

        match asset.state {
            AssetState::Uploaded => {
                info!(asset_id = %asset.id, title = %asset.title, lang = %asset.source_language, "New video");
                self.start_transcription(asset).await
            }
            // Claimed by an earlier delivery that may have died before the
            // job was started.
            AssetState::Transcribing => self.resume_transcription(asset).await,
            state => Ok(Outcome::Stale(format!("asset is already `{state}`"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_title_and_language() {
        assert_eq!(
            VideoKey::parse("video/Egg Fried Rice.en-GB.mp4", "en").unwrap(),
            VideoKey {
                title: "Egg Fried Rice".to_string(),
                language: "en-GB".to_string()
            }
        );
        assert_eq!(
            VideoKey::parse("video/Kimchi Stew.ko.mov", "en").unwrap().language,
            "ko"
        );
    }

    #[test]
    fn falls_back_to_default_language() {
        let key = VideoKey::parse("video/Mr. Bean.mp4", "en").unwrap();
        assert_eq!(key.title, "Mr. Bean");
        assert_eq!(key.language, "en");

        let key = VideoKey::parse("video/plain.mkv", "fr").unwrap();
        assert_eq!(key.title, "plain");
        assert_eq!(key.language, "fr");
    }

    #[test]
    fn title_words_are_not_languages() {
        let key = VideoKey::parse("video/Dr.Who.mp4", "en").unwrap();
        assert_eq!(key.title, "Dr.Who");
        assert_eq!(key.language, "en");

        assert_eq!(VideoKey::parse("video/Tea.EN.mp4", "fr").unwrap().title, "Tea.EN");
        assert_eq!(VideoKey::parse("video/Vol.xyz.mp4", "fr").unwrap().language, "fr");
        assert_eq!(VideoKey::parse("video/Dumplings.zh-Hant.mp4", "en").unwrap().language, "zh-Hant");
        assert_eq!(VideoKey::parse("video/Bibimbap.kor.mp4", "en").unwrap().language, "kor");
    }

    #[test]
    fn language_table_is_sorted() {
        assert!(LANGUAGES.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn rejects_keys_outside_video_or_without_title() {
        assert!(VideoKey::parse("image/cat.en.jpg", "en").is_none());
        assert!(VideoKey::parse("video/noext", "en").is_none());
        assert!(VideoKey::parse("video/.mp4", "en").is_none());
    }

    #[test]
    fn decodes_plus_and_percent() {
        assert_eq!(
            decode_object_key("video/Egg+Fried+Rice%2C+Quick.en-GB.mp4").unwrap(),
            "video/Egg Fried Rice, Quick.en-GB.mp4"
        );
    }

    #[test]
    fn video_detection_by_extension() {
        assert!(is_video("video/a.mp4"));
        assert!(is_video("video/a.mov"));
        assert!(!is_video("video/a.txt"));
        assert!(!is_video("video/a"));
    }
}
