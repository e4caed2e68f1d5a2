use url::Url;

/// Builds public URLs for objects served through the content-delivery front.
#[derive(Clone, Debug)]
pub struct PlaybackLinks {
    base: Url,
}

impl PlaybackLinks {
    pub fn new(base: &str) -> Result<Self, url::ParseError> {
        // Url::join drops the last path segment unless the base ends in '/'.
        let base = if base.ends_with('/') {
            Url::parse(base)?
        } else {
            Url::parse(&format!("{base}/"))?
        };
        Ok(Self { base })
    }

    pub fn object_url(&self, key: &str) -> Option<String> {
        let encoded: Vec<String> = key
            .split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect();
        self.base.join(&encoded.join("/")).ok().map(String::from)
    }

    /// Object URL with a media fragment that starts playback at `start_ms`.
    pub fn playback_url(&self, key: &str, start_ms: u64) -> Option<String> {
        let url = self.object_url(key)?;
        Some(format!("{url}#t={}.{:03}", start_ms / 1000, start_ms % 1000))
    }
}
