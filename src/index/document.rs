use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One timed piece of subtitle text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Passage {
    pub start_ms: u64,
    pub text: String,
}

/// The logical document for one asset, spanning every language track.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDocument {
    pub asset_id: String,
    /// Monotonic content version (result generation time in unix millis).
    pub version: i64,
    pub languages: BTreeMap<String, Vec<Passage>>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl IndexDocument {
    pub fn new(asset_id: impl Into<String>, version: i64) -> Self {
        Self {
            asset_id: asset_id.into(),
            version,
            languages: BTreeMap::new(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_language(mut self, lang: impl Into<String>, passages: Vec<Passage>) -> Self {
        self.languages.insert(lang.into(), passages);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}
