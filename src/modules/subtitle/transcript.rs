//! Managed speech-to-text output into timed cues.

use serde::Deserialize;

use super::model::{Cue, Subtitle, SubtitleError};

#[derive(Debug, Deserialize)]
struct TranscriptOutput {
    results: TranscriptResults,
}

#[derive(Debug, Deserialize)]
struct TranscriptResults {
    #[serde(default)]
    items: Vec<TranscriptItem>,
}

#[derive(Debug, Deserialize)]
struct TranscriptItem {
    #[serde(rename = "type")]
    kind: ItemKind,
    alternatives: Vec<Alternative>,
    #[serde(default)]
    start_time: Option<String>,
    #[serde(default)]
    end_time: Option<String>,
}

#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum ItemKind {
    Pronunciation,
    Punctuation,
}

#[derive(Debug, Deserialize)]
struct Alternative {
    content: String,
}

fn seconds_to_ms(value: Option<&str>) -> Option<u64> {
    let seconds: f64 = value?.trim().parse().ok()?;
    if seconds.is_finite() && seconds >= 0.0 {
        Some((seconds * 1000.0).round() as u64)
    } else {
        None
    }
}

fn closes_sentence(mark: &str) -> bool {
    matches!(mark, "." | "?" | "!")
}

impl Subtitle {
    /// Groups words into cues. A cue starts at its first word and ends at its
    /// last; `.`, `?` and `!` close the cue they follow.
    pub fn from_transcript(json: &[u8]) -> Result<Subtitle, SubtitleError> {
        let output: TranscriptOutput = serde_json::from_slice(json)?;
        let mut cues = Vec::new();
        let mut current: Option<Cue> = None;

        for item in output.results.items {
            let Some(content) = item.alternatives.into_iter().next().map(|a| a.content) else {
                continue;
            };

            match item.kind {
                ItemKind::Pronunciation => {
                    let start = seconds_to_ms(item.start_time.as_deref());
                    let end = seconds_to_ms(item.end_time.as_deref());
                    match current.as_mut() {
                        Some(cue) => {
                            cue.text.push(' ');
                            cue.text.push_str(&content);
                            if let Some(end) = end {
                                cue.end_ms = end.max(cue.start_ms);
                            }
                        }
                        None => {
                            let start_ms = start.unwrap_or(0);
                            current = Some(Cue {
                                start_ms,
                                end_ms: end.unwrap_or(start_ms).max(start_ms),
                                text: content,
                            });
                        }
                    }
                }
                ItemKind::Punctuation => {
                    let Some(cue) = current.as_mut() else {
                        continue;
                    };
                    cue.text.push_str(&content);
                    if closes_sentence(&content) {
                        cues.extend(current.take());
                    }
                }
            }
        }

        cues.extend(current);
        Ok(Subtitle { cues })
    }
}
