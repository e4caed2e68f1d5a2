use std::fmt::Write;

use crate::index::Passage;

#[derive(Debug, thiserror::Error)]
pub enum SubtitleError {
    #[error("Invalid transcript: {0}")]
    InvalidTranscript(#[from] serde_json::Error),
    #[error("Invalid WebVTT at line {line}: {reason}")]
    InvalidVtt { line: usize, reason: String },
}

/// One timed line of text.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Cue {
    pub start_ms: u64,
    pub end_ms: u64,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Subtitle {
    pub cues: Vec<Cue>,
}

impl Subtitle {
    pub fn new(cues: Vec<Cue>) -> Self {
        Self { cues }
    }

    pub fn is_empty(&self) -> bool {
        self.cues.is_empty()
    }

    pub fn texts(&self) -> Vec<String> {
        self.cues.iter().map(|c| c.text.clone()).collect()
    }

    /// Same timing, new text. `texts` must have one entry per cue. Each text
    /// is trimmed line by line and blank lines are dropped, since a blank line
    /// ends a cue in both output formats.
    pub fn with_texts(&self, texts: Vec<String>) -> Option<Subtitle> {
        if texts.len() != self.cues.len() {
            return None;
        }
        let cues = self
            .cues
            .iter()
            .zip(texts)
            .map(|(cue, text)| Cue {
                start_ms: cue.start_ms,
                end_ms: cue.end_ms,
                text: normalize_text(&text),
            })
            .collect();
        Some(Subtitle { cues })
    }

    pub fn to_vtt(&self) -> String {
        let mut out = String::from("WEBVTT\n\n");
        for cue in &self.cues {
            let _ = writeln!(
                out,
                "{} --> {}",
                format_timestamp(cue.start_ms, '.'),
                format_timestamp(cue.end_ms, '.')
            );
            out.push_str(&cue.text);
            out.push_str("\n\n");
        }
        out
    }

    pub fn to_srt(&self) -> String {
        let mut out = String::new();
        for (i, cue) in self.cues.iter().enumerate() {
            let _ = writeln!(out, "{}", i + 1);
            let _ = writeln!(
                out,
                "{} --> {}",
                format_timestamp(cue.start_ms, ','),
                format_timestamp(cue.end_ms, ',')
            );
            out.push_str(&cue.text);
            out.push_str("\n\n");
        }
        out
    }

    /// Reads cues back from a WebVTT document. Cue identifiers, settings and
    /// NOTE/STYLE blocks are skipped.
    pub fn parse_vtt(input: &str) -> Result<Subtitle, SubtitleError> {
        let input = input.trim_start_matches('\u{feff}');
        let mut lines = input.lines().enumerate().peekable();

        match lines.next() {
            Some((_, header)) if header.starts_with("WEBVTT") => {}
            _ => {
                return Err(SubtitleError::InvalidVtt {
                    line: 1,
                    reason: "missing WEBVTT header".to_string(),
                });
            }
        }

        let mut cues = Vec::new();
        while let Some((number, line)) = lines.next() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if line.starts_with("NOTE") || line == "STYLE" || line == "REGION" {
                skip_block(&mut lines);
                continue;
            }

            let timing = if line.contains("-->") {
                line
            } else {
                // Cue identifier; the timing line follows.
                match lines.next() {
                    Some((_, next)) if next.contains("-->") => next.trim(),
                    _ => {
                        return Err(SubtitleError::InvalidVtt {
                            line: number + 1,
                            reason: "cue without timing".to_string(),
                        });
                    }
                }
            };

            let (start_ms, end_ms) = parse_timing(timing).ok_or_else(|| SubtitleError::InvalidVtt {
                line: number + 1,
                reason: format!("bad timing line `{timing}`"),
            })?;

            let mut text = Vec::new();
            while let Some((_, body)) = lines.peek() {
                if body.trim().is_empty() {
                    break;
                }
                text.push(body.trim().to_string());
                lines.next();
            }

            cues.push(Cue {
                start_ms,
                end_ms,
                text: text.join("\n"),
            });
        }

        Ok(Subtitle { cues })
    }

    /// Searchable passages, one per non-empty cue.
    pub fn passages(&self) -> Vec<Passage> {
        self.cues
            .iter()
            .filter(|cue| !cue.text.trim().is_empty())
            .map(|cue| Passage {
                start_ms: cue.start_ms,
                text: cue.text.clone(),
            })
            .collect()
    }
}

fn normalize_text(text: &str) -> String {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn skip_block<'a, I>(lines: &mut std::iter::Peekable<I>)
where
    I: Iterator<Item = (usize, &'a str)>,
{
    while let Some((_, line)) = lines.peek() {
        if line.trim().is_empty() {
            break;
        }
        lines.next();
    }
}

fn parse_timing(line: &str) -> Option<(u64, u64)> {
    let (start, rest) = line.split_once("-->")?;
    let end = rest.split_whitespace().next()?;
    Some((parse_timestamp(start.trim())?, parse_timestamp(end)?))
}

/// `HH:MM:SS.mmm`, `MM:SS.mmm`, or the SRT `,` separator.
pub fn parse_timestamp(value: &str) -> Option<u64> {
    let value = value.replace(',', ".");
    let (clock, millis) = value.split_once('.')?;
    if millis.len() != 3 {
        return None;
    }
    let millis: u64 = millis.parse().ok()?;

    let parts: Vec<&str> = clock.split(':').collect();
    let (h, m, s) = match parts.as_slice() {
        [h, m, s] => (h.parse::<u64>().ok()?, m.parse::<u64>().ok()?, s.parse::<u64>().ok()?),
        [m, s] => (0, m.parse::<u64>().ok()?, s.parse::<u64>().ok()?),
        _ => return None,
    };
    if m >= 60 || s >= 60 {
        return None;
    }
    Some(((h * 60 + m) * 60 + s) * 1000 + millis)
}

pub fn format_timestamp(ms: u64, separator: char) -> String {
    let h = ms / 3_600_000;
    let m = (ms / 60_000) % 60;
    let s = (ms / 1000) % 60;
    format!("{h:02}:{m:02}:{s:02}{separator}{:03}", ms % 1000)
}
