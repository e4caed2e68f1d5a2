//! Embedded full-text index living on a volume shared by many processes.
//!
//! Directory layout under the index root:
//!
//! ```text
//! CURRENT                  commit pointer, names the live generation
//! gen-<n>-<token>/         a tantivy index; its meta.json swap is the commit
//! write.lock               writer lease
//! ```
//!
//! Writers serialize through the lease, then take the tantivy writer lock of
//! the generation `CURRENT` names and commit into it. A rebuild commits a
//! fresh generation directory and swaps `CURRENT` over to it. Readers never
//! take the lease; they open whatever `CURRENT` names.

mod document;
mod error;
mod generation;
mod lease;
mod reader;
mod schema;
mod tokenizer;
mod writer;

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use time::OffsetDateTime;
use uuid::Uuid;

pub use document::{IndexDocument, Passage};
pub use error::{IndexError, IndexResult};
pub use lease::{Lease, LeaseConfig};
pub use reader::{IndexReader, SearchHit, SearchQuery, SearchResults, Snapshot};
pub use writer::{IndexStatus, IndexWriter, IndexWriterConfig, WriteOutcome};

pub(crate) fn now_ms() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

/// Writes to a hidden temp file in the same directory, syncs, then renames
/// over `path`.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> IndexResult<()> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| IndexError::Unavailable(path.to_path_buf()))?;
    let staging = path.with_file_name(format!(".{file_name}.{}.tmp", Uuid::new_v4().simple()));

    {
        let mut file = File::create(&staging)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }

    if let Err(e) = fs::rename(&staging, path) {
        let _ = fs::remove_file(&staging);
        return Err(e.into());
    }

    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }

    Ok(())
}
