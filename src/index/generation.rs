use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tantivy::Index;
use uuid::Uuid;

use super::error::{IndexError, IndexResult};
use super::schema::build_schema;
use super::tokenizer;
use super::write_atomic;

/// Commit pointer file. Holds the directory name of the live generation.
pub(crate) const CURRENT_FILE: &str = "CURRENT";

const GENERATION_PREFIX: &str = "gen-";

/// Stored as the tantivy commit payload of every commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct CommitPayload {
    pub generation: u64,
    pub holder: String,
    pub committed_at_ms: i64,
}

/// Fresh, never reused directory name for an index first committed at
/// `generation`.
pub(crate) fn directory_name(generation: u64) -> String {
    format!("{GENERATION_PREFIX}{generation:020}-{}", Uuid::new_v4().simple())
}

pub(crate) fn parse_generation(name: &str) -> Option<u64> {
    let (number, token) = name.strip_prefix(GENERATION_PREFIX)?.split_once('-')?;
    if token.is_empty() {
        return None;
    }
    number.parse().ok()
}

/// Pointer contents without validation, for fencing.
pub(crate) fn raw_pointer(root: &Path) -> IndexResult<Option<String>> {
    match fs::read_to_string(root.join(CURRENT_FILE)) {
        Ok(content) => Ok(Some(content.trim().to_string())),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Reads the commit pointer. `Ok(None)` means nothing was ever committed.
pub(crate) fn read_pointer(root: &Path) -> IndexResult<Option<String>> {
    match raw_pointer(root)? {
        Some(name) if parse_generation(&name).is_none() => {
            Err(IndexError::corrupt(format!("commit pointer holds {name:?}")))
        }
        pointer => Ok(pointer),
    }
}

/// Swaps the pointer from `expected` to `name`. Callers hold the writer lock
/// of the `expected` generation, which every other swap from it needs too.
/// The first pointer is created exclusively, so two writers racing on an
/// empty root cannot both win.
pub(crate) fn publish_pointer(root: &Path, expected: Option<&str>, name: &str) -> IndexResult<()> {
    let path = root.join(CURRENT_FILE);
    let conflict = |found: Option<String>| IndexError::Conflict {
        expected: expected.map(str::to_string),
        found,
    };

    match expected {
        None => {
            let staging = root.join(format!(".{CURRENT_FILE}.{}.tmp", Uuid::new_v4().simple()));
            {
                let mut file = File::create(&staging)?;
                file.write_all(name.as_bytes())?;
                file.sync_all()?;
            }
            let linked = fs::hard_link(&staging, &path);
            let _ = fs::remove_file(&staging);
            match linked {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(conflict(raw_pointer(root)?)),
                Err(e) => Err(e.into()),
            }
        }
        Some(old) => {
            let found = raw_pointer(root)?;
            if found.as_deref() != Some(old) {
                return Err(conflict(found));
            }
            write_atomic(&path, name.as_bytes())
        }
    }
}

pub(crate) fn open_index(root: &Path, name: &str) -> IndexResult<Index> {
    let index = Index::open_in_dir(root.join(name))
        .map_err(|e| IndexError::corrupt(format!("generation {name}: {e}")))?;
    tokenizer::register(&index)?;
    Ok(index)
}

pub(crate) fn create_index(root: &Path, name: &str) -> IndexResult<Index> {
    let path = root.join(name);
    fs::create_dir(&path)?;
    let index = Index::create_in_dir(&path, build_schema())?;
    tokenizer::register(&index)?;
    Ok(index)
}

/// Generation of the last commit in `index`, 0 before the first commit.
pub(crate) fn committed_generation(index: &Index) -> IndexResult<u64> {
    let metas = index.load_metas()?;
    match metas.payload {
        Some(payload) => serde_json::from_str::<CommitPayload>(&payload)
            .map(|p| p.generation)
            .map_err(|e| IndexError::corrupt(format!("commit payload: {e}"))),
        None => Ok(0),
    }
}
