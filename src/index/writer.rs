use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use tantivy::collector::{Count, TopDocs};
use tantivy::directory::error::LockError;
use tantivy::directory::{Directory, DirectoryLock, MmapDirectory, INDEX_WRITER_LOCK};
use tantivy::indexer::NoMergePolicy;
use tantivy::schema::TantivyDocument;
use tantivy::{Index, ReloadPolicy, TantivyError};
use tracing::{debug, info, warn};

use super::document::IndexDocument;
use super::error::{IndexError, IndexResult};
use super::generation::{
    committed_generation, create_index, directory_name, open_index, parse_generation,
    publish_pointer, raw_pointer, read_pointer, CommitPayload,
};
use super::lease::{Lease, LeaseConfig};
use super::now_ms;
use super::schema::{Fields, Head, KIND_HEAD};

const WRITER_MEMORY: usize = 50_000_000;
/// Pointer moves tolerated while waiting for a generation's writer lock.
const OPEN_ATTEMPTS: usize = 3;

#[derive(Debug, Clone)]
pub struct IndexWriterConfig {
    pub holder: String,
    pub lease: LeaseConfig,
    /// Segment count above which a commit merges everything into one segment.
    pub max_segments: usize,
    /// Minimum age before retired generations and temp files are deleted.
    pub gc_grace: Duration,
}

impl IndexWriterConfig {
    pub fn for_holder(holder: impl Into<String>) -> Self {
        Self {
            holder: holder.into(),
            lease: LeaseConfig::default(),
            max_segments: 8,
            gc_grace: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Committed { generation: u64 },
    /// The committed view already holds exactly this content.
    Unchanged,
    /// A newer version of the asset is already committed.
    Superseded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexStatus {
    Missing,
    Ready { generation: u64, documents: usize },
}

enum Change {
    Upsert(IndexDocument),
    Delete { asset_id: String, version: i64 },
}

impl Change {
    fn asset_id(&self) -> &str {
        match self {
            Change::Upsert(doc) => &doc.asset_id,
            Change::Delete { asset_id, .. } => asset_id,
        }
    }

    fn version(&self) -> i64 {
        match self {
            Change::Upsert(doc) => doc.version,
            Change::Delete { version, .. } => *version,
        }
    }
}

/// One open write. Holds the index lease and the tantivy writer lock of the
/// generation being written; for a fresh generation it also holds the writer
/// lock of the generation it replaces. Nothing else can commit to either
/// generation or move the pointer off the old one while a session is alive.
/// Fields drop in order, so the tantivy locks go before the lease.
struct Session {
    tantivy: tantivy::IndexWriter<TantivyDocument>,
    replaced_lock: Option<DirectoryLock>,
    index: Index,
    fields: Fields,
    root: PathBuf,
    name: String,
    /// Pointer seen when the session opened.
    expected: Option<String>,
    /// Whether `name` is a new directory the pointer has to be swapped to.
    fresh: bool,
    base_generation: u64,
    lease: Lease,
}

impl Session {
    fn head(&self, asset_id: &str) -> IndexResult<Option<Head>> {
        let reader = self
            .index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()?;
        let searcher = reader.searcher();
        let found = searcher.search(&self.fields.head_query(asset_id), &TopDocs::with_limit(1))?;
        match found.first() {
            Some((_, address)) => {
                let doc: TantivyDocument = searcher.doc(*address)?;
                Ok(Some(self.fields.read_head(&doc)?))
            }
            None => Ok(None),
        }
    }

    fn stage(&mut self, change: &Change) -> IndexResult<()> {
        self.tantivy.delete_term(self.fields.asset_term(change.asset_id()));
        match change {
            Change::Upsert(doc) => {
                for entry in self.fields.documents_for(doc)? {
                    self.tantivy.add_document(entry)?;
                }
            }
            Change::Delete { asset_id, version } => {
                self.tantivy.add_document(self.fields.tombstone(asset_id, *version))?;
            }
        }
        Ok(())
    }

    /// Commits the staged changes and, for a fresh generation, swaps the
    /// pointer to it. The lease is handed back so the caller can clean up
    /// before releasing it.
    fn commit(self, max_segments: usize) -> IndexResult<(u64, Lease)> {
        let Session {
            mut tantivy,
            replaced_lock,
            index,
            root,
            name,
            expected,
            fresh,
            base_generation,
            mut lease,
            ..
        } = self;
        let generation = base_generation + 1;

        lease.renew()?;
        let mut prepared = tantivy.prepare_commit()?;
        prepared.set_payload(&serde_json::to_string(&CommitPayload {
            generation,
            holder: lease.holder().to_string(),
            committed_at_ms: now_ms(),
        })?);
        prepared.commit()?;

        let segments = index.searchable_segment_ids()?;
        if segments.len() > max_segments {
            tantivy.merge(&segments).wait()?;
            info!(from = segments.len(), generation, "Merged index segments");
        }
        tantivy.wait_merging_threads()?;

        if fresh {
            publish_pointer(&root, expected.as_deref(), &name)?;
        }
        drop(replaced_lock);

        debug!(generation, directory = %name, "Index commit published");
        Ok((generation, lease))
    }
}

pub struct IndexWriter {
    root: PathBuf,
    config: IndexWriterConfig,
}

impl IndexWriter {
    pub fn open(root: impl Into<PathBuf>, config: IndexWriterConfig) -> IndexResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| {
            warn!("Cannot prepare index directory {}: {}", root.display(), e);
            IndexError::Unavailable(root.clone())
        })?;
        Ok(Self { root, config })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Opens the committed view end to end. Corruption surfaces as an error.
    pub fn status(&self) -> IndexResult<IndexStatus> {
        let Some(name) = read_pointer(&self.root)? else {
            return Ok(IndexStatus::Missing);
        };
        let index = open_index(&self.root, &name)?;
        let generation = committed_generation(&index)?;
        let fields = Fields::resolve(&index.schema())?;
        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()
            .map_err(|e| IndexError::corrupt(format!("generation {name}: {e}")))?;
        let documents = reader
            .searcher()
            .search(&fields.kind_query(KIND_HEAD), &Count)
            .map_err(|e| IndexError::corrupt(format!("generation {name}: {e}")))?;
        Ok(IndexStatus::Ready { generation, documents })
    }

    /// Replaces the asset's document. Re-upserting identical content leaves
    /// the index untouched; an older version than the committed one is ignored.
    pub fn upsert(&self, doc: IndexDocument) -> IndexResult<WriteOutcome> {
        self.write(Change::Upsert(doc))
    }

    /// Removes the asset and leaves a tombstone at `version`, so later
    /// writes carrying an older version are ignored.
    pub fn delete(&self, asset_id: &str, version: i64) -> IndexResult<WriteOutcome> {
        self.write(Change::Delete {
            asset_id: asset_id.to_string(),
            version,
        })
    }

    fn write(&self, change: Change) -> IndexResult<WriteOutcome> {
        let mut session = self.begin()?;

        if let Some(head) = session.head(change.asset_id())? {
            if head.version > change.version() {
                debug!(
                    asset_id = %change.asset_id(),
                    committed = head.version,
                    incoming = change.version(),
                    "Skipping superseded index write"
                );
                return Ok(WriteOutcome::Superseded);
            }
            let unchanged = match &change {
                Change::Upsert(doc) => head.document.as_ref() == Some(doc),
                Change::Delete { version, .. } => head.document.is_none() && head.version == *version,
            };
            if unchanged {
                return Ok(WriteOutcome::Unchanged);
            }
        }

        session.stage(&change)?;
        let (generation, lease) = session.commit(self.config.max_segments)?;
        self.collect_garbage();
        lease.release()?;

        Ok(WriteOutcome::Committed { generation })
    }

    /// Takes the lease, then the writer lock of the generation `CURRENT`
    /// names. The pointer is re-read once the lock is held: a rebuild that
    /// swapped it while we waited sends us to the new generation.
    fn begin(&self) -> IndexResult<Session> {
        let lease = Lease::acquire(&self.root, &self.config.holder, &self.config.lease)?;
        let started = Instant::now();

        let mut attempt = 0;
        loop {
            attempt += 1;
            let expected = read_pointer(&self.root)?;
            let (name, index, base_generation) = match &expected {
                Some(name) => {
                    let index = open_index(&self.root, name)?;
                    let generation = committed_generation(&index)?;
                    (name.clone(), index, generation)
                }
                None => {
                    let name = directory_name(1);
                    let index = create_index(&self.root, &name)?;
                    (name, index, 0)
                }
            };
            let tantivy = self.lock_writer(&index, started)?;

            let found = raw_pointer(&self.root)?;
            if found == expected {
                return Ok(Session {
                    tantivy,
                    replaced_lock: None,
                    fields: Fields::resolve(&index.schema())?,
                    index,
                    root: self.root.clone(),
                    fresh: expected.is_none(),
                    name,
                    expected,
                    base_generation,
                    lease,
                });
            }

            drop(tantivy);
            if attempt >= OPEN_ATTEMPTS {
                return Err(IndexError::Conflict { expected, found });
            }
            debug!(?expected, ?found, "Index pointer moved while opening, retrying");
        }
    }

    /// Commits a fresh generation holding exactly `docs` and points `CURRENT`
    /// at it. Works on a corrupt index, since the previous view is never read.
    pub fn replace_all(&self, docs: Vec<IndexDocument>) -> IndexResult<u64> {
        let lease = Lease::acquire(&self.root, &self.config.holder, &self.config.lease)?;
        let started = Instant::now();

        let expected = raw_pointer(&self.root)?;
        let replaced_lock = match &expected {
            Some(old) if self.root.join(old).is_dir() => {
                Some(self.lock_directory(&self.root.join(old), started)?)
            }
            _ => None,
        };
        let base_generation = self.previous_generation(expected.as_deref());

        let name = directory_name(base_generation + 1);
        let index = create_index(&self.root, &name)?;
        let tantivy = self.lock_writer(&index, started)?;
        let mut session = Session {
            tantivy,
            replaced_lock,
            fields: Fields::resolve(&index.schema())?,
            index,
            root: self.root.clone(),
            name,
            expected,
            fresh: true,
            base_generation,
            lease,
        };

        let documents = docs.len();
        for doc in docs {
            session.stage(&Change::Upsert(doc))?;
        }
        let (generation, lease) = session.commit(self.config.max_segments)?;
        info!(generation, documents, "Index replaced");

        self.collect_garbage();
        lease.release()?;
        Ok(generation)
    }

    fn lock_writer(
        &self,
        index: &Index,
        started: Instant,
    ) -> IndexResult<tantivy::IndexWriter<TantivyDocument>> {
        loop {
            match index.writer_with_num_threads::<TantivyDocument>(1, WRITER_MEMORY) {
                Ok(writer) => {
                    writer.set_merge_policy(Box::new(NoMergePolicy));
                    return Ok(writer);
                }
                Err(TantivyError::LockFailure(LockError::LockBusy, _)) => self.wait_for_lock(started)?,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Takes a generation's writer lock without opening the index in it.
    fn lock_directory(&self, path: &Path, started: Instant) -> IndexResult<DirectoryLock> {
        let directory = MmapDirectory::open(path).map_err(TantivyError::from)?;
        loop {
            match directory.acquire_lock(&INDEX_WRITER_LOCK) {
                Ok(lock) => return Ok(lock),
                Err(LockError::LockBusy) => self.wait_for_lock(started)?,
                Err(e) => return Err(TantivyError::LockFailure(e, None).into()),
            }
        }
    }

    fn wait_for_lock(&self, started: Instant) -> IndexResult<()> {
        let timeout = self.config.lease.acquire_timeout;
        if started.elapsed() >= timeout {
            return Err(IndexError::LockTimeout(timeout));
        }
        thread::sleep(self.config.lease.poll_interval);
        Ok(())
    }

    fn previous_generation(&self, pointer: Option<&str>) -> u64 {
        let Some(name) = pointer else {
            return 0;
        };
        match open_index(&self.root, name).and_then(|index| committed_generation(&index)) {
            Ok(generation) => generation,
            Err(e) => {
                warn!("Replaced generation unreadable, numbering from directory names: {}", e);
                self.highest_directory_generation()
            }
        }
    }

    fn highest_directory_generation(&self) -> u64 {
        fs::read_dir(&self.root)
            .into_iter()
            .flatten()
            .flatten()
            .filter_map(|entry| entry.file_name().to_str().and_then(parse_generation))
            .max()
            .unwrap_or(0)
    }

    fn collect_garbage(&self) {
        if let Err(e) = self.try_collect_garbage() {
            warn!("Index garbage collection failed: {}", e);
        }
    }

    /// Deletes generation directories `CURRENT` no longer names, plus staging
    /// leftovers, once they are older than the grace period.
    fn try_collect_garbage(&self) -> IndexResult<()> {
        let live = raw_pointer(&self.root)?;
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let retired = parse_generation(name).is_some() && live.as_deref() != Some(name);
            let staging = name.starts_with('.') && (name.ends_with(".tmp") || name.ends_with(".broken"));
            if !(retired || staging) || !self.past_grace(&path) {
                continue;
            }

            let removed = if retired {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            match removed {
                Ok(()) => debug!(entry = name, "Removed retired index entry"),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => debug!("Could not remove {}: {}", path.display(), e),
            }
        }
        Ok(())
    }

    fn past_grace(&self, path: &Path) -> bool {
        fs::metadata(path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| SystemTime::now().duration_since(modified).ok())
            .is_some_and(|age| age >= self.config.gc_grace)
    }
}
