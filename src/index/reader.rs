use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tantivy::collector::{Count, TopDocs};
use tantivy::query::{BooleanQuery, ConstScoreQuery, Occur, Query, QueryParser, RangeQuery};
use tantivy::schema::TantivyDocument;
use tantivy::{DocAddress, Index, ReloadPolicy, Searcher, Term};
use tracing::debug;

use super::document::IndexDocument;
use super::error::{IndexError, IndexResult};
use super::generation::{committed_generation, open_index, read_pointer};
use super::schema::{Fields, Head, KIND_CUE, KIND_HEAD};

/// Matching cues ranked per query before they are grouped by asset.
const MAX_CUES: usize = 2_000;
const LOAD_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Default)]
pub struct SearchQuery {
    pub text: String,
    pub language: Option<String>,
    pub asset_id: Option<String>,
    pub from_ms: Option<u64>,
    pub to_ms: Option<u64>,
    pub limit: usize,
    pub offset: usize,
}

impl SearchQuery {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            limit: 10,
            ..Default::default()
        }
    }

    pub fn language(mut self, lang: impl Into<String>) -> Self {
        self.language = Some(lang.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub asset_id: String,
    pub language: String,
    pub score: f32,
    pub snippet: String,
    pub start_ms: u64,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SearchResults {
    pub generation: u64,
    pub total: usize,
    pub hits: Vec<SearchHit>,
}

struct View {
    index: Index,
    searcher: Searcher,
    fields: Fields,
}

impl View {
    fn head(&self, address: DocAddress) -> IndexResult<Head> {
        let doc: TantivyDocument = self.searcher.doc(address)?;
        self.fields.read_head(&doc)
    }
}

/// Immutable view of one committed generation.
pub struct Snapshot {
    generation: u64,
    documents: usize,
    view: Option<View>,
}

impl Snapshot {
    fn empty() -> Snapshot {
        Snapshot {
            generation: 0,
            documents: 0,
            view: None,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.documents
    }

    pub fn is_empty(&self) -> bool {
        self.documents == 0
    }

    pub fn segment_count(&self) -> usize {
        self.view
            .as_ref()
            .map_or(0, |view| view.searcher.segment_readers().len())
    }

    pub fn document(&self, asset_id: &str) -> IndexResult<Option<IndexDocument>> {
        let Some(view) = &self.view else {
            return Ok(None);
        };
        let found = view
            .searcher
            .search(&view.fields.head_query(asset_id), &TopDocs::with_limit(1))?;
        match found.first() {
            Some((_, address)) => Ok(view.head(*address)?.document),
            None => Ok(None),
        }
    }

    /// Live documents ordered by asset id.
    pub fn documents(&self) -> IndexResult<Vec<IndexDocument>> {
        let Some(view) = &self.view else {
            return Ok(Vec::new());
        };
        if self.documents == 0 {
            return Ok(Vec::new());
        }
        let found = view.searcher.search(
            &view.fields.kind_query(KIND_HEAD),
            &TopDocs::with_limit(self.documents),
        )?;
        let mut docs = Vec::with_capacity(found.len());
        for (_, address) in found {
            if let Some(doc) = view.head(address)?.document {
                docs.push(doc);
            }
        }
        docs.sort_by(|a, b| a.asset_id.cmp(&b.asset_id));
        Ok(docs)
    }

    /// Ranks cues with BM25, keeps the best cue per asset as its hit and
    /// pages over assets. Query text goes through tantivy's query parser, so
    /// quoted phrases, `+`/`-` and `AND`/`OR` work; syntax errors degrade to
    /// the terms that did parse.
    pub fn search(&self, query: &SearchQuery) -> IndexResult<SearchResults> {
        let mut results = SearchResults {
            generation: self.generation,
            ..Default::default()
        };
        let Some(view) = &self.view else {
            return Ok(results);
        };
        if query.limit == 0 || !query.text.chars().any(char::is_alphanumeric) {
            return Ok(results);
        }

        let fields = &view.fields;
        let parser = QueryParser::for_index(&view.index, fields.text_fields(query.language.as_deref()));
        let (text_query, errors) = parser.parse_query_lenient(&query.text);
        if !errors.is_empty() {
            debug!(query = %query.text, errors = errors.len(), "Query parsed leniently");
        }

        let mut clauses: Vec<(Occur, Box<dyn Query>)> = vec![
            (Occur::Must, text_query),
            (Occur::Must, fields.filter(fields.kind, KIND_CUE)),
        ];
        if let Some(lang) = &query.language {
            clauses.push((Occur::Must, fields.filter(fields.lang, lang)));
        }
        if let Some(asset_id) = &query.asset_id {
            clauses.push((Occur::Must, fields.filter(fields.asset_id, asset_id)));
        }
        if query.from_ms.is_some() || query.to_ms.is_some() {
            let bound = |ms: Option<u64>| match ms {
                Some(ms) => Bound::Included(Term::from_field_u64(fields.start_ms, ms)),
                None => Bound::Unbounded,
            };
            let range = RangeQuery::new(bound(query.from_ms), bound(query.to_ms));
            clauses.push((Occur::Must, Box::new(ConstScoreQuery::new(Box::new(range), 0.0))));
        }

        let (cues, matched) = view
            .searcher
            .search(&BooleanQuery::new(clauses), &(TopDocs::with_limit(MAX_CUES), Count))?;
        if matched > cues.len() {
            debug!(matched, ranked = cues.len(), "Cue matches truncated");
        }

        // Cues arrive best first, so the first cue seen per asset is its hit.
        let mut best: HashMap<String, SearchHit> = HashMap::new();
        for (score, address) in cues {
            let doc: TantivyDocument = view.searcher.doc(address)?;
            let Some(asset_id) = fields.text(&doc, fields.asset_id) else {
                continue;
            };
            if best.contains_key(&asset_id) {
                continue;
            }
            best.insert(
                asset_id.clone(),
                SearchHit {
                    asset_id,
                    language: fields.text(&doc, fields.lang).unwrap_or_default(),
                    score,
                    snippet: fields.cue_text(&doc),
                    start_ms: fields.cue_start(&doc),
                    metadata: BTreeMap::new(),
                },
            );
        }

        let mut hits: Vec<SearchHit> = best.into_values().collect();
        hits.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.asset_id.cmp(&b.asset_id))
        });

        results.total = hits.len();
        results.hits = hits.into_iter().skip(query.offset).take(query.limit).collect();
        for hit in &mut results.hits {
            if let Some(doc) = self.document(&hit.asset_id)? {
                hit.metadata = doc.metadata;
            }
        }
        Ok(results)
    }
}

/// A generation opened by the reader, reloaded in place while `CURRENT`
/// keeps naming it.
struct Opened {
    name: String,
    index: Index,
    reader: tantivy::IndexReader,
    fields: Fields,
}

impl Opened {
    fn open(root: &Path, name: &str) -> IndexResult<Opened> {
        let index = open_index(root, name)?;
        let fields = Fields::resolve(&index.schema())?;
        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()
            .map_err(|e| IndexError::corrupt(format!("generation {name}: {e}")))?;
        Ok(Opened {
            name: name.to_string(),
            index,
            reader,
            fields,
        })
    }
}

struct ReaderState {
    opened: Option<Opened>,
    snapshot: Arc<Snapshot>,
    checked_at: Option<Instant>,
}

/// Read side of the index. Re-checks the commit pointer at most once per
/// refresh interval, which bounds staleness without touching the lease.
pub struct IndexReader {
    root: PathBuf,
    refresh_interval: Duration,
    state: Mutex<ReaderState>,
}

impl IndexReader {
    pub fn open(root: impl Into<PathBuf>, refresh_interval: Duration) -> Self {
        Self {
            root: root.into(),
            refresh_interval,
            state: Mutex::new(ReaderState {
                opened: None,
                snapshot: Arc::new(Snapshot::empty()),
                checked_at: None,
            }),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn snapshot(&self) -> IndexResult<Arc<Snapshot>> {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let fresh = state
            .checked_at
            .is_some_and(|at| at.elapsed() < self.refresh_interval);
        if fresh {
            return Ok(state.snapshot.clone());
        }

        let snapshot = self.refresh(&mut state)?;
        if snapshot.generation != state.snapshot.generation {
            debug!(generation = snapshot.generation, documents = snapshot.len(), "Index snapshot reloaded");
        }
        state.snapshot = snapshot.clone();
        state.checked_at = Some(Instant::now());
        Ok(snapshot)
    }

    /// Loads whatever `CURRENT` names. A generation retired and collected
    /// while it was being opened triggers a re-read of the pointer.
    fn refresh(&self, state: &mut ReaderState) -> IndexResult<Arc<Snapshot>> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let Some(name) = read_pointer(&self.root)? else {
                state.opened = None;
                return Ok(Arc::new(Snapshot::empty()));
            };

            match Self::load(&self.root, state, &name) {
                Ok(snapshot) => return Ok(Arc::new(snapshot)),
                Err(e) => {
                    let moved = read_pointer(&self.root)?.as_deref() != Some(name.as_str());
                    if !moved || attempt >= LOAD_ATTEMPTS {
                        return Err(match e {
                            IndexError::Tantivy(e) => IndexError::corrupt(format!("generation {name}: {e}")),
                            e => e,
                        });
                    }
                    debug!(generation_dir = %name, "Index moved on while loading, retrying");
                }
            }
        }
    }

    fn load(root: &Path, state: &mut ReaderState, name: &str) -> IndexResult<Snapshot> {
        let opened = match state.opened.take() {
            Some(opened) if opened.name == name => opened,
            _ => Opened::open(root, name)?,
        };
        let generation = committed_generation(&opened.index)?;
        opened.reader.reload()?;
        let searcher = opened.reader.searcher();
        let documents = searcher.search(&opened.fields.kind_query(KIND_HEAD), &Count)?;

        let snapshot = Snapshot {
            generation,
            documents,
            view: Some(View {
                index: opened.index.clone(),
                searcher,
                fields: opened.fields,
            }),
        };
        state.opened = Some(opened);
        Ok(snapshot)
    }

    pub fn search(&self, query: &SearchQuery) -> IndexResult<SearchResults> {
        self.snapshot()?.search(query)
    }
}
