use tantivy::query::{ConstScoreQuery, Query, TermQuery};
use tantivy::schema::{
    Field, IndexRecordOption, Schema, TantivyDocument, TextFieldIndexing, TextOptions, Value, FAST,
    INDEXED, STORED, STRING, TEXT,
};
use tantivy::Term;

use super::document::IndexDocument;
use super::error::{IndexError, IndexResult};
use super::tokenizer::KOREAN_ANALYZER;

/// Every asset is stored as one `head` document carrying its source record,
/// plus one `cue` document per passage. A deleted asset keeps a `tombstone`
/// in place of its head so older versions stay rejected.
pub(crate) const KIND_HEAD: &str = "head";
pub(crate) const KIND_CUE: &str = "cue";
pub(crate) const KIND_TOMBSTONE: &str = "tombstone";

pub(crate) fn is_korean(lang: &str) -> bool {
    lang == "ko" || lang.starts_with("ko-")
}

pub(crate) fn build_schema() -> Schema {
    let mut builder = Schema::builder();
    builder.add_text_field("asset_id", STRING | STORED);
    builder.add_text_field("head_key", STRING);
    builder.add_text_field("kind", STRING);
    builder.add_text_field("lang", STRING | STORED);
    builder.add_u64_field("start_ms", INDEXED | STORED | FAST);
    builder.add_i64_field("version", STORED);
    builder.add_text_field("body", TEXT | STORED);
    builder.add_text_field(
        "body_ko",
        TextOptions::default()
            .set_indexing_options(
                TextFieldIndexing::default()
                    .set_tokenizer(KOREAN_ANALYZER)
                    .set_index_option(IndexRecordOption::WithFreqsAndPositions),
            )
            .set_stored(),
    );
    builder.add_text_field("source", STORED);
    builder.build()
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Fields {
    pub asset_id: Field,
    pub head_key: Field,
    pub kind: Field,
    pub lang: Field,
    pub start_ms: Field,
    pub version: Field,
    pub body: Field,
    pub body_ko: Field,
    pub source: Field,
}

/// Committed state of one asset as seen by a writer.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Head {
    pub version: i64,
    /// `None` for a tombstone.
    pub document: Option<IndexDocument>,
}

impl Fields {
    pub fn resolve(schema: &Schema) -> IndexResult<Fields> {
        let field = |name: &str| {
            schema
                .get_field(name)
                .map_err(|_| IndexError::corrupt(format!("index schema lacks field {name}")))
        };
        Ok(Fields {
            asset_id: field("asset_id")?,
            head_key: field("head_key")?,
            kind: field("kind")?,
            lang: field("lang")?,
            start_ms: field("start_ms")?,
            version: field("version")?,
            body: field("body")?,
            body_ko: field("body_ko")?,
            source: field("source")?,
        })
    }

    pub fn body_for(&self, lang: &str) -> Field {
        if is_korean(lang) { self.body_ko } else { self.body }
    }

    /// Fields a free-text query runs against.
    pub fn text_fields(&self, lang: Option<&str>) -> Vec<Field> {
        match lang {
            Some(lang) => vec![self.body_for(lang)],
            None => vec![self.body, self.body_ko],
        }
    }

    pub fn asset_term(&self, asset_id: &str) -> Term {
        Term::from_field_text(self.asset_id, asset_id)
    }

    pub fn head_query(&self, asset_id: &str) -> TermQuery {
        TermQuery::new(
            Term::from_field_text(self.head_key, asset_id),
            IndexRecordOption::Basic,
        )
    }

    pub fn kind_query(&self, kind: &str) -> TermQuery {
        TermQuery::new(Term::from_field_text(self.kind, kind), IndexRecordOption::Basic)
    }

    /// Exact-match restriction that does not move the score.
    pub fn filter(&self, field: Field, value: &str) -> Box<dyn Query> {
        Box::new(ConstScoreQuery::new(
            Box::new(TermQuery::new(
                Term::from_field_text(field, value),
                IndexRecordOption::Basic,
            )),
            0.0,
        ))
    }

    pub fn documents_for(&self, doc: &IndexDocument) -> IndexResult<Vec<TantivyDocument>> {
        let mut out = Vec::new();
        for (lang, passages) in &doc.languages {
            let body = self.body_for(lang);
            for passage in passages {
                let mut cue = TantivyDocument::default();
                cue.add_text(self.asset_id, &doc.asset_id);
                cue.add_text(self.kind, KIND_CUE);
                cue.add_text(self.lang, lang);
                cue.add_u64(self.start_ms, passage.start_ms);
                cue.add_text(body, &passage.text);
                out.push(cue);
            }
        }

        let mut head = self.marker(&doc.asset_id, doc.version, KIND_HEAD);
        head.add_text(self.source, serde_json::to_string(doc)?);
        out.push(head);
        Ok(out)
    }

    pub fn tombstone(&self, asset_id: &str, version: i64) -> TantivyDocument {
        self.marker(asset_id, version, KIND_TOMBSTONE)
    }

    fn marker(&self, asset_id: &str, version: i64, kind: &str) -> TantivyDocument {
        let mut doc = TantivyDocument::default();
        doc.add_text(self.asset_id, asset_id);
        doc.add_text(self.head_key, asset_id);
        doc.add_text(self.kind, kind);
        doc.add_i64(self.version, version);
        doc
    }

    pub fn read_head(&self, doc: &TantivyDocument) -> IndexResult<Head> {
        let version = doc
            .get_first(self.version)
            .and_then(|v| v.as_i64())
            .ok_or_else(|| IndexError::corrupt("asset entry without version"))?;
        let document = match doc.get_first(self.source).and_then(|v| v.as_str()) {
            Some(source) => Some(
                serde_json::from_str(source)
                    .map_err(|e| IndexError::corrupt(format!("stored document: {e}")))?,
            ),
            None => None,
        };
        Ok(Head { version, document })
    }

    pub fn text(&self, doc: &TantivyDocument, field: Field) -> Option<String> {
        doc.get_first(field).and_then(|v| v.as_str()).map(str::to_string)
    }

    pub fn cue_text(&self, doc: &TantivyDocument) -> String {
        self.text(doc, self.body)
            .or_else(|| self.text(doc, self.body_ko))
            .unwrap_or_default()
    }

    pub fn cue_start(&self, doc: &TantivyDocument) -> u64 {
        doc.get_first(self.start_ms).and_then(|v| v.as_u64()).unwrap_or(0)
    }
}
