use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tantivy::collector::TopDocs;
use tantivy::query::{BooleanQuery, Occur, QueryParser, TermSetQuery};
use tantivy::schema::{
    IndexRecordOption, Schema, TextFieldIndexing, TextOptions, Value as TantivyValue, INDEXED,
    STORED,
};
use tantivy::{Index, TantivyDocument, Term};

use crate::error::{Error, Result};

const WRITER_HEAP_BYTES: usize = 50_000_000;

#[derive(Debug, Clone)]
pub struct SparseDoc {
    pub id: i64,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SparseHit {
    pub id: i64,
    pub score: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryOp {
    #[default]
    Or,
    And,
}

/// Stemming applied at index creation. English is the default; `None`
/// indexes raw lowercased terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StemLanguage {
    #[default]
    English,
    None,
}

impl StemLanguage {
    fn tokenizer_name(&self) -> &'static str {
        match self {
            StemLanguage::English => "en_stem",
            StemLanguage::None => "default",
        }
    }
}

/// Lexical index adapter: one self-contained tantivy directory per index
/// under `<root>/<name>`.
///
/// Documents are keyed by an indexed integer `id` field, which lives apart
/// from the content terms so ids can never collide with them; adds use
/// delete-then-insert replace semantics. Writers take an exclusive per-index
/// lock; queries open their own reader handle.
pub struct TextSearch {
    root: PathBuf,
    language: StemLanguage,
    write_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl TextSearch {
    pub fn new(root: impl Into<PathBuf>, language: StemLanguage) -> Self {
        let root = root.into();
        std::fs::create_dir_all(&root).ok();
        Self {
            root,
            language,
            write_locks: DashMap::new(),
        }
    }

    pub fn index_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.index_path(name).exists()
    }

    /// Create an empty index. Fails if the directory already exists.
    pub fn create(&self, name: &str) -> Result<()> {
        let path = self.index_path(name);
        if path.exists() {
            return Err(Error::Validation(format!(
                "sparse index '{name}' already exists at {}",
                path.display()
            )));
        }
        std::fs::create_dir_all(&path)?;
        Index::create_in_dir(&path, self.schema())?;
        Ok(())
    }

    /// Remove the index directory. Idempotent, best-effort.
    pub fn delete(&self, name: &str) -> Result<()> {
        let path = self.index_path(name);
        if path.exists() {
            std::fs::remove_dir_all(&path)?;
        }
        self.write_locks.remove(name);
        Ok(())
    }

    /// Insert documents, replacing any previous document with the same id.
    pub fn add_docs(&self, name: &str, docs: &[SparseDoc]) -> Result<()> {
        if docs.is_empty() {
            return Ok(());
        }
        let lock = self.write_lock(name);
        let _guard = lock.lock();

        let index = self.open(name)?;
        let (id_field, content_field) = self.fields(&index)?;
        let mut writer = index.writer::<TantivyDocument>(WRITER_HEAP_BYTES)?;
        for doc in docs {
            writer.delete_term(Term::from_field_i64(id_field, doc.id));
            let mut document = TantivyDocument::new();
            document.add_i64(id_field, doc.id);
            document.add_text(content_field, &doc.content);
            writer.add_document(document)?;
        }
        writer.commit()?;
        Ok(())
    }

    /// Remove documents by id. Missing ids are silently ignored.
    pub fn remove_docs(&self, name: &str, ids: &[i64]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let lock = self.write_lock(name);
        let _guard = lock.lock();

        let index = self.open(name)?;
        let (id_field, _) = self.fields(&index)?;
        let mut writer = index.writer::<TantivyDocument>(WRITER_HEAP_BYTES)?;
        for id in ids {
            writer.delete_term(Term::from_field_i64(id_field, *id));
        }
        writer.commit()?;
        Ok(())
    }

    /// Top-`limit` lexical matches for `q`, scored into (0, 1).
    ///
    /// `filter_ids` restricts candidates to the given id allowlist. `op`
    /// picks the default combinator for the parsed terms.
    pub fn query(
        &self,
        name: &str,
        q: &str,
        limit: usize,
        filter_ids: Option<&[i64]>,
        op: QueryOp,
    ) -> Result<Vec<SparseHit>> {
        if q.trim().is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let index = self.open(name)?;
        let (id_field, content_field) = self.fields(&index)?;

        let mut parser = QueryParser::for_index(&index, vec![content_field]);
        if op == QueryOp::And {
            parser.set_conjunction_by_default();
        }
        let (parsed, _errors) = parser.parse_query_lenient(q);

        let query: Box<dyn tantivy::query::Query> = match filter_ids {
            Some(ids) => {
                let allow = TermSetQuery::new(
                    ids.iter().map(|id| Term::from_field_i64(id_field, *id)),
                );
                Box::new(BooleanQuery::new(vec![
                    (Occur::Must, parsed),
                    (Occur::Must, Box::new(allow)),
                ]))
            }
            None => parsed,
        };

        let reader = index.reader()?;
        let searcher = reader.searcher();
        let top_docs = searcher.search(&query, &TopDocs::with_limit(limit))?;

        let mut hits = Vec::with_capacity(top_docs.len());
        for (raw_score, address) in top_docs {
            let doc: TantivyDocument = searcher.doc(address)?;
            if let Some(id) = doc.get_first(id_field).and_then(|v| v.as_i64()) {
                // BM25 is unbounded; squash into (0, 1) for fusion.
                let score = 1.0 / (1.0 + (-raw_score).exp());
                hits.push(SparseHit { id, score });
            }
        }
        Ok(hits)
    }

    fn schema(&self) -> Schema {
        let mut builder = Schema::builder();
        builder.add_i64_field("id", INDEXED | STORED);
        let indexing = TextFieldIndexing::default()
            .set_tokenizer(self.language.tokenizer_name())
            .set_index_option(IndexRecordOption::WithFreqsAndPositions);
        builder.add_text_field("content", TextOptions::default().set_indexing_options(indexing));
        builder.build()
    }

    fn open(&self, name: &str) -> Result<Index> {
        let path = self.index_path(name);
        if !path.exists() {
            return Err(Error::NotFound(format!("sparse index '{name}'")));
        }
        Ok(Index::open_in_dir(&path)?)
    }

    fn fields(&self, index: &Index) -> Result<(tantivy::schema::Field, tantivy::schema::Field)> {
        let schema = index.schema();
        Ok((schema.get_field("id")?, schema.get_field("content")?))
    }

    fn write_lock(&self, name: &str) -> Arc<Mutex<()>> {
        self.write_locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}
