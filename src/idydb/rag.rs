//! The RAG façade: text/embedding upserts and top-k retrieval joined with
//! texts, projected metadata, and assembled context strings.

use itertools::Itertools;

use crate::container;
use crate::db::IdyDb;
use crate::error::Error;
use crate::filter::Filter;
use crate::knn::Metric;
use crate::types::Value;

/// Separator placed between texts when assembling a context string.
pub const CONTEXT_SEPARATOR: &str = "\n---\n";

/// A callback producing an embedding for a text, bound to the handle with
/// [`IdyDb::set_embedder`] and used by [`IdyDb::rag_upsert_auto_embed`].
pub type Embedder = Box<dyn FnMut(&str) -> Result<Vec<f32>, Error>>;

/// One retrieval hit: the scored row joined with its text and any
/// projected metadata values.
///
/// `text` is `None` when the row has no text cell (or a non-string one);
/// the hit still counts towards `k`. `meta` holds one deep-copied
/// [`Value`] per requested metadata column, `Value::Null` for absent
/// cells; it is empty unless metadata projection was requested.
#[derive(Debug, Clone, PartialEq)]
pub struct RagMatch {
    pub row: u64,
    pub score: f32,
    pub text: Option<String>,
    pub meta: Vec<Value>,
}

impl IdyDb {
    /// Binds the embedder used by [`IdyDb::rag_upsert_auto_embed`].
    pub fn set_embedder<F>(&mut self, embedder: F)
    where
        F: FnMut(&str) -> Result<Vec<f32>, Error> + 'static,
    {
        self.embedder = Some(Box::new(embedder));
    }

    /// Writes `text` at `(text_column, row)` and `embedding` at
    /// `(vector_column, row)`.
    ///
    /// On partial failure the completed write is left in place and the
    /// error is reported; retrying the full upsert is safe.
    pub fn rag_upsert(
        &mut self,
        text_column: u64,
        vector_column: u64,
        row: u64,
        text: &str,
        embedding: &[f32],
    ) -> Result<(), Error> {
        if text.is_empty() || embedding.is_empty() {
            let err = Err(Error::InvalidState(String::from(
                "rag_upsert requires a non-empty text and embedding",
            )));
            return self.record(err);
        }
        self.insert_char(text_column, row, text)?;
        self.insert_vector(vector_column, row, embedding)
    }

    /// Embeds `text` through the bound embedder and upserts the pair.
    pub fn rag_upsert_auto_embed(
        &mut self,
        text_column: u64,
        vector_column: u64,
        row: u64,
        text: &str,
    ) -> Result<(), Error> {
        let embedding = {
            let embedder = match self.embedder.as_mut() {
                Some(embedder) => embedder,
                None => {
                    let err = Err(Error::InvalidState(String::from(
                        "no embedder is bound to this handle",
                    )));
                    return self.record(err);
                }
            };
            embedder(text)?
        };
        if embedding.is_empty() {
            let err = Err(Error::InvalidState(String::from(
                "the embedder produced an empty vector",
            )));
            return self.record(err);
        }
        self.rag_upsert(text_column, vector_column, row, text, &embedding)
    }

    /// Top-k search over `vector_column`, each hit joined with the text
    /// stored at `text_column`.
    pub fn rag_query_topk(
        &mut self,
        text_column: u64,
        vector_column: u64,
        query: &[f32],
        k: usize,
        metric: Metric,
    ) -> Result<Vec<RagMatch>, Error> {
        let result = self.rag_topk_inner(text_column, vector_column, query, k, metric, None, &[]);
        self.record(result)
    }

    /// As [`IdyDb::rag_query_topk`], considering only rows that match
    /// `filter`.
    pub fn rag_query_topk_filtered(
        &mut self,
        text_column: u64,
        vector_column: u64,
        query: &[f32],
        k: usize,
        metric: Metric,
        filter: &Filter,
    ) -> Result<Vec<RagMatch>, Error> {
        let result =
            self.rag_topk_inner(text_column, vector_column, query, k, metric, Some(filter), &[]);
        self.record(result)
    }

    /// Filtered top-k with per-hit metadata projection.
    ///
    /// Every hit carries one value per entry of `meta_columns`, in order;
    /// absent cells project as [`Value::Null`]. Strings and vectors are
    /// deep copies owned by the caller.
    pub fn rag_query_topk_with_metadata(
        &mut self,
        text_column: u64,
        vector_column: u64,
        query: &[f32],
        k: usize,
        metric: Metric,
        filter: Option<&Filter>,
        meta_columns: &[u64],
    ) -> Result<Vec<RagMatch>, Error> {
        let result =
            self.rag_topk_inner(text_column, vector_column, query, k, metric, filter, meta_columns);
        self.record(result)
    }

    /// Joins the top-k texts into one context string separated by
    /// [`CONTEXT_SEPARATOR`].
    ///
    /// When `max_chars > 0` the result is cut to at most `max_chars`
    /// bytes; the cut lands on the nearest character boundary at or below
    /// the limit, since the returned `String` must stay valid UTF-8.
    pub fn rag_query_context(
        &mut self,
        text_column: u64,
        vector_column: u64,
        query: &[f32],
        k: usize,
        metric: Metric,
        max_chars: usize,
    ) -> Result<String, Error> {
        let result = self
            .rag_topk_inner(text_column, vector_column, query, k, metric, None, &[])
            .map(|matches| assemble_context(&matches, max_chars));
        self.record(result)
    }

    /// As [`IdyDb::rag_query_context`], considering only rows that match
    /// `filter`.
    pub fn rag_query_context_filtered(
        &mut self,
        text_column: u64,
        vector_column: u64,
        query: &[f32],
        k: usize,
        metric: Metric,
        filter: &Filter,
        max_chars: usize,
    ) -> Result<String, Error> {
        let result = self
            .rag_topk_inner(text_column, vector_column, query, k, metric, Some(filter), &[])
            .map(|matches| assemble_context(&matches, max_chars));
        self.record(result)
    }

    fn rag_topk_inner(
        &mut self,
        text_column: u64,
        vector_column: u64,
        query: &[f32],
        k: usize,
        metric: Metric,
        filter: Option<&Filter>,
        meta_columns: &[u64],
    ) -> Result<Vec<RagMatch>, Error> {
        let mask = match filter {
            Some(filter) if !filter.is_empty() => {
                Some(crate::filter::build_allowed_mask(&mut self.cont, filter)?)
            }
            _ => None,
        };
        let hits = crate::knn::knn_search(
            &mut self.cont,
            vector_column,
            query,
            k,
            metric,
            mask.as_deref(),
        )?;

        let mut matches = Vec::with_capacity(hits.len());
        for hit in hits {
            let text = match container::read_at(&mut self.cont, text_column, hit.row)? {
                Some(Value::Char(text)) => Some(text),
                _ => None,
            };
            let mut meta = Vec::with_capacity(meta_columns.len());
            for &meta_column in meta_columns {
                let value = container::read_at(&mut self.cont, meta_column, hit.row)?
                    .unwrap_or(Value::Null);
                meta.push(value);
            }
            matches.push(RagMatch {
                row: hit.row,
                score: hit.score,
                text,
                meta,
            });
        }
        Ok(matches)
    }
}

fn assemble_context(matches: &[RagMatch], max_chars: usize) -> String {
    let joined = matches
        .iter()
        .filter_map(|m| m.text.as_deref())
        .join(CONTEXT_SEPARATOR);
    if max_chars == 0 || joined.len() <= max_chars {
        return joined;
    }
    let mut cut = max_chars;
    while !joined.is_char_boundary(cut) {
        cut -= 1;
    }
    joined[..cut].to_string()
}
