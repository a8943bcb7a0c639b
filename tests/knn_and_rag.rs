//! Vector search, filters, and the RAG query surface.

use idydb::{
    Error, Filter, FilterOp, FilterTerm, FilterValue, Metric, OpenOptions, IdyDb, Value,
};
use tempfile::TempDir;

const TEXT_COL: u64 = 1;
const VEC_COL: u64 = 4;
const FLAG_COL: u64 = 7;
const SCORE_COL: u64 = 8;

fn open_fresh(dir: &TempDir, name: &str) -> IdyDb {
    OpenOptions::new()
        .create(true)
        .open(dir.path().join(name))
        .unwrap()
}

#[test]
fn cosine_knn_orders_by_similarity() {
    let dir = TempDir::new().unwrap();
    let mut db = open_fresh(&dir, "cosine.idy");

    db.insert_vector(VEC_COL, 1, &[1.0, 0.0, 0.0]).unwrap();
    db.insert_vector(VEC_COL, 2, &[0.0, 1.0, 0.0]).unwrap();
    db.insert_vector(VEC_COL, 3, &[0.9, 0.1, 0.0]).unwrap();

    let hits = db
        .knn_search(VEC_COL, &[1.0, 0.0, 0.0], 2, Metric::Cosine)
        .unwrap();
    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].row, 1);
    assert!((hits[0].score - 1.0).abs() < 1e-6);
    assert_eq!(hits[1].row, 3);
    assert!((hits[1].score - 0.9939).abs() < 1e-3);

    for hit in &hits {
        assert!(hit.score >= -1.0 - 1e-6 && hit.score <= 1.0 + 1e-6);
    }
}

#[test]
fn l2_knn_prefers_the_nearest_vector() {
    let dir = TempDir::new().unwrap();
    let mut db = open_fresh(&dir, "l2.idy");

    db.insert_vector(VEC_COL, 1, &[0.0, 0.0]).unwrap();
    db.insert_vector(VEC_COL, 2, &[3.0, 4.0]).unwrap();
    db.insert_vector(VEC_COL, 3, &[1.0, 1.0]).unwrap();

    let hits = db.knn_search(VEC_COL, &[0.9, 1.1], 3, Metric::L2).unwrap();
    assert_eq!(hits[0].row, 3);
    assert_eq!(hits.last().unwrap().row, 2);
    // L2 scores are negated distances: higher is closer.
    assert!(hits[0].score > hits[1].score && hits[1].score > hits[2].score);
}

#[test]
fn knn_skips_mismatched_dims_and_foreign_kinds() {
    let dir = TempDir::new().unwrap();
    let mut db = open_fresh(&dir, "dims.idy");

    db.insert_vector(VEC_COL, 1, &[1.0, 0.0]).unwrap();
    db.insert_vector(VEC_COL, 2, &[1.0, 0.0, 0.0]).unwrap();
    db.insert_char(VEC_COL, 3, "not a vector").unwrap();

    let hits = db.knn_search(VEC_COL, &[1.0, 0.0], 4, Metric::Cosine).unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].row, 1);
}

#[test]
fn knn_returns_fewer_than_k_when_column_is_sparse() {
    let dir = TempDir::new().unwrap();
    let mut db = open_fresh(&dir, "sparse.idy");

    db.insert_vector(VEC_COL, 5, &[1.0]).unwrap();
    let hits = db.knn_search(VEC_COL, &[1.0], 10, Metric::Cosine).unwrap();
    assert_eq!(hits.len(), 1);

    let none = db.knn_search(VEC_COL + 1, &[1.0], 10, Metric::Cosine).unwrap();
    assert!(none.is_empty());
}

#[test]
fn filtered_knn_returns_exactly_the_allowed_rows() {
    let dir = TempDir::new().unwrap();
    let mut db = open_fresh(&dir, "filtered.idy");

    let vectors = [
        [1.0f32, 0.0, 0.0],
        [0.8, 0.2, 0.0],
        [0.6, 0.4, 0.0],
        [0.4, 0.6, 0.0],
    ];
    for (i, v) in vectors.iter().enumerate() {
        db.insert_vector(VEC_COL, i as u64 + 1, v).unwrap();
    }
    for (row, flag) in [(1u64, true), (2, false), (3, true), (4, true)] {
        db.insert_bool(FLAG_COL, row, flag).unwrap();
    }

    let filter = Filter::new().term(FilterTerm::new(
        FLAG_COL,
        FilterOp::Eq,
        FilterValue::Bool(true),
    ));
    let hits = db
        .knn_search_filtered(VEC_COL, &[1.0, 0.0, 0.0], 4, Metric::Cosine, &filter)
        .unwrap();

    let mut rows: Vec<u64> = hits.iter().map(|h| h.row).collect();
    assert!(hits.windows(2).all(|w| w[0].score >= w[1].score));
    rows.sort_unstable();
    assert_eq!(rows, [1, 3, 4]);
}

#[test]
fn filter_terms_compose_with_and_semantics() {
    let dir = TempDir::new().unwrap();
    let mut db = open_fresh(&dir, "compose.idy");

    for row in 1..=4u64 {
        db.insert_vector(VEC_COL, row, &[1.0, 0.0]).unwrap();
        db.insert_int(SCORE_COL, row, row as i32 * 10).unwrap();
    }
    db.insert_char(TEXT_COL, 1, "keep").unwrap();
    db.insert_char(TEXT_COL, 2, "keep").unwrap();
    db.insert_char(TEXT_COL, 3, "drop").unwrap();
    // Row 4 has no text at all.

    let filter = Filter::new()
        .term(FilterTerm::new(
            TEXT_COL,
            FilterOp::Eq,
            FilterValue::Char(String::from("keep")),
        ))
        .term(FilterTerm::new(
            SCORE_COL,
            FilterOp::Gte,
            FilterValue::Int(20),
        ));
    let hits = db
        .knn_search_filtered(VEC_COL, &[1.0, 0.0], 4, Metric::Cosine, &filter)
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].row, 2);
}

#[test]
fn null_terms_cover_unwritten_rows() {
    let dir = TempDir::new().unwrap();
    let mut db = open_fresh(&dir, "nulls.idy");

    for row in 1..=3u64 {
        db.insert_vector(VEC_COL, row, &[1.0]).unwrap();
    }
    db.insert_int(SCORE_COL, 2, 50).unwrap();

    let is_null = Filter::new().term(FilterTerm::is_null(SCORE_COL));
    let hits = db
        .knn_search_filtered(VEC_COL, &[1.0], 3, Metric::Cosine, &is_null)
        .unwrap();
    let mut rows: Vec<u64> = hits.iter().map(|h| h.row).collect();
    rows.sort_unstable();
    assert_eq!(rows, [1, 3]);

    let is_not_null = Filter::new().term(FilterTerm::is_not_null(SCORE_COL));
    let hits = db
        .knn_search_filtered(VEC_COL, &[1.0], 3, Metric::Cosine, &is_not_null)
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].row, 2);
}

#[test]
fn rag_upsert_and_topk_join_texts() {
    let dir = TempDir::new().unwrap();
    let mut db = open_fresh(&dir, "rag.idy");

    db.rag_upsert(TEXT_COL, VEC_COL, 1, "alpha", &[1.0, 0.0]).unwrap();
    db.rag_upsert(TEXT_COL, VEC_COL, 2, "beta", &[0.0, 1.0]).unwrap();
    db.insert_vector(VEC_COL, 3, &[0.9, 0.1]).unwrap(); // no text

    let hits = db
        .rag_query_topk(TEXT_COL, VEC_COL, &[1.0, 0.0], 3, Metric::Cosine)
        .unwrap();
    assert_eq!(hits.len(), 3);
    assert_eq!(hits[0].row, 1);
    assert_eq!(hits[0].text.as_deref(), Some("alpha"));
    assert_eq!(hits[1].row, 3);
    assert_eq!(hits[1].text, None);
    assert_eq!(hits[2].text.as_deref(), Some("beta"));
}

#[test]
fn rag_auto_embed_uses_the_bound_embedder() {
    let dir = TempDir::new().unwrap();
    let mut db = open_fresh(&dir, "embed.idy");

    assert!(matches!(
        db.rag_upsert_auto_embed(TEXT_COL, VEC_COL, 1, "no embedder yet"),
        Err(Error::InvalidState(_))
    ));

    db.set_embedder(|text| {
        let mut v = vec![0.0f32; 4];
        for (i, b) in text.bytes().enumerate() {
            v[i % 4] += b as f32 / 255.0;
        }
        Ok(v)
    });
    db.rag_upsert_auto_embed(TEXT_COL, VEC_COL, 1, "first document").unwrap();
    db.rag_upsert_auto_embed(TEXT_COL, VEC_COL, 2, "second document").unwrap();

    db.extract(TEXT_COL, 1).unwrap();
    assert_eq!(db.retrieve_char(), Some("first document"));
    db.extract(VEC_COL, 2).unwrap();
    assert_eq!(db.retrieve_vector().map(<[f32]>::len), Some(4));
}

#[test]
fn metadata_projection_deep_copies_values() {
    let dir = TempDir::new().unwrap();
    let mut db = open_fresh(&dir, "meta.idy");

    db.rag_upsert(TEXT_COL, VEC_COL, 1, "doc one", &[1.0, 0.0]).unwrap();
    db.rag_upsert(TEXT_COL, VEC_COL, 2, "doc two", &[0.0, 1.0]).unwrap();
    db.insert_int(SCORE_COL, 1, 17).unwrap();
    db.insert_char(9, 1, "tag-a").unwrap();

    let hits = db
        .rag_query_topk_with_metadata(
            TEXT_COL,
            VEC_COL,
            &[1.0, 0.0],
            2,
            Metric::Cosine,
            None,
            &[SCORE_COL, 9],
        )
        .unwrap();

    assert_eq!(hits[0].row, 1);
    assert_eq!(hits[0].meta, vec![Value::Int(17), Value::Char(String::from("tag-a"))]);
    assert_eq!(hits[1].row, 2);
    assert_eq!(hits[1].meta, vec![Value::Null, Value::Null]);
}

#[test]
fn context_assembly_joins_and_truncates() {
    let dir = TempDir::new().unwrap();
    let mut db = open_fresh(&dir, "context.idy");

    db.rag_upsert(TEXT_COL, VEC_COL, 1, "first chunk", &[1.0, 0.0]).unwrap();
    db.rag_upsert(TEXT_COL, VEC_COL, 2, "second chunk", &[0.9, 0.1]).unwrap();
    db.rag_upsert(TEXT_COL, VEC_COL, 3, "far away", &[0.0, 1.0]).unwrap();

    let context = db
        .rag_query_context(TEXT_COL, VEC_COL, &[1.0, 0.0], 2, Metric::Cosine, 0)
        .unwrap();
    assert_eq!(context, "first chunk\n---\nsecond chunk");

    let truncated = db
        .rag_query_context(TEXT_COL, VEC_COL, &[1.0, 0.0], 2, Metric::Cosine, 14)
        .unwrap();
    assert_eq!(truncated, "first chunk\n--");
}

#[test]
fn filtered_context_only_uses_matching_rows() {
    let dir = TempDir::new().unwrap();
    let mut db = open_fresh(&dir, "fcontext.idy");

    db.rag_upsert(TEXT_COL, VEC_COL, 1, "wanted", &[1.0, 0.0]).unwrap();
    db.rag_upsert(TEXT_COL, VEC_COL, 2, "unwanted", &[1.0, 0.0]).unwrap();
    db.insert_bool(FLAG_COL, 1, true).unwrap();
    db.insert_bool(FLAG_COL, 2, false).unwrap();

    let filter = Filter::new().term(FilterTerm::new(
        FLAG_COL,
        FilterOp::Eq,
        FilterValue::Bool(true),
    ));
    let context = db
        .rag_query_context_filtered(TEXT_COL, VEC_COL, &[1.0, 0.0], 4, Metric::Cosine, &filter, 0)
        .unwrap();
    assert_eq!(context, "wanted");
}

#[test]
fn string_filters_compare_exact_bytes() {
    let dir = TempDir::new().unwrap();
    let mut db = open_fresh(&dir, "strings.idy");

    for (row, tag) in [(1u64, "news"), (2, "blog"), (3, "News")] {
        db.insert_vector(VEC_COL, row, &[1.0]).unwrap();
        db.insert_char(9, row, tag).unwrap();
    }

    let filter = Filter::new().term(FilterTerm::new(
        9,
        FilterOp::Eq,
        FilterValue::Char(String::from("news")),
    ));
    let hits = db
        .knn_search_filtered(VEC_COL, &[1.0], 3, Metric::Cosine, &filter)
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].row, 1);

    let filter = Filter::new().term(FilterTerm::new(
        9,
        FilterOp::Neq,
        FilterValue::Char(String::from("news")),
    ));
    let hits = db
        .knn_search_filtered(VEC_COL, &[1.0], 3, Metric::Cosine, &filter)
        .unwrap();
    let mut rows: Vec<u64> = hits.iter().map(|h| h.row).collect();
    rows.sort_unstable();
    assert_eq!(rows, [2, 3]);
}
