//! Single-pass top-k nearest-neighbour search over a vector column.

use std::cmp::Ordering;

use crate::container::{Container, ScanCursor};
use crate::error::Error;
use crate::limits::{COLUMN_POSITION_MAX, MAX_VECTOR_DIM};
use crate::types::SegmentTag;

/// Similarity metric of a kNN search. Scores are oriented so that higher
/// is always better: cosine similarity directly, L2 as the negated
/// Euclidean distance.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Metric {
    Cosine,
    L2,
}

/// One kNN hit: a 1-based row id and its score.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct KnnResult {
    pub row: u64,
    pub score: f32,
}

fn norm(components: &[f32]) -> f32 {
    components.iter().map(|c| c * c).sum::<f32>().sqrt()
}

/// Scans `vector_column` once and returns up to `k` results sorted by
/// descending score.
///
/// Vectors whose dimensionality differs from the query are skipped, as are
/// non-vector cells found in the column (they indicate corruption, but the
/// scan keeps going). When `allowed` is given, rows whose mask entry is
/// `false` are passed over without their components ever being read.
///
/// The top-k buffer replaces its strictly-smallest slot only on strict
/// improvement, so earlier rows win ties deterministically.
pub(crate) fn knn_search(
    cont: &mut Container,
    vector_column: u64,
    query: &[f32],
    k: usize,
    metric: Metric,
    allowed: Option<&[bool]>,
) -> Result<Vec<KnnResult>, Error> {
    if query.is_empty() || query.len() > MAX_VECTOR_DIM as usize {
        return Err(Error::Range(format!(
            "query dimensionality {} out of range",
            query.len()
        )));
    }
    if k == 0 {
        return Err(Error::InvalidState(String::from(
            "top-k size must be at least 1",
        )));
    }
    if vector_column == 0 {
        return Err(Error::Range(String::from("column positions start at 1")));
    }
    if !cont.unsafe_mode && vector_column - 1 > COLUMN_POSITION_MAX {
        return Err(Error::Range(format!(
            "column {} exceeds the sizing-mode maximum",
            vector_column
        )));
    }

    let query_norm = match metric {
        Metric::Cosine => {
            let n = norm(query);
            if n == 0.0 {
                1.0
            } else {
                n
            }
        }
        Metric::L2 => 1.0,
    };

    let mut slots = vec![
        KnnResult {
            row: 0,
            score: f32::NEG_INFINITY,
        };
        k
    ];
    let mut raw = Vec::new();
    let mut components: Vec<f32> = Vec::new();

    let mut cursor = ScanCursor::new(cont);
    while let Some(seg) = cursor.next()? {
        if seg.column > vector_column {
            break;
        }
        if seg.column != vector_column || seg.tag != SegmentTag::Vector {
            continue;
        }
        if seg.vector_dims() as usize != query.len() {
            continue;
        }
        if let Some(mask) = allowed {
            let idx = seg.row as usize;
            if idx >= mask.len() || !mask[idx] {
                continue;
            }
        }

        cursor.read_vector_into(&seg, &mut raw, &mut components)?;
        let score = match metric {
            Metric::Cosine => {
                let mut dot = 0.0f32;
                let mut norm_sq = 0.0f32;
                for (q, v) in query.iter().zip(components.iter()) {
                    dot += q * v;
                    norm_sq += v * v;
                }
                let mut vector_norm = norm_sq.sqrt();
                if vector_norm == 0.0 {
                    vector_norm = 1.0;
                }
                dot / (query_norm * vector_norm)
            }
            Metric::L2 => {
                let mut dist_sq = 0.0f32;
                for (q, v) in query.iter().zip(components.iter()) {
                    let d = q - v;
                    dist_sq += d * d;
                }
                -dist_sq.sqrt()
            }
        };

        let mut worst = 0;
        let mut worst_score = slots[0].score;
        for (i, slot) in slots.iter().enumerate().skip(1) {
            if slot.score < worst_score {
                worst = i;
                worst_score = slot.score;
            }
        }
        if score > worst_score {
            slots[worst] = KnnResult { row: seg.row, score };
        }
    }

    slots.sort_by(|a, b| match (a.row == 0, b.row == 0) {
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        _ => b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal),
    });
    let filled = slots.iter().position(|slot| slot.row == 0).unwrap_or(k);
    slots.truncate(filled);
    Ok(slots)
}
