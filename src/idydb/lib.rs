//! IdyDB: an embedded, single-file, sparse cell store specialized for
//! Retrieval-Augmented Generation workloads.
//!
//! Cells are addressed by 1-based `(column, row)` pairs and hold one of
//! six kinds: null, `i32`, `f32`, UTF-8 string, bool, or a dense `f32`
//! embedding vector. On top of the cell store sit nearest-neighbour search
//! over a vector column (cosine or L2), row filters over scalar columns,
//! metadata projection, and context assembly, all against a single
//! self-contained file that can optionally be AES-256-GCM encrypted at
//! rest with a PBKDF2-derived key.
//!
//! ```no_run
//! use idydb::{Metric, OpenOptions};
//!
//! let mut db = OpenOptions::new().create(true).open("notes.idy")?;
//! db.rag_upsert(1, 2, 1, "the first note", &[1.0, 0.0, 0.0])?;
//! db.rag_upsert(1, 2, 2, "the second note", &[0.0, 1.0, 0.0])?;
//!
//! let hits = db.rag_query_topk(1, 2, &[0.9, 0.1, 0.0], 1, Metric::Cosine)?;
//! assert_eq!(hits[0].row, 1);
//! db.close()?;
//! # Ok::<(), idydb::Error>(())
//! ```

pub mod db;
pub mod envelope;
pub mod error;
pub mod filter;
pub mod knn;
pub mod limits;
pub mod rag;
pub mod stream;
pub mod types;
pub mod util;

mod container;

pub use db::{version_check, IdyDb, OpenOptions, ReadOutcome};
pub use error::Error;
pub use filter::{Filter, FilterOp, FilterTerm, FilterValue};
pub use knn::{KnnResult, Metric};
pub use rag::RagMatch;
pub use types::{Value, ValueKind};
