//! Row-level filter predicates over scalar columns.
//!
//! A [`Filter`] is a conjunction of [`FilterTerm`]s. Each term is evaluated
//! by one forward scan of the file that materialises a per-row boolean
//! mask; the masks of all terms are ANDed together. Rows a term's column
//! never stores keep the mask's initial value, which makes `IsNull` terms
//! start all-true and every other operator start all-false.

use crate::container::{Container, ScanCursor};
use crate::error::Error;
use crate::limits::{COLUMN_POSITION_MAX, ROW_POSITION_MAX};
use crate::types::SegmentTag;

/// Comparison operator of a filter term.
///
/// Numeric kinds support the full ordering; booleans and strings only
/// `Eq`/`Neq`; vectors only `IsNull`/`IsNotNull`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    IsNull,
    IsNotNull,
}

/// The typed operand a term compares cells against.
///
/// `Null` combined with `Eq`/`Neq` is normalized to `IsNull`/`IsNotNull`.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterValue {
    Null,
    Int(i32),
    Float(f32),
    Bool(bool),
    Char(String),
}

/// One predicate over one column.
#[derive(Debug, Clone)]
pub struct FilterTerm {
    pub column: u64,
    pub op: FilterOp,
    pub value: FilterValue,
}

impl FilterTerm {
    pub fn new(column: u64, op: FilterOp, value: FilterValue) -> FilterTerm {
        FilterTerm { column, op, value }
    }

    /// Shorthand for an `IsNull` term.
    pub fn is_null(column: u64) -> FilterTerm {
        FilterTerm::new(column, FilterOp::IsNull, FilterValue::Null)
    }

    /// Shorthand for an `IsNotNull` term.
    pub fn is_not_null(column: u64) -> FilterTerm {
        FilterTerm::new(column, FilterOp::IsNotNull, FilterValue::Null)
    }
}

/// A logical AND of filter terms. The empty filter matches every row.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    terms: Vec<FilterTerm>,
}

impl Filter {
    pub fn new() -> Filter {
        Filter { terms: Vec::new() }
    }

    /// Appends a term, consuming and returning the filter for chaining.
    pub fn term(mut self, term: FilterTerm) -> Filter {
        self.terms.push(term);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    pub fn terms(&self) -> &[FilterTerm] {
        &self.terms
    }
}

fn compare_ordered<T: PartialOrd>(stored: T, op: FilterOp, wanted: T) -> bool {
    match op {
        FilterOp::Eq => stored == wanted,
        FilterOp::Neq => stored != wanted,
        FilterOp::Gt => stored > wanted,
        FilterOp::Gte => stored >= wanted,
        FilterOp::Lt => stored < wanted,
        FilterOp::Lte => stored <= wanted,
        FilterOp::IsNull | FilterOp::IsNotNull => false,
    }
}

fn compare_equality(stored: bool, op: FilterOp, wanted: bool) -> bool {
    match op {
        FilterOp::Eq => stored == wanted,
        FilterOp::Neq => stored != wanted,
        _ => false,
    }
}

fn build_term_mask(cont: &mut Container, term: &FilterTerm, mask: &mut [bool]) -> Result<(), Error> {
    if term.column == 0 {
        return Err(Error::Range(String::from("filter column positions start at 1")));
    }
    if !cont.unsafe_mode && term.column - 1 > COLUMN_POSITION_MAX {
        return Err(Error::Range(format!(
            "filter column {} exceeds the sizing-mode maximum",
            term.column
        )));
    }

    let op = match (term.op, &term.value) {
        (FilterOp::Eq, FilterValue::Null) => FilterOp::IsNull,
        (FilterOp::Neq, FilterValue::Null) => FilterOp::IsNotNull,
        (op, _) => op,
    };

    let initial = op == FilterOp::IsNull;
    for entry in mask.iter_mut() {
        *entry = initial;
    }
    mask[0] = false;

    let mut cursor = ScanCursor::new(cont);
    while let Some(seg) = cursor.next()? {
        if seg.column > term.column {
            break;
        }
        if seg.column != term.column {
            continue;
        }
        let idx = seg.row as usize;
        if idx >= mask.len() {
            continue;
        }
        match op {
            FilterOp::IsNull => {
                mask[idx] = false;
                continue;
            }
            FilterOp::IsNotNull => {
                mask[idx] = true;
                continue;
            }
            _ => {}
        }
        // A cell whose kind differs from the operand leaves the row
        // non-matching; vectors only ever answer null-ness.
        match (seg.tag, &term.value) {
            (SegmentTag::Int, FilterValue::Int(wanted)) => {
                let stored = cursor.read_i32(&seg)?;
                mask[idx] = compare_ordered(stored, op, *wanted);
            }
            (SegmentTag::Float, FilterValue::Float(wanted)) => {
                let stored = cursor.read_f32(&seg)?;
                mask[idx] = compare_ordered(stored, op, *wanted);
            }
            (SegmentTag::BoolTrue, FilterValue::Bool(wanted)) => {
                mask[idx] = compare_equality(true, op, *wanted);
            }
            (SegmentTag::BoolFalse, FilterValue::Bool(wanted)) => {
                mask[idx] = compare_equality(false, op, *wanted);
            }
            (SegmentTag::Char, FilterValue::Char(wanted)) => {
                if op == FilterOp::Eq || op == FilterOp::Neq {
                    let equal = seg.char_len() as usize == wanted.len()
                        && cursor.read_char_bytes(&seg)? == wanted.as_bytes();
                    mask[idx] = if op == FilterOp::Eq { equal } else { !equal };
                }
            }
            _ => {}
        }
    }
    Ok(())
}

/// Builds the combined allow-mask of a filter: one scan per term, ANDed.
///
/// The mask spans the full row-id domain plus the unused index 0, which is
/// always `false`.
pub(crate) fn build_allowed_mask(cont: &mut Container, filter: &Filter) -> Result<Vec<bool>, Error> {
    let len = (ROW_POSITION_MAX + 2) as usize;
    let mut allowed = vec![true; len];
    allowed[0] = false;
    if filter.is_empty() {
        return Ok(allowed);
    }

    let mut term_mask = vec![false; len];
    for term in filter.terms() {
        build_term_mask(cont, term, &mut term_mask)?;
        for (entry, matched) in allowed.iter_mut().zip(term_mask.iter()) {
            *entry = *entry && *matched;
        }
    }
    Ok(allowed)
}
