//! The sparse-cell container: partition/segment layout and the algorithms
//! that maintain it in place.
//!
//! The file is a sequence of partitions ordered by ascending column id.
//! Each partition header stores the gap to the previous partition's column
//! (`skip_amount`, minus one) and its segment count minus one; summing
//! `skip_amount + 1` across partitions recovers the absolute column id.
//! Segments are ordered by ascending row inside their partition, and an
//! empty partition never exists on disk: deleting the last segment removes
//! the partition and folds its gap into the following header.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::Error;
use crate::limits::{
    COLUMN_POSITION_MAX, MAX_CHAR_LENGTH, MAX_VECTOR_DIM, PARTITION_AND_SEGMENT, PARTITION_SIZE,
    ROW_POSITION_MAX, SEGMENT_SIZE, SHIFT_BLOCK,
};
use crate::stream::WorkingStream;
use crate::types::{SegmentTag, Value};

/// The container state a handle operates on: the working stream, the
/// logical file size, and the open-mode flags.
pub(crate) struct Container {
    pub stream: WorkingStream,
    pub size: u64,
    pub read_only: bool,
    pub unsafe_mode: bool,
    pub dirty: bool,
}

impl Container {
    fn read_u8_at(&mut self, offset: u64) -> Result<u8, Error> {
        let mut b = [0u8; 1];
        self.stream.read_exact_at(offset, &mut b)?;
        Ok(b[0])
    }

    fn read_u16_at(&mut self, offset: u64) -> Result<u16, Error> {
        let mut b = [0u8; 2];
        self.stream.read_exact_at(offset, &mut b)?;
        Ok(u16::from_le_bytes(b))
    }

    fn read_i32_at(&mut self, offset: u64) -> Result<i32, Error> {
        let mut b = [0u8; 4];
        self.stream.read_exact_at(offset, &mut b)?;
        Ok(i32::from_le_bytes(b))
    }

    fn read_f32_at(&mut self, offset: u64) -> Result<f32, Error> {
        let mut b = [0u8; 4];
        self.stream.read_exact_at(offset, &mut b)?;
        Ok(f32::from_le_bytes(b))
    }

    fn write_u16_at(&mut self, offset: u64, value: u16) -> Result<(), Error> {
        self.stream.write_all_at(offset, &value.to_le_bytes())
    }
}

/// Validates a `(column, row)` pair against the sizing mode. Oversize
/// (`unsafe`) handles skip the column bound; the row bound always applies
/// since rows are stored as `u16`.
pub(crate) fn check_coords(cont: &Container, column: u64, row: u64) -> Result<(), Error> {
    if column == 0 || row == 0 {
        return Err(Error::Range(String::from(
            "column and row positions start at 1",
        )));
    }
    if !cont.unsafe_mode && column - 1 > COLUMN_POSITION_MAX {
        return Err(Error::Range(format!(
            "column {} exceeds the sizing-mode maximum",
            column
        )));
    }
    if row - 1 > ROW_POSITION_MAX {
        return Err(Error::Range(format!(
            "row {} exceeds the sizing-mode maximum",
            row
        )));
    }
    Ok(())
}

/// One stored segment, as seen by a forward scan.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SegmentRef {
    /// Absolute column id (1-based).
    pub column: u64,
    /// 1-based row id.
    pub row: u64,
    pub tag: SegmentTag,
    /// Offset of the segment header.
    pub start: u64,
    /// Offset of the first byte after the tag.
    pub body_offset: u64,
    /// Bytes following the tag, including any length prefix.
    pub body_len: u64,
    /// One past the last payload byte.
    pub end: u64,
}

impl SegmentRef {
    /// Dimensionality of a vector segment.
    pub fn vector_dims(&self) -> u16 {
        ((self.body_len - 2) / 4) as u16
    }

    /// Stored length of a string segment (excluding the trailing NUL).
    pub fn char_len(&self) -> u64 {
        self.body_len - 3
    }
}

fn measure_body(cont: &mut Container, tag: SegmentTag, body_offset: u64) -> Result<u64, Error> {
    match tag {
        SegmentTag::Int | SegmentTag::Float => Ok(4),
        SegmentTag::BoolTrue | SegmentTag::BoolFalse => Ok(0),
        SegmentTag::Char => {
            let stored_len = cont.read_u16_at(body_offset)? as u64;
            if stored_len + 1 > MAX_CHAR_LENGTH {
                return Err(Error::Corrupt(format!(
                    "stored string length {} exceeds the maximum",
                    stored_len
                )));
            }
            Ok(2 + stored_len + 1)
        }
        SegmentTag::Vector => {
            let dims = cont.read_u16_at(body_offset)?;
            if dims == 0 || dims > MAX_VECTOR_DIM {
                return Err(Error::Corrupt(format!(
                    "stored vector dimensionality {} out of range",
                    dims
                )));
            }
            Ok(2 + dims as u64 * 4)
        }
    }
}

/// A single forward pass over every segment in the file.
///
/// All readers (cell extraction, the filter evaluator, the kNN scorer and
/// the next-row probe) share this walk; none of them ever seeks backwards.
pub(crate) struct ScanCursor<'a> {
    cont: &'a mut Container,
    offset: u64,
    column: u64,
    rows_left: u32,
}

impl<'a> ScanCursor<'a> {
    pub fn new(cont: &'a mut Container) -> ScanCursor<'a> {
        ScanCursor {
            cont,
            offset: 0,
            column: 0,
            rows_left: 0,
        }
    }

    /// Advances to the next segment, or `None` at a clean end of file.
    pub fn next(&mut self) -> Result<Option<SegmentRef>, Error> {
        if self.rows_left == 0 {
            if self.offset == self.cont.size {
                return Ok(None);
            }
            if self.offset + PARTITION_AND_SEGMENT > self.cont.size {
                return Err(Error::Corrupt(String::from("truncated partition header")));
            }
            let skip_amount = self.cont.read_u16_at(self.offset)?;
            self.column += skip_amount as u64 + 1;
            if !self.cont.unsafe_mode && self.column - 1 > COLUMN_POSITION_MAX {
                return Err(Error::Range(String::from(
                    "stored column id exceeds the sizing-mode maximum",
                )));
            }
            let row_count_minus_one = self.cont.read_u16_at(self.offset + 2)?;
            if row_count_minus_one as u64 > ROW_POSITION_MAX {
                return Err(Error::Range(String::from(
                    "stored row count exceeds the sizing-mode maximum",
                )));
            }
            self.rows_left = row_count_minus_one as u32 + 1;
            self.offset += PARTITION_SIZE;
        }

        if self.offset + SEGMENT_SIZE > self.cont.size {
            return Err(Error::Corrupt(String::from("truncated segment header")));
        }
        let row_position = self.cont.read_u16_at(self.offset)?;
        if row_position as u64 > ROW_POSITION_MAX {
            return Err(Error::Range(String::from(
                "stored row position exceeds the sizing-mode maximum",
            )));
        }
        let tag = SegmentTag::try_from(self.cont.read_u8_at(self.offset + 2)?)?;
        let body_offset = self.offset + SEGMENT_SIZE;
        let body_len = measure_body(self.cont, tag, body_offset)?;
        let end = body_offset + body_len;
        if end > self.cont.size {
            return Err(Error::Corrupt(String::from(
                "segment payload extends past the end of the file",
            )));
        }

        let seg = SegmentRef {
            column: self.column,
            row: row_position as u64 + 1,
            tag,
            start: self.offset,
            body_offset,
            body_len,
            end,
        };
        self.offset = end;
        self.rows_left -= 1;
        Ok(Some(seg))
    }

    pub fn read_i32(&mut self, seg: &SegmentRef) -> Result<i32, Error> {
        self.cont.read_i32_at(seg.body_offset)
    }

    pub fn read_f32(&mut self, seg: &SegmentRef) -> Result<f32, Error> {
        self.cont.read_f32_at(seg.body_offset)
    }

    /// Reads a string segment's bytes, excluding the trailing NUL.
    pub fn read_char_bytes(&mut self, seg: &SegmentRef) -> Result<Vec<u8>, Error> {
        let mut bytes = vec![0u8; seg.char_len() as usize];
        self.cont.stream.read_exact_at(seg.body_offset + 2, &mut bytes)?;
        Ok(bytes)
    }

    /// Reads a vector segment's components into `out`, reusing its
    /// allocation across candidates.
    pub fn read_vector_into(
        &mut self,
        seg: &SegmentRef,
        raw: &mut Vec<u8>,
        out: &mut Vec<f32>,
    ) -> Result<(), Error> {
        let dims = seg.vector_dims() as usize;
        raw.resize(dims * 4, 0);
        self.cont.stream.read_exact_at(seg.body_offset + 2, raw)?;
        out.resize(dims, 0.0);
        LittleEndian::read_f32_into(raw, out);
        Ok(())
    }
}

fn decode_value(cont: &mut Container, seg: &SegmentRef) -> Result<Value, Error> {
    match seg.tag {
        SegmentTag::Int => Ok(Value::Int(cont.read_i32_at(seg.body_offset)?)),
        SegmentTag::Float => Ok(Value::Float(cont.read_f32_at(seg.body_offset)?)),
        SegmentTag::BoolTrue => Ok(Value::Bool(true)),
        SegmentTag::BoolFalse => Ok(Value::Bool(false)),
        SegmentTag::Char => {
            let stored_len = seg.char_len() as usize;
            if stored_len == 0 {
                return Err(Error::Corrupt(String::from("empty string payload")));
            }
            let mut bytes = vec![0u8; stored_len + 1];
            cont.stream.read_exact_at(seg.body_offset + 2, &mut bytes)?;
            if bytes[stored_len] != 0 {
                return Err(Error::Corrupt(String::from(
                    "string payload is not NUL terminated",
                )));
            }
            bytes.truncate(stored_len);
            let text = String::from_utf8(bytes)
                .map_err(|_| Error::Corrupt(String::from("string payload is not valid UTF-8")))?;
            Ok(Value::Char(text))
        }
        SegmentTag::Vector => {
            let dims = seg.vector_dims() as usize;
            let mut raw = vec![0u8; dims * 4];
            cont.stream.read_exact_at(seg.body_offset + 2, &mut raw)?;
            let mut components = vec![0.0f32; dims];
            LittleEndian::read_f32_into(&raw, &mut components);
            Ok(Value::Vector(components))
        }
    }
}

/// Reads the cell at `(column, row)`.
///
/// Returns `Some(value)` when the cell exists, `None` when it has never
/// been written (or was deleted). The scan walks partitions forward and
/// stops as soon as the running column id or the row order passes the
/// target.
pub(crate) fn read_at(cont: &mut Container, column: u64, row: u64) -> Result<Option<Value>, Error> {
    check_coords(cont, column, row)?;

    let found = {
        let mut cursor = ScanCursor::new(cont);
        loop {
            match cursor.next()? {
                None => break None,
                Some(seg) => {
                    if seg.column > column || (seg.column == column && seg.row > row) {
                        break None;
                    }
                    if seg.column == column && seg.row == row {
                        break Some(seg);
                    }
                }
            }
        }
    };

    match found {
        None => Ok(None),
        Some(seg) => decode_value(cont, &seg).map(Some),
    }
}

/// Returns the smallest unused row id in `column`: `max_row + 1`, or 1 when
/// the column holds no cells.
pub(crate) fn column_next_row(cont: &mut Container, column: u64) -> Result<u64, Error> {
    if column == 0 {
        return Err(Error::Range(String::from("column positions start at 1")));
    }
    if !cont.unsafe_mode && column - 1 > COLUMN_POSITION_MAX {
        return Err(Error::Range(format!(
            "column {} exceeds the sizing-mode maximum",
            column
        )));
    }

    let mut max_row = 0u64;
    let mut cursor = ScanCursor::new(cont);
    while let Some(seg) = cursor.next()? {
        if seg.column > column {
            break;
        }
        if seg.column == column && seg.row > max_row {
            max_row = seg.row;
        }
    }
    Ok(max_row + 1)
}

struct SegmentSlot {
    start: u64,
    body_len: u64,
    end: u64,
}

struct PartitionState {
    header: u64,
    skip_amount: u16,
    row_count: u32,
    end: u64,
    segment: Option<SegmentSlot>,
    seg_insert: u64,
}

struct Located {
    prev_end: u64,
    prev_column: u64,
    partition: Option<PartitionState>,
    next_header: Option<(u64, u16)>,
}

fn segment_span(cont: &mut Container, offset: u64) -> Result<(u16, u64), Error> {
    if offset + SEGMENT_SIZE > cont.size {
        return Err(Error::Corrupt(String::from("truncated segment header")));
    }
    let row_position = cont.read_u16_at(offset)?;
    let tag = SegmentTag::try_from(cont.read_u8_at(offset + 2)?)?;
    let body_len = measure_body(cont, tag, offset + SEGMENT_SIZE)?;
    let end = offset + SEGMENT_SIZE + body_len;
    if end > cont.size {
        return Err(Error::Corrupt(String::from(
            "segment payload extends past the end of the file",
        )));
    }
    Ok((row_position, end))
}

fn locate(cont: &mut Container, column: u64, row: u64) -> Result<Located, Error> {
    let mut pos = 0u64;
    let mut running_column = 0u64;
    let mut prev_end = 0u64;
    let mut prev_column = 0u64;
    let mut partition = None;
    let mut next_header = None;

    while pos < cont.size {
        if pos + PARTITION_AND_SEGMENT > cont.size {
            return Err(Error::Corrupt(String::from("truncated partition header")));
        }
        let skip_amount = cont.read_u16_at(pos)?;
        running_column += skip_amount as u64 + 1;
        if !cont.unsafe_mode && running_column - 1 > COLUMN_POSITION_MAX {
            return Err(Error::Range(String::from(
                "stored column id exceeds the sizing-mode maximum",
            )));
        }
        let row_count_minus_one = cont.read_u16_at(pos + 2)?;
        if row_count_minus_one as u64 > ROW_POSITION_MAX {
            return Err(Error::Range(String::from(
                "stored row count exceeds the sizing-mode maximum",
            )));
        }
        let row_count = row_count_minus_one as u32 + 1;

        if running_column > column {
            next_header = Some((pos, skip_amount));
            break;
        }

        let mut seg_pos = pos + PARTITION_SIZE;
        if running_column == column {
            let mut segment = None;
            let mut seg_insert = None;
            for _ in 0..row_count {
                let (row_position, end) = segment_span(cont, seg_pos)?;
                let seg_row = row_position as u64 + 1;
                if seg_row == row {
                    segment = Some(SegmentSlot {
                        start: seg_pos,
                        body_len: end - seg_pos - SEGMENT_SIZE,
                        end,
                    });
                } else if seg_row > row && seg_insert.is_none() {
                    seg_insert = Some(seg_pos);
                }
                seg_pos = end;
            }
            if seg_pos < cont.size {
                let following_skip = cont.read_u16_at(seg_pos)?;
                next_header = Some((seg_pos, following_skip));
            }
            partition = Some(PartitionState {
                header: pos,
                skip_amount,
                row_count,
                end: seg_pos,
                segment,
                seg_insert: seg_insert.unwrap_or(seg_pos),
            });
            break;
        }

        for _ in 0..row_count {
            let (_, end) = segment_span(cont, seg_pos)?;
            seg_pos = end;
        }
        prev_end = seg_pos;
        prev_column = running_column;
        pos = seg_pos;
    }

    Ok(Located {
        prev_end,
        prev_column,
        partition,
        next_header,
    })
}

fn encode_segment(row_position: u16, value: &Value) -> Vec<u8> {
    debug_assert!(!value.is_null());
    let mut buf = Vec::with_capacity(value.segment_len() as usize);
    buf.extend_from_slice(&row_position.to_le_bytes());
    match value {
        Value::Null => {}
        Value::Int(v) => {
            buf.push(SegmentTag::Int as u8);
            buf.extend_from_slice(&v.to_le_bytes());
        }
        Value::Float(v) => {
            buf.push(SegmentTag::Float as u8);
            buf.extend_from_slice(&v.to_le_bytes());
        }
        Value::Bool(true) => buf.push(SegmentTag::BoolTrue as u8),
        Value::Bool(false) => buf.push(SegmentTag::BoolFalse as u8),
        Value::Char(s) => {
            buf.push(SegmentTag::Char as u8);
            buf.extend_from_slice(&(s.len() as u16).to_le_bytes());
            buf.extend_from_slice(s.as_bytes());
            buf.push(0);
        }
        Value::Vector(v) => {
            buf.push(SegmentTag::Vector as u8);
            buf.extend_from_slice(&(v.len() as u16).to_le_bytes());
            for component in v {
                buf.extend_from_slice(&component.to_le_bytes());
            }
        }
    }
    buf
}

/// Moves the byte range `[from, size)` by `delta` bytes, block-buffered and
/// safe under overlap: tail-first when growing, head-first when shrinking.
fn shift_tail(cont: &mut Container, from: u64, delta: i64) -> Result<(), Error> {
    if delta == 0 || from >= cont.size {
        return Ok(());
    }
    let mut buf = [0u8; SHIFT_BLOCK];
    if delta > 0 {
        let d = delta as u64;
        let mut pos = cont.size;
        while pos > from {
            let chunk = (pos - from).min(SHIFT_BLOCK as u64) as usize;
            pos -= chunk as u64;
            cont.stream.read_exact_at(pos, &mut buf[..chunk])?;
            cont.stream.write_all_at(pos + d, &buf[..chunk])?;
        }
    } else {
        let d = (-delta) as u64;
        let mut pos = from;
        while pos < cont.size {
            let chunk = (cont.size - pos).min(SHIFT_BLOCK as u64) as usize;
            cont.stream.read_exact_at(pos, &mut buf[..chunk])?;
            cont.stream.write_all_at(pos - d, &buf[..chunk])?;
            pos += chunk as u64;
        }
    }
    Ok(())
}

fn delete_segment(cont: &mut Container, located: Located) -> Result<(), Error> {
    let partition = match located.partition {
        Some(p) => p,
        // Deleting an absent cell is a no-op.
        None => return Ok(()),
    };
    let segment = match partition.segment {
        Some(s) => s,
        None => return Ok(()),
    };

    if partition.row_count > 1 {
        let removed = segment.end - segment.start;
        shift_tail(cont, segment.end, -(removed as i64))?;
        cont.size -= removed;
        cont.stream.truncate(cont.size)?;
        cont.write_u16_at(partition.header + 2, (partition.row_count - 2) as u16)?;
    } else {
        // Last segment: the partition goes with it, and its gap is folded
        // into the following partition's skip amount.
        let removed = partition.end - partition.header;
        let next_skip = match located.next_header {
            Some((_, next_skip)) => {
                let folded = next_skip as u64 + partition.skip_amount as u64 + 1;
                if folded > u16::MAX as u64 {
                    return Err(Error::Range(String::from(
                        "column gap not representable after partition removal",
                    )));
                }
                Some(folded as u16)
            }
            None => None,
        };
        shift_tail(cont, partition.end, -(removed as i64))?;
        cont.size -= removed;
        cont.stream.truncate(cont.size)?;
        if let Some(skip) = next_skip {
            cont.write_u16_at(partition.header, skip)?;
        }
    }
    cont.dirty = true;
    Ok(())
}

/// Writes `value` at `(column, row)`, consuming the staged value semantics:
/// a null value deletes the cell, a non-null value inserts or updates it in
/// place, shifting the file tail when the payload size changes.
pub(crate) fn insert_at(
    cont: &mut Container,
    column: u64,
    row: u64,
    value: &Value,
) -> Result<(), Error> {
    if cont.read_only {
        return Err(Error::ReadOnly);
    }
    check_coords(cont, column, row)?;

    let located = locate(cont, column, row)?;

    if value.is_null() {
        return delete_segment(cont, located);
    }

    let row_position = (row - 1) as u16;
    match located.partition {
        Some(partition) => match partition.segment {
            Some(segment) => {
                // In-place update.
                let encoded = encode_segment(row_position, value);
                let new_body = value.body_len();
                if new_body != segment.body_len {
                    let delta = new_body as i64 - segment.body_len as i64;
                    shift_tail(cont, segment.end, delta)?;
                    if delta < 0 {
                        cont.size -= (-delta) as u64;
                        cont.stream.truncate(cont.size)?;
                    } else {
                        cont.size += delta as u64;
                    }
                }
                cont.stream.write_all_at(segment.start + 2, &encoded[2..])?;
            }
            None => {
                // New segment in an existing partition, in row order.
                let encoded = encode_segment(row_position, value);
                let target = partition.seg_insert;
                shift_tail(cont, target, encoded.len() as i64)?;
                cont.size += encoded.len() as u64;
                cont.stream.write_all_at(target, &encoded)?;
                cont.write_u16_at(partition.header + 2, partition.row_count as u16)?;
            }
        },
        None => {
            // New partition, spliced into column order.
            let gap = column - located.prev_column - 1;
            if gap > u16::MAX as u64 {
                return Err(Error::Range(String::from(
                    "column gap exceeds the representable skip amount",
                )));
            }
            let skip_amount = gap as u16;

            let next_fix = match located.next_header {
                Some((_, next_skip)) => {
                    let reduced = (next_skip as u64)
                        .checked_sub(skip_amount as u64 + 1)
                        .ok_or_else(|| {
                            Error::Corrupt(String::from(
                                "following partition's skip amount is inconsistent",
                            ))
                        })?;
                    Some(reduced as u16)
                }
                None => None,
            };

            let segment = encode_segment(row_position, value);
            let mut encoded = Vec::with_capacity(PARTITION_SIZE as usize + segment.len());
            encoded.extend_from_slice(&skip_amount.to_le_bytes());
            encoded.extend_from_slice(&0u16.to_le_bytes());
            encoded.extend_from_slice(&segment);

            let target = located.prev_end;
            shift_tail(cont, target, encoded.len() as i64)?;
            cont.size += encoded.len() as u64;
            cont.stream.write_all_at(target, &encoded)?;
            if let Some(skip) = next_fix {
                cont.write_u16_at(target + encoded.len() as u64, skip)?;
            }
        }
    }

    cont.dirty = true;
    Ok(())
}
