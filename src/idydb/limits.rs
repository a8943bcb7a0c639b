//! Sizing-mode limits and structural constants of the on-disk format.
//!
//! The column/row domain is selected at build time through the
//! `sizing-tiny` / `sizing-small` / `sizing-big` cargo features. When more
//! than one feature is enabled the smallest domain wins. Only `sizing-big`
//! permits the oversize (`unsafe`) open flag.

#[cfg(not(any(feature = "sizing-tiny", feature = "sizing-small", feature = "sizing-big")))]
compile_error!("one of the sizing-tiny / sizing-small / sizing-big features must be enabled");

/// Largest addressable column id minus one (columns are 1-based).
#[cfg(feature = "sizing-tiny")]
pub const COLUMN_POSITION_MAX: u64 = 0x000F;
#[cfg(all(feature = "sizing-small", not(feature = "sizing-tiny")))]
pub const COLUMN_POSITION_MAX: u64 = 0x00FF;
#[cfg(all(
    feature = "sizing-big",
    not(any(feature = "sizing-tiny", feature = "sizing-small"))
))]
pub const COLUMN_POSITION_MAX: u64 = 0xFFFF;

/// Largest addressable row id minus one (rows are 1-based).
#[cfg(feature = "sizing-tiny")]
pub const ROW_POSITION_MAX: u64 = 0x000F;
#[cfg(all(feature = "sizing-small", not(feature = "sizing-tiny")))]
pub const ROW_POSITION_MAX: u64 = 0x00FF;
#[cfg(all(
    feature = "sizing-big",
    not(any(feature = "sizing-tiny", feature = "sizing-small"))
))]
pub const ROW_POSITION_MAX: u64 = 0xFFFF;

/// Whether the oversize (`unsafe`) open flag is available in this build.
#[cfg(all(
    feature = "sizing-big",
    not(any(feature = "sizing-tiny", feature = "sizing-small"))
))]
pub const UNSAFE_ALLOWED: bool = true;
#[cfg(any(feature = "sizing-tiny", feature = "sizing-small"))]
pub const UNSAFE_ALLOWED: bool = false;

/// Partition header size: `skip_amount: u16` + `row_count_minus_one: u16`.
pub const PARTITION_SIZE: u64 = 4;

/// Segment header size: `row_position: u16` + `type_tag: u8`.
pub const SEGMENT_SIZE: u64 = 3;

/// A partition header immediately followed by its first segment header.
pub const PARTITION_AND_SEGMENT: u64 = PARTITION_SIZE + SEGMENT_SIZE;

/// Upper bound on the stored form of a string: `stored_len + 1` (the
/// NUL-terminated payload) must not exceed this.
pub const MAX_CHAR_LENGTH: u64 = 0xFFFF - 2;

/// Upper bound on vector dimensionality.
pub const MAX_VECTOR_DIM: u16 = 16_383;

/// Working block for buffered structural shifts.
pub const SHIFT_BLOCK: usize = 1024;

/// Largest backing file a read-only open will try to memory map.
pub const MMAP_MAX_SIZE: u64 = 0x140_0000;

/// Largest plaintext file the selected sizing mode accepts without the
/// oversize flag: every cell holding a maximum-length string, plus all
/// partition and segment headers.
pub const fn max_file_size() -> u64 {
    let cells = COLUMN_POSITION_MAX * ROW_POSITION_MAX * (MAX_CHAR_LENGTH - 1);
    let segment_headers = if ROW_POSITION_MAX > 1 {
        COLUMN_POSITION_MAX * ROW_POSITION_MAX * SEGMENT_SIZE
    } else {
        0
    };
    cells + segment_headers + COLUMN_POSITION_MAX * PARTITION_AND_SEGMENT
}
