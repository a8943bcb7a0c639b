use crate::error::Error;

/// On-disk segment type tags.
///
/// Every segment carries one of these in the byte following its
/// `row_position` field. Booleans encode their value in the tag itself, so
/// `true` and `false` cells have no payload at all.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum SegmentTag {
    Int = 1,
    Float = 2,
    Char = 3,
    BoolTrue = 4,
    BoolFalse = 5,
    Vector = 6,
}

impl TryFrom<u8> for SegmentTag {
    type Error = Error;

    /// Attempts to convert a raw tag byte into a [`SegmentTag`].
    ///
    /// # Returns
    /// - `SegmentTag`: A valid tag if the byte matches.
    /// - `Error::Corrupt`: If the byte does not name a known segment type.
    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(SegmentTag::Int),
            2 => Ok(SegmentTag::Float),
            3 => Ok(SegmentTag::Char),
            4 => Ok(SegmentTag::BoolTrue),
            5 => Ok(SegmentTag::BoolFalse),
            6 => Ok(SegmentTag::Vector),
            _ => Err(Error::Corrupt(format!("invalid segment type tag: {}", value))),
        }
    }
}

/// The kind of value a cell (or the staged value register) holds.
///
/// `Null` stands both for a cell that has never been written and for one
/// that has been deleted; the other kinds map one-to-one onto the stored
/// payload forms.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ValueKind {
    Null,
    Int,
    Float,
    Char,
    Bool,
    Vector,
}
