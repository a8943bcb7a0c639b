use std::io;

use crate::error::Error;

pub mod enums;
pub mod value;

pub use enums::{SegmentTag, ValueKind};
pub use value::Value;

/// A trait for types that can be deserialized from a stream.
///
/// Types implementing this trait describe how to populate themselves from a
/// reader (a file, an anonymous working stream, or an in-memory cursor).
/// Use the [`from_stream`] helper to read a fresh instance.
///
/// # Example
/// ```
/// use std::io;
/// use idydb::error::Error;
/// use idydb::types::FromStream;
///
/// #[derive(Default)]
/// struct Header {
///     version: u32,
/// }
///
/// impl FromStream for Header {
///     fn read_from<R>(&mut self, reader: &mut R) -> Result<(), Error>
///     where
///         R: io::Read + io::Seek,
///     {
///         use byteorder::{LittleEndian, ReadBytesExt};
///         self.version = reader.read_u32::<LittleEndian>()?;
///         Ok(())
///     }
/// }
/// ```
pub trait FromStream {
    /// Reads data from a stream and populates the fields of the type.
    ///
    /// # Parameters
    /// - `reader`: A mutable reference to the reader from which the data
    ///   will be read.
    ///
    /// # Returns
    /// - `Ok(())`: If the data is successfully read.
    /// - `Err(Error)`: If an error occurs while reading from the stream.
    fn read_from<R>(&mut self, reader: &mut R) -> Result<(), Error>
    where
        R: io::Read + io::Seek;
}

/// Reads a value of type `T` from a stream.
///
/// `T` must implement [`FromStream`] to define how it is decoded, and
/// `Default` to create the instance being populated.
pub fn from_stream<R, T>(reader: &mut R) -> Result<T, Error>
where
    R: io::Read + io::Seek,
    T: FromStream + Default,
{
    let mut obj = T::default();
    obj.read_from(reader)?;
    Ok(obj)
}

/// A trait for types with a fixed serialized size.
pub trait BinarySize {
    /// Returns the binary size of the type in bytes.
    fn binary_size() -> usize;
}

/// A trait for types that can be serialized to a stream.
pub trait ToStream {
    /// Writes the type's data to a stream.
    ///
    /// # Parameters
    /// - `writer`: A mutable reference to a writer implementing `io::Write`
    ///   and `io::Seek`.
    ///
    /// # Returns
    /// - `Ok(())`: If the data is successfully written to the stream.
    /// - `Err(Error)`: If an error occurs while writing to the stream.
    fn write_to<W>(&self, writer: &mut W) -> Result<(), Error>
    where
        W: io::Write + io::Seek;
}

/// Serializes an object into a vector of bytes.
pub fn to_bytes<T>(obj: &T) -> Result<Vec<u8>, Error>
where
    T: ToStream,
{
    let mut buf = Vec::new();
    let mut cursor = io::Cursor::new(&mut buf);
    obj.write_to(&mut cursor)?;
    Ok(buf)
}

/// Serializes an object into a vector of bytes with an exact capacity.
///
/// The object must implement both [`ToStream`] and [`BinarySize`] so the
/// buffer can be allocated up front.
pub fn to_bytes_with_capacity<T>(obj: &T) -> Result<Vec<u8>, Error>
where
    T: ToStream + BinarySize,
{
    let mut buf = Vec::with_capacity(T::binary_size());
    let mut cursor = io::Cursor::new(&mut buf);
    obj.write_to(&mut cursor)?;
    Ok(buf)
}
