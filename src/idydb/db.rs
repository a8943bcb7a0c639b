//! The database handle: open options, lifecycle, and the cell-level API.

use log::debug;
use std::fs::File;
use std::io::{Seek, SeekFrom};
use std::path::Path;

use crate::container::{self, Container};
use crate::envelope::{self, EnvelopeSecrets};
use crate::error::Error;
use crate::filter::Filter;
use crate::knn::{self, KnnResult, Metric};
use crate::limits::{max_file_size, MAX_CHAR_LENGTH, MAX_VECTOR_DIM, UNSAFE_ALLOWED};
use crate::rag::Embedder;
use crate::stream::{self, SecureStreamKind, WorkingStream};
use crate::types::{Value, ValueKind};
use crate::util;
use zeroize::Zeroizing;

/// The version magic reported by [`version_check`].
pub const VERSION_MAGIC: u32 = 0x117EE;

/// Returns the version magic of the IdyDB API: `0x117EE`.
pub fn version_check() -> u32 {
    VERSION_MAGIC
}

/// Outcome of a successful [`IdyDb::extract`]: the cell either exists
/// (`Done`, the staged value register is filled) or has never been written
/// (`Null`).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    Done,
    Null,
}

/// Options controlling how a database file is opened.
///
/// Follows the `std::fs::OpenOptions` builder shape:
///
/// ```no_run
/// use idydb::db::OpenOptions;
///
/// let mut db = OpenOptions::new()
///     .create(true)
///     .open("notes.idy")
///     .unwrap();
/// db.insert_int(1, 1, 42).unwrap();
/// db.close().unwrap();
/// ```
// No Debug derive: the passphrase must not leak through formatting.
#[derive(Clone, Default)]
pub struct OpenOptions {
    create: bool,
    read_only: bool,
    oversize: bool,
    encrypted: bool,
    passphrase: Option<String>,
    pbkdf2_iter: u32,
}

impl OpenOptions {
    pub fn new() -> OpenOptions {
        OpenOptions::default()
    }

    /// Create the database file when it does not exist.
    pub fn create(&mut self, create: bool) -> &mut OpenOptions {
        self.create = create;
        self
    }

    /// Open without write access. Read-only handles take a shared lock, so
    /// any number of them may coexist; they refuse every mutation with
    /// [`Error::ReadOnly`].
    pub fn read_only(&mut self, read_only: bool) -> &mut OpenOptions {
        self.read_only = read_only;
        self
    }

    /// Permit files (and column ids) beyond the sizing-mode bound. Only
    /// available in `sizing-big` builds.
    pub fn allow_oversize(&mut self, oversize: bool) -> &mut OpenOptions {
        self.oversize = oversize;
        self
    }

    /// Enable encryption at rest with the given passphrase.
    ///
    /// The backing file is held as an AES-256-GCM envelope; all reads and
    /// writes go through an anonymous in-memory working stream that is
    /// re-encrypted into the backing file when the handle closes.
    pub fn encrypted(&mut self, passphrase: &str) -> &mut OpenOptions {
        self.encrypted = true;
        self.passphrase = Some(passphrase.to_string());
        self
    }

    /// Override the PBKDF2 iteration count used when creating or migrating
    /// an encrypted database. `0` selects the default; anything outside
    /// `[10_000, 5_000_000]` is rejected at open time. Existing encrypted
    /// files keep the iteration count recorded in their header.
    pub fn pbkdf2_iter(&mut self, iter: u32) -> &mut OpenOptions {
        self.pbkdf2_iter = iter;
        self
    }

    /// Opens the database at `path` with these options.
    pub fn open<P: AsRef<Path>>(&self, path: P) -> Result<IdyDb, Error> {
        IdyDb::open_with_options(path.as_ref(), self)
    }
}

/// An open IdyDB database.
///
/// The handle owns the working stream, the staged value register, the
/// last-error slot and, for encrypted databases, the backing file and the
/// derived key (wiped when the handle drops). All operations are
/// synchronous and strictly serial; the handle is not `Sync` and callers
/// wanting cross-thread use must serialize externally.
pub struct IdyDb {
    pub(crate) cont: Container,
    pub(crate) staged: Value,
    pub(crate) last_error: String,
    pub(crate) embedder: Option<Embedder>,
    backing: Option<File>,
    secrets: Option<EnvelopeSecrets>,
    plain_kind: Option<SecureStreamKind>,
}

impl IdyDb {
    /// Opens an existing plaintext database read-write. Use
    /// [`OpenOptions`] for anything more.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<IdyDb, Error> {
        OpenOptions::new().open(path)
    }

    /// Opens (creating if missing) an encrypted database read-write.
    pub fn open_encrypted<P: AsRef<Path>>(path: P, passphrase: &str) -> Result<IdyDb, Error> {
        OpenOptions::new().create(true).encrypted(passphrase).open(path)
    }

    fn open_with_options(path: &Path, options: &OpenOptions) -> Result<IdyDb, Error> {
        if options.oversize && !UNSAFE_ALLOWED {
            return Err(Error::InvalidState(String::from(
                "oversize opens require a sizing-big build",
            )));
        }
        if options.encrypted {
            IdyDb::open_encrypted_impl(path, options)
        } else {
            IdyDb::open_plain(path, options)
        }
    }

    fn open_plain(path: &Path, options: &OpenOptions) -> Result<IdyDb, Error> {
        let file = stream::open_backing(path, options.create && !options.read_only, options.read_only)?;
        stream::lock_backing(&file, options.read_only)?;
        let size = file.metadata()?.len();
        if !options.oversize && size > max_file_size() {
            return Err(Error::Range(format!(
                "file size {} exceeds the sizing-mode maximum",
                size
            )));
        }

        let working = if options.read_only {
            WorkingStream::new_read_only(file, size)
        } else {
            WorkingStream::new(file)
        };
        debug!(
            "opened plaintext db file={:?} read_only={} mapped={} size={}",
            path,
            options.read_only,
            working.is_mapped(),
            size
        );

        Ok(IdyDb {
            cont: Container {
                stream: working,
                size,
                read_only: options.read_only,
                unsafe_mode: options.oversize,
                dirty: false,
            },
            staged: Value::Null,
            last_error: String::new(),
            embedder: None,
            backing: None,
            secrets: None,
            plain_kind: None,
        })
    }

    fn open_encrypted_impl(path: &Path, options: &OpenOptions) -> Result<IdyDb, Error> {
        let passphrase = options
            .passphrase
            .as_deref()
            .ok_or(Error::MissingPassphrase)?;

        let mut backing =
            stream::open_backing(path, options.create && !options.read_only, options.read_only)?;
        stream::lock_backing(&backing, options.read_only)?;

        let (mut plain, kind) = stream::secure_plain_stream()?;
        let backing_len = backing.metadata()?.len();
        let is_encrypted = envelope::file_is_encrypted(&mut backing)?;

        let mut dirty = false;
        let secrets = if is_encrypted {
            let secrets = envelope::decrypt_backing_to_stream(&mut backing, passphrase, &mut plain)?;
            debug!(
                "encrypted container decrypted: pbkdf2_iter={} working={}",
                secrets.pbkdf2_iter, kind
            );
            secrets
        } else {
            if options.read_only && backing_len > 0 {
                return Err(Error::MigrationRequired);
            }
            if backing_len > 0 {
                debug!("plaintext backing detected; migrating into working stream");
                backing.seek(SeekFrom::Start(0))?;
                std::io::copy(&mut backing, &mut plain)?;
                plain.seek(SeekFrom::Start(0))?;
                backing.seek(SeekFrom::Start(0))?;
            }
            let iter = if options.pbkdf2_iter == 0 {
                util::PBKDF2_DEFAULT_ITER
            } else {
                options.pbkdf2_iter
            };
            let salt = util::random_array::<{ envelope::SALT_LEN }>()?;
            let key = Zeroizing::new(util::derive_key(passphrase, &salt, iter)?);
            if !options.read_only {
                dirty = true;
            }
            EnvelopeSecrets {
                salt,
                pbkdf2_iter: iter,
                key,
            }
        };

        let size = plain.seek(SeekFrom::End(0))?;
        plain.seek(SeekFrom::Start(0))?;
        if !options.oversize && size > max_file_size() {
            return Err(Error::Range(format!(
                "decrypted size {} exceeds the sizing-mode maximum",
                size
            )));
        }
        debug!(
            "encrypted db ready: backing={:?} read_only={} dirty={} working={} size={}",
            path, options.read_only, dirty, kind, size
        );

        Ok(IdyDb {
            cont: Container {
                stream: WorkingStream::new(plain),
                size,
                read_only: options.read_only,
                unsafe_mode: options.oversize,
                dirty,
            },
            staged: Value::Null,
            last_error: String::new(),
            embedder: None,
            backing: Some(backing),
            secrets: Some(secrets),
            plain_kind: Some(kind),
        })
    }

    pub(crate) fn record<T>(&mut self, result: Result<T, Error>) -> Result<T, Error> {
        if let Err(err) = &result {
            self.last_error = err.to_string();
        }
        result
    }

    fn clear_values(&mut self) {
        self.staged = Value::Null;
    }

    /// Returns the last error message recorded by a failing call. The
    /// content is undefined after a successful call; check return values
    /// first.
    pub fn errmsg(&self) -> &str {
        &self.last_error
    }

    /// Logical size of the container in bytes (the plaintext size for
    /// encrypted databases).
    pub fn size(&self) -> u64 {
        self.cont.size
    }

    /// Whether the handle refuses mutations.
    pub fn is_read_only(&self) -> bool {
        self.cont.read_only
    }

    /// Whether the handle is encrypted at rest.
    pub fn is_encrypted(&self) -> bool {
        self.secrets.is_some()
    }

    /// The kind of anonymous storage backing the plaintext working stream
    /// of an encrypted handle, for diagnostics.
    pub fn plain_storage_kind(&self) -> Option<SecureStreamKind> {
        self.plain_kind
    }

    /// Extracts the cell at `(column, row)` into the staged value register.
    ///
    /// # Returns
    /// - `ReadOutcome::Done`: The cell exists; fetch it with the
    ///   `retrieve_*` accessors.
    /// - `ReadOutcome::Null`: The cell has never been written or was
    ///   deleted.
    /// - `Err(Error::Range)`: A coordinate is 0 or beyond the sizing mode.
    /// - `Err(Error::Corrupt)`: The file structure is malformed.
    pub fn extract(&mut self, column: u64, row: u64) -> Result<ReadOutcome, Error> {
        self.clear_values();
        let result = container::read_at(&mut self.cont, column, row);
        match result {
            Ok(Some(value)) => {
                self.staged = value;
                Ok(ReadOutcome::Done)
            }
            Ok(None) => Ok(ReadOutcome::Null),
            Err(err) => {
                self.clear_values();
                self.record(Err(err))
            }
        }
    }

    /// Kind of the last extracted value ([`ValueKind::Null`] when the last
    /// extract hit an absent cell or no extract happened).
    pub fn retrieved_type(&self) -> ValueKind {
        self.staged.kind()
    }

    /// The last extracted integer, or 0 when the register holds another
    /// kind.
    pub fn retrieve_int(&self) -> i32 {
        match self.staged {
            Value::Int(v) => v,
            _ => 0,
        }
    }

    /// The last extracted float, or 0.0 when the register holds another
    /// kind.
    pub fn retrieve_float(&self) -> f32 {
        match self.staged {
            Value::Float(v) => v,
            _ => 0.0,
        }
    }

    /// The last extracted boolean, or `false` when the register holds
    /// another kind.
    pub fn retrieve_bool(&self) -> bool {
        match self.staged {
            Value::Bool(v) => v,
            _ => false,
        }
    }

    /// The last extracted string, valid until the next extract, insert or
    /// close.
    pub fn retrieve_char(&self) -> Option<&str> {
        match &self.staged {
            Value::Char(s) => Some(s),
            _ => None,
        }
    }

    /// The last extracted vector, valid until the next extract, insert or
    /// close.
    pub fn retrieve_vector(&self) -> Option<&[f32]> {
        match &self.staged {
            Value::Vector(v) => Some(v),
            _ => None,
        }
    }

    fn describe(value: &Value) -> String {
        match value {
            Value::Null => String::from("null"),
            Value::Int(v) => format!("int:{}", v),
            Value::Float(v) => format!("float:{}", v),
            Value::Bool(v) => format!("bool:{}", v),
            Value::Char(s) => format!("char[len={}]#{}", s.len(), util::fingerprint(s.as_bytes())),
            Value::Vector(v) => {
                let mut raw = Vec::with_capacity(v.len() * 4);
                for component in v {
                    raw.extend_from_slice(&component.to_le_bytes());
                }
                format!("vector[dims={}]#{}", v.len(), util::fingerprint(&raw))
            }
        }
    }

    pub(crate) fn insert_value(
        &mut self,
        column: u64,
        row: u64,
        value: Value,
    ) -> Result<(), Error> {
        self.clear_values();
        if log::log_enabled!(log::Level::Debug) {
            let before = container::read_at(&mut self.cont, column, row)
                .ok()
                .flatten()
                .unwrap_or(Value::Null);
            debug!(
                "insert ({}, {}): {} -> {}",
                column,
                row,
                IdyDb::describe(&before),
                IdyDb::describe(&value)
            );
        }
        let result = container::insert_at(&mut self.cont, column, row, &value);
        self.record(result)
    }

    /// Inserts a 32-bit integer at `(column, row)`.
    pub fn insert_int(&mut self, column: u64, row: u64, value: i32) -> Result<(), Error> {
        self.insert_value(column, row, Value::Int(value))
    }

    /// Inserts a 32-bit float at `(column, row)`.
    pub fn insert_float(&mut self, column: u64, row: u64, value: f32) -> Result<(), Error> {
        self.insert_value(column, row, Value::Float(value))
    }

    /// Inserts a boolean at `(column, row)`.
    pub fn insert_bool(&mut self, column: u64, row: u64, value: bool) -> Result<(), Error> {
        self.insert_value(column, row, Value::Bool(value))
    }

    /// Inserts a string at `(column, row)`.
    ///
    /// An empty string is equivalent to deleting the cell. Strings may not
    /// contain NUL bytes (the stored form is NUL-terminated) and their
    /// length is bounded by the format's `u16` length field.
    pub fn insert_char(&mut self, column: u64, row: u64, value: &str) -> Result<(), Error> {
        if value.as_bytes().contains(&0) {
            let err = Err(Error::InvalidState(String::from(
                "strings may not contain NUL bytes",
            )));
            return self.record(err);
        }
        if value.len() as u64 + 1 > MAX_CHAR_LENGTH {
            let err = Err(Error::Range(format!(
                "string length {} exceeds the storable maximum",
                value.len()
            )));
            return self.record(err);
        }
        let staged = if value.is_empty() {
            Value::Null
        } else {
            Value::Char(value.to_string())
        };
        self.insert_value(column, row, staged)
    }

    /// Inserts an embedding vector at `(column, row)`.
    ///
    /// Dimensionality must lie in `1..=16_383`.
    pub fn insert_vector(&mut self, column: u64, row: u64, components: &[f32]) -> Result<(), Error> {
        if components.is_empty() || components.len() > MAX_VECTOR_DIM as usize {
            let err = Err(Error::Range(format!(
                "vector dimensionality {} out of range",
                components.len()
            )));
            return self.record(err);
        }
        self.insert_value(column, row, Value::Vector(components.to_vec()))
    }

    /// Deletes the cell at `(column, row)`. Deleting an absent cell is a
    /// no-op that still reports success.
    pub fn delete(&mut self, column: u64, row: u64) -> Result<(), Error> {
        self.insert_value(column, row, Value::Null)
    }

    /// Returns the smallest unused row id in `column` (`max_row + 1`, or 1
    /// for an empty column).
    pub fn column_next_row(&mut self, column: u64) -> Result<u64, Error> {
        let result = container::column_next_row(&mut self.cont, column);
        self.record(result)
    }

    /// Runs a kNN search over `vector_column`.
    ///
    /// # Parameters
    /// - `vector_column`: The column holding the embeddings.
    /// - `query`: The query embedding; stored vectors of any other
    ///   dimensionality are skipped.
    /// - `k`: Maximum number of results.
    /// - `metric`: Scoring metric; see [`Metric`].
    ///
    /// # Returns
    /// Up to `k` results sorted by descending score.
    pub fn knn_search(
        &mut self,
        vector_column: u64,
        query: &[f32],
        k: usize,
        metric: Metric,
    ) -> Result<Vec<KnnResult>, Error> {
        let result = knn::knn_search(&mut self.cont, vector_column, query, k, metric, None);
        self.record(result)
    }

    /// Runs a kNN search restricted to rows matching `filter`.
    pub fn knn_search_filtered(
        &mut self,
        vector_column: u64,
        query: &[f32],
        k: usize,
        metric: Metric,
        filter: &Filter,
    ) -> Result<Vec<KnnResult>, Error> {
        let result = (|| {
            let mask = if filter.is_empty() {
                None
            } else {
                Some(crate::filter::build_allowed_mask(&mut self.cont, filter)?)
            };
            knn::knn_search(&mut self.cont, vector_column, query, k, metric, mask.as_deref())
        })();
        self.record(result)
    }

    fn writeback(&mut self) -> Result<(), Error> {
        if !self.cont.dirty || self.cont.read_only {
            return Ok(());
        }
        let (backing, secrets) = match (self.backing.as_mut(), self.secrets.as_ref()) {
            (Some(backing), Some(secrets)) => (backing, secrets),
            _ => return Ok(()),
        };
        debug!(
            "close: encrypting writeback pbkdf2_iter={}",
            secrets.pbkdf2_iter
        );
        envelope::encrypt_stream_to_backing(
            self.cont.stream.file_mut(),
            backing,
            &secrets.salt,
            secrets.pbkdf2_iter,
            &secrets.key,
        )
        .map_err(|err| Error::WritebackFailed(err.to_string()))
    }

    /// Closes the database.
    ///
    /// For a writable, dirty, encrypted handle this re-encrypts the working
    /// stream into the backing file before releasing the lock; a failed
    /// writeback is reported as [`Error::WritebackFailed`] and the backing
    /// file keeps its previous content.
    pub fn close(mut self) -> Result<(), Error> {
        let result = self.writeback();
        // Whatever happened, Drop must not attempt a second writeback.
        self.cont.dirty = false;
        result
    }
}

impl Drop for IdyDb {
    fn drop(&mut self) {
        if self.cont.dirty && !self.cont.read_only && self.backing.is_some() {
            if let Err(err) = self.writeback() {
                log::warn!("encrypted writeback on drop failed: {}", err);
            }
            self.cont.dirty = false;
        }
        self.cont.stream.unlock();
        if let Some(backing) = &self.backing {
            let _ = fs2::FileExt::unlock(backing);
        }
    }
}
