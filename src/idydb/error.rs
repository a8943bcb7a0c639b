use openssl::error::ErrorStack;
use std::{error, fmt, io};

/// Errors reported by the IdyDB container, the query layer and the
/// encryption envelope.
///
/// Every failing public call also records `Display` output of the error in
/// the handle's last-error slot (see [`crate::db::IdyDb::errmsg`]), so
/// callers holding only a status code can still recover a message.
#[derive(Debug)]
pub enum Error {
    /// A column or row coordinate was zero, exceeded the sizing-mode
    /// maximum, or the file itself exceeds the sizing-mode bound.
    Range(String),
    /// The advisory lock on the backing file is held elsewhere.
    Busy,
    /// The backing file could not be opened.
    Perm(String),
    /// A read-only open was attempted against a missing file.
    NotFound(String),
    /// The on-disk structure is malformed.
    Corrupt(String),
    /// A mutation was attempted through a read-only handle.
    ReadOnly,
    /// An encrypted open was requested without a passphrase.
    MissingPassphrase,
    /// Envelope authentication failed: wrong passphrase, tampered file, or
    /// unsupported parameters.
    DecryptFailed,
    /// The encrypted writeback at close time failed; the backing file was
    /// not updated.
    WritebackFailed(String),
    /// No anonymous working storage could be obtained for the plaintext
    /// stream of an encrypted database.
    SecureStreamFailed(String),
    /// An encrypted read-only open found a plaintext backing file; the
    /// database must be opened writable once to migrate.
    MigrationRequired,
    /// The handle or an argument is in a state the operation cannot accept.
    InvalidState(String),
    IoError(io::Error),
    OpenSslError(ErrorStack),
}

impl Error {
    /// Returns the numeric status code of the error, matching the codes the
    /// container has always reported (`range` = 6, `busy` = 3, ...). All
    /// generic and encryption-specific failures share code 1.
    pub fn code(&self) -> u32 {
        match self {
            Error::Perm(_) => 2,
            Error::Busy => 3,
            Error::NotFound(_) => 4,
            Error::Corrupt(_) => 5,
            Error::Range(_) => 6,
            Error::ReadOnly => 8,
            _ => 1,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::IoError(err)
    }
}

impl From<ErrorStack> for Error {
    fn from(err: ErrorStack) -> Self {
        Error::OpenSslError(err)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Range(msg) => {
                write!(f, "The requested range is outside of the database's range: {}", msg)
            }
            Error::Busy => {
                write!(f, "Exclusive rights to access the database could not be obtained")
            }
            Error::Perm(msg) => write!(f, "Failed to open the database: {}", msg),
            Error::NotFound(msg) => write!(f, "No database exists to be read: {}", msg),
            Error::Corrupt(msg) => {
                write!(f, "The database contracted a malformed structure declaration: {}", msg)
            }
            Error::ReadOnly => write!(f, "The database was opened in readonly mode"),
            Error::MissingPassphrase => {
                write!(f, "Encryption requested but no passphrase supplied")
            }
            Error::DecryptFailed => write!(
                f,
                "Database decryption failed (wrong passphrase, tampered file, or unsupported parameters)"
            ),
            Error::WritebackFailed(msg) => {
                write!(f, "Database encryption writeback failed: {}", msg)
            }
            Error::SecureStreamFailed(msg) => write!(
                f,
                "Failed to create secure in-memory plaintext working storage: {}",
                msg
            ),
            Error::MigrationRequired => write!(
                f,
                "Encrypted readonly open cannot migrate a plaintext database; open writable once to migrate"
            ),
            Error::InvalidState(msg) => write!(f, "{}", msg),
            Error::IoError(err) => write!(f, "An I/O error occurred: {}", err),
            Error::OpenSslError(err) => write!(f, "A cryptographic operation failed: {}", err),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::IoError(err) => Some(err),
            Error::OpenSslError(err) => Some(err),
            _ => None,
        }
    }
}
