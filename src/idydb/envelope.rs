//! The encrypted-at-rest container envelope.
//!
//! An encrypted database file is the fixed 68-byte header described by
//! [`EnvelopeHeader`] followed by `plaintext_len` bytes of AES-256-GCM
//! ciphertext. The additional authenticated data is the literal 52-byte
//! pre-tag prefix of the header, serialized once and reused verbatim for
//! both directions.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use openssl::symm::{Cipher, Crypter, Mode};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use zeroize::Zeroizing;

use crate::error::Error;
use crate::types::{to_bytes_with_capacity, BinarySize, FromStream, ToStream};
use crate::util::{self, derive_key, pbkdf2_iter_ok};

/// Magic bytes opening every encrypted container.
pub const ENC_MAGIC: &[u8; 8] = b"IDYDBENC";

/// Envelope format version.
pub const ENC_VERSION: u32 = 1;

pub const SALT_LEN: usize = 16;
pub const IV_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
pub const KEY_LEN: usize = 32;

/// Full header size, including the tag.
pub const HEADER_LEN: usize = 8 + 4 + 4 + SALT_LEN + IV_LEN + 8 + TAG_LEN;

/// The authenticated prefix: everything before the tag.
pub const AAD_LEN: usize = HEADER_LEN - TAG_LEN;

const CRYPT_CHUNK: usize = 16 * 1024;

/// # Encryption container header
///
/// ## Layout
/// ```text
///          +---------------------------------------------------------------+
/// | 0x00   |                    magic: b"IDYDBENC"                         |
/// +--------+-------------------------------+-------------------------------+
/// | 0x08   |        version: u32           |      pbkdf2_iter: u32         |
/// +--------+-------------------------------+-------------------------------+
/// | 0x10   |                      salt: bytes[16]                          |
/// +--------+---------------------------------------------------------------+
/// | 0x20   |              iv: bytes[12]            | plaintext_len: u64 .. |
/// +--------+---------------------------------------+-----------------------+
/// | 0x30   | .. plaintext_len |              tag: bytes[16] ..             |
/// +--------+------------------+--------------------------------------------+
/// | 0x40   |     .. tag       |
/// +--------+------------------+
/// ```
/// - Size = 0x44 = 68 bytes
/// - AAD = bytes 0..52 (everything except the tag)
#[derive(Debug, Clone)]
pub struct EnvelopeHeader {
    pub version: u32,
    pub pbkdf2_iter: u32,
    pub salt: [u8; SALT_LEN],
    pub iv: [u8; IV_LEN],
    pub plaintext_len: u64,
    pub tag: [u8; TAG_LEN],
}

impl Default for EnvelopeHeader {
    fn default() -> Self {
        EnvelopeHeader {
            version: ENC_VERSION,
            pbkdf2_iter: util::PBKDF2_DEFAULT_ITER,
            salt: [0; SALT_LEN],
            iv: [0; IV_LEN],
            plaintext_len: 0,
            tag: [0; TAG_LEN],
        }
    }
}

impl BinarySize for EnvelopeHeader {
    fn binary_size() -> usize {
        HEADER_LEN
    }
}

impl FromStream for EnvelopeHeader {
    /// Deserializes the envelope header, rejecting anything that cannot be
    /// decrypted later: bad magic, an unknown version, or an iteration
    /// count outside the accepted window.
    fn read_from<R>(&mut self, reader: &mut R) -> Result<(), Error>
    where
        R: io::Read + io::Seek,
    {
        let mut magic = [0u8; 8];
        reader.read_exact(&mut magic)?;
        if &magic != ENC_MAGIC {
            return Err(Error::DecryptFailed);
        }
        self.version = reader.read_u32::<LittleEndian>()?;
        if self.version != ENC_VERSION {
            return Err(Error::DecryptFailed);
        }
        self.pbkdf2_iter = reader.read_u32::<LittleEndian>()?;
        if !pbkdf2_iter_ok(self.pbkdf2_iter) {
            return Err(Error::DecryptFailed);
        }
        reader.read_exact(&mut self.salt)?;
        reader.read_exact(&mut self.iv)?;
        self.plaintext_len = reader.read_u64::<LittleEndian>()?;
        reader.read_exact(&mut self.tag)?;
        Ok(())
    }
}

impl ToStream for EnvelopeHeader {
    fn write_to<W>(&self, writer: &mut W) -> Result<(), Error>
    where
        W: io::Write + io::Seek,
    {
        writer.write_all(ENC_MAGIC)?;
        writer.write_u32::<LittleEndian>(self.version)?;
        writer.write_u32::<LittleEndian>(self.pbkdf2_iter)?;
        writer.write_all(&self.salt)?;
        writer.write_all(&self.iv)?;
        writer.write_u64::<LittleEndian>(self.plaintext_len)?;
        writer.write_all(&self.tag)?;
        Ok(())
    }
}

impl EnvelopeHeader {
    /// Returns the serialized authenticated prefix (bytes 0..52).
    pub fn aad(&self) -> Result<[u8; AAD_LEN], Error> {
        let bytes = to_bytes_with_capacity(self)?;
        let mut aad = [0u8; AAD_LEN];
        aad.copy_from_slice(&bytes[..AAD_LEN]);
        Ok(aad)
    }
}

/// Secrets recovered (or generated) while opening an encrypted container.
///
/// The derived key is wiped when the value is dropped.
pub struct EnvelopeSecrets {
    pub salt: [u8; SALT_LEN],
    pub pbkdf2_iter: u32,
    pub key: Zeroizing<[u8; KEY_LEN]>,
}

/// Checks whether a backing file starts with the encrypted-container magic.
pub fn file_is_encrypted(file: &mut File) -> Result<bool, Error> {
    let len = file.seek(SeekFrom::End(0))?;
    file.seek(SeekFrom::Start(0))?;
    if len < ENC_MAGIC.len() as u64 {
        return Ok(false);
    }
    let mut magic = [0u8; 8];
    file.read_exact(&mut magic)?;
    file.seek(SeekFrom::Start(0))?;
    Ok(&magic == ENC_MAGIC)
}

/// Decrypts an encrypted backing file into a plaintext working stream.
///
/// Verification is strict: the ciphertext length must match the header's
/// `plaintext_len`, and the GCM tag is checked at finalization; a failed
/// check discards the working stream by erroring out of the open, so no
/// unauthenticated byte is ever surfaced to the container. On success the
/// working stream is rewound to its start.
///
/// # Returns
/// - `EnvelopeSecrets`: The salt, iteration count, and derived key needed
///   for the writeback at close time.
/// - `Err(Error::DecryptFailed)`: On any authentication or structure
///   mismatch.
pub fn decrypt_backing_to_stream(
    backing: &mut File,
    passphrase: &str,
    plain: &mut File,
) -> Result<EnvelopeSecrets, Error> {
    let total = backing.seek(SeekFrom::End(0))?;
    backing.seek(SeekFrom::Start(0))?;
    if total < HEADER_LEN as u64 {
        return Err(Error::DecryptFailed);
    }

    let header: EnvelopeHeader = crate::types::from_stream(backing)?;
    let cipher_len = total - HEADER_LEN as u64;
    if cipher_len != header.plaintext_len {
        return Err(Error::DecryptFailed);
    }

    let key = Zeroizing::new(derive_key(passphrase, &header.salt, header.pbkdf2_iter)?);
    let aad = header.aad()?;

    let cipher = Cipher::aes_256_gcm();
    let mut crypter = Crypter::new(cipher, Mode::Decrypt, &*key, Some(&header.iv))?;
    crypter.aad_update(&aad)?;

    backing.seek(SeekFrom::Start(HEADER_LEN as u64))?;
    let mut inbuf = vec![0u8; CRYPT_CHUNK];
    let mut outbuf = vec![0u8; CRYPT_CHUNK + cipher.block_size()];
    let mut remaining = cipher_len;
    let mut written: u64 = 0;
    while remaining > 0 {
        let want = remaining.min(CRYPT_CHUNK as u64) as usize;
        backing.read_exact(&mut inbuf[..want])?;
        let n = crypter.update(&inbuf[..want], &mut outbuf)?;
        if n > 0 {
            plain.write_all(&outbuf[..n])?;
            written += n as u64;
        }
        remaining -= want as u64;
    }

    crypter.set_tag(&header.tag)?;
    let mut finalbuf = [0u8; 16];
    match crypter.finalize(&mut finalbuf) {
        Ok(n) => {
            if n > 0 {
                plain.write_all(&finalbuf[..n])?;
                written += n as u64;
            }
        }
        Err(_) => return Err(Error::DecryptFailed),
    }
    if written != header.plaintext_len {
        return Err(Error::DecryptFailed);
    }

    plain.flush()?;
    plain.seek(SeekFrom::Start(0))?;
    backing.seek(SeekFrom::Start(0))?;

    Ok(EnvelopeSecrets {
        salt: header.salt,
        pbkdf2_iter: header.pbkdf2_iter,
        key,
    })
}

/// Encrypts the plaintext working stream back into the backing file.
///
/// The backing file is truncated, the header is written with a fresh random
/// IV and a zeroed tag placeholder, the ciphertext is streamed through, and
/// the real tag is patched into place before the file is synced.
pub fn encrypt_stream_to_backing(
    plain: &mut File,
    backing: &mut File,
    salt: &[u8; SALT_LEN],
    pbkdf2_iter: u32,
    key: &[u8; KEY_LEN],
) -> Result<(), Error> {
    if !pbkdf2_iter_ok(pbkdf2_iter) {
        return Err(Error::InvalidState(format!(
            "pbkdf2 iteration count {} outside accepted window",
            pbkdf2_iter
        )));
    }

    plain.flush()?;
    let plaintext_len = plain.seek(SeekFrom::End(0))?;
    plain.seek(SeekFrom::Start(0))?;

    let mut header = EnvelopeHeader {
        version: ENC_VERSION,
        pbkdf2_iter,
        salt: *salt,
        iv: util::random_array::<IV_LEN>()?,
        plaintext_len,
        tag: [0; TAG_LEN],
    };
    let aad = header.aad()?;

    backing.set_len(0)?;
    backing.seek(SeekFrom::Start(0))?;
    header.write_to(backing)?;

    let cipher = Cipher::aes_256_gcm();
    let mut crypter = Crypter::new(cipher, Mode::Encrypt, key, Some(&header.iv))?;
    crypter.aad_update(&aad)?;

    let mut inbuf = vec![0u8; CRYPT_CHUNK];
    let mut outbuf = vec![0u8; CRYPT_CHUNK + cipher.block_size()];
    let mut remaining = plaintext_len;
    while remaining > 0 {
        let want = remaining.min(CRYPT_CHUNK as u64) as usize;
        plain.read_exact(&mut inbuf[..want])?;
        let n = crypter.update(&inbuf[..want], &mut outbuf)?;
        if n > 0 {
            backing.write_all(&outbuf[..n])?;
        }
        remaining -= want as u64;
    }
    let mut finalbuf = [0u8; 16];
    let n = crypter.finalize(&mut finalbuf)?;
    if n > 0 {
        backing.write_all(&finalbuf[..n])?;
    }

    crypter.get_tag(&mut header.tag)?;
    backing.seek(SeekFrom::Start(AAD_LEN as u64))?;
    backing.write_all(&header.tag)?;
    backing.flush()?;
    backing.sync_all()?;

    plain.seek(SeekFrom::Start(0))?;
    Ok(())
}
