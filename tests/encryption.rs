//! Encrypted-at-rest behavior: envelope round-trips, tamper rejection,
//! migration, and the no-plaintext-at-rest guarantee.

use idydb::{Error, OpenOptions, ReadOutcome};
use tempfile::TempDir;

const MAGIC: &[u8] = b"IDYDBENC";

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

#[test]
fn encrypted_roundtrip_with_wrong_passphrase_rejected() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("secret.idy");

    let mut db = OpenOptions::new()
        .create(true)
        .encrypted("pw")
        .open(&path)
        .unwrap();
    db.insert_char(1, 1, "secret").unwrap();
    db.close().unwrap();

    let raw = std::fs::read(&path).unwrap();
    assert_eq!(&raw[..8], MAGIC);
    assert!(!contains(&raw, b"secret"));

    let mut db = OpenOptions::new().encrypted("pw").open(&path).unwrap();
    assert_eq!(db.extract(1, 1).unwrap(), ReadOutcome::Done);
    assert_eq!(db.retrieve_char(), Some("secret"));
    db.close().unwrap();

    assert!(matches!(
        OpenOptions::new().encrypted("wrong").open(&path),
        Err(Error::DecryptFailed)
    ));
}

#[test]
fn plaintext_never_touches_the_backing_file_while_open() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("atrest.idy");

    let mut db = OpenOptions::new()
        .create(true)
        .encrypted("pw")
        .open(&path)
        .unwrap();
    assert!(db.is_encrypted());
    assert!(db.plain_storage_kind().is_some());

    db.insert_char(1, 1, "never-on-disk-before-close").unwrap();
    db.insert_vector(2, 1, &[0.5, 0.25]).unwrap();

    // Between open and close the backing file holds no plaintext bytes.
    let raw = std::fs::read(&path).unwrap();
    assert!(!contains(&raw, b"never-on-disk-before-close"));

    db.close().unwrap();
    let raw = std::fs::read(&path).unwrap();
    assert!(!contains(&raw, b"never-on-disk-before-close"));
    assert_eq!(&raw[..8], MAGIC);
}

#[test]
fn every_tampered_header_field_fails_decryption() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("tamper.idy");

    let mut db = OpenOptions::new()
        .create(true)
        .encrypted("pw")
        .open(&path)
        .unwrap();
    db.insert_int(1, 1, 123456).unwrap();
    db.close().unwrap();

    let pristine = std::fs::read(&path).unwrap();
    assert!(pristine.len() > 68);

    // magic, version, pbkdf2_iter, salt, iv, plaintext_len, tag, ciphertext
    for &offset in &[0usize, 8, 12, 16, 32, 44, 52, 68] {
        let mut tampered = pristine.clone();
        tampered[offset] ^= 0x01;
        std::fs::write(&path, &tampered).unwrap();
        assert!(
            matches!(
                OpenOptions::new().encrypted("pw").open(&path),
                Err(Error::DecryptFailed)
            ),
            "bit flip at offset {} was accepted",
            offset
        );
    }

    // The pristine bytes still open fine.
    std::fs::write(&path, &pristine).unwrap();
    let mut db = OpenOptions::new().encrypted("pw").open(&path).unwrap();
    db.extract(1, 1).unwrap();
    assert_eq!(db.retrieve_int(), 123456);
}

#[test]
fn truncated_envelope_fails_decryption() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("short.idy");

    let mut db = OpenOptions::new()
        .create(true)
        .encrypted("pw")
        .open(&path)
        .unwrap();
    db.insert_int(1, 1, 1).unwrap();
    db.close().unwrap();

    let raw = std::fs::read(&path).unwrap();
    std::fs::write(&path, &raw[..raw.len() - 1]).unwrap();
    assert!(matches!(
        OpenOptions::new().encrypted("pw").open(&path),
        Err(Error::DecryptFailed)
    ));
}

#[test]
fn writeback_on_close_preserves_logical_state() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("writeback.idy");

    let mut db = OpenOptions::new()
        .create(true)
        .encrypted("pw")
        .open(&path)
        .unwrap();
    for row in 1..=20u64 {
        db.insert_int(1, row, row as i32 * 3).unwrap();
        db.insert_char(2, row, &format!("row number {}", row)).unwrap();
    }
    db.delete(1, 7).unwrap();
    db.close().unwrap();

    let mut db = OpenOptions::new().encrypted("pw").open(&path).unwrap();
    for row in 1..=20u64 {
        if row == 7 {
            assert_eq!(db.extract(1, row).unwrap(), ReadOutcome::Null);
        } else {
            db.extract(1, row).unwrap();
            assert_eq!(db.retrieve_int(), row as i32 * 3);
        }
        db.extract(2, row).unwrap();
        assert_eq!(db.retrieve_char(), Some(format!("row number {}", row).as_str()));
    }
    db.close().unwrap();
}

#[test]
fn clean_reopen_without_changes_keeps_the_file_identical() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("clean.idy");

    let mut db = OpenOptions::new()
        .create(true)
        .encrypted("pw")
        .open(&path)
        .unwrap();
    db.insert_int(1, 1, 5).unwrap();
    db.close().unwrap();

    let before = std::fs::read(&path).unwrap();
    // Read-only traffic leaves the envelope untouched (no fresh IV).
    let mut db = OpenOptions::new()
        .read_only(true)
        .encrypted("pw")
        .open(&path)
        .unwrap();
    db.extract(1, 1).unwrap();
    drop(db);
    assert_eq!(std::fs::read(&path).unwrap(), before);
}

#[test]
fn plaintext_backing_migrates_when_writable() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("migrate.idy");

    let mut db = OpenOptions::new().create(true).open(&path).unwrap();
    db.insert_char(1, 1, "migrate me").unwrap();
    db.close().unwrap();
    assert_ne!(&std::fs::read(&path).unwrap()[..8], MAGIC);

    // Read-only encrypted open must refuse to migrate.
    assert!(matches!(
        OpenOptions::new().read_only(true).encrypted("pw").open(&path),
        Err(Error::MigrationRequired)
    ));

    // Writable encrypted open migrates on close.
    let mut db = OpenOptions::new().encrypted("pw").open(&path).unwrap();
    db.extract(1, 1).unwrap();
    assert_eq!(db.retrieve_char(), Some("migrate me"));
    db.close().unwrap();

    let raw = std::fs::read(&path).unwrap();
    assert_eq!(&raw[..8], MAGIC);
    assert!(!contains(&raw, b"migrate me"));

    let mut db = OpenOptions::new().encrypted("pw").open(&path).unwrap();
    db.extract(1, 1).unwrap();
    assert_eq!(db.retrieve_char(), Some("migrate me"));
    db.close().unwrap();
}

#[test]
fn missing_file_and_bad_iteration_count_are_reported() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("absent.idy");

    assert!(matches!(
        OpenOptions::new().encrypted("pw").open(&path),
        Err(Error::NotFound(_))
    ));

    let mut options = OpenOptions::new();
    options.create(true).encrypted("pw").pbkdf2_iter(5);
    assert!(matches!(
        options.open(&path),
        Err(Error::InvalidState(_))
    ));
}

#[test]
fn custom_iteration_count_is_recorded_in_the_header() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("iter.idy");

    let mut db = OpenOptions::new()
        .create(true)
        .encrypted("pw")
        .pbkdf2_iter(10_000)
        .open(&path)
        .unwrap();
    db.insert_bool(1, 1, true).unwrap();
    db.close().unwrap();

    let raw = std::fs::read(&path).unwrap();
    let iter = u32::from_le_bytes([raw[12], raw[13], raw[14], raw[15]]);
    assert_eq!(iter, 10_000);

    // Reopening honours the stored count rather than the default.
    let mut db = OpenOptions::new().encrypted("pw").open(&path).unwrap();
    db.extract(1, 1).unwrap();
    assert!(db.retrieve_bool());
    db.close().unwrap();
}

#[test]
fn dirty_encrypted_handle_writes_back_on_drop() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("drop.idy");

    {
        let mut db = OpenOptions::new()
            .create(true)
            .encrypted("pw")
            .open(&path)
            .unwrap();
        db.insert_int(3, 3, 33).unwrap();
        // Dropped without close(): the writeback still runs.
    }

    let mut db = OpenOptions::new().encrypted("pw").open(&path).unwrap();
    db.extract(3, 3).unwrap();
    assert_eq!(db.retrieve_int(), 33);
    db.close().unwrap();
}
