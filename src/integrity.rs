use std::fs::{self, File};
use std::io::{self, Read};

use camino::Utf8Path;

use crate::error::{IntegrityKind, MirrorError};
use crate::store::MirrorStore;

const BLOCK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    Valid,
    Invalid(IntegrityKind),
}

impl Verification {
    pub fn is_valid(&self) -> bool {
        matches!(self, Verification::Valid)
    }
}

pub struct IntegrityChecker;

impl IntegrityChecker {
    /// Checks size, then checksum, and deletes the file if either is wrong.
    ///
    /// A missing expected checksum limits the check to the byte size.
    pub fn verify(
        path: &Utf8Path,
        expected_size: u64,
        expected_checksum: Option<&str>,
    ) -> Result<Verification, MirrorError> {
        let verification = Self::check(path, expected_size, expected_checksum)?;
        if !verification.is_valid() {
            MirrorStore::remove_if_exists(path)?;
        }
        Ok(verification)
    }

    /// Same as [`IntegrityChecker::verify`] without touching the file.
    pub fn check(
        path: &Utf8Path,
        expected_size: u64,
        expected_checksum: Option<&str>,
    ) -> Result<Verification, MirrorError> {
        if let Some(kind) = Self::check_size(path, expected_size)? {
            return Ok(Verification::Invalid(kind));
        }
        let Some(expected) = expected_checksum else {
            return Ok(Verification::Valid);
        };
        let actual = md5_file(path)?;
        if actual.eq_ignore_ascii_case(expected) {
            Ok(Verification::Valid)
        } else {
            Ok(Verification::Invalid(IntegrityKind::ChecksumMismatch {
                expected: expected.to_ascii_lowercase(),
                actual,
            }))
        }
    }

    /// Metadata-only size comparison. A missing file counts as zero bytes.
    pub fn check_size(
        path: &Utf8Path,
        expected_size: u64,
    ) -> Result<Option<IntegrityKind>, MirrorError> {
        let actual = match fs::metadata(path.as_std_path()) {
            Ok(metadata) => metadata.len(),
            Err(err) if err.kind() == io::ErrorKind::NotFound => 0,
            Err(err) => return Err(MirrorError::Filesystem(format!("stat {path}: {err}"))),
        };
        if actual == expected_size {
            Ok(None)
        } else {
            Ok(Some(IntegrityKind::SizeMismatch {
                expected: expected_size,
                actual,
            }))
        }
    }
}

/// Hex MD5 digest of a file, read in fixed-size blocks.
pub fn md5_file(path: &Utf8Path) -> Result<String, MirrorError> {
    let mut file = File::open(path.as_std_path())
        .map_err(|err| MirrorError::Filesystem(format!("open {path}: {err}")))?;
    let mut context = md5::Context::new();
    let mut buffer = vec![0u8; BLOCK_SIZE];
    loop {
        let read = file
            .read(&mut buffer)
            .map_err(|err| MirrorError::Filesystem(format!("read {path}: {err}")))?;
        if read == 0 {
            break;
        }
        context.consume(&buffer[..read]);
    }
    Ok(format!("{:x}", context.compute()))
}
