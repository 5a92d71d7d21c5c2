//! Presence and checksum checks against the base directory.
//!
//! Presence (`files_available`) is the gate for the available sets. Checksums are
//! only computed on explicit validation, since hashing multi-gigabyte weights on
//! every scan is too slow.

use crate::error::Result;
use crate::models::manifest::{Checksum, FileSpec};
use md5::Md5;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Read size for hashing
const HASH_CHUNK: usize = 8192;

/// Existence check only
#[must_use]
pub fn file_exists(base: &Path, relative: &str) -> bool {
    base.join(relative).exists()
}

/// True iff every listed file exists under `base`
#[must_use]
pub fn files_available(base: &Path, files: &[FileSpec]) -> bool {
    files.iter().all(|file| file_exists(base, &file.path))
}

/// Hex digest of a file for the algorithm of `checksum`
pub fn hash_file(path: &Path, checksum: &Checksum) -> Result<String> {
    match checksum {
        Checksum::Md5(_) => digest_file::<Md5>(path),
        Checksum::Sha256(_) => digest_file::<Sha256>(path),
    }
}

fn digest_file<D: Digest>(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = D::new();
    let mut buf = [0u8; HASH_CHUNK];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Compare a file against its expected checksum. No checksum means valid.
#[must_use]
pub fn validate_checksum(path: &Path, expected: Option<&Checksum>) -> bool {
    let Some(expected) = expected else {
        return true;
    };

    tracing::debug!("Getting {} of {}", expected.algorithm(), path.display());
    match hash_file(path, expected) {
        Ok(actual) => actual.eq_ignore_ascii_case(expected.hex()),
        Err(e) => {
            tracing::warn!("Could not hash {}: {e}", path.display());
            false
        }
    }
}

/// Existence and checksum for every file; stops at the first failure
#[must_use]
pub fn validate_files(base: &Path, files: &[FileSpec]) -> bool {
    files.iter().all(|file| {
        if !file_exists(base, &file.path) {
            tracing::debug!("{} is missing", file.path);
            return false;
        }
        if !validate_checksum(&base.join(&file.path), file.checksum.as_ref()) {
            tracing::warn!("{} failed checksum validation", file.path);
            return false;
        }
        true
    })
}
