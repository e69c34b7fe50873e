//! Product-file checksums.
//!
//! Registry rows store a 32-character hex md5 of each product file. The
//! checksum is recomputed on download and compared against the stored
//! value before a product is used as a pipeline input.

use crate::error::{Error, Result};
use md5::{Digest, Md5};
use std::fs::File;
use std::io::Read;
use std::path::Path;

const READ_CHUNK: usize = 4096;

/// Compute the md5 checksum of a file, streaming in small chunks.
pub fn md5_file(path: impl AsRef<Path>) -> Result<String> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(Error::MissingInputFile(path.display().to_string()));
    }

    let io_err = |source| Error::ChecksumIo {
        path: path.display().to_string(),
        source,
    };

    let mut file = File::open(path).map_err(io_err)?;
    let mut hasher = Md5::new();
    let mut buf = [0u8; READ_CHUNK];
    loop {
        let n = file.read(&mut buf).map_err(io_err)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Compute a file's checksum and compare it against the registry value.
pub fn verify_file_checksum(path: impl AsRef<Path>, expected: &str) -> Result<String> {
    let path = path.as_ref();
    let actual = md5_file(path)?;
    if actual != expected {
        return Err(Error::ChecksumMismatch {
            path: path.display().to_string(),
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(actual)
}
