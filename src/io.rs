//! Byte-stream adapters enforcing the download budget and digest checks, and helpers for
//! atomically persisting verified files.

use crate::error::{self, Error, Result};
use ring::digest::{Context, SHA256};
use snafu::{IntoError, ResultExt};
use std::fs::{self, File};
use std::io::{self, ErrorKind, Read};
use std::path::Path;

/// Wraps a reader and fails with [`Error::FileTooLarge`] the moment the cumulative byte count
/// would exceed `max_size`.
pub(crate) struct MaxSizeAdapter<R> {
    reader: R,
    specifier: &'static str,
    max_size: u64,
    size: u64,
}

impl<R> MaxSizeAdapter<R> {
    pub(crate) fn new(reader: R, specifier: &'static str, max_size: u64) -> Self {
        Self {
            reader,
            specifier,
            max_size,
            size: 0,
        }
    }
}

impl<R: Read> Read for MaxSizeAdapter<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let count = self.reader.read(buf)?;
        self.size = self.size.saturating_add(count as u64);
        if self.size > self.max_size {
            return Err(io::Error::new(
                ErrorKind::InvalidData,
                error::FileTooLargeSnafu {
                    specifier: self.specifier,
                    max_size: self.max_size,
                }
                .build(),
            ));
        }
        Ok(count)
    }
}

/// Wraps a reader and checks its SHA-256 digest when the stream ends, failing with
/// [`Error::InvalidFileInfo`] on a mismatch.
pub(crate) struct DigestAdapter<R> {
    reader: R,
    file: String,
    hash: Vec<u8>,
    digest: Option<Context>,
}

impl<R> DigestAdapter<R> {
    pub(crate) fn sha256(reader: R, hash: &[u8], file: String) -> Self {
        Self {
            reader,
            file,
            hash: hash.to_owned(),
            digest: Some(Context::new(&SHA256)),
        }
    }
}

impl<R: Read> Read for DigestAdapter<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let count = self.reader.read(buf)?;
        if count == 0 {
            if let Some(digest) = self.digest.take() {
                let calculated = digest.finish();
                if calculated.as_ref() != self.hash.as_slice() {
                    return Err(io::Error::new(
                        ErrorKind::InvalidData,
                        error::InvalidFileInfoSnafu {
                            file: self.file.clone(),
                            expected: hex::encode(&self.hash),
                            actual: hex::encode(calculated),
                        }
                        .build(),
                    ));
                }
            }
        } else if let Some(digest) = &mut self.digest {
            digest.update(&buf[..count]);
        }
        Ok(count)
    }
}

/// Recovers a typed error smuggled through `std::io::Error` by the adapters above, wrapping
/// anything else as a download failure.
pub(crate) fn recover_error(err: io::Error, context: &str) -> Error {
    let kind = err.kind();
    match err.into_inner() {
        Some(inner) => match inner.downcast::<Error>() {
            Ok(ours) => *ours,
            Err(other) => error::DownloadSnafu { context }
                .into_error(io::Error::new(kind, other)),
        },
        None => error::DownloadSnafu { context }.into_error(io::Error::from(kind)),
    }
}

/// Atomically replaces `dest` with the file at `staged`: fsync the staged bytes, rename over the
/// target, then fsync the containing directory so the rename itself is durable. `staged` must be
/// on the same filesystem as `dest`.
pub(crate) fn persist(staged: &Path, dest: &Path) -> Result<()> {
    let file = File::open(staged).context(error::FileOpenSnafu { path: staged })?;
    file.sync_all().context(error::FileWriteSnafu { path: staged })?;
    fs::rename(staged, dest).context(error::FileRenameSnafu {
        from: staged,
        to: dest,
    })?;
    if let Some(dir) = dest.parent() {
        File::open(dir)
            .and_then(|d| d.sync_all())
            .context(error::FileWriteSnafu { path: dir })?;
    }
    Ok(())
}
