//! Abstracts over the method/protocol by which repository files are obtained.

use dyn_clone::DynClone;
use snafu::Snafu;
use std::fmt::{self, Debug};
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::sync::{Arc, Mutex, PoisonError};
use url::Url;

/// A trait to abstract over the method/protocol by which files are obtained.
///
/// The trait hides the underlying types involved by returning the `Read` object as a
/// `Box<dyn Read + Send>` and by requiring concrete type [`TransportError`] as the error type.
pub trait Transport: Debug + DynClone {
    /// Opens a `Read` object for the file specified by `url`.
    fn fetch(&self, url: Url) -> Result<Box<dyn Read + Send>, TransportError>;

    /// Opens a `Read` object for the byte range `[start, end)` of the file specified by `url`.
    ///
    /// A transport is allowed to answer with the whole file instead; the response records
    /// whether the range was honored so the caller can fall back to a full read.
    fn fetch_range(&self, url: Url, start: u64, end: u64)
        -> Result<RangeResponse, TransportError>;

    /// The capabilities observed for the servers this transport talks to.
    fn capabilities(&self) -> ServerCapabilities;
}

// Implement `Clone` for `Transport` trait objects.
dyn_clone::clone_trait_object!(Transport);

/// The body of a ranged fetch.
pub struct RangeResponse {
    /// The response body. When `satisfied` is false this is the entire file.
    pub body: Box<dyn Read + Send>,
    /// Whether the requested range was honored.
    pub satisfied: bool,
}

impl Debug for RangeResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RangeResponse")
            .field("satisfied", &self.satisfied)
            .finish_non_exhaustive()
    }
}

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

/// Server capabilities observed by a transport, shared with the repository layer.
///
/// This is per-client state, not process-wide: it travels with the transport value. Updates are
/// monotonic (absent → present), so a stale read costs at most a missed optimization.
#[derive(Debug, Clone, Default)]
pub struct ServerCapabilities {
    flags: Arc<Mutex<CapabilityFlags>>,
}

#[derive(Debug, Default)]
struct CapabilityFlags {
    accept_ranges: bool,
}

impl ServerCapabilities {
    /// Creates a capability record with nothing observed yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a capability record for transports that always support ranges, such as local
    /// files.
    pub fn assume_byte_ranges() -> Self {
        let capabilities = Self::default();
        capabilities.observe_byte_ranges();
        capabilities
    }

    /// Whether `Accept-Ranges: bytes` (or an equivalent) has been observed.
    pub fn supports_byte_ranges(&self) -> bool {
        self.lock().accept_ranges
    }

    /// Records that the server advertised byte-range support.
    pub fn observe_byte_ranges(&self) {
        self.lock().accept_ranges = true;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CapabilityFlags> {
        // The flags are plain booleans; a poisoned lock cannot hold broken data.
        self.flags.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

/// The kind of error that the transport object experienced during `fetch`.
#[derive(Debug, Copy, Clone)]
#[non_exhaustive]
pub enum TransportErrorKind {
    /// The trait does not handle the URL scheme named in `String`. e.g. `file://` or `http://`.
    UnsupportedUrlScheme,
    /// The file cannot be found.
    FileNotFound,
    /// The transport failed for any other reason, e.g. IO error, HTTP broken pipe, etc.
    Other,
}

/// The error type that [`Transport`] `fetch` returns.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub struct TransportError {
    /// The kind of error that occurred.
    pub kind: TransportErrorKind,
    /// The URL that the transport was trying to fetch.
    pub url: String,
    /// The underlying error that occurred.
    pub source: Box<dyn std::error::Error + Send + Sync>,
}

impl TransportError {
    /// Creates a new [`TransportError`].
    pub fn new<S, E>(kind: TransportErrorKind, url: S, source_error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
        S: AsRef<str>,
    {
        Self {
            kind,
            url: url.as_ref().into(),
            source: source_error.into(),
        }
    }

    /// Creates a [`TransportError`] for reporting an unhandled URL type.
    pub fn unsupported_scheme<S: AsRef<str>>(url: S) -> Self {
        TransportError::new(
            TransportErrorKind::UnsupportedUrlScheme,
            url,
            "Transport cannot handle the given URL scheme.".to_string(),
        )
    }
}

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

/// Provides a [`Transport`] for local files.
#[derive(Debug, Clone)]
pub struct FilesystemTransport {
    capabilities: ServerCapabilities,
}

impl FilesystemTransport {
    /// Creates a filesystem transport. Local files are always seekable, so byte-range support is
    /// assumed from the start.
    pub fn new() -> Self {
        Self {
            capabilities: ServerCapabilities::assume_byte_ranges(),
        }
    }
}

impl Default for FilesystemTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl FilesystemTransport {
    fn open(url: &Url) -> Result<std::fs::File, TransportError> {
        if url.scheme() != "file" {
            return Err(TransportError::unsupported_scheme(url.as_str()));
        }

        std::fs::File::open(url.path()).map_err(|e| {
            let kind = match e.kind() {
                ErrorKind::NotFound => TransportErrorKind::FileNotFound,
                _ => TransportErrorKind::Other,
            };
            TransportError::new(kind, url.as_str(), e)
        })
    }
}

impl Transport for FilesystemTransport {
    fn fetch(&self, url: Url) -> Result<Box<dyn Read + Send>, TransportError> {
        let f = Self::open(&url)?;
        Ok(Box::new(f))
    }

    fn fetch_range(
        &self,
        url: Url,
        start: u64,
        end: u64,
    ) -> Result<RangeResponse, TransportError> {
        let mut f = Self::open(&url)?;
        f.seek(SeekFrom::Start(start))
            .map_err(|e| TransportError::new(TransportErrorKind::Other, url.as_str(), e))?;
        Ok(RangeResponse {
            body: Box::new(f.take(end.saturating_sub(start))),
            satisfied: true,
        })
    }

    fn capabilities(&self) -> ServerCapabilities {
        self.capabilities.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::{FilesystemTransport, Transport, TransportErrorKind};
    use std::io::Read;
    use url::Url;

    #[test]
    fn filesystem_transport_rejects_other_schemes() {
        let transport = FilesystemTransport::new();
        let err = match transport.fetch(Url::parse("ftp://example.com/file").unwrap()) {
            Err(e) => e,
            Ok(_) => panic!("expected fetch to fail"),
        };
        assert!(matches!(
            err.kind,
            TransportErrorKind::UnsupportedUrlScheme
        ));
    }

    #[test]
    fn filesystem_transport_serves_ranges() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file.txt");
        std::fs::write(&path, "0123456789").unwrap();

        let transport = FilesystemTransport::new();
        assert!(transport.capabilities().supports_byte_ranges());

        let response = transport
            .fetch_range(Url::from_file_path(&path).unwrap(), 4, 8)
            .unwrap();
        assert!(response.satisfied);
        let mut buf = Vec::new();
        response.body.take(u64::MAX).read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"4567");
    }
}
