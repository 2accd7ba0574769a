use std::backtrace::Backtrace;
use std::error::Error as StdError;
use std::fmt;

use camino::{Utf8Path, Utf8PathBuf};
use http::StatusCode;
use tracing_error::SpanTrace;

/// Status code used for requests which ended because the client went away,
/// following the "499 Client Closed Request" convention.
pub const CLIENT_CLOSED_REQUEST: u16 = 499;

/// Categorizes storage errors by their semantic meaning, independent of
/// the underlying storage backend implementation.
///
/// This enum helps callers understand what went wrong and how to respond,
/// without needing to inspect error messages or know backend-specific details.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorKind {
    /// The requested resource (file, object, directory) was not found.
    ///
    /// **Retryable:** No - the resource doesn't exist.
    /// **Caller action:** Check the path, or handle as a missing resource.
    NotFound,

    /// The caller lacks permission to perform the requested operation.
    ///
    /// **Retryable:** No - unless credentials are updated.
    /// **Caller action:** Check authentication, authorization, or file permissions.
    PermissionDenied,

    /// The operation failed due to I/O errors (network, disk, etc.).
    ///
    /// **Retryable:** Maybe - depends on whether the I/O issue is transient.
    /// **Caller action:** Consider retrying with backoff for transient failures.
    Io,

    /// The backing storage service is temporarily unavailable.
    ///
    /// **Retryable:** Yes - the service should recover.
    /// **Caller action:** Retry with exponential backoff.
    ServiceUnavailable,

    /// Authentication credentials have expired and need refresh.
    ///
    /// **Retryable:** Yes - after refreshing credentials.
    /// **Caller action:** Refresh auth tokens and retry.
    AuthExpired,

    /// The request was invalid (bad path, bad offset, malformed data, etc.).
    ///
    /// **Retryable:** No - the request itself is invalid.
    /// **Caller action:** Fix the request parameters.
    InvalidRequest,

    /// The driver does not implement the requested operation.
    ///
    /// **Retryable:** No.
    /// **Caller action:** Fall back to an operation the driver supports.
    Unsupported,

    /// The operation was retried multiple times but continued to fail.
    ///
    /// **Retryable:** No - retries were already attempted.
    /// **Caller action:** Investigate the underlying cause or escalate.
    RetriesExhausted,

    /// Data serialization or deserialization failed.
    ///
    /// **Retryable:** No - indicates a data format mismatch.
    /// **Caller action:** Check data format compatibility.
    SerializationError,

    /// The operation did not complete because the caller's context ended.
    ///
    /// The backend did not fail: the request was abandoned by the client.
    ///
    /// **Retryable:** No - nobody is waiting for the result.
    /// **Caller action:** Treat as a client abort (e.g. respond with 499).
    Cancelled,

    /// An unexpected or uncategorized error occurred.
    ///
    /// **Retryable:** Unknown - inspect the underlying error.
    /// **Caller action:** Check error details for specific guidance.
    Other,
}

impl StorageErrorKind {
    /// Returns whether this error kind typically indicates a retryable condition.
    ///
    /// Note: This is advisory only. Callers should consider context like:
    /// - How many retries have already occurred
    /// - Whether retry logic exists at a higher level
    /// - The criticality of the operation
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StorageErrorKind::ServiceUnavailable
                | StorageErrorKind::AuthExpired
                | StorageErrorKind::Io // May be transient
        )
    }

    /// Returns whether this error indicates a client-side fault (bad request, invalid params).
    pub fn is_client_fault(&self) -> bool {
        matches!(
            self,
            StorageErrorKind::InvalidRequest
                | StorageErrorKind::PermissionDenied
                | StorageErrorKind::SerializationError
                | StorageErrorKind::Cancelled
        )
    }

    /// Returns whether this error indicates a server-side fault (service issues).
    pub fn is_server_fault(&self) -> bool {
        matches!(
            self,
            StorageErrorKind::ServiceUnavailable | StorageErrorKind::RetriesExhausted
        )
    }

    /// The HTTP status a registry would typically answer with for this kind.
    pub fn status_code(&self) -> StatusCode {
        match self {
            StorageErrorKind::NotFound => StatusCode::NOT_FOUND,
            StorageErrorKind::PermissionDenied => StatusCode::FORBIDDEN,
            StorageErrorKind::AuthExpired => StatusCode::UNAUTHORIZED,
            StorageErrorKind::InvalidRequest => StatusCode::BAD_REQUEST,
            StorageErrorKind::Unsupported => StatusCode::NOT_IMPLEMENTED,
            StorageErrorKind::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            StorageErrorKind::Cancelled => StatusCode::from_u16(CLIENT_CLOSED_REQUEST)
                .unwrap_or(StatusCode::BAD_REQUEST),
            StorageErrorKind::Io
            | StorageErrorKind::RetriesExhausted
            | StorageErrorKind::SerializationError
            | StorageErrorKind::Other => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl fmt::Display for StorageErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageErrorKind::NotFound => write!(f, "not found"),
            StorageErrorKind::PermissionDenied => write!(f, "permission denied"),
            StorageErrorKind::Io => write!(f, "I/O error"),
            StorageErrorKind::ServiceUnavailable => write!(f, "service unavailable"),
            StorageErrorKind::AuthExpired => write!(f, "authentication expired"),
            StorageErrorKind::InvalidRequest => write!(f, "invalid request"),
            StorageErrorKind::Unsupported => write!(f, "unsupported operation"),
            StorageErrorKind::RetriesExhausted => write!(f, "retries exhausted"),
            StorageErrorKind::SerializationError => write!(f, "serialization error"),
            StorageErrorKind::Cancelled => write!(f, "request cancelled"),
            StorageErrorKind::Other => write!(f, "other error"),
        }
    }
}

#[derive(Debug)]
struct ErrorTrace {
    /// Captured backtrace for debugging.
    ///
    /// Note: Backtrace capture is controlled by RUST_BACKTRACE environment variable.
    backtrace: Backtrace,

    /// Captured span trace from tracing for async context.
    span_trace: SpanTrace,
}

impl ErrorTrace {
    #[track_caller]
    fn capture() -> Self {
        ErrorTrace {
            backtrace: Backtrace::capture(),
            span_trace: SpanTrace::capture(),
        }
    }
}

/// Storage error with context and diagnostic capabilities.
///
/// This error type provides:
/// - **Semantic categorization** via `StorageErrorKind`
/// - **Operation context** (engine, path)
/// - **Error chain preservation** via `Box<dyn Error + Send + Sync>`
/// - **Backtrace capture** for debugging
/// - **Spantrace support** via `tracing_error::SpanTrace`
///
/// # Example
///
/// ```rust
/// use storage_driver::{StorageError, StorageErrorKind};
///
/// fn read_manifest() -> Result<(), StorageError> {
///     let result = std::fs::File::open("missing.json");
///
///     match result {
///         Err(err) => Err(StorageError::builder("filesystem", StorageErrorKind::NotFound, err)
///             .path("/docker/registry/v2/repositories/app/_manifests")
///             .build()),
///         Ok(_) => Ok(()),
///     }
/// }
/// ```
#[derive(Debug)]
pub struct StorageError {
    /// The semantic category of this error.
    kind: StorageErrorKind,

    /// The name of the storage engine that produced this error.
    engine: &'static str,

    /// The storage path, if applicable.
    path: Option<Utf8PathBuf>,

    /// Additional context about the error.
    context: Option<String>,

    /// The underlying error.
    source: Box<dyn StdError + Send + Sync + 'static>,

    traces: Box<ErrorTrace>,
}

impl StdError for StorageError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(self.source.as_ref())
    }
}

impl StorageError {
    /// Create a new storage error with the minimum required information.
    ///
    /// For more control, use `StorageError::builder()`.
    pub fn new<E>(engine: &'static str, kind: StorageErrorKind, error: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        Self {
            kind,
            engine,
            path: None,
            context: None,
            source: error.into(),
            traces: Box::new(ErrorTrace::capture()),
        }
    }

    /// Create a builder for constructing a storage error with full context.
    ///
    /// # Example
    ///
    /// ```rust
    /// use storage_driver::{StorageError, StorageErrorKind};
    ///
    /// let error = StorageError::builder("s3aws", StorageErrorKind::NotFound,
    ///     std::io::Error::new(std::io::ErrorKind::NotFound, "NoSuchKey"))
    ///     .path("/docker/registry/v2/blobs/sha256/ab/abcd/data")
    ///     .context("stat")
    ///     .build();
    /// assert_eq!(error.path().map(|p| p.as_str()), Some("/docker/registry/v2/blobs/sha256/ab/abcd/data"));
    /// ```
    pub fn builder<E>(engine: &'static str, kind: StorageErrorKind, error: E) -> StorageErrorBuilder
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        StorageErrorBuilder {
            engine,
            kind,
            source: error.into(),
            path: None,
            context: None,
        }
    }

    /// Returns a boxed closure that creates a storage error from a downstream error.
    ///
    /// This is useful with `.map_err()` for simple error conversion.
    pub fn with<E>(
        engine: &'static str,
        kind: StorageErrorKind,
    ) -> Box<dyn FnOnce(E) -> StorageError + Send + Sync>
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        Box::new(move |error: E| StorageError::new(engine, kind, error))
    }

    /// Wrap a backend error which turned out to be a cancelled request.
    ///
    /// The resulting error has kind [`StorageErrorKind::Cancelled`], and the
    /// [`RequestCancelledError`] is available from [`StorageError::as_request_cancelled`].
    pub fn request_cancelled(error: RequestCancelledError) -> Self {
        let engine = error.driver_name();
        let path = error.path().to_owned();
        Self::builder(engine, StorageErrorKind::Cancelled, error)
            .path(path)
            .build()
    }

    /// Returns the error kind.
    pub fn kind(&self) -> StorageErrorKind {
        self.kind
    }

    /// Returns the storage engine name.
    pub fn engine(&self) -> &'static str {
        self.engine
    }

    /// Returns the storage path, if available.
    pub fn path(&self) -> Option<&Utf8Path> {
        self.path.as_deref()
    }

    /// Returns additional context, if available.
    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    /// Returns whether this error is likely retryable.
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    /// Returns whether this error indicates a client-side fault.
    pub fn is_client_fault(&self) -> bool {
        self.kind.is_client_fault()
    }

    /// Returns whether this error indicates a server-side fault.
    pub fn is_server_fault(&self) -> bool {
        self.kind.is_server_fault()
    }

    /// Returns whether the operation ended because the caller's context ended.
    pub fn is_cancelled(&self) -> bool {
        self.kind == StorageErrorKind::Cancelled
    }

    /// The structured cancellation error, if this error was reclassified as one.
    pub fn as_request_cancelled(&self) -> Option<&RequestCancelledError> {
        self.source.downcast_ref::<RequestCancelledError>()
    }

    /// The HTTP status a registry would answer with for this error.
    pub fn status_code(&self) -> StatusCode {
        match self.as_request_cancelled() {
            Some(cancelled) => cancelled.http_status(),
            None => self.kind.status_code(),
        }
    }

    /// Returns a reference to the captured backtrace.
    pub fn backtrace(&self) -> &Backtrace {
        &self.traces.backtrace
    }

    /// Returns a reference to the captured span trace.
    ///
    /// The span trace provides the tracing span context at the point where
    /// this error was created, showing the logical async call stack.
    pub fn span_trace(&self) -> &SpanTrace {
        &self.traces.span_trace
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Storage error [{}] from {}", self.kind, self.engine)?;

        if let Some(path) = &self.path {
            write!(f, " (path: {})", path)?;
        }

        if let Some(context) = &self.context {
            write!(f, " ({})", context)?;
        }

        write!(f, ": {}", self.source)
    }
}

/// Builder for constructing `StorageError` with optional context fields.
#[derive(Debug)]
pub struct StorageErrorBuilder {
    kind: StorageErrorKind,
    engine: &'static str,
    source: Box<dyn StdError + Send + Sync + 'static>,
    path: Option<Utf8PathBuf>,
    context: Option<String>,
}

impl StorageErrorBuilder {
    /// Set the storage path.
    pub fn path(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Set additional context.
    pub fn context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Build the `StorageError`.
    pub fn build(self) -> StorageError {
        StorageError {
            kind: self.kind,
            engine: self.engine,
            path: self.path,
            context: self.context,
            source: self.source,
            traces: Box::new(ErrorTrace::capture()),
        }
    }
}

/// A storage operation which did not complete because the calling request's
/// context was cancelled, rather than because the backend failed.
///
/// Backend SDKs often report this only as an opaque error message; this type
/// gives it a structure callers can match on. The original backend error is
/// kept as the [`source`](StdError::source) of this error.
#[derive(Debug)]
pub struct RequestCancelledError {
    driver_name: &'static str,
    path: Utf8PathBuf,
    status_code: u16,
    enclosed: StorageError,
}

impl RequestCancelledError {
    /// Wrap `enclosed`, the error returned by `driver_name` while operating on `path`.
    pub fn new(driver_name: &'static str, path: impl Into<Utf8PathBuf>, enclosed: StorageError) -> Self {
        Self {
            driver_name,
            path: path.into(),
            status_code: CLIENT_CLOSED_REQUEST,
            enclosed,
        }
    }

    /// Name of the driver whose request was cancelled.
    pub fn driver_name(&self) -> &'static str {
        self.driver_name
    }

    /// Path the cancelled operation was working on.
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Always [`CLIENT_CLOSED_REQUEST`].
    pub fn status_code(&self) -> u16 {
        self.status_code
    }

    /// [`RequestCancelledError::status_code`] as an HTTP status.
    pub fn http_status(&self) -> StatusCode {
        StatusCode::from_u16(self.status_code).unwrap_or(StatusCode::BAD_REQUEST)
    }

    /// The original backend error.
    pub fn enclosed(&self) -> &StorageError {
        &self.enclosed
    }

    /// Take the original backend error.
    pub fn into_enclosed(self) -> StorageError {
        self.enclosed
    }
}

impl fmt::Display for RequestCancelledError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: request context cancelled for {} ({})",
            self.driver_name, self.path, self.status_code
        )
    }
}

impl StdError for RequestCancelledError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(&self.enclosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static_assertions::assert_impl_all!(StorageError: Send, Sync);
    static_assertions::assert_impl_all!(RequestCancelledError: Send, Sync);

    fn backend_error(message: &str) -> StorageError {
        StorageError::new(
            "s3aws",
            StorageErrorKind::Other,
            std::io::Error::other(message.to_owned()),
        )
    }

    #[test]
    fn display_includes_path_and_source() {
        let err = StorageError::builder(
            "s3aws",
            StorageErrorKind::NotFound,
            std::io::Error::other("NoSuchKey"),
        )
        .path("/a/b")
        .context("stat")
        .build();

        assert_eq!(
            err.to_string(),
            "Storage error [not found] from s3aws (path: /a/b) (stat): NoSuchKey"
        );
    }

    #[test]
    fn request_cancelled_keeps_enclosed_error() {
        let cancelled = RequestCancelledError::new(
            "s3aws",
            "/x",
            backend_error("RequestCanceled: context deadline exceeded"),
        );
        let err = StorageError::request_cancelled(cancelled);

        assert!(err.is_cancelled());
        assert_eq!(err.engine(), "s3aws");
        assert_eq!(err.path(), Some(Utf8Path::new("/x")));
        assert_eq!(err.status_code().as_u16(), 499);

        let cancelled = err.as_request_cancelled().unwrap();
        assert_eq!(cancelled.status_code(), CLIENT_CLOSED_REQUEST);
        assert_eq!(cancelled.driver_name(), "s3aws");
        assert_eq!(cancelled.path().as_str(), "/x");
        assert!(cancelled
            .enclosed()
            .to_string()
            .ends_with("RequestCanceled: context deadline exceeded"));

        let source = cancelled.source().unwrap();
        assert_eq!(source.to_string(), cancelled.enclosed().to_string());
    }

    #[test]
    fn plain_errors_are_not_request_cancelled() {
        let err = backend_error("NoSuchKey");
        assert!(err.as_request_cancelled().is_none());
        assert!(!err.is_cancelled());
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn cancelled_is_a_client_fault() {
        assert!(StorageErrorKind::Cancelled.is_client_fault());
        assert!(!StorageErrorKind::Cancelled.is_retryable());
        assert!(!StorageErrorKind::Cancelled.is_server_fault());
        assert_eq!(StorageErrorKind::Cancelled.status_code().as_u16(), 499);
    }
}
