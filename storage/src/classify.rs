//! A driver wrapper which turns backend errors caused by cancelled requests
//! into [`StorageErrorKind::Cancelled`] errors.
//!
//! Some backend SDKs report "the caller's context ended" only as an opaque
//! error whose message contains a marker such as `RequestCanceled`. Wrapping
//! such a driver in a [`ClassifyingDriver`] lets the rest of the registry test
//! for [`StorageError::is_cancelled`] (and answer 499) instead of matching on
//! SDK error strings.
//!
//! Only `get_content`, `put_content`, `stat`, `list`, `move_to` and `delete`
//! are classified. `reader`, `writer`, `url_for` and `walk` return the wrapped
//! driver's errors untouched.
//!
//! ```
//! use storage::{ClassifyingDriver, MemoryDriver};
//!
//! let driver = ClassifyingDriver::builder()
//!     .driver(MemoryDriver::new())
//!     .build()
//!     .unwrap();
//! # let _ = driver;
//! ```

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use camino::Utf8Path;
use storage_driver::{
    Context, Driver, FileInfo, FileWriter, Reader, RequestCancelledError, StorageError,
    StorageErrorKind, UrlOptions, WalkFn,
};

/// Marker the AWS SDK puts in errors for requests whose context was cancelled.
pub const REQUEST_CANCELED_MARKER: &str = "RequestCanceled";

type ClassifyFn = dyn Fn(&'static str, &Utf8Path, StorageError) -> StorageError + Send + Sync;

/// A policy mapping a failed operation's error to a possibly more specific error.
///
/// The classifier receives the driver name, the path of the operation and the
/// error, and returns the error to hand to the caller. Returning the error
/// unchanged leaves it unclassified.
#[derive(Clone)]
pub struct Classifier(Arc<ClassifyFn>);

impl Classifier {
    /// Build a classifier from a function.
    pub fn new<F>(classify: F) -> Self
    where
        F: Fn(&'static str, &Utf8Path, StorageError) -> StorageError + Send + Sync + 'static,
    {
        Self(Arc::new(classify))
    }

    /// A classifier which reports errors mentioning `marker` as cancelled requests.
    pub fn marker(marker: impl Into<String>) -> Self {
        let marker = marker.into();
        Self::new(move |driver_name, path, err| {
            classify_marker(&marker, driver_name, path, err)
        })
    }

    /// Classify `err`, returned by `driver_name` while operating on `path`.
    pub fn classify(
        &self,
        driver_name: &'static str,
        path: &Utf8Path,
        err: StorageError,
    ) -> StorageError {
        (self.0)(driver_name, path, err)
    }
}

impl Default for Classifier {
    fn default() -> Self {
        Classifier::new(classify_request_cancelled)
    }
}

impl fmt::Debug for Classifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Classifier").finish_non_exhaustive()
    }
}

/// The default classifier: errors mentioning [`REQUEST_CANCELED_MARKER`] are
/// cancelled requests.
pub fn classify_request_cancelled(
    driver_name: &'static str,
    path: &Utf8Path,
    err: StorageError,
) -> StorageError {
    classify_marker(REQUEST_CANCELED_MARKER, driver_name, path, err)
}

fn classify_marker(
    marker: &str,
    driver_name: &'static str,
    path: &Utf8Path,
    err: StorageError,
) -> StorageError {
    if err.as_request_cancelled().is_some() || !mentions(&err, marker) {
        return err;
    }

    tracing::debug!(driver = driver_name, %path, "backend request was cancelled");
    StorageError::request_cancelled(RequestCancelledError::new(driver_name, path, err))
}

/// Whether the message of `err`, or of any error in its source chain, contains `marker`.
///
/// A `StorageError` already renders its source in its own message, so only
/// links whose parent is some other error type are rendered again.
fn mentions(err: &StorageError, marker: &str) -> bool {
    if err.to_string().contains(marker) {
        return true;
    }

    let mut parent: &(dyn StdError + 'static) = err;
    while let Some(link) = parent.source() {
        if !parent.is::<StorageError>() && link.to_string().contains(marker) {
            return true;
        }
        parent = link;
    }
    false
}

/// Construction of a [`ClassifyingDriver`] failed.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    /// No driver to wrap was provided.
    #[error("no backing driver configured")]
    NoDriver,
}

impl From<BuildError> for StorageError {
    fn from(err: BuildError) -> Self {
        StorageError::new("classify", StorageErrorKind::InvalidRequest, err)
    }
}

/// A configuration step applied to a [`ClassifyingDriverBuilder`].
///
/// Options are applied in order, so a later option overrides an earlier one
/// for the same setting.
pub struct DriverOption(Box<ApplyFn>);

type ApplyFn = dyn FnOnce(ClassifyingDriverBuilder) -> ClassifyingDriverBuilder + Send;

impl DriverOption {
    /// An option which applies an arbitrary change to the builder.
    pub fn new<F>(apply: F) -> Self
    where
        F: FnOnce(ClassifyingDriverBuilder) -> ClassifyingDriverBuilder + Send + 'static,
    {
        Self(Box::new(apply))
    }

    fn apply(self, builder: ClassifyingDriverBuilder) -> ClassifyingDriverBuilder {
        (self.0)(builder)
    }
}

impl fmt::Debug for DriverOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverOption").finish_non_exhaustive()
    }
}

/// Option setting the driver to wrap.
pub fn with_wrapped_driver<D>(driver: D) -> DriverOption
where
    D: Driver + 'static,
{
    DriverOption::new(move |builder| builder.driver(driver))
}

/// Option replacing the classifier.
pub fn with_request_cancelled(classifier: Classifier) -> DriverOption {
    DriverOption::new(move |builder| builder.classifier(classifier))
}

/// Builder for [`ClassifyingDriver`].
#[derive(Debug, Default)]
pub struct ClassifyingDriverBuilder {
    driver: Option<Arc<dyn Driver>>,
    classifier: Option<Classifier>,
}

impl ClassifyingDriverBuilder {
    /// Create a builder with no driver and the default classifier.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the driver to wrap.
    pub fn driver<D>(mut self, driver: D) -> Self
    where
        D: Driver + 'static,
    {
        self.driver = Some(Arc::new(driver));
        self
    }

    /// Set an already shared driver to wrap.
    pub fn shared(mut self, driver: Arc<dyn Driver>) -> Self {
        self.driver = Some(driver);
        self
    }

    /// Replace the classifier.
    pub fn classifier(mut self, classifier: Classifier) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// Build the driver.
    pub fn build(self) -> Result<ClassifyingDriver, BuildError> {
        let driver = self.driver.ok_or(BuildError::NoDriver)?;
        Ok(ClassifyingDriver {
            driver,
            classifier: self.classifier.unwrap_or_default(),
        })
    }
}

/// A driver wrapper which classifies the errors of the wrapped driver.
///
/// The wrapper holds no state of its own beyond the wrapped driver and the
/// classifier, and is as safe to share between tasks as the wrapped driver.
#[derive(Debug, Clone)]
pub struct ClassifyingDriver {
    driver: Arc<dyn Driver>,
    classifier: Classifier,
}

impl ClassifyingDriver {
    /// Start building a classifying driver.
    pub fn builder() -> ClassifyingDriverBuilder {
        ClassifyingDriverBuilder::new()
    }

    /// Wrap `driver` with the default classifier.
    pub fn new<D>(driver: D) -> Self
    where
        D: Driver + 'static,
    {
        Self {
            driver: Arc::new(driver),
            classifier: Classifier::default(),
        }
    }

    /// Build a classifying driver from a sequence of options.
    pub fn with_options<I>(options: I) -> Result<Self, BuildError>
    where
        I: IntoIterator<Item = DriverOption>,
    {
        options
            .into_iter()
            .fold(ClassifyingDriverBuilder::new(), |builder, option| {
                option.apply(builder)
            })
            .build()
    }

    /// The wrapped driver.
    pub fn inner(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    fn classify(&self, path: &Utf8Path, err: StorageError) -> StorageError {
        self.classifier.classify(self.name(), path, err)
    }
}

#[async_trait::async_trait]
impl Driver for ClassifyingDriver {
    fn name(&self) -> &'static str {
        self.driver.name()
    }

    async fn get_content(&self, ctx: &Context, path: &Utf8Path) -> Result<Vec<u8>, StorageError> {
        self.driver
            .get_content(ctx, path)
            .await
            .map_err(|err| self.classify(path, err))
    }

    async fn put_content(
        &self,
        ctx: &Context,
        path: &Utf8Path,
        content: &[u8],
    ) -> Result<(), StorageError> {
        self.driver
            .put_content(ctx, path, content)
            .await
            .map_err(|err| self.classify(path, err))
    }

    async fn reader(
        &self,
        ctx: &Context,
        path: &Utf8Path,
        offset: u64,
    ) -> Result<Box<Reader>, StorageError> {
        self.driver.reader(ctx, path, offset).await
    }

    async fn writer(
        &self,
        ctx: &Context,
        path: &Utf8Path,
        append: bool,
    ) -> Result<Box<dyn FileWriter>, StorageError> {
        self.driver.writer(ctx, path, append).await
    }

    async fn stat(&self, ctx: &Context, path: &Utf8Path) -> Result<FileInfo, StorageError> {
        self.driver
            .stat(ctx, path)
            .await
            .map_err(|err| self.classify(path, err))
    }

    async fn list(&self, ctx: &Context, path: &Utf8Path) -> Result<Vec<String>, StorageError> {
        self.driver
            .list(ctx, path)
            .await
            .map_err(|err| self.classify(path, err))
    }

    async fn move_to(
        &self,
        ctx: &Context,
        source: &Utf8Path,
        dest: &Utf8Path,
    ) -> Result<(), StorageError> {
        self.driver
            .move_to(ctx, source, dest)
            .await
            .map_err(|err| self.classify(source, err))
    }

    async fn delete(&self, ctx: &Context, path: &Utf8Path) -> Result<(), StorageError> {
        self.driver
            .delete(ctx, path)
            .await
            .map_err(|err| self.classify(path, err))
    }

    async fn url_for(
        &self,
        ctx: &Context,
        path: &Utf8Path,
        options: &UrlOptions,
    ) -> Result<String, StorageError> {
        self.driver.url_for(ctx, path, options).await
    }

    async fn walk(
        &self,
        ctx: &Context,
        path: &Utf8Path,
        visit: &mut WalkFn<'_>,
    ) -> Result<(), StorageError> {
        self.driver.walk(ctx, path, visit).await
    }
}
