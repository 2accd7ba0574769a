//! # Storage backends
//!
//! Configuration and unification for the storage backends, and the
//! [`ClassifyingDriver`] which recognises cancelled backend requests.

use std::sync::Arc;

use camino::Utf8Path;
#[cfg(feature = "local")]
use camino::Utf8PathBuf;
use serde::Deserialize;

pub mod classify;
#[cfg(feature = "local")]
pub(crate) mod local;
pub(crate) mod memory;

#[doc(inline)]
pub use classify::{
    with_request_cancelled, with_wrapped_driver, BuildError, Classifier, ClassifyingDriver,
    ClassifyingDriverBuilder, DriverOption, REQUEST_CANCELED_MARKER,
};

#[cfg(feature = "local")]
#[doc(inline)]
pub use local::LocalDriver;

#[doc(inline)]
pub use memory::MemoryDriver;

#[doc(inline)]
pub use storage_driver::{
    Context, Driver, FileInfo, FileWriter, Reader, RequestCancelledError, StorageError,
    StorageErrorKind, UrlOptions, WalkControl, WalkFn,
};

/// Which backend to store data in.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DriverConfig {
    /// Keep everything in memory.
    Memory,

    /// Store files below a local directory.
    #[cfg(feature = "local")]
    Local {
        /// The root directory.
        path: Utf8PathBuf,
    },
}

/// Classification of cancelled backend requests.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct CancellationConfig {
    /// Wrap the backend in a [`ClassifyingDriver`].
    pub enabled: bool,

    /// Text which marks a backend error as a cancelled request.
    pub marker: String,
}

impl Default for CancellationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            marker: REQUEST_CANCELED_MARKER.to_owned(),
        }
    }
}

impl CancellationConfig {
    fn classifier(&self) -> Result<Classifier, StorageError> {
        if self.marker.is_empty() {
            return Err(StorageError::new(
                "config",
                StorageErrorKind::InvalidRequest,
                "cancellation marker must not be empty",
            ));
        }
        Ok(Classifier::marker(self.marker.clone()))
    }
}

/// Storage configuration, as read from the registry configuration file.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StorageConfig {
    /// The backend.
    pub driver: DriverConfig,

    /// Cancellation classification of backend errors.
    #[serde(default)]
    pub cancellation: CancellationConfig,
}

impl StorageConfig {
    /// Build the configured storage.
    #[tracing::instrument]
    pub fn build(self) -> Result<Storage, StorageError> {
        let driver: Arc<dyn Driver> = match self.driver {
            DriverConfig::Memory => Arc::new(MemoryDriver::new()),
            #[cfg(feature = "local")]
            DriverConfig::Local { path } => Arc::new(LocalDriver::new(path)),
        };

        if !self.cancellation.enabled {
            return Ok(Storage { driver });
        }

        let classified = ClassifyingDriver::builder()
            .shared(driver)
            .classifier(self.cancellation.classifier()?)
            .build()?;
        Ok(classified.into())
    }
}

/// A shared handle to a storage driver.
#[derive(Debug, Clone)]
pub struct Storage {
    driver: Arc<dyn Driver>,
}

impl<D> From<D> for Storage
where
    D: Driver + 'static,
{
    fn from(value: D) -> Self {
        Storage::new(value)
    }
}

impl Storage {
    /// Share `driver` behind a storage handle.
    pub fn new<D: Driver + 'static>(driver: D) -> Self {
        Self {
            driver: Arc::new(driver),
        }
    }

    /// The name of the underlying driver.
    pub fn name(&self) -> &'static str {
        self.driver.name()
    }

    /// The underlying driver.
    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    /// Read the whole file at `path`.
    #[tracing::instrument(skip(self, ctx), fields(driver=self.driver.name()))]
    pub async fn get_content(
        &self,
        ctx: &Context,
        path: &Utf8Path,
    ) -> Result<Vec<u8>, StorageError> {
        self.driver.get_content(ctx, path).await
    }

    /// Replace the file at `path` with `content`.
    #[tracing::instrument(
        skip(self, ctx, content),
        fields(driver=self.driver.name(), size=content.len())
    )]
    pub async fn put_content(
        &self,
        ctx: &Context,
        path: &Utf8Path,
        content: &[u8],
    ) -> Result<(), StorageError> {
        self.driver.put_content(ctx, path, content).await
    }

    /// Stream the file at `path`, starting `offset` bytes in.
    #[tracing::instrument(skip(self, ctx), fields(driver=self.driver.name()))]
    pub async fn reader(
        &self,
        ctx: &Context,
        path: &Utf8Path,
        offset: u64,
    ) -> Result<Box<Reader>, StorageError> {
        self.driver.reader(ctx, path, offset).await
    }

    /// Open a writer for `path`, optionally appending to an existing file.
    #[tracing::instrument(skip(self, ctx), fields(driver=self.driver.name()))]
    pub async fn writer(
        &self,
        ctx: &Context,
        path: &Utf8Path,
        append: bool,
    ) -> Result<Box<dyn FileWriter>, StorageError> {
        self.driver.writer(ctx, path, append).await
    }

    /// Metadata for the file or directory at `path`.
    #[tracing::instrument(skip(self, ctx), fields(driver=self.driver.name()))]
    pub async fn stat(&self, ctx: &Context, path: &Utf8Path) -> Result<FileInfo, StorageError> {
        self.driver.stat(ctx, path).await
    }

    /// Full paths of the direct children of the directory at `path`.
    #[tracing::instrument(skip(self, ctx), fields(driver=self.driver.name()))]
    pub async fn list(&self, ctx: &Context, path: &Utf8Path) -> Result<Vec<String>, StorageError> {
        self.driver.list(ctx, path).await
    }

    /// Move `source` to `dest`, replacing anything already at `dest`.
    #[tracing::instrument(skip(self, ctx), fields(driver=self.driver.name()))]
    pub async fn move_to(
        &self,
        ctx: &Context,
        source: &Utf8Path,
        dest: &Utf8Path,
    ) -> Result<(), StorageError> {
        tracing::trace!(%source, %dest, "Moving {source} to {dest}");
        self.driver.move_to(ctx, source, dest).await
    }

    /// Delete the file or directory tree at `path`.
    #[tracing::instrument(skip(self, ctx), fields(driver=self.driver.name()))]
    pub async fn delete(&self, ctx: &Context, path: &Utf8Path) -> Result<(), StorageError> {
        self.driver.delete(ctx, path).await
    }

    /// A URL which serves the file at `path` directly, if the driver has one.
    #[tracing::instrument(skip(self, ctx), fields(driver=self.driver.name()))]
    pub async fn url_for(
        &self,
        ctx: &Context,
        path: &Utf8Path,
        options: &UrlOptions,
    ) -> Result<String, StorageError> {
        self.driver.url_for(ctx, path, options).await
    }

    /// Visit everything below `path`, depth first in lexical order.
    #[tracing::instrument(skip(self, ctx, visit), fields(driver=self.driver.name()))]
    pub async fn walk(
        &self,
        ctx: &Context,
        path: &Utf8Path,
        visit: &mut WalkFn<'_>,
    ) -> Result<(), StorageError> {
        self.driver.walk(ctx, path, visit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(json: &str) -> StorageConfig {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn memory_config_defaults_to_classifying() {
        let config = config(r#"{"driver": "memory"}"#);
        assert!(matches!(config.driver, DriverConfig::Memory));
        assert!(config.cancellation.enabled);
        assert_eq!(config.cancellation.marker, "RequestCanceled");
    }

    #[test]
    fn cancellation_config() {
        let config = config(
            r#"{"driver": "memory", "cancellation": {"enabled": false, "marker": "context canceled"}}"#,
        );
        assert!(!config.cancellation.enabled);
        assert_eq!(config.cancellation.marker, "context canceled");
    }

    #[cfg(feature = "local")]
    #[test]
    fn local_config() {
        let config = config(r#"{"driver": {"local": {"path": "/var/lib/registry"}}}"#);
        match config.driver {
            DriverConfig::Local { path } => assert_eq!(path.as_str(), "/var/lib/registry"),
            other => panic!("unexpected driver: {other:?}"),
        }
    }

    #[test]
    fn empty_marker_is_rejected() {
        let err = config(r#"{"driver": "memory", "cancellation": {"marker": ""}}"#)
            .build()
            .unwrap_err();
        assert_eq!(err.kind(), StorageErrorKind::InvalidRequest);
    }

    #[tokio::test]
    async fn build_storage() {
        let storage = config(r#"{"driver": "memory"}"#).build().unwrap();
        assert_eq!(storage.name(), "inmemory");

        let ctx = Context::background();
        let path = Utf8Path::new("/docker/registry/v2/repositories/app/_layers/link");
        storage.put_content(&ctx, path, b"sha256:abcd").await.unwrap();
        assert_eq!(storage.get_content(&ctx, path).await.unwrap(), b"sha256:abcd");
    }
}
