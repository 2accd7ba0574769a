use std::collections::BTreeMap;
use std::{fmt, sync::Arc};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use tokio::io;

use crate::context::Context;
use crate::error::{StorageError, StorageErrorKind};

/// A reader stream for file contents.
pub type Reader = dyn io::AsyncRead + Unpin + Send + Sync;

/// Options passed to [`Driver::url_for`], such as `method` or `expiry`.
pub type UrlOptions = BTreeMap<String, String>;

/// Visitor called for each entry found by [`Driver::walk`].
pub type WalkFn<'f> = dyn FnMut(&FileInfo) -> Result<WalkControl, StorageError> + Send + 'f;

/// What a walk should do after visiting an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WalkControl {
    /// Keep walking, descending into the entry if it is a directory.
    #[default]
    Continue,

    /// For a directory, do not descend into it. For a file, skip the
    /// remaining entries of the directory containing it.
    SkipDir,
}

/// File object metadata, which will be generically provided by the driver.
///
/// This struct only provides common metadata fields, and drivers may provide more specific
/// metadata fields directly.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileInfo {
    /// The storage path of the entry.
    pub path: Utf8PathBuf,

    /// The size of the file in bytes. Zero for directories.
    pub size: u64,

    /// The last modification timestamp.
    pub modified: DateTime<Utc>,

    /// Whether the entry is a directory.
    pub is_dir: bool,
}

/// A stream which writes a file into storage.
///
/// Written content is only guaranteed to be stored once [`FileWriter::commit`]
/// returns. [`FileWriter::cancel`] discards what was written.
#[async_trait::async_trait]
pub trait FileWriter: io::AsyncWrite + Unpin + Send + Sync + fmt::Debug {
    /// Number of bytes in the file, including any appended-to content.
    fn size(&self) -> u64;

    /// Make the written content durable.
    async fn commit(&mut self) -> Result<(), StorageError>;

    /// Discard the written content.
    async fn cancel(&mut self) -> Result<(), StorageError>;
}

/// A storage driver, which provides the ability to interact with a storage backend.
///
/// Every operation receives the [`Context`] of the request it serves.
#[async_trait::async_trait]
pub trait Driver: fmt::Debug + Send + Sync {
    /// The name of the driver.
    fn name(&self) -> &'static str;

    /// Retrieve the content stored at `path`.
    async fn get_content(&self, ctx: &Context, path: &Utf8Path) -> Result<Vec<u8>, StorageError>;

    /// Store `content` at `path`, replacing anything already there.
    async fn put_content(
        &self,
        ctx: &Context,
        path: &Utf8Path,
        content: &[u8],
    ) -> Result<(), StorageError>;

    /// Open a stream reading the file at `path`, starting at byte `offset`.
    async fn reader(
        &self,
        ctx: &Context,
        path: &Utf8Path,
        offset: u64,
    ) -> Result<Box<Reader>, StorageError>;

    /// Open a writer for the file at `path`, optionally appending to existing content.
    async fn writer(
        &self,
        ctx: &Context,
        path: &Utf8Path,
        append: bool,
    ) -> Result<Box<dyn FileWriter>, StorageError>;

    /// Get the metadata for a file or directory.
    async fn stat(&self, ctx: &Context, path: &Utf8Path) -> Result<FileInfo, StorageError>;

    /// List the direct children of the directory at `path`, as full paths.
    async fn list(&self, ctx: &Context, path: &Utf8Path) -> Result<Vec<String>, StorageError>;

    /// Move the object at `source` to `dest`, replacing anything at `dest`.
    async fn move_to(
        &self,
        ctx: &Context,
        source: &Utf8Path,
        dest: &Utf8Path,
    ) -> Result<(), StorageError>;

    /// Delete the object at `path`, recursively for directories.
    async fn delete(&self, ctx: &Context, path: &Utf8Path) -> Result<(), StorageError>;

    /// A URL from which the content at `path` can be fetched directly.
    async fn url_for(
        &self,
        ctx: &Context,
        path: &Utf8Path,
        options: &UrlOptions,
    ) -> Result<String, StorageError>;

    /// Visit every entry below `path`, depth first and in lexical order.
    async fn walk(
        &self,
        ctx: &Context,
        path: &Utf8Path,
        visit: &mut WalkFn<'_>,
    ) -> Result<(), StorageError> {
        walk_fallback(self, ctx, path, visit).await
    }
}

/// Walk a driver using only [`Driver::list`] and [`Driver::stat`].
///
/// Drivers without a cheaper native traversal use this as their walk.
pub async fn walk_fallback<D>(
    driver: &D,
    ctx: &Context,
    path: &Utf8Path,
    visit: &mut WalkFn<'_>,
) -> Result<(), StorageError>
where
    D: Driver + ?Sized,
{
    let mut pending = vec![sorted_children(driver, ctx, path).await?];

    while let Some(children) = pending.last_mut() {
        let Some(child) = children.next() else {
            pending.pop();
            continue;
        };

        ctx.check(driver.name())?;
        let info = driver.stat(ctx, Utf8Path::new(&child)).await?;
        let control = visit(&info)?;

        match (control, info.is_dir) {
            (WalkControl::Continue, true) => {
                let nested = sorted_children(driver, ctx, &info.path).await?;
                pending.push(nested);
            }
            (WalkControl::SkipDir, false) => {
                pending.pop();
            }
            (WalkControl::Continue, false) | (WalkControl::SkipDir, true) => {}
        }
    }

    Ok(())
}

async fn sorted_children<D>(
    driver: &D,
    ctx: &Context,
    path: &Utf8Path,
) -> Result<std::vec::IntoIter<String>, StorageError>
where
    D: Driver + ?Sized,
{
    let mut children = driver.list(ctx, path).await?;
    children.sort();
    Ok(children.into_iter())
}

/// The error drivers return for an operation they do not implement.
pub fn unsupported(engine: &'static str, operation: &'static str) -> StorageError {
    StorageError::builder(
        engine,
        StorageErrorKind::Unsupported,
        io::Error::new(io::ErrorKind::Unsupported, "unsupported method"),
    )
    .context(operation)
    .build()
}

macro_rules! forward_driver {
    ($($ty:ty),+) => {$(
        #[async_trait::async_trait]
        impl<D> Driver for $ty
        where
            D: ?Sized + Driver,
        {
            fn name(&self) -> &'static str {
                (**self).name()
            }

            async fn get_content(
                &self,
                ctx: &Context,
                path: &Utf8Path,
            ) -> Result<Vec<u8>, StorageError> {
                (**self).get_content(ctx, path).await
            }

            async fn put_content(
                &self,
                ctx: &Context,
                path: &Utf8Path,
                content: &[u8],
            ) -> Result<(), StorageError> {
                (**self).put_content(ctx, path, content).await
            }

            async fn reader(
                &self,
                ctx: &Context,
                path: &Utf8Path,
                offset: u64,
            ) -> Result<Box<Reader>, StorageError> {
                (**self).reader(ctx, path, offset).await
            }

            async fn writer(
                &self,
                ctx: &Context,
                path: &Utf8Path,
                append: bool,
            ) -> Result<Box<dyn FileWriter>, StorageError> {
                (**self).writer(ctx, path, append).await
            }

            async fn stat(&self, ctx: &Context, path: &Utf8Path) -> Result<FileInfo, StorageError> {
                (**self).stat(ctx, path).await
            }

            async fn list(
                &self,
                ctx: &Context,
                path: &Utf8Path,
            ) -> Result<Vec<String>, StorageError> {
                (**self).list(ctx, path).await
            }

            async fn move_to(
                &self,
                ctx: &Context,
                source: &Utf8Path,
                dest: &Utf8Path,
            ) -> Result<(), StorageError> {
                (**self).move_to(ctx, source, dest).await
            }

            async fn delete(&self, ctx: &Context, path: &Utf8Path) -> Result<(), StorageError> {
                (**self).delete(ctx, path).await
            }

            async fn url_for(
                &self,
                ctx: &Context,
                path: &Utf8Path,
                options: &UrlOptions,
            ) -> Result<String, StorageError> {
                (**self).url_for(ctx, path, options).await
            }

            async fn walk(
                &self,
                ctx: &Context,
                path: &Utf8Path,
                visit: &mut WalkFn<'_>,
            ) -> Result<(), StorageError> {
                (**self).walk(ctx, path, visit).await
            }
        }
    )+};
}

forward_driver!(Arc<D>, &D, Box<D>);
