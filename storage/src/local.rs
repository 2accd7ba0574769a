use std::io;
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use tempfile::TempPath;
use tokio::io::{AsyncSeekExt, AsyncWrite, AsyncWriteExt, BufReader};

use storage_driver::{
    path, unsupported, Context, Driver, FileInfo, FileWriter, Reader, StorageError,
    StorageErrorKind, UrlOptions,
};

const NAME: &str = "filesystem";

/// Prefix of in-progress writer files, which are hidden from listings.
const STAGING_PREFIX: &str = ".upload-";

fn kind_of(err: &io::Error) -> StorageErrorKind {
    match err.kind() {
        io::ErrorKind::NotFound => StorageErrorKind::NotFound,
        io::ErrorKind::PermissionDenied => StorageErrorKind::PermissionDenied,
        _ => StorageErrorKind::Io,
    }
}

/// Convert an I/O failure on `path` into a storage error, keeping the
/// semantic kind of the I/O error.
fn io_error(path: &Utf8Path, context: &'static str, err: io::Error) -> StorageError {
    let kind = kind_of(&err);
    StorageError::builder(NAME, kind, eyre::Report::new(err).wrap_err(context))
        .path(path)
        .build()
}

/// Storage driver which keeps files below a root directory.
#[derive(Debug, Clone)]
pub struct LocalDriver {
    root: Utf8PathBuf,
}

impl LocalDriver {
    /// Create a driver rooted at `root`. The directory is created on first write.
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    /// The root directory of this driver.
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn path(&self, path: &Utf8Path) -> Utf8PathBuf {
        self.root.join(path.as_str().trim_start_matches('/'))
    }

    async fn create_parent(&self, path: &Utf8Path, full: &Utf8Path) -> Result<(), StorageError> {
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| io_error(path, "create_dir_all", err))?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Driver for LocalDriver {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn get_content(&self, ctx: &Context, path: &Utf8Path) -> Result<Vec<u8>, StorageError> {
        ctx.check(NAME)?;
        path::check(NAME, path)?;

        tokio::fs::read(self.path(path))
            .await
            .map_err(|err| io_error(path, "read file", err))
    }

    async fn put_content(
        &self,
        ctx: &Context,
        path: &Utf8Path,
        content: &[u8],
    ) -> Result<(), StorageError> {
        ctx.check(NAME)?;
        path::check(NAME, path)?;

        let full = self.path(path);
        self.create_parent(path, &full).await?;
        tokio::fs::write(&full, content)
            .await
            .map_err(|err| io_error(path, "write file", err))
    }

    async fn reader(
        &self,
        ctx: &Context,
        path: &Utf8Path,
        offset: u64,
    ) -> Result<Box<Reader>, StorageError> {
        ctx.check(NAME)?;
        path::check(NAME, path)?;

        let mut file = tokio::fs::File::open(self.path(path))
            .await
            .map_err(|err| io_error(path, "open file", err))?;

        let size = file
            .metadata()
            .await
            .map_err(|err| io_error(path, "file metadata", err))?
            .len();
        if offset > size {
            return Err(StorageError::builder(
                NAME,
                StorageErrorKind::InvalidRequest,
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("Invalid offset {offset} for {path}"),
                ),
            )
            .path(path)
            .build());
        }

        file.seek(io::SeekFrom::Start(offset))
            .await
            .map_err(|err| io_error(path, "seek file", err))?;
        Ok(Box::new(BufReader::new(file)))
    }

    async fn writer(
        &self,
        ctx: &Context,
        path: &Utf8Path,
        append: bool,
    ) -> Result<Box<dyn FileWriter>, StorageError> {
        ctx.check(NAME)?;
        path::check(NAME, path)?;

        let full = self.path(path);
        let existing = if append {
            Some(
                tokio::fs::File::open(&full)
                    .await
                    .map_err(|err| io_error(path, "open file for appending", err))?,
            )
        } else {
            None
        };

        self.create_parent(path, &full).await?;
        let staging_dir = full.parent().unwrap_or(self.root.as_path());
        let (file, staging) = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .tempfile_in(staging_dir)
            .map_err(|err| io_error(path, "create staging file", err))?
            .into_parts();
        let mut file = tokio::fs::File::from_std(file);

        let size = match existing {
            Some(mut existing) => tokio::io::copy(&mut existing, &mut file)
                .await
                .map_err(|err| io_error(path, "copy existing content", err))?,
            None => 0,
        };

        tracing::trace!(%path, append, size, "opened filesystem writer");
        Ok(Box::new(LocalWriter {
            file,
            path: path.to_owned(),
            full,
            staging: Some(staging),
            size,
        }))
    }

    async fn stat(&self, ctx: &Context, path: &Utf8Path) -> Result<FileInfo, StorageError> {
        ctx.check(NAME)?;
        path::check(NAME, path)?;

        let metadata = tokio::fs::metadata(self.path(path))
            .await
            .map_err(|err| io_error(path, "metadata", err))?;
        let modified: DateTime<Utc> = metadata
            .modified()
            .map_err(|err| io_error(path, "modified timestamp", err))?
            .into();

        Ok(FileInfo {
            path: path.to_owned(),
            size: if metadata.is_dir() { 0 } else { metadata.len() },
            modified,
            is_dir: metadata.is_dir(),
        })
    }

    async fn list(&self, ctx: &Context, path: &Utf8Path) -> Result<Vec<String>, StorageError> {
        ctx.check(NAME)?;
        path::check(NAME, path)?;

        let full = self.path(path);
        let mut entries = match tokio::fs::read_dir(&full).await {
            Ok(entries) => entries,
            Err(err) if path::is_root(path) && err.kind() == io::ErrorKind::NotFound => {
                return Ok(Vec::new());
            }
            Err(err) => return Err(io_error(path, "read_dir", err)),
        };

        let mut children = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|err| io_error(path, "read_dir entry", err))?
        {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                tracing::warn!(%path, ?name, "skipping non UTF-8 file name");
                continue;
            };
            if name.starts_with(STAGING_PREFIX) {
                continue;
            }
            children.push(path.join(name).into_string());
        }

        tracing::debug!(%path, "Found {} entries", children.len());
        Ok(children)
    }

    async fn move_to(
        &self,
        ctx: &Context,
        source: &Utf8Path,
        dest: &Utf8Path,
    ) -> Result<(), StorageError> {
        ctx.check(NAME)?;
        path::check(NAME, source)?;
        path::check(NAME, dest)?;

        let from = self.path(source);
        let to = self.path(dest);

        tokio::fs::metadata(&from)
            .await
            .map_err(|err| io_error(source, "metadata", err))?;
        self.create_parent(dest, &to).await?;
        tokio::fs::rename(&from, &to)
            .await
            .map_err(|err| io_error(source, "rename", err))
    }

    async fn delete(&self, ctx: &Context, path: &Utf8Path) -> Result<(), StorageError> {
        ctx.check(NAME)?;
        path::check(NAME, path)?;

        let full = self.path(path);
        let metadata = tokio::fs::metadata(&full)
            .await
            .map_err(|err| io_error(path, "metadata", err))?;

        if metadata.is_dir() {
            tokio::fs::remove_dir_all(&full)
                .await
                .map_err(|err| io_error(path, "remove_dir_all", err))
        } else {
            tokio::fs::remove_file(&full)
                .await
                .map_err(|err| io_error(path, "remove_file", err))
        }
    }

    async fn url_for(
        &self,
        _ctx: &Context,
        _path: &Utf8Path,
        _options: &UrlOptions,
    ) -> Result<String, StorageError> {
        Err(unsupported(NAME, "url_for"))
    }
}

/// Writes into a staging file next to the target, which replaces the target
/// on commit. Dropping the writer without committing discards the staging file.
#[derive(Debug)]
struct LocalWriter {
    file: tokio::fs::File,
    path: Utf8PathBuf,
    full: Utf8PathBuf,
    staging: Option<TempPath>,
    size: u64,
}

impl LocalWriter {
    fn closed(&self) -> StorageError {
        StorageError::builder(
            NAME,
            StorageErrorKind::InvalidRequest,
            io::Error::other("writer already closed"),
        )
        .path(self.path.clone())
        .build()
    }
}

impl AsyncWrite for LocalWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.staging.is_none() {
            return Poll::Ready(Err(io::Error::other("writer already closed")));
        }
        let written = std::task::ready!(Pin::new(&mut this.file).poll_write(cx, buf))?;
        this.size += written as u64;
        Poll::Ready(Ok(written))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().file).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().file).poll_shutdown(cx)
    }
}

#[async_trait::async_trait]
impl FileWriter for LocalWriter {
    fn size(&self) -> u64 {
        self.size
    }

    async fn commit(&mut self) -> Result<(), StorageError> {
        let Some(staging) = self.staging.take() else {
            return Err(self.closed());
        };

        self.file
            .flush()
            .await
            .map_err(|err| io_error(&self.path, "flush file", err))?;
        self.file
            .sync_all()
            .await
            .map_err(|err| io_error(&self.path, "sync file", err))?;
        staging
            .persist(&self.full)
            .map_err(|err| io_error(&self.path, "rename staging file", err.error))?;

        tracing::trace!(path = %self.path, size = self.size, "committed filesystem writer");
        Ok(())
    }

    async fn cancel(&mut self) -> Result<(), StorageError> {
        let Some(staging) = self.staging.take() else {
            return Err(self.closed());
        };
        staging
            .close()
            .map_err(|err| io_error(&self.path, "remove staging file", err))
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncReadExt;

    use storage_driver::WalkControl;

    use super::*;

    fn p(path: &str) -> &Utf8Path {
        Utf8Path::new(path)
    }

    fn driver() -> (tempfile::TempDir, LocalDriver) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap().to_owned();
        (dir, LocalDriver::new(root))
    }

    #[tokio::test]
    async fn content_round_trip() {
        let (_dir, driver) = driver();
        let ctx = Context::background();

        driver.put_content(&ctx, p("/a/b"), b"hello").await.unwrap();
        assert_eq!(driver.get_content(&ctx, p("/a/b")).await.unwrap(), b"hello");

        let info = driver.stat(&ctx, p("/a/b")).await.unwrap();
        assert_eq!(info.size, 5);
        assert!(!info.is_dir);
        assert!(driver.stat(&ctx, p("/a")).await.unwrap().is_dir);
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let (_dir, driver) = driver();
        let err = driver
            .get_content(&Context::background(), p("/missing"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), StorageErrorKind::NotFound);
        assert_eq!(err.engine(), "filesystem");
    }

    #[tokio::test]
    async fn list_and_walk() {
        let (_dir, driver) = driver();
        let ctx = Context::background();
        assert!(driver.list(&ctx, p("/")).await.unwrap().is_empty());

        for path in ["/a/b/c", "/a/d", "/e"] {
            driver.put_content(&ctx, p(path), b"x").await.unwrap();
        }

        let mut children = driver.list(&ctx, p("/a")).await.unwrap();
        children.sort();
        assert_eq!(children, vec!["/a/b", "/a/d"]);

        let mut seen = Vec::new();
        driver
            .walk(&ctx, p("/"), &mut |info: &FileInfo| {
                seen.push(info.path.to_string());
                Ok(WalkControl::Continue)
            })
            .await
            .unwrap();
        assert_eq!(seen, vec!["/a", "/a/b", "/a/b/c", "/a/d", "/e"]);
    }

    #[tokio::test]
    async fn move_and_delete() {
        let (_dir, driver) = driver();
        let ctx = Context::background();

        driver.put_content(&ctx, p("/uploads/1/data"), b"blob").await.unwrap();
        driver
            .move_to(&ctx, p("/uploads/1/data"), p("/blobs/ab/data"))
            .await
            .unwrap();
        assert_eq!(driver.get_content(&ctx, p("/blobs/ab/data")).await.unwrap(), b"blob");

        let err = driver
            .move_to(&ctx, p("/uploads/1/data"), p("/elsewhere"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), StorageErrorKind::NotFound);

        driver.delete(&ctx, p("/blobs")).await.unwrap();
        assert!(driver.stat(&ctx, p("/blobs/ab/data")).await.is_err());
    }

    #[tokio::test]
    async fn writer_append_and_reader_offset() {
        let (_dir, driver) = driver();
        let ctx = Context::background();

        let mut writer = driver.writer(&ctx, p("/upload"), false).await.unwrap();
        writer.write_all(b"hello ").await.unwrap();
        writer.commit().await.unwrap();

        let mut writer = driver.writer(&ctx, p("/upload"), true).await.unwrap();
        assert_eq!(writer.size(), 6);
        writer.write_all(b"world").await.unwrap();
        assert_eq!(writer.size(), 11);
        writer.commit().await.unwrap();

        let mut reader = driver.reader(&ctx, p("/upload"), 6).await.unwrap();
        let mut content = String::new();
        reader.read_to_string(&mut content).await.unwrap();
        assert_eq!(content, "world");

        let err = driver.reader(&ctx, p("/upload"), 12).await.err().unwrap();
        assert_eq!(err.kind(), StorageErrorKind::InvalidRequest);
    }

    #[tokio::test]
    async fn writer_cancel_discards_new_file() {
        let (_dir, driver) = driver();
        let ctx = Context::background();

        let mut writer = driver.writer(&ctx, p("/upload"), false).await.unwrap();
        writer.write_all(b"partial").await.unwrap();
        writer.cancel().await.unwrap();
        assert!(driver.stat(&ctx, p("/upload")).await.is_err());
        assert!(driver.list(&ctx, p("/")).await.unwrap().is_empty());

        let err = driver.writer(&ctx, p("/upload"), true).await.unwrap_err();
        assert_eq!(err.kind(), StorageErrorKind::NotFound);
    }

    #[tokio::test]
    async fn writer_cancel_keeps_committed_content() {
        let (_dir, driver) = driver();
        let ctx = Context::background();
        driver.put_content(&ctx, p("/blob"), b"committed").await.unwrap();

        let mut writer = driver.writer(&ctx, p("/blob"), true).await.unwrap();
        writer.write_all(b"partial").await.unwrap();
        writer.cancel().await.unwrap();

        assert_eq!(driver.get_content(&ctx, p("/blob")).await.unwrap(), b"committed");
        assert!(writer.commit().await.is_err());
    }

    #[tokio::test]
    async fn writer_content_appears_on_commit() {
        let (_dir, driver) = driver();
        let ctx = Context::background();
        driver.put_content(&ctx, p("/blob"), b"old").await.unwrap();

        let mut writer = driver.writer(&ctx, p("/blob"), false).await.unwrap();
        assert_eq!(driver.get_content(&ctx, p("/blob")).await.unwrap(), b"old");
        assert_eq!(driver.list(&ctx, p("/")).await.unwrap(), vec!["/blob"]);

        writer.write_all(b"new").await.unwrap();
        assert_eq!(driver.get_content(&ctx, p("/blob")).await.unwrap(), b"old");
        writer.commit().await.unwrap();
        assert_eq!(driver.get_content(&ctx, p("/blob")).await.unwrap(), b"new");
    }

    #[tokio::test]
    async fn dropped_writer_leaves_nothing_behind() {
        let (_dir, driver) = driver();
        let ctx = Context::background();

        let writer = driver.writer(&ctx, p("/blob2"), false).await.unwrap();
        drop(writer);
        assert!(driver.get_content(&ctx, p("/blob2")).await.is_err());
        assert!(driver.list(&ctx, p("/")).await.unwrap().is_empty());
    }
}
