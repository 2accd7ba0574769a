use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use tokio::io::AsyncWrite;
use tokio::sync::RwLock;

use storage_driver::{
    path, unsupported, Context, Driver, FileInfo, FileWriter, Reader, StorageError,
    StorageErrorKind, UrlOptions,
};

const NAME: &str = "inmemory";

#[derive(Debug, Clone)]
struct MemoryFile {
    modified: DateTime<Utc>,
    data: Vec<u8>,
}

impl From<Vec<u8>> for MemoryFile {
    fn from(data: Vec<u8>) -> Self {
        Self {
            modified: Utc::now(),
            data,
        }
    }
}

type Files = BTreeMap<Utf8PathBuf, MemoryFile>;

fn not_found(path: &Utf8Path) -> StorageError {
    StorageError::builder(
        NAME,
        StorageErrorKind::NotFound,
        io::Error::new(io::ErrorKind::NotFound, format!("Path not found: {path}")),
    )
    .path(path)
    .build()
}

fn invalid(path: &Utf8Path, message: String) -> StorageError {
    StorageError::builder(
        NAME,
        StorageErrorKind::InvalidRequest,
        io::Error::new(io::ErrorKind::InvalidInput, message),
    )
    .path(path)
    .build()
}

/// Files strictly below `dir`.
fn descendants<'f>(
    files: &'f Files,
    dir: &'f Utf8Path,
) -> impl Iterator<Item = (&'f Utf8PathBuf, &'f MemoryFile)> + 'f {
    files
        .range::<Utf8Path, _>((std::ops::Bound::Excluded(dir), std::ops::Bound::Unbounded))
        .take_while(move |(path, _)| path.starts_with(dir))
}

fn is_dir(files: &Files, path: &Utf8Path) -> bool {
    path::is_root(path) || descendants(files, path).next().is_some()
}

/// A file may be stored at `path` only if it is not a directory and none of
/// its ancestors is a file.
fn check_file_slot(files: &Files, path: &Utf8Path) -> Result<(), StorageError> {
    if path::is_root(path) || descendants(files, path).next().is_some() {
        return Err(invalid(path, format!("Path is a directory: {path}")));
    }
    if let Some(parent) = path.ancestors().skip(1).find(|a| files.contains_key(*a)) {
        return Err(invalid(path, format!("Parent is a file: {parent}")));
    }
    Ok(())
}

/// Storage driver that keeps files in memory.
///
/// Directories exist implicitly, as long as a file exists below them.
#[derive(Debug, Default, Clone)]
pub struct MemoryDriver {
    files: Arc<RwLock<Files>>,
}

impl MemoryDriver {
    /// Create a new, empty `MemoryDriver`.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl Driver for MemoryDriver {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn get_content(&self, ctx: &Context, path: &Utf8Path) -> Result<Vec<u8>, StorageError> {
        ctx.check(NAME)?;
        path::check(NAME, path)?;

        let files = self.files.read().await;
        files
            .get(path)
            .map(|file| file.data.clone())
            .ok_or_else(|| not_found(path))
    }

    async fn put_content(
        &self,
        ctx: &Context,
        path: &Utf8Path,
        content: &[u8],
    ) -> Result<(), StorageError> {
        ctx.check(NAME)?;
        path::check(NAME, path)?;

        let mut files = self.files.write().await;
        check_file_slot(&files, path)?;
        files.insert(path.to_owned(), content.to_vec().into());
        Ok(())
    }

    async fn reader(
        &self,
        ctx: &Context,
        path: &Utf8Path,
        offset: u64,
    ) -> Result<Box<Reader>, StorageError> {
        ctx.check(NAME)?;
        path::check(NAME, path)?;

        let files = self.files.read().await;
        let file = files.get(path).ok_or_else(|| not_found(path))?;
        let start = usize::try_from(offset)
            .ok()
            .filter(|start| *start <= file.data.len())
            .ok_or_else(|| invalid(path, format!("Invalid offset {offset} for {path}")))?;

        Ok(Box::new(io::Cursor::new(file.data[start..].to_vec())))
    }

    async fn writer(
        &self,
        ctx: &Context,
        path: &Utf8Path,
        append: bool,
    ) -> Result<Box<dyn FileWriter>, StorageError> {
        ctx.check(NAME)?;
        path::check(NAME, path)?;

        let buffer = if append {
            let files = self.files.read().await;
            files.get(path).ok_or_else(|| not_found(path))?.data.clone()
        } else {
            Vec::new()
        };

        Ok(Box::new(MemoryWriter {
            files: self.files.clone(),
            path: path.to_owned(),
            buffer,
            state: WriterState::Open,
        }))
    }

    async fn stat(&self, ctx: &Context, path: &Utf8Path) -> Result<FileInfo, StorageError> {
        ctx.check(NAME)?;
        path::check(NAME, path)?;

        let files = self.files.read().await;
        if let Some(file) = files.get(path) {
            return Ok(FileInfo {
                path: path.to_owned(),
                size: file.data.len() as u64,
                modified: file.modified,
                is_dir: false,
            });
        }

        if !is_dir(&files, path) {
            return Err(not_found(path));
        }

        let modified = descendants(&files, path)
            .map(|(_, file)| file.modified)
            .max()
            .unwrap_or_else(Utc::now);
        Ok(FileInfo {
            path: path.to_owned(),
            size: 0,
            modified,
            is_dir: true,
        })
    }

    async fn list(&self, ctx: &Context, path: &Utf8Path) -> Result<Vec<String>, StorageError> {
        ctx.check(NAME)?;
        path::check(NAME, path)?;
        tracing::trace!(%path, "list memory directory");

        let files = self.files.read().await;
        if !is_dir(&files, path) {
            return Err(not_found(path));
        }

        let children: BTreeSet<Utf8PathBuf> = descendants(&files, path)
            .filter_map(|(file, _)| {
                let relative = file.strip_prefix(path).ok()?;
                let first = relative.components().next()?;
                Some(path.join(first.as_str()))
            })
            .collect();

        Ok(children.into_iter().map(|p| p.into_string()).collect())
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

        let mut files = self.files.write().await;
        if files.contains_key(source) {
            check_file_slot(&files, dest)?;
            if let Some(file) = files.remove(source) {
                files.insert(dest.to_owned(), file);
            }
            return Ok(());
        }

        let moved: Vec<(Utf8PathBuf, Utf8PathBuf)> = descendants(&files, source)
            .filter_map(|(path, _)| {
                let relative = path.strip_prefix(source).ok()?;
                Some((path.clone(), dest.join(relative)))
            })
            .collect();
        if moved.is_empty() {
            return Err(not_found(source));
        }
        if dest.starts_with(source) {
            return Err(invalid(dest, format!("Cannot move {source} below itself")));
        }
        if files.contains_key(dest) {
            return Err(invalid(dest, format!("Path is a file: {dest}")));
        }
        if let Some(parent) = dest.ancestors().skip(1).find(|a| files.contains_key(*a)) {
            return Err(invalid(dest, format!("Parent is a file: {parent}")));
        }

        for (from, to) in moved {
            if let Some(file) = files.remove(&from) {
                files.insert(to, file);
            }
        }
        Ok(())
    }

    async fn delete(&self, ctx: &Context, path: &Utf8Path) -> Result<(), StorageError> {
        ctx.check(NAME)?;
        path::check(NAME, path)?;

        let mut files = self.files.write().await;
        if files.remove(path).is_some() {
            return Ok(());
        }

        let removed: Vec<Utf8PathBuf> = descendants(&files, path)
            .map(|(path, _)| path.clone())
            .collect();
        if removed.is_empty() {
            return Err(not_found(path));
        }
        for path in removed {
            files.remove(&path);
        }
        Ok(())
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

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterState {
    Open,
    Committed,
    Cancelled,
}

/// Buffers written content until it is committed.
#[derive(Debug)]
struct MemoryWriter {
    files: Arc<RwLock<Files>>,
    path: Utf8PathBuf,
    buffer: Vec<u8>,
    state: WriterState,
}

impl MemoryWriter {
    fn closed(&self) -> io::Error {
        let state = match self.state {
            WriterState::Committed => "committed",
            WriterState::Cancelled => "cancelled",
            WriterState::Open => "open",
        };
        io::Error::other(format!("writer for {} already {state}", self.path))
    }

    fn ensure_open(&self) -> Result<(), StorageError> {
        if self.state != WriterState::Open {
            return Err(StorageError::builder(NAME, StorageErrorKind::InvalidRequest, self.closed())
                .path(self.path.clone())
                .build());
        }
        Ok(())
    }
}

impl AsyncWrite for MemoryWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.state != WriterState::Open {
            return Poll::Ready(Err(this.closed()));
        }
        this.buffer.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[async_trait::async_trait]
impl FileWriter for MemoryWriter {
    fn size(&self) -> u64 {
        self.buffer.len() as u64
    }

    async fn commit(&mut self) -> Result<(), StorageError> {
        self.ensure_open()?;

        let mut files = self.files.write().await;
        check_file_slot(&files, &self.path)?;
        files.insert(self.path.clone(), std::mem::take(&mut self.buffer).into());
        self.state = WriterState::Committed;
        tracing::trace!(path = %self.path, "committed memory writer");
        Ok(())
    }

    async fn cancel(&mut self) -> Result<(), StorageError> {
        self.ensure_open()?;
        self.buffer.clear();
        self.state = WriterState::Cancelled;
        Ok(())
    }
}
