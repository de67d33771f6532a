use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tempfile::NamedTempFile;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use super::{ReadSlot, SlotStore, WriteSlot};
use crate::key::BucketKey;

/// Computes the sharded location of `key`.
///
/// The first `depth` characters of the key are split into pairs, each pair becoming one nested
/// directory, so the default depth of 4 yields two levels with at most 256 entries each. The
/// rest of the key becomes the file name. Keys too short to fill all levels always keep at least
/// one character for the file name.
///
/// ```
/// # use std::path::Path;
/// # use coalescer::slot::shard_path;
/// assert_eq!(shard_path("a1b2c3d4e5", 4), Path::new("a1/b2/c3d4e5"));
/// ```
pub fn shard_path(key: &str, depth: usize) -> PathBuf {
    let mut path = PathBuf::new();
    let mut rest = key;
    let mut sharded = 0;
    while sharded < depth && rest.len() > 2 && rest.is_char_boundary(2) {
        let (segment, tail) = rest.split_at(2);
        path.push(segment);
        rest = tail;
        sharded += 2;
    }
    path.push(rest);
    path
}

/// A [`SlotStore`] keeping every resource in a file below a root directory.
///
/// Writes go to a temporary file under `<root>/tmp` first, and are moved into place on commit.
#[derive(Clone, Debug)]
pub struct FileStore {
    root: PathBuf,
    tmp_dir: PathBuf,
    depth: usize,
}

impl FileStore {
    /// The default number of sharded key characters.
    pub const DEFAULT_DEPTH: usize = 4;

    /// Creates a store at `root`, creating the directory if needed.
    pub fn new(root: impl Into<PathBuf>, depth: usize) -> io::Result<Self> {
        let root = root.into();
        let tmp_dir = root.join("tmp");
        fs::create_dir_all(&tmp_dir)?;
        Ok(Self {
            root,
            tmp_dir,
            depth,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The absolute location of the file for `key`.
    pub fn path_for(&self, key: &BucketKey) -> PathBuf {
        self.root.join(shard_path(key.as_str(), self.depth))
    }
}

#[async_trait]
impl SlotStore for FileStore {
    async fn get(&self, key: &BucketKey) -> io::Result<Option<ReadSlot>> {
        let path = self.path_for(key);
        tracing::trace!("Trying cache at path {}", path.display());
        match tokio::fs::File::open(&path).await {
            Ok(file) => Ok(Some(Box::new(file))),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(error),
        }
    }

    async fn lock(&self, key: &BucketKey) -> io::Result<Box<dyn WriteSlot>> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::create_dir_all(&self.tmp_dir).await?;

        let temp = tempfile::Builder::new()
            .prefix(".slot")
            .tempfile_in(&self.tmp_dir)?;
        let file = tokio::fs::File::from_std(temp.reopen()?);
        tracing::trace!("Writing cache slot for {}", path.display());

        Ok(Box::new(FileSlot { file, temp, path }))
    }
}

/// A pending write to a [`FileStore`].
struct FileSlot {
    file: tokio::fs::File,
    temp: NamedTempFile,
    path: PathBuf,
}

impl AsyncWrite for FileSlot {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.file).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.file).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.file).poll_shutdown(cx)
    }
}

#[async_trait]
impl WriteSlot for FileSlot {
    async fn commit(self: Box<Self>) -> io::Result<()> {
        let FileSlot {
            mut file,
            temp,
            path,
        } = *self;
        file.flush().await?;
        drop(file);

        tokio::task::spawn_blocking(move || persist_tempfile(temp, &path))
            .await
            .map_err(io::Error::other)?
    }
}

/// Moves `temp_file` to `path`, recreating the parent directories if they went missing.
fn persist_tempfile(mut temp_file: NamedTempFile, path: &Path) -> io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| io::Error::other("no parent directory to persist item"))?;

    const MAX_RETRIES: usize = 2;
    let mut retries = 0;
    loop {
        retries += 1;

        if let Err(error) = fs::create_dir_all(parent) {
            tracing::error!(
                path = %parent.display(),
                error = &error as &dyn std::error::Error,
                "Failed to create cache directory"
            );
            if retries > MAX_RETRIES {
                return Err(error);
            }
            continue;
        }

        match temp_file.persist(path) {
            Ok(_) => return Ok(()),
            Err(error) => {
                temp_file = error.file;
                let error = error.error;
                tracing::error!(
                    path = %path.display(),
                    error = &error as &dyn std::error::Error,
                    "Failed to persist cache file"
                );
                if retries > MAX_RETRIES {
                    return Err(error);
                }
            }
        }
    }
}
