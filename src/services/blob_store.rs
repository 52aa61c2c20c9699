//! src/services/blob_store.rs
//!
//! BlobStore: out-of-line storage for large item payloads. Files live
//! beneath `base_path/{shard}/{shard}/{item-id}` where the shards are the
//! first two bytes of MD5(item id). The item row keeps the relative path.

use bytes::Bytes;
use futures::{Stream, StreamExt, pin_mut, stream};
use md5::Context;
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, File},
    io::{AsyncReadExt, AsyncWriteExt},
};
use tracing::debug;
use uuid::Uuid;

/// A payload written to disk.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredBlob {
    /// Path relative to the blob root, as stored in the item row.
    pub relative_path: String,
    pub size_bytes: i64,
    /// Lowercase hex MD5 of the payload.
    pub checksum: String,
}

#[derive(Clone, Debug)]
pub struct BlobStore {
    base_path: PathBuf,
}

impl BlobStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Create the blob root if it does not exist yet.
    pub async fn ensure_root(&self) -> io::Result<()> {
        fs::create_dir_all(&self.base_path).await
    }

    /// Two-level shard identifiers for an item id.
    fn shards(id: Uuid) -> (String, String) {
        let digest = md5::compute(id.as_bytes());
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    pub fn relative_path(id: Uuid) -> String {
        let (shard_a, shard_b) = Self::shards(id);
        format!("{}/{}/{}", shard_a, shard_b, id)
    }

    fn absolute(&self, relative: &str) -> PathBuf {
        let mut path = self.base_path.clone();
        for segment in relative.split('/') {
            path.push(segment);
        }
        path
    }

    /// Write an in-memory payload for `id`.
    pub async fn write(&self, id: Uuid, bytes: Bytes) -> io::Result<StoredBlob> {
        self.write_stream(id, stream::once(async move { Ok(bytes) }))
            .await
    }

    /// Stream a payload to disk.
    ///
    /// Bytes go to a temporary file first, are fsynced, and then renamed
    /// into place, so a reader never sees a partial payload. The temporary
    /// file is removed on any error.
    pub async fn write_stream<S>(&self, id: Uuid, stream: S) -> io::Result<StoredBlob>
    where
        S: Stream<Item = io::Result<Bytes>>,
    {
        let relative_path = Self::relative_path(id);
        let file_path = self.absolute(&relative_path);
        let parent = file_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            io::Error::new(ErrorKind::Other, "blob path missing parent directory")
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await?;

        let mut size_bytes: i64 = 0;
        let mut digest = Context::new();
        pin_mut!(stream);
        while let Some(chunk_res) = stream.next().await {
            let chunk = match chunk_res {
                Ok(chunk) => chunk,
                Err(err) => {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(err);
                }
            };
            size_bytes += chunk.len() as i64;
            digest.consume(&chunk);
            if let Err(err) = file.write_all(&chunk).await {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(err);
            }
        }
        if let Err(err) = file.flush().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err);
        }
        if let Err(err) = file.sync_all().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err);
        }
        drop(file);

        if let Err(err) = fs::rename(&tmp_path, &file_path).await {
            if err.kind() == ErrorKind::AlreadyExists {
                fs::remove_file(&file_path).await?;
                fs::rename(&tmp_path, &file_path).await?;
            } else {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(err);
            }
        }

        debug!("wrote blob {} ({} bytes)", relative_path, size_bytes);
        Ok(StoredBlob {
            relative_path,
            size_bytes,
            checksum: format!("{:x}", digest.compute()),
        })
    }

    /// Open a blob for streaming out.
    pub async fn open(&self, relative: &str) -> io::Result<File> {
        File::open(self.absolute(relative)).await
    }

    pub async fn read(&self, relative: &str) -> io::Result<Bytes> {
        let mut file = self.open(relative).await?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).await?;
        Ok(Bytes::from(buf))
    }

    /// Remove a blob and prune the shard directories it leaves empty.
    /// A blob that is already gone is not an error.
    pub async fn remove(&self, relative: &str) -> io::Result<()> {
        let file_path = self.absolute(relative);
        match fs::remove_file(&file_path).await {
            Ok(_) => debug!("removed blob {}", file_path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("blob {} already missing", file_path.display());
            }
            Err(err) => return Err(err),
        }

        if let Some(parent) = file_path.parent() {
            self.prune_empty_dirs(parent, &self.base_path).await;
        }
        Ok(())
    }

    /// Remove blobs after a committed delete. Failures only leave orphaned
    /// files behind, so they are logged and ignored.
    pub async fn remove_all(&self, relatives: &[String]) {
        for relative in relatives {
            if let Err(err) = self.remove(relative).await {
                debug!("failed to remove blob {}: {}", relative, err);
            }
        }
    }

    /// Relative paths of every file in the shard directories, including
    /// temp files an interrupted write left behind.
    pub async fn list(&self) -> io::Result<Vec<String>> {
        let mut found = Vec::new();
        let mut shards_a = match fs::read_dir(&self.base_path).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(found),
            Err(err) => return Err(err),
        };
        while let Some(shard_a) = shards_a.next_entry().await? {
            if !shard_a.file_type().await?.is_dir() {
                continue;
            }
            let mut shards_b = fs::read_dir(shard_a.path()).await?;
            while let Some(shard_b) = shards_b.next_entry().await? {
                if !shard_b.file_type().await?.is_dir() {
                    continue;
                }
                let mut files = fs::read_dir(shard_b.path()).await?;
                while let Some(file) = files.next_entry().await? {
                    if file.file_type().await?.is_file() {
                        found.push(format!(
                            "{}/{}/{}",
                            shard_a.file_name().to_string_lossy(),
                            shard_b.file_name().to_string_lossy(),
                            file.file_name().to_string_lossy()
                        ));
                    }
                }
            }
        }
        Ok(found)
    }

    /// Walk up from `start` removing empty directories until `stop`.
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

/// Hex MD5 of an inline payload, matching what `write_stream` records.
pub fn checksum_of(bytes: &[u8]) -> String {
    format!("{:x}", md5::compute(bytes))
}
