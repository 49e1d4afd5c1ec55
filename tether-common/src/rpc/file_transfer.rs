//! Pulling per-call output directories back to the client.
//!
//! The server streams a directory as [`ArchiveEntry`] messages, files split
//! into [`CHUNK_SIZE`] pieces, and deletes it afterwards whether or not the
//! transfer succeeded. Only directories the
//! server itself created for a call can be pulled.

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

use super::Status;
use super::service::{CallStream, ServerCall, Service, ServiceId};
use crate::protocol::{ArchiveEntry, ArchiveEntryKind, PullDirectoryRequest};

/// Raw file bytes carried by one [`ArchiveEntry`].
pub const CHUNK_SIZE: usize = 256 * 1024;

/// Output directories handed out by the server and not yet pulled.
#[derive(Debug, Default)]
pub struct OutDirRegistry {
    dirs: Mutex<HashSet<PathBuf>>,
}

impl OutDirRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, path: PathBuf) {
        self.lock().insert(path);
    }

    /// Remove `path`, returning whether it was registered.
    pub fn take(&self, path: &Path) -> bool {
        self.lock().remove(path)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<PathBuf>> {
        self.dirs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub(crate) struct FileTransferService {
    registry: Arc<OutDirRegistry>,
}

impl FileTransferService {
    pub(crate) fn new(registry: Arc<OutDirRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Service for FileTransferService {
    fn id(&self) -> ServiceId {
        ServiceId::FileTransfer
    }

    async fn handle(&self, mut call: ServerCall) -> Result<(), Status> {
        if call.method != "PullDirectory" {
            return Err(Status::unimplemented(format!(
                "unknown method FileTransfer.{}",
                call.method
            )));
        }
        let request: PullDirectoryRequest = call.stream.recv_one().await?;
        let path = PathBuf::from(&request.path);
        if !self.registry.take(&path) {
            return Err(Status::permission_denied(format!(
                "{} is not a pullable output directory",
                request.path
            )));
        }

        // Removal happens on drop so a cancelled transfer still cleans up.
        let _cleanup = RemoveOnDrop(path.clone());
        debug!(discard = request.discard, "Releasing output directory {}", path.display());
        if request.discard {
            return Ok(());
        }
        stream_directory(&path, &call.stream).await
    }
}

struct RemoveOnDrop(PathBuf);

impl Drop for RemoveOnDrop {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.0) {
            warn!("Failed to remove output directory {}: {}", self.0.display(), e);
        }
    }
}

/// Send every entry under `root`, parents before children.
async fn stream_directory(root: &Path, stream: &CallStream) -> Result<(), Status> {
    let io_err = |path: &Path, e: std::io::Error| Status::internal(format!("{}: {e}", path.display()));
    let mut pending = vec![PathBuf::new()];
    while let Some(rel) = pending.pop() {
        let dir = root.join(&rel);
        let mut reader = tokio::fs::read_dir(&dir).await.map_err(|e| io_err(&dir, e))?;
        let mut names = Vec::new();
        while let Some(entry) = reader.next_entry().await.map_err(|e| io_err(&dir, e))? {
            names.push(entry.file_name());
        }
        names.sort();

        for name in names {
            let rel_path = rel.join(&name);
            let abs = root.join(&rel_path);
            let meta = tokio::fs::symlink_metadata(&abs).await.map_err(|e| io_err(&abs, e))?;
            let path = rel_path.to_string_lossy().into_owned();
            if meta.is_dir() {
                pending.push(rel_path);
                stream
                    .send(&ArchiveEntry {
                        path,
                        kind: ArchiveEntryKind::Dir,
                        mode: file_mode(&meta),
                        data: String::new(),
                        append: false,
                    })
                    .await?;
            } else if meta.file_type().is_symlink() {
                let target = tokio::fs::read_link(&abs).await.map_err(|e| io_err(&abs, e))?;
                stream
                    .send(&ArchiveEntry {
                        path,
                        kind: ArchiveEntryKind::Symlink,
                        mode: 0,
                        data: target.to_string_lossy().into_owned(),
                        append: false,
                    })
                    .await?;
            } else {
                stream_file(&abs, path, file_mode(&meta), stream).await?;
            }
        }
    }
    Ok(())
}

/// Send one file as entries of at most [`CHUNK_SIZE`] raw bytes each. The
/// mode is carried by the last entry only.
async fn stream_file(abs: &Path, path: String, mode: u32, stream: &CallStream) -> Result<(), Status> {
    let io_err = |e: std::io::Error| Status::internal(format!("{}: {e}", abs.display()));
    let mut file = tokio::fs::File::open(abs).await.map_err(io_err)?;
    let mut current = read_chunk(&mut file).await.map_err(io_err)?;
    let mut append = false;
    loop {
        let next = if current.len() < CHUNK_SIZE {
            Vec::new()
        } else {
            read_chunk(&mut file).await.map_err(io_err)?
        };
        let last = next.is_empty();
        stream
            .send(&ArchiveEntry {
                path: path.clone(),
                kind: ArchiveEntryKind::File,
                mode: if last { mode } else { 0 },
                data: BASE64.encode(&current),
                append,
            })
            .await?;
        if last {
            return Ok(());
        }
        current = next;
        append = true;
    }
}

/// Fill a buffer of up to [`CHUNK_SIZE`] bytes, stopping early only at EOF.
async fn read_chunk(file: &mut tokio::fs::File) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(CHUNK_SIZE);
    (&mut *file).take(CHUNK_SIZE as u64).read_to_end(&mut buf).await?;
    Ok(buf)
}

#[cfg(unix)]
fn file_mode(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn file_mode(_meta: &std::fs::Metadata) -> u32 {
    0o644
}

/// Resolve an archive path under `dst`, refusing anything that would escape.
pub fn safe_join(dst: &Path, rel: &str) -> Result<PathBuf, std::io::Error> {
    let rel = Path::new(rel);
    if rel.as_os_str().is_empty()
        || !rel.components().all(|c| matches!(c, Component::Normal(_)))
    {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("refusing unsafe archive path {}", rel.display()),
        ));
    }
    Ok(dst.join(rel))
}

/// Write one received entry under `dst`.
pub async fn extract_entry(dst: &Path, entry: &ArchiveEntry) -> std::io::Result<()> {
    let target = safe_join(dst, &entry.path)?;
    match entry.kind {
        ArchiveEntryKind::Dir => {
            tokio::fs::create_dir_all(&target).await?;
        }
        ArchiveEntryKind::File => {
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let bytes = BASE64
                .decode(&entry.data)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            if entry.append {
                let mut file = tokio::fs::OpenOptions::new().append(true).open(&target).await?;
                file.write_all(&bytes).await?;
                file.flush().await?;
            } else {
                tokio::fs::write(&target, bytes).await?;
            }
            set_mode(&target, entry.mode).await?;
        }
        ArchiveEntryKind::Symlink => {
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            #[cfg(unix)]
            tokio::fs::symlink(&entry.data, &target).await?;
            #[cfg(not(unix))]
            debug!("Skipping symlink {} on this platform", entry.path);
        }
    }
    Ok(())
}

#[cfg(unix)]
async fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    if mode == 0 {
        return Ok(());
    }
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await
}

#[cfg(not(unix))]
async fn set_mode(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}
