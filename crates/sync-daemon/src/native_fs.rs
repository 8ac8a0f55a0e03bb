//! Native filesystem implementation using tokio::fs.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::PathBuf;
use sync_core::fs::{FileEntry, FileStat, FileSystem, FsError, Result};
use tokio::fs;

/// Native filesystem rooted at the synced folder
pub struct NativeFs {
    base_path: PathBuf,
}

impl NativeFs {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    fn full_path(&self, path: &str) -> PathBuf {
        if path.is_empty() {
            self.base_path.clone()
        } else {
            self.base_path.join(path)
        }
    }
}

fn map_err(path: &str, e: std::io::Error) -> FsError {
    match e.kind() {
        ErrorKind::NotFound => FsError::NotFound(path.to_string()),
        _ => FsError::Io(format!("{path}: {e}")),
    }
}

#[async_trait]
impl FileSystem for NativeFs {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        fs::read(self.full_path(path))
            .await
            .map_err(|e| map_err(path, e))
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        let full_path = self.full_path(path);

        // Create parent directories if needed
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| map_err(path, e))?;
        }

        // Write beside the target then rename, so readers never see half a file
        let file_name = full_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| FsError::IsDirectory(path.to_string()))?;
        let tmp_path = full_path.with_file_name(format!(".{file_name}.sync.tmp"));
        fs::write(&tmp_path, content)
            .await
            .map_err(|e| map_err(path, e))?;
        if let Err(e) = fs::rename(&tmp_path, &full_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(map_err(path, e));
        }
        Ok(())
    }

    async fn list(&self, path: &str) -> Result<Vec<FileEntry>> {
        let mut entries = Vec::new();

        let mut dir = fs::read_dir(self.full_path(path))
            .await
            .map_err(|e| map_err(path, e))?;

        while let Some(entry) = dir.next_entry().await.map_err(|e| map_err(path, e))? {
            let name = entry.file_name().to_string_lossy().to_string();
            // Symlinks are not followed
            let file_type = entry.file_type().await.map_err(|e| map_err(path, e))?;
            if file_type.is_symlink() {
                continue;
            }

            entries.push(FileEntry {
                name,
                is_dir: file_type.is_dir(),
            });
        }

        Ok(entries)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let full_path = self.full_path(path);
        let metadata = fs::metadata(&full_path)
            .await
            .map_err(|e| map_err(path, e))?;

        if metadata.is_dir() {
            fs::remove_dir(&full_path)
                .await
                .map_err(|e| map_err(path, e))
        } else {
            fs::remove_file(&full_path)
                .await
                .map_err(|e| map_err(path, e))
        }
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        fs::try_exists(self.full_path(path))
            .await
            .map_err(|e| map_err(path, e))
    }

    async fn stat(&self, path: &str) -> Result<FileStat> {
        let metadata = fs::metadata(self.full_path(path))
            .await
            .map_err(|e| map_err(path, e))?;

        let mtime_millis = metadata
            .modified()
            .map(|t| {
                t.duration_since(std::time::UNIX_EPOCH)
                    .map(|d| d.as_millis() as u64)
                    .unwrap_or(0)
            })
            .unwrap_or(0);

        Ok(FileStat {
            mtime_millis,
            size: metadata.len(),
            is_dir: metadata.is_dir(),
        })
    }
}
