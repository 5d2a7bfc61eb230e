use std::{
    io,
    path::{Path, PathBuf},
};

use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    error::AppError,
    index::IndexHandle,
    models::files::{DirectoryListing, FileEntry, is_partial_upload, partial_upload_name},
    sandbox::{Sandbox, validate_leaf},
};

#[derive(Clone)]
pub struct FileOps {
    sandbox: Sandbox,
    index: IndexHandle,
}

pub struct Download {
    pub file: File,
    pub file_name: String,
    pub len: u64,
}

/// Dropping it before [`FileOps::finish_upload`] discards the partial file.
pub struct PendingUpload {
    file: Option<File>,
    temp_path: PathBuf,
    destination: PathBuf,
    written: u64,
    finished: bool,
}

impl FileOps {
    pub fn new(sandbox: Sandbox, index: IndexHandle) -> Self {
        Self { sandbox, index }
    }

    pub async fn browse(&self, requested: &str) -> Result<DirectoryListing, AppError> {
        let dir = self.sandbox.resolve(requested)?;
        self.ensure_real_location(&dir).await?;
        let meta = fs::metadata(&dir)
            .await
            .map_err(|_| AppError::NotFound("Path not found".into()))?;
        if !meta.is_dir() {
            return Err(AppError::BadRequest("Path is not a directory".into()));
        }

        let relative_dir = self.sandbox.relative(&dir);
        let listing_path = relative_dir.clone();
        let files = tokio::task::spawn_blocking(move || list_children(&dir, &relative_dir))
            .await
            .map_err(|err| AppError::Internal(format!("directory listing panicked: {err}")))?
            .map_err(|err| AppError::Internal(format!("Failed to read directory: {err}")))?;

        Ok(DirectoryListing {
            path: listing_path,
            files,
        })
    }

    pub async fn open_download(&self, requested: &str) -> Result<Download, AppError> {
        let path = self.sandbox.resolve(requested)?;
        self.ensure_real_location(&path).await?;
        let meta = fs::metadata(&path)
            .await
            .map_err(|_| AppError::NotFound("File not found".into()))?;
        if meta.is_dir() {
            return Err(AppError::BadRequest("Cannot download directory".into()));
        }

        let file = File::open(&path).await.map_err(|err| match err.kind() {
            io::ErrorKind::NotFound => AppError::NotFound("File not found".into()),
            _ => AppError::Io(err),
        })?;
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "download".into());

        Ok(Download {
            file,
            file_name,
            len: meta.len(),
        })
    }

    pub async fn begin_upload(
        &self,
        requested_dir: &str,
        file_name: &str,
    ) -> Result<PendingUpload, AppError> {
        let dir = self.sandbox.resolve(requested_dir)?;
        let leaf = leaf_of(file_name);
        let destination = self.sandbox.resolve_child(&dir, leaf)?;
        self.ensure_real_location(&dir).await?;

        fs::create_dir_all(&dir)
            .await
            .map_err(|err| AppError::Internal(format!("Failed to create directory: {err}")))?;

        let upload_id = Uuid::new_v4().simple().to_string();
        let temp_path = dir.join(partial_upload_name(leaf, &upload_id));
        let file = File::create(&temp_path)
            .await
            .map_err(|err| AppError::Internal(format!("Failed to create file: {err}")))?;

        Ok(PendingUpload {
            file: Some(file),
            temp_path,
            destination,
            written: 0,
            finished: false,
        })
    }

    pub async fn finish_upload(&self, mut upload: PendingUpload) -> Result<PathBuf, AppError> {
        if let Some(mut file) = upload.file.take() {
            file.flush()
                .await
                .map_err(|err| AppError::Internal(format!("Failed to save file: {err}")))?;
            file.sync_all()
                .await
                .map_err(|err| AppError::Internal(format!("Failed to save file: {err}")))?;
        }
        fs::rename(&upload.temp_path, &upload.destination)
            .await
            .map_err(|err| AppError::Internal(format!("Failed to save file: {err}")))?;
        upload.finished = true;

        info!(
            path = %self.sandbox.relative(&upload.destination),
            bytes = upload.written,
            "file uploaded"
        );
        self.index.schedule_rebuild();
        Ok(upload.destination.clone())
    }

    pub async fn rename(&self, requested: &str, new_name: &str) -> Result<PathBuf, AppError> {
        let source = self.sandbox.resolve_below_root(requested)?;
        validate_leaf(new_name)?;
        let parent = source.parent().ok_or_else(AppError::access_denied)?;
        let target = self.sandbox.resolve_child(parent, new_name)?;
        self.ensure_real_location(parent).await?;

        fs::rename(&source, &target)
            .await
            .map_err(|err| AppError::Internal(format!("Failed to rename file: {err}")))?;

        info!(
            from = %self.sandbox.relative(&source),
            to = %self.sandbox.relative(&target),
            "renamed"
        );
        self.index.schedule_rebuild();
        Ok(target)
    }

    // A missing target is not an error.
    pub async fn delete(&self, requested: &str) -> Result<(), AppError> {
        let path = self.sandbox.resolve_below_root(requested)?;
        if let Some(parent) = path.parent() {
            self.ensure_real_location(parent).await?;
        }

        let outcome = match fs::symlink_metadata(&path).await {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(&path).await,
            Ok(_) => fs::remove_file(&path).await,
            Err(err) => Err(err),
        };
        match outcome {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(AppError::Internal(format!("Failed to delete file: {err}")));
            }
        }

        info!(path = %self.sandbox.relative(&path), "deleted");
        self.index.schedule_rebuild();
        Ok(())
    }

    pub async fn mkdir(&self, requested: &str, name: &str) -> Result<PathBuf, AppError> {
        if name.trim_matches('/').is_empty() {
            return Err(AppError::BadRequest("Directory name is required".into()));
        }
        let combined = format!("{}/{}", requested.trim_end_matches('/'), name);
        let path = self.sandbox.resolve_below_root(&combined)?;
        self.ensure_real_location(&path).await?;

        fs::create_dir_all(&path)
            .await
            .map_err(|err| AppError::Internal(format!("Failed to create directory: {err}")))?;

        info!(path = %self.sandbox.relative(&path), "directory created");
        self.index.schedule_rebuild();
        Ok(path)
    }
}

impl FileOps {
    // Symlinks inside the root may point anywhere; follow the deepest
    // existing ancestor and require its real location to stay under the root.
    async fn ensure_real_location(&self, path: &Path) -> Result<(), AppError> {
        for ancestor in path.ancestors() {
            match fs::canonicalize(ancestor).await {
                Ok(real) if self.sandbox.contains(&real) => return Ok(()),
                Ok(real) => {
                    warn!(
                        path = %self.sandbox.relative(path),
                        real = %real.display(),
                        "symlink leads outside the served root"
                    );
                    return Err(AppError::access_denied());
                }
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => return Err(AppError::Io(err)),
            }
        }
        Err(AppError::access_denied())
    }
}

impl PendingUpload {
    pub async fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), AppError> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| AppError::Internal("upload already closed".into()))?;
        file.write_all(chunk)
            .await
            .map_err(|err| AppError::Internal(format!("Failed to save file: {err}")))?;
        self.written += chunk.len() as u64;
        Ok(())
    }
}

impl Drop for PendingUpload {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        drop(self.file.take());
        if let Err(err) = std::fs::remove_file(&self.temp_path)
            && err.kind() != io::ErrorKind::NotFound
        {
            warn!(path = %self.temp_path.display(), error = %err, "failed to remove partial upload");
        }
    }
}

fn list_children(dir: &Path, relative_dir: &str) -> io::Result<Vec<FileEntry>> {
    let mut entries = Vec::new();
    for item in std::fs::read_dir(dir)? {
        let Ok(item) = item else { continue };
        let name = item.file_name().to_string_lossy().into_owned();
        if is_partial_upload(&name) {
            continue;
        }
        let relative = if relative_dir.is_empty() {
            name.clone()
        } else {
            format!("{relative_dir}/{name}")
        };
        if let Ok(entry) = FileEntry::inspect(&item.path(), &name, &relative) {
            entries.push(entry);
        }
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

fn leaf_of(file_name: &str) -> &str {
    file_name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(file_name)
}
