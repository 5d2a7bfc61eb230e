use std::{fs, io, path::Path};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const BROKEN_LINK_TARGET: &str = "broken symlink";

const PARTIAL_UPLOAD_SUFFIX: &str = ".part";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub name: String,
    pub path: String,
    pub size: u64,
    pub mod_time: DateTime<Utc>,
    pub is_dir: bool,
    pub extension: String,
    pub relative_path: String,
    pub is_symlink: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link_target: Option<String>,
}

impl FileEntry {
    /// Broken links keep the link's mtime and a zero size.
    pub fn inspect(abs: &Path, name: &str, relative_path: &str) -> io::Result<Self> {
        let link_meta = fs::symlink_metadata(abs)?;
        let is_symlink = link_meta.file_type().is_symlink();

        let mut entry = FileEntry {
            name: name.to_string(),
            path: abs.to_string_lossy().into_owned(),
            size: 0,
            mod_time: modified(&link_meta),
            is_dir: false,
            extension: String::new(),
            relative_path: relative_path.to_string(),
            is_symlink,
            link_target: None,
        };

        let resolved = if is_symlink {
            let target = match fs::read_link(abs) {
                Ok(target) => target.to_string_lossy().into_owned(),
                Err(_) => {
                    entry.link_target = Some(BROKEN_LINK_TARGET.into());
                    return Ok(entry);
                }
            };
            match fs::metadata(abs) {
                Ok(meta) => {
                    entry.link_target = Some(target);
                    meta
                }
                Err(_) => {
                    entry.link_target = Some(format!("{target} (broken)"));
                    return Ok(entry);
                }
            }
        } else {
            link_meta
        };

        entry.size = resolved.len();
        entry.mod_time = modified(&resolved);
        entry.is_dir = resolved.is_dir();
        if !entry.is_dir {
            entry.extension = extension_of(name);
        }
        Ok(entry)
    }

    pub fn is_broken_link(&self) -> bool {
        self.is_symlink
            && self
                .link_target
                .as_deref()
                .is_some_and(|t| t == BROKEN_LINK_TARGET || t.ends_with(" (broken)"))
    }
}

pub fn extension_of(name: &str) -> String {
    name.rfind('.')
        .map(|pos| name[pos..].to_lowercase())
        .unwrap_or_default()
}

/// Hidden sibling an upload is streamed into before it is renamed to `leaf`.
pub fn partial_upload_name(leaf: &str, upload_id: &str) -> String {
    format!(".{leaf}.{upload_id}{PARTIAL_UPLOAD_SUFFIX}")
}

pub fn is_partial_upload(name: &str) -> bool {
    name.strip_prefix('.')
        .and_then(|rest| rest.strip_suffix(PARTIAL_UPLOAD_SUFFIX))
        .and_then(|rest| rest.rsplit_once('.'))
        .is_some_and(|(leaf, id)| {
            !leaf.is_empty() && id.len() == 32 && id.bytes().all(|b| b.is_ascii_hexdigit())
        })
}

fn modified(meta: &fs::Metadata) -> DateTime<Utc> {
    meta.modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileIndex {
    pub files: Vec<FileEntry>,
    pub directories: Vec<FileEntry>,
    pub last_indexed: DateTime<Utc>,
    pub total_files: usize,
    pub total_size: u64,
}

impl FileIndex {
    pub fn empty() -> Self {
        Self {
            files: Vec::new(),
            directories: Vec::new(),
            last_indexed: Utc::now(),
            total_files: 0,
            total_size: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryListing {
    pub path: String,
    pub files: Vec<FileEntry>,
}
