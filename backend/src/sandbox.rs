use std::path::{Component, Path, PathBuf};

use tracing::warn;

use crate::error::AppError;

#[derive(Debug, Clone)]
pub struct Sandbox {
    root: PathBuf,
}

impl Sandbox {
    /// `root` must already be canonical.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    // Lexical only, no filesystem access.
    pub fn resolve(&self, requested: &str) -> Result<PathBuf, AppError> {
        let trimmed = requested.trim_start_matches('/');
        let joined = self.root.join(trimmed);
        let normalized = normalize(&joined);

        if normalized.starts_with(&self.root) {
            Ok(normalized)
        } else {
            warn!(requested, "path escapes the served root");
            Err(AppError::access_denied())
        }
    }

    pub fn resolve_below_root(&self, requested: &str) -> Result<PathBuf, AppError> {
        let resolved = self.resolve(requested)?;
        if resolved == self.root {
            warn!(requested, "operation targets the served root");
            return Err(AppError::access_denied());
        }
        Ok(resolved)
    }

    pub fn resolve_child(&self, dir: &Path, name: &str) -> Result<PathBuf, AppError> {
        validate_leaf(name)?;
        let candidate = dir.join(name);
        if candidate.starts_with(&self.root) && candidate != self.root {
            Ok(candidate)
        } else {
            Err(AppError::access_denied())
        }
    }

    pub fn contains(&self, path: &Path) -> bool {
        path.starts_with(&self.root)
    }

    pub fn relative(&self, abs: &Path) -> String {
        abs.strip_prefix(&self.root)
            .map(|rel| {
                rel.components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/")
            })
            .unwrap_or_default()
    }
}

pub fn validate_leaf(name: &str) -> Result<(), AppError> {
    if name.is_empty() || name == "." || name == ".." {
        return Err(AppError::BadRequest(format!("invalid name: {name:?}")));
    }
    if name.contains(['/', '\\', '\0']) {
        return Err(AppError::BadRequest(
            "name must not contain path separators".into(),
        ));
    }
    Ok(())
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
