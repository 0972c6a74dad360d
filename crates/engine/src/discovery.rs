//! Test file discovery

use glob::{MatchOptions, Pattern};
use std::path::{Component, Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

use crate::error::EngineResult;

/// Resolves a file-selection pattern to test files.
pub trait TestDiscovery: Send + Sync {
    fn discover(&self, pattern: &str) -> EngineResult<Vec<PathBuf>>;
}

/// Directories never searched for tests
const SKIPPED_DIRS: &[&str] = &["node_modules", "target", ".git", ".intentest"];

/// Lexically clean a relative path: `.` components go, `..` pops a preceding name.
fn clean(path: &Path) -> PathBuf {
    let mut cleaned = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if matches!(cleaned.components().next_back(), Some(Component::Normal(_))) {
                    cleaned.pop();
                } else {
                    cleaned.push("..");
                }
            }
            other => cleaned.push(other.as_os_str()),
        }
    }
    cleaned
}

/// Matches glob patterns against files below a project root.
///
/// Returned paths are relative to the root and cleaned, so every spelling of
/// a file (`./a.test.yaml`, `/abs/root/a.test.yaml`) yields the same path.
/// Files outside the root keep their absolute path.
///
/// A pattern naming an existing file selects that file; one naming a
/// directory selects the files in it that match the default pattern.
pub struct GlobDiscovery {
    root: PathBuf,
    default_pattern: String,
}

impl GlobDiscovery {
    pub fn new(root: impl Into<PathBuf>, default_pattern: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            default_pattern: default_pattern.into(),
        }
    }

    /// Express `pattern` relative to the root when it points inside it.
    fn relativize(&self, pattern: &str) -> PathBuf {
        let path = Path::new(pattern);
        if !path.is_absolute() {
            return clean(path);
        }
        let absolute = clean(path);
        let roots = [Some(clean(&self.root)), std::fs::canonicalize(&self.root).ok()];
        for root in roots.iter().flatten().filter(|r| r.is_absolute()) {
            if let Ok(relative) = absolute.strip_prefix(root) {
                return relative.to_path_buf();
            }
        }
        absolute
    }

    fn walk(&self, base: &Path, pattern: &Pattern) -> EngineResult<Vec<PathBuf>> {
        let options = MatchOptions {
            case_sensitive: true,
            require_literal_separator: false,
            require_literal_leading_dot: true,
        };

        let mut files = Vec::new();
        let walker = WalkDir::new(base).into_iter().filter_entry(|e| {
            e.depth() == 0
                || !e.file_type().is_dir()
                || !SKIPPED_DIRS.contains(&e.file_name().to_string_lossy().as_ref())
        });
        for entry in walker {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(&self.root) else {
                continue;
            };
            let relative = clean(relative);
            if pattern.matches_path_with(&relative, options) {
                files.push(relative);
            }
        }
        files.sort();
        Ok(files)
    }
}

impl TestDiscovery for GlobDiscovery {
    fn discover(&self, pattern: &str) -> EngineResult<Vec<PathBuf>> {
        let pattern = if pattern.is_empty() {
            self.default_pattern.as_str()
        } else {
            pattern
        };
        let relative = self.relativize(pattern);
        let candidate = self.root.join(&relative);

        let files = if candidate.is_file() {
            vec![relative]
        } else if candidate.is_dir() {
            let scoped = relative.join(&self.default_pattern);
            let compiled = Pattern::new(&scoped.to_string_lossy())?;
            self.walk(&candidate, &compiled)?
        } else {
            let compiled = Pattern::new(&relative.to_string_lossy())?;
            self.walk(&self.root, &compiled)?
        };

        debug!("Pattern '{}' matched {} file(s)", pattern, files.len());
        Ok(files)
    }
}
