//! Package lookup: find an installed package by name and minimum version, list its files.

use std::cmp::Ordering;
use std::path::{Path, PathBuf};

use tracing::debug;
use walkdir::WalkDir;

use crate::error::{Result, RouterError};

/// Resolves `service/<name>/<version>/...` segments to an installed package.
pub trait PackageLocator: Send + Sync {
    fn find_package(&self, name: &str, version: &str) -> Result<Package>;
}

/// An installed package rooted at a directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Package {
    pub name: String,
    pub version: String,
    pub root: PathBuf,
}

impl Package {
    /// All regular files under the package root, recursively. Entries that cannot be
    /// read are skipped; symlinks are not followed.
    pub fn files(&self) -> Vec<PathBuf> {
        let mut out: Vec<PathBuf> = WalkDir::new(&self.root)
            .into_iter()
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(e) => {
                    debug!(root = %self.root.display(), "skipping package entry: {}", e);
                    None
                }
            })
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .collect();
        out.sort();
        out
    }

    /// First file whose name is `file_name` (case-insensitive, as process names come from URLs).
    pub fn find_file(&self, file_name: &str) -> Option<PathBuf> {
        self.files().into_iter().find(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.eq_ignore_ascii_case(file_name))
                .unwrap_or(false)
        })
    }
}

/// Packages laid out as `<root>/<name>/<version>/`. The requested version is a minimum:
/// an exact match wins, otherwise the highest installed version above it.
#[derive(Debug, Clone, Default)]
pub struct DirectoryLocator {
    roots: Vec<PathBuf>,
}

impl DirectoryLocator {
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self { roots }
    }

    fn find_in_root(root: &Path, name: &str, version: &str) -> Option<(String, PathBuf)> {
        let package_dir = root.join(name);
        let exact = package_dir.join(version);
        if exact.is_dir() {
            return Some((version.to_string(), exact));
        }
        let entries = std::fs::read_dir(&package_dir).ok()?;
        entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .filter_map(|e| {
                let v = e.file_name().to_str()?.to_string();
                (compare_versions(&v, version) != Ordering::Less).then(|| (v, e.path()))
            })
            .max_by(|(a, _), (b, _)| compare_versions(a, b))
    }
}

impl PackageLocator for DirectoryLocator {
    fn find_package(&self, name: &str, version: &str) -> Result<Package> {
        for root in &self.roots {
            if let Some((found, path)) = Self::find_in_root(root, name, version) {
                debug!(package = name, version = %found, root = %path.display(), "located package");
                return Ok(Package {
                    name: name.to_string(),
                    version: found,
                    root: path,
                });
            }
        }
        Err(RouterError::PackageNotFound {
            name: name.to_string(),
            version: version.to_string(),
        })
    }
}

/// Compare dotted versions numerically component by component; a non-numeric
/// component compares as text. Missing components count as zero.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let mut ai = a.split(&['.', '-'][..]);
    let mut bi = b.split(&['.', '-'][..]);
    loop {
        match (ai.next(), bi.next()) {
            (None, None) => return Ordering::Equal,
            (x, y) => {
                let x = x.unwrap_or("0");
                let y = y.unwrap_or("0");
                let ord = match (x.parse::<u64>(), y.parse::<u64>()) {
                    (Ok(x), Ok(y)) => x.cmp(&y),
                    _ => x.cmp(y),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}
