//! DGID resolution and grid enumeration under the context root

use crate::config::EngineContext;
use crate::error::{DgError, DgResult};
use crate::storage::sqlite::FILE_EXTENSION;
use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;
use walkdir::WalkDir;

/// Path of the grid file `dgid` names.
///
/// A DGID is a path relative to the root; the `.datagrid` extension may be
/// left off. Absolute paths and `..` components are rejected.
pub fn resolve(context: &EngineContext, dgid: &str) -> DgResult<PathBuf> {
    let relative = Path::new(dgid);
    if dgid.is_empty() {
        return Err(DgError::InvalidArguments("empty dgid".to_string()));
    }
    for component in relative.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(DgError::InvalidArguments(format!(
                    "dgid '{}' escapes the data root",
                    dgid
                )));
            }
        }
    }

    let path = context.root().join(relative);
    if path.is_file() {
        return Ok(path);
    }
    let with_extension = context.root().join(format!("{}.{}", dgid, FILE_EXTENSION));
    if with_extension.is_file() {
        return Ok(with_extension);
    }
    Err(DgError::FileNotFound(path))
}

/// A grid file found under the root.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GridEntry {
    pub dgid: String,
    pub size: u64,
    pub modified: f64,
}

/// Every `.datagrid` file under the root, sorted by DGID. Symlinks are
/// skipped, not followed.
pub fn list(context: &EngineContext) -> DgResult<Vec<GridEntry>> {
    let root = context.root();
    if !root.is_dir() {
        return Ok(Vec::new());
    }
    let mut entries = Vec::new();
    for entry in WalkDir::new(root) {
        let entry = entry.map_err(io::Error::from)?;
        let path = entry.path();
        if !entry.file_type().is_file()
            || path.extension().and_then(|e| e.to_str()) != Some(FILE_EXTENSION)
        {
            continue;
        }
        let Ok(relative) = path.strip_prefix(root) else {
            continue;
        };
        let dgid = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        entries.push(GridEntry {
            dgid,
            size: entry.metadata().map_err(io::Error::from)?.len(),
            modified: modified_seconds(path)?,
        });
    }
    entries.sort_by(|a, b| a.dgid.cmp(&b.dgid));
    Ok(entries)
}

/// File modification time in epoch seconds.
pub fn modified_seconds(path: &Path) -> DgResult<f64> {
    let modified = fs::metadata(path)?.modified()?;
    Ok(modified
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;

    fn context(root: &Path) -> EngineContext {
        EngineContext::new(EngineConfig::new(root))
    }

    #[test]
    fn test_resolve_rejects_escapes() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        for dgid in ["../x.datagrid", "a/../../x", "/etc/passwd", ""] {
            assert!(
                matches!(resolve(&ctx, dgid), Err(DgError::InvalidArguments(_))),
                "{dgid}"
            );
        }
    }

    #[test]
    fn test_resolve_with_and_without_extension() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        fs::create_dir_all(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/a.datagrid"), b"").unwrap();

        assert!(resolve(&ctx, "sub/a.datagrid").is_ok());
        assert_eq!(
            resolve(&ctx, "sub/a").unwrap(),
            dir.path().join("sub/a.datagrid")
        );
        assert!(resolve(&ctx, "missing").unwrap_err().is_not_found());
    }

    #[test]
    fn test_list_walks_subdirectories() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        fs::create_dir_all(dir.path().join("b")).unwrap();
        fs::write(dir.path().join("b/two.datagrid"), b"xx").unwrap();
        fs::write(dir.path().join("one.datagrid"), b"x").unwrap();
        fs::write(dir.path().join("notes.txt"), b"x").unwrap();

        let entries = list(&ctx).unwrap();
        let dgids: Vec<&str> = entries.iter().map(|e| e.dgid.as_str()).collect();
        assert_eq!(dgids, vec!["b/two.datagrid", "one.datagrid"]);
        assert_eq!(entries[0].size, 2);
    }

    /// 루트를 가리키는 심볼릭 링크를 따라가지 않음
    #[cfg(unix)]
    #[test]
    fn test_list_ignores_symlink_loops() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        fs::write(dir.path().join("one.datagrid"), b"x").unwrap();
        std::os::unix::fs::symlink(dir.path(), dir.path().join("loop")).unwrap();
        std::os::unix::fs::symlink(
            dir.path().join("one.datagrid"),
            dir.path().join("alias.datagrid"),
        )
        .unwrap();

        let entries = list(&ctx).unwrap();
        let dgids: Vec<&str> = entries.iter().map(|e| e.dgid.as_str()).collect();
        assert_eq!(dgids, vec!["one.datagrid"]);
    }
}
