use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::{Result, error::SnapshotError};

pub(crate) fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> SnapshotError + '_ {
    move |source| SnapshotError::Io {
        path: path.to_path_buf(),
        source,
    }
}

pub(crate) fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).map_err(io_err(path))
}

/// Copies every regular file under `src` into `dest`, creating directories as
/// needed and overwriting files that already exist. Returns the number of files copied.
pub(crate) fn copy_tree(src: &Path, dest: &Path) -> Result<usize> {
    ensure_dir(dest)?;
    let mut copied = 0;
    let mut stack: Vec<(PathBuf, PathBuf)> = vec![(src.to_path_buf(), dest.to_path_buf())];
    while let Some((from_dir, to_dir)) = stack.pop() {
        for entry in fs::read_dir(&from_dir).map_err(io_err(&from_dir))? {
            let entry = entry.map_err(io_err(&from_dir))?;
            let from = entry.path();
            let to = to_dir.join(entry.file_name());
            let file_type = entry.file_type().map_err(io_err(&from))?;
            if file_type.is_dir() {
                ensure_dir(&to)?;
                stack.push((from, to));
            } else if file_type.is_file() {
                fs::copy(&from, &to).map_err(io_err(&from))?;
                copied += 1;
            }
        }
    }
    Ok(copied)
}

/// Relative paths (with `/` separators) of every regular file under `root`, sorted.
pub(crate) fn list_files(root: &Path) -> Result<Vec<String>> {
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in fs::read_dir(&dir).map_err(io_err(&dir))? {
            let entry = entry.map_err(io_err(&dir))?;
            let path = entry.path();
            let file_type = entry.file_type().map_err(io_err(&path))?;
            if file_type.is_dir() {
                stack.push(path);
                continue;
            }
            if !file_type.is_file() {
                continue;
            }
            if let Ok(rel) = path.strip_prefix(root) {
                files.push(relative_name(rel));
            }
        }
    }
    files.sort();
    Ok(files)
}

/// `/`-joined form of a relative path, independent of the host separator.
pub(crate) fn relative_name(rel: &Path) -> String {
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
