//! Zip packing of a staging directory, and the reverse.
//!
//! Entry names are relative to the staging root, so unpacking into a fresh
//! directory reproduces the original layout exactly.

use std::{
    fs,
    io::{BufReader, BufWriter},
    path::{Path, PathBuf},
};

use serde::Serialize;
use snafu::prelude::*;
use tracing::debug;
use zip::{CompressionMethod, ZipArchive, ZipWriter, write::SimpleFileOptions};

use crate::{
    Result,
    error::{ArchiveSnafu, UnsafeArchiveEntrySnafu},
    fs_util::{ensure_dir, io_err, relative_name},
};

/// Deflate level used for every file entry.
const COMPRESSION_LEVEL: u8 = 9;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ArchiveFileEntry {
    pub path: String,
    pub bytes: u64,
}

/// What `pack_dir` wrote.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackSummary {
    pub files: usize,
    pub directories: usize,
    pub bytes: u64,
}

enum StagedEntry {
    Dir(String),
    File { name: String, path: PathBuf, len: u64 },
}

fn staged_entries(root: &Path) -> Result<Vec<StagedEntry>> {
    let mut entries = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in fs::read_dir(&dir).map_err(io_err(&dir))? {
            let entry = entry.map_err(io_err(&dir))?;
            let path = entry.path();
            let Ok(rel) = path.strip_prefix(root) else {
                continue;
            };
            let name = relative_name(rel);
            let meta = entry.metadata().map_err(io_err(&path))?;
            if meta.is_dir() {
                entries.push(StagedEntry::Dir(format!("{name}/")));
                stack.push(path);
            } else if meta.is_file() {
                entries.push(StagedEntry::File {
                    name,
                    path,
                    len: meta.len(),
                });
            }
        }
    }
    entries.sort_by(|a, b| entry_name(a).cmp(entry_name(b)));
    Ok(entries)
}

fn entry_name(entry: &StagedEntry) -> &str {
    match entry {
        StagedEntry::Dir(name) | StagedEntry::File { name, .. } => name,
    }
}

/// Writes every file and directory under `src` into a new zip at `dest`.
/// The name of `src` itself is not part of any entry.
pub fn pack_dir(src: &Path, dest: &Path) -> Result<PackSummary> {
    let file = fs::File::create(dest).map_err(io_err(dest))?;
    let mut writer = ZipWriter::new(BufWriter::new(file));
    let mut summary = PackSummary::default();

    for entry in staged_entries(src)? {
        match entry {
            StagedEntry::Dir(name) => {
                let options =
                    SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
                writer
                    .add_directory(name, options)
                    .context(ArchiveSnafu { path: dest })?;
                summary.directories += 1;
            }
            StagedEntry::File { name, path, len } => {
                let options = SimpleFileOptions::default()
                    .compression_method(CompressionMethod::Deflated)
                    .compression_level(Some(COMPRESSION_LEVEL.into()))
                    .large_file(len >= u64::from(u32::MAX));
                writer
                    .start_file(name, options)
                    .context(ArchiveSnafu { path: dest })?;
                let mut reader = BufReader::new(fs::File::open(&path).map_err(io_err(&path))?);
                summary.bytes += std::io::copy(&mut reader, &mut writer).map_err(io_err(&path))?;
                summary.files += 1;
            }
        }
    }

    let mut inner = writer.finish().context(ArchiveSnafu { path: dest })?;
    std::io::Write::flush(&mut inner).map_err(io_err(dest))?;
    debug!(
        archive = %dest.display(),
        files = summary.files,
        bytes = summary.bytes,
        "staging directory packed"
    );
    Ok(summary)
}

/// Expands the zip at `src` into `dest`, refusing entries that would land outside it.
/// Returns the number of files written.
pub fn unpack(src: &Path, dest: &Path) -> Result<usize> {
    let file = fs::File::open(src).map_err(io_err(src))?;
    let mut archive = ZipArchive::new(BufReader::new(file)).context(ArchiveSnafu { path: src })?;
    ensure_dir(dest)?;

    let mut files = 0;
    for idx in 0..archive.len() {
        let mut entry = archive.by_index(idx).context(ArchiveSnafu { path: src })?;
        let rel = entry
            .enclosed_name()
            .context(UnsafeArchiveEntrySnafu { entry: entry.name() })?;
        let target = dest.join(rel);
        if entry.is_dir() {
            ensure_dir(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            ensure_dir(parent)?;
        }
        let mut out = fs::File::create(&target).map_err(io_err(&target))?;
        std::io::copy(&mut entry, &mut out).map_err(io_err(&target))?;
        files += 1;
    }
    debug!(archive = %src.display(), files, "archive unpacked");
    Ok(files)
}

/// File entries of the zip at `path`, sorted by name.
pub fn list_entries(path: &Path) -> Result<Vec<ArchiveFileEntry>> {
    let file = fs::File::open(path).map_err(io_err(path))?;
    let mut zip = ZipArchive::new(BufReader::new(file)).context(ArchiveSnafu { path })?;
    let mut files = Vec::new();
    for idx in 0..zip.len() {
        let entry = zip.by_index(idx).context(ArchiveSnafu { path })?;
        if entry.is_dir() {
            continue;
        }
        files.push(ArchiveFileEntry {
            path: entry.name().to_string(),
            bytes: entry.size(),
        });
    }
    files.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs_util::list_files;

    #[test]
    fn pack_then_unpack_reproduces_layout_and_bytes() {
        let temp = tempfile::tempdir().unwrap();
        let src = temp.path().join("staging");
        fs::create_dir_all(src.join("collections")).unwrap();
        fs::create_dir_all(src.join("uploads/photos")).unwrap();
        fs::create_dir_all(src.join("uploads/empty")).unwrap();
        fs::write(src.join("collections/employees.json"), br#"[{"_id":1}]"#).unwrap();
        let binary: Vec<u8> = (0..=255u8).cycle().take(70_000).collect();
        fs::write(src.join("uploads/photos/a.bin"), &binary).unwrap();

        let zip_path = temp.path().join("archive.zip");
        let summary = pack_dir(&src, &zip_path).unwrap();
        assert_eq!(summary.files, 2);

        let names: Vec<_> = list_entries(&zip_path)
            .unwrap()
            .into_iter()
            .map(|e| e.path)
            .collect();
        assert_eq!(
            names,
            vec!["collections/employees.json", "uploads/photos/a.bin"]
        );

        let out = temp.path().join("restored");
        assert_eq!(unpack(&zip_path, &out).unwrap(), 2);
        assert_eq!(list_files(&out).unwrap(), list_files(&src).unwrap());
        assert_eq!(fs::read(out.join("uploads/photos/a.bin")).unwrap(), binary);
        assert!(out.join("uploads/empty").is_dir());
    }
}
