// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Zips rule outputs into artifacts and unzips fetched artifacts back into
//! the tree.
//!
//! Archive members mirror the rule's output paths relative to the project
//! root, in sorted order so identical output sets produce identical member
//! listings. All functions here do blocking I/O; the engine calls them off
//! the async workers.

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::target::{PathResolver, SourcePath, TargetError};

/// Packing or unpacking failure.
#[derive(Debug, thiserror::Error)]
pub enum PackError {
    #[error("io error: {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("archive member escapes the project root: {0}")]
    UnsafeEntry(String),

    #[error("output path is not valid UTF-8: {0}")]
    NonUtf8Path(PathBuf),

    #[error(transparent)]
    Path(#[from] TargetError),
}

impl PackError {
    fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// How unpacking treats files already on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExistingFileMode {
    /// Overwrite colliding files, leave other siblings alone.
    Overwrite,
    /// Overwrite colliding files and clear declared output directories
    /// first, so stale siblings from a prior build cannot survive.
    OverwriteAndCleanDirectories,
}

/// Zip the declared outputs into `out_zip`. Returns the archive size.
pub fn pack(resolver: &PathResolver, paths: &[SourcePath], out_zip: &Path) -> Result<u64, PackError> {
    let mut members: Vec<(String, PathBuf)> = Vec::new();
    for path in paths {
        collect_members(resolver, path, &mut members)?;
    }
    members.sort();
    members.dedup();

    let file = File::create(out_zip).map_err(|e| PackError::io(out_zip, e))?;
    let mut writer = ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    let mut buf = Vec::new();
    for (name, resolved) in members {
        writer.start_file(name.as_str(), options)?;
        let mut src = File::open(&resolved).map_err(|e| PackError::io(&resolved, e))?;
        buf.clear();
        src.read_to_end(&mut buf)
            .map_err(|e| PackError::io(&resolved, e))?;
        writer.write_all(&buf).map_err(|e| PackError::io(out_zip, e))?;
    }
    writer.finish()?;

    let size = std::fs::metadata(out_zip)
        .map_err(|e| PackError::io(out_zip, e))?
        .len();
    Ok(size)
}

/// Recursively list archive members for one declared output path.
fn collect_members(
    resolver: &PathResolver,
    path: &SourcePath,
    members: &mut Vec<(String, PathBuf)>,
) -> Result<(), PackError> {
    let resolved = resolver.resolve(path);
    let meta = std::fs::metadata(&resolved).map_err(|e| PackError::io(&resolved, e))?;
    if meta.is_file() {
        members.push((member_name(path)?, resolved));
        return Ok(());
    }

    let mut entries: Vec<_> = std::fs::read_dir(&resolved)
        .map_err(|e| PackError::io(&resolved, e))?
        .collect::<Result<_, _>>()
        .map_err(|e| PackError::io(&resolved, e))?;
    entries.sort_by_key(|entry| entry.file_name());
    for entry in entries {
        let child = SourcePath::new(path.as_path().join(entry.file_name()))?;
        collect_members(resolver, &child, members)?;
    }
    Ok(())
}

/// Forward-slash member name for an output path.
fn member_name(path: &SourcePath) -> Result<String, PackError> {
    let s = path
        .as_str()
        .ok_or_else(|| PackError::NonUtf8Path(path.as_path().to_path_buf()))?;
    Ok(s.replace(std::path::MAIN_SEPARATOR, "/"))
}

/// Extract `zip` into the project tree. Returns the extracted paths.
///
/// With [`ExistingFileMode::OverwriteAndCleanDirectories`], every declared
/// output path that exists as a directory is removed before extraction.
pub fn unpack(
    zip: &Path,
    resolver: &PathResolver,
    declared: &[SourcePath],
    mode: ExistingFileMode,
) -> Result<Vec<SourcePath>, PackError> {
    if mode == ExistingFileMode::OverwriteAndCleanDirectories {
        for path in declared {
            let resolved = resolver.resolve(path);
            if resolved.is_dir() {
                std::fs::remove_dir_all(&resolved).map_err(|e| PackError::io(&resolved, e))?;
            }
        }
    }

    let file = File::open(zip).map_err(|e| PackError::io(zip, e))?;
    let mut archive = ZipArchive::new(file)?;
    let mut extracted = Vec::with_capacity(archive.len());

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let Some(relative) = entry.enclosed_name() else {
            return Err(PackError::UnsafeEntry(entry.name().to_string()));
        };
        let source_path = SourcePath::new(relative)?;
        let dest = resolver.resolve(&source_path);

        if entry.is_dir() {
            std::fs::create_dir_all(&dest).map_err(|e| PackError::io(&dest, e))?;
            continue;
        }
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent).map_err(|e| PackError::io(parent, e))?;
        }
        let mut out = File::create(&dest).map_err(|e| PackError::io(&dest, e))?;
        std::io::copy(&mut entry, &mut out).map_err(|e| PackError::io(&dest, e))?;
        extracted.push(source_path);
    }

    Ok(extracted)
}

#[cfg(test)]
#[path = "packer_tests.rs"]
mod tests;
