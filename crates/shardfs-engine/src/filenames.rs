//! Data-directory file naming
//!
//! - `CURRENT` names the live manifest
//! - `MANIFEST-<n>` holds the version-edit log
//! - `<n>.log` is a write-ahead log
//! - `<n>.ldb` is an immutable table file
//! - `LOCK` enforces single-writer-per-directory

use std::path::{Path, PathBuf};

/// What a data-directory file is, parsed from its name
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileKind {
    Current,
    Lock,
    Manifest(u64),
    WriteAheadLog(u64),
    Table(u64),
    Temp(u64),
}

pub fn current_file(dir: &Path) -> PathBuf {
    dir.join("CURRENT")
}

pub fn lock_file(dir: &Path) -> PathBuf {
    dir.join("LOCK")
}

pub fn manifest_file(dir: &Path, number: u64) -> PathBuf {
    dir.join(format!("MANIFEST-{number:06}"))
}

pub fn log_file(dir: &Path, number: u64) -> PathBuf {
    dir.join(format!("{number:06}.log"))
}

pub fn table_file(dir: &Path, number: u64) -> PathBuf {
    dir.join(format!("{number:06}.ldb"))
}

pub fn temp_file(dir: &Path, number: u64) -> PathBuf {
    dir.join(format!("{number:06}.dbtmp"))
}

/// Parse a base name into its kind, or None for foreign files.
pub fn parse_file_name(name: &str) -> Option<FileKind> {
    if name == "CURRENT" {
        return Some(FileKind::Current);
    }
    if name == "LOCK" {
        return Some(FileKind::Lock);
    }
    if let Some(rest) = name.strip_prefix("MANIFEST-") {
        return rest.parse().ok().map(FileKind::Manifest);
    }
    if let Some(stem) = name.strip_suffix(".log") {
        return stem.parse().ok().map(FileKind::WriteAheadLog);
    }
    if let Some(stem) = name.strip_suffix(".ldb") {
        return stem.parse().ok().map(FileKind::Table);
    }
    if let Some(stem) = name.strip_suffix(".dbtmp") {
        return stem.parse().ok().map(FileKind::Temp);
    }
    None
}
