//! Filename conventions, the deleteme-flag protocol and the startup sweep.
//!
//! A store directory holds `buffer.N` write-ahead logs, `segment.<id>`
//! families (`segment.<id>.data`, `segment.<id>.offsets`) and zero-byte
//! `<base>.deleted` marker files. The marker asserts that the base file and
//! every file matching `<base>.*` are garbage. Creation and deletion become
//! crash-atomic by ordering flag writes around visibility changes: the flag
//! is set before a family is written and cleared before it becomes visible,
//! so a sweep at startup can always tell finished files from wreckage.

use std::ffi::OsStr;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::{MindexError, Result};

/// Extension of the deleteme marker file.
const DELETED_EXT: &str = "deleted";

/// Parsed id field of a buffer or segment filename.
///
/// An integer in the second `.`-separated field yields a scalar id, a `M-N`
/// fragment yields a pair (produced by stores that record compacted id
/// ranges; parse-only here), and anything else hex-shaped is a digest id.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) enum FileId {
    /// Sequential id inherited from the buffer that produced the file.
    Seq(u64),
    /// Inclusive id range of a compacted segment.
    Pair(u64, u64),
    /// Hex digest id of a compaction output.
    Hex(String),
}

impl std::fmt::Display for FileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FileId::Seq(n) => write!(f, "{}", n),
            FileId::Pair(m, n) => write!(f, "{}-{}", m, n),
            FileId::Hex(h) => write!(f, "{}", h),
        }
    }
}

/// Parse the id out of a `buffer.*` or `segment.*` filename.
pub(crate) fn parse_id(file_name: &str) -> Option<FileId> {
    let field = file_name.split('.').nth(1)?;
    if let Ok(n) = field.parse::<u64>() {
        return Some(FileId::Seq(n));
    }
    if let Some((m, n)) = field.split_once('-') {
        if let (Ok(m), Ok(n)) = (m.parse::<u64>(), n.parse::<u64>()) {
            return Some(FileId::Pair(m, n));
        }
    }
    if !field.is_empty() && field.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Some(FileId::Hex(field.to_owned()));
    }
    None
}

/// join path: {root}/buffer.{id}
pub(crate) fn buffer_path(root: &Path, id: u64) -> PathBuf {
    root.join(format!("buffer.{}", id))
}

/// join path: {root}/segment.{id}
pub(crate) fn segment_base(root: &Path, id: &FileId) -> PathBuf {
    root.join(format!("segment.{}", id))
}

fn flag_path(base: &Path) -> PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(".");
    name.push(DELETED_EXT);
    PathBuf::from(name)
}

/// Create the zero-byte deleteme marker for `base`.
pub(crate) fn set_deleteme(base: &Path) -> Result<()> {
    fs::File::create(flag_path(base))?;
    Ok(())
}

/// Whether the deleteme marker for `base` exists.
pub(crate) fn has_deleteme(base: &Path) -> bool {
    flag_path(base).exists()
}

/// Remove the deleteme marker for `base`.
pub(crate) fn clear_deleteme(base: &Path) -> Result<()> {
    fs::remove_file(flag_path(base))?;
    Ok(())
}

/// Delete `base`, every `base.*` companion and the marker itself.
///
/// Missing files are skipped; a crashed earlier delete may have removed
/// part of the family already.
pub(crate) fn delete_family(base: &Path) -> Result<()> {
    let dir = base.parent().ok_or_else(|| {
        MindexError::StringError(format!("{:?} has no parent directory", base))
    })?;
    let base_name = match base.file_name().and_then(OsStr::to_str) {
        Some(name) => name.to_owned(),
        None => return Err(MindexError::StringError(format!("bad base name {:?}", base))),
    };
    let prefix = format!("{}.", base_name);

    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let matches = path
            .file_name()
            .and_then(OsStr::to_str)
            .map_or(false, |name| name == base_name || name.starts_with(&prefix));
        if matches {
            if let Err(e) = fs::remove_file(&path) {
                if e.kind() != io::ErrorKind::NotFound {
                    return Err(e.into());
                }
            }
        }
    }
    Ok(())
}

/// Startup sweep step one: garbage-collect every flagged file family.
pub(crate) fn sweep(root: &Path) -> Result<()> {
    let flagged: Vec<PathBuf> = fs::read_dir(root)?
        .flat_map(|res| -> Result<_> { Ok(res?.path()) })
        .filter(|path| path.extension() == Some(DELETED_EXT.as_ref()))
        .collect();

    for flag in flagged {
        let base = flag.with_extension("");
        debug!("sweeping flagged family {:?}", base);
        delete_family(&base)?;
    }
    Ok(())
}

/// Enumerate `segment.*` base paths in `root`, from their `.data` files.
pub(crate) fn list_segment_bases(root: &Path) -> Result<Vec<(FileId, PathBuf)>> {
    let mut bases = Vec::new();
    for entry in fs::read_dir(root)? {
        let path = entry?.path();
        let name = match path.file_name().and_then(OsStr::to_str) {
            Some(name) => name,
            None => continue,
        };
        if !name.starts_with("segment.") || !name.ends_with(".data") {
            continue;
        }
        match parse_id(name) {
            Some(id) => {
                let base = root.join(name.trim_end_matches(".data"));
                bases.push((id, base));
            }
            None => warn!("unparseable segment file name {:?}, skipping", name),
        }
    }
    Ok(bases)
}

/// Enumerate `buffer.N` logs in `root`, ascending by id.
pub(crate) fn list_buffer_logs(root: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let mut logs: Vec<(u64, PathBuf)> = fs::read_dir(root)?
        .flat_map(|res| -> Result<_> { Ok(res?.path()) })
        .filter_map(|path| {
            let name = path.file_name().and_then(OsStr::to_str)?;
            if !name.starts_with("buffer.") || name.split('.').count() != 2 {
                return None;
            }
            match parse_id(name) {
                Some(FileId::Seq(id)) => Some((id, path)),
                _ => None,
            }
        })
        .collect();

    logs.sort_unstable_by_key(|(id, _)| *id);
    Ok(logs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn parses_scalar_pair_and_hex_ids() {
        assert_eq!(parse_id("buffer.7"), Some(FileId::Seq(7)));
        assert_eq!(parse_id("segment.12.data"), Some(FileId::Seq(12)));
        assert_eq!(parse_id("segment.3-9"), Some(FileId::Pair(3, 9)));
        assert_eq!(
            parse_id("segment.0f3a99d2c1b44e5f.data"),
            Some(FileId::Hex("0f3a99d2c1b44e5f".to_owned()))
        );
        assert_eq!(parse_id("segment.xyz"), None);
        assert_eq!(parse_id("engine"), None);
    }

    #[test]
    fn sweep_removes_flagged_families_only() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        for name in [
            "segment.5.data",
            "segment.5.offsets",
            "segment.5.deleted",
            "segment.50.data",
            "buffer.9",
            "buffer.9.deleted",
            "buffer.10",
        ] {
            fs::File::create(root.join(name)).unwrap();
        }

        sweep(root).unwrap();

        let mut left: Vec<String> = fs::read_dir(root)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        left.sort();
        assert_eq!(left, ["buffer.10", "segment.50.data"]);
    }

    #[test]
    fn buffer_listing_is_sorted_and_ignores_companions() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        for name in ["buffer.3", "buffer.1", "buffer.12", "buffer.3.deleted", "segment.2.data"] {
            fs::File::create(root.join(name)).unwrap();
        }

        let ids: Vec<u64> = list_buffer_logs(root)
            .unwrap()
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        assert_eq!(ids, [1, 3, 12]);
    }
}
