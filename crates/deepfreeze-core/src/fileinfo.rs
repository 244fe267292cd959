//! Serializable file stat snapshots.
//!
//! A [`FileMetaRecord`] captures enough of an inode to recreate it on
//! restore: name, size, permission bits, modification time, and whether the
//! entry is a directory. Records are stored as JSON payloads of tar
//! metadata entries.

use std::fs;
use std::os::unix::fs::PermissionsExt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::FreezeResult;

/// Stat snapshot of a single filesystem entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileMetaRecord {
    /// Base name of the entry.
    pub name: String,
    /// Size in bytes.
    pub size: u64,
    /// POSIX permission bits.
    pub mode: u32,
    /// Modification time.
    pub mod_time: DateTime<Utc>,
    /// Whether the entry is a directory.
    pub is_dir: bool,
    /// Platform-specific stat data; always `null` in archives we produce.
    #[serde(default)]
    pub sys: Option<serde_json::Value>,
}

impl FileMetaRecord {
    /// Builds a record from filesystem metadata.
    pub fn from_metadata(name: &str, meta: &fs::Metadata) -> Self {
        Self {
            name: name.to_owned(),
            size: meta.len(),
            mode: meta.permissions().mode() & 0o7777,
            mod_time: meta
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now()),
            is_dir: meta.is_dir(),
            sys: None,
        }
    }

    /// Builds a synthetic record for an archive-internal payload entry.
    pub fn synthetic(name: &str, size: u64) -> Self {
        Self {
            name: name.to_owned(),
            size,
            mode: 0o644,
            mod_time: Utc::now(),
            is_dir: false,
            sys: None,
        }
    }

    /// Serializes the record to JSON.
    pub fn to_json(&self) -> FreezeResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parses a record from JSON.
    pub fn from_json(data: &[u8]) -> FreezeResult<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn json_round_trip_preserves_all_fields() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"hello world").unwrap();
        let meta = file.as_file().metadata().unwrap();

        let record = FileMetaRecord::from_metadata("hello.txt", &meta);
        let parsed = FileMetaRecord::from_json(&record.to_json().unwrap()).unwrap();

        assert_eq!(record, parsed);
        assert_eq!(parsed.name, "hello.txt");
        assert_eq!(parsed.size, 11);
        assert!(!parsed.is_dir);
        assert!(parsed.sys.is_none());
    }

    #[test]
    fn mode_keeps_permission_bits_only() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let meta = file.as_file().metadata().unwrap();

        let record = FileMetaRecord::from_metadata("f", &meta);
        assert_eq!(record.mode & !0o7777, 0);
    }

    #[test]
    fn synthetic_record_is_regular_file() {
        let record = FileMetaRecord::synthetic("payload", 4096);
        assert_eq!(record.size, 4096);
        assert_eq!(record.mode, 0o644);
        assert!(!record.is_dir);
    }

    #[test]
    fn directory_metadata_is_flagged() {
        let dir = tempfile::tempdir().unwrap();
        let meta = fs::metadata(dir.path()).unwrap();

        let record = FileMetaRecord::from_metadata("d", &meta);
        assert!(record.is_dir);
    }
}
