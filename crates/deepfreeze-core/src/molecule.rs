//! Molecules: one source file and its optional stream transformations.
//!
//! A molecule wraps the file being backed up. Opening it exposes the raw
//! bytes; `compress` and `encrypt` each replace the active stream with a
//! transformed spill file, so the exact transformed size is known before
//! the bytes are packed into cubes. Reads are tracked so the cube packer
//! can ask how many bytes remain.

use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::atom::Atom;
use crate::error::{FreezeError, FreezeResult};
use crate::fileinfo::FileMetaRecord;
use crate::keyring::KeyRing;

/// Manifest-facing identity of a molecule: id, content hash, and path.
#[derive(Debug, Clone)]
pub struct MoleculeSummary {
    /// The molecule id.
    pub id: Uuid,
    /// SHA-512 of the original file content, lowercase hex.
    pub hash: String,
    /// Path of the source file.
    pub path: PathBuf,
}

/// One source file: identity, content hash, original stat, and the ordered
/// atoms that realize its transformed byte stream.
#[derive(Serialize)]
pub struct Molecule {
    id: Uuid,
    path: PathBuf,
    hash: String,
    created_at: DateTime<Utc>,
    #[serde(rename = "size")]
    original_size: u64,
    #[serde(skip)]
    atoms: Vec<Atom>,
    #[serde(skip)]
    orig_meta: FileMetaRecord,
    #[serde(skip)]
    cur_meta: FileMetaRecord,
    #[serde(skip)]
    stream: Option<File>,
    #[serde(skip)]
    cur_size: u64,
    #[serde(skip)]
    read_size: u64,
    #[serde(skip)]
    started: bool,
}

impl Molecule {
    /// Stats `path` and builds a molecule for it. `hash` is the SHA-512 of
    /// the original content, lowercase hex.
    pub fn new(path: impl Into<PathBuf>, hash: impl Into<String>) -> FreezeResult<Self> {
        let path = path.into();
        let meta = fs::metadata(&path)?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let record = FileMetaRecord::from_metadata(&name, &meta);
        Ok(Self {
            id: Uuid::new_v4(),
            path,
            hash: hash.into(),
            created_at: Utc::now(),
            original_size: meta.len(),
            atoms: Vec::new(),
            orig_meta: record.clone(),
            cur_meta: record,
            stream: None,
            cur_size: meta.len(),
            read_size: 0,
            started: false,
        })
    }

    /// Opens the underlying file for reading.
    pub fn open(&mut self) -> FreezeResult<()> {
        debug!(path = %self.path.display(), "opening");
        self.stream = Some(File::open(&self.path)?);
        self.cur_size = self.original_size;
        self.read_size = 0;
        Ok(())
    }

    /// Replaces the active stream with a gzip (best-speed) spill file.
    pub fn compress(&mut self) -> FreezeResult<()> {
        debug!(path = %self.path.display(), "compressing");
        let mut source = self.take_stream("compress")?;
        let spill = tempfile::tempfile()?;
        let mut encoder = GzEncoder::new(spill, Compression::fast());
        io::copy(&mut source, &mut encoder)?;
        let spill = encoder.finish()?;
        self.adopt_spill(spill)
    }

    /// Replaces the active stream with a spill file enciphered to the
    /// keyring's public key.
    pub fn encrypt(&mut self, keyring: &KeyRing) -> FreezeResult<()> {
        debug!(path = %self.path.display(), "encrypting");
        let mut source = self.take_stream("encrypt")?;
        let mut spill = tempfile::tempfile()?;
        keyring.encrypt_stream(&mut source, &mut spill)?;
        self.adopt_spill(spill)
    }

    /// Remaining unread bytes of the active (possibly transformed) stream.
    pub fn remaining(&self) -> u64 {
        self.cur_size.saturating_sub(self.read_size)
    }

    /// Stat of the active stream.
    pub fn info(&self) -> &FileMetaRecord {
        &self.cur_meta
    }

    /// Stat of the original file.
    pub fn orig_info(&self) -> &FileMetaRecord {
        &self.orig_meta
    }

    /// The molecule id.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The source file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// SHA-512 of the original file content, lowercase hex.
    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// The atoms allocated so far, in `part_id` order.
    pub fn atoms(&self) -> &[Atom] {
        &self.atoms
    }

    /// The `part_id` the next atom will receive.
    pub fn next_part_id(&self) -> u64 {
        self.atoms.len() as u64
    }

    /// Serializes the molecule's public fields to JSON.
    pub fn header(&self) -> FreezeResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Manifest-facing identity of this molecule.
    pub fn summary(&self) -> MoleculeSummary {
        MoleculeSummary {
            id: self.id,
            hash: self.hash.clone(),
            path: self.path.clone(),
        }
    }

    /// Whether the molecule's header records have been written to a cube.
    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Marks the molecule's header records as written.
    pub(crate) fn mark_started(&mut self) {
        self.started = true;
    }

    /// Appends a fully sized atom to the molecule's sequence.
    pub(crate) fn push_atom(&mut self, atom: Atom) {
        debug_assert_eq!(atom.part_id, self.next_part_id());
        self.atoms.push(atom);
    }

    /// Closes the active stream. Spill files are anonymous temp files and
    /// are reclaimed by the filesystem when dropped.
    pub fn close(&mut self) {
        if self.stream.take().is_some() {
            debug!(path = %self.path.display(), "closed");
        }
    }

    fn take_stream(&mut self, attempted: &'static str) -> FreezeResult<File> {
        self.stream.take().ok_or(FreezeError::Direction {
            attempted,
            mode: "unopened",
        })
    }

    fn adopt_spill(&mut self, mut spill: File) -> FreezeResult<()> {
        spill.seek(SeekFrom::Start(0))?;
        let meta = spill.metadata()?;
        self.cur_size = meta.len();
        self.read_size = 0;
        self.cur_meta = FileMetaRecord::from_metadata(&self.orig_meta.name, &meta);
        self.stream = Some(spill);
        Ok(())
    }
}

impl Read for Molecule {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = match &mut self.stream {
            Some(stream) => stream.read(buf)?,
            None => 0,
        };
        self.read_size += n as u64;
        Ok(n)
    }
}
