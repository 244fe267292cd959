//! Cubes: fixed-capacity container files, the upload units of a backup.
//!
//! A cube owns a tar stream backed by a file in the backup directory,
//! named by the cube's id. Molecules stream into the cube until its
//! payload budget is spent; the remainder of a split molecule continues
//! into the successor cube. Closing a cube finalizes the tar, hashes the
//! body, and atomically rewrites the file with a self-describing `"cube"`
//! descriptor record prepended, so any cube can be opened on its own.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use tracing::debug;
use uuid::Uuid;

use crate::atom::Atom;
use crate::error::{FreezeError, FreezeResult};
use crate::fileinfo::FileMetaRecord;
use crate::molecule::{Molecule, MoleculeSummary};
use crate::tarstream::{MetadataRecord, TarStream};

/// Record name of the cube descriptor prepended on finalization.
pub const CUBE_RECORD: &str = "cube";
/// Record name of a molecule header.
pub const MOLECULE_RECORD: &str = "molecule";
/// Record name of a molecule's original file stat.
pub const FILE_INFO_RECORD: &str = "finfo";
/// Record name of a molecule's transformed-stream stat.
pub const STREAM_INFO_RECORD: &str = "bfinfo";
/// Record name of an atom descriptor.
pub const ATOM_RECORD: &str = "atom";

/// Default cube capacity: 1024 MiB.
pub const DEFAULT_MAX_CUBE_SIZE: u64 = 1024 * 1024 * 1024;

const BLOCK_SIZE: usize = 512;

/// One bounded-size container file.
///
/// The serialized form is the descriptor record written at the head of
/// every finalized cube; runtime state is skipped.
#[derive(Serialize, Deserialize)]
pub struct Cube {
    /// Unique cube id; also the backing file name.
    pub id: Uuid,
    /// The tray this cube belongs to.
    pub tray_id: Uuid,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// SHA-512 of the cube body (the tar stream before the descriptor
    /// record is prepended), lowercase hex. Set on close.
    pub hash: String,
    /// Remote object location, set by the upload transport.
    pub aws_location: String,
    /// Upload completion timestamp, set by the upload transport.
    pub uploaded_at: Option<DateTime<Utc>>,
    /// Predecessor cube in the chain, if any.
    pub parent_id: Option<Uuid>,
    /// Successor cube in the chain, if any.
    pub child_id: Option<Uuid>,
    /// Total payload bytes in the body. Set on close.
    pub size: u64,
    #[serde(skip)]
    molecules: Vec<MoleculeSummary>,
    #[serde(skip)]
    tar: Option<TarStream<File>>,
    #[serde(skip)]
    path: PathBuf,
    #[serde(skip)]
    dir: PathBuf,
    #[serde(skip)]
    max_size: u64,
}

impl Cube {
    /// Creates a new writable cube backed by `<dir>/<uuid>` with the given
    /// payload capacity in bytes.
    pub fn create(dir: &Path, tray_id: Uuid, max_size: u64) -> FreezeResult<Self> {
        let id = Uuid::new_v4();
        let path = dir.join(id.to_string());
        let file = File::create(&path)?;
        debug!(cube = %id, path = %path.display(), "created cube");
        Ok(Self {
            id,
            tray_id,
            created_at: Utc::now(),
            hash: String::new(),
            aws_location: String::new(),
            uploaded_at: None,
            parent_id: None,
            child_id: None,
            size: 0,
            molecules: Vec::new(),
            tar: Some(TarStream::writer(file)),
            path: path.clone(),
            dir: dir.to_path_buf(),
            max_size,
        })
    }

    /// Opens a finalized cube for reading. The first record must be the
    /// `"cube"` descriptor; the remaining records stay available through
    /// [`Cube::read_metadata`] and [`Cube::read_file`].
    pub fn open(path: &Path) -> FreezeResult<Self> {
        let file = File::open(path)?;
        let mut tar = TarStream::reader(file);
        let record = tar.read_metadata()?.ok_or_else(|| FreezeError::FormatMismatch {
            expected: CUBE_RECORD.to_owned(),
            found: String::new(),
        })?;
        if record.name != CUBE_RECORD {
            return Err(FreezeError::FormatMismatch {
                expected: CUBE_RECORD.to_owned(),
                found: record.name,
            });
        }
        let mut cube: Cube = serde_json::from_slice(&record.data)?;
        cube.tar = Some(tar);
        cube.path = path.to_path_buf();
        cube.dir = path.parent().unwrap_or(Path::new(".")).to_path_buf();
        Ok(cube)
    }

    /// Whether the payload budget is spent.
    pub fn is_full(&self) -> bool {
        self.body_size() >= self.max_size
    }

    /// Payload bytes written so far (the finalized `size` once closed).
    pub fn body_size(&self) -> u64 {
        self.tar.as_ref().map(TarStream::size).unwrap_or(self.size)
    }

    /// The molecules whose header records live in this cube, in the order
    /// they arrived.
    pub fn molecules(&self) -> &[MoleculeSummary] {
        &self.molecules
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes as much of `molecule` as fits into this cube: the
    /// `molecule`/`finfo`/`bfinfo` header records if this is the first
    /// cube the molecule touches, then a single atom sized to the smaller
    /// of the remaining stream and the remaining payload budget.
    ///
    /// Returns the content bytes written here. A return of zero with the
    /// molecule still holding bytes means nothing fit and the caller must
    /// continue in a fresh cube. Fails with `CapacityExhausted` when the
    /// required records cannot fit even in an empty cube.
    pub fn write_molecule(&mut self, molecule: &mut Molecule) -> FreezeResult<u64> {
        // A full cube accepts nothing further; the caller continues in its
        // successor.
        if self.is_full() {
            return self.no_room(1);
        }

        let first_touch = !molecule.is_started();
        let space = self.max_size.saturating_sub(self.body_size());

        let mut records = Vec::new();
        if first_touch {
            records.push((MOLECULE_RECORD, molecule.header()?));
            records.push((FILE_INFO_RECORD, molecule.orig_info().to_json()?));
            records.push((STREAM_INFO_RECORD, molecule.info().to_json()?));
        }
        let records_len: u64 = records.iter().map(|(_, data)| data.len() as u64).sum();

        let want = molecule.remaining();
        if want == 0 {
            // Zero-size stream: header records only, no atoms.
            if space < records_len {
                return self.no_room(records_len);
            }
            return self.append_records(molecule, records, first_touch).map(|_| 0);
        }

        // The atom descriptor is measured with a provisional size before the
        // chunk is chosen; its own payload counts against the budget, so
        // the finalized body never exceeds max_size. Re-serializing the
        // same atom with a smaller size cannot lengthen the record.
        let mut atom = Atom::new(
            molecule.id(),
            self.id,
            molecule.next_part_id(),
            want.min(space),
        );
        let probe_len = atom.header()?.len() as u64;
        if space < records_len + probe_len + 1 {
            return self.no_room(records_len + probe_len + 1);
        }

        self.append_records(molecule, records, first_touch)?;
        let chunk = want.min(space - records_len - probe_len);
        atom.size = chunk;
        debug!(
            cube = %self.id,
            molecule = %atom.molecule_id,
            part = atom.part_id,
            bytes = chunk,
            "writing atom"
        );
        let payload_meta = FileMetaRecord::synthetic(&atom.id.to_string(), chunk);
        let tar = self.tar_mut("write")?;
        tar.write_metadata(ATOM_RECORD, &atom.header()?)?;
        let limited = Read::by_ref(molecule).take(chunk);
        let written = tar.write_file(&payload_meta, limited)?;
        molecule.push_atom(atom);
        Ok(written)
    }

    /// Links a successor cube with the same capacity and backup directory.
    /// Must only be called on the tail cube of a chain.
    pub fn next(&mut self) -> FreezeResult<Cube> {
        let mut child = Cube::create(&self.dir, self.tray_id, self.max_size)?;
        child.parent_id = Some(self.id);
        self.child_id = Some(child.id);
        Ok(child)
    }

    /// Finalizes the cube: writes the tar footer, computes the body
    /// SHA-512, and atomically rewrites the backing file with the
    /// descriptor record prepended. A cube can be closed at most once.
    pub fn close(&mut self) -> FreezeResult<()> {
        let tar = self.tar.take().ok_or(FreezeError::Direction {
            attempted: "close",
            mode: "closed",
        })?;
        self.size = tar.size();
        let mut body = tar.finish()?;

        body.seek(SeekFrom::Start(0))?;
        let mut hasher = Sha512::new();
        io::copy(&mut body, &mut hasher)?;
        self.hash = hex::encode(hasher.finalize());
        debug!(cube = %self.id, size = self.size, hash = %self.hash, "closing cube");

        let descriptor = serde_json::to_vec(&*self)?;
        let mut staged = tempfile::NamedTempFile::new_in(&self.dir)?;
        write_descriptor_record(staged.as_file_mut(), &descriptor)?;
        body.seek(SeekFrom::Start(0))?;
        io::copy(&mut body, staged.as_file_mut())?;
        staged.as_file_mut().sync_all()?;
        drop(body);
        staged
            .persist(&self.path)
            .map_err(|err| FreezeError::Io(err.error))?;
        Ok(())
    }

    /// Reads the next record from an opened cube.
    pub fn read_metadata(&mut self) -> FreezeResult<Option<MetadataRecord>> {
        self.tar_mut("read")?.read_metadata()
    }

    /// Reads the next file record from an opened cube, streaming its
    /// payload into `dest`.
    pub fn read_file<W: Write>(&mut self, dest: &mut W) -> FreezeResult<Option<FileMetaRecord>> {
        self.tar_mut("read")?.read_file(dest)
    }

    /// Writes the pending `molecule`/`finfo`/`bfinfo` header records and
    /// claims the molecule for this cube's manifest entry.
    fn append_records(
        &mut self,
        molecule: &mut Molecule,
        records: Vec<(&'static str, Vec<u8>)>,
        first_touch: bool,
    ) -> FreezeResult<()> {
        let tar = self.tar_mut("write")?;
        for (name, data) in &records {
            tar.write_metadata(name, data)?;
        }
        if first_touch {
            self.molecules.push(molecule.summary());
            molecule.mark_started();
        }
        Ok(())
    }

    /// Nothing fit: either signal the caller to spill to a fresh cube, or
    /// fail if even an empty cube could not hold the required records.
    fn no_room(&self, required: u64) -> FreezeResult<u64> {
        if self.body_size() == 0 {
            return Err(FreezeError::CapacityExhausted {
                max_size: self.max_size,
                required,
            });
        }
        Ok(0)
    }

    fn tar_mut(&mut self, attempted: &'static str) -> FreezeResult<&mut TarStream<File>> {
        self.tar.as_mut().ok_or(FreezeError::Direction {
            attempted,
            mode: "closed",
        })
    }
}

/// Writes the single descriptor record that prefixes a finalized cube.
/// No footer follows; the original stream (with its own footer) is
/// appended directly after.
fn write_descriptor_record(out: &mut File, payload: &[u8]) -> FreezeResult<()> {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_path(CUBE_RECORD)?;
    header.set_size(payload.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    out.write_all(header.as_bytes())?;
    out.write_all(payload)?;
    let pad = (BLOCK_SIZE - payload.len() % BLOCK_SIZE) % BLOCK_SIZE;
    if pad > 0 {
        out.write_all(&[0u8; BLOCK_SIZE][..pad])?;
    }
    Ok(())
}
