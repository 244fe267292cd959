//! Trays: one backup run, owning the cube chain and the manifest.
//!
//! The chain is stored as an ordered arena; `parent_id`/`child_id` on the
//! cubes are the serialized form of the links. Exactly one molecule is
//! active at a time and exactly one cube (the tail) accepts writes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{debug, info};
use uuid::Uuid;

use crate::cube::{Cube, DEFAULT_MAX_CUBE_SIZE};
use crate::error::FreezeResult;
use crate::keyring::KeyRing;
use crate::molecule::Molecule;

/// Parameters of a backup run.
#[derive(Debug, Clone)]
pub struct TrayConfig {
    /// Directory receiving cube files and the manifest.
    pub backup_dir: PathBuf,
    /// Hard payload capacity per cube, in bytes.
    pub max_cube_size: u64,
    /// Whether molecule streams are gzip-compressed before packing.
    pub compress: bool,
    /// Whether molecule streams are enciphered before packing.
    pub encrypt: bool,
}

impl TrayConfig {
    /// Default configuration over `backup_dir`: 1024 MiB cubes,
    /// compression and encryption on.
    pub fn new(backup_dir: impl Into<PathBuf>) -> Self {
        Self {
            backup_dir: backup_dir.into(),
            max_cube_size: DEFAULT_MAX_CUBE_SIZE,
            compress: true,
            encrypt: true,
        }
    }
}

/// One entry of the manifest's cube list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CubeEntry {
    /// The cube id.
    pub cube_id: Uuid,
    /// SHA-512 of the cube body, lowercase hex.
    pub hash: String,
    /// The files whose header records live in this cube.
    pub files: Vec<FileEntry>,
}

/// One file reference inside a manifest cube entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    /// The molecule id.
    pub file_id: Uuid,
    /// SHA-512 of the original file content, lowercase hex.
    pub hash: String,
    /// Path of the source file.
    pub path: String,
}

/// The serialized manifest of a backup run, written to
/// `<backup_dir>/tray-<tray_id>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrayManifest {
    /// The tray id.
    pub tray_id: Uuid,
    /// Creation timestamp of the run.
    pub created_at: DateTime<Utc>,
    /// Whether this is a full backup.
    pub full: bool,
    /// Whether this is an incremental backup.
    pub incremental: bool,
    /// Total payload bytes across all cubes.
    pub size: u64,
    /// The cube chain, in order.
    pub cubes: Vec<CubeEntry>,
}

/// One backup run: owns the cube chain and drives molecule ingest.
pub struct Tray {
    id: Uuid,
    created_at: DateTime<Utc>,
    full: bool,
    incremental: bool,
    /// Reserved link to the tray this run increments upon.
    parent: Option<Uuid>,
    cubes: Vec<Cube>,
    config: TrayConfig,
}

impl Tray {
    /// Creates a tray with its root cube in the backup directory.
    pub fn new(config: TrayConfig) -> FreezeResult<Self> {
        let id = Uuid::new_v4();
        let root = Cube::create(&config.backup_dir, id, config.max_cube_size)?;
        Ok(Self {
            id,
            created_at: Utc::now(),
            full: true,
            incremental: false,
            parent: None,
            cubes: vec![root],
            config,
        })
    }

    /// The tray id.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The tray this run increments upon, when incremental chains are in
    /// use.
    pub fn parent(&self) -> Option<Uuid> {
        self.parent
    }

    /// Number of cubes in the chain so far.
    pub fn cube_count(&self) -> usize {
        self.cubes.len()
    }

    /// The cube chain, in order.
    pub fn cubes(&self) -> &[Cube] {
        &self.cubes
    }

    /// The tail cube currently accepting writes.
    pub fn current_cube(&self) -> &Cube {
        self.cubes.last().expect("tray always has a root cube")
    }

    /// Mutable access to the tail cube.
    pub fn current_cube_mut(&mut self) -> &mut Cube {
        self.cubes.last_mut().expect("tray always has a root cube")
    }

    /// Ingests one molecule: opens it, applies the configured transforms,
    /// and streams it into the cube chain, spilling across cubes as
    /// needed. Cubes filled along the way are finalized. Returns the
    /// content bytes written.
    pub fn write_molecule(&mut self, molecule: &mut Molecule, keyring: &KeyRing) -> FreezeResult<u64> {
        info!(path = %molecule.path().display(), "backing up");
        molecule.open()?;
        if self.config.compress {
            molecule.compress()?;
        }
        if self.config.encrypt {
            molecule.encrypt(keyring)?;
        }

        let mut written = 0;
        loop {
            written += self.current_cube_mut().write_molecule(molecule)?;
            if molecule.remaining() == 0 && molecule.is_started() {
                return Ok(written);
            }
            self.advance()?;
        }
    }

    /// Finalizes the tail cube. Earlier cubes were closed while spilling.
    pub fn close_current_cube(&mut self) -> FreezeResult<()> {
        self.current_cube_mut().close()
    }

    /// Serializes the manifest for the whole chain.
    pub fn header(&self) -> FreezeResult<Vec<u8>> {
        debug!(tray = %self.id, "packing tray header");
        let cubes = self
            .cubes
            .iter()
            .map(|cube| CubeEntry {
                cube_id: cube.id,
                hash: cube.hash.clone(),
                files: cube
                    .molecules()
                    .iter()
                    .map(|m| FileEntry {
                        file_id: m.id,
                        hash: m.hash.clone(),
                        path: m.path.display().to_string(),
                    })
                    .collect(),
            })
            .collect();
        let manifest = TrayManifest {
            tray_id: self.id,
            created_at: self.created_at,
            full: self.full,
            incremental: self.incremental,
            size: self.cubes.iter().map(|c| c.size).sum(),
            cubes,
        };
        Ok(serde_json::to_vec(&manifest)?)
    }

    /// Spawns the successor cube and finalizes the current tail.
    fn advance(&mut self) -> FreezeResult<()> {
        let successor = self.current_cube_mut().next()?;
        self.close_current_cube()?;
        self.cubes.push(successor);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use sha2::{Digest, Sha512};

    use super::*;

    fn raw_config(dir: &Path, max_cube_size: u64) -> TrayConfig {
        TrayConfig {
            backup_dir: dir.to_path_buf(),
            max_cube_size,
            compress: false,
            encrypt: false,
        }
    }

    fn molecule_for(dir: &Path, name: &str, content: &[u8]) -> Molecule {
        let path = dir.join(name);
        fs::write(&path, content).unwrap();
        Molecule::new(&path, hex::encode(Sha512::digest(content))).unwrap()
    }

    #[test]
    fn fresh_tray_is_a_full_backup_with_no_parent() {
        let dir = tempfile::tempdir().unwrap();
        let tray = Tray::new(raw_config(dir.path(), 4096)).unwrap();
        assert!(tray.parent().is_none());
        assert_eq!(tray.cube_count(), 1);
        assert_eq!(tray.current_cube().tray_id, tray.id());

        let manifest: TrayManifest = serde_json::from_slice(&tray.header().unwrap()).unwrap();
        assert!(manifest.full);
        assert!(!manifest.incremental);
    }

    #[test]
    fn two_small_files_share_one_cube() {
        let dir = tempfile::tempdir().unwrap();
        let keyring = KeyRing::new(dir.path());
        let mut tray = Tray::new(raw_config(dir.path(), 1024 * 1024)).unwrap();

        let mut a = molecule_for(dir.path(), "a", &[1u8; 100]);
        let mut b = molecule_for(dir.path(), "b", &[2u8; 200]);
        assert_eq!(tray.write_molecule(&mut a, &keyring).unwrap(), 100);
        assert_eq!(tray.write_molecule(&mut b, &keyring).unwrap(), 200);

        assert_eq!(tray.cube_count(), 1);
        assert_eq!(tray.current_cube().molecules().len(), 2);
        tray.close_current_cube().unwrap();
    }

    #[test]
    fn large_molecule_spans_cubes_in_chain_order() {
        let dir = tempfile::tempdir().unwrap();
        let keyring = KeyRing::new(dir.path());
        let mut tray = Tray::new(raw_config(dir.path(), 2048)).unwrap();

        let mut big = molecule_for(dir.path(), "big", &vec![9u8; 6000]);
        let written = tray.write_molecule(&mut big, &keyring).unwrap();
        assert_eq!(written, 6000);
        assert!(tray.cube_count() >= 2);

        // Header records live in the first cube only.
        assert_eq!(tray.cubes()[0].molecules().len(), 1);
        for cube in &tray.cubes()[1..] {
            assert!(cube.molecules().is_empty());
        }
        let sizes: u64 = big.atoms().iter().map(|a| a.size).sum();
        assert_eq!(sizes, 6000);
        for (i, atom) in big.atoms().iter().enumerate() {
            assert_eq!(atom.part_id, i as u64);
            assert_eq!(atom.cube_id, tray.cubes()[i].id);
        }
        tray.close_current_cube().unwrap();
        for cube in tray.cubes() {
            assert!(cube.size <= 2048);
        }
    }

    #[test]
    fn manifest_lists_every_cube_once_with_files() {
        let dir = tempfile::tempdir().unwrap();
        let keyring = KeyRing::new(dir.path());
        let mut tray = Tray::new(raw_config(dir.path(), 2048)).unwrap();

        let mut small = molecule_for(dir.path(), "small", b"tiny");
        let mut big = molecule_for(dir.path(), "big", &vec![5u8; 5000]);
        tray.write_molecule(&mut small, &keyring).unwrap();
        tray.write_molecule(&mut big, &keyring).unwrap();
        tray.close_current_cube().unwrap();

        let manifest: TrayManifest = serde_json::from_slice(&tray.header().unwrap()).unwrap();
        assert_eq!(manifest.tray_id, tray.id());
        assert!(manifest.full);
        assert!(!manifest.incremental);
        assert_eq!(manifest.cubes.len(), tray.cube_count());
        assert_eq!(
            manifest.size,
            tray.cubes().iter().map(|c| c.size).sum::<u64>()
        );

        // Every file appears under exactly one cube.
        let all_files: Vec<_> = manifest
            .cubes
            .iter()
            .flat_map(|c| c.files.iter())
            .collect();
        assert_eq!(all_files.len(), 2);
        assert_eq!(manifest.cubes[0].files.len(), 2);
    }

    #[test]
    fn zero_byte_file_produces_no_atoms_and_keeps_the_cube() {
        let dir = tempfile::tempdir().unwrap();
        let keyring = KeyRing::new(dir.path());
        let mut tray = Tray::new(raw_config(dir.path(), 1024 * 1024)).unwrap();

        let mut empty = molecule_for(dir.path(), "empty", b"");
        let written = tray.write_molecule(&mut empty, &keyring).unwrap();
        assert_eq!(written, 0);
        assert!(empty.atoms().is_empty());
        assert_eq!(tray.cube_count(), 1);
        assert_eq!(tray.current_cube().molecules().len(), 1);
    }

    #[test]
    fn transforms_apply_when_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let keyring = KeyRing::new(dir.path().join("rings"));
        fs::create_dir_all(keyring.dir()).unwrap();
        keyring.generate_if_absent().unwrap();

        let backups = dir.path().join("out");
        fs::create_dir_all(&backups).unwrap();
        let mut tray = Tray::new(TrayConfig::new(&backups)).unwrap();

        let mut m = molecule_for(dir.path(), "secret", &vec![b'x'; 4096]);
        let written = tray.write_molecule(&mut m, &keyring).unwrap();
        // Compressed-then-encrypted stream differs in size from the source.
        assert!(written > 0);
        assert_ne!(written, 4096);
        assert_eq!(m.atoms().len(), 1);
        tray.close_current_cube().unwrap();
    }
}
