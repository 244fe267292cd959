//! Freezer: end-to-end orchestration of one backup run.

use std::fs;
use std::path::PathBuf;

use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::cube::DEFAULT_MAX_CUBE_SIZE;
use crate::error::FreezeResult;
use crate::indexer::Indexer;
use crate::keyring::KeyRing;
use crate::molecule::Molecule;
use crate::tray::{Tray, TrayConfig};

/// Parameters of a freezer run.
#[derive(Debug, Clone)]
pub struct FreezerConfig {
    /// Directory tree to back up.
    pub root: PathBuf,
    /// Directory receiving cube files and the manifest.
    pub backup_dir: PathBuf,
    /// Directory holding the OpenPGP keyring files.
    pub keyring_dir: PathBuf,
    /// Path prefixes to skip while indexing.
    pub excludes: Vec<PathBuf>,
    /// Hard payload capacity per cube, in bytes.
    pub max_cube_size: u64,
    /// Whether molecule streams are gzip-compressed before packing.
    pub compress: bool,
    /// Whether molecule streams are enciphered before packing.
    pub encrypt: bool,
}

impl FreezerConfig {
    /// Default configuration: 1024 MiB cubes, compression and encryption
    /// on, keyring under `<backup_dir>/keyring`.
    pub fn new(root: impl Into<PathBuf>, backup_dir: impl Into<PathBuf>) -> Self {
        let backup_dir = backup_dir.into();
        Self {
            root: root.into(),
            keyring_dir: backup_dir.join("keyring"),
            backup_dir,
            excludes: Vec::new(),
            max_cube_size: DEFAULT_MAX_CUBE_SIZE,
            compress: true,
            encrypt: true,
        }
    }
}

/// Summary of a completed backup run.
#[derive(Debug, Clone, Serialize)]
pub struct FreezeReport {
    /// The tray id of the run.
    pub tray_id: Uuid,
    /// Number of files backed up.
    pub files: usize,
    /// Number of cubes produced.
    pub cubes: usize,
    /// Content bytes written into cubes (after transforms).
    pub bytes_written: u64,
    /// Path of the manifest file.
    pub manifest_path: PathBuf,
}

/// Orchestrator: indexes the tree, packs molecules into the tray, and
/// writes the manifest.
pub struct Freezer {
    config: FreezerConfig,
    indexer: Indexer,
    tray: Tray,
    keyring: KeyRing,
}

impl Freezer {
    /// Builds the pipeline: creates the backup and keyring directories if
    /// missing and generates the keyring on first use.
    pub fn new(config: FreezerConfig) -> FreezeResult<Self> {
        fs::create_dir_all(&config.backup_dir)?;
        fs::create_dir_all(&config.keyring_dir)?;

        let keyring = KeyRing::new(&config.keyring_dir);
        keyring.generate_if_absent()?;

        let tray = Tray::new(TrayConfig {
            backup_dir: config.backup_dir.clone(),
            max_cube_size: config.max_cube_size,
            compress: config.compress,
            encrypt: config.encrypt,
        })?;
        let indexer = Indexer::new(&config.root, config.excludes.clone());

        Ok(Self {
            config,
            indexer,
            tray,
            keyring,
        })
    }

    /// Runs the backup end to end and returns a summary.
    pub fn freeze(&mut self) -> FreezeResult<FreezeReport> {
        let index = self.indexer.index()?;
        let files = index.len();
        info!(files, "index complete");

        let mut bytes_written = 0;
        for (path, digest) in index {
            let mut molecule = Molecule::new(path, hex::encode(digest))?;
            bytes_written += self.tray.write_molecule(&mut molecule, &self.keyring)?;
            molecule.close();
        }

        debug!("closing current cube");
        self.tray.close_current_cube()?;

        let manifest_path = self
            .config
            .backup_dir
            .join(format!("tray-{}", self.tray.id()));
        fs::write(&manifest_path, self.tray.header()?)?;
        info!(
            manifest = %manifest_path.display(),
            cubes = self.tray.cube_count(),
            bytes_written,
            "backup frozen"
        );

        Ok(FreezeReport {
            tray_id: self.tray.id(),
            files,
            cubes: self.tray.cube_count(),
            bytes_written,
            manifest_path,
        })
    }

    /// The tray of this run.
    pub fn tray(&self) -> &Tray {
        &self.tray
    }
}
