#![warn(missing_docs)]

//! deepfreeze core: encrypted, size-bounded, content-addressed backup
//! archives.
//!
//! Write path: directory tree -> index (SHA-512) -> molecule per file ->
//! gzip -> OpenPGP encrypt -> pack into bounded cubes -> manifest.
//! A molecule that does not fit in the remaining space of the current
//! cube continues into the successor, one atom record per fragment, and
//! every finalized cube starts with a self-describing descriptor record
//! so the group can be reconstructed independently.

pub mod atom;
pub mod cube;
pub mod error;
pub mod fileinfo;
pub mod freezer;
pub mod indexer;
pub mod keyring;
pub mod molecule;
pub mod tarstream;
pub mod tray;

pub use atom::Atom;
pub use cube::{Cube, DEFAULT_MAX_CUBE_SIZE};
pub use error::{FreezeError, FreezeResult};
pub use fileinfo::FileMetaRecord;
pub use freezer::{FreezeReport, Freezer, FreezerConfig};
pub use indexer::{ContentDigest, Indexer};
pub use keyring::{KeyRing, PUBRING, SECRING};
pub use molecule::{Molecule, MoleculeSummary};
pub use tarstream::{MetadataRecord, TarStream};
pub use tray::{CubeEntry, FileEntry, Tray, TrayConfig, TrayManifest};
