//! Atoms: one contiguous fragment of a molecule stored in exactly one cube.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::FreezeResult;

/// Descriptor of one contiguous byte range of a molecule's transformed
/// stream, resident in a single cube. Atoms are immutable once their
/// payload has been written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Atom {
    /// Unique atom id.
    pub id: Uuid,
    /// The molecule this fragment belongs to.
    pub molecule_id: Uuid,
    /// The cube holding this fragment's bytes.
    pub cube_id: Uuid,
    /// 0-based index of this fragment within the molecule's atom sequence.
    pub part_id: u64,
    /// Reserved per-fragment content hash.
    pub hash: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Tombstone marker, reserved for incremental chains.
    pub delete: bool,
    /// Fragment size in bytes.
    pub size: u64,
}

impl Atom {
    /// Creates a fragment descriptor bound to a molecule and cube.
    pub fn new(molecule_id: Uuid, cube_id: Uuid, part_id: u64, size: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            molecule_id,
            cube_id,
            part_id,
            hash: String::new(),
            created_at: Utc::now(),
            delete: false,
            size,
        }
    }

    /// Serializes the atom descriptor to JSON.
    pub fn header(&self) -> FreezeResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}
