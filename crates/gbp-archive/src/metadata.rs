//! The dump envelope: a small JSON manifest describing the archive format,
//! written as the first member of the outer tar.
//!
//! Grounded on `utils/archive/metadata.py`, which defines a `Metadata`
//! dataclass (`version`, `timestamp`) the original never actually wires into
//! `dump`/`restore` — this crate does wire it in, as a third, optional
//! member (`metadata.json`) ahead of `records.json`/`storage.tar`. Its
//! absence is tolerated on restore so older two-member archives still load.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Current archive format version. Bump when a future change to the
/// `records.json`/`storage.tar` contract would break an older reader.
pub const CURRENT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DumpMetadata {
    pub version: u32,
    pub created: DateTime<Utc>,
    pub build_count: usize,
}

impl DumpMetadata {
    pub fn new(created: DateTime<Utc>, build_count: usize) -> Self {
        Self {
            version: CURRENT_VERSION,
            created,
            build_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_json() {
        let meta = DumpMetadata::new(Utc::now(), 3);
        let json = serde_json::to_string(&meta).unwrap();
        let back: DumpMetadata = serde_json::from_str(&json).unwrap();
        assert_eq!(meta, back);
    }
}
