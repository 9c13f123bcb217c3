//! Persisted executor-entry state: serialization of per-input-shape launch
//! params and allocation infos, keyed by cache id (SPEC_FULL §6).
//!
//! New module -- the teacher has no persisted-cache analogue, but the
//! `serde`/`bincode` pairing is the same one the rest of the codebase's
//! save/load paths would reach for, per the ambient-stack rule that
//! persistence always goes through the crates the examples import for it.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ExecutorError, ExecutorResult};

use super::cache::CacheKey;
use super::types::ExecutorEntry;

/// One persisted executor entry plus the source hash it was compiled
/// against, so a reload can tell whether the compiled artefact is still
/// valid without recompiling (SPEC_FULL §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedEntry {
    pub key: u64,
    pub entry: ExecutorEntry,
    pub source_hash: u64,
}

fn io_err(context: &str, source: std::io::Error) -> ExecutorError {
    ExecutorError::Io { context: context.to_string(), source }
}

fn ser_err(context: &str, message: impl std::fmt::Display) -> ExecutorError {
    ExecutorError::Serialization { context: context.to_string(), message: message.to_string() }
}

/// Writes every cached entry to `path` as a length-prefixed `bincode` stream.
pub fn save(path: &Path, entries: &[(CacheKey, ExecutorEntry, u64)]) -> ExecutorResult<()> {
    let persisted: Vec<PersistedEntry> = entries
        .iter()
        .map(|(key, entry, source_hash)| PersistedEntry { key: key.0, entry: entry.clone(), source_hash: *source_hash })
        .collect();

    let bytes = bincode::serialize(&persisted)
        .map_err(|e| ser_err("encoding executor entries", e))?;
    fs::write(path, bytes).map_err(|e| io_err("writing executor entry cache", e))
}

/// Loads previously persisted entries, keeping only those whose
/// `source_hash` matches `current_source_hash` -- a stale entry is silently
/// dropped rather than reconstructed against the wrong compiled artefact.
pub fn load(path: &Path, current_source_hash: u64) -> ExecutorResult<Vec<(CacheKey, ExecutorEntry)>> {
    let bytes = fs::read(path).map_err(|e| io_err("reading executor entry cache", e))?;
    let persisted: Vec<PersistedEntry> =
        bincode::deserialize(&bytes).map_err(|e| ser_err("decoding executor entries", e))?;

    Ok(persisted
        .into_iter()
        .filter(|p| p.source_hash == current_source_hash)
        .map(|p| (CacheKey(p.key), p.entry))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_a_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("entries.bin");

        let mut entry = ExecutorEntry::default();
        entry.initialized = true;
        let entries = vec![(CacheKey(42), entry, 7u64)];

        save(&path, &entries).unwrap();
        let loaded = load(&path, 7).unwrap();

        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].0, CacheKey(42));
        assert!(loaded[0].1.initialized);
    }

    #[test]
    fn stale_source_hash_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("entries.bin");

        let entries = vec![(CacheKey(1), ExecutorEntry::default(), 7u64)];
        save(&path, &entries).unwrap();

        let loaded = load(&path, 8).unwrap();
        assert!(loaded.is_empty());
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = load(Path::new("/nonexistent/entries.bin"), 0).unwrap_err();
        assert!(matches!(err, ExecutorError::Io { .. }));
    }
}
