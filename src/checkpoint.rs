//! Checkpointing and recovery.
//!
//! A checkpoint is a directory named by its token, holding a
//! `manifest.json` plus per-group images:
//!
//! ```text
//! <dir>/<token>/manifest.json
//! <dir>/<token>/group-000.table.bin    hash-table slots (64-bit LE words)
//! <dir>/<token>/group-000.log.bin      log bytes [begin, tail)
//! ```
//!
//! Full checkpoints carry both images; index checkpoints only the table;
//! hybrid-log checkpoints only the log. Recovery accepts one full token or
//! an (index, hybrid-log) pair whose log reaches at least as far as the
//! table's tail. Every image is integrity-checked with a SHA-256 digest
//! recorded in the manifest, and geometry (predicate count, entry size,
//! table size) must match the registered group exactly.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::addr::Address;
use crate::error::{ChaindexError, Result};
use crate::hash::IndexKey;
use crate::store::SecondaryStore;

/// Names one completed checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CheckpointToken(String);

impl CheckpointToken {
    pub(crate) fn new(seq: u64, kind: CheckpointKind) -> Self {
        CheckpointToken(format!("{}-{seq:06}", kind.as_str()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CheckpointToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a checkpoint captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointKind {
    Full,
    Index,
    HybridLog,
}

impl CheckpointKind {
    fn as_str(self) -> &'static str {
        match self {
            CheckpointKind::Full => "full",
            CheckpointKind::Index => "index",
            CheckpointKind::HybridLog => "hlog",
        }
    }

    pub fn has_table(self) -> bool {
        matches!(self, CheckpointKind::Full | CheckpointKind::Index)
    }

    pub fn has_log(self) -> bool {
        matches!(self, CheckpointKind::Full | CheckpointKind::HybridLog)
    }
}

/// Per-group image metadata within a checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupManifest {
    pub group: u32,
    pub version: u32,
    pub predicate_count: u8,
    pub entry_size: u64,
    pub table_size: usize,
    pub begin: Address,
    pub tail: Address,
    pub table_digest: Option<String>,
    pub log_digest: Option<String>,
}

/// Top-level checkpoint descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub token: CheckpointToken,
    pub kind: CheckpointKind,
    pub groups: Vec<GroupManifest>,
}

fn token_dir(dir: &Path, token: &str) -> PathBuf {
    dir.join(token)
}

fn table_image_path(dir: &Path, token: &str, group: u32) -> PathBuf {
    token_dir(dir, token).join(format!("group-{group:03}.table.bin"))
}

fn log_image_path(dir: &Path, token: &str, group: u32) -> PathBuf {
    token_dir(dir, token).join(format!("group-{group:03}.log.bin"))
}

fn digest_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Load and parse a checkpoint manifest.
pub fn read_manifest(dir: &Path, token: &str) -> Result<CheckpointManifest> {
    let path = token_dir(dir, token).join("manifest.json");
    let bytes = std::fs::read(&path)
        .map_err(|e| ChaindexError::Recovery(format!("manifest {}: {e}", path.display())))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| ChaindexError::Recovery(format!("manifest {}: {e}", path.display())))
}

pub(crate) fn write_manifest(dir: &Path, manifest: &CheckpointManifest) -> Result<()> {
    let tdir = token_dir(dir, manifest.token.as_str());
    std::fs::create_dir_all(&tdir)?;
    let bytes = serde_json::to_vec_pretty(manifest)
        .map_err(|e| ChaindexError::Internal(format!("manifest serialization: {e}")))?;
    std::fs::write(tdir.join("manifest.json"), bytes)?;
    info!(token = %manifest.token, groups = manifest.groups.len(), "wrote checkpoint manifest");
    Ok(())
}

/// Write one group's images for a checkpoint of `kind`. The store must be
/// quiescent (the manager holds the checkpoint phases around this).
pub(crate) fn write_group_images<K: IndexKey>(
    store: &SecondaryStore<K>,
    group: u32,
    kind: CheckpointKind,
    dir: &Path,
    token: &str,
) -> Result<GroupManifest> {
    std::fs::create_dir_all(token_dir(dir, token))?;

    let mut table_digest = None;
    if kind.has_table() {
        let mut slots = Vec::new();
        store.table().snapshot_into(&mut slots);
        let mut bytes = Vec::with_capacity(slots.len() * 8);
        for w in &slots {
            bytes.extend_from_slice(&w.to_le_bytes());
        }
        table_digest = Some(digest_hex(&bytes));
        std::fs::write(table_image_path(dir, token, group), &bytes)?;
    }

    let mut log_digest = None;
    let (begin, tail);
    if kind.has_log() {
        let mut image = Vec::new();
        let bounds = store.log().dump_into(&mut image)?;
        begin = bounds.0;
        tail = bounds.1;
        log_digest = Some(digest_hex(&image));
        std::fs::write(log_image_path(dir, token, group), &image)?;
    } else {
        begin = store.log().begin_address();
        tail = store.log().tail_address();
    }

    Ok(GroupManifest {
        group,
        version: store.current_version(),
        predicate_count: store.accessor().predicate_count(),
        entry_size: store.accessor().entry_size(),
        table_size: store.table().size(),
        begin,
        tail,
        table_digest,
        log_digest,
    })
}

fn check_geometry<K: IndexKey>(store: &SecondaryStore<K>, gm: &GroupManifest) -> Result<()> {
    if gm.predicate_count != store.accessor().predicate_count()
        || gm.entry_size != store.accessor().entry_size()
        || gm.table_size != store.table().size()
    {
        return Err(ChaindexError::Recovery(format!(
            "group {} geometry mismatch: checkpoint has {} predicates x {} bytes, \
             table {}; store has {} x {}, table {}",
            gm.group,
            gm.predicate_count,
            gm.entry_size,
            gm.table_size,
            store.accessor().predicate_count(),
            store.accessor().entry_size(),
            store.table().size(),
        )));
    }
    Ok(())
}

fn verified_read(path: &Path, expected_digest: Option<&str>) -> Result<Vec<u8>> {
    let bytes = std::fs::read(path)
        .map_err(|e| ChaindexError::Recovery(format!("image {}: {e}", path.display())))?;
    let Some(expected) = expected_digest else {
        return Err(ChaindexError::Recovery(format!(
            "manifest lists no digest for {}",
            path.display()
        )));
    };
    let actual = digest_hex(&bytes);
    if actual != expected {
        return Err(ChaindexError::Recovery(format!(
            "digest mismatch for {}: manifest {expected}, image {actual}",
            path.display()
        )));
    }
    Ok(bytes)
}

/// Rebuild one group's store from a table manifest and a log manifest,
/// which may come from the same token (full checkpoint) or a pair.
pub(crate) fn recover_group_images<K: IndexKey>(
    store: &SecondaryStore<K>,
    dir: &Path,
    table_token: &str,
    table_manifest: &GroupManifest,
    log_token: &str,
    log_manifest: &GroupManifest,
) -> Result<()> {
    check_geometry(store, table_manifest)?;
    check_geometry(store, log_manifest)?;
    if log_manifest.tail < table_manifest.tail {
        return Err(ChaindexError::Recovery(format!(
            "log image (tail {}) predates the index image (tail {})",
            log_manifest.tail, table_manifest.tail
        )));
    }

    let table_bytes = verified_read(
        &table_image_path(dir, table_token, table_manifest.group),
        table_manifest.table_digest.as_deref(),
    )?;
    if table_bytes.len() % 8 != 0 {
        return Err(ChaindexError::Recovery(
            "hash table image is not a whole number of slots".into(),
        ));
    }
    let slots: Vec<u64> = table_bytes
        .chunks_exact(8)
        .map(|c| u64::from_le_bytes(c.try_into().expect("chunk of 8")))
        .collect();

    let log_bytes = verified_read(
        &log_image_path(dir, log_token, log_manifest.group),
        log_manifest.log_digest.as_deref(),
    )?;

    store
        .log()
        .restore_from(log_manifest.begin, log_manifest.tail, &log_bytes)?;
    store.table().restore_from(&slots)?;
    // Resume one version past the checkpoint so recovered records are
    // distinguishable from post-recovery writes.
    store.restore_version(table_manifest.version.max(log_manifest.version) + 1);
    info!(
        group = table_manifest.group,
        tail = %log_manifest.tail,
        "recovered group from checkpoint"
    );
    Ok(())
}
