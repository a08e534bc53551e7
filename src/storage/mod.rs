//! Persistence layer.
//!
//! Saves and loads the service state to/from a JSON file: the registry
//! image, the metadata projection, operations still parked on the ledger
//! and, for the simulated backend, its custody state. The running
//! registry stays the single authority; the snapshot is only read at
//! start-up.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;
use tracing::{debug, info};

use crate::engine::ParkedOperation;
use crate::ledger::simulated::SimulatedLedgerState;
use crate::registry::RegistrySnapshot;
use crate::types::{BetId, BetMetadata};

/// Default state file path.
const DEFAULT_STATE_FILE: &str = "wager_state.json";

// ---------------------------------------------------------------------------
// Metadata projection
// ---------------------------------------------------------------------------

/// Title and terms per bet, written after the registry commits the bet.
///
/// Never consulted for lifecycle decisions.
#[derive(Debug, Default)]
pub struct MetadataStore {
    entries: RwLock<HashMap<BetId, BetMetadata>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataEntry {
    pub bet_id: BetId,
    #[serde(flatten)]
    pub metadata: BetMetadata,
}

impl MetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: Vec<MetadataEntry>) -> Self {
        let map = entries.into_iter().map(|e| (e.bet_id, e.metadata)).collect();
        Self {
            entries: RwLock::new(map),
        }
    }

    pub fn put(&self, bet_id: BetId, metadata: BetMetadata) {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(bet_id, metadata);
    }

    pub fn get(&self, bet_id: BetId) -> Option<BetMetadata> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&bet_id)
            .cloned()
    }

    /// Whether every word of `query` appears in the bet's title, ignoring
    /// case. Bets without metadata never match a non-empty query.
    pub fn title_matches(&self, bet_id: BetId, query: &str) -> bool {
        let words: Vec<String> = query.split_whitespace().map(str::to_lowercase).collect();
        if words.is_empty() {
            return true;
        }
        let map = self.entries.read().unwrap_or_else(|e| e.into_inner());
        match map.get(&bet_id) {
            Some(m) => {
                let title = m.title.to_lowercase();
                words.iter().all(|w| title.contains(w.as_str()))
            }
            None => false,
        }
    }

    /// All entries, ordered by bet id.
    pub fn entries(&self) -> Vec<MetadataEntry> {
        let map = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let mut entries: Vec<MetadataEntry> = map
            .iter()
            .map(|(id, m)| MetadataEntry {
                bet_id: *id,
                metadata: m.clone(),
            })
            .collect();
        entries.sort_by_key(|e| e.bet_id);
        entries
    }
}

// ---------------------------------------------------------------------------
// Snapshot file
// ---------------------------------------------------------------------------

/// Everything persisted between runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub saved_at: DateTime<Utc>,
    pub registry: RegistrySnapshot,
    #[serde(default)]
    pub metadata: Vec<MetadataEntry>,
    /// Plans still waiting on the ledger when the snapshot was taken.
    #[serde(default)]
    pub operations: Vec<ParkedOperation>,
    /// Custody state of the simulated backend. Absent for real backends,
    /// which keep their own.
    #[serde(default)]
    pub ledger: Option<SimulatedLedgerState>,
}

impl Snapshot {
    pub fn new(registry: RegistrySnapshot, metadata: Vec<MetadataEntry>) -> Self {
        Self {
            saved_at: Utc::now(),
            registry,
            metadata,
            operations: Vec::new(),
            ledger: None,
        }
    }

    pub fn with_operations(mut self, operations: Vec<ParkedOperation>) -> Self {
        self.operations = operations;
        self
    }

    pub fn with_ledger(mut self, ledger: Option<SimulatedLedgerState>) -> Self {
        self.ledger = ledger;
        self
    }

    /// Custody state to load into a fresh simulated ledger.
    ///
    /// A snapshot with bets or parked operations but no ledger image is
    /// refused: its bets would claim escrow the new ledger never received.
    pub fn simulated_ledger_image(&self) -> Result<Option<SimulatedLedgerState>> {
        match &self.ledger {
            Some(image) => Ok(Some(image.clone())),
            None if self.registry.bets.is_empty() && self.operations.is_empty() => Ok(None),
            None => bail!(
                "Saved state holds {} bets but no simulated ledger state; \
                 refusing to restore them against an empty ledger",
                self.registry.bets.len()
            ),
        }
    }
}

/// Save a snapshot to a JSON file.
pub fn save_snapshot(snapshot: &Snapshot, path: Option<&str>) -> Result<()> {
    let path = path.unwrap_or(DEFAULT_STATE_FILE);
    let json = serde_json::to_string_pretty(snapshot)
        .context("Failed to serialise service state")?;

    // Write-then-rename so a crash mid-write never truncates the last good copy.
    let tmp = format!("{path}.tmp");
    std::fs::write(&tmp, &json).context(format!("Failed to write state to {tmp}"))?;
    std::fs::rename(&tmp, path).context(format!("Failed to move state into {path}"))?;

    debug!(path, bets = snapshot.registry.bets.len(), "State saved");
    Ok(())
}

/// Load a snapshot from a JSON file.
/// Returns None if the file doesn't exist (fresh start).
pub fn load_snapshot(path: Option<&str>) -> Result<Option<Snapshot>> {
    let path = path.unwrap_or(DEFAULT_STATE_FILE);

    if !Path::new(path).exists() {
        info!(path, "No saved state found, starting fresh");
        return Ok(None);
    }

    let json = std::fs::read_to_string(path)
        .context(format!("Failed to read state from {path}"))?;

    let snapshot: Snapshot = serde_json::from_str(&json)
        .context(format!("Failed to parse state from {path}"))?;

    info!(
        path,
        bets = snapshot.registry.bets.len(),
        parked = snapshot.operations.len(),
        next_id = snapshot.registry.next_id,
        saved_at = %snapshot.saved_at,
        "State loaded from disk"
    );

    Ok(Some(snapshot))
}

/// Delete the state file (for testing or reset).
pub fn delete_snapshot(path: Option<&str>) -> Result<()> {
    let path = path.unwrap_or(DEFAULT_STATE_FILE);
    if Path::new(path).exists() {
        std::fs::remove_file(path)
            .context(format!("Failed to delete state file {path}"))?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
