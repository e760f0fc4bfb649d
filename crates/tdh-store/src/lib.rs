//! Document store for harvested Torn data.
//!
//! Three collections, each one JSON file under the store root: the faction
//! attack log, append-only user status snapshots, and the per-player profile
//! projection. Everything is held in memory and flushed with an atomic
//! temp-file rename; the design assumes a single writer per directory.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tdh_core::{AttackRecord, NaturalKey, UserProfileSummary, UserStatusSnapshot};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "tdh-store";

const ATTACKS_FILE: &str = "faction_attacks.json";
const STATUSES_FILE: &str = "user_statuses.json";
const PROFILES_FILE: &str = "user_profiles.json";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("writing {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("decoding {path}: {source}")]
    Decode {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("encoding {collection}: {source}")]
    Encode {
        collection: &'static str,
        source: serde_json::Error,
    },
}

/// One persisted attack document: the record plus its storage identity,
/// derived deterministically from the natural key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttackDocument {
    pub id: String,
    pub record: AttackRecord,
}

/// Per-batch insert reconciliation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub new: u64,
    pub duplicates: u64,
}

#[derive(Debug)]
pub struct HarvestStore {
    root: PathBuf,
    attacks: Vec<AttackDocument>,
    key_index: HashSet<NaturalKey>,
    statuses: Vec<UserStatusSnapshot>,
    profiles: BTreeMap<i64, UserProfileSummary>,
}

impl HarvestStore {
    /// Opens (or creates) a store directory and loads all collections.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|source| StoreError::Write {
            path: root.clone(),
            source,
        })?;

        let attacks: Vec<AttackDocument> = load_collection(&root.join(ATTACKS_FILE))?;
        let statuses: Vec<UserStatusSnapshot> = load_collection(&root.join(STATUSES_FILE))?;
        let profiles: BTreeMap<i64, UserProfileSummary> =
            load_collection(&root.join(PROFILES_FILE))?;

        let key_index = attacks.iter().map(|doc| doc.record.natural_key()).collect();
        Ok(Self {
            root,
            attacks,
            key_index,
            statuses,
            profiles,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Writes all collections to disk via temp-file-then-rename.
    pub fn flush(&self) -> Result<(), StoreError> {
        write_collection(&self.root, ATTACKS_FILE, "faction_attacks", &self.attacks)?;
        write_collection(&self.root, STATUSES_FILE, "user_statuses", &self.statuses)?;
        write_collection(&self.root, PROFILES_FILE, "user_profiles", &self.profiles)?;
        Ok(())
    }

    pub fn contains_natural_key(&self, key: &NaturalKey) -> bool {
        self.key_index.contains(key)
    }

    pub fn attack_count(&self) -> usize {
        self.attacks.len()
    }

    pub fn attacks(&self) -> impl Iterator<Item = &AttackDocument> {
        self.attacks.iter()
    }

    pub fn find_attack(&self, key: &NaturalKey) -> Option<&AttackDocument> {
        self.attacks
            .iter()
            .find(|doc| doc.record.natural_key() == *key)
    }

    /// Idempotent batch insert: existence check per record, insert only if
    /// the natural key is absent.
    pub fn insert_attack_batch<I>(&mut self, records: I) -> BatchOutcome
    where
        I: IntoIterator<Item = AttackRecord>,
    {
        let mut outcome = BatchOutcome::default();
        for record in records {
            let key = record.natural_key();
            if self.contains_natural_key(&key) {
                outcome.duplicates += 1;
                continue;
            }
            self.key_index.insert(key);
            self.attacks.push(AttackDocument {
                id: key.derived_id(),
                record,
            });
            outcome.new += 1;
        }
        debug!(new = outcome.new, duplicates = outcome.duplicates, "attack batch written");
        outcome
    }

    /// Inserts without the existence check. Exists to model what a racing
    /// second writer could do to the collection; the deduplicator is the
    /// safety net for exactly this.
    pub fn insert_attack_unchecked(&mut self, record: AttackRecord) {
        let key = record.natural_key();
        self.key_index.insert(key);
        self.attacks.push(AttackDocument {
            id: key.derived_id(),
            record,
        });
    }

    /// Groups persisted attacks by natural key and deletes all but one member
    /// of every group. The survivor is the member with the lowest document
    /// id; equal ids keep the earliest-inserted copy. Idempotent.
    pub fn remove_duplicate_attacks(&mut self) -> usize {
        let mut groups: BTreeMap<NaturalKey, Vec<usize>> = BTreeMap::new();
        for (idx, doc) in self.attacks.iter().enumerate() {
            groups.entry(doc.record.natural_key()).or_default().push(idx);
        }

        let mut doomed: BTreeSet<usize> = BTreeSet::new();
        for indices in groups.values() {
            if indices.len() < 2 {
                continue;
            }
            let survivor = *indices
                .iter()
                .min_by_key(|&&i| (&self.attacks[i].id, i))
                .expect("group has at least two members");
            doomed.extend(indices.iter().copied().filter(|&i| i != survivor));
        }

        let removed = doomed.len();
        if removed > 0 {
            let mut idx = 0usize;
            self.attacks.retain(|_| {
                let keep = !doomed.contains(&idx);
                idx += 1;
                keep
            });
        }
        removed
    }

    /// Appends a status snapshot and returns its storage identity.
    pub fn insert_status(&mut self, snapshot: UserStatusSnapshot) -> Uuid {
        let id = snapshot.snapshot_id;
        self.statuses.push(snapshot);
        id
    }

    pub fn status_count(&self, player_id: i64) -> u64 {
        self.statuses
            .iter()
            .filter(|s| s.player_id == player_id)
            .count() as u64
    }

    /// Full-replace upsert keyed by `player_id`.
    pub fn upsert_profile(&mut self, summary: UserProfileSummary) {
        self.profiles.insert(summary.player_id, summary);
    }

    pub fn profile(&self, player_id: i64) -> Option<&UserProfileSummary> {
        self.profiles.get(&player_id)
    }

    pub fn profile_count(&self) -> usize {
        self.profiles.len()
    }
}

fn load_collection<T>(path: &Path) -> Result<T, StoreError>
where
    T: DeserializeOwned + Default,
{
    match fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes).map_err(|source| StoreError::Decode {
            path: path.to_path_buf(),
            source,
        }),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(source) => Err(StoreError::Read {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn write_collection<T: Serialize>(
    root: &Path,
    file_name: &str,
    collection: &'static str,
    value: &T,
) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec_pretty(value)
        .map_err(|source| StoreError::Encode { collection, source })?;
    let final_path = root.join(file_name);
    let temp_path = root.join(format!(".{file_name}.tmp"));
    fs::write(&temp_path, &bytes).map_err(|source| StoreError::Write {
        path: temp_path.clone(),
        source,
    })?;
    fs::rename(&temp_path, &final_path).map_err(|source| StoreError::Write {
        path: final_path,
        source,
    })
}
