//! Client-side hash history and the update merge.
//!
//! The history is the client's ordered knowledge of build hashes; an
//! index marks the one the process actually runs. Entries past the index
//! are pending updates queued for the swap loop.

use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::ids::BuildHash;
use crate::protocol::Update;

/// Inconsistencies between a server response and local history.
///
/// The server must answer with updates that line up exactly with what the
/// client asked for; any of these aborts the merge.
#[derive(Debug, Error)]
pub enum MergeError {
    #[error("first received update {first} does not anchor anywhere in local history")]
    Unanchored { first: BuildHash },
    #[error("known hash {hash} arrived after new history entries; response is out of order")]
    KnownAfterNew { hash: BuildHash },
    #[error("no stored update for known hash {hash}")]
    MissingRecord { hash: BuildHash },
    #[error("received update for {hash} differs from the stored one; updates are immutable per hash")]
    Divergent { hash: BuildHash },
}

/// Ordered build hashes plus the applied position and the stored update
/// per known hash.
#[derive(Debug)]
pub struct HashHistory {
    hashes: Vec<BuildHash>,
    current: usize,
    records: FxHashMap<BuildHash, Update>,
}

impl HashHistory {
    /// History of a fresh client: it knows its own build hash and nothing
    /// else.
    pub fn new(initial: BuildHash) -> Self {
        Self {
            hashes: vec![initial],
            current: 0,
            records: FxHashMap::default(),
        }
    }

    /// Hash at the applied position.
    pub fn current_hash(&self) -> &BuildHash {
        &self.hashes[self.current]
    }

    pub fn current_index(&self) -> usize {
        self.current
    }

    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }

    /// All known hashes in build order.
    pub fn hashes(&self) -> &[BuildHash] {
        &self.hashes
    }

    pub fn hash_at(&self, index: usize) -> Option<&BuildHash> {
        self.hashes.get(index)
    }

    /// True when nothing is pending past the applied position.
    pub fn is_at_tip(&self) -> bool {
        self.current + 1 >= self.hashes.len()
    }

    /// Stored update for a known hash.
    pub fn record(&self, hash: &BuildHash) -> Option<&Update> {
        self.records.get(hash)
    }

    /// The next pending update past the applied position.
    pub fn next_pending(&self) -> Option<&Update> {
        self.hashes
            .get(self.current + 1)
            .and_then(|hash| self.records.get(hash))
    }

    /// Move the applied position forward by one.
    pub fn advance(&mut self) -> Option<&BuildHash> {
        if self.is_at_tip() {
            return None;
        }
        self.current += 1;
        Some(&self.hashes[self.current])
    }

    /// Fold a server's ordered `updates_to_apply` into local history.
    ///
    /// Each entry either re-confirms a hash already known, in which case
    /// its content must equal the stored record, or extends history with a
    /// brand-new hash. Returns the newly queued hashes.
    pub fn merge(&mut self, updates: &[Update]) -> Result<Vec<BuildHash>, MergeError> {
        let Some(first) = updates.first() else {
            return Ok(Vec::new());
        };
        let Some(anchor) = self.hashes.iter().position(|hash| *hash == first.hash) else {
            return Err(MergeError::Unanchored {
                first: first.hash.clone(),
            });
        };
        // A fresh client knows its hash but holds no record for it yet;
        // the matching entry the server echoes back fills that in.
        if self.hashes.len() == 1 && self.records.is_empty() {
            self.records.insert(self.hashes[0].clone(), first.clone());
        }
        let mut queued = Vec::new();
        for (offset, update) in updates.iter().enumerate() {
            let position = anchor + offset;
            if position < self.hashes.len() {
                if !queued.is_empty() {
                    return Err(MergeError::KnownAfterNew {
                        hash: update.hash.clone(),
                    });
                }
                let known = self.hashes[position].clone();
                let Some(stored) = self.records.get(&known) else {
                    return Err(MergeError::MissingRecord { hash: known });
                };
                if stored != update {
                    return Err(MergeError::Divergent {
                        hash: update.hash.clone(),
                    });
                }
            } else {
                self.hashes.push(update.hash.clone());
                self.records.insert(update.hash.clone(), update.clone());
                queued.push(update.hash.clone());
            }
        }
        Ok(queued)
    }
}
