//! Ephemeral per-participant state: who is in the session, their color,
//! and where their cursor is.
//!
//! Presence follows the same discipline as the document itself: every
//! change is a merge of a broadcast update, never a direct field write.
//! Each participant owns exactly one entry, keyed by its ephemeral
//! integer client id, versioned by a per-client clock so duplicated or
//! reordered updates are harmless. Removal is a propagated update
//! carrying an empty entry, not a local-only delete.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::protocol::ProtocolError;

/// Cursor position as a selection range in the document text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorRange {
    pub anchor: u32,
    pub head: u32,
}

impl CursorRange {
    pub fn caret(offset: u32) -> Self {
        Self {
            anchor: offset,
            head: offset,
        }
    }
}

/// One participant's identity and cursor state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub name: String,
    /// RGBA color for remote cursor rendering.
    pub color: [f32; 4],
    pub cursor: Option<CursorRange>,
}

impl PresenceEntry {
    /// Create an entry with a stable color derived from the client id.
    pub fn new(name: impl Into<String>, client_id: u64) -> Self {
        Self {
            name: name.into(),
            color: color_from_client(client_id),
            cursor: None,
        }
    }

    pub fn with_cursor(mut self, cursor: CursorRange) -> Self {
        self.cursor = Some(cursor);
        self
    }
}

/// Stable color from a client id hash.
fn color_from_client(id: u64) -> [f32; 4] {
    let r = (id & 0xFF) as f32 / 255.0;
    let g = ((id >> 8) & 0xFF) as f32 / 255.0;
    let b = ((id >> 16) & 0xFF) as f32 / 255.0;
    [r, g, b, 1.0]
}

/// Wire form of one client's entry at one clock value. `entry == None`
/// propagates a removal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceEntryUpdate {
    pub client: u64,
    pub clock: u32,
    pub entry: Option<PresenceEntry>,
}

/// A batch of entry updates, the payload of a presence envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceUpdate {
    pub entries: Vec<PresenceEntryUpdate>,
}

impl PresenceUpdate {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Presence(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (update, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Presence(e.to_string()))?;
        Ok(update)
    }
}

/// Result of merging a remote update: which clients appeared, changed,
/// or disappeared. Consumed by the rendering layer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PresenceDiff {
    pub added: Vec<u64>,
    pub updated: Vec<u64>,
    pub removed: Vec<u64>,
}

impl PresenceDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

#[derive(Debug, Clone)]
struct PresenceRecord {
    clock: u32,
    entry: Option<PresenceEntry>,
    seen: Instant,
}

/// Per-session presence map.
///
/// Local mutations return the update to broadcast; remote updates are
/// merged through [`PresenceStore::apply`] and never produce further
/// broadcasts, so applying what a peer sent us can never echo back.
pub struct PresenceStore {
    local_id: u64,
    local_clock: u32,
    entries: HashMap<u64, PresenceRecord>,
}

impl PresenceStore {
    pub fn new(local_id: u64) -> Self {
        Self {
            local_id,
            local_clock: 0,
            entries: HashMap::new(),
        }
    }

    pub fn local_id(&self) -> u64 {
        self.local_id
    }

    /// Set or replace the local entry. Returns the update to broadcast.
    pub fn set_local(&mut self, entry: PresenceEntry) -> PresenceUpdate {
        self.local_clock += 1;
        self.entries.insert(
            self.local_id,
            PresenceRecord {
                clock: self.local_clock,
                entry: Some(entry.clone()),
                seen: Instant::now(),
            },
        );
        PresenceUpdate {
            entries: vec![PresenceEntryUpdate {
                client: self.local_id,
                clock: self.local_clock,
                entry: Some(entry),
            }],
        }
    }

    /// Remove the local entry. Returns the removal update to broadcast,
    /// or `None` if there was nothing to remove.
    pub fn clear_local(&mut self) -> Option<PresenceUpdate> {
        let live = self
            .entries
            .get(&self.local_id)
            .is_some_and(|r| r.entry.is_some());
        if !live {
            return None;
        }
        self.local_clock += 1;
        self.entries.insert(
            self.local_id,
            PresenceRecord {
                clock: self.local_clock,
                entry: None,
                seen: Instant::now(),
            },
        );
        Some(PresenceUpdate {
            entries: vec![PresenceEntryUpdate {
                client: self.local_id,
                clock: self.local_clock,
                entry: None,
            }],
        })
    }

    /// Re-announce the local entry at a bumped clock. Broadcast on an
    /// interval shorter than the sweep timeout, this keeps an idle
    /// participant alive in everyone else's store. `None` when there is
    /// no live local entry.
    pub fn refresh_local(&mut self) -> Option<PresenceUpdate> {
        let entry = self.entries.get(&self.local_id)?.entry.clone()?;
        Some(self.set_local(entry))
    }

    /// Merge a remote update. Only entries with a newer clock apply, so
    /// the merge is idempotent and order-independent per client.
    pub fn apply(&mut self, update: &PresenceUpdate) -> PresenceDiff {
        let mut diff = PresenceDiff::default();
        for item in &update.entries {
            // The local entry is authoritative here; a reflected copy of
            // our own state must not overwrite it.
            if item.client == self.local_id {
                continue;
            }
            match self.entries.get_mut(&item.client) {
                Some(record) => {
                    if item.clock <= record.clock {
                        continue;
                    }
                    let had = record.entry.is_some();
                    record.clock = item.clock;
                    record.entry = item.entry.clone();
                    record.seen = Instant::now();
                    match (had, item.entry.is_some()) {
                        (false, true) => diff.added.push(item.client),
                        (true, true) => diff.updated.push(item.client),
                        (true, false) => diff.removed.push(item.client),
                        (false, false) => {}
                    }
                }
                None => {
                    self.entries.insert(
                        item.client,
                        PresenceRecord {
                            clock: item.clock,
                            entry: item.entry.clone(),
                            seen: Instant::now(),
                        },
                    );
                    if item.entry.is_some() {
                        diff.added.push(item.client);
                    }
                }
            }
        }
        diff
    }

    /// Full set of live entries, for bringing a newly-opened channel up
    /// to date. `None` when there is nothing to send.
    pub fn snapshot(&self) -> Option<PresenceUpdate> {
        let entries: Vec<PresenceEntryUpdate> = self
            .entries
            .iter()
            .filter(|(_, record)| record.entry.is_some())
            .map(|(client, record)| PresenceEntryUpdate {
                client: *client,
                clock: record.clock,
                entry: record.entry.clone(),
            })
            .collect();
        if entries.is_empty() {
            None
        } else {
            Some(PresenceUpdate { entries })
        }
    }

    /// All live remote entries.
    pub fn remote_entries(&self) -> Vec<(u64, PresenceEntry)> {
        self.entries
            .iter()
            .filter(|(client, _)| **client != self.local_id)
            .filter_map(|(client, record)| record.entry.clone().map(|e| (*client, e)))
            .collect()
    }

    pub fn get(&self, client: u64) -> Option<&PresenceEntry> {
        self.entries.get(&client).and_then(|r| r.entry.as_ref())
    }

    /// Number of live entries, local included.
    pub fn len(&self) -> usize {
        self.entries.values().filter(|r| r.entry.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop remote records whose liveness is older than `timeout`.
    /// Returns the ids of live entries that were removed. Local-only
    /// cleanup — dead peers cannot be told about their own departure.
    pub fn sweep(&mut self, timeout: Duration) -> Vec<u64> {
        let local_id = self.local_id;
        let mut removed = Vec::new();
        self.entries.retain(|client, record| {
            if *client == local_id || record.seen.elapsed() <= timeout {
                return true;
            }
            if record.entry.is_some() {
                removed.push(*client);
            }
            false
        });
        removed
    }
}
