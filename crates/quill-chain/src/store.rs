//! Transactional store contract for the header graph and block bodies.
//!
//! The store owns header-graph identity: every known header gets a row id,
//! and all flags, peer tags, bodies and rollback journals hang off the row.
//! Three flags partition the graph:
//!
//! - `FUNCTIONAL` — the body is present and was locally validated.
//! - `REACHABLE`  — a functional path from genesis reaches this row.
//! - `ACTIVE`     — the row lies on the current best chain.
//!
//! Active rows form a simple path from genesis to the cursor. The store
//! maintains `REACHABLE` as a cascade whenever functionality flips.
//!
//! [`MemoryStore`] is the in-process implementation; a durable engine is an
//! external collaborator behind the same trait. All mutations happen under
//! a single-writer transaction (`tx_begin` / `tx_commit` / `tx_rollback`);
//! nesting is not supported.

use std::collections::{BTreeMap, HashMap};

use quill_core::error::StoreError;
use quill_core::merkle::CompactMmr;
use quill_core::rules::GENESIS_HEIGHT;
use quill_core::types::{BlockHeader, ChainWork, Hash256, HeaderId, Height};

/// Body present and locally validated.
pub const FLAG_FUNCTIONAL: u8 = 1 << 0;
/// Functional path from genesis reaches this row.
pub const FLAG_REACHABLE: u8 = 1 << 1;
/// On the current best chain.
pub const FLAG_ACTIVE: u8 = 1 << 2;

/// Identity of a peer that delivered data. Opaque to the store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PeerId(pub u64);

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

/// Row id plus height; row 0 means "no state".
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct StateId {
    pub row: u64,
    pub height: Height,
}

/// Keys of the store's params table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ParamId {
    CfgChecksum,
    LoHorizon,
    FossilHeight,
}

/// Outcome of [`ChainStore::delete_state`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Deleted {
    /// The row is still referenced (or active) and was kept.
    Kept,
    /// The row was removed; the predecessor row to consider next, if any.
    Removed(Option<u64>),
}

/// Transactional header graph + body blobs + params.
pub trait ChainStore {
    // --- transactions ---

    fn tx_begin(&mut self) -> Result<(), StoreError>;
    fn tx_commit(&mut self) -> Result<(), StoreError>;
    fn tx_rollback(&mut self) -> Result<(), StoreError>;

    // --- header graph ---

    /// Insert a header, returning its new row id. The header must not
    /// already be present.
    fn insert_state(&mut self, header: &BlockHeader) -> Result<u64, StoreError>;

    /// Find the row for a header id.
    fn state_find(&self, id: &HeaderId) -> Option<u64>;

    fn get_state(&self, row: u64) -> Result<BlockHeader, StoreError>;

    /// The stored hash of a row's header.
    fn get_state_hash(&self, row: u64) -> Result<Hash256, StoreError>;

    /// Predecessor of a row, if its parent header is known.
    fn get_prev(&self, row: u64) -> Option<StateId>;

    fn get_chainwork(&self, row: u64) -> Result<ChainWork, StoreError>;

    fn get_flags(&self, row: u64) -> u8;

    fn set_peer(&mut self, row: u64, peer: Option<PeerId>) -> Result<(), StoreError>;
    fn get_peer(&self, row: u64) -> Option<PeerId>;

    /// Mark a row functional and cascade `REACHABLE` into its functional
    /// descendants.
    fn set_state_functional(&mut self, row: u64) -> Result<(), StoreError>;

    /// Clear a row's functional flag and cascade `REACHABLE` removal out of
    /// everything that depended on it.
    fn set_state_not_functional(&mut self, row: u64) -> Result<(), StoreError>;

    /// Advance the cursor onto `sid`, marking it active. `sid.height` must
    /// be exactly one above the current cursor (or genesis on an empty
    /// chain).
    fn move_fwd(&mut self, sid: StateId) -> Result<(), StoreError>;

    /// Retreat the cursor one state, clearing the active flag.
    fn move_back(&mut self) -> Result<(), StoreError>;

    /// The current cursor, if any state is active.
    fn get_cursor(&self) -> Option<StateId>;

    /// Drop the whole active path without touching anything else. The
    /// caller is expected to rebuild state from scratch afterwards.
    fn reset_cursor(&mut self) -> Result<(), StoreError>;

    // --- tip enumeration ---

    /// All tips (rows without children), earliest height first, row id
    /// breaking ties. Deterministic for test reproducibility.
    fn enum_tips(&self) -> Vec<StateId>;

    /// Functional-and-reachable tips, best chainwork first, row id breaking
    /// ties.
    fn enum_functional_tips(&self) -> Vec<StateId>;

    fn enum_states_at(&self, height: Height) -> Vec<u64>;

    // --- bodies ---

    fn set_state_block(&mut self, row: u64, body: Vec<u8>) -> Result<(), StoreError>;

    /// Body blob and rollback journal of a row.
    fn get_state_block(&self, row: u64)
        -> Result<(Option<Vec<u8>>, Option<Vec<u8>>), StoreError>;

    fn set_state_rollback(&mut self, row: u64, journal: Vec<u8>) -> Result<(), StoreError>;

    /// Drop a row's body and journal.
    fn del_state_block(&mut self, row: u64) -> Result<(), StoreError>;

    /// Delete an unreferenced row entirely.
    fn delete_state(&mut self, row: u64) -> Result<Deleted, StoreError>;

    // --- params ---

    fn param_set(&mut self, id: ParamId, value: Option<Vec<u8>>);
    fn param_get(&self, id: ParamId) -> Option<Vec<u8>>;

    fn param_set_u64(&mut self, id: ParamId, value: u64) {
        self.param_set(id, Some(value.to_le_bytes().to_vec()));
    }

    fn param_get_u64(&self, id: ParamId, default: u64) -> u64 {
        match self.param_get(id) {
            Some(bytes) if bytes.len() == 8 => {
                u64::from_le_bytes(bytes.try_into().expect("length checked"))
            }
            _ => default,
        }
    }

    // --- history MMR ---

    /// MMR root over the active header hashes from genesis up to and
    /// including `sid`, which must lie on the active path.
    fn predicted_history_root(&self, sid: StateId) -> Result<Hash256, StoreError>;

    // --- macroblocks ---

    fn set_macroblock(&mut self, top_height: Height, bytes: Vec<u8>) -> Result<(), StoreError>;

    /// Stored macroblocks, highest top height first.
    fn enum_macroblocks(&self) -> Vec<(Height, Vec<u8>)>;
}

/// One header-graph row.
#[derive(Clone, Debug)]
struct StateRow {
    header: BlockHeader,
    hash: Hash256,
    flags: u8,
    peer: Option<PeerId>,
    body: Option<Vec<u8>>,
    journal: Option<Vec<u8>>,
}

/// The whole mutable store content, cloneable for snapshot transactions.
#[derive(Clone, Debug, Default)]
struct StoreState {
    rows: BTreeMap<u64, StateRow>,
    by_hash: HashMap<Hash256, u64>,
    by_height: BTreeMap<Height, Vec<u64>>,
    /// Active rows in height order; index 0 is genesis.
    active: Vec<u64>,
    params: BTreeMap<ParamId, Vec<u8>>,
    macroblocks: BTreeMap<Height, Vec<u8>>,
    next_row: u64,
}

/// In-memory [`ChainStore`]: everything in ordered maps, transactions as
/// whole-state snapshots. The production counterpart would put the same
/// contract over a durable KV engine.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: StoreState,
    snapshot: Option<Box<StoreState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn row(&self, row: u64) -> Result<&StateRow, StoreError> {
        self.state.rows.get(&row).ok_or(StoreError::StateNotFound(row))
    }

    fn row_mut(&mut self, row: u64) -> Result<&mut StateRow, StoreError> {
        self.state
            .rows
            .get_mut(&row)
            .ok_or(StoreError::StateNotFound(row))
    }

    /// Rows whose header links to `row`.
    fn children(&self, row: u64) -> Vec<u64> {
        let Some(parent) = self.state.rows.get(&row) else {
            return Vec::new();
        };
        let next_height = parent.header.height + 1;
        let mut out: Vec<u64> = self
            .state
            .by_height
            .get(&next_height)
            .into_iter()
            .flatten()
            .copied()
            .filter(|r| {
                self.state
                    .rows
                    .get(r)
                    .map(|c| c.header.prev == parent.hash)
                    .unwrap_or(false)
            })
            .collect();
        out.sort_unstable();
        out
    }

    fn has_flag(&self, row: u64, flag: u8) -> bool {
        self.get_flags(row) & flag != 0
    }

    /// Propagate `REACHABLE` downward from a newly reachable row.
    fn cascade_reachable(&mut self, row: u64) {
        let mut frontier = vec![row];
        while let Some(r) = frontier.pop() {
            for child in self.children(r) {
                let flags = self.get_flags(child);
                if flags & FLAG_FUNCTIONAL != 0 && flags & FLAG_REACHABLE == 0 {
                    if let Some(c) = self.state.rows.get_mut(&child) {
                        c.flags |= FLAG_REACHABLE;
                    }
                    frontier.push(child);
                }
            }
        }
    }

    /// Strip `REACHABLE` from a row and every descendant that depended on
    /// it.
    fn cascade_unreachable(&mut self, row: u64) {
        let mut frontier = vec![row];
        while let Some(r) = frontier.pop() {
            if let Some(node) = self.state.rows.get_mut(&r) {
                if node.flags & FLAG_REACHABLE == 0 {
                    continue;
                }
                node.flags &= !FLAG_REACHABLE;
            } else {
                continue;
            }
            frontier.extend(self.children(r));
        }
    }
}

impl ChainStore for MemoryStore {
    fn tx_begin(&mut self) -> Result<(), StoreError> {
        if self.snapshot.is_some() {
            return Err(StoreError::NestedTransaction);
        }
        self.snapshot = Some(Box::new(self.state.clone()));
        Ok(())
    }

    fn tx_commit(&mut self) -> Result<(), StoreError> {
        self.snapshot.take().ok_or(StoreError::NoTransaction)?;
        Ok(())
    }

    fn tx_rollback(&mut self) -> Result<(), StoreError> {
        let snapshot = self.snapshot.take().ok_or(StoreError::NoTransaction)?;
        self.state = *snapshot;
        Ok(())
    }

    fn insert_state(&mut self, header: &BlockHeader) -> Result<u64, StoreError> {
        let hash = header.hash();
        if self.state.by_hash.contains_key(&hash) {
            return Err(StoreError::DuplicateState(header.id().to_string()));
        }
        self.state.next_row += 1;
        let row = self.state.next_row;
        self.state.rows.insert(
            row,
            StateRow {
                header: *header,
                hash,
                flags: 0,
                peer: None,
                body: None,
                journal: None,
            },
        );
        self.state.by_hash.insert(hash, row);
        self.state
            .by_height
            .entry(header.height)
            .or_default()
            .push(row);
        Ok(row)
    }

    fn state_find(&self, id: &HeaderId) -> Option<u64> {
        let row = *self.state.by_hash.get(&id.hash)?;
        (self.state.rows[&row].header.height == id.height).then_some(row)
    }

    fn get_state(&self, row: u64) -> Result<BlockHeader, StoreError> {
        Ok(self.row(row)?.header)
    }

    fn get_state_hash(&self, row: u64) -> Result<Hash256, StoreError> {
        Ok(self.row(row)?.hash)
    }

    fn get_prev(&self, row: u64) -> Option<StateId> {
        let node = self.state.rows.get(&row)?;
        if node.header.height == GENESIS_HEIGHT {
            return None;
        }
        let prev_row = *self.state.by_hash.get(&node.header.prev)?;
        Some(StateId {
            row: prev_row,
            height: node.header.height - 1,
        })
    }

    fn get_chainwork(&self, row: u64) -> Result<ChainWork, StoreError> {
        Ok(self.row(row)?.header.chainwork)
    }

    fn get_flags(&self, row: u64) -> u8 {
        self.state.rows.get(&row).map(|r| r.flags).unwrap_or(0)
    }

    fn set_peer(&mut self, row: u64, peer: Option<PeerId>) -> Result<(), StoreError> {
        self.row_mut(row)?.peer = peer;
        Ok(())
    }

    fn get_peer(&self, row: u64) -> Option<PeerId> {
        self.state.rows.get(&row).and_then(|r| r.peer)
    }

    fn set_state_functional(&mut self, row: u64) -> Result<(), StoreError> {
        let height = self.row(row)?.header.height;
        let reachable = height == GENESIS_HEIGHT
            || self
                .get_prev(row)
                .map(|p| self.has_flag(p.row, FLAG_REACHABLE))
                .unwrap_or(false);

        let node = self.row_mut(row)?;
        node.flags |= FLAG_FUNCTIONAL;
        if reachable {
            node.flags |= FLAG_REACHABLE;
            self.cascade_reachable(row);
        }
        Ok(())
    }

    fn set_state_not_functional(&mut self, row: u64) -> Result<(), StoreError> {
        let node = self.row_mut(row)?;
        node.flags &= !FLAG_FUNCTIONAL;
        self.cascade_unreachable(row);
        Ok(())
    }

    fn move_fwd(&mut self, sid: StateId) -> Result<(), StoreError> {
        let expected = GENESIS_HEIGHT + self.state.active.len() as u64;
        if sid.height != expected {
            return Err(StoreError::CursorMismatch {
                expected,
                got: sid.height,
            });
        }
        self.row_mut(sid.row)?.flags |= FLAG_ACTIVE;
        self.state.active.push(sid.row);
        Ok(())
    }

    fn move_back(&mut self) -> Result<(), StoreError> {
        let row = self.state.active.pop().ok_or(StoreError::CursorMismatch {
            expected: GENESIS_HEIGHT,
            got: 0,
        })?;
        if let Some(node) = self.state.rows.get_mut(&row) {
            node.flags &= !FLAG_ACTIVE;
        }
        Ok(())
    }

    fn get_cursor(&self) -> Option<StateId> {
        let row = *self.state.active.last()?;
        Some(StateId {
            row,
            height: GENESIS_HEIGHT + self.state.active.len() as u64 - 1,
        })
    }

    fn reset_cursor(&mut self) -> Result<(), StoreError> {
        for row in std::mem::take(&mut self.state.active) {
            if let Some(node) = self.state.rows.get_mut(&row) {
                node.flags &= !FLAG_ACTIVE;
            }
        }
        Ok(())
    }

    fn enum_tips(&self) -> Vec<StateId> {
        let mut tips: Vec<StateId> = self
            .state
            .rows
            .iter()
            .filter(|(row, _)| self.children(**row).is_empty())
            .map(|(row, node)| StateId {
                row: *row,
                height: node.header.height,
            })
            .collect();
        tips.sort_unstable_by_key(|sid| (sid.height, sid.row));
        tips
    }

    fn enum_functional_tips(&self) -> Vec<StateId> {
        const LIVE: u8 = FLAG_FUNCTIONAL | FLAG_REACHABLE;
        let mut tips: Vec<(ChainWork, StateId)> = self
            .state
            .rows
            .iter()
            .filter(|(row, node)| {
                node.flags & LIVE == LIVE
                    && !self
                        .children(**row)
                        .iter()
                        .any(|c| self.get_flags(*c) & LIVE == LIVE)
            })
            .map(|(row, node)| {
                (
                    node.header.chainwork,
                    StateId {
                        row: *row,
                        height: node.header.height,
                    },
                )
            })
            .collect();
        tips.sort_unstable_by(|a, b| b.0.cmp(&a.0).then(a.1.row.cmp(&b.1.row)));
        tips.into_iter().map(|(_, sid)| sid).collect()
    }

    fn enum_states_at(&self, height: Height) -> Vec<u64> {
        let mut rows: Vec<u64> = self
            .state
            .by_height
            .get(&height)
            .cloned()
            .unwrap_or_default();
        rows.sort_unstable();
        rows
    }

    fn set_state_block(&mut self, row: u64, body: Vec<u8>) -> Result<(), StoreError> {
        self.row_mut(row)?.body = Some(body);
        Ok(())
    }

    fn get_state_block(
        &self,
        row: u64,
    ) -> Result<(Option<Vec<u8>>, Option<Vec<u8>>), StoreError> {
        let node = self.row(row)?;
        Ok((node.body.clone(), node.journal.clone()))
    }

    fn set_state_rollback(&mut self, row: u64, journal: Vec<u8>) -> Result<(), StoreError> {
        self.row_mut(row)?.journal = Some(journal);
        Ok(())
    }

    fn del_state_block(&mut self, row: u64) -> Result<(), StoreError> {
        let node = self.row_mut(row)?;
        node.body = None;
        node.journal = None;
        Ok(())
    }

    fn delete_state(&mut self, row: u64) -> Result<Deleted, StoreError> {
        if self.has_flag(row, FLAG_ACTIVE) || !self.children(row).is_empty() {
            return Ok(Deleted::Kept);
        }
        let prev = self.get_prev(row).map(|p| p.row);
        let node = self
            .state
            .rows
            .remove(&row)
            .ok_or(StoreError::StateNotFound(row))?;
        self.state.by_hash.remove(&node.hash);
        if let Some(rows) = self.state.by_height.get_mut(&node.header.height) {
            rows.retain(|r| *r != row);
            if rows.is_empty() {
                self.state.by_height.remove(&node.header.height);
            }
        }
        Ok(Deleted::Removed(prev))
    }

    fn param_set(&mut self, id: ParamId, value: Option<Vec<u8>>) {
        match value {
            Some(v) => {
                self.state.params.insert(id, v);
            }
            None => {
                self.state.params.remove(&id);
            }
        }
    }

    fn param_get(&self, id: ParamId) -> Option<Vec<u8>> {
        self.state.params.get(&id).cloned()
    }

    fn predicted_history_root(&self, sid: StateId) -> Result<Hash256, StoreError> {
        if sid.height < GENESIS_HEIGHT {
            return Ok(Hash256::ZERO);
        }
        let index = (sid.height - GENESIS_HEIGHT) as usize;
        if self.state.active.get(index) != Some(&sid.row) {
            return Err(StoreError::StateNotFound(sid.row));
        }
        let mut mmr = CompactMmr::new();
        for row in &self.state.active[..=index] {
            mmr.append(self.row(*row)?.hash);
        }
        Ok(mmr.root())
    }

    fn set_macroblock(&mut self, top_height: Height, bytes: Vec<u8>) -> Result<(), StoreError> {
        self.state.macroblocks.insert(top_height, bytes);
        Ok(())
    }

    fn enum_macroblocks(&self) -> Vec<(Height, Vec<u8>)> {
        self.state
            .macroblocks
            .iter()
            .rev()
            .map(|(h, b)| (*h, b.clone()))
            .collect()
    }
}
