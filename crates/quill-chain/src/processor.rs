//! The chain processor: owner of the authoritative view of the best chain.
//!
//! All mutating entry points run on one owning thread and open a single
//! store transaction; externally observable state changes land atomically
//! at commit. The in-memory accumulators are kept transactional by
//! construction: any partially applied block is exactly unapplied before a
//! failure is reported.
//!
//! Three failure tiers: corruption of already-validated persisted state is
//! [`ProcessorError::Corrupted`] and process-terminating; peer-sourced
//! validation failures are logged, the offending body dropped and the peer
//! reported insane; everything else is a normal [`DataStatus`] outcome.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{info, warn};

use quill_core::body::{self, BlockBody, Input, Output, Transaction, TxKernel};
use quill_core::difficulty::adjust_difficulty;
use quill_core::error::ProcessorError;
use quill_core::rules;
use quill_core::types::{
    definition_hash, live_hash, BlockHeader, ChainWork, Difficulty, Hash256, HeaderId, Height,
    HeightRange, Scalar,
};

use crate::events::{NullEvents, ProcessorEvents};
use crate::kernel_set::KernelSet;
use crate::macroblock::Macroblock;
use crate::store::{
    ChainStore, Deleted, ParamId, PeerId, StateId, FLAG_ACTIVE, FLAG_FUNCTIONAL, FLAG_REACHABLE,
};
use crate::utxo_tree::{UtxoKey, UtxoTree};

/// Outcome of header or body admission.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataStatus {
    /// Ingested.
    Accepted,
    /// Duplicate or otherwise uninteresting.
    Rejected,
    /// Standalone-bad; ban-worthy.
    Invalid,
    /// Below the rollback horizon.
    Unreachable,
}

/// Processor configuration.
#[derive(Clone, Copy, Debug)]
pub struct Options {
    /// Drop the active path on startup and rebuild from scratch.
    pub reset_cursor: bool,
    /// Keep alternative tips within this distance of the cursor.
    pub horizon_branching: Height,
    /// Keep full block bodies within this distance of the cursor.
    /// Clamped up to at least the branching horizon and
    /// [`MAX_ROLLBACK_HEIGHT`](rules::MAX_ROLLBACK_HEIGHT).
    pub horizon_schwarzschild: Height,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            reset_cursor: false,
            horizon_branching: Height::MAX,
            horizon_schwarzschild: Height::MAX,
        }
    }
}

/// Pruning horizons, after startup clamping.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Horizon {
    pub branching: Height,
    pub schwarzschild: Height,
}

/// The processor's view of the active tip.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct Cursor {
    /// Row and height of the tip; row 0 on an empty chain.
    pub sid: StateId,
    /// Full header of the tip.
    pub full: BlockHeader,
    /// Cached id of the tip.
    pub id: HeaderId,
    /// History MMR root over all headers up to but excluding the tip.
    pub history: Hash256,
    /// History MMR root including the tip.
    pub history_next: Hash256,
    /// Lowest height at which rollback is still permitted.
    pub lo_horizon: Height,
    /// Difficulty required of the next block.
    pub difficulty_next: Difficulty,
}

/// Aggregate state mutated only through block apply/unapply.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Extra {
    /// Total subsidy emitted along the active chain.
    pub subsidy: u128,
    /// Aggregate blinding offset of the active chain.
    pub offset: Scalar,
    /// Whether coinbase emission is still open. Mirrors the absence of the
    /// zero-hash sentinel in the kernel set.
    pub subsidy_open: bool,
}

/// The chain processing core.
pub struct Processor {
    pub(crate) store: Box<dyn ChainStore>,
    pub(crate) utxos: UtxoTree,
    pub(crate) kernels: KernelSet,
    pub(crate) cursor: Cursor,
    pub(crate) extra: Extra,
    pub(crate) horizon: Horizon,
    pub(crate) events: Arc<dyn ProcessorEvents>,
    pub(crate) clock: Box<dyn Fn() -> u64>,
    /// Cached serialized size of a fees output, for template sizing.
    pub(crate) size_fees_output: Option<usize>,
}

impl std::fmt::Debug for Processor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Processor")
            .field("cursor", &self.cursor)
            .field("extra", &self.extra)
            .field("horizon", &self.horizon)
            .field("size_fees_output", &self.size_fees_output)
            .finish_non_exhaustive()
    }
}

impl Processor {
    /// Open the processor over a store with default hooks and the system
    /// clock.
    pub fn init(store: Box<dyn ChainStore>, options: Options) -> Result<Self, ProcessorError> {
        Self::init_with(
            store,
            options,
            Arc::new(NullEvents),
            Box::new(|| {
                SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs()
            }),
        )
    }

    /// Open the processor with explicit event hooks and clock.
    ///
    /// Verifies the stored configuration checksum, optionally resets the
    /// cursor, rebuilds the accumulators from stored history, and runs the
    /// reorg engine once inside a transaction.
    pub fn init_with(
        mut store: Box<dyn ChainStore>,
        options: Options,
        events: Arc<dyn ProcessorEvents>,
        clock: Box<dyn Fn() -> u64>,
    ) -> Result<Self, ProcessorError> {
        let compiled = rules::config_checksum();
        match store.param_get(ParamId::CfgChecksum) {
            None => store.param_set(ParamId::CfgChecksum, Some(compiled.as_bytes().to_vec())),
            Some(bytes) => {
                let stored = <[u8; 32]>::try_from(bytes.as_slice())
                    .map(Hash256::from_bytes)
                    .unwrap_or(Hash256::ZERO);
                if stored != compiled {
                    return Err(ProcessorError::ConfigMismatch { stored, compiled });
                }
            }
        }

        if options.reset_cursor {
            store.reset_cursor()?;
        }

        let schwarzschild = options
            .horizon_schwarzschild
            .max(options.horizon_branching)
            .max(rules::MAX_ROLLBACK_HEIGHT);

        let mut processor = Self {
            store,
            utxos: UtxoTree::new(),
            kernels: KernelSet::new(),
            cursor: Cursor::default(),
            extra: Extra {
                subsidy: 0,
                offset: Scalar::ZERO,
                subsidy_open: true,
            },
            horizon: Horizon {
                branching: options.horizon_branching,
                schwarzschild,
            },
            events,
            clock,
            size_fees_output: None,
        };

        processor.init_cursor()?;
        processor.initialize_from_blocks()?;

        if !options.reset_cursor {
            processor.with_tx(|p| p.try_go_up())?;
        }

        Ok(processor)
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    /// Id of the active tip; zero hash at height 0 on an empty chain.
    pub fn cursor_id(&self) -> HeaderId {
        self.cursor.id
    }

    /// Header of the active tip.
    pub fn cursor_header(&self) -> BlockHeader {
        self.cursor.full
    }

    /// Difficulty required of the next block.
    pub fn next_block_difficulty(&self) -> Difficulty {
        self.cursor.difficulty_next
    }

    /// Lowest height at which rollback is still permitted.
    pub fn lo_horizon(&self) -> Height {
        self.cursor.lo_horizon
    }

    pub fn utxo_root(&mut self) -> Hash256 {
        self.utxos.root()
    }

    pub fn kernel_root(&mut self) -> Hash256 {
        self.kernels.root()
    }

    /// Total subsidy emitted along the active chain.
    pub fn subsidy_total(&self) -> u128 {
        self.extra.subsidy
    }

    /// Whether coinbase emission is still open.
    pub fn subsidy_open(&self) -> bool {
        self.extra.subsidy_open
    }

    /// Aggregate blinding offset of the active chain.
    pub fn total_offset(&self) -> Scalar {
        self.extra.offset
    }

    /// Read access to the underlying store.
    pub fn store(&self) -> &dyn ChainStore {
        self.store.as_ref()
    }

    /// Tear down the processor, handing the store back (e.g. to reopen it
    /// with a fresh processor).
    pub fn into_store(self) -> Box<dyn ChainStore> {
        self.store
    }

    /// Definition hash of the current state, as the next block would have
    /// to commit to it (`for_next`), or as the cursor header committed to
    /// it.
    pub fn current_definition(&mut self, for_next: bool) -> Hash256 {
        let hist = if for_next {
            self.cursor.history_next
        } else {
            self.cursor.history
        };
        let live = live_hash(self.utxos.root(), self.kernels.root());
        definition_hash(live, hist)
    }

    // ------------------------------------------------------------------
    // Transaction discipline
    // ------------------------------------------------------------------

    pub(crate) fn with_tx<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T, ProcessorError>,
    ) -> Result<T, ProcessorError> {
        self.store.tx_begin()?;
        match f(self) {
            Ok(v) => {
                self.store.tx_commit()?;
                Ok(v)
            }
            Err(e) => {
                let _ = self.store.tx_rollback();
                Err(e)
            }
        }
    }

    // ------------------------------------------------------------------
    // Cursor
    // ------------------------------------------------------------------

    pub(crate) fn init_cursor(&mut self) -> Result<(), ProcessorError> {
        match self.store.get_cursor() {
            Some(sid) => {
                let full = self.store.get_state(sid.row)?;
                let history_next = self.store.predicted_history_root(sid)?;
                let history = match self.store.get_prev(sid.row) {
                    Some(prev) => self.store.predicted_history_root(prev)?,
                    None => Hash256::ZERO,
                };
                self.cursor = Cursor {
                    sid,
                    full,
                    id: full.id(),
                    history,
                    history_next,
                    lo_horizon: self.store.param_get_u64(ParamId::LoHorizon, 0),
                    difficulty_next: Difficulty::default(),
                };
            }
            None => self.cursor = Cursor::default(),
        }
        self.cursor.difficulty_next = self.next_difficulty()?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Startup rebuild
    // ------------------------------------------------------------------

    /// Rebuild the accumulators by replaying stored history: at most one
    /// macroblock plus the tail of individual blocks up to the cursor.
    fn initialize_from_blocks(&mut self) -> Result<(), ProcessorError> {
        let mut entries: Vec<(BlockBody, Height, Option<Height>)> = Vec::new();
        self.enum_blocks(&mut |block, _row, h, h_max| {
            entries.push((block.clone(), h, h_max));
            true
        })?;

        for (mut block, h, h_max) in entries {
            if !self.handle_validated_block(&mut block, h, true, h_max.is_none(), h_max)? {
                return Err(ProcessorError::Corrupted("stored block failed to reapply"));
            }
        }

        if self.cursor.id.height >= rules::GENESIS_HEIGHT {
            let def = self.current_definition(false);
            if self.cursor.full.definition != def {
                return Err(ProcessorError::Corrupted(
                    "definition mismatch after state rebuild",
                ));
            }
        }
        Ok(())
    }

    /// Walk the stored active history bottom-up: a selected macroblock (if
    /// any) first, then each individual block.
    ///
    /// The walker receives the body, the row (`None` for the macroblock),
    /// the block height (the starting height for a macroblock), and the
    /// macroblock's top height. Returns `false` iff the walker stopped
    /// early.
    pub fn enum_blocks(
        &self,
        walker: &mut dyn FnMut(&BlockBody, Option<u64>, Height, Option<Height>) -> bool,
    ) -> Result<bool, ProcessorError> {
        if self.cursor.id.height < rules::GENESIS_HEIGHT {
            return Ok(true);
        }

        let mut covered: Height = 0;
        for (top, bytes) in self.store.enum_macroblocks() {
            if top > self.cursor.id.height {
                continue;
            }
            let mb = Macroblock::decode(&bytes)
                .map_err(|_| ProcessorError::Corrupted("stored macroblock undecodable"))?;
            if !walker(&mb.body, None, rules::GENESIS_HEIGHT, Some(top)) {
                return Ok(false);
            }
            covered = top;
            break;
        }

        let count = self.cursor.id.height - covered;
        if count == 0 {
            return Ok(true);
        }
        let mut rows = Vec::with_capacity(count as usize);
        let mut row = self.find_active_at_strict(self.cursor.id.height)?;
        rows.push(row);
        for _ in 1..count {
            row = self
                .store
                .get_prev(row)
                .ok_or(ProcessorError::Corrupted("active chain broken"))?
                .row;
            rows.push(row);
        }

        let mut h = covered;
        for row in rows.into_iter().rev() {
            let (bytes, _) = self.store.get_state_block(row)?;
            let bytes = bytes.ok_or(ProcessorError::Corrupted("missing body below cursor"))?;
            let block = BlockBody::decode(&bytes)
                .map_err(|_| ProcessorError::Corrupted("stored body undecodable"))?;
            h += 1;
            if !walker(&block, Some(row), h, None) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Rollback journal
    // ------------------------------------------------------------------

    /// Encode the per-input maturities. A single zero byte marks an
    /// applied block with no inputs.
    pub(crate) fn journal_encode(inputs: &[Input]) -> Vec<u8> {
        if inputs.is_empty() {
            return vec![0];
        }
        let mut buf = Vec::with_capacity(inputs.len() * 8);
        for input in inputs {
            buf.extend_from_slice(&input.maturity.to_le_bytes());
        }
        buf
    }

    /// Copy journalled maturities back onto decoded inputs.
    pub(crate) fn journal_restore(
        journal: &[u8],
        inputs: &mut [Input],
    ) -> Result<(), ProcessorError> {
        if inputs.is_empty() {
            return Ok(());
        }
        if journal.len() != inputs.len() * 8 {
            return Err(ProcessorError::Corrupted("rollback journal size"));
        }
        for (i, input) in inputs.iter_mut().enumerate() {
            input.maturity = u64::from_le_bytes(
                journal[i * 8..(i + 1) * 8]
                    .try_into()
                    .expect("length checked"),
            );
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Block interpreter
    // ------------------------------------------------------------------

    /// Interpret the stored block at `sid` in the given direction.
    ///
    /// Forward with an empty journal is a first-time apply: the header is
    /// checked against cumulative state, the body verified context-free,
    /// and on success the journal written and the header's definition
    /// matched. Forward with a journal is a replay. Reverse restores the
    /// journalled maturities and unapplies.
    pub(crate) fn handle_block(
        &mut self,
        sid: StateId,
        fwd: bool,
    ) -> Result<bool, ProcessorError> {
        let (body_bytes, journal) = self.store.get_state_block(sid.row)?;
        let s = self.store.get_state(sid.row)?;
        let id = s.id();

        let mut block = match body_bytes.as_deref().map(BlockBody::decode) {
            Some(Ok(block)) => block,
            _ => {
                warn!(%id, "block deserialization failed");
                return Ok(false);
            }
        };
        let journal = journal.unwrap_or_default();

        let mut first_time = false;

        if fwd {
            if journal.is_empty() {
                first_time = true;

                let wrk = s.pow.difficulty.inc(self.cursor.full.chainwork);
                if wrk != s.chainwork {
                    warn!(%id, expected = %wrk, actual = %s.chainwork, "chainwork mismatch");
                    return Ok(false);
                }

                if self.cursor.difficulty_next != s.pow.difficulty {
                    warn!(
                        %id,
                        expected = %self.cursor.difficulty_next,
                        actual = %s.pow.difficulty,
                        "difficulty mismatch"
                    );
                    return Ok(false);
                }

                if s.timestamp <= self.moving_median()? {
                    warn!(%id, "timestamp inconsistent wrt median");
                    return Ok(false);
                }

                if !body::verify_body(
                    &block,
                    &HeightRange::single(sid.height),
                    self.extra.subsidy_open,
                ) {
                    warn!(%id, "context-free verification failed");
                    return Ok(false);
                }
            }
        } else {
            if journal.is_empty() {
                return Err(ProcessorError::Corrupted(
                    "unapplying a block that was never applied",
                ));
            }
            Self::journal_restore(&journal, &mut block.inputs)?;
        }

        let mut ok = self.handle_validated_block(&mut block, sid.height, fwd, fwd, None)?;
        if !ok {
            warn!(%id, "invalid in its context");
        }

        if first_time && ok {
            // Check the validity of the state description.
            let def = self.current_definition(true);
            if s.definition != def {
                warn!(%id, "header definition mismatch");
                ok = false;
            }

            if ok {
                self.store
                    .set_state_rollback(sid.row, Self::journal_encode(&block.inputs))?;

                debug_assert!(self.cursor.lo_horizon <= self.cursor.sid.height);
                if self.cursor.sid.height - self.cursor.lo_horizon > rules::MAX_ROLLBACK_HEIGHT {
                    self.cursor.lo_horizon = self.cursor.sid.height - rules::MAX_ROLLBACK_HEIGHT;
                    self.store
                        .param_set_u64(ParamId::LoHorizon, self.cursor.lo_horizon);
                }
            } else if !self.handle_validated_block(&mut block, sid.height, false, false, None)? {
                return Err(ProcessorError::Corrupted(
                    "undo of rejected block failed",
                ));
            }
        }

        if ok {
            info!(%id, fwd, "block interpreted");
        }
        Ok(ok)
    }

    /// Apply or unapply a validated body, including subsidy and offset
    /// accounting and the subsidy-closing toggle.
    pub(crate) fn handle_validated_block(
        &mut self,
        block: &mut BlockBody,
        h: Height,
        fwd: bool,
        adjust_input_maturity: bool,
        h_max: Option<Height>,
    ) -> Result<bool, ProcessorError> {
        if block.subsidy_closing && self.extra.subsidy_open != fwd {
            return Ok(false); // invalid subsidy close flag
        }

        if !self.handle_tx_elements(
            &mut block.inputs,
            &block.outputs,
            &block.kernel_inputs,
            &block.kernel_outputs,
            h,
            fwd,
            adjust_input_maturity,
            h_max,
        )? {
            return Ok(false);
        }

        if block.subsidy_closing {
            self.toggle_subsidy_open()?;
        }

        if fwd {
            self.extra.subsidy = self
                .extra
                .subsidy
                .checked_add(block.subsidy as u128)
                .ok_or(ProcessorError::Corrupted("subsidy overflow"))?;
            self.extra.offset = self.extra.offset.add(&block.offset);
        } else {
            self.extra.subsidy = self
                .extra
                .subsidy
                .checked_sub(block.subsidy as u128)
                .ok_or(ProcessorError::Corrupted("subsidy underflow"))?;
            self.extra.offset = self.extra.offset.add(&block.offset.neg());
        }

        Ok(true)
    }

    /// Run the element handlers over a transaction's four element groups.
    ///
    /// On a forward partial failure, exactly the processed prefix is
    /// reverse-unapplied before `false` is returned. A failure while
    /// running in reverse means previously validated state cannot be
    /// unwound, which is fatal.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn handle_tx_elements(
        &mut self,
        inputs: &mut [Input],
        outputs: &[Output],
        kernel_inputs: &[TxKernel],
        kernel_outputs: &[TxKernel],
        h: Height,
        fwd: bool,
        adjust_input_maturity: bool,
        h_max: Option<Height>,
    ) -> Result<bool, ProcessorError> {
        let mut n_inp = 0;
        let mut n_out = 0;
        let mut n_krn_inp = 0;
        let mut n_krn_out = 0;

        let mut ok = true;
        for input in inputs.iter_mut() {
            if !self.handle_input(input, h, h_max, fwd, adjust_input_maturity)? {
                ok = false;
                break;
            }
            n_inp += 1;
        }
        if ok {
            for output in outputs {
                if !self.handle_output(output, h, h_max, fwd)? {
                    ok = false;
                    break;
                }
                n_out += 1;
            }
        }
        if ok {
            for krn in kernel_inputs {
                if !self.handle_kernel(krn, fwd, true)? {
                    ok = false;
                    break;
                }
                n_krn_inp += 1;
            }
        }
        if ok {
            for krn in kernel_outputs {
                if !self.handle_kernel(krn, fwd, false)? {
                    ok = false;
                    break;
                }
                n_krn_out += 1;
            }
        }

        if ok {
            return Ok(true);
        }

        if !fwd {
            return Err(ProcessorError::Corrupted("unapply failed"));
        }

        // Roll back exactly the processed prefix. Must succeed.
        for krn in &kernel_outputs[..n_krn_out] {
            if !self.handle_kernel(krn, false, false)? {
                return Err(ProcessorError::Corrupted("partial-apply rollback failed"));
            }
        }
        for krn in &kernel_inputs[..n_krn_inp] {
            if !self.handle_kernel(krn, false, true)? {
                return Err(ProcessorError::Corrupted("partial-apply rollback failed"));
            }
        }
        for output in &outputs[..n_out] {
            if !self.handle_output(output, h, h_max, false)? {
                return Err(ProcessorError::Corrupted("partial-apply rollback failed"));
            }
        }
        for input in inputs[..n_inp].iter_mut() {
            if !self.handle_input(input, h, h_max, false, false)? {
                return Err(ProcessorError::Corrupted("partial-apply rollback failed"));
            }
        }

        Ok(false)
    }

    /// Consume (forward) or restore (reverse) one input UTXO.
    ///
    /// With `adjust_input_maturity`, the smallest maturity not above the
    /// spend height is located by range traversal and recorded back into
    /// the input; otherwise the input must carry an explicit maturity,
    /// which is only legal under a macroblock height bound.
    pub(crate) fn handle_input(
        &mut self,
        v: &mut Input,
        h: Height,
        h_max: Option<Height>,
        fwd: bool,
        adjust_input_maturity: bool,
    ) -> Result<bool, ProcessorError> {
        if fwd {
            let key = if adjust_input_maturity {
                let min = UtxoKey::new(v.commitment, 0);
                let max = UtxoKey::new(v.commitment, h_max.unwrap_or(h));
                match self.utxos.first_in_range(&min, &max) {
                    Some((key, _)) => key,
                    None => return Ok(false),
                }
            } else {
                let Some(h_max) = h_max else {
                    return Ok(false); // explicit maturity allowed only in macroblocks
                };
                if v.maturity > h_max {
                    return Ok(false);
                }
                let key = UtxoKey::new(v.commitment, v.maturity);
                if self.utxos.get(&key).is_none() {
                    return Ok(false);
                }
                key
            };

            let remove = {
                let (count, created) = self.utxos.find_or_create(key);
                debug_assert!(!created && *count > 0); // zero counts are never stored
                *count -= 1;
                *count == 0
            };
            if remove {
                self.utxos.remove(&key);
            }

            if adjust_input_maturity {
                v.maturity = key.maturity;
            }
            Ok(true)
        } else {
            let key = UtxoKey::new(v.commitment, v.maturity);
            let (count, created) = self.utxos.find_or_create(key);
            if created {
                *count = 1;
            } else {
                *count = count
                    .checked_add(1)
                    .ok_or(ProcessorError::Corrupted("utxo count overflow on restore"))?;
            }
            Ok(true)
        }
    }

    /// Create (forward) or retract (reverse) one output UTXO at its
    /// consensus maturity.
    pub(crate) fn handle_output(
        &mut self,
        v: &Output,
        h: Height,
        h_max: Option<Height>,
        fwd: bool,
    ) -> Result<bool, ProcessorError> {
        let mut maturity = v.min_maturity(h);

        if v.maturity >= rules::GENESIS_HEIGHT {
            if h_max.is_none() {
                return Ok(false); // maturity forgery isn't allowed
            }
            if v.maturity < maturity {
                return Ok(false); // decrease not allowed
            }
            maturity = v.maturity;
        }

        let key = UtxoKey::new(v.commitment, maturity);

        if fwd {
            let (count, created) = self.utxos.find_or_create(key);
            if created {
                *count = 1;
                Ok(true)
            } else {
                match count.checked_add(1) {
                    Some(next) => {
                        *count = next;
                        Ok(true)
                    }
                    // Multiplicity is bounded at 32 bits.
                    None => Ok(false),
                }
            }
        } else {
            match self.utxos.get(&key) {
                None => Ok(false),
                Some(1) => {
                    self.utxos.remove(&key);
                    Ok(true)
                }
                Some(_) => {
                    let (count, _) = self.utxos.find_or_create(key);
                    *count -= 1;
                    Ok(true)
                }
            }
        }
    }

    /// Insert or delete one kernel. Kernels are strictly unique over the
    /// live set: a duplicate insert or a missing delete fails.
    pub(crate) fn handle_kernel(
        &mut self,
        v: &TxKernel,
        fwd: bool,
        is_input: bool,
    ) -> Result<bool, ProcessorError> {
        let add = fwd != is_input;
        let id = v.id();
        if add {
            Ok(self.kernels.insert(id))
        } else {
            Ok(self.kernels.remove(&id))
        }
    }

    /// Flip the subsidy-open flag by toggling the zero-hash sentinel in the
    /// kernel set. The sentinel is the source of truth; the in-memory flag
    /// is a cache and must agree.
    pub(crate) fn toggle_subsidy_open(&mut self) -> Result<(), ProcessorError> {
        let created = self.kernels.insert(Hash256::ZERO);
        if created != self.extra.subsidy_open {
            return Err(ProcessorError::Corrupted("subsidy sentinel out of sync"));
        }
        if !created {
            self.kernels.remove(&Hash256::ZERO);
        }
        self.extra.subsidy_open = !created;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Reorg engine
    // ------------------------------------------------------------------

    /// Advance the cursor one state onto `row`.
    ///
    /// On interpreter failure the body is dropped, the state marked
    /// non-functional and the delivering peer reported insane; the tip
    /// graph changes so the caller picks a different target next round.
    pub(crate) fn go_forward(&mut self, row: u64) -> Result<bool, ProcessorError> {
        let sid = StateId {
            row,
            height: self.cursor.sid.height + 1,
        };

        if self.handle_block(sid, true)? {
            self.store.move_fwd(sid)?;
            self.init_cursor()?;
            return Ok(true);
        }

        self.store.del_state_block(row)?;
        self.store.set_state_not_functional(row)?;

        if let Some(peer) = self.store.get_peer(row) {
            self.store.set_peer(row, None)?;
            self.events.on_peer_insane(peer);
        }

        Ok(false)
    }

    /// Retreat the cursor one state, unapplying the tip block. An unapply
    /// failure means the persisted state is corrupt.
    pub(crate) fn rollback(&mut self) -> Result<(), ProcessorError> {
        let sid = self.cursor.sid;
        self.store.move_back()?;
        self.init_cursor()?;

        if !self.handle_block(sid, false)? {
            return Err(ProcessorError::Corrupted("unapply failed"));
        }

        self.init_cursor()?;
        self.events.on_rolled_back();
        Ok(())
    }

    /// Move the cursor to the functional tip with the greatest chainwork,
    /// rolling back to the common ancestor and replaying forward as
    /// needed. Runs pruning and fires `on_new_state` when anything moved.
    pub fn try_go_up(&mut self) -> Result<(), ProcessorError> {
        let mut dirty = false;

        loop {
            let Some(&tip) = self.store.enum_functional_tips().first() else {
                debug_assert_eq!(self.cursor.sid.row, 0);
                break; // nowhere to go
            };
            let mut sid_trg = tip;
            let mut wrk_trg = self.store.get_chainwork(tip.row)?;

            debug_assert!(wrk_trg >= self.cursor.full.chainwork);
            if wrk_trg == self.cursor.full.chainwork {
                break; // already at maximum (though maybe at a different tip)
            }

            // Calculate the path.
            let mut path: Vec<u64> = Vec::new();
            while sid_trg.row != self.cursor.sid.row {
                if self.cursor.full.chainwork > wrk_trg {
                    self.rollback()?;
                    dirty = true;
                } else {
                    debug_assert_ne!(sid_trg.row, 0);
                    path.push(sid_trg.row);

                    match self.store.get_prev(sid_trg.row) {
                        Some(prev) => {
                            sid_trg = prev;
                            wrk_trg = self.store.get_chainwork(prev.row)?;
                        }
                        None => {
                            sid_trg = StateId::default();
                            wrk_trg = ChainWork::ZERO;
                        }
                    }
                }
            }

            let mut path_ok = true;
            for row in path.into_iter().rev() {
                dirty = true;
                if !self.go_forward(row)? {
                    path_ok = false;
                    break;
                }
            }

            if path_ok {
                break; // at position
            }
        }

        if dirty {
            self.prune_old()?;
            self.events.on_new_state();
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Pruning
    // ------------------------------------------------------------------

    /// Drop competing tips beyond the branching horizon and fossilize
    /// bodies beyond the schwarzschild horizon.
    pub(crate) fn prune_old(&mut self) -> Result<(), ProcessorError> {
        if self.cursor.sid.height
            > self
                .horizon
                .branching
                .saturating_add(rules::GENESIS_HEIGHT - 1)
        {
            let h = self.cursor.sid.height - self.horizon.branching;

            loop {
                let Some(&tip) = self.store.enum_tips().first() else {
                    break;
                };
                if tip.height >= h {
                    break;
                }

                let mut row = tip.row;
                loop {
                    match self.store.delete_state(row)? {
                        Deleted::Kept => break,
                        Deleted::Removed(Some(prev)) => row = prev,
                        Deleted::Removed(None) => break,
                    }
                }
            }
        }

        if self.cursor.sid.height
            > self
                .horizon
                .schwarzschild
                .saturating_add(rules::GENESIS_HEIGHT - 1)
        {
            let mut h = self.cursor.sid.height - self.horizon.schwarzschild;
            if h > self.cursor.lo_horizon {
                h = self.cursor.lo_horizon;
            }

            let mut fossil = self
                .store
                .param_get_u64(ParamId::FossilHeight, rules::GENESIS_HEIGHT - 1);
            loop {
                fossil += 1;
                if fossil >= h {
                    break;
                }
                self.prune_at(fossil, true)?;
                self.store.param_set_u64(ParamId::FossilHeight, fossil);
            }
        }

        Ok(())
    }

    /// Demote non-active states at `h` and optionally drop every body
    /// there, the active one included.
    pub(crate) fn prune_at(&mut self, h: Height, delete_body: bool) -> Result<(), ProcessorError> {
        for row in self.store.enum_states_at(h) {
            if self.store.get_flags(row) & FLAG_ACTIVE == 0 {
                self.store.set_state_not_functional(row)?;
            }
            if delete_body {
                self.store.del_state_block(row)?;
                self.store.set_peer(row, None)?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Ingress
    // ------------------------------------------------------------------

    pub(crate) fn on_state_internal(&mut self, s: &BlockHeader) -> (DataStatus, HeaderId) {
        let id = s.id();

        if !s.is_sane() {
            warn!(%id, "header insane");
            return (DataStatus::Invalid, id);
        }

        if !s.verify_pow() {
            warn!(%id, "PoW invalid");
            return (DataStatus::Invalid, id);
        }

        let now = (self.clock)();
        if s.timestamp > now {
            let dt = s.timestamp - now;
            if dt > rules::TIMESTAMP_AHEAD_SECS {
                warn!(%id, ahead_secs = dt, "timestamp ahead");
                return (DataStatus::Invalid, id);
            }
        }

        if !self.events.approve_state(id) {
            warn!(%id, "state not approved");
            return (DataStatus::Invalid, id);
        }

        if s.height < self.cursor.lo_horizon {
            return (DataStatus::Unreachable, id);
        }

        if self.store.state_find(&id).is_some() {
            return (DataStatus::Rejected, id);
        }

        (DataStatus::Accepted, id)
    }

    /// Admit a header delivered by a peer.
    pub fn on_state(
        &mut self,
        s: &BlockHeader,
        peer: PeerId,
    ) -> Result<DataStatus, ProcessorError> {
        let (status, id) = self.on_state_internal(s);
        if status == DataStatus::Accepted {
            self.with_tx(|p| {
                let row = p.store.insert_state(s)?;
                p.store.set_peer(row, Some(peer))?;
                Ok(())
            })?;
            info!(%id, "header accepted");
        }
        self.events.on_state_data();
        Ok(status)
    }

    /// Admit a block body delivered by a peer. Stores the body, marks the
    /// state functional, and reorgs if the state is reachable — all under
    /// one transaction.
    pub fn on_block(
        &mut self,
        id: &HeaderId,
        block: &[u8],
        peer: PeerId,
    ) -> Result<DataStatus, ProcessorError> {
        self.events.on_block_data();

        if block.len() > rules::MAX_BODY_SIZE {
            warn!(%id, size = block.len(), "block too large");
            return Ok(DataStatus::Invalid);
        }

        let Some(row) = self.store.state_find(id) else {
            warn!(%id, "block unexpected");
            return Ok(DataStatus::Rejected);
        };

        if self.store.get_flags(row) & FLAG_FUNCTIONAL != 0 {
            warn!(%id, "block already received");
            return Ok(DataStatus::Rejected);
        }

        if id.height < self.cursor.lo_horizon {
            return Ok(DataStatus::Unreachable);
        }

        info!(%id, "block received");

        self.with_tx(|p| {
            p.store.set_state_block(row, block.to_vec())?;
            p.store.set_state_functional(row)?;
            p.store.set_peer(row, Some(peer))?;

            if p.store.get_flags(row) & FLAG_REACHABLE != 0 {
                p.try_go_up()?;
            }
            Ok(())
        })?;

        Ok(DataStatus::Accepted)
    }

    /// Request all potentially missing data: for each non-reachable tip at
    /// or above the cursor's work, walk back to the reachable boundary and
    /// ask for the missing header or body there.
    pub fn enum_congestions(&mut self) -> Result<(), ProcessorError> {
        for tip in self.store.enum_tips() {
            if self.store.get_flags(tip.row) & FLAG_REACHABLE != 0 {
                continue;
            }

            let wrk = self.store.get_chainwork(tip.row)?;
            if wrk < self.cursor.full.chainwork {
                continue; // not interested in tips behind the current cursor
            }

            let mut wants_body = true;
            let mut sid = tip;
            while sid.height > rules::GENESIS_HEIGHT {
                let sid_this = sid;
                match self.store.get_prev(sid.row) {
                    None => {
                        wants_body = false;
                        break;
                    }
                    Some(prev) => {
                        if self.store.get_flags(prev.row) & FLAG_REACHABLE != 0 {
                            sid = sid_this;
                            break;
                        }
                        sid = prev;
                    }
                }
            }

            let id = if wants_body {
                HeaderId {
                    height: sid.height,
                    hash: self.store.get_state_hash(sid.row)?,
                }
            } else {
                let s = self.store.get_state(sid.row)?;
                HeaderId {
                    height: s.height - 1,
                    hash: s.prev,
                }
            };

            if id.height >= self.cursor.lo_horizon {
                let peer = self.store.get_peer(sid.row);
                self.events.request_data(id, wants_body, peer);
            } else {
                warn!(%id, "state unreachable");
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Consensus queries
    // ------------------------------------------------------------------

    /// Row of the active state at `h`. The active path must cover `h`.
    pub(crate) fn find_active_at_strict(&self, h: Height) -> Result<u64, ProcessorError> {
        self.store
            .enum_states_at(h)
            .into_iter()
            .find(|row| self.store.get_flags(*row) & FLAG_ACTIVE != 0)
            .ok_or(ProcessorError::Corrupted("no active state at height"))
    }

    /// Difficulty the next block must carry: reviewed once per cycle by
    /// comparing the cycle's elapsed time against the target.
    pub(crate) fn next_difficulty(&self) -> Result<Difficulty, ProcessorError> {
        if self.cursor.sid.row == 0 {
            return Ok(rules::START_DIFFICULTY);
        }

        let dh = self.cursor.full.height - rules::GENESIS_HEIGHT;
        if dh == 0 || dh % rules::DIFFICULTY_REVIEW_CYCLE != 0 {
            return Ok(self.cursor.full.pow.difficulty); // no change
        }

        let row = self.find_active_at_strict(self.cursor.full.height - rules::DIFFICULTY_REVIEW_CYCLE)?;
        let s2 = self.store.get_state(row)?;

        Ok(adjust_difficulty(
            self.cursor.full.pow.difficulty,
            s2.timestamp,
            self.cursor.full.timestamp,
        ))
    }

    /// Upper median over the timestamps of the most recent active headers,
    /// at most [`MEDIAN_WINDOW`](rules::MEDIAN_WINDOW) of them. A block's
    /// timestamp must exceed this.
    pub(crate) fn moving_median(&self) -> Result<u64, ProcessorError> {
        if self.cursor.sid.row == 0 {
            return Ok(0);
        }

        let mut timestamps = Vec::with_capacity(rules::MEDIAN_WINDOW);
        let mut row = self.cursor.sid.row;
        loop {
            timestamps.push(self.store.get_state(row)?.timestamp);
            if timestamps.len() >= rules::MEDIAN_WINDOW {
                break;
            }
            match self.store.get_prev(row) {
                Some(prev) => row = prev.row,
                None => break,
            }
        }

        // A sort is plenty at this window size.
        timestamps.sort_unstable();
        Ok(timestamps[timestamps.len() >> 1])
    }

    /// Whether every output kernel of `tx` is valid at height `h`.
    pub(crate) fn validate_tx_wrt_height(tx: &Transaction, h: Height) -> bool {
        tx.kernel_outputs
            .iter()
            .all(|k| k.height_range.contains(h))
    }

    fn validate_tx_context_kernels(&self, kernels: &[TxKernel]) -> bool {
        let mut prev_id = Hash256::ZERO; // forbidden value for kernel ids
        for krn in kernels {
            let id = krn.id();
            if id == prev_id {
                return false; // consecutive kernels with the same id
            }
            // Transaction kernels must all be novel wrt the live set.
            if self.kernels.contains(&id) {
                return false;
            }
            prev_id = id;
        }
        true
    }

    /// Cheap contextual check of a transaction against the next height:
    /// every input commitment must be spendable (with multiplicity) and
    /// every kernel — consumed or produced — absent from the live set.
    /// Does not mutate anything.
    pub fn validate_tx_context(&self, tx: &Transaction) -> bool {
        let h = self.cursor.sid.height + 1;
        if !Self::validate_tx_wrt_height(tx, h) {
            return false;
        }

        // Inputs are sorted, so equal commitments sit adjacent.
        let mut i = 0;
        while i < tx.inputs.len() {
            let commitment = tx.inputs[i].commitment;
            let mut needed: u64 = 1;
            while i + 1 < tx.inputs.len() && tx.inputs[i + 1].commitment == commitment {
                i += 1;
                needed += 1;
            }

            let min = UtxoKey::new(commitment, 0);
            let max = UtxoKey::new(commitment, h);
            let mut remaining = needed;
            let exhausted = self.utxos.traverse(&min, &max, |_, count| {
                if remaining <= count as u64 {
                    return false; // satisfied
                }
                remaining -= count as u64;
                true
            });
            if exhausted {
                return false; // some input UTXOs are missing
            }
            i += 1;
        }

        self.validate_tx_context_kernels(&tx.kernel_outputs)
            && self.validate_tx_context_kernels(&tx.kernel_inputs)
    }

    // ------------------------------------------------------------------
    // Extraction
    // ------------------------------------------------------------------

    /// Decode the stored block at `sid` with its runtime extras restored:
    /// journalled input maturities and computed output maturities.
    pub fn extract_block_with_extra(&self, sid: StateId) -> Result<BlockBody, ProcessorError> {
        let (bytes, journal) = self.store.get_state_block(sid.row)?;
        let bytes = bytes.ok_or(ProcessorError::Corrupted("missing body for extraction"))?;
        let mut block = BlockBody::decode(&bytes)
            .map_err(|_| ProcessorError::Corrupted("stored body undecodable"))?;
        let journal = journal.ok_or(ProcessorError::Corrupted("missing journal for extraction"))?;
        Self::journal_restore(&journal, &mut block.inputs)?;

        for output in &mut block.outputs {
            output.maturity = output.min_maturity(sid.height);
        }
        Ok(block)
    }
}

/// Observer over the input/output stream of stored history.
pub trait UtxoWalker {
    fn on_input(&mut self, height: Height, input: &Input) -> bool;
    fn on_output(&mut self, height: Height, output: &Output) -> bool;
}

impl Processor {
    /// Fold a walker over every input and output along the stored active
    /// history. Returns `false` iff the walker stopped early.
    pub fn walk_utxos(&self, walker: &mut dyn UtxoWalker) -> Result<bool, ProcessorError> {
        self.enum_blocks(&mut |block, _row, h, h_max| {
            let height = h_max.unwrap_or(h);
            for input in &block.inputs {
                if !walker.on_input(height, input) {
                    return false;
                }
            }
            for output in &block.outputs {
                if !walker.on_output(height, output) {
                    return false;
                }
            }
            true
        })
    }
}

/// A [`UtxoWalker`] that folds the stream into a commitment → multiplicity
/// map, reproducing the set of currently unspent outputs.
#[derive(Debug, Default)]
pub struct UtxoCollector {
    pub live: std::collections::BTreeMap<quill_core::types::Commitment, u32>,
}

impl UtxoWalker for UtxoCollector {
    fn on_input(&mut self, _height: Height, input: &Input) -> bool {
        if let Some(count) = self.live.get_mut(&input.commitment) {
            if *count > 1 {
                *count -= 1;
            } else {
                self.live.remove(&input.commitment);
            }
        }
        true
    }

    fn on_output(&mut self, _height: Height, output: &Output) -> bool {
        *self.live.entry(output.commitment).or_insert(0) += 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use quill_core::types::Commitment;

    fn empty_processor() -> Processor {
        Processor::init_with(
            Box::new(MemoryStore::new()),
            Options::default(),
            Arc::new(NullEvents),
            Box::new(|| 1_700_000_000),
        )
        .unwrap()
    }

    fn c(seed: u8) -> Commitment {
        Commitment([seed; 33])
    }

    fn kernel(seed: u8) -> TxKernel {
        TxKernel {
            excess: c(seed),
            fee: 0,
            height_range: HeightRange::new(rules::GENESIS_HEIGHT, u64::MAX),
        }
    }

    // ------------------------------------------------------------------
    // Startup
    // ------------------------------------------------------------------

    #[test]
    fn empty_store_initializes_clean() {
        let mut p = empty_processor();
        assert_eq!(p.cursor_id().height, 0);
        assert_eq!(p.utxo_root(), Hash256::ZERO);
        assert_eq!(p.kernel_root(), Hash256::ZERO);
        assert!(p.subsidy_open());
        assert_eq!(p.subsidy_total(), 0);
        assert_eq!(p.next_block_difficulty(), rules::START_DIFFICULTY);
    }

    #[test]
    fn init_writes_config_checksum() {
        let p = empty_processor();
        assert_eq!(
            p.store().param_get(ParamId::CfgChecksum),
            Some(rules::config_checksum().as_bytes().to_vec())
        );
    }

    #[test]
    fn init_rejects_foreign_checksum() {
        let mut store = MemoryStore::new();
        store.param_set(ParamId::CfgChecksum, Some(vec![0xEE; 32]));
        let err = Processor::init(Box::new(store), Options::default()).unwrap_err();
        assert!(matches!(err, ProcessorError::ConfigMismatch { .. }));
    }

    // ------------------------------------------------------------------
    // Journal
    // ------------------------------------------------------------------

    #[test]
    fn journal_empty_inputs_sentinel() {
        assert_eq!(Processor::journal_encode(&[]), vec![0]);
    }

    #[test]
    fn journal_round_trip() {
        let inputs = [
            Input {
                commitment: c(1),
                maturity: 42,
            },
            Input {
                commitment: c(2),
                maturity: 7,
            },
        ];
        let journal = Processor::journal_encode(&inputs);
        assert_eq!(journal.len(), 16);

        let mut blank = [
            Input {
                commitment: c(1),
                maturity: 0,
            },
            Input {
                commitment: c(2),
                maturity: 0,
            },
        ];
        Processor::journal_restore(&journal, &mut blank).unwrap();
        assert_eq!(blank[0].maturity, 42);
        assert_eq!(blank[1].maturity, 7);
    }

    #[test]
    fn journal_wrong_size_is_corruption() {
        let mut inputs = [Input {
            commitment: c(1),
            maturity: 0,
        }];
        let err = Processor::journal_restore(&[0], &mut inputs).unwrap_err();
        assert!(matches!(err, ProcessorError::Corrupted(_)));
    }

    // ------------------------------------------------------------------
    // Element handlers
    // ------------------------------------------------------------------

    #[test]
    fn output_then_input_round_trip() {
        let mut p = empty_processor();
        let out = Output {
            commitment: c(1),
            coinbase: false,
            maturity: 0,
        };
        assert!(p.handle_output(&out, 5, None, true).unwrap());

        let mut input = Input {
            commitment: c(1),
            maturity: 0,
        };
        // Not yet spendable below its maturity; MATURITY_STD is 0 so it is
        // spendable at its creation height.
        assert!(p.handle_input(&mut input, 5, None, true, true).unwrap());
        assert_eq!(input.maturity, out.min_maturity(5));
        assert!(p.utxos.is_empty());
    }

    #[test]
    fn input_of_unknown_commitment_fails() {
        let mut p = empty_processor();
        let mut input = Input {
            commitment: c(9),
            maturity: 0,
        };
        assert!(!p.handle_input(&mut input, 5, None, true, true).unwrap());
    }

    #[test]
    fn coinbase_output_not_spendable_before_maturity() {
        let mut p = empty_processor();
        let out = Output {
            commitment: c(1),
            coinbase: true,
            maturity: 0,
        };
        p.handle_output(&out, 5, None, true).unwrap();

        let mut input = Input {
            commitment: c(1),
            maturity: 0,
        };
        let locked_until = out.min_maturity(5);
        assert!(!p
            .handle_input(&mut input, locked_until - 1, None, true, true)
            .unwrap());
        assert!(p
            .handle_input(&mut input, locked_until, None, true, true)
            .unwrap());
    }

    #[test]
    fn input_picks_smallest_maturity() {
        let mut p = empty_processor();
        *p.utxos.find_or_create(UtxoKey::new(c(1), 30)).0 = 1;
        *p.utxos.find_or_create(UtxoKey::new(c(1), 10)).0 = 1;

        let mut input = Input {
            commitment: c(1),
            maturity: 0,
        };
        assert!(p.handle_input(&mut input, 100, None, true, true).unwrap());
        assert_eq!(input.maturity, 10);
        assert_eq!(p.utxos.get(&UtxoKey::new(c(1), 30)), Some(1));
    }

    #[test]
    fn explicit_maturity_requires_macroblock_mode() {
        let mut p = empty_processor();
        let out = Output {
            commitment: c(1),
            coinbase: false,
            maturity: 50,
        };
        // Normal block apply: forgery.
        assert!(!p.handle_output(&out, 5, None, true).unwrap());
        // Macroblock mode: accepted as-is.
        assert!(p.handle_output(&out, 5, Some(100), true).unwrap());
        assert_eq!(p.utxos.get(&UtxoKey::new(c(1), 50)), Some(1));
    }

    #[test]
    fn explicit_maturity_must_not_decrease() {
        let mut p = empty_processor();
        let out = Output {
            commitment: c(1),
            coinbase: true,
            maturity: 3, // below h + MATURITY_COINBASE
        };
        assert!(!p.handle_output(&out, 5, Some(100), true).unwrap());
    }

    #[test]
    fn explicit_input_maturity_checked_against_bound() {
        let mut p = empty_processor();
        *p.utxos.find_or_create(UtxoKey::new(c(1), 50)).0 = 1;
        let mut input = Input {
            commitment: c(1),
            maturity: 50,
        };
        // Outside macroblock mode: rejected.
        assert!(!p.handle_input(&mut input, 60, None, true, false).unwrap());
        // Maturity above the bound: rejected.
        assert!(!p
            .handle_input(&mut input, 60, Some(49), true, false)
            .unwrap());
        // Exact leaf within bound: spent.
        assert!(p
            .handle_input(&mut input, 60, Some(100), true, false)
            .unwrap());
        assert!(p.utxos.is_empty());
    }

    #[test]
    fn duplicate_kernel_insert_fails() {
        let mut p = empty_processor();
        let krn = kernel(1);
        assert!(p.handle_kernel(&krn, true, false).unwrap());
        assert!(!p.handle_kernel(&krn, true, false).unwrap());
    }

    #[test]
    fn kernel_input_consumes_live_kernel() {
        let mut p = empty_processor();
        let krn = kernel(1);
        p.handle_kernel(&krn, true, false).unwrap();
        // Forward input: delete.
        assert!(p.handle_kernel(&krn, true, true).unwrap());
        // Again: missing.
        assert!(!p.handle_kernel(&krn, true, true).unwrap());
    }

    #[test]
    fn partial_apply_unwinds_exactly() {
        let mut p = empty_processor();
        *p.utxos.find_or_create(UtxoKey::new(c(1), 0)).0 = 1;
        let utxo_root = p.utxo_root();
        let kernel_root = p.kernel_root();

        // Two inputs; the second is unknown, so the first must be restored.
        let mut inputs = [
            Input {
                commitment: c(1),
                maturity: 0,
            },
            Input {
                commitment: c(9),
                maturity: 0,
            },
        ];
        let outputs: [Output; 0] = [];
        let kernels = [kernel(5)];
        let ok = p
            .handle_tx_elements(&mut inputs, &outputs, &[], &kernels, 10, true, true, None)
            .unwrap();
        assert!(!ok);
        assert_eq!(p.utxo_root(), utxo_root);
        assert_eq!(p.kernel_root(), kernel_root);
    }

    #[test]
    fn partial_apply_with_kernel_conflict_restores_utxos() {
        let mut p = empty_processor();
        let krn = kernel(5);
        p.handle_kernel(&krn, true, false).unwrap();
        *p.utxos.find_or_create(UtxoKey::new(c(1), 0)).0 = 1;
        let utxo_root = p.utxo_root();
        let kernel_root = p.kernel_root();

        let mut inputs = [Input {
            commitment: c(1),
            maturity: 0,
        }];
        let outputs = [Output {
            commitment: c(2),
            coinbase: false,
            maturity: 0,
        }];
        // Same kernel again: the insert fails after inputs and outputs
        // were applied.
        let kernels = [krn];
        let ok = p
            .handle_tx_elements(&mut inputs, &outputs, &[], &kernels, 10, true, true, None)
            .unwrap();
        assert!(!ok);
        assert_eq!(p.utxo_root(), utxo_root);
        assert_eq!(p.kernel_root(), kernel_root);
    }

    // ------------------------------------------------------------------
    // Subsidy sentinel
    // ------------------------------------------------------------------

    #[test]
    fn subsidy_toggle_round_trip() {
        let mut p = empty_processor();
        assert!(p.subsidy_open());
        assert!(!p.kernels.contains(&Hash256::ZERO));

        p.toggle_subsidy_open().unwrap();
        assert!(!p.subsidy_open());
        assert!(p.kernels.contains(&Hash256::ZERO));

        p.toggle_subsidy_open().unwrap();
        assert!(p.subsidy_open());
        assert!(!p.kernels.contains(&Hash256::ZERO));
    }

    #[test]
    fn subsidy_sentinel_out_of_sync_is_corruption() {
        let mut p = empty_processor();
        // Simulate a desync: sentinel present while the flag says open.
        p.kernels.insert(Hash256::ZERO);
        assert!(matches!(
            p.toggle_subsidy_open().unwrap_err(),
            ProcessorError::Corrupted(_)
        ));
    }

    #[test]
    fn closing_flag_must_match_direction() {
        let mut p = empty_processor();
        let mut block = BlockBody {
            subsidy_closing: true,
            ..Default::default()
        };
        // Reverse while open: invalid.
        assert!(!p.handle_validated_block(&mut block, 1, false, false, None).unwrap());
        // Forward while open: closes.
        assert!(p.handle_validated_block(&mut block, 1, true, true, None).unwrap());
        assert!(!p.subsidy_open());
        // Forward again while closed: invalid.
        assert!(!p.handle_validated_block(&mut block, 2, true, true, None).unwrap());
    }

    #[test]
    fn subsidy_and_offset_accounting_reverses() {
        let mut p = empty_processor();
        let mut block = BlockBody {
            subsidy: rules::COINBASE_EMISSION,
            offset: Scalar([3; 32]),
            ..Default::default()
        };
        p.handle_validated_block(&mut block, 1, true, true, None)
            .unwrap();
        assert_eq!(p.subsidy_total(), rules::COINBASE_EMISSION as u128);
        assert_eq!(p.total_offset(), Scalar([3; 32]));

        p.handle_validated_block(&mut block, 1, false, false, None)
            .unwrap();
        assert_eq!(p.subsidy_total(), 0);
        assert_eq!(p.total_offset(), Scalar::ZERO);
    }

    // ------------------------------------------------------------------
    // Contextual tx validation
    // ------------------------------------------------------------------

    #[test]
    fn tx_context_requires_inputs_present() {
        let mut p = empty_processor();
        let mut tx = Transaction::default();
        tx.inputs.push(Input {
            commitment: c(1),
            maturity: 0,
        });
        tx.kernel_outputs.push(kernel(1));
        assert!(!p.validate_tx_context(&tx));

        *p.utxos.find_or_create(UtxoKey::new(c(1), 0)).0 = 1;
        assert!(p.validate_tx_context(&tx));
    }

    #[test]
    fn tx_context_counts_multiplicity() {
        let mut p = empty_processor();
        *p.utxos.find_or_create(UtxoKey::new(c(1), 0)).0 = 1;

        let mut tx = Transaction::default();
        tx.inputs.push(Input {
            commitment: c(1),
            maturity: 0,
        });
        tx.inputs.push(Input {
            commitment: c(1),
            maturity: 0,
        });
        tx.kernel_outputs.push(kernel(1));
        // Needs multiplicity 2, only 1 present.
        assert!(!p.validate_tx_context(&tx));

        *p.utxos.find_or_create(UtxoKey::new(c(1), 0)).0 = 2;
        assert!(p.validate_tx_context(&tx));
    }

    #[test]
    fn tx_context_rejects_live_kernels_in_either_group() {
        let mut p = empty_processor();
        let krn = kernel(1);
        p.kernels.insert(krn.id());

        let mut tx = Transaction::default();
        tx.kernel_outputs.push(krn);
        assert!(!p.validate_tx_context(&tx));

        // Even as a kernel *input*, a live kernel is rejected: transaction
        // kernels must all be novel.
        let mut tx = Transaction::default();
        tx.kernel_inputs.push(krn);
        assert!(!p.validate_tx_context(&tx));
    }

    #[test]
    fn tx_context_rejects_kernel_out_of_height_range() {
        let p = empty_processor();
        let mut tx = Transaction::default();
        let mut krn = kernel(1);
        krn.height_range = HeightRange::new(100, 200);
        tx.kernel_outputs.push(krn);
        assert!(!p.validate_tx_context(&tx));
    }

    #[test]
    fn tx_context_rejects_consecutive_duplicate_kernels() {
        let p = empty_processor();
        let mut tx = Transaction::default();
        tx.kernel_outputs.push(kernel(1));
        tx.kernel_outputs.push(kernel(1));
        assert!(!p.validate_tx_context(&tx));
    }

    // ------------------------------------------------------------------
    // Moving median
    // ------------------------------------------------------------------

    #[test]
    fn moving_median_empty_chain_is_zero() {
        let p = empty_processor();
        assert_eq!(p.moving_median().unwrap(), 0);
    }

    // ------------------------------------------------------------------
    // UtxoCollector
    // ------------------------------------------------------------------

    #[test]
    fn utxo_collector_folds_stream() {
        let mut collector = UtxoCollector::default();
        let out1 = Output {
            commitment: c(1),
            coinbase: false,
            maturity: 0,
        };
        let out2 = Output {
            commitment: c(2),
            coinbase: false,
            maturity: 0,
        };
        collector.on_output(1, &out1);
        collector.on_output(1, &out1);
        collector.on_output(2, &out2);
        collector.on_input(
            3,
            &Input {
                commitment: c(1),
                maturity: 0,
            },
        );
        assert_eq!(collector.live.get(&c(1)), Some(&1));
        assert_eq!(collector.live.get(&c(2)), Some(&1));

        collector.on_input(
            4,
            &Input {
                commitment: c(2),
                maturity: 0,
            },
        );
        assert!(!collector.live.contains_key(&c(2)));
    }
}
