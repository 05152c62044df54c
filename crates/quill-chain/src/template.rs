//! Candidate block assembly.
//!
//! Drains the mempool in profit order into a size-bounded body, evaluating
//! every candidate transaction against the live accumulators inside a
//! throwaway transaction that is fully undone before returning. The caller
//! gets a filled header, the serialized body, and the collected fees; the
//! processor state is left untouched.

use tracing::{info, warn};

use quill_core::body::{self, BlockBody};
use quill_core::error::ProcessorError;
use quill_core::kdf::KeyDerivation;
use quill_core::mempool::Mempool;
use quill_core::rules;
use quill_core::types::{BlockHeader, Hash256, HeightRange};

use crate::processor::Processor;

/// In/out context for [`Processor::generate_new_block`].
pub struct BlockContext<'a> {
    /// Pool to drain. Transactions that can never fit, or fail contextual
    /// validation, are permanently evicted.
    pub pool: &'a mut Mempool,
    /// Derives the miner-owned coinbase and fee elements.
    pub kdf: &'a dyn KeyDerivation,
    /// Filled on success: the candidate header, ready for nonce search.
    pub header: BlockHeader,
    /// Filled on success: the serialized, normalized body.
    pub body_bytes: Vec<u8>,
    /// Filled on success: total fees collected.
    pub fees: u64,
}

impl<'a> BlockContext<'a> {
    pub fn new(pool: &'a mut Mempool, kdf: &'a dyn KeyDerivation) -> Self {
        Self {
            pool,
            kdf,
            header: BlockHeader::default(),
            body_bytes: Vec::new(),
            fees: 0,
        }
    }
}

impl Processor {
    /// Assemble a candidate block from scratch.
    ///
    /// Insists on closing the subsidy by default; if the subsidy is
    /// already closed the flag is turned off automatically.
    pub fn generate_new_block(&mut self, bc: &mut BlockContext<'_>) -> Result<bool, ProcessorError> {
        let body = BlockBody {
            subsidy_closing: true,
            ..Default::default()
        };
        self.generate_new_block_from(bc, body, true)
    }

    /// Assemble a candidate block extending a pre-seeded body (e.g. one
    /// carrying treasury elements).
    pub fn generate_new_block_seeded(
        &mut self,
        bc: &mut BlockContext<'_>,
        seed: BlockBody,
    ) -> Result<bool, ProcessorError> {
        self.generate_new_block_from(bc, seed, false)
    }

    fn generate_new_block_from(
        &mut self,
        bc: &mut BlockContext<'_>,
        mut res: BlockBody,
        initially_empty: bool,
    ) -> Result<bool, ProcessorError> {
        let h = self.cursor.sid.height + 1;

        if !initially_empty
            && !body::verify_body(&res, &HeightRange::single(h), self.extra.subsidy_open)
        {
            return Ok(false);
        }

        // The whole template is evaluated inside a transaction that is
        // rolled back; the accumulators are restored by the explicit undo.
        self.store.tx_begin()?;
        let result = self.template_in_tx(bc, &mut res, h, initially_empty);
        let rollback = self.store.tx_rollback();
        let size_estimated = result?;
        rollback?;

        if size_estimated == 0 {
            return Ok(false);
        }

        // Discovered input maturities are interpreter-internal; the wire
        // carries them unset.
        for input in &mut res.inputs {
            input.maturity = 0;
        }
        res.normalize();

        bc.body_bytes = res.encode()?;
        // Cut-through and maturity reset only ever shrink the encoding.
        debug_assert!(bc.body_bytes.len() <= size_estimated);

        Ok(bc.body_bytes.len() <= rules::MAX_BODY_SIZE)
    }

    /// Apply the seed, build the candidate, then undo every accumulator
    /// mutation. `res` always holds exactly the successfully applied
    /// elements, which is what makes the final undo exact.
    fn template_in_tx(
        &mut self,
        bc: &mut BlockContext<'_>,
        res: &mut BlockBody,
        h: u64,
        initially_empty: bool,
    ) -> Result<usize, ProcessorError> {
        if !initially_empty
            && !self.handle_tx_elements(
                &mut res.inputs,
                &res.outputs,
                &res.kernel_inputs,
                &res.kernel_outputs,
                h,
                true,
                true,
                None,
            )?
        {
            // The failed seed apply has already unwound itself.
            return Ok(0);
        }

        let size = self.generate_core(bc, res, h)?;

        if !self.handle_tx_elements(
            &mut res.inputs,
            &res.outputs,
            &res.kernel_inputs,
            &res.kernel_outputs,
            h,
            false,
            false,
            None,
        )? {
            return Err(ProcessorError::Corrupted("template undo failed"));
        }

        Ok(size)
    }

    /// Build the candidate body up to the allowed size and fill the
    /// header. Returns 0 when nothing valid fits.
    fn generate_core(
        &mut self,
        bc: &mut BlockContext<'_>,
        res: &mut BlockBody,
        h: u64,
    ) -> Result<usize, ProcessorError> {
        res.subsidy = res.subsidy.saturating_add(rules::COINBASE_EMISSION);
        if !self.extra.subsidy_open {
            res.subsidy_closing = false;
        }

        let mut offset = res.offset;

        // Mandatory elements: coinbase UTXO and kernel.
        {
            let (outp, sk) = bc.kdf.coinbase_output(h);
            if !self.handle_output(&outp, h, None, true)? {
                return Ok(0);
            }
            res.outputs.push(outp);
            offset = offset.add(&sk.neg());

            let (krn, sk) = bc.kdf.coinbase_kernel(h);
            // Fails if the kernel key is duplicated.
            if !self.handle_kernel(&krn, true, false)? {
                return Ok(0);
            }
            res.kernel_outputs.push(krn);
            offset = offset.add(&sk.neg());
        }

        let size_max = rules::MAX_BODY_SIZE;
        let mut size = res.serialized_size()?;
        if size > size_max {
            // The seed may be non-empty (e.g. carry treasury).
            warn!("block too large");
            return Ok(0);
        }

        // Estimate the size of the fees output once.
        if self.size_fees_output.is_none() {
            let (sample, _) = bc.kdf.fees_output(h, 1);
            let encoded = bincode::encode_to_vec(sample, bincode::config::standard())
                .map_err(|_| ProcessorError::Corrupted("fees output sizing failed"))?;
            self.size_fees_output = Some(encoded.len());
        }
        let size_fees_output = self.size_fees_output.unwrap_or(0);

        bc.fees = 0;
        let mut n_tx = 0usize;

        for txid in bc.pool.profit_order() {
            let Some(entry) = bc.pool.get(&txid) else {
                continue;
            };
            let fee = entry.fee;
            let tx_size = entry.size;

            let Some(fees_next) = bc.fees.checked_add(fee) else {
                continue; // huge fees are unsupported
            };

            let mut size_next = size + tx_size;
            if bc.fees == 0 && fees_next != 0 {
                size_next += size_fees_output;
            }

            if size_next > size_max {
                if res.inputs.is_empty()
                    && res.kernel_inputs.is_empty()
                    && res.outputs.len() == 1
                    && res.kernel_outputs.len() == 1
                {
                    // Won't fit even in an empty block.
                    info!(%txid, "tx is too big");
                    bc.pool.remove(&txid);
                }
                continue;
            }

            let mut tx = entry.tx.clone();
            if Self::validate_tx_wrt_height(&tx, h)
                && self.handle_tx_elements(
                    &mut tx.inputs,
                    &tx.outputs,
                    &tx.kernel_inputs,
                    &tx.kernel_outputs,
                    h,
                    true,
                    true,
                    None,
                )?
            {
                res.merge_tx(&tx);
                bc.fees = fees_next;
                size = size_next;
                n_tx += 1;
            } else {
                bc.pool.remove(&txid); // isn't available in this context
            }
        }

        info!(size, txs = n_tx, "generate_new_block");

        if bc.fees > 0 {
            let (outp, sk) = bc.kdf.fees_output(h, bc.fees);
            if !self.handle_output(&outp, h, None, true)? {
                return Ok(0); // should not happen
            }
            res.outputs.push(outp);
            offset = offset.add(&sk.neg());
            size = res.serialized_size()?;
        }

        // Finalize header construction.
        bc.header = BlockHeader::default();
        bc.header.prev = if self.cursor.sid.row != 0 {
            self.cursor.id.hash
        } else {
            Hash256::ZERO
        };

        if res.subsidy_closing {
            self.toggle_subsidy_open()?;
        }
        bc.header.definition = self.current_definition(true);
        bc.header.kernel_commitment = self.kernels.root();
        if res.subsidy_closing {
            self.toggle_subsidy_open()?;
        }

        bc.header.height = h;
        bc.header.pow.difficulty = self.cursor.difficulty_next;
        bc.header.chainwork = bc.header.pow.difficulty.inc(self.cursor.full.chainwork);

        // No less than the moving median, or the block would be invalid.
        bc.header.timestamp = (self.clock)().max(self.moving_median()? + 1);

        res.offset = offset;

        Ok(size)
    }
}
