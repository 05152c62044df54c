//! Macroblocks: compacted history for batch transfer.
//!
//! A macroblock squashes a consecutive active range into one body with
//! cut-through applied, plus the header sequence: the first header in full
//! and every subsequent one as element fields only (height, prev and
//! chainwork are reconstructed while replaying).
//!
//! Export walks the range top-down, restoring explicit maturities onto
//! every element, and merges blocks pairwise on a bottom-up segment-tree
//! schedule so the total combine work stays linearized. Import verifies
//! continuity against the cursor, replays the headers into the history
//! MMR, applies the squashed body with explicit maturities, and checks the
//! final header's definition before promoting the whole range to Active.

use std::collections::BTreeMap;

use tracing::{info, warn};

use quill_core::body::{self, BlockBody};
use quill_core::error::{BodyError, ProcessorError};
use quill_core::merkle::CompactMmr;
use quill_core::rules;
use quill_core::types::{
    definition_hash, live_hash, BlockHeader, Commitment, Hash256, HeaderElement, Height,
    HeightRange,
};

use crate::processor::{DataStatus, Processor};
use crate::store::{ParamId, StateId};

/// A squashed range of consecutive blocks.
#[derive(Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct Macroblock {
    /// Full header of the first block in the range.
    pub first_header: BlockHeader,
    /// Element fields of every subsequent header, in height order.
    pub elements: Vec<HeaderElement>,
    /// The merged body with cut-through applied.
    pub body: BlockBody,
}

impl Macroblock {
    /// Height of the last block in the range.
    pub fn top_height(&self) -> Height {
        self.first_header.height + self.elements.len() as u64
    }

    /// Reconstruct the full header sequence.
    pub fn headers(&self) -> Vec<BlockHeader> {
        let mut headers = Vec::with_capacity(1 + self.elements.len());
        let mut s = self.first_header;
        headers.push(s);
        for elem in &self.elements {
            s = s.next(elem);
            headers.push(s);
        }
        headers
    }

    pub fn encode(&self) -> Result<Vec<u8>, BodyError> {
        bincode::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| BodyError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Macroblock, BodyError> {
        let (mb, read) = bincode::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| BodyError::Decode(e.to_string()))?;
        if read != bytes.len() {
            return Err(BodyError::Decode("trailing bytes".into()));
        }
        Ok(mb)
    }
}

/// Merge two consecutive bodies, cancelling outputs of the earlier block
/// against the matching inputs (and consumed kernels) of the later one.
///
/// Both bodies carry explicit maturities, so cancellation pairs on
/// `(commitment, maturity)`. Cancellation in the other direction would pair
/// a pre-range spend with a post-spend re-creation and is never valid.
pub(crate) fn combine_bodies(mut earlier: BlockBody, mut later: BlockBody) -> BlockBody {
    // UTXO cut-through.
    let mut available: BTreeMap<(Commitment, Height), u32> = BTreeMap::new();
    for output in &earlier.outputs {
        *available.entry((output.commitment, output.maturity)).or_insert(0) += 1;
    }
    let mut cancelled: BTreeMap<(Commitment, Height), u32> = BTreeMap::new();
    later.inputs.retain(|input| {
        let key = (input.commitment, input.maturity);
        match available.get_mut(&key) {
            Some(n) if *n > 0 => {
                *n -= 1;
                *cancelled.entry(key).or_insert(0) += 1;
                false
            }
            _ => true,
        }
    });
    earlier.outputs.retain(|output| {
        let key = (output.commitment, output.maturity);
        match cancelled.get_mut(&key) {
            Some(n) if *n > 0 => {
                *n -= 1;
                false
            }
            _ => true,
        }
    });

    // Kernel cut-through: a kernel created and then consumed inside the
    // range vanishes.
    let mut live_kernels: BTreeMap<Hash256, u32> = BTreeMap::new();
    for krn in &earlier.kernel_outputs {
        *live_kernels.entry(krn.id()).or_insert(0) += 1;
    }
    let mut cancelled_kernels: BTreeMap<Hash256, u32> = BTreeMap::new();
    later.kernel_inputs.retain(|krn| {
        let id = krn.id();
        match live_kernels.get_mut(&id) {
            Some(n) if *n > 0 => {
                *n -= 1;
                *cancelled_kernels.entry(id).or_insert(0) += 1;
                false
            }
            _ => true,
        }
    });
    earlier.kernel_outputs.retain(|krn| {
        match cancelled_kernels.get_mut(&krn.id()) {
            Some(n) if *n > 0 => {
                *n -= 1;
                false
            }
            _ => true,
        }
    });

    let mut merged = BlockBody {
        inputs: earlier.inputs,
        outputs: earlier.outputs,
        kernel_inputs: earlier.kernel_inputs,
        kernel_outputs: earlier.kernel_outputs,
        offset: earlier.offset.add(&later.offset),
        subsidy: earlier.subsidy.saturating_add(later.subsidy),
        subsidy_closing: earlier.subsidy_closing || later.subsidy_closing,
    };
    merged.inputs.extend(later.inputs);
    merged.outputs.extend(later.outputs);
    merged.kernel_inputs.extend(later.kernel_inputs);
    merged.kernel_outputs.extend(later.kernel_outputs);

    merged.inputs.sort_unstable();
    merged.outputs.sort_unstable();
    merged.kernel_inputs.sort_unstable();
    merged.kernel_outputs.sort_unstable();
    merged
}

/// Merge the two most recently pushed bodies. The vector is filled
/// top-down, so the last element is the earlier block.
fn squash_once(blocks: &mut Vec<BlockBody>) {
    debug_assert!(blocks.len() >= 2);
    let (Some(earlier), Some(later)) = (blocks.pop(), blocks.pop()) else {
        return;
    };
    blocks.push(combine_bodies(earlier, later));
}

impl Processor {
    /// Export the active range `[hr.min, hr.max]` as a macroblock.
    pub fn export_macroblock(&self, hr: HeightRange) -> Result<Macroblock, ProcessorError> {
        if hr.is_empty() || hr.min < rules::GENESIS_HEIGHT || hr.max > self.cursor.sid.height {
            return Err(ProcessorError::Corrupted("invalid macroblock export range"));
        }

        let mut sid = StateId {
            row: self.find_active_at_strict(hr.max)?,
            height: hr.max,
        };

        let mut blocks: Vec<BlockBody> = Vec::new();
        let mut i: u32 = 0;
        loop {
            blocks.push(self.extract_block_with_extra(sid)?);

            if sid.height == hr.min {
                break;
            }
            sid = self
                .store
                .get_prev(sid.row)
                .ok_or(ProcessorError::Corrupted("active chain broken"))?;

            let mut j = i;
            while j & 1 == 1 {
                squash_once(&mut blocks);
                j >>= 1;
            }
            i += 1;
        }
        while blocks.len() > 1 {
            squash_once(&mut blocks);
        }
        let body = blocks.pop().unwrap_or_default();

        let headers = self.export_header_range(&hr)?;
        let first_header = headers[0];
        let elements = headers[1..].iter().map(BlockHeader::element).collect();

        Ok(Macroblock {
            first_header,
            elements,
            body,
        })
    }

    /// Collect the active headers over `hr` in height order.
    fn export_header_range(&self, hr: &HeightRange) -> Result<Vec<BlockHeader>, ProcessorError> {
        let mut headers = vec![BlockHeader::default(); hr.len() as usize];

        let mut sid = StateId {
            row: self.find_active_at_strict(hr.max)?,
            height: hr.max,
        };
        loop {
            let s = self.store.get_state(sid.row)?;
            headers[(s.height - hr.min) as usize] = s;

            if sid.height == hr.min {
                break;
            }
            sid = self
                .store
                .get_prev(sid.row)
                .ok_or(ProcessorError::Corrupted("active chain broken"))?;
        }
        Ok(headers)
    }

    /// Import a macroblock on top of the current cursor.
    ///
    /// The transaction commits even when the import logically fails:
    /// validation side effects (inserted headers, dropped bodies) must
    /// persist. On success the whole range is promoted to Active, the
    /// horizons jump to the imported top, and the reorg engine runs once.
    pub fn import_macroblock(&mut self, mb: &Macroblock) -> Result<bool, ProcessorError> {
        self.store.tx_begin()?;
        match self.import_macroblock_internal(mb) {
            Ok(ok) => {
                self.store.tx_commit()?;
                if ok {
                    self.with_tx(|p| p.try_go_up())?;
                }
                Ok(ok)
            }
            Err(e) => {
                let _ = self.store.tx_rollback();
                Err(e)
            }
        }
    }

    fn import_macroblock_internal(&mut self, mb: &Macroblock) -> Result<bool, ProcessorError> {
        let first = mb.first_header;

        if self.cursor.id.height + 1 != first.height || self.cursor.id.hash != first.prev {
            warn!(
                my_tip = %self.cursor.id,
                start_height = first.height,
                "incompatible state for import"
            );
            return Ok(false);
        }

        // Rebuild the history MMR over everything strictly below the
        // cursor; each processed header then appends its predecessor.
        let mut cmmr = CompactMmr::new();
        for h in rules::GENESIS_HEIGHT..self.cursor.id.height {
            let row = self.find_active_at_strict(h)?;
            cmmr.append(self.store.get_state_hash(row)?);
        }

        info!("verifying headers");

        let headers = mb.headers();
        let mut id = self.cursor.id;
        for (i, s) in headers.iter().enumerate() {
            if i == 0 {
                let wrk = s.pow.difficulty.inc(self.cursor.full.chainwork);
                if wrk != s.chainwork {
                    warn!(expected = %wrk, actual = %s.chainwork, "chainwork mismatch");
                    return Ok(false);
                }
            }

            if id.height >= rules::GENESIS_HEIGHT {
                cmmr.append(id.hash);
            }

            let (status, new_id) = self.on_state_internal(s);
            match status {
                DataStatus::Invalid => {
                    warn!(id = %new_id, "invalid header encountered");
                    return Ok(false);
                }
                DataStatus::Accepted => {
                    self.store.insert_state(s)?;
                }
                _ => {}
            }
            id = new_id;
        }

        info!("context-free validation");

        let hr = HeightRange::new(self.cursor.id.height + 1, id.height);
        if !body::verify_body(&mb.body, &hr, self.extra.subsidy_open) {
            warn!("context-free verification failed");
            return Ok(false);
        }

        info!("applying macroblock");

        let mut block = mb.body.clone();
        if !self.handle_validated_block(&mut block, hr.min, true, false, Some(hr.max))? {
            warn!("invalid in its context");
            return Ok(false);
        }

        // Evaluate the definition against the final header.
        let def = definition_hash(
            live_hash(self.utxos.root(), self.kernels.root()),
            cmmr.root(),
        );
        if headers[headers.len() - 1].definition != def {
            warn!("definition mismatch");
            if !self.handle_validated_block(&mut block, hr.min, false, false, Some(hr.max))? {
                return Err(ProcessorError::Corrupted("macroblock unapply failed"));
            }
            return Ok(false);
        }

        // Promote the whole range to Active and rebuild the cursor.
        info!("building auxiliary data");

        for s in &headers {
            let s_id = s.id();
            let row = self
                .store
                .state_find(&s_id)
                .ok_or(ProcessorError::Corrupted("imported state missing"))?;

            self.store.set_state_functional(row)?;
            self.store.del_state_block(row)?; // if somehow it was downloaded
            self.store.set_peer(row, None)?;
            self.store.move_fwd(StateId {
                row,
                height: s_id.height,
            })?;
        }

        let top = id.height;
        self.store.param_set_u64(ParamId::LoHorizon, top);
        self.store.param_set_u64(ParamId::FossilHeight, top);
        self.store.set_macroblock(top, mb.encode()?)?;

        self.init_cursor()?;

        info!(top, "macroblock import succeeded");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_core::body::{Input, Output, TxKernel};
    use quill_core::types::{Hash256, Scalar};

    fn c(seed: u8) -> Commitment {
        Commitment([seed; 33])
    }

    fn input(seed: u8, maturity: Height) -> Input {
        Input {
            commitment: c(seed),
            maturity,
        }
    }

    fn output(seed: u8, maturity: Height) -> Output {
        Output {
            commitment: c(seed),
            coinbase: false,
            maturity,
        }
    }

    fn kernel(seed: u8) -> TxKernel {
        TxKernel {
            excess: c(seed),
            fee: 0,
            height_range: HeightRange::new(1, u64::MAX),
        }
    }

    // --- combine_bodies ---

    #[test]
    fn combine_cancels_matching_pairs() {
        let mut earlier = BlockBody::default();
        earlier.outputs = vec![output(1, 10), output(2, 10)];
        earlier.kernel_outputs = vec![kernel(1)];
        earlier.subsidy = 5;

        let mut later = BlockBody::default();
        later.inputs = vec![input(1, 10)];
        later.outputs = vec![output(3, 20)];
        later.kernel_inputs = vec![kernel(1)];
        later.subsidy = 7;

        let merged = combine_bodies(earlier, later);
        // output(1) cancelled against input(1); kernel(1) cancelled.
        assert_eq!(merged.outputs, vec![output(2, 10), output(3, 20)]);
        assert!(merged.inputs.is_empty());
        assert!(merged.kernel_inputs.is_empty());
        assert!(merged.kernel_outputs.is_empty());
        assert_eq!(merged.subsidy, 12);
    }

    #[test]
    fn combine_respects_maturity_in_pairing() {
        let mut earlier = BlockBody::default();
        earlier.outputs = vec![output(1, 10)];

        let mut later = BlockBody::default();
        // Same commitment, different maturity: refers to an older UTXO.
        later.inputs = vec![input(1, 5)];

        let merged = combine_bodies(earlier, later);
        assert_eq!(merged.inputs, vec![input(1, 5)]);
        assert_eq!(merged.outputs, vec![output(1, 10)]);
    }

    #[test]
    fn combine_keeps_pre_range_spends() {
        let mut earlier = BlockBody::default();
        earlier.inputs = vec![input(1, 3)];

        let mut later = BlockBody::default();
        later.outputs = vec![output(1, 3)];

        // An earlier spend and a later re-creation must both survive.
        let merged = combine_bodies(earlier, later);
        assert_eq!(merged.inputs.len(), 1);
        assert_eq!(merged.outputs.len(), 1);
    }

    #[test]
    fn combine_sums_offsets() {
        let mut earlier = BlockBody::default();
        earlier.offset = Scalar([1; 32]);
        let mut later = BlockBody::default();
        later.offset = Scalar([2; 32]);
        let merged = combine_bodies(earlier, later);
        assert_eq!(merged.offset, Scalar([1; 32]).add(&Scalar([2; 32])));
    }

    #[test]
    fn combine_multiset_cancellation_is_counted() {
        let mut earlier = BlockBody::default();
        earlier.outputs = vec![output(1, 10), output(1, 10)];
        let mut later = BlockBody::default();
        later.inputs = vec![input(1, 10)];

        let merged = combine_bodies(earlier, later);
        // Only one of the two identical outputs cancels.
        assert_eq!(merged.outputs, vec![output(1, 10)]);
        assert!(merged.inputs.is_empty());
    }

    // --- Macroblock value ---

    #[test]
    fn macroblock_round_trip() {
        let mut body = BlockBody::default();
        body.outputs = vec![output(1, 10)];
        let mb = Macroblock {
            first_header: BlockHeader {
                height: 1,
                prev: Hash256::ZERO,
                ..Default::default()
            },
            elements: vec![HeaderElement::default()],
            body,
        };
        assert_eq!(mb.top_height(), 2);
        let bytes = mb.encode().unwrap();
        assert_eq!(Macroblock::decode(&bytes).unwrap(), mb);
    }

    #[test]
    fn headers_reconstruct_chain_links() {
        let first = BlockHeader {
            height: 5,
            prev: Hash256([7; 32]),
            chainwork: quill_core::types::ChainWork(5),
            timestamp: 100,
            ..Default::default()
        };
        let elem = HeaderElement {
            timestamp: 160,
            pow: quill_core::types::Pow {
                difficulty: quill_core::types::Difficulty(1),
                nonce: 3,
            },
            ..Default::default()
        };
        let mb = Macroblock {
            first_header: first,
            elements: vec![elem],
            body: BlockBody::default(),
        };
        let headers = mb.headers();
        assert_eq!(headers.len(), 2);
        assert_eq!(headers[1].height, 6);
        assert_eq!(headers[1].prev, headers[0].hash());
        assert_eq!(headers[1].chainwork.0, 6);
    }
}
