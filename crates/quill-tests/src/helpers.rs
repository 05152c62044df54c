//! Shared test helpers: a deterministic processor factory, block mining
//! through the template engine, and event recording.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use quill_chain::events::{NullEvents, ProcessorEvents};
use quill_chain::processor::{DataStatus, Options, Processor};
use quill_chain::store::{ChainStore, MemoryStore, PeerId};
use quill_chain::template::BlockContext;
use quill_core::body::{BlockBody, Input, Output, Transaction, TxKernel};
use quill_core::kdf::{DeterministicKdf, KeyDerivation};
use quill_core::mempool::Mempool;
use quill_core::rules::GENESIS_HEIGHT;
use quill_core::types::{BlockHeader, Commitment, HeaderId, Height, HeightRange, Scalar};

/// Fixed wall clock for every test processor. Block timestamps still
/// advance past it because the template stamps above the moving median.
pub const TEST_TIME: u64 = 1_700_000_000;

/// Default peer used when a test doesn't care who delivered the data.
pub const PEER: PeerId = PeerId(1);

/// Fresh processor over an empty in-memory store.
pub fn test_processor() -> Processor {
    processor_with(Options::default(), Arc::new(NullEvents))
}

/// Fresh processor with explicit options and event hooks.
pub fn processor_with(options: Options, events: Arc<dyn ProcessorEvents>) -> Processor {
    Processor::init_with(
        Box::new(MemoryStore::new()),
        options,
        events,
        Box::new(|| TEST_TIME),
    )
    .unwrap()
}

/// Reopen a processor over the store of a torn-down one, simulating a
/// node restart.
pub fn restart(processor: Processor, options: Options) -> Processor {
    reopen(processor.into_store(), options)
}

pub fn reopen(store: Box<dyn ChainStore>, options: Options) -> Processor {
    Processor::init_with(store, options, Arc::new(NullEvents), Box::new(|| TEST_TIME)).unwrap()
}

/// A block produced by [`mine_next`].
#[derive(Clone, Debug)]
pub struct MinedBlock {
    pub header: BlockHeader,
    pub body: Vec<u8>,
    pub fees: u64,
}

impl MinedBlock {
    pub fn id(&self) -> HeaderId {
        self.header.id()
    }
}

/// Assemble and mine the next block on `p`'s current tip, without
/// delivering it. Transactions that fail contextual validation are
/// silently omitted, exactly as the template engine drops them.
pub fn mine_next(p: &mut Processor, kdf: &DeterministicKdf, txs: &[Transaction]) -> MinedBlock {
    let mut pool = Mempool::new();
    for tx in txs {
        pool.insert(tx.clone()).unwrap();
    }
    let mut bc = BlockContext::new(&mut pool, kdf);
    assert!(
        p.generate_new_block_seeded(&mut bc, BlockBody::default()).unwrap(),
        "template assembly failed"
    );

    let mut header = bc.header;
    while !header.verify_pow() {
        header.pow.nonce += 1;
    }
    MinedBlock {
        header,
        body: bc.body_bytes,
        fees: bc.fees,
    }
}

/// Deliver a mined block (header then body), asserting both are accepted.
pub fn deliver(p: &mut Processor, block: &MinedBlock, peer: PeerId) {
    assert_eq!(p.on_state(&block.header, peer).unwrap(), DataStatus::Accepted);
    assert_eq!(
        p.on_block(&block.id(), &block.body, peer).unwrap(),
        DataStatus::Accepted
    );
}

/// Mine and deliver `n` empty blocks, returning them.
pub fn grow(p: &mut Processor, kdf: &DeterministicKdf, n: u64) -> Vec<MinedBlock> {
    let mut blocks = Vec::with_capacity(n as usize);
    for _ in 0..n {
        let block = mine_next(p, kdf, &[]);
        deliver(p, &block, PEER);
        blocks.push(block);
    }
    blocks
}

/// Transaction spending the coinbase output minted by `kdf` at
/// `minted_at`, paying `fee` to a fresh output.
pub fn spend_coinbase(
    kdf: &DeterministicKdf,
    minted_at: Height,
    out_seed: u8,
    fee: u64,
) -> Transaction {
    let commitment = kdf.coinbase_output(minted_at).0.commitment;
    Transaction {
        inputs: vec![Input {
            commitment,
            maturity: 0,
        }],
        outputs: vec![Output {
            commitment: Commitment([out_seed; 33]),
            coinbase: false,
            maturity: 0,
        }],
        kernel_inputs: vec![],
        kernel_outputs: vec![TxKernel {
            excess: Commitment([out_seed ^ 0x55; 33]),
            fee,
            height_range: HeightRange::new(GENESIS_HEIGHT, u64::MAX),
        }],
        offset: Scalar([out_seed; 32]),
    }
}

/// Event hooks that record everything for later assertions.
#[derive(Default)]
pub struct RecordingEvents {
    pub insane_peers: Mutex<Vec<PeerId>>,
    pub new_states: AtomicUsize,
    pub rollbacks: AtomicUsize,
    pub requests: Mutex<Vec<(HeaderId, bool)>>,
}

impl RecordingEvents {
    pub fn new_state_count(&self) -> usize {
        self.new_states.load(Ordering::SeqCst)
    }

    pub fn rollback_count(&self) -> usize {
        self.rollbacks.load(Ordering::SeqCst)
    }
}

impl ProcessorEvents for RecordingEvents {
    fn on_peer_insane(&self, peer: PeerId) {
        self.insane_peers.lock().unwrap().push(peer);
    }

    fn on_new_state(&self) {
        self.new_states.fetch_add(1, Ordering::SeqCst);
    }

    fn on_rolled_back(&self) {
        self.rollbacks.fetch_add(1, Ordering::SeqCst);
    }

    fn request_data(&self, id: HeaderId, wants_body: bool, _peer: Option<PeerId>) {
        self.requests.lock().unwrap().push((id, wants_body));
    }
}
