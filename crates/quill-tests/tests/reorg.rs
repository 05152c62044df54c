//! Reorg scenarios: branch switching by cumulative work, bad bodies,
//! duplicate kernels, congestion reporting.

use std::sync::Arc;

use quill_core::kdf::DeterministicKdf;
use quill_core::rules::GENESIS_HEIGHT;
use quill_core::types::{ChainWork, HeaderId};

use quill_chain::processor::{DataStatus, Options};
use quill_chain::store::{ChainStore, PeerId, FLAG_ACTIVE, FLAG_FUNCTIONAL};
use quill_tests::helpers::*;

#[test]
fn longer_branch_wins() {
    // Build branch A (2 blocks) and branch B (3 blocks) on side
    // processors sharing nothing but the rules.
    let mut side_a = test_processor();
    let kdf_a = DeterministicKdf::from_byte(1);
    let branch_a = grow(&mut side_a, &kdf_a, 2);

    let mut side_b = test_processor();
    let kdf_b = DeterministicKdf::from_byte(2);
    let branch_b = grow(&mut side_b, &kdf_b, 3);

    // The target hears branch A first.
    let events = Arc::new(RecordingEvents::default());
    let mut p = processor_with(Options::default(), events.clone());
    for block in &branch_a {
        deliver(&mut p, block, PeerId(1));
    }
    assert_eq!(p.cursor_id(), branch_a[1].id());

    // Branch B carries more work; delivering it flips the cursor.
    for block in &branch_b {
        deliver(&mut p, block, PeerId(2));
    }
    assert_eq!(p.cursor_id(), branch_b[2].id());
    assert_eq!(events.rollback_count(), 2); // A2, A1 unapplied

    // State equals a fresh apply of branch B.
    assert_eq!(p.utxo_root(), side_b.utxo_root());
    assert_eq!(p.kernel_root(), side_b.kernel_root());
    assert_eq!(p.subsidy_total(), side_b.subsidy_total());
    assert_eq!(p.total_offset(), side_b.total_offset());

    // Branch A stays on disk, non-active but functional.
    for block in &branch_a {
        let row = p.store().state_find(&block.id()).unwrap();
        let flags = p.store().get_flags(row);
        assert_eq!(flags & FLAG_ACTIVE, 0);
        assert_ne!(flags & FLAG_FUNCTIONAL, 0);
        let (body, _) = p.store().get_state_block(row).unwrap();
        assert!(body.is_some());
    }
}

#[test]
fn best_tip_maximality_after_reorg() {
    let mut side_a = test_processor();
    let branch_a = grow(&mut side_a, &DeterministicKdf::from_byte(1), 4);
    let mut side_b = test_processor();
    let branch_b = grow(&mut side_b, &DeterministicKdf::from_byte(2), 2);

    let mut p = test_processor();
    for block in branch_b.iter().chain(branch_a.iter()) {
        deliver(&mut p, block, PEER);
    }

    // No functional tip outworks the cursor.
    let cursor_work = p.cursor_header().chainwork;
    for tip in p.store().enum_functional_tips() {
        assert!(p.store().get_chainwork(tip.row).unwrap() <= cursor_work);
    }
    assert_eq!(p.cursor_id(), branch_a[3].id());
}

#[test]
fn fork_from_midchain_reorgs_from_ancestor() {
    // Common prefix of 2 blocks, then A extends by 1 and B by 2.
    let kdf_a = DeterministicKdf::from_byte(1);
    let kdf_b = DeterministicKdf::from_byte(2);

    let mut side_a = test_processor();
    let prefix = grow(&mut side_a, &kdf_a, 2);
    let a_ext = grow(&mut side_a, &kdf_a, 1);

    let mut side_b = test_processor();
    for block in &prefix {
        deliver(&mut side_b, block, PEER);
    }
    let b_ext = grow(&mut side_b, &kdf_b, 2);

    let events = Arc::new(RecordingEvents::default());
    let mut p = processor_with(Options::default(), events.clone());
    for block in prefix.iter().chain(a_ext.iter()) {
        deliver(&mut p, block, PEER);
    }
    assert_eq!(p.cursor_id(), a_ext[0].id());

    for block in &b_ext {
        deliver(&mut p, block, PEER);
    }
    assert_eq!(p.cursor_id(), b_ext[1].id());
    // Only the A extension was unwound, not the shared prefix.
    assert_eq!(events.rollback_count(), 1);
    assert_eq!(p.utxo_root(), side_b.utxo_root());
    assert_eq!(p.kernel_root(), side_b.kernel_root());
}

#[test]
fn bad_body_penalizes_peer_and_keeps_cursor() {
    let kdf_a = DeterministicKdf::from_byte(1);
    let kdf_b = DeterministicKdf::from_byte(2);

    let mut side_a = test_processor();
    let good = grow(&mut side_a, &kdf_a, 1);

    // A body generated under a different key set: the header's definition
    // cannot match the state this body produces.
    let mut side_b = test_processor();
    let other = grow(&mut side_b, &kdf_b, 1);

    let events = Arc::new(RecordingEvents::default());
    let mut p = processor_with(Options::default(), events.clone());

    assert_eq!(
        p.on_state(&good[0].header, PeerId(7)).unwrap(),
        DataStatus::Accepted
    );
    assert_eq!(
        p.on_block(&good[0].id(), &other[0].body, PeerId(7)).unwrap(),
        DataStatus::Accepted
    );

    // The reorg attempt failed: cursor unchanged, body dropped, state
    // demoted, peer reported.
    assert_eq!(p.cursor_id().height, 0);
    let row = p.store().state_find(&good[0].id()).unwrap();
    assert_eq!(p.store().get_flags(row) & FLAG_FUNCTIONAL, 0);
    let (body, journal) = p.store().get_state_block(row).unwrap();
    assert!(body.is_none());
    assert!(journal.is_none());
    assert_eq!(*events.insane_peers.lock().unwrap(), vec![PeerId(7)]);

    // The correct body can still be delivered afterwards.
    deliver(&mut p, &good[0], PeerId(8));
    assert_eq!(p.cursor_id(), good[0].id());
}

#[test]
fn duplicate_kernel_fails_and_unwinds_exactly() {
    let kdf = DeterministicKdf::from_byte(1);
    let mut p = test_processor();
    let genesis = grow(&mut p, &kdf, 1);

    let utxo_root = p.utxo_root();
    let kernel_root = p.kernel_root();

    // A follow-up block reusing the genesis body: its coinbase kernel is
    // already live, so the apply must fail mid-way and restore the
    // accumulators bit-identically.
    let mut header = genesis[0].header;
    header.height = GENESIS_HEIGHT + 1;
    header.prev = genesis[0].header.hash();
    header.chainwork = ChainWork(genesis[0].header.chainwork.0 + 1);
    header.timestamp = genesis[0].header.timestamp + 1;
    header.pow.nonce = 0;
    while !header.verify_pow() {
        header.pow.nonce += 1;
    }

    let events = Arc::new(RecordingEvents::default());
    let mut p2 = processor_with(Options::default(), events.clone());
    deliver(&mut p2, &genesis[0], PeerId(1));
    drop(p);

    assert_eq!(p2.on_state(&header, PeerId(3)).unwrap(), DataStatus::Accepted);
    assert_eq!(
        p2.on_block(&header.id(), &genesis[0].body, PeerId(3)).unwrap(),
        DataStatus::Accepted
    );

    // Cursor stayed on genesis; the kernel set and UTXO set are exactly
    // as before the attempt.
    assert_eq!(p2.cursor_id(), genesis[0].id());
    assert_eq!(p2.utxo_root(), utxo_root);
    assert_eq!(p2.kernel_root(), kernel_root);
    assert_eq!(*events.insane_peers.lock().unwrap(), vec![PeerId(3)]);
}

#[test]
fn oversized_body_is_invalid() {
    let mut p = test_processor();
    let kdf = DeterministicKdf::from_byte(1);
    let block = mine_next(&mut p, &kdf, &[]);
    p.on_state(&block.header, PEER).unwrap();

    let huge = vec![0u8; quill_core::rules::MAX_BODY_SIZE + 1];
    assert_eq!(
        p.on_block(&block.id(), &huge, PEER).unwrap(),
        DataStatus::Invalid
    );
}

#[test]
fn undecodable_body_rejected_in_context() {
    let mut p = test_processor();
    let kdf = DeterministicKdf::from_byte(1);
    let block = mine_next(&mut p, &kdf, &[]);

    let events = Arc::new(RecordingEvents::default());
    let mut p = processor_with(Options::default(), events.clone());
    p.on_state(&block.header, PeerId(4)).unwrap();
    assert_eq!(
        p.on_block(&block.id(), &[0xFF, 0xFF, 0xFF], PeerId(4)).unwrap(),
        DataStatus::Accepted
    );
    // Interpretation failed: cursor unchanged, peer penalized.
    assert_eq!(p.cursor_id().height, 0);
    assert_eq!(*events.insane_peers.lock().unwrap(), vec![PeerId(4)]);
}

#[test]
fn orphan_body_waits_for_ancestry() {
    // Deliver block 2 (header + body) without block 1's body: functional
    // but unreachable, so the cursor must not move.
    let mut side = test_processor();
    let kdf = DeterministicKdf::from_byte(1);
    let blocks = grow(&mut side, &kdf, 2);

    let mut p = test_processor();
    assert_eq!(
        p.on_state(&blocks[0].header, PEER).unwrap(),
        DataStatus::Accepted
    );
    assert_eq!(
        p.on_state(&blocks[1].header, PEER).unwrap(),
        DataStatus::Accepted
    );
    assert_eq!(
        p.on_block(&blocks[1].id(), &blocks[1].body, PEER).unwrap(),
        DataStatus::Accepted
    );
    assert_eq!(p.cursor_id().height, 0);

    // Block 1's body completes the path and the cursor jumps to 2.
    assert_eq!(
        p.on_block(&blocks[0].id(), &blocks[0].body, PEER).unwrap(),
        DataStatus::Accepted
    );
    assert_eq!(p.cursor_id(), blocks[1].id());
}

#[test]
fn congestions_request_missing_bodies_and_headers() {
    let mut side = test_processor();
    let kdf = DeterministicKdf::from_byte(1);
    let blocks = grow(&mut side, &kdf, 3);

    let events = Arc::new(RecordingEvents::default());
    let mut p = processor_with(Options::default(), events.clone());

    // Headers 1..3 known, no bodies: the boundary is block 1's body.
    for block in &blocks {
        p.on_state(&block.header, PEER).unwrap();
    }
    p.enum_congestions().unwrap();
    {
        let requests = events.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0], (blocks[0].id(), true));
    }

    // Only header 3 known: the missing link is header 2.
    let events2 = Arc::new(RecordingEvents::default());
    let mut p2 = processor_with(Options::default(), events2.clone());
    p2.on_state(&blocks[2].header, PEER).unwrap();
    p2.enum_congestions().unwrap();
    {
        let requests = events2.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        let expected = HeaderId {
            height: blocks[1].header.height,
            hash: blocks[1].header.hash(),
        };
        assert_eq!(requests[0], (expected, false));
    }
}
