//! Read sessions, proof scheduling and passport queries against a live node.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use super::TestHarness;
use custody_node::config::SessionConfig;
use custody_node::ledger::{Operation, ReadPlan, ReadPledge};
use custody_node::session::announce_store;
use custody_node::{Address, Error, NodeEvent};

const DATA: &[u8] = b"block-0|block-1|block-2|block-3|";
const BLOCK: usize = 8;

/// Allocation (max=2, have=0): two blocks, vouchers 0 and 1, settlement with 1, Closed.
#[tokio::test]
async fn test_read_session_settles_final_voucher() {
    let mut harness = TestHarness::setup().await.expect("Failed to setup harness");
    let fid = harness
        .add_file("doc", Address([1u8; 20]), DATA, BLOCK, 50)
        .unwrap();
    let downloader = harness.downloader().unwrap();
    let node = harness.node_address();

    let pledge = downloader
        .pledge_read(&fid, vec![ReadPlan::new(node, 2)], 0)
        .await
        .unwrap();
    assert_eq!(pledge.plan_for(&node).unwrap().have_read_blocks, 0);

    let result = downloader
        .read_file(harness.node_addr(), &fid, node)
        .await
        .unwrap();
    assert_eq!(result.first_slice, 0);
    assert_eq!(result.data(), b"block-0|block-1|");

    let closed = harness
        .wait_for_event("SessionClosed", |e| matches!(e, NodeEvent::SessionClosed { .. }))
        .await
        .unwrap();
    assert_eq!(
        closed,
        NodeEvent::SessionClosed {
            file_id: fid.clone(),
            downloader: downloader.address(),
            blocks: 2,
            settled_slice: Some(1),
        }
    );

    let settled: Vec<u64> = harness
        .ledger
        .submitted()
        .into_iter()
        .filter_map(|tx| match tx.operation {
            Operation::ReadSettle(v) => Some(v.slice_id),
            _ => None,
        })
        .collect();
    assert_eq!(settled, vec![1]);
    let pledge = harness.ledger.pledge(&fid, &downloader.address()).unwrap();
    assert_eq!(pledge.plan_for(&node).unwrap().have_read_blocks, 2);

    tokio_test::assert_ok!(harness.teardown().await);
}

/// The node resubmits the final voucher when the in-session settlement is dropped.
#[tokio::test]
async fn test_dropped_settlement_is_retried() {
    let mut harness = TestHarness::setup().await.expect("Failed to setup harness");
    let fid = harness
        .add_file("doc", Address([1u8; 20]), DATA, BLOCK, 50)
        .unwrap();
    let downloader = harness.downloader().unwrap();
    let node = harness.node_address();
    downloader
        .pledge_read(&fid, vec![ReadPlan::new(node, 2)], 0)
        .await
        .unwrap();
    harness.ledger.fail_next_submissions(1);

    let result = downloader
        .read_file(harness.node_addr(), &fid, node)
        .await
        .unwrap();
    assert_eq!(result.blocks.len(), 2);

    let closed = harness
        .wait_for_event("SessionClosed", |e| {
            matches!(
                e,
                NodeEvent::SessionClosed { .. } | NodeEvent::SessionAborted { .. }
            )
        })
        .await
        .unwrap();
    assert!(
        matches!(
            closed,
            NodeEvent::SessionClosed {
                blocks: 2,
                settled_slice: Some(1),
                ..
            }
        ),
        "{closed:?}"
    );
    let pledge = harness.ledger.pledge(&fid, &downloader.address()).unwrap();
    assert_eq!(pledge.plan_for(&node).unwrap().have_read_blocks, 2);

    tokio_test::assert_ok!(harness.teardown().await);
}

/// A cancelled allocation can no longer be read against.
#[tokio::test]
async fn test_cancelled_pledge_cannot_be_read() {
    let harness = TestHarness::setup().await.expect("Failed to setup harness");
    let fid = harness
        .add_file("doc", Address([1u8; 20]), DATA, BLOCK, 50)
        .unwrap();
    let downloader = harness.downloader().unwrap();
    let node = harness.node_address();
    downloader
        .pledge_read(&fid, vec![ReadPlan::new(node, 2)], 0)
        .await
        .unwrap();

    downloader.cancel_read(&fid).await.unwrap();
    assert!(harness.ledger.pledge(&fid, &downloader.address()).is_none());

    let err = downloader
        .read_file(harness.node_addr(), &fid, node)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::SessionAborted { ref state, .. } if state == "Handshake"
    ));
    tokio_test::assert_ok!(harness.teardown().await);
}

/// A new session resumes from the allocation's served counter.
#[tokio::test]
async fn test_resumed_session_continues_slice_indices() {
    let mut harness = TestHarness::setup().await.expect("Failed to setup harness");
    let fid = harness
        .add_file("doc", Address([1u8; 20]), DATA, BLOCK, 50)
        .unwrap();
    let downloader = harness.downloader().unwrap();
    let node = harness.node_address();

    downloader
        .pledge_read(&fid, vec![ReadPlan::new(node, 4)], 0)
        .await
        .unwrap();
    let mut pledge = harness.ledger.pledge(&fid, &downloader.address()).unwrap();
    pledge.plans[0].have_read_blocks = 2;
    harness.ledger.put_read_pledge(pledge);

    let result = downloader
        .read_file(harness.node_addr(), &fid, node)
        .await
        .unwrap();
    assert_eq!(result.first_slice, 2);
    assert_eq!(result.data(), b"block-2|block-3|");

    harness
        .wait_for_event("SessionClosed", |e| {
            matches!(e, NodeEvent::SessionClosed { settled_slice: Some(3), .. })
        })
        .await
        .unwrap();
    tokio_test::assert_ok!(harness.teardown().await);
}

/// Allocation (max=3, have=3): immediate PlanExhausted, zero blocks.
#[tokio::test]
async fn test_exhausted_plan_sends_no_blocks() {
    let mut harness = TestHarness::setup().await.expect("Failed to setup harness");
    let fid = harness
        .add_file("doc", Address([1u8; 20]), DATA, BLOCK, 50)
        .unwrap();
    let downloader = harness.downloader().unwrap();
    let node = harness.node_address();
    harness.ledger.put_read_pledge(ReadPledge {
        file_id: fid.clone(),
        downloader: downloader.address(),
        pledge_height: harness.ledger.height(),
        expire_height: 1_000,
        rest_balance: 0,
        plans: vec![ReadPlan {
            node,
            max_read_blocks: 3,
            have_read_blocks: 3,
        }],
    });

    let err = downloader
        .read_file(harness.node_addr(), &fid, node)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("exhausted"), "{err}");

    let aborted = harness
        .wait_for_event("SessionAborted", |e| matches!(e, NodeEvent::SessionAborted { .. }))
        .await
        .unwrap();
    match aborted {
        NodeEvent::SessionAborted { reason, .. } => {
            assert!(reason.contains("Negotiating"), "{reason}");
        }
        other => unreachable!("filtered above: {other:?}"),
    }
    assert!(harness
        .ledger
        .submitted()
        .iter()
        .all(|tx| !matches!(tx.operation, Operation::ReadSettle(_))));

    tokio_test::assert_ok!(harness.teardown().await);
}

/// A downloader without an allocation is refused at the handshake.
#[tokio::test]
async fn test_read_without_pledge_aborts() {
    let mut harness = TestHarness::setup().await.expect("Failed to setup harness");
    let fid = harness
        .add_file("doc", Address([1u8; 20]), DATA, BLOCK, 50)
        .unwrap();
    let downloader = harness.downloader().unwrap();

    // The downloader itself notices first; check the node side directly.
    let mut transport = downloader.connect(harness.node_addr()).await.unwrap();
    transport
        .send(&custody_node::session::Frame::Command(
            custody_node::session::Command::ReadFile {
                file_id: fid.clone(),
                downloader: downloader.address(),
            },
        ))
        .await
        .unwrap();
    assert_eq!(
        transport.recv().await.unwrap(),
        custody_node::session::Frame::SetupAck
    );
    assert!(matches!(
        transport.recv().await.unwrap(),
        custody_node::session::Frame::Abort(_)
    ));

    harness
        .wait_for_event("SessionAborted", |e| {
            matches!(e, NodeEvent::SessionAborted { reason, .. } if reason.contains("Handshake"))
        })
        .await
        .unwrap();

    let err = downloader
        .read_file(harness.node_addr(), &fid, harness.node_address())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::SessionAborted { ref source, .. } if matches!(**source, Error::NotFound(_))
    ));
    tokio_test::assert_ok!(harness.teardown().await);
}

/// `StoreFile|<id>` starts the proof loop, which submits an initial proof.
#[tokio::test]
async fn test_store_file_starts_proving() {
    let mut harness = TestHarness::setup().await.expect("Failed to setup harness");
    let fid = harness
        .add_file("stored", Address([1u8; 20]), DATA, BLOCK, 50)
        .unwrap();

    announce_store(harness.node_addr(), &fid, &SessionConfig::default())
        .await
        .unwrap();

    let event = harness
        .wait_for_event("ProofSubmitted", |e| matches!(e, NodeEvent::ProofSubmitted { .. }))
        .await
        .unwrap();
    assert!(matches!(event, NodeEvent::ProofSubmitted { ref file_id, .. } if *file_id == fid));

    let record = harness
        .ledger
        .pdp_record(&fid, &harness.node_address())
        .unwrap();
    assert_eq!(record.proof_count, 1);
    assert!(record.last_submitted.is_some());

    tokio_test::assert_ok!(harness.teardown().await);
}

/// `StoreFile` for a file the ledger does not know is reported, not fatal.
#[tokio::test]
async fn test_store_unknown_file_reports_error() {
    let mut harness = TestHarness::setup().await.expect("Failed to setup harness");
    announce_store(
        harness.node_addr(),
        &custody_node::ledger::FileId::new("ghost"),
        &SessionConfig::default(),
    )
    .await
    .unwrap();

    harness
        .wait_for_event("Error", |e| matches!(e, NodeEvent::Error { .. }))
        .await
        .unwrap();
    tokio_test::assert_ok!(harness.teardown().await);
}

/// A passport-authorized listing returns only the holder's files.
#[tokio::test]
async fn test_list_files_with_passport() {
    let harness = TestHarness::setup().await.expect("Failed to setup harness");
    let downloader = harness.downloader().unwrap();
    harness
        .add_file("mine-b", downloader.address(), DATA, BLOCK, 50)
        .unwrap();
    harness
        .add_file("mine-a", downloader.address(), DATA, BLOCK, 50)
        .unwrap();
    harness
        .add_file("theirs", Address([1u8; 20]), DATA, BLOCK, 50)
        .unwrap();

    let files = downloader.list_files().await.unwrap();
    let names: Vec<&str> = files.iter().map(|f| f.as_str()).collect();
    assert_eq!(names, vec!["mine-a", "mine-b"]);

    tokio_test::assert_ok!(harness.teardown().await);
}

/// Garbage instead of a command gets an abort and leaves the node running.
#[tokio::test]
async fn test_bad_setup_line_is_rejected() {
    let harness = TestHarness::setup().await.expect("Failed to setup harness");
    let downloader = harness.downloader().unwrap();

    let mut transport = downloader.connect(harness.node_addr()).await.unwrap();
    transport
        .send(&custody_node::session::Frame::Close { slices: 0 })
        .await
        .unwrap();
    assert!(matches!(
        transport.recv().await.unwrap(),
        custody_node::session::Frame::Abort(_)
    ));

    // Still serving.
    announce_store(
        harness.node_addr(),
        &custody_node::ledger::FileId::new("ghost"),
        &SessionConfig::default(),
    )
    .await
    .unwrap();
    tokio_test::assert_ok!(harness.teardown().await);
}
