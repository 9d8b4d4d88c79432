use std::collections::BTreeSet;

use serde_json::json;
use spindle_core::{Assignment, ItemState, ResetTarget};
use spindle_services::ClientError;

use crate::*;

// ══════════════════════════════════════════════════════════════════════════════
//  Dispatch through one relay tier
// ══════════════════════════════════════════════════════════════════════════════

fn id_of(assignment: &Assignment) -> u64 {
    assignment.item().map(|item| item.id).unwrap_or(0)
}

/// Two workers behind a relay. A worker that comes back naming an
/// unfinished prior item gets it again before any fresh item, and a range
/// reset comes back out newest-first.
#[tokio::test]
async fn test_reset_and_redispatch_through_relay() -> Result<()> {
    let items = json!((1..=5).map(|i| json!({ "seed": i })).collect::<Vec<_>>());
    let root = spawn_dispatcher(items).await?;
    let relay = spawn_relay(fast_relay("r1", &root.addr, 5)).await?;
    let w1 = worker(&relay.addr, "w1").await?;
    let w2 = worker(&relay.addr, "w2").await?;
    assert_eq!(w1.node(), "r1");

    let first = w1.next_item(None).await?;
    assert_eq!(id_of(&first), 1);
    assert_eq!(first.item().map(|i| i.parameters["seed"].clone()), Some(json!(1)));
    assert_eq!(id_of(&w2.next_item(None).await?), 2);

    // w1 restarted without finishing item 1.
    assert_eq!(id_of(&w1.next_item(Some(1)).await?), 1);
    assert_eq!(root.queue.state_of(1), Some((ItemState::Assigned, "w1".to_string())));

    assert!(!w1.report_complete(1).await?.already_completed);
    assert!(w1.report_complete(1).await?.already_completed);

    let ack = w2.force_reset(ResetTarget::Range { start: 1, end: 2 }).await?;
    assert_eq!(ack.reset, vec![1, 2]);

    let mut order = Vec::new();
    loop {
        let next = w2.next_item(None).await?;
        if next.is_end_of_work() {
            break;
        }
        let id = id_of(&next);
        w2.report_complete(id).await?;
        order.push(id);
    }
    assert_eq!(order, vec![2, 1, 3, 4, 5]);

    let summary = root.queue.summary();
    assert_eq!(summary.completed, 5);
    assert_eq!(summary.exhausted_requests, 1);

    w1.close().await;
    w2.close().await;
    Ok(())
}

#[tokio::test]
async fn test_end_of_work_through_relay() -> Result<()> {
    let root = spawn_dispatcher(json!([{"only": true}])).await?;
    let relay = spawn_relay(fast_relay("r1", &root.addr, 5)).await?;
    let w = worker(&relay.addr, "w").await?;

    let item = w.next_item(None).await?;
    w.report_complete(id_of(&item)).await?;
    assert_eq!(w.next_item(Some(id_of(&item))).await?, Assignment::EndOfWork);
    assert_eq!(w.next_item(None).await?, Assignment::EndOfWork);
    assert_eq!(root.queue.summary().exhausted_requests, 2);
    Ok(())
}

/// Workers spread over two relays and a direct connection drain the queue.
/// Every item is handed out and completed exactly once.
#[tokio::test]
async fn test_concurrent_workers_across_relays() -> Result<()> {
    let items = json!((0..60).map(|i| json!({ "n": i })).collect::<Vec<_>>());
    let root = spawn_dispatcher(items).await?;
    let r1 = spawn_relay(fast_relay("r1", &root.addr, 5)).await?;
    let r2 = spawn_relay(fast_relay("r2", &root.addr, 5)).await?;

    let mut tasks = Vec::new();
    for (i, addr) in [&r1.addr, &r1.addr, &r2.addr, &r2.addr, &root.addr].into_iter().enumerate() {
        let w = worker(addr, &format!("w{i}")).await?;
        tasks.push(tokio::spawn(async move {
            let mut done = Vec::new();
            loop {
                match w.next_item(None).await? {
                    Assignment::EndOfWork => break,
                    Assignment::Item { item } => {
                        w.report_complete(item.id).await?;
                        done.push(item.id);
                    }
                }
            }
            w.close().await;
            Ok::<_, ClientError>(done)
        }));
    }

    let mut seen = BTreeSet::new();
    for task in tasks {
        for id in task.await?? {
            assert!(seen.insert(id), "item {id} handed out twice");
        }
    }
    assert_eq!(seen, (1..=60).collect::<BTreeSet<u64>>());
    assert_eq!(root.queue.summary().completed, 60);
    Ok(())
}

/// The dispatcher's census lists workers by the relay they sit behind.
#[tokio::test]
async fn test_status_reports_census_and_queue() -> Result<()> {
    let root = spawn_dispatcher(json!([{"a": 1}, {"a": 2}])).await?;
    let relay = spawn_relay(fast_relay("r1", &root.addr, 5)).await?;
    let behind = worker(&relay.addr, "behind").await?;
    let direct = worker(&root.addr, "direct").await?;
    behind.next_item(None).await?;

    let mut report = direct.status().await?;
    for _ in 0..50 {
        if !report.relays.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        report = direct.status().await?;
    }

    assert_eq!(report.node, "root");
    assert_eq!(report.workers, vec!["direct".to_string()]);
    assert_eq!(report.relays.len(), 1);
    assert_eq!(report.relays[0].relay, "r1");
    assert_eq!(report.relays[0].workers, vec!["behind".to_string()]);
    let queue = report.queue.context("dispatcher status carries a queue summary")?;
    assert_eq!(queue.total, 2);
    assert_eq!(queue.assigned, 1);
    Ok(())
}

#[tokio::test]
async fn test_unknown_completion_is_a_remote_error() -> Result<()> {
    let root = spawn_dispatcher(json!([{"a": 1}])).await?;
    let relay = spawn_relay(fast_relay("r1", &root.addr, 5)).await?;
    let w = worker(&relay.addr, "w").await?;
    match w.report_complete(404).await {
        Err(ClientError::Remote(msg)) => assert!(msg.contains("unknown item 404"), "{msg}"),
        other => panic!("expected remote error, got {other:?}"),
    }
    Ok(())
}
