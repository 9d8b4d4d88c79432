use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use serde_json::json;
use spindle_core::work::RelayFailure;
use spindle_core::{Envelope, MessageKind};
use spindle_services::{ClientError, FramedChannel, HandlerTable};
use tokio::task::JoinHandle;

use crate::*;

// ══════════════════════════════════════════════════════════════════════════════
//  Relay fault handling
// ══════════════════════════════════════════════════════════════════════════════

/// An upstream that accepts and reads but never answers. Counts the
/// `request_item` envelopes that actually reach a handler.
async fn silent_upstream() -> Result<(String, Arc<AtomicUsize>, JoinHandle<()>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?.to_string();
    let requests = Arc::new(AtomicUsize::new(0));
    let counter = requests.clone();

    let task = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, peer)) = listener.accept().await {
            let channel = FramedChannel::from_stream(stream, peer.to_string(), ChannelOptions::default());
            let mut table = HandlerTable::new();
            let counter = counter.clone();
            table.register(MessageKind::RequestItem, move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            });
            table.register_default(|_, _| Ok(None));
            if channel.start_receiving(table).is_ok() {
                held.push(channel);
            }
        }
    });
    Ok((addr, requests, task))
}

/// With no answer from above, the relay resends `max_retries` times and
/// then fails the request downstream exactly once. The resends carry the
/// original message id, so the upstream handler runs only once.
#[tokio::test]
async fn test_unanswered_request_fails_exactly_once() -> Result<()> {
    let (upstream, requests, _silent) = silent_upstream().await?;
    let relay = spawn_relay(fast_relay("r1", &upstream, 2)).await?;
    eventually(Duration::from_secs(3), "upstream link", || {
        relay.node.upstream_state() == spindle_services::ChannelState::Connected
    })
    .await?;

    let failures: Arc<Mutex<Vec<Envelope>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = failures.clone();
    let downstream = FramedChannel::connect(&relay.addr, "raw worker", ChannelOptions::default()).await?;
    let mut table = HandlerTable::new();
    table.register(MessageKind::RelayFailure, move |_, env| {
        sink.lock().unwrap().push(env.clone());
        Ok(None)
    });
    downstream.start_receiving(table)?;

    let request_id = downstream
        .send(MessageKind::RequestItem, json!({ "worker": "raw" }), None)
        .await?;

    eventually(Duration::from_secs(3), "relay failure", || !failures.lock().unwrap().is_empty()).await?;
    // Several more sweep periods: nothing else may arrive.
    tokio::time::sleep(Duration::from_millis(500)).await;

    let failures = failures.lock().unwrap().clone();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].correlates_to.as_ref(), Some(&request_id));
    let failure: RelayFailure = failures[0].payload_as()?;
    assert_eq!(failure.attempts, 3);
    assert_eq!(requests.load(Ordering::SeqCst), 1);
    assert_eq!(relay.node.pending_count(), 0);

    downstream.close().await;
    Ok(())
}

#[tokio::test]
async fn test_worker_client_sees_relay_failure() -> Result<()> {
    let (upstream, _requests, _silent) = silent_upstream().await?;
    let relay = spawn_relay(fast_relay("r1", &upstream, 1)).await?;
    let w = worker(&relay.addr, "w").await?;

    match w.next_item(None).await {
        Err(ClientError::RelayFailed { attempts, .. }) => assert_eq!(attempts, 2),
        other => panic!("expected relay failure, got {other:?}"),
    }
    Ok(())
}

/// A request made while the upstream is down stays pending and is
/// delivered once the dispatcher comes up.
#[tokio::test]
async fn test_pending_request_survives_upstream_outage() -> Result<()> {
    let upstream = vacant_addr().await?;
    let relay = spawn_relay(fast_relay("r1", &upstream, 40)).await?;
    let w = Arc::new(worker(&relay.addr, "w").await?);

    let asking = {
        let w = w.clone();
        tokio::spawn(async move { w.next_item(None).await })
    };
    eventually(Duration::from_secs(3), "pending request", || relay.node.pending_count() == 1).await?;

    let listener = TcpListener::bind(&upstream).await?;
    let root = spawn_dispatcher_on(listener, json!([{"late": true}]))?;

    let assignment = tokio::time::timeout(Duration::from_secs(5), asking).await???;
    let item = assignment.item().context("expected an item")?;
    assert_eq!(item.id, 1);
    assert_eq!(item.parameters["late"], json!(true));
    assert_eq!(root.queue.summary().assigned, 1);
    Ok(())
}

/// Dispatcher shutdown reaches workers behind a relay, and the relay
/// itself stops.
#[tokio::test]
async fn test_shutdown_fans_out_through_relay() -> Result<()> {
    let root = spawn_dispatcher(json!([{"a": 1}])).await?;
    let relay = spawn_relay(fast_relay("r1", &root.addr, 5)).await?;
    let w = worker(&relay.addr, "w").await?;
    w.next_item(None).await?;

    root.shutdown.send(())?;
    tokio::time::timeout(Duration::from_secs(3), w.wait_for_shutdown())
        .await
        .context("worker never saw shutdown")?;
    assert!(w.shutdown_requested());
    tokio::time::timeout(Duration::from_secs(5), relay.task)
        .await
        .context("relay did not stop")???;
    tokio::time::timeout(Duration::from_secs(5), root.task)
        .await
        .context("dispatcher did not stop")???;
    Ok(())
}

/// A worker that disconnects is dropped from the relay and from the
/// dispatcher's census.
#[tokio::test]
async fn test_worker_departure_updates_census() -> Result<()> {
    let root = spawn_dispatcher(json!([])).await?;
    let relay = spawn_relay(fast_relay("r1", &root.addr, 5)).await?;
    let leaving = worker(&relay.addr, "leaving").await?;
    let observer = worker(&root.addr, "observer").await?;
    assert!(leaving.next_item(None).await?.is_end_of_work());
    assert_eq!(relay.node.downstream_count(), 1);

    leaving.close().await;
    eventually(Duration::from_secs(3), "relay teardown", || relay.node.downstream_count() == 0).await?;

    let mut gone = false;
    for _ in 0..50 {
        let report = observer.status().await?;
        if report.relays.iter().all(|r| !r.workers.iter().any(|w| w == "leaving")) {
            gone = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(gone, "census still lists the departed worker");
    Ok(())
}

// ══════════════════════════════════════════════════════════════════════════════
//  Two relay tiers
// ══════════════════════════════════════════════════════════════════════════════

/// dispatcher <- r1 <- r2 <- worker. Requests and completions cross both
/// tiers, presence notices leave nothing pending at r1, and shutdown
/// reaches the worker through both relays.
#[tokio::test]
async fn test_two_tier_relay_chain() -> Result<()> {
    let root = spawn_dispatcher(json!([{"depth": 2}, {"depth": 3}])).await?;
    let r1 = spawn_relay(fast_relay("r1", &root.addr, 3)).await?;
    eventually(Duration::from_secs(3), "r1 upstream", || {
        r1.node.upstream_state() == spindle_services::ChannelState::Connected
    })
    .await?;
    let r2 = spawn_relay(fast_relay("r2", &r1.addr, 3)).await?;
    eventually(Duration::from_secs(3), "r2 upstream", || {
        r2.node.upstream_state() == spindle_services::ChannelState::Connected
    })
    .await?;

    let deep = worker(&r2.addr, "deep").await?;
    assert_eq!(deep.node(), "r2");

    let first = deep.next_item(None).await?;
    let item = first.item().context("expected an item")?;
    assert_eq!(item.id, 1);
    assert_eq!(item.parameters["depth"], json!(2));
    assert!(!deep.report_complete(1).await?.already_completed);
    assert_eq!(root.queue.summary().completed, 1);

    // Longer than r1's whole retry budget for a notice that never gets a reply.
    tokio::time::sleep(Duration::from_millis(800)).await;
    assert_eq!(r1.node.pending_count(), 0);
    assert_eq!(r2.node.pending_count(), 0);

    let observer = worker(&root.addr, "observer").await?;
    let mut listed = false;
    for _ in 0..50 {
        let report = observer.status().await?;
        if report.relays.iter().any(|r| r.workers.iter().any(|w| w == "deep")) {
            listed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(listed, "dispatcher census never listed the worker behind r2");

    root.shutdown.send(())?;
    tokio::time::timeout(Duration::from_secs(3), deep.wait_for_shutdown())
        .await
        .context("worker behind r2 never saw shutdown")?;
    assert!(deep.shutdown_requested());
    tokio::time::timeout(Duration::from_secs(5), r1.task)
        .await
        .context("r1 did not stop")???;
    tokio::time::timeout(Duration::from_secs(5), r2.task)
        .await
        .context("r2 did not stop")???;
    Ok(())
}
