// End-to-end dispatcher runs against the in-memory connection.
//
// Every test drives a full Init -> Running -> Draining -> Stopped run,
// using event callbacks to request shutdown once the scenario has
// played out.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use warren::prelude::*;

const RUN_TIMEOUT: Duration = Duration::from_secs(10);

fn fast_config(num_workers: usize) -> DispatcherConfig {
    DispatcherConfig::new(vec!["jobs".into()])
        .with_num_workers(num_workers)
        .with_tick_interval(Duration::from_millis(2))
}

/// Record every event of the given kinds into a shared log.
fn record_events(
    dispatcher: &mut Dispatcher,
    kinds: &[EventKind],
) -> Arc<Mutex<Vec<DispatcherEvent>>> {
    let log = Arc::new(Mutex::new(Vec::new()));
    for kind in kinds {
        let log = Arc::clone(&log);
        dispatcher.on(*kind, move |event, _| {
            log.lock().unwrap().push(event.clone());
        });
    }
    log
}

/// Request shutdown once `target` messages have been processed.
fn shutdown_after(dispatcher: &mut Dispatcher, target: u64) {
    dispatcher.on(EventKind::Processed, move |_, ctx| {
        if ctx.stats().processed >= target {
            ctx.shutdown();
        }
    });
}

async fn run_to_completion(dispatcher: Dispatcher) -> Result<StatsSnapshot> {
    tokio::time::timeout(RUN_TIMEOUT, dispatcher.run())
        .await
        .expect("dispatcher run timed out")
}

#[test_log::test(tokio::test)]
async fn test_processes_queue_with_small_pool() {
    let conn = Arc::new(InMemoryConnection::new());
    for i in 1..=5 {
        conn.publish(format!("message-{i}").into_bytes());
    }

    let handler = handler_fn(|_| async {
        tokio::time::sleep(Duration::from_millis(5)).await;
        HandlerOutcome::Done
    });

    let mut dispatcher = Dispatcher::new(Arc::clone(&conn) as _, handler, fast_config(2));
    shutdown_after(&mut dispatcher, 5);

    let stats = run_to_completion(dispatcher).await.unwrap();

    assert_eq!(stats.consumed, 5);
    assert_eq!(stats.processed, 5);
    assert_eq!(stats.peak_num_workers, 2);
    // All five land in the cache at once; two go straight to workers.
    assert_eq!(stats.peak_num_cached, 3);
    assert_eq!(stats.max_message_length, "message-1".len() as u64);

    assert_eq!(conn.ready_len(), 0);
    assert_eq!(conn.unacked_len(), 0);
    assert!(conn.is_closed());
}

#[test_log::test(tokio::test)]
async fn test_single_worker_preserves_fifo_order() {
    let conn = Arc::new(InMemoryConnection::new());
    for i in 1..=4 {
        conn.publish(format!("{i}").into_bytes());
    }

    let seen = Arc::new(Mutex::new(Vec::new()));
    let handler = {
        let seen = Arc::clone(&seen);
        handler_fn(move |envelope: Envelope| {
            let seen = Arc::clone(&seen);
            async move {
                seen.lock().unwrap().push(envelope.body.clone());
                HandlerOutcome::Done
            }
        })
    };

    let mut dispatcher = Dispatcher::new(Arc::clone(&conn) as _, handler, fast_config(1));
    shutdown_after(&mut dispatcher, 4);

    let stats = run_to_completion(dispatcher).await.unwrap();

    assert_eq!(stats.processed, 4);
    let seen = seen.lock().unwrap();
    assert_eq!(*seen, vec![b"1".to_vec(), b"2".to_vec(), b"3".to_vec(), b"4".to_vec()]);
}

#[test_log::test(tokio::test)]
async fn test_freed_worker_takes_oldest_cached_message() {
    let conn = Arc::new(InMemoryConnection::new());
    for i in 1..=4 {
        conn.publish(format!("m{i}").into_bytes());
    }

    // One worker is pinned on the slow first message while the other
    // drains the rest; if assignment were not FIFO the fast worker
    // would finish m4 before m3.
    let completions = Arc::new(Mutex::new(Vec::new()));
    let handler = {
        let completions = Arc::clone(&completions);
        handler_fn(move |envelope: Envelope| {
            let completions = Arc::clone(&completions);
            async move {
                if envelope.body == b"m1" {
                    tokio::time::sleep(Duration::from_millis(150)).await;
                } else {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                completions.lock().unwrap().push(envelope.body.clone());
                HandlerOutcome::Done
            }
        })
    };

    let mut dispatcher = Dispatcher::new(Arc::clone(&conn) as _, handler, fast_config(2));
    shutdown_after(&mut dispatcher, 4);

    let stats = run_to_completion(dispatcher).await.unwrap();

    assert_eq!(stats.processed, 4);
    assert_eq!(stats.peak_num_workers, 2);
    let completions = completions.lock().unwrap();
    assert_eq!(
        *completions,
        vec![
            b"m2".to_vec(),
            b"m3".to_vec(),
            b"m4".to_vec(),
            b"m1".to_vec()
        ]
    );
}

#[test_log::test(tokio::test)]
async fn test_crashed_worker_message_is_redelivered() {
    let conn = Arc::new(InMemoryConnection::new());
    conn.publish(b"boom".to_vec());

    let crashed_once = Arc::new(AtomicBool::new(false));
    let handler = {
        let crashed_once = Arc::clone(&crashed_once);
        handler_fn(move |envelope: Envelope| {
            let crashed_once = Arc::clone(&crashed_once);
            async move {
                if !crashed_once.swap(true, Ordering::SeqCst) {
                    panic!("simulated crash on {:?}", envelope.delivery_tag);
                }
                HandlerOutcome::Done
            }
        })
    };

    let mut dispatcher = Dispatcher::new(Arc::clone(&conn) as _, handler, fast_config(1));
    let events = record_events(
        &mut dispatcher,
        &[EventKind::Processed, EventKind::WorkerExit],
    );
    shutdown_after(&mut dispatcher, 1);

    let stats = run_to_completion(dispatcher).await.unwrap();

    // Consumed twice (original plus redelivery), processed once.
    assert_eq!(stats.consumed, 2);
    assert_eq!(stats.processed, 1);

    let events = events.lock().unwrap();
    assert!(events.iter().any(|event| matches!(
        event,
        DispatcherEvent::WorkerExit {
            crashed: true,
            requeued: true,
            ..
        }
    )));
    assert!(events.iter().any(|event| matches!(
        event,
        DispatcherEvent::Processed {
            redelivered: true,
            ..
        }
    )));
    assert_eq!(conn.unacked_len(), 0);
}

#[test_log::test(tokio::test)]
async fn test_handler_failure_keeps_worker_alive() {
    let conn = Arc::new(InMemoryConnection::new());
    conn.publish(b"bad".to_vec());
    conn.publish(b"good".to_vec());

    let handler = handler_fn(|envelope: Envelope| async move {
        if envelope.body == b"bad" {
            HandlerOutcome::failed("unparseable payload")
        } else {
            HandlerOutcome::Done
        }
    });

    let mut dispatcher = Dispatcher::new(Arc::clone(&conn) as _, handler, fast_config(1));
    let events = record_events(
        &mut dispatcher,
        &[EventKind::Error, EventKind::WorkerExit],
    );
    shutdown_after(&mut dispatcher, 1);

    let stats = run_to_completion(dispatcher).await.unwrap();

    // The rejection is dropped under the default policy; the same
    // worker then processes the second message.
    assert_eq!(stats.consumed, 2);
    assert_eq!(stats.processed, 1);
    assert_eq!(stats.peak_num_workers, 1);

    let events = events.lock().unwrap();
    assert!(events.iter().any(|event| matches!(
        event,
        DispatcherEvent::Error { fatal: false, reason, .. } if reason.contains("handler failed")
    )));
    assert!(!events
        .iter()
        .any(|event| matches!(event, DispatcherEvent::WorkerExit { crashed: true, .. })));
    assert_eq!(conn.ready_len(), 0);
    assert_eq!(conn.unacked_len(), 0);
}

#[test_log::test(tokio::test)]
async fn test_graceful_drain_requeues_unassigned_messages() {
    let conn = Arc::new(InMemoryConnection::new());
    for i in 1..=3 {
        conn.publish(format!("m{i}").into_bytes());
    }

    let handler = handler_fn(|_| async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        HandlerOutcome::Done
    });

    let mut dispatcher = Dispatcher::new(Arc::clone(&conn) as _, handler, fast_config(1));
    let events = record_events(&mut dispatcher, &[EventKind::Shutdown, EventKind::WorkerExit]);
    shutdown_after(&mut dispatcher, 1);

    let stats = run_to_completion(dispatcher).await.unwrap();

    // Whatever never reached a worker goes back to the broker.
    assert!(stats.processed < 3);
    assert_eq!(conn.ready_len() as u64, 3 - stats.processed);
    assert_eq!(conn.unacked_len(), 0);
    assert!(conn.is_closed());

    let events = events.lock().unwrap();
    assert!(events.iter().any(|event| matches!(
        event,
        DispatcherEvent::Shutdown { stats: final_stats, .. } if *final_stats == stats
    )));
    assert!(!events
        .iter()
        .any(|event| matches!(event, DispatcherEvent::WorkerExit { crashed: true, .. })));
}

#[test_log::test(tokio::test)]
async fn test_connection_loss_forces_drain() {
    let conn = Arc::new(InMemoryConnection::new());
    conn.publish(b"first".to_vec());
    conn.publish(b"second".to_vec());

    let handler = handler_fn(|_| async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        HandlerOutcome::Done
    });

    let mut dispatcher = Dispatcher::new(Arc::clone(&conn) as _, handler, fast_config(1));
    let events = record_events(&mut dispatcher, &[EventKind::Error, EventKind::Shutdown]);

    // Sever the connection as soon as the first message completes.
    let sever_conn = Arc::clone(&conn);
    dispatcher.on(EventKind::Processed, move |_, _| {
        sever_conn.sever();
    });

    let err = run_to_completion(dispatcher).await.unwrap_err();
    assert!(err.is_fatal());

    let events = events.lock().unwrap();
    assert!(events
        .iter()
        .any(|event| matches!(event, DispatcherEvent::Error { fatal: true, .. })));
    // The run still closes with a shutdown event.
    assert!(events
        .iter()
        .any(|event| matches!(event, DispatcherEvent::Shutdown { .. })));
}

#[test_log::test(tokio::test)]
async fn test_unresponsive_worker_is_killed_and_replaced() {
    let conn = Arc::new(InMemoryConnection::new());
    conn.publish(b"stuck".to_vec());
    conn.publish(b"fast".to_vec());

    let stuck_once = Arc::new(AtomicBool::new(false));
    let handler = {
        let stuck_once = Arc::clone(&stuck_once);
        handler_fn(move |envelope: Envelope| {
            let stuck_once = Arc::clone(&stuck_once);
            async move {
                if envelope.body == b"stuck" && !stuck_once.swap(true, Ordering::SeqCst) {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                }
                HandlerOutcome::Done
            }
        })
    };

    let config = fast_config(1).with_response_timeout(Duration::from_millis(50));
    let mut dispatcher = Dispatcher::new(Arc::clone(&conn) as _, handler, config);
    let events = record_events(
        &mut dispatcher,
        &[EventKind::Processed, EventKind::WorkerExit],
    );
    shutdown_after(&mut dispatcher, 2);

    let stats = run_to_completion(dispatcher).await.unwrap();

    // Both messages eventually process: the stuck one is requeued after
    // the liveness kill and completes on its redelivery.
    assert_eq!(stats.processed, 2);
    assert_eq!(stats.consumed, 3);

    let events = events.lock().unwrap();
    assert!(events.iter().any(|event| matches!(
        event,
        DispatcherEvent::WorkerExit {
            crashed: true,
            requeued: true,
            ..
        }
    )));
    assert!(events.iter().any(|event| matches!(
        event,
        DispatcherEvent::Processed {
            redelivered: true,
            ..
        }
    )));
}
