#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use ferry_core::config::QueueFullMode;
use ferry_events::{EventStream, StateChange};
use tokio_util::sync::CancellationToken;

fn change(epoch: u64) -> StateChange {
    StateChange { epoch, changed: 1 }
}

#[tokio::test(start_paused = true)]
async fn burst_within_merge_window_emits_once() {
    let stream = Arc::new(EventStream::new(64, QueueFullMode::Wait, Duration::from_secs(10)));
    let mut rx = stream.subscribe();
    let cancel = CancellationToken::new();
    let task = stream.start(cancel.clone());

    for epoch in 1..=5 {
        stream.publish(change(epoch)).await;
    }

    let signal = rx.recv().await.expect("one signal");
    assert_eq!(signal.seq, 1);
    assert_eq!(signal.merged, 5);
    assert_eq!(signal.epoch, 5);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(rx.try_recv().is_err(), "a single burst must produce exactly one signal");

    cancel.cancel();
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn separate_windows_emit_in_order_to_every_subscriber() {
    let stream = Arc::new(EventStream::new(64, QueueFullMode::Wait, Duration::from_secs(2)));
    let mut a = stream.subscribe();
    let mut b = stream.subscribe();
    let cancel = CancellationToken::new();
    let task = stream.start(cancel.clone());

    stream.publish(change(1)).await;
    stream.publish(change(2)).await;
    let first = a.recv().await.unwrap();
    assert_eq!((first.seq, first.merged), (1, 2));

    tokio::time::sleep(Duration::from_secs(5)).await;
    stream.publish(change(3)).await;
    let second = a.recv().await.unwrap();
    assert_eq!((second.seq, second.merged, second.epoch), (2, 1, 3));

    assert_eq!(b.recv().await.unwrap(), first);
    assert_eq!(b.recv().await.unwrap(), second);

    cancel.cancel();
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn drop_oldest_under_burst_still_signals() {
    let stream = Arc::new(EventStream::new(2, QueueFullMode::DropOldest, Duration::from_secs(1)));
    let mut rx = stream.subscribe();

    // Dispatcher not started yet: the queue overflows.
    for epoch in 1..=5 {
        stream.publish(change(epoch)).await;
    }
    assert_eq!(stream.queue().dropped(), 3);

    let cancel = CancellationToken::new();
    let task = stream.start(cancel.clone());
    let signal = rx.recv().await.unwrap();
    assert_eq!(signal.merged, 2);
    assert_eq!(signal.epoch, 5);

    cancel.cancel();
    task.await.unwrap();
}

#[tokio::test]
async fn zero_window_emits_what_is_ready() {
    let stream = Arc::new(EventStream::new(8, QueueFullMode::Wait, Duration::ZERO));
    let mut rx = stream.subscribe();
    let cancel = CancellationToken::new();
    let task = stream.start(cancel.clone());

    stream.publish(change(9)).await;
    let signal = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
    assert_eq!(signal.epoch, 9);

    cancel.cancel();
    task.await.unwrap();
}
