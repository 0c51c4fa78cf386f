//! Ferry events: a bounded, ordered, coalescing notification stream that turns
//! bursts of state changes into throttled `StateModified` signals.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use ferry_core::config::{OperatorOptions, QueueFullMode};
use metrics::{counter, histogram};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

/// A published change notification: "the cache moved to `epoch`".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    pub epoch: u64,
    /// Number of identities touched by the batch that produced this change.
    pub changed: usize,
}

/// Coalesced downstream signal. Handlers re-read the state container rather
/// than trusting the contents, so receiving it twice is harmless.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateModified {
    pub seq: u64,
    /// Number of published changes folded into this signal.
    pub merged: usize,
    /// Highest state epoch among the merged changes.
    pub epoch: u64,
}

/// Bounded FIFO with a configurable full-queue policy.
pub struct EventQueue<T> {
    items: Mutex<VecDeque<T>>,
    cap: usize,
    mode: QueueFullMode,
    not_empty: Notify,
    not_full: Notify,
    dropped: AtomicU64,
}

impl<T> EventQueue<T> {
    pub fn new(cap: usize, mode: QueueFullMode) -> Self {
        let cap = cap.max(1);
        Self {
            items: Mutex::new(VecDeque::with_capacity(cap.min(1024))),
            cap,
            mode,
            not_empty: Notify::new(),
            not_full: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.cap
    }

    pub fn mode(&self) -> QueueFullMode {
        self.mode
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Enqueue an item. Under `Wait` this suspends while the queue is full;
    /// under `DropOldest` it never suspends.
    pub async fn push(&self, item: T) {
        let mut item = Some(item);
        loop {
            let notified = self.not_full.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut q = self.items.lock().unwrap_or_else(PoisonError::into_inner);
                if q.len() >= self.cap && self.mode == QueueFullMode::DropOldest {
                    q.pop_front();
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    counter!("events_dropped_total", 1u64);
                }
                if q.len() < self.cap {
                    if let Some(it) = item.take() {
                        q.push_back(it);
                    }
                    drop(q);
                    self.not_empty.notify_one();
                    return;
                }
            }
            trace!(cap = self.cap, "event queue full; waiting for a free slot");
            notified.await;
        }
    }

    /// Dequeue the oldest item, waiting for one to arrive.
    pub async fn pop(&self) -> T {
        loop {
            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let next = self.items.lock().unwrap_or_else(PoisonError::into_inner).pop_front();
            if let Some(it) = next {
                self.not_full.notify_one();
                return it;
            }
            notified.await;
        }
    }

    /// Take everything currently queued without waiting.
    pub fn drain_ready(&self) -> Vec<T> {
        let out: Vec<T> = self.items.lock().unwrap_or_else(PoisonError::into_inner).drain(..).collect();
        if !out.is_empty() {
            self.not_full.notify_waiters();
        }
        out
    }
}

const SUBSCRIBER_BUFFER: usize = 16;

/// Single-publisher-side entry point with static fan-out to subscribers.
pub struct EventStream {
    queue: EventQueue<StateChange>,
    merge_window: Duration,
    subscribers: Mutex<Vec<mpsc::Sender<StateModified>>>,
}

impl EventStream {
    pub fn new(cap: usize, mode: QueueFullMode, merge_window: Duration) -> Self {
        Self { queue: EventQueue::new(cap, mode), merge_window, subscribers: Mutex::new(Vec::new()) }
    }

    pub fn from_options(opts: &OperatorOptions) -> Self {
        Self::new(opts.event_queue_size, opts.event_queue_full_mode, opts.event_queue_merge_window)
    }

    pub fn queue(&self) -> &EventQueue<StateChange> {
        &self.queue
    }

    pub async fn publish(&self, change: StateChange) {
        counter!("events_published_total", 1u64);
        self.queue.push(change).await;
    }

    /// Register a subscriber. Every coalesced signal is delivered to every
    /// subscriber in emission order.
    pub fn subscribe(&self) -> mpsc::Receiver<StateModified> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner).push(tx);
        rx
    }

    /// Spawn the dispatcher: wait for a change, hold for the merge window,
    /// fold everything queued meanwhile into one `StateModified`.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let me = Arc::clone(self);
        tokio::spawn(async move {
            info!(
                cap = me.queue.capacity(),
                mode = ?me.queue.mode(),
                merge_window_ms = me.merge_window.as_millis() as u64,
                "event stream started"
            );
            let mut seq = 0u64;
            loop {
                let first = tokio::select! {
                    _ = cancel.cancelled() => break,
                    c = me.queue.pop() => c,
                };
                if !me.merge_window.is_zero() {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(me.merge_window) => {}
                    }
                }
                let rest = me.queue.drain_ready();
                let merged = 1 + rest.len();
                let epoch = rest.iter().map(|c| c.epoch).fold(first.epoch, u64::max);
                seq += 1;
                let signal = StateModified { seq, merged, epoch };
                histogram!("events_merged_per_emit", merged as f64);
                counter!("events_emitted_total", 1u64);
                debug!(seq, merged, epoch, "emitting state modified");
                me.emit(signal).await;
            }
            info!(emitted = seq, dropped = me.queue.dropped(), "event stream stopped");
        })
    }

    async fn emit(&self, signal: StateModified) {
        let subs = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner).clone();
        let mut closed = false;
        for tx in subs.iter() {
            if tx.send(signal).await.is_err() {
                closed = true;
            }
        }
        if closed {
            debug!("pruning closed subscribers");
            self.subscribers.lock().unwrap_or_else(PoisonError::into_inner).retain(|tx| !tx.is_closed());
        }
    }
}
