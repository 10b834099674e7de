//! Deadline-ordered hand-off between the trade poller and the re-checker.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use chrono::Utc;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;

use crate::models::DeferredSignal;

struct Entry {
    seq: u64,
    signal: DeferredSignal,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // BinaryHeap is a max-heap: reverse so the earliest deadline, then the
    // earliest insertion, sits on top.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .signal
            .check_at
            .cmp(&self.signal.check_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Min-heap of deferred signals keyed on `check_at`, stable on ties.
#[derive(Default)]
pub struct DeferredQueue {
    heap: Mutex<BinaryHeap<Entry>>,
    seq: AtomicU64,
    notify: Notify,
}

impl DeferredQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue and wake the consumer so it can re-check the head.
    pub async fn push(&self, signal: DeferredSignal) {
        let seq = self.seq.fetch_add(1, AtomicOrdering::SeqCst);
        self.heap.lock().await.push(Entry { seq, signal });
        self.notify.notify_one();
    }

    pub async fn len(&self) -> usize {
        self.heap.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.heap.lock().await.is_empty()
    }

    /// Pop the head if its deadline has passed.
    pub async fn pop_due(&self) -> Option<DeferredSignal> {
        let mut heap = self.heap.lock().await;
        match heap.peek() {
            Some(entry) if entry.signal.check_at <= Utc::now() => heap.pop().map(|e| e.signal),
            _ => None,
        }
    }

    /// Wait until the head is due and return it. Returns `None` once
    /// `cancel` fires. An earlier deadline pushed while waiting is picked up
    /// straight away.
    pub async fn next_due(&self, cancel: &CancellationToken) -> Option<DeferredSignal> {
        loop {
            if cancel.is_cancelled() {
                return None;
            }

            let head = self.heap.lock().await.peek().map(|e| e.signal.check_at);
            match head {
                None => {
                    tokio::select! {
                        _ = cancel.cancelled() => return None,
                        _ = self.notify.notified() => continue,
                    }
                }
                Some(check_at) => {
                    if let Some(signal) = self.pop_due().await {
                        return Some(signal);
                    }
                    let wait = (check_at - Utc::now()).to_std().unwrap_or_default();
                    tokio::select! {
                        _ = cancel.cancelled() => return None,
                        _ = self.notify.notified() => continue,
                        _ = tokio::time::sleep(wait) => continue,
                    }
                }
            }
        }
    }

    /// Remove everything, e.g. to log what was pending at shutdown.
    pub async fn drain(&self) -> Vec<DeferredSignal> {
        let mut heap = self.heap.lock().await;
        let mut items = Vec::with_capacity(heap.len());
        while let Some(entry) = heap.pop() {
            items.push(entry.signal);
        }
        items
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Side, TradeAction, TradeEvent};
    use chrono::{DateTime, Duration};
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn deferred(id: &str, check_at: DateTime<Utc>) -> DeferredSignal {
        DeferredSignal {
            event: TradeEvent {
                id: id.to_string(),
                trader_address: "0xtrader".to_string(),
                token: "ETH".to_string(),
                side: Side::Long,
                action: TradeAction::Open,
                price: dec!(3000),
                size: dec!(1),
                value_usd: dec!(3000),
                timestamp: check_at - Duration::minutes(15),
                tx_hash: String::new(),
                position_opened_at: None,
            },
            check_at,
        }
    }

    #[tokio::test]
    async fn test_pops_in_deadline_order_with_stable_ties() {
        let queue = DeferredQueue::new();
        let base = Utc::now() - Duration::seconds(10);
        queue.push(deferred("late", base + Duration::seconds(5))).await;
        queue.push(deferred("tie-a", base)).await;
        queue.push(deferred("tie-b", base)).await;
        queue.push(deferred("early", base - Duration::seconds(5))).await;

        let cancel = CancellationToken::new();
        let mut order = Vec::new();
        while !queue.is_empty().await {
            order.push(queue.next_due(&cancel).await.unwrap().event.id);
        }
        assert_eq!(order, vec!["early", "tie-a", "tie-b", "late"]);
    }

    #[tokio::test]
    async fn test_waits_for_deadline() {
        let queue = DeferredQueue::new();
        let check_at = Utc::now() + Duration::milliseconds(120);
        queue.push(deferred("soon", check_at)).await;

        assert!(queue.pop_due().await.is_none());
        let popped = queue.next_due(&CancellationToken::new()).await.unwrap();
        assert_eq!(popped.event.id, "soon");
        assert!(Utc::now() >= check_at);
    }

    #[test]
    fn test_empty_queue_parks_until_push_or_cancel() {
        let queue = DeferredQueue::new();
        let cancel = CancellationToken::new();

        let mut waiter = tokio_test::task::spawn(queue.next_due(&cancel));
        tokio_test::assert_pending!(waiter.poll());
        tokio_test::block_on(queue.push(deferred("due", Utc::now() - Duration::seconds(1))));
        assert!(waiter.is_woken());
        let popped = tokio_test::assert_ready!(waiter.poll());
        assert_eq!(popped.unwrap().event.id, "due");
        drop(waiter);

        let mut waiter = tokio_test::task::spawn(queue.next_due(&cancel));
        tokio_test::assert_pending!(waiter.poll());
        cancel.cancel();
        assert!(waiter.is_woken());
        assert!(tokio_test::assert_ready!(waiter.poll()).is_none());
    }

    #[tokio::test]
    async fn test_earlier_push_wakes_waiter() {
        let queue = Arc::new(DeferredQueue::new());
        queue.push(deferred("far", Utc::now() + Duration::hours(1))).await;

        let producer = queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(30)).await;
            producer.push(deferred("near", Utc::now() + Duration::milliseconds(20))).await;
        });

        let popped = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            queue.next_due(&CancellationToken::new()),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(popped.event.id, "near");
        assert_eq!(queue.len().await, 1);
    }

    #[tokio::test]
    async fn test_cancellation_ends_wait() {
        let queue = Arc::new(DeferredQueue::new());
        let cancel = CancellationToken::new();

        let waiter = {
            let queue = queue.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { queue.next_due(&cancel).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        cancel.cancel();

        let result = tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_drain() {
        let queue = DeferredQueue::new();
        queue.push(deferred("a", Utc::now())).await;
        queue.push(deferred("b", Utc::now())).await;
        assert_eq!(queue.drain().await.len(), 2);
        assert!(queue.is_empty().await);
    }
}
