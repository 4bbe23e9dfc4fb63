//! Bounded work queue with priority-aware backpressure.
//!
//! One queue multiplexes stream items and scheduler re-analyses for the
//! worker pool. Drop policy when full: incoming normal/watchlist items are
//! dropped; an incoming critical item evicts the oldest non-critical item;
//! if everything queued is critical, the incoming item is dropped too.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Notify;
use tracing::{debug, warn};

use common::types::{ParsedTransaction, Priority};

/// Unit of work for the worker pool.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkItem {
    /// A transaction observed on the stream for a tracked wallet.
    StreamTx {
        wallet: String,
        tx: ParsedTransaction,
    },
    /// A scheduler-selected re-analysis.
    Analyze { wallet: String },
}

impl WorkItem {
    pub fn wallet(&self) -> &str {
        match self {
            Self::StreamTx { wallet, .. } | Self::Analyze { wallet } => wallet,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queue full and the incoming item was not critical.
    DroppedIncoming,
    /// Queue full; the oldest non-critical item was evicted to make room.
    EvictedForCritical,
    /// Queue full of critical items; the incoming critical was dropped.
    DroppedCriticalFull,
}

pub struct WorkQueue {
    maxsize: usize,
    items: Mutex<VecDeque<(Priority, WorkItem)>>,
    notify: Notify,
}

impl WorkQueue {
    pub fn new(maxsize: usize) -> Self {
        Self {
            maxsize: maxsize.max(1),
            items: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.items.lock().map(|q| q.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Non-blocking push with the priority-drop policy. Never blocks the
    /// producer; returns what happened for logging/metrics.
    pub fn push(&self, item: WorkItem, priority: Priority) -> PushOutcome {
        let outcome = {
            let mut items = match self.items.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if items.len() >= self.maxsize {
                if priority != Priority::Critical {
                    debug!(wallet = item.wallet(), priority = priority.as_str(), "queue full; dropped incoming");
                    PushOutcome::DroppedIncoming
                } else if let Some(pos) =
                    items.iter().position(|(p, _)| *p != Priority::Critical)
                {
                    items.remove(pos);
                    items.push_back((priority, item));
                    PushOutcome::EvictedForCritical
                } else {
                    warn!(wallet = item.wallet(), "queue full of critical items; dropped incoming");
                    PushOutcome::DroppedCriticalFull
                }
            } else {
                items.push_back((priority, item));
                PushOutcome::Queued
            }
        };

        match outcome {
            PushOutcome::Queued | PushOutcome::EvictedForCritical => {
                self.notify.notify_one();
            }
            PushOutcome::DroppedIncoming => {
                metrics::counter!("engine_queue_dropped_total", "reason" => "full").increment(1);
            }
            PushOutcome::DroppedCriticalFull => {
                metrics::counter!("engine_queue_dropped_total", "reason" => "all_critical")
                    .increment(1);
            }
        }
        if outcome == PushOutcome::EvictedForCritical {
            metrics::counter!("engine_queue_dropped_total", "reason" => "evicted").increment(1);
        }
        outcome
    }

    pub fn try_pop(&self) -> Option<WorkItem> {
        let mut items = match self.items.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let popped = items.pop_front().map(|(_, item)| item);
        // Chain the wakeup: Notify holds at most one permit, so a burst of
        // pushes can outrun parked consumers without this.
        if popped.is_some() && !items.is_empty() {
            self.notify.notify_one();
        }
        popped
    }

    /// Wait for the next item. Safe with multiple consumers.
    pub async fn pop(&self) -> WorkItem {
        loop {
            if let Some(item) = self.try_pop() {
                return item;
            }
            self.notify.notified().await;
        }
    }
}
