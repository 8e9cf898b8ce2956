//! Bounded outbound frame queue with snapshot persistence.
//!
//! Frames that cannot be written while the tunnel is down wait here and
//! are flushed, control first then FIFO, after reconnect. On graceful
//! shutdown the queue is written to a versioned JSON snapshot; restore
//! refuses snapshots from unknown versions.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use homelink_proto::message::unix_ms;
use homelink_proto::Message;

/// Snapshot format version; bump on incompatible changes.
const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Drained before normal traffic.
    Control,
    Normal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueuePolicy {
    /// Reject the incoming item when full (default).
    DropNewest,
    /// Evict the oldest normal item to make room.
    DropOldest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedItem {
    pub payload: Message,
    pub priority: Priority,
    /// Unix milliseconds at enqueue time; drives the TTL drop.
    pub enqueued_at: u64,
    #[serde(default)]
    pub retry_count: u32,
}

#[derive(Debug, thiserror::Error)]
#[error("queue full ({capacity} items)")]
pub struct QueueFull {
    pub capacity: usize,
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    items: Vec<QueuedItem>,
}

struct Inner {
    control: VecDeque<QueuedItem>,
    normal: VecDeque<QueuedItem>,
}

pub struct RequestQueue {
    inner: Mutex<Inner>,
    capacity: usize,
    policy: EnqueuePolicy,
    ttl: Duration,
}

impl RequestQueue {
    pub fn new(capacity: usize, policy: EnqueuePolicy, ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                control: VecDeque::new(),
                normal: VecDeque::new(),
            }),
            capacity,
            policy,
            ttl,
        }
    }

    pub fn enqueue(&self, payload: Message, priority: Priority) -> Result<(), QueueFull> {
        let mut inner = self.inner.lock().unwrap();
        if inner.control.len() + inner.normal.len() >= self.capacity {
            match self.policy {
                EnqueuePolicy::DropNewest => {
                    return Err(QueueFull {
                        capacity: self.capacity,
                    });
                }
                EnqueuePolicy::DropOldest => {
                    // evict from normal first; control is last to go
                    if inner.normal.pop_front().is_none() && inner.control.pop_front().is_none() {
                        return Err(QueueFull {
                            capacity: self.capacity,
                        });
                    }
                    debug!("queue full, dropped oldest item");
                }
            }
        }
        let item = QueuedItem {
            payload,
            priority,
            enqueued_at: unix_ms(),
            retry_count: 0,
        };
        match priority {
            Priority::Control => inner.control.push_back(item),
            Priority::Normal => inner.normal.push_back(item),
        }
        Ok(())
    }

    /// Next item, control before normal, FIFO within each; expired
    /// items are dropped here rather than at enqueue.
    pub fn dequeue(&self) -> Option<QueuedItem> {
        let mut inner = self.inner.lock().unwrap();
        let now = unix_ms();
        let ttl_ms = self.ttl.as_millis() as u64;
        loop {
            let item = inner.control.pop_front().or_else(|| inner.normal.pop_front())?;
            if now.saturating_sub(item.enqueued_at) > ttl_ms {
                warn!(
                    age_ms = now.saturating_sub(item.enqueued_at),
                    "dropping expired queued frame"
                );
                continue;
            }
            return Some(item);
        }
    }

    /// Put an item back at the front of its lane after a failed flush.
    pub fn requeue_front(&self, mut item: QueuedItem) {
        item.retry_count += 1;
        let mut inner = self.inner.lock().unwrap();
        match item.priority {
            Priority::Control => inner.control.push_front(item),
            Priority::Normal => inner.normal.push_front(item),
        }
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.control.len() + inner.normal.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write the queue to `path` for restart recovery.
    pub fn persist(&self, path: &Path) -> anyhow::Result<()> {
        let inner = self.inner.lock().unwrap();
        let items: Vec<QueuedItem> = inner
            .control
            .iter()
            .chain(inner.normal.iter())
            .cloned()
            .collect();
        if items.is_empty() {
            // nothing to resume; stale snapshots must not be replayed
            if path.exists() {
                std::fs::remove_file(path)?;
            }
            return Ok(());
        }
        let snapshot = Snapshot {
            version: SNAPSHOT_VERSION,
            items,
        };
        std::fs::write(path, serde_json::to_vec_pretty(&snapshot)?)?;
        info!(path = %path.display(), items = snapshot.items.len(), "queue snapshot written");
        Ok(())
    }

    /// Load a snapshot written by [`persist`], then remove it.
    ///
    /// [`persist`]: RequestQueue::persist
    pub fn restore(&self, path: &Path) -> anyhow::Result<usize> {
        if !path.exists() {
            return Ok(0);
        }
        let data = std::fs::read(path)?;
        let snapshot: Snapshot = serde_json::from_slice(&data)?;
        if snapshot.version != SNAPSHOT_VERSION {
            anyhow::bail!(
                "unsupported queue snapshot version {} (expected {})",
                snapshot.version,
                SNAPSHOT_VERSION
            );
        }
        let restored = snapshot.items.len();
        {
            let mut inner = self.inner.lock().unwrap();
            for item in snapshot.items {
                if inner.control.len() + inner.normal.len() >= self.capacity {
                    warn!("queue snapshot exceeds capacity, truncating");
                    break;
                }
                match item.priority {
                    Priority::Control => inner.control.push_back(item),
                    Priority::Normal => inner.normal.push_back(item),
                }
            }
        }
        std::fs::remove_file(path)?;
        info!(path = %path.display(), restored, "queue snapshot restored");
        Ok(restored)
    }
}
