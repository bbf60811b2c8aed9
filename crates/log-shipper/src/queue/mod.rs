// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! FIFO queues sitting between batch sealing and the network sender.
//!
//! Items are opaque byte payloads. A popped item stays at the head of the
//! queue until it is acknowledged, so a crash or a cancelled delivery never
//! loses it: the next `pop` returns the same item again (at-least-once).

use std::collections::VecDeque;
use std::fmt::Debug;
use std::sync::Mutex;
use thiserror::Error;

pub mod disk;

pub use disk::{DiskQueue, DiskQueueConfig};

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue is full")]
    Full,
    #[error("queue is closed")]
    Closed,
    #[error("acknowledged item {got} but the head of the queue is {expected:?}")]
    UnexpectedAck { expected: Option<u64>, got: u64 },
    #[error("queue storage error: {0}")]
    Io(#[from] std::io::Error),
    #[error("queue storage is corrupt: {0}")]
    Corrupt(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedItem {
    pub id: u64,
    pub payload: Vec<u8>,
}

pub trait DurableQueue: Send + Sync + Debug {
    /// Appends an item at the tail.
    fn push(&self, payload: Vec<u8>) -> Result<(), QueueError>;

    /// Returns the oldest unacknowledged item without removing it.
    fn pop(&self) -> Result<Option<QueuedItem>, QueueError>;

    /// Removes the head item. `id` must be the id returned by the last `pop`.
    fn ack(&self, id: u64) -> Result<(), QueueError>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True when a `push` would currently fail with [`QueueError::Full`].
    fn is_full(&self) -> bool;

    /// True when items survive a process restart.
    fn is_durable(&self) -> bool;

    /// Flushes and releases resources. Further pushes fail.
    fn close(&self) -> Result<(), QueueError>;
}

#[derive(Debug)]
struct MemoryState {
    items: VecDeque<QueuedItem>,
    next_id: u64,
    closed: bool,
}

/// Bounded in-memory queue used by unbuffered clients.
#[derive(Debug)]
pub struct MemoryQueue {
    state: Mutex<MemoryState>,
    capacity: usize,
}

impl MemoryQueue {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        MemoryQueue {
            state: Mutex::new(MemoryState {
                items: VecDeque::new(),
                next_id: 0,
                closed: false,
            }),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        // a poisoned queue still holds consistent data: every mutation is a
        // single VecDeque operation
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl DurableQueue for MemoryQueue {
    fn push(&self, payload: Vec<u8>) -> Result<(), QueueError> {
        let mut state = self.lock();
        if state.closed {
            return Err(QueueError::Closed);
        }
        if state.items.len() >= self.capacity {
            return Err(QueueError::Full);
        }
        let id = state.next_id;
        state.next_id += 1;
        state.items.push_back(QueuedItem { id, payload });
        Ok(())
    }

    fn pop(&self) -> Result<Option<QueuedItem>, QueueError> {
        Ok(self.lock().items.front().cloned())
    }

    fn ack(&self, id: u64) -> Result<(), QueueError> {
        let mut state = self.lock();
        match state.items.front() {
            Some(head) if head.id == id => {
                state.items.pop_front();
                Ok(())
            }
            head => Err(QueueError::UnexpectedAck {
                expected: head.map(|item| item.id),
                got: id,
            }),
        }
    }

    fn len(&self) -> usize {
        self.lock().items.len()
    }

    fn is_full(&self) -> bool {
        self.lock().items.len() >= self.capacity
    }

    fn is_durable(&self) -> bool {
        false
    }

    fn close(&self) -> Result<(), QueueError> {
        self.lock().closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_queue_fifo_with_ack() {
        let queue = MemoryQueue::new(10);
        queue.push(b"a".to_vec()).unwrap();
        queue.push(b"b".to_vec()).unwrap();

        let first = queue.pop().unwrap().unwrap();
        assert_eq!(first.payload, b"a");
        // not acknowledged yet, so the same item comes back
        assert_eq!(queue.pop().unwrap().unwrap(), first);

        queue.ack(first.id).unwrap();
        assert_eq!(queue.pop().unwrap().unwrap().payload, b"b");
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_memory_queue_capacity() {
        let queue = MemoryQueue::new(2);
        queue.push(b"a".to_vec()).unwrap();
        queue.push(b"b".to_vec()).unwrap();

        assert!(queue.is_full());
        assert!(matches!(queue.push(b"c".to_vec()), Err(QueueError::Full)));
    }

    #[test]
    fn test_memory_queue_rejects_wrong_ack() {
        let queue = MemoryQueue::new(2);
        queue.push(b"a".to_vec()).unwrap();

        let err = queue.ack(42).unwrap_err();
        assert!(matches!(
            err,
            QueueError::UnexpectedAck { expected: Some(0), got: 42 }
        ));
    }

    #[test]
    fn test_memory_queue_closed() {
        let queue = MemoryQueue::new(2);
        queue.close().unwrap();

        assert!(matches!(queue.push(b"a".to_vec()), Err(QueueError::Closed)));
        assert!(!queue.is_durable());
    }
}
