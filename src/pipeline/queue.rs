//! Keep-latest bounded queue.
//!
//! The producer never blocks: when the queue is full the oldest queued item is taken back
//! out and handed to the caller, and the new item takes its place. Items a consumer has
//! already received are never touched.

use crossbeam::channel::{self, Receiver, Sender, TrySendError};

pub struct LatestSender<T> {
    tx: Sender<T>,
    evict: Receiver<T>,
}

/// Queue holding at most `capacity` items (at least one).
pub fn keep_latest<T>(capacity: usize) -> (LatestSender<T>, Receiver<T>) {
    let (tx, rx) = channel::bounded(capacity.max(1));
    let evict = rx.clone();
    (LatestSender { tx, evict }, rx)
}

impl<T> LatestSender<T> {
    /// Enqueue `item`, returning whatever it superseded, oldest first.
    pub fn push(&self, item: T) -> Vec<T> {
        let mut evicted = Vec::new();
        let mut item = item;
        loop {
            match self.tx.try_send(item) {
                Ok(()) => return evicted,
                Err(TrySendError::Full(back)) => {
                    // a consumer may drain the slot first; retry either way
                    if let Ok(oldest) = self.evict.try_recv() {
                        evicted.push(oldest);
                    }
                    item = back;
                }
                // unreachable while `evict` holds a receiver
                Err(TrySendError::Disconnected(_)) => return evicted,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }
}
