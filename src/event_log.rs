//! Append-only history of resolved detection events.
//!
//! `record` is idempotent per event id and retries transient storage failures. Reads are
//! newest first by `(created_at, id)` and page lazily through storage, so a long history
//! is never materialized at once.

use std::collections::VecDeque;
use std::sync::Arc;

use serde::Serialize;

use crate::storage::{EventCursor, Persistence, PersistenceError, RetryPolicy};
use crate::{DetectionEvent, EventId, Resolution};

const DEFAULT_PAGE_SIZE: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Recorded {
    Stored,
    /// The id was already in the log; nothing written.
    Duplicate,
}

/// Counts by resolution over a time window.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct EventStats {
    pub total: u64,
    pub allowed: u64,
    pub denied: u64,
    pub timed_out: u64,
}

pub struct EventLog {
    store: Arc<dyn Persistence>,
    retry: RetryPolicy,
    page_size: usize,
}

impl EventLog {
    pub fn new(store: Arc<dyn Persistence>, retry: RetryPolicy) -> Self {
        Self {
            store,
            retry,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Store one event. Recording the same id twice is a no-op.
    pub fn record(&self, event: &DetectionEvent) -> Result<Recorded, PersistenceError> {
        let stored = self
            .retry
            .run("event append", || self.store.append_event(event))?;
        Ok(if stored {
            Recorded::Stored
        } else {
            Recorded::Duplicate
        })
    }

    /// `record`, logging and dropping the event when storage stays unavailable.
    pub fn record_or_drop(&self, event: &DetectionEvent) -> Option<Recorded> {
        match self.record(event) {
            Ok(recorded) => {
                if recorded == Recorded::Duplicate {
                    log::debug!("event log: event {} already recorded", event.id);
                }
                Some(recorded)
            }
            Err(e) => {
                log::error!(
                    "event log: dropping event {} ({}): {}",
                    event.id,
                    event.resolution.as_str(),
                    e
                );
                None
            }
        }
    }

    /// Lazy newest-first iterator over the whole log.
    pub fn history(&self) -> History {
        History {
            store: Arc::clone(&self.store),
            page_size: self.page_size,
            cursor: None,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    /// The newest `limit` events.
    pub fn recent(&self, limit: usize) -> Result<Vec<DetectionEvent>, PersistenceError> {
        self.history().take(limit).collect()
    }

    /// Resolution counts for events created at or after `since_ms`.
    pub fn stats_since(&self, since_ms: u64) -> Result<EventStats, PersistenceError> {
        let mut stats = EventStats::default();
        for event in self.history() {
            let event = event?;
            if event.created_at < since_ms {
                break;
            }
            stats.total += 1;
            match event.resolution {
                Resolution::Allowed => stats.allowed += 1,
                Resolution::Denied => stats.denied += 1,
                Resolution::TimedOut => stats.timed_out += 1,
                Resolution::Pending => {}
            }
        }
        Ok(stats)
    }

    /// Highest recorded id; new events are numbered after it.
    pub fn max_event_id(&self) -> Result<EventId, PersistenceError> {
        self.retry
            .run("event id scan", || self.store.max_event_id())
    }
}

/// Newest-first cursor over the event log.
///
/// Pages are fetched on demand. After a storage error the iterator yields the error once
/// and then ends; `restart` begins again from the newest event.
pub struct History {
    store: Arc<dyn Persistence>,
    page_size: usize,
    cursor: Option<EventCursor>,
    buffer: VecDeque<DetectionEvent>,
    exhausted: bool,
}

impl History {
    pub fn restart(&mut self) {
        self.cursor = None;
        self.buffer.clear();
        self.exhausted = false;
    }
}

impl Iterator for History {
    type Item = Result<DetectionEvent, PersistenceError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            match self.store.events_page(self.cursor, self.page_size) {
                Ok(page) => {
                    if page.len() < self.page_size {
                        self.exhausted = true;
                    }
                    if let Some(last) = page.last() {
                        self.cursor = Some(EventCursor::after(last));
                    }
                    self.buffer.extend(page);
                }
                Err(e) => {
                    self.exhausted = true;
                    return Some(Err(e));
                }
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}
