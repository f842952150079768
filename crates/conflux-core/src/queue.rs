//! Per-plugin asynchronous event queue.
//!
//! Each plugin owns one [`EventQueue`].  Every service of the plugin holds its
//! own [`EventStream`] cursor obtained from [`EventQueue::subscribe`], so each
//! service observes **every** event pushed after it subscribed, independently of
//! how fast its siblings consume.
//!
//! Ordering is FIFO per cursor, except that urgent events are placed at the
//! head of every cursor.  [`close`](EventQueue::close) wakes all pending
//! consumers; they drain what is left and then observe end-of-stream (`None`).

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::error::QueueClosed;
use crate::event::Event;

#[derive(Default)]
struct QueueState {
    cursors: HashMap<u64, Arc<Cursor>>,
    next_cursor: u64,
    closed: bool,
}

struct Cursor {
    pending: Mutex<VecDeque<Event>>,
    notify: Notify,
}

struct QueueInner {
    owner: String,
    state: Mutex<QueueState>,
}

/// The inbound event queue of one plugin.
#[derive(Clone)]
pub struct EventQueue {
    inner: Arc<QueueInner>,
}

impl EventQueue {
    /// Creates an open queue owned by `owner`.
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                owner: owner.into(),
                state: Mutex::new(QueueState::default()),
            }),
        }
    }

    /// Returns the name of the owning plugin.
    pub fn owner(&self) -> &str {
        &self.inner.owner
    }

    /// Enqueues an event on every cursor.
    ///
    /// Urgent events go to the head, all others to the tail.
    pub fn push(&self, event: Event) -> Result<(), QueueClosed> {
        let state = self.inner.state.lock();
        if state.closed {
            return Err(QueueClosed);
        }
        for cursor in state.cursors.values() {
            {
                let mut pending = cursor.pending.lock();
                if event.is_urgent() {
                    pending.push_front(event.clone());
                } else {
                    pending.push_back(event.clone());
                }
            }
            cursor.notify.notify_one();
        }
        Ok(())
    }

    /// Marks the queue closed and wakes every pending consumer.
    pub fn close(&self) {
        let mut state = self.inner.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        for cursor in state.cursors.values() {
            cursor.notify.notify_one();
        }
    }

    /// Returns `true` once [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Returns the number of attached cursors.
    pub fn subscriber_count(&self) -> usize {
        self.inner.state.lock().cursors.len()
    }

    /// Attaches a new cursor that sees every event pushed from now on.
    pub fn subscribe(&self) -> EventStream {
        let mut state = self.inner.state.lock();
        let id = state.next_cursor;
        state.next_cursor += 1;
        let cursor = Arc::new(Cursor {
            pending: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        });
        state.cursors.insert(id, Arc::clone(&cursor));
        EventStream {
            id,
            cursor,
            queue: Arc::clone(&self.inner),
        }
    }
}

impl std::fmt::Debug for EventQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("EventQueue")
            .field("owner", &self.inner.owner)
            .field("cursors", &state.cursors.len())
            .field("closed", &state.closed)
            .finish()
    }
}

// =============================================================================
// EventStream
// =============================================================================

/// One consumer's cursor over a plugin's [`EventQueue`].
///
/// Dropping the stream detaches it from the queue.
pub struct EventStream {
    id: u64,
    cursor: Arc<Cursor>,
    queue: Arc<QueueInner>,
}

impl EventStream {
    /// Takes the next pending event without waiting.
    ///
    /// Returns `None` when nothing is pending (whether or not the queue is closed).
    pub fn try_next(&self) -> Option<Event> {
        self.cursor.pending.lock().pop_front()
    }

    /// Waits for the next event.
    ///
    /// Returns `None` once the queue is closed and this cursor is drained.
    /// Cancel-safe: dropping the future never loses an event.
    pub async fn next(&self) -> Option<Event> {
        loop {
            if let Some(event) = self.try_next() {
                return Some(event);
            }
            if self.queue.state.lock().closed {
                return self.try_next();
            }
            self.cursor.notify.notified().await;
        }
    }

    /// Waits for the next event or for `token` to be cancelled.
    pub async fn next_until(&self, token: &CancellationToken) -> Option<Event> {
        tokio::select! {
            biased;
            _ = token.cancelled() => None,
            event = self.next() => event,
        }
    }

    /// Converts the cursor into a [`futures::Stream`].
    pub fn into_stream(self) -> impl Stream<Item = Event> + Send + 'static {
        futures::stream::unfold(self, |stream| async move {
            let event = stream.next().await?;
            Some((event, stream))
        })
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.queue.state.lock().cursors.remove(&self.id);
    }
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream")
            .field("owner", &self.queue.owner)
            .field("cursor", &self.id)
            .field("pending", &self.cursor.pending.lock().len())
            .finish()
    }
}
