//! In-memory fan-out of committed mutations
//!
//! The [`WatchBuffer`] is a fixed-capacity ring of recent events. Every
//! [`Watcher`] reads the ring through its own cursor and filters it with the
//! [`Watch`] it was created with. A watcher only sees events published after it
//! subscribed, preceded by a single [`EventKind::Init`] marker once the buffer
//! is initialized.
//!
//! A watcher that falls more than `capacity` events behind is terminated with
//! [`Error::WatcherOverflow`]; [`WatchBuffer::reset`] and [`WatchBuffer::clear`]
//! terminate every watcher with [`Error::WatcherClosed`]. In both cases the
//! consumer has to re-read its state and subscribe again.
//!
//! # Example
//!
//! ```rust
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> tessera_core::Result<()> {
//! use tessera_core::{Event, EventKind, Item, Watch, WatchBuffer};
//!
//! let buf = WatchBuffer::new(16);
//! let mut watcher = buf.new_watcher(Watch::all("nodes").with_prefix("/nodes/"))?;
//!
//! buf.set_init();
//! buf.emit([Event::put(Item::new("/roles/a", "x")), Event::put(Item::new("/nodes/a", "y"))]);
//!
//! assert_eq!(watcher.recv().await?.kind, EventKind::Init);
//! assert_eq!(&watcher.recv().await?.item.key[..], b"/nodes/a");
//! # Ok(())
//! # }
//! ```

use parking_lot::Mutex;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::item::{Event, EventKind, Watch, DEFAULT_BUFFER_CAPACITY};

/// Fixed-capacity event ring with independent watcher cursors
pub struct WatchBuffer {
    capacity: usize,
    state: Mutex<BufferState>,
}

struct BufferState {
    sender: broadcast::Sender<Event>,
    /// Cancelled when the current set of watchers is closed
    generation: CancellationToken,
    initialized: bool,
    closed: bool,
}

impl WatchBuffer {
    /// Create a buffer holding up to `capacity` events per watcher cursor
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            capacity,
            state: Mutex::new(BufferState {
                sender,
                generation: CancellationToken::new(),
                initialized: false,
                closed: false,
            }),
        }
    }

    /// Buffer capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether the buffer has been initialized since the last reset
    pub fn is_initialized(&self) -> bool {
        self.state.lock().initialized
    }

    /// Number of open watchers
    pub fn watcher_count(&self) -> usize {
        self.state.lock().sender.receiver_count()
    }

    /// Mark the buffer as synced; waiting watchers receive the init marker
    pub fn set_init(&self) {
        let mut state = self.state.lock();
        if state.closed || state.initialized {
            return;
        }
        state.initialized = true;
        let _ = state.sender.send(Event::init());
        debug!("Watch buffer initialized");
    }

    /// Publish events in order
    ///
    /// Returns `false` and drops the events when the buffer is closed or not
    /// initialized.
    pub fn emit(&self, events: impl IntoIterator<Item = Event>) -> bool {
        let state = self.state.lock();
        if state.closed || !state.initialized {
            return false;
        }
        for event in events {
            // no receivers is fine, the event is simply not observed
            let _ = state.sender.send(event);
        }
        true
    }

    /// Close every watcher and drop back to the uninitialized state
    pub fn reset(&self) {
        let mut state = self.state.lock();
        self.close_generation(&mut state);
        state.initialized = false;
    }

    /// Close every watcher, keeping the init state
    pub fn clear(&self) {
        let mut state = self.state.lock();
        self.close_generation(&mut state);
    }

    /// Close every watcher and refuse new ones
    pub fn close(&self) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        state.initialized = false;
        self.close_generation(&mut state);
    }

    /// Subscribe with `watch` as the filter
    pub fn new_watcher(&self, watch: Watch) -> Result<Watcher> {
        let state = self.state.lock();
        if state.closed {
            return Err(Error::closed("watch buffer is closed"));
        }
        debug!(watcher = %watch.name, "New watcher");
        Ok(Watcher {
            rx: state.sender.subscribe(),
            done: state.generation.clone(),
            pending_init: state.initialized,
            terminated: false,
            watch,
        })
    }

    fn close_generation(&self, state: &mut BufferState) {
        let watchers = state.sender.receiver_count();
        state.generation.cancel();
        state.generation = CancellationToken::new();
        state.sender = broadcast::channel(self.capacity).0;
        if watchers > 0 {
            debug!(watchers, "Closed watchers");
        }
    }
}

impl Default for WatchBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_CAPACITY)
    }
}

impl std::fmt::Debug for WatchBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("WatchBuffer")
            .field("capacity", &self.capacity)
            .field("initialized", &state.initialized)
            .field("closed", &state.closed)
            .field("watchers", &state.sender.receiver_count())
            .finish()
    }
}

/// A subscription to a [`WatchBuffer`]
pub struct Watcher {
    watch: Watch,
    rx: broadcast::Receiver<Event>,
    done: CancellationToken,
    pending_init: bool,
    terminated: bool,
}

impl Watcher {
    /// Watcher name
    pub fn name(&self) -> &str {
        &self.watch.name
    }

    /// Filter this watcher was created with
    pub fn watch(&self) -> &Watch {
        &self.watch
    }

    /// Whether the watcher can no longer deliver events
    pub fn is_closed(&self) -> bool {
        self.terminated || self.done.is_cancelled()
    }

    /// Wait until the buffer closes this watcher
    pub async fn done(&self) {
        self.done.cancelled().await
    }

    /// Receive the next matching event
    ///
    /// Once this returns an error every later call fails as well.
    pub async fn recv(&mut self) -> Result<Event> {
        if self.is_closed() {
            return Err(self.terminate());
        }
        if std::mem::take(&mut self.pending_init) {
            return Ok(Event::init());
        }
        loop {
            let received = tokio::select! {
                biased;
                _ = self.done.cancelled() => return Err(self.terminate()),
                r = self.rx.recv() => r,
            };
            match received {
                Ok(event) => {
                    if self.accepts(&event) {
                        return Ok(event);
                    }
                }
                Err(RecvError::Lagged(skipped)) => return Err(self.overflow(skipped)),
                Err(RecvError::Closed) => return Err(self.terminate()),
            }
        }
    }

    /// Receive the next matching event if one is already buffered
    pub fn try_recv(&mut self) -> Result<Option<Event>> {
        if self.is_closed() {
            return Err(self.terminate());
        }
        if std::mem::take(&mut self.pending_init) {
            return Ok(Some(Event::init()));
        }
        loop {
            match self.rx.try_recv() {
                Ok(event) => {
                    if self.accepts(&event) {
                        return Ok(Some(event));
                    }
                }
                Err(TryRecvError::Empty) => return Ok(None),
                Err(TryRecvError::Lagged(skipped)) => return Err(self.overflow(skipped)),
                Err(TryRecvError::Closed) => return Err(self.terminate()),
            }
        }
    }

    fn accepts(&self, event: &Event) -> bool {
        event.kind == EventKind::Init || self.watch.matches(&event.item.key)
    }

    fn overflow(&mut self, skipped: u64) -> Error {
        self.terminated = true;
        warn!(watcher = %self.watch.name, skipped, "Watcher fell behind the buffer, closing");
        Error::WatcherOverflow {
            name: self.watch.name.clone(),
            skipped,
        }
    }

    fn terminate(&mut self) -> Error {
        self.terminated = true;
        Error::WatcherClosed {
            name: self.watch.name.clone(),
        }
    }
}

impl std::fmt::Debug for Watcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watcher")
            .field("watch", &self.watch)
            .field("closed", &self.is_closed())
            .finish()
    }
}
