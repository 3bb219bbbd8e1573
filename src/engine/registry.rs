//! Handle tables for routing engine callbacks to their owners.
//!
//! Every live stream is given an integer handle. The engine only ever sees
//! the handle; callbacks are routed back by looking it up here. A slot is
//! marked retired before the stream behind it is torn down, so a callback
//! racing the teardown resolves to nothing instead of a stale handler.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use bytes::BytesMut;

use super::{HeaderMap, StreamCallback};
use crate::net_error::NetError;

/// Identifier of a stream inside one engine.
pub type StreamHandle = u64;

struct Slot<T: ?Sized> {
    handler: Arc<T>,
    retired: AtomicBool,
}

/// Slot map from handles to handlers, guarded by a reader/writer lock.
pub struct HandleTable<T: ?Sized> {
    slots: RwLock<HashMap<StreamHandle, Arc<Slot<T>>>>,
    next: AtomicU64,
}

impl<T: ?Sized> Default for HandleTable<T> {
    fn default() -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            next: AtomicU64::new(1),
        }
    }
}

impl<T: ?Sized> HandleTable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, handler: Arc<T>) -> StreamHandle {
        let handle = self.next.fetch_add(1, Ordering::Relaxed);
        let slot = Arc::new(Slot {
            handler,
            retired: AtomicBool::new(false),
        });
        self.slots
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(handle, slot);
        handle
    }

    /// Looks up a handler for callback delivery.
    ///
    /// Missing and retired slots yield `None`. Callbacks that arrive after
    /// teardown land here and are dropped without comment.
    pub fn get(&self, handle: StreamHandle) -> Option<Arc<T>> {
        let slots = self.slots.read().unwrap_or_else(|e| e.into_inner());
        let slot = slots.get(&handle)?;
        if slot.retired.load(Ordering::Acquire) {
            return None;
        }
        Some(slot.handler.clone())
    }

    /// Looks up a handler the caller is required to hold alive.
    ///
    /// # Panics
    ///
    /// Panics if the handle was never registered or has been retired. Both
    /// are bugs in the caller, not races with the engine.
    pub fn live(&self, handle: StreamHandle) -> Arc<T> {
        let slots = self.slots.read().unwrap_or_else(|e| e.into_inner());
        match slots.get(&handle) {
            None => panic!("handle {} is not registered", handle),
            Some(slot) if slot.retired.load(Ordering::Acquire) => {
                panic!("handle {} used after it was retired", handle)
            }
            Some(slot) => slot.handler.clone(),
        }
    }

    /// Marks the slot retired. Returns true if this call retired it.
    pub fn retire(&self, handle: StreamHandle) -> bool {
        let slots = self.slots.read().unwrap_or_else(|e| e.into_inner());
        match slots.get(&handle) {
            Some(slot) => !slot.retired.swap(true, Ordering::AcqRel),
            None => false,
        }
    }

    pub fn remove(&self, handle: StreamHandle) {
        self.slots
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&handle);
    }

    /// Retires and removes the slot, returning the handler if it was live.
    pub fn take(&self, handle: StreamHandle) -> Option<Arc<T>> {
        let handler = self.get(handle);
        if !self.retire(handle) {
            return None;
        }
        self.remove(handle);
        handler
    }

    pub fn len(&self) -> usize {
        self.slots.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Routes engine-side stream events to the registered [`StreamCallback`].
///
/// Terminal events retire the slot before invoking the handler, so each
/// stream sees at most one of `on_succeeded`, `on_failed` or `on_canceled`.
#[derive(Default)]
pub struct StreamDispatcher {
    table: HandleTable<dyn StreamCallback>,
}

impl StreamDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, callback: Arc<dyn StreamCallback>) -> StreamHandle {
        self.table.insert(callback)
    }

    /// Drops the slot without notifying the handler.
    pub fn release(&self, handle: StreamHandle) {
        self.table.take(handle);
    }

    /// See [`HandleTable::live`].
    pub fn expect_live(&self, handle: StreamHandle) -> Arc<dyn StreamCallback> {
        self.table.live(handle)
    }

    pub fn is_live(&self, handle: StreamHandle) -> bool {
        self.table.get(handle).is_some()
    }

    pub fn live_streams(&self) -> usize {
        self.table.len()
    }

    pub fn stream_ready(&self, handle: StreamHandle) {
        if let Some(cb) = self.table.get(handle) {
            cb.on_stream_ready();
        }
    }

    pub fn response_headers_received(&self, handle: StreamHandle, headers: HeaderMap, protocol: &str) {
        if let Some(cb) = self.table.get(handle) {
            cb.on_response_headers_received(headers, protocol);
        }
    }

    pub fn read_completed(&self, handle: StreamHandle, buffer: BytesMut, bytes_read: usize) {
        if let Some(cb) = self.table.get(handle) {
            cb.on_read_completed(buffer, bytes_read);
        }
    }

    pub fn write_completed(&self, handle: StreamHandle) {
        if let Some(cb) = self.table.get(handle) {
            cb.on_write_completed();
        }
    }

    pub fn response_trailers_received(&self, handle: StreamHandle, trailers: HeaderMap) {
        if let Some(cb) = self.table.get(handle) {
            cb.on_response_trailers_received(trailers);
        }
    }

    pub fn succeeded(&self, handle: StreamHandle) {
        if let Some(cb) = self.table.take(handle) {
            cb.on_succeeded();
        }
    }

    pub fn failed(&self, handle: StreamHandle, error: NetError) {
        if let Some(cb) = self.table.take(handle) {
            cb.on_failed(error);
        }
    }

    pub fn canceled(&self, handle: StreamHandle) {
        if let Some(cb) = self.table.take(handle) {
            cb.on_canceled();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingCallback {
        events: AtomicUsize,
        terminals: AtomicUsize,
    }

    impl CountingCallback {
        fn bump(&self) {
            self.events.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl StreamCallback for CountingCallback {
        fn on_stream_ready(&self) {
            self.bump();
        }
        fn on_response_headers_received(&self, _headers: HeaderMap, _protocol: &str) {
            self.bump();
        }
        fn on_read_completed(&self, _buffer: BytesMut, _bytes_read: usize) {
            self.bump();
        }
        fn on_write_completed(&self) {
            self.bump();
        }
        fn on_response_trailers_received(&self, _trailers: HeaderMap) {
            self.bump();
        }
        fn on_succeeded(&self) {
            self.terminals.fetch_add(1, Ordering::SeqCst);
        }
        fn on_failed(&self, _error: NetError) {
            self.terminals.fetch_add(1, Ordering::SeqCst);
        }
        fn on_canceled(&self) {
            self.terminals.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn fire_everything(dispatcher: &StreamDispatcher, handle: StreamHandle) {
        dispatcher.stream_ready(handle);
        dispatcher.response_headers_received(handle, HeaderMap::new(), "h2");
        dispatcher.read_completed(handle, BytesMut::new(), 0);
        dispatcher.write_completed(handle);
        dispatcher.response_trailers_received(handle, HeaderMap::new());
        dispatcher.succeeded(handle);
        dispatcher.failed(handle, NetError::CONNECTION_RESET);
        dispatcher.canceled(handle);
    }

    #[test]
    fn test_handles_are_unique() {
        let table: HandleTable<str> = HandleTable::new();
        let a = table.insert(Arc::from("a"));
        let b = table.insert(Arc::from("b"));
        assert_ne!(a, b);
        assert_eq!(&*table.get(a).unwrap(), "a");
        assert_eq!(&*table.get(b).unwrap(), "b");
    }

    #[test]
    fn test_retired_lookup_is_none() {
        let table: HandleTable<str> = HandleTable::new();
        let handle = table.insert(Arc::from("x"));
        assert!(table.retire(handle));
        assert!(!table.retire(handle));
        assert!(table.get(handle).is_none());
        assert_eq!(table.len(), 1);
        table.remove(handle);
        assert!(table.is_empty());
    }

    #[test]
    #[should_panic(expected = "not registered")]
    fn test_live_panics_on_unknown_handle() {
        let table: HandleTable<str> = HandleTable::new();
        table.live(42);
    }

    #[test]
    #[should_panic(expected = "retired")]
    fn test_live_panics_on_retired_handle() {
        let table: HandleTable<str> = HandleTable::new();
        let handle = table.insert(Arc::from("x"));
        table.retire(handle);
        table.live(handle);
    }

    #[test]
    fn test_single_terminal_delivery() {
        let dispatcher = StreamDispatcher::new();
        let callback = Arc::new(CountingCallback::default());
        let handle = dispatcher.register(callback.clone());

        dispatcher.stream_ready(handle);
        assert_eq!(callback.events.load(Ordering::SeqCst), 1);

        dispatcher.failed(handle, NetError::CONNECTION_RESET);
        dispatcher.canceled(handle);
        assert_eq!(callback.terminals.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.live_streams(), 0);
    }

    #[test]
    fn test_post_terminal_callbacks_are_noops() {
        let dispatcher = StreamDispatcher::new();
        let callback = Arc::new(CountingCallback::default());
        let handle = dispatcher.register(callback.clone());
        dispatcher.succeeded(handle);
        assert_eq!(callback.terminals.load(Ordering::SeqCst), 1);

        fire_everything(&dispatcher, handle);
        fire_everything(&dispatcher, handle);
        assert_eq!(callback.events.load(Ordering::SeqCst), 0);
        assert_eq!(callback.terminals.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_release_suppresses_everything() {
        let dispatcher = StreamDispatcher::new();
        let callback = Arc::new(CountingCallback::default());
        let handle = dispatcher.register(callback.clone());
        dispatcher.release(handle);
        assert!(!dispatcher.is_live(handle));
        fire_everything(&dispatcher, handle);
        assert_eq!(callback.events.load(Ordering::SeqCst), 0);
        assert_eq!(callback.terminals.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_independent_dispatchers() {
        let first = StreamDispatcher::new();
        let second = StreamDispatcher::new();
        let callback = Arc::new(CountingCallback::default());
        let handle = first.register(callback.clone());

        second.stream_ready(handle);
        second.succeeded(handle);
        assert_eq!(callback.events.load(Ordering::SeqCst), 0);
        assert_eq!(callback.terminals.load(Ordering::SeqCst), 0);
        assert!(first.is_live(handle));
    }
}
