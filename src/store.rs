//! Published stores for the latest meter telegram and inverter registers
//!
//! Each store is a double buffer: the single writer fills a buffer it owns
//! exclusively, then publishes it as one `Arc` reference swap through a
//! `watch` channel. Readers clone the `Arc` and therefore always observe a
//! complete buffer, either the one before or the one after a swap. The
//! superseded buffer is handed back to the writer for reuse once no reader
//! holds it anymore.

use chrono::{DateTime, Utc};
use std::borrow::Cow;
use std::sync::Arc;
use tokio::sync::watch;

/// One complete P1 telegram, exactly as the meter sent it, and the
/// wall-clock time it was captured
#[derive(Debug, Clone, PartialEq)]
pub struct Telegram {
    pub bytes: Vec<u8>,
    pub captured_at: DateTime<Utc>,
}

impl Telegram {
    /// Take ownership of the staging bytes without copying them
    pub fn from_bytes(bytes: Vec<u8>, captured_at: DateTime<Utc>) -> Self {
        Self { bytes, captured_at }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Telegram as text for field lookups; invalid UTF-8 is replaced
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.bytes)
    }

    /// Give the backing buffer back for reuse as a staging buffer
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

/// One complete inverter register block (host byte order) and its capture time
#[derive(Debug, Clone, PartialEq)]
pub struct RegisterBlock {
    pub registers: Vec<u16>,
    pub captured_at: DateTime<Utc>,
}

/// Single-writer, many-reader published value
#[derive(Debug)]
pub struct Published<T> {
    tx: watch::Sender<Option<Arc<T>>>,
}

pub type TelegramStore = Published<Telegram>;
pub type RegisterStore = Published<RegisterBlock>;

impl<T> Default for Published<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Published<T> {
    /// Create an empty store
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    /// Latest published value, if any
    pub fn latest(&self) -> Option<Arc<T>> {
        self.tx.borrow().clone()
    }

    /// Whether anything has been published yet
    pub fn is_empty(&self) -> bool {
        self.tx.borrow().is_none()
    }

    /// Publish a new value and return the previous one when it is no longer
    /// referenced by any reader, so its buffer can be recycled
    pub fn publish(&self, value: T) -> Option<T> {
        let previous = self.tx.send_replace(Some(Arc::new(value)));
        previous.and_then(|prev| Arc::try_unwrap(prev).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn telegram(text: &str) -> Telegram {
        Telegram::from_bytes(text.as_bytes().to_vec(), Utc::now())
    }

    #[test]
    fn empty_until_first_publish() {
        let store = TelegramStore::new();
        assert!(store.is_empty());
        assert!(store.latest().is_none());
        assert!(store.publish(telegram("first")).is_none());
        assert_eq!(store.latest().unwrap().as_bytes(), b"first");
    }

    #[test]
    fn publish_recycles_unreferenced_buffer() {
        let store = TelegramStore::new();
        store.publish(telegram("one"));
        let recycled = store.publish(telegram("two")).unwrap();
        assert_eq!(recycled.into_bytes(), b"one".to_vec());
    }

    #[test]
    fn publish_keeps_buffer_held_by_reader() {
        let store = TelegramStore::new();
        store.publish(telegram("one"));
        let reader_copy = store.latest().unwrap();
        assert!(store.publish(telegram("two")).is_none());
        // the reader still sees the complete old telegram
        assert_eq!(reader_copy.as_bytes(), b"one");
        assert_eq!(store.latest().unwrap().as_bytes(), b"two");
    }

    #[test]
    fn invalid_utf8_is_kept_raw_and_replaced_in_text() {
        let t = Telegram::from_bytes(vec![b'a', 0xFF, b'b'], Utc::now());
        assert_eq!(t.as_bytes(), &[b'a', 0xFF, b'b']);
        assert_eq!(t.text(), "a\u{FFFD}b");
        assert_eq!(t.into_bytes().len(), 3);
    }
}
