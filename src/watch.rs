//! Watch event streams.
//!
//! A watch is a lazy, potentially infinite stream of [`Event`]s.  A stream
//! item is either an event or the single error that terminates the stream;
//! consumers stop reading after the first `Err`.  Within one stream events
//! arrive in non-decreasing resource-version order.

use std::pin::Pin;

use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::registry::RegistryError;

/// What happened to the object carried by an [`Event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventType {
    Added,
    Modified,
    Deleted,
    Error,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Added => "ADDED",
            EventType::Modified => "MODIFIED",
            EventType::Deleted => "DELETED",
            EventType::Error => "ERROR",
        }
    }
}

/// One change notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event<T> {
    #[serde(rename = "type")]
    pub kind: EventType,
    pub object: T,
}

impl<T> Event<T> {
    pub fn new(kind: EventType, object: T) -> Self {
        Self { kind, object }
    }
}

/// A boxed, sendable watch stream.
pub type WatchStream<T> = Pin<Box<dyn Stream<Item = Result<Event<T>, RegistryError>> + Send>>;

/// A stream that never yields and ends immediately.
pub fn empty<T: Send + 'static>() -> WatchStream<T> {
    stream::empty().boxed()
}

/// A finite stream over already-known events.
pub fn from_events<T: Send + 'static>(events: Vec<Event<T>>) -> WatchStream<T> {
    stream::iter(events.into_iter().map(Ok)).boxed()
}
