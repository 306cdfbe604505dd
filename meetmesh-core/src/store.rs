//! Realtime store adapter
//!
//! Typed access to the hosted hierarchical key-value store that carries every
//! meeting record and all signaling traffic. The store is modelled as a JSON
//! tree addressed by [`StorePath`]. Subscriptions deliver the full value at a
//! path, first when subscribing and then after every change that affects it.
//!
//! [`MemoryStore`] is an in-process implementation with the same semantics,
//! used by tests and the command-line demo.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;

use crate::identity::Uid;
use crate::signaling::SignalKind;
use crate::types::MeetingId;

/// Store errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Store unreachable
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// Rejected by the store's access rules
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Path cannot be used for this operation
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Value could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// Slash-separated location in the store
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct StorePath(Vec<String>);

impl StorePath {
    /// The root of the store
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// Parse `a/b/c`; empty segments are ignored
    pub fn parse(s: &str) -> Self {
        Self(
            s.split('/')
                .filter(|seg| !seg.is_empty())
                .map(str::to_string)
                .collect(),
        )
    }

    /// Append one segment
    pub fn child(&self, segment: impl fmt::Display) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment.to_string());
        Self(segments)
    }

    /// Path segments
    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// Last segment, `None` for the root
    pub fn key(&self) -> Option<&str> {
        self.0.last().map(String::as_str)
    }

    /// Parent path, `None` for the root
    pub fn parent(&self) -> Option<Self> {
        if self.0.is_empty() {
            None
        } else {
            Some(Self(self.0[..self.0.len() - 1].to_vec()))
        }
    }

    /// Whether this is the root
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether `self` equals `other` or is one of its ancestors
    pub fn contains(&self, other: &StorePath) -> bool {
        other.0.len() >= self.0.len() && other.0[..self.0.len()] == self.0[..]
    }

    /// Whether a change at `other` can affect the value at `self`
    pub fn overlaps(&self, other: &StorePath) -> bool {
        self.contains(other) || other.contains(self)
    }
}

impl fmt::Display for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("/"))
    }
}

/// Value observed at a subscribed path; `None` when nothing is stored there
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot(pub Option<Value>);

impl Snapshot {
    /// Stored value, if any
    pub fn value(&self) -> Option<&Value> {
        self.0.as_ref()
    }

    /// Whether anything is stored at the path
    pub fn exists(&self) -> bool {
        self.0.is_some()
    }

    /// Children of an object value, in key order
    pub fn children(&self) -> Vec<(&str, &Value)> {
        match &self.0 {
            Some(Value::Object(map)) => map.iter().map(|(k, v)| (k.as_str(), v)).collect(),
            _ => Vec::new(),
        }
    }
}

type CancelFn = Box<dyn FnOnce() + Send>;

/// Live subscription handle
///
/// Snapshots arrive in the order the store applied the changes. Dropping the
/// handle unsubscribes; [`Subscription::unsubscribe`] does it explicitly.
pub struct Subscription {
    path: StorePath,
    rx: mpsc::UnboundedReceiver<Snapshot>,
    cancel: Option<CancelFn>,
}

impl Subscription {
    /// Build a subscription from a snapshot channel and its cancel hook
    pub fn new(
        path: StorePath,
        rx: mpsc::UnboundedReceiver<Snapshot>,
        cancel: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            path,
            rx,
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Subscribed path
    pub fn path(&self) -> &StorePath {
        &self.path
    }

    /// Wait for the next snapshot; `None` once the subscription is closed
    pub async fn next(&mut self) -> Option<Snapshot> {
        self.rx.recv().await
    }

    /// Stop receiving updates
    pub fn unsubscribe(mut self) {
        self.cancel_now();
    }

    fn cancel_now(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
            tracing::trace!(path = %self.path, "Unsubscribed");
        }
        self.rx.close();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel_now();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("path", &self.path)
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// Hierarchical realtime key-value store
///
/// No ordering is assumed between writes issued by different clients;
/// sequential operations from one caller are applied in order.
#[async_trait]
pub trait RealtimeStore: Send + Sync {
    /// Replace the value at `path`; writing `null` removes it
    async fn write(&self, path: &StorePath, value: Value) -> Result<(), StoreError>;

    /// Merge `fields` into the object at `path`
    async fn update(&self, path: &StorePath, fields: Map<String, Value>) -> Result<(), StoreError>;

    /// Read the current value once
    async fn read_once(&self, path: &StorePath) -> Result<Option<Value>, StoreError>;

    /// Delete the value at `path` and everything below it
    async fn remove(&self, path: &StorePath) -> Result<(), StoreError>;

    /// Subscribe to the value at `path`
    async fn subscribe(&self, path: &StorePath) -> Result<Subscription, StoreError>;

    /// Generate a unique child key; keys generated later sort after earlier ones
    fn push_key(&self) -> String;
}

/// Location of every record belonging to one meeting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeetingPaths {
    root: StorePath,
}

impl MeetingPaths {
    /// Paths for `meeting_id` under `meetings/`
    pub fn new(meeting_id: &MeetingId) -> Self {
        Self {
            root: StorePath::root().child("meetings").child(meeting_id),
        }
    }

    /// Root of the meeting namespace; removing it deletes the whole meeting
    pub fn root(&self) -> &StorePath {
        &self.root
    }

    /// The meeting record
    pub fn meeting(&self) -> StorePath {
        self.root.child("meeting")
    }

    /// All participants
    pub fn participants(&self) -> StorePath {
        self.root.child("participants")
    }

    /// One participant
    pub fn participant(&self, uid: &Uid) -> StorePath {
        self.participants().child(uid)
    }

    /// All waiting-room entries
    pub fn waiting_room(&self) -> StorePath {
        self.root.child("waitingRoom")
    }

    /// One waiting-room entry
    pub fn waiting_entry(&self, uid: &Uid) -> StorePath {
        self.waiting_room().child(uid)
    }

    /// All chat messages
    pub fn chat_messages(&self) -> StorePath {
        self.root.child("chatMessages")
    }

    /// Signaling mailbox of `to`
    pub fn mailbox(&self, to: &Uid) -> StorePath {
        self.root.child("signaling").child(to)
    }

    /// Slot holding envelopes of `kind` from `from` in the mailbox of `to`
    pub fn mailbox_slot(&self, to: &Uid, kind: SignalKind, from: &Uid) -> StorePath {
        self.mailbox(to).child(kind.segment()).child(from)
    }
}

struct Subscriber {
    path: StorePath,
    tx: mpsc::UnboundedSender<Snapshot>,
    last: Option<Value>,
}

#[derive(Default)]
struct MemoryInner {
    root: Map<String, Value>,
    subscribers: HashMap<u64, Subscriber>,
    next_subscriber: u64,
    push_counter: u64,
    offline: bool,
}

impl MemoryInner {
    fn get(&self, path: &StorePath) -> Option<Value> {
        let mut segments = path.segments().iter();
        let first = match segments.next() {
            Some(first) => first,
            None if self.root.is_empty() => return None,
            None => return Some(Value::Object(self.root.clone())),
        };
        let mut node = self.root.get(first)?;
        for seg in segments {
            node = node.as_object()?.get(seg)?;
        }
        Some(node.clone())
    }

    fn set(&mut self, path: &StorePath, value: Value) {
        let Some((last, parents)) = path.segments().split_last() else {
            return;
        };
        let Some(value) = normalize(value) else {
            remove_at(&mut self.root, path.segments());
            return;
        };
        let mut node = &mut self.root;
        for seg in parents {
            let entry = node
                .entry(seg.clone())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            node = match entry {
                Value::Object(map) => map,
                _ => return,
            };
        }
        node.insert(last.clone(), value);
    }

    fn notify(&mut self, changed: &StorePath) {
        let mut closed = Vec::new();
        let related: Vec<u64> = self
            .subscribers
            .iter()
            .filter(|(_, s)| s.path.overlaps(changed))
            .map(|(id, _)| *id)
            .collect();
        for id in related {
            let Some(path) = self.subscribers.get(&id).map(|s| s.path.clone()) else {
                continue;
            };
            let current = self.get(&path);
            if let Some(sub) = self.subscribers.get_mut(&id) {
                if sub.last == current {
                    continue;
                }
                sub.last = current.clone();
                if sub.tx.send(Snapshot(current)).is_err() {
                    closed.push(id);
                }
            }
        }
        for id in closed {
            self.subscribers.remove(&id);
        }
    }

    fn check_online(&self) -> Result<(), StoreError> {
        if self.offline {
            Err(StoreError::Unavailable("store is offline".to_string()))
        } else {
            Ok(())
        }
    }
}

/// Drop nulls and empty objects the way the hosted store does
fn normalize(value: Value) -> Option<Value> {
    match value {
        Value::Null => None,
        Value::Object(map) => {
            let cleaned: Map<String, Value> = map
                .into_iter()
                .filter_map(|(k, v)| normalize(v).map(|v| (k, v)))
                .collect();
            if cleaned.is_empty() {
                None
            } else {
                Some(Value::Object(cleaned))
            }
        }
        other => Some(other),
    }
}

/// Remove `segments` below `node`, pruning parents left empty
fn remove_at(node: &mut Map<String, Value>, segments: &[String]) {
    match segments {
        [] => {}
        [last] => {
            node.remove(last);
        }
        [first, rest @ ..] => {
            let now_empty = match node.get_mut(first) {
                Some(Value::Object(child)) => {
                    remove_at(child, rest);
                    child.is_empty()
                }
                _ => false,
            };
            if now_empty {
                node.remove(first);
            }
        }
    }
}

/// In-process [`RealtimeStore`]
///
/// Clones share the same tree, so several simulated clients can talk through
/// one instance.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail with [`StoreError::Unavailable`]
    pub fn set_offline(&self, offline: bool) {
        self.inner.lock().offline = offline;
    }

    /// Number of live subscriptions
    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }

    /// Synchronous read for tests and diagnostics
    pub fn get(&self, path: &StorePath) -> Option<Value> {
        self.inner.lock().get(path)
    }
}

impl fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStore")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

#[async_trait]
impl RealtimeStore for MemoryStore {
    async fn write(&self, path: &StorePath, value: Value) -> Result<(), StoreError> {
        if path.is_root() {
            return Err(StoreError::InvalidPath("cannot write the root".to_string()));
        }
        let mut inner = self.inner.lock();
        inner.check_online()?;
        inner.set(path, value);
        inner.notify(path);
        tracing::trace!(%path, "Store write");
        Ok(())
    }

    async fn update(&self, path: &StorePath, fields: Map<String, Value>) -> Result<(), StoreError> {
        if path.is_root() {
            return Err(StoreError::InvalidPath("cannot update the root".to_string()));
        }
        let mut inner = self.inner.lock();
        inner.check_online()?;
        for (key, value) in fields {
            inner.set(&path.child(key), value);
        }
        inner.notify(path);
        tracing::trace!(%path, "Store update");
        Ok(())
    }

    async fn read_once(&self, path: &StorePath) -> Result<Option<Value>, StoreError> {
        let inner = self.inner.lock();
        inner.check_online()?;
        Ok(inner.get(path))
    }

    async fn remove(&self, path: &StorePath) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner.check_online()?;
        if path.is_root() {
            inner.root.clear();
        } else {
            remove_at(&mut inner.root, path.segments());
        }
        inner.notify(path);
        tracing::trace!(%path, "Store remove");
        Ok(())
    }

    async fn subscribe(&self, path: &StorePath) -> Result<Subscription, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut inner = self.inner.lock();
            inner.check_online()?;
            let current = inner.get(path);
            // Receiver is alive, so the initial send cannot fail
            let _ = tx.send(Snapshot(current.clone()));
            let id = inner.next_subscriber;
            inner.next_subscriber += 1;
            inner.subscribers.insert(
                id,
                Subscriber {
                    path: path.clone(),
                    tx,
                    last: current,
                },
            );
            id
        };

        let weak: Weak<Mutex<MemoryInner>> = Arc::downgrade(&self.inner);
        Ok(Subscription::new(path.clone(), rx, move || {
            if let Some(inner) = weak.upgrade() {
                inner.lock().subscribers.remove(&id);
            }
        }))
    }

    fn push_key(&self) -> String {
        let mut inner = self.inner.lock();
        inner.push_counter += 1;
        format!(
            "{:013}-{:08}",
            chrono::Utc::now().timestamp_millis().max(0),
            inner.push_counter
        )
    }
}
