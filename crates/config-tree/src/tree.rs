//! The configuration tree
//!
//! All mutations funnel through the tree's locks and all notifications
//! through a single FIFO publish queue, so watchers observe one global total
//! order of changes. Writes carry timestamps; a write older than the node it
//! addresses is discarded (last-writer-wins).

use crate::error::{Error, Result};
use crate::event::{WatchEvent, WatchEventKind};
use crate::node::Node;
use crate::path::TopicPath;
use crate::tlog::{LogOp, LogRecord, TransactionLog};
use serde_json::Value;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use tracing::{debug, warn};

/// Handler invoked on the publish-queue task for each event
pub type WatchHandler = Arc<dyn Fn(&WatchEvent) + Send + Sync>;

/// Identifier of a registered watcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchId(u64);

/// How [`ConfigTree::merge_value`] treats children absent from the source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeBehavior {
    /// Delete children that the source does not mention
    Replace,
    /// Keep children that the source does not mention
    Merge,
}

struct Watcher {
    id: WatchId,
    path: TopicPath,
    handler: WatchHandler,
}

struct Notification {
    /// Watchers of this path receive the event
    target: TopicPath,
    /// Restrict delivery to a single watcher (used for `Initialized`)
    only: Option<WatchId>,
    event: WatchEvent,
}

enum QueueItem {
    Event(Notification),
    Flush(async_channel::Sender<()>),
}

struct TreeInner {
    root: RwLock<Node>,
    watchers: Mutex<Vec<Watcher>>,
    queue_tx: async_channel::Sender<QueueItem>,
    next_watch_id: AtomicU64,
    log: Mutex<Option<TransactionLog>>,
}

/// Hierarchical timestamped observable key/value store
///
/// Cloning is cheap; clones share the same tree and publish queue.
#[derive(Clone)]
pub struct ConfigTree {
    inner: Arc<TreeInner>,
}

impl Default for ConfigTree {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigTree {
    /// Create an empty tree and start its publish-queue task
    pub fn new() -> Self {
        let (queue_tx, queue_rx) = async_channel::unbounded();
        let inner = Arc::new(TreeInner {
            root: RwLock::new(Node::topics(0)),
            watchers: Mutex::new(Vec::new()),
            queue_tx,
            next_watch_id: AtomicU64::new(1),
            log: Mutex::new(None),
        });

        let weak = Arc::downgrade(&inner);
        smol::spawn(pump(queue_rx, weak)).detach();

        Self { inner }
    }

    /// Write a leaf value
    ///
    /// Returns `true` when the write was applied. Writes with a timestamp
    /// strictly older than the node's are discarded; writes of the node's
    /// current value absorb the timestamp without notifying.
    pub fn write(&self, path: &TopicPath, value: Value, ts: u64) -> Result<bool> {
        if path.is_root() {
            return Err(Error::InvalidPath {
                path: path.to_string(),
            });
        }

        let mut pending = Vec::new();
        let applied = {
            let mut root = self.inner.root.write().unwrap();
            let effect = write_at(&mut root, path, &value, ts, &mut pending)?;
            match effect {
                WriteEffect::Applied => {
                    self.log_record(LogRecord {
                        op: LogOp::Write,
                        path: path.to_string(),
                        value: Some(value),
                        ts,
                    })?;
                    true
                }
                WriteEffect::Discarded | WriteEffect::Absorbed => false,
            }
        };

        self.enqueue_all(pending);
        Ok(applied)
    }

    /// Remove a node and its subtree
    ///
    /// Returns `true` when a node was removed. Watchers of every removed node
    /// receive `Removed`; watchers of the parent receive `ChildRemoved`.
    pub fn remove(&self, path: &TopicPath, ts: u64) -> Result<bool> {
        if path.is_root() {
            return Err(Error::InvalidPath {
                path: path.to_string(),
            });
        }

        let mut pending = Vec::new();
        let removed = {
            let mut root = self.inner.root.write().unwrap();
            let removed = remove_at(&mut root, path, ts, &mut pending);
            if removed {
                self.log_record(LogRecord {
                    op: LogOp::Remove,
                    path: path.to_string(),
                    value: None,
                    ts,
                })?;
            }
            removed
        };

        self.enqueue_all(pending);
        Ok(removed)
    }

    /// Read a node as a plain value (copy-on-read snapshot)
    ///
    /// Leaves yield their value, interior nodes an object; absent paths yield
    /// `None`.
    pub fn read(&self, path: &TopicPath) -> Option<Value> {
        let root = self.inner.root.read().unwrap();
        root.get(path.segments()).map(Node::to_value)
    }

    /// Timestamp of a node's last change
    pub fn modified_at(&self, path: &TopicPath) -> Option<u64> {
        let root = self.inner.root.read().unwrap();
        root.get(path.segments()).map(Node::modified_at)
    }

    /// Register a watcher on a path
    ///
    /// The handler runs on the publish-queue task: it receives `Initialized`
    /// once with the node's current value (or `None` when the node does not
    /// exist yet), then every subsequent event for the path. Handlers must
    /// not block; a panicking handler is logged and never stops the queue.
    pub fn subscribe<F>(&self, path: TopicPath, handler: F) -> WatchId
    where
        F: Fn(&WatchEvent) + Send + Sync + 'static,
    {
        let id = WatchId(self.inner.next_watch_id.fetch_add(1, Ordering::Relaxed));

        // Holding the root lock orders Initialized before any later write.
        let root = self.inner.root.read().unwrap();
        let value = root.get(path.segments()).map(Node::to_value);

        self.inner.watchers.lock().unwrap().push(Watcher {
            id,
            path: path.clone(),
            handler: Arc::new(handler),
        });

        self.enqueue(Notification {
            target: path.clone(),
            only: Some(id),
            event: WatchEvent {
                path,
                kind: WatchEventKind::Initialized,
                value,
            },
        });
        drop(root);
        id
    }

    /// Remove a watcher; returns `true` when it existed
    pub fn unsubscribe(&self, id: WatchId) -> bool {
        let mut watchers = self.inner.watchers.lock().unwrap();
        let before = watchers.len();
        watchers.retain(|w| w.id != id);
        watchers.len() != before
    }

    /// Structural copy of the whole tree
    pub fn snapshot(&self) -> Value {
        let root = self.inner.root.read().unwrap();
        root.to_value()
    }

    /// Recursively merge a plain value into the tree at `base`
    ///
    /// Objects become interior nodes, everything else leaves. With
    /// [`MergeBehavior::Replace`] children absent from `other` are deleted;
    /// with [`MergeBehavior::Merge`] they are kept. The per-leaf timestamp
    /// rule of [`ConfigTree::write`] applies throughout.
    pub fn merge_value(
        &self,
        base: &TopicPath,
        other: &Value,
        behavior: MergeBehavior,
        ts: u64,
    ) -> Result<()> {
        match other {
            Value::Object(map) => {
                // A leaf in the way of an interior merge is replaced.
                if self
                    .node_is_leaf(base)
                    .unwrap_or(false)
                {
                    self.remove(base, ts)?;
                }

                if behavior == MergeBehavior::Replace {
                    if let Some(Value::Object(existing)) = self.read(base) {
                        for name in existing.keys() {
                            if !map.contains_key(name) {
                                self.remove(&base.child(name.clone()), ts)?;
                            }
                        }
                    }
                }

                if map.is_empty() {
                    // An empty mapping still declares the node.
                    self.ensure_topics(base, ts)?;
                }
                for (name, child) in map {
                    self.merge_value(&base.child(name.clone()), child, behavior, ts)?;
                }
                Ok(())
            }
            _ => {
                if self.node_is_leaf(base) == Some(false) {
                    self.remove(base, ts)?;
                }
                self.write(base, other.clone(), ts)?;
                Ok(())
            }
        }
    }

    /// Create an interior node (and its ancestors) without writing a value
    pub fn ensure_topics(&self, path: &TopicPath, ts: u64) -> Result<()> {
        if path.is_root() {
            return Ok(());
        }
        let mut pending = Vec::new();
        {
            let mut root = self.inner.root.write().unwrap();
            if ensure_at(&mut root, path, ts, &mut pending)? {
                self.log_record(LogRecord {
                    op: LogOp::Write,
                    path: path.to_string(),
                    value: Some(Value::Object(Default::default())),
                    ts,
                })?;
            }
        }
        self.enqueue_all(pending);
        Ok(())
    }

    /// Re-apply logged records, bypassing the transaction log
    pub fn replay(&self, records: &[LogRecord]) -> Result<()> {
        for record in records {
            let path = TopicPath::parse(&record.path)?;
            match record.op {
                LogOp::Write => {
                    let value = record.value.clone().unwrap_or(Value::Null);
                    // Object-valued records describe subtrees, not leaves.
                    if value.is_object() {
                        self.merge_value(&path, &value, MergeBehavior::Merge, record.ts)?;
                        continue;
                    }
                    let mut pending = Vec::new();
                    let mut root = self.inner.root.write().unwrap();
                    write_at(&mut root, &path, &value, record.ts, &mut pending)?;
                    drop(root);
                    self.enqueue_all(pending);
                }
                LogOp::Remove => {
                    let mut pending = Vec::new();
                    let mut root = self.inner.root.write().unwrap();
                    remove_at(&mut root, &path, record.ts, &mut pending);
                    drop(root);
                    self.enqueue_all(pending);
                }
            }
        }
        Ok(())
    }

    /// Attach a transaction log; every later committed mutation is appended
    pub fn attach_log(&self, log: TransactionLog) {
        *self.inner.log.lock().unwrap() = Some(log);
    }

    /// Detach the transaction log, releasing its file handle
    pub fn detach_log(&self) {
        *self.inner.log.lock().unwrap() = None;
    }

    /// Truncate the attached transaction log, if any
    pub fn truncate_log(&self) -> Result<()> {
        if let Some(log) = self.inner.log.lock().unwrap().as_mut() {
            log.truncate()?;
        }
        Ok(())
    }

    /// Wait until every notification enqueued so far has been dispatched
    pub async fn settle(&self) {
        let (tx, rx) = async_channel::bounded(1);
        if self.inner.queue_tx.try_send(QueueItem::Flush(tx)).is_ok() {
            let _ = rx.recv().await;
        }
    }

    fn node_is_leaf(&self, path: &TopicPath) -> Option<bool> {
        let root = self.inner.root.read().unwrap();
        root.get(path.segments()).map(Node::is_topic)
    }

    fn log_record(&self, record: LogRecord) -> Result<()> {
        if let Some(log) = self.inner.log.lock().unwrap().as_mut() {
            log.append(&record)?;
        }
        Ok(())
    }

    fn enqueue(&self, notification: Notification) {
        let _ = self
            .inner
            .queue_tx
            .try_send(QueueItem::Event(notification));
    }

    fn enqueue_all(&self, notifications: Vec<Notification>) {
        for notification in notifications {
            self.enqueue(notification);
        }
    }
}

enum WriteEffect {
    /// Value stored; notify and log
    Applied,
    /// Stale timestamp; dropped silently
    Discarded,
    /// Same value; timestamp absorbed, no notification
    Absorbed,
}

fn write_at(
    root: &mut Node,
    path: &TopicPath,
    value: &Value,
    ts: u64,
    pending: &mut Vec<Notification>,
) -> Result<WriteEffect> {
    let segments = path.segments();
    let mut node = root;
    let mut node_path = TopicPath::root();

    // Create missing interior nodes along the write path.
    for segment in &segments[..segments.len() - 1] {
        let child_path = node_path.child(segment.clone());
        node = match node {
            Node::Topics {
                children,
                modified_at,
            } => {
                if !children.contains_key(segment) {
                    children.insert(segment.clone(), Node::topics(ts));
                    *modified_at = ts;
                    pending.push(Notification {
                        target: node_path.clone(),
                        only: None,
                        event: WatchEvent {
                            path: child_path.clone(),
                            kind: WatchEventKind::ChildAdded,
                            value: Some(Value::Object(Default::default())),
                        },
                    });
                }
                children.get_mut(segment).unwrap()
            }
            Node::Topic { .. } => {
                return Err(Error::NodeKindConflict {
                    path: node_path.to_string(),
                })
            }
        };
        node_path = child_path;
    }

    let name = &segments[segments.len() - 1];
    let (children, parent_modified) = match node {
        Node::Topics {
            children,
            modified_at,
        } => (children, modified_at),
        Node::Topic { .. } => {
            return Err(Error::NodeKindConflict {
                path: node_path.to_string(),
            })
        }
    };

    match children.get_mut(name) {
        Some(Node::Topic {
            value: existing,
            modified_at,
        }) => {
            if ts < *modified_at {
                debug!("discarding stale write to {} (ts {} < {})", path, ts, modified_at);
                return Ok(WriteEffect::Discarded);
            }
            if existing == value {
                *modified_at = ts;
                return Ok(WriteEffect::Absorbed);
            }
            *existing = value.clone();
            *modified_at = ts;
            pending.push(Notification {
                target: path.clone(),
                only: None,
                event: WatchEvent {
                    path: path.clone(),
                    kind: WatchEventKind::Changed,
                    value: Some(value.clone()),
                },
            });
            Ok(WriteEffect::Applied)
        }
        Some(Node::Topics { .. }) => Err(Error::NodeKindConflict {
            path: path.to_string(),
        }),
        None => {
            children.insert(name.clone(), Node::topic(value.clone(), ts));
            *parent_modified = ts;
            pending.push(Notification {
                target: node_path,
                only: None,
                event: WatchEvent {
                    path: path.clone(),
                    kind: WatchEventKind::ChildAdded,
                    value: Some(value.clone()),
                },
            });
            pending.push(Notification {
                target: path.clone(),
                only: None,
                event: WatchEvent {
                    path: path.clone(),
                    kind: WatchEventKind::Changed,
                    value: Some(value.clone()),
                },
            });
            Ok(WriteEffect::Applied)
        }
    }
}

/// Create the interior chain down to `path`, reporting whether anything new
/// appeared
fn ensure_at(
    root: &mut Node,
    path: &TopicPath,
    ts: u64,
    pending: &mut Vec<Notification>,
) -> Result<bool> {
    let mut node = root;
    let mut node_path = TopicPath::root();
    let mut created_any = false;

    for segment in path.segments() {
        let child_path = node_path.child(segment.clone());
        node = match node {
            Node::Topics {
                children,
                modified_at,
            } => {
                if !children.contains_key(segment) {
                    children.insert(segment.clone(), Node::topics(ts));
                    *modified_at = ts;
                    created_any = true;
                    pending.push(Notification {
                        target: node_path.clone(),
                        only: None,
                        event: WatchEvent {
                            path: child_path.clone(),
                            kind: WatchEventKind::ChildAdded,
                            value: Some(Value::Object(Default::default())),
                        },
                    });
                }
                children.get_mut(segment).unwrap()
            }
            Node::Topic { .. } => {
                return Err(Error::NodeKindConflict {
                    path: node_path.to_string(),
                })
            }
        };
        node_path = child_path;
    }
    Ok(created_any)
}

fn remove_at(
    root: &mut Node,
    path: &TopicPath,
    ts: u64,
    pending: &mut Vec<Notification>,
) -> bool {
    let Some(parent_path) = path.parent() else {
        return false;
    };
    let Some(name) = path.name() else {
        return false;
    };

    let parent = match root_get_mut(root, parent_path.segments()) {
        Some(node) => node,
        None => return false,
    };

    let (children, modified_at) = match parent {
        Node::Topics {
            children,
            modified_at,
        } => (children, modified_at),
        Node::Topic { .. } => return false,
    };

    let Some(removed) = children.remove(name) else {
        return false;
    };
    *modified_at = ts;

    // Removed events for the subtree, children before parents.
    let mut removed_paths = Vec::new();
    collect_paths(&removed, path, &mut removed_paths);
    for removed_path in removed_paths {
        pending.push(Notification {
            target: removed_path.clone(),
            only: None,
            event: WatchEvent {
                path: removed_path,
                kind: WatchEventKind::Removed,
                value: None,
            },
        });
    }
    pending.push(Notification {
        target: parent_path,
        only: None,
        event: WatchEvent {
            path: path.clone(),
            kind: WatchEventKind::ChildRemoved,
            value: None,
        },
    });
    true
}

fn root_get_mut<'a>(root: &'a mut Node, segments: &[String]) -> Option<&'a mut Node> {
    let mut node = root;
    for segment in segments {
        node = match node {
            Node::Topics { children, .. } => children.get_mut(segment)?,
            Node::Topic { .. } => return None,
        };
    }
    Some(node)
}

fn collect_paths(node: &Node, path: &TopicPath, out: &mut Vec<TopicPath>) {
    if let Node::Topics { children, .. } = node {
        for (name, child) in children {
            collect_paths(child, &path.child(name.clone()), out);
        }
    }
    out.push(path.clone());
}

async fn pump(rx: async_channel::Receiver<QueueItem>, inner: Weak<TreeInner>) {
    while let Ok(item) = rx.recv().await {
        match item {
            QueueItem::Flush(done) => {
                let _ = done.send(()).await;
            }
            QueueItem::Event(notification) => {
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                let handlers: Vec<WatchHandler> = {
                    let watchers = inner.watchers.lock().unwrap();
                    watchers
                        .iter()
                        .filter(|w| {
                            w.path == notification.target
                                && notification.only.map_or(true, |id| id == w.id)
                        })
                        .map(|w| w.handler.clone())
                        .collect()
                };
                for handler in handlers {
                    let event = &notification.event;
                    if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                        warn!("watch handler panicked for {}", notification.target);
                    }
                }
            }
        }
    }
}
